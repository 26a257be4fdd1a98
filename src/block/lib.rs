//! Crate containing the storage node side of Silo: local block
//! persistence, the data-plane RPC service, and the heartbeat agent

#[macro_use]
extern crate tracing;

pub mod agent;
pub mod data;
pub mod manager;
pub mod metrics;
pub mod store;
