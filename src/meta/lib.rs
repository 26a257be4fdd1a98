//! Crate containing the metadata plane of Silo: the authoritative
//! namespace, block placement, replication coordination, and the
//! leader/follower high-availability controller

#[macro_use]
extern crate tracing;

pub mod error;
pub mod ha;
pub mod monitor;
pub mod node;
pub mod path;
pub mod placement;
pub mod repair;
pub mod schema;
pub mod store;
pub mod sync;
