//! Crate containing RPC plumbing shared by all Silo services: netapp
//! re-exports, node key management, deadline-bound calls with quorums,
//! and the HTTP client for the metadata control plane.

#[macro_use]
extern crate tracing;

pub mod control;
pub mod netkey;
pub mod rpc_helper;

pub use rpc_helper::*;

pub use netapp::endpoint::{Endpoint, EndpointHandler, StreamingEndpointHandler};
pub use netapp::message::{Message as Rpc, RequestPriority, PRIO_BACKGROUND, PRIO_HIGH, PRIO_NORMAL};
pub use netapp::util::{parse_and_resolve_peer_addr, parse_and_resolve_peer_addr_async};
pub use netapp::{self, NetApp, NetworkKey, NodeID, NodeKey};
