//! Crate serving the metadata control plane over HTTP+JSON
#[macro_use]
extern crate tracing;

pub mod api_server;
pub mod error;

pub use api_server::ApiServer;
