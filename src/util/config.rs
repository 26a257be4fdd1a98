//! Contains type and functions related to Silo configuration file
use std::io::Read;
use std::net::SocketAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Role a Silo daemon assumes in the cluster
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
	/// Namespace authority: directory tree, file and block records,
	/// storage node registry
	Metadata,
	/// Block holder: stores and serves opaque data blocks
	Storage,
}

/// Represent the whole configuration
#[derive(Deserialize, Debug, Clone)]
pub struct Config {
	/// Role of this daemon (metadata or storage)
	pub role: NodeRole,

	/// Path where to store metadata. Should be fast, but low volume
	pub metadata_dir: PathBuf,
	/// Path where to store data blocks. Can be slower, but need higher volume
	pub data_dir: PathBuf,

	/// Size of data blocks files are cut into
	#[serde(default = "default_block_size")]
	pub block_size: usize,

	/// Minimum number of distinct storage nodes that must hold each block
	#[serde(default = "default_replication_factor")]
	pub replication_factor: usize,

	/// RPC secret key: 32 bytes hex encoded
	pub rpc_secret: String,

	/// Address to bind for RPC
	pub rpc_bind_addr: SocketAddr,
	/// Public IP address of this node
	pub rpc_public_addr: Option<String>,

	/// Address to bind for the metadata HTTP API (metadata role only)
	#[serde(default)]
	pub api_bind_addr: Option<SocketAddr>,

	/// Control-plane endpoints of the metadata nodes, tried in order by
	/// storage nodes and clients
	#[serde(default)]
	pub metadata_addrs: Vec<String>,

	/// The other metadata node, in `<pubkey>@<host>:<port>` format
	/// (metadata role only; absent for single-node deployments)
	#[serde(default)]
	pub peer_endpoint: Option<String>,

	/// Control-plane URL of the metadata peer, used by a follower to
	/// redirect mutations to the leader
	#[serde(default)]
	pub peer_api_addr: Option<String>,

	/// Interval in seconds between two storage node heartbeats
	#[serde(default = "default_heartbeat_interval")]
	pub heartbeat_interval: u64,
	/// Number of missed heartbeats after which a node is inactive
	#[serde(default = "default_heartbeat_miss_threshold")]
	pub heartbeat_miss_threshold: u64,

	/// Lower bound of the randomized election timeout, in milliseconds
	#[serde(default = "default_election_timeout_min")]
	pub election_timeout_min_msec: u64,
	/// Upper bound of the randomized election timeout, in milliseconds
	#[serde(default = "default_election_timeout_max")]
	pub election_timeout_max_msec: u64,
	/// Interval between two leader pings, in milliseconds
	#[serde(default = "default_leader_heartbeat_interval")]
	pub leader_heartbeat_interval_msec: u64,

	/// Cap on the size of a single RPC message; block transfers are
	/// chunked below this size
	#[serde(default = "default_rpc_max_message_bytes")]
	pub rpc_max_message_bytes: usize,

	/// Number of concurrent block transfers in a client upload/download
	#[serde(default = "default_worker_pool_size")]
	pub worker_pool_size: usize,

	/// Zstd compression level used on the wire for block payloads.
	/// Omit to disable wire compression.
	#[serde(default)]
	pub compression_level: Option<i32>,

	/// Sled cache size, in bytes
	#[serde(default = "default_sled_cache_capacity")]
	pub sled_cache_capacity: u64,
	/// Sled flush interval in milliseconds
	#[serde(default = "default_sled_flush_every_ms")]
	pub sled_flush_every_ms: u64,
}

fn default_block_size() -> usize {
	1048576
}
fn default_replication_factor() -> usize {
	2
}
fn default_heartbeat_interval() -> u64 {
	5
}
fn default_heartbeat_miss_threshold() -> u64 {
	3
}
fn default_election_timeout_min() -> u64 {
	1000
}
fn default_election_timeout_max() -> u64 {
	2000
}
fn default_leader_heartbeat_interval() -> u64 {
	300
}
fn default_rpc_max_message_bytes() -> usize {
	8 * 1024 * 1024
}
fn default_worker_pool_size() -> usize {
	4
}
fn default_sled_cache_capacity() -> u64 {
	128 * 1024 * 1024
}
fn default_sled_flush_every_ms() -> u64 {
	2000
}

impl Config {
	/// Check invariants between configuration values that serde cannot
	/// express
	pub fn validate(&self) -> Result<(), Error> {
		if self.block_size == 0 {
			return Err(Error::Message("block_size must be non-zero".into()));
		}
		if self.replication_factor < 1 {
			return Err(Error::Message(
				"replication_factor must be at least 1".into(),
			));
		}
		if self.election_timeout_min_msec == 0
			|| self.election_timeout_max_msec < self.election_timeout_min_msec
		{
			return Err(Error::Message(
				"election timeout bounds must satisfy 0 < min <= max".into(),
			));
		}
		if self.role == NodeRole::Metadata && self.api_bind_addr.is_none() {
			return Err(Error::Message(
				"api_bind_addr is required for the metadata role".into(),
			));
		}
		if self.role == NodeRole::Storage && self.metadata_addrs.is_empty() {
			return Err(Error::Message(
				"metadata_addrs is required for the storage role".into(),
			));
		}
		Ok(())
	}
}

/// Read and parse configuration
pub fn read_config(config_file: PathBuf) -> Result<Config, Error> {
	let mut file = std::fs::OpenOptions::new()
		.read(true)
		.open(config_file.as_path())?;

	let mut config = String::new();
	file.read_to_string(&mut config)?;

	let config: Config = toml::from_str(&config)?;
	config.validate()?;
	Ok(config)
}

#[cfg(test)]
mod tests {
	use super::*;

	const METADATA_CONFIG: &str = r#"
		role = "metadata"
		metadata_dir = "/tmp/silo/meta"
		data_dir = "/tmp/silo/data"
		rpc_secret = "3e9abff5f9e480afbadb8a21f41e535956f4a08b07b07e5d171151e108f3835f"
		rpc_bind_addr = "127.0.0.1:3901"
		api_bind_addr = "127.0.0.1:3903"
		block_size = 4096
	"#;

	#[test]
	fn test_read_metadata_config() {
		let config: Config = toml::from_str(METADATA_CONFIG).unwrap();
		config.validate().unwrap();
		assert_eq!(config.role, NodeRole::Metadata);
		assert_eq!(config.block_size, 4096);
		assert_eq!(config.replication_factor, 2);
		assert_eq!(config.heartbeat_interval, 5);
		assert!(config.peer_endpoint.is_none());
	}

	#[test]
	fn test_storage_requires_metadata_addrs() {
		let raw = METADATA_CONFIG.replace("\"metadata\"", "\"storage\"");
		let config: Config = toml::from_str(&raw).unwrap();
		assert!(config.validate().is_err());
	}
}
