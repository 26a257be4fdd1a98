//! Record types persisted by the metadata plane, and the replicated
//! operation type of the oplog
use serde::{Deserialize, Serialize};

use silo_rpc::control::{
	self, BlockRecord, DirRecord, FileRecord, FileStatus, LocationRecord, NodeStatus, NodeSummary,
};
use silo_rpc::NodeAddr;
use silo_util::data::*;
use silo_util::error::{Error, OkOrMessage};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
	pub id: Uuid,
	pub path: String,
	pub owner: String,
	/// Declared total size; equals the sum of the block sizes once the
	/// file is complete
	pub size: u64,
	pub status: FileStatus,
	pub created_msec: u64,
	pub modified_msec: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirEntry {
	pub path: String,
	pub owner: String,
	pub created_msec: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockInfo {
	pub id: Uuid,
	pub file_id: Uuid,
	/// Position of the block in the file's block sequence
	pub seq: u32,
	pub size: u64,
	pub checksum: Checksum,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockLocation {
	pub block_id: Uuid,
	pub node_id: Uuid,
	/// The first storage node that accepted the block from a client.
	/// At most one location of a block has this set.
	pub is_leader: bool,
	/// Set when the holding node went INACTIVE; the replica is not
	/// counted as healthy but not yet proven lost
	pub suspect: bool,
	pub added_msec: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
	pub id: Uuid,
	pub hostname: String,
	pub rpc_port: u16,
	pub storage_capacity: u64,
	pub available_space: u64,
	pub status: NodeStatus,
	pub last_heartbeat_msec: u64,
	pub blocks_stored: u64,
}

/// A replicated mutation of the metadata state. The leader appends these
/// to its oplog in the same transaction that applies them; the follower
/// replays them in sequence order. Applying an op never requires
/// iterating over the record store: compound operations (recursive
/// deletes, sweeps) are expanded into batches of granular ops by the
/// leader before logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MetaOp {
	MkDir(DirEntry),
	RmDir { path: String },
	PutFile(FileEntry),
	DeleteFile { file_id: Uuid, path: String },
	RegisterBlock(BlockInfo),
	DeleteBlock { block_id: Uuid, file_id: Uuid, seq: u32 },
	AddLocation(BlockLocation),
	RemoveLocation { block_id: Uuid, node_id: Uuid },
	SetLocationSuspect { block_id: Uuid, node_id: Uuid, suspect: bool },
	PutNode(NodeRecord),
}

// ---- conversions to control-plane records ----

impl NodeRecord {
	/// Resolve this node's data-plane address
	pub fn node_addr(&self) -> Result<NodeAddr, Error> {
		use std::net::ToSocketAddrs;
		let addr = (self.hostname.as_str(), self.rpc_port)
			.to_socket_addrs()?
			.next()
			.ok_or_message(format!(
				"Could not resolve storage node address {}:{}",
				self.hostname, self.rpc_port
			))?;
		Ok(NodeAddr::new(self.id, addr))
	}

	pub fn summary(&self) -> NodeSummary {
		NodeSummary {
			id: control::hex_uuid(&self.id),
			hostname: self.hostname.clone(),
			rpc_port: self.rpc_port,
			storage_capacity: self.storage_capacity,
			available_space: self.available_space,
			status: self.status,
			last_heartbeat_msec: self.last_heartbeat_msec,
			blocks_stored: self.blocks_stored,
		}
	}
}

impl DirEntry {
	pub fn record(&self) -> DirRecord {
		DirRecord {
			path: self.path.clone(),
			owner: self.owner.clone(),
			created_msec: self.created_msec,
		}
	}
}

impl FileEntry {
	pub fn record(&self, blocks: &[BlockInfo]) -> FileRecord {
		FileRecord {
			id: control::hex_uuid(&self.id),
			path: self.path.clone(),
			owner: self.owner.clone(),
			size: self.size,
			status: self.status,
			created_msec: self.created_msec,
			modified_msec: self.modified_msec,
			blocks: blocks.iter().map(|b| control::hex_uuid(&b.id)).collect(),
		}
	}
}

impl BlockInfo {
	pub fn record(&self, locations: Vec<LocationRecord>) -> BlockRecord {
		BlockRecord {
			id: control::hex_uuid(&self.id),
			file_id: control::hex_uuid(&self.file_id),
			seq: self.seq,
			size: self.size,
			checksum: control::hex_checksum(&self.checksum),
			locations,
		}
	}
}
