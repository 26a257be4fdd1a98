//! The authoritative metadata store: directory tree, file and block
//! records, block locations and the storage node registry, all held in
//! the transactional record store.
//!
//! Every mutation is expressed as a batch of granular [`MetaOp`]s applied
//! in a single transaction. On the leader the same transaction appends
//! the ops to the oplog, from which they are pushed to the follower and
//! replayed there through the same code path.
use std::collections::HashMap;
use std::convert::TryInto;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Notify;

use silo_db as db;
use silo_db::TxError;

use silo_rpc::control::{self, FileStatus, ListEntry, NodeStatus};
use silo_util::data::*;
use silo_util::time::*;

use crate::error::MetaError;
use crate::path;
use crate::schema::*;

const OPLOG_HEAD_KEY: &[u8] = b"oplog_head";
const APPLIED_SEQ_KEY: &[u8] = b"applied_seq";

/// Outcome of a heartbeat as seen by the metadata plane
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
	Ok,
	/// The node is not in the registry; it must register again
	UnknownNode,
}

pub struct MetadataStore {
	db: db::Db,

	files: db::Tree,
	files_by_path: db::Tree,
	directories: db::Tree,
	blocks: db::Tree,
	file_blocks: db::Tree,
	block_locations: db::Tree,
	datanodes: db::Tree,

	oplog: db::Tree,
	sync_state: db::Tree,

	/// Woken whenever new entries are appended to the oplog
	pub oplog_notify: Notify,
}

fn enc<T: Serialize>(v: &T) -> Result<Vec<u8>, MetaError> {
	rmp_to_vec_all_named(v).map_err(|e| MetaError::Internal(e.into()))
}

fn enc_tx<T: Serialize>(v: &T) -> db::TxResult<Vec<u8>, MetaError> {
	rmp_to_vec_all_named(v).map_err(|e| TxError::Abort(MetaError::Internal(e.into())))
}

fn dec<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, MetaError> {
	rmp_decode(bytes).map_err(|e| MetaError::Internal(e.into()))
}

fn uuid_of(bytes: &[u8]) -> Result<Uuid, MetaError> {
	bytes
		.try_into()
		.map_err(|_| MetaError::Internal("Invalid identifier in record store".into()))
}

fn location_key(block_id: &Uuid, node_id: &Uuid) -> Vec<u8> {
	let mut key = block_id.as_slice().to_vec();
	key.extend(node_id.as_slice());
	key
}

fn file_block_key(file_id: &Uuid, seq: u32) -> Vec<u8> {
	let mut key = file_id.as_slice().to_vec();
	key.extend(&u32::to_be_bytes(seq)[..]);
	key
}

impl MetadataStore {
	pub fn new(db: db::Db) -> Result<Arc<Self>, MetaError> {
		let store = Self {
			files: db.open_tree("files")?,
			files_by_path: db.open_tree("files_by_path")?,
			directories: db.open_tree("directories")?,
			blocks: db.open_tree("blocks")?,
			file_blocks: db.open_tree("file_blocks")?,
			block_locations: db.open_tree("block_locations")?,
			datanodes: db.open_tree("datanodes")?,
			oplog: db.open_tree("oplog")?,
			sync_state: db.open_tree("sync_state")?,
			db,
			oplog_notify: Notify::new(),
		};
		store.ensure_root()?;
		Ok(Arc::new(store))
	}

	// The root directory always exists; it is seeded locally on both
	// metadata nodes and never replicated.
	fn ensure_root(&self) -> Result<(), MetaError> {
		if self.directories.get(b"/")?.is_none() {
			let root = DirEntry {
				path: "/".to_string(),
				owner: "root".to_string(),
				created_msec: now_msec(),
			};
			self.directories.insert(b"/", enc(&root)?)?;
		}
		Ok(())
	}

	// ---- op application ----

	fn apply_op_tx(&self, tx: &mut db::Transaction, op: &MetaOp) -> db::TxResult<(), MetaError> {
		match op {
			MetaOp::MkDir(d) => {
				if tx.get(&self.directories, d.path.as_bytes())?.is_some()
					|| tx.get(&self.files_by_path, d.path.as_bytes())?.is_some()
				{
					return Err(TxError::Abort(MetaError::AlreadyExists(d.path.clone())));
				}
				if let Some(parent) = path::parent(&d.path) {
					if tx.get(&self.directories, parent.as_bytes())?.is_none() {
						return Err(TxError::Abort(MetaError::ParentMissing(parent)));
					}
				}
				tx.insert(&self.directories, d.path.as_bytes(), enc_tx(d)?)?;
			}
			MetaOp::RmDir { path } => {
				tx.remove(&self.directories, path.as_bytes())?;
			}
			MetaOp::PutFile(f) => {
				if let Some(other) = tx.get(&self.files_by_path, f.path.as_bytes())? {
					if other[..] != f.id.as_slice()[..] {
						return Err(TxError::Abort(MetaError::AlreadyExists(f.path.clone())));
					}
				} else {
					// New path: the parent must exist, and must not be
					// shadowed by a directory of the same name
					if tx.get(&self.directories, f.path.as_bytes())?.is_some() {
						return Err(TxError::Abort(MetaError::AlreadyExists(f.path.clone())));
					}
					if let Some(parent) = path::parent(&f.path) {
						if tx.get(&self.directories, parent.as_bytes())?.is_none() {
							return Err(TxError::Abort(MetaError::ParentMissing(parent)));
						}
					}
				}
				tx.insert(&self.files, f.id.as_slice(), enc_tx(f)?)?;
				tx.insert(&self.files_by_path, f.path.as_bytes(), f.id.as_slice())?;
			}
			MetaOp::DeleteFile { file_id, path } => {
				tx.remove(&self.files, file_id.as_slice())?;
				if let Some(mapped) = tx.get(&self.files_by_path, path.as_bytes())? {
					if mapped[..] == file_id.as_slice()[..] {
						tx.remove(&self.files_by_path, path.as_bytes())?;
					}
				}
			}
			MetaOp::RegisterBlock(b) => {
				if tx.get(&self.files, b.file_id.as_slice())?.is_none() {
					return Err(TxError::Abort(MetaError::NotFound(format!(
						"file {}",
						control::hex_uuid(&b.file_id)
					))));
				}
				let seq_key = file_block_key(&b.file_id, b.seq);
				if let Some(existing) = tx.get(&self.file_blocks, &seq_key)? {
					if existing[..] != b.id.as_slice()[..] {
						return Err(TxError::Abort(MetaError::Conflict(format!(
							"file {} already has a block at position {}",
							control::hex_uuid(&b.file_id),
							b.seq
						))));
					}
				}
				tx.insert(&self.blocks, b.id.as_slice(), enc_tx(b)?)?;
				tx.insert(&self.file_blocks, seq_key, b.id.as_slice())?;
			}
			MetaOp::DeleteBlock {
				block_id,
				file_id,
				seq,
			} => {
				tx.remove(&self.blocks, block_id.as_slice())?;
				tx.remove(&self.file_blocks, file_block_key(file_id, *seq))?;
			}
			MetaOp::AddLocation(l) => {
				tx.insert(
					&self.block_locations,
					location_key(&l.block_id, &l.node_id),
					enc_tx(l)?,
				)?;
			}
			MetaOp::RemoveLocation { block_id, node_id } => {
				tx.remove(&self.block_locations, location_key(block_id, node_id))?;
			}
			MetaOp::SetLocationSuspect {
				block_id,
				node_id,
				suspect,
			} => {
				let key = location_key(block_id, node_id);
				if let Some(raw) = tx.get(&self.block_locations, &key)? {
					let mut loc: BlockLocation = rmp_decode(&raw)
						.map_err(|e| TxError::Abort(MetaError::Internal(e.into())))?;
					loc.suspect = *suspect;
					tx.insert(&self.block_locations, key, enc_tx(&loc)?)?;
				}
			}
			MetaOp::PutNode(n) => {
				tx.insert(&self.datanodes, n.id.as_slice(), enc_tx(n)?)?;
			}
		}
		Ok(())
	}

	/// Apply a batch of ops atomically. With `log`, the ops are appended
	/// to the oplog in the same transaction, to be pushed to the
	/// follower.
	pub fn mutate_batch(&self, ops: &[MetaOp], log: bool) -> Result<(), MetaError> {
		let res: db::TxResult<(), MetaError> = self.db.transaction(|mut tx| {
			for op in ops {
				self.apply_op_tx(&mut tx, op)?;
			}
			if log {
				let mut head = match tx.get(&self.sync_state, OPLOG_HEAD_KEY)? {
					Some(v) => u64::from_be_bytes(v[0..8].try_into().unwrap()),
					None => 0,
				};
				for op in ops {
					head += 1;
					tx.insert(&self.oplog, &u64::to_be_bytes(head)[..], enc_tx(op)?)?;
				}
				tx.insert(&self.sync_state, OPLOG_HEAD_KEY, &u64::to_be_bytes(head)[..])?;
			}
			tx.commit(())
		});
		match res {
			Ok(()) => {
				if log {
					self.oplog_notify.notify_waiters();
				}
				Ok(())
			}
			Err(e) => Err(e.into()),
		}
	}

	pub fn mutate(&self, op: MetaOp, log: bool) -> Result<(), MetaError> {
		self.mutate_batch(std::slice::from_ref(&op), log)
	}

	// ---- namespace reads ----

	pub fn get_dir(&self, path: &str) -> Result<Option<DirEntry>, MetaError> {
		match self.directories.get(path.as_bytes())? {
			Some(raw) => Ok(Some(dec(&raw)?)),
			None => Ok(None),
		}
	}

	pub fn get_file(&self, id: &Uuid) -> Result<Option<FileEntry>, MetaError> {
		match self.files.get(id.as_slice())? {
			Some(raw) => Ok(Some(dec(&raw)?)),
			None => Ok(None),
		}
	}

	pub fn get_file_by_path(&self, path: &str) -> Result<Option<FileEntry>, MetaError> {
		let canonical = path::canonicalize(path)?;
		match self.files_by_path.get(canonical.as_bytes())? {
			Some(id) => self.get_file(&uuid_of(&id)?),
			None => Ok(None),
		}
	}

	/// All directories strictly below `dir`, any depth
	fn dirs_under(&self, dir: &str) -> Result<Vec<DirEntry>, MetaError> {
		let (low, high) = path::subtree_range(dir);
		let mut out = vec![];
		for item in self.directories.range(low..high)? {
			let (_, v) = item?;
			out.push(dec(&v)?);
		}
		Ok(out)
	}

	/// All files strictly below `dir`, any depth
	fn files_under(&self, dir: &str) -> Result<Vec<FileEntry>, MetaError> {
		let (low, high) = path::subtree_range(dir);
		let mut out = vec![];
		for item in self.files_by_path.range(low..high)? {
			let (_, id) = item?;
			if let Some(f) = self.get_file(&uuid_of(&id)?)? {
				out.push(f);
			}
		}
		Ok(out)
	}

	/// Immediate children of a directory, unordered
	pub fn list_dir(&self, dir_path: &str) -> Result<(DirEntry, Vec<ListEntry>), MetaError> {
		let canonical = path::canonicalize(dir_path)?;
		let dir = self
			.get_dir(&canonical)?
			.ok_or_else(|| MetaError::NotFound(canonical.clone()))?;

		let mut entries = vec![];
		for d in self.dirs_under(&canonical)? {
			if path::is_direct_child(&canonical, &d.path) {
				entries.push(ListEntry {
					name: path::basename(&d.path).to_string(),
					kind: control::EntryKind::Directory,
					size: None,
					id: None,
				});
			}
		}
		for f in self.files_under(&canonical)? {
			if path::is_direct_child(&canonical, &f.path) {
				entries.push(ListEntry {
					name: path::basename(&f.path).to_string(),
					kind: control::EntryKind::File,
					size: Some(f.size),
					id: Some(control::hex_uuid(&f.id)),
				});
			}
		}
		Ok((dir, entries))
	}

	// ---- namespace mutations (leader side) ----

	pub fn mkdir(&self, dir_path: &str, owner: &str) -> Result<DirEntry, MetaError> {
		let canonical = path::canonicalize(dir_path)?;
		if canonical == "/" {
			return Err(MetaError::AlreadyExists("/".to_string()));
		}
		let d = DirEntry {
			path: canonical,
			owner: owner.to_string(),
			created_msec: now_msec(),
		};
		self.mutate(MetaOp::MkDir(d.clone()), true)?;
		Ok(d)
	}

	/// Remove a directory. With `recursive`, every file and directory
	/// below it goes too. Returns the block records (with locations)
	/// whose physical replicas should now be deleted, best-effort, on
	/// the storage nodes.
	pub fn rmdir(
		&self,
		dir_path: &str,
		recursive: bool,
	) -> Result<Vec<(BlockInfo, Vec<BlockLocation>)>, MetaError> {
		let canonical = path::canonicalize(dir_path)?;
		if canonical == "/" {
			return Err(MetaError::InvariantViolation(
				"the root directory cannot be removed".to_string(),
			));
		}
		self.get_dir(&canonical)?
			.ok_or_else(|| MetaError::NotFound(canonical.clone()))?;

		let mut sub_dirs = self.dirs_under(&canonical)?;
		let sub_files = self.files_under(&canonical)?;

		if !recursive && (!sub_dirs.is_empty() || !sub_files.is_empty()) {
			return Err(MetaError::NotEmpty(canonical));
		}

		let mut ops = vec![];
		let mut doomed = vec![];
		for f in sub_files.iter() {
			let (file_ops, file_doomed) = self.build_delete_file_ops(f)?;
			ops.extend(file_ops);
			doomed.extend(file_doomed);
		}
		// Deepest directories first so every RmDir removes a leaf
		sub_dirs.sort_by_key(|d| std::cmp::Reverse(d.path.len()));
		for d in sub_dirs {
			ops.push(MetaOp::RmDir { path: d.path });
		}
		ops.push(MetaOp::RmDir { path: canonical });

		self.mutate_batch(&ops, true)?;
		Ok(doomed)
	}

	pub fn create_file(&self, file_path: &str, owner: &str, size: u64) -> Result<FileEntry, MetaError> {
		let canonical = path::canonicalize(file_path)?;
		if canonical == "/" {
			return Err(MetaError::InvalidPath("/ is a directory".to_string()));
		}
		let now = now_msec();
		let f = FileEntry {
			id: gen_uuid(),
			path: canonical,
			owner: owner.to_string(),
			size,
			status: FileStatus::Uploading,
			created_msec: now,
			modified_msec: now,
		};
		self.mutate(MetaOp::PutFile(f.clone()), true)?;
		Ok(f)
	}

	/// Mark a file complete, enforcing that its registered blocks form a
	/// contiguous sequence whose sizes sum to the declared size
	pub fn finalize_file(&self, id: &Uuid) -> Result<FileEntry, MetaError> {
		let mut f = self
			.get_file(id)?
			.ok_or_else(|| MetaError::NotFound(format!("file {}", control::hex_uuid(id))))?;
		let blocks = self.list_blocks_of_file(id)?;
		for (i, b) in blocks.iter().enumerate() {
			if b.seq as usize != i {
				return Err(MetaError::InvariantViolation(format!(
					"file {} has a hole in its block sequence at position {}",
					control::hex_uuid(id),
					i
				)));
			}
		}
		let total: u64 = blocks.iter().map(|b| b.size).sum();
		if total != f.size {
			return Err(MetaError::InvariantViolation(format!(
				"sum of block sizes ({}) differs from the declared file size ({})",
				total, f.size
			)));
		}
		f.status = FileStatus::Complete;
		f.modified_msec = now_msec();
		self.mutate(MetaOp::PutFile(f.clone()), true)?;
		Ok(f)
	}

	fn build_delete_file_ops(
		&self,
		f: &FileEntry,
	) -> Result<(Vec<MetaOp>, Vec<(BlockInfo, Vec<BlockLocation>)>), MetaError> {
		let mut ops = vec![];
		let mut doomed = vec![];
		for b in self.list_blocks_of_file(&f.id)? {
			let locs = self.locations_of_block(&b.id)?;
			for l in locs.iter() {
				ops.push(MetaOp::RemoveLocation {
					block_id: b.id,
					node_id: l.node_id,
				});
			}
			ops.push(MetaOp::DeleteBlock {
				block_id: b.id,
				file_id: f.id,
				seq: b.seq,
			});
			doomed.push((b, locs));
		}
		ops.push(MetaOp::DeleteFile {
			file_id: f.id,
			path: f.path.clone(),
		});
		Ok((ops, doomed))
	}

	/// Delete a file and all its block records. Returns the blocks whose
	/// replicas should be physically deleted, best-effort.
	pub fn delete_file(
		&self,
		id: &Uuid,
	) -> Result<(FileEntry, Vec<(BlockInfo, Vec<BlockLocation>)>), MetaError> {
		let f = self
			.get_file(id)?
			.ok_or_else(|| MetaError::NotFound(format!("file {}", control::hex_uuid(id))))?;
		let (ops, doomed) = self.build_delete_file_ops(&f)?;
		self.mutate_batch(&ops, true)?;
		Ok((f, doomed))
	}

	// ---- blocks ----

	pub fn get_block(&self, id: &Uuid) -> Result<Option<BlockInfo>, MetaError> {
		match self.blocks.get(id.as_slice())? {
			Some(raw) => Ok(Some(dec(&raw)?)),
			None => Ok(None),
		}
	}

	pub fn register_block(&self, info: BlockInfo) -> Result<(), MetaError> {
		if let Some(existing) = self.get_block(&info.id)? {
			if existing.file_id == info.file_id
				&& existing.seq == info.seq
				&& existing.size == info.size
				&& existing.checksum == info.checksum
			{
				// duplicate registration is a no-op
				return Ok(());
			}
			return Err(MetaError::AlreadyExists(format!(
				"block {}",
				control::hex_uuid(&info.id)
			)));
		}
		self.mutate(MetaOp::RegisterBlock(info), true)
	}

	/// Ordered list of the blocks of a file
	pub fn list_blocks_of_file(&self, file_id: &Uuid) -> Result<Vec<BlockInfo>, MetaError> {
		let mut low = file_id.as_slice().to_vec();
		let mut high = file_id.as_slice().to_vec();
		low.extend(&u32::to_be_bytes(0)[..]);
		high.extend(&u32::to_be_bytes(u32::MAX)[..]);
		let mut out = vec![];
		for item in self.file_blocks.range(low..=high)? {
			let (_, id) = item?;
			if let Some(b) = self.get_block(&uuid_of(&id)?)? {
				out.push(b);
			}
		}
		Ok(out)
	}

	pub fn locations_of_block(&self, block_id: &Uuid) -> Result<Vec<BlockLocation>, MetaError> {
		let low = block_id.as_slice().to_vec();
		let mut high = block_id.as_slice().to_vec();
		high.extend([0xffu8; 32]);
		let mut out = vec![];
		for item in self.block_locations.range(low..=high)? {
			let (k, v) = item?;
			if k.len() == 64 && k[0..32] == block_id.as_slice()[..] {
				out.push(dec(&v)?);
			}
		}
		Ok(out)
	}

	pub fn locations_of_node(&self, node_id: &Uuid) -> Result<Vec<BlockLocation>, MetaError> {
		let mut out = vec![];
		for item in self.block_locations.iter()? {
			let (_, v) = item?;
			let loc: BlockLocation = dec(&v)?;
			if loc.node_id == *node_id {
				out.push(loc);
			}
		}
		Ok(out)
	}

	pub fn add_location(
		&self,
		block_id: &Uuid,
		node_id: &Uuid,
		is_leader: bool,
	) -> Result<(), MetaError> {
		if self.get_node(node_id)?.is_none() {
			return Err(MetaError::NotFound(format!(
				"storage node {}",
				control::hex_uuid(node_id)
			)));
		}
		if is_leader {
			for l in self.locations_of_block(block_id)? {
				if l.is_leader && l.node_id != *node_id {
					return Err(MetaError::Conflict(format!(
						"block {} already has a leader location",
						control::hex_uuid(block_id)
					)));
				}
			}
		}
		// Note: the block record itself may not be registered yet; the
		// upload protocol reports follower locations before the client
		// registers its blocks. Dangling rows are reconciled by block
		// reports and the orphan sweep.
		let loc = BlockLocation {
			block_id: *block_id,
			node_id: *node_id,
			is_leader,
			suspect: false,
			added_msec: now_msec(),
		};
		self.mutate(MetaOp::AddLocation(loc), true)
	}

	pub fn remove_location(&self, block_id: &Uuid, node_id: &Uuid) -> Result<(), MetaError> {
		self.mutate(
			MetaOp::RemoveLocation {
				block_id: *block_id,
				node_id: *node_id,
			},
			true,
		)
	}

	pub fn count_files(&self) -> usize {
		self.files.len().unwrap_or(0)
	}

	pub fn count_blocks(&self) -> usize {
		self.blocks.len().unwrap_or(0)
	}

	/// Healthy locations of a block: node ACTIVE and not suspect
	pub fn healthy_locations(&self, block_id: &Uuid) -> Result<Vec<BlockLocation>, MetaError> {
		let mut out = vec![];
		for loc in self.locations_of_block(block_id)? {
			if loc.suspect {
				continue;
			}
			if let Some(node) = self.get_node(&loc.node_id)? {
				if node.status == NodeStatus::Active {
					out.push(loc);
				}
			}
		}
		Ok(out)
	}

	/// Scan all block records and return those with fewer than
	/// `replication_factor` healthy locations, with their current count
	pub fn scan_under_replicated(
		&self,
		replication_factor: usize,
	) -> Result<Vec<(Uuid, usize)>, MetaError> {
		let mut out = vec![];
		for item in self.blocks.iter()? {
			let (k, _) = item?;
			let block_id = uuid_of(&k)?;
			let healthy = self.healthy_locations(&block_id)?.len();
			if healthy < replication_factor {
				out.push((block_id, healthy));
			}
		}
		Ok(out)
	}

	// ---- storage node registry ----

	pub fn get_node(&self, id: &Uuid) -> Result<Option<NodeRecord>, MetaError> {
		match self.datanodes.get(id.as_slice())? {
			Some(raw) => Ok(Some(dec(&raw)?)),
			None => Ok(None),
		}
	}

	pub fn list_nodes(&self) -> Result<Vec<NodeRecord>, MetaError> {
		let mut out = vec![];
		for item in self.datanodes.iter()? {
			let (_, v) = item?;
			out.push(dec(&v)?);
		}
		Ok(out)
	}

	pub fn register_datanode(
		&self,
		id: Uuid,
		hostname: String,
		rpc_port: u16,
		storage_capacity: u64,
		available_space: u64,
	) -> Result<NodeRecord, MetaError> {
		let blocks_stored = self
			.get_node(&id)?
			.map(|n| n.blocks_stored)
			.unwrap_or_default();
		let record = NodeRecord {
			id,
			hostname,
			rpc_port,
			storage_capacity,
			available_space,
			status: NodeStatus::Active,
			last_heartbeat_msec: now_msec(),
			blocks_stored,
		};
		self.mutate(MetaOp::PutNode(record.clone()), true)?;
		Ok(record)
	}

	/// Record a heartbeat. Liveness timestamps are volatile and not
	/// replicated; a node coming back from INACTIVE is, since its
	/// suspect locations become trustworthy again.
	pub fn heartbeat(
		&self,
		node_id: &Uuid,
		available_space: u64,
		blocks_stored: u64,
	) -> Result<HeartbeatOutcome, MetaError> {
		let mut n = match self.get_node(node_id)? {
			Some(n) => n,
			None => return Ok(HeartbeatOutcome::UnknownNode),
		};
		n.available_space = available_space;
		n.blocks_stored = blocks_stored;
		n.last_heartbeat_msec = now_msec();

		if n.status == NodeStatus::Inactive {
			info!(
				"Storage node {} is back, clearing its suspect locations",
				control::hex_uuid(node_id)
			);
			n.status = NodeStatus::Active;
			let mut ops = vec![MetaOp::PutNode(n)];
			for loc in self.locations_of_node(node_id)? {
				if loc.suspect {
					ops.push(MetaOp::SetLocationSuspect {
						block_id: loc.block_id,
						node_id: *node_id,
						suspect: false,
					});
				}
			}
			self.mutate_batch(&ops, true)?;
		} else {
			self.mutate(MetaOp::PutNode(n), false)?;
		}
		Ok(HeartbeatOutcome::Ok)
	}

	/// Transition a node to INACTIVE and mark all its locations suspect.
	/// Returns the blocks that lost a healthy replica.
	pub fn mark_node_inactive(&self, node_id: &Uuid) -> Result<Vec<Uuid>, MetaError> {
		let mut n = self
			.get_node(node_id)?
			.ok_or_else(|| MetaError::NotFound(format!("storage node {}", control::hex_uuid(node_id))))?;
		n.status = NodeStatus::Inactive;
		let mut ops = vec![MetaOp::PutNode(n)];
		let mut affected = vec![];
		for loc in self.locations_of_node(node_id)? {
			affected.push(loc.block_id);
			if !loc.suspect {
				ops.push(MetaOp::SetLocationSuspect {
					block_id: loc.block_id,
					node_id: *node_id,
					suspect: true,
				});
			}
		}
		self.mutate_batch(&ops, true)?;
		Ok(affected)
	}

	/// Reconcile a node's full block report against the location
	/// records. Returns the reported blocks unknown to the metadata
	/// plane (garbage collection candidates). Re-issuing an identical
	/// report does not mutate any state.
	pub fn process_block_report(
		&self,
		node_id: &Uuid,
		entries: &[(Uuid, u64, Checksum)],
	) -> Result<Vec<Uuid>, MetaError> {
		if self.get_node(node_id)?.is_none() {
			return Err(MetaError::NotFound(format!(
				"storage node {}",
				control::hex_uuid(node_id)
			)));
		}

		let mut ops = vec![];
		let mut unknown = vec![];
		let mut reported = HashMap::new();
		for (block_id, _size, _checksum) in entries.iter() {
			reported.insert(*block_id, ());
			match self.get_block(block_id)? {
				Some(_) => {
					let existing = self
						.locations_of_block(block_id)?
						.into_iter()
						.find(|l| l.node_id == *node_id);
					match existing {
						None => ops.push(MetaOp::AddLocation(BlockLocation {
							block_id: *block_id,
							node_id: *node_id,
							is_leader: false,
							suspect: false,
							added_msec: now_msec(),
						})),
						Some(l) if l.suspect => ops.push(MetaOp::SetLocationSuspect {
							block_id: *block_id,
							node_id: *node_id,
							suspect: false,
						}),
						Some(_) => (),
					}
				}
				None => unknown.push(*block_id),
			}
		}

		// Locations we recorded for this node that it no longer holds
		for loc in self.locations_of_node(node_id)? {
			if !reported.contains_key(&loc.block_id) {
				ops.push(MetaOp::RemoveLocation {
					block_id: loc.block_id,
					node_id: *node_id,
				});
			}
		}

		if !ops.is_empty() {
			self.mutate_batch(&ops, true)?;
		}
		Ok(unknown)
	}

	/// Give every ACTIVE node a fresh liveness grace period. Called when
	/// this metadata node becomes leader, so that stale replicated
	/// timestamps do not cause a mass eviction.
	pub fn refresh_heartbeats(&self) -> Result<(), MetaError> {
		let now = now_msec();
		let mut ops = vec![];
		for mut n in self.list_nodes()? {
			if n.status == NodeStatus::Active {
				n.last_heartbeat_msec = now;
				ops.push(MetaOp::PutNode(n));
			}
		}
		if !ops.is_empty() {
			self.mutate_batch(&ops, false)?;
		}
		Ok(())
	}

	// ---- oplog / metadata sync ----

	pub fn oplog_head(&self) -> Result<u64, MetaError> {
		Ok(self
			.sync_state
			.get(OPLOG_HEAD_KEY)?
			.map(|v| u64::from_be_bytes(v[0..8].try_into().unwrap()))
			.unwrap_or(0))
	}

	pub fn applied_seq(&self) -> Result<u64, MetaError> {
		Ok(self
			.sync_state
			.get(APPLIED_SEQ_KEY)?
			.map(|v| u64::from_be_bytes(v[0..8].try_into().unwrap()))
			.unwrap_or(0))
	}

	pub fn read_oplog_after(&self, seq: u64, limit: usize) -> Result<Vec<(u64, MetaOp)>, MetaError> {
		let low = u64::to_be_bytes(seq + 1);
		let mut out = vec![];
		for item in self.oplog.range(&low[..]..)? {
			let (k, v) = item?;
			out.push((u64::from_be_bytes(k[0..8].try_into().unwrap()), dec(&v)?));
			if out.len() >= limit {
				break;
			}
		}
		Ok(out)
	}

	/// Apply oplog entries received from the leader, in order. Entries
	/// at or below the already-applied sequence are skipped. Returns the
	/// new applied sequence number.
	// TODO: prune oplog entries once both metadata nodes have applied them
	pub fn apply_synced(&self, entries: &[(u64, MetaOp)]) -> Result<u64, MetaError> {
		let mut applied = self.applied_seq()?;
		for (seq, op) in entries.iter() {
			if *seq <= applied {
				continue;
			}
			let res: db::TxResult<(), MetaError> = self.db.transaction(|mut tx| {
				self.apply_op_tx(&mut tx, op)?;
				tx.insert(&self.oplog, &u64::to_be_bytes(*seq)[..], enc_tx(op)?)?;
				tx.insert(&self.sync_state, OPLOG_HEAD_KEY, &u64::to_be_bytes(*seq)[..])?;
				tx.insert(&self.sync_state, APPLIED_SEQ_KEY, &u64::to_be_bytes(*seq)[..])?;
				tx.commit(())
			});
			match res {
				Ok(()) => (),
				Err(TxError::Abort(e)) => {
					// The op cannot apply here (divergent histories
					// around a failover). Sync is best-effort: record
					// the op as applied and keep going.
					warn!("Skipping unapplicable synced op at seq {}: {}", seq, e);
					let res2: db::TxResult<(), MetaError> = self.db.transaction(|mut tx| {
						tx.insert(&self.oplog, &u64::to_be_bytes(*seq)[..], enc_tx(op)?)?;
						tx.insert(&self.sync_state, OPLOG_HEAD_KEY, &u64::to_be_bytes(*seq)[..])?;
						tx.insert(
							&self.sync_state,
							APPLIED_SEQ_KEY,
							&u64::to_be_bytes(*seq)[..],
						)?;
						tx.commit(())
					});
					res2.map_err(MetaError::from)?;
				}
				Err(e) => return Err(e.into()),
			}
			applied = *seq;
		}
		Ok(applied)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use silo_db::sled_adapter::{sled, SledDb};

	fn test_store() -> (mktemp::Temp, Arc<MetadataStore>) {
		let dir = mktemp::Temp::new_dir().unwrap();
		let db = SledDb::init(sled::open(dir.to_path_buf()).unwrap());
		let store = MetadataStore::new(db).unwrap();
		(dir, store)
	}

	fn register_test_node(store: &MetadataStore) -> Uuid {
		let id = gen_uuid();
		store
			.register_datanode(id, "localhost".into(), 3901, 1 << 30, 1 << 30)
			.unwrap();
		id
	}

	#[test]
	fn test_mkdir_rmdir() {
		let (_dir, store) = test_store();

		let d = store.mkdir("/a", "alice").unwrap();
		assert_eq!(d.path, "/a");
		store.mkdir("/a/b", "alice").unwrap();

		// duplicate
		assert!(matches!(
			store.mkdir("/a", "alice"),
			Err(MetaError::AlreadyExists(_))
		));
		// missing parent
		assert!(matches!(
			store.mkdir("/x/y", "alice"),
			Err(MetaError::ParentMissing(_))
		));
		// non-recursive removal of a non-empty directory
		assert!(matches!(
			store.rmdir("/a", false),
			Err(MetaError::NotEmpty(_))
		));

		store.rmdir("/a/b", false).unwrap();
		store.rmdir("/a", false).unwrap();
		assert!(store.get_dir("/a").unwrap().is_none());

		// mkdir then rmdir returns the namespace to the pre-state
		store.mkdir("/a", "alice").unwrap();
		store.rmdir("/a", false).unwrap();
		assert!(store.get_dir("/a").unwrap().is_none());
		assert!(store.get_dir("/").unwrap().is_some());
	}

	#[test]
	fn test_file_lifecycle() {
		let (_dir, store) = test_store();
		let node = register_test_node(&store);

		store.mkdir("/data", "alice").unwrap();
		let f = store.create_file("/data/hello.txt", "alice", 10).unwrap();
		assert_eq!(f.status, FileStatus::Uploading);

		// path collision
		assert!(matches!(
			store.create_file("/data/hello.txt", "bob", 4),
			Err(MetaError::AlreadyExists(_))
		));

		let b0 = BlockInfo {
			id: gen_uuid(),
			file_id: f.id,
			seq: 0,
			size: 6,
			checksum: sha256sum(b"abcdef"),
		};
		let b1 = BlockInfo {
			id: gen_uuid(),
			file_id: f.id,
			seq: 1,
			size: 4,
			checksum: sha256sum(b"ghij"),
		};
		// registration order does not matter
		store.register_block(b1.clone()).unwrap();
		store.register_block(b0.clone()).unwrap();
		// duplicate registration is a no-op
		store.register_block(b0.clone()).unwrap();

		let blocks = store.list_blocks_of_file(&f.id).unwrap();
		assert_eq!(
			blocks.iter().map(|b| b.id).collect::<Vec<_>>(),
			vec![b0.id, b1.id]
		);

		store.add_location(&b0.id, &node, true).unwrap();
		store.add_location(&b1.id, &node, true).unwrap();

		// leader uniqueness
		let node2 = register_test_node(&store);
		assert!(matches!(
			store.add_location(&b0.id, &node2, true),
			Err(MetaError::Conflict(_))
		));
		store.add_location(&b0.id, &node2, false).unwrap();

		let done = store.finalize_file(&f.id).unwrap();
		assert_eq!(done.status, FileStatus::Complete);

		let by_path = store.get_file_by_path("/data/hello.txt").unwrap().unwrap();
		assert_eq!(by_path.id, f.id);

		// cascade
		let (_, doomed) = store.delete_file(&f.id).unwrap();
		assert_eq!(doomed.len(), 2);
		assert!(store.get_file(&f.id).unwrap().is_none());
		assert!(store.get_block(&b0.id).unwrap().is_none());
		assert!(store.locations_of_block(&b0.id).unwrap().is_empty());
		assert!(store.get_file_by_path("/data/hello.txt").unwrap().is_none());
	}

	#[test]
	fn test_finalize_size_mismatch() {
		let (_dir, store) = test_store();
		let f = store.create_file("/f", "alice", 100).unwrap();
		let b = BlockInfo {
			id: gen_uuid(),
			file_id: f.id,
			seq: 0,
			size: 60,
			checksum: sha256sum(b"x"),
		};
		store.register_block(b).unwrap();
		assert!(matches!(
			store.finalize_file(&f.id),
			Err(MetaError::InvariantViolation(_))
		));
	}

	#[test]
	fn test_recursive_rmdir_cascades() {
		let (_dir, store) = test_store();
		let node = register_test_node(&store);

		store.mkdir("/d", "alice").unwrap();
		store.mkdir("/d/sub", "alice").unwrap();
		let f = store.create_file("/d/sub/f", "alice", 3).unwrap();
		let b = BlockInfo {
			id: gen_uuid(),
			file_id: f.id,
			seq: 0,
			size: 3,
			checksum: sha256sum(b"xyz"),
		};
		store.register_block(b.clone()).unwrap();
		store.add_location(&b.id, &node, true).unwrap();

		let doomed = store.rmdir("/d", true).unwrap();
		assert_eq!(doomed.len(), 1);
		assert_eq!(doomed[0].0.id, b.id);
		assert!(store.get_dir("/d").unwrap().is_none());
		assert!(store.get_dir("/d/sub").unwrap().is_none());
		assert!(store.get_file(&f.id).unwrap().is_none());
	}

	#[test]
	fn test_block_report_idempotent() {
		let (_dir, store) = test_store();
		let node = register_test_node(&store);

		let f = store.create_file("/f", "alice", 4).unwrap();
		let b = BlockInfo {
			id: gen_uuid(),
			file_id: f.id,
			seq: 0,
			size: 4,
			checksum: sha256sum(b"data"),
		};
		store.register_block(b.clone()).unwrap();

		let orphan = gen_uuid();
		let report = vec![
			(b.id, 4u64, b.checksum),
			(orphan, 10u64, sha256sum(b"waste")),
		];

		let unknown = store.process_block_report(&node, &report).unwrap();
		assert_eq!(unknown, vec![orphan]);
		assert_eq!(store.locations_of_block(&b.id).unwrap().len(), 1);

		let head = store.oplog_head().unwrap();
		// identical re-report: no state mutation
		let unknown2 = store.process_block_report(&node, &report).unwrap();
		assert_eq!(unknown2, vec![orphan]);
		assert_eq!(store.oplog_head().unwrap(), head);

		// the node lost the block: its location is dropped
		let unknown3 = store.process_block_report(&node, &[]).unwrap();
		assert!(unknown3.is_empty());
		assert!(store.locations_of_block(&b.id).unwrap().is_empty());
	}

	#[test]
	fn test_oplog_replication() {
		let (_dir1, leader) = test_store();
		let (_dir2, follower) = test_store();

		leader.mkdir("/a", "alice").unwrap();
		let f = leader.create_file("/a/f", "alice", 0).unwrap();
		leader.delete_file(&f.id).unwrap();

		let head = leader.oplog_head().unwrap();
		assert!(head >= 3);

		let entries = leader.read_oplog_after(0, 100).unwrap();
		let applied = follower.apply_synced(&entries).unwrap();
		assert_eq!(applied, head);
		assert_eq!(follower.applied_seq().unwrap(), head);

		assert!(follower.get_dir("/a").unwrap().is_some());
		assert!(follower.get_file_by_path("/a/f").unwrap().is_none());

		// replay is idempotent
		let applied2 = follower.apply_synced(&entries).unwrap();
		assert_eq!(applied2, head);
	}

	#[test]
	fn test_mark_node_inactive_and_recovery() {
		let (_dir, store) = test_store();
		let node = register_test_node(&store);
		let f = store.create_file("/f", "alice", 1).unwrap();
		let b = BlockInfo {
			id: gen_uuid(),
			file_id: f.id,
			seq: 0,
			size: 1,
			checksum: sha256sum(b"a"),
		};
		store.register_block(b.clone()).unwrap();
		store.add_location(&b.id, &node, true).unwrap();

		let affected = store.mark_node_inactive(&node).unwrap();
		assert_eq!(affected, vec![b.id]);
		assert_eq!(
			store.get_node(&node).unwrap().unwrap().status,
			NodeStatus::Inactive
		);
		assert!(store.locations_of_block(&b.id).unwrap()[0].suspect);
		assert!(store.healthy_locations(&b.id).unwrap().is_empty());

		// heartbeat brings it back and clears suspicion
		assert_eq!(
			store.heartbeat(&node, 1 << 30, 1).unwrap(),
			HeartbeatOutcome::Ok
		);
		assert_eq!(
			store.get_node(&node).unwrap().unwrap().status,
			NodeStatus::Active
		);
		assert!(!store.locations_of_block(&b.id).unwrap()[0].suspect);
	}
}
