//! The block manager: data-plane RPC service of a storage node, the
//! leader side of the replication handshake, and the resync queue that
//! reconciles local blocks with the metadata plane
use std::collections::HashMap;
use std::convert::TryInto;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::{select, FutureExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex, Notify};

use silo_db as db;

use silo_rpc::control::*;
use silo_rpc::*;

use silo_util::background::worker::{Worker, WorkerStatus};
use silo_util::data::*;
use silo_util::error::*;
use silo_util::time::*;

use crate::data::*;
use crate::metrics::*;
use crate::store::*;

/// RPC endpoint path of the storage node data plane
pub const BLOCK_RPC_PATH: &str = "silo_block/manager.rs/BlockNodeRpc";

// Timeout for RPCs that read and write block frames on remote nodes
const BLOCK_RW_TIMEOUT: Duration = Duration::from_secs(30);

// The delay between the time where a resync operation fails
// and the time when it is retried, with exponential backoff
// (multiplied by 2, 4, 8, 16, etc. for every consecutive failure).
const RESYNC_RETRY_DELAY: Duration = Duration::from_secs(60);

// A partial upload with no new frame for this long is dropped and its
// block id becomes writable again
const PENDING_UPLOAD_TIMEOUT: Duration = Duration::from_secs(300);

// Consecutive resync failures on a block unknown to the metadata plane
// before the local copy is considered an orphan and deleted
const ORPHAN_GC_ATTEMPTS: u64 = 4;

/// One frame of a block transfer. Frames are sent in increasing offset
/// order; the receiving node buffers them and persists the block once
/// `offset + len == total_size`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockFrame {
	pub block_id: Uuid,
	pub offset: u64,
	pub total_size: u64,
	/// SHA-256 of the complete plain block
	pub checksum: Checksum,
	pub data: DataChunk,
}

/// RPC messages of the storage node data plane
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BlockNodeRpc {
	Ok,
	/// One frame of a block upload
	Store {
		frame: BlockFrame,
		/// Follower this node should replicate to once the block is
		/// complete (placement decided by the metadata manager)
		replicate_to: Option<NodeAddr>,
		/// Set on replication pushes so that the receiving node does
		/// not in turn become a replication leader for the block
		is_replica: bool,
	},
	/// Ask for a window of a block's contents, starting at `offset`.
	/// Answered with a `Frame`.
	Retrieve { block_id: Uuid, offset: u64 },
	Frame(BlockFrame),
	/// Push the local copy of a block to another node and report the new
	/// location to the metadata manager (leader side of the replication
	/// handshake)
	Replicate { block_id: Uuid, target: NodeAddr },
	/// Push the local copy of a block to another node; the caller (the
	/// replication coordinator) records the new location itself
	Transfer { block_id: Uuid, target: NodeAddr },
	/// Existence and integrity metadata query
	Check { block_id: Uuid },
	CheckResult {
		block_id: Uuid,
		exists: bool,
		size: u64,
		checksum: Option<Checksum>,
	},
	/// Best-effort physical removal; an absent block is a success
	Delete { block_id: Uuid },
}

impl Rpc for BlockNodeRpc {
	type Response = Result<BlockNodeRpc, Error>;
}

struct PendingUpload {
	buf: Vec<u8>,
	received: u64,
	checksum: Checksum,
	replicate_to: Option<NodeAddr>,
	is_replica: bool,
	started_msec: u64,
}

// Functions that touch block files on disk must only run while this
// lock is held, which serializes concurrent writes of the same block id.
struct BlockManagerLocked();

/// The block manager, serving the data-plane RPC and owning the local
/// block store of a storage node
pub struct BlockManager {
	pub store: BlockStore,
	node_id: Uuid,
	replication_factor: usize,
	max_block_size: usize,
	chunk_size: usize,
	compression_level: Option<i32>,

	mutation_lock: Mutex<BlockManagerLocked>,
	pending: Mutex<HashMap<Uuid, PendingUpload>>,

	resync_queue: db::Tree,
	resync_notify: Notify,
	resync_errors: db::Tree,

	rpc: RpcHelper,
	endpoint: Arc<Endpoint<BlockNodeRpc, Self>>,
	control: Arc<ControlClient>,

	blocks_stored: AtomicU64,

	metrics: BlockManagerMetrics,
}

impl BlockManager {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		db: &db::Db,
		store: BlockStore,
		node_id: Uuid,
		replication_factor: usize,
		max_block_size: usize,
		chunk_size: usize,
		compression_level: Option<i32>,
		netapp: Arc<NetApp>,
		control: Arc<ControlClient>,
	) -> Result<Arc<Self>, Error> {
		let resync_queue = db.open_tree("block_resync_queue")?;
		let resync_errors = db.open_tree("block_resync_errors")?;

		let endpoint = netapp.endpoint(BLOCK_RPC_PATH.to_string());

		let manager = Arc::new(Self {
			store,
			node_id,
			replication_factor,
			max_block_size,
			chunk_size,
			compression_level,
			mutation_lock: Mutex::new(BlockManagerLocked()),
			pending: Mutex::new(HashMap::new()),
			resync_queue,
			resync_notify: Notify::new(),
			resync_errors,
			rpc: RpcHelper::new(node_id, netapp),
			endpoint,
			control,
			blocks_stored: AtomicU64::new(0),
			metrics: BlockManagerMetrics::new(),
		});
		manager.endpoint.set_handler(manager.clone());

		Ok(manager)
	}

	pub fn node_id(&self) -> Uuid {
		self.node_id
	}

	pub fn blocks_stored(&self) -> u64 {
		self.blocks_stored.load(Ordering::Relaxed)
	}

	pub fn set_blocks_stored(&self, n: u64) {
		self.blocks_stored.store(n, Ordering::Relaxed);
	}

	// ---- RPC handlers ----

	async fn handle_store(
		&self,
		frame: &BlockFrame,
		replicate_to: &Option<NodeAddr>,
		is_replica: bool,
	) -> Result<BlockNodeRpc, Error> {
		if frame.total_size as usize > self.max_block_size {
			return Err(Error::Message(format!(
				"Block {:?} exceeds the maximum block size ({} > {})",
				frame.block_id, frame.total_size, self.max_block_size
			)));
		}
		let chunk = frame.data.clone().into_plain()?;
		if frame.offset + chunk.len() as u64 > frame.total_size {
			return Err(Error::Message(format!(
				"Invalid frame for block {:?}: offset {} + length {} exceeds total size {}",
				frame.block_id,
				frame.offset,
				chunk.len(),
				frame.total_size
			)));
		}

		let complete = {
			let mut pending = self.pending.lock().await;
			if frame.offset == 0 {
				if let Some(prev) = pending.get(&frame.block_id) {
					if now_msec() < prev.started_msec + PENDING_UPLOAD_TIMEOUT.as_millis() as u64 {
						return Err(Error::Message(format!(
							"AlreadyExists: an upload of block {:?} is already in progress",
							frame.block_id
						)));
					}
					warn!(
						"Dropping stale partial upload of block {:?}",
						frame.block_id
					);
					pending.remove(&frame.block_id);
				}
				let mut upload = PendingUpload {
					buf: vec![0u8; frame.total_size as usize],
					received: 0,
					checksum: frame.checksum,
					replicate_to: *replicate_to,
					is_replica,
					started_msec: now_msec(),
				};
				upload.buf[..chunk.len()].copy_from_slice(&chunk[..]);
				upload.received = chunk.len() as u64;
				if upload.received == frame.total_size {
					Some(upload)
				} else {
					pending.insert(frame.block_id, upload);
					None
				}
			} else {
				let upload = pending.get_mut(&frame.block_id).ok_or_message(format!(
					"Out-of-band frame: no upload of block {:?} in progress",
					frame.block_id
				))?;
				if upload.checksum != frame.checksum {
					return Err(Error::Message(format!(
						"Frames of block {:?} disagree on its checksum",
						frame.block_id
					)));
				}
				let offset = frame.offset as usize;
				upload.buf[offset..offset + chunk.len()].copy_from_slice(&chunk[..]);
				upload.received += chunk.len() as u64;
				if upload.received == frame.total_size {
					pending.remove(&frame.block_id)
				} else {
					None
				}
			}
		};

		if let Some(upload) = complete {
			self.finish_upload(frame.block_id, upload).await?;
		}
		Ok(BlockNodeRpc::Ok)
	}

	async fn finish_upload(&self, block_id: Uuid, upload: PendingUpload) -> Result<(), Error> {
		if sha256sum(&upload.buf[..]) != upload.checksum {
			return Err(Error::Message(format!(
				"Upload of block {:?} does not match its announced checksum",
				block_id
			)));
		}

		let write_size = upload.buf.len() as u64;
		let start = Instant::now();
		let outcome = self
			.mutation_lock
			.lock()
			.await
			.write_block(&self.store, &block_id, &upload.buf[..], upload.checksum)
			.await?;
		self.metrics
			.block_write_duration
			.record(start.elapsed().as_secs_f64(), &[]);

		if outcome == BlockStoreOutcome::AlreadyStored {
			// Duplicate store with matching checksum: no-op success,
			// replication was already triggered by the first store
			return Ok(());
		}

		self.metrics.bytes_written.add(write_size, &[]);
		self.blocks_stored.fetch_add(1, Ordering::Relaxed);

		if upload.is_replica {
			return Ok(());
		}

		// We accepted this block first: we are its leader, and it must
		// reach a follower before it counts as durable
		match upload.replicate_to {
			Some(target) => {
				if let Err(e) = self.replicate_block(&block_id, target).await {
					warn!(
						"Could not replicate block {:?} to {}: {} (queued for resync)",
						block_id, target, e
					);
					self.put_to_resync(&block_id, RESYNC_RETRY_DELAY)?;
				}
			}
			None => {
				// No follower hint in the request: the resync loop will
				// ask the metadata manager for one
				self.put_to_resync(&block_id, Duration::from_millis(0))?;
			}
		}
		Ok(())
	}

	async fn handle_retrieve(&self, block_id: &Uuid, offset: u64) -> Result<BlockNodeRpc, Error> {
		let start = Instant::now();
		let (data, checksum) = match self.store.read(block_id).await {
			Ok(x) => x,
			Err(Error::CorruptData(id)) => {
				self.metrics.corruption_counter.add(1, &[]);
				self.blocks_stored.fetch_sub(1, Ordering::Relaxed);
				// The corrupt copy has been quarantined; have the
				// resync loop fetch a healthy replica back
				self.put_to_resync(&id, Duration::from_millis(0))?;
				return Err(Error::CorruptData(id));
			}
			Err(e) => return Err(e),
		};
		self.metrics.bytes_read.add(data.len() as u64, &[]);
		self.metrics
			.block_read_duration
			.record(start.elapsed().as_secs_f64(), &[]);

		if offset > data.len() as u64 {
			return Err(Error::Message(format!(
				"Invalid offset {} into block {:?} of size {}",
				offset,
				block_id,
				data.len()
			)));
		}
		let end = std::cmp::min(offset as usize + self.chunk_size, data.len());
		let chunk =
			DataChunk::from_buffer(data[offset as usize..end].to_vec(), self.compression_level);
		Ok(BlockNodeRpc::Frame(BlockFrame {
			block_id: *block_id,
			offset,
			total_size: data.len() as u64,
			checksum,
			data: chunk,
		}))
	}

	async fn handle_check(&self, block_id: &Uuid) -> Result<BlockNodeRpc, Error> {
		let existing = self.store.exists(block_id).await?;
		Ok(BlockNodeRpc::CheckResult {
			block_id: *block_id,
			exists: existing.is_some(),
			size: existing.map(|(s, _)| s).unwrap_or(0),
			checksum: existing.map(|(_, c)| c),
		})
	}

	async fn handle_delete(&self, block_id: &Uuid) -> Result<BlockNodeRpc, Error> {
		let deleted = self
			.mutation_lock
			.lock()
			.await
			.delete_block(&self.store, block_id)
			.await?;
		if deleted {
			self.blocks_stored.fetch_sub(1, Ordering::Relaxed);
			self.metrics.delete_counter.add(1, &[]);
		}
		Ok(BlockNodeRpc::Ok)
	}

	async fn handle_replicate(
		&self,
		block_id: &Uuid,
		target: NodeAddr,
	) -> Result<BlockNodeRpc, Error> {
		self.replicate_block(block_id, target).await?;
		Ok(BlockNodeRpc::Ok)
	}

	async fn handle_transfer(
		&self,
		block_id: &Uuid,
		target: NodeAddr,
	) -> Result<BlockNodeRpc, Error> {
		self.push_block_to(block_id, target).await?;
		Ok(BlockNodeRpc::Ok)
	}

	// ---- Block movement ----

	/// Push the local copy of a block to `target` and report the new
	/// location to the metadata manager
	async fn replicate_block(&self, block_id: &Uuid, target: NodeAddr) -> Result<(), Error> {
		self.push_block_to(block_id, target).await?;
		self.control
			.add_location(
				block_id,
				&AddLocationRequest {
					node_id: hex_uuid(&target.id),
					is_leader: false,
				},
			)
			.await?;
		Ok(())
	}

	/// Send the local copy of a block to another node, frame by frame
	pub async fn push_block_to(&self, block_id: &Uuid, target: NodeAddr) -> Result<(), Error> {
		let start = Instant::now();
		let (data, checksum) = self.store.read(block_id).await?;
		self.metrics.bytes_read.add(data.len() as u64, &[]);
		self.metrics
			.block_read_duration
			.record(start.elapsed().as_secs_f64(), &[]);

		let total_size = data.len() as u64;
		let mut offset = 0usize;
		loop {
			let end = std::cmp::min(offset + self.chunk_size, data.len());
			let chunk = DataChunk::from_buffer(data[offset..end].to_vec(), self.compression_level);
			let frame = BlockFrame {
				block_id: *block_id,
				offset: offset as u64,
				total_size,
				checksum,
				data: chunk,
			};
			self.rpc
				.call(
					&self.endpoint,
					target,
					BlockNodeRpc::Store {
						frame,
						replicate_to: None,
						is_replica: true,
					},
					RequestStrategy::with_priority(PRIO_BACKGROUND).with_timeout(BLOCK_RW_TIMEOUT),
				)
				.await?;
			offset = end;
			if offset >= data.len() {
				break;
			}
		}
		self.metrics.resync_send_counter.add(1, &[]);
		Ok(())
	}

	/// Fetch a block from another node and store it locally
	pub async fn fetch_block_from(&self, block_id: &Uuid, peer: NodeAddr) -> Result<(), Error> {
		let mut data: Vec<u8> = vec![];
		let mut checksum = None;
		let mut offset = 0u64;
		loop {
			let resp = self
				.rpc
				.call(
					&self.endpoint,
					peer,
					BlockNodeRpc::Retrieve {
						block_id: *block_id,
						offset,
					},
					RequestStrategy::with_priority(PRIO_BACKGROUND).with_timeout(BLOCK_RW_TIMEOUT),
				)
				.await?;
			match resp {
				BlockNodeRpc::Frame(frame) => {
					if frame.block_id != *block_id || frame.offset != offset {
						return Err(Error::Message(format!(
							"Invalid frame received for block {:?}",
							block_id
						)));
					}
					let chunk = frame.data.into_plain()?;
					if offset == 0 {
						data = Vec::with_capacity(frame.total_size as usize);
						checksum = Some(frame.checksum);
					}
					if chunk.is_empty() && offset < frame.total_size {
						return Err(Error::Message(format!(
							"Empty frame before the end of block {:?}",
							block_id
						)));
					}
					data.extend_from_slice(&chunk[..]);
					offset += chunk.len() as u64;
					if offset >= frame.total_size {
						break;
					}
				}
				m => return Err(Error::unexpected_rpc_message(m)),
			}
		}

		let checksum = checksum.ok_or_message("No frame received")?;
		if sha256sum(&data[..]) != checksum {
			return Err(Error::CorruptData(*block_id));
		}
		let outcome = self
			.mutation_lock
			.lock()
			.await
			.write_block(&self.store, block_id, &data[..], checksum)
			.await?;
		if outcome == BlockStoreOutcome::Written {
			self.blocks_stored.fetch_add(1, Ordering::Relaxed);
		}
		self.metrics.resync_recv_counter.add(1, &[]);
		Ok(())
	}

	// ---- Resync loop: reconcile local blocks with the metadata plane ----

	pub fn put_to_resync(&self, block_id: &Uuid, delay: Duration) -> Result<(), Error> {
		let when = now_msec() + delay.as_millis() as u64;
		self.put_to_resync_at(block_id, when)
	}

	fn put_to_resync_at(&self, block_id: &Uuid, when: u64) -> Result<(), Error> {
		trace!("Put resync_queue: {} {:?}", when, block_id);
		let mut key = u64::to_be_bytes(when).to_vec();
		key.extend(block_id.as_slice());
		self.resync_queue.insert(key, block_id.as_slice())?;
		self.resync_notify.notify_waiters();
		Ok(())
	}

	pub fn resync_queue_len(&self) -> usize {
		self.resync_queue.len().unwrap_or(0)
	}

	pub(crate) async fn resync_iter(
		&self,
		must_exit: &mut watch::Receiver<bool>,
	) -> Result<bool, Error> {
		if let Some((time_bytes, id_bytes)) = self.resync_queue.first()? {
			let time_msec = u64::from_be_bytes(time_bytes[0..8].try_into().unwrap());
			let now = now_msec();

			if now >= time_msec {
				let block_id: Uuid = id_bytes[..]
					.try_into()
					.ok_or_message("Invalid block id in resync queue")?;

				if let Some(ec) = self.resync_errors.get(block_id.as_slice())? {
					let ec = ErrorCounter::decode(&ec);
					if now < ec.next_try() {
						// Not yet time to retry after the last error:
						// requeue at the retry time. ec.next_try() >
						// now >= time_msec, so the entry we remove is
						// not the one we just added.
						self.put_to_resync_at(&block_id, ec.next_try())?;
						self.resync_queue.remove(&time_bytes)?;
						return Ok(false);
					}
				}

				let start = Instant::now();
				let res = self.resync_block(&block_id).await;
				self.metrics.resync_counter.add(1, &[]);
				self.metrics
					.resync_duration
					.record(start.elapsed().as_secs_f64(), &[]);

				if let Err(e) = &res {
					self.metrics.resync_error_counter.add(1, &[]);
					warn!("Error when resyncing {:?}: {}", block_id, e);

					let err_counter = match self.resync_errors.get(block_id.as_slice())? {
						Some(ec) => ErrorCounter::decode(&ec).add1(now + 1),
						None => ErrorCounter::new(now + 1),
					};

					self.resync_errors
						.insert(block_id.as_slice(), err_counter.encode())?;

					self.put_to_resync_at(&block_id, err_counter.next_try())?;
					// err_counter.next_try() >= now + 1 > now,
					// the entry we remove from the queue is not
					// the entry we inserted with put_to_resync_at
					self.resync_queue.remove(&time_bytes)?;
				} else {
					self.resync_errors.remove(block_id.as_slice())?;
					self.resync_queue.remove(&time_bytes)?;
				}

				Ok(true)
			} else {
				let delay = tokio::time::sleep(Duration::from_millis(time_msec - now));
				select! {
					_ = delay.fuse() => {},
					_ = self.resync_notify.notified().fuse() => {},
					_ = must_exit.changed().fuse() => {},
				}
				Ok(false)
			}
		} else {
			select! {
				_ = self.resync_notify.notified().fuse() => {},
				_ = must_exit.changed().fuse() => {},
			}
			Ok(false)
		}
	}

	async fn resync_block(&self, block_id: &Uuid) -> Result<(), Error> {
		let local = self.store.exists(block_id).await?;

		let record = match self.control.get_block(block_id).await {
			Ok(r) => r,
			Err(e) => {
				if local.is_none() {
					// Nothing here and nothing known: drop the entry
					return Ok(());
				}
				let attempts = self
					.resync_errors
					.get(block_id.as_slice())?
					.map(|ec| ErrorCounter::decode(&ec).errors)
					.unwrap_or(0);
				if is_not_found(&e) && attempts + 1 >= ORPHAN_GC_ATTEMPTS {
					// The metadata plane has repeatedly disowned this
					// block: the local copy is an orphan
					info!(
						"Deleting orphan block {:?} unknown to the metadata plane",
						block_id
					);
					if self
						.mutation_lock
						.lock()
						.await
						.delete_block(&self.store, block_id)
						.await?
					{
						self.blocks_stored.fetch_sub(1, Ordering::Relaxed);
						self.metrics.delete_counter.add(1, &[]);
					}
					return Ok(());
				}
				return Err(e);
			}
		};

		let my_id = hex_uuid(&self.node_id);
		let healthy = record
			.locations
			.iter()
			.filter(|l| !l.suspect && l.node.status == NodeStatus::Active)
			.collect::<Vec<_>>();
		let am_i_location = record.locations.iter().any(|l| l.node.id == my_id);

		match local {
			Some(_) => {
				if healthy.len() >= self.replication_factor {
					return Ok(());
				}
				// Under-replicated: ask the metadata manager for a
				// target outside the current location set and push
				debug!(
					"Resync block {:?}: {} healthy location(s), pushing a new replica",
					block_id,
					healthy.len()
				);
				let exclude = record
					.locations
					.iter()
					.map(|l| l.node.id.clone())
					.collect::<Vec<_>>();
				let placement = self
					.control
					.select_datanodes_for_write(&PlacementRequest {
						num_blocks: 1,
						block_size: record.size,
						exclude,
					})
					.await?;
				let assignment = placement
					.assignments
					.into_iter()
					.next()
					.ok_or_message("No eligible node for re-replication")?;
				let target = assignment.leader.node_addr()?;
				self.push_block_to(block_id, target).await?;
				self.control
					.add_location(
						block_id,
						&AddLocationRequest {
							node_id: assignment.leader.id,
							is_leader: false,
						},
					)
					.await?;
				Ok(())
			}
			None if am_i_location => {
				// We are recorded as holding this block but do not:
				// fetch it back from a healthy replica
				info!(
					"Resync block {:?}: fetching absent but needed block",
					block_id
				);
				let mut last_err =
					Error::Message(format!("No healthy replica of block {:?}", block_id));
				for loc in healthy.iter().filter(|l| l.node.id != my_id) {
					let peer = match loc.node.node_addr() {
						Ok(p) => p,
						Err(e) => {
							last_err = e;
							continue;
						}
					};
					match self.fetch_block_from(block_id, peer).await {
						Ok(()) => return Ok(()),
						Err(e) => last_err = e,
					}
				}
				Err(last_err)
			}
			None => Ok(()),
		}
	}
}

#[async_trait]
impl EndpointHandler<BlockNodeRpc> for BlockManager {
	async fn handle(
		self: &Arc<Self>,
		message: &BlockNodeRpc,
		_from: NodeID,
	) -> Result<BlockNodeRpc, Error> {
		match message {
			BlockNodeRpc::Store {
				frame,
				replicate_to,
				is_replica,
			} => self.handle_store(frame, replicate_to, *is_replica).await,
			BlockNodeRpc::Retrieve { block_id, offset } => {
				self.handle_retrieve(block_id, *offset).await
			}
			BlockNodeRpc::Replicate { block_id, target } => {
				self.handle_replicate(block_id, *target).await
			}
			BlockNodeRpc::Transfer { block_id, target } => {
				self.handle_transfer(block_id, *target).await
			}
			BlockNodeRpc::Check { block_id } => self.handle_check(block_id).await,
			BlockNodeRpc::Delete { block_id } => self.handle_delete(block_id).await,
			m => Err(Error::unexpected_rpc_message(m)),
		}
	}
}

impl BlockManagerLocked {
	async fn write_block(
		&self,
		store: &BlockStore,
		block_id: &Uuid,
		data: &[u8],
		checksum: Checksum,
	) -> Result<BlockStoreOutcome, Error> {
		store.write(block_id, data, checksum).await
	}

	async fn delete_block(&self, store: &BlockStore, block_id: &Uuid) -> Result<bool, Error> {
		store.delete(block_id).await
	}
}

fn is_not_found(e: &Error) -> bool {
	matches!(e, Error::RemoteError(msg) if msg.starts_with("NOT_FOUND"))
}

/// Background worker processing the resync queue
pub struct ResyncWorker {
	manager: Arc<BlockManager>,
}

impl ResyncWorker {
	pub fn new(manager: Arc<BlockManager>) -> Self {
		Self { manager }
	}
}

#[async_trait]
impl Worker for ResyncWorker {
	fn name(&self) -> String {
		"Block resync worker".into()
	}

	async fn work(&mut self, must_exit: &mut watch::Receiver<bool>) -> Result<WorkerStatus, Error> {
		match self.manager.resync_iter(must_exit).await? {
			true => Ok(WorkerStatus::Busy),
			false => Ok(WorkerStatus::Idle),
		}
	}

	async fn wait_for_work(&mut self, _must_exit: &watch::Receiver<bool>) -> WorkerStatus {
		tokio::time::sleep(Duration::from_secs(1)).await;
		WorkerStatus::Busy
	}
}

/// Counts the number of errors when resyncing a block,
/// and the time of the last try.
/// Used to implement exponential backoff.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ErrorCounter {
	pub(crate) errors: u64,
	pub(crate) last_try: u64,
}

impl ErrorCounter {
	pub(crate) fn new(now: u64) -> Self {
		Self {
			errors: 1,
			last_try: now,
		}
	}

	pub(crate) fn decode(data: &[u8]) -> Self {
		Self {
			errors: u64::from_be_bytes(data[0..8].try_into().unwrap()),
			last_try: u64::from_be_bytes(data[8..16].try_into().unwrap()),
		}
	}
	pub(crate) fn encode(&self) -> Vec<u8> {
		[
			u64::to_be_bytes(self.errors),
			u64::to_be_bytes(self.last_try),
		]
		.concat()
	}

	pub(crate) fn add1(self, now: u64) -> Self {
		Self {
			errors: self.errors + 1,
			last_try: now,
		}
	}

	fn delay_msec(&self) -> u64 {
		(RESYNC_RETRY_DELAY.as_millis() as u64) << std::cmp::min(self.errors - 1, 10)
	}
	pub(crate) fn next_try(&self) -> u64 {
		self.last_try + self.delay_msec()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_error_counter_backoff() {
		let base = RESYNC_RETRY_DELAY.as_millis() as u64;

		let ec = ErrorCounter::new(1000);
		assert_eq!(ec.next_try(), 1000 + base);

		let ec = ec.add1(2000);
		assert_eq!(ec.next_try(), 2000 + 2 * base);

		let ec = ec.add1(3000).add1(4000);
		assert_eq!(ec.next_try(), 4000 + 8 * base);

		// The backoff is capped
		let mut ec = ErrorCounter::new(0);
		for _ in 0..50 {
			ec = ec.add1(0);
		}
		assert_eq!(ec.next_try(), base << 10);
	}

	#[test]
	fn test_error_counter_encoding() {
		let ec = ErrorCounter::new(12345).add1(67890);
		let ec2 = ErrorCounter::decode(&ec.encode());
		assert_eq!(ec.errors, ec2.errors);
		assert_eq!(ec.last_try, ec2.last_try);
	}
}
