//! Replication coordinator: a queue of blocks whose replica sets must be
//! repaired, drained by a background worker on the active metadata node
use std::convert::TryInto;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::{select, FutureExt};
use tokio::sync::{watch, Notify};

use silo_db as db;

use silo_block::manager::{BlockNodeRpc, BLOCK_RPC_PATH};

use silo_rpc::control::{self, NodeStatus};
use silo_rpc::*;

use silo_util::background::worker::{Worker, WorkerStatus};
use silo_util::data::*;
use silo_util::error::Error;
use silo_util::time::*;

use crate::error::MetaError;
use crate::placement;
use crate::store::MetadataStore;

// Re-replication attempts before a block is reported as degraded. The
// block is never dropped from the queue: retries continue with a capped
// backoff even once degraded.
pub const REPAIR_MAX_ATTEMPTS: u32 = 5;

const REPAIR_RETRY_DELAY: Duration = Duration::from_secs(30);
const REPAIR_BACKOFF_CAP: u32 = 6;

const TRANSFER_TIMEOUT: Duration = Duration::from_secs(60);

// Periodic safety net: every block is re-checked against the
// replication factor this often while this node is leader
const REPAIR_FULL_SCAN_INTERVAL: Duration = Duration::from_secs(600);

/// Why a block was enqueued for repair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairReason {
	UnderReplicated,
	SuspectLocation,
	ExplicitRepair,
}

impl RepairReason {
	fn encode(&self) -> u8 {
		match self {
			RepairReason::UnderReplicated => 0,
			RepairReason::SuspectLocation => 1,
			RepairReason::ExplicitRepair => 2,
		}
	}
	fn decode(v: u8) -> Self {
		match v {
			1 => RepairReason::SuspectLocation,
			2 => RepairReason::ExplicitRepair,
			_ => RepairReason::UnderReplicated,
		}
	}
}

/// RPC client toward storage nodes, used by the metadata plane for
/// re-replication transfers and physical block deletion
pub struct BlockClient {
	rpc: RpcHelper,
	endpoint: Arc<Endpoint<BlockNodeRpc, ()>>,
}

impl BlockClient {
	pub fn new(node_id: Uuid, netapp: Arc<NetApp>) -> Self {
		let endpoint = netapp.endpoint::<BlockNodeRpc, ()>(BLOCK_RPC_PATH.to_string());
		Self {
			rpc: RpcHelper::new(node_id, netapp),
			endpoint,
		}
	}

	/// Have `source` push its copy of a block to `target`
	pub async fn transfer(
		&self,
		source: NodeAddr,
		block_id: &Uuid,
		target: NodeAddr,
	) -> Result<(), Error> {
		match self
			.rpc
			.call(
				&self.endpoint,
				source,
				BlockNodeRpc::Transfer {
					block_id: *block_id,
					target,
				},
				RequestStrategy::with_priority(PRIO_BACKGROUND).with_timeout(TRANSFER_TIMEOUT),
			)
			.await?
		{
			BlockNodeRpc::Ok => Ok(()),
			m => Err(Error::unexpected_rpc_message(m)),
		}
	}

	/// Best-effort physical removal of a block on a node
	pub async fn delete(&self, node: NodeAddr, block_id: &Uuid) -> Result<(), Error> {
		match self
			.rpc
			.call(
				&self.endpoint,
				node,
				BlockNodeRpc::Delete {
					block_id: *block_id,
				},
				RequestStrategy::with_priority(PRIO_BACKGROUND).with_timeout(TRANSFER_TIMEOUT),
			)
			.await?
		{
			BlockNodeRpc::Ok => Ok(()),
			m => Err(Error::unexpected_rpc_message(m)),
		}
	}
}

pub struct RepairCoordinator {
	store: Arc<MetadataStore>,
	block_client: Arc<BlockClient>,
	replication_factor: usize,

	// key: due time (msec, BE) ++ block id; value: reason ++ attempts (BE)
	queue: db::Tree,
	// blocks whose repair failed REPAIR_MAX_ATTEMPTS times, surfaced in
	// the status API
	degraded: db::Tree,
	notify: Notify,
}

impl RepairCoordinator {
	pub fn new(
		db: &db::Db,
		store: Arc<MetadataStore>,
		block_client: Arc<BlockClient>,
		replication_factor: usize,
	) -> Result<Arc<Self>, MetaError> {
		Ok(Arc::new(Self {
			store,
			block_client,
			replication_factor,
			queue: db.open_tree("repair_queue")?,
			degraded: db.open_tree("repair_degraded")?,
			notify: Notify::new(),
		}))
	}

	pub fn enqueue(
		&self,
		block_id: &Uuid,
		reason: RepairReason,
		delay: Duration,
	) -> Result<(), MetaError> {
		self.enqueue_at(block_id, reason, 0, now_msec() + delay.as_millis() as u64)
	}

	fn enqueue_at(
		&self,
		block_id: &Uuid,
		reason: RepairReason,
		attempts: u32,
		when: u64,
	) -> Result<(), MetaError> {
		let mut key = u64::to_be_bytes(when).to_vec();
		key.extend(block_id.as_slice());
		let mut value = vec![reason.encode()];
		value.extend(&u32::to_be_bytes(attempts)[..]);
		self.queue.insert(key, value)?;
		self.notify.notify_waiters();
		Ok(())
	}

	pub fn queue_len(&self) -> usize {
		self.queue.len().unwrap_or(0)
	}

	pub fn degraded_blocks(&self) -> Result<Vec<Uuid>, MetaError> {
		let mut out = vec![];
		for item in self.degraded.iter()? {
			let (k, _) = item?;
			if let Ok(id) = k[..].try_into() {
				out.push(id);
			}
		}
		Ok(out)
	}

	/// Enqueue every block whose healthy replica count is below the
	/// replication factor. Returns how many were enqueued.
	pub fn full_scan_enqueue(&self) -> Result<usize, MetaError> {
		let under = self.store.scan_under_replicated(self.replication_factor)?;
		let n = under.len();
		for (block_id, healthy) in under {
			debug!(
				"Full scan: block {:?} has {} healthy location(s)",
				block_id, healthy
			);
			self.enqueue(&block_id, RepairReason::UnderReplicated, Duration::from_secs(0))?;
		}
		Ok(n)
	}

	pub(crate) async fn repair_iter(
		&self,
		must_exit: &mut watch::Receiver<bool>,
	) -> Result<bool, MetaError> {
		if let Some((key, value)) = self.queue.first()? {
			let when = u64::from_be_bytes(key[0..8].try_into().unwrap());
			let now = now_msec();
			if now >= when {
				let block_id: Uuid = key[8..40]
					.try_into()
					.map_err(|_| MetaError::Internal("Invalid repair queue key".into()))?;
				let reason = RepairReason::decode(value[0]);
				let attempts = u32::from_be_bytes(value[1..5].try_into().unwrap());

				let res = self.repair_block(&block_id, reason).await;
				match res {
					Ok(()) => {
						self.degraded.remove(block_id.as_slice())?;
					}
					Err(e) => {
						let attempts = attempts + 1;
						warn!(
							"Repair of block {:?} failed (attempt {}): {}",
							block_id, attempts, e
						);
						if attempts >= REPAIR_MAX_ATTEMPTS {
							error!(
								"Block {:?} is degraded: {} re-replication attempts failed",
								block_id, attempts
							);
							self.degraded
								.insert(block_id.as_slice(), &u32::to_be_bytes(attempts)[..])?;
						}
						// Never silently lose a block: requeue with a
						// capped exponential backoff
						let shift = std::cmp::min(attempts.saturating_sub(1), REPAIR_BACKOFF_CAP);
						let delay = (REPAIR_RETRY_DELAY.as_millis() as u64) << shift;
						self.enqueue_at(&block_id, reason, attempts, now + delay)?;
					}
				}
				self.queue.remove(&key)?;
				Ok(true)
			} else {
				let delay = tokio::time::sleep(Duration::from_millis(when - now));
				select! {
					_ = delay.fuse() => {},
					_ = self.notify.notified().fuse() => {},
					_ = must_exit.changed().fuse() => {},
				}
				Ok(false)
			}
		} else {
			select! {
				_ = self.notify.notified().fuse() => {},
				_ = must_exit.changed().fuse() => {},
			}
			Ok(false)
		}
	}

	async fn repair_block(&self, block_id: &Uuid, reason: RepairReason) -> Result<(), MetaError> {
		let info = match self.store.get_block(block_id)? {
			Some(info) => info,
			None => {
				// The block record is gone (file deleted): nothing to do
				self.degraded.remove(block_id.as_slice())?;
				return Ok(());
			}
		};

		let locations = self.store.locations_of_block(block_id)?;
		let healthy = self.store.healthy_locations(block_id)?;

		if healthy.len() >= self.replication_factor {
			// Healthy again: drop suspect rows whose node is still
			// INACTIVE, and trim over-replication
			for loc in locations.iter().filter(|l| l.suspect) {
				let still_down = match self.store.get_node(&loc.node_id)? {
					Some(n) => n.status != NodeStatus::Active,
					None => true,
				};
				if still_down {
					self.store.remove_location(block_id, &loc.node_id)?;
				}
			}
			let excess = healthy.len() - self.replication_factor;
			for loc in healthy.iter().filter(|l| !l.is_leader).take(excess) {
				info!(
					"Block {:?} is over-replicated, dropping replica on {}",
					block_id,
					control::hex_uuid(&loc.node_id)
				);
				self.store.remove_location(block_id, &loc.node_id)?;
				if let Some(node) = self.store.get_node(&loc.node_id)? {
					if let Ok(addr) = node.node_addr() {
						if let Err(e) = self.block_client.delete(addr, block_id).await {
							debug!("Could not delete excess replica: {}", e);
						}
					}
				}
			}
			return Ok(());
		}

		if healthy.is_empty() {
			// Zero healthy replicas is fatal; surfaced immediately and
			// retried in case a node comes back
			error!("Block {:?} has no healthy replica left", block_id);
			self.degraded
				.insert(block_id.as_slice(), &u32::to_be_bytes(0)[..])?;
			return Err(MetaError::NoEligibleNodes(format!(
				"no healthy source for block {}",
				control::hex_uuid(block_id)
			)));
		}

		debug!(
			"Repairing block {:?}: {} healthy location(s), reason {:?}",
			block_id,
			healthy.len(),
			reason
		);

		// Source: prefer the block leader if it is healthy
		let source_loc = healthy
			.iter()
			.find(|l| l.is_leader)
			.unwrap_or(&healthy[0]);
		let source_node = self
			.store
			.get_node(&source_loc.node_id)?
			.ok_or_else(|| MetaError::NotFound("source node record".to_string()))?;
		let source = source_node
			.node_addr()
			.map_err(MetaError::Internal)?;

		// Target: placement policy, excluding every current holder
		let exclude: Vec<Uuid> = locations.iter().map(|l| l.node_id).collect();
		let nodes = self.store.list_nodes()?;
		let assignment = placement::select_nodes_for_write(&nodes, 1, info.size, 1, &exclude)?;
		let target_record = &assignment[0][0];
		let target = target_record.node_addr().map_err(MetaError::Internal)?;

		self.block_client
			.transfer(source, block_id, target)
			.await
			.map_err(MetaError::Internal)?;
		self.store.add_location(block_id, &target_record.id, false)?;

		// The replica set is growing back; suspect rows on dead nodes
		// are dropped now that a fresh copy exists
		for loc in locations.iter().filter(|l| l.suspect) {
			let still_down = match self.store.get_node(&loc.node_id)? {
				Some(n) => n.status != NodeStatus::Active,
				None => true,
			};
			if still_down {
				self.store.remove_location(block_id, &loc.node_id)?;
			}
		}

		info!(
			"Block {:?} re-replicated to {}",
			block_id,
			control::hex_uuid(&target_record.id)
		);
		Ok(())
	}
}

/// Background worker draining the repair queue while this metadata node
/// is the leader
pub struct RepairWorker {
	coordinator: Arc<RepairCoordinator>,
	is_leader: watch::Receiver<bool>,
	last_scan: Option<Instant>,
}

impl RepairWorker {
	pub fn new(coordinator: Arc<RepairCoordinator>, is_leader: watch::Receiver<bool>) -> Self {
		Self {
			coordinator,
			is_leader,
			last_scan: None,
		}
	}
}

#[async_trait]
impl Worker for RepairWorker {
	fn name(&self) -> String {
		"Replication coordinator".into()
	}

	async fn work(&mut self, must_exit: &mut watch::Receiver<bool>) -> Result<WorkerStatus, Error> {
		if !*self.is_leader.borrow() {
			self.last_scan = None;
			return Ok(WorkerStatus::Idle);
		}

		let scan_due = match self.last_scan {
			None => true,
			Some(t) => t.elapsed() > REPAIR_FULL_SCAN_INTERVAL,
		};
		if scan_due {
			let n = self
				.coordinator
				.full_scan_enqueue()
				.map_err(|e| Error::Message(e.to_string()))?;
			if n > 0 {
				info!("Replication scan: {} block(s) need repair", n);
			}
			self.last_scan = Some(Instant::now());
			return Ok(WorkerStatus::Busy);
		}

		match self
			.coordinator
			.repair_iter(must_exit)
			.await
			.map_err(|e| Error::Message(e.to_string()))?
		{
			true => Ok(WorkerStatus::Busy),
			false => Ok(WorkerStatus::Idle),
		}
	}

	async fn wait_for_work(&mut self, _must_exit: &watch::Receiver<bool>) -> WorkerStatus {
		tokio::time::sleep(Duration::from_secs(1)).await;
		WorkerStatus::Busy
	}
}
