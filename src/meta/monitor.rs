//! Staleness sweep: storage nodes that miss too many heartbeats are
//! transitioned to INACTIVE and their replicas become suspect
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use silo_rpc::control;

use silo_util::background::worker::{Worker, WorkerStatus};
use silo_util::error::Error;
use silo_util::time::*;

use crate::repair::{RepairCoordinator, RepairReason};
use crate::store::MetadataStore;

pub struct NodeMonitorWorker {
	store: Arc<MetadataStore>,
	repair: Arc<RepairCoordinator>,
	is_leader: watch::Receiver<bool>,

	interval: Duration,
	/// A node with no heartbeat for this long is INACTIVE
	liveness_timeout_msec: u64,
}

impl NodeMonitorWorker {
	pub fn new(
		store: Arc<MetadataStore>,
		repair: Arc<RepairCoordinator>,
		is_leader: watch::Receiver<bool>,
		heartbeat_interval: u64,
		miss_threshold: u64,
	) -> Self {
		Self {
			store,
			repair,
			is_leader,
			interval: Duration::from_secs(heartbeat_interval),
			liveness_timeout_msec: heartbeat_interval * miss_threshold * 1000,
		}
	}

	fn sweep(&self) -> Result<(), Error> {
		let now = now_msec();
		for node in self
			.store
			.list_nodes()
			.map_err(|e| Error::Message(e.to_string()))?
		{
			if node.status != control::NodeStatus::Active {
				continue;
			}
			if now.saturating_sub(node.last_heartbeat_msec) <= self.liveness_timeout_msec {
				continue;
			}

			warn!(
				"Storage node {} ({}:{}) missed its heartbeats, marking INACTIVE",
				control::hex_uuid(&node.id),
				node.hostname,
				node.rpc_port
			);
			let affected = self
				.store
				.mark_node_inactive(&node.id)
				.map_err(|e| Error::Message(e.to_string()))?;

			info!(
				"{} block(s) lost a replica on {}, queued for repair",
				affected.len(),
				control::hex_uuid(&node.id)
			);
			for block_id in affected {
				self.repair
					.enqueue(&block_id, RepairReason::SuspectLocation, Duration::from_secs(0))
					.map_err(|e| Error::Message(e.to_string()))?;
			}
		}
		Ok(())
	}
}

#[async_trait]
impl Worker for NodeMonitorWorker {
	fn name(&self) -> String {
		"Storage node monitor".into()
	}

	async fn work(&mut self, _must_exit: &mut watch::Receiver<bool>) -> Result<WorkerStatus, Error> {
		if *self.is_leader.borrow() {
			self.sweep()?;
		}
		Ok(WorkerStatus::Idle)
	}

	async fn wait_for_work(&mut self, _must_exit: &watch::Receiver<bool>) -> WorkerStatus {
		tokio::time::sleep(self.interval).await;
		WorkerStatus::Busy
	}
}
