//! Leader-side metadata sync: pushes pending oplog entries to the
//! follower, in order, resuming from the follower's applied point after
//! a reconnection
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{select, FutureExt};
use tokio::sync::watch;

use silo_util::background::worker::{Worker, WorkerStatus};
use silo_util::error::*;

use crate::ha::{HaController, MetaPeerRpc};
use crate::store::MetadataStore;

const SYNC_TIMEOUT: Duration = Duration::from_secs(10);
const SYNC_BATCH: usize = 256;

pub struct MetaSyncWorker {
	ha: Arc<HaController>,
	store: Arc<MetadataStore>,
	is_leader: watch::Receiver<bool>,

	/// Highest oplog sequence the follower has confirmed; None when it
	/// must be asked again (startup, after an error)
	acked: Option<u64>,
}

impl MetaSyncWorker {
	pub fn new(ha: Arc<HaController>, store: Arc<MetadataStore>) -> Self {
		let is_leader = ha.leader_watch();
		Self {
			ha,
			store,
			is_leader,
			acked: None,
		}
	}

	async fn sync_step(&mut self) -> Result<WorkerStatus, Error> {
		let acked = match self.acked {
			Some(a) => a,
			None => {
				let resp = self
					.ha
					.call_peer(MetaPeerRpc::SyncStatusQuery, SYNC_TIMEOUT)
					.await?;
				match resp {
					MetaPeerRpc::SyncStatus { applied_seq } => {
						debug!("Follower reports applied oplog seq {}", applied_seq);
						self.acked = Some(applied_seq);
						applied_seq
					}
					m => return Err(Error::unexpected_rpc_message(m)),
				}
			}
		};

		let head = self
			.store
			.oplog_head()
			.map_err(|e| Error::Message(e.to_string()))?;
		if acked > head {
			warn!(
				"Follower is ahead of the local oplog ({} > {}); its history diverged around a failover",
				acked, head
			);
			return Ok(WorkerStatus::Idle);
		}
		let entries = self
			.store
			.read_oplog_after(acked, SYNC_BATCH)
			.map_err(|e| Error::Message(e.to_string()))?;
		if entries.is_empty() {
			return Ok(WorkerStatus::Idle);
		}

		let n = entries.len();
		let resp = self
			.ha
			.call_peer(MetaPeerRpc::SyncMetadata { entries }, SYNC_TIMEOUT)
			.await?;
		match resp {
			MetaPeerRpc::SyncStatus { applied_seq } => {
				trace!("Synced {} op(s), follower now at seq {}", n, applied_seq);
				self.acked = Some(applied_seq);
				Ok(WorkerStatus::Busy)
			}
			m => Err(Error::unexpected_rpc_message(m)),
		}
	}
}

#[async_trait]
impl Worker for MetaSyncWorker {
	fn name(&self) -> String {
		"Metadata sync".into()
	}

	async fn work(&mut self, _must_exit: &mut watch::Receiver<bool>) -> Result<WorkerStatus, Error> {
		if self.ha.peer().is_none() || !*self.is_leader.borrow() {
			self.acked = None;
			return Ok(WorkerStatus::Idle);
		}
		match self.sync_step().await {
			Ok(s) => Ok(s),
			Err(e) => {
				// Ask for the follower's position again once it is back
				self.acked = None;
				Err(e)
			}
		}
	}

	async fn wait_for_work(&mut self, _must_exit: &watch::Receiver<bool>) -> WorkerStatus {
		select! {
			_ = tokio::time::sleep(Duration::from_secs(1)).fuse() => {},
			_ = self.store.oplog_notify.notified().fuse() => {},
		}
		WorkerStatus::Busy
	}
}
