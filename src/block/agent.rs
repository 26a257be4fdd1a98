//! Heartbeat and registry agent: registers the storage node with the
//! metadata plane, reports the blocks present on disk, and then posts
//! periodic heartbeats carrying free space and block count
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use silo_rpc::control::*;

use silo_util::background::worker::{Worker, WorkerStatus};
use silo_util::error::*;

use crate::manager::BlockManager;

// Orphan candidates from the block report answer are rechecked by the
// resync loop only after this grace period, leaving uploads in progress
// the time to register their blocks
const ORPHAN_GC_GRACE: Duration = Duration::from_secs(600);

/// Host advertised to the metadata plane, where other nodes and clients
/// dial this node back: the public address when configured, the system
/// hostname otherwise
pub fn advertised_host(rpc_public_addr: &Option<String>) -> String {
	if let Some(addr) = rpc_public_addr {
		if let Ok(sa) = addr.parse::<std::net::SocketAddr>() {
			return sa.ip().to_string();
		}
		if let Some((host, _port)) = addr.rsplit_once(':') {
			return host.to_string();
		}
		return addr.clone();
	}
	gethostname::gethostname()
		.into_string()
		.unwrap_or_else(|_| "localhost".to_string())
}

/// Port advertised to the metadata plane
pub fn advertised_port(rpc_public_addr: &Option<String>, bind_port: u16) -> u16 {
	rpc_public_addr
		.as_ref()
		.and_then(|a| a.parse::<std::net::SocketAddr>().ok())
		.map(|sa| sa.port())
		.unwrap_or(bind_port)
}

pub struct NodeAgent {
	manager: Arc<BlockManager>,
	control: Arc<ControlClient>,

	hostname: String,
	rpc_port: u16,
	interval: Duration,

	registered: bool,
}

impl NodeAgent {
	pub fn new(
		manager: Arc<BlockManager>,
		control: Arc<ControlClient>,
		hostname: String,
		rpc_port: u16,
		heartbeat_interval: Duration,
	) -> Self {
		Self {
			manager,
			control,
			hostname,
			rpc_port,
			interval: heartbeat_interval,
			registered: false,
		}
	}

	/// Register with the metadata plane and send the initial block
	/// report enumerating everything present on local disk
	async fn register_and_report(&self) -> Result<(), Error> {
		let node_id = self.manager.node_id();
		let available = self.manager.store.available_space()?;
		let capacity = self.manager.store.total_space()?;

		self.control
			.register(&RegisterRequest {
				node_id: hex_uuid(&node_id),
				hostname: self.hostname.clone(),
				rpc_port: self.rpc_port,
				storage_capacity: capacity,
				available_space: available,
			})
			.await?;
		info!(
			"Registered storage node {} ({}:{}) with the metadata plane",
			hex::encode(&node_id.as_slice()[..8]),
			self.hostname,
			self.rpc_port
		);

		// Full enumeration of local blocks so the metadata side can
		// reconcile its location records
		let (_, never_exit) = watch::channel(false);
		let store = &self.manager.store;
		let entries = store
			.for_each_block(
				Vec::new(),
				move |mut acc: Vec<BlockReportEntry>, id| async move {
					if let Some((size, checksum)) = store.exists(&id).await? {
						acc.push(BlockReportEntry {
							block_id: hex_uuid(&id),
							size,
							checksum: hex_checksum(&checksum),
						});
					}
					Ok(acc)
				},
				&never_exit,
			)
			.await?;

		let n_blocks = entries.len() as u64;
		let report = BlockReport {
			node_id: hex_uuid(&node_id),
			blocks: entries,
		};
		let resp = self.control.block_report(&report).await?;
		self.manager.set_blocks_stored(n_blocks);
		info!("Block report sent: {} block(s) on disk", n_blocks);

		for orphan in resp.unknown_blocks.iter() {
			let id = parse_uuid(orphan)?;
			debug!(
				"Block {:?} is unknown to the metadata plane, queued for reconciliation",
				id
			);
			self.manager.put_to_resync(&id, ORPHAN_GC_GRACE)?;
		}

		Ok(())
	}

	async fn send_heartbeat(&mut self) -> Result<(), Error> {
		let node_id = self.manager.node_id();
		let req = HeartbeatRequest {
			available_space: self.manager.store.available_space()?,
			blocks_stored: self.manager.blocks_stored(),
		};
		let resp = self.control.heartbeat(&node_id, &req).await?;
		if resp.reregister {
			warn!("Metadata plane has no record of this node, registering again");
			self.registered = false;
		}
		Ok(())
	}
}

#[async_trait]
impl Worker for NodeAgent {
	fn name(&self) -> String {
		"Heartbeat agent".into()
	}

	async fn work(&mut self, _must_exit: &mut watch::Receiver<bool>) -> Result<WorkerStatus, Error> {
		if !self.registered {
			self.register_and_report().await?;
			self.registered = true;
			return Ok(WorkerStatus::Busy);
		}
		self.send_heartbeat().await?;
		Ok(WorkerStatus::Idle)
	}

	async fn wait_for_work(&mut self, _must_exit: &watch::Receiver<bool>) -> WorkerStatus {
		tokio::time::sleep(self.interval).await;
		WorkerStatus::Busy
	}
}
