//! Composition root of a metadata node
use std::sync::Arc;

use futures::join;
use tokio::sync::watch;

use silo_db as db;
use silo_db::sled_adapter::SledDb;

use silo_rpc::control;
use silo_rpc::netkey::{gen_node_key, SILO_VERSION_TAG};
use silo_rpc::*;

use silo_util::background::BackgroundRunner;
use silo_util::config::Config;
use silo_util::data::*;
use silo_util::error::*;

use crate::error::MetaError;
use crate::ha::HaController;
use crate::monitor::NodeMonitorWorker;
use crate::placement;
use crate::repair::{BlockClient, RepairCoordinator, RepairWorker};
use crate::schema::*;
use crate::store::MetadataStore;
use crate::sync::MetaSyncWorker;

/// An entire metadata node: record store, namespace manager, HA
/// controller and replication coordinator
pub struct MetaNode {
	pub config: Config,
	pub db: db::Db,
	pub store: Arc<MetadataStore>,
	pub ha: Arc<HaController>,
	pub repair: Arc<RepairCoordinator>,
	pub netapp: Arc<NetApp>,
	pub node_id: Uuid,

	block_client: Arc<BlockClient>,
}

impl MetaNode {
	pub fn new(config: Config) -> Result<Arc<Self>, Error> {
		std::fs::create_dir_all(&config.metadata_dir)?;

		info!("Opening database...");
		let mut db_path = config.metadata_dir.clone();
		db_path.push("db");
		let sled_db = db::sled_adapter::sled::Config::default()
			.path(&db_path)
			.cache_capacity(config.sled_cache_capacity)
			.flush_every_ms(Some(config.sled_flush_every_ms))
			.open()
			.ok_or_message("Unable to open sled DB")?;
		let db = SledDb::init(sled_db);

		let network_key = hex::decode(&config.rpc_secret)
			.ok()
			.and_then(|x| NetworkKey::from_slice(&x))
			.ok_or_message("Invalid RPC secret key")?;
		let node_key = gen_node_key(&config.metadata_dir)?;
		let netapp = NetApp::new(SILO_VERSION_TAG, network_key, node_key);
		let node_id: Uuid = netapp.id.into();
		info!(
			"Node ID of this metadata node: {}",
			hex::encode(&node_id.as_slice()[..8])
		);

		let store =
			MetadataStore::new(db.clone()).map_err(|e| Error::Message(e.to_string()))?;

		let peer = match &config.peer_endpoint {
			Some(p) => {
				let (pubkey, addrs) = parse_and_resolve_peer_addr(p).ok_or_message(format!(
					"Unable to parse or resolve peer endpoint: {}",
					p
				))?;
				Some(NodeAddr::new(pubkey.into(), addrs[0]))
			}
			None => None,
		};

		info!("Initialize HA controller...");
		let ha = HaController::new(
			node_id,
			peer,
			&config.metadata_dir,
			store.clone(),
			netapp.clone(),
			config.election_timeout_min_msec,
			config.election_timeout_max_msec,
			config.leader_heartbeat_interval_msec,
		)?;

		info!("Initialize replication coordinator...");
		let block_client = Arc::new(BlockClient::new(node_id, netapp.clone()));
		let repair = RepairCoordinator::new(
			&db,
			store.clone(),
			block_client.clone(),
			config.replication_factor,
		)
		.map_err(|e| Error::Message(e.to_string()))?;

		Ok(Arc::new(Self {
			config,
			db,
			store,
			ha,
			repair,
			netapp,
			node_id,
			block_client,
		}))
	}

	pub fn spawn_workers(self: &Arc<Self>, bg: &BackgroundRunner) {
		bg.spawn_worker(NodeMonitorWorker::new(
			self.store.clone(),
			self.repair.clone(),
			self.ha.leader_watch(),
			self.config.heartbeat_interval,
			self.config.heartbeat_miss_threshold,
		));
		bg.spawn_worker(RepairWorker::new(self.repair.clone(), self.ha.leader_watch()));
		bg.spawn_worker(MetaSyncWorker::new(self.ha.clone(), self.store.clone()));
	}

	/// Run the netapp listener and the election driver until shutdown
	pub async fn run_system(self: Arc<Self>, must_exit: watch::Receiver<bool>) {
		join!(
			self.netapp
				.clone()
				.listen(self.config.rpc_bind_addr, None, must_exit.clone()),
			self.ha.clone().run(must_exit.clone()),
		);
	}

	/// Placement policy applied to the current node registry
	pub fn select_placement(
		&self,
		num_blocks: usize,
		block_size: u64,
		exclude: &[Uuid],
	) -> Result<Vec<Vec<NodeRecord>>, MetaError> {
		let nodes = self.store.list_nodes()?;
		placement::select_nodes_for_write(
			&nodes,
			num_blocks,
			block_size,
			self.config.replication_factor,
			exclude,
		)
	}

	/// Fire-and-forget physical deletion of block replicas, after the
	/// metadata rows are already gone
	pub fn delete_replicas_best_effort(
		self: &Arc<Self>,
		doomed: Vec<(BlockInfo, Vec<BlockLocation>)>,
	) {
		if doomed.is_empty() {
			return;
		}
		let this = self.clone();
		tokio::spawn(async move {
			for (block, locs) in doomed {
				for loc in locs {
					let node = match this.store.get_node(&loc.node_id) {
						Ok(Some(n)) => n,
						_ => continue,
					};
					let addr = match node.node_addr() {
						Ok(a) => a,
						Err(_) => continue,
					};
					if let Err(e) = this.block_client.delete(addr, &block.id).await {
						debug!(
							"Could not delete replica of block {:?} on {}: {}",
							block.id,
							control::hex_uuid(&loc.node_id),
							e
						);
					}
				}
			}
		});
	}

	/// Aggregate cluster health, served as `GET /status`
	pub async fn status_summary(&self) -> Result<control::StatusSummary, MetaError> {
		let (_, term, leader) = self.ha.status().await;
		let nodes = self
			.store
			.list_nodes()?
			.iter()
			.map(|n| n.summary())
			.collect();
		let under = self
			.store
			.scan_under_replicated(self.config.replication_factor)?;
		let fatal = under
			.iter()
			.filter(|(_, healthy)| *healthy == 0)
			.map(|(b, _)| control::hex_uuid(b))
			.collect();
		let degraded = self
			.repair
			.degraded_blocks()?
			.iter()
			.map(control::hex_uuid)
			.collect();
		Ok(control::StatusSummary {
			leader_id: leader.map(|l| control::hex_uuid(&l)).unwrap_or_default(),
			term,
			nodes,
			files: self.store.count_files() as u64,
			blocks: self.store.count_blocks() as u64,
			under_replicated: under.len() as u64,
			degraded,
			fatal,
		})
	}
}
