use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use silo_api::ApiServer;

use silo_block::agent::{advertised_host, advertised_port, NodeAgent};
use silo_block::manager::{BlockManager, ResyncWorker};
use silo_block::store::BlockStore;

use silo_db::sled_adapter::{sled, SledDb};

use silo_meta::node::MetaNode;

use silo_rpc::control::ControlClient;
use silo_rpc::netkey::{gen_node_key, SILO_VERSION_TAG};
use silo_rpc::{NetApp, NetworkKey};

use silo_util::background::BackgroundRunner;
use silo_util::config::{read_config, Config, NodeRole};
use silo_util::data::Uuid;
use silo_util::error::*;

// Slack left under the RPC message cap for the frame envelope
const FRAME_OVERHEAD: usize = 16 * 1024;

async fn wait_from(mut chan: watch::Receiver<bool>) {
	while !*chan.borrow() {
		if chan.changed().await.is_err() {
			return;
		}
	}
}

pub async fn run_server(config_file: PathBuf) -> Result<(), Error> {
	info!("Loading configuration...");
	let config = read_config(config_file)?;

	match config.role {
		NodeRole::Metadata => run_metadata_server(config).await,
		NodeRole::Storage => run_storage_server(config).await,
	}
}

async fn run_metadata_server(config: Config) -> Result<(), Error> {
	let api_bind_addr = config
		.api_bind_addr
		.ok_or_message("api_bind_addr is required for the metadata role")?;

	info!("Initializing metadata node...");
	let node = MetaNode::new(config)?;

	info!("Initializing background runner...");
	let watch_cancel = watch_shutdown_signal();
	let (background, await_background_done) = BackgroundRunner::new(8, watch_cancel.clone());

	info!("Spawning metadata workers...");
	node.spawn_workers(&background);

	info!("Launching internal cluster communications...");
	let run_system = tokio::spawn(node.clone().run_system(watch_cancel.clone()));

	info!("Launching control plane API server...");
	let api_server = tokio::spawn(ApiServer::run(
		node.clone(),
		api_bind_addr,
		wait_from(watch_cancel.clone()),
	));

	if let Err(e) = api_server.await? {
		error!("API server exited with error: {}", e);
	} else {
		info!("API server exited without error.");
	}

	// Remove RPC handlers to break reference cycles
	node.netapp.drop_all_handlers();

	// Await for the netapp RPC system to end
	run_system.await?;
	info!("Netapp exited");

	// Drop all references so that background tasks can terminate
	drop(node);
	drop(background);

	await_background_done.await?;

	info!("Cleaning up...");
	Ok(())
}

async fn run_storage_server(config: Config) -> Result<(), Error> {
	std::fs::create_dir_all(&config.metadata_dir)?;
	std::fs::create_dir_all(&config.data_dir)?;

	info!("Opening local database...");
	let mut db_path = config.metadata_dir.clone();
	db_path.push("db");
	let sled_db = sled::Config::default()
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
		"Node ID of this storage node: {}",
		hex::encode(&node_id.as_slice()[..8])
	);

	info!("Initialize block store...");
	let store = BlockStore::new(config.data_dir.clone())?;
	let control = Arc::new(ControlClient::new(config.metadata_addrs.clone())?);

	let chunk_size = config
		.rpc_max_message_bytes
		.saturating_sub(FRAME_OVERHEAD)
		.max(4096);
	let manager = BlockManager::new(
		&db,
		store,
		node_id,
		config.replication_factor,
		config.block_size,
		chunk_size,
		config.compression_level,
		netapp.clone(),
		control.clone(),
	)?;

	info!("Initializing background runner...");
	let watch_cancel = watch_shutdown_signal();
	let (background, await_background_done) = BackgroundRunner::new(4, watch_cancel.clone());

	info!("Spawning storage node workers...");
	let host = advertised_host(&config.rpc_public_addr);
	let port = advertised_port(&config.rpc_public_addr, config.rpc_bind_addr.port());
	background.spawn_worker(NodeAgent::new(
		manager.clone(),
		control,
		host,
		port,
		Duration::from_secs(config.heartbeat_interval),
	));
	background.spawn_worker(ResyncWorker::new(manager.clone()));

	info!("Serving block RPC on {}", config.rpc_bind_addr);
	netapp
		.clone()
		.listen(config.rpc_bind_addr, None, watch_cancel.clone())
		.await;

	netapp.drop_all_handlers();
	info!("Netapp exited");

	drop(manager);
	drop(background);

	await_background_done.await?;

	info!("Cleaning up...");
	Ok(())
}

#[cfg(unix)]
fn watch_shutdown_signal() -> watch::Receiver<bool> {
	use tokio::signal::unix::*;

	let (send_cancel, watch_cancel) = watch::channel(false);
	tokio::spawn(async move {
		let mut sigint = signal(SignalKind::interrupt()).expect("Failed to install SIGINT handler");
		let mut sigterm =
			signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");
		let mut sighup = signal(SignalKind::hangup()).expect("Failed to install SIGHUP handler");
		tokio::select! {
			_ = sigint.recv() => info!("Received SIGINT, shutting down."),
			_ = sigterm.recv() => info!("Received SIGTERM, shutting down."),
			_ = sighup.recv() => info!("Received SIGHUP, shutting down."),
		}
		send_cancel.send(true).unwrap();
	});
	watch_cancel
}
