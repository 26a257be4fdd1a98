//! High-availability controller for the metadata plane: a two-node
//! leader/follower pair with persistent terms, randomized election
//! timeouts and leader pings. Only the leader accepts mutations;
//! followers redirect clients and apply the replicated oplog.
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::select;
use tokio::sync::{watch, Mutex};

use silo_rpc::*;

use silo_util::data::*;
use silo_util::error::*;
use silo_util::persister::Persister;

use crate::schema::MetaOp;
use crate::store::MetadataStore;

/// RPC endpoint path of the metadata peer control channel
pub const META_RPC_PATH: &str = "silo_meta/ha.rs/MetaPeerRpc";

const VOTE_TIMEOUT: Duration = Duration::from_secs(2);
const PING_TIMEOUT: Duration = Duration::from_secs(1);

/// RPC messages exchanged between the two metadata nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MetaPeerRpc {
	Ok,
	RequestVote { term: u64, candidate: Uuid },
	VoteReply { term: u64, granted: bool },
	LeaderPing { term: u64, leader: Uuid },
	PingReply { term: u64 },
	/// Ask the peer how far it has applied the oplog; sync resumes
	/// after that point
	SyncStatusQuery,
	SyncStatus { applied_seq: u64 },
	/// Ordered oplog entries pushed by the leader
	SyncMetadata { entries: Vec<(u64, MetaOp)> },
}

impl Rpc for MetaPeerRpc {
	type Response = Result<MetaPeerRpc, Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaRole {
	Follower,
	Candidate,
	Leader,
}

impl std::fmt::Display for HaRole {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			HaRole::Follower => write!(f, "follower"),
			HaRole::Candidate => write!(f, "candidate"),
			HaRole::Leader => write!(f, "leader"),
		}
	}
}

/// Per-node election state that must survive restarts
#[derive(Debug, Default, Serialize, Deserialize)]
struct TermState {
	current_term: u64,
	/// The candidate this node voted for, per term
	voted_for: Option<(u64, Uuid)>,
}

struct HaInner {
	role: HaRole,
	current_term: u64,
	voted_for: Option<(u64, Uuid)>,
	current_leader: Option<Uuid>,
	last_leader_contact: Instant,
}

pub struct HaController {
	node_id: Uuid,
	peer: Option<NodeAddr>,

	inner: Mutex<HaInner>,
	persist_term: Persister<TermState>,

	set_leader: watch::Sender<bool>,
	leader_watch: watch::Receiver<bool>,

	rpc: RpcHelper,
	endpoint: Arc<Endpoint<MetaPeerRpc, Self>>,
	store: Arc<MetadataStore>,

	election_timeout_min_msec: u64,
	election_timeout_max_msec: u64,
	leader_heartbeat_interval: Duration,
}

impl HaController {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		node_id: Uuid,
		peer: Option<NodeAddr>,
		metadata_dir: &Path,
		store: Arc<MetadataStore>,
		netapp: Arc<NetApp>,
		election_timeout_min_msec: u64,
		election_timeout_max_msec: u64,
		leader_heartbeat_interval_msec: u64,
	) -> Result<Arc<Self>, Error> {
		let persist_term: Persister<TermState> = Persister::new(metadata_dir, "term_state");
		let term_state = match persist_term.load() {
			Ok(s) => s,
			Err(e) => {
				info!("No previous term state stored ({}), starting fresh.", e);
				TermState::default()
			}
		};

		let (set_leader, leader_watch) = watch::channel(false);
		let endpoint = netapp.endpoint(META_RPC_PATH.to_string());

		let controller = Arc::new(Self {
			node_id,
			peer,
			inner: Mutex::new(HaInner {
				role: HaRole::Follower,
				current_term: term_state.current_term,
				voted_for: term_state.voted_for,
				current_leader: None,
				last_leader_contact: Instant::now(),
			}),
			persist_term,
			set_leader,
			leader_watch,
			rpc: RpcHelper::new(node_id, netapp),
			endpoint,
			store,
			election_timeout_min_msec,
			election_timeout_max_msec,
			leader_heartbeat_interval: Duration::from_millis(leader_heartbeat_interval_msec),
		});
		controller.endpoint.set_handler(controller.clone());
		Ok(controller)
	}

	pub fn node_id(&self) -> Uuid {
		self.node_id
	}

	pub fn peer(&self) -> Option<NodeAddr> {
		self.peer
	}

	/// Watch channel that flips when this node gains or loses
	/// leadership
	pub fn leader_watch(&self) -> watch::Receiver<bool> {
		self.leader_watch.clone()
	}

	pub fn is_leader(&self) -> bool {
		*self.leader_watch.borrow()
	}

	/// Current (role, term, known leader), for the status API
	pub async fn status(&self) -> (HaRole, u64, Option<Uuid>) {
		let inner = self.inner.lock().await;
		(inner.role, inner.current_term, inner.current_leader)
	}

	pub(crate) async fn call_peer(
		&self,
		msg: MetaPeerRpc,
		timeout: Duration,
	) -> Result<MetaPeerRpc, Error> {
		let peer = self.peer.ok_or_message("No metadata peer configured")?;
		self.rpc
			.call(
				&self.endpoint,
				peer,
				msg,
				RequestStrategy::with_priority(PRIO_HIGH).with_timeout(timeout),
			)
			.await
	}

	fn set_role(&self, inner: &mut HaInner, role: HaRole) {
		if inner.role != role {
			info!(
				"HA transition: {} -> {} (term {})",
				inner.role, role, inner.current_term
			);
			inner.role = role;
			let _ = self.set_leader.send(role == HaRole::Leader);
		}
	}

	fn persist(&self, inner: &HaInner) {
		let state = TermState {
			current_term: inner.current_term,
			voted_for: inner.voted_for,
		};
		if let Err(e) = self.persist_term.save(&state) {
			error!("Could not persist term state: {}", e);
		}
	}

	fn become_leader(&self, inner: &mut HaInner) {
		inner.current_leader = Some(self.node_id);
		self.set_role(inner, HaRole::Leader);
		// Replicated liveness timestamps may be stale; give every
		// ACTIVE node a fresh grace period before the sweep may evict it
		if let Err(e) = self.store.refresh_heartbeats() {
			error!("Could not refresh storage node liveness: {}", e);
		}
	}

	fn random_election_timeout(&self) -> Duration {
		let ms = rand::thread_rng()
			.gen_range(self.election_timeout_min_msec..=self.election_timeout_max_msec);
		Duration::from_millis(ms)
	}

	// ---- the election driver ----

	pub async fn run(self: Arc<Self>, mut must_exit: watch::Receiver<bool>) {
		if self.peer.is_none() {
			// Single metadata node: immediately authoritative
			let mut inner = self.inner.lock().await;
			info!("No metadata peer configured, assuming leadership");
			self.become_leader(&mut inner);
			drop(inner);
			while !*must_exit.borrow() {
				if must_exit.changed().await.is_err() {
					break;
				}
			}
			return;
		}

		while !*must_exit.borrow() {
			let role = { self.inner.lock().await.role };
			match role {
				HaRole::Follower => self.follower_tick(&mut must_exit).await,
				HaRole::Candidate => self.run_election().await,
				HaRole::Leader => self.leader_tick(&mut must_exit).await,
			}
		}
	}

	async fn follower_tick(&self, must_exit: &mut watch::Receiver<bool>) {
		let timeout = self.random_election_timeout();
		let deadline = { self.inner.lock().await.last_leader_contact } + timeout;

		if deadline > Instant::now() {
			select! {
				_ = tokio::time::sleep_until(deadline.into()) => {},
				_ = must_exit.changed() => return,
			}
		}

		let mut inner = self.inner.lock().await;
		if inner.role == HaRole::Follower && inner.last_leader_contact.elapsed() >= timeout {
			info!(
				"Election timeout after {:?}: no leader heard from",
				timeout
			);
			inner.current_leader = None;
			self.set_role(&mut inner, HaRole::Candidate);
		}
	}

	async fn run_election(&self) {
		let term = {
			let mut inner = self.inner.lock().await;
			inner.current_term += 1;
			inner.voted_for = Some((inner.current_term, self.node_id));
			inner.current_leader = None;
			self.persist(&inner);
			inner.current_term
		};
		info!("Starting election for term {}", term);

		let resp = self
			.call_peer(
				MetaPeerRpc::RequestVote {
					term,
					candidate: self.node_id,
				},
				VOTE_TIMEOUT,
			)
			.await;

		let mut inner = self.inner.lock().await;
		if inner.current_term != term || inner.role != HaRole::Candidate {
			// A higher-term message arrived while we were waiting
			return;
		}

		match resp {
			Ok(MetaPeerRpc::VoteReply {
				term: peer_term,
				granted,
			}) => {
				if peer_term > term {
					inner.current_term = peer_term;
					self.persist(&inner);
					self.set_role(&mut inner, HaRole::Follower);
					inner.last_leader_contact = Instant::now();
				} else if granted {
					info!("Vote granted by peer, becoming leader for term {}", term);
					self.become_leader(&mut inner);
				} else {
					// The peer already voted this term: stand down and
					// let a fresh randomized timeout decide
					self.set_role(&mut inner, HaRole::Follower);
					inner.last_leader_contact = Instant::now();
				}
			}
			Ok(m) => {
				warn!("Unexpected reply to RequestVote: {:?}", m);
				self.set_role(&mut inner, HaRole::Follower);
				inner.last_leader_contact = Instant::now();
			}
			Err(e) => {
				// Two-node cluster: a candidate whose peer is down wins
				// uncontested, so the surviving node keeps accepting
				// writes
				info!(
					"Peer unreachable during election ({}), assuming leadership of term {}",
					e, term
				);
				self.become_leader(&mut inner);
			}
		}
	}

	async fn leader_tick(&self, must_exit: &mut watch::Receiver<bool>) {
		let restart_at = Instant::now() + self.leader_heartbeat_interval;
		let term = { self.inner.lock().await.current_term };

		match self
			.call_peer(
				MetaPeerRpc::LeaderPing {
					term,
					leader: self.node_id,
				},
				PING_TIMEOUT,
			)
			.await
		{
			Ok(MetaPeerRpc::PingReply { term: peer_term }) if peer_term > term => {
				let mut inner = self.inner.lock().await;
				if peer_term > inner.current_term {
					info!(
						"Peer answered with a higher term ({} > {}), stepping down",
						peer_term, inner.current_term
					);
					inner.current_term = peer_term;
					self.persist(&inner);
					inner.current_leader = None;
					self.set_role(&mut inner, HaRole::Follower);
					inner.last_leader_contact = Instant::now();
				}
			}
			Ok(_) => {}
			Err(e) => {
				debug!("Peer did not answer leader ping: {}", e);
			}
		}

		select! {
			_ = tokio::time::sleep_until(restart_at.into()) => {},
			_ = must_exit.changed() => {},
		}
	}

	// ---- RPC handlers ----

	async fn handle_request_vote(&self, term: u64, candidate: Uuid) -> Result<MetaPeerRpc, Error> {
		let mut inner = self.inner.lock().await;
		if term > inner.current_term {
			inner.current_term = term;
			inner.current_leader = None;
			self.set_role(&mut inner, HaRole::Follower);
		}
		let granted = if term < inner.current_term {
			false
		} else {
			match inner.voted_for {
				Some((t, c)) if t == term => c == candidate,
				_ => {
					inner.voted_for = Some((term, candidate));
					true
				}
			}
		};
		if granted {
			// Granting a vote also resets the election timer
			inner.last_leader_contact = Instant::now();
		}
		self.persist(&inner);
		debug!(
			"RequestVote(term {}, candidate {:?}): granted={}",
			term, candidate, granted
		);
		Ok(MetaPeerRpc::VoteReply {
			term: inner.current_term,
			granted,
		})
	}

	async fn handle_leader_ping(&self, term: u64, leader: Uuid) -> Result<MetaPeerRpc, Error> {
		let mut inner = self.inner.lock().await;
		let yield_to_peer = if term > inner.current_term {
			true
		} else if term < inner.current_term {
			false
		} else if inner.role == HaRole::Leader {
			// Same-term double leadership (both nodes claimed an
			// uncontested election): the higher node id wins
			leader > self.node_id
		} else {
			true
		};
		if yield_to_peer {
			if term > inner.current_term {
				inner.current_term = term;
				self.persist(&inner);
			}
			self.set_role(&mut inner, HaRole::Follower);
			inner.current_leader = Some(leader);
			inner.last_leader_contact = Instant::now();
		}
		Ok(MetaPeerRpc::PingReply {
			term: inner.current_term,
		})
	}

	async fn handle_sync(&self, entries: &[(u64, MetaOp)]) -> Result<MetaPeerRpc, Error> {
		{
			let inner = self.inner.lock().await;
			if inner.role == HaRole::Leader {
				return Err(Error::Message(
					"Cannot apply metadata sync: this node is the leader".into(),
				));
			}
		}
		let applied = self
			.store
			.apply_synced(entries)
			.map_err(|e| Error::Message(e.to_string()))?;
		Ok(MetaPeerRpc::SyncStatus {
			applied_seq: applied,
		})
	}
}

#[async_trait]
impl EndpointHandler<MetaPeerRpc> for HaController {
	async fn handle(
		self: &Arc<Self>,
		msg: &MetaPeerRpc,
		_from: NodeID,
	) -> Result<MetaPeerRpc, Error> {
		match msg {
			MetaPeerRpc::RequestVote { term, candidate } => {
				self.handle_request_vote(*term, *candidate).await
			}
			MetaPeerRpc::LeaderPing { term, leader } => {
				self.handle_leader_ping(*term, *leader).await
			}
			MetaPeerRpc::SyncStatusQuery => Ok(MetaPeerRpc::SyncStatus {
				applied_seq: self
					.store
					.applied_seq()
					.map_err(|e| Error::Message(e.to_string()))?,
			}),
			MetaPeerRpc::SyncMetadata { entries } => self.handle_sync(entries).await,
			m => Err(Error::unexpected_rpc_message(m)),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use silo_db::sled_adapter::{sled, SledDb};

	fn test_controller(peer: Option<NodeAddr>) -> (mktemp::Temp, Arc<HaController>) {
		let dir = mktemp::Temp::new_dir().unwrap();
		let mut db_path = dir.to_path_buf();
		db_path.push("db");
		let db = SledDb::init(sled::open(db_path).unwrap());
		let store = MetadataStore::new(db).unwrap();

		let (_, node_key) = sodiumoxide::crypto::sign::ed25519::gen_keypair();
		let netapp = NetApp::new(0x7465737400000001, NetworkKey::from_slice(&[0u8; 32]).unwrap(), node_key);
		let node_id: Uuid = netapp.id.into();

		let controller = HaController::new(
			node_id,
			peer,
			&dir.to_path_buf(),
			store,
			netapp,
			1000,
			2000,
			300,
		)
		.unwrap();
		(dir, controller)
	}

	fn fake_peer_id(byte: u8) -> Uuid {
		[byte; 32].into()
	}

	#[tokio::test]
	async fn test_vote_granted_once_per_term() {
		let (_dir, ctrl) = test_controller(None);
		let a = fake_peer_id(1);
		let b = fake_peer_id(2);

		let from: NodeID = a.into();
		let resp = EndpointHandler::handle(
			&ctrl,
			&MetaPeerRpc::RequestVote {
				term: 3,
				candidate: a,
			},
			from,
		)
		.await
		.unwrap();
		assert!(matches!(
			resp,
			MetaPeerRpc::VoteReply {
				term: 3,
				granted: true
			}
		));

		// Same term, same candidate: still granted
		let resp = EndpointHandler::handle(
			&ctrl,
			&MetaPeerRpc::RequestVote {
				term: 3,
				candidate: a,
			},
			from,
		)
		.await
		.unwrap();
		assert!(matches!(resp, MetaPeerRpc::VoteReply { granted: true, .. }));

		// Same term, other candidate: refused
		let resp = EndpointHandler::handle(
			&ctrl,
			&MetaPeerRpc::RequestVote {
				term: 3,
				candidate: b,
			},
			from,
		)
		.await
		.unwrap();
		assert!(matches!(resp, MetaPeerRpc::VoteReply { granted: false, .. }));

		// Stale term: refused, current term reported back
		let resp = EndpointHandler::handle(
			&ctrl,
			&MetaPeerRpc::RequestVote {
				term: 1,
				candidate: b,
			},
			from,
		)
		.await
		.unwrap();
		assert!(matches!(
			resp,
			MetaPeerRpc::VoteReply {
				term: 3,
				granted: false
			}
		));
	}

	#[tokio::test]
	async fn test_leader_ping_adopts_leader() {
		let (_dir, ctrl) = test_controller(None);
		let leader = fake_peer_id(7);
		let from: NodeID = leader.into();

		let resp = EndpointHandler::handle(
			&ctrl,
			&MetaPeerRpc::LeaderPing { term: 5, leader },
			from,
		)
		.await
		.unwrap();
		assert!(matches!(resp, MetaPeerRpc::PingReply { term: 5 }));

		let (role, term, known_leader) = ctrl.status().await;
		assert_eq!(role, HaRole::Follower);
		assert_eq!(term, 5);
		assert_eq!(known_leader, Some(leader));
	}
}
