//! Deadline-bound RPC calls over netapp, with on-demand dialing and
//! quorum-accounted fan-out
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use netapp::endpoint::{Endpoint, StreamingEndpointHandler};
use netapp::message::{Message as Rpc, RequestPriority};
use netapp::{NetApp, NodeID};

use silo_util::data::*;
use silo_util::error::Error;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// A node the RPC layer can talk to: its identity plus the socket
/// address where its netapp endpoint listens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAddr {
	pub id: Uuid,
	pub addr: SocketAddr,
}

impl NodeAddr {
	pub fn new(id: Uuid, addr: SocketAddr) -> Self {
		Self { id, addr }
	}
}

impl std::fmt::Display for NodeAddr {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}@{}", hex::encode(&self.id.as_slice()[..8]), self.addr)
	}
}

/// Strategy to apply when making RPC
#[derive(Copy, Clone)]
pub struct RequestStrategy {
	/// Max time to wait for response
	rs_timeout: Duration,
	/// Min number of responses to consider the request successful
	rs_quorum: Option<usize>,
	/// Should requests be dropped after enough response are received
	rs_interrupt_after_quorum: bool,
	/// Request priority
	rs_priority: RequestPriority,
}

impl RequestStrategy {
	/// Create a RequestStrategy with default timeout and not interrupting when quorum reached
	pub fn with_priority(prio: RequestPriority) -> Self {
		RequestStrategy {
			rs_timeout: DEFAULT_TIMEOUT,
			rs_quorum: None,
			rs_interrupt_after_quorum: false,
			rs_priority: prio,
		}
	}
	/// Set quorum to be reached for request
	pub fn with_quorum(mut self, quorum: usize) -> Self {
		self.rs_quorum = Some(quorum);
		self
	}
	/// Set timeout of the strategy
	pub fn with_timeout(mut self, timeout: Duration) -> Self {
		self.rs_timeout = timeout;
		self
	}
	/// Set if requests can be dropped after quorum has been reached
	/// In general true for read requests, and false for write
	pub fn interrupt_after_quorum(mut self, interrupt: bool) -> Self {
		self.rs_interrupt_after_quorum = interrupt;
		self
	}
}

#[derive(Clone)]
pub struct RpcHelper(Arc<RpcHelperInner>);

struct RpcHelperInner {
	our_node_id: Uuid,
	netapp: Arc<NetApp>,
	// Peers we have dialed already; a peer is forgotten when a call to
	// it fails, so that the next call dials again
	dialed: Mutex<HashSet<Uuid>>,
}

impl RpcHelper {
	pub fn new(our_node_id: Uuid, netapp: Arc<NetApp>) -> Self {
		Self(Arc::new(RpcHelperInner {
			our_node_id,
			netapp,
			dialed: Mutex::new(HashSet::new()),
		}))
	}

	pub fn our_node_id(&self) -> Uuid {
		self.0.our_node_id
	}

	pub fn netapp(&self) -> &Arc<NetApp> {
		&self.0.netapp
	}

	async fn ensure_connected(&self, to: &NodeAddr) -> Result<(), Error> {
		if to.id == self.0.our_node_id {
			return Ok(());
		}
		let mut dialed = self.0.dialed.lock().await;
		if dialed.contains(&to.id) {
			return Ok(());
		}
		self.0
			.netapp
			.clone()
			.try_connect(to.addr, to.id.into())
			.await?;
		dialed.insert(to.id);
		Ok(())
	}

	async fn forget_peer(&self, to: &NodeAddr) {
		self.0.dialed.lock().await.remove(&to.id);
	}

	/// Make a single RPC call to a node, with a deadline
	pub async fn call<M, H, S>(
		&self,
		endpoint: &Endpoint<M, H>,
		to: NodeAddr,
		msg: M,
		strat: RequestStrategy,
	) -> Result<S, Error>
	where
		M: Rpc<Response = Result<S, Error>>,
		H: StreamingEndpointHandler<M>,
	{
		self.ensure_connected(&to).await?;

		let node_id: NodeID = to.id.into();
		match tokio::time::timeout(strat.rs_timeout, endpoint.call(&node_id, msg, strat.rs_priority))
			.await
		{
			Err(_) => {
				self.forget_peer(&to).await;
				Err(Error::Timeout)
			}
			Ok(Err(e)) => {
				self.forget_peer(&to).await;
				Err(e.into())
			}
			Ok(Ok(resp)) => {
				trace!("RPC to {} succeeded", to);
				resp
			}
		}
	}

	/// Make a RPC call to multiple servers, returning either a Vec of
	/// responses, or an error if quorum could not be met because of too
	/// many errors
	pub async fn try_call_many<M, H, S>(
		&self,
		endpoint: &Arc<Endpoint<M, H>>,
		to: &[NodeAddr],
		msg: M,
		strategy: RequestStrategy,
	) -> Result<Vec<S>, Error>
	where
		M: Rpc<Response = Result<S, Error>> + Clone,
		H: StreamingEndpointHandler<M>,
	{
		let quorum = strategy.rs_quorum.unwrap_or(to.len());

		let mut requests = to
			.iter()
			.cloned()
			.map(|node| {
				let msg = msg.clone();
				async move { self.call(endpoint, node, msg, strategy).await }
			})
			.collect::<FuturesUnordered<_>>();

		let mut successes = vec![];
		let mut errors = vec![];

		while let Some(resp) = requests.next().await {
			match resp {
				Ok(v) => {
					successes.push(v);
					if successes.len() >= quorum && strategy.rs_interrupt_after_quorum {
						break;
					}
				}
				Err(e) => errors.push(e),
			}
		}

		if successes.len() >= quorum {
			Ok(successes)
		} else {
			let errors = errors.iter().map(|e| format!("{}", e)).collect::<Vec<_>>();
			Err(Error::Quorum(quorum, successes.len(), to.len(), errors))
		}
	}
}
