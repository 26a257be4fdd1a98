//! Wire types of the metadata control plane (HTTP+JSON), and the client
//! used by storage nodes and file clients to reach the metadata leader.
//!
//! The client walks a static list of metadata endpoints: requests are sent
//! to the last endpoint known to answer, connection failures and 503s move
//! on to the next one, and 307 redirects (follower answering a mutation)
//! are followed and remembered.
use std::convert::TryInto;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use silo_util::data::*;
use silo_util::error::*;

use crate::rpc_helper::NodeAddr;

const CONTROL_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// ---- identifiers on the JSON plane are hex strings ----

pub fn hex_uuid(uuid: &Uuid) -> String {
	hex::encode(uuid.as_slice())
}

pub fn parse_uuid(s: &str) -> Result<Uuid, Error> {
	let bytes = hex::decode(s).ok_or_message("Invalid hex identifier")?;
	let id: Uuid = bytes[..]
		.try_into()
		.ok_or_message("Invalid identifier length")?;
	Ok(id)
}

pub fn hex_checksum(checksum: &Checksum) -> String {
	hex::encode(checksum.as_slice())
}

pub fn parse_checksum(s: &str) -> Result<Checksum, Error> {
	parse_uuid(s)
}

/// Percent-encode one path segment of a control-plane URL (`/` becomes `%2F`)
pub fn encode_path_param(s: &str) -> String {
	utf8_percent_encode(s, NON_ALPHANUMERIC).to_string()
}

// ---- storage node lifecycle ----

/// Status of a storage node, as tracked by the metadata plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NodeStatus {
	Active,
	Inactive,
	Decommissioned,
	Maintenance,
}

impl std::fmt::Display for NodeStatus {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			NodeStatus::Active => write!(f, "ACTIVE"),
			NodeStatus::Inactive => write!(f, "INACTIVE"),
			NodeStatus::Decommissioned => write!(f, "DECOMMISSIONED"),
			NodeStatus::Maintenance => write!(f, "MAINTENANCE"),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
	/// The node's persistent identity (hex of its netapp public key)
	pub node_id: String,
	pub hostname: String,
	pub rpc_port: u16,
	pub storage_capacity: u64,
	pub available_space: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
	pub node_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
	pub available_space: u64,
	pub blocks_stored: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
	/// Set when the metadata side has no record of the node: the agent
	/// must go through registration and a full block report again
	pub reregister: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSummary {
	pub id: String,
	pub hostname: String,
	pub rpc_port: u16,
	pub storage_capacity: u64,
	pub available_space: u64,
	pub status: NodeStatus,
	pub last_heartbeat_msec: u64,
	pub blocks_stored: u64,
}

impl NodeSummary {
	/// Resolve this node's data-plane address
	pub fn node_addr(&self) -> Result<NodeAddr, Error> {
		let id = parse_uuid(&self.id)?;
		let addr: SocketAddr = (self.hostname.as_str(), self.rpc_port)
			.to_socket_addrs()?
			.next()
			.ok_or_message(format!(
				"Could not resolve storage node address {}:{}",
				self.hostname, self.rpc_port
			))?;
		Ok(NodeAddr::new(id, addr))
	}
}

// ---- namespace records ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FileStatus {
	Uploading,
	Complete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
	pub id: String,
	pub path: String,
	pub owner: String,
	pub size: u64,
	pub status: FileStatus,
	pub created_msec: u64,
	pub modified_msec: u64,
	/// Block ids in byte-offset order
	pub blocks: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirRecord {
	pub path: String,
	pub owner: String,
	pub created_msec: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
	File,
	Directory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListEntry {
	pub name: String,
	pub kind: EntryKind,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub size: Option<u64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirListing {
	pub directory: DirRecord,
	pub entries: Vec<ListEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateFileRequest {
	pub path: String,
	pub owner: String,
	pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MkdirRequest {
	pub path: String,
	pub owner: String,
}

// ---- block records ----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterBlockRequest {
	pub block_id: String,
	pub file_id: String,
	/// Position of the block in the file's block sequence
	pub seq: u32,
	pub size: u64,
	pub checksum: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddLocationRequest {
	pub node_id: String,
	pub is_leader: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationRecord {
	pub node: NodeSummary,
	pub is_leader: bool,
	pub suspect: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockRecord {
	pub id: String,
	pub file_id: String,
	pub seq: u32,
	pub size: u64,
	pub checksum: String,
	pub locations: Vec<LocationRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacementRequest {
	pub num_blocks: usize,
	pub block_size: u64,
	/// Node ids (hex) that must not be chosen, e.g. the nodes already
	/// holding a block being re-replicated
	#[serde(default)]
	pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockPlacement {
	pub leader: NodeSummary,
	pub followers: Vec<NodeSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacementResponse {
	pub assignments: Vec<BlockPlacement>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockReportEntry {
	pub block_id: String,
	pub size: u64,
	pub checksum: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockReport {
	pub node_id: String,
	pub blocks: Vec<BlockReportEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockReportResponse {
	/// Blocks present on the node but unknown to the metadata plane,
	/// candidates for garbage collection after the grace period
	pub unknown_blocks: Vec<String>,
}

// ---- cluster status ----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSummary {
	pub leader_id: String,
	pub term: u64,
	pub nodes: Vec<NodeSummary>,
	pub files: u64,
	pub blocks: u64,
	pub under_replicated: u64,
	/// Blocks that exhausted their re-replication attempts
	pub degraded: Vec<String>,
	/// Blocks with zero healthy replicas
	pub fatal: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiErrorBody {
	pub code: String,
	pub message: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub details: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiAck {
	pub ok: bool,
}

// ---- the client ----

enum Outcome<R> {
	Value(R),
	RedirectTo(String),
}

enum TryError {
	/// The endpoint could not serve us, another one might (connection
	/// refused, timeout, 503)
	Retry(Error),
	/// The request itself was rejected, trying elsewhere is pointless
	Fail(Error),
}

pub struct ControlClient {
	http: reqwest::Client,
	endpoints: Vec<String>,
	preferred: AtomicUsize,
}

impl ControlClient {
	pub fn new(endpoints: Vec<String>) -> Result<Self, Error> {
		if endpoints.is_empty() {
			return Err(Error::Message(
				"No metadata endpoint configured (metadata_addrs)".into(),
			));
		}
		let endpoints = endpoints
			.into_iter()
			.map(|e| e.trim_end_matches('/').to_string())
			.collect();
		let http = reqwest::Client::builder()
			.redirect(reqwest::redirect::Policy::none())
			.timeout(CONTROL_REQUEST_TIMEOUT)
			.build()
			.ok_or_message("Could not initialize HTTP client")?;
		Ok(Self {
			http,
			endpoints,
			preferred: AtomicUsize::new(0),
		})
	}

	async fn request_once<B, R>(
		&self,
		method: Method,
		url: &str,
		body: Option<&B>,
	) -> Result<Outcome<R>, TryError>
	where
		B: Serialize + ?Sized,
		R: DeserializeOwned,
	{
		let mut req = self.http.request(method, url);
		if let Some(b) = body {
			req = req.json(b);
		}
		let resp = req.send().await.map_err(|e| {
			if e.is_connect() || e.is_timeout() || e.is_request() {
				TryError::Retry(Error::Message(format!("{}: {}", url, e)))
			} else {
				TryError::Fail(Error::Message(format!("{}: {}", url, e)))
			}
		})?;

		let status = resp.status();
		if status == StatusCode::TEMPORARY_REDIRECT {
			let loc = resp
				.headers()
				.get(reqwest::header::LOCATION)
				.and_then(|l| l.to_str().ok())
				.map(|l| l.to_string());
			match loc {
				Some(loc) => Ok(Outcome::RedirectTo(loc)),
				None => Err(TryError::Fail(Error::Message(
					"Redirect response without Location header".into(),
				))),
			}
		} else if status.is_success() {
			let value = resp
				.json::<R>()
				.await
				.map_err(|e| TryError::Fail(Error::Message(format!("Invalid response: {}", e))))?;
			Ok(Outcome::Value(value))
		} else {
			let err_body = resp.json::<ApiErrorBody>().await.ok();
			let err = match err_body {
				Some(b) => Error::RemoteError(format!("{}: {}", b.code, b.message)),
				None => Error::RemoteError(format!("HTTP status {}", status)),
			};
			if status == StatusCode::SERVICE_UNAVAILABLE {
				Err(TryError::Retry(err))
			} else {
				Err(TryError::Fail(err))
			}
		}
	}

	async fn request<B, R>(&self, method: Method, path: &str, body: Option<&B>) -> Result<R, Error>
	where
		B: Serialize + ?Sized,
		R: DeserializeOwned,
	{
		let n = self.endpoints.len();
		let start = self.preferred.load(Ordering::Relaxed);
		let mut last_err = None;

		for i in 0..n {
			let idx = (start + i) % n;
			let url = format!("{}{}", self.endpoints[idx], path);

			match self.request_once(method.clone(), &url, body).await {
				Ok(Outcome::Value(v)) => {
					self.preferred.store(idx, Ordering::Relaxed);
					return Ok(v);
				}
				Ok(Outcome::RedirectTo(loc)) => {
					debug!("Control plane redirects to leader at {}", loc);
					match self.request_once(method.clone(), &loc, body).await {
						Ok(Outcome::Value(v)) => {
							if let Some(j) = self
								.endpoints
								.iter()
								.position(|e| loc.starts_with(e.as_str()))
							{
								self.preferred.store(j, Ordering::Relaxed);
							}
							return Ok(v);
						}
						Ok(Outcome::RedirectTo(_)) => {
							last_err =
								Some(Error::Message("Metadata nodes redirect in a loop".into()));
						}
						Err(TryError::Retry(e)) => last_err = Some(e),
						Err(TryError::Fail(e)) => return Err(e),
					}
				}
				Err(TryError::Retry(e)) => last_err = Some(e),
				Err(TryError::Fail(e)) => return Err(e),
			}
		}

		Err(last_err
			.unwrap_or_else(|| Error::Message("No metadata endpoint could be reached".into())))
	}

	// ---- storage node lifecycle ----

	pub async fn register(&self, req: &RegisterRequest) -> Result<RegisterResponse, Error> {
		self.request(Method::POST, "/datanodes/register", Some(req))
			.await
	}

	pub async fn heartbeat(
		&self,
		node_id: &Uuid,
		req: &HeartbeatRequest,
	) -> Result<HeartbeatResponse, Error> {
		let path = format!("/datanodes/{}/heartbeat", hex_uuid(node_id));
		self.request(Method::POST, &path, Some(req)).await
	}

	pub async fn list_datanodes(&self) -> Result<Vec<NodeSummary>, Error> {
		self.request::<(), _>(Method::GET, "/datanodes", None).await
	}

	pub async fn get_datanode(&self, node_id: &Uuid) -> Result<NodeSummary, Error> {
		let path = format!("/datanodes/{}", hex_uuid(node_id));
		self.request::<(), _>(Method::GET, &path, None).await
	}

	pub async fn block_report(&self, report: &BlockReport) -> Result<BlockReportResponse, Error> {
		self.request(Method::POST, "/blocks/report", Some(report))
			.await
	}

	// ---- namespace ----

	pub async fn mkdir(&self, req: &MkdirRequest) -> Result<DirRecord, Error> {
		self.request(Method::POST, "/directories", Some(req)).await
	}

	pub async fn list_dir(&self, path: &str) -> Result<DirListing, Error> {
		let p = format!("/directories/{}", encode_path_param(path));
		self.request::<(), _>(Method::GET, &p, None).await
	}

	pub async fn rmdir(&self, path: &str, recursive: bool) -> Result<ApiAck, Error> {
		let p = format!(
			"/directories/{}?recursive={}",
			encode_path_param(path),
			recursive
		);
		self.request::<(), _>(Method::DELETE, &p, None).await
	}

	pub async fn create_file(&self, req: &CreateFileRequest) -> Result<FileRecord, Error> {
		self.request(Method::POST, "/files", Some(req)).await
	}

	pub async fn get_file(&self, file_id: &Uuid) -> Result<FileRecord, Error> {
		let path = format!("/files/{}", hex_uuid(file_id));
		self.request::<(), _>(Method::GET, &path, None).await
	}

	pub async fn get_file_by_path(&self, path: &str) -> Result<FileRecord, Error> {
		let p = format!("/files/path/{}", encode_path_param(path));
		self.request::<(), _>(Method::GET, &p, None).await
	}

	pub async fn delete_file(&self, file_id: &Uuid) -> Result<ApiAck, Error> {
		let path = format!("/files/{}", hex_uuid(file_id));
		self.request::<(), _>(Method::DELETE, &path, None).await
	}

	pub async fn finalize_file(&self, file_id: &Uuid) -> Result<FileRecord, Error> {
		let path = format!("/files/{}/finalize", hex_uuid(file_id));
		self.request::<(), _>(Method::POST, &path, None).await
	}

	// ---- blocks ----

	pub async fn select_datanodes_for_write(
		&self,
		req: &PlacementRequest,
	) -> Result<PlacementResponse, Error> {
		self.request(Method::POST, "/placement", Some(req)).await
	}

	pub async fn register_block(&self, req: &RegisterBlockRequest) -> Result<BlockRecord, Error> {
		self.request(Method::POST, "/blocks", Some(req)).await
	}

	pub async fn add_location(
		&self,
		block_id: &Uuid,
		req: &AddLocationRequest,
	) -> Result<ApiAck, Error> {
		let path = format!("/blocks/{}/locations", hex_uuid(block_id));
		self.request(Method::POST, &path, Some(req)).await
	}

	pub async fn get_block(&self, block_id: &Uuid) -> Result<BlockRecord, Error> {
		let path = format!("/blocks/{}", hex_uuid(block_id));
		self.request::<(), _>(Method::GET, &path, None).await
	}

	pub async fn get_blocks_of_file(&self, file_id: &Uuid) -> Result<Vec<BlockRecord>, Error> {
		let path = format!("/blocks/file/{}", hex_uuid(file_id));
		self.request::<(), _>(Method::GET, &path, None).await
	}

	// ---- status ----

	pub async fn health(&self) -> Result<ApiAck, Error> {
		self.request::<(), _>(Method::GET, "/health", None).await
	}

	pub async fn status(&self) -> Result<StatusSummary, Error> {
		self.request::<(), _>(Method::GET, "/status", None).await
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_uuid_hex_roundtrip() {
		let id = gen_uuid();
		assert_eq!(parse_uuid(&hex_uuid(&id)).unwrap(), id);
		assert!(parse_uuid("zz").is_err());
		assert!(parse_uuid("abcd").is_err());
	}

	#[test]
	fn test_encode_path_param() {
		assert_eq!(encode_path_param("/a/b.txt"), "%2Fa%2Fb%2Etxt");
	}
}
