//! The control-plane HTTP server, served by the metadata leader.
//! Followers answer read-only queries and redirect mutations.
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::TryFutureExt;
use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use percent_encoding::percent_decode_str;
use serde::de::DeserializeOwned;
use serde::Serialize;

use silo_meta::error::MetaError;
use silo_meta::node::MetaNode;
use silo_meta::schema::BlockInfo;
use silo_meta::store::HeartbeatOutcome;

use silo_rpc::control::*;

use silo_util::error::Error;

use crate::error::ApiError;

pub struct ApiServer {
	node: Arc<MetaNode>,
}

impl ApiServer {
	pub async fn run(
		node: Arc<MetaNode>,
		bind_addr: SocketAddr,
		shutdown_signal: impl Future<Output = ()>,
	) -> Result<(), Error> {
		let api = Arc::new(ApiServer { node });

		let service = make_service_fn(move |conn: &AddrStream| {
			let api = api.clone();
			let client_addr = conn.remote_addr();
			async move {
				Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
					let api = api.clone();
					api.handler(req, client_addr).map_ok(|res| {
						debug!("{} {:?}", res.status(), res.headers());
						res
					})
				}))
			}
		});

		let server = Server::bind(&bind_addr).serve(service);
		let graceful = server.with_graceful_shutdown(shutdown_signal);
		info!("Control plane API server listening on http://{}", bind_addr);

		graceful.await.map_err(|e| Error::Message(e.to_string()))?;
		Ok(())
	}

	async fn handler(
		self: Arc<Self>,
		req: Request<Body>,
		client_addr: SocketAddr,
	) -> Result<Response<Body>, Infallible> {
		let path_and_query = req
			.uri()
			.path_and_query()
			.map(|pq| pq.as_str().to_string())
			.unwrap_or_else(|| req.uri().path().to_string());

		let resp = match self.handle_request(req).await {
			Ok(resp) => resp,
			Err(e) => e.into_response(self.node.config.peer_api_addr.as_deref(), &path_and_query),
		};
		trace!("Handled request from {}", client_addr);
		Ok(resp)
	}

	async fn handle_request(&self, req: Request<Body>) -> Result<Response<Body>, ApiError> {
		let method = req.method().clone();
		let query = req.uri().query().map(|q| q.to_string());
		let segments = decode_path_segments(req.uri().path())?;
		let segments_ref: Vec<&str> = segments.iter().map(|s| s.as_str()).collect();

		debug!("{} /{}", method, segments.join("/"));

		match (&method, &segments_ref[..]) {
			(&Method::GET, ["health"]) => json_ok(&ApiAck { ok: true }),
			(&Method::GET, ["status"]) => {
				let summary = self.node.status_summary().await?;
				json_ok(&summary)
			}

			// ---- storage node lifecycle ----
			(&Method::POST, ["datanodes", "register"]) => {
				self.require_leader()?;
				let body: RegisterRequest = parse_json_body(req).await?;
				self.handle_register(body).await
			}
			(&Method::POST, ["datanodes", node_id, "heartbeat"]) => {
				self.require_leader()?;
				let node_id = parse_uuid(node_id).map_err(ApiError::bad_request)?;
				let body: HeartbeatRequest = parse_json_body(req).await?;
				self.handle_heartbeat(node_id, body)
			}
			(&Method::GET, ["datanodes"]) => {
				let nodes = self.node.store.list_nodes()?;
				let out: Vec<NodeSummary> = nodes.iter().map(|n| n.summary()).collect();
				json_ok(&out)
			}
			(&Method::GET, ["datanodes", node_id]) => {
				let node_id = parse_uuid(node_id).map_err(ApiError::bad_request)?;
				let node = self
					.node
					.store
					.get_node(&node_id)?
					.ok_or_else(|| MetaError::NotFound(format!("storage node {}", hex_uuid(&node_id))))?;
				json_ok(&node.summary())
			}
			(&Method::POST, ["blocks", "report"]) => {
				self.require_leader()?;
				let body: BlockReport = parse_json_body(req).await?;
				self.handle_block_report(body)
			}

			// ---- placement ----
			(&Method::POST, ["placement"]) => {
				self.require_leader()?;
				let body: PlacementRequest = parse_json_body(req).await?;
				self.handle_placement(body)
			}

			// ---- files ----
			(&Method::POST, ["files"]) => {
				self.require_leader()?;
				let body: CreateFileRequest = parse_json_body(req).await?;
				let file = self
					.node
					.store
					.create_file(&body.path, &body.owner, body.size)?;
				json_ok(&file.record(&[]))
			}
			(&Method::GET, ["files", "path", path]) => {
				let file = self
					.node
					.store
					.get_file_by_path(path)?
					.ok_or_else(|| MetaError::NotFound(path.to_string()))?;
				let blocks = self.node.store.list_blocks_of_file(&file.id)?;
				json_ok(&file.record(&blocks))
			}
			(&Method::GET, ["files", file_id]) => {
				let file_id = parse_uuid(file_id).map_err(ApiError::bad_request)?;
				let file = self
					.node
					.store
					.get_file(&file_id)?
					.ok_or_else(|| MetaError::NotFound(format!("file {}", hex_uuid(&file_id))))?;
				let blocks = self.node.store.list_blocks_of_file(&file.id)?;
				json_ok(&file.record(&blocks))
			}
			(&Method::POST, ["files", file_id, "finalize"]) => {
				self.require_leader()?;
				let file_id = parse_uuid(file_id).map_err(ApiError::bad_request)?;
				let file = self.node.store.finalize_file(&file_id)?;
				let blocks = self.node.store.list_blocks_of_file(&file.id)?;
				json_ok(&file.record(&blocks))
			}
			(&Method::DELETE, ["files", file_id]) => {
				self.require_leader()?;
				let file_id = parse_uuid(file_id).map_err(ApiError::bad_request)?;
				let (_, doomed) = self.node.store.delete_file(&file_id)?;
				self.node.delete_replicas_best_effort(doomed);
				json_ok(&ApiAck { ok: true })
			}

			// ---- directories ----
			(&Method::POST, ["directories"]) => {
				self.require_leader()?;
				let body: MkdirRequest = parse_json_body(req).await?;
				let dir = self.node.store.mkdir(&body.path, &body.owner)?;
				json_ok(&dir.record())
			}
			(&Method::GET, ["directories", path]) => {
				let (dir, entries) = self.node.store.list_dir(path)?;
				json_ok(&DirListing {
					directory: dir.record(),
					entries,
				})
			}
			(&Method::DELETE, ["directories", path]) => {
				self.require_leader()?;
				let recursive = query_flag(&query, "recursive");
				let doomed = self.node.store.rmdir(path, recursive)?;
				self.node.delete_replicas_best_effort(doomed);
				json_ok(&ApiAck { ok: true })
			}

			// ---- blocks ----
			(&Method::POST, ["blocks"]) => {
				self.require_leader()?;
				let body: RegisterBlockRequest = parse_json_body(req).await?;
				let info = BlockInfo {
					id: parse_uuid(&body.block_id).map_err(ApiError::bad_request)?,
					file_id: parse_uuid(&body.file_id).map_err(ApiError::bad_request)?,
					seq: body.seq,
					size: body.size,
					checksum: parse_checksum(&body.checksum).map_err(ApiError::bad_request)?,
				};
				self.node.store.register_block(info.clone())?;
				let record = self.block_record(info)?;
				json_ok(&record)
			}
			(&Method::POST, ["blocks", block_id, "locations"]) => {
				self.require_leader()?;
				let block_id = parse_uuid(block_id).map_err(ApiError::bad_request)?;
				let body: AddLocationRequest = parse_json_body(req).await?;
				let node_id = parse_uuid(&body.node_id).map_err(ApiError::bad_request)?;
				self.node
					.store
					.add_location(&block_id, &node_id, body.is_leader)?;
				json_ok(&ApiAck { ok: true })
			}
			(&Method::GET, ["blocks", "file", file_id]) => {
				let file_id = parse_uuid(file_id).map_err(ApiError::bad_request)?;
				let blocks = self.node.store.list_blocks_of_file(&file_id)?;
				let mut out = vec![];
				for b in blocks {
					out.push(self.block_record(b)?);
				}
				json_ok(&out)
			}
			(&Method::GET, ["blocks", block_id]) => {
				let block_id = parse_uuid(block_id).map_err(ApiError::bad_request)?;
				let info = self
					.node
					.store
					.get_block(&block_id)?
					.ok_or_else(|| MetaError::NotFound(format!("block {}", hex_uuid(&block_id))))?;
				let record = self.block_record(info)?;
				json_ok(&record)
			}

			_ => Err(ApiError::NoSuchRoute),
		}
	}

	fn require_leader(&self) -> Result<(), ApiError> {
		if self.node.ha.is_leader() {
			Ok(())
		} else {
			Err(MetaError::NotLeader.into())
		}
	}

	// ---- handlers with some logic of their own ----

	async fn handle_register(&self, body: RegisterRequest) -> Result<Response<Body>, ApiError> {
		let node_id = parse_uuid(&body.node_id).map_err(ApiError::bad_request)?;
		let record = self.node.store.register_datanode(
			node_id,
			body.hostname,
			body.rpc_port,
			body.storage_capacity,
			body.available_space,
		)?;
		info!(
			"Storage node {} registered from {}:{}",
			hex_uuid(&record.id),
			record.hostname,
			record.rpc_port
		);
		json_ok(&RegisterResponse {
			node_id: hex_uuid(&record.id),
		})
	}

	fn handle_heartbeat(
		&self,
		node_id: silo_util::data::Uuid,
		body: HeartbeatRequest,
	) -> Result<Response<Body>, ApiError> {
		let outcome = self
			.node
			.store
			.heartbeat(&node_id, body.available_space, body.blocks_stored)?;
		json_ok(&HeartbeatResponse {
			reregister: outcome == HeartbeatOutcome::UnknownNode,
		})
	}

	fn handle_block_report(&self, body: BlockReport) -> Result<Response<Body>, ApiError> {
		let node_id = parse_uuid(&body.node_id).map_err(ApiError::bad_request)?;
		let mut entries = vec![];
		for e in body.blocks.iter() {
			entries.push((
				parse_uuid(&e.block_id).map_err(ApiError::bad_request)?,
				e.size,
				parse_checksum(&e.checksum).map_err(ApiError::bad_request)?,
			));
		}
		let unknown = self.node.store.process_block_report(&node_id, &entries)?;
		json_ok(&BlockReportResponse {
			unknown_blocks: unknown.iter().map(hex_uuid).collect(),
		})
	}

	fn handle_placement(&self, body: PlacementRequest) -> Result<Response<Body>, ApiError> {
		let mut exclude = vec![];
		for id in body.exclude.iter() {
			exclude.push(parse_uuid(id).map_err(ApiError::bad_request)?);
		}
		let placement =
			self.node
				.select_placement(body.num_blocks, body.block_size, &exclude)?;
		let assignments = placement
			.into_iter()
			.map(|nodes| {
				let mut it = nodes.into_iter();
				let leader = it.next().expect("placement returned an empty assignment");
				BlockPlacement {
					leader: leader.summary(),
					followers: it.map(|n| n.summary()).collect(),
				}
			})
			.collect();
		json_ok(&PlacementResponse { assignments })
	}

	fn block_record(&self, info: BlockInfo) -> Result<BlockRecord, ApiError> {
		let mut locations = vec![];
		for loc in self.node.store.locations_of_block(&info.id)? {
			if let Some(node) = self.node.store.get_node(&loc.node_id)? {
				locations.push(LocationRecord {
					node: node.summary(),
					is_leader: loc.is_leader,
					suspect: loc.suspect,
				});
			}
		}
		Ok(info.record(locations))
	}
}

// ---- request/response plumbing ----

fn decode_path_segments(path: &str) -> Result<Vec<String>, ApiError> {
	let mut out = vec![];
	for seg in path.split('/').filter(|s| !s.is_empty()) {
		let decoded = percent_decode_str(seg)
			.decode_utf8()
			.map_err(|_| ApiError::bad_request("Invalid percent-encoding in path"))?;
		out.push(decoded.into_owned());
	}
	Ok(out)
}

fn query_flag(query: &Option<String>, name: &str) -> bool {
	match query {
		Some(q) => form_urlencoded::parse(q.as_bytes())
			.any(|(k, v)| k == name && (v == "true" || v == "1")),
		None => false,
	}
}

async fn parse_json_body<T: DeserializeOwned>(req: Request<Body>) -> Result<T, ApiError> {
	let bytes = hyper::body::to_bytes(req.into_body())
		.await
		.map_err(|e| ApiError::bad_request(format!("Could not read request body: {}", e)))?;
	serde_json::from_slice(&bytes)
		.map_err(|e| ApiError::bad_request(format!("Invalid JSON body: {}", e)))
}

fn json_ok<T: Serialize>(value: &T) -> Result<Response<Body>, ApiError> {
	let body = serde_json::to_vec(value)
		.map_err(|e| ApiError::Meta(MetaError::Internal(silo_util::error::Error::Json(e))))?;
	Ok(Response::builder()
		.status(StatusCode::OK)
		.header("Content-Type", "application/json")
		.body(Body::from(body))
		.unwrap())
}
