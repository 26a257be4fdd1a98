//! Client coordinator: splits files into blocks, drives placement and
//! pipelined uploads, and reconstructs files from possibly degraded
//! replica sets

#[macro_use]
extern crate tracing;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use silo_block::data::DataChunk;
use silo_block::manager::{BlockFrame, BlockNodeRpc, BLOCK_RPC_PATH};

use silo_rpc::control::*;
use silo_rpc::netkey::SILO_VERSION_TAG;
use silo_rpc::*;

use silo_util::config::Config;
use silo_util::data::*;
use silo_util::error::*;

const BLOCK_RW_TIMEOUT: Duration = Duration::from_secs(30);

// Slack left under the RPC message cap for the frame envelope
const FRAME_OVERHEAD: usize = 16 * 1024;

/// Descriptor of one block of a file being uploaded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSlice {
	pub seq: u32,
	pub offset: u64,
	pub size: u64,
}

/// Cut a file of `total_size` bytes into block descriptors. A zero-byte
/// file is a single zero-length block; a file that is an exact multiple
/// of the block size has no trailing empty block.
pub fn split_blocks(total_size: u64, block_size: u64) -> Vec<BlockSlice> {
	if total_size == 0 {
		return vec![BlockSlice {
			seq: 0,
			offset: 0,
			size: 0,
		}];
	}
	let mut out = vec![];
	let mut offset = 0u64;
	let mut seq = 0u32;
	while offset < total_size {
		let size = std::cmp::min(block_size, total_size - offset);
		out.push(BlockSlice { seq, offset, size });
		offset += size;
		seq += 1;
	}
	out
}

/// Replica preference order for a read: leader first, then healthy
/// followers, suspect replicas as a last resort
pub fn order_locations(locations: &[LocationRecord]) -> Vec<&LocationRecord> {
	let mut out: Vec<&LocationRecord> = locations.iter().collect();
	out.sort_by_key(|l| {
		(
			l.suspect,
			!l.is_leader,
			l.node.id.clone(), // stable order among equals
		)
	});
	out
}

struct UploadedBlock {
	block_id: Uuid,
	slice: BlockSlice,
	checksum: Checksum,
	leader: NodeSummary,
}

pub struct SiloClient {
	control: Arc<ControlClient>,
	rpc: RpcHelper,
	endpoint: Arc<Endpoint<BlockNodeRpc, ()>>,

	block_size: u64,
	chunk_size: usize,
	worker_pool_size: usize,
	compression_level: Option<i32>,
	owner: String,
}

impl SiloClient {
	/// Build a client with an ephemeral RPC identity
	pub fn new(config: &Config) -> Result<Self, Error> {
		let network_key = hex::decode(&config.rpc_secret)
			.ok()
			.and_then(|x| NetworkKey::from_slice(&x))
			.ok_or_message("Invalid RPC secret key")?;

		let (_pk, sk) = sodiumoxide::crypto::sign::ed25519::gen_keypair();
		let netapp = NetApp::new(SILO_VERSION_TAG, network_key, sk);
		let client_id: Uuid = netapp.id.into();
		let endpoint = netapp.endpoint::<BlockNodeRpc, ()>(BLOCK_RPC_PATH.to_string());

		let control = Arc::new(ControlClient::new(config.metadata_addrs.clone())?);

		let owner = std::env::var("USER").unwrap_or_else(|_| "anonymous".to_string());

		Ok(Self {
			control,
			rpc: RpcHelper::new(client_id, netapp),
			endpoint,
			block_size: config.block_size as u64,
			chunk_size: config
				.rpc_max_message_bytes
				.saturating_sub(FRAME_OVERHEAD)
				.max(4096),
			worker_pool_size: config.worker_pool_size.max(1),
			compression_level: config.compression_level,
			owner,
		})
	}

	pub fn control(&self) -> &ControlClient {
		&self.control
	}

	// ---- upload ----

	/// Upload a local file to the given namespace path
	pub async fn put(&self, local: &Path, remote_path: &str) -> Result<FileRecord, Error> {
		let meta = tokio::fs::metadata(local).await?;
		if !meta.is_file() {
			return Err(Error::Message(format!(
				"{} is not a regular file",
				local.display()
			)));
		}
		let total_size = meta.len();
		let slices = split_blocks(total_size, self.block_size);

		// One placement call for the whole batch
		let placement = self
			.control
			.select_datanodes_for_write(&PlacementRequest {
				num_blocks: slices.len(),
				block_size: self.block_size,
				exclude: vec![],
			})
			.await?;
		if placement.assignments.len() != slices.len() {
			return Err(Error::Message(format!(
				"Metadata manager returned {} assignments for {} blocks",
				placement.assignments.len(),
				slices.len()
			)));
		}

		let file = self
			.control
			.create_file(&CreateFileRequest {
				path: remote_path.to_string(),
				owner: self.owner.clone(),
				size: total_size,
			})
			.await?;
		let file_id = parse_uuid(&file.id)?;

		info!(
			"Uploading {} ({} bytes, {} block(s)) to {}",
			local.display(),
			total_size,
			slices.len(),
			file.path
		);

		// Pipelined block uploads, bounded by the worker pool size
		let mut pending = slices
			.iter()
			.zip(placement.assignments.iter())
			.map(|(slice, assignment)| self.upload_block(local, *slice, assignment));
		let mut in_flight = FuturesUnordered::new();
		let mut uploaded: Vec<UploadedBlock> = vec![];
		let mut failure: Option<Error> = None;

		loop {
			while in_flight.len() < self.worker_pool_size {
				match pending.next() {
					Some(fut) => in_flight.push(fut),
					None => break,
				}
			}
			match in_flight.next().await {
				Some(Ok(block)) => uploaded.push(block),
				Some(Err(e)) => {
					failure = Some(e);
					break;
				}
				None => break,
			}
		}

		if let Some(e) = failure {
			// Roll back what we can; replicas we miss are collected by
			// the orphan sweep
			warn!("Upload failed ({}), rolling back {} stored block(s)", e, uploaded.len());
			for b in uploaded.iter() {
				if let Ok(addr) = b.leader.node_addr() {
					let _ = self.delete_block_on(addr, &b.block_id).await;
				}
			}
			let _ = self.control.delete_file(&file_id).await;
			return Err(e);
		}

		// All blocks are durable: register them and finalize the file
		for b in uploaded.iter() {
			self.control
				.register_block(&RegisterBlockRequest {
					block_id: hex_uuid(&b.block_id),
					file_id: file.id.clone(),
					seq: b.slice.seq,
					size: b.slice.size,
					checksum: hex_checksum(&b.checksum),
				})
				.await?;
			self.control
				.add_location(
					&b.block_id,
					&AddLocationRequest {
						node_id: b.leader.id.clone(),
						is_leader: true,
					},
				)
				.await?;
		}

		let finalized = self.control.finalize_file(&file_id).await?;
		info!("Upload of {} complete", finalized.path);
		Ok(finalized)
	}

	async fn upload_block(
		&self,
		local: &Path,
		slice: BlockSlice,
		assignment: &BlockPlacement,
	) -> Result<UploadedBlock, Error> {
		let mut f = tokio::fs::File::open(local).await?;
		f.seek(std::io::SeekFrom::Start(slice.offset)).await?;
		let mut data = vec![0u8; slice.size as usize];
		f.read_exact(&mut data[..]).await?;
		drop(f);

		let block_id = gen_uuid();
		let checksum = sha256sum(&data[..]);
		let leader = assignment
			.leader
			.node_addr()
			.err_context("Could not resolve the block leader's address")?;
		let follower = match assignment.followers.first() {
			Some(f) => Some(f.node_addr()?),
			None => None,
		};

		let total_size = slice.size;
		let mut offset = 0usize;
		loop {
			let end = std::cmp::min(offset + self.chunk_size, data.len());
			let chunk = DataChunk::from_buffer(data[offset..end].to_vec(), self.compression_level);
			let frame = BlockFrame {
				block_id,
				offset: offset as u64,
				total_size,
				checksum,
				data: chunk,
			};
			let resp = self
				.rpc
				.call(
					&self.endpoint,
					leader,
					BlockNodeRpc::Store {
						frame,
						replicate_to: if offset == 0 { follower } else { None },
						is_replica: false,
					},
					RequestStrategy::with_priority(PRIO_NORMAL).with_timeout(BLOCK_RW_TIMEOUT),
				)
				.await?;
			match resp {
				BlockNodeRpc::Ok => (),
				m => return Err(Error::unexpected_rpc_message(m)),
			}
			offset = end;
			if offset >= data.len() {
				break;
			}
		}

		debug!(
			"Block {} ({} bytes) stored on {}",
			slice.seq, slice.size, assignment.leader.hostname
		);
		Ok(UploadedBlock {
			block_id,
			slice,
			checksum,
			leader: assignment.leader.clone(),
		})
	}

	async fn delete_block_on(&self, node: NodeAddr, block_id: &Uuid) -> Result<(), Error> {
		self.rpc
			.call(
				&self.endpoint,
				node,
				BlockNodeRpc::Delete {
					block_id: *block_id,
				},
				RequestStrategy::with_priority(PRIO_NORMAL).with_timeout(BLOCK_RW_TIMEOUT),
			)
			.await?;
		Ok(())
	}

	// ---- download ----

	/// Download a file to a local path, reassembling blocks at their
	/// offsets
	pub async fn get(&self, remote_path: &str, local: &Path) -> Result<u64, Error> {
		let file = self.control.get_file_by_path(remote_path).await?;
		if file.status != FileStatus::Complete {
			return Err(Error::Message(format!(
				"{} is not fully uploaded",
				remote_path
			)));
		}
		let file_id = parse_uuid(&file.id)?;
		let blocks = self.control.get_blocks_of_file(&file_id).await?;

		// Byte offset of each block, in sequence order
		let mut offsets = Vec::with_capacity(blocks.len());
		let mut acc = 0u64;
		for b in blocks.iter() {
			offsets.push(acc);
			acc += b.size;
		}
		if acc != file.size {
			return Err(Error::Message(format!(
				"Metadata inconsistency: blocks of {} sum to {} bytes, expected {}",
				remote_path, acc, file.size
			)));
		}

		{
			let f = tokio::fs::File::create(local).await?;
			f.set_len(file.size).await?;
			f.sync_all().await?;
		}

		let mut pending = blocks
			.iter()
			.zip(offsets.iter())
			.map(|(record, offset)| self.download_block(local, record, *offset));
		let mut in_flight = FuturesUnordered::new();

		loop {
			while in_flight.len() < self.worker_pool_size {
				match pending.next() {
					Some(fut) => in_flight.push(fut),
					None => break,
				}
			}
			match in_flight.next().await {
				Some(res) => res?,
				None => break,
			}
		}

		info!(
			"Downloaded {} ({} bytes, {} block(s)) to {}",
			remote_path,
			file.size,
			blocks.len(),
			local.display()
		);
		Ok(file.size)
	}

	async fn download_block(
		&self,
		local: &Path,
		record: &BlockRecord,
		offset: u64,
	) -> Result<(), Error> {
		let block_id = parse_uuid(&record.id)?;
		let checksum = parse_checksum(&record.checksum)?;

		let mut last_err = Error::Message(format!(
			"BlockUnavailable: no replica of block {} could be read",
			record.id
		));
		for loc in order_locations(&record.locations) {
			let peer = match loc.node.node_addr() {
				Ok(p) => p,
				Err(e) => {
					last_err = e;
					continue;
				}
			};
			match self.fetch_block(peer, &block_id, record.size, checksum).await {
				Ok(data) => {
					let mut f = tokio::fs::OpenOptions::new()
						.write(true)
						.open(local)
						.await?;
					f.seek(std::io::SeekFrom::Start(offset)).await?;
					f.write_all(&data[..]).await?;
					f.sync_data().await?;
					return Ok(());
				}
				Err(e) => {
					warn!(
						"Could not read block {} from {}: {}",
						record.id, loc.node.hostname, e
					);
					last_err = e;
				}
			}
		}
		Err(Error::Message(format!(
			"BlockUnavailable: block {} of file could not be read from any replica: {}",
			record.id, last_err
		)))
	}

	async fn fetch_block(
		&self,
		peer: NodeAddr,
		block_id: &Uuid,
		expected_size: u64,
		checksum: Checksum,
	) -> Result<Vec<u8>, Error> {
		let mut data: Vec<u8> = Vec::with_capacity(expected_size as usize);
		let mut offset = 0u64;
		loop {
			let resp = self
				.rpc
				.call(
					&self.endpoint,
					peer,
					BlockNodeRpc::Retrieve {
						block_id: *block_id,
						offset,
					},
					RequestStrategy::with_priority(PRIO_NORMAL).with_timeout(BLOCK_RW_TIMEOUT),
				)
				.await?;
			match resp {
				BlockNodeRpc::Frame(frame) => {
					if frame.block_id != *block_id || frame.offset != offset {
						return Err(Error::Message(format!(
							"Invalid frame received for block {:?}",
							block_id
						)));
					}
					if frame.total_size != expected_size {
						return Err(Error::Message(format!(
							"Block {:?} has size {} on this node, expected {}",
							block_id, frame.total_size, expected_size
						)));
					}
					let chunk = frame.data.into_plain()?;
					if chunk.is_empty() && offset < expected_size {
						return Err(Error::Message(format!(
							"Empty frame before the end of block {:?}",
							block_id
						)));
					}
					data.extend_from_slice(&chunk[..]);
					offset += chunk.len() as u64;
					if offset >= expected_size {
						break;
					}
				}
				m => return Err(Error::unexpected_rpc_message(m)),
			}
		}

		if sha256sum(&data[..]) != checksum {
			return Err(Error::CorruptData(*block_id));
		}
		Ok(data)
	}

	// ---- namespace operations ----

	pub async fn mkdir(&self, path: &str) -> Result<DirRecord, Error> {
		self.control
			.mkdir(&MkdirRequest {
				path: path.to_string(),
				owner: self.owner.clone(),
			})
			.await
	}

	pub async fn rmdir(&self, path: &str, recursive: bool) -> Result<(), Error> {
		self.control.rmdir(path, recursive).await?;
		Ok(())
	}

	pub async fn ls(&self, path: &str) -> Result<DirListing, Error> {
		self.control.list_dir(path).await
	}

	pub async fn rm(&self, path: &str) -> Result<(), Error> {
		let file = self.control.get_file_by_path(path).await?;
		let file_id = parse_uuid(&file.id)?;
		self.control.delete_file(&file_id).await?;
		Ok(())
	}

	pub async fn info(&self, path: &str) -> Result<(FileRecord, Vec<BlockRecord>), Error> {
		let file = self.control.get_file_by_path(path).await?;
		let file_id = parse_uuid(&file.id)?;
		let blocks = self.control.get_blocks_of_file(&file_id).await?;
		Ok((file, blocks))
	}

	pub async fn status(&self) -> Result<StatusSummary, Error> {
		self.control.status().await
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_split_zero_byte_file() {
		let blocks = split_blocks(0, 4096);
		assert_eq!(
			blocks,
			vec![BlockSlice {
				seq: 0,
				offset: 0,
				size: 0
			}]
		);
	}

	#[test]
	fn test_split_exact_multiple() {
		let blocks = split_blocks(8192, 4096);
		assert_eq!(blocks.len(), 2);
		assert_eq!(blocks[1].offset, 4096);
		assert_eq!(blocks[1].size, 4096);
	}

	#[test]
	fn test_split_with_remainder() {
		// 10 KiB in 4 KiB blocks: 4 KiB + 4 KiB + 2 KiB
		let blocks = split_blocks(10 * 1024, 4096);
		assert_eq!(blocks.len(), 3);
		assert_eq!(blocks[0].size, 4096);
		assert_eq!(blocks[1].size, 4096);
		assert_eq!(blocks[2].size, 2048);
		assert_eq!(blocks[2].offset, 8192);
		assert_eq!(blocks.iter().map(|b| b.size).sum::<u64>(), 10 * 1024);
	}

	#[test]
	fn test_location_preference_order() {
		let mk = |id: u8, is_leader, suspect| LocationRecord {
			node: NodeSummary {
				id: hex::encode([id; 32]),
				hostname: "h".into(),
				rpc_port: 1,
				storage_capacity: 0,
				available_space: 0,
				status: NodeStatus::Active,
				last_heartbeat_msec: 0,
				blocks_stored: 0,
			},
			is_leader,
			suspect,
		};
		let locations = vec![mk(1, false, true), mk(2, false, false), mk(3, true, false)];
		let ordered = order_locations(&locations);
		assert!(ordered[0].is_leader);
		assert!(!ordered[1].suspect);
		assert!(ordered[2].suspect);
	}
}
