//! Local persistence of data blocks on a storage node
use std::convert::TryInto;
use std::path::{Path, PathBuf};

use futures::future::{BoxFuture, Future, FutureExt};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;

use silo_util::data::*;
use silo_util::error::*;

/// Bytes of filesystem space never handed out to block storage
const RESERVE_MARGIN: u64 = 256 * 1024 * 1024;

/// Outcome of a block write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStoreOutcome {
	/// The block was persisted
	Written,
	/// The block was already present with the same checksum, nothing
	/// was written
	AlreadyStored,
}

/// Persistence of opaque blocks as files, sharded over two levels of
/// directories keyed by the first two bytes of the block id. Each block
/// file has a `.sum` sidecar holding the hex SHA-256 of its contents.
pub struct BlockStore {
	data_dir: PathBuf,
}

impl BlockStore {
	pub fn new(data_dir: PathBuf) -> Result<Self, Error> {
		std::fs::create_dir_all(&data_dir)?;
		Ok(Self { data_dir })
	}

	pub fn data_dir(&self) -> &Path {
		&self.data_dir
	}

	fn block_dir(&self, id: &Uuid) -> PathBuf {
		let mut path = self.data_dir.clone();
		path.push(hex::encode(&id.as_slice()[0..1]));
		path.push(hex::encode(&id.as_slice()[1..2]));
		path
	}

	fn block_path(&self, id: &Uuid) -> PathBuf {
		let mut path = self.block_dir(id);
		path.push(hex::encode(id.as_slice()));
		path
	}

	fn sum_path(&self, id: &Uuid) -> PathBuf {
		let mut path = self.block_path(id);
		path.set_extension("sum");
		path
	}

	/// Returns the size and stored checksum of a block, if present
	pub async fn exists(&self, id: &Uuid) -> Result<Option<(u64, Checksum)>, Error> {
		let sum = match fs::read(self.sum_path(id)).await {
			Ok(b) => b,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
			Err(e) => return Err(e.into()),
		};
		let sum_str = String::from_utf8(sum)
			.ok_or_message(format!("Invalid checksum sidecar for block {:?}", id))?;
		let checksum = parse_hex_checksum(sum_str.trim())
			.ok_or_message(format!("Invalid checksum sidecar for block {:?}", id))?;

		let meta = match fs::metadata(self.block_path(id)).await {
			Ok(m) => m,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
			Err(e) => return Err(e.into()),
		};

		Ok(Some((meta.len(), checksum)))
	}

	/// Write a block and its checksum sidecar. The caller must hold the
	/// manager's write exclusion for this to be safe against concurrent
	/// writes of the same block id.
	pub async fn write(
		&self,
		id: &Uuid,
		data: &[u8],
		checksum: Checksum,
	) -> Result<BlockStoreOutcome, Error> {
		if let Some((_, stored_sum)) = self.exists(id).await? {
			if stored_sum == checksum {
				return Ok(BlockStoreOutcome::AlreadyStored);
			}
			return Err(Error::Message(format!(
				"AlreadyExists: block {:?} is already stored with a different checksum",
				id
			)));
		}

		let directory = self.block_dir(id);
		fs::create_dir_all(&directory).await?;

		let path = self.block_path(id);
		let mut path_tmp = path.clone();
		path_tmp.set_extension("tmp");

		let mut f = fs::File::create(&path_tmp).await?;
		f.write_all(data).await?;
		f.sync_all().await?;
		drop(f);

		let sum_path = self.sum_path(id);
		let mut sum_tmp = sum_path.clone();
		sum_tmp.set_extension("sum_tmp");
		let mut f = fs::File::create(&sum_tmp).await?;
		f.write_all(hex::encode(checksum.as_slice()).as_bytes())
			.await?;
		f.sync_all().await?;
		drop(f);

		fs::rename(path_tmp, &path).await?;
		fs::rename(sum_tmp, &sum_path).await?;

		// fsync on the containing directory, to ensure the renames are
		// persisted properly. See:
		// http://thedjbway.b0llix.net/qmail/syncdir.html
		let dir = fs::OpenOptions::new()
			.read(true)
			.mode(0)
			.open(directory)
			.await?;
		dir.sync_all().await?;
		drop(dir);

		Ok(BlockStoreOutcome::Written)
	}

	/// Read a block, verifying its contents against the stored checksum.
	/// A corrupt block is quarantined (renamed to `.corrupted`) and the
	/// read fails.
	pub async fn read(&self, id: &Uuid) -> Result<(Vec<u8>, Checksum), Error> {
		let (_, stored_sum) = self
			.exists(id)
			.await?
			.ok_or_message(format!("NotFound: block {:?} is not stored here", id))?;

		let mut f = fs::File::open(self.block_path(id)).await?;
		let mut data = vec![];
		f.read_to_end(&mut data).await?;
		drop(f);

		if sha256sum(&data[..]) != stored_sum {
			self.quarantine(id).await?;
			return Err(Error::CorruptData(*id));
		}

		Ok((data, stored_sum))
	}

	async fn quarantine(&self, id: &Uuid) -> Result<(), Error> {
		warn!(
			"Block {:?} is corrupted. Renaming to .corrupted and dropping its checksum.",
			id
		);
		let path = self.block_path(id);
		let mut path2 = path.clone();
		path2.set_extension("corrupted");
		fs::rename(path, path2).await?;
		fs::remove_file(self.sum_path(id)).await?;
		Ok(())
	}

	/// Remove a block from disk. Returns false if it was not stored.
	pub async fn delete(&self, id: &Uuid) -> Result<bool, Error> {
		match fs::remove_file(self.block_path(id)).await {
			Ok(()) => {
				let _ = fs::remove_file(self.sum_path(id)).await;
				Ok(true)
			}
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
			Err(e) => Err(e.into()),
		}
	}

	/// Filesystem space available for new blocks, keeping a reserve
	/// margin untouched
	pub fn available_space(&self) -> Result<u64, Error> {
		use nix::sys::statvfs::statvfs;
		let stat = statvfs(&self.data_dir)
			.map_err(|e| Error::Message(format!("statvfs error: {}", e)))?;
		let avail = stat.blocks_available() as u64 * stat.fragment_size() as u64;
		Ok(avail.saturating_sub(RESERVE_MARGIN))
	}

	/// Total capacity of the filesystem holding the block store
	pub fn total_space(&self) -> Result<u64, Error> {
		use nix::sys::statvfs::statvfs;
		let stat = statvfs(&self.data_dir)
			.map_err(|e| Error::Message(format!("statvfs error: {}", e)))?;
		Ok(stat.blocks() as u64 * stat.fragment_size() as u64)
	}

	// ---- Iteration on all blocks present on disk ----

	pub async fn for_each_block<F, Fut, State>(
		&self,
		state: State,
		mut f: F,
		must_exit: &watch::Receiver<bool>,
	) -> Result<State, Error>
	where
		F: FnMut(State, Uuid) -> Fut + Send,
		Fut: Future<Output = Result<State, Error>> + Send,
		State: Send,
	{
		self.for_each_block_rec(&self.data_dir, state, &mut f, must_exit)
			.await
	}

	fn for_each_block_rec<'a, F, Fut, State>(
		&'a self,
		path: &'a Path,
		mut state: State,
		f: &'a mut F,
		must_exit: &'a watch::Receiver<bool>,
	) -> BoxFuture<'a, Result<State, Error>>
	where
		F: FnMut(State, Uuid) -> Fut + Send,
		Fut: Future<Output = Result<State, Error>> + Send,
		State: Send + 'a,
	{
		async move {
			let mut ls_data_dir = fs::read_dir(path).await?;
			while let Some(data_dir_ent) = ls_data_dir.next_entry().await? {
				if *must_exit.borrow() {
					break;
				}

				let name = data_dir_ent.file_name();
				let name = if let Ok(n) = name.into_string() {
					n
				} else {
					continue;
				};
				let ent_type = data_dir_ent.file_type().await?;

				if name.len() == 2 && hex::decode(&name).is_ok() && ent_type.is_dir() {
					state = self
						.for_each_block_rec(&data_dir_ent.path(), state, f, must_exit)
						.await?;
				} else if name.len() == 64 && ent_type.is_file() {
					let id_bytes = if let Ok(h) = hex::decode(&name) {
						h
					} else {
						continue;
					};
					let id: Uuid = match id_bytes[..].try_into() {
						Ok(id) => id,
						Err(_) => continue,
					};
					state = f(state, id).await?;
				}
			}
			Ok(state)
		}
		.boxed()
	}
}

fn parse_hex_checksum(s: &str) -> Option<Checksum> {
	let bytes = hex::decode(s).ok()?;
	bytes[..].try_into().ok()
}

#[cfg(test)]
mod tests {
	use super::*;

	fn test_store() -> (mktemp::Temp, BlockStore) {
		let dir = mktemp::Temp::new_dir().unwrap();
		let store = BlockStore::new(dir.to_path_buf()).unwrap();
		(dir, store)
	}

	#[tokio::test]
	async fn test_write_read_delete() {
		let (_dir, store) = test_store();
		let id = gen_uuid();
		let data = b"hello blocks".to_vec();
		let sum = sha256sum(&data);

		assert!(store.exists(&id).await.unwrap().is_none());

		let outcome = store.write(&id, &data, sum).await.unwrap();
		assert_eq!(outcome, BlockStoreOutcome::Written);
		assert_eq!(
			store.exists(&id).await.unwrap(),
			Some((data.len() as u64, sum))
		);

		let (read, read_sum) = store.read(&id).await.unwrap();
		assert_eq!(read, data);
		assert_eq!(read_sum, sum);

		assert!(store.delete(&id).await.unwrap());
		assert!(!store.delete(&id).await.unwrap());
		assert!(store.exists(&id).await.unwrap().is_none());
	}

	#[tokio::test]
	async fn test_duplicate_write() {
		let (_dir, store) = test_store();
		let id = gen_uuid();
		let data = b"same bytes".to_vec();
		let sum = sha256sum(&data);

		store.write(&id, &data, sum).await.unwrap();

		// Same checksum: no-op success
		let outcome = store.write(&id, &data, sum).await.unwrap();
		assert_eq!(outcome, BlockStoreOutcome::AlreadyStored);

		// Mismatching checksum: rejected
		let other = b"other bytes".to_vec();
		let res = store.write(&id, &other, sha256sum(&other)).await;
		assert!(res.is_err());
	}

	#[tokio::test]
	async fn test_corrupt_block_is_quarantined() {
		let (_dir, store) = test_store();
		let id = gen_uuid();
		let data = vec![7u8; 1024];
		store.write(&id, &data, sha256sum(&data)).await.unwrap();

		// Flip one byte on disk behind the store's back
		let path = store.block_path(&id);
		let mut raw = std::fs::read(&path).unwrap();
		raw[12] ^= 0xff;
		std::fs::write(&path, &raw).unwrap();

		match store.read(&id).await {
			Err(Error::CorruptData(b)) => assert_eq!(b, id),
			other => panic!("unexpected result: {:?}", other.map(|_| ())),
		}
		// The quarantined block is no longer visible
		assert!(store.exists(&id).await.unwrap().is_none());
	}

	#[tokio::test]
	async fn test_for_each_block() {
		let (_dir, store) = test_store();
		let mut ids = vec![];
		for i in 0..10u8 {
			let id = gen_uuid();
			let data = vec![i; 100];
			store.write(&id, &data, sha256sum(&data)).await.unwrap();
			ids.push(id);
		}

		let (_, rx) = tokio::sync::watch::channel(false);
		let mut seen = store
			.for_each_block(
				vec![],
				|mut acc, id| async move {
					acc.push(id);
					Ok(acc)
				},
				&rx,
			)
			.await
			.unwrap();

		seen.sort();
		ids.sort();
		assert_eq!(seen, ids);
	}
}
