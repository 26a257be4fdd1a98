//! Atomic persistence of small state values as files in the metadata
//! directory (HA term state, the storage agent's registration cache, ...)
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use serde::{Deserialize, Serialize};

use crate::data::*;
use crate::error::Error;

pub struct Persister<T: Serialize + for<'de> Deserialize<'de>> {
	path: PathBuf,

	_marker: std::marker::PhantomData<T>,
}

impl<T> Persister<T>
where
	T: Serialize + for<'de> Deserialize<'de>,
{
	pub fn new(base_dir: &Path, file_name: &str) -> Self {
		let mut path = base_dir.to_path_buf();
		path.push(file_name);
		Self {
			path,
			_marker: Default::default(),
		}
	}

	pub fn load(&self) -> Result<T, Error> {
		let mut file = std::fs::OpenOptions::new().read(true).open(&self.path)?;

		let mut bytes = vec![];
		file.read_to_end(&mut bytes)?;

		let value = rmp_decode(&bytes[..])?;
		Ok(value)
	}

	pub fn save(&self, t: &T) -> Result<(), Error> {
		let bytes = rmp_to_vec_all_named(t)?;

		let mut path_tmp = self.path.clone();
		let mut tmp = path_tmp.file_name().unwrap().to_os_string();
		tmp.push(".tmp");
		path_tmp.set_file_name(tmp);

		let mut file = std::fs::OpenOptions::new()
			.write(true)
			.create(true)
			.truncate(true)
			.open(&path_tmp)?;

		file.write_all(&bytes[..])?;
		file.sync_all()?;
		drop(file);

		std::fs::rename(&path_tmp, &self.path)?;

		Ok(())
	}

	pub async fn load_async(&self) -> Result<T, Error> {
		let mut file = tokio::fs::File::open(&self.path).await?;

		let mut bytes = vec![];
		file.read_to_end(&mut bytes).await?;

		let value = rmp_decode(&bytes[..])?;
		Ok(value)
	}

	pub async fn save_async(&self, t: &T) -> Result<(), Error> {
		let bytes = rmp_to_vec_all_named(t)?;

		let mut path_tmp = self.path.clone();
		let mut tmp = path_tmp.file_name().unwrap().to_os_string();
		tmp.push(".tmp");
		path_tmp.set_file_name(tmp);

		let mut file = tokio::fs::File::create(&path_tmp).await?;

		file.write_all(&bytes[..]).await?;
		file.sync_all().await?;
		drop(file);

		tokio::fs::rename(&path_tmp, &self.path).await?;

		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
	struct TermState {
		current_term: u64,
		voted_for: Option<Uuid>,
	}

	#[test]
	fn test_persister_roundtrip() {
		let dir = mktemp::Temp::new_dir().unwrap();
		let persister: Persister<TermState> = Persister::new(&dir.to_path_buf(), "term_state");

		assert!(persister.load().is_err());

		let state = TermState {
			current_term: 7,
			voted_for: Some(gen_uuid()),
		};
		persister.save(&state).unwrap();
		assert_eq!(persister.load().unwrap(), state);

		drop(dir);
	}
}
