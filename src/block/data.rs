//! Wire representation of block payload chunks
use serde::{Deserialize, Serialize};

use zstd::stream::{decode_all as zstd_decode, Encoder};

use silo_util::error::Error;

/// A possibly compressed slice of block data, as transported between
/// nodes. Compression is a hop-by-hop transform: nodes always store and
/// checksum the plain bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DataChunk {
	/// Uncompressed data
	Plain(#[serde(with = "serde_bytes")] Vec<u8>),
	/// Data compressed with zstd
	Compressed(#[serde(with = "serde_bytes")] Vec<u8>),
}

impl DataChunk {
	/// Builds a chunk from plain data, compressing it if a compression
	/// level is provided and compression succeeds
	pub fn from_buffer(data: Vec<u8>, level: Option<i32>) -> DataChunk {
		if let Some(level) = level {
			if let Ok(data_compressed) = zstd_encode(&data[..], level) {
				return DataChunk::Compressed(data_compressed);
			}
		}
		DataChunk::Plain(data)
	}

	/// Get the plain data (decompress if necessary)
	pub fn into_plain(self) -> Result<Vec<u8>, Error> {
		match self {
			DataChunk::Plain(d) => Ok(d),
			DataChunk::Compressed(c) => zstd_decode(&c[..])
				.map_err(|_| Error::Message("Cannot decompress chunk: invalid zstd data".into())),
		}
	}

	/// Size of the raw bytes carried on the wire
	pub fn wire_len(&self) -> usize {
		match self {
			DataChunk::Plain(d) => d.len(),
			DataChunk::Compressed(c) => c.len(),
		}
	}

	pub fn is_compressed(&self) -> bool {
		matches!(self, DataChunk::Compressed(_))
	}
}

fn zstd_encode<R: std::io::Read>(mut source: R, level: i32) -> std::io::Result<Vec<u8>> {
	let mut result = Vec::<u8>::new();
	let mut encoder = Encoder::new(&mut result, level)?;
	encoder.include_checksum(true)?;
	std::io::copy(&mut source, &mut encoder)?;
	encoder.finish()?;
	Ok(result)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_chunk_plain_roundtrip() {
		let data = b"some block contents".to_vec();
		let chunk = DataChunk::from_buffer(data.clone(), None);
		assert!(!chunk.is_compressed());
		assert_eq!(chunk.into_plain().unwrap(), data);
	}

	#[test]
	fn test_chunk_compressed_roundtrip() {
		let data = vec![42u8; 4096];
		let chunk = DataChunk::from_buffer(data.clone(), Some(3));
		assert!(chunk.is_compressed());
		assert!(chunk.wire_len() < data.len());
		assert_eq!(chunk.into_plain().unwrap(), data);
	}
}
