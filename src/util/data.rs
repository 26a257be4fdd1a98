//! Module containing helper types for identifiers and checksums
use std::convert::TryFrom;
use std::fmt;

use rand::Rng;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// An array of 32 bytes
#[derive(Default, PartialOrd, Ord, Clone, Hash, PartialEq, Copy)]
pub struct FixedBytes32([u8; 32]);

impl From<[u8; 32]> for FixedBytes32 {
	fn from(x: [u8; 32]) -> FixedBytes32 {
		FixedBytes32(x)
	}
}

impl TryFrom<&[u8]> for FixedBytes32 {
	type Error = std::array::TryFromSliceError;
	fn try_from(by: &[u8]) -> Result<Self, Self::Error> {
		Ok(Self(*<&[u8; 32]>::try_from(by)?))
	}
}

impl std::convert::AsRef<[u8]> for FixedBytes32 {
	fn as_ref(&self) -> &[u8] {
		&self.0[..]
	}
}

impl Eq for FixedBytes32 {}

impl fmt::Debug for FixedBytes32 {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}…", hex::encode(&self.0[..8]))
	}
}

struct FixedBytes32Visitor;
impl<'de> Visitor<'de> for FixedBytes32Visitor {
	type Value = FixedBytes32;

	fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
		write!(formatter, "a byte slice of size 32")
	}

	fn visit_bytes<E: de::Error>(self, value: &[u8]) -> Result<Self::Value, E> {
		if value.len() == 32 {
			let mut res = [0u8; 32];
			res.copy_from_slice(value);
			Ok(res.into())
		} else {
			Err(E::custom(format!(
				"Invalid byte string length {}, expected 32",
				value.len()
			)))
		}
	}
}

impl<'de> Deserialize<'de> for FixedBytes32 {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<FixedBytes32, D::Error> {
		deserializer.deserialize_bytes(FixedBytes32Visitor)
	}
}

impl Serialize for FixedBytes32 {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_bytes(&self.0[..])
	}
}

impl FixedBytes32 {
	/// Access the content as a slice
	pub fn as_slice(&self) -> &[u8] {
		&self.0[..]
	}
	/// Access the content as a mutable slice
	pub fn as_slice_mut(&mut self) -> &mut [u8] {
		&mut self.0[..]
	}
	/// Copy to a slice
	pub fn to_vec(self) -> Vec<u8> {
		self.0.to_vec()
	}
}

impl From<netapp::NodeID> for FixedBytes32 {
	fn from(node_id: netapp::NodeID) -> FixedBytes32 {
		FixedBytes32::try_from(node_id.as_ref()).unwrap()
	}
}

impl From<FixedBytes32> for netapp::NodeID {
	fn from(bytes: FixedBytes32) -> netapp::NodeID {
		netapp::NodeID::from_slice(bytes.as_slice()).unwrap()
	}
}

/// A unique identifier (files, blocks, storage nodes)
pub type Uuid = FixedBytes32;
/// A SHA-256 digest over block contents
pub type Checksum = FixedBytes32;

/// Compute the SHA-256 checksum of a byte slice
pub fn sha256sum(data: &[u8]) -> Checksum {
	use sha2::{Digest, Sha256};

	let mut hasher = Sha256::new();
	hasher.update(data);
	let mut hash = [0u8; 32];
	hash.copy_from_slice(&hasher.finalize()[..]);
	hash.into()
}

/// Generate a random identifier
pub fn gen_uuid() -> Uuid {
	rand::thread_rng().gen::<[u8; 32]>().into()
}

// RMP serialization with names of fields and variants

/// Serialize to MessagePack
pub fn rmp_to_vec_all_named<T>(val: &T) -> Result<Vec<u8>, rmp_serde::encode::Error>
where
	T: Serialize + ?Sized,
{
	let mut wr = Vec::with_capacity(128);
	let mut se = rmp_serde::Serializer::new(&mut wr).with_struct_map();
	val.serialize(&mut se)?;
	Ok(wr)
}

/// Deserialize from MessagePack
pub fn rmp_decode<T>(bytes: &[u8]) -> Result<T, rmp_serde::decode::Error>
where
	T: for<'de> Deserialize<'de>,
{
	rmp_serde::from_slice(bytes)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_fixed_bytes_roundtrip() {
		let id = gen_uuid();
		let ser = rmp_to_vec_all_named(&id).unwrap();
		let de: Uuid = rmp_decode(&ser).unwrap();
		assert_eq!(id, de);
	}

	#[test]
	fn test_sha256sum() {
		// SHA-256 of the empty string
		assert_eq!(
			hex::encode(sha256sum(b"").as_slice()),
			"e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
		);
	}
}
