// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use base64::prelude::*;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const KEY_LEN: usize = 32;
pub const HASH_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum KeyError {
	#[error("invalid base64: {0}")]
	Base64(#[from] base64::DecodeError),

	#[error("invalid key length: expected {KEY_LEN} bytes, got {0}")]
	Length(usize),
}

/// A WireGuard public key. This is the stable identity of a peer and the
/// join key across every registry in the client.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WgPublicKey([u8; KEY_LEN]);

impl WgPublicKey {
	pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
		Self(bytes)
	}

	pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
		&self.0
	}

	pub fn from_base64(s: &str) -> Result<Self, KeyError> {
		let decoded = BASE64_STANDARD.decode(s.trim())?;
		let bytes: [u8; KEY_LEN] = decoded
			.as_slice()
			.try_into()
			.map_err(|_| KeyError::Length(decoded.len()))?;
		Ok(Self(bytes))
	}

	pub fn to_base64(&self) -> String {
		BASE64_STANDARD.encode(self.0)
	}

	/// Raw SHA-256 of the base64 form, as carried in proxy packet headers.
	pub fn hash_digest(&self) -> [u8; HASH_LEN] {
		let mut digest = [0u8; HASH_LEN];
		digest.copy_from_slice(&Sha256::digest(self.to_base64().as_bytes()));
		digest
	}

	pub fn hash(&self) -> PeerHash {
		PeerHash::of(self)
	}
}

impl fmt::Display for WgPublicKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.to_base64())
	}
}

impl fmt::Debug for WgPublicKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "WgPublicKey({})", self.to_base64())
	}
}

impl FromStr for WgPublicKey {
	type Err = KeyError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Self::from_base64(s)
	}
}

impl Serialize for WgPublicKey {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&self.to_base64())
	}
}

impl<'de> Deserialize<'de> for WgPublicKey {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let s = String::deserialize(deserializer)?;
		Self::from_base64(&s).map_err(serde::de::Error::custom)
	}
}

/// Hex-encoded SHA-256 of a peer's base64 public key.
///
/// Indexes the secondary registry used by lookups that only know the key,
/// not the network the peer was added on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerHash(String);

impl PeerHash {
	pub fn of(key: &WgPublicKey) -> Self {
		Self::from_digest(&key.hash_digest())
	}

	pub fn from_digest(digest: &[u8; HASH_LEN]) -> Self {
		Self(hex::encode(digest))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for PeerHash {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}
