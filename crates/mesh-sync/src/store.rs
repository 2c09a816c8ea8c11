// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::collaborators::ConfigStore;
use crate::config::SyncConfig;
use crate::error::StoreError;
use async_trait::async_trait;
use mesh_common::{Host, Node, PeerConfig, ServerRecord};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::fs;
use tracing::{debug, instrument};

const NODES_FILE: &str = "nodes.json";
const SERVERS_FILE: &str = "servers.json";
const HOST_FILE: &str = "host.json";

/// Host-wide config: the host itself, its peer set and the coordinator it
/// currently talks to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
	pub host: Host,
	pub peers: Vec<PeerConfig>,
	pub current_server: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredConfig {
	pub host: HostConfig,
	/// Nodes keyed by network name.
	pub nodes: BTreeMap<String, Node>,
	pub servers: BTreeMap<String, ServerRecord>,
}

/// [`ConfigStore`] backed by JSON files in one directory.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
	dir: PathBuf,
}

impl JsonFileStore {
	pub fn new(dir: impl Into<PathBuf>) -> Self {
		Self { dir: dir.into() }
	}

	/// Store rooted at the configured `config_dir`.
	pub fn from_config(config: &SyncConfig) -> Self {
		Self::new(config.config_dir.clone())
	}

	async fn read<T: DeserializeOwned + Default>(&self, name: &str) -> Result<T, StoreError> {
		let path = self.dir.join(name);
		match fs::read(&path).await {
			Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
			Err(e) if e.kind() == ErrorKind::NotFound => Ok(T::default()),
			Err(e) => Err(e.into()),
		}
	}

	#[instrument(skip(self, value), fields(dir = %self.dir.display()))]
	async fn write<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> Result<(), StoreError> {
		let content = serde_json::to_vec_pretty(value)?;
		fs::create_dir_all(&self.dir).await?;
		let path = self.dir.join(name);

		#[cfg(unix)]
		{
			use tokio::fs::OpenOptions;
			use tokio::io::AsyncWriteExt;

			let mut file = OpenOptions::new()
				.write(true)
				.create(true)
				.truncate(true)
				.mode(0o600)
				.open(&path)
				.await?;
			file.write_all(&content).await?;
			file.flush().await?;
		}

		#[cfg(not(unix))]
		{
			fs::write(&path, &content).await?;
		}

		debug!(path = %path.display(), "wrote config file");
		Ok(())
	}
}

#[async_trait]
impl ConfigStore for JsonFileStore {
	async fn load(&self) -> Result<StoredConfig, StoreError> {
		Ok(StoredConfig {
			host: self.read(HOST_FILE).await?,
			nodes: self.read(NODES_FILE).await?,
			servers: self.read(SERVERS_FILE).await?,
		})
	}

	async fn write_nodes(&self, nodes: &BTreeMap<String, Node>) -> Result<(), StoreError> {
		self.write(NODES_FILE, nodes).await
	}

	async fn write_servers(&self, servers: &BTreeMap<String, ServerRecord>) -> Result<(), StoreError> {
		self.write(SERVERS_FILE, servers).await
	}

	async fn write_host(&self, host: &HostConfig) -> Result<(), StoreError> {
		self.write(HOST_FILE, host).await
	}
}
