// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::ConfigError;
use mesh_proxy::{DetectorConfig, PROBE_TIMEOUT, PROXY_PORT};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

const DEFAULT_FALLBACK_INTERVAL_SECS: u64 = 30;
const DEFAULT_SIGNAL_SETTLE_MS: u64 = 1000;
const DEFAULT_MAX_PROBES: usize = 32;
const CONFIG_DIR_NAME: &str = ".mesh";

fn validate_https_url(url: &Url) -> Result<(), ConfigError> {
	if url.scheme() != "https" {
		return Err(ConfigError::Parse(
			"coordinator API URL must use https://".to_string(),
		));
	}
	Ok(())
}

fn default_config_dir() -> Result<PathBuf, ConfigError> {
	dirs::home_dir()
		.map(|home| home.join(CONFIG_DIR_NAME))
		.ok_or(ConfigError::NoHomeDir)
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
	/// Version this client reports and compares against the coordinator's.
	pub client_version: String,
	pub proxy_enabled: bool,
	/// Port the proxy listener binds and remote hosts are reached on.
	pub proxy_port: u16,
	pub fallback_interval: Duration,
	/// Pause between reconfiguring the interface and signalling DONE.
	pub signal_settle: Duration,
	pub detector: DetectorConfig,
	pub config_dir: PathBuf,
}

impl Default for SyncConfig {
	fn default() -> Self {
		Self {
			client_version: mesh_common_version::client_version().to_string(),
			proxy_enabled: false,
			proxy_port: PROXY_PORT,
			fallback_interval: Duration::from_secs(DEFAULT_FALLBACK_INTERVAL_SECS),
			signal_settle: Duration::from_millis(DEFAULT_SIGNAL_SETTLE_MS),
			detector: DetectorConfig::default(),
			config_dir: default_config_dir().unwrap_or_else(|_| PathBuf::from(CONFIG_DIR_NAME)),
		}
	}
}

impl SyncConfig {
	pub fn from_env() -> Result<Self, ConfigError> {
		Self::from_vars(|name| std::env::var(name).ok())
	}

	pub(crate) fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
		let client_version = var("MESH_CLIENT_VERSION")
			.filter(|v| !v.trim().is_empty())
			.unwrap_or_else(|| mesh_common_version::client_version().to_string());

		let proxy_enabled = var("MESH_PROXY_ENABLED")
			.map(|v| v != "0" && v.to_lowercase() != "false")
			.unwrap_or(false);

		let proxy_port = match var("MESH_PROXY_PORT") {
			Some(raw) => raw
				.parse()
				.map_err(|e| ConfigError::Parse(format!("invalid MESH_PROXY_PORT: {e}")))?,
			None => PROXY_PORT,
		};

		let fallback_interval = var("MESH_FALLBACK_INTERVAL_SECS")
			.and_then(|s| s.parse().ok())
			.filter(|secs: &u64| *secs > 0)
			.unwrap_or(DEFAULT_FALLBACK_INTERVAL_SECS);

		let signal_settle = var("MESH_SIGNAL_SETTLE_MS")
			.and_then(|s| s.parse().ok())
			.unwrap_or(DEFAULT_SIGNAL_SETTLE_MS);

		let max_concurrent_probes = match var("MESH_DETECT_MAX_PROBES") {
			Some(raw) => {
				let cap: usize = raw
					.parse()
					.map_err(|e| ConfigError::Parse(format!("invalid MESH_DETECT_MAX_PROBES: {e}")))?;
				(cap > 0).then_some(cap)
			}
			None => Some(DEFAULT_MAX_PROBES),
		};

		let probe_timeout = var("MESH_DETECT_PROBE_TIMEOUT_MS")
			.and_then(|s| s.parse().ok())
			.map(Duration::from_millis)
			.unwrap_or(PROBE_TIMEOUT);

		let config_dir = match var("MESH_CONFIG_DIR") {
			Some(dir) => PathBuf::from(dir),
			None => default_config_dir()?,
		};

		Ok(Self {
			client_version,
			proxy_enabled,
			proxy_port,
			fallback_interval: Duration::from_secs(fallback_interval),
			signal_settle: Duration::from_millis(signal_settle),
			detector: DetectorConfig {
				max_concurrent_probes,
				probe_timeout,
			},
			config_dir,
		})
	}
}

/// Where and as whom to pull host config when the control channel is down.
#[derive(Clone)]
pub struct PullClientConfig {
	pub base_url: Url,
	pub host_id: String,
	token: String,
}

impl PullClientConfig {
	pub fn new(base_url: Url, host_id: String, token: String) -> Result<Self, ConfigError> {
		validate_https_url(&base_url)?;
		Ok(Self {
			base_url,
			host_id,
			token,
		})
	}

	#[cfg(test)]
	pub fn new_insecure(base_url: Url, host_id: String, token: String) -> Self {
		Self {
			base_url,
			host_id,
			token,
		}
	}

	pub(crate) fn token(&self) -> &str {
		&self.token
	}
}

impl fmt::Debug for PullClientConfig {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("PullClientConfig")
			.field("base_url", &self.base_url.as_str())
			.field("host_id", &self.host_id)
			.field("token", &"[REDACTED]")
			.finish()
	}
}
