// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use mesh_common::TopicError;
use mesh_common_version::VersionError;
use thiserror::Error;

/// Why one inbound control message was dropped.
#[derive(Debug, Error)]
pub enum SyncError {
	#[error("invalid topic: {0}")]
	Topic(#[from] TopicError),

	#[error("failed to decrypt message from {server}: {source}")]
	Decrypt {
		server: String,
		#[source]
		source: anyhow::Error,
	},

	#[error("failed to decode message: {0}")]
	Decode(#[from] serde_json::Error),

	#[error("server {0:?} is not configured")]
	UnknownServer(String),

	#[error("no node configured for network {0:?}")]
	UnknownNode(String),

	#[error("no nodes configured yet")]
	NoNodes,

	#[error("unknown host action {0}")]
	UnknownAction(String),

	#[error("cannot compare client version with server: {0}")]
	Version(#[from] VersionError),

	#[error("failed to leave network {network}: {source}")]
	Leave {
		network: String,
		#[source]
		source: anyhow::Error,
	},

	#[error("pull failed: {0}")]
	Pull(#[from] PullError),

	#[error("failed to apply {step}: {source}")]
	Apply {
		step: &'static str,
		#[source]
		source: anyhow::Error,
	},

	#[error("failed to persist host config: {0}")]
	Persist(#[source] StoreError),

	#[error("engine is terminated pending restart")]
	Terminated,
}

impl SyncError {
	pub(crate) fn apply(step: &'static str, source: anyhow::Error) -> Self {
		Self::Apply { step, source }
	}
}

#[derive(Debug, Error)]
pub enum PullError {
	#[error("HTTP error: {0}")]
	Http(#[from] reqwest::Error),

	#[error("URL parse error: {0}")]
	Url(#[from] url::ParseError),

	#[error("pull unavailable: {0}")]
	Unavailable(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
	#[error("config I/O error: {0}")]
	Io(#[from] std::io::Error),

	#[error("config encoding error: {0}")]
	Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("parse error: {0}")]
	Parse(String),

	#[error("failed to get home directory")]
	NoHomeDir,
}

/// Outcome of asking the host to leave a network.
#[derive(Debug, Error)]
pub enum LeaveError {
	#[error("node is already detached")]
	AlreadyDetached,

	#[error(transparent)]
	Failed(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, SyncError>;
