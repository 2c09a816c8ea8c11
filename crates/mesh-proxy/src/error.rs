// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use mesh_common::WgPublicKey;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
	#[error("relay endpoint is missing for relayed peer {0}")]
	MissingRelay(WgPublicKey),

	#[error("peer {0} has no endpoint to proxy to")]
	NoEndpoint(WgPublicKey),

	#[error("proxy server is not running")]
	ServerNotRunning,

	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProxyError>;
