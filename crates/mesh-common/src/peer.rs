// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::keys::WgPublicKey;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

/// Keepalive applied to a proxied peer when the coordinator leaves it unset.
pub const DEFAULT_KEEPALIVE_SECS: u16 = 25;

/// WireGuard-level configuration of one remote peer, as the coordinator
/// publishes it and as the tunnel driver consumes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
	pub public_key: WgPublicKey,
	#[serde(default)]
	pub endpoint: Option<SocketAddr>,
	#[serde(default)]
	pub allowed_ips: Vec<IpNet>,
	#[serde(default)]
	pub persistent_keepalive: Option<u16>,
	#[serde(default)]
	pub remove: bool,
	#[serde(default)]
	pub replace_allowed_ips: bool,
}

impl PeerConfig {
	pub fn new(public_key: WgPublicKey) -> Self {
		Self {
			public_key,
			endpoint: None,
			allowed_ips: Vec::new(),
			persistent_keepalive: None,
			remove: false,
			replace_allowed_ips: false,
		}
	}

	pub fn keepalive(&self) -> Option<Duration> {
		self
			.persistent_keepalive
			.map(|secs| Duration::from_secs(u64::from(secs)))
	}
}

/// A network interface a peer host advertised out of band.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetInterface {
	pub name: String,
	pub address: IpNet,
}

/// Out-of-band reachability information for one peer host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostInfo {
	#[serde(default)]
	pub interfaces: Vec<NetInterface>,
	#[serde(default)]
	pub listen_port: u16,
	#[serde(default)]
	pub is_static: bool,
}

pub type HostInfoMap = HashMap<WgPublicKey, HostInfo>;
