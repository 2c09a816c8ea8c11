// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::host::Host;
use crate::keys::WgPublicKey;
use crate::node::Node;
use crate::peer::{HostInfoMap, PeerConfig};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;

/// Routes to install for a peer acting as an egress gateway.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EgressRoute {
	pub egress_id: String,
	pub node_addr: Option<IpNet>,
	pub node_addr6: Option<IpNet>,
	pub egress_ranges: Vec<IpNet>,
}

/// Firewall configuration when this host is itself an egress gateway.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EgressInfo {
	pub egress_id: String,
	pub network: String,
	pub egress_gw_addr: Option<IpNet>,
	pub egress_gw_addr6: Option<IpNet>,
	pub gw_ranges: Vec<IpNet>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FwUpdate {
	pub is_egress_gw: bool,
	pub egress_info: HashMap<String, EgressInfo>,
}

/// How one peer of a network must be proxied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyPeerMeta {
	pub is_relayed: bool,
	pub relay_to: Option<SocketAddr>,
	pub is_ext_client: bool,
	pub is_attached_ext_client: bool,
}

/// The proxied peer set of one network.
///
/// Peers absent from `peers` but registered locally on `network` are torn
/// down when the manifest is applied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyManifest {
	pub network: String,
	pub peers: HashMap<WgPublicKey, ProxyPeerMeta>,
}

/// Full peer list for this host from one coordinator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostPeerUpdate {
	pub server: String,
	pub server_version: String,
	pub peers: Vec<PeerConfig>,
	pub replace_peers: bool,
	pub host_network_info: HostInfoMap,
	pub egress_routes: Vec<EgressRoute>,
	pub fw_update: FwUpdate,
	pub proxy: Option<ProxyManifest>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
	pub name: String,
	pub version: String,
	pub broker: String,
	pub api: String,
	pub is_pro: bool,
}

/// Snapshot returned by the HTTP pull endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostPull {
	pub host: Host,
	pub nodes: Vec<Node>,
	pub peers: Vec<PeerConfig>,
	pub server_config: ServerConfig,
	pub host_network_info: HostInfoMap,
	pub egress_routes: Vec<EgressRoute>,
	pub fw_update: FwUpdate,
	pub replace_peers: bool,
	pub proxy: Option<ProxyManifest>,
}

impl HostPull {
	/// The peer-bearing half of the snapshot, shaped like a pushed update.
	pub fn peer_update(&self) -> HostPeerUpdate {
		HostPeerUpdate {
			server: self.server_config.name.clone(),
			server_version: self.server_config.version.clone(),
			peers: self.peers.clone(),
			replace_peers: self.replace_peers,
			host_network_info: self.host_network_info.clone(),
			egress_routes: self.egress_routes.clone(),
			fw_update: self.fw_update.clone(),
			proxy: self.proxy.clone(),
		}
	}
}
