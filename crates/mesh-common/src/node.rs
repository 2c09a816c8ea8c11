// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeAction {
	#[default]
	Noop,
	Delete,
	#[serde(rename = "force")]
	ForceUpdate,
	#[serde(other)]
	Other,
}

/// Signals a node publishes back to the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeSignal {
	/// The local interface finished applying a change; peers may be refreshed.
	Done,
}

/// This host's membership in one network.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Node {
	pub id: String,
	pub host_id: String,
	pub network: String,
	pub server: String,
	pub address: Option<IpNet>,
	pub address6: Option<IpNet>,
	pub network_range: Option<IpNet>,
	pub network_range6: Option<IpNet>,
	pub connected: bool,
	pub is_relay: bool,
	pub is_relayed: bool,
	pub relayed_by: Option<String>,
	pub relayed_nodes: Vec<String>,
	pub is_egress_gateway: bool,
	pub egress_ranges: Vec<IpNet>,
	pub is_ingress_gateway: bool,
	pub persistent_keepalive: Option<u16>,
	pub action: NodeAction,
}
