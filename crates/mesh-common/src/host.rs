// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::keys::WgPublicKey;
use crate::node::Node;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::IpAddr;

/// The local machine as the coordinator knows it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Host {
	pub id: String,
	pub name: String,
	pub version: String,
	pub public_key: Option<WgPublicKey>,
	pub interface: String,
	pub listen_port: u16,
	pub mtu: u16,
	pub endpoint_ip: Option<IpAddr>,
	pub is_static: bool,
	pub auto_update: bool,
	pub verbosity: u8,
	pub default_interface: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostAction {
	#[serde(rename = "UPGRADE")]
	Upgrade,
	#[serde(rename = "SIGNAL_HOST")]
	SignalHost,
	#[serde(rename = "UPDATE_HOST")]
	UpdateHost,
	#[serde(rename = "DELETE_HOST")]
	DeleteHost,
	#[serde(rename = "JOIN_HOST_TO_NETWORK")]
	JoinHostToNetwork,
	#[serde(rename = "ACK")]
	Acknowledgement,
	#[serde(rename = "REQ_ACK")]
	RequestAck,
	#[serde(rename = "UPDATE_KEYS")]
	UpdateKeys,
	#[serde(rename = "REQ_PULL")]
	RequestPull,
	#[serde(other)]
	Unknown,
}

/// A peer-to-peer signal relayed through the coordinator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Signal {
	pub server: String,
	pub from_host_id: String,
	pub to_host_id: String,
	pub from_host_key: Option<WgPublicKey>,
	pub to_host_key: Option<WgPublicKey>,
	pub action: String,
	pub reply: bool,
	pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostUpdate {
	pub action: HostAction,
	#[serde(default)]
	pub host: Host,
	#[serde(default)]
	pub node: Node,
	#[serde(default)]
	pub signal: Option<Signal>,
}

/// Local bookkeeping for one coordinator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerRecord {
	pub name: String,
	pub broker: String,
	pub api: String,
	pub version: String,
	pub is_pro: bool,
	pub networks: BTreeSet<String>,
}

impl ServerRecord {
	pub fn new(name: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			..Self::default()
		}
	}
}
