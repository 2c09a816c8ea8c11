// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Interfaces to the systems the engine drives but does not implement.

use crate::error::{LeaveError, PullError, StoreError};
use crate::store::{HostConfig, StoredConfig};
use async_trait::async_trait;
use mesh_common::{
	EgressInfo, EgressRoute, Host, HostAction, HostPull, Node, NodeSignal, PeerConfig,
	ServerRecord, Signal, Topic,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Controller for the local tunnel interface.
#[async_trait]
pub trait TunnelDriver: Send + Sync {
	async fn configure(&self, host: &Host, nodes: &[Node]) -> anyhow::Result<()>;
	async fn create(&self, host: &Host) -> anyhow::Result<()>;
	async fn close(&self) -> anyhow::Result<()>;
	/// Installs `peers`, dropping any peer not listed when `replace` is set.
	async fn set_peers(&self, peers: &[PeerConfig], replace: bool) -> anyhow::Result<()>;
	async fn set_egress_routes(&self, routes: &[EgressRoute]) -> anyhow::Result<()>;
}

#[async_trait]
pub trait Firewall: Send + Sync {
	async fn set_egress_routes(
		&self,
		server: &str,
		info: &HashMap<String, EgressInfo>,
	) -> anyhow::Result<()>;
	async fn delete_egress_gw_routes(&self, server: &str) -> anyhow::Result<()>;
}

/// Publish/subscribe connection to the coordinator.
#[async_trait]
pub trait ControlChannel: Send + Sync {
	fn is_connected(&self) -> bool;
	fn is_connection_open(&self) -> bool;
	async fn subscribe_node(&self, node: &Node) -> anyhow::Result<()>;
	async fn unsubscribe_node(&self, node: &Node) -> anyhow::Result<()>;
	async fn unsubscribe_host(&self, server: &str) -> anyhow::Result<()>;
	async fn clear_retained(&self, topic: &Topic) -> anyhow::Result<()>;
	async fn publish_host_update(
		&self,
		server: &str,
		action: HostAction,
		host: &Host,
	) -> anyhow::Result<()>;
	async fn publish_signal(&self, node: &Node, signal: NodeSignal) -> anyhow::Result<()>;
	async fn reconnect(&self, server: &ServerRecord) -> anyhow::Result<()>;
}

#[async_trait]
pub trait Decryptor: Send + Sync {
	async fn decrypt(&self, server: &str, payload: &[u8]) -> anyhow::Result<Vec<u8>>;
}

#[async_trait]
pub trait ConfigStore: Send + Sync {
	async fn load(&self) -> Result<StoredConfig, StoreError>;
	async fn write_nodes(&self, nodes: &BTreeMap<String, Node>) -> Result<(), StoreError>;
	async fn write_servers(&self, servers: &BTreeMap<String, ServerRecord>) -> Result<(), StoreError>;
	async fn write_host(&self, host: &HostConfig) -> Result<(), StoreError>;
}

/// Owner of the daemon process. Restarts end this process; the supervisor
/// is expected to start a fresh one.
#[async_trait]
pub trait Supervisor: Send + Sync {
	async fn upgrade_to(&self, version: &str) -> anyhow::Result<()>;
	async fn restart(&self) -> anyhow::Result<()>;
	async fn hard_restart(&self) -> anyhow::Result<()>;
}

/// Host-level operations outside the engine's own state.
#[async_trait]
pub trait HostOps: Send + Sync {
	async fn leave_network(&self, network: &str) -> Result<(), LeaveError>;
	async fn process_signal(&self, signal: &Signal) -> anyhow::Result<()>;
	async fn rotate_keys(&self) -> anyhow::Result<()>;
}

/// One-shot request/response snapshot of this host's configuration.
#[async_trait]
pub trait PullSource: Send + Sync {
	async fn pull(&self) -> Result<HostPull, PullError>;
}

#[derive(Clone)]
pub struct Collaborators {
	pub tunnel: Arc<dyn TunnelDriver>,
	pub firewall: Arc<dyn Firewall>,
	pub channel: Arc<dyn ControlChannel>,
	pub decryptor: Arc<dyn Decryptor>,
	pub store: Arc<dyn ConfigStore>,
	pub supervisor: Arc<dyn Supervisor>,
	pub host_ops: Arc<dyn HostOps>,
	pub pull: Arc<dyn PullSource>,
}
