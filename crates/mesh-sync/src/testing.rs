// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! In-memory collaborators that record every call.

use crate::collaborators::{
	Collaborators, ConfigStore, ControlChannel, Decryptor, Firewall, HostOps, PullSource,
	Supervisor, TunnelDriver,
};
use crate::config::SyncConfig;
use crate::engine::SyncEngine;
use crate::error::{LeaveError, PullError, StoreError};
use crate::state::LocalState;
use crate::store::{HostConfig, StoredConfig};
use anyhow::anyhow;
use async_trait::async_trait;
use mesh_common::keys::KEY_LEN;
use mesh_common::{
	EgressInfo, EgressRoute, Host, HostAction, HostPull, Node, NodeSignal, PeerConfig,
	ServerRecord, Signal, Topic, WgPublicKey,
};
use mesh_proxy::{DetectorConfig, Prober, ProxyRegistry, ProxyServer};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const CLIENT_VERSION: &str = "v0.21.0";
pub const SERVER: &str = "coordinator";
pub const NETWORK: &str = "office";

pub fn key(byte: u8) -> WgPublicKey {
	WgPublicKey::from_bytes([byte; KEY_LEN])
}

pub fn payload<T: Serialize>(value: &T) -> Vec<u8> {
	serde_json::to_vec(value).unwrap()
}

pub fn node(network: &str) -> Node {
	Node {
		id: format!("{network}-node"),
		host_id: "host-1".to_string(),
		network: network.to_string(),
		server: SERVER.to_string(),
		address: Some("100.64.0.2/16".parse().unwrap()),
		connected: true,
		..Default::default()
	}
}

/// Local state with one node on [`NETWORK`] registered through [`SERVER`].
pub fn joined_state() -> LocalState {
	let mut state = LocalState::default();
	state.host.host = Host {
		id: "host-1".to_string(),
		name: "laptop".to_string(),
		version: CLIENT_VERSION.to_string(),
		public_key: Some(key(1)),
		interface: "mesh0".to_string(),
		listen_port: 51820,
		mtu: 1420,
		..Default::default()
	};
	state.host.current_server = Some(SERVER.to_string());
	let mut server = ServerRecord::new(SERVER);
	server.version = CLIENT_VERSION.to_string();
	server.broker = "wss://broker.example.com".to_string();
	server.networks.insert(NETWORK.to_string());
	state.servers.insert(SERVER.to_string(), server);
	state.nodes.insert(NETWORK.to_string(), node(NETWORK));
	state
}

pub fn peer(byte: u8, endpoint: &str) -> PeerConfig {
	let mut peer = PeerConfig::new(key(byte));
	peer.endpoint = Some(endpoint.parse().unwrap());
	peer.allowed_ips = vec![format!("100.64.0.{byte}/32").parse().unwrap()];
	peer
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelCall {
	Configure { nodes: usize },
	Create,
	Close,
	SetPeers { peers: Vec<PeerConfig>, replace: bool },
	SetEgressRoutes(usize),
}

#[derive(Default)]
pub struct RecordingTunnel {
	pub calls: Mutex<Vec<TunnelCall>>,
	pub fail_configure: AtomicBool,
	pub fail_set_peers: AtomicBool,
}

impl RecordingTunnel {
	pub fn calls(&self) -> Vec<TunnelCall> {
		self.calls.lock().unwrap().clone()
	}

	pub fn last_peers(&self) -> Option<Vec<PeerConfig>> {
		self.calls().into_iter().rev().find_map(|call| match call {
			TunnelCall::SetPeers { peers, .. } => Some(peers),
			_ => None,
		})
	}
}

#[async_trait]
impl TunnelDriver for RecordingTunnel {
	async fn configure(&self, _host: &Host, nodes: &[Node]) -> anyhow::Result<()> {
		self.calls.lock().unwrap().push(TunnelCall::Configure { nodes: nodes.len() });
		if self.fail_configure.load(Ordering::SeqCst) {
			return Err(anyhow!("configure failed"));
		}
		Ok(())
	}

	async fn create(&self, _host: &Host) -> anyhow::Result<()> {
		self.calls.lock().unwrap().push(TunnelCall::Create);
		Ok(())
	}

	async fn close(&self) -> anyhow::Result<()> {
		self.calls.lock().unwrap().push(TunnelCall::Close);
		Ok(())
	}

	async fn set_peers(&self, peers: &[PeerConfig], replace: bool) -> anyhow::Result<()> {
		self.calls.lock().unwrap().push(TunnelCall::SetPeers {
			peers: peers.to_vec(),
			replace,
		});
		if self.fail_set_peers.load(Ordering::SeqCst) {
			return Err(anyhow!("set peers failed"));
		}
		Ok(())
	}

	async fn set_egress_routes(&self, routes: &[EgressRoute]) -> anyhow::Result<()> {
		self
			.calls
			.lock()
			.unwrap()
			.push(TunnelCall::SetEgressRoutes(routes.len()));
		Ok(())
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirewallCall {
	SetEgressRoutes(String),
	DeleteEgressGwRoutes(String),
}

#[derive(Default)]
pub struct RecordingFirewall {
	pub calls: Mutex<Vec<FirewallCall>>,
}

impl RecordingFirewall {
	pub fn calls(&self) -> Vec<FirewallCall> {
		self.calls.lock().unwrap().clone()
	}
}

#[async_trait]
impl Firewall for RecordingFirewall {
	async fn set_egress_routes(
		&self,
		server: &str,
		_info: &HashMap<String, EgressInfo>,
	) -> anyhow::Result<()> {
		self
			.calls
			.lock()
			.unwrap()
			.push(FirewallCall::SetEgressRoutes(server.to_string()));
		Ok(())
	}

	async fn delete_egress_gw_routes(&self, server: &str) -> anyhow::Result<()> {
		self
			.calls
			.lock()
			.unwrap()
			.push(FirewallCall::DeleteEgressGwRoutes(server.to_string()));
		Ok(())
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelCall {
	Subscribe(String),
	Unsubscribe(String),
	UnsubscribeHost(String),
	ClearRetained(String),
	PublishHostUpdate(String, HostAction),
	Signal(String, NodeSignal),
	Reconnect(String),
}

#[derive(Default)]
pub struct FakeChannel {
	pub connected: AtomicBool,
	pub calls: Mutex<Vec<ChannelCall>>,
}

impl FakeChannel {
	pub fn calls(&self) -> Vec<ChannelCall> {
		self.calls.lock().unwrap().clone()
	}

	fn push(&self, call: ChannelCall) -> anyhow::Result<()> {
		self.calls.lock().unwrap().push(call);
		Ok(())
	}
}

#[async_trait]
impl ControlChannel for FakeChannel {
	fn is_connected(&self) -> bool {
		self.connected.load(Ordering::SeqCst)
	}

	fn is_connection_open(&self) -> bool {
		self.connected.load(Ordering::SeqCst)
	}

	async fn subscribe_node(&self, node: &Node) -> anyhow::Result<()> {
		self.push(ChannelCall::Subscribe(node.network.clone()))
	}

	async fn unsubscribe_node(&self, node: &Node) -> anyhow::Result<()> {
		self.push(ChannelCall::Unsubscribe(node.network.clone()))
	}

	async fn unsubscribe_host(&self, server: &str) -> anyhow::Result<()> {
		self.push(ChannelCall::UnsubscribeHost(server.to_string()))
	}

	async fn clear_retained(&self, topic: &Topic) -> anyhow::Result<()> {
		self.push(ChannelCall::ClearRetained(topic.to_string()))
	}

	async fn publish_host_update(
		&self,
		server: &str,
		action: HostAction,
		_host: &Host,
	) -> anyhow::Result<()> {
		self.push(ChannelCall::PublishHostUpdate(server.to_string(), action))
	}

	async fn publish_signal(&self, node: &Node, signal: NodeSignal) -> anyhow::Result<()> {
		self.push(ChannelCall::Signal(node.network.clone(), signal))
	}

	async fn reconnect(&self, server: &ServerRecord) -> anyhow::Result<()> {
		self.push(ChannelCall::Reconnect(server.name.clone()))
	}
}

/// Passes payloads through unchanged unless told to fail.
#[derive(Default)]
pub struct PlainDecryptor {
	pub fail: AtomicBool,
}

#[async_trait]
impl Decryptor for PlainDecryptor {
	async fn decrypt(&self, _server: &str, payload: &[u8]) -> anyhow::Result<Vec<u8>> {
		if self.fail.load(Ordering::SeqCst) {
			return Err(anyhow!("bad ciphertext"));
		}
		Ok(payload.to_vec())
	}
}

#[derive(Default)]
pub struct MemoryStore {
	pub nodes: Mutex<BTreeMap<String, Node>>,
	pub servers: Mutex<BTreeMap<String, ServerRecord>>,
	pub host: Mutex<HostConfig>,
	pub host_writes: AtomicUsize,
	pub fail_host: AtomicBool,
}

#[async_trait]
impl ConfigStore for MemoryStore {
	async fn load(&self) -> Result<StoredConfig, StoreError> {
		Ok(StoredConfig {
			host: self.host.lock().unwrap().clone(),
			nodes: self.nodes.lock().unwrap().clone(),
			servers: self.servers.lock().unwrap().clone(),
		})
	}

	async fn write_nodes(&self, nodes: &BTreeMap<String, Node>) -> Result<(), StoreError> {
		*self.nodes.lock().unwrap() = nodes.clone();
		Ok(())
	}

	async fn write_servers(&self, servers: &BTreeMap<String, ServerRecord>) -> Result<(), StoreError> {
		*self.servers.lock().unwrap() = servers.clone();
		Ok(())
	}

	async fn write_host(&self, host: &HostConfig) -> Result<(), StoreError> {
		if self.fail_host.load(Ordering::SeqCst) {
			return Err(StoreError::Io(std::io::Error::other("disk full")));
		}
		self.host_writes.fetch_add(1, Ordering::SeqCst);
		*self.host.lock().unwrap() = host.clone();
		Ok(())
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorCall {
	UpgradeTo(String),
	Restart,
	HardRestart,
}

#[derive(Default)]
pub struct RecordingSupervisor {
	pub calls: Mutex<Vec<SupervisorCall>>,
}

impl RecordingSupervisor {
	pub fn calls(&self) -> Vec<SupervisorCall> {
		self.calls.lock().unwrap().clone()
	}
}

#[async_trait]
impl Supervisor for RecordingSupervisor {
	async fn upgrade_to(&self, version: &str) -> anyhow::Result<()> {
		self
			.calls
			.lock()
			.unwrap()
			.push(SupervisorCall::UpgradeTo(version.to_string()));
		Ok(())
	}

	async fn restart(&self) -> anyhow::Result<()> {
		self.calls.lock().unwrap().push(SupervisorCall::Restart);
		Ok(())
	}

	async fn hard_restart(&self) -> anyhow::Result<()> {
		self.calls.lock().unwrap().push(SupervisorCall::HardRestart);
		Ok(())
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LeaveBehaviour {
	#[default]
	Leave,
	AlreadyDetached,
	Fail,
}

#[derive(Default)]
pub struct FakeHostOps {
	pub leave: Mutex<LeaveBehaviour>,
	pub left: Mutex<Vec<String>>,
	pub signals: Mutex<Vec<Signal>>,
	pub key_rotations: AtomicUsize,
}

#[async_trait]
impl HostOps for FakeHostOps {
	async fn leave_network(&self, network: &str) -> Result<(), LeaveError> {
		self.left.lock().unwrap().push(network.to_string());
		match *self.leave.lock().unwrap() {
			LeaveBehaviour::Leave => Ok(()),
			LeaveBehaviour::AlreadyDetached => Err(LeaveError::AlreadyDetached),
			LeaveBehaviour::Fail => Err(LeaveError::Failed(anyhow!("permission denied"))),
		}
	}

	async fn process_signal(&self, signal: &Signal) -> anyhow::Result<()> {
		self.signals.lock().unwrap().push(signal.clone());
		Ok(())
	}

	async fn rotate_keys(&self) -> anyhow::Result<()> {
		self.key_rotations.fetch_add(1, Ordering::SeqCst);
		Ok(())
	}
}

#[derive(Default)]
pub struct FakePull {
	pub response: Mutex<Option<HostPull>>,
	pub attempts: AtomicUsize,
}

impl FakePull {
	pub fn attempts(&self) -> usize {
		self.attempts.load(Ordering::SeqCst)
	}
}

#[async_trait]
impl PullSource for FakePull {
	async fn pull(&self) -> Result<HostPull, PullError> {
		self.attempts.fetch_add(1, Ordering::SeqCst);
		self
			.response
			.lock()
			.unwrap()
			.clone()
			.ok_or_else(|| PullError::Unavailable("coordinator unreachable".to_string()))
	}
}

/// Never gets an answer.
pub struct SilentProber;

#[async_trait]
impl Prober for SilentProber {
	async fn probe(
		&self,
		_target: SocketAddr,
		_peer: &WgPublicKey,
		_wait: Duration,
	) -> mesh_proxy::Result<Option<Duration>> {
		Ok(None)
	}
}

#[derive(Default)]
pub struct Harness {
	pub tunnel: Arc<RecordingTunnel>,
	pub firewall: Arc<RecordingFirewall>,
	pub channel: Arc<FakeChannel>,
	pub decryptor: Arc<PlainDecryptor>,
	pub store: Arc<MemoryStore>,
	pub supervisor: Arc<RecordingSupervisor>,
	pub host_ops: Arc<FakeHostOps>,
	pub pull: Arc<FakePull>,
}

impl Harness {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn collaborators(&self) -> Collaborators {
		Collaborators {
			tunnel: self.tunnel.clone(),
			firewall: self.firewall.clone(),
			channel: self.channel.clone(),
			decryptor: self.decryptor.clone(),
			store: self.store.clone(),
			supervisor: self.supervisor.clone(),
			host_ops: self.host_ops.clone(),
			pull: self.pull.clone(),
		}
	}

	pub fn config() -> SyncConfig {
		SyncConfig {
			client_version: CLIENT_VERSION.to_string(),
			proxy_enabled: false,
			proxy_port: mesh_proxy::PROXY_PORT,
			fallback_interval: Duration::from_secs(30),
			signal_settle: Duration::ZERO,
			detector: DetectorConfig {
				max_concurrent_probes: Some(4),
				probe_timeout: Duration::from_millis(50),
			},
			config_dir: std::env::temp_dir().join("mesh-sync-tests"),
		}
	}

	pub fn engine(&self, state: LocalState) -> SyncEngine {
		self.engine_with(Self::config(), state)
	}

	pub fn engine_with(&self, config: SyncConfig, state: LocalState) -> SyncEngine {
		self.engine_on(config, state, Arc::new(ProxyRegistry::new(false)))
	}

	pub fn engine_on(
		&self,
		config: SyncConfig,
		state: LocalState,
		registry: Arc<ProxyRegistry>,
	) -> SyncEngine {
		SyncEngine::new(config, self.collaborators(), state, registry, Arc::new(SilentProber))
	}

	/// Proxy-enabled engine backed by a listener on an ephemeral loopback
	/// port.
	pub async fn proxied_engine(&self, state: LocalState) -> (SyncEngine, ProxyServer) {
		let registry = Arc::new(ProxyRegistry::new(true));
		let local_key = state.host.host.public_key.unwrap_or(key(1));
		let server = ProxyServer::bind("127.0.0.1:0".parse().unwrap(), local_key, Arc::clone(&registry))
			.await
			.unwrap();
		let mut config = Self::config();
		config.proxy_enabled = true;
		(self.engine_on(config, state, registry), server)
	}
}
