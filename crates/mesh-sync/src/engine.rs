// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::cache::LastMessageCache;
use crate::collaborators::Collaborators;
use crate::config::SyncConfig;
use crate::error::{Result, StoreError, SyncError};
use crate::state::LocalState;
use mesh_common::{PeerConfig, ServerRecord, Topic, WgPublicKey};
use mesh_proxy::{EndpointDetector, PeerProxy, Prober, ProxyRegistry};
use std::collections::HashSet;
use std::sync::{Arc, OnceLock};
use tokio::sync::RwLock;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartKind {
	Soft,
	Hard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
	Running,
	/// A restart was handed to the supervisor; nothing more is applied.
	Terminated(RestartKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
	Duplicate,
	EmptyPayload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
	Applied,
	Skipped(SkipReason),
	Restarting(RestartKind),
	/// The node left its network.
	Left,
}

/// Applies coordinator messages to the local host.
///
/// Each message is an independent unit of work. Shared state is only
/// locked to read a snapshot or to write a result, never across calls to
/// collaborators.
pub struct SyncEngine {
	pub(crate) config: SyncConfig,
	pub(crate) state: RwLock<LocalState>,
	pub(crate) cache: LastMessageCache,
	pub(crate) collab: Collaborators,
	pub(crate) proxies: PeerProxy,
	pub(crate) detector: EndpointDetector,
	terminal: OnceLock<RestartKind>,
}

impl SyncEngine {
	pub fn new(
		config: SyncConfig,
		collab: Collaborators,
		state: LocalState,
		registry: Arc<ProxyRegistry>,
		prober: Arc<dyn Prober>,
	) -> Self {
		registry.set_proxy_enabled(config.proxy_enabled);
		let detector = EndpointDetector::new(Arc::clone(&registry), prober, config.detector);
		let proxies = PeerProxy::with_remote_port(registry, config.proxy_port);

		Self {
			config,
			state: RwLock::new(state),
			cache: LastMessageCache::new(),
			collab,
			proxies,
			detector,
			terminal: OnceLock::new(),
		}
	}

	/// Builds an engine from the state persisted in the config store.
	#[instrument(skip_all)]
	pub async fn load(
		config: SyncConfig,
		collab: Collaborators,
		registry: Arc<ProxyRegistry>,
		prober: Arc<dyn Prober>,
	) -> std::result::Result<Self, StoreError> {
		let stored = collab.store.load().await?;
		info!(
			nodes = stored.nodes.len(),
			servers = stored.servers.len(),
			"loaded local config"
		);
		Ok(Self::new(config, collab, stored.into(), registry, prober))
	}

	pub fn state(&self) -> EngineState {
		match self.terminal.get() {
			Some(kind) => EngineState::Terminated(*kind),
			None => EngineState::Running,
		}
	}

	pub fn is_terminated(&self) -> bool {
		self.terminal.get().is_some()
	}

	pub fn config(&self) -> &SyncConfig {
		&self.config
	}

	pub fn registry(&self) -> &Arc<ProxyRegistry> {
		self.proxies.registry()
	}

	pub fn detector(&self) -> &EndpointDetector {
		&self.detector
	}

	pub fn collaborators(&self) -> &Collaborators {
		&self.collab
	}

	pub async fn snapshot(&self) -> LocalState {
		self.state.read().await.clone()
	}

	pub async fn current_server(&self) -> Option<ServerRecord> {
		self.state.read().await.current_server().cloned()
	}

	/// Entry point for the control channel. Failures are logged here and
	/// never reach the caller.
	pub async fn handle_message(&self, topic: &str, payload: &[u8]) -> Option<Outcome> {
		let result = match topic.parse::<Topic>() {
			Ok(topic) => self.process(&topic, payload).await,
			Err(e) => Err(e.into()),
		};

		match result {
			Ok(outcome) => Some(outcome),
			Err(e) => {
				match &e {
					SyncError::Terminated => debug!(%topic, "dropping message, restart pending"),
					SyncError::Apply { .. } | SyncError::Persist(_) | SyncError::Leave { .. } => {
						error!(%topic, error = %e, "failed to apply control message")
					}
					_ => warn!(%topic, error = %e, "dropped control message"),
				}
				None
			}
		}
	}

	#[instrument(skip_all, fields(topic = %topic, len = payload.len()))]
	pub async fn process(&self, topic: &Topic, payload: &[u8]) -> Result<Outcome> {
		self.ensure_running()?;
		match topic {
			Topic::NodeUpdate { network, .. } => self.on_node_update(network, payload).await,
			Topic::HostPeerUpdate { server, .. } => self.on_peer_update(server, payload).await,
			Topic::HostUpdate { server, .. } => self.on_host_update(topic, server, payload).await,
		}
	}

	pub(crate) fn ensure_running(&self) -> Result<()> {
		if self.is_terminated() {
			return Err(SyncError::Terminated);
		}
		Ok(())
	}

	pub(crate) async fn decrypt(&self, server: &str, payload: &[u8]) -> Result<Vec<u8>> {
		self
			.collab
			.decryptor
			.decrypt(server, payload)
			.await
			.map_err(|source| SyncError::Decrypt {
				server: server.to_string(),
				source,
			})
	}

	/// Hands the process to the supervisor. Returns `None` when the request
	/// failed and the engine keeps running.
	pub(crate) async fn request_restart(&self, kind: RestartKind) -> Option<Outcome> {
		let result = match kind {
			RestartKind::Soft => self.collab.supervisor.restart().await,
			RestartKind::Hard => self.collab.supervisor.hard_restart().await,
		};
		if let Err(e) = result {
			error!(?kind, error = %e, "failed to restart daemon");
			return None;
		}

		let _ = self.terminal.set(kind);
		self.detector.shutdown().await;
		info!(?kind, "restart requested, engine terminated");
		Some(Outcome::Restarting(kind))
	}

	pub(crate) async fn persist_nodes(&self) {
		let nodes = self.state.read().await.nodes.clone();
		if let Err(e) = self.collab.store.write_nodes(&nodes).await {
			warn!(error = %e, "failed to write node config");
		}
	}

	pub(crate) async fn persist_servers(&self) {
		let servers = self.state.read().await.servers.clone();
		if let Err(e) = self.collab.store.write_servers(&servers).await {
			warn!(error = %e, "failed to write server config");
		}
	}

	pub(crate) async fn write_host(&self) -> std::result::Result<(), StoreError> {
		let host = self.state.read().await.host.clone();
		self.collab.store.write_host(&host).await
	}

	/// Drops detected endpoints of peers the host no longer has.
	pub(crate) async fn prune_detected_endpoints(&self) {
		let current: HashSet<WgPublicKey> = self
			.state
			.read()
			.await
			.host
			.peers
			.iter()
			.filter(|peer| !peer.remove)
			.map(|peer| peer.public_key)
			.collect();
		let dropped = self
			.registry()
			.retain_detected_endpoints(|key| current.contains(key))
			.await;
		if dropped > 0 {
			debug!(dropped, "forgot detected endpoints of departed peers");
		}
	}

	/// Peer list as the tunnel driver should see it: detected direct
	/// endpoints first, then proxy sockets for proxied peers.
	pub(crate) async fn driver_peers(&self, mut peers: Vec<PeerConfig>) -> Vec<PeerConfig> {
		self.registry().apply_detected_endpoints(&mut peers).await;
		let networks: Vec<String> = self.state.read().await.nodes.keys().cloned().collect();
		for network in networks {
			self
				.proxies
				.rewrite_endpoints_for_proxy(&network, &mut peers)
				.await;
		}
		peers
	}

	/// Closes and recreates the tunnel interface, then reinstalls peers.
	#[instrument(skip(self))]
	pub(crate) async fn reset_interface(&self) -> Result<()> {
		let (host, nodes, peers, interface) = {
			let state = self.state.read().await;
			(
				state.host.host.clone(),
				state.node_list(),
				state.host.peers.clone(),
				state.interface_handle(),
			)
		};

		if let Err(e) = self.collab.tunnel.close().await {
			warn!(error = %e, "failed to close tunnel interface");
		}
		self
			.collab
			.tunnel
			.create(&host)
			.await
			.map_err(|e| SyncError::apply("interface create", e))?;
		self
			.collab
			.tunnel
			.configure(&host, &nodes)
			.await
			.map_err(|e| SyncError::apply("interface configure", e))?;

		if let Some(interface) = &interface {
			self.proxies.reset_peers(interface).await;
		}

		let peers = self.driver_peers(peers).await;
		self
			.collab
			.tunnel
			.set_peers(&peers, false)
			.await
			.map_err(|e| SyncError::apply("peer set", e))?;

		info!("tunnel interface reset");
		Ok(())
	}

	/// Drops local state tied to `network`: its node, cache entries and
	/// proxies.
	pub(crate) async fn forget_network(&self, network: &str) {
		{
			let mut state = self.state.write().await;
			if let Some(node) = state.nodes.remove(network) {
				if let Some(server) = state.servers.get_mut(&node.server) {
					server.networks.remove(network);
				}
			}
		}
		self.cache.forget_scope(network).await;
		self.proxies.leave_network(network).await;
		self.persist_nodes().await;
		self.persist_servers().await;
	}
}
