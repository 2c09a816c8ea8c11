// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::delta::iface_delta;
use crate::engine::{Outcome, RestartKind, SkipReason, SyncEngine};
use crate::error::{Result, SyncError};
use crate::state::apply_host_update;
use mesh_common::{
	FwUpdate, HostPeerUpdate, HostPull, MessageClass, PeerConfig, ProxyManifest, ProxyPeerMeta,
};
use mesh_common_version::version_less_than;
use mesh_proxy::{Connection, ProxyError};
use tracing::{debug, error, info, instrument, warn};

async fn proxy_is_current(conn: &Connection, peer: &PeerConfig, meta: &ProxyPeerMeta) -> bool {
	let config = conn.config().await;
	let relay = if meta.is_relayed { meta.relay_to } else { None };
	config.peer.endpoint == peer.endpoint
		&& config.peer.allowed_ips == peer.allowed_ips
		&& conn.relayed_endpoint() == relay
		&& conn.is_attached_ext_client() == meta.is_attached_ext_client
		&& conn.is_running().await
}

impl SyncEngine {
	#[instrument(skip(self, payload))]
	pub(crate) async fn on_peer_update(&self, server: &str, payload: &[u8]) -> Result<Outcome> {
		{
			let state = self.state.read().await;
			if state.nodes.is_empty() {
				return Err(SyncError::NoNodes);
			}
			if !state.servers.contains_key(server) {
				return Err(SyncError::UnknownServer(server.to_string()));
			}
		}

		let data = self.decrypt(server, payload).await?;
		if self
			.cache
			.is_duplicate(server, MessageClass::HostPeerUpdate, &data)
			.await
		{
			debug!("peer update unchanged, skipping");
			return Ok(Outcome::Skipped(SkipReason::Duplicate));
		}

		let update: HostPeerUpdate = serde_json::from_slice(&data)?;
		info!(peers = update.peers.len(), "processing peer update");

		let outcome = self.apply_peer_update(server, update, false).await?;
		if outcome == Outcome::Applied {
			self
				.cache
				.record(server, MessageClass::HostPeerUpdate, &data)
				.await;
		}
		Ok(outcome)
	}

	/// Merge-and-apply shared by pushed peer updates and pulled snapshots.
	pub(crate) async fn apply_peer_update(
		&self,
		server: &str,
		update: HostPeerUpdate,
		reset_interface: bool,
	) -> Result<Outcome> {
		if let Some(outcome) = self.auto_update(&update.server_version).await? {
			return Ok(outcome);
		}

		let version_changed = {
			let mut state = self.state.write().await;
			let record = state
				.servers
				.get_mut(server)
				.ok_or_else(|| SyncError::UnknownServer(server.to_string()))?;
			if record.version != update.server_version {
				info!(%server, version = %update.server_version, "updating server version");
				record.version = update.server_version.clone();
				true
			} else {
				false
			}
		};
		if version_changed {
			self.persist_servers().await;
		}

		self.state.write().await.host.peers = update.peers.clone();
		if let Err(e) = self.write_host().await {
			warn!(error = %e, "failed to write host config");
		}

		if update.replace_peers {
			self.prune_detected_endpoints().await;
		} else {
			for peer in update.peers.iter().filter(|peer| peer.remove) {
				self.registry().forget_detected_endpoint(&peer.public_key).await;
			}
		}

		if let Some(manifest) = &update.proxy {
			self.reconcile_proxies(manifest, &update.peers).await;
		}

		let peers = self.driver_peers(update.peers.clone()).await;
		self
			.collab
			.tunnel
			.set_peers(&peers, update.replace_peers)
			.await
			.map_err(|e| SyncError::apply("peer set", e))?;

		if !update.egress_routes.is_empty() {
			if let Err(e) = self
				.collab
				.tunnel
				.set_egress_routes(&update.egress_routes)
				.await
			{
				warn!(error = %e, "failed to set egress routes");
			}
		}

		self
			.detector
			.detect(&update.peers, &update.host_network_info)
			.await;

		self.apply_fw_update(server, &update.fw_update).await;

		if reset_interface {
			self.reset_interface().await?;
		}

		info!(peers = peers.len(), replace = update.replace_peers, "peers applied");
		Ok(Outcome::Applied)
	}

	/// Upgrades in place when the coordinator runs a newer version and the
	/// host allows it. A version pair that cannot be compared aborts the
	/// message.
	async fn auto_update(&self, server_version: &str) -> Result<Option<Outcome>> {
		let client_version = self.config.client_version.as_str();
		if server_version == client_version {
			return Ok(None);
		}

		warn!(server = %server_version, client = %client_version, "server/client version mismatch");
		let behind = version_less_than(client_version, server_version)?;
		let auto_update = self.state.read().await.host.host.auto_update;
		if !behind || !auto_update {
			return Ok(None);
		}

		info!(version = %server_version, "updating client to server's version");
		if let Err(e) = self.collab.supervisor.upgrade_to(server_version).await {
			error!(error = %e, "error updating client to server's version");
			return Ok(None);
		}
		Ok(self.request_restart(RestartKind::Hard).await)
	}

	/// Brings the registered proxies of `manifest.network` in line with the
	/// manifest. Individual peers that cannot be proxied are skipped.
	#[instrument(skip_all, fields(network = %manifest.network))]
	async fn reconcile_proxies(&self, manifest: &ProxyManifest, peers: &[PeerConfig]) {
		if !self.registry().is_proxy_enabled() {
			return;
		}
		let Some(interface) = self.state.read().await.interface_handle() else {
			warn!("host has no public key yet, skipping proxy reconciliation");
			return;
		};
		let network = manifest.network.as_str();

		for key in self.registry().peers_on(network).await {
			if !manifest.peers.contains_key(&key) {
				self.proxies.remove_peer(network, &key).await;
			}
		}

		for peer in peers {
			if peer.remove {
				self.proxies.remove_peer(network, &peer.public_key).await;
				continue;
			}
			let Some(meta) = manifest.peers.get(&peer.public_key) else {
				continue;
			};
			if let Some(conn) = self.registry().get_peer(network, &peer.public_key).await {
				if proxy_is_current(&conn, peer, meta).await {
					continue;
				}
			}

			let peer_address = peer.allowed_ips.first().map(|net| net.addr());
			match self
				.proxies
				.add_peer(&interface, network, peer.clone(), peer_address, meta)
				.await
			{
				Ok(_) => {}
				Err(e @ (ProxyError::MissingRelay(_) | ProxyError::NoEndpoint(_))) => {
					warn!(peer = %peer.public_key, error = %e, "cannot proxy peer");
				}
				Err(e) => error!(peer = %peer.public_key, error = %e, "failed to start peer proxy"),
			}
		}
	}

	async fn apply_fw_update(&self, server: &str, update: &FwUpdate) {
		let result = if update.is_egress_gw {
			self
				.collab
				.firewall
				.set_egress_routes(server, &update.egress_info)
				.await
		} else {
			self.collab.firewall.delete_egress_gw_routes(server).await
		};
		if let Err(e) = result {
			warn!(%server, error = %e, "failed to apply firewall update");
		}
	}

	/// Pulls a snapshot over HTTP and applies it like a pushed update.
	pub async fn pull_and_apply(&self) -> Result<Outcome> {
		self.ensure_running()?;
		let pull = self.collab.pull.pull().await?;
		self.apply_pull(pull).await
	}

	#[instrument(skip_all, fields(nodes = pull.nodes.len(), peers = pull.peers.len()))]
	pub async fn apply_pull(&self, pull: HostPull) -> Result<Outcome> {
		self.ensure_running()?;

		let (server, reset_interface) = {
			let mut state = self.state.write().await;
			let server = state
				.host
				.current_server
				.clone()
				.filter(|name| state.servers.contains_key(name))
				.ok_or_else(|| {
					SyncError::UnknownServer(state.host.current_server.clone().unwrap_or_default())
				})?;

			let mut reset = !pull.host.id.is_empty()
				&& apply_host_update(&mut state.host.host, &pull.host).reset_interface;
			for node in &pull.nodes {
				let mut node = node.clone();
				node.action = Default::default();
				if node.server.is_empty() {
					node.server = server.clone();
				}
				reset |= match state.nodes.get(&node.network) {
					Some(current) => iface_delta(current, &node),
					None => true,
				};
				if let Some(record) = state.servers.get_mut(&server) {
					record.networks.insert(node.network.clone());
				}
				state.nodes.insert(node.network.clone(), node);
			}
			(server, reset)
		};
		self.persist_nodes().await;

		let mut update = pull.peer_update();
		update.server = server.clone();
		self.apply_peer_update(&server, update, reset_interface).await
	}
}
