// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::Result;
use crate::proxy::{InterfaceHandle, LocalSocket, Proxy, ProxyConfig};
use mesh_common::{PeerConfig, PeerHash, WgPublicKey};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tracing::debug;

/// A registered proxy for one remote peer.
///
/// A connection is relayed exactly when it carries a relay endpoint. The
/// proxy lock is only held to read or swap state; joining forwarders and
/// binding sockets happen outside it.
#[derive(Debug)]
pub struct Connection {
	key: WgPublicKey,
	relay: Option<SocketAddr>,
	is_attached_ext_client: bool,
	proxy: RwLock<Proxy>,
}

impl Connection {
	pub fn new(
		key: WgPublicKey,
		relay: Option<SocketAddr>,
		is_attached_ext_client: bool,
		proxy: Proxy,
	) -> Self {
		Self {
			key,
			relay,
			is_attached_ext_client,
			proxy: RwLock::new(proxy),
		}
	}

	pub fn key(&self) -> &WgPublicKey {
		&self.key
	}

	pub fn is_relayed(&self) -> bool {
		self.relay.is_some()
	}

	pub fn relayed_endpoint(&self) -> Option<SocketAddr> {
		self.relay
	}

	pub fn is_attached_ext_client(&self) -> bool {
		self.is_attached_ext_client
	}

	pub async fn config(&self) -> ProxyConfig {
		self.proxy.read().await.config().clone()
	}

	pub async fn local_addr(&self) -> Option<SocketAddr> {
		self.proxy.read().await.local_addr()
	}

	pub(crate) async fn local_socket(&self) -> Option<Arc<UdpSocket>> {
		let proxy = self.proxy.read().await;
		proxy.local_socket().map(|local| Arc::clone(local.socket()))
	}

	pub async fn is_running(&self) -> bool {
		self.proxy.read().await.is_running()
	}

	/// Hash-index record describing this connection.
	pub async fn remote_peer(&self) -> RemotePeer {
		let proxy = self.proxy.read().await;
		let config = proxy.config();
		RemotePeer {
			network: config.network.clone(),
			interface: config.interface.name.clone(),
			peer_key: self.key,
			is_ext_client: config.is_ext_client,
			endpoint: config.peer_endpoint,
			is_attached_ext_client: self.is_attached_ext_client,
			local_conn: proxy.local_addr(),
		}
	}

	pub async fn stop(&self) {
		let halted = self.proxy.write().await.close();
		halted.join().await;
	}

	/// Restarts the forwarder against `interface`, keeping the loopback
	/// port the tunnel driver already points at.
	pub async fn reset(&self, interface: &InterfaceHandle) -> Result<()> {
		let (halted, local) = {
			let mut proxy = self.proxy.write().await;
			proxy.set_interface(interface.clone());
			(proxy.halt(), proxy.local_socket())
		};
		halted.join().await;

		match local {
			Some(local) => local.socket().connect(interface.tunnel_addr()).await?,
			None => {
				let local = LocalSocket::bind(interface).await?;
				self.proxy.write().await.attach(local);
			}
		}

		self.proxy.write().await.resume();
		debug!(peer = %self.key, "proxy reset");
		Ok(())
	}
}

/// Secondary record of a proxied peer, indexed by key hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePeer {
	pub network: String,
	pub interface: String,
	pub peer_key: WgPublicKey,
	pub is_ext_client: bool,
	pub endpoint: SocketAddr,
	pub is_attached_ext_client: bool,
	pub local_conn: Option<SocketAddr>,
}

impl RemotePeer {
	pub fn hash(&self) -> PeerHash {
		self.peer_key.hash()
	}
}

/// A directly reachable endpoint found by probing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectedEndpoint {
	pub endpoint: SocketAddr,
	pub latency: Duration,
}

/// Process-wide table of proxied peers.
///
/// Shared by reference; every map sits behind its own lock so lookups on
/// one index never wait on writers of another.
#[derive(Debug, Default)]
pub struct ProxyRegistry {
	proxy_enabled: AtomicBool,
	transport: RwLock<Option<Arc<UdpSocket>>>,
	networks: RwLock<HashMap<String, HashMap<WgPublicKey, Arc<Connection>>>>,
	by_hash: RwLock<HashMap<PeerHash, RemotePeer>>,
	ext_clients: RwLock<HashMap<SocketAddr, RemotePeer>>,
	detected: RwLock<HashMap<WgPublicKey, DetectedEndpoint>>,
}

impl ProxyRegistry {
	pub fn new(proxy_enabled: bool) -> Self {
		Self {
			proxy_enabled: AtomicBool::new(proxy_enabled),
			..Default::default()
		}
	}

	pub fn is_proxy_enabled(&self) -> bool {
		self.proxy_enabled.load(Ordering::Acquire)
	}

	pub fn set_proxy_enabled(&self, enabled: bool) {
		self.proxy_enabled.store(enabled, Ordering::Release);
	}

	/// Socket every proxy sends through, owned by the running
	/// [`ProxyServer`](crate::ProxyServer).
	pub async fn transport(&self) -> Option<Arc<UdpSocket>> {
		self.transport.read().await.clone()
	}

	pub(crate) async fn set_transport(&self, socket: Arc<UdpSocket>) {
		*self.transport.write().await = Some(socket);
	}

	/// Registers `conn` under `network`, returning the entry it replaced.
	pub async fn save_peer(&self, network: &str, conn: Arc<Connection>) -> Option<Arc<Connection>> {
		let mut networks = self.networks.write().await;
		networks
			.entry(network.to_string())
			.or_default()
			.insert(*conn.key(), conn)
	}

	pub async fn get_peer(&self, network: &str, key: &WgPublicKey) -> Option<Arc<Connection>> {
		let networks = self.networks.read().await;
		networks.get(network).and_then(|peers| peers.get(key)).cloned()
	}

	/// Keys registered on `network`, in unspecified order.
	pub async fn peers_on(&self, network: &str) -> Vec<WgPublicKey> {
		let networks = self.networks.read().await;
		networks
			.get(network)
			.map(|peers| peers.keys().copied().collect())
			.unwrap_or_default()
	}

	/// Every registered connection, across networks.
	pub async fn connections(&self) -> Vec<Arc<Connection>> {
		let networks = self.networks.read().await;
		networks
			.values()
			.flat_map(|peers| peers.values().cloned())
			.collect()
	}

	/// Drops the peer from `network` and from the hash indexes.
	pub async fn remove_peer(&self, network: &str, key: &WgPublicKey) -> Option<Arc<Connection>> {
		let removed = {
			let mut networks = self.networks.write().await;
			let removed = networks.get_mut(network).and_then(|peers| peers.remove(key));
			if networks.get(network).is_some_and(|peers| peers.is_empty()) {
				networks.remove(network);
			}
			removed
		};

		if removed.is_some() {
			self.unindex(network, key).await;
			debug!(%network, peer = %key, "removed proxied peer");
		}
		removed
	}

	/// Drops every peer of `network` and returns them for teardown.
	pub async fn remove_network(&self, network: &str) -> Vec<Arc<Connection>> {
		let removed: Vec<Arc<Connection>> = {
			let mut networks = self.networks.write().await;
			networks
				.remove(network)
				.map(|peers| peers.into_values().collect())
				.unwrap_or_default()
		};

		for conn in &removed {
			self.unindex(network, conn.key()).await;
		}
		removed
	}

	/// Clears the index entries `network` owned for `key`.
	///
	/// A key still proxied on another network is re-indexed to that
	/// connection; otherwise its detected endpoint goes as well.
	async fn unindex(&self, network: &str, key: &WgPublicKey) {
		let survivor = {
			let networks = self.networks.read().await;
			networks
				.values()
				.find_map(|peers| peers.get(key))
				.cloned()
		};
		let replacement = match &survivor {
			Some(conn) => Some(conn.remote_peer().await),
			None => None,
		};

		let hash = key.hash();
		{
			let mut by_hash = self.by_hash.write().await;
			if by_hash.get(&hash).is_some_and(|peer| peer.network == network) {
				match &replacement {
					Some(peer) => by_hash.insert(hash, peer.clone()),
					None => by_hash.remove(&hash),
				};
			}
		}
		{
			let mut ext_clients = self.ext_clients.write().await;
			ext_clients.retain(|_, peer| !(peer.peer_key == *key && peer.network == network));
			if let Some(peer) = replacement.filter(|peer| peer.is_attached_ext_client) {
				ext_clients.entry(peer.endpoint).or_insert(peer);
			}
		}

		if survivor.is_none() {
			self.forget_detected_endpoint(key).await;
		}
	}

	pub async fn save_peer_by_hash(&self, peer: RemotePeer) {
		self.by_hash.write().await.insert(peer.hash(), peer);
	}

	pub async fn get_peer_by_hash(&self, hash: &PeerHash) -> Option<RemotePeer> {
		self.by_hash.read().await.get(hash).cloned()
	}

	/// Records an attached external client under the address it sends from.
	pub async fn save_ext_client(&self, peer: RemotePeer) {
		self.ext_clients.write().await.insert(peer.endpoint, peer);
	}

	pub async fn get_ext_client(&self, endpoint: &SocketAddr) -> Option<RemotePeer> {
		self.ext_clients.read().await.get(endpoint).cloned()
	}

	/// Drops the external client entry at `endpoint` if it belongs to `key`.
	pub async fn remove_ext_client(&self, endpoint: &SocketAddr, key: &WgPublicKey) {
		let mut ext_clients = self.ext_clients.write().await;
		if ext_clients.get(endpoint).is_some_and(|peer| peer.peer_key == *key) {
			ext_clients.remove(endpoint);
		}
	}

	pub async fn is_endpoint_detected(&self, key: &WgPublicKey) -> bool {
		self.detected.read().await.contains_key(key)
	}

	pub async fn detected_endpoint(&self, key: &WgPublicKey) -> Option<DetectedEndpoint> {
		self.detected.read().await.get(key).copied()
	}

	/// Keeps the lowest-latency endpoint seen for `key`. Returns whether the
	/// stored endpoint changed.
	pub async fn record_detected_endpoint(
		&self,
		key: WgPublicKey,
		endpoint: SocketAddr,
		latency: Duration,
	) -> bool {
		let mut detected = self.detected.write().await;
		match detected.get(&key) {
			Some(existing) if existing.latency <= latency => false,
			_ => {
				detected.insert(key, DetectedEndpoint { endpoint, latency });
				true
			}
		}
	}

	pub async fn forget_detected_endpoint(&self, key: &WgPublicKey) {
		self.detected.write().await.remove(key);
	}

	/// Drops detected endpoints of peers `keep` rejects. Returns how many
	/// were dropped.
	pub async fn retain_detected_endpoints(&self, keep: impl Fn(&WgPublicKey) -> bool) -> usize {
		let mut detected = self.detected.write().await;
		let before = detected.len();
		detected.retain(|key, _| keep(key));
		before - detected.len()
	}

	/// Points each peer with a detected endpoint at it directly.
	pub async fn apply_detected_endpoints(&self, peers: &mut [PeerConfig]) -> usize {
		let detected = self.detected.read().await;
		let mut applied = 0;
		for peer in peers.iter_mut() {
			if let Some(found) = detected.get(&peer.public_key) {
				if peer.endpoint != Some(found.endpoint) {
					peer.endpoint = Some(found.endpoint);
					applied += 1;
				}
			}
		}
		applied
	}
}
