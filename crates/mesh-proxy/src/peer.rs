// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::{ProxyError, Result};
use crate::proxy::{InterfaceHandle, Proxy, ProxyConfig, PROXY_PORT};
use crate::registry::{Connection, ProxyRegistry};
use mesh_common::{PeerConfig, ProxyPeerMeta, WgPublicKey, DEFAULT_KEEPALIVE_SECS};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Lifecycle of the per-peer proxies stored in a [`ProxyRegistry`].
#[derive(Debug, Clone)]
pub struct PeerProxy {
	registry: Arc<ProxyRegistry>,
	remote_port: u16,
}

impl PeerProxy {
	pub fn new(registry: Arc<ProxyRegistry>) -> Self {
		Self::with_remote_port(registry, PROXY_PORT)
	}

	/// Proxies that reach remote hosts' listeners on `remote_port`.
	pub fn with_remote_port(registry: Arc<ProxyRegistry>, remote_port: u16) -> Self {
		Self {
			registry,
			remote_port,
		}
	}

	pub fn registry(&self) -> &Arc<ProxyRegistry> {
		&self.registry
	}

	/// Starts a proxy for `peer` and registers it.
	///
	/// Nothing is registered unless the datapath started. A connection
	/// already registered for the same peer on `network` is stopped once
	/// the new one is in place.
	#[instrument(skip(self, interface, peer, meta), fields(peer = %peer.public_key, relayed = meta.is_relayed))]
	pub async fn add_peer(
		&self,
		interface: &InterfaceHandle,
		network: &str,
		mut peer: PeerConfig,
		peer_address: Option<IpAddr>,
		meta: &ProxyPeerMeta,
	) -> Result<Arc<Connection>> {
		let keepalive = *peer
			.persistent_keepalive
			.get_or_insert(DEFAULT_KEEPALIVE_SECS);

		let endpoint = resolve_endpoint(&peer, meta, self.remote_port)?;
		let relay = if meta.is_relayed { meta.relay_to } else { None };
		let transport = self
			.registry
			.transport()
			.await
			.ok_or(ProxyError::ServerNotRunning)?;

		let config = ProxyConfig {
			local_key: interface.public_key,
			remote_key: peer.public_key,
			interface: interface.clone(),
			is_ext_client: meta.is_ext_client,
			peer: peer.clone(),
			persistent_keepalive: Duration::from_secs(u64::from(keepalive)),
			peer_endpoint: endpoint,
			peer_address,
			network: network.to_string(),
		};

		let mut proxy = Proxy::new(config, transport);
		proxy.start().await?;

		let conn = Arc::new(Connection::new(
			peer.public_key,
			relay,
			meta.is_attached_ext_client,
			proxy,
		));
		let remote = conn.remote_peer().await;

		let replaced = self.registry.save_peer(network, Arc::clone(&conn)).await;
		if let Some(old) = &replaced {
			if old.is_attached_ext_client() {
				let old_endpoint = old.config().await.peer_endpoint;
				self.registry.remove_ext_client(&old_endpoint, &peer.public_key).await;
			}
		}
		self.registry.save_peer_by_hash(remote.clone()).await;
		if meta.is_attached_ext_client {
			self.registry.save_ext_client(remote).await;
		}

		if let Some(old) = replaced {
			old.stop().await;
		}

		info!(%network, %endpoint, "peer proxied");
		Ok(conn)
	}

	/// Stops and unregisters one peer. Returns whether it was registered.
	pub async fn remove_peer(&self, network: &str, key: &WgPublicKey) -> bool {
		match self.registry.remove_peer(network, key).await {
			Some(conn) => {
				conn.stop().await;
				true
			}
			None => false,
		}
	}

	/// Stops and unregisters every peer of `network`.
	#[instrument(skip(self))]
	pub async fn leave_network(&self, network: &str) -> usize {
		let removed = self.registry.remove_network(network).await;
		for conn in &removed {
			conn.stop().await;
		}
		if !removed.is_empty() {
			info!(count = removed.len(), "stopped network proxies");
		}
		removed.len()
	}

	/// Restarts every proxy against a recreated `interface`.
	///
	/// Loopback ports survive, so endpoints already handed to the tunnel
	/// driver and the hash index stay valid. Returns how many restarted.
	#[instrument(skip_all, fields(interface = %interface.name))]
	pub async fn reset_peers(&self, interface: &InterfaceHandle) -> usize {
		let mut restarted = 0;
		for conn in self.registry.connections().await {
			if let Err(e) = conn.reset(interface).await {
				warn!(peer = %conn.key(), error = %e, "failed to reset peer proxy");
				continue;
			}
			restarted += 1;

			let remote = conn.remote_peer().await;
			let owns_index = self
				.registry
				.get_peer_by_hash(&remote.hash())
				.await
				.map_or(true, |indexed| indexed.network == remote.network);
			if owns_index {
				self.registry.save_peer_by_hash(remote.clone()).await;
			}
			if remote.is_attached_ext_client {
				self.registry.save_ext_client(remote).await;
			}
		}
		if restarted > 0 {
			info!(restarted, "peer proxies reset");
		}
		restarted
	}

	/// Points each registered peer at its local proxy socket.
	///
	/// Peers without a registered proxy, or with a stopped one, keep their
	/// endpoint. Does nothing while proxying is disabled.
	pub async fn rewrite_endpoints_for_proxy(&self, network: &str, peers: &mut [PeerConfig]) {
		if !self.registry.is_proxy_enabled() {
			return;
		}

		for peer in peers.iter_mut() {
			let Some(conn) = self.registry.get_peer(network, &peer.public_key).await else {
				continue;
			};
			if let Some(local) = conn.local_addr().await {
				debug!(peer = %peer.public_key, %local, "rewriting endpoint to proxy");
				peer.endpoint = Some(local);
			}
		}
	}
}

fn resolve_endpoint(peer: &PeerConfig, meta: &ProxyPeerMeta, remote_port: u16) -> Result<SocketAddr> {
	let port = if meta.is_attached_ext_client {
		peer
			.endpoint
			.map(|e| e.port())
			.ok_or(ProxyError::NoEndpoint(peer.public_key))?
	} else {
		remote_port
	};

	let ip = if meta.is_relayed {
		meta
			.relay_to
			.map(|relay| relay.ip())
			.ok_or(ProxyError::MissingRelay(peer.public_key))?
	} else {
		peer
			.endpoint
			.map(|e| e.ip())
			.ok_or(ProxyError::NoEndpoint(peer.public_key))?
	};

	Ok(SocketAddr::new(ip, port))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::proxy::tests::{interface, key, transport};
	use tokio::net::UdpSocket;

	fn peer_at(byte: u8, endpoint: &str) -> PeerConfig {
		let mut peer = PeerConfig::new(key(byte));
		peer.endpoint = Some(endpoint.parse().unwrap());
		peer
	}

	async fn proxies() -> (Arc<ProxyRegistry>, PeerProxy) {
		let registry = Arc::new(ProxyRegistry::new(true));
		registry.set_transport(transport().await).await;
		(Arc::clone(&registry), PeerProxy::new(registry))
	}

	#[test]
	fn direct_peers_use_the_proxy_port() {
		let peer = peer_at(2, "203.0.113.5:51820");
		let endpoint = resolve_endpoint(&peer, &ProxyPeerMeta::default(), PROXY_PORT).unwrap();
		assert_eq!(endpoint, "203.0.113.5:51722".parse().unwrap());
	}

	#[test]
	fn attached_ext_clients_keep_their_port() {
		let peer = peer_at(2, "203.0.113.5:40000");
		let meta = ProxyPeerMeta {
			is_attached_ext_client: true,
			..Default::default()
		};
		let endpoint = resolve_endpoint(&peer, &meta, PROXY_PORT).unwrap();
		assert_eq!(endpoint.port(), 40000);
	}

	#[test]
	fn relayed_peers_take_the_relay_ip() {
		let peer = peer_at(2, "203.0.113.5:51820");
		let meta = ProxyPeerMeta {
			is_relayed: true,
			relay_to: Some("198.51.100.7:51820".parse().unwrap()),
			..Default::default()
		};
		let endpoint = resolve_endpoint(&peer, &meta, PROXY_PORT).unwrap();
		assert_eq!(endpoint, "198.51.100.7:51722".parse().unwrap());
	}

	#[tokio::test]
	async fn relayed_without_relay_fails_and_registers_nothing() {
		let (registry, proxies) = proxies().await;
		let meta = ProxyPeerMeta {
			is_relayed: true,
			..Default::default()
		};

		let result = proxies
			.add_peer(
				&interface(51820),
				"office",
				peer_at(2, "127.0.0.1:51820"),
				None,
				&meta,
			)
			.await;

		assert!(matches!(result, Err(ProxyError::MissingRelay(_))));
		assert!(registry.get_peer("office", &key(2)).await.is_none());
		assert!(registry.get_peer_by_hash(&key(2).hash()).await.is_none());
	}

	#[tokio::test]
	async fn add_peer_requires_a_running_server() {
		let registry = Arc::new(ProxyRegistry::new(true));
		let proxies = PeerProxy::new(Arc::clone(&registry));

		let result = proxies
			.add_peer(&interface(51820), "office", peer_at(2, "127.0.0.1:51820"), None, &ProxyPeerMeta::default())
			.await;

		assert!(matches!(result, Err(ProxyError::ServerNotRunning)));
		assert!(registry.get_peer("office", &key(2)).await.is_none());
	}

	#[tokio::test]
	async fn add_peer_defaults_keepalive_and_registers_both_indexes() {
		let (registry, proxies) = proxies().await;

		let conn = proxies
			.add_peer(
				&interface(51820),
				"office",
				peer_at(2, "127.0.0.1:51820"),
				None,
				&ProxyPeerMeta::default(),
			)
			.await
			.unwrap();

		let config = conn.config().await;
		assert_eq!(config.persistent_keepalive, Duration::from_secs(25));
		assert_eq!(config.peer.persistent_keepalive, Some(25));
		assert!(registry.get_peer("office", &key(2)).await.is_some());

		let remote = registry.get_peer_by_hash(&key(2).hash()).await.unwrap();
		assert_eq!(remote.network, "office");
		assert_eq!(remote.local_conn, conn.local_addr().await);
		assert!(registry.get_ext_client(&config.peer_endpoint).await.is_none());

		proxies.leave_network("office").await;
	}

	#[tokio::test]
	async fn explicit_keepalive_is_kept() {
		let (_registry, proxies) = proxies().await;
		let mut peer = peer_at(2, "127.0.0.1:51820");
		peer.persistent_keepalive = Some(10);

		let conn = proxies
			.add_peer(&interface(51820), "office", peer, None, &ProxyPeerMeta::default())
			.await
			.unwrap();
		assert_eq!(conn.config().await.persistent_keepalive, Duration::from_secs(10));

		proxies.leave_network("office").await;
	}

	#[tokio::test]
	async fn attached_ext_client_is_recorded_by_endpoint() {
		let (registry, proxies) = proxies().await;
		let endpoint: SocketAddr = "127.0.0.1:40000".parse().unwrap();
		let meta = ProxyPeerMeta {
			is_attached_ext_client: true,
			..Default::default()
		};

		proxies
			.add_peer(&interface(51820), "office", peer_at(2, "127.0.0.1:40000"), None, &meta)
			.await
			.unwrap();
		assert_eq!(
			registry.get_ext_client(&endpoint).await.unwrap().peer_key,
			key(2)
		);

		proxies
			.add_peer(&interface(51820), "office", peer_at(2, "127.0.0.1:40001"), None, &meta)
			.await
			.unwrap();
		assert!(registry.get_ext_client(&endpoint).await.is_none());

		proxies.leave_network("office").await;
		assert!(registry
			.get_ext_client(&"127.0.0.1:40001".parse().unwrap())
			.await
			.is_none());
	}

	#[tokio::test]
	async fn readding_replaces_and_stops_previous_connection() {
		let (registry, proxies) = proxies().await;
		let iface = interface(51820);

		let first = proxies
			.add_peer(&iface, "office", peer_at(2, "127.0.0.1:51820"), None, &ProxyPeerMeta::default())
			.await
			.unwrap();
		let second = proxies
			.add_peer(&iface, "office", peer_at(2, "127.0.0.1:51820"), None, &ProxyPeerMeta::default())
			.await
			.unwrap();

		assert!(!first.is_running().await);
		assert!(second.is_running().await);
		let stored = registry.get_peer("office", &key(2)).await.unwrap();
		assert!(Arc::ptr_eq(&stored, &second));

		assert!(proxies.remove_peer("office", &key(2)).await);
		assert!(!second.is_running().await);
	}

	#[tokio::test]
	async fn leaving_one_network_keeps_shared_peer_routable() {
		let (registry, proxies) = proxies().await;
		let iface = interface(51820);

		let office = proxies
			.add_peer(&iface, "office", peer_at(2, "127.0.0.1:51820"), None, &ProxyPeerMeta::default())
			.await
			.unwrap();
		proxies
			.add_peer(&iface, "lab", peer_at(2, "127.0.0.1:51820"), None, &ProxyPeerMeta::default())
			.await
			.unwrap();

		assert_eq!(proxies.leave_network("lab").await, 1);

		let indexed = registry.get_peer_by_hash(&key(2).hash()).await.unwrap();
		assert_eq!(indexed.network, "office");
		assert_eq!(indexed.local_conn, office.local_addr().await);

		proxies.leave_network("office").await;
		assert!(registry.get_peer_by_hash(&key(2).hash()).await.is_none());
	}

	#[tokio::test]
	async fn leave_network_forgets_detected_endpoints() {
		let (registry, proxies) = proxies().await;
		proxies
			.add_peer(&interface(51820), "office", peer_at(2, "127.0.0.1:51820"), None, &ProxyPeerMeta::default())
			.await
			.unwrap();
		registry
			.record_detected_endpoint(key(2), "192.168.1.2:51820".parse().unwrap(), Duration::from_millis(2))
			.await;

		proxies.leave_network("office").await;
		assert!(!registry.is_endpoint_detected(&key(2)).await);
	}

	#[tokio::test]
	async fn reset_keeps_the_loopback_port_and_index() {
		let (registry, proxies) = proxies().await;
		let conn = proxies
			.add_peer(&interface(51820), "office", peer_at(2, "127.0.0.1:51820"), None, &ProxyPeerMeta::default())
			.await
			.unwrap();
		let before = conn.local_addr().await;

		assert_eq!(proxies.reset_peers(&interface(51821)).await, 1);

		assert!(conn.is_running().await);
		assert_eq!(conn.local_addr().await, before);
		assert_eq!(conn.config().await.interface.listen_port, 51821);
		let indexed = registry.get_peer_by_hash(&key(2).hash()).await.unwrap();
		assert_eq!(indexed.local_conn, before);

		proxies.leave_network("office").await;
	}

	#[tokio::test]
	async fn rewrite_uses_proxy_address_only_when_enabled() {
		let (registry, proxies) = proxies().await;
		let original: SocketAddr = "127.0.0.1:51820".parse().unwrap();

		let conn = proxies
			.add_peer(&interface(51820), "office", peer_at(2, "127.0.0.1:51820"), None, &ProxyPeerMeta::default())
			.await
			.unwrap();
		let local = conn.local_addr().await.unwrap();

		let mut peers = vec![peer_at(2, "127.0.0.1:51820"), peer_at(3, "127.0.0.1:51821")];
		proxies.rewrite_endpoints_for_proxy("office", &mut peers).await;
		assert_eq!(peers[0].endpoint, Some(local));
		assert_eq!(peers[1].endpoint, Some("127.0.0.1:51821".parse().unwrap()));

		registry.set_proxy_enabled(false);
		let mut peers = vec![peer_at(2, "127.0.0.1:51820")];
		proxies.rewrite_endpoints_for_proxy("office", &mut peers).await;
		assert_eq!(peers[0].endpoint, Some(original));

		proxies.leave_network("office").await;
	}

	#[tokio::test]
	async fn proxied_traffic_reaches_the_peer() {
		let tunnel = UdpSocket::bind("127.0.0.1:0").await.unwrap();
		let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
		let (_registry, proxies) = proxies().await;

		let meta = ProxyPeerMeta {
			is_ext_client: true,
			is_attached_ext_client: true,
			..Default::default()
		};
		let mut peer = PeerConfig::new(key(2));
		peer.endpoint = Some(client.local_addr().unwrap());

		let conn = proxies
			.add_peer(
				&interface(tunnel.local_addr().unwrap().port()),
				"office",
				peer,
				None,
				&meta,
			)
			.await
			.unwrap();

		tunnel
			.send_to(b"ping", conn.local_addr().await.unwrap())
			.await
			.unwrap();
		let mut buf = [0u8; 16];
		let (len, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
			.await
			.unwrap()
			.unwrap();
		assert_eq!(&buf[..len], b"ping");

		proxies.leave_network("office").await;
	}
}
