// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Shared proxy listener.
//!
//! Every proxy sends through one socket bound to
//! [`PROXY_PORT`](crate::PROXY_PORT). Traffic between mesh hosts carries a
//! header of `PROXY_MAGIC || sha256(sender) || sha256(receiver)` so the
//! listener can hand the payload to the right local proxy. Externally attached clients speak plain WireGuard and are matched
//! by their source address instead.

use crate::error::Result;
use crate::proxy::{is_transient, MAX_DATAGRAM};
use crate::registry::ProxyRegistry;
use mesh_common::keys::HASH_LEN;
use mesh_common::{PeerHash, WgPublicKey};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

pub const PROXY_MAGIC: [u8; 4] = *b"MPXY";
pub const HEADER_LEN: usize = PROXY_MAGIC.len() + 2 * HASH_LEN;

pub fn encode_header(sender: &WgPublicKey, receiver: &WgPublicKey) -> [u8; HEADER_LEN] {
	let mut header = [0u8; HEADER_LEN];
	let (magic, rest) = header.split_at_mut(PROXY_MAGIC.len());
	let (from, to) = rest.split_at_mut(HASH_LEN);
	magic.copy_from_slice(&PROXY_MAGIC);
	from.copy_from_slice(&sender.hash_digest());
	to.copy_from_slice(&receiver.hash_digest());
	header
}

/// Splits a framed packet into sender digest, receiver digest and payload.
pub fn decode_header(packet: &[u8]) -> Option<([u8; HASH_LEN], [u8; HASH_LEN], &[u8])> {
	let rest = packet.strip_prefix(&PROXY_MAGIC[..])?;
	if rest.len() < 2 * HASH_LEN {
		return None;
	}
	let (from, rest) = rest.split_at(HASH_LEN);
	let (to, payload) = rest.split_at(HASH_LEN);
	Some((from.try_into().ok()?, to.try_into().ok()?, payload))
}

/// Listener on the proxy port that delivers remote traffic to local proxies.
pub struct ProxyServer {
	local_addr: SocketAddr,
	shutdown_tx: watch::Sender<bool>,
	task: Option<JoinHandle<()>>,
}

impl ProxyServer {
	/// Binds `addr` and installs the socket as the registry's transport.
	pub async fn bind(
		addr: SocketAddr,
		local_key: WgPublicKey,
		registry: Arc<ProxyRegistry>,
	) -> Result<Self> {
		let socket = Arc::new(UdpSocket::bind(addr).await?);
		let local_addr = socket.local_addr()?;
		registry.set_transport(Arc::clone(&socket)).await;

		let (shutdown_tx, shutdown_rx) = watch::channel(false);
		let task = tokio::spawn(serve(socket, local_key.hash_digest(), registry, shutdown_rx));

		info!(%local_addr, "proxy server listening");
		Ok(Self {
			local_addr,
			shutdown_tx,
			task: Some(task),
		})
	}

	pub fn local_addr(&self) -> SocketAddr {
		self.local_addr
	}

	pub async fn shutdown(&mut self) {
		let _ = self.shutdown_tx.send(true);
		if let Some(task) = self.task.take() {
			let _ = task.await;
		}
	}
}

impl Drop for ProxyServer {
	fn drop(&mut self) {
		if let Some(task) = &self.task {
			task.abort();
		}
	}
}

impl std::fmt::Debug for ProxyServer {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ProxyServer")
			.field("local_addr", &self.local_addr)
			.finish()
	}
}

async fn serve(
	socket: Arc<UdpSocket>,
	local_digest: [u8; HASH_LEN],
	registry: Arc<ProxyRegistry>,
	mut shutdown_rx: watch::Receiver<bool>,
) {
	let mut buf = vec![0u8; MAX_DATAGRAM];

	loop {
		tokio::select! {
			biased;

			changed = shutdown_rx.changed() => {
				if changed.is_err() || *shutdown_rx.borrow() {
					trace!("proxy server shutting down");
					break;
				}
			}

			result = socket.recv_from(&mut buf) => match result {
				Ok((len, from)) => deliver(&registry, &local_digest, &buf[..len], from).await,
				Err(e) if is_transient(&e) => trace!(error = %e, "transient proxy server error"),
				Err(e) => {
					warn!(error = %e, "proxy server socket failed");
					break;
				}
			}
		}
	}
}

async fn deliver(
	registry: &ProxyRegistry,
	local_digest: &[u8; HASH_LEN],
	packet: &[u8],
	from: SocketAddr,
) {
	let (remote, payload) = match decode_header(packet) {
		Some((sender, receiver, payload)) => {
			if receiver != *local_digest {
				trace!(%from, "dropping packet for another host");
				return;
			}
			let Some(remote) = registry.get_peer_by_hash(&PeerHash::from_digest(&sender)).await else {
				trace!(%from, "dropping packet from unknown peer");
				return;
			};
			(remote, payload)
		}
		None => {
			let Some(remote) = registry.get_ext_client(&from).await else {
				trace!(%from, "dropping unframed packet");
				return;
			};
			(remote, packet)
		}
	};

	let Some(conn) = registry.get_peer(&remote.network, &remote.peer_key).await else {
		return;
	};
	let Some(local) = conn.local_socket().await else {
		return;
	};
	match local.send(payload).await {
		Ok(_) => trace!(%from, peer = %remote.peer_key, len = payload.len(), "delivered datagram"),
		Err(e) => debug!(%from, peer = %remote.peer_key, error = %e, "failed to deliver datagram"),
	}
}
