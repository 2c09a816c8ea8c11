// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::Result;
use crate::server::encode_header;
use mesh_common::{PeerConfig, WgPublicKey};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, trace, warn};

/// Well-known port remote proxies listen on.
pub const PROXY_PORT: u16 = 51722;

pub(crate) const MAX_DATAGRAM: usize = 65535;

/// The local tunnel interface a proxy forwards into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceHandle {
	pub name: String,
	pub public_key: WgPublicKey,
	pub listen_port: u16,
}

impl InterfaceHandle {
	pub fn tunnel_addr(&self) -> SocketAddr {
		SocketAddr::from((Ipv4Addr::LOCALHOST, self.listen_port))
	}
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
	pub local_key: WgPublicKey,
	pub remote_key: WgPublicKey,
	pub interface: InterfaceHandle,
	pub is_ext_client: bool,
	pub peer: PeerConfig,
	pub persistent_keepalive: Duration,
	pub peer_endpoint: SocketAddr,
	pub peer_address: Option<IpAddr>,
	pub network: String,
}

/// Loopback socket the tunnel driver uses as the peer's endpoint.
#[derive(Debug, Clone)]
pub(crate) struct LocalSocket {
	socket: Arc<UdpSocket>,
	addr: SocketAddr,
}

impl LocalSocket {
	pub(crate) async fn bind(interface: &InterfaceHandle) -> io::Result<Self> {
		let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await?;
		socket.connect(interface.tunnel_addr()).await?;
		let addr = socket.local_addr()?;
		Ok(Self {
			socket: Arc::new(socket),
			addr,
		})
	}

	pub(crate) fn socket(&self) -> &Arc<UdpSocket> {
		&self.socket
	}
}

/// Forwarder taken out of a [`Proxy`], still winding down.
#[must_use = "a halted forwarder should be joined"]
#[derive(Debug)]
pub(crate) struct Halted {
	peer: WgPublicKey,
	task: Option<JoinHandle<()>>,
}

impl Halted {
	pub(crate) async fn join(self) {
		let Some(task) = self.task else {
			return;
		};
		if let Err(e) = task.await {
			if !e.is_cancelled() {
				warn!(peer = %self.peer, error = %e, "proxy forwarder panicked");
			}
		}
	}
}

/// UDP datapath for one remote peer.
///
/// The tunnel driver sends to the loopback socket returned by
/// [`Proxy::local_addr`]. Those datagrams leave through the shared proxy
/// transport towards `peer_endpoint`; replies are delivered back by the
/// [`ProxyServer`](crate::ProxyServer) that owns the transport.
pub struct Proxy {
	config: ProxyConfig,
	transport: Arc<UdpSocket>,
	local: Option<LocalSocket>,
	shutdown_tx: Option<watch::Sender<bool>>,
	task: Option<JoinHandle<()>>,
}

impl Proxy {
	pub fn new(config: ProxyConfig, transport: Arc<UdpSocket>) -> Self {
		Self {
			config,
			transport,
			local: None,
			shutdown_tx: None,
			task: None,
		}
	}

	/// Binds the loopback socket if needed and starts forwarding.
	#[instrument(skip(self), fields(peer = %self.config.remote_key, endpoint = %self.config.peer_endpoint))]
	pub async fn start(&mut self) -> Result<()> {
		if self.is_running() {
			return Ok(());
		}
		if self.local.is_none() {
			self.local = Some(LocalSocket::bind(&self.config.interface).await?);
		}
		self.resume();
		Ok(())
	}

	/// Spawns the forwarder over the already bound loopback socket.
	pub(crate) fn resume(&mut self) {
		if self.is_running() {
			return;
		}
		let Some(local) = &self.local else {
			return;
		};

		let header = (!self.config.is_ext_client)
			.then(|| encode_header(&self.config.local_key, &self.config.remote_key));
		let (shutdown_tx, shutdown_rx) = watch::channel(false);
		self.task = Some(tokio::spawn(forward_outbound(
			Arc::clone(local.socket()),
			Arc::clone(&self.transport),
			self.config.peer_endpoint,
			header,
			shutdown_rx,
		)));
		self.shutdown_tx = Some(shutdown_tx);

		info!(local_addr = %local.addr, peer = %self.config.remote_key, "proxy started");
	}

	/// Signals the forwarder to stop, keeping the loopback socket.
	pub(crate) fn halt(&mut self) -> Halted {
		if let Some(shutdown_tx) = self.shutdown_tx.take() {
			let _ = shutdown_tx.send(true);
		}
		Halted {
			peer: self.config.remote_key,
			task: self.task.take(),
		}
	}

	/// Halts the forwarder and releases the loopback socket.
	pub(crate) fn close(&mut self) -> Halted {
		let halted = self.halt();
		if self.local.take().is_some() {
			debug!(peer = %self.config.remote_key, "proxy stopped");
		}
		halted
	}

	/// Installs a loopback socket bound while the proxy was unlocked.
	pub(crate) fn attach(&mut self, local: LocalSocket) {
		if self.local.is_none() {
			self.local = Some(local);
		}
	}

	pub(crate) fn local_socket(&self) -> Option<LocalSocket> {
		self.local.clone()
	}

	pub(crate) fn set_interface(&mut self, interface: InterfaceHandle) {
		self.config.interface = interface;
	}

	pub fn local_addr(&self) -> Option<SocketAddr> {
		self.local.as_ref().map(|local| local.addr)
	}

	pub fn config(&self) -> &ProxyConfig {
		&self.config
	}

	pub fn is_running(&self) -> bool {
		self.shutdown_tx.is_some()
	}
}

impl Drop for Proxy {
	fn drop(&mut self) {
		if let Some(task) = &self.task {
			task.abort();
		}
	}
}

impl std::fmt::Debug for Proxy {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Proxy")
			.field("peer", &self.config.remote_key)
			.field("endpoint", &self.config.peer_endpoint)
			.field("local_addr", &self.local_addr())
			.finish()
	}
}

pub(crate) fn is_transient(e: &io::Error) -> bool {
	matches!(
		e.kind(),
		io::ErrorKind::ConnectionRefused
			| io::ErrorKind::ConnectionReset
			| io::ErrorKind::WouldBlock
			| io::ErrorKind::Interrupted
	)
}

async fn forward_outbound(
	local: Arc<UdpSocket>,
	transport: Arc<UdpSocket>,
	peer_endpoint: SocketAddr,
	header: Option<[u8; crate::server::HEADER_LEN]>,
	mut shutdown_rx: watch::Receiver<bool>,
) {
	let offset = header.map_or(0, |h| h.len());
	let mut buf = vec![0u8; offset + MAX_DATAGRAM];
	if let Some(header) = header {
		buf[..offset].copy_from_slice(&header);
	}

	loop {
		tokio::select! {
			biased;

			changed = shutdown_rx.changed() => {
				if changed.is_err() || *shutdown_rx.borrow() {
					trace!(%peer_endpoint, "forwarder shutting down");
					break;
				}
			}

			result = local.recv(&mut buf[offset..]) => {
				match result {
					Ok(len) => match transport.send_to(&buf[..offset + len], peer_endpoint).await {
						Ok(_) => trace!(%peer_endpoint, len, "forwarded datagram"),
						Err(e) if is_transient(&e) => trace!(%peer_endpoint, error = %e, "peer unreachable"),
						Err(e) => debug!(%peer_endpoint, error = %e, "failed to forward datagram"),
					},
					Err(e) if is_transient(&e) => {
						trace!(%peer_endpoint, error = %e, "transient receive error");
					}
					Err(e) => {
						warn!(%peer_endpoint, error = %e, "proxy socket failed");
						break;
					}
				}
			}
		}
	}
}
