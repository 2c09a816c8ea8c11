// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Direct-path probing between mesh hosts.
//!
//! A probe is `PROBE_MAGIC || sender key`; a responder answers with
//! `PROBE_ACK || responder key`. The prober only accepts an answer signed
//! with the key of the peer it meant to reach.

use crate::error::Result;
use crate::proxy::is_transient;
use async_trait::async_trait;
use mesh_common::keys::KEY_LEN;
use mesh_common::WgPublicKey;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, trace, warn};

pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

const PROBE_MAGIC: &[u8] = b"MESH_PROBE";
const PROBE_ACK: &[u8] = b"MESH_ACK";

#[async_trait]
pub trait Prober: Send + Sync {
	/// Round-trip time to `peer` at `target`, or `None` when it did not
	/// answer in time.
	async fn probe(
		&self,
		target: SocketAddr,
		peer: &WgPublicKey,
		wait: Duration,
	) -> Result<Option<Duration>>;
}

#[derive(Debug, Clone)]
pub struct UdpProber {
	local_key: WgPublicKey,
}

impl UdpProber {
	pub fn new(local_key: WgPublicKey) -> Self {
		Self { local_key }
	}
}

fn frame(magic: &[u8], key: &WgPublicKey) -> Vec<u8> {
	let mut data = Vec::with_capacity(magic.len() + KEY_LEN);
	data.extend_from_slice(magic);
	data.extend_from_slice(key.as_bytes());
	data
}

fn parse_frame(magic: &[u8], data: &[u8]) -> Option<WgPublicKey> {
	let rest = data.strip_prefix(magic)?;
	let bytes: [u8; KEY_LEN] = rest.try_into().ok()?;
	Some(WgPublicKey::from_bytes(bytes))
}

#[async_trait]
impl Prober for UdpProber {
	async fn probe(
		&self,
		target: SocketAddr,
		peer: &WgPublicKey,
		wait: Duration,
	) -> Result<Option<Duration>> {
		let bind_addr: SocketAddr = match target {
			SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
			SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
		};
		let socket = UdpSocket::bind(bind_addr).await?;
		socket.connect(target).await?;

		let started = Instant::now();
		socket.send(&frame(PROBE_MAGIC, &self.local_key)).await?;
		trace!(%target, "sent probe");

		let deadline = started + wait;
		let mut buf = [0u8; 128];
		loop {
			match timeout(deadline.saturating_duration_since(Instant::now()), socket.recv(&mut buf)).await {
				Ok(Ok(len)) => match parse_frame(PROBE_ACK, &buf[..len]) {
					Some(key) if key == *peer => {
						let rtt = started.elapsed();
						debug!(%target, ?rtt, "probe answered");
						return Ok(Some(rtt));
					}
					_ => trace!(%target, "ignoring unexpected probe reply"),
				},
				Ok(Err(e)) => {
					debug!(%target, error = %e, "probe recv failed");
					return Ok(None);
				}
				Err(_) => {
					debug!(%target, "probe timed out");
					return Ok(None);
				}
			}
		}
	}
}

/// Answers probes so that peers can detect a direct path to this host.
pub struct ProbeResponder {
	local_addr: SocketAddr,
	shutdown_tx: watch::Sender<bool>,
	task: Option<JoinHandle<()>>,
}

impl ProbeResponder {
	pub async fn bind(addr: SocketAddr, local_key: WgPublicKey) -> Result<Self> {
		let socket = UdpSocket::bind(addr).await?;
		let local_addr = socket.local_addr()?;
		let (shutdown_tx, shutdown_rx) = watch::channel(false);
		let task = tokio::spawn(answer_probes(
			socket,
			frame(PROBE_ACK, &local_key),
			shutdown_rx,
		));

		debug!(%local_addr, "probe responder listening");
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

async fn answer_probes(socket: UdpSocket, reply: Vec<u8>, mut shutdown_rx: watch::Receiver<bool>) {
	let mut buf = [0u8; 128];
	loop {
		tokio::select! {
			biased;

			changed = shutdown_rx.changed() => {
				if changed.is_err() || *shutdown_rx.borrow() {
					break;
				}
			}

			result = socket.recv_from(&mut buf) => match result {
				Ok((len, from)) => {
					let Some(sender) = parse_frame(PROBE_MAGIC, &buf[..len]) else {
						continue;
					};
					trace!(%from, peer = %sender, "answering probe");
					if let Err(e) = socket.send_to(&reply, from).await {
						debug!(%from, error = %e, "failed to answer probe");
					}
				}
				Err(e) if is_transient(&e) => trace!(error = %e, "transient probe responder error"),
				Err(e) => {
					warn!(error = %e, "probe responder socket failed");
					break;
				}
			}
		}
	}
}

impl Drop for ProbeResponder {
	fn drop(&mut self) {
		if let Some(task) = &self.task {
			task.abort();
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::proxy::tests::key;

	#[test]
	fn frames_carry_the_sender_key() {
		let data = frame(PROBE_MAGIC, &key(9));
		assert_eq!(parse_frame(PROBE_MAGIC, &data), Some(key(9)));
		assert_eq!(parse_frame(PROBE_ACK, &data), None);
		assert_eq!(parse_frame(PROBE_MAGIC, &data[..data.len() - 1]), None);
	}

	#[tokio::test]
	async fn probe_round_trip_reports_rtt() {
		let mut responder = ProbeResponder::bind("127.0.0.1:0".parse().unwrap(), key(2))
			.await
			.unwrap();
		let prober = UdpProber::new(key(1));

		let rtt = prober
			.probe(responder.local_addr(), &key(2), PROBE_TIMEOUT)
			.await
			.unwrap();
		assert!(rtt.is_some());

		responder.shutdown().await;
	}

	#[tokio::test]
	async fn responder_survives_a_vanished_prober() {
		let mut responder = ProbeResponder::bind("127.0.0.1:0".parse().unwrap(), key(2))
			.await
			.unwrap();

		let gone = UdpSocket::bind("127.0.0.1:0").await.unwrap();
		gone
			.send_to(&frame(PROBE_MAGIC, &key(4)), responder.local_addr())
			.await
			.unwrap();
		drop(gone);
		tokio::time::sleep(Duration::from_millis(50)).await;

		let rtt = UdpProber::new(key(1))
			.probe(responder.local_addr(), &key(2), PROBE_TIMEOUT)
			.await
			.unwrap();
		assert!(rtt.is_some());

		responder.shutdown().await;
		assert!(responder.task.is_none());
	}

	#[tokio::test]
	async fn probe_rejects_wrong_responder_key() {
		let mut responder = ProbeResponder::bind("127.0.0.1:0".parse().unwrap(), key(3))
			.await
			.unwrap();
		let prober = UdpProber::new(key(1));

		let rtt = prober
			.probe(responder.local_addr(), &key(2), Duration::from_millis(200))
			.await
			.unwrap();
		assert!(rtt.is_none());

		responder.shutdown().await;
	}

	#[tokio::test]
	async fn probe_times_out_without_responder() {
		let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
		let prober = UdpProber::new(key(1));

		let rtt = prober
			.probe(silent.local_addr().unwrap(), &key(2), Duration::from_millis(100))
			.await
			.unwrap();
		assert!(rtt.is_none());
	}
}
