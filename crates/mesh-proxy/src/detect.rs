// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Best-path discovery for peers advertised with out-of-band host info.

use crate::probe::{Prober, PROBE_TIMEOUT};
use crate::registry::ProxyRegistry;
use ipnet::IpNet;
use mesh_common::{HostInfoMap, PeerConfig, WgPublicKey};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, info, instrument, warn};

const BRIDGE_PREFIXES: &[&str] = &["br-", "docker", "virbr", "cni", "bridge"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectorConfig {
	/// Upper bound on probes in flight. `None` leaves fan-out unbounded.
	pub max_concurrent_probes: Option<usize>,
	pub probe_timeout: Duration,
}

impl Default for DetectorConfig {
	fn default() -> Self {
		Self {
			max_concurrent_probes: Some(32),
			probe_timeout: PROBE_TIMEOUT,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
	pub peer: WgPublicKey,
	pub interface: String,
	pub endpoint: SocketAddr,
}

pub fn is_bridge_interface(name: &str) -> bool {
	BRIDGE_PREFIXES.iter().any(|prefix| name.starts_with(prefix))
}

fn is_link_local(ip: IpAddr) -> bool {
	match ip {
		IpAddr::V4(v4) => v4.is_link_local(),
		IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
	}
}

fn is_private(ip: IpAddr) -> bool {
	match ip {
		IpAddr::V4(v4) => v4.is_private(),
		IpAddr::V6(v6) => (v6.segments()[0] & 0xfe00) == 0xfc00,
	}
}

/// Whether `ip` is worth probing given the ranges already routed to peers.
pub fn is_probe_candidate(ip: IpAddr, routed: &[IpNet]) -> bool {
	if ip.is_loopback() || ip.is_multicast() || ip.is_unspecified() || is_link_local(ip) {
		return false;
	}
	if routed.iter().any(|net| net.contains(&ip)) {
		return false;
	}
	is_private(ip)
}

/// Spawns probes toward peers' private interfaces and records the fastest
/// answering one in the registry.
///
/// Probe tasks live in a `JoinSet` owned by the detector, so dropping the
/// detector aborts whatever is still in flight.
pub struct EndpointDetector {
	registry: Arc<ProxyRegistry>,
	prober: Arc<dyn Prober>,
	limit: Option<Arc<Semaphore>>,
	probe_timeout: Duration,
	tasks: Mutex<JoinSet<()>>,
}

impl EndpointDetector {
	pub fn new(registry: Arc<ProxyRegistry>, prober: Arc<dyn Prober>, config: DetectorConfig) -> Self {
		Self {
			registry,
			prober,
			limit: config
				.max_concurrent_probes
				.map(|permits| Arc::new(Semaphore::new(permits))),
			probe_timeout: config.probe_timeout,
			tasks: Mutex::new(JoinSet::new()),
		}
	}

	/// Candidate paths for the peers of an update that are neither static
	/// nor already detected.
	pub async fn targets(&self, peers: &[PeerConfig], host_info: &HostInfoMap) -> Vec<ProbeTarget> {
		let routed: Vec<IpNet> = peers
			.iter()
			.flat_map(|peer| peer.allowed_ips.iter().copied())
			.collect();

		let mut targets = Vec::new();
		for peer in peers {
			let key = &peer.public_key;
			let Some(info) = host_info.get(key) else {
				continue;
			};
			if info.is_static || self.registry.is_endpoint_detected(key).await {
				continue;
			}
			for iface in &info.interfaces {
				if is_bridge_interface(&iface.name) {
					continue;
				}
				let ip = iface.address.addr();
				if !is_probe_candidate(ip, &routed) {
					continue;
				}
				targets.push(ProbeTarget {
					peer: *key,
					interface: iface.name.clone(),
					endpoint: SocketAddr::new(ip, info.listen_port),
				});
			}
		}
		targets
	}

	/// Starts one probe per candidate path and returns without waiting for
	/// any of them.
	#[instrument(skip_all, fields(peers = peers.len()))]
	pub async fn detect(&self, peers: &[PeerConfig], host_info: &HostInfoMap) -> usize {
		let targets = self.targets(peers, host_info).await;
		let count = targets.len();

		let mut tasks = self.tasks.lock().await;
		while let Some(result) = tasks.try_join_next() {
			log_join_error(result);
		}

		for target in targets {
			let registry = Arc::clone(&self.registry);
			let prober = Arc::clone(&self.prober);
			let limit = self.limit.clone();
			let wait = self.probe_timeout;

			tasks.spawn(async move {
				let _permit = match limit {
					Some(semaphore) => match semaphore.acquire_owned().await {
						Ok(permit) => Some(permit),
						Err(_) => return,
					},
					None => None,
				};

				match prober.probe(target.endpoint, &target.peer, wait).await {
					Ok(Some(rtt)) => {
						if registry
							.record_detected_endpoint(target.peer, target.endpoint, rtt)
							.await
						{
							info!(
								peer = %target.peer,
								interface = %target.interface,
								endpoint = %target.endpoint,
								?rtt,
								"detected direct endpoint"
							);
						}
					}
					Ok(None) => {}
					Err(e) => debug!(peer = %target.peer, endpoint = %target.endpoint, error = %e, "probe failed"),
				}
			});
		}

		if count > 0 {
			debug!(count, "spawned endpoint probes");
		}
		count
	}

	/// Waits for every probe spawned so far.
	pub async fn wait_idle(&self) {
		let mut tasks = std::mem::take(&mut *self.tasks.lock().await);
		while let Some(result) = tasks.join_next().await {
			log_join_error(result);
		}
	}

	/// Aborts every probe in flight.
	pub async fn shutdown(&self) {
		let mut tasks = std::mem::take(&mut *self.tasks.lock().await);
		tasks.abort_all();
		while tasks.join_next().await.is_some() {}
	}
}

fn log_join_error(result: Result<(), JoinError>) {
	if let Err(e) = result {
		if e.is_panic() {
			warn!(error = %e, "probe task panicked");
		}
	}
}
