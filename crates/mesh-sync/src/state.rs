// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::store::{HostConfig, StoredConfig};
use mesh_common::{Host, Node, ServerRecord};
use mesh_proxy::InterfaceHandle;
use std::collections::BTreeMap;

/// Local view of this host's configuration that the engine mutates.
#[derive(Debug, Clone, Default)]
pub struct LocalState {
	pub host: HostConfig,
	pub nodes: BTreeMap<String, Node>,
	pub servers: BTreeMap<String, ServerRecord>,
}

impl From<StoredConfig> for LocalState {
	fn from(stored: StoredConfig) -> Self {
		Self {
			host: stored.host,
			nodes: stored.nodes,
			servers: stored.servers,
		}
	}
}

impl LocalState {
	pub fn node_list(&self) -> Vec<Node> {
		self.nodes.values().cloned().collect()
	}

	pub fn current_server(&self) -> Option<&ServerRecord> {
		self
			.host
			.current_server
			.as_deref()
			.and_then(|name| self.servers.get(name))
	}

	/// Removes every node registered through `server` and the server itself.
	pub fn remove_server(&mut self, server: &str) -> Vec<Node> {
		let networks: Vec<String> = self
			.nodes
			.iter()
			.filter(|(_, node)| node.server == server)
			.map(|(network, _)| network.clone())
			.collect();
		let removed = networks
			.iter()
			.filter_map(|network| self.nodes.remove(network))
			.collect();

		self.servers.remove(server);
		self.host.peers.clear();
		if self.host.current_server.as_deref() == Some(server) {
			self.host.current_server = None;
		}
		removed
	}

	/// Interface handle for proxies, if the host has a key yet.
	pub fn interface_handle(&self) -> Option<InterfaceHandle> {
		let host = &self.host.host;
		host.public_key.map(|public_key| InterfaceHandle {
			name: host.interface.clone(),
			public_key,
			listen_port: host.listen_port,
		})
	}
}

/// Follow-up work required after merging a coordinator's host record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostChanges {
	pub reset_interface: bool,
	pub restart_daemon: bool,
	pub send_host_update: bool,
}

/// Merges the coordinator's view of this host into `local`.
///
/// Identity fields (id, key, version) stay local; when the coordinator
/// disagrees with them, or is missing a listen port, it is sent the local
/// record back.
pub fn apply_host_update(local: &mut Host, incoming: &Host) -> HostChanges {
	let mut changes = HostChanges::default();

	if incoming.listen_port == 0 {
		changes.send_host_update = true;
	} else if incoming.listen_port != local.listen_port {
		local.listen_port = incoming.listen_port;
		changes.reset_interface = true;
	}

	if incoming.mtu != 0 && incoming.mtu != local.mtu {
		local.mtu = incoming.mtu;
		changes.reset_interface = true;
	}

	if !incoming.interface.is_empty() && incoming.interface != local.interface {
		local.interface = incoming.interface.clone();
		changes.reset_interface = true;
	}

	if incoming.public_key.is_some() && incoming.public_key != local.public_key {
		changes.send_host_update = true;
	}
	if !incoming.version.is_empty() && incoming.version != local.version {
		changes.send_host_update = true;
	}

	if incoming.verbosity != local.verbosity {
		local.verbosity = incoming.verbosity;
		changes.restart_daemon = true;
	}

	local.name = incoming.name.clone();
	local.endpoint_ip = incoming.endpoint_ip;
	local.is_static = incoming.is_static;
	local.auto_update = incoming.auto_update;
	if !incoming.default_interface.is_empty() {
		local.default_interface = incoming.default_interface.clone();
	}

	changes
}

#[cfg(test)]
mod tests {
	use super::*;

	fn host() -> Host {
		Host {
			id: "host-1".to_string(),
			name: "laptop".to_string(),
			version: "v0.21.0".to_string(),
			interface: "mesh0".to_string(),
			listen_port: 51820,
			mtu: 1420,
			..Default::default()
		}
	}

	#[test]
	fn identical_host_changes_nothing() {
		let mut local = host();
		assert_eq!(apply_host_update(&mut local, &host()), HostChanges::default());
		assert_eq!(local, host());
	}

	#[test]
	fn listen_port_change_resets_interface() {
		let mut local = host();
		let mut incoming = host();
		incoming.listen_port = 51821;
		let changes = apply_host_update(&mut local, &incoming);
		assert!(changes.reset_interface);
		assert!(!changes.restart_daemon);
		assert_eq!(local.listen_port, 51821);
	}

	#[test]
	fn missing_listen_port_is_reported_back() {
		let mut local = host();
		let mut incoming = host();
		incoming.listen_port = 0;
		let changes = apply_host_update(&mut local, &incoming);
		assert!(changes.send_host_update);
		assert_eq!(local.listen_port, 51820);
	}

	#[test]
	fn verbosity_change_restarts_daemon() {
		let mut local = host();
		let mut incoming = host();
		incoming.verbosity = 3;
		assert!(apply_host_update(&mut local, &incoming).restart_daemon);
	}

	#[test]
	fn plain_fields_are_copied() {
		let mut local = host();
		let mut incoming = host();
		incoming.name = "desktop".to_string();
		incoming.auto_update = true;
		let changes = apply_host_update(&mut local, &incoming);
		assert_eq!(changes, HostChanges::default());
		assert_eq!(local.name, "desktop");
		assert!(local.auto_update);
	}

	#[test]
	fn remove_server_drops_its_nodes() {
		let mut state = LocalState::default();
		for (network, server) in [("office", "a"), ("lab", "a"), ("home", "b")] {
			state.nodes.insert(
				network.to_string(),
				Node {
					network: network.to_string(),
					server: server.to_string(),
					..Default::default()
				},
			);
			state
				.servers
				.entry(server.to_string())
				.or_insert_with(|| ServerRecord::new(server));
		}
		state.host.current_server = Some("a".to_string());

		let removed = state.remove_server("a");
		assert_eq!(removed.len(), 2);
		assert_eq!(state.nodes.keys().collect::<Vec<_>>(), vec!["home"]);
		assert!(!state.servers.contains_key("a"));
		assert!(state.host.current_server.is_none());
	}
}
