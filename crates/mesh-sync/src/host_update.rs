// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::engine::{Outcome, RestartKind, SkipReason, SyncEngine};
use crate::error::{Result, SyncError};
use crate::state::apply_host_update;
use mesh_common::{HostAction, HostUpdate, Node, Topic};
use mesh_common_version::version_less_than;
use tracing::{error, info, instrument, warn};

/// Follow-up work collected while dispatching a host update.
#[derive(Debug, Default, Clone, Copy)]
struct Effects {
	reset_interface: bool,
	restart_daemon: bool,
	send_host_update: bool,
	clear_retained: bool,
}

impl SyncEngine {
	#[instrument(skip(self, topic, payload))]
	pub(crate) async fn on_host_update(
		&self,
		topic: &Topic,
		server: &str,
		payload: &[u8],
	) -> Result<Outcome> {
		if !self.state.read().await.servers.contains_key(server) {
			return Err(SyncError::UnknownServer(server.to_string()));
		}
		if payload.is_empty() {
			return Ok(Outcome::Skipped(SkipReason::EmptyPayload));
		}

		let data = self.decrypt(server, payload).await?;
		let update: HostUpdate = serde_json::from_slice(&data)?;
		info!(action = ?update.action, "processing host update");

		let mut effects = Effects::default();
		match update.action {
			HostAction::Upgrade => {
				self.clear_retained(topic).await;
				if let Some(outcome) = self.upgrade(server).await {
					return Ok(outcome);
				}
			}
			HostAction::JoinHostToNetwork => {
				self.join_network(topic, server, update.node).await?;
				effects.reset_interface = true;
			}
			HostAction::DeleteHost => {
				self.clear_retained(topic).await;
				if let Err(e) = self.collab.channel.unsubscribe_host(server).await {
					warn!(error = %e, "failed to unsubscribe host topics");
				}
				self.delete_host_config(server).await;
				effects.restart_daemon = true;
			}
			HostAction::UpdateHost => {
				let changes = {
					let mut state = self.state.write().await;
					apply_host_update(&mut state.host.host, &update.host)
				};
				effects.reset_interface = changes.reset_interface;
				effects.restart_daemon = changes.restart_daemon;
				effects.send_host_update = changes.send_host_update;
				effects.clear_retained = true;
				if effects.send_host_update {
					self.publish_host_update(HostAction::UpdateHost, server).await;
				}
			}
			HostAction::RequestAck => {
				self.clear_retained(topic).await;
				self.acknowledge(server).await;
			}
			HostAction::SignalHost => {
				self.clear_retained(topic).await;
				match &update.signal {
					Some(signal) => {
						if let Err(e) = self.collab.host_ops.process_signal(signal).await {
							warn!(error = %e, "failed to process peer signal");
						}
					}
					None => warn!("signal host update carried no signal"),
				}
			}
			HostAction::UpdateKeys => {
				self.clear_retained(topic).await;
				if let Err(e) = self.collab.host_ops.rotate_keys().await {
					error!(error = %e, "failed to rotate keys");
				}
			}
			HostAction::RequestPull => {
				self.clear_retained(topic).await;
				match self.pull_and_apply().await {
					Ok(Outcome::Restarting(kind)) => return Ok(Outcome::Restarting(kind)),
					Ok(_) => {}
					Err(e) => warn!(error = %e, "requested pull failed"),
				}
			}
			HostAction::Acknowledgement | HostAction::Unknown => {
				return Err(SyncError::UnknownAction(format!("{:?}", update.action)));
			}
		}

		self.write_host().await.map_err(SyncError::Persist)?;

		if effects.restart_daemon {
			if effects.clear_retained {
				self.clear_retained(topic).await;
			}
			if let Some(outcome) = self.request_restart(RestartKind::Soft).await {
				return Ok(outcome);
			}
			return Ok(Outcome::Applied);
		}

		if effects.reset_interface {
			self.reset_interface().await?;
		}

		Ok(Outcome::Applied)
	}

	async fn clear_retained(&self, topic: &Topic) {
		if let Err(e) = self.collab.channel.clear_retained(topic).await {
			warn!(%topic, error = %e, "failed to clear retained message");
		}
	}

	async fn publish_host_update(&self, action: HostAction, server: &str) {
		let (host, target) = {
			let state = self.state.read().await;
			let target = state
				.host
				.current_server
				.clone()
				.unwrap_or_else(|| server.to_string());
			(state.host.host.clone(), target)
		};
		if let Err(e) = self
			.collab
			.channel
			.publish_host_update(&target, action, &host)
			.await
		{
			error!(server = %target, ?action, error = %e, "could not publish host update");
		}
	}

	async fn acknowledge(&self, server: &str) {
		let host = self.state.read().await.host.host.clone();
		if let Err(e) = self
			.collab
			.channel
			.publish_host_update(server, HostAction::Acknowledgement, &host)
			.await
		{
			error!(%server, error = %e, "failed to respond with ACK to server");
		}
	}

	/// Upgrades to the version last stored for `server`. A version pair that
	/// cannot be compared is treated as needing the upgrade.
	async fn upgrade(&self, server: &str) -> Option<Outcome> {
		let server_version = {
			let state = self.state.read().await;
			state.servers.get(server)?.version.clone()
		};
		let client_version = self.config.client_version.as_str();

		match version_less_than(client_version, &server_version) {
			Ok(false) => {
				info!("no need to upgrade client, version is up-to-date");
				return None;
			}
			Ok(true) => {}
			Err(e) => warn!(error = %e, "cannot compare versions, proceeding with upgrade"),
		}

		info!(version = %server_version, "upgrading client to server's version");
		if let Err(e) = self.collab.supervisor.upgrade_to(&server_version).await {
			error!(error = %e, "error upgrading client to server's version");
			return None;
		}
		self.request_restart(RestartKind::Hard).await
	}

	async fn join_network(&self, topic: &Topic, server: &str, mut node: Node) -> Result<()> {
		node.action = Default::default();
		if node.server.is_empty() {
			node.server = server.to_string();
		}
		let network = node.network.clone();

		{
			let mut state = self.state.write().await;
			let record = state
				.servers
				.get_mut(server)
				.ok_or_else(|| SyncError::UnknownServer(server.to_string()))?;
			record.networks.insert(network.clone());
			state.nodes.insert(network.clone(), node.clone());
		}
		self.persist_nodes().await;
		self.persist_servers().await;
		info!(%network, %server, "added node to network");

		self.clear_retained(topic).await;
		self.acknowledge(server).await;
		if let Err(e) = self.collab.channel.subscribe_node(&node).await {
			warn!(%network, error = %e, "failed to subscribe to node topics");
		}
		Ok(())
	}

	async fn delete_host_config(&self, server: &str) {
		let removed = self.state.write().await.remove_server(server);
		for node in &removed {
			if let Err(e) = self.collab.channel.unsubscribe_node(node).await {
				warn!(network = %node.network, error = %e, "failed to unsubscribe node topics");
			}
			self.cache.forget_scope(&node.network).await;
			self.proxies.leave_network(&node.network).await;
		}
		self.cache.forget_scope(server).await;
		self.prune_detected_endpoints().await;
		self.persist_nodes().await;
		self.persist_servers().await;
		info!(%server, nodes = removed.len(), "removed host config for server");
	}
}
