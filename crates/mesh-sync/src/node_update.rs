// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::delta::iface_delta;
use crate::engine::{Outcome, SkipReason, SyncEngine};
use crate::error::{LeaveError, Result, SyncError};
use mesh_common::{MessageClass, Node, NodeAction, NodeSignal};
use tracing::{info, instrument, warn};

impl SyncEngine {
	#[instrument(skip(self, payload))]
	pub(crate) async fn on_node_update(&self, network: &str, payload: &[u8]) -> Result<Outcome> {
		let (current, server) = {
			let state = self.state.read().await;
			let current = state
				.nodes
				.get(network)
				.cloned()
				.ok_or_else(|| SyncError::UnknownNode(network.to_string()))?;
			let server = state
				.servers
				.get(&current.server)
				.map(|server| server.name.clone())
				.ok_or_else(|| SyncError::UnknownServer(current.server.clone()))?;
			(current, server)
		};

		let data = self.decrypt(&server, payload).await?;
		if self
			.cache
			.is_duplicate(network, MessageClass::NodeUpdate, &data)
			.await
		{
			info!("node update unchanged, skipping");
			return Ok(Outcome::Skipped(SkipReason::Duplicate));
		}

		let mut incoming: Node = serde_json::from_slice(&data)?;
		info!(node = %incoming.id, "received node update");

		let mut delta = iface_delta(&current, &incoming);
		match incoming.action {
			NodeAction::Delete => {
				let outcome = self.delete_node(network, &incoming).await?;
				self.cache.forget_scope(network).await;
				return Ok(outcome);
			}
			NodeAction::ForceUpdate => delta = true,
			NodeAction::Noop | NodeAction::Other => {}
		}

		incoming.action = NodeAction::Noop;
		if incoming.server.is_empty() {
			incoming.server = current.server.clone();
		}
		let (host, nodes) = {
			let mut state = self.state.write().await;
			state.nodes.insert(network.to_string(), incoming.clone());
			(state.host.host.clone(), state.node_list())
		};
		self.persist_nodes().await;

		self
			.collab
			.tunnel
			.configure(&host, &nodes)
			.await
			.map_err(|e| SyncError::apply("interface configure", e))?;
		self
			.cache
			.record(network, MessageClass::NodeUpdate, &data)
			.await;

		tokio::time::sleep(self.config.signal_settle).await;

		if delta {
			match self
				.collab
				.channel
				.publish_signal(&incoming, NodeSignal::Done)
				.await
			{
				Ok(()) => info!("signalled finished interface update"),
				Err(e) => warn!(error = %e, "could not notify server to update peers after interface change"),
			}
		}

		Ok(Outcome::Applied)
	}

	async fn delete_node(&self, network: &str, node: &Node) -> Result<Outcome> {
		info!(node = %node.id, "received delete request");

		if let Err(e) = self.collab.channel.unsubscribe_node(node).await {
			warn!(error = %e, "failed to unsubscribe node topics");
		}

		match self.collab.host_ops.leave_network(network).await {
			Ok(()) => {}
			Err(LeaveError::AlreadyDetached) => {
				info!("node already detached from network");
			}
			Err(LeaveError::Failed(source)) => {
				return Err(SyncError::Leave {
					network: network.to_string(),
					source,
				});
			}
		}

		self.forget_network(network).await;
		info!(node = %node.id, "node was deleted");
		Ok(Outcome::Left)
	}
}
