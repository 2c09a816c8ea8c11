// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::engine::{Outcome, SyncEngine};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{error, info, instrument, warn};

/// What one reconciler tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
	ChannelUp,
	NoServer,
	PullFailed,
	Reconciled(Option<Outcome>),
	Terminated,
}

/// Pulls configuration over HTTP while the control channel is down, then
/// tries to bring the channel back.
pub struct FallbackReconciler {
	engine: Arc<SyncEngine>,
	period: Duration,
}

impl FallbackReconciler {
	pub fn new(engine: Arc<SyncEngine>) -> Self {
		let period = engine.config().fallback_interval;
		Self { engine, period }
	}

	pub fn with_period(engine: Arc<SyncEngine>, period: Duration) -> Self {
		Self { engine, period }
	}

	pub fn period(&self) -> Duration {
		self.period
	}

	#[instrument(skip(self))]
	pub async fn tick(&self) -> Tick {
		if self.engine.is_terminated() {
			return Tick::Terminated;
		}

		let collab = self.engine.collaborators();
		if collab.channel.is_connection_open() && collab.channel.is_connected() {
			return Tick::ChannelUp;
		}
		let Some(server) = self.engine.current_server().await else {
			return Tick::NoServer;
		};

		info!(server = %server.name, "control channel down, pulling config");
		let pull = match collab.pull.pull().await {
			Ok(pull) => pull,
			Err(e) => {
				error!(error = %e, "pull failed");
				return Tick::PullFailed;
			}
		};

		let outcome = match self.engine.apply_pull(pull).await {
			Ok(Outcome::Restarting(kind)) => return Tick::Reconciled(Some(Outcome::Restarting(kind))),
			Ok(outcome) => Some(outcome),
			Err(e) => {
				warn!(error = %e, "failed to apply pulled config");
				None
			}
		};

		let server = self.engine.current_server().await.unwrap_or(server);
		info!(broker = %server.broker, "re-attempting control channel connection after pull");
		if let Err(e) = collab.channel.reconnect(&server).await {
			error!(broker = %server.broker, error = %e, "unable to connect to broker");
		}

		Tick::Reconciled(outcome)
	}

	/// Ticks every period until `shutdown_rx` flips or the engine
	/// terminates. The first tick happens one period after start.
	pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
		let mut ticker = interval_at(Instant::now() + self.period, self.period);
		ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

		loop {
			tokio::select! {
				biased;

				changed = shutdown_rx.changed() => {
					if changed.is_err() || *shutdown_rx.borrow() {
						info!("fallback reconciler stopping");
						break;
					}
				}

				_ = ticker.tick() => {
					if self.tick().await == Tick::Terminated {
						info!("engine terminated, fallback reconciler stopping");
						break;
					}
				}
			}
		}
	}

	pub fn spawn(self: Arc<Self>, shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
		tokio::spawn(async move { self.run(shutdown_rx).await })
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::engine::RestartKind;
	use crate::testing::*;
	use mesh_common::{HostPull, ServerConfig};
	use std::sync::atomic::Ordering;

	fn snapshot() -> HostPull {
		let state = joined_state();
		HostPull {
			host: state.host.host.clone(),
			nodes: vec![node(NETWORK)],
			peers: vec![peer(2, "203.0.113.2:51820")],
			server_config: ServerConfig {
				name: SERVER.to_string(),
				version: CLIENT_VERSION.to_string(),
				..Default::default()
			},
			..Default::default()
		}
	}

	fn reconciler(harness: &Harness) -> FallbackReconciler {
		FallbackReconciler::new(Arc::new(harness.engine(joined_state())))
	}

	#[test]
	fn period_comes_from_config() {
		let harness = Harness::new();
		assert_eq!(reconciler(&harness).period(), Duration::from_secs(30));
	}

	#[tokio::test]
	async fn connected_channel_skips_pull() {
		let harness = Harness::new();
		harness.channel.connected.store(true, Ordering::SeqCst);
		let reconciler = reconciler(&harness);

		assert_eq!(reconciler.tick().await, Tick::ChannelUp);
		assert_eq!(harness.pull.attempts(), 0);
	}

	#[tokio::test]
	async fn no_current_server_skips_pull() {
		let harness = Harness::new();
		let mut state = joined_state();
		state.host.current_server = None;
		let reconciler = FallbackReconciler::new(Arc::new(harness.engine(state)));

		assert_eq!(reconciler.tick().await, Tick::NoServer);
		assert_eq!(harness.pull.attempts(), 0);
	}

	#[tokio::test]
	async fn disconnected_channel_pulls_then_reconnects() {
		let harness = Harness::new();
		*harness.pull.response.lock().unwrap() = Some(snapshot());
		let reconciler = reconciler(&harness);

		assert_eq!(reconciler.tick().await, Tick::Reconciled(Some(Outcome::Applied)));
		assert_eq!(harness.pull.attempts(), 1);
		assert_eq!(
			harness.channel.calls(),
			vec![ChannelCall::Reconnect(SERVER.to_string())]
		);
		assert_eq!(harness.tunnel.last_peers().unwrap().len(), 1);
	}

	#[tokio::test]
	async fn failed_pull_does_not_reconnect() {
		let harness = Harness::new();
		let reconciler = reconciler(&harness);

		assert_eq!(reconciler.tick().await, Tick::PullFailed);
		assert_eq!(harness.pull.attempts(), 1);
		assert!(harness.channel.calls().is_empty());
	}

	#[tokio::test]
	async fn failed_apply_still_reconnects() {
		let harness = Harness::new();
		*harness.pull.response.lock().unwrap() = Some(snapshot());
		harness.tunnel.fail_set_peers.store(true, Ordering::SeqCst);
		let reconciler = reconciler(&harness);

		assert_eq!(reconciler.tick().await, Tick::Reconciled(None));
		assert_eq!(
			harness.channel.calls(),
			vec![ChannelCall::Reconnect(SERVER.to_string())]
		);
	}

	#[tokio::test]
	async fn terminated_engine_stops_ticking() {
		let harness = Harness::new();
		let engine = Arc::new(harness.engine(joined_state()));
		engine.request_restart(RestartKind::Soft).await;
		let reconciler = FallbackReconciler::new(engine);

		assert_eq!(reconciler.tick().await, Tick::Terminated);
		assert_eq!(harness.pull.attempts(), 0);
	}

	#[tokio::test]
	async fn run_stops_on_shutdown() {
		let harness = Harness::new();
		let engine = Arc::new(harness.engine(joined_state()));
		let reconciler = Arc::new(FallbackReconciler::with_period(
			engine,
			Duration::from_millis(10),
		));
		let (shutdown_tx, shutdown_rx) = watch::channel(false);

		let handle = reconciler.spawn(shutdown_rx);
		tokio::time::sleep(Duration::from_millis(60)).await;
		shutdown_tx.send(true).unwrap();

		tokio::time::timeout(Duration::from_secs(1), handle)
			.await
			.expect("reconciler did not stop")
			.unwrap();
		assert!(harness.pull.attempts() >= 1);
	}

	#[tokio::test]
	async fn run_stops_when_engine_terminates() {
		let harness = Harness::new();
		let engine = Arc::new(harness.engine(joined_state()));
		engine.request_restart(RestartKind::Hard).await;
		let reconciler =
			FallbackReconciler::with_period(engine, Duration::from_millis(10));
		let (_shutdown_tx, shutdown_rx) = watch::channel(false);

		tokio::time::timeout(Duration::from_secs(1), reconciler.run(shutdown_rx))
			.await
			.expect("reconciler did not stop");
	}
}
