// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Control-plane synchronization for the mesh client.
//!
//! [`SyncEngine`] consumes node, host and peer-list updates pushed by a
//! coordinator over the control channel and turns them into interface,
//! firewall and proxy changes. When the channel is down the
//! [`FallbackReconciler`] pulls the same configuration over HTTP and runs it
//! through the same merge path.
//!
//! Everything outside the engine (tunnel driver, firewall, message bus,
//! decryption, persistence, process supervision) is reached through the
//! traits in [`collaborators`].

pub mod cache;
pub mod collaborators;
pub mod config;
pub mod delta;
pub mod engine;
pub mod error;
pub mod fallback;
mod host_update;
pub mod logging;
mod node_update;
mod peer_update;
pub mod pull;
pub mod state;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

pub use cache::LastMessageCache;
pub use collaborators::{
	Collaborators, ConfigStore, ControlChannel, Decryptor, Firewall, HostOps, PullSource,
	Supervisor, TunnelDriver,
};
pub use config::{PullClientConfig, SyncConfig};
pub use delta::iface_delta;
pub use engine::{EngineState, Outcome, RestartKind, SkipReason, SyncEngine};
pub use error::{ConfigError, LeaveError, PullError, Result, StoreError, SyncError};
pub use fallback::{FallbackReconciler, Tick};
pub use pull::HttpPullClient;
pub use state::{apply_host_update, HostChanges, LocalState};
pub use store::{HostConfig, JsonFileStore, StoredConfig};
