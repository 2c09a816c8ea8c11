// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Types shared by the mesh proxy layer and the synchronization engine.

pub mod host;
pub mod keys;
pub mod node;
pub mod peer;
pub mod topic;
pub mod update;

pub use host::{Host, HostAction, HostUpdate, ServerRecord, Signal};
pub use keys::{KeyError, PeerHash, WgPublicKey, HASH_LEN, KEY_LEN};
pub use node::{Node, NodeAction, NodeSignal};
pub use peer::{HostInfo, HostInfoMap, NetInterface, PeerConfig, DEFAULT_KEEPALIVE_SECS};
pub use topic::{MessageClass, Topic, TopicError};
pub use update::{
	EgressInfo, EgressRoute, FwUpdate, HostPeerUpdate, HostPull, ProxyManifest, ProxyPeerMeta,
	ServerConfig,
};
