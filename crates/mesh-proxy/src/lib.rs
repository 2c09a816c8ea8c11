// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Peer proxy layer of the mesh client.
//!
//! Every proxied peer gets a [`Proxy`]: a loopback socket the local tunnel
//! driver talks to. Its traffic leaves through the socket of the
//! [`ProxyServer`] towards the peer's resolved endpoint (direct, relayed or
//! an externally attached client's own port), and the server hands replies
//! back to the matching loopback socket. Live proxies are tracked per
//! network in the [`ProxyRegistry`], which also keeps the hash-keyed index
//! the server routes by and the endpoints the [`EndpointDetector`]
//! discovered by probing peers' local interfaces.

pub mod detect;
pub mod error;
pub mod peer;
pub mod probe;
pub mod proxy;
pub mod registry;
pub mod server;

pub use detect::{is_bridge_interface, is_probe_candidate, DetectorConfig, EndpointDetector, ProbeTarget};
pub use error::{ProxyError, Result};
pub use peer::PeerProxy;
pub use probe::{ProbeResponder, Prober, UdpProber, PROBE_TIMEOUT};
pub use proxy::{InterfaceHandle, Proxy, ProxyConfig, PROXY_PORT};
pub use registry::{Connection, DetectedEndpoint, ProxyRegistry, RemotePeer};
pub use server::ProxyServer;
