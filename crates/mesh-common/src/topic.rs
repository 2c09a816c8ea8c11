// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopicError {
	#[error("malformed topic: {0:?}")]
	Malformed(String),

	#[error("topic {topic:?} has an empty {segment} segment")]
	EmptySegment { topic: String, segment: &'static str },
}

/// Class of control message a topic carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageClass {
	NodeUpdate,
	HostPeerUpdate,
	HostUpdate,
}

/// A control-channel topic, parsed once into typed fields.
///
/// Wire shapes:
/// - `node/update/<network>/<node-id>`
/// - `peers/host/<host-id>/<server>`
/// - `host/update/<host-id>/<server>`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
	NodeUpdate { network: String, node_id: String },
	HostPeerUpdate { host_id: String, server: String },
	HostUpdate { host_id: String, server: String },
}

impl Topic {
	pub fn class(&self) -> MessageClass {
		match self {
			Topic::NodeUpdate { .. } => MessageClass::NodeUpdate,
			Topic::HostPeerUpdate { .. } => MessageClass::HostPeerUpdate,
			Topic::HostUpdate { .. } => MessageClass::HostUpdate,
		}
	}

	pub fn network(&self) -> Option<&str> {
		match self {
			Topic::NodeUpdate { network, .. } => Some(network.as_str()),
			_ => None,
		}
	}

	pub fn server(&self) -> Option<&str> {
		match self {
			Topic::HostPeerUpdate { server, .. } | Topic::HostUpdate { server, .. } => {
				Some(server.as_str())
			}
			Topic::NodeUpdate { .. } => None,
		}
	}
}

fn segment(topic: &str, value: &str, name: &'static str) -> Result<String, TopicError> {
	if value.is_empty() {
		return Err(TopicError::EmptySegment {
			topic: topic.to_string(),
			segment: name,
		});
	}
	Ok(value.to_string())
}

impl FromStr for Topic {
	type Err = TopicError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let parts: Vec<&str> = s.split('/').collect();
		match parts.as_slice() {
			["node", "update", network, node_id] => Ok(Topic::NodeUpdate {
				network: segment(s, network, "network")?,
				node_id: segment(s, node_id, "node id")?,
			}),
			["peers", "host", host_id, server] => Ok(Topic::HostPeerUpdate {
				host_id: segment(s, host_id, "host id")?,
				server: segment(s, server, "server")?,
			}),
			["host", "update", host_id, server] => Ok(Topic::HostUpdate {
				host_id: segment(s, host_id, "host id")?,
				server: segment(s, server, "server")?,
			}),
			_ => Err(TopicError::Malformed(s.to_string())),
		}
	}
}

impl fmt::Display for Topic {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Topic::NodeUpdate { network, node_id } => write!(f, "node/update/{network}/{node_id}"),
			Topic::HostPeerUpdate { host_id, server } => write!(f, "peers/host/{host_id}/{server}"),
			Topic::HostUpdate { host_id, server } => write!(f, "host/update/{host_id}/{server}"),
		}
	}
}
