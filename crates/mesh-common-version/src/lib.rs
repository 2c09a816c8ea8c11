// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Build and version information for the mesh client.
//!
//! The client version reported here is what the synchronization engine
//! compares against the coordinator's advertised version when deciding
//! whether an in-place upgrade is due. See [`version_less_than`] for the
//! comparison rules.

shadow_rs::shadow!(build);

mod compare;

pub use compare::{parse_lenient, version_less_than, VersionError};

/// Platform string in `{os}-{arch}` format, e.g. "linux-x86_64".
pub const PLATFORM: &str = env!("MESH_PLATFORM");

#[derive(Debug, Clone, Copy)]
pub struct BuildInfo {
	pub version: &'static str,
	pub git_sha: &'static str,
	pub build_timestamp: &'static str,
	pub platform: &'static str,
}

impl BuildInfo {
	/// Get the current build information (compile-time constants).
	#[allow(clippy::const_is_empty)]
	pub const fn current() -> Self {
		Self {
			version: build::PKG_VERSION,
			git_sha: if build::SHORT_COMMIT.is_empty() {
				"unknown"
			} else {
				build::SHORT_COMMIT
			},
			build_timestamp: build::BUILD_TIME,
			platform: PLATFORM,
		}
	}
}

/// Version this client advertises to the coordinator.
pub const fn client_version() -> &'static str {
	build::PKG_VERSION
}
