// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

use mesh_common_version::BuildInfo;
use reqwest::{Client, ClientBuilder};
use std::time::Duration;

/// Creates a new HTTP client builder with the standard User-Agent header.
///
/// The User-Agent format is: `mesh/{version}/{platform}/{git_sha}`
/// Example: `mesh/0.1.0/linux-x86_64/abc1234`
pub fn builder() -> ClientBuilder {
	Client::builder().user_agent(user_agent())
}

/// Creates a new HTTP client with a custom timeout and the standard User-Agent.
pub fn new_client_with_timeout(timeout: Duration) -> Client {
	builder()
		.timeout(timeout)
		.build()
		.expect("failed to build HTTP client")
}

pub fn user_agent() -> String {
	let info = BuildInfo::current();
	format!("mesh/{}/{}/{}", info.version, info.platform, info.git_sha)
}
