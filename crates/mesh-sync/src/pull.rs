// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::collaborators::PullSource;
use crate::config::PullClientConfig;
use crate::error::PullError;
use async_trait::async_trait;
use mesh_common::HostPull;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, instrument};

const PULL_TIMEOUT: Duration = Duration::from_secs(30);

/// [`PullSource`] backed by the coordinator's HTTP API.
pub struct HttpPullClient {
	config: PullClientConfig,
	http_client: Client,
}

impl HttpPullClient {
	pub fn new(config: PullClientConfig) -> Self {
		Self {
			config,
			http_client: mesh_common_http::new_client_with_timeout(PULL_TIMEOUT),
		}
	}
}

#[async_trait]
impl PullSource for HttpPullClient {
	#[instrument(skip(self), fields(host_id = %self.config.host_id))]
	async fn pull(&self) -> Result<HostPull, PullError> {
		let url = self
			.config
			.base_url
			.join(&format!("/api/v1/host/{}/pull", self.config.host_id))?;

		debug!(%url, "pulling host config");

		let pull = self
			.http_client
			.get(url)
			.header("Authorization", format!("Bearer {}", self.config.token()))
			.send()
			.await?
			.error_for_status()?
			.json::<HostPull>()
			.await?;

		debug!(
			nodes = pull.nodes.len(),
			peers = pull.peers.len(),
			"pulled host config"
		);
		Ok(pull)
	}
}
