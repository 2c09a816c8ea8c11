// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use mesh_common::MessageClass;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Last applied payload per (scope, message class).
///
/// The scope is the network for node updates and the server for peer
/// updates.
#[derive(Debug, Default)]
pub struct LastMessageCache {
	entries: RwLock<HashMap<(String, MessageClass), Vec<u8>>>,
}

impl LastMessageCache {
	pub fn new() -> Self {
		Self::default()
	}

	pub async fn is_duplicate(&self, scope: &str, class: MessageClass, payload: &[u8]) -> bool {
		let entries = self.entries.read().await;
		entries
			.get(&(scope.to_string(), class))
			.is_some_and(|last| last.as_slice() == payload)
	}

	pub async fn record(&self, scope: &str, class: MessageClass, payload: &[u8]) {
		self
			.entries
			.write()
			.await
			.insert((scope.to_string(), class), payload.to_vec());
	}

	pub async fn forget_scope(&self, scope: &str) {
		self.entries.write().await.retain(|(s, _), _| s != scope);
	}
}
