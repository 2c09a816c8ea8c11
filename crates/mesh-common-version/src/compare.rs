// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use semver::Version;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VersionError {
	#[error("version {version:?} is not semver: {source}")]
	Invalid {
		version: String,
		source: semver::Error,
	},
}

/// Parses a version string the way coordinators publish them.
///
/// Accepts a leading `v`, and pads a missing minor or patch component
/// with zero, so `v1.2` parses as `1.2.0`. Anything else (custom build
/// identifiers such as `dev` or `1.2.3.4`) is rejected.
pub fn parse_lenient(version: &str) -> Result<Version, VersionError> {
	let trimmed = version.trim();
	let trimmed = trimmed
		.strip_prefix('v')
		.or_else(|| trimmed.strip_prefix('V'))
		.unwrap_or(trimmed);

	let split = trimmed.find(['-', '+']).unwrap_or(trimmed.len());
	let (core, suffix) = trimmed.split_at(split);

	let mut normalized = core.to_string();
	for _ in core.matches('.').count()..2 {
		normalized.push_str(".0");
	}
	normalized.push_str(suffix);

	Version::parse(&normalized).map_err(|source| VersionError::Invalid {
		version: version.to_string(),
		source,
	})
}

/// Returns whether `current` is strictly older than `other`.
///
/// An error means the comparison is inconclusive; callers decide whether
/// that fails open or closed.
pub fn version_less_than(current: &str, other: &str) -> Result<bool, VersionError> {
	let current = parse_lenient(current)?;
	let other = parse_lenient(other)?;
	Ok(current < other)
}
