// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use mesh_common::Node;
use std::collections::BTreeSet;

fn same_set<T: Ord>(a: &[T], b: &[T]) -> bool {
	a.iter().collect::<BTreeSet<_>>() == b.iter().collect::<BTreeSet<_>>()
}

/// Whether moving from `current` to `incoming` requires reconfiguring the
/// tunnel interface.
///
/// Ordering of relayed nodes and egress ranges is not significant.
pub fn iface_delta(current: &Node, incoming: &Node) -> bool {
	current.address != incoming.address
		|| current.address6 != incoming.address6
		|| current.network_range != incoming.network_range
		|| current.network_range6 != incoming.network_range6
		|| current.connected != incoming.connected
		|| current.is_relay != incoming.is_relay
		|| current.is_relayed != incoming.is_relayed
		|| current.relayed_by != incoming.relayed_by
		|| current.is_egress_gateway != incoming.is_egress_gateway
		|| current.is_ingress_gateway != incoming.is_ingress_gateway
		|| current.persistent_keepalive != incoming.persistent_keepalive
		|| !same_set(&current.relayed_nodes, &incoming.relayed_nodes)
		|| !same_set(&current.egress_ranges, &incoming.egress_ranges)
}
