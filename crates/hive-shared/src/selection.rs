//! Deterministic node orderings shared by the registry, the health monitor
//! and the client gateway. Ties always fall back to ascending node id.

use std::cmp::Ordering;

use crate::models::StorageNode;

/// Descending available space, then ascending id.
pub fn by_most_storage(a: &StorageNode, b: &StorageNode) -> Ordering {
    b.status
        .available_space
        .cmp(&a.status.available_space)
        .then_with(|| a.id.cmp(&b.id))
}

/// Ascending current load, then ascending id.
pub fn by_lowest_load(a: &StorageNode, b: &StorageNode) -> Ordering {
    a.status
        .current_load
        .total_cmp(&b.status.current_load)
        .then_with(|| a.id.cmp(&b.id))
}

/// `true` when `region` is unset or matches the node's region
/// (case-insensitive).
pub fn in_region(node: &StorageNode, region: Option<&str>) -> bool {
    region.map_or(true, |r| node.region.eq_ignore_ascii_case(r))
}

/// Write-path selection: nodes in `region` by most storage, then the
/// remainder from any region, at most `count` nodes.
pub fn select_for_write(
    nodes: &[StorageNode],
    region: Option<&str>,
    count: usize,
) -> Vec<StorageNode> {
    let mut local: Vec<&StorageNode> = nodes
        .iter()
        .filter(|n| n.is_healthy() && region.is_some() && in_region(n, region))
        .collect();
    local.sort_by(|a, b| by_most_storage(a, b));

    let mut remote: Vec<&StorageNode> = nodes
        .iter()
        .filter(|n| n.is_healthy() && !(region.is_some() && in_region(n, region)))
        .collect();
    remote.sort_by(|a, b| by_most_storage(a, b));

    local
        .into_iter()
        .chain(remote)
        .take(count)
        .cloned()
        .collect()
}
