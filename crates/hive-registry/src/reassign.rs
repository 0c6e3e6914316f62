//! Registry side of client reassignment.

use std::cmp::Ordering;
use std::time::Duration;

use tracing::{debug, info};

use hive_shared::models::{FileRecord, StorageNode};
use hive_shared::protocol::{ReassignReason, ReassignmentRequest, ReassignmentResponse};
use hive_shared::selection::{by_lowest_load, in_region};
use hive_shared::types::utc_now_millis;

use crate::error::RegistryError;
use crate::file_registry::FileRegistry;
use crate::node_registry::NodeRegistry;

#[derive(Clone)]
pub struct Reassigner {
    nodes: NodeRegistry,
    files: FileRegistry,
    client_token: Option<String>,
    token_ttl: Duration,
}

impl Reassigner {
    pub fn new(
        nodes: NodeRegistry,
        files: FileRegistry,
        client_token: Option<String>,
        token_ttl: Duration,
    ) -> Self {
        Self {
            nodes,
            files,
            client_token,
            token_ttl,
        }
    }

    /// Pick a healthy node other than the caller's current one.
    ///
    /// Candidates holding every required file come first, then those in the
    /// preferred region, then the least loaded.
    pub fn reassign(
        &self,
        request: &ReassignmentRequest,
    ) -> Result<ReassignmentResponse, RegistryError> {
        let candidates: Vec<StorageNode> = self
            .nodes
            .get_all_nodes(false)?
            .into_iter()
            .filter(|n| request.current_node_id.as_ref() != Some(&n.id))
            .collect();

        let mut required: Vec<FileRecord> = Vec::with_capacity(request.required_file_access.len());
        for id in &request.required_file_access {
            match self.files.get_file_info(*id)? {
                Some(file) => required.push(file),
                None => debug!(file_id = %id, "Ignoring unknown file in reassignment request"),
            }
        }

        let preferred = request.preferred_region.as_deref();
        let chosen = candidates
            .iter()
            .min_by(|a, b| rank(a, b, &required, preferred))
            .ok_or(RegistryError::NoEligibleNode)?;

        let (token, token_expires_at) = match (&self.client_token, request.reason) {
            (Some(token), ReassignReason::AuthFailure) => {
                let ttl = chrono::Duration::from_std(self.token_ttl)
                    .unwrap_or_else(|_| chrono::Duration::hours(1));
                (Some(token.clone()), Some(utc_now_millis() + ttl))
            }
            _ => (None, None),
        };

        info!(
            from = ?request.current_node_id,
            to = %chosen.id,
            reason = ?request.reason,
            "Client reassigned"
        );

        Ok(ReassignmentResponse {
            node_endpoint: chosen.endpoint.clone(),
            node_id: chosen.id.clone(),
            region: chosen.region.clone(),
            token,
            token_expires_at,
        })
    }
}

fn rank(
    a: &StorageNode,
    b: &StorageNode,
    required: &[FileRecord],
    preferred_region: Option<&str>,
) -> Ordering {
    let holds_all = |n: &StorageNode| required.iter().all(|f| f.is_on(&n.id));
    let in_preferred = |n: &StorageNode| preferred_region.is_some() && in_region(n, preferred_region);

    holds_all(b)
        .cmp(&holds_all(a))
        .then_with(|| in_preferred(b).cmp(&in_preferred(a)))
        .then_with(|| by_lowest_load(a, b))
}
