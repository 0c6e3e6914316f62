//! NodeHealthMonitor: the registry's background control loop.
//!
//! One interval drives everything. Every tick runs a health check; every
//! `replication_interval` the same tick also runs a replication scan. A tick
//! is awaited to completion before the next one is taken, and missed ticks
//! are delayed rather than bursted, so iterations never overlap.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use hive_shared::models::{FileRecord, StorageNode};
use hive_shared::selection::{by_lowest_load, by_most_storage};
use hive_shared::types::{utc_now_millis, FileId, NodeId};

use crate::config::RegistryConfig;
use crate::error::RegistryError;
use crate::file_registry::FileRegistry;
use crate::node_registry::{silent_for, NodeRegistry};
use crate::transfer::NodeTransfer;

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub health_check_interval: Duration,
    pub replication_interval: Duration,
    pub node_offline_threshold: Duration,
    pub node_expiration: Duration,
    pub min_replication_factor: usize,
    pub max_parallel_replications: usize,
}

impl From<&RegistryConfig> for MonitorConfig {
    fn from(config: &RegistryConfig) -> Self {
        Self {
            health_check_interval: config.health_check_interval,
            replication_interval: config.replication_interval,
            node_offline_threshold: config.node_offline_threshold,
            node_expiration: config.node_expiration,
            min_replication_factor: config.min_replication_factor,
            max_parallel_replications: config.max_parallel_replications,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self::from(&RegistryConfig::default())
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub checked: usize,
    pub marked_unhealthy: Vec<NodeId>,
    pub expired: Vec<NodeId>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReplicationReport {
    pub under_replicated: usize,
    pub copies_started: usize,
    pub copies_succeeded: usize,
    pub copies_failed: usize,
    /// Files with no healthy holder left to copy from.
    pub deficits: Vec<FileId>,
    /// Files with a source but no node able to take another copy.
    pub unplaceable: usize,
}

/// What one replication pass should do for one file.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicationPlan {
    Satisfied,
    NoHealthySource,
    Copy {
        source: StorageNode,
        targets: Vec<StorageNode>,
    },
}

/// Choose the source and targets for an under-replicated file.
///
/// `remaining` tracks free space per healthy node across the whole batch and
/// is debited for every planned target.
pub fn plan_replication(
    file: &FileRecord,
    healthy_nodes: &[StorageNode],
    min_replication_factor: usize,
    remaining: &mut HashMap<NodeId, u64>,
) -> ReplicationPlan {
    let holders: Vec<&StorageNode> = healthy_nodes.iter().filter(|n| file.is_on(&n.id)).collect();
    if holders.len() >= min_replication_factor {
        return ReplicationPlan::Satisfied;
    }
    let Some(source) = holders.iter().copied().min_by(|a, b| by_lowest_load(a, b)) else {
        return ReplicationPlan::NoHealthySource;
    };
    let deficit = min_replication_factor - holders.len();

    let mut candidates: Vec<&StorageNode> = healthy_nodes
        .iter()
        .filter(|n| !file.is_on(&n.id))
        .filter(|n| remaining.get(&n.id).copied().unwrap_or(0) >= file.size)
        .collect();
    candidates.sort_by(|a, b| {
        let space_a = remaining.get(&a.id).copied().unwrap_or(0);
        let space_b = remaining.get(&b.id).copied().unwrap_or(0);
        space_b
            .cmp(&space_a)
            .then_with(|| by_most_storage(a, b))
    });

    let targets: Vec<StorageNode> = candidates.into_iter().take(deficit).cloned().collect();
    for target in &targets {
        if let Some(space) = remaining.get_mut(&target.id) {
            *space = space.saturating_sub(file.size);
        }
    }

    ReplicationPlan::Copy {
        source: source.clone(),
        targets,
    }
}

pub struct NodeHealthMonitor {
    nodes: NodeRegistry,
    files: FileRegistry,
    transfer: Arc<dyn NodeTransfer>,
    config: MonitorConfig,
    permits: Arc<Semaphore>,
}

impl NodeHealthMonitor {
    pub fn new(
        nodes: NodeRegistry,
        files: FileRegistry,
        transfer: Arc<dyn NodeTransfer>,
        config: MonitorConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_parallel_replications.max(1)));
        Self {
            nodes,
            files,
            transfer,
            config,
            permits,
        }
    }

    /// Run until `shutdown` is cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            health_interval = ?self.config.health_check_interval,
            replication_interval = ?self.config.replication_interval,
            min_replication_factor = self.config.min_replication_factor,
            "Node health monitor started"
        );

        let mut ticker = tokio::time::interval(self.config.health_check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_replication = Instant::now();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.check_node_health(utc_now_millis()) {
                Ok(report) => {
                    if !report.marked_unhealthy.is_empty() || !report.expired.is_empty() {
                        info!(
                            checked = report.checked,
                            marked_unhealthy = report.marked_unhealthy.len(),
                            expired = report.expired.len(),
                            "Health check complete"
                        );
                    } else {
                        debug!(checked = report.checked, "Health check complete");
                    }
                }
                Err(e) => error!(error = %e, "Health check failed"),
            }

            if last_replication.elapsed() < self.config.replication_interval {
                continue;
            }
            last_replication = Instant::now();

            tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.ensure_replication_factor() => match result {
                    Ok(report) => info!(
                        under_replicated = report.under_replicated,
                        copies_started = report.copies_started,
                        copies_succeeded = report.copies_succeeded,
                        copies_failed = report.copies_failed,
                        deficits = report.deficits.len(),
                        unplaceable = report.unplaceable,
                        "Replication scan complete"
                    ),
                    Err(e) => error!(error = %e, "Replication scan failed"),
                }
            }
        }

        info!("Node health monitor stopped");
    }

    /// Mark silent nodes unhealthy, then expire long-dead ones.
    pub fn check_node_health(&self, now: DateTime<Utc>) -> Result<HealthReport, RegistryError> {
        let nodes = self.nodes.get_all_nodes(true)?;
        let mut report = HealthReport {
            checked: nodes.len(),
            ..HealthReport::default()
        };

        for node in &nodes {
            if !node.is_healthy() || !silent_for(node, now, self.config.node_offline_threshold) {
                continue;
            }
            if self.nodes.mark_node_unhealthy(&node.id)? {
                warn!(
                    node_id = %node.id,
                    last_seen = %node.last_seen,
                    "Node went silent"
                );
                report.marked_unhealthy.push(node.id.clone());
            }
        }

        report.expired = self.nodes.expire_nodes(now, self.config.node_expiration)?;
        Ok(report)
    }

    /// One full under-replication scan, batch by batch.
    pub async fn ensure_replication_factor(&self) -> Result<ReplicationReport, RegistryError> {
        let min = self.config.min_replication_factor;
        let mut report = ReplicationReport::default();
        let mut after = None;

        loop {
            let healthy_nodes = self.nodes.get_all_nodes(false)?;
            let healthy_ids: BTreeSet<NodeId> =
                healthy_nodes.iter().map(|n| n.id.clone()).collect();
            let batch = self.files.under_replicated_batch(min, after, &healthy_ids)?;

            let mut remaining: HashMap<NodeId, u64> = healthy_nodes
                .iter()
                .map(|n| (n.id.clone(), n.available_space()))
                .collect();
            let mut copies = JoinSet::new();

            for file in batch.files {
                report.under_replicated += 1;
                let (source, targets) =
                    match plan_replication(&file, &healthy_nodes, min, &mut remaining) {
                        ReplicationPlan::Satisfied => continue,
                        ReplicationPlan::NoHealthySource => {
                            warn!(
                                file_id = %file.file_id,
                                locations = file.node_ids.len(),
                                "Replication deficit: no healthy holder"
                            );
                            report.deficits.push(file.file_id);
                            continue;
                        }
                        ReplicationPlan::Copy { source, targets } => (source, targets),
                    };

                if targets.is_empty() {
                    warn!(
                        file_id = %file.file_id,
                        size = file.size,
                        "No healthy node can take another copy"
                    );
                    report.unplaceable += 1;
                    continue;
                }

                for target in targets {
                    let permit = self
                        .permits
                        .clone()
                        .acquire_owned()
                        .await
                        .map_err(|e| RegistryError::Internal(format!("replication semaphore: {e}")))?;
                    let transfer = self.transfer.clone();
                    let files = self.files.clone();
                    let file = file.clone();
                    let source = source.clone();
                    report.copies_started += 1;

                    copies.spawn(async move {
                        let _permit = permit;
                        let copied = transfer.copy_file(&file, &source, &target).await;
                        match copied {
                            Ok(bytes) => match files.add_file_location(file.file_id, &target.id) {
                                Ok(_) => {
                                    info!(
                                        file_id = %file.file_id,
                                        source = %source.id,
                                        target = %target.id,
                                        bytes,
                                        "Replica created"
                                    );
                                    true
                                }
                                Err(e) => {
                                    warn!(file_id = %file.file_id, target = %target.id, error = %e, "Replica copied but location not recorded");
                                    false
                                }
                            },
                            Err(e) => {
                                warn!(
                                    file_id = %file.file_id,
                                    source = %source.id,
                                    target = %target.id,
                                    error = %e,
                                    "Replica copy failed"
                                );
                                false
                            }
                        }
                    });
                }
            }

            while let Some(joined) = copies.join_next().await {
                match joined {
                    Ok(true) => report.copies_succeeded += 1,
                    Ok(false) => report.copies_failed += 1,
                    Err(e) => {
                        error!(error = %e, "Replication task panicked");
                        report.copies_failed += 1;
                    }
                }
            }

            match batch.next {
                Some(cursor) => after = Some(cursor),
                None => break,
            }
        }

        Ok(report)
    }
}
