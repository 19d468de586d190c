//! Concurrency-safe relay registry.
//!
//! Every mutation goes through one `parking_lot::Mutex` held only for the
//! in-memory update; callers never hold it across network I/O. Snapshots are
//! deep copies taken under the same lock, so a reader never sees a half-written node.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::Notify;

use crate::{
    error::AppError,
    models::{
        region_id_for, region_name_for, DiscoveryRecord, Node, NodeId, NodeStatus, Region,
        Registry,
    },
    probe::ProbeResult,
    utils::parse_endpoint,
};

/// What a merge did to the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    Updated,
    Unchanged,
}

#[derive(Debug, Default)]
struct Inner {
    registry: Registry,
    /// node id -> region id
    index: HashMap<NodeId, String>,
    /// Bumped on every state change, used to skip redundant checkpoints
    generation: u64,
}

impl Inner {
    fn from_registry(registry: Registry) -> Self {
        let mut inner = Inner::default();
        for region in registry.regions.into_values() {
            for (_, mut node) in region.nodes {
                // Re-file nodes under the region their address implies
                let implied_region = node.host().to_ascii_lowercase();
                if !implied_region.is_empty() {
                    node.region_id = implied_region;
                } else if node.region_id.is_empty() {
                    node.region_id = region.id.clone();
                }
                if node.region_name.is_empty() {
                    node.region_name = region.name.clone();
                }
                if node.status == NodeStatus::Alive && node.latency.is_none() {
                    tracing::debug!("Restored node {} was alive without latency, resetting", node.id);
                    node.status = NodeStatus::Unknown;
                }
                inner.insert_node(node);
            }
        }
        inner
    }

    fn insert_node(&mut self, node: Node) {
        if let Some(previous_region) = self.index.get(&node.id).cloned() {
            self.remove_from_region(&previous_region, &node.id);
        }
        self.index.insert(node.id.clone(), node.region_id.clone());
        let region = self
            .registry
            .regions
            .entry(node.region_id.clone())
            .or_insert_with(|| Region::new(node.region_id.clone(), node.region_name.clone()));
        region.nodes.insert(node.id.clone(), node);
        region.refresh_name();
    }

    fn remove_from_region(&mut self, region_id: &str, node_id: &NodeId) {
        if let Some(region) = self.registry.regions.get_mut(region_id) {
            region.nodes.remove(node_id);
            if region.nodes.is_empty() {
                self.registry.regions.remove(region_id);
            } else {
                region.refresh_name();
            }
        }
    }

    fn node_mut(&mut self, id: &NodeId) -> Option<&mut Node> {
        let region_id = self.index.get(id)?;
        self.registry.regions.get_mut(region_id)?.nodes.get_mut(id)
    }
}

/// The single shared registry instance
#[derive(Debug, Default)]
pub struct RegistryStore {
    inner: Mutex<Inner>,
    inserted: Notify,
}

impl RegistryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from a previously persisted registry, repairing inconsistent nodes
    pub fn from_registry(registry: Registry) -> Self {
        Self {
            inner: Mutex::new(Inner::from_registry(registry)),
            inserted: Notify::new(),
        }
    }

    /// Insert a new node or refresh the address metadata of an existing one.
    /// Health fields of an existing node are never touched.
    pub fn merge(&self, record: &DiscoveryRecord) -> Result<MergeOutcome, AppError> {
        let endpoint = parse_endpoint(&record.address, record.metadata.protocol.as_deref())?;
        let mut metadata = record.metadata.clone();
        if metadata.ip.is_none() {
            metadata.ip = endpoint.ip.map(|ip| ip.to_string());
        }

        let id = NodeId::new(&endpoint.host, endpoint.port);
        let region_id = region_id_for(&endpoint);
        let region_name = region_name_for(&endpoint, &metadata);
        let host_port = endpoint.host_port();

        let mut inner = self.inner.lock();

        if let Some(node) = inner.node_mut(&id) {
            let unchanged = node.host_port == host_port
                && node.secure == endpoint.secure
                && node.metadata == metadata
                && node.region_name == region_name;
            if unchanged {
                return Ok(MergeOutcome::Unchanged);
            }

            node.host_port = host_port;
            node.secure = endpoint.secure;
            node.metadata = metadata;
            node.region_name = region_name;
            if let Some(region) = inner.registry.regions.get_mut(&region_id) {
                region.refresh_name();
            }
            inner.generation += 1;
            return Ok(MergeOutcome::Updated);
        }

        let node = Node::new(&endpoint, metadata, Utc::now());
        debug_assert_eq!(node.id, id);
        inner.insert_node(node);
        inner.generation += 1;
        drop(inner);

        self.inserted.notify_one();
        Ok(MergeOutcome::Inserted)
    }

    /// Consistent point-in-time copy of the whole registry
    pub fn snapshot(&self) -> Registry {
        self.inner.lock().registry.clone()
    }

    /// Snapshot together with the generation it was taken at
    pub fn snapshot_with_generation(&self) -> (u64, Registry) {
        let inner = self.inner.lock();
        (inner.generation, inner.registry.clone())
    }

    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    /// Record one probe result. Returns false when the node no longer exists.
    pub fn apply_probe_result(&self, id: &NodeId, result: &ProbeResult) -> bool {
        self.apply_probe_result_at(id, result, Utc::now())
    }

    pub fn apply_probe_result_at(
        &self,
        id: &NodeId,
        result: &ProbeResult,
        probed_at: DateTime<Utc>,
    ) -> bool {
        let mut inner = self.inner.lock();
        let Some(node) = inner.node_mut(id) else {
            return false;
        };

        match result {
            Ok(measurement) => {
                node.status = NodeStatus::Alive;
                node.latency = Some(measurement.latency);
                node.bandwidth = measurement.bandwidth.or(node.bandwidth);
                node.consecutive_failures = 0;
                node.last_error = None;
            }
            Err(failure) => {
                node.status = NodeStatus::Error;
                node.consecutive_failures = node.consecutive_failures.saturating_add(1);
                node.last_error = Some(failure.to_string());
            }
        }
        node.last_probed_at = Some(probed_at);
        inner.generation += 1;
        true
    }

    /// Atomically replace the registry with an empty one
    pub fn reset(&self) -> usize {
        let mut inner = self.inner.lock();
        let removed = inner.registry.node_count();
        let generation = inner.generation + 1;
        *inner = Inner {
            generation,
            ..Inner::default()
        };
        removed
    }

    /// Wait until a merge inserts a previously unknown node
    pub async fn inserted(&self) {
        self.inserted.notified().await;
    }
}
