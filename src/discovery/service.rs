use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use crate::{
    error::AppError,
    models::DiscoveryRecord,
    persistence::Checkpointer,
    registry::{MergeOutcome, RegistryStore},
    utils::parse_endpoint,
};

use super::fofa::{DiscoveryFeed, FeedMessage, FeedQuery};

/// What one discovery pass did to the registry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub skipped: usize,
}

impl IngestSummary {
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.unchanged + self.skipped
    }
}

/// Held for the duration of one wipe-and-rediscover; released on drop
pub struct ResetGuard {
    running: Arc<AtomicBool>,
}

impl Drop for ResetGuard {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Feeds discovery records into the registry
pub struct DiscoveryService {
    feed: Arc<dyn DiscoveryFeed>,
    registry: Arc<RegistryStore>,
    checkpointer: Arc<Checkpointer>,
    query: FeedQuery,
    reset_running: Arc<AtomicBool>,
}

impl DiscoveryService {
    pub fn new(
        feed: Arc<dyn DiscoveryFeed>,
        registry: Arc<RegistryStore>,
        checkpointer: Arc<Checkpointer>,
        query: FeedQuery,
    ) -> Self {
        Self {
            feed,
            registry,
            checkpointer,
            query,
            reset_running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Claim the reset slot, or `None` while another reset holds it
    pub fn begin_reset(&self) -> Option<ResetGuard> {
        if self.reset_running.swap(true, Ordering::SeqCst) {
            return None;
        }
        Some(ResetGuard {
            running: self.reset_running.clone(),
        })
    }

    pub fn reset_in_progress(&self) -> bool {
        self.reset_running.load(Ordering::SeqCst)
    }

    fn ingest(&self, record: &DiscoveryRecord, summary: &mut IngestSummary) {
        let endpoint = match parse_endpoint(&record.address, record.metadata.protocol.as_deref()) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                tracing::debug!("Skipping record: {}", e);
                summary.skipped += 1;
                return;
            }
        };

        if !endpoint.is_public() {
            tracing::debug!("Skipping non-public relay address {}", record.address);
            summary.skipped += 1;
            return;
        }

        match self.registry.merge(record) {
            Ok(MergeOutcome::Inserted) => summary.inserted += 1,
            Ok(MergeOutcome::Updated) => summary.updated += 1,
            Ok(MergeOutcome::Unchanged) => summary.unchanged += 1,
            Err(e) => {
                tracing::warn!("Failed to merge {}: {}", record.address, e);
                summary.skipped += 1;
            }
        }
    }

    /// Drain one full discovery pass into the registry, checkpointing after every batch
    pub async fn refresh(&self) -> Result<IngestSummary, AppError> {
        tracing::info!("Starting discovery pass");
        let mut rx = self.feed.query(&self.query).await?;
        let mut summary = IngestSummary::default();

        loop {
            match rx.recv().await {
                Some(FeedMessage::Batch(records)) => {
                    for record in &records {
                        self.ingest(record, &mut summary);
                    }
                    self.checkpointer.checkpoint().await;
                }
                Some(FeedMessage::Done) => break,
                None => {
                    tracing::warn!("Discovery feed closed without a completion signal");
                    break;
                }
            }
        }

        self.checkpointer.checkpoint().await;
        tracing::info!(
            "Discovery pass finished: {} inserted, {} updated, {} unchanged, {} skipped",
            summary.inserted,
            summary.updated,
            summary.unchanged,
            summary.skipped
        );
        Ok(summary)
    }

    /// Forget every known node, drop the persisted copy, then rediscover from scratch.
    /// The guard from `begin_reset` is held until the rediscovery pass finishes.
    pub async fn reset_and_rediscover(&self, _guard: ResetGuard) -> Result<IngestSummary, AppError> {
        let removed = self.registry.reset();
        self.checkpointer.discard().await;
        tracing::info!("Registry reset, {} nodes removed", removed);
        self.refresh().await
    }

    /// Reset unless one is already running. `Ok(None)` means it was skipped.
    pub async fn try_reset_and_rediscover(&self) -> Result<Option<IngestSummary>, AppError> {
        match self.begin_reset() {
            Some(guard) => self.reset_and_rediscover(guard).await.map(Some),
            None => {
                tracing::info!("Registry reset already in progress, skipping");
                Ok(None)
            }
        }
    }
}
