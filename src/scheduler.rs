//! Background loop that keeps every node's health fresh.

use chrono::{DateTime, Utc};
use futures::{stream, StreamExt};
use rand::seq::SliceRandom;
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;

use crate::{
    config::LiveConfig,
    models::Registry,
    persistence::Checkpointer,
    probe::{ProbeTarget, Prober},
    registry::RegistryStore,
    utils::format_bandwidth,
};

/// Outcome counts of one recheck cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub probed: usize,
    pub alive: usize,
    pub failed: usize,
}

/// Nodes due for a probe at `now`, plus how long until the next one becomes due
pub fn plan_due(
    snapshot: &Registry,
    now: DateTime<Utc>,
    recheck_interval: Duration,
) -> (Vec<ProbeTarget>, Option<Duration>) {
    let mut due = Vec::new();
    let mut next_due: Option<Duration> = None;

    for node in snapshot.nodes() {
        let wait = match node.last_probed_at {
            None => Duration::ZERO,
            Some(last) => {
                // A timestamp in the future counts as probed just now
                let age = now.signed_duration_since(last).to_std().unwrap_or(Duration::ZERO);
                recheck_interval.saturating_sub(age)
            }
        };

        if wait.is_zero() {
            due.push(ProbeTarget {
                id: node.id.clone(),
                host_port: node.host_port.clone(),
                secure: node.secure,
            });
        } else {
            next_due = Some(next_due.map_or(wait, |current| current.min(wait)));
        }
    }

    (due, next_due)
}

pub struct RecheckScheduler {
    registry: Arc<RegistryStore>,
    prober: Arc<dyn Prober>,
    config: Arc<LiveConfig>,
    checkpointer: Arc<Checkpointer>,
}

impl RecheckScheduler {
    pub fn new(
        registry: Arc<RegistryStore>,
        prober: Arc<dyn Prober>,
        config: Arc<LiveConfig>,
        checkpointer: Arc<Checkpointer>,
    ) -> Self {
        Self {
            registry,
            prober,
            config,
            checkpointer,
        }
    }

    /// Probe every due node once, at most `maxConcurrentProbes` at a time
    pub async fn run_cycle(&self) -> CycleSummary {
        let policy = self.config.policy();
        let snapshot = self.registry.snapshot();
        let (mut due, _) = plan_due(&snapshot, Utc::now(), policy.recheck_interval);
        drop(snapshot);

        if due.is_empty() {
            return CycleSummary::default();
        }

        // Spread load when many nodes share a host
        due.shuffle(&mut rand::thread_rng());
        tracing::debug!(
            "Probing {} due nodes with concurrency {}",
            due.len(),
            policy.max_concurrent_probes
        );

        let prober = self.prober.clone();
        let timeout = policy.probe_timeout;
        let mut results = stream::iter(due)
            .map(|target| {
                let prober = prober.clone();
                async move {
                    let result = prober.probe(&target, timeout).await;
                    (target, result)
                }
            })
            .buffer_unordered(policy.max_concurrent_probes);

        let mut summary = CycleSummary::default();
        while let Some((target, result)) = results.next().await {
            summary.probed += 1;
            match &result {
                Ok(measurement) => {
                    summary.alive += 1;
                    tracing::debug!(
                        "Probe of {} ok: {:?}, {}",
                        target.id,
                        measurement.latency,
                        measurement
                            .bandwidth
                            .map(format_bandwidth)
                            .unwrap_or_else(|| "bandwidth unknown".to_string())
                    );
                }
                Err(failure) => {
                    summary.failed += 1;
                    tracing::debug!("Probe of {} failed: {}", target.id, failure);
                }
            }
            if !self.registry.apply_probe_result(&target.id, &result) {
                tracing::debug!("Node {} was removed while being probed", target.id);
            }
        }

        tracing::info!(
            "Recheck cycle done: {} probed, {} alive, {} failed",
            summary.probed,
            summary.alive,
            summary.failed
        );
        self.checkpointer.checkpoint().await;
        summary
    }

    /// Run cycles until cancelled. Between cycles the loop sleeps until the
    /// earliest next-due node, waking early for newly inserted nodes.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!("Recheck scheduler started");
        loop {
            if cancel.is_cancelled() {
                break;
            }

            self.run_cycle().await;

            let recheck_interval = self.config.policy().recheck_interval;
            let (due, next_due) = plan_due(&self.registry.snapshot(), Utc::now(), recheck_interval);
            if !due.is_empty() {
                continue;
            }
            let wait = next_due.unwrap_or(recheck_interval);

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
                _ = self.registry.inserted() => {
                    tracing::debug!("New node discovered, rechecking early");
                }
            }
        }
        tracing::info!("Recheck scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{Policy, RuntimeConfig},
        models::{DiscoveryRecord, NodeId, NodeStatus},
        persistence::{MemoryStore, Persistence},
        probe::{ProbeFailure, ProbeMeasurement, ProbeResult},
        ranking::{filter, top_k, NodeFilter, StatusFilter},
    };
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeProber {
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        calls: AtomicUsize,
        failing: Mutex<HashSet<NodeId>>,
        delay: Duration,
    }

    #[async_trait]
    impl Prober for FakeProber {
        async fn probe(&self, target: &ProbeTarget, _timeout: Duration) -> ProbeResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.failing.lock().contains(&target.id) {
                Err(ProbeFailure::ConnectionRefused)
            } else {
                Ok(ProbeMeasurement {
                    latency: Duration::from_millis(20),
                    bandwidth: Some(1_000_000),
                })
            }
        }
    }

    fn scheduler(prober: Arc<FakeProber>, policy: Policy) -> (RecheckScheduler, Arc<RegistryStore>) {
        let registry = Arc::new(RegistryStore::new());
        let store: Arc<dyn Persistence> = Arc::new(MemoryStore::default());
        let config = Arc::new(
            LiveConfig::new(RuntimeConfig {
                policy,
                ..Default::default()
            })
            .unwrap(),
        );
        let checkpointer = Arc::new(Checkpointer::new(store, registry.clone()));
        (
            RecheckScheduler::new(registry.clone(), prober, config, checkpointer),
            registry,
        )
    }

    fn populate(registry: &RegistryStore, count: u8) {
        for i in 0..count {
            registry
                .merge(&DiscoveryRecord::new(format!("8.8.{}.1", i)))
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_cycle_respects_concurrency_bound() {
        let prober = Arc::new(FakeProber {
            delay: Duration::from_millis(20),
            ..Default::default()
        });
        let policy = Policy {
            max_concurrent_probes: 3,
            ..Default::default()
        };
        let (scheduler, registry) = scheduler(prober.clone(), policy);
        populate(&registry, 20);

        let summary = scheduler.run_cycle().await;

        assert_eq!(summary.probed, 20);
        assert_eq!(summary.alive, 20);
        assert!(prober.max_in_flight.load(Ordering::SeqCst) <= 3);
        assert!(registry
            .snapshot()
            .nodes()
            .all(|n| n.status == NodeStatus::Alive));
    }

    #[tokio::test]
    async fn test_recently_probed_nodes_are_not_due() {
        let prober = Arc::new(FakeProber::default());
        let (scheduler, registry) = scheduler(prober.clone(), Policy::default());
        populate(&registry, 4);

        assert_eq!(scheduler.run_cycle().await.probed, 4);
        assert_eq!(scheduler.run_cycle().await.probed, 0);
        assert_eq!(prober.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_failing_node_drops_out_of_ranking() {
        let prober = Arc::new(FakeProber::default());
        let policy = Policy {
            recheck_interval: Duration::from_millis(1),
            failure_threshold: 3,
            ..Default::default()
        };
        let (scheduler, registry) = scheduler(prober.clone(), policy.clone());
        populate(&registry, 2);
        let bad = NodeId::new("8.8.1.1", 443);
        prober.failing.lock().insert(bad.clone());

        for _ in 0..3 {
            scheduler.run_cycle().await;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.node(&bad).unwrap().consecutive_failures, 3);

        let ranked = top_k(&snapshot, 10, &policy);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].region_id, "8.8.0.1");

        let errors = filter(
            &snapshot,
            &NodeFilter {
                status: StatusFilter::Error,
                ..Default::default()
            },
        );
        assert!(errors.node(&bad).is_some());
    }

    #[test]
    fn test_plan_due_reports_earliest_next_due() {
        let registry = RegistryStore::new();
        populate(&registry, 3);
        let now = Utc::now();
        let interval = Duration::from_secs(60);

        let ok: ProbeResult = Ok(ProbeMeasurement {
            latency: Duration::from_millis(5),
            bandwidth: None,
        });
        registry.apply_probe_result_at(&NodeId::new("8.8.0.1", 443), &ok, now - chrono::Duration::seconds(50));
        registry.apply_probe_result_at(&NodeId::new("8.8.1.1", 443), &ok, now - chrono::Duration::seconds(20));

        let (due, next_due) = plan_due(&registry.snapshot(), now, interval);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, NodeId::new("8.8.2.1", 443));
        assert_eq!(next_due, Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_plan_due_on_empty_registry() {
        let (due, next_due) = plan_due(&Registry::default(), Utc::now(), Duration::from_secs(60));
        assert!(due.is_empty());
        assert_eq!(next_due, None);
    }

    #[tokio::test]
    async fn test_run_wakes_on_insert_and_stops_on_cancel() {
        let prober = Arc::new(FakeProber::default());
        let (scheduler, registry) = scheduler(prober.clone(), Policy::default());
        let scheduler = Arc::new(scheduler);
        let cancel = CancellationToken::new();

        let handle = {
            let scheduler = scheduler.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { scheduler.run(cancel).await })
        };

        // Empty registry: the loop sleeps for the full recheck interval unless woken
        tokio::time::sleep(Duration::from_millis(20)).await;
        populate(&registry, 1);

        tokio::time::timeout(Duration::from_secs(2), async {
            while prober.calls.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("insert should wake the scheduler");

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("scheduler should stop promptly")
            .unwrap();
    }
}
