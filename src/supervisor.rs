//! Owns the long-lived background loops.

use chrono::{DateTime, Utc};
use std::{future::Future, sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    error::AppError,
    persistence::{load_timestamp, save_json, Persistence},
};

const DEFAULT_RESTART_BACKOFF: Duration = Duration::from_secs(5);

/// Upper bound on a single wait so interval changes take effect without a restart
const SCHEDULE_POLL: Duration = Duration::from_secs(60);

/// Spawns named loops, restarts them when they panic, and joins them on shutdown
pub struct Supervisor {
    cancel: CancellationToken,
    restart_backoff: Duration,
    tasks: Vec<(String, JoinHandle<()>)>,
}

impl Supervisor {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            restart_backoff: DEFAULT_RESTART_BACKOFF,
            tasks: Vec::new(),
        }
    }

    pub fn with_restart_backoff(mut self, backoff: Duration) -> Self {
        self.restart_backoff = backoff;
        self
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run `factory`'s loop until shutdown. Each restart calls the factory again.
    pub fn spawn<F, Fut>(&mut self, name: &str, factory: F)
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        let backoff = self.restart_backoff;
        let task_name = name.to_string();

        let handle = tokio::spawn(async move {
            loop {
                let run = tokio::spawn(factory(cancel.clone()));
                match run.await {
                    Ok(()) if cancel.is_cancelled() => break,
                    Ok(()) => tracing::warn!("Task {} exited unexpectedly, restarting", task_name),
                    Err(e) if e.is_panic() => {
                        tracing::error!("Task {} panicked, restarting: {}", task_name, e)
                    }
                    Err(e) => {
                        tracing::error!("Task {} was aborted: {}", task_name, e);
                        break;
                    }
                }

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
            tracing::debug!("Task {} stopped", task_name);
        });

        tracing::info!("Started task {}", name);
        self.tasks.push((name.to_string(), handle));
    }

    /// Cancel every task and wait up to `timeout` for each to finish
    pub async fn shutdown(self, timeout: Duration) {
        self.cancel.cancel();
        for (name, mut handle) in self.tasks {
            match tokio::time::timeout(timeout, &mut handle).await {
                Ok(Ok(())) => tracing::info!("Task {} shut down", name),
                Ok(Err(e)) => tracing::error!("Task {} failed during shutdown: {}", name, e),
                Err(_) => {
                    tracing::warn!("Task {} did not stop within {:?}, aborting", name, timeout);
                    handle.abort();
                }
            }
        }
    }
}

/// When a periodic job with no recorded last run should first fire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirstRun {
    Immediate,
    /// Wait one full interval, recording now as the last run
    Deferred,
}

/// Drive a periodic job whose last run is persisted under `timestamp_key`.
///
/// The job runs once the last run is `interval()` old. A failed run is logged
/// and still counts as a run, so it is retried on the next schedule. The last
/// run is also kept in memory, so the cadence holds while the store is down.
pub async fn run_periodic<I, F, Fut>(
    name: &str,
    store: Arc<dyn Persistence>,
    timestamp_key: &str,
    first_run: FirstRun,
    interval: I,
    cancel: CancellationToken,
    job: F,
) where
    I: Fn() -> Duration,
    F: Fn() -> Fut,
    Fut: Future<Output = Result<(), AppError>>,
{
    let mut last_run: Option<DateTime<Utc>> = None;

    loop {
        let stored = load_timestamp(store.as_ref(), timestamp_key).await;
        // Newest of the stored and in-memory timestamps
        let known = match (stored, last_run) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };

        let wait = match known {
            Some(last) => {
                let age = Utc::now()
                    .signed_duration_since(last)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                interval().saturating_sub(age)
            }
            None if first_run == FirstRun::Immediate => Duration::ZERO,
            None => {
                let now = Utc::now();
                last_run = Some(now);
                record_run(store.as_ref(), timestamp_key, now).await;
                interval()
            }
        };

        if !wait.is_zero() {
            tracing::debug!("Next {} run in {:?}", name, wait);
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(wait.min(SCHEDULE_POLL)) => continue,
            }
        }

        if cancel.is_cancelled() {
            return;
        }

        tracing::info!("Running {}", name);
        if let Err(e) = job().await {
            tracing::error!("{} failed, retrying on the next schedule: {}", name, e);
        }
        let now = Utc::now();
        last_run = Some(now);
        record_run(store.as_ref(), timestamp_key, now).await;
    }
}

async fn record_run(store: &dyn Persistence, timestamp_key: &str, at: DateTime<Utc>) {
    if let Err(e) = save_json(store, timestamp_key, &at).await {
        tracing::warn!("Failed to record {}: {}", timestamp_key, e);
    }
}
