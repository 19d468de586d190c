//! Single-shot liveness, latency and bandwidth measurement of one relay.

use async_trait::async_trait;
use reqwest::Client;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::{config::ProbeSettings, error::AppError, models::NodeId};

/// Successful probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeMeasurement {
    pub latency: Duration,
    /// Bits per second, absent when the transfer produced nothing usable
    pub bandwidth: Option<u64>,
}

/// Transient probe failure, recorded on the node and never escalated
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeFailure {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection refused")]
    ConnectionRefused,

    #[error("relay marker not found in response")]
    MarkerMismatch,

    #[error("transport error: {0}")]
    Transport(String),
}

impl ProbeFailure {
    fn from_reqwest(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            ProbeFailure::Timeout(timeout)
        } else if err.is_connect() {
            ProbeFailure::ConnectionRefused
        } else {
            ProbeFailure::Transport(err.to_string())
        }
    }
}

pub type ProbeResult = Result<ProbeMeasurement, ProbeFailure>;

/// Address of a node as handed to a prober
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub id: NodeId,
    pub host_port: String,
    pub secure: bool,
}

impl ProbeTarget {
    pub fn url(&self, path: &str) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{}://{}{}", scheme, self.host_port, path)
    }
}

/// A stateless health check. Implementations must honour `timeout` strictly and never retry.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, target: &ProbeTarget, timeout: Duration) -> ProbeResult;
}

/// Create an HTTP client suitable for probing relays
pub fn create_probe_client() -> Result<Client, AppError> {
    reqwest::Client::builder()
        .user_agent(concat!("relayrank/", env!("CARGO_PKG_VERSION")))
        // Relays reached by IP present certificates for their hostname
        .danger_accept_invalid_certs(true)
        .redirect(reqwest::redirect::Policy::none())
        .pool_max_idle_per_host(1)
        .build()
        .map_err(|e| AppError::RequestError(format!("Failed to create probe client: {}", e)))
}

/// Probes a relay's HTTP(S) root page for the relay marker
pub struct HttpProber {
    client: Client,
    settings: ProbeSettings,
}

impl HttpProber {
    pub fn new(settings: ProbeSettings) -> Result<Self, AppError> {
        Ok(Self {
            client: create_probe_client()?,
            settings,
        })
    }

    async fn measure(&self, target: &ProbeTarget, timeout: Duration) -> ProbeResult {
        let started = Instant::now();

        let response = self
            .client
            .get(target.url("/"))
            .send()
            .await
            .map_err(|e| ProbeFailure::from_reqwest(e, timeout))?;
        let body = response
            .text()
            .await
            .map_err(|e| ProbeFailure::from_reqwest(e, timeout))?;
        let latency = started.elapsed();

        if !body.contains(&self.settings.marker) {
            return Err(ProbeFailure::MarkerMismatch);
        }

        // Leave at least half of the remaining budget unused so the transfer
        // can never turn a live relay into a timeout
        let remaining = timeout.saturating_sub(started.elapsed());
        let window = self.settings.bandwidth_window.min(remaining / 2);
        let bandwidth = self.measure_bandwidth(target, window).await;

        Ok(ProbeMeasurement { latency, bandwidth })
    }

    async fn measure_bandwidth(&self, target: &ProbeTarget, window: Duration) -> Option<u64> {
        if window.is_zero() || self.settings.bandwidth_max_bytes == 0 {
            return None;
        }

        let url = target.url(&self.settings.bandwidth_path);
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + window;
        let mut bytes: u64 = 0;

        'transfer: while bytes < self.settings.bandwidth_max_bytes {
            let mut response =
                match tokio::time::timeout_at(deadline, self.client.get(&url).send()).await {
                    Ok(Ok(resp)) if resp.status().is_success() => resp,
                    Ok(Ok(resp)) => {
                        tracing::debug!("Bandwidth transfer from {} returned {}", url, resp.status());
                        break;
                    }
                    Ok(Err(e)) => {
                        tracing::debug!("Bandwidth transfer from {} failed: {}", url, e);
                        break;
                    }
                    Err(_) => break,
                };

            let before = bytes;
            loop {
                match tokio::time::timeout_at(deadline, response.chunk()).await {
                    Ok(Ok(Some(chunk))) => {
                        bytes += chunk.len() as u64;
                        if bytes >= self.settings.bandwidth_max_bytes {
                            break 'transfer;
                        }
                    }
                    Ok(Ok(None)) => break,
                    Ok(Err(_)) | Err(_) => break 'transfer,
                }
            }

            // An empty body would spin until the deadline without measuring anything
            if bytes == before {
                break;
            }
        }

        let elapsed = started.elapsed();
        if bytes == 0 || elapsed.is_zero() {
            return None;
        }
        Some(((bytes * 8) as f64 / elapsed.as_secs_f64()) as u64)
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn probe(&self, target: &ProbeTarget, timeout: Duration) -> ProbeResult {
        match tokio::time::timeout(timeout, self.measure(target, timeout)).await {
            Ok(result) => result,
            Err(_) => Err(ProbeFailure::Timeout(timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::DERP_FINGERPRINT;
    use axum::{routing::get, Router};
    use std::net::SocketAddr;

    fn settings() -> ProbeSettings {
        ProbeSettings {
            marker: DERP_FINGERPRINT.to_string(),
            bandwidth_path: "/blob".to_string(),
            bandwidth_window: Duration::from_millis(200),
            bandwidth_max_bytes: 256 * 1024,
        }
    }

    async fn serve(router: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr
    }

    fn target(addr: SocketAddr) -> ProbeTarget {
        ProbeTarget {
            id: NodeId::new(&addr.ip().to_string(), addr.port()),
            host_port: addr.to_string(),
            secure: false,
        }
    }

    #[tokio::test]
    async fn test_probe_alive_relay() {
        let router = Router::new()
            .route(
                "/",
                get(|| async { "<html><h1>DERP</h1><p>This is a Tailscale DERP server.</p></html>" }),
            )
            .route("/blob", get(|| async { vec![7u8; 64 * 1024] }));
        let addr = serve(router).await;

        let prober = HttpProber::new(settings()).unwrap();
        let result = prober.probe(&target(addr), Duration::from_secs(5)).await;

        let measurement = result.expect("relay should be alive");
        assert!(measurement.latency < Duration::from_secs(5));
        assert!(measurement.bandwidth.unwrap() > 0);
    }

    #[tokio::test]
    async fn test_probe_marker_mismatch() {
        let router = Router::new().route("/", get(|| async { "<h1>nginx</h1>" }));
        let addr = serve(router).await;

        let prober = HttpProber::new(settings()).unwrap();
        let result = prober.probe(&target(addr), Duration::from_secs(5)).await;
        assert_eq!(result, Err(ProbeFailure::MarkerMismatch));
    }

    #[tokio::test]
    async fn test_probe_times_out() {
        let router = Router::new().route(
            "/",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "<h1>DERP</h1>"
            }),
        );
        let addr = serve(router).await;

        let prober = HttpProber::new(settings()).unwrap();
        let started = Instant::now();
        let result = prober.probe(&target(addr), Duration::from_millis(200)).await;

        assert_eq!(result, Err(ProbeFailure::Timeout(Duration::from_millis(200))));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_probe_connection_refused() {
        // Grab a free port, then close it so nothing is listening
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let prober = HttpProber::new(settings()).unwrap();
        let result = prober.probe(&target(addr), Duration::from_secs(2)).await;
        assert!(matches!(
            result,
            Err(ProbeFailure::ConnectionRefused) | Err(ProbeFailure::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_bandwidth_absent_when_transfer_fails() {
        let router = Router::new().route("/", get(|| async { "<h1>DERP</h1>" }));
        let addr = serve(router).await;

        let prober = HttpProber::new(settings()).unwrap();
        let measurement = prober
            .probe(&target(addr), Duration::from_secs(5))
            .await
            .unwrap();
        // /blob is not served
        assert_eq!(measurement.bandwidth, None);
    }

    #[test]
    fn test_target_url() {
        let t = ProbeTarget {
            id: NodeId::new("derp.example.com", 443),
            host_port: "derp.example.com:443".into(),
            secure: true,
        };
        assert_eq!(t.url("/"), "https://derp.example.com:443/");
    }
}
