use clap::Parser;
use std::time::Duration;

/// Relay signature served on the root page of every DERP relay
pub const DERP_FINGERPRINT: &str = "<h1>DERP</h1>";

/// Command-line interface for the relayrank service
#[derive(Parser, Debug, Clone)]
#[clap(
    name = "relayrank",
    about = "Discovers public DERP relays, keeps their health ranked and pushes the best ones to a tailnet",
    version
)]
pub struct Cli {
    /// Address to bind the web server on
    #[clap(long, env("RELAYRANK_HOST"), default_value = "0.0.0.0")]
    pub host: String,

    /// Port to run the web server on
    #[clap(short, long, env("RELAYRANK_PORT"), default_value = "8080")]
    pub port: u16,

    /// Account e-mail for the FOFA search feed
    #[clap(long, env("FOFA_EMAIL"), default_value = "", hide_env_values = true)]
    pub fofa_email: String,

    /// API key for the FOFA search feed
    #[clap(long, env("FOFA_KEY"), default_value = "", hide_env_values = true)]
    pub fofa_key: String,

    /// Base URL of the FOFA API
    #[clap(long, default_value = "https://fofa.info")]
    pub fofa_url: String,

    /// Search query used to discover relays
    #[clap(long, default_value = "\"<h1>DERP</h1>\"")]
    pub feed_query: String,

    /// Records requested per feed page
    #[clap(long, default_value = "100")]
    pub fetch_batch: usize,

    /// Maximum records taken from the feed per pass (0 = unlimited)
    #[clap(long, default_value = "0")]
    pub max_results: usize,

    /// Directory for file-backed persistence
    #[clap(long, env("DATA_PATH"))]
    pub data_path: Option<String>,

    /// Redis URL for persistence (takes precedence over --data-path)
    #[clap(long, env("REDIS_URL"))]
    pub redis_url: Option<String>,

    /// Tailnet (account) whose policy receives the ranked DERP map
    #[clap(long, env("TAILSCALE_TAILNET"))]
    pub tailnet: Option<String>,

    /// Tailscale API key
    #[clap(long, env("TAILSCALE_API_KEY"), hide_env_values = true)]
    pub tailscale_api_key: Option<String>,

    /// Base URL of the Tailscale API
    #[clap(long, default_value = "https://api.tailscale.com")]
    pub tailscale_url: String,

    /// Minimum seconds between probes of the same node
    #[clap(long, default_value = "300")]
    pub recheck_interval: u64,

    /// Probe timeout in milliseconds
    #[clap(long, default_value = "5000")]
    pub probe_timeout_ms: u64,

    /// Maximum number of probes in flight
    #[clap(long, default_value = "25")]
    pub max_concurrent_probes: usize,

    /// Consecutive failures before a node leaves the ranking
    #[clap(long, default_value = "3")]
    pub failure_threshold: u32,

    /// Ranking weight of latency (per millisecond)
    #[clap(long, default_value = "1.0")]
    pub latency_weight: f64,

    /// Ranking weight of bandwidth (per Mbps)
    #[clap(long, default_value = "0.0")]
    pub bandwidth_weight: f64,

    /// Seconds between discovery refreshes
    #[clap(long, default_value = "43200")] // Default: 12 hours
    pub fetch_interval: u64,

    /// Seconds between full registry resets
    #[clap(long, default_value = "604800")] // Default: 7 days
    pub reset_interval: u64,

    /// Seconds between automatic configuration pushes
    #[clap(long, default_value = "3600")]
    pub push_interval: u64,

    /// Number of regions ranked for pushes and sorted maps
    #[clap(long, default_value = "20")]
    pub push_top_k: usize,

    /// Marker a relay must present on its root page
    #[clap(long, default_value = DERP_FINGERPRINT)]
    pub marker: String,

    /// Path downloaded to estimate bandwidth
    #[clap(long, default_value = "/")]
    pub bandwidth_path: String,

    /// Upper bound on the bandwidth transfer window in milliseconds
    #[clap(long, default_value = "2000")]
    pub bandwidth_window_ms: u64,

    /// Stop the bandwidth transfer after this many bytes
    #[clap(long, default_value = "4194304")]
    pub bandwidth_max_bytes: u64,

    /// Timeout for feed and push requests in seconds
    #[clap(long, default_value = "30")]
    pub request_timeout: u64,

    /// Expose the /admin endpoints
    #[clap(long, env("RELAYRANK_ENABLE_ADMIN"))]
    pub enable_admin: bool,
}

impl Cli {
    /// Get the request timeout as a Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
