use async_trait::async_trait;
use reqwest::{header, Client};
use serde_json::Value;
use std::sync::Arc;

use crate::{
    config::{LiveConfig, PushCredentials},
    derp_map::DerpMap,
    error::AppError,
    ranking::{top_k, RankedRegion},
    registry::RegistryStore,
};

/// Whatever the remote side answered; not interpreted
pub type PushAck = Value;

/// Delivers a ranked region list to an external configuration owner
#[async_trait]
pub trait ConfigPusher: Send + Sync {
    async fn push(
        &self,
        regions: &[RankedRegion],
        credentials: &PushCredentials,
    ) -> Result<PushAck, AppError>;
}

/// Replaces the `derpMap` section of a tailnet policy file
pub struct TailscalePusher {
    client: Client,
    base_url: String,
}

impl TailscalePusher {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    fn acl_url(&self, tailnet: &str) -> String {
        format!("{}/api/v2/tailnet/{}/acl", self.base_url, tailnet)
    }

    async fn fetch_policy(
        &self,
        credentials: &PushCredentials,
    ) -> Result<(Value, Option<String>), AppError> {
        let response = self
            .client
            .get(self.acl_url(&credentials.tailnet))
            .basic_auth(&credentials.api_key, None::<&str>)
            .header(header::ACCEPT, "application/json")
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(AppError::PushError(format!(
                "fetching tailnet policy returned HTTP {}",
                response.status()
            )));
        }

        let etag = response
            .headers()
            .get(header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        Ok((response.json().await?, etag))
    }
}

#[async_trait]
impl ConfigPusher for TailscalePusher {
    async fn push(
        &self,
        regions: &[RankedRegion],
        credentials: &PushCredentials,
    ) -> Result<PushAck, AppError> {
        let (mut policy, etag) = self.fetch_policy(credentials).await?;
        let Some(fields) = policy.as_object_mut() else {
            return Err(AppError::PushError(
                "tailnet policy is not a JSON object".to_string(),
            ));
        };
        fields.insert(
            "derpMap".to_string(),
            serde_json::to_value(DerpMap::from_ranked(regions))?,
        );

        let mut request = self
            .client
            .post(self.acl_url(&credentials.tailnet))
            .basic_auth(&credentials.api_key, None::<&str>)
            .json(&policy);
        // Reject the update if someone else changed the policy in between
        if let Some(etag) = etag {
            request = request.header(header::IF_MATCH, etag);
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(AppError::PushError(format!(
                "updating tailnet policy returned HTTP {}: {}",
                status, body
            )));
        }

        Ok(serde_json::from_str(&body).unwrap_or(Value::String(body)))
    }
}

/// A configured pusher together with the account it pushes to
pub struct PushTarget {
    pub pusher: Arc<dyn ConfigPusher>,
    pub credentials: PushCredentials,
}

impl PushTarget {
    pub async fn push_now(
        &self,
        registry: &RegistryStore,
        config: &LiveConfig,
    ) -> Result<PushAck, AppError> {
        push_top_regions(registry, config, self.pusher.as_ref(), &self.credentials).await
    }
}

/// Rank the current registry and push the best `pushTopK` regions
pub async fn push_top_regions(
    registry: &RegistryStore,
    config: &LiveConfig,
    pusher: &dyn ConfigPusher,
    credentials: &PushCredentials,
) -> Result<PushAck, AppError> {
    let runtime = config.current();
    let ranked = top_k(
        &registry.snapshot(),
        runtime.schedule.push_top_k,
        &runtime.policy,
    );
    if ranked.is_empty() {
        return Err(AppError::PushError(
            "no eligible regions to push".to_string(),
        ));
    }

    let ack = pusher.push(&ranked, credentials).await?;
    tracing::info!(
        "Pushed {} regions to tailnet {}",
        ranked.len(),
        credentials.tailnet
    );
    Ok(ack)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::RuntimeConfig,
        models::{DiscoveryRecord, NodeId},
        probe::ProbeMeasurement,
    };
    use axum::{
        extract::State,
        http::{HeaderMap, StatusCode},
        routing::get,
        Json, Router,
    };
    use parking_lot::Mutex;
    use serde_json::json;
    use std::time::Duration;

    fn credentials() -> PushCredentials {
        PushCredentials {
            tailnet: "example.com".into(),
            api_key: "tskey-api-test".into(),
        }
    }

    #[derive(Default)]
    struct RecordingPusher {
        pushed: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl ConfigPusher for RecordingPusher {
        async fn push(
            &self,
            regions: &[RankedRegion],
            _credentials: &PushCredentials,
        ) -> Result<PushAck, AppError> {
            self.pushed
                .lock()
                .push(regions.iter().map(|r| r.region_id.clone()).collect());
            Ok(json!({ "ok": true }))
        }
    }

    fn live_config(k: usize) -> LiveConfig {
        let mut runtime = RuntimeConfig::default();
        runtime.schedule.push_top_k = k;
        LiveConfig::new(runtime).unwrap()
    }

    fn mark_alive(registry: &RegistryStore, host: &str, ms: u64) {
        registry.merge(&DiscoveryRecord::new(host)).unwrap();
        registry.apply_probe_result(
            &NodeId::new(host, 443),
            &Ok(ProbeMeasurement {
                latency: Duration::from_millis(ms),
                bandwidth: None,
            }),
        );
    }

    #[tokio::test]
    async fn test_push_top_regions_sends_best_k() {
        let registry = RegistryStore::new();
        mark_alive(&registry, "1.1.1.1", 50);
        mark_alive(&registry, "8.8.8.8", 30);
        mark_alive(&registry, "9.9.9.9", 70);
        let pusher = RecordingPusher::default();

        let ack = push_top_regions(&registry, &live_config(2), &pusher, &credentials())
            .await
            .unwrap();

        assert_eq!(ack, json!({ "ok": true }));
        assert_eq!(*pusher.pushed.lock(), vec![vec!["8.8.8.8", "1.1.1.1"]]);
    }

    #[tokio::test]
    async fn test_empty_ranking_is_not_pushed() {
        let registry = RegistryStore::new();
        registry.merge(&DiscoveryRecord::new("1.1.1.1")).unwrap();
        let pusher = RecordingPusher::default();

        let result = push_top_regions(&registry, &live_config(20), &pusher, &credentials()).await;
        assert!(matches!(result, Err(AppError::PushError(_))));
        assert!(pusher.pushed.lock().is_empty());
    }

    type Posted = Arc<Mutex<Option<(HeaderMap, Value)>>>;

    #[tokio::test]
    async fn test_tailscale_pusher_replaces_derp_map() {
        async fn get_acl() -> (StatusCode, [(&'static str, &'static str); 1], Json<Value>) {
            (
                StatusCode::OK,
                [("etag", "\"abc123\"")],
                Json(json!({
                    "acls": [{ "action": "accept", "src": ["*"], "dst": ["*:*"] }],
                    "derpMap": { "Regions": { "1": {} } }
                })),
            )
        }

        async fn post_acl(
            State(posted): State<Posted>,
            headers: HeaderMap,
            Json(body): Json<Value>,
        ) -> Json<Value> {
            *posted.lock() = Some((headers, body.clone()));
            Json(body)
        }

        let posted: Posted = Arc::new(Mutex::new(None));
        let router = Router::new()
            .route("/api/v2/tailnet/example.com/acl", get(get_acl).post(post_acl))
            .with_state(posted.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });

        let registry = RegistryStore::new();
        mark_alive(&registry, "8.8.8.8", 30);
        let ranked = top_k(&registry.snapshot(), 5, &Default::default());

        let pusher = TailscalePusher::new(Client::new(), format!("http://{}", addr));
        let ack = pusher.push(&ranked, &credentials()).await.unwrap();
        assert_eq!(ack["derpMap"]["Regions"]["900"]["Nodes"][0]["HostName"], "8.8.8.8");

        let (headers, body) = posted.lock().clone().unwrap();
        assert_eq!(headers["if-match"], "\"abc123\"");
        assert!(headers["authorization"].to_str().unwrap().starts_with("Basic "));
        assert_eq!(body["acls"][0]["action"], "accept");
        assert!(body["derpMap"]["Regions"].get("1").is_none());
    }

    #[tokio::test]
    async fn test_tailscale_pusher_reports_http_errors() {
        let router = Router::new().route(
            "/api/v2/tailnet/example.com/acl",
            get(|| async { StatusCode::UNAUTHORIZED }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });

        let pusher = TailscalePusher::new(Client::new(), format!("http://{}", addr));
        let result = pusher.push(&[], &credentials()).await;
        assert!(matches!(result, Err(AppError::PushError(_))));
    }
}
