use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::{
    config::FeedSettings,
    error::AppError,
    models::{DiscoveryRecord, RecordMetadata},
};

/// Fields requested from the search API, in row order
pub const FOFA_FIELDS: &str = "host,ip,port,protocol,country_name,city,as_organization";

/// One discovery pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedQuery {
    pub query: String,
    pub batch_size: usize,
    /// 0 means no limit
    pub max_results: usize,
}

impl From<&FeedSettings> for FeedQuery {
    fn from(settings: &FeedSettings) -> Self {
        Self {
            query: settings.query.clone(),
            batch_size: settings.batch_size,
            max_results: settings.max_results,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedMessage {
    Batch(Vec<DiscoveryRecord>),
    /// The feed has nothing more to deliver for this query
    Done,
}

/// Source of raw candidate relay endpoints
#[async_trait]
pub trait DiscoveryFeed: Send + Sync {
    async fn query(&self, query: &FeedQuery) -> Result<mpsc::Receiver<FeedMessage>, AppError>;
}

#[derive(Debug, Deserialize)]
struct FofaResponse {
    #[serde(default)]
    error: bool,
    #[serde(default)]
    errmsg: Option<String>,
    /// Total number of matches for the query
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    results: Vec<Vec<Value>>,
}

fn field(row: &[Value], idx: usize) -> Option<String> {
    let value = match row.get(idx)? {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!value.is_empty()).then_some(value)
}

fn has_explicit_port(host: &str) -> bool {
    let authority = host.split_once("://").map_or(host, |(_, rest)| rest);
    let authority = authority.split('/').next().unwrap_or(authority);
    if authority.starts_with('[') {
        authority.contains("]:")
    } else {
        authority.contains(':')
    }
}

/// Turn result rows (ordered as [`FOFA_FIELDS`]) into discovery records.
/// Rows without a host are dropped.
pub fn parse_fofa_rows(rows: &[Vec<Value>]) -> Vec<DiscoveryRecord> {
    rows.iter()
        .filter_map(|row| {
            let host = field(row, 0)?;
            let port = field(row, 2);
            let address = match port {
                Some(port) if !has_explicit_port(&host) && !host.contains("://") => {
                    format!("{}:{}", host, port)
                }
                _ => host,
            };

            Some(DiscoveryRecord {
                address,
                metadata: RecordMetadata {
                    ip: field(row, 1),
                    protocol: field(row, 3),
                    country: field(row, 4),
                    city: field(row, 5),
                    organization: field(row, 6),
                },
            })
        })
        .collect()
}

/// Client for the FOFA search API
#[derive(Clone)]
pub struct FofaClient {
    client: Client,
    settings: FeedSettings,
}

impl FofaClient {
    pub fn new(client: Client, settings: FeedSettings) -> Self {
        Self { client, settings }
    }

    async fn fetch_page(
        &self,
        query: &FeedQuery,
        page: usize,
    ) -> Result<(Vec<DiscoveryRecord>, Option<u64>), AppError> {
        let url = format!("{}/api/v1/search/all", self.settings.base_url);
        let encoded = STANDARD.encode(query.query.as_bytes());
        let page_param = page.to_string();
        let size_param = query.batch_size.to_string();

        let response = self
            .client
            .get(&url)
            .query(&[
                ("email", self.settings.credentials.email.as_str()),
                ("key", self.settings.credentials.key.as_str()),
                ("qbase64", encoded.as_str()),
                ("fields", FOFA_FIELDS),
                ("page", page_param.as_str()),
                ("size", size_param.as_str()),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(AppError::FeedError(format!(
                "FOFA returned HTTP {}",
                response.status()
            )));
        }

        let body: FofaResponse = response.json().await?;
        if body.error {
            return Err(AppError::FeedError(
                body.errmsg.unwrap_or_else(|| "unknown FOFA error".to_string()),
            ));
        }

        Ok((parse_fofa_rows(&body.results), body.size))
    }

    async fn run_query(&self, query: FeedQuery, tx: mpsc::Sender<FeedMessage>) {
        let mut delivered = 0usize;
        let mut page = 1usize;

        loop {
            let (mut records, total) = match self.fetch_page(&query, page).await {
                Ok(result) => result,
                Err(e) => {
                    tracing::error!("FOFA query failed on page {}: {}", page, e);
                    break;
                }
            };

            if records.is_empty() {
                break;
            }
            if query.max_results > 0 {
                records.truncate(query.max_results - delivered);
            }
            delivered += records.len();
            tracing::debug!("FOFA page {} delivered {} records", page, records.len());

            if tx.send(FeedMessage::Batch(records)).await.is_err() {
                tracing::warn!("Discovery consumer went away, stopping FOFA query");
                return;
            }

            let reached_total = total.is_some_and(|t| delivered as u64 >= t);
            let reached_limit = query.max_results > 0 && delivered >= query.max_results;
            if reached_total || reached_limit {
                break;
            }
            page += 1;
        }

        tracing::info!("FOFA query finished with {} records", delivered);
        let _ = tx.send(FeedMessage::Done).await;
    }
}

#[async_trait]
impl DiscoveryFeed for FofaClient {
    async fn query(&self, query: &FeedQuery) -> Result<mpsc::Receiver<FeedMessage>, AppError> {
        if query.batch_size == 0 {
            return Err(AppError::ValidationError(
                "feed batch size must be at least 1".to_string(),
            ));
        }

        let (tx, rx) = mpsc::channel(4);
        let client = self.clone();
        let query = query.clone();
        tokio::spawn(async move {
            client.run_query(query, tx).await;
        });
        Ok(rx)
    }
}
