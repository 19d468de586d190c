//! Pure query functions over a registry snapshot: predicate filtering and top-K ranking.

use serde::{Deserialize, Serialize};
use std::{cmp::Ordering, str::FromStr, time::Duration};

use crate::{
    config::Policy,
    error::AppError,
    models::{Node, NodeStatus, Region, Registry},
    utils::parse_bandwidth,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusFilter {
    #[default]
    Alive,
    Error,
    All,
}

impl FromStr for StatusFilter {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "alive" => Ok(StatusFilter::Alive),
            "error" => Ok(StatusFilter::Error),
            "all" => Ok(StatusFilter::All),
            other => Err(AppError::ValidationError(format!(
                "status must be one of alive, error, all (got {:?})",
                other
            ))),
        }
    }
}

/// Validated node predicate
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeFilter {
    pub status: StatusFilter,
    pub latency_limit: Option<Duration>,
    /// Minimum bits per second
    pub bandwidth_limit: Option<u64>,
}

impl NodeFilter {
    pub fn matches(&self, node: &Node) -> bool {
        let status_ok = match self.status {
            StatusFilter::Alive => node.status == NodeStatus::Alive,
            StatusFilter::Error => node.status == NodeStatus::Error,
            StatusFilter::All => true,
        };
        if !status_ok {
            return false;
        }

        if let Some(limit) = self.latency_limit {
            match node.latency {
                Some(latency) if latency <= limit => {}
                _ => return false,
            }
        }

        if let Some(limit) = self.bandwidth_limit {
            match node.bandwidth {
                Some(bandwidth) if bandwidth >= limit => {}
                _ => return false,
            }
        }

        true
    }
}

/// Raw filter parameters as they arrive on the query string
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FilterQuery {
    pub status: Option<String>,
    #[serde(rename = "latency-limit")]
    pub latency_limit: Option<String>,
    #[serde(rename = "bandwidth-limit")]
    pub bandwidth_limit: Option<String>,
}

impl FilterQuery {
    pub fn parse(&self) -> Result<NodeFilter, AppError> {
        let status = match non_empty(&self.status) {
            Some(s) => s.parse()?,
            None => StatusFilter::default(),
        };

        let latency_limit = non_empty(&self.latency_limit)
            .map(|s| {
                humantime::parse_duration(s).map_err(|e| {
                    AppError::ValidationError(format!("invalid latency-limit {:?}: {}", s, e))
                })
            })
            .transpose()?;

        let bandwidth_limit = non_empty(&self.bandwidth_limit)
            .map(parse_bandwidth)
            .transpose()?;

        Ok(NodeFilter {
            status,
            latency_limit,
            bandwidth_limit,
        })
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

/// Registry subset holding only matching nodes; regions left empty are dropped
pub fn filter(snapshot: &Registry, predicate: &NodeFilter) -> Registry {
    let regions = snapshot
        .regions
        .iter()
        .filter_map(|(id, region)| {
            let nodes: std::collections::BTreeMap<_, _> = region
                .nodes
                .iter()
                .filter(|(_, node)| predicate.matches(node))
                .map(|(nid, node)| (nid.clone(), node.clone()))
                .collect();
            if nodes.is_empty() {
                None
            } else {
                Some((
                    id.clone(),
                    Region {
                        id: region.id.clone(),
                        name: region.name.clone(),
                        nodes,
                    },
                ))
            }
        })
        .collect();

    Registry { regions }
}

/// A region's position in the ranking
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedRegion {
    pub region_id: String,
    pub region_name: String,
    /// Weighted cost of the best node, lower is better
    pub score: f64,
    #[serde(with = "humantime_serde")]
    pub best_latency: Option<Duration>,
    pub best_bandwidth: Option<u64>,
    /// Eligible nodes, best first
    pub nodes: Vec<Node>,
}

/// Whether a node may take part in the ranking at all
pub fn is_eligible(node: &Node, policy: &Policy) -> bool {
    node.status == NodeStatus::Alive
        && node.latency.is_some()
        && node.consecutive_failures < policy.failure_threshold
}

/// Weighted cost of a node: latency in ms against bandwidth in Mbps
pub fn node_cost(node: &Node, policy: &Policy) -> f64 {
    let weights = policy.rank_weights;
    let latency_ms = node.latency.map(|l| l.as_secs_f64() * 1000.0).unwrap_or(f64::MAX);
    let bandwidth_mbps = node.bandwidth.unwrap_or(0) as f64 / 1_000_000.0;
    weights.latency * latency_ms - weights.bandwidth * bandwidth_mbps
}

fn compare_nodes(a: &Node, b: &Node, policy: &Policy) -> Ordering {
    node_cost(a, policy)
        .total_cmp(&node_cost(b, policy))
        .then_with(|| b.bandwidth.unwrap_or(0).cmp(&a.bandwidth.unwrap_or(0)))
        .then_with(|| a.id.cmp(&b.id))
}

fn rank_region(region: &Region, policy: &Policy) -> Option<RankedRegion> {
    let mut nodes: Vec<Node> = region
        .nodes
        .values()
        .filter(|node| is_eligible(node, policy))
        .cloned()
        .collect();
    if nodes.is_empty() {
        return None;
    }
    nodes.sort_by(|a, b| compare_nodes(a, b, policy));

    let best = &nodes[0];
    Some(RankedRegion {
        region_id: region.id.clone(),
        region_name: region.name.clone(),
        score: node_cost(best, policy),
        best_latency: best.latency,
        best_bandwidth: best.bandwidth,
        nodes,
    })
}

/// The `k` best regions by their best eligible node.
///
/// Order: weighted cost ascending, then best-node bandwidth descending, then region id.
/// Regions without an eligible node are left out; fewer than `k` results is not an error.
pub fn top_k(snapshot: &Registry, k: usize, policy: &Policy) -> Vec<RankedRegion> {
    if k == 0 {
        return Vec::new();
    }

    let mut ranked: Vec<RankedRegion> = snapshot
        .regions
        .values()
        .filter_map(|region| rank_region(region, policy))
        .collect();

    ranked.sort_by(|a, b| {
        a.score
            .total_cmp(&b.score)
            .then_with(|| {
                b.best_bandwidth
                    .unwrap_or(0)
                    .cmp(&a.best_bandwidth.unwrap_or(0))
            })
            .then_with(|| a.region_id.cmp(&b.region_id))
    });
    ranked.truncate(k);
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RankWeights;
    use crate::models::{NodeId, RecordMetadata};
    use crate::utils::parse_endpoint;
    use chrono::Utc;

    fn node(address: &str, status: NodeStatus, latency_ms: Option<u64>, bw: Option<u64>) -> Node {
        let ep = parse_endpoint(address, None).unwrap();
        let mut node = Node::new(&ep, RecordMetadata::default(), Utc::now());
        node.status = status;
        node.latency = latency_ms.map(Duration::from_millis);
        node.bandwidth = bw;
        node
    }

    fn registry(nodes: Vec<Node>) -> Registry {
        let mut registry = Registry::default();
        for n in nodes {
            registry
                .regions
                .entry(n.region_id.clone())
                .or_insert_with(|| Region::new(n.region_id.clone(), n.region_name.clone()))
                .nodes
                .insert(n.id.clone(), n);
        }
        registry
    }

    fn sample() -> Registry {
        registry(vec![
            node("1.0.0.1", NodeStatus::Alive, Some(50), Some(10)),
            node("2.0.0.1", NodeStatus::Alive, Some(30), Some(5)),
            node("3.0.0.1", NodeStatus::Error, None, None),
            node("4.0.0.1", NodeStatus::Unknown, None, None),
            node("5.0.0.1", NodeStatus::Alive, Some(900), Some(3_000_000)),
        ])
    }

    #[test]
    fn test_filter_alive_only_returns_alive() {
        let result = filter(&sample(), &NodeFilter::default());
        assert_eq!(result.node_count(), 3);
        assert!(result.nodes().all(|n| n.status == NodeStatus::Alive));
    }

    #[test]
    fn test_filter_error_excludes_unknown() {
        let f = NodeFilter {
            status: StatusFilter::Error,
            ..Default::default()
        };
        let result = filter(&sample(), &f);
        assert_eq!(result.node_count(), 1);
        assert!(result.regions.contains_key("3.0.0.1"));
    }

    #[test]
    fn test_filter_all_includes_unknown_and_drops_empty_regions() {
        let f = NodeFilter {
            status: StatusFilter::All,
            ..Default::default()
        };
        assert_eq!(filter(&sample(), &f).node_count(), 5);

        let f = NodeFilter {
            status: StatusFilter::All,
            latency_limit: Some(Duration::from_millis(100)),
            bandwidth_limit: None,
        };
        let result = filter(&sample(), &f);
        assert_eq!(result.node_count(), 2);
        assert_eq!(result.region_count(), 2);
        assert!(!result.regions.contains_key("4.0.0.1"));
    }

    #[test]
    fn test_filter_bandwidth_limit() {
        let f = NodeFilter {
            status: StatusFilter::All,
            latency_limit: None,
            bandwidth_limit: Some(1_000_000),
        };
        let result = filter(&sample(), &f);
        assert_eq!(result.node_count(), 1);
        assert!(result.regions.contains_key("5.0.0.1"));
    }

    #[test]
    fn test_filter_query_parsing() {
        let q = FilterQuery {
            status: Some("ERROR".into()),
            latency_limit: Some("500ms".into()),
            bandwidth_limit: Some("2Mbps".into()),
        };
        let f = q.parse().unwrap();
        assert_eq!(f.status, StatusFilter::Error);
        assert_eq!(f.latency_limit, Some(Duration::from_millis(500)));
        assert_eq!(f.bandwidth_limit, Some(2_000_000));

        assert_eq!(FilterQuery::default().parse().unwrap(), NodeFilter::default());

        let bad = FilterQuery {
            status: Some("dead".into()),
            ..Default::default()
        };
        assert!(matches!(bad.parse(), Err(AppError::ValidationError(_))));

        let bad = FilterQuery {
            latency_limit: Some("soon".into()),
            ..Default::default()
        };
        assert!(matches!(bad.parse(), Err(AppError::ValidationError(_))));
    }

    #[test]
    fn test_top_one_prefers_lower_latency() {
        let snap = registry(vec![
            node("1.0.0.1", NodeStatus::Alive, Some(50), Some(10)),
            node("2.0.0.1", NodeStatus::Alive, Some(30), Some(5)),
        ]);
        let ranked = top_k(&snap, 1, &Policy::default());
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].region_id, "2.0.0.1");
    }

    #[test]
    fn test_ties_broken_by_bandwidth_then_region_id() {
        let snap = registry(vec![
            node("9.0.0.1", NodeStatus::Alive, Some(20), Some(5)),
            node("8.0.0.1", NodeStatus::Alive, Some(20), Some(50)),
            node("7.0.0.1", NodeStatus::Alive, Some(20), Some(5)),
        ]);
        let ids: Vec<_> = top_k(&snap, 10, &Policy::default())
            .into_iter()
            .map(|r| r.region_id)
            .collect();
        assert_eq!(ids, vec!["8.0.0.1", "7.0.0.1", "9.0.0.1"]);
    }

    #[test]
    fn test_ineligible_regions_are_excluded_not_padded() {
        let ranked = top_k(&sample(), 10, &Policy::default());
        assert_eq!(ranked.len(), 3);
        let ids: Vec<_> = ranked.iter().map(|r| r.region_id.as_str()).collect();
        assert_eq!(ids, vec!["2.0.0.1", "1.0.0.1", "5.0.0.1"]);
        assert!(top_k(&sample(), 0, &Policy::default()).is_empty());
    }

    #[test]
    fn test_failure_threshold_excludes_from_ranking() {
        let mut flaky = node("2.0.0.1", NodeStatus::Alive, Some(30), Some(5));
        flaky.consecutive_failures = 3;
        let snap = registry(vec![flaky, node("1.0.0.1", NodeStatus::Alive, Some(50), Some(10))]);

        let ranked = top_k(&snap, 5, &Policy::default());
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].region_id, "1.0.0.1");
    }

    #[test]
    fn test_best_node_represents_region() {
        let snap = registry(vec![
            node("6.0.0.1:443", NodeStatus::Alive, Some(80), Some(1)),
            node("6.0.0.1:8443", NodeStatus::Alive, Some(15), Some(1)),
            node("6.0.0.1:9443", NodeStatus::Error, None, None),
            node("1.0.0.1", NodeStatus::Alive, Some(20), Some(1)),
        ]);
        let ranked = top_k(&snap, 2, &Policy::default());
        assert_eq!(ranked[0].region_id, "6.0.0.1");
        assert_eq!(ranked[0].best_latency, Some(Duration::from_millis(15)));
        assert_eq!(ranked[0].nodes.len(), 2);
        assert_eq!(ranked[0].nodes[0].id, NodeId::new("6.0.0.1", 8443));
    }

    #[test]
    fn test_bandwidth_weight_changes_order() {
        let snap = registry(vec![
            node("1.0.0.1", NodeStatus::Alive, Some(40), Some(100_000_000)),
            node("2.0.0.1", NodeStatus::Alive, Some(30), Some(1_000_000)),
        ]);
        let policy = Policy {
            rank_weights: RankWeights {
                latency: 1.0,
                bandwidth: 1.0,
            },
            ..Policy::default()
        };
        // 40 - 100 = -60 beats 30 - 1 = 29
        let ranked = top_k(&snap, 2, &policy);
        assert_eq!(ranked[0].region_id, "1.0.0.1");
        assert!((ranked[0].score + 60.0).abs() < 1e-9);
    }
}
