use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, time::Duration};

use crate::utils::Endpoint;

/// Stable node identity, the lowercased `host:port` of the relay
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(host: &str, port: u16) -> Self {
        NodeId(format!("{}:{}", host.to_ascii_lowercase(), port))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    #[default]
    Unknown,
    Alive,
    Error,
}

/// Descriptive data carried by a discovery record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,
}

impl RecordMetadata {
    pub fn has_location(&self) -> bool {
        [&self.city, &self.country]
            .into_iter()
            .any(|field| field.as_deref().map_or(false, |s| !s.trim().is_empty()))
    }
}

/// A raw candidate endpoint produced by the discovery feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryRecord {
    pub address: String,
    #[serde(default)]
    pub metadata: RecordMetadata,
}

impl DiscoveryRecord {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            metadata: RecordMetadata::default(),
        }
    }
}

/// A single candidate relay endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: NodeId,
    pub region_id: String,
    pub region_name: String,
    pub host_port: String,
    pub secure: bool,
    #[serde(default)]
    pub metadata: RecordMetadata,
    #[serde(default)]
    pub status: NodeStatus,
    /// Last measured round trip
    #[serde(default, with = "humantime_serde")]
    pub latency: Option<Duration>,
    /// Last measured throughput in bits per second
    #[serde(default)]
    pub bandwidth: Option<u64>,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub discovered_at: DateTime<Utc>,
    #[serde(default)]
    pub last_probed_at: Option<DateTime<Utc>>,
}

impl Node {
    pub fn new(endpoint: &Endpoint, metadata: RecordMetadata, now: DateTime<Utc>) -> Self {
        Self {
            id: NodeId::new(&endpoint.host, endpoint.port),
            region_id: region_id_for(endpoint),
            region_name: region_name_for(endpoint, &metadata),
            host_port: endpoint.host_port(),
            secure: endpoint.secure,
            metadata,
            status: NodeStatus::Unknown,
            latency: None,
            bandwidth: None,
            consecutive_failures: 0,
            last_error: None,
            discovered_at: now,
            last_probed_at: None,
        }
    }

    /// Host part of `host_port`, brackets kept for IPv6 literals
    pub fn host(&self) -> &str {
        match self.host_port.rfind(':') {
            Some(idx) => &self.host_port[..idx],
            None => &self.host_port,
        }
    }

    pub fn port(&self) -> u16 {
        self.host_port
            .rsplit(':')
            .next()
            .and_then(|p| p.parse().ok())
            .unwrap_or(if self.secure { 443 } else { 80 })
    }
}

/// Nodes sharing one host form a region
pub fn region_id_for(endpoint: &Endpoint) -> String {
    endpoint.host.to_ascii_lowercase()
}

pub fn region_name_for(endpoint: &Endpoint, metadata: &RecordMetadata) -> String {
    let location: Vec<&str> = [metadata.city.as_deref(), metadata.country.as_deref()]
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();

    if location.is_empty() {
        endpoint.host.clone()
    } else {
        format!("{} ({})", endpoint.host, location.join(", "))
    }
}

/// Named collection of nodes sharing a region id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Region {
    pub id: String,
    pub name: String,
    pub nodes: BTreeMap<NodeId, Node>,
}

impl Region {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            nodes: BTreeMap::new(),
        }
    }

    /// Take the name of the lowest node id that has a location, else of the lowest node id
    pub fn refresh_name(&mut self) {
        let chosen = self
            .nodes
            .values()
            .find(|n| n.metadata.has_location())
            .or_else(|| self.nodes.values().next());
        if let Some(node) = chosen {
            self.name = node.region_name.clone();
        }
    }
}

/// Region id to region mapping; every node lives in exactly one region
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Registry {
    pub regions: BTreeMap<String, Region>,
}

impl Registry {
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    pub fn node_count(&self) -> usize {
        self.regions.values().map(|r| r.nodes.len()).sum()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.regions.values().flat_map(|r| r.nodes.values())
    }

    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes().find(|n| &n.id == id)
    }
}

/// Registry size broken down by node status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub regions: usize,
    pub nodes: usize,
    pub alive: usize,
    pub error: usize,
    pub unknown: usize,
}

impl From<&Registry> for RegistryStats {
    fn from(registry: &Registry) -> Self {
        let mut stats = RegistryStats {
            regions: registry.region_count(),
            ..Default::default()
        };
        for node in registry.nodes() {
            stats.nodes += 1;
            match node.status {
                NodeStatus::Alive => stats.alive += 1,
                NodeStatus::Error => stats.error += 1,
                NodeStatus::Unknown => stats.unknown += 1,
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::parse_endpoint;

    #[test]
    fn test_node_from_endpoint() {
        let ep = parse_endpoint("https://Derp.Example.com:8443", None).unwrap();
        let metadata = RecordMetadata {
            city: Some("Frankfurt".into()),
            country: Some("Germany".into()),
            ..Default::default()
        };
        let node = Node::new(&ep, metadata, Utc::now());

        assert_eq!(node.id.as_str(), "derp.example.com:8443");
        assert_eq!(node.region_id, "derp.example.com");
        assert_eq!(node.region_name, "derp.example.com (Frankfurt, Germany)");
        assert_eq!(node.status, NodeStatus::Unknown);
        assert_eq!(node.host(), "derp.example.com");
        assert_eq!(node.port(), 8443);
    }

    #[test]
    fn test_ipv6_host_and_port() {
        let ep = parse_endpoint("[2606:4700::1111]:3340", Some("http")).unwrap();
        let node = Node::new(&ep, RecordMetadata::default(), Utc::now());
        assert_eq!(node.host(), "[2606:4700::1111]");
        assert_eq!(node.port(), 3340);
        assert_eq!(node.region_name, "[2606:4700::1111]");
    }

    #[test]
    fn test_node_json_uses_humantime_latency() {
        let ep = parse_endpoint("8.8.8.8", None).unwrap();
        let mut node = Node::new(&ep, RecordMetadata::default(), Utc::now());
        node.status = NodeStatus::Alive;
        node.latency = Some(Duration::from_millis(42));

        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(json["latency"], "42ms");
        assert_eq!(json["status"], "alive");
        assert_eq!(json["regionId"], "8.8.8.8");

        let back: Node = serde_json::from_value(json).unwrap();
        assert_eq!(back.latency, Some(Duration::from_millis(42)));
    }
}
