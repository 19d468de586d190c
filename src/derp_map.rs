//! Tailscale-compatible DERP map rendering.

use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, net::IpAddr};

use crate::{
    models::{Node, Registry},
    ranking::RankedRegion,
};

/// First region ID handed out; lower IDs belong to Tailscale's own relays
pub const FIRST_REGION_ID: u32 = 900;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DerpMap {
    pub regions: BTreeMap<u32, DerpRegion>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DerpRegion {
    #[serde(rename = "RegionID")]
    pub region_id: u32,
    pub region_code: String,
    pub region_name: String,
    pub nodes: Vec<DerpNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DerpNode {
    pub name: String,
    #[serde(rename = "RegionID")]
    pub region_id: u32,
    pub host_name: String,
    #[serde(rename = "IPv4", default, skip_serializing_if = "Option::is_none")]
    pub ipv4: Option<String>,
    #[serde(rename = "IPv6", default, skip_serializing_if = "Option::is_none")]
    pub ipv6: Option<String>,
    #[serde(rename = "DERPPort")]
    pub derp_port: u16,
}

fn node_name(region_id: u32, idx: usize) -> String {
    match u8::try_from(idx).ok().filter(|i| *i < 26) {
        Some(i) => format!("{}{}", region_id, (b'a' + i) as char),
        None => format!("{}-{}", region_id, idx),
    }
}

fn derp_node(node: &Node, region_id: u32, idx: usize) -> DerpNode {
    let host = node.host().trim_start_matches('[').trim_end_matches(']');
    // Prefer the literal host, fall back to the address the feed reported
    let ip = host
        .parse::<IpAddr>()
        .ok()
        .or_else(|| node.metadata.ip.as_deref().and_then(|ip| ip.parse().ok()));

    DerpNode {
        name: node_name(region_id, idx),
        region_id,
        host_name: host.to_string(),
        ipv4: ip.filter(IpAddr::is_ipv4).map(|ip| ip.to_string()),
        ipv6: ip.filter(IpAddr::is_ipv6).map(|ip| ip.to_string()),
        derp_port: node.port(),
    }
}

impl DerpMap {
    fn push_region<'a>(&mut self, name: &str, nodes: impl Iterator<Item = &'a Node>) {
        let region_id = FIRST_REGION_ID + self.regions.len() as u32;
        let nodes: Vec<DerpNode> = nodes
            .enumerate()
            .map(|(idx, node)| derp_node(node, region_id, idx))
            .collect();
        if nodes.is_empty() {
            return;
        }
        self.regions.insert(
            region_id,
            DerpRegion {
                region_id,
                region_code: format!("r{}", region_id),
                region_name: name.to_string(),
                nodes,
            },
        );
    }

    /// Every region of a registry subset, in region-id order
    pub fn from_registry(registry: &Registry) -> Self {
        let mut map = DerpMap::default();
        for region in registry.regions.values() {
            map.push_region(&region.name, region.nodes.values());
        }
        map
    }

    /// Ranked regions in rank order, each region's nodes best first
    pub fn from_ranked(ranked: &[RankedRegion]) -> Self {
        let mut map = DerpMap::default();
        for region in ranked {
            map.push_region(&region.region_name, region.nodes.iter());
        }
        map
    }

    pub fn node_count(&self) -> usize {
        self.regions.values().map(|r| r.nodes.len()).sum()
    }
}
