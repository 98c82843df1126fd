// GreenFlow: joint flow routing and link sleeping for hybrid SDN networks
// Copyright (C) 2023 Tibor Schneider <sctibor@ethz.ch>
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

//! Loaders for the static network description and the flow table.
//!
//! The graph is a JSON file listing node ids (as strings), the subset of SDN-controlled nodes,
//! and the links with their capacity in Gbps (converted to Mbps internally) and an optional
//! per-link power cost (defaulting to 10% of the capacity). A link is SDN-controlled iff both of
//! its endpoints are. The flow table is a CSV with a header line and
//! `flow_id,s,d,demand_mbps` rows; a missing flow file falls back to a built-in demo set so the
//! controller stays usable on a bare topology.

use std::collections::BTreeSet;
use std::path::Path;

use log::{info, warn};
use serde::Deserialize;

use crate::types::{ConfigError, EdgeKey, Flow, GraphCaps, NodeId};

/// The static network description, as loaded from the graph file.
#[derive(Debug, Clone, PartialEq)]
pub struct StaticGraph {
    /// All node ids.
    pub nodes: Vec<NodeId>,
    /// Nodes whose links are SDN-controlled.
    pub sdn_nodes: BTreeSet<NodeId>,
    /// Per-edge capacity, SDN membership, and power cost.
    pub caps: GraphCaps,
}

/// Raw JSON shape of the graph file.
#[derive(Debug, Deserialize)]
struct RawGraph {
    /// Node ids, as strings.
    nodes: Vec<String>,
    /// SDN node ids, as strings.
    sdn_nodes: Vec<String>,
    /// Link list.
    links: Vec<RawLink>,
}

/// Raw JSON shape of one link.
#[derive(Debug, Deserialize)]
struct RawLink {
    /// One endpoint, as a string node id.
    u: String,
    /// The other endpoint.
    v: String,
    /// Capacity in Gbps.
    cap: f64,
    /// Optional power cost; defaults to 10% of the capacity in Mbps.
    #[serde(default)]
    power: Option<f64>,
}

/// Parse a string node id.
fn node_id(s: &str) -> Result<NodeId, ConfigError> {
    s.trim()
        .parse()
        .map_err(|_| ConfigError::BadNodeId(s.to_string()))
}

/// Load the static graph from a JSON file. A missing or malformed file is fatal.
pub fn load_graph(path: impl AsRef<Path>) -> Result<StaticGraph, ConfigError> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let raw: RawGraph = serde_json::from_str(&raw)?;

    let nodes = raw
        .nodes
        .iter()
        .map(|s| node_id(s))
        .collect::<Result<Vec<_>, _>>()?;
    let sdn_nodes = raw
        .sdn_nodes
        .iter()
        .map(|s| node_id(s))
        .collect::<Result<BTreeSet<_>, _>>()?;

    let mut caps = GraphCaps::default();
    for link in &raw.links {
        let u = node_id(&link.u)?;
        let v = node_id(&link.v)?;
        if !nodes.contains(&u) || !nodes.contains(&v) {
            return Err(ConfigError::UnknownNode(link.u.clone(), link.v.clone()));
        }
        let key = EdgeKey::new(u, v);
        let cap_mbps = link.cap * 1000.0;
        caps.capacity_mbps.insert(key, cap_mbps);
        caps.power_cost
            .insert(key, link.power.unwrap_or(cap_mbps * 0.1));
        caps.is_sdn
            .insert(key, sdn_nodes.contains(&u) && sdn_nodes.contains(&v));
    }
    info!(
        "loaded graph: {} nodes ({} SDN), {} links",
        nodes.len(),
        sdn_nodes.len(),
        caps.capacity_mbps.len()
    );
    Ok(StaticGraph {
        nodes,
        sdn_nodes,
        caps,
    })
}

/// Demo flows installed when no flow file is present.
fn demo_flows() -> Vec<Flow> {
    [(1, 9, 200.0), (3, 7, 150.0), (4, 12, 180.0), (6, 11, 120.0), (8, 10, 160.0)]
        .into_iter()
        .enumerate()
        .map(|(i, (s, d, demand_mbps))| Flow {
            id: i as u32 + 1,
            s,
            d,
            demand_mbps,
            cand_path_ids: Vec::new(),
        })
        .collect()
}

/// Load the flow table from a CSV file (`flow_id,s,d,demand_mbps` after a header line). Rows
/// that do not parse are skipped with a warning; a missing file yields the demo flow set.
pub fn load_flows(path: impl AsRef<Path>) -> Vec<Flow> {
    let path = path.as_ref();
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(_) => {
            warn!(
                "flow file {} not found, using built-in demo flows",
                path.display()
            );
            return demo_flows();
        }
    };
    let mut flows = Vec::new();
    for (lineno, line) in raw.lines().enumerate().skip(1) {
        if line.trim().is_empty() {
            continue;
        }
        let cols: Vec<&str> = line.split(',').map(str::trim).collect();
        let parsed = (|| -> Option<Flow> {
            Some(Flow {
                id: cols.first()?.parse().ok()?,
                s: cols.get(1)?.parse().ok()?,
                d: cols.get(2)?.parse().ok()?,
                demand_mbps: cols.get(3)?.parse().ok()?,
                cand_path_ids: Vec::new(),
            })
        })();
        match parsed {
            Some(flow) => flows.push(flow),
            None => warn!("skipping malformed flow row {}: {:?}", lineno + 1, line),
        }
    }
    info!("loaded {} flows from {}", flows.len(), path.display());
    flows
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    /// Write a temp file and return its path.
    fn temp_file(name: &str, content: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("greenflow-test-{name}"));
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn graph_loads_with_sdn_membership_and_defaults() {
        let path = temp_file(
            "graph.json",
            r#"{
                "nodes": ["1", "2", "3"],
                "sdn_nodes": ["1", "2"],
                "links": [
                    {"u": "1", "v": "2", "cap": 1.0},
                    {"u": "2", "v": "3", "cap": 0.1, "power": 42.0}
                ]
            }"#,
        );
        let g = load_graph(&path).unwrap();
        assert_eq!(g.nodes, vec![1, 2, 3]);
        let e12 = EdgeKey::new(1, 2);
        let e23 = EdgeKey::new(2, 3);
        assert_eq!(g.caps.cap(&e12), 1000.0);
        assert_eq!(g.caps.power(&e12), 100.0);
        assert!(g.caps.sdn(&e12));
        // node 3 is legacy, so the 2-3 link is legacy even though 2 is SDN
        assert!(!g.caps.sdn(&e23));
        assert_eq!(g.caps.power(&e23), 42.0);
    }

    #[test]
    fn graph_rejects_unknown_nodes() {
        let path = temp_file(
            "badgraph.json",
            r#"{"nodes": ["1"], "sdn_nodes": [], "links": [{"u": "1", "v": "9", "cap": 1.0}]}"#,
        );
        assert!(matches!(
            load_graph(&path),
            Err(ConfigError::UnknownNode(_, _))
        ));
    }

    #[test]
    fn missing_graph_is_fatal() {
        assert!(matches!(
            load_graph("/nonexistent/graph.json"),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn flows_parse_and_skip_bad_rows() {
        let path = temp_file(
            "flows.csv",
            "flow_id,s,d,demand_mbps\n1,1,9,200\nnot,a,row\n2,3,7,150.5\n",
        );
        let flows = load_flows(&path);
        assert_eq!(flows.len(), 2);
        assert_eq!(flows[0].id, 1);
        assert_eq!(flows[1].demand_mbps, 150.5);
    }

    #[test]
    fn missing_flow_file_yields_demo_set() {
        let flows = load_flows("/nonexistent/flows.csv");
        assert_eq!(flows.len(), 5);
        assert_eq!(flows[0].s, 1);
        assert_eq!(flows[0].d, 9);
    }
}
