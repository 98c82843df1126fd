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

//! Candidate-path enumeration: up to K simple paths per `(s, d)` pair over the live graph,
//! discovered breadth-first (shortest candidates first) with a hop-count cap.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use petgraph::prelude::UnGraphMap;

use crate::topology::TopoEdge;
use crate::types::{CandidatePath, EdgeKey, Flow, NodeId, PathId};

/// Paths longer than this many nodes are not considered.
const MAX_PATH_NODES: usize = 10;

/// First path id handed out each cycle.
const FIRST_PATH_ID: PathId = 100;

/// Enumerate up to `k` simple paths for every `(s, d)` pair required by `flows`, and populate
/// each flow's candidate list with the ids of the paths matching its pair. Paths are assigned
/// fresh ids valid for this cycle only.
pub fn build_candidate_paths(
    edges: &[TopoEdge],
    flows: &mut [Flow],
    k: usize,
) -> Vec<CandidatePath> {
    let mut graph: UnGraphMap<NodeId, ()> = UnGraphMap::new();
    for e in edges {
        graph.add_edge(e.key.u, e.key.v, ());
    }

    let pairs: BTreeSet<(NodeId, NodeId)> = flows
        .iter()
        .filter(|f| f.s != f.d)
        .map(|f| (f.s.min(f.d), f.s.max(f.d)))
        .collect();

    let mut paths = Vec::new();
    let mut by_pair: BTreeMap<(NodeId, NodeId), Vec<PathId>> = BTreeMap::new();
    let mut next_pid = FIRST_PATH_ID;
    for &(s, d) in &pairs {
        let ids = by_pair.entry((s, d)).or_default();
        for seq in k_simple_paths(&graph, s, d, k) {
            let path_edges = seq
                .windows(2)
                .map(|w| EdgeKey::new(w[0], w[1]))
                .collect();
            paths.push(CandidatePath {
                id: next_pid,
                edges: path_edges,
            });
            ids.push(next_pid);
            next_pid += 1;
        }
    }

    for flow in flows.iter_mut() {
        let pair = (flow.s.min(flow.d), flow.s.max(flow.d));
        flow.cand_path_ids = by_pair.get(&pair).cloned().unwrap_or_default();
    }
    paths
}

/// Breadth-first enumeration of up to `k` simple node sequences from `s` to `d`, pruning any
/// prefix longer than [`MAX_PATH_NODES`] and never revisiting a node already on the prefix.
fn k_simple_paths(
    graph: &UnGraphMap<NodeId, ()>,
    s: NodeId,
    d: NodeId,
    k: usize,
) -> Vec<Vec<NodeId>> {
    let mut found = Vec::new();
    if k == 0 || !graph.contains_node(s) || !graph.contains_node(d) {
        return found;
    }
    let mut queue: VecDeque<Vec<NodeId>> = VecDeque::new();
    queue.push_back(vec![s]);
    while let Some(prefix) = queue.pop_front() {
        if found.len() >= k {
            break;
        }
        if prefix.len() > MAX_PATH_NODES {
            continue;
        }
        let last = *prefix.last().expect("prefix is never empty");
        if last == d {
            found.push(prefix);
            continue;
        }
        for next in graph.neighbors(last) {
            if prefix.contains(&next) {
                continue;
            }
            let mut extended = prefix.clone();
            extended.push(next);
            queue.push_back(extended);
        }
    }
    found
}
