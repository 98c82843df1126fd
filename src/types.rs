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

//! Shared type definitions: canonical edges, graph capabilities, flows, candidate paths, and the
//! planner's output.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifier of a graph node. By default, node ids coincide with switch ids.
pub type NodeId = u32;

/// Identifier of a flow demand.
pub type FlowId = u32;

/// Identifier of a candidate path (assigned per planning cycle).
pub type PathId = u32;

/// A canonical undirected edge: the endpoint with the smaller node id is always `u`.
///
/// Every layer above the session manager (topology viewer, monitor, planner) keys link state by
/// this type, so an edge observed from either side lands on the same entry.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct EdgeKey {
    /// Smaller endpoint.
    pub u: NodeId,
    /// Larger endpoint.
    pub v: NodeId,
}

impl EdgeKey {
    /// Build a canonical edge from endpoints in any order.
    pub fn new(a: NodeId, b: NodeId) -> Self {
        if a <= b {
            EdgeKey { u: a, v: b }
        } else {
            EdgeKey { u: b, v: a }
        }
    }

    /// Whether `node` is one of the endpoints.
    pub fn touches(&self, node: NodeId) -> bool {
        self.u == node || self.v == node
    }

    /// The endpoint opposite to `node` (`None` if `node` is not an endpoint).
    pub fn other(&self, node: NodeId) -> Option<NodeId> {
        if node == self.u {
            Some(self.v)
        } else if node == self.v {
            Some(self.u)
        } else {
            None
        }
    }
}

impl std::fmt::Display for EdgeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.u, self.v)
    }
}

/// Static per-edge attributes the planner works with: capacity, SDN membership, power cost.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphCaps {
    /// Capacity `C_e` in Mbps.
    pub capacity_mbps: BTreeMap<EdgeKey, f64>,
    /// Whether the edge is under SDN control (only those get a β variable).
    pub is_sdn: BTreeMap<EdgeKey, bool>,
    /// Power cost `P_e` used in the energy term of the objective.
    pub power_cost: BTreeMap<EdgeKey, f64>,
}

impl GraphCaps {
    /// Capacity of an edge, 0 if unknown.
    pub fn cap(&self, e: &EdgeKey) -> f64 {
        self.capacity_mbps.get(e).copied().unwrap_or(0.0)
    }

    /// Whether the edge is SDN-controlled; unknown edges are legacy.
    pub fn sdn(&self, e: &EdgeKey) -> bool {
        self.is_sdn.get(e).copied().unwrap_or(false)
    }

    /// Power cost of an edge. Falls back to 10% of the capacity, or 1.0 if the capacity is
    /// unknown too.
    pub fn power(&self, e: &EdgeKey) -> f64 {
        if let Some(p) = self.power_cost.get(e) {
            return *p;
        }
        let c = self.cap(e);
        if c > 0.0 {
            c * 0.1
        } else {
            1.0
        }
    }

    /// All edges with a known capacity, in canonical order.
    pub fn edges(&self) -> impl Iterator<Item = EdgeKey> + '_ {
        self.capacity_mbps.keys().copied()
    }
}

/// One traffic demand between two nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    /// Flow identifier from the input file.
    pub id: FlowId,
    /// Source node.
    pub s: NodeId,
    /// Destination node.
    pub d: NodeId,
    /// Demand in Mbps (static per run).
    pub demand_mbps: f64,
    /// Candidate path ids, repopulated each planning cycle.
    pub cand_path_ids: Vec<PathId>,
}

/// A loop-free path through the live graph, as a sequence of canonical edges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidatePath {
    /// Path identifier, unique within one planning cycle.
    pub id: PathId,
    /// Edges of the path, in traversal order.
    pub edges: Vec<EdgeKey>,
}

/// The objective weights handed to the planner: energy weight and load weight, summing to 1.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Weights {
    /// Weight of the power term (`EWr`).
    pub ewr: f64,
    /// Weight of the load term (`LWr`).
    pub lwr: f64,
}

impl Default for Weights {
    fn default() -> Self {
        Weights { ewr: 0.5, lwr: 0.5 }
    }
}

/// Outcome class of a planner run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlanStatus {
    /// The solver proved optimality.
    Optimal,
    /// A solution vector exists without an optimality proof (e.g. time limit hit).
    Feasible,
    /// The solver proved there is no solution; the plan carries no decisions.
    Infeasible,
}

impl std::fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlanStatus::Optimal => write!(f, "optimal"),
            PlanStatus::Feasible => write!(f, "feasible"),
            PlanStatus::Infeasible => write!(f, "infeasible"),
        }
    }
}

/// The decoded output of one planning run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TePlan {
    /// Chosen candidate path per flow.
    pub chosen_path: BTreeMap<FlowId, PathId>,
    /// On/off decision per edge. SDN edges carry the solver's β; legacy edges are always `true`.
    pub beta: BTreeMap<EdgeKey, bool>,
    /// Resulting load per edge in Mbps.
    pub load_mbps: BTreeMap<EdgeKey, f64>,
    /// Objective value.
    pub objective: f64,
    /// Outcome class.
    pub status: PlanStatus,
}

impl TePlan {
    /// An empty plan with the given status.
    pub fn empty(status: PlanStatus) -> Self {
        TePlan {
            chosen_path: BTreeMap::new(),
            beta: BTreeMap::new(),
            load_mbps: BTreeMap::new(),
            objective: 0.0,
            status,
        }
    }
}

/// Errors while loading the static graph or the flow table.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("cannot read {path}: {source}")]
    Io {
        /// Offending path.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// The graph file is not valid JSON of the expected shape.
    #[error("malformed graph file: {0}")]
    Json(#[from] serde_json::Error),
    /// A node id in the graph file is not an integer.
    #[error("node id {0:?} is not an integer")]
    BadNodeId(String),
    /// A link references a node that is not in the node list.
    #[error("link {0}-{1} references an unknown node")]
    UnknownNode(String, String),
}

/// Errors while planning one cycle.
#[derive(Debug, Error)]
pub enum TeError {
    /// A flow has no candidate path in the current live graph.
    #[error("flow {0} has no candidate path")]
    NoCandidatePaths(FlowId),
    /// The candidate path set is empty (e.g. the topology has not converged yet).
    #[error("no candidate paths in the live graph")]
    EmptyPathSet,
    /// The MILP solver failed without proving infeasibility.
    #[error("solver failed: {0}")]
    Solver(#[from] good_lp::ResolutionError),
}
