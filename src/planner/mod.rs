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

//! The MILP that jointly picks one candidate path per flow and an on/off state per SDN link.
//!
//! Variables: a binary `x_{f,p}` per (flow, candidate path) pair and a binary `β_e` per SDN edge
//! (legacy edges are implicitly on). The objective trades the load cost of the chosen paths
//! (demand × Σ 1/capacity, weighted by `LWr`) against the power cost of the SDN edges kept up
//! (Σ P_e β_e, weighted by `EWr`). Constraints enforce exactly one path per flow, and per-edge
//! capacity — with the twist that an SDN edge only offers capacity while its β is 1, which is
//! what lets the solver park traffic elsewhere and sleep the link.

pub mod paths;

use std::collections::BTreeMap;
use std::time::Duration;

use good_lp::solvers::coin_cbc::coin_cbc;
use good_lp::{constraint, variable, Expression, ProblemVariables, ResolutionError, Solution, SolverModel, Variable};
use log::{debug, info};

use crate::types::{
    CandidatePath, EdgeKey, Flow, FlowId, GraphCaps, PathId, PlanStatus, TeError, TePlan, Weights,
};

/// Capacity floor in the objective's reciprocal, guarding against division by zero.
const CAP_FLOOR: f64 = 1e-9;

/// The variables of one planning run.
struct PlanVars {
    /// Path-selection variable per (flow, candidate path).
    x: BTreeMap<(FlowId, PathId), Variable>,
    /// On/off variable per SDN edge.
    beta: BTreeMap<EdgeKey, Variable>,
}

/// Solve the joint routing / link-sleeping problem.
///
/// Returns a plan with status [`PlanStatus::Infeasible`] (and no decisions) when the solver
/// proves infeasibility, and an error when a flow has no candidates or the solver fails without
/// a proof.
pub fn plan(
    caps: &GraphCaps,
    paths: &[CandidatePath],
    flows: &[Flow],
    weights: Weights,
    time_limit: Option<Duration>,
) -> Result<TePlan, TeError> {
    if paths.is_empty() {
        return Err(TeError::EmptyPathSet);
    }
    for flow in flows {
        if flow.cand_path_ids.is_empty() {
            return Err(TeError::NoCandidatePaths(flow.id));
        }
    }
    let path_by_id: BTreeMap<PathId, &CandidatePath> =
        paths.iter().map(|p| (p.id, p)).collect();

    // -- variables ------------------------------------------------------------------------
    let mut problem = ProblemVariables::new();
    let vars = setup_vars(&mut problem, caps, flows);

    // -- objective ------------------------------------------------------------------------
    // LWr · Σ_f Σ_p (D_f · Σ_{e∈p} 1/C_e) x_{f,p}  +  EWr · Σ_{e∈SDN} P_e β_e
    let mut objective = Expression::from(0.0);
    for flow in flows {
        let demand = flow.demand_mbps.max(0.0);
        for &pid in &flow.cand_path_ids {
            let path = path_by_id[&pid];
            let coef: f64 = path
                .edges
                .iter()
                .map(|e| demand / caps.cap(e).max(CAP_FLOOR))
                .sum();
            objective += weights.lwr * coef * vars.x[&(flow.id, pid)];
        }
    }
    for (edge, beta) in &vars.beta {
        objective += weights.ewr * caps.power(edge).max(0.0) * *beta;
    }

    let mut model = coin_cbc(problem.minimise(objective.clone()));
    // the branch-and-bound chatter is pure noise in test logs
    #[cfg(test)]
    model.set_parameter("logLevel", "0");
    if let Some(t) = time_limit {
        model.set_parameter("seconds", &t.as_secs().to_string());
    }

    // -- constraints ----------------------------------------------------------------------
    // path exclusivity: Σ_p x_{f,p} = 1 for every flow
    for flow in flows {
        let total: Expression = flow
            .cand_path_ids
            .iter()
            .map(|pid| vars.x[&(flow.id, *pid)])
            .sum();
        model.add_constraint(constraint!(total == 1.0));
    }
    // capacity: SDN edges only offer capacity while on, legacy edges always do
    for edge in caps.edges() {
        let x = &vars.x;
        let load: Expression = flows
            .iter()
            .flat_map(|flow| {
                let demand = flow.demand_mbps.max(0.0);
                flow.cand_path_ids
                    .iter()
                    .filter(|pid| path_by_id[*pid].edges.contains(&edge))
                    .map(move |pid| demand * x[&(flow.id, *pid)])
            })
            .sum();
        let cap = caps.cap(&edge);
        match vars.beta.get(&edge) {
            Some(beta) => model.add_constraint(constraint!(load - cap * *beta <= 0.0)),
            None => model.add_constraint(constraint!(load <= cap)),
        };
    }

    // -- solve and decode -----------------------------------------------------------------
    info!(
        "solving TE model: {} path variables, {} sdn edges, lwr={:.3} ewr={:.3}",
        vars.x.len(),
        vars.beta.len(),
        weights.lwr,
        weights.ewr
    );
    let solution = match model.solve() {
        Ok(solution) => solution,
        Err(ResolutionError::Infeasible) => {
            debug!("TE model proven infeasible");
            return Ok(TePlan::empty(PlanStatus::Infeasible));
        }
        Err(e) => return Err(TeError::Solver(e)),
    };
    let status = if solution.model().is_proven_optimal() {
        PlanStatus::Optimal
    } else {
        PlanStatus::Feasible
    };

    let mut beta = BTreeMap::new();
    for edge in caps.edges() {
        let on = match vars.beta.get(&edge) {
            Some(v) => solution.value(*v) >= 0.5,
            None => true,
        };
        beta.insert(edge, on);
    }

    let mut chosen_path = BTreeMap::new();
    for flow in flows {
        let mut best: Option<(PathId, f64)> = None;
        for &pid in &flow.cand_path_ids {
            let val = solution.value(vars.x[&(flow.id, pid)]);
            if best.map(|(_, b)| val > b).unwrap_or(true) {
                best = Some((pid, val));
            }
        }
        if let Some((pid, _)) = best {
            chosen_path.insert(flow.id, pid);
        }
    }

    let mut load_mbps: BTreeMap<EdgeKey, f64> = caps.edges().map(|e| (e, 0.0)).collect();
    for flow in flows {
        let demand = flow.demand_mbps.max(0.0);
        for &pid in &flow.cand_path_ids {
            let val = solution.value(vars.x[&(flow.id, pid)]);
            if val <= 1e-9 {
                continue;
            }
            for edge in &path_by_id[&pid].edges {
                *load_mbps.entry(*edge).or_default() += demand * val;
            }
        }
    }

    Ok(TePlan {
        chosen_path,
        beta,
        load_mbps,
        objective: objective.eval_with(&solution),
        status,
    })
}

/// Create a binary `x` per (flow, candidate) and a binary `β` per SDN edge.
fn setup_vars(problem: &mut ProblemVariables, caps: &GraphCaps, flows: &[Flow]) -> PlanVars {
    let mut x = BTreeMap::new();
    for flow in flows {
        for &pid in &flow.cand_path_ids {
            x.insert((flow.id, pid), problem.add(variable().binary()));
        }
    }
    let mut beta = BTreeMap::new();
    for edge in caps.edges() {
        if caps.sdn(&edge) {
            beta.insert(edge, problem.add(variable().binary()));
        }
    }
    PlanVars { x, beta }
}

#[cfg(test)]
mod test {
    use super::*;

    /// The toy graph of the planner scenarios: a triangle with two SDN edges and one legacy
    /// shortcut of half capacity.
    fn toy_caps() -> GraphCaps {
        let mut caps = GraphCaps::default();
        for (u, v, cap, sdn) in [(1, 2, 100.0, true), (2, 3, 100.0, true), (1, 3, 50.0, false)] {
            let e = EdgeKey::new(u, v);
            caps.capacity_mbps.insert(e, cap);
            caps.is_sdn.insert(e, sdn);
            caps.power_cost.insert(e, 10.0);
        }
        caps
    }

    /// The two candidates from 1 to 3: the legacy shortcut and the SDN detour.
    fn toy_paths() -> Vec<CandidatePath> {
        vec![
            CandidatePath {
                id: 100,
                edges: vec![EdgeKey::new(1, 3)],
            },
            CandidatePath {
                id: 101,
                edges: vec![EdgeKey::new(1, 2), EdgeKey::new(2, 3)],
            },
        ]
    }

    /// One flow from 1 to 3 with both candidates.
    fn toy_flow(demand: f64) -> Flow {
        Flow {
            id: 1,
            s: 1,
            d: 3,
            demand_mbps: demand,
            cand_path_ids: vec![100, 101],
        }
    }

    #[test]
    fn empty_path_set_is_rejected() {
        assert!(matches!(
            plan(&toy_caps(), &[], &[toy_flow(10.0)], Weights::default(), None),
            Err(TeError::EmptyPathSet)
        ));
    }

    #[test]
    fn flow_without_candidates_is_rejected() {
        let mut flow = toy_flow(10.0);
        flow.cand_path_ids.clear();
        assert!(matches!(
            plan(&toy_caps(), &toy_paths(), &[flow], Weights::default(), None),
            Err(TeError::NoCandidatePaths(1))
        ));
    }

    #[test]
    fn oversized_demand_is_proven_infeasible() {
        let plan = plan(
            &toy_caps(),
            &toy_paths(),
            &[toy_flow(500.0)],
            Weights::default(),
            None,
        )
        .unwrap();
        assert_eq!(plan.status, PlanStatus::Infeasible);
        assert!(plan.chosen_path.is_empty());
    }
}
