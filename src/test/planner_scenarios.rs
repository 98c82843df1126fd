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

//! Planner scenarios on a toy triangle: two SDN edges of capacity 100 form a detour around a
//! legacy shortcut of capacity 50.

use pretty_assertions::assert_eq;
use test_log::test;

use crate::planner::plan;
use crate::types::{CandidatePath, EdgeKey, Flow, GraphCaps, PlanStatus, Weights};

/// The toy triangle: 1-2 and 2-3 are SDN with capacity 100, 1-3 is legacy with capacity 50.
/// All power costs are equal.
fn triangle() -> GraphCaps {
    let mut caps = GraphCaps::default();
    for (u, v, cap, sdn) in [(1, 2, 100.0, true), (2, 3, 100.0, true), (1, 3, 50.0, false)] {
        let e = EdgeKey::new(u, v);
        caps.capacity_mbps.insert(e, cap);
        caps.is_sdn.insert(e, sdn);
        caps.power_cost.insert(e, 10.0);
    }
    caps
}

/// The two candidate paths from 1 to 3: the legacy shortcut and the SDN detour.
fn candidates() -> Vec<CandidatePath> {
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
fn flow_1_to_3(demand: f64) -> Flow {
    Flow {
        id: 1,
        s: 1,
        d: 3,
        demand_mbps: demand,
        cand_path_ids: vec![100, 101],
    }
}

/// Pure load optimization with a demand exceeding the shortcut: the flow must take the SDN
/// detour, both SDN links stay up and carry the full demand.
#[test]
fn load_weight_routes_around_the_small_link() {
    let plan = plan(
        &triangle(),
        &candidates(),
        &[flow_1_to_3(80.0)],
        Weights { ewr: 0.0, lwr: 1.0 },
        None,
    )
    .unwrap();

    assert_eq!(plan.status, PlanStatus::Optimal);
    assert_eq!(plan.chosen_path[&1], 101);
    assert_eq!(plan.beta[&EdgeKey::new(1, 2)], true);
    assert_eq!(plan.beta[&EdgeKey::new(2, 3)], true);
    // the legacy edge is implicitly on
    assert_eq!(plan.beta[&EdgeKey::new(1, 3)], true);
    assert_eq!(plan.load_mbps[&EdgeKey::new(1, 2)], 80.0);
    assert_eq!(plan.load_mbps[&EdgeKey::new(2, 3)], 80.0);
    assert_eq!(plan.load_mbps[&EdgeKey::new(1, 3)], 0.0);
}

/// Pure energy optimization with a demand that fits the shortcut: both SDN links sleep, the
/// legacy edge carries the flow, and the objective collapses to the power of the links kept up.
#[test]
fn energy_weight_sleeps_both_sdn_links() {
    let plan = plan(
        &triangle(),
        &candidates(),
        &[flow_1_to_3(20.0)],
        Weights { ewr: 1.0, lwr: 0.0 },
        None,
    )
    .unwrap();

    assert_eq!(plan.status, PlanStatus::Optimal);
    assert_eq!(plan.chosen_path[&1], 100);
    assert_eq!(plan.beta[&EdgeKey::new(1, 2)], false);
    assert_eq!(plan.beta[&EdgeKey::new(2, 3)], false);
    assert_eq!(plan.load_mbps[&EdgeKey::new(1, 3)], 20.0);
    assert_eq!(plan.load_mbps[&EdgeKey::new(1, 2)], 0.0);
    assert_eq!(plan.load_mbps[&EdgeKey::new(2, 3)], 0.0);
    assert!(plan.objective.abs() < 1e-6, "objective = {}", plan.objective);
}

/// With several flows, every feasible plan must choose exactly one path per flow, keep every
/// load within capacity, and carry zero load on sleeping SDN edges.
#[test]
fn exclusivity_and_capacity_laws_hold() {
    let caps = triangle();
    let paths = candidates();
    let flows = vec![
        Flow {
            id: 1,
            s: 1,
            d: 3,
            demand_mbps: 40.0,
            cand_path_ids: vec![100, 101],
        },
        Flow {
            id: 2,
            s: 1,
            d: 3,
            demand_mbps: 45.0,
            cand_path_ids: vec![100, 101],
        },
    ];
    for weights in [
        Weights { ewr: 0.0, lwr: 1.0 },
        Weights { ewr: 1.0, lwr: 0.0 },
        Weights { ewr: 0.5, lwr: 0.5 },
    ] {
        let plan = plan(&caps, &paths, &flows, weights, None).unwrap();
        assert!(
            matches!(plan.status, PlanStatus::Optimal | PlanStatus::Feasible),
            "unexpected status {:?}",
            plan.status
        );
        // path exclusivity: exactly one chosen candidate per flow
        for flow in &flows {
            let chosen = plan.chosen_path[&flow.id];
            assert!(flow.cand_path_ids.contains(&chosen));
        }
        // capacity compliance, and no load on sleeping edges
        for edge in caps.edges() {
            let load = plan.load_mbps[&edge];
            if plan.beta[&edge] {
                assert!(
                    load <= caps.cap(&edge) + 1e-6,
                    "edge {} overloaded: {}",
                    edge,
                    load
                );
            } else {
                assert_eq!(load, 0.0, "sleeping edge {} carries load", edge);
            }
        }
    }
}
