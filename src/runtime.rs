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

//! The application loop: wire the speaker, viewer, monitor, forecaster and planner together,
//! re-plan once per control period, and enact the resulting β-vector on the data plane.
//!
//! A planning cycle that fails — no live edges yet, a flow without candidates, an infeasible or
//! failed solve — is skipped with a diagnostic, and the previously enacted state stays in place.
//! Every enacted PORT_MOD travels with its barrier (the facade guarantees it), so an aborted
//! cycle never leaves a link between states.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use openflow10::{wire::Match, Controller};

use crate::config::{self, StaticGraph};
use crate::forecast::{self, Forecast};
use crate::monitor::Monitor;
use crate::planner::{self, paths::build_candidate_paths};
use crate::topology::{TopoEdge, TopoViewer};
use crate::types::{CandidatePath, EdgeKey, Flow, GraphCaps, PlanStatus, TeError, TePlan};

/// Cookie stamped on path-pinning rules, so they are distinguishable from learner rules.
const PIN_COOKIE: u64 = 0x7e;
/// Priority of path-pinning rules (above the learner's 100).
const PIN_PRIORITY: u16 = 200;
/// Port speed advertised when waking an SDN link up.
const WAKE_SPEED_MBPS: u32 = 10_000;

/// Everything configurable about a controller run.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// TCP port the OpenFlow listener binds.
    pub of_port: u16,
    /// Path of the static graph JSON.
    pub graph_path: PathBuf,
    /// Path of the flow CSV.
    pub flows_path: PathBuf,
    /// Time between planning cycles.
    pub control_period: Duration,
    /// Candidate paths enumerated per (s, d) pair.
    pub k_paths: usize,
    /// Also pin each flow's chosen path with IPv4 flow rules.
    pub pin_flows: bool,
    /// Optional per-cycle solver time budget.
    pub solver_budget: Option<Duration>,
    /// Threshold for the weight derivation; defaults to the median link capacity.
    pub threshold_mbps: Option<f64>,
    /// Where to export the utilization time series on shutdown.
    pub stats_csv: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            of_port: 6633,
            graph_path: PathBuf::from("config/NSFNET.json"),
            flows_path: PathBuf::from("config/flows.csv"),
            control_period: Duration::from_secs(10),
            k_paths: 3,
            pin_flows: false,
            solver_budget: None,
            threshold_mbps: None,
            stats_csv: None,
        }
    }
}

/// Handle for requesting an orderly shutdown of a running [`App`] from another thread.
#[derive(Debug, Clone)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    /// Ask the app loop to finish its current cycle and shut down.
    pub fn stop(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// The assembled controller application.
pub struct App {
    /// Run configuration.
    cfg: AppConfig,
    /// The OpenFlow facade.
    ctl: Controller,
    /// Topology viewer (owns the live edge set).
    topo: TopoViewer,
    /// Link-load monitor.
    monitor: Monitor,
    /// Demand forecaster.
    forecast: Forecast,
    /// The static network description.
    graph: StaticGraph,
    /// The flow demands.
    flows: Vec<Flow>,
    /// Per-edge Mbps history fed to the forecaster.
    hist: BTreeMap<EdgeKey, Vec<f64>>,
    /// Threshold of the weight derivation, resolved at startup.
    threshold_mbps: f64,
    /// Cleared to stop the run loop.
    running: Arc<AtomicBool>,
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("cfg", &self.cfg)
            .field("flows", &self.flows.len())
            .field("threshold_mbps", &self.threshold_mbps)
            .finish()
    }
}

impl App {
    /// Load the configuration files and assemble all components. Fails (fatally) if the graph
    /// file is missing or malformed; a missing flow file falls back to the demo set.
    pub fn new(cfg: AppConfig) -> Result<Self, crate::types::ConfigError> {
        let graph = config::load_graph(&cfg.graph_path)?;
        let flows = config::load_flows(&cfg.flows_path);
        let threshold_mbps = cfg.threshold_mbps.unwrap_or_else(|| {
            let caps: Vec<f64> = graph.caps.capacity_mbps.values().copied().collect();
            quantile(caps, 0.5)
        });

        let ctl = Controller::new();
        let topo = TopoViewer::new(ctl);
        let caps = Arc::new(graph.caps.clone());
        let monitor = Monitor::new(
            ctl,
            topo.snapshot_provider(),
            move |e| caps.cap(e),
            crate::monitor::DEFAULT_PERIOD,
        );

        Ok(App {
            cfg,
            ctl,
            topo,
            monitor,
            forecast: Forecast::default(),
            graph,
            flows,
            hist: BTreeMap::new(),
            threshold_mbps,
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    /// A handle that stops the run loop from another thread.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(self.running.clone())
    }

    /// Start everything and drive planning cycles until stopped.
    pub fn run(&mut self) -> Result<(), openflow10::Error> {
        self.topo.subscribe();
        self.ctl.start(self.cfg.of_port)?;
        self.topo.start();
        self.monitor.start();
        self.running.store(true, Ordering::SeqCst);
        info!(
            "controller up on port {}, planning every {:?} (threshold {:.1} Mbps)",
            self.cfg.of_port, self.cfg.control_period, self.threshold_mbps
        );

        while self.running.load(Ordering::SeqCst) {
            match self.planning_cycle() {
                Ok(plan) if plan.status == PlanStatus::Infeasible => {
                    warn!("planning cycle infeasible; keeping the previous configuration")
                }
                Ok(plan) => info!(
                    "planning cycle done: status {}, objective {:.3}, {} link(s) asleep",
                    plan.status,
                    plan.objective,
                    plan.beta.values().filter(|on| !**on).count()
                ),
                Err(e) => warn!("planning cycle skipped: {}", e),
            }
            // sleep in small slices so a stop request takes effect promptly
            let mut remaining = self.cfg.control_period;
            while self.running.load(Ordering::SeqCst) && !remaining.is_zero() {
                let slice = remaining.min(Duration::from_millis(100));
                std::thread::sleep(slice);
                remaining -= slice;
            }
        }

        self.shutdown();
        Ok(())
    }

    /// One forecast → paths → solve → enact iteration.
    fn planning_cycle(&mut self) -> Result<TePlan, TeError> {
        let alive = self.topo.snapshot_edges();
        if alive.is_empty() {
            return Err(TeError::EmptyPathSet);
        }

        // static attributes restricted to the live edges
        let caps = live_caps(&self.graph.caps, &alive);

        // extend the per-edge histories with the latest total Mbps reading
        let rates = self.monitor.last_rates();
        for edge in &alive {
            let mbps = rates
                .get(&edge.key)
                .map(|r| r.rx_mbps + r.tx_mbps)
                .unwrap_or(0.0);
            self.hist.entry(edge.key).or_default().push(mbps);
        }
        let histories: BTreeMap<EdgeKey, Vec<f64>> = alive
            .iter()
            .filter_map(|e| self.hist.get(&e.key).map(|h| (e.key, h.clone())))
            .collect();

        let prediction = self.forecast.predict_next(&histories);
        let weights = forecast::weights_from_peak(prediction.peak, self.threshold_mbps);
        debug!(
            "predicted peak {:.1} Mbps over {} edge(s): lwr={:.3} ewr={:.3}",
            prediction.peak,
            histories.len(),
            weights.lwr,
            weights.ewr
        );

        let paths = build_candidate_paths(&alive, &mut self.flows, self.cfg.k_paths);
        let plan = planner::plan(
            &caps,
            &paths,
            &self.flows,
            weights,
            self.cfg.solver_budget,
        )?;
        if plan.status != PlanStatus::Infeasible {
            self.apply_beta(&plan, &alive);
            if self.cfg.pin_flows {
                self.pin_chosen_paths(&plan, &paths, &alive);
            }
        }
        Ok(plan)
    }

    /// Enact the β-vector: admin-down every sleeping link on both endpoints, wake the others.
    /// Node ids are taken as switch ids, which holds for the default identity mapping.
    fn apply_beta(&self, plan: &TePlan, alive: &[TopoEdge]) {
        let ports: BTreeMap<EdgeKey, (u16, u16)> = alive
            .iter()
            .map(|e| (e.key, (e.u_port, e.v_port)))
            .collect();
        for (&edge, &on) in &plan.beta {
            let (u_port, v_port) = match ports.get(&edge) {
                Some(p) => *p,
                None => continue,
            };
            let speed = if on { WAKE_SPEED_MBPS } else { 0 };
            self.ctl.port_mod(edge.u, u_port, on, speed);
            self.ctl.port_mod(edge.v, v_port, on, speed);
        }
    }

    /// Pin each flow onto its chosen path with per-hop IPv4 rules (hosts are assumed to carry
    /// the conventional `10.0.0.<node>` addresses).
    fn pin_chosen_paths(&self, plan: &TePlan, paths: &[CandidatePath], alive: &[TopoEdge]) {
        let ports: BTreeMap<EdgeKey, (u16, u16)> = alive
            .iter()
            .map(|e| (e.key, (e.u_port, e.v_port)))
            .collect();
        for flow in &self.flows {
            let path = plan
                .chosen_path
                .get(&flow.id)
                .and_then(|pid| paths.iter().find(|p| p.id == *pid));
            let path = match path {
                Some(p) => p,
                None => continue,
            };
            let src = node_ip(flow.s);
            let dst = node_ip(flow.d);
            let mut remaining: Vec<EdgeKey> = path.edges.clone();
            let mut cur = flow.s;
            while let Some(pos) = remaining.iter().position(|e| e.touches(cur)) {
                let edge = remaining.remove(pos);
                let (u_port, v_port) = match ports.get(&edge) {
                    Some(p) => *p,
                    None => break,
                };
                let out_port = if cur == edge.u { u_port } else { v_port };
                self.ctl.flow_mod(
                    cur,
                    Match::ipv4(0, src, dst, 0, None, None),
                    vec![openflow10::Action::Output { port: out_port }],
                    PIN_PRIORITY,
                    true,
                    0,
                    0,
                    PIN_COOKIE,
                );
                cur = match edge.other(cur) {
                    Some(n) => n,
                    None => break,
                };
            }
        }
    }

    /// Stop all background components and export the collected series if configured.
    fn shutdown(&mut self) {
        info!("shutting down");
        self.monitor.stop();
        self.topo.stop();
        self.ctl.stop();
        if let Some(path) = &self.cfg.stats_csv {
            match self.monitor.export_csv(path, 0) {
                Ok(()) => info!("utilization series written to {}", path.display()),
                Err(e) => warn!("cannot write {}: {}", path.display(), e),
            }
        }
    }
}

/// Restrict the static per-edge attributes to the edges currently alive.
fn live_caps(all: &GraphCaps, alive: &[TopoEdge]) -> GraphCaps {
    let mut caps = GraphCaps::default();
    for e in alive {
        if let Some(&cap) = all.capacity_mbps.get(&e.key) {
            caps.capacity_mbps.insert(e.key, cap);
            caps.power_cost.insert(e.key, all.power(&e.key));
            caps.is_sdn.insert(e.key, all.sdn(&e.key));
        }
    }
    caps
}

/// The conventional management address of a node's host.
fn node_ip(node: crate::types::NodeId) -> Ipv4Addr {
    Ipv4Addr::new(10, 0, 0, node as u8)
}

/// Linear-interpolated quantile, 0 for an empty sample.
fn quantile(mut xs: Vec<f64>, q: f64) -> f64 {
    if xs.is_empty() {
        return 0.0;
    }
    xs.sort_by(|a, b| a.partial_cmp(b).expect("capacities are finite"));
    let idx = q.clamp(0.0, 1.0) * (xs.len() - 1) as f64;
    let i = idx as usize;
    let frac = idx - i as f64;
    if i + 1 < xs.len() {
        xs[i] * (1.0 - frac) + xs[i + 1] * frac
    } else {
        xs[xs.len() - 1]
    }
}
