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

//! The topology viewer: turns raw LLDP observations into a canonical, expiry-based undirected
//! edge set.
//!
//! A background thread periodically injects LLDP on every known switch port and prunes edges
//! whose last confirmation is older than the expiry window, so the snapshot only ever contains
//! *live* links. Observations are canonicalized (`u < v`, ports swapped to follow) and
//! self-loops, which can arise from a non-injective switch-to-node mapping, are dropped.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use itertools::Itertools;
use log::{debug, trace};
use openflow10::{Controller, LldpEvent};

use crate::types::{EdgeKey, NodeId};

/// Default period of the discovery loop.
pub const DEFAULT_LLDP_PERIOD: Duration = Duration::from_secs(1);
/// Default edge expiry window.
pub const DEFAULT_EXPIRY: Duration = Duration::from_secs(10);

/// One live link in a topology snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopoEdge {
    /// Canonical endpoints.
    pub key: EdgeKey,
    /// Port on the `u` side.
    pub u_port: u16,
    /// Port on the `v` side.
    pub v_port: u16,
    /// When the edge was last confirmed by LLDP.
    pub last_seen: Instant,
}

/// State shared with the LLDP hook and the background thread.
struct Inner {
    /// Switch-id to node-id mapping (identity by default).
    mapper: Box<dyn Fn(openflow10::SwitchId) -> NodeId + Send + Sync>,
    /// Live edges: canonical key and side ports, to the time of the last confirmation.
    edges: Mutex<BTreeMap<(EdgeKey, u16, u16), Instant>>,
    /// Cleared to stop the background thread.
    running: AtomicBool,
    /// Edges older than this are pruned.
    expiry: Duration,
}

impl Inner {
    /// Build a by-value snapshot of the live edges, in canonical order.
    fn snapshot(&self) -> Vec<TopoEdge> {
        let edges = self.edges.lock().expect("edge map poisoned");
        edges
            .iter()
            .map(|(&(key, u_port, v_port), &last_seen)| TopoEdge {
                key,
                u_port,
                v_port,
                last_seen,
            })
            .collect()
    }

    /// Canonicalize and record one LLDP observation. Self-loops are dropped.
    fn record(&self, e: LldpEvent) {
        let nu = (self.mapper)(e.src_swid);
        let nv = (self.mapper)(e.dst_swid);
        if nu == nv {
            trace!("dropping self-loop LLDP observation on node {}", nu);
            return;
        }
        let (key, u_port, v_port) = if nu < nv {
            (EdgeKey { u: nu, v: nv }, e.src_port, e.dst_port)
        } else {
            (EdgeKey { u: nv, v: nu }, e.dst_port, e.src_port)
        };
        let mut edges = self.edges.lock().expect("edge map poisoned");
        edges.insert((key, u_port, v_port), Instant::now());
    }

    /// Drop every edge whose last confirmation is older than the expiry window.
    fn prune(&self) {
        let now = Instant::now();
        let mut edges = self.edges.lock().expect("edge map poisoned");
        let before = edges.len();
        edges.retain(|_, last_seen| now.duration_since(*last_seen) <= self.expiry);
        if edges.len() != before {
            debug!("pruned {} expired edge(s)", before - edges.len());
        }
    }
}

/// The topology viewer. See the module documentation.
pub struct TopoViewer {
    /// Facade used to inject LLDP.
    ctl: Controller,
    /// Shared state.
    inner: Arc<Inner>,
    /// Discovery period.
    lldp_period: Duration,
    /// Background thread handle.
    bg: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for TopoViewer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopoViewer")
            .field("lldp_period", &self.lldp_period)
            .field("expiry", &self.inner.expiry)
            .field("edges", &self.snapshot_edges().len())
            .finish()
    }
}

impl TopoViewer {
    /// Create a viewer with the identity switch-to-node mapping and default timing.
    pub fn new(ctl: Controller) -> Self {
        Self::with_mapper(ctl, |swid| swid, DEFAULT_LLDP_PERIOD, DEFAULT_EXPIRY)
    }

    /// Create a viewer with an explicit switch-to-node mapping and timing.
    ///
    /// If the mapping is non-injective, links between switches that collapse onto the same node
    /// become self-loops and are silently ignored.
    pub fn with_mapper(
        ctl: Controller,
        mapper: impl Fn(openflow10::SwitchId) -> NodeId + Send + Sync + 'static,
        lldp_period: Duration,
        expiry: Duration,
    ) -> Self {
        TopoViewer {
            ctl,
            inner: Arc::new(Inner {
                mapper: Box::new(mapper),
                edges: Mutex::new(BTreeMap::new()),
                running: AtomicBool::new(false),
                expiry,
            }),
            lldp_period,
            bg: None,
        }
    }

    /// Register this viewer as the consumer of the facade's LLDP observations. Call once during
    /// initialization, before [`Controller::start`].
    pub fn subscribe(&self) {
        let inner = self.inner.clone();
        self.ctl.on_lldp(move |e| inner.record(e));
    }

    /// Feed one LLDP observation directly (the hook installed by [`TopoViewer::subscribe`] does
    /// exactly this).
    pub fn observe(&self, e: LldpEvent) {
        self.inner.record(e);
    }

    /// Start the background discovery loop. Idempotent.
    pub fn start(&mut self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }
        // align the session manager's own broadcast with our discovery period
        self.ctl.set_lldp_period(self.lldp_period);
        let inner = self.inner.clone();
        let ctl = self.ctl;
        let period = self.lldp_period;
        self.bg = Some(
            std::thread::Builder::new()
                .name("topo-viewer".into())
                .spawn(move || {
                    let mut next = Instant::now();
                    while inner.running.load(Ordering::SeqCst) {
                        let now = Instant::now();
                        if now >= next {
                            send_lldp_round(&ctl);
                            inner.prune();
                            next = now + period;
                        }
                        std::thread::sleep(Duration::from_millis(50));
                    }
                })
                .expect("cannot spawn the topology thread"),
        );
    }

    /// Stop the background thread. Idempotent.
    pub fn stop(&mut self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(bg) = self.bg.take() {
            let _ = bg.join();
        }
    }

    /// Prune expired edges now (the background loop does this once per period).
    pub fn prune_expired(&self) {
        self.inner.prune();
    }

    /// A by-value snapshot of the current live edges, in canonical order.
    pub fn snapshot_edges(&self) -> Vec<TopoEdge> {
        self.inner.snapshot()
    }

    /// A cloneable snapshot provider, for wiring the viewer into the monitor without sharing the
    /// viewer itself across threads.
    pub fn snapshot_provider(&self) -> impl Fn() -> Vec<TopoEdge> + Send + Sync + 'static {
        let inner = self.inner.clone();
        move || inner.snapshot()
    }

    /// Serialize the current topology as a Graphviz DOT graph with port-pair edge labels.
    pub fn export_dot(&self) -> String {
        let edges = self.snapshot_edges();
        let mut out = String::new();
        out.push_str("graph SDN {\n");
        out.push_str("  graph [overlap=false, splines=true];\n");
        out.push_str("  node  [shape=circle, fontsize=10];\n");
        for n in edges
            .iter()
            .flat_map(|e| [e.key.u, e.key.v])
            .sorted()
            .dedup()
        {
            writeln!(out, "  {};", n).expect("writing to a string cannot fail");
        }
        for e in &edges {
            writeln!(
                out,
                "  {} -- {} [label=\"({},{})\"];",
                e.key.u, e.key.v, e.u_port, e.v_port
            )
            .expect("writing to a string cannot fail");
        }
        out.push_str("}\n");
        out
    }
}

impl Drop for TopoViewer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Inject one LLDP frame on every known port of every switch.
fn send_lldp_round(ctl: &Controller) {
    for swid in ctl.switch_ids() {
        for port in ctl.ports_of(swid) {
            ctl.send_lldp(swid, port);
        }
    }
}
