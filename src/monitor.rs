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

//! Link-load monitoring: wrap-safe counter deltas, instantaneous Mbps rates, utilization, and
//! per-edge time series.
//!
//! Rates are computed as `8 · Δbytes / (1e6 · Δt)` against a monotonic clock; a counter that
//! appears to decrease (reset or reordering) clamps the delta to zero, and the first sample of an
//! edge yields a zero rate. Utilization is `(rx + tx) / capacity` clamped into `[0, 1]`, or zero
//! when no positive capacity is known. None of the arithmetic can fail.

use std::collections::BTreeMap;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::debug;
use openflow10::{Controller, PortCounters, SwitchId};
use time::format_description::FormatItem;
use time::macros::format_description;
use time::OffsetDateTime;

use crate::topology::TopoEdge;
use crate::types::EdgeKey;

/// Default sampling period.
pub const DEFAULT_PERIOD: Duration = Duration::from_secs(2);

/// Timestamp format of the CSV export: ISO-8601 UTC with a trailing `Z`.
const TIME_FORMAT: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]Z");

/// Instantaneous rates of one edge.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LinkRate {
    /// Received Mbps.
    pub rx_mbps: f64,
    /// Transmitted Mbps.
    pub tx_mbps: f64,
    /// `(rx + tx) / capacity`, clamped into `[0, 1]`; 0 without a positive capacity.
    pub util: f64,
}

/// One datapoint of an edge's time series.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    /// Wall-clock time of the sample (UTC).
    pub at: OffsetDateTime,
    /// Rates at that time.
    pub rate: LinkRate,
}

/// Raw counter state retained per edge for delta computation.
struct LastCounter {
    /// Byte counters at the previous sample.
    counters: PortCounters,
    /// Monotonic time of the previous sample.
    t: Instant,
}

/// All mutable monitor state, behind one mutex.
#[derive(Default)]
struct MonState {
    /// Previous raw counters per edge.
    last_counters: BTreeMap<EdgeKey, LastCounter>,
    /// Most recent computed rates per edge.
    last_rates: BTreeMap<EdgeKey, LinkRate>,
    /// Append-only time series per edge.
    series: BTreeMap<EdgeKey, Vec<Sample>>,
}

/// State shared with the background sampling thread.
struct Inner {
    /// The facade polled for counters.
    ctl: Controller,
    /// Provider of the current live edges (typically the topology viewer's snapshot).
    edges: Box<dyn Fn() -> Vec<TopoEdge> + Send + Sync>,
    /// Capacity lookup in Mbps; non-positive means unknown.
    capacity: Box<dyn Fn(&EdgeKey) -> f64 + Send + Sync>,
    /// Sampling period in milliseconds.
    period_ms: AtomicU64,
    /// Cleared to stop the background thread.
    running: AtomicBool,
    /// Mutable state.
    state: Mutex<MonState>,
}

impl Inner {
    /// The current sampling period.
    fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms.load(Ordering::Relaxed))
    }

    /// Translate the facade's per-port snapshot into per-edge counters, using the `u`-side port
    /// of each live edge (falling back to the `v` side if the `u` side has no counters yet).
    fn edge_counters(
        &self,
        by_port: &BTreeMap<(SwitchId, u16), PortCounters>,
    ) -> BTreeMap<EdgeKey, PortCounters> {
        let mut out = BTreeMap::new();
        for edge in (self.edges)() {
            let u_side = by_port.get(&(edge.key.u, edge.u_port));
            let v_side = by_port.get(&(edge.key.v, edge.v_port));
            if let Some(&counters) = u_side.or(v_side) {
                out.insert(edge.key, counters);
            }
        }
        out
    }

    /// Compute rates from fresh per-edge counters and update all internal state.
    fn ingest(&self, counters: &BTreeMap<EdgeKey, PortCounters>) -> Vec<(EdgeKey, LinkRate)> {
        let t_now = Instant::now();
        let at = OffsetDateTime::now_utc();
        let mut out = Vec::with_capacity(counters.len());
        let mut state = self.state.lock().expect("monitor state poisoned");
        for (&edge, &current) in counters {
            let rate = match state.last_counters.get(&edge) {
                Some(last) => {
                    let dt = t_now.duration_since(last.t).as_secs_f64();
                    let drx = current.rx_bytes.saturating_sub(last.counters.rx_bytes);
                    let dtx = current.tx_bytes.saturating_sub(last.counters.tx_bytes);
                    let cap = (self.capacity)(&edge);
                    let rx_mbps = mbps_from_delta(drx, dt);
                    let tx_mbps = mbps_from_delta(dtx, dt);
                    LinkRate {
                        rx_mbps,
                        tx_mbps,
                        util: utilization(rx_mbps, tx_mbps, cap),
                    }
                }
                // first observation of this edge: no delta, no rate
                None => LinkRate::default(),
            };
            state.last_counters.insert(
                edge,
                LastCounter {
                    counters: current,
                    t: t_now,
                },
            );
            state.last_rates.insert(edge, rate);
            state
                .series
                .entry(edge)
                .or_default()
                .push(Sample { at, rate });
            out.push((edge, rate));
        }
        out
    }
}

/// Convert a byte delta over a time delta into Mbps. Zero (or negative) Δt yields zero.
fn mbps_from_delta(dbytes: u64, dt_sec: f64) -> f64 {
    if dt_sec <= 0.0 {
        return 0.0;
    }
    8.0 * dbytes as f64 / dt_sec / 1e6
}

/// Utilization of an edge, clamped into `[0, 1]`; zero without a positive capacity.
fn utilization(rx_mbps: f64, tx_mbps: f64, cap_mbps: f64) -> f64 {
    if cap_mbps > 0.0 {
        ((rx_mbps + tx_mbps) / cap_mbps).clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// The monitor. See the module documentation.
pub struct Monitor {
    /// Shared state.
    inner: Arc<Inner>,
    /// Background thread handle.
    bg: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Monitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Monitor")
            .field("period", &self.inner.period())
            .field("running", &self.inner.running.load(Ordering::Relaxed))
            .finish()
    }
}

impl Monitor {
    /// Create a monitor sampling the given facade. `edges` provides the live edge set used to
    /// translate port counters into edge counters; `capacity` provides per-edge capacity in Mbps.
    pub fn new(
        ctl: Controller,
        edges: impl Fn() -> Vec<TopoEdge> + Send + Sync + 'static,
        capacity: impl Fn(&EdgeKey) -> f64 + Send + Sync + 'static,
        period: Duration,
    ) -> Self {
        Monitor {
            inner: Arc::new(Inner {
                ctl,
                edges: Box::new(edges),
                capacity: Box::new(capacity),
                period_ms: AtomicU64::new(period.as_millis() as u64),
                running: AtomicBool::new(false),
                state: Mutex::new(MonState::default()),
            }),
            bg: None,
        }
    }

    /// Take one synchronous sample now (blocks for the facade's bounded stats poll) and return
    /// the per-edge rates.
    pub fn sample_once(&self) -> Vec<(EdgeKey, LinkRate)> {
        sample(&self.inner)
    }

    /// Feed one pre-translated per-edge counter snapshot (this is what [`Monitor::sample_once`]
    /// does after polling the facade).
    pub fn ingest(&self, counters: &BTreeMap<EdgeKey, PortCounters>) -> Vec<(EdgeKey, LinkRate)> {
        self.inner.ingest(counters)
    }

    /// Start background sampling. Idempotent.
    pub fn start(&mut self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }
        // align the session manager's stats requests with our sampling period
        self.inner.ctl.set_stats_period(self.inner.period());
        let inner = self.inner.clone();
        self.bg = Some(
            std::thread::Builder::new()
                .name("monitor".into())
                .spawn(move || {
                    let mut next = Instant::now();
                    while inner.running.load(Ordering::SeqCst) {
                        let now = Instant::now();
                        if now >= next {
                            let n = sample(&inner).len();
                            debug!("sampled {} edge(s)", n);
                            next = now + inner.period();
                        }
                        std::thread::sleep(Duration::from_millis(20));
                    }
                })
                .expect("cannot spawn the monitor thread"),
        );
    }

    /// Stop background sampling. Idempotent.
    pub fn stop(&mut self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(bg) = self.bg.take() {
            let _ = bg.join();
        }
    }

    /// Sample at the period boundary for the given duration (blocking), then return per-edge
    /// arithmetic means of the rates and the utilization derived from them.
    pub fn window_average(&self, dur: Duration) -> BTreeMap<EdgeKey, LinkRate> {
        let start = Instant::now();
        let mut sum: BTreeMap<EdgeKey, (f64, f64, u32)> = BTreeMap::new();
        loop {
            for (edge, rate) in sample(&self.inner) {
                let acc = sum.entry(edge).or_default();
                acc.0 += rate.rx_mbps;
                acc.1 += rate.tx_mbps;
                acc.2 += 1;
            }
            if start.elapsed() >= dur {
                break;
            }
            std::thread::sleep(self.inner.period());
        }
        sum.into_iter()
            .filter(|(_, (_, _, n))| *n > 0)
            .map(|(edge, (rx, tx, n))| {
                let rx_mbps = rx / n as f64;
                let tx_mbps = tx / n as f64;
                let util = utilization(rx_mbps, tx_mbps, (self.inner.capacity)(&edge));
                (
                    edge,
                    LinkRate {
                        rx_mbps,
                        tx_mbps,
                        util,
                    },
                )
            })
            .collect()
    }

    /// The most recent rate of every edge (by-value snapshot).
    pub fn last_rates(&self) -> BTreeMap<EdgeKey, LinkRate> {
        self.inner
            .state
            .lock()
            .expect("monitor state poisoned")
            .last_rates
            .clone()
    }

    /// The recorded time series of one edge.
    pub fn timeseries(&self, edge: &EdgeKey) -> Vec<Sample> {
        self.inner
            .state
            .lock()
            .expect("monitor state poisoned")
            .series
            .get(edge)
            .cloned()
            .unwrap_or_default()
    }

    /// Change the sampling period of the background thread and of [`Monitor::window_average`].
    pub fn set_period(&self, period: Duration) {
        self.inner
            .period_ms
            .store(period.as_millis() as u64, Ordering::Relaxed);
    }

    /// Export the time series as CSV (`time_iso,u,v,rx_mbps,tx_mbps,util`), keeping only the
    /// last `max_points_per_edge` datapoints per edge if nonzero.
    pub fn export_csv(
        &self,
        path: impl AsRef<Path>,
        max_points_per_edge: usize,
    ) -> std::io::Result<()> {
        let file = std::fs::File::create(path)?;
        let mut out = BufWriter::new(file);
        writeln!(out, "time_iso,u,v,rx_mbps,tx_mbps,util")?;
        let state = self.inner.state.lock().expect("monitor state poisoned");
        for (edge, samples) in &state.series {
            let start = if max_points_per_edge > 0 && samples.len() > max_points_per_edge {
                samples.len() - max_points_per_edge
            } else {
                0
            };
            for s in &samples[start..] {
                let stamp = s
                    .at
                    .format(TIME_FORMAT)
                    .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"));
                writeln!(
                    out,
                    "{},{},{},{:.6},{:.6},{:.6}",
                    stamp, edge.u, edge.v, s.rate.rx_mbps, s.rate.tx_mbps, s.rate.util
                )?;
            }
        }
        out.flush()
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// One full sampling round: poll the facade, translate to edge counters, ingest.
fn sample(inner: &Inner) -> Vec<(EdgeKey, LinkRate)> {
    let by_port = inner.ctl.poll_port_stats();
    let counters = inner.edge_counters(&by_port);
    inner.ingest(&counters)
}

#[cfg(test)]
mod test {
    use super::*;

    /// Shorthand for a counter pair.
    fn counters(rx_bytes: u64, tx_bytes: u64) -> PortCounters {
        PortCounters { rx_bytes, tx_bytes }
    }

    /// A monitor decoupled from any live controller, with a fixed capacity per edge.
    fn offline_monitor(cap_mbps: f64) -> Monitor {
        Monitor::new(
            Controller::new(),
            Vec::new,
            move |_| cap_mbps,
            DEFAULT_PERIOD,
        )
    }

    /// The edge all monitor tests sample.
    const E: EdgeKey = EdgeKey { u: 1, v: 2 };

    #[test]
    fn first_sample_yields_zero_rate() {
        let mon = offline_monitor(1000.0);
        let rates = mon.ingest(&BTreeMap::from([(E, counters(1_000_000, 1_000_000))]));
        assert_eq!(rates, vec![(E, LinkRate::default())]);
    }

    #[test]
    fn rates_follow_the_byte_delta() {
        let mon = offline_monitor(1000.0);
        mon.ingest(&BTreeMap::from([(E, counters(0, 0))]));
        std::thread::sleep(Duration::from_millis(50));
        let rates = mon.ingest(&BTreeMap::from([(E, counters(625_000, 0))]));
        let (_, rate) = rates[0];
        // 625 kB over ~50 ms is on the order of 100 Mbps; accept generous scheduling slack
        assert!(rate.rx_mbps > 10.0, "rx = {}", rate.rx_mbps);
        assert_eq!(rate.tx_mbps, 0.0);
        assert!(rate.util > 0.0 && rate.util <= 1.0);
    }

    #[test]
    fn counter_resets_clamp_to_zero() {
        let mon = offline_monitor(1000.0);
        mon.ingest(&BTreeMap::from([(E, counters(1_000_000, 1_000_000))]));
        std::thread::sleep(Duration::from_millis(20));
        let rates = mon.ingest(&BTreeMap::from([(E, counters(5, 7))]));
        let (_, rate) = rates[0];
        assert_eq!(rate.rx_mbps, 0.0);
        assert_eq!(rate.tx_mbps, 0.0);
        assert!(rate.rx_mbps >= 0.0 && rate.tx_mbps >= 0.0);
    }

    #[test]
    fn utilization_is_clamped_to_one() {
        let mon = offline_monitor(0.001);
        mon.ingest(&BTreeMap::from([(E, counters(0, 0))]));
        std::thread::sleep(Duration::from_millis(20));
        let rates = mon.ingest(&BTreeMap::from([(E, counters(10_000_000, 0))]));
        assert_eq!(rates[0].1.util, 1.0);
    }

    #[test]
    fn unknown_capacity_yields_zero_utilization() {
        let mon = offline_monitor(0.0);
        mon.ingest(&BTreeMap::from([(E, counters(0, 0))]));
        std::thread::sleep(Duration::from_millis(20));
        let rates = mon.ingest(&BTreeMap::from([(E, counters(10_000_000, 0))]));
        assert!(rates[0].1.rx_mbps > 0.0);
        assert_eq!(rates[0].1.util, 0.0);
    }

    #[test]
    fn series_grows_and_csv_truncates() {
        let mon = offline_monitor(1000.0);
        for i in 0..4u64 {
            mon.ingest(&BTreeMap::from([(E, counters(i * 1000, 0))]));
        }
        assert_eq!(mon.timeseries(&E).len(), 4);

        let path = std::env::temp_dir().join("greenflow-test-monitor.csv");
        mon.export_csv(&path, 2).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines[0], "time_iso,u,v,rx_mbps,tx_mbps,util");
        assert_eq!(lines.len(), 3); // header + last 2 points
        assert!(lines[1].starts_with(|c: char| c.is_ascii_digit()));
        assert!(lines[1].contains(",1,2,"));
        // six decimal places on the numeric fields
        assert!(lines[1].trim_end().ends_with(|c: char| c.is_ascii_digit()));
        let fields: Vec<&str> = lines[1].split(',').collect();
        assert_eq!(fields.len(), 6);
        assert_eq!(fields[3].split('.').nth(1).unwrap().len(), 6);
        // iso-8601 with trailing Z
        assert!(fields[0].ends_with('Z'));
    }
}
