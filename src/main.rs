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

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use greenflow::{App, AppConfig};

/// Run the GreenFlow hybrid-SDN traffic-engineering controller.
#[derive(Debug, Parser)]
struct Cli {
    /// TCP port the OpenFlow listener binds.
    #[clap(default_value_t = 6633)]
    port: u16,
    /// Static graph description (JSON).
    #[clap(long, default_value = "config/NSFNET.json")]
    graph: PathBuf,
    /// Flow table (CSV). A missing file falls back to built-in demo flows.
    #[clap(long, default_value = "config/flows.csv")]
    flows: PathBuf,
    /// Candidate paths enumerated per source/destination pair.
    #[clap(long, short = 'k', default_value_t = 3)]
    paths_per_pair: usize,
    /// Seconds between planning cycles.
    #[clap(long, default_value_t = 10)]
    period: u64,
    /// Per-cycle solver time budget in seconds (unlimited if absent).
    #[clap(long)]
    solver_budget: Option<u64>,
    /// Threshold in Mbps for the load/energy weight derivation (median link capacity if
    /// absent).
    #[clap(long)]
    threshold: Option<f64>,
    /// Also pin each flow's chosen path with IPv4 flow rules.
    #[clap(long)]
    pin_flows: bool,
    /// Export the collected utilization series to this CSV on shutdown.
    #[clap(long)]
    stats_csv: Option<PathBuf>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    pretty_env_logger::init_timed();
    let args = Cli::parse();

    let mut app = App::new(AppConfig {
        of_port: args.port,
        graph_path: args.graph,
        flows_path: args.flows,
        control_period: Duration::from_secs(args.period),
        k_paths: args.paths_per_pair,
        pin_flows: args.pin_flows,
        solver_budget: args.solver_budget.map(Duration::from_secs),
        threshold_mbps: args.threshold,
        stats_csv: args.stats_csv,
    })?;
    app.run()?;
    Ok(())
}
