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

//! # GreenFlow: joint flow routing and link sleeping for hybrid SDN networks
//!
//! GreenFlow is a traffic-engineering controller for networks where only a subset of the
//! switches is SDN-capable. It periodically decides which candidate path each active flow
//! traverses and which SDN-controlled links may be put to sleep, minimizing a weighted
//! combination of link-load cost and link-power cost, and enacts the decision over
//! OpenFlow 1.0.
//!
//! ## Structure
//!
//! - The southbound protocol stack (wire codec, session management, L2 learning, controller
//!   facade) lives in the separate [`openflow10`] crate.
//! - [`topology`] discovers links by injecting LLDP frames and observing where they reappear,
//!   maintaining a canonicalized, expiry-based live edge set.
//! - [`monitor`] polls port counters, computes wrap-safe rates and utilizations, and records
//!   per-edge time series.
//! - [`forecast`] predicts near-future per-link demand with a volatility-adaptive EWMA and
//!   derives the load/energy weight pair from the predicted peak.
//! - [`planner`] enumerates candidate paths and solves the joint path-selection /
//!   link-sleeping MILP with CBC.
//! - [`runtime`] is the application loop tying everything together: once per control period it
//!   forecasts, plans, and translates the plan into PORT_MOD (and optionally FLOW_MOD)
//!   commands.
//! - [`config`] loads the static graph description and the flow table; [`types`] holds the
//!   shared data model.

#![deny(
    missing_docs,
    clippy::missing_docs_in_private_items,
    missing_debug_implementations,
    rust_2018_idioms
)]

pub mod config;
pub mod forecast;
pub mod monitor;
pub mod planner;
pub mod runtime;
pub mod topology;
pub mod types;

#[cfg(test)]
mod test;

pub use runtime::{App, AppConfig};
pub use types::{EdgeKey, Flow, GraphCaps, PlanStatus, TePlan, Weights};
