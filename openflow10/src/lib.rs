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

#![deny(missing_docs, missing_debug_implementations)]

//! # OpenFlow 1.0 speaker
//!
//! This library implements the controller side of the OpenFlow 1.0 protocol, limited to the
//! message subset a traffic-engineering controller needs: session setup (HELLO, FEATURES,
//! SET_CONFIG), echo keepalive, PACKET_IN / PACKET_OUT, FLOW_MOD, PORT_MOD, port statistics and
//! BARRIER. It is structured as follows:
//!
//! - [`wire`] contains the byte-accurate message codec. Every multi-byte field is network byte
//!   order, and every message is framed by the common 8-byte [`wire::Header`].
//! - [`lldp`] builds and parses the minimal IEEE 802.1AB frames used for neighbor discovery.
//! - [`learning`] implements the source-MAC learning table that makes the controller a usable
//!   default L2 forwarder.
//! - [`session`] runs the TCP listener and the single I/O thread that multiplexes all switch
//!   connections. Its state is a deliberate process-wide singleton.
//! - [`controller`] is the facade through which applications observe switches and send commands.
//!
//! The intended use is to create a [`controller::Controller`], register the event hooks, and call
//! [`controller::Controller::start`]. All facade calls are thread-safe and may be issued from any
//! thread; commands towards a switch that is not (or no longer) connected are silent no-ops.

pub mod controller;
pub mod learning;
pub mod lldp;
pub mod session;
pub mod wire;

pub use controller::{Controller, LldpEvent, PortCounters, PortInfo, SwitchInfo};
pub use wire::{Action, FlowModCommand, Match, Message};

use thiserror::Error;

/// Identifier of a connected switch, assigned densely in registration order (starting at 1).
/// An identifier is never reused within one process run.
pub type SwitchId = u32;

/// Errors raised by the OpenFlow codec and session layer.
#[derive(Debug, Error)]
pub enum Error {
    /// The underlying socket operation failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// A message announced a protocol version other than 0x01.
    #[error("unsupported OpenFlow version {0:#04x}")]
    BadVersion(u8),
    /// A message announced a total length smaller than the fixed header.
    #[error("message length {0} is smaller than the OpenFlow header")]
    BadLength(u16),
    /// A message body was shorter than its fixed layout requires.
    #[error("truncated {0}: need {1} bytes, got {2}")]
    Truncated(&'static str, usize, usize),
    /// The message type octet is not a known OpenFlow 1.0 type.
    #[error("unknown message type {0}")]
    UnknownType(u8),
}
