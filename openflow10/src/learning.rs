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

//! Source-MAC learning. Each switch keeps a `MAC -> port` table fed by PACKET_IN events; known
//! destinations get a unidirectional exact-match rule installed, unknown destinations are
//! flooded. This makes the controller a functional L2 forwarder on the legacy part of the
//! network without any configuration.

use std::collections::HashMap;
use std::fmt;

/// An Ethernet address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddr(pub [u8; 6]);

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

/// What to do with a packet that arrived at the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Forward {
    /// The destination is known behind `out_port`: install an exact-match rule for
    /// `(in_port, dl_dst)` and let the switch forward the buffered packet.
    Install {
        /// Port the destination was learned on.
        out_port: u16,
        /// Destination address the rule matches on.
        dl_dst: MacAddr,
    },
    /// Destination unknown (or looping back to the ingress port): flood.
    Flood,
    /// The frame is too short to carry an Ethernet header; ignore it.
    Drop,
}

/// Per-switch learning table.
#[derive(Debug, Default)]
pub struct LearningTable {
    mac_to_port: HashMap<MacAddr, u16>,
}

impl LearningTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Learn the source of a frame and decide what to do with it. Frames shorter than the 14-byte
    /// Ethernet header are dropped without learning.
    pub fn observe(&mut self, frame: &[u8], in_port: u16) -> Forward {
        if frame.len() < 14 {
            return Forward::Drop;
        }
        let dst = MacAddr(frame[0..6].try_into().unwrap());
        let src = MacAddr(frame[6..12].try_into().unwrap());
        self.mac_to_port.insert(src, in_port);
        match self.mac_to_port.get(&dst) {
            Some(&out_port) if out_port != in_port => Forward::Install {
                out_port,
                dl_dst: dst,
            },
            _ => Forward::Flood,
        }
    }

    /// Port the given address was last seen on.
    pub fn lookup(&self, mac: MacAddr) -> Option<u16> {
        self.mac_to_port.get(&mac).copied()
    }

    /// Number of learned addresses.
    pub fn len(&self) -> usize {
        self.mac_to_port.len()
    }

    /// Whether the table has learned anything yet.
    pub fn is_empty(&self) -> bool {
        self.mac_to_port.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn frame(dst: [u8; 6], src: [u8; 6]) -> Vec<u8> {
        let mut f = Vec::new();
        f.extend_from_slice(&dst);
        f.extend_from_slice(&src);
        f.extend_from_slice(&[0x08, 0x00]);
        f.resize(60, 0);
        f
    }

    const A: [u8; 6] = [0xaa; 6];
    const B: [u8; 6] = [0xbb; 6];

    #[test]
    fn unknown_destination_floods_and_learns_source() {
        let mut t = LearningTable::new();
        assert_eq!(t.observe(&frame(B, A), 1), Forward::Flood);
        assert_eq!(t.lookup(MacAddr(A)), Some(1));
        assert_eq!(t.lookup(MacAddr(B)), None);
    }

    #[test]
    fn known_destination_installs_rule() {
        let mut t = LearningTable::new();
        t.observe(&frame(B, A), 1);
        assert_eq!(
            t.observe(&frame(A, B), 2),
            Forward::Install {
                out_port: 1,
                dl_dst: MacAddr(A),
            }
        );
    }

    #[test]
    fn destination_on_ingress_port_floods() {
        let mut t = LearningTable::new();
        t.observe(&frame(B, A), 1);
        // B sits behind the same port A talks from
        t.observe(&frame(A, B), 1);
        assert_eq!(t.observe(&frame(B, A), 1), Forward::Flood);
    }

    #[test]
    fn runt_frames_are_dropped() {
        let mut t = LearningTable::new();
        assert_eq!(t.observe(&[0u8; 13], 1), Forward::Drop);
        assert!(t.is_empty());
    }

    #[test]
    fn moving_host_updates_port() {
        let mut t = LearningTable::new();
        t.observe(&frame(B, A), 1);
        t.observe(&frame(B, A), 4);
        assert_eq!(t.lookup(MacAddr(A)), Some(4));
    }
}
