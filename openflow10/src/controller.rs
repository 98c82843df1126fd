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

//! The controller facade: the stable, thread-safe surface through which applications observe the
//! switch inventory and drive the data plane.
//!
//! All methods operate on the process-scoped session table of [`crate::session`]; the
//! [`Controller`] value itself is an empty handle and can be copied freely into background
//! threads. Commands addressed to a switch index that is not currently connected are silent
//! no-ops: switch departure is asynchronous, and racing against it is expected.
//!
//! Every FLOW_MOD and PORT_MOD sent through this facade is immediately followed by a
//! BARRIER_REQUEST on the same session, so a subsequent command to the same switch is ordered
//! after the previous one took effect.

use std::collections::BTreeMap;
use std::time::Duration;

use log::warn;

use crate::session;
use crate::wire::{
    self, advertise_for_speed, Action, FlowMod, FlowModCommand, Match, Message, PacketOut,
    OFPPC_PORT_DOWN, OFPP_NONE,
};
use crate::{lldp, Error, SwitchId};

/// How long [`Controller::poll_port_stats`] waits for replies to trickle in.
const POLL_ALL_WAIT: Duration = Duration::from_millis(150);
/// How long [`Controller::poll_port_stats_of`] waits for one switch.
const POLL_ONE_WAIT: Duration = Duration::from_millis(120);

/// Last observed byte counters of one port, host byte order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortCounters {
    /// Received bytes since the port came up.
    pub rx_bytes: u64,
    /// Transmitted bytes since the port came up.
    pub tx_bytes: u64,
}

/// Per-port state as reported by [`Controller::switch_info`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortInfo {
    /// Port number.
    pub port_no: u16,
    /// Administrative state as believed by the controller.
    pub up: bool,
    /// Last observed counters.
    pub last: PortCounters,
}

/// Inventory entry for one connected switch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchInfo {
    /// Dense switch index.
    pub swid: SwitchId,
    /// Datapath id from FEATURES_REPLY.
    pub dpid: u64,
    /// Whether the session is currently up (always true for entries returned).
    pub connected: bool,
    /// Ports known from statistics replies.
    pub ports: BTreeMap<u16, PortInfo>,
}

/// A confirmed neighbor observation: the frame injected on `(src_swid, src_port)` arrived on
/// `(dst_swid, dst_port)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LldpEvent {
    /// Switch that emitted the frame.
    pub src_swid: SwitchId,
    /// Port the frame was emitted on.
    pub src_port: u16,
    /// Switch that observed the frame.
    pub dst_swid: SwitchId,
    /// Port the frame was observed on.
    pub dst_port: u16,
}

/// Handle over the process-scoped OpenFlow controller.
#[derive(Debug, Clone, Copy, Default)]
pub struct Controller;

impl Controller {
    /// Create a facade handle. The underlying state is process-scoped: all handles are equal.
    pub fn new() -> Self {
        Controller
    }

    /// Start the listener and the I/O thread on the given TCP port. Idempotent.
    pub fn start(&self, port: u16) -> Result<(), Error> {
        session::start(port)
    }

    /// Stop the I/O thread and drop all switch sessions. Idempotent.
    pub fn stop(&self) {
        session::stop()
    }

    /// Indices of all currently registered switches, ascending.
    pub fn switch_ids(&self) -> Vec<SwitchId> {
        let mut ids = Vec::new();
        session::for_each_switch(|s| ids.push(s.swid()));
        ids
    }

    /// Inventory snapshot of one switch, or `None` if it is not connected.
    pub fn switch_info(&self, swid: SwitchId) -> Option<SwitchInfo> {
        session::with_switch(swid, |s| SwitchInfo {
            swid,
            dpid: s.dpid(),
            connected: true,
            ports: s
                .counters()
                .into_iter()
                .map(|(port_no, last)| {
                    (
                        port_no,
                        PortInfo {
                            port_no,
                            up: true,
                            last,
                        },
                    )
                })
                .collect(),
        })
    }

    /// Port numbers of one switch, ascending. Empty if the switch is unknown.
    pub fn ports_of(&self, swid: SwitchId) -> Vec<u16> {
        session::with_switch(swid, |s| s.ports()).unwrap_or_default()
    }

    /// Push a full Ethernet frame out of the given port. Frames shorter than an Ethernet header
    /// are ignored.
    pub fn packet_out(&self, swid: SwitchId, port: u16, frame: &[u8]) {
        if frame.len() < 14 {
            return;
        }
        let msg = Message::PacketOut(PacketOut {
            buffer_id: 0xffff_ffff,
            in_port: OFPP_NONE,
            actions: vec![Action::Output { port }],
            data: frame.to_vec(),
        });
        session::send_to_switch(swid, &[msg.marshal(wire::next_xid())]);
    }

    /// Inject one LLDP discovery frame on the given switch port.
    pub fn send_lldp(&self, swid: SwitchId, port: u16) {
        let dpid = match session::with_switch(swid, |s| s.dpid()) {
            Some(d) => d,
            None => return,
        };
        self.packet_out(swid, port, &lldp::build(dpid, port));
    }

    /// Install (or strictly remove) a flow rule, fenced by a barrier.
    #[allow(clippy::too_many_arguments)]
    pub fn flow_mod(
        &self,
        swid: SwitchId,
        m: Match,
        actions: Vec<Action>,
        priority: u16,
        add: bool,
        idle_timeout: u16,
        hard_timeout: u16,
        cookie: u64,
    ) {
        let msg = Message::FlowMod(FlowMod {
            m,
            cookie,
            command: if add {
                FlowModCommand::Add
            } else {
                FlowModCommand::DeleteStrict
            },
            idle_timeout,
            hard_timeout,
            priority,
            buffer_id: 0xffff_ffff,
            out_port: OFPP_NONE,
            flags: 0,
            actions: if add { actions } else { Vec::new() },
        });
        session::send_to_switch(
            swid,
            &[
                msg.marshal(wire::next_xid()),
                Message::BarrierRequest.marshal(wire::next_xid()),
            ],
        );
    }

    /// Set the administrative state of a port, advertising the feature bit matching
    /// `speed_mbps`. Fenced by a barrier.
    pub fn port_mod(&self, swid: SwitchId, port: u16, up: bool, speed_mbps: u32) {
        let msg = Message::PortMod(wire::PortMod {
            port_no: port,
            hw_addr: [0; 6],
            config: if up { 0 } else { OFPPC_PORT_DOWN },
            mask: OFPPC_PORT_DOWN,
            advertise: advertise_for_speed(speed_mbps),
        });
        session::send_to_switch(
            swid,
            &[
                msg.marshal(wire::next_xid()),
                Message::BarrierRequest.marshal(wire::next_xid()),
            ],
        );
    }

    /// Send a bare ordering checkpoint to one switch.
    pub fn barrier(&self, swid: SwitchId) {
        session::send_to_switch(swid, &[Message::BarrierRequest.marshal(wire::next_xid())]);
    }

    /// Request fresh port counters from every switch, wait a short bounded interval for replies,
    /// and return the last-seen counters keyed by `(swid, port)`.
    pub fn poll_port_stats(&self) -> BTreeMap<(SwitchId, u16), PortCounters> {
        session::send_to_all(|| {
            Message::PortStatsRequest { port_no: 0xffff }.marshal(wire::next_xid())
        });
        std::thread::sleep(POLL_ALL_WAIT);
        let mut out = BTreeMap::new();
        session::for_each_switch(|s| {
            for (port, counters) in s.counters() {
                out.insert((s.swid(), port), counters);
            }
        });
        out
    }

    /// Like [`Controller::poll_port_stats`], but for a single switch, keyed by port.
    pub fn poll_port_stats_of(&self, swid: SwitchId) -> BTreeMap<u16, PortCounters> {
        session::send_to_switch(
            swid,
            &[Message::PortStatsRequest { port_no: 0xffff }.marshal(wire::next_xid())],
        );
        std::thread::sleep(POLL_ONE_WAIT);
        session::with_switch(swid, |s| s.counters()).unwrap_or_default()
    }

    /// Change the period of the I/O loop's own LLDP broadcast.
    pub fn set_lldp_period(&self, period: Duration) {
        session::set_lldp_period(period);
    }

    /// Change the period of the periodic port-stats request.
    pub fn set_stats_period(&self, period: Duration) {
        session::set_stats_period(period);
    }

    /// Register the LLDP observation hook. Single-assignment: a second registration is ignored.
    pub fn on_lldp(&self, cb: impl Fn(LldpEvent) + Send + Sync + 'static) {
        let mut shared = session::lock();
        if shared.hooks.lldp.is_none() {
            shared.hooks.lldp = Some(std::sync::Arc::new(cb));
        } else {
            warn!("LLDP hook already registered; ignoring");
        }
    }

    /// Register the switch up/down hook. Single-assignment.
    pub fn on_switch_state(&self, cb: impl Fn(SwitchId, bool) + Send + Sync + 'static) {
        let mut shared = session::lock();
        if shared.hooks.switch_state.is_none() {
            shared.hooks.switch_state = Some(std::sync::Arc::new(cb));
        } else {
            warn!("switch-state hook already registered; ignoring");
        }
    }

    /// Register the stats-reply hook (fired after a switch refreshed its counters).
    /// Single-assignment.
    pub fn on_stats_reply(&self, cb: impl Fn(SwitchId) + Send + Sync + 'static) {
        let mut shared = session::lock();
        if shared.hooks.stats.is_none() {
            shared.hooks.stats = Some(std::sync::Arc::new(cb));
        } else {
            warn!("stats hook already registered; ignoring");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::wire::{Header, MsgType, PortStats, SwitchFeatures, HEADER_LEN, OFPP_FLOOD};
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::sync::{Arc, Mutex};
    use std::time::Instant;

    const PORT: u16 = 16653;

    /// A scripted switch on the other end of the controller's TCP session.
    struct FakeSwitch {
        stream: TcpStream,
    }

    impl FakeSwitch {
        fn connect() -> Self {
            let deadline = Instant::now() + Duration::from_secs(2);
            loop {
                match TcpStream::connect(("127.0.0.1", PORT)) {
                    Ok(stream) => {
                        stream
                            .set_read_timeout(Some(Duration::from_secs(2)))
                            .unwrap();
                        return FakeSwitch { stream };
                    }
                    Err(_) if Instant::now() < deadline => {
                        std::thread::sleep(Duration::from_millis(10))
                    }
                    Err(e) => panic!("cannot reach controller: {e}"),
                }
            }
        }

        fn send(&mut self, msg: &Message) {
            self.stream.write_all(&msg.marshal(wire::next_xid())).unwrap();
        }

        fn read_msg(&mut self) -> (Header, Option<Message>) {
            let mut raw = [0u8; HEADER_LEN];
            self.stream.read_exact(&mut raw).unwrap();
            let header = Header::parse(raw).unwrap();
            let mut body = vec![0u8; header.body_len()];
            self.stream.read_exact(&mut body).unwrap();
            let msg = Message::parse(&header, &body).unwrap();
            (header, msg)
        }

        /// Read messages until one of the given type arrives.
        fn expect(&mut self, typ: MsgType) -> Message {
            for _ in 0..32 {
                let (header, msg) = self.read_msg();
                if header.msg_type == typ as u8 {
                    return msg.unwrap();
                }
            }
            panic!("never received {typ:?}");
        }
    }

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(3);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    fn ethernet_frame(dst: [u8; 6], src: [u8; 6]) -> Vec<u8> {
        let mut f = Vec::new();
        f.extend_from_slice(&dst);
        f.extend_from_slice(&src);
        f.extend_from_slice(&[0x08, 0x00]);
        f.resize(60, 0);
        f
    }

    fn features(dpid: u64) -> Message {
        Message::FeaturesReply(SwitchFeatures {
            datapath_id: dpid,
            n_buffers: 256,
            n_tables: 1,
            capabilities: 0,
            actions: 0,
        })
    }

    /// One comprehensive lifecycle test. The session state is a process-wide singleton, so all
    /// session-level behavior is exercised from this single test function.
    #[test]
    fn session_lifecycle() {
        let ctl = Controller::new();
        let lldp_events: Arc<Mutex<Vec<LldpEvent>>> = Arc::default();
        let state_events: Arc<Mutex<Vec<(SwitchId, bool)>>> = Arc::default();
        {
            let lldp_events = lldp_events.clone();
            ctl.on_lldp(move |e| lldp_events.lock().unwrap().push(e));
        }
        {
            let state_events = state_events.clone();
            ctl.on_switch_state(move |swid, up| state_events.lock().unwrap().push((swid, up)));
        }
        // park the background timers so the scripted exchange below is the only traffic
        ctl.set_lldp_period(Duration::from_secs(3600));
        ctl.set_stats_period(Duration::from_secs(3600));
        ctl.start(PORT).unwrap();

        // -- handshake ----------------------------------------------------------------------
        let mut sw1 = FakeSwitch::connect();
        assert!(matches!(sw1.expect(MsgType::Hello), Message::Hello));
        sw1.expect(MsgType::FeaturesRequest);
        match sw1.expect(MsgType::SetConfig) {
            Message::SetConfig { miss_send_len, .. } => assert_eq!(miss_send_len, 0xffff),
            other => panic!("unexpected {other:?}"),
        }
        sw1.send(&features(0xa));
        // the handshake finishes with a repeated SET_CONFIG and a GET_CONFIG_REQUEST
        sw1.expect(MsgType::GetConfigRequest);
        wait_until(|| ctl.switch_ids() == vec![1]);
        assert_eq!(state_events.lock().unwrap().as_slice(), &[(1, true)]);

        // -- counters -----------------------------------------------------------------------
        sw1.send(&Message::PortStatsReply(vec![
            PortStats {
                port_no: 1,
                rx_bytes: 1000,
                tx_bytes: 500,
            },
            PortStats {
                port_no: 2,
                rx_bytes: 0,
                tx_bytes: 0,
            },
        ]));
        wait_until(|| ctl.ports_of(1) == vec![1, 2]);
        let info = ctl.switch_info(1).unwrap();
        assert_eq!(info.dpid, 0xa);
        assert_eq!(info.ports[&1].last.rx_bytes, 1000);
        assert!(ctl.switch_info(99).is_none());

        // -- second switch ------------------------------------------------------------------
        let mut sw2 = FakeSwitch::connect();
        sw2.expect(MsgType::FeaturesRequest);
        sw2.send(&features(0xb));
        wait_until(|| ctl.switch_ids() == vec![1, 2]);

        // -- LLDP: controller-built frame looped back through the other switch --------------
        ctl.send_lldp(1, 1);
        let lldp_frame = match sw1.expect(MsgType::PacketOut) {
            Message::PacketOut(po) => po.data,
            other => panic!("unexpected {other:?}"),
        };
        assert!(crate::lldp::is_lldp(&lldp_frame));
        sw2.send(&Message::PacketIn(wire::PacketIn {
            buffer_id: 0xffff_ffff,
            total_len: lldp_frame.len() as u16,
            in_port: 7,
            reason: 0,
            data: lldp_frame,
        }));
        wait_until(|| !lldp_events.lock().unwrap().is_empty());
        assert_eq!(
            lldp_events.lock().unwrap()[0],
            LldpEvent {
                src_swid: 1,
                src_port: 1,
                dst_swid: 2,
                dst_port: 7,
            }
        );

        // -- L2 learning --------------------------------------------------------------------
        const MAC_A: [u8; 6] = [0xaa; 6];
        const MAC_B: [u8; 6] = [0xbb; 6];
        // unknown destination: flooded with the same buffer id
        sw1.send(&Message::PacketIn(wire::PacketIn {
            buffer_id: 77,
            total_len: 60,
            in_port: 3,
            reason: 0,
            data: ethernet_frame(MAC_B, MAC_A),
        }));
        match sw1.expect(MsgType::PacketOut) {
            Message::PacketOut(po) => {
                assert_eq!(po.buffer_id, 77);
                assert_eq!(po.actions, vec![Action::Output { port: OFPP_FLOOD }]);
            }
            other => panic!("unexpected {other:?}"),
        }
        // reverse direction: the learned destination gets an exact-match rule + barrier
        sw1.send(&Message::PacketIn(wire::PacketIn {
            buffer_id: 78,
            total_len: 60,
            in_port: 4,
            reason: 0,
            data: ethernet_frame(MAC_A, MAC_B),
        }));
        match sw1.expect(MsgType::FlowMod) {
            Message::FlowMod(fm) => {
                assert_eq!(fm.m.in_port, 4);
                assert_eq!(fm.m.dl_dst, MAC_A);
                assert_eq!(fm.priority, 100);
                assert_eq!(fm.idle_timeout, 30);
                assert_eq!(fm.buffer_id, 78);
                assert_eq!(fm.actions, vec![Action::Output { port: 3 }]);
            }
            other => panic!("unexpected {other:?}"),
        }
        sw1.expect(MsgType::BarrierRequest);

        // -- port admin control -------------------------------------------------------------
        ctl.port_mod(2, 7, false, 0);
        match sw2.expect(MsgType::PortMod) {
            Message::PortMod(pm) => {
                assert_eq!(pm.port_no, 7);
                assert_eq!(pm.config, OFPPC_PORT_DOWN);
                assert_eq!(pm.mask, OFPPC_PORT_DOWN);
            }
            other => panic!("unexpected {other:?}"),
        }
        sw2.expect(MsgType::BarrierRequest);

        // -- bounded stats poll -------------------------------------------------------------
        let counters = ctl.poll_port_stats();
        assert_eq!(
            counters.get(&(1, 1)),
            Some(&PortCounters {
                rx_bytes: 1000,
                tx_bytes: 500,
            })
        );

        // -- disconnect and index stability -------------------------------------------------
        drop(sw1);
        wait_until(|| ctl.switch_ids() == vec![2]);
        assert!(state_events.lock().unwrap().contains(&(1, false)));
        let mut sw3 = FakeSwitch::connect();
        sw3.expect(MsgType::FeaturesRequest);
        sw3.send(&features(0xc));
        // the reconnecting switch gets a fresh index; 1 is never reused
        wait_until(|| ctl.switch_ids() == vec![2, 3]);

        ctl.stop();
        ctl.stop(); // idempotent
    }
}
