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

//! Session management: the TCP listener, the single I/O thread multiplexing all switch
//! connections, and the process-scoped switch table.
//!
//! The switch table is a deliberate singleton guarded by one mutex (there is one southbound
//! network per process); the [`crate::controller::Controller`] facade is a thin handle over it.
//! The I/O thread sweeps all nonblocking sockets on a coarse tick, reads complete messages out of
//! per-session receive buffers, and dispatches them. Any framing violation (wrong version,
//! length below the header size, EOF mid-message) or failed write closes the session and purges
//! its state; the switch has to reconnect to recover.
//!
//! Event hooks are fired *after* the session lock is released, so a hook may call back into the
//! facade freely.

use std::collections::{BTreeMap, HashMap};
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use lazy_static::lazy_static;
use log::{debug, info, trace, warn};

use crate::controller::{LldpEvent, PortCounters};
use crate::learning::{Forward, LearningTable};
use crate::wire::{
    self, FlowMod, FlowModCommand, Header, Match, Message, PacketOut, HEADER_LEN, OFPP_FLOOD,
    OFPP_NONE,
};
use crate::{lldp, Error, SwitchId};

/// Cookie stamped on rules installed by the L2 learner.
const LEARNER_COOKIE: u64 = 0x1;
/// Priority of learner rules.
const LEARNER_PRIORITY: u16 = 100;
/// Idle timeout of learner rules in seconds.
const LEARNER_IDLE_TIMEOUT: u16 = 30;
/// `buffer_id` value meaning "no buffered packet".
const NO_BUFFER: u32 = 0xffff_ffff;

/// One connected switch.
struct Session {
    stream: TcpStream,
    /// Dense index, assigned on the first FEATURES_REPLY.
    swid: Option<SwitchId>,
    /// Datapath id reported by the switch (0 until FEATURES_REPLY).
    dpid: u64,
    /// Bytes received but not yet consumed as a complete message.
    rxbuf: Vec<u8>,
    /// L2 learning table of this switch.
    macs: LearningTable,
    /// Last observed per-port byte counters.
    ports: BTreeMap<u16, PortCounters>,
}

impl Session {
    fn new(stream: TcpStream) -> Self {
        Session {
            stream,
            swid: None,
            dpid: 0,
            rxbuf: Vec::new(),
            macs: LearningTable::new(),
            ports: BTreeMap::new(),
        }
    }
}

/// Consumer-facing hooks. Populated once during initialization, cloned out of the lock before
/// being invoked.
#[derive(Default, Clone)]
pub(crate) struct Hooks {
    pub(crate) lldp: Option<Arc<dyn Fn(LldpEvent) + Send + Sync>>,
    pub(crate) switch_state: Option<Arc<dyn Fn(SwitchId, bool) + Send + Sync>>,
    pub(crate) stats: Option<Arc<dyn Fn(SwitchId) + Send + Sync>>,
}

/// The process-scoped session table.
pub(crate) struct Shared {
    /// All live sessions, keyed by an internal token.
    sessions: HashMap<usize, Session>,
    /// Map from switch index to session token.
    index: BTreeMap<SwitchId, usize>,
    /// High-water index allocator; indices are never reused within a run.
    next_swid: SwitchId,
    next_token: usize,
    pub(crate) hooks: Hooks,
}

impl Shared {
    fn new() -> Self {
        Shared {
            sessions: HashMap::new(),
            index: BTreeMap::new(),
            next_swid: 1,
            next_token: 0,
            hooks: Hooks::default(),
        }
    }
}

lazy_static! {
    static ref SHARED: Mutex<Shared> = Mutex::new(Shared::new());
    static ref IO_THREAD: Mutex<Option<JoinHandle<()>>> = Mutex::new(None);
}

static RUNNING: AtomicBool = AtomicBool::new(false);
/// LLDP broadcast period of the I/O loop, milliseconds.
static LLDP_PERIOD_MS: AtomicU64 = AtomicU64::new(2000);
/// Port-stats request period of the I/O loop, milliseconds.
static STATS_PERIOD_MS: AtomicU64 = AtomicU64::new(3000);

/// Sweep tick of the I/O thread.
const TICK: Duration = Duration::from_millis(20);

/// Events collected under the lock and fired after it is released.
enum Event {
    Lldp(LldpEvent),
    SwitchState(SwitchId, bool),
    Stats(SwitchId),
}

/// Lock the shared session table.
pub(crate) fn lock() -> std::sync::MutexGuard<'static, Shared> {
    SHARED.lock().expect("session state poisoned")
}

pub(crate) fn set_lldp_period(p: Duration) {
    LLDP_PERIOD_MS.store(p.as_millis() as u64, Ordering::Relaxed);
}

pub(crate) fn set_stats_period(p: Duration) {
    STATS_PERIOD_MS.store(p.as_millis() as u64, Ordering::Relaxed);
}

/// Start the listener and the I/O thread. Idempotent; returns an error only if binding fails.
pub(crate) fn start(port: u16) -> Result<(), Error> {
    if RUNNING.swap(true, Ordering::SeqCst) {
        return Ok(());
    }
    let listener = match TcpListener::bind(("0.0.0.0", port)) {
        Ok(l) => l,
        Err(e) => {
            RUNNING.store(false, Ordering::SeqCst);
            return Err(Error::Io(e));
        }
    };
    listener.set_nonblocking(true)?;
    info!("OpenFlow controller listening on port {}", port);
    let handle = std::thread::Builder::new()
        .name("of-io".into())
        .spawn(move || io_loop(listener))
        .map_err(Error::Io)?;
    *IO_THREAD.lock().expect("io thread handle poisoned") = Some(handle);
    Ok(())
}

/// Stop the I/O thread, close the listener and drop all sessions. Idempotent.
pub(crate) fn stop() {
    if !RUNNING.swap(false, Ordering::SeqCst) {
        return;
    }
    let handle = IO_THREAD.lock().expect("io thread handle poisoned").take();
    if let Some(h) = handle {
        let _ = h.join();
    }
    let mut shared = lock();
    let n = shared.sessions.len();
    shared.sessions.clear();
    shared.index.clear();
    if n > 0 {
        info!("dropped {} switch session(s) on shutdown", n);
    }
}

/// The I/O loop: accept new switches, pump every socket, run the two periodic timers.
fn io_loop(listener: TcpListener) {
    let mut last_lldp = Instant::now();
    let mut last_stats = Instant::now();
    while RUNNING.load(Ordering::SeqCst) {
        let mut events = Vec::new();
        {
            let mut shared = lock();
            accept_pending(&mut shared, &listener);
            pump_sessions(&mut shared, &mut events);
            let lldp_due = last_lldp.elapsed() >= Duration::from_millis(LLDP_PERIOD_MS.load(Ordering::Relaxed));
            if lldp_due {
                broadcast_lldp(&mut shared, &mut events);
                last_lldp = Instant::now();
            }
            let stats_due =
                last_stats.elapsed() >= Duration::from_millis(STATS_PERIOD_MS.load(Ordering::Relaxed));
            if stats_due {
                broadcast_stats_request(&mut shared, &mut events);
                last_stats = Instant::now();
            }
        }
        fire(events);
        std::thread::sleep(TICK);
    }
}

/// Accept all pending connections and start their handshake.
fn accept_pending(shared: &mut Shared, listener: &TcpListener) {
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                if stream.set_nonblocking(true).is_err() || stream.set_nodelay(true).is_err() {
                    continue;
                }
                debug!("switch connected from {}", peer);
                let mut sess = Session::new(stream);
                // HELLO, FEATURES_REQUEST, and an early SET_CONFIG; the config is repeated
                // after FEATURES_REPLY for switches that ignore it before the handshake.
                let ok = write_msg(&mut sess, &Message::Hello)
                    && write_msg(&mut sess, &Message::FeaturesRequest)
                    && write_msg(&mut sess, &set_config());
                if ok {
                    let token = shared.next_token;
                    shared.next_token += 1;
                    shared.sessions.insert(token, sess);
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => break,
            Err(e) => {
                warn!("accept failed: {}", e);
                break;
            }
        }
    }
}

fn set_config() -> Message {
    Message::SetConfig {
        flags: 0,
        miss_send_len: 0xffff,
    }
}

/// Read whatever each socket has to offer and dispatch every complete message.
fn pump_sessions(shared: &mut Shared, events: &mut Vec<Event>) {
    let tokens: Vec<usize> = shared.sessions.keys().copied().collect();
    for token in tokens {
        let mut dead = false;
        if let Some(sess) = shared.sessions.get_mut(&token) {
            let mut buf = [0u8; 4096];
            loop {
                match sess.stream.read(&mut buf) {
                    Ok(0) => {
                        dead = true;
                        break;
                    }
                    Ok(n) => sess.rxbuf.extend_from_slice(&buf[..n]),
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => {
                        debug!("read error: {}", e);
                        dead = true;
                        break;
                    }
                }
            }
        }
        while !dead {
            match take_frame(shared, token) {
                Ok(Some((header, body))) => {
                    if dispatch(shared, token, &header, &body, events).is_err() {
                        dead = true;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!("framing violation: {}", e);
                    dead = true;
                }
            }
        }
        if dead {
            close(shared, token, events);
        }
    }
}

/// Extract one complete message from the session's receive buffer, if available.
fn take_frame(shared: &mut Shared, token: usize) -> Result<Option<(Header, Vec<u8>)>, Error> {
    let sess = match shared.sessions.get_mut(&token) {
        Some(s) => s,
        None => return Ok(None),
    };
    if sess.rxbuf.len() < HEADER_LEN {
        return Ok(None);
    }
    let mut raw = [0u8; HEADER_LEN];
    raw.copy_from_slice(&sess.rxbuf[..HEADER_LEN]);
    let header = Header::parse(raw)?;
    let total = header.length as usize;
    if sess.rxbuf.len() < total {
        return Ok(None);
    }
    let body = sess.rxbuf[HEADER_LEN..total].to_vec();
    sess.rxbuf.drain(..total);
    Ok(Some((header, body)))
}

/// Handle one message. An `Err` means the session must be closed.
fn dispatch(
    shared: &mut Shared,
    token: usize,
    header: &Header,
    body: &[u8],
    events: &mut Vec<Event>,
) -> Result<(), Error> {
    let msg = match Message::parse(header, body) {
        Ok(Some(msg)) => msg,
        // valid but unconsumed type: ignore
        Ok(None) => return Ok(()),
        // anything else (unknown type octet, truncated body) is a protocol violation
        Err(e) => return Err(e),
    };
    match msg {
        Message::Hello => {}
        Message::EchoRequest(payload) => {
            // echo back both the payload and the xid
            let reply = Message::EchoReply(payload).marshal(header.xid);
            send_or_close(shared, token, &reply)?;
        }
        Message::FeaturesReply(features) => on_features_reply(shared, token, features, events)?,
        Message::PacketIn(pi) => on_packet_in(shared, token, pi, events)?,
        Message::PortStatsReply(stats) => {
            if let Some(sess) = shared.sessions.get_mut(&token) {
                for s in stats {
                    sess.ports.insert(
                        s.port_no,
                        PortCounters {
                            rx_bytes: s.rx_bytes,
                            tx_bytes: s.tx_bytes,
                        },
                    );
                }
                if let Some(swid) = sess.swid {
                    events.push(Event::Stats(swid));
                }
            }
        }
        // messages only a controller sends; a switch must not originate them
        Message::FeaturesRequest
        | Message::GetConfigRequest
        | Message::SetConfig { .. }
        | Message::PacketOut(_)
        | Message::FlowMod(_)
        | Message::PortMod(_)
        | Message::PortStatsRequest { .. }
        | Message::BarrierRequest
        | Message::EchoReply(_) => trace!("ignoring {:?} from switch", header.msg_type),
    }
    Ok(())
}

/// Register the switch on its first FEATURES_REPLY and finish the handshake.
fn on_features_reply(
    shared: &mut Shared,
    token: usize,
    features: wire::SwitchFeatures,
    events: &mut Vec<Event>,
) -> Result<(), Error> {
    let registered = match shared.sessions.get_mut(&token) {
        Some(sess) => {
            sess.dpid = features.datapath_id;
            sess.swid
        }
        None => return Ok(()),
    };
    let swid = match registered {
        Some(swid) => swid,
        None => {
            let swid = shared.next_swid;
            shared.next_swid += 1;
            shared.index.insert(swid, token);
            if let Some(sess) = shared.sessions.get_mut(&token) {
                sess.swid = Some(swid);
            }
            info!(
                "switch {} registered (dpid {:#018x})",
                swid, features.datapath_id
            );
            events.push(Event::SwitchState(swid, true));
            swid
        }
    };
    // repeat the config now that the handshake is done, and read it back
    send_or_close(shared, token, &set_config().marshal(wire::next_xid()))?;
    send_or_close(
        shared,
        token,
        &Message::GetConfigRequest.marshal(wire::next_xid()),
    )?;
    trace!("handshake complete for switch {}", swid);
    Ok(())
}

/// PACKET_IN: either an LLDP observation for the topology layer, or a frame for the L2 learner.
fn on_packet_in(
    shared: &mut Shared,
    token: usize,
    pi: wire::PacketIn,
    events: &mut Vec<Event>,
) -> Result<(), Error> {
    if (pi.total_len as usize) < 14 {
        return Ok(());
    }
    if lldp::is_lldp(&pi.data) {
        let neighbor = match lldp::parse(&pi.data) {
            Some(n) => n,
            None => return Ok(()),
        };
        let dst_swid = shared.sessions.get(&token).and_then(|s| s.swid);
        let src_swid = shared
            .sessions
            .values()
            .find(|s| s.swid.is_some() && s.dpid == neighbor.datapath_id)
            .and_then(|s| s.swid);
        if let (Some(src_swid), Some(dst_swid)) = (src_swid, dst_swid) {
            events.push(Event::Lldp(LldpEvent {
                src_swid,
                src_port: neighbor.port_no,
                dst_swid,
                dst_port: pi.in_port,
            }));
        }
        return Ok(());
    }
    let decision = match shared.sessions.get_mut(&token) {
        Some(sess) => sess.macs.observe(&pi.data, pi.in_port),
        None => return Ok(()),
    };
    match decision {
        Forward::Install { out_port, dl_dst } => {
            // install the rule with the packet-in's buffer id so the switch forwards the
            // triggering packet itself, and fence it with a barrier
            let fm = Message::FlowMod(FlowMod {
                m: Match::ethernet(pi.in_port, dl_dst.0),
                cookie: LEARNER_COOKIE,
                command: FlowModCommand::Add,
                idle_timeout: LEARNER_IDLE_TIMEOUT,
                hard_timeout: 0,
                priority: LEARNER_PRIORITY,
                buffer_id: pi.buffer_id,
                out_port: OFPP_NONE,
                flags: 0,
                actions: vec![wire::Action::Output { port: out_port }],
            });
            send_or_close(shared, token, &fm.marshal(wire::next_xid()))?;
            send_or_close(
                shared,
                token,
                &Message::BarrierRequest.marshal(wire::next_xid()),
            )?;
        }
        Forward::Flood => {
            // an unbuffered packet-in must carry the frame back out; a buffered one must not
            let data = if pi.buffer_id == NO_BUFFER {
                pi.data.clone()
            } else {
                Vec::new()
            };
            let po = Message::PacketOut(PacketOut {
                buffer_id: pi.buffer_id,
                in_port: pi.in_port,
                actions: vec![wire::Action::Output { port: OFPP_FLOOD }],
                data,
            });
            send_or_close(shared, token, &po.marshal(wire::next_xid()))?;
        }
        Forward::Drop => {}
    }
    Ok(())
}

/// Send raw bytes and convert a failed write into a session-fatal error.
fn send_or_close(shared: &mut Shared, token: usize, bytes: &[u8]) -> Result<(), Error> {
    if send_raw(shared, token, bytes) {
        Ok(())
    } else {
        Err(Error::Io(std::io::Error::from(ErrorKind::BrokenPipe)))
    }
}

/// Inject an LLDP frame on every known port of every registered switch.
fn broadcast_lldp(shared: &mut Shared, events: &mut Vec<Event>) {
    let targets: Vec<(usize, u64, Vec<u16>)> = shared
        .sessions
        .iter()
        .filter(|(_, s)| s.swid.is_some())
        .map(|(tok, s)| (*tok, s.dpid, s.ports.keys().copied().collect()))
        .collect();
    for (token, dpid, ports) in targets {
        for port in ports {
            let frame = lldp::build(dpid, port);
            let po = Message::PacketOut(PacketOut {
                buffer_id: NO_BUFFER,
                in_port: OFPP_NONE,
                actions: vec![wire::Action::Output { port }],
                data: frame,
            });
            if !send_raw(shared, token, &po.marshal(wire::next_xid())) {
                close(shared, token, events);
                break;
            }
        }
    }
}

/// Ask every switch for all its port counters.
fn broadcast_stats_request(shared: &mut Shared, events: &mut Vec<Event>) {
    let tokens: Vec<usize> = shared.sessions.keys().copied().collect();
    for token in tokens {
        let req = Message::PortStatsRequest { port_no: 0xffff }.marshal(wire::next_xid());
        if !send_raw(shared, token, &req) {
            close(shared, token, events);
        }
    }
}

/// Write one framed message to a session. Returns `false` on failure; the caller decides whether
/// to close. A `WouldBlock` counts as failure: outbound data is never buffered in the controller.
fn write_msg(sess: &mut Session, msg: &Message) -> bool {
    write_all(sess, &msg.marshal(wire::next_xid()))
}

fn write_all(sess: &mut Session, bytes: &[u8]) -> bool {
    let mut off = 0;
    while off < bytes.len() {
        match sess.stream.write(&bytes[off..]) {
            Ok(0) => return false,
            Ok(n) => off += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!("write error: {}", e);
                return false;
            }
        }
    }
    true
}

/// Send raw bytes to the session behind `token`. Returns `false` if the session is gone or the
/// write failed.
fn send_raw(shared: &mut Shared, token: usize, bytes: &[u8]) -> bool {
    match shared.sessions.get_mut(&token) {
        Some(sess) => write_all(sess, bytes),
        None => false,
    }
}

/// Drop a session and purge its index entry. The switch index is not reused.
fn close(shared: &mut Shared, token: usize, events: &mut Vec<Event>) {
    if let Some(sess) = shared.sessions.remove(&token) {
        if let Some(swid) = sess.swid {
            shared.index.remove(&swid);
            info!("switch {} disconnected", swid);
            events.push(Event::SwitchState(swid, false));
        } else {
            debug!("unregistered session closed");
        }
    }
}

/// Fire collected events without holding the session lock.
fn fire(events: Vec<Event>) {
    if events.is_empty() {
        return;
    }
    let hooks = lock().hooks.clone();
    for ev in events {
        match ev {
            Event::Lldp(e) => {
                if let Some(cb) = &hooks.lldp {
                    cb(e);
                }
            }
            Event::SwitchState(swid, up) => {
                if let Some(cb) = &hooks.switch_state {
                    cb(swid, up);
                }
            }
            Event::Stats(swid) => {
                if let Some(cb) = &hooks.stats {
                    cb(swid);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------------------------
// helpers for the facade
// ---------------------------------------------------------------------------------------------

/// Send a batch of pre-framed messages to one switch, in order, without releasing the lock in
/// between (this is what keeps a BARRIER glued to the command it fences). Unknown switches are a
/// silent no-op. Fires the switch-down hook itself if the write kills the session.
pub(crate) fn send_to_switch(swid: SwitchId, frames: &[Vec<u8>]) {
    let mut events = Vec::new();
    {
        let mut shared = lock();
        let token = match shared.index.get(&swid) {
            Some(t) => *t,
            None => return,
        };
        for frame in frames {
            if !send_raw(&mut shared, token, frame) {
                close(&mut shared, token, &mut events);
                break;
            }
        }
    }
    fire(events);
}

/// Send one pre-framed message to every registered switch.
pub(crate) fn send_to_all(frame_for: impl Fn() -> Vec<u8>) {
    let mut events = Vec::new();
    {
        let mut shared = lock();
        let swids: Vec<SwitchId> = shared.index.keys().copied().collect();
        for swid in swids {
            let token = match shared.index.get(&swid) {
                Some(t) => *t,
                None => continue,
            };
            if !send_raw(&mut shared, token, &frame_for()) {
                close(&mut shared, token, &mut events);
            }
        }
    }
    fire(events);
}

/// Run a closure over the session of one switch.
pub(crate) fn with_switch<R>(swid: SwitchId, f: impl FnOnce(&SessionView<'_>) -> R) -> Option<R> {
    let shared = lock();
    let token = *shared.index.get(&swid)?;
    let sess = shared.sessions.get(&token)?;
    Some(f(&SessionView { swid, sess }))
}

/// Run a closure over every registered session, in switch-index order.
pub(crate) fn for_each_switch(mut f: impl FnMut(&SessionView<'_>)) {
    let shared = lock();
    for (&swid, token) in shared.index.iter() {
        if let Some(sess) = shared.sessions.get(token) {
            f(&SessionView { swid, sess });
        }
    }
}

/// Read-only view over one registered session, handed to facade closures.
pub(crate) struct SessionView<'a> {
    swid: SwitchId,
    sess: &'a Session,
}

impl SessionView<'_> {
    /// The switch index.
    pub(crate) fn swid(&self) -> SwitchId {
        self.swid
    }

    /// The datapath id.
    pub(crate) fn dpid(&self) -> u64 {
        self.sess.dpid
    }

    /// Port numbers known from statistics replies, ascending.
    pub(crate) fn ports(&self) -> Vec<u16> {
        self.sess.ports.keys().copied().collect()
    }

    /// Last observed counters per port.
    pub(crate) fn counters(&self) -> BTreeMap<u16, PortCounters> {
        self.sess.ports.clone()
    }
}
