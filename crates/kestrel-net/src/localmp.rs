//! In-process wireless MP bus.
//!
//! When netplay clones N consoles on one machine, their emulated radios
//! still have to talk to each other. This is the LAN bridge's little
//! sibling: same [`MpInterface`] semantics, no network, no staleness rule
//! (one process, one clock), per-instance queues under a single mutex.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use tracing::trace;

use kestrel_netproto::constants::{NETPLAY_MAX_PLAYERS, REPLY_SLOT_SIZE};
use kestrel_netproto::mp::MpKind;

use crate::console::{MpInterface, MpRecv};

const DEFAULT_RECV_TIMEOUT_MS: u32 = 25;

#[derive(Clone)]
struct LocalPacket {
    sender: u8,
    kind: MpKind,
    timestamp: u64,
    data: Bytes,
}

#[derive(Default)]
struct BusState {
    queues: [VecDeque<LocalPacket>; NETPLAY_MAX_PLAYERS],
}

/// Shared bus; one per netplay session.
pub struct LocalMpBus {
    state: Mutex<BusState>,
    cond: Condvar,
    /// Bit i set: instance i is between Begin and End.
    connected: AtomicU16,
    recv_timeout_ms: AtomicU32,
}

impl Default for LocalMpBus {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalMpBus {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BusState::default()),
            cond: Condvar::new(),
            connected: AtomicU16::new(0),
            recv_timeout_ms: AtomicU32::new(DEFAULT_RECV_TIMEOUT_MS),
        }
    }

    /// Instance `inst` entered the MP screen.
    pub fn begin(&self, inst: u8) {
        self.connected.fetch_or(1 << inst, Ordering::Relaxed);
    }

    /// Instance `inst` left the MP screen; its queue is flushed.
    pub fn end(&self, inst: u8) {
        self.connected.fetch_and(!(1 << inst), Ordering::Relaxed);
        self.state.lock().queues[inst as usize].clear();
        self.cond.notify_all();
    }

    pub fn connected_mask(&self) -> u16 {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn set_recv_timeout(&self, ms: u32) {
        self.recv_timeout_ms.store(ms, Ordering::Relaxed);
    }

    fn recv_timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.recv_timeout_ms.load(Ordering::Relaxed)))
    }

    /// A per-instance endpoint implementing [`MpInterface`].
    pub fn handle(self: &Arc<Self>, inst: u8) -> Arc<LocalMpHandle> {
        Arc::new(LocalMpHandle {
            bus: Arc::clone(self),
            inst,
        })
    }

    fn send(&self, sender: u8, kind: MpKind, timestamp: u64, data: &[u8]) -> usize {
        let connected = self.connected_mask();
        if connected & (1 << sender) == 0 {
            return 0;
        }
        let packet = LocalPacket {
            sender,
            kind,
            timestamp,
            data: Bytes::copy_from_slice(data),
        };
        let mut state = self.state.lock();
        for inst in 0..NETPLAY_MAX_PLAYERS as u8 {
            if inst == sender || connected & (1 << inst) == 0 {
                continue;
            }
            state.queues[inst as usize].push_back(packet.clone());
        }
        drop(state);
        self.cond.notify_all();
        data.len()
    }
}

/// One instance's view of the bus.
pub struct LocalMpHandle {
    bus: Arc<LocalMpBus>,
    inst: u8,
}

impl LocalMpHandle {
    fn pop_into(packet: LocalPacket, buf: &mut [u8]) -> MpRecv {
        let len = packet.data.len().min(buf.len());
        buf[..len].copy_from_slice(&packet.data[..len]);
        MpRecv {
            len,
            timestamp: packet.timestamp,
        }
    }
}

impl MpInterface for LocalMpHandle {
    fn send_packet(&self, data: &[u8], timestamp: u64) -> usize {
        self.bus.send(self.inst, MpKind::Frame, timestamp, data)
    }

    fn send_cmd(&self, data: &[u8], timestamp: u64) -> usize {
        self.bus.send(self.inst, MpKind::Cmd, timestamp, data)
    }

    fn send_reply(&self, data: &[u8], timestamp: u64, aid: u16) -> usize {
        self.bus
            .send(self.inst, MpKind::Reply { aid }, timestamp, data)
    }

    fn send_ack(&self, data: &[u8], timestamp: u64) -> usize {
        self.bus.send(self.inst, MpKind::Ack, timestamp, data)
    }

    fn recv_packet(&self, buf: &mut [u8]) -> Option<MpRecv> {
        let mut state = self.bus.state.lock();
        let packet = state.queues[self.inst as usize].pop_front()?;
        Some(Self::pop_into(packet, buf))
    }

    fn recv_host_packet(&self, buf: &mut [u8]) -> Option<MpRecv> {
        let deadline = Instant::now() + self.bus.recv_timeout();
        let mut state = self.bus.state.lock();
        loop {
            while let Some(packet) = state.queues[self.inst as usize].pop_front() {
                if packet.kind.is_cmd() {
                    return Some(Self::pop_into(packet, buf));
                }
                trace!(inst = self.inst, "non-cmd packet dropped while waiting for host");
            }
            if self.bus.cond.wait_until(&mut state, deadline).timed_out() {
                return None;
            }
        }
    }

    fn recv_replies(&self, buf: &mut [u8], timestamp: u64, aidmask: u16) -> u16 {
        let mut ret: u16 = 0;
        let mut replied: u16 = 1 << self.inst;
        let connmask = self.bus.connected_mask();
        if replied & connmask == connmask {
            return 0;
        }

        let deadline = Instant::now() + self.bus.recv_timeout();
        let mut state = self.bus.state.lock();
        loop {
            while let Some(packet) = state.queues[self.inst as usize].pop_front() {
                let MpKind::Reply { aid } = packet.kind else {
                    continue;
                };
                if packet.timestamp < timestamp.saturating_sub(1 << 20) {
                    continue;
                }
                if !packet.data.is_empty() && (1..16).contains(&aid) {
                    let slot = (aid as usize - 1) * REPLY_SLOT_SIZE;
                    let len = packet.data.len().min(REPLY_SLOT_SIZE);
                    if slot + len <= buf.len() {
                        buf[slot..slot + len].copy_from_slice(&packet.data[..len]);
                        ret |= 1 << aid;
                    }
                }
                replied |= 1 << packet.sender;
                let connmask = self.bus.connected_mask();
                if (replied & connmask) == connmask || (ret & aidmask) == aidmask {
                    return ret;
                }
            }
            if self.bus.cond.wait_until(&mut state, deadline).timed_out() {
                return ret;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bus_with(instances: &[u8]) -> Arc<LocalMpBus> {
        let bus = Arc::new(LocalMpBus::new());
        for &i in instances {
            bus.begin(i);
        }
        bus
    }

    #[test]
    fn send_reaches_every_other_instance() {
        let bus = bus_with(&[0, 1, 2]);
        let h0 = bus.handle(0);
        let h1 = bus.handle(1);
        let h2 = bus.handle(2);

        assert_eq!(h0.send_packet(b"frame", 100), 5);

        let mut buf = [0u8; 64];
        let r1 = h1.recv_packet(&mut buf).unwrap();
        assert_eq!((&buf[..r1.len], r1.timestamp), (&b"frame"[..], 100));
        let r2 = h2.recv_packet(&mut buf).unwrap();
        assert_eq!(r2.len, 5);
        // no loopback to the sender
        assert!(h0.recv_packet(&mut buf).is_none());
    }

    #[test]
    fn unregistered_instance_sends_nothing() {
        let bus = bus_with(&[1]);
        let h0 = bus.handle(0);
        let h1 = bus.handle(1);
        assert_eq!(h0.send_packet(b"x", 0), 0);
        let mut buf = [0u8; 8];
        assert!(h1.recv_packet(&mut buf).is_none());
    }

    #[test]
    fn host_packet_wait_skips_non_cmd() {
        let bus = bus_with(&[0, 1]);
        let h0 = bus.handle(0);
        let h1 = bus.handle(1);

        h0.send_packet(b"bulk", 1);
        h0.send_cmd(b"cmd", 2);

        let mut buf = [0u8; 16];
        let r = h1.recv_host_packet(&mut buf).unwrap();
        assert_eq!(&buf[..r.len], b"cmd");
    }

    #[test]
    fn host_packet_wait_times_out() {
        let bus = bus_with(&[0, 1]);
        bus.set_recv_timeout(10);
        let h1 = bus.handle(1);
        let start = Instant::now();
        let mut buf = [0u8; 16];
        assert!(h1.recv_host_packet(&mut buf).is_none());
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[test]
    fn replies_gather_into_aid_slots() {
        let bus = bus_with(&[0, 1, 2, 3]);
        let h0 = bus.handle(0);

        bus.handle(1).send_reply(b"one", 1000, 1);
        bus.handle(2).send_reply(b"two", 1000, 2);
        bus.handle(3).send_reply(b"three", 1000, 3);

        let mut buf = vec![0u8; REPLY_SLOT_SIZE * 15];
        let mask = h0.recv_replies(&mut buf, 1000, 0b1110);
        assert_eq!(mask, 0b1110);
        assert_eq!(&buf[0..3], b"one");
        assert_eq!(&buf[REPLY_SLOT_SIZE..REPLY_SLOT_SIZE + 3], b"two");
        assert_eq!(&buf[2 * REPLY_SLOT_SIZE..2 * REPLY_SLOT_SIZE + 5], b"three");
    }

    #[test]
    fn replies_timeout_returns_partial_mask() {
        let bus = bus_with(&[0, 1, 2]);
        bus.set_recv_timeout(10);
        let h0 = bus.handle(0);
        bus.handle(1).send_reply(b"one", 500, 1);
        // instance 2 never replies

        let mut buf = vec![0u8; REPLY_SLOT_SIZE * 15];
        let mask = h0.recv_replies(&mut buf, 500, 0b0110);
        assert_eq!(mask, 0b0010);
    }

    #[test]
    fn stale_reply_timestamps_ignored() {
        let bus = bus_with(&[0, 1]);
        bus.set_recv_timeout(10);
        let h0 = bus.handle(0);
        bus.handle(1).send_reply(b"old", 0, 1);

        let mut buf = vec![0u8; REPLY_SLOT_SIZE * 15];
        // caller timestamp far past the reply's window
        let mask = h0.recv_replies(&mut buf, 1 << 30, 0b0010);
        assert_eq!(mask, 0);
    }
}
