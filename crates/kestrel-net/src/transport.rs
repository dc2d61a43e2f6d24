//! Reliable multi-channel peer transport.
//!
//! Thin wrapper over an ENet host. Everything the rest of the crate knows
//! about the transport library is confined to this module: peers are plain
//! slot indices (0..16), events are [`TransportEvent`] values, payloads are
//! [`Bytes`].
//!
//! All operations serialize through one internal mutex; any call may
//! briefly block on socket I/O. `poll` drains events under the lock but
//! dispatches them after releasing it, so handlers are free to send.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs, UdpSocket};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use rusty_enet as enet;
use tracing::{debug, info, trace, warn};

use kestrel_netproto::constants::MAX_PLAYERS;

use crate::error::NetError;

/// Channel 0: reliable control commands.
pub const CHAN_CONTROL: u8 = 0;
/// Channel 1: MP frames (LAN) / input frames (netplay).
pub const CHAN_MP: u8 = 1;
/// Alias of [`CHAN_MP`] for the netplay input stream.
pub const CHAN_INPUT: u8 = 1;
/// Channels negotiated per connection.
pub const CHANNEL_COUNT: usize = 2;

/// Connect timeout used when none is given.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(5000);

const POLL_STEP: Duration = Duration::from_millis(1);
const STOP_FLUSH_WINDOW: Duration = Duration::from_millis(100);

/// One event drained from the transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A peer finished connecting. `address` is its IPv4 in host order.
    Connected { peer: usize, address: u32 },
    /// A peer was lost or closed the connection.
    Disconnected { peer: usize },
    /// A packet arrived on `channel`.
    Packet {
        peer: usize,
        channel: u8,
        data: Bytes,
    },
}

struct Active {
    host: enet::Host<UdpSocket>,
    local_port: u16,
    /// Slot index -> ENet peer. Slots are claimed lowest-free on connect
    /// and cleared on disconnect; the control plane references peers only
    /// through these indices.
    slots: [Option<enet::PeerID>; MAX_PLAYERS],
    max_peers: usize,
}

impl Active {
    fn slot_of(&self, id: enet::PeerID) -> Option<usize> {
        self.slots.iter().position(|s| *s == Some(id))
    }

    fn claim_slot(&mut self, id: enet::PeerID) -> Option<usize> {
        if let Some(slot) = self.slot_of(id) {
            return Some(slot);
        }
        let limit = self.max_peers.min(MAX_PLAYERS);
        for (slot, entry) in self.slots.iter_mut().take(limit).enumerate() {
            if entry.is_none() {
                *entry = Some(id);
                return Some(slot);
            }
        }
        None
    }

    fn peer_address_u32(&self, id: enet::PeerID) -> u32 {
        match self.host.peer(id).address() {
            Some(SocketAddr::V4(addr)) => u32::from(*addr.ip()),
            _ => 0,
        }
    }

    /// Drain every currently-available event into `out`.
    fn drain(&mut self, out: &mut Vec<TransportEvent>) {
        loop {
            match self.host.service() {
                Ok(Some(event)) => match event {
                    enet::Event::Connect { peer, .. } => {
                        let peer_id = peer.id();
                        match self.claim_slot(peer_id) {
                        Some(slot) => {
                            let address = self.peer_address_u32(peer_id);
                            debug!(slot, address = format_args!("{address:08x}"), "peer connected");
                            out.push(TransportEvent::Connected {
                                peer: slot,
                                address,
                            });
                        }
                        None => {
                            debug!("no free peer slot, dropping connection");
                            self.host.peer_mut(peer_id).disconnect(0);
                        }
                    }},
                    enet::Event::Disconnect { peer, .. } => {
                        let peer_id = peer.id();
                        if let Some(slot) = self.slot_of(peer_id) {
                            debug!(slot, "peer disconnected");
                            self.slots[slot] = None;
                            out.push(TransportEvent::Disconnected { peer: slot });
                        }
                    }
                    enet::Event::Receive {
                        peer,
                        channel_id,
                        packet,
                    } => {
                        let peer_id = peer.id();
                        if let Some(slot) = self.slot_of(peer_id) {
                            out.push(TransportEvent::Packet {
                                peer: slot,
                                channel: channel_id,
                                data: Bytes::copy_from_slice(packet.data()),
                            });
                        }
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    warn!("transport service error: {e:?}");
                    break;
                }
            }
        }
    }
}

/// The peer transport of one session.
pub struct Transport {
    state: Mutex<Option<Active>>,
}

impl Default for Transport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(None),
        }
    }

    /// Bind `port` and accept up to `max_peers` connections.
    pub fn start_host(&self, port: u16, max_peers: usize) -> Result<(), NetError> {
        let mut state = self.state.lock();
        if state.is_some() {
            return Err(NetError::AlreadyActive);
        }
        let socket = UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], port)))?;
        let local_port = socket.local_addr()?.port();
        let host = new_host(socket)?;
        info!(port = local_port, max_peers, "transport hosting");
        *state = Some(Active {
            host,
            local_port,
            slots: [None; MAX_PLAYERS],
            max_peers,
        });
        Ok(())
    }

    /// Connect to `host:port`, blocking until the connection is established
    /// or `timeout` elapses. The server occupies peer slot 0.
    pub fn start_client(&self, host: &str, port: u16, timeout: Duration) -> Result<(), NetError> {
        let mut state = self.state.lock();
        if state.is_some() {
            return Err(NetError::AlreadyActive);
        }

        let addr = resolve_v4(host, port)?;
        let socket = UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], 0)))?;
        let local_port = socket.local_addr()?.port();
        let mut active = Active {
            host: new_host(socket)?,
            local_port,
            slots: [None; MAX_PLAYERS],
            max_peers: MAX_PLAYERS,
        };
        active
            .host
            .connect(addr, CHANNEL_COUNT, 0)
            .map(|_| ())
            .map_err(|e| NetError::TransportInit(format!("connect: {e:?}")))?;

        // Wait for the connect event; anything else this early is noise.
        let deadline = Instant::now() + timeout;
        let connected = loop {
            let mut events = Vec::new();
            active.drain(&mut events);
            if events
                .iter()
                .any(|e| matches!(e, TransportEvent::Connected { .. }))
            {
                break true;
            }
            if Instant::now() >= deadline {
                break false;
            }
            thread::sleep(POLL_STEP);
        };
        if !connected {
            warn!(host, port, "connection timed out");
            return Err(NetError::ConnectTimeout);
        }

        info!(host, port, "transport connected");
        *state = Some(active);
        Ok(())
    }

    /// Initiate an outgoing connection to another peer (client mesh). The
    /// result arrives later as a `Connected` event.
    pub fn connect_to(&self, address: u32, port: u16) -> Result<(), NetError> {
        let mut state = self.state.lock();
        let active = state.as_mut().ok_or(NetError::NotActive)?;
        let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(address), port));
        active
            .host
            .connect(addr, CHANNEL_COUNT, 0)
            .map(|_| ())
            .map_err(|e| NetError::TransportInit(format!("connect: {e:?}")))?;
        Ok(())
    }

    /// Disconnect every peer, flush briefly, and release the socket.
    /// Calling on an inactive transport is a no-op.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        let Some(mut active) = state.take() else {
            return;
        };
        for slot in 0..MAX_PLAYERS {
            if let Some(id) = active.slots[slot].take() {
                active.host.peer_mut(id).disconnect(0);
            }
        }
        // Give the disconnect notifications a brief window to go out.
        let deadline = Instant::now() + STOP_FLUSH_WINDOW;
        let mut scratch = Vec::new();
        while Instant::now() < deadline {
            active.drain(&mut scratch);
            active.host.flush();
            thread::sleep(POLL_STEP);
        }
        info!("transport stopped");
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().is_some()
    }

    /// Port the underlying socket is bound to.
    pub fn local_port(&self) -> Option<u16> {
        self.state.lock().as_ref().map(|a| a.local_port)
    }

    /// Send to one peer. Sending to a vacant or dead slot is a silent
    /// no-op; the loss surfaces as a disconnect event.
    pub fn send_to(&self, peer: usize, channel: u8, reliable: bool, data: &[u8]) {
        let mut state = self.state.lock();
        let Some(active) = state.as_mut() else {
            return;
        };
        let Some(Some(id)) = active.slots.get(peer).copied() else {
            trace!(peer, "send to vacant slot dropped");
            return;
        };
        let packet = make_packet(reliable, data);
        if let Err(e) = active.host.peer_mut(id).send(channel, &packet) {
            trace!(peer, "send failed: {e:?}");
        }
    }

    /// Send to every connected peer.
    pub fn broadcast(&self, channel: u8, reliable: bool, data: &[u8]) {
        let mut state = self.state.lock();
        let Some(active) = state.as_mut() else {
            return;
        };
        active.host.broadcast(channel, &make_packet(reliable, data));
    }

    /// Forcibly drop one peer (handshake rejection, protocol violation).
    pub fn disconnect_peer(&self, peer: usize) {
        let mut state = self.state.lock();
        let Some(active) = state.as_mut() else {
            return;
        };
        if let Some(Some(id)) = active.slots.get(peer).copied() {
            active.host.peer_mut(id).disconnect(0);
        }
    }

    /// Drain all available events into `handler`. With a non-zero timeout
    /// the call blocks, in 1 ms steps, until the first event shows up or
    /// the timeout expires. Returns the number of events dispatched.
    pub fn poll(&self, timeout: Duration, mut handler: impl FnMut(TransportEvent)) -> usize {
        let deadline = Instant::now() + timeout;
        let mut events = Vec::new();
        loop {
            {
                let mut state = self.state.lock();
                let Some(active) = state.as_mut() else {
                    return 0;
                };
                active.drain(&mut events);
            }
            if !events.is_empty() || timeout.is_zero() || Instant::now() >= deadline {
                break;
            }
            thread::sleep(POLL_STEP);
        }
        let count = events.len();
        for event in events {
            handler(event);
        }
        count
    }

    /// IPv4 address of a connected peer, host order.
    pub fn peer_address(&self, peer: usize) -> Option<u32> {
        let state = self.state.lock();
        let active = state.as_ref()?;
        let id = (*active.slots.get(peer)?)?;
        Some(active.peer_address_u32(id))
    }

    /// Last measured round-trip time of a peer.
    pub fn peer_rtt(&self, peer: usize) -> Option<Duration> {
        let state = self.state.lock();
        let active = state.as_ref()?;
        let id = (*active.slots.get(peer)?)?;
        Some(active.host.peer(id).round_trip_time())
    }

    /// Push any queued packets onto the wire now.
    pub fn flush(&self) {
        let mut state = self.state.lock();
        if let Some(active) = state.as_mut() {
            active.host.flush();
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.stop();
    }
}

fn new_host(socket: UdpSocket) -> Result<enet::Host<UdpSocket>, NetError> {
    enet::Host::new(
        socket,
        enet::HostSettings {
            peer_limit: MAX_PLAYERS,
            channel_limit: CHANNEL_COUNT,
            ..Default::default()
        },
    )
    .map_err(|e| NetError::TransportInit(format!("{e:?}")))
}

fn make_packet(reliable: bool, data: &[u8]) -> enet::Packet {
    if reliable {
        enet::Packet::reliable(data)
    } else {
        enet::Packet::unreliable(data)
    }
}

fn resolve_v4(host: &str, port: u16) -> Result<SocketAddr, NetError> {
    (host, port)
        .to_socket_addrs()?
        .find(|a| a.is_ipv4())
        .ok_or_else(|| NetError::TransportInit(format!("no IPv4 address for {host}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inactive_transport_is_inert() {
        let t = Transport::new();
        assert!(!t.is_active());
        t.send_to(0, CHAN_CONTROL, true, &[1]);
        t.broadcast(CHAN_CONTROL, true, &[1]);
        t.stop();
        assert_eq!(t.poll(Duration::ZERO, |_| panic!("no events expected")), 0);
        assert!(t.peer_rtt(0).is_none());
    }

    #[test]
    fn host_binds_ephemeral_port() {
        let t = Transport::new();
        t.start_host(0, 4).unwrap();
        let port = t.local_port().unwrap();
        assert_ne!(port, 0);
        assert!(t.start_host(0, 4).is_err());
        t.stop();
        assert!(!t.is_active());
    }

    #[test]
    fn client_connect_times_out_without_host() {
        let t = Transport::new();
        let err = t
            .start_client("127.0.0.1", 1, Duration::from_millis(200))
            .unwrap_err();
        assert!(matches!(err, NetError::ConnectTimeout));
    }

    #[test]
    fn localhost_round_trip() {
        let host = Transport::new();
        host.start_host(0, 4).unwrap();
        let port = host.local_port().unwrap();

        let client = Transport::new();
        client
            .start_client("127.0.0.1", port, DEFAULT_CONNECT_TIMEOUT)
            .unwrap();

        // Host sees the connect, then the packet.
        let mut got_connect = false;
        let deadline = Instant::now() + Duration::from_secs(2);
        while !got_connect && Instant::now() < deadline {
            host.poll(Duration::from_millis(10), |e| {
                if matches!(e, TransportEvent::Connected { peer: 0, .. }) {
                    got_connect = true;
                }
            });
        }
        assert!(got_connect);

        client.send_to(0, CHAN_CONTROL, true, b"hello");
        client.flush();

        let mut payload = None;
        let deadline = Instant::now() + Duration::from_secs(2);
        while payload.is_none() && Instant::now() < deadline {
            host.poll(Duration::from_millis(10), |e| {
                if let TransportEvent::Packet { channel, data, .. } = e {
                    assert_eq!(channel, CHAN_CONTROL);
                    payload = Some(data);
                }
            });
        }
        assert_eq!(payload.as_deref(), Some(&b"hello"[..]));

        client.stop();
        host.stop();
    }
}
