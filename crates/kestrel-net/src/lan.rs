//! LAN mode: bridge one local emulated console into a shared session.
//!
//! Each participating machine emulates its own console; this module
//! forwards the handheld's native wireless MP frames between them. A
//! background thread drains the transport: MP-channel packets land in a
//! timestamped receive queue the emulation thread consumes through
//! [`MpInterface`], control-channel commands drive the player table.
//!
//! The host owns the session: it assigns player ids, rebroadcasts the
//! player list, and advertises itself over discovery. Clients additionally
//! dial every other client after each player list (peer mesh), so MP
//! broadcasts flow directly instead of through the host.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, trace, warn};

use kestrel_netproto::constants::{LOCALHOST, MAX_PLAYERS, MP_PAYLOAD_MAX, REPLY_SLOT_SIZE};
use kestrel_netproto::discovery::{Beacon, SessionStatus};
use kestrel_netproto::lan::LanCommand;
use kestrel_netproto::mp::{encode_mp_packet, MpHeader, MpKind};
use kestrel_netproto::player::Player;

use crate::config::NetConfig;
use crate::console::{MpInterface, MpRecv};
use crate::discovery::{BeaconEntry, Discovery, DiscoveryConfig};
use crate::error::NetError;
use crate::players::PlayerTable;
use crate::transport::{Transport, TransportEvent, CHAN_CONTROL, CHAN_MP, DEFAULT_CONNECT_TIMEOUT};
use crate::upnp::PortMapper;

/// Packets sitting in the receive queue longer than this are dropped.
const RX_STALE_AFTER: Duration = Duration::from_millis(500);

/// Sleep between transport polls on the network thread.
const NET_THREAD_PAUSE: Duration = Duration::from_micros(500);

/// Emulated-timestamp window accepted by the reply gather.
const REPLY_WINDOW: u64 = 1 << 20;

/// Ping refresh cadence, in `process()` calls (one per frame).
const PING_REFRESH_FRAMES: u32 = 60;

struct RxPacket {
    header: MpHeader,
    payload: Bytes,
    peer: usize,
    received: Instant,
}

#[derive(Clone, Copy)]
struct LastHost {
    peer: usize,
}

struct LanShared {
    transport: Transport,
    players: PlayerTable,
    discovery: Mutex<Option<Discovery>>,
    discovery_cfg: DiscoveryConfig,
    upnp: PortMapper,

    rx: Mutex<VecDeque<RxPacket>>,
    rx_cond: Condvar,

    running: AtomicBool,
    active: AtomicBool,
    is_host: AtomicBool,
    my_id: AtomicU8,
    my_name: Mutex<String>,
    max_players: AtomicU8,
    game_port: AtomicU16,
    host_address: AtomicU32,
    recv_timeout_ms: AtomicU32,
    frame_count: AtomicU32,
    epoch: Instant,

    /// Transport peer that sent the most recent MP command; replies are
    /// addressed to it directly.
    last_host: Mutex<Option<LastHost>>,
    /// Player id -> transport peer slot.
    peer_for_player: Mutex<[Option<usize>; MAX_PLAYERS]>,
}

/// One machine's LAN session (host or client).
pub struct LanSession {
    shared: Arc<LanShared>,
    net_thread: Mutex<Option<JoinHandle<()>>>,
}

impl LanSession {
    pub fn new(config: &NetConfig) -> Self {
        Self {
            shared: Arc::new(LanShared {
                transport: Transport::new(),
                players: PlayerTable::new(),
                discovery: Mutex::new(None),
                discovery_cfg: config.discovery.clone(),
                upnp: PortMapper::new(),
                rx: Mutex::new(VecDeque::new()),
                rx_cond: Condvar::new(),
                running: AtomicBool::new(false),
                active: AtomicBool::new(false),
                is_host: AtomicBool::new(false),
                my_id: AtomicU8::new(0),
                my_name: Mutex::new(config.player_name.clone()),
                max_players: AtomicU8::new(0),
                game_port: AtomicU16::new(config.lan_port),
                host_address: AtomicU32::new(LOCALHOST),
                recv_timeout_ms: AtomicU32::new(config.recv_timeout_ms),
                frame_count: AtomicU32::new(0),
                epoch: Instant::now(),
                last_host: Mutex::new(None),
                peer_for_player: Mutex::new([None; MAX_PLAYERS]),
            }),
            net_thread: Mutex::new(None),
        }
    }

    // ---- session lifecycle ----

    /// Host a session for up to `num_players` participants.
    pub fn start_host(&self, name: &str, num_players: u8, port: u16) -> Result<(), NetError> {
        let shared = &self.shared;
        if shared.active.load(Ordering::Acquire) {
            return Err(NetError::AlreadyActive);
        }
        if num_players == 0 || num_players as usize > MAX_PLAYERS {
            return Err(NetError::InvalidPlayerCount(num_players as usize));
        }

        shared.transport.start_host(port, MAX_PLAYERS)?;
        let bound_port = shared.transport.local_port().unwrap_or(port);

        shared.players.install_host(name, bound_port);
        *shared.my_name.lock() = name.to_string();
        shared.my_id.store(0, Ordering::Release);
        shared.max_players.store(num_players, Ordering::Release);
        shared.game_port.store(bound_port, Ordering::Release);
        shared.host_address.store(LOCALHOST, Ordering::Release);
        shared.is_host.store(true, Ordering::Release);
        *shared.last_host.lock() = None;
        shared.active.store(true, Ordering::Release);

        self.spawn_net_thread();
        self.start_advertising();

        info!(name, num_players, port = bound_port, "LAN session hosted");
        Ok(())
    }

    /// Join the session at `host:port`.
    pub fn start_client(&self, name: &str, host: &str, port: u16) -> Result<(), NetError> {
        let shared = &self.shared;
        if shared.active.load(Ordering::Acquire) {
            return Err(NetError::AlreadyActive);
        }

        shared
            .transport
            .start_client(host, port, DEFAULT_CONNECT_TIMEOUT)?;

        // Handshake: the host answers our connect with ClientInit; we
        // respond with our player record.
        let deadline = Instant::now() + DEFAULT_CONNECT_TIMEOUT;
        let mut init: Option<(u8, u8)> = None;
        let mut lost = false;
        while init.is_none() && !lost && Instant::now() < deadline {
            shared.transport.poll(Duration::from_millis(50), |event| {
                match event {
                    TransportEvent::Packet { channel, data, .. } if channel == CHAN_CONTROL => {
                        if let Ok(LanCommand::ClientInit {
                            assigned_id,
                            max_players,
                        }) = LanCommand::decode(&data)
                        {
                            init = Some((assigned_id, max_players));
                        }
                    }
                    TransportEvent::Disconnected { .. } => lost = true,
                    _ => {}
                }
            });
        }
        let Some((assigned_id, max_players)) = init else {
            shared.transport.stop();
            warn!(host, port, "LAN handshake failed");
            return Err(NetError::Handshake("no ClientInit from host".into()));
        };

        let info = LanCommand::PlayerInfo {
            player: Player {
                id: assigned_id,
                status: kestrel_netproto::player::PlayerStatus::Connecting,
                name: name.into(),
                address: 0,
                mp_port: shared.transport.local_port().unwrap_or(0),
                ping_ms: 0,
                is_local: false,
            },
        };
        shared.transport.send_to(0, CHAN_CONTROL, true, &info.encode());
        shared.transport.flush();

        *shared.my_name.lock() = name.to_string();
        shared.my_id.store(assigned_id, Ordering::Release);
        shared.max_players.store(max_players, Ordering::Release);
        shared.game_port.store(port, Ordering::Release);
        shared
            .host_address
            .store(shared.transport.peer_address(0).unwrap_or(0), Ordering::Release);
        shared.is_host.store(false, Ordering::Release);
        shared.peer_for_player.lock()[0] = Some(0);
        *shared.last_host.lock() = None;
        shared.active.store(true, Ordering::Release);

        self.spawn_net_thread();

        info!(name, host, port, id = assigned_id, "joined LAN session");
        Ok(())
    }

    /// Tear the session down. Safe to call twice; the second call is a
    /// no-op.
    pub fn end_session(&self) {
        let shared = &self.shared;
        if !shared.active.swap(false, Ordering::AcqRel) {
            return;
        }

        shared.running.store(false, Ordering::Release);
        if let Some(handle) = self.net_thread.lock().take() {
            let _ = handle.join();
        }

        if shared.is_host.load(Ordering::Acquire) {
            self.end_discovery();
            let port = shared.game_port.load(Ordering::Acquire);
            if shared.upnp.is_active() {
                shared.upnp.remove(port);
            }
        }

        shared.rx.lock().clear();
        shared.rx_cond.notify_all();
        shared.transport.stop();
        shared.players.clear();
        *shared.peer_for_player.lock() = [None; MAX_PLAYERS];
        *shared.last_host.lock() = None;
        shared.is_host.store(false, Ordering::Release);
        info!("LAN session ended");
    }

    fn spawn_net_thread(&self) {
        let shared = Arc::clone(&self.shared);
        shared.running.store(true, Ordering::Release);
        let handle = thread::Builder::new()
            .name("lan-net".into())
            .spawn(move || net_thread_loop(shared))
            .expect("spawning the LAN network thread");
        *self.net_thread.lock() = Some(handle);
    }

    // ---- discovery ----

    fn start_advertising(&self) {
        match Discovery::advertiser(self.shared.discovery_cfg.clone()) {
            Ok(d) => *self.shared.discovery.lock() = Some(d),
            Err(e) => warn!("discovery advertiser failed to start: {e}"),
        }
    }

    /// Start listening for sessions on the local segment.
    pub fn start_discovery(&self) -> Result<(), NetError> {
        let mut slot = self.shared.discovery.lock();
        if slot.is_none() {
            *slot = Some(Discovery::listener(self.shared.discovery_cfg.clone())?);
        }
        Ok(())
    }

    pub fn end_discovery(&self) {
        self.shared.discovery.lock().take();
    }

    /// Snapshot of sessions seen on the local segment, keyed by host IPv4.
    pub fn discovery_list(&self) -> BTreeMap<u32, BeaconEntry> {
        self.shared
            .discovery
            .lock()
            .as_ref()
            .map(|d| d.snapshot())
            .unwrap_or_default()
    }

    // ---- per-frame processing (emulation thread) ----

    /// Called once per emulated frame: discovery upkeep, stale-packet
    /// sweep, transport flush, periodic ping refresh. Discovery listening
    /// also works before a session is joined.
    pub fn process(&self) {
        let shared = &self.shared;
        let active = shared.active.load(Ordering::Acquire);
        {
            let discovery = shared.discovery.lock();
            if let Some(d) = discovery.as_ref() {
                if active && shared.is_host.load(Ordering::Acquire) {
                    d.tick_advertise(&self.local_beacon());
                } else {
                    d.tick_listen();
                }
            }
        }
        if !active {
            return;
        }

        self.sweep_stale();
        shared.transport.flush();

        let frames = shared.frame_count.fetch_add(1, Ordering::Relaxed) + 1;
        if frames % PING_REFRESH_FRAMES == 0 {
            let peers = *shared.peer_for_player.lock();
            for (id, peer) in peers.iter().enumerate() {
                if id == shared.my_id.load(Ordering::Acquire) as usize {
                    continue;
                }
                if let Some(peer) = peer {
                    if let Some(rtt) = shared.transport.peer_rtt(*peer) {
                        shared.players.refresh_ping(id as u8, rtt.as_millis() as u32);
                    }
                }
            }
        }
    }

    fn local_beacon(&self) -> Beacon {
        let shared = &self.shared;
        let my_id = shared.my_id.load(Ordering::Acquire);
        let status = if shared.players.connected_mask() & (1u16 << my_id) != 0 {
            SessionStatus::Playing
        } else {
            SessionStatus::Waiting
        };
        Beacon {
            tick: shared.epoch.elapsed().as_millis() as u32,
            session_name: format!("{}'s game", shared.my_name.lock()),
            num_players: shared.players.num_players(),
            max_players: shared.max_players.load(Ordering::Acquire),
            status,
        }
    }

    fn sweep_stale(&self) {
        let mut rx = self.shared.rx.lock();
        while let Some(front) = rx.front() {
            if front.received.elapsed() > RX_STALE_AFTER {
                trace!("stale MP packet swept");
                rx.pop_front();
            } else {
                break;
            }
        }
    }

    // ---- game membership ----

    /// The local user entered the in-game MP screen: start exchanging MP
    /// frames.
    pub fn begin(&self) {
        let shared = &self.shared;
        if !shared.active.load(Ordering::Acquire) {
            return;
        }
        let my_id = shared.my_id.load(Ordering::Acquire);
        info!(
            my_id,
            bitmask = format_args!("{:04x}", shared.players.connected_mask()),
            "entering MP exchange"
        );
        shared.players.mark_in_game(my_id);
        *shared.last_host.lock() = None;
        shared
            .transport
            .broadcast(CHAN_CONTROL, true, &LanCommand::PlayerConnect.encode());
        shared.transport.flush();
    }

    /// The local user left the MP screen.
    pub fn end(&self) {
        let shared = &self.shared;
        if !shared.active.load(Ordering::Acquire) {
            return;
        }
        let my_id = shared.my_id.load(Ordering::Acquire);
        info!(
            my_id,
            bitmask = format_args!("{:04x}", shared.players.connected_mask()),
            "leaving MP exchange"
        );
        shared.players.mark_left_game(my_id);
        shared
            .transport
            .broadcast(CHAN_CONTROL, true, &LanCommand::PlayerDisconnect.encode());
        shared.transport.flush();
    }

    // ---- UI queries ----

    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::Acquire)
    }

    pub fn is_host(&self) -> bool {
        self.shared.is_host.load(Ordering::Acquire)
    }

    pub fn player_list(&self) -> Vec<Player> {
        let shared = &self.shared;
        shared.players.snapshot_for_ui(
            shared.my_id.load(Ordering::Acquire),
            shared.host_address.load(Ordering::Acquire),
        )
    }

    pub fn num_players(&self) -> u8 {
        self.shared.players.num_players()
    }

    pub fn max_players(&self) -> u8 {
        self.shared.max_players.load(Ordering::Acquire)
    }

    pub fn local_player_id(&self) -> u8 {
        self.shared.my_id.load(Ordering::Acquire)
    }

    /// Port of the running session (after `start_host(.., 0)` this is the
    /// actual bound port).
    pub fn game_port(&self) -> u16 {
        self.shared.game_port.load(Ordering::Acquire)
    }

    /// Tune the MP receive timeout (milliseconds).
    pub fn set_recv_timeout(&self, ms: u32) {
        self.shared.recv_timeout_ms.store(ms, Ordering::Relaxed);
    }

    /// Best-effort UPnP forwarding of the game port.
    pub fn upnp_forward(&self, port: u16) -> bool {
        self.shared.upnp.forward(port)
    }

    pub fn upnp_remove(&self, port: u16) {
        self.shared.upnp.remove(port)
    }

    fn recv_timeout(&self) -> Duration {
        Duration::from_millis(u64::from(
            self.shared.recv_timeout_ms.load(Ordering::Relaxed),
        ))
    }

    // ---- MP send/receive plumbing ----

    fn send_mp(&self, kind: MpKind, data: &[u8], timestamp: u64) -> usize {
        let shared = &self.shared;
        if !shared.active.load(Ordering::Acquire) {
            return 0;
        }
        let my_id = shared.my_id.load(Ordering::Acquire);
        let packet = encode_mp_packet(u32::from(my_id), kind, timestamp, data);

        // Replies go straight to whoever commanded last; everything else
        // is broadcast. All MP traffic is reliable.
        let direct = if kind.is_reply() {
            shared.last_host.lock().map(|h| h.peer)
        } else {
            None
        };
        match direct {
            Some(peer) => shared.transport.send_to(peer, CHAN_MP, true, &packet),
            None => shared.transport.broadcast(CHAN_MP, true, &packet),
        }
        shared.transport.flush();
        data.len()
    }

    fn pop_rx(rx: &mut VecDeque<RxPacket>) -> Option<RxPacket> {
        while let Some(front) = rx.front() {
            if front.received.elapsed() > RX_STALE_AFTER {
                rx.pop_front();
            } else {
                return rx.pop_front();
            }
        }
        None
    }

    fn copy_payload(packet: &RxPacket, buf: &mut [u8]) -> MpRecv {
        let len = packet.payload.len().min(buf.len()).min(MP_PAYLOAD_MAX);
        buf[..len].copy_from_slice(&packet.payload[..len]);
        MpRecv {
            len,
            timestamp: packet.header.timestamp,
        }
    }

    fn remember_cmd_sender(&self, packet: &RxPacket) {
        // Empty command frames carry no host beacon; they must not steal
        // the reply target.
        if packet.header.kind.is_cmd() && !packet.payload.is_empty() {
            *self.shared.last_host.lock() = Some(LastHost { peer: packet.peer });
        }
    }
}

impl MpInterface for LanSession {
    fn send_packet(&self, data: &[u8], timestamp: u64) -> usize {
        self.send_mp(MpKind::Frame, data, timestamp)
    }

    fn send_cmd(&self, data: &[u8], timestamp: u64) -> usize {
        self.send_mp(MpKind::Cmd, data, timestamp)
    }

    fn send_reply(&self, data: &[u8], timestamp: u64, aid: u16) -> usize {
        self.send_mp(MpKind::Reply { aid }, data, timestamp)
    }

    fn send_ack(&self, data: &[u8], timestamp: u64) -> usize {
        self.send_mp(MpKind::Ack, data, timestamp)
    }

    fn recv_packet(&self, buf: &mut [u8]) -> Option<MpRecv> {
        if !self.shared.active.load(Ordering::Acquire) {
            return None;
        }
        let mut rx = self.shared.rx.lock();
        let packet = Self::pop_rx(&mut rx)?;
        drop(rx);
        self.remember_cmd_sender(&packet);
        Some(Self::copy_payload(&packet, buf))
    }

    fn recv_host_packet(&self, buf: &mut [u8]) -> Option<MpRecv> {
        if !self.shared.active.load(Ordering::Acquire) {
            return None;
        }
        let deadline = Instant::now() + self.recv_timeout();
        let mut rx = self.shared.rx.lock();
        loop {
            while let Some(packet) = Self::pop_rx(&mut rx) {
                if packet.header.kind.is_cmd() {
                    drop(rx);
                    self.remember_cmd_sender(&packet);
                    return Some(Self::copy_payload(&packet, buf));
                }
                trace!("non-cmd MP packet dropped while waiting for host");
            }
            if self.shared.rx_cond.wait_until(&mut rx, deadline).timed_out() {
                return None;
            }
        }
    }

    fn recv_replies(&self, buf: &mut [u8], timestamp: u64, aidmask: u16) -> u16 {
        let shared = &self.shared;
        if !shared.active.load(Ordering::Acquire) {
            return 0;
        }

        let mut ret: u16 = 0;
        let mut replied: u16 = 1 << shared.my_id.load(Ordering::Acquire);
        let connmask = shared.players.connected_mask();
        if replied & connmask == connmask {
            // Nobody else is in the game; there is nothing to wait for.
            return 0;
        }

        let deadline = Instant::now() + self.recv_timeout();
        let mut rx = shared.rx.lock();
        loop {
            while let Some(packet) = Self::pop_rx(&mut rx) {
                let MpKind::Reply { aid } = packet.header.kind else {
                    continue;
                };
                if packet.header.timestamp < timestamp.saturating_sub(REPLY_WINDOW) {
                    continue;
                }
                // aid 0 is the command sender itself; 16+ cannot index the
                // reply mask.
                if !packet.payload.is_empty() && (1..16).contains(&aid) {
                    let slot = (aid as usize - 1) * REPLY_SLOT_SIZE;
                    let len = packet.payload.len().min(REPLY_SLOT_SIZE);
                    if slot + len <= buf.len() {
                        buf[slot..slot + len].copy_from_slice(&packet.payload[..len]);
                        ret |= 1 << aid;
                    }
                }
                if packet.header.sender_id < MAX_PLAYERS as u32 {
                    replied |= 1 << packet.header.sender_id;
                }
                let connmask = shared.players.connected_mask();
                if (replied & connmask) == connmask || (ret & aidmask) == aidmask {
                    return ret;
                }
            }
            if shared.rx_cond.wait_until(&mut rx, deadline).timed_out() {
                return ret;
            }
        }
    }
}

impl Drop for LanSession {
    fn drop(&mut self) {
        self.end_session();
    }
}

// ---- network thread ----

fn net_thread_loop(shared: Arc<LanShared>) {
    debug!("LAN network thread up");
    while shared.running.load(Ordering::Acquire) {
        shared
            .transport
            .poll(Duration::ZERO, |event| handle_event(&shared, event));
        thread::sleep(NET_THREAD_PAUSE);
    }
    debug!("LAN network thread down");
}

fn handle_event(shared: &Arc<LanShared>, event: TransportEvent) {
    match event {
        TransportEvent::Connected { peer, address } => {
            if shared.is_host.load(Ordering::Acquire) {
                host_on_connect(shared, peer, address);
            } else {
                client_on_connect(shared, peer, address);
            }
        }
        TransportEvent::Disconnected { peer } => on_disconnect(shared, peer),
        TransportEvent::Packet {
            peer,
            channel,
            data,
        } => {
            if channel == CHAN_MP {
                on_mp_packet(shared, peer, data);
            } else {
                on_control_packet(shared, peer, &data);
            }
        }
    }
}

fn on_mp_packet(shared: &Arc<LanShared>, peer: usize, data: Bytes) {
    let (header, payload_off) = match MpHeader::decode(&data) {
        Ok((h, payload)) => {
            let off = data.len() - payload.len();
            (h, off)
        }
        Err(e) => {
            trace!("malformed MP packet dropped: {e}");
            return;
        }
    };
    // Our own broadcasts come back around the mesh; never deliver them.
    if header.sender_id == u32::from(shared.my_id.load(Ordering::Acquire)) {
        return;
    }
    let mut rx = shared.rx.lock();
    rx.push_back(RxPacket {
        header,
        payload: data.slice(payload_off..),
        peer,
        received: Instant::now(),
    });
    drop(rx);
    shared.rx_cond.notify_all();
}

fn on_control_packet(shared: &Arc<LanShared>, peer: usize, data: &[u8]) {
    let cmd = match LanCommand::decode(data) {
        Ok(cmd) => cmd,
        Err(e) => {
            warn!(peer, "malformed control command dropped: {e}");
            return;
        }
    };
    if shared.is_host.load(Ordering::Acquire) {
        host_on_command(shared, peer, cmd);
    } else {
        client_on_command(shared, peer, cmd);
    }
}

fn player_for_peer(shared: &LanShared, peer: usize) -> Option<u8> {
    shared
        .peer_for_player
        .lock()
        .iter()
        .position(|p| *p == Some(peer))
        .map(|id| id as u8)
}

// ---- host control plane ----

fn host_on_connect(shared: &Arc<LanShared>, peer: usize, address: u32) {
    let max_players = shared.max_players.load(Ordering::Acquire);
    let Some(id) = shared.players.allocate(address, max_players) else {
        info!(peer, "session full, rejecting connection");
        shared.transport.disconnect_peer(peer);
        return;
    };
    shared.peer_for_player.lock()[id as usize] = Some(peer);
    let init = LanCommand::ClientInit {
        assigned_id: id,
        max_players,
    };
    shared.transport.send_to(peer, CHAN_CONTROL, true, &init.encode());
    debug!(peer, id, "client slot assigned");
}

fn host_on_command(shared: &Arc<LanShared>, peer: usize, cmd: LanCommand) {
    match cmd {
        LanCommand::PlayerInfo { player } => {
            let Some(id) = player_for_peer(shared, peer) else {
                shared.transport.disconnect_peer(peer);
                return;
            };
            if player.id != id {
                // A client claiming someone else's id violates the
                // handshake; cut it loose.
                warn!(peer, claimed = player.id, assigned = id, "player id mismatch");
                shared.transport.disconnect_peer(peer);
                return;
            }
            let address = shared.players.get(id).map(|p| p.address).unwrap_or(0);
            shared.players.set_info(id, &player.name, address, player.mp_port);
            info!(id, name = %player.name, "player joined");
            broadcast_player_list(shared);
        }
        LanCommand::PlayerConnect => {
            if let Some(id) = player_for_peer(shared, peer) {
                shared.players.mark_in_game(id);
            }
        }
        LanCommand::PlayerDisconnect => {
            if let Some(id) = player_for_peer(shared, peer) {
                shared.players.mark_left_game(id);
            }
        }
        other => trace!(?other, "unexpected command on host ignored"),
    }
}

fn broadcast_player_list(shared: &Arc<LanShared>) {
    let list = LanCommand::PlayerList {
        num_players: shared.players.num_players(),
        players: shared.players.raw_slots(),
    };
    shared
        .transport
        .broadcast(CHAN_CONTROL, true, &list.encode());
}

// ---- client control plane ----

fn client_on_connect(shared: &Arc<LanShared>, peer: usize, address: u32) {
    // Another client establishing its leg of the mesh; match it to a
    // player slot by address.
    let my_id = shared.my_id.load(Ordering::Acquire);
    match shared.players.client_slot_by_address(address, my_id) {
        Some(id) => {
            shared.peer_for_player.lock()[id as usize] = Some(peer);
            debug!(peer, id, "mesh peer connected");
        }
        None => {
            debug!(peer, "connection from unknown address rejected");
            shared.transport.disconnect_peer(peer);
        }
    }
}

fn client_on_command(shared: &Arc<LanShared>, peer: usize, cmd: LanCommand) {
    match cmd {
        LanCommand::PlayerList {
            num_players,
            players,
        } => {
            shared.players.replace_all(&players, num_players);

            // Dial the clients we are not yet meshed with. Only the newer
            // (higher-id) side dials, so each pair ends up with exactly one
            // connection.
            let my_id = shared.my_id.load(Ordering::Acquire);
            let fallback_port = shared.game_port.load(Ordering::Acquire);
            let needs = {
                let peers = shared.peer_for_player.lock();
                shared
                    .players
                    .clients_needing_peers(my_id, |id| peers[id as usize].is_some())
            };
            for player in needs.into_iter().filter(|p| p.id < my_id) {
                let port = if player.mp_port != 0 {
                    player.mp_port
                } else {
                    fallback_port
                };
                debug!(id = player.id, port, "dialing mesh peer");
                if let Err(e) = shared.transport.connect_to(player.address, port) {
                    warn!(id = player.id, "mesh dial failed: {e}");
                }
            }
        }
        LanCommand::PlayerConnect => {
            if let Some(id) = player_for_peer(shared, peer) {
                shared.players.mark_in_game(id);
            }
        }
        LanCommand::PlayerDisconnect => {
            if let Some(id) = player_for_peer(shared, peer) {
                shared.players.mark_left_game(id);
            }
        }
        other => trace!(?other, "unexpected command on client ignored"),
    }
}

// ---- shared disconnect path ----

fn on_disconnect(shared: &Arc<LanShared>, peer: usize) {
    let Some(id) = player_for_peer(shared, peer) else {
        return;
    };
    shared.players.mark_left_game(id);
    shared.peer_for_player.lock()[id as usize] = None;
    {
        let mut last = shared.last_host.lock();
        if matches!(*last, Some(LastHost { peer: p }) if p == peer) {
            *last = None;
        }
    }

    if shared.is_host.load(Ordering::Acquire) {
        shared.players.clear_slot(id);
        info!(id, "player left");
        broadcast_player_list(shared);
    } else {
        shared.players.mark_disconnected(id);
        info!(id, "peer lost");
    }
}
