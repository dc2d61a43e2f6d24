//! Netplay mode: N cloned consoles in lockstep on one machine.
//!
//! One machine per participant runs *every* participant's console, so all
//! copies of the session execute identical frames. Inputs are the only
//! thing exchanged during play: entered at frame F, scheduled for
//! F + delay, broadcast reliably, and consumed once every player's slot
//! for the frame is ready. Each instance runs on its own worker thread;
//! a shared barrier of N+1 participants frames each step. Every 60 frames
//! the engine hashes RAM and CPU registers of all instances and trades the
//! hash with its peers: a mismatch is surfaced, never masked.
//!
//! Joining clients receive the host's full state as savestate blobs plus
//! the SRAM of instance 0, then signal readiness and get the common
//! starting frame.

mod input_ring;

pub use input_ring::{InputRing, RING_SIZE};

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Barrier};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};
use xxhash_rust::xxh64::{xxh64, Xxh64};

use kestrel_netproto::constants::NETPLAY_MAX_PLAYERS;
use kestrel_netproto::input::{InputFrame, InputMsg};
use kestrel_netproto::netplay::{BlobType, DisconnectReason, NetplayMsg, BLOB_TYPE_COUNT};

use crate::blob::{send_blob, BlobReceiver, BlobTarget};
use crate::console::Console;
use crate::error::NetError;
use crate::localmp::LocalMpBus;
use crate::transport::{
    Transport, TransportEvent, CHAN_CONTROL, CHAN_INPUT, DEFAULT_CONNECT_TIMEOUT,
};

/// Frames between state-hash checkpoints.
const DESYNC_CHECK_INTERVAL: u32 = 60;

/// How long `run_frame` waits for remote inputs before giving up on the
/// frame (the caller simply retries).
const INPUT_STALL_TIMEOUT: Duration = Duration::from_secs(1);

/// Wait quantum while pumping the network for missing inputs.
const INPUT_WAIT_STEP: Duration = Duration::from_millis(2);

pub type DesyncCallback = Box<dyn Fn(u32, u64, u64) + Send>;
pub type DisconnectCallback = Box<dyn Fn(u8, DisconnectReason) + Send>;

/// Everything the worker threads share with the engine.
struct Instances {
    consoles: Vec<Mutex<Box<dyn Console>>>,
    scanlines: Vec<AtomicU32>,
    /// N workers + the controlling thread.
    barrier: Barrier,
    workers_running: AtomicBool,
}

/// Checkpoint-hash bookkeeping: local hashes meet remote alerts here, in
/// either arrival order.
#[derive(Default)]
struct DesyncTracker {
    local: Option<(u32, u64)>,
    /// Remote alerts for frames we have not reached yet.
    pending_remote: BTreeMap<u32, u64>,
}

impl DesyncTracker {
    /// Record the local hash for `frame`; returns a divergent remote hash
    /// if one was already waiting.
    fn note_local(&mut self, frame: u32, hash: u64) -> Option<u64> {
        self.local = Some((frame, hash));
        // Alerts far behind the current checkpoint are of no further use.
        self.pending_remote = self.pending_remote.split_off(&frame);
        match self.pending_remote.remove(&frame) {
            Some(remote) if remote != hash => Some(remote),
            _ => None,
        }
    }

    /// Record a remote alert; returns the local hash if this checkpoint
    /// was already computed and differs.
    fn note_remote(&mut self, frame: u32, hash: u64) -> Option<u64> {
        match self.local {
            Some((local_frame, local_hash)) if local_frame == frame => {
                (local_hash != hash).then_some(local_hash)
            }
            _ => {
                self.pending_remote.insert(frame, hash);
                None
            }
        }
    }
}

/// The lockstep engine. Owned and driven by the emulation thread.
pub struct NetplayEngine {
    local_id: u8,
    num_players: usize,
    input_delay: u32,
    current_frame: u32,

    ring: InputRing,
    bus: Arc<LocalMpBus>,
    transport: Transport,

    instances: Option<Arc<Instances>>,
    workers: Vec<JoinHandle<()>>,
    workers_started: bool,

    active: bool,
    is_host: bool,
    synced: bool,
    rom_hash: u64,

    /// Connected transport peer slots, in connect order.
    peers: Vec<usize>,
    blob_receivers: Vec<BlobReceiver>,
    current_blob: Option<BlobType>,

    desync_interval: u32,
    desync: DesyncTracker,
    on_desync: Option<DesyncCallback>,
    on_disconnect: Option<DisconnectCallback>,
}

impl NetplayEngine {
    /// Set up a session for `num_players` participants, of which this
    /// machine controls `local_id`. Id 0 hosts.
    pub fn init(local_id: usize, num_players: usize, input_delay: u32) -> Result<Self, NetError> {
        if !(2..=NETPLAY_MAX_PLAYERS).contains(&num_players) {
            return Err(NetError::InvalidPlayerCount(num_players));
        }
        if local_id >= num_players {
            return Err(NetError::InvalidPlayerId(local_id));
        }

        let blob_receivers = (0..BLOB_TYPE_COUNT as u8)
            .map(|i| BlobReceiver::new(BlobType::from_u8(i).expect("blob slot index in range")))
            .collect();

        info!(local_id, num_players, input_delay, "netplay session initialized");
        Ok(Self {
            local_id: local_id as u8,
            num_players,
            input_delay,
            current_frame: 0,
            ring: InputRing::new(num_players, input_delay),
            bus: Arc::new(LocalMpBus::new()),
            transport: Transport::new(),
            instances: None,
            workers: Vec::new(),
            workers_started: false,
            active: false,
            is_host: local_id == 0,
            synced: local_id == 0,
            rom_hash: 0,
            peers: Vec::new(),
            blob_receivers,
            current_blob: None,
            desync_interval: DESYNC_CHECK_INTERVAL,
            desync: DesyncTracker::default(),
            on_desync: None,
            on_disconnect: None,
        })
    }

    /// Build one console per participant. Each instance is wired to the
    /// in-process MP bus under its own index and reset; non-local
    /// instances run muted.
    pub fn create_instances<F>(&mut self, mut factory: F) -> Result<(), NetError>
    where
        F: FnMut(usize) -> Box<dyn Console>,
    {
        if self.instances.is_some() {
            return Err(NetError::AlreadyActive);
        }

        let mut consoles = Vec::with_capacity(self.num_players);
        for i in 0..self.num_players {
            let mut console = factory(i);
            console.attach_mp(self.bus.handle(i as u8));
            console.reset();
            if i as u8 != self.local_id {
                console.set_muted(true);
            }
            self.bus.begin(i as u8);
            consoles.push(Mutex::new(console));
        }

        let instances = Arc::new(Instances {
            scanlines: (0..self.num_players).map(|_| AtomicU32::new(0)).collect(),
            barrier: Barrier::new(self.num_players + 1),
            workers_running: AtomicBool::new(false),
            consoles,
        });
        self.instances = Some(instances);
        self.active = true;
        info!(count = self.num_players, "netplay instances created");
        Ok(())
    }

    /// Load the same ROM image into every instance and reset for direct
    /// boot.
    pub fn load_rom(&mut self, rom: &[u8]) -> Result<(), NetError> {
        let instances = self.instances.as_ref().ok_or(NetError::NotActive)?;
        self.rom_hash = xxh64(rom, 0);
        for slot in &instances.consoles {
            let mut console = slot.lock();
            console.load_rom(rom)?;
            console.reset();
        }
        info!(len = rom.len(), hash = format_args!("{:016x}", self.rom_hash), "ROM loaded on all instances");
        Ok(())
    }

    // ---- network lifecycle ----

    /// Host: accept clients on `port`.
    pub fn host_start(&mut self, port: u16) -> Result<(), NetError> {
        self.transport.start_host(port, self.num_players - 1)?;
        self.is_host = true;
        self.synced = true;
        Ok(())
    }

    /// Client: connect to the session host.
    pub fn client_connect(&mut self, host: &str, port: u16) -> Result<(), NetError> {
        self.transport
            .start_client(host, port, DEFAULT_CONNECT_TIMEOUT)?;
        self.is_host = false;
        self.synced = false;
        self.peers.push(0);
        Ok(())
    }

    /// Drain and handle transport events. Called from the emulation
    /// thread; `run_frame` also pumps this while waiting for inputs.
    pub fn process_network(&mut self) {
        if !self.transport.is_active() {
            return;
        }
        let mut events = Vec::new();
        self.transport.poll(Duration::ZERO, |event| events.push(event));
        for event in events {
            self.handle_event(event);
        }
    }

    // ---- input pipeline ----

    /// Schedule the local player's input for `current_frame + delay` and
    /// broadcast it.
    pub fn set_local_input(&mut self, input: InputFrame) {
        let mut input = input;
        input.frame = self.current_frame + self.input_delay;
        self.ring.set(self.local_id as usize, input);

        if self.transport.is_active() {
            let msg = InputMsg::Frame(input).encode();
            self.transport.broadcast(CHAN_INPUT, true, &msg);
            self.transport.flush();
        }
    }

    /// Run one frame on all instances in parallel. Blocks (pumping the
    /// network) until every player's input for the frame is ready; on a
    /// prolonged stall the frame is not advanced and 0 is returned.
    /// Returns the scanline count of the display instance.
    pub fn run_frame(&mut self) -> u32 {
        if !self.active || !self.synced || self.instances.is_none() {
            return 0;
        }

        let frame = self.current_frame;
        let stall_deadline = Instant::now() + INPUT_STALL_TIMEOUT;
        while !self.ring.ready_for(frame) {
            self.process_network();
            if !self.ring.wait_ready(frame, INPUT_WAIT_STEP)
                && Instant::now() >= stall_deadline
            {
                warn!(frame, "input stall, frame not advanced");
                return 0;
            }
        }

        self.apply_inputs(frame);

        let instances = self
            .instances
            .as_ref()
            .expect("instances checked above")
            .clone();
        self.start_workers(&instances);
        instances.barrier.wait(); // go
        instances.barrier.wait(); // done

        if frame > 0 && frame % self.desync_interval == 0 {
            self.desync_checkpoint(frame);
        }

        self.current_frame = frame + 1;
        instances.scanlines[self.local_id as usize].load(Ordering::Acquire)
    }

    fn apply_inputs(&mut self, frame: u32) {
        let Some(row) = self.ring.take_row(frame) else {
            return;
        };
        let instances = self.instances.as_ref().expect("instances exist");
        for (i, input) in row.iter().enumerate() {
            let mut console = instances.consoles[i].lock();
            console.set_key_mask(input.keys);
            if input.touching {
                console.touch(input.touch_x, input.touch_y);
            } else {
                console.release_touch();
            }
            console.set_lid_closed(input.lid_closed);
        }
    }

    fn start_workers(&mut self, instances: &Arc<Instances>) {
        if self.workers_started {
            return;
        }
        instances.workers_running.store(true, Ordering::Release);
        for idx in 0..self.num_players {
            let instances = Arc::clone(instances);
            let handle = thread::Builder::new()
                .name(format!("netplay-{idx}"))
                .spawn(move || worker_loop(instances, idx))
                .expect("spawning a netplay instance thread");
            self.workers.push(handle);
        }
        self.workers_started = true;
        info!(count = self.num_players, "instance threads started");
    }

    // ---- desync detection ----

    /// xxhash64 over every instance's main RAM and both CPU register
    /// files.
    pub fn state_hash(&self) -> u64 {
        let Some(instances) = self.instances.as_ref() else {
            return 0;
        };
        let mut hasher = Xxh64::new(0);
        for slot in &instances.consoles {
            let console = slot.lock();
            hasher.update(console.main_ram());
            for file in console.cpu_registers() {
                for reg in file {
                    hasher.update(&reg.to_le_bytes());
                }
            }
        }
        hasher.digest()
    }

    fn desync_checkpoint(&mut self, frame: u32) {
        let hash = self.state_hash();
        trace!(frame, hash = format_args!("{hash:016x}"), "state checkpoint");

        if self.transport.is_active() {
            let msg = NetplayMsg::DesyncAlert { frame, hash }.encode();
            self.transport.broadcast(CHAN_CONTROL, true, &msg);
            self.transport.flush();
        }

        if let Some(remote) = self.desync.note_local(frame, hash) {
            self.fire_desync(frame, hash, remote);
        }
    }

    fn fire_desync(&self, frame: u32, local: u64, remote: u64) {
        error!(
            frame,
            local = format_args!("{local:016x}"),
            remote = format_args!("{remote:016x}"),
            "desync detected"
        );
        if let Some(cb) = &self.on_desync {
            cb(frame, local, remote);
        }
    }

    // ---- event handling ----

    fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected { peer, .. } => {
                if !self.peers.contains(&peer) {
                    self.peers.push(peer);
                }
                if self.is_host {
                    debug!(peer, "client connected, offering session");
                    let offer = NetplayMsg::SessionOffer {
                        rom_hash: self.rom_hash,
                        num_players: self.num_players as u8,
                        input_delay: self.input_delay as u8,
                    };
                    self.transport
                        .send_to(peer, CHAN_CONTROL, true, &offer.encode());
                    self.transport.flush();
                }
            }
            TransportEvent::Disconnected { peer } => {
                self.peers.retain(|&p| p != peer);
                let player = self.player_of_peer(peer);
                info!(player, "netplay peer lost");
                if let Some(cb) = &self.on_disconnect {
                    cb(player, DisconnectReason::Normal);
                }
            }
            TransportEvent::Packet {
                peer,
                channel,
                data,
            } => {
                if channel == CHAN_CONTROL {
                    match NetplayMsg::decode(&data) {
                        Ok(msg) => self.handle_control(peer, msg),
                        Err(e) => warn!(peer, "malformed control message dropped: {e}"),
                    }
                } else {
                    match InputMsg::decode(&data) {
                        Ok(msg) => self.handle_input(peer, msg),
                        Err(e) => warn!(peer, "malformed input message dropped: {e}"),
                    }
                }
            }
        }
    }

    fn handle_control(&mut self, peer: usize, msg: NetplayMsg) {
        match msg {
            NetplayMsg::SessionOffer {
                rom_hash,
                num_players,
                input_delay,
            } => {
                info!(num_players, input_delay, "session offer received");
                if rom_hash != self.rom_hash {
                    warn!(
                        theirs = format_args!("{rom_hash:016x}"),
                        ours = format_args!("{:016x}", self.rom_hash),
                        "ROM hash differs from host"
                    );
                }
                let accept = NetplayMsg::SessionAccept {
                    player_id: self.local_id,
                };
                self.transport
                    .send_to(peer, CHAN_CONTROL, true, &accept.encode());
                self.transport.flush();
            }
            NetplayMsg::SessionAccept { player_id } => {
                info!(player_id, "session accepted, streaming states");
                if let Err(e) = self.host_send_states(peer) {
                    error!("state transfer to peer {peer} failed: {e}");
                }
            }
            NetplayMsg::BlobStart { blob_type, .. } => {
                self.current_blob = Some(blob_type);
                self.feed_blob(&msg);
            }
            NetplayMsg::BlobChunk { .. } | NetplayMsg::BlobEnd { .. } => {
                self.feed_blob(&msg);
            }
            NetplayMsg::SyncReady => {
                info!(peer, "peer is sync ready");
                if self.is_host {
                    let start = NetplayMsg::StartGame {
                        frame: self.current_frame,
                        input_delay: self.input_delay as u8,
                    };
                    self.transport
                        .send_to(peer, CHAN_CONTROL, true, &start.encode());
                    self.transport.flush();
                }
            }
            NetplayMsg::StartGame { frame, input_delay } => {
                info!(frame, input_delay, "game start");
                self.current_frame = frame;
                self.input_delay = u32::from(input_delay);
                self.ring.prefill(frame, self.input_delay);
            }
            NetplayMsg::DesyncAlert { frame, hash } => {
                if let Some(local) = self.desync.note_remote(frame, hash) {
                    self.fire_desync(frame, local, hash);
                }
            }
            NetplayMsg::Disconnect { reason } => {
                let player = self.player_of_peer(peer);
                info!(player, ?reason, "peer disconnecting");
                if let Some(cb) = &self.on_disconnect {
                    cb(player, reason);
                }
            }
        }
    }

    fn feed_blob(&mut self, msg: &NetplayMsg) {
        let Some(blob_type) = self.current_blob else {
            warn!("blob message outside a transfer dropped");
            return;
        };
        let receiver = &mut self.blob_receivers[blob_type.index()];
        match receiver.on_message(msg) {
            Ok(true) => {
                self.current_blob = None;
                if !self.is_host {
                    self.try_apply_states();
                }
            }
            Ok(false) => {}
            Err(e) => {
                // The client cannot enter the game without a clean state.
                error!("blob transfer failed: {e}");
                self.current_blob = None;
            }
        }
    }

    /// Client: once every instance's savestate is in, load them all, apply
    /// SRAM, and tell the host we are ready.
    fn try_apply_states(&mut self) {
        let all_in = (0..self.num_players)
            .all(|i| self.blob_receivers[BlobType::Savestate(i as u8).index()].is_complete());
        if !all_in {
            return;
        }
        let Some(instances) = self.instances.clone() else {
            return;
        };

        for i in 0..self.num_players {
            let data = self.blob_receivers[BlobType::Savestate(i as u8).index()]
                .take_data()
                .expect("completeness checked above");
            let mut console = instances.consoles[i].lock();
            if let Err(e) = console.load_state(&data) {
                error!(instance = i, "savestate rejected: {e}");
                return;
            }
        }

        if self.blob_receivers[BlobType::Sram.index()].is_complete() {
            if let Some(sram) = self.blob_receivers[BlobType::Sram.index()].take_data() {
                let mut console = instances.consoles[0].lock();
                if let Err(e) = console.set_sram(&sram) {
                    error!("SRAM rejected: {e}");
                }
            }
        }

        self.synced = true;
        info!("all states loaded, signaling sync ready");
        self.transport
            .broadcast(CHAN_CONTROL, true, &NetplayMsg::SyncReady.encode());
        self.transport.flush();
    }

    /// Host: serialize every instance and stream the blobs to a joining
    /// client, then its SRAM.
    fn host_send_states(&mut self, peer: usize) -> Result<(), NetError> {
        let instances = self.instances.as_ref().ok_or(NetError::NotActive)?;
        for i in 0..self.num_players {
            let state = instances.consoles[i].lock().save_state()?;
            send_blob(
                &self.transport,
                BlobTarget::Peer(peer),
                BlobType::Savestate(i as u8),
                &state,
            );
        }
        if let Some(sram) = instances.consoles[0].lock().sram() {
            send_blob(&self.transport, BlobTarget::Peer(peer), BlobType::Sram, &sram);
        }
        self.transport.flush();
        Ok(())
    }

    fn handle_input(&mut self, peer: usize, msg: InputMsg) {
        match msg {
            InputMsg::Frame(input) => self.route_remote_input(peer, input),
            InputMsg::Batch(inputs) => {
                for input in inputs {
                    self.route_remote_input(peer, input);
                }
            }
            InputMsg::Relay { player_id, input } => {
                // Only the host relays; a relayed id must be a real remote
                // player.
                if self.is_host
                    || player_id as usize >= self.num_players
                    || player_id == self.local_id
                {
                    trace!(player_id, "relay input dropped");
                    return;
                }
                self.ring.set(player_id as usize, input);
            }
        }
    }

    /// Host: a message from peer k carries player k+1's input. Client: a
    /// direct message carries the host's (player 0). The host relays each
    /// client input to the other clients so sessions beyond two players
    /// see every stream.
    fn route_remote_input(&mut self, peer: usize, input: InputFrame) {
        let player = if self.is_host { peer + 1 } else { 0 };
        if player >= self.num_players {
            warn!(peer, player, "input from unknown player dropped");
            return;
        }
        self.ring.set(player, input);

        if self.is_host && self.num_players > 2 {
            let relay = InputMsg::Relay {
                player_id: player as u8,
                input,
            }
            .encode();
            for &other in &self.peers {
                if other != peer {
                    self.transport.send_to(other, CHAN_INPUT, true, &relay);
                }
            }
        }
    }

    fn player_of_peer(&self, peer: usize) -> u8 {
        if self.is_host {
            (peer + 1) as u8
        } else {
            0
        }
    }

    // ---- queries / callbacks ----

    pub fn frame_num(&self) -> u32 {
        self.current_frame
    }

    pub fn local_player_id(&self) -> u8 {
        self.local_id
    }

    pub fn num_players(&self) -> usize {
        self.num_players
    }

    pub fn input_delay(&self) -> u32 {
        self.input_delay
    }

    pub fn is_host(&self) -> bool {
        self.is_host
    }

    /// Port the hosting transport is bound to.
    pub fn local_port(&self) -> Option<u16> {
        self.transport.local_port()
    }

    /// Client: whether the join-state transfer has completed.
    pub fn is_synced(&self) -> bool {
        self.synced
    }

    /// Scanlines of the most recent frame of instance `idx`.
    pub fn scanlines(&self, idx: usize) -> u32 {
        self.instances
            .as_ref()
            .and_then(|i| i.scanlines.get(idx))
            .map(|s| s.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    pub fn set_desync_callback(&mut self, cb: DesyncCallback) {
        self.on_desync = Some(cb);
    }

    pub fn set_disconnect_callback(&mut self, cb: DisconnectCallback) {
        self.on_disconnect = Some(cb);
    }

    /// Shorten the checkpoint interval (test hook; default 60).
    pub fn set_desync_interval(&mut self, frames: u32) {
        self.desync_interval = frames.max(1);
    }

    /// Cooperative teardown: release the workers, join them, drop the
    /// transport, clear session state.
    pub fn stop(&mut self) {
        if let Some(instances) = self.instances.take() {
            if self.workers_started {
                instances.workers_running.store(false, Ordering::Release);
                instances.barrier.wait();
                for handle in self.workers.drain(..) {
                    let _ = handle.join();
                }
                self.workers_started = false;
            }
            for i in 0..self.num_players {
                self.bus.end(i as u8);
            }
        }
        self.active = false;
        self.synced = self.is_host;
        self.transport.stop();
        self.peers.clear();
        info!("netplay session stopped");
    }
}

impl Drop for NetplayEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(instances: Arc<Instances>, idx: usize) {
    loop {
        instances.barrier.wait();
        if !instances.workers_running.load(Ordering::Acquire) {
            break;
        }
        let scanlines = instances.consoles[idx].lock().run_frame();
        instances.scanlines[idx].store(scanlines, Ordering::Release);
        instances.barrier.wait();
    }
    debug!(idx, "instance thread exiting");
}
