//! The authoritative participant table of a LAN session.
//!
//! Sixteen fixed slots under a mutex, plus an atomic 16-bit "in game"
//! bitmask. The bitmask uses relaxed ordering: its consistency with the
//! table is re-established by the reliable channel's delivery order, and
//! consumers re-read both (see the notes in DESIGN.md).

use std::sync::atomic::{AtomicU16, Ordering};

use parking_lot::Mutex;

use kestrel_netproto::constants::{LOCALHOST, MAX_PLAYERS};
use kestrel_netproto::player::{Player, PlayerStatus};

#[derive(Default)]
struct TableInner {
    slots: Box<[Player; MAX_PLAYERS]>,
    num_players: u8,
}

/// Participant table plus connected bitmask.
#[derive(Default)]
pub struct PlayerTable {
    inner: Mutex<TableInner>,
    connected: AtomicU16,
}

impl PlayerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the local host at slot 0.
    pub fn install_host(&self, name: &str, mp_port: u16) {
        let mut inner = self.inner.lock();
        *inner = TableInner::default();
        inner.slots[0] = Player {
            id: 0,
            status: PlayerStatus::Host,
            name: name.into(),
            address: LOCALHOST,
            mp_port,
            ping_ms: 0,
            is_local: false,
        };
        inner.num_players = 1;
    }

    /// Host side: claim the lowest free slot for a connecting peer.
    /// Returns `None` when the session is at `max_players`.
    pub fn allocate(&self, address: u32, max_players: u8) -> Option<u8> {
        let mut inner = self.inner.lock();
        if inner.num_players >= max_players || inner.num_players as usize >= MAX_PLAYERS {
            return None;
        }
        let id = (0..MAX_PLAYERS).find(|&i| !inner.slots[i].status.occupied())? as u8;
        inner.slots[id as usize] = Player {
            id,
            status: PlayerStatus::Connecting,
            name: String::new(),
            address,
            mp_port: 0,
            ping_ms: 0,
            is_local: false,
        };
        inner.num_players += 1;
        Some(id)
    }

    /// Host side: a client's PlayerInfo arrived; promote the slot.
    pub fn set_info(&self, id: u8, name: &str, address: u32, mp_port: u16) {
        let mut inner = self.inner.lock();
        let slot = &mut inner.slots[id as usize];
        slot.id = id;
        slot.name = name.into();
        slot.address = address;
        slot.mp_port = mp_port;
        slot.status = PlayerStatus::Client;
    }

    /// Host side: free the slot of a lost peer.
    pub fn clear_slot(&self, id: u8) {
        let mut inner = self.inner.lock();
        let slot = &mut inner.slots[id as usize];
        if slot.status.occupied() {
            *slot = Player::default();
            inner.num_players = inner.num_players.saturating_sub(1);
        }
    }

    /// Client side: mark a lost peer without freeing the slot (the host's
    /// next PlayerList is authoritative).
    pub fn mark_disconnected(&self, id: u8) {
        let mut inner = self.inner.lock();
        let slot = &mut inner.slots[id as usize];
        if slot.status.occupied() {
            slot.status = PlayerStatus::Disconnected;
        }
    }

    /// Client side: install the host's broadcast table wholesale.
    pub fn replace_all(&self, players: &[Player; MAX_PLAYERS], num_players: u8) {
        let mut inner = self.inner.lock();
        *inner.slots = players.clone();
        inner.num_players = num_players;
    }

    /// Find the occupied client slot with the given address (peer-mesh
    /// connect matching). The local player's own slot never matches.
    pub fn client_slot_by_address(&self, address: u32, local_id: u8) -> Option<u8> {
        let inner = self.inner.lock();
        (0..MAX_PLAYERS)
            .map(|i| &inner.slots[i])
            .find(|p| p.id != local_id && p.status == PlayerStatus::Client && p.address == address)
            .map(|p| p.id)
    }

    /// Occupied slots other than the local player that still lack a peer
    /// connection, per the caller's predicate.
    pub fn clients_needing_peers(&self, local_id: u8, has_peer: impl Fn(u8) -> bool) -> Vec<Player> {
        let inner = self.inner.lock();
        inner
            .slots
            .iter()
            .filter(|p| p.status == PlayerStatus::Client && p.id != local_id && !has_peer(p.id))
            .cloned()
            .collect()
    }

    pub fn get(&self, id: u8) -> Option<Player> {
        let inner = self.inner.lock();
        let slot = &inner.slots[id as usize];
        slot.status.occupied().then(|| slot.clone())
    }

    pub fn num_players(&self) -> u8 {
        self.inner.lock().num_players
    }

    /// Raw copy of all 16 slots (for PlayerList broadcasts).
    pub fn raw_slots(&self) -> Box<[Player; MAX_PLAYERS]> {
        self.inner.lock().slots.clone()
    }

    /// UI snapshot: occupied slots only, with the local player's address
    /// rewritten to loopback and `is_local` set, and the host's address
    /// rewritten to the address this machine reaches it at.
    pub fn snapshot_for_ui(&self, local_id: u8, host_address: u32) -> Vec<Player> {
        let inner = self.inner.lock();
        inner
            .slots
            .iter()
            .filter(|p| p.status.occupied())
            .map(|p| {
                let mut p = p.clone();
                if p.id == local_id {
                    p.is_local = true;
                    p.address = LOCALHOST;
                } else if p.status == PlayerStatus::Host {
                    p.address = host_address;
                }
                p
            })
            .collect()
    }

    pub fn refresh_ping(&self, id: u8, ping_ms: u32) {
        let mut inner = self.inner.lock();
        let slot = &mut inner.slots[id as usize];
        if slot.status.occupied() {
            slot.ping_ms = ping_ms;
        }
    }

    pub fn clear(&self) {
        *self.inner.lock() = TableInner::default();
        self.connected.store(0, Ordering::Relaxed);
    }

    // ---- connected bitmask ----

    pub fn mark_in_game(&self, id: u8) {
        self.connected.fetch_or(1 << id, Ordering::Relaxed);
    }

    pub fn mark_left_game(&self, id: u8) {
        self.connected.fetch_and(!(1 << id), Ordering::Relaxed);
    }

    pub fn connected_mask(&self) -> u16 {
        self.connected.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_occupies_slot_zero() {
        let table = PlayerTable::new();
        table.install_host("h", 7064);
        let host = table.get(0).unwrap();
        assert_eq!(host.status, PlayerStatus::Host);
        assert_eq!(host.id, 0);
        assert_eq!(table.num_players(), 1);
        // exactly one host in the table
        let hosts = table
            .raw_slots()
            .iter()
            .filter(|p| p.status == PlayerStatus::Host)
            .count();
        assert_eq!(hosts, 1);
    }

    #[test]
    fn allocate_returns_lowest_free_id() {
        let table = PlayerTable::new();
        table.install_host("h", 7064);
        assert_eq!(table.allocate(1, 16), Some(1));
        assert_eq!(table.allocate(2, 16), Some(2));
        table.clear_slot(1);
        assert_eq!(table.allocate(3, 16), Some(1));
    }

    #[test]
    fn seventeenth_connect_is_rejected() {
        let table = PlayerTable::new();
        table.install_host("h", 7064);
        for i in 1..16 {
            assert_eq!(table.allocate(i as u32, 16), Some(i as u8));
        }
        assert_eq!(table.num_players(), 16);
        assert_eq!(table.allocate(99, 16), None);
        // existing players unaffected
        assert_eq!(table.num_players(), 16);
        assert!(table.get(15).is_some());
    }

    #[test]
    fn capacity_below_table_size_is_honored() {
        let table = PlayerTable::new();
        table.install_host("h", 7064);
        assert_eq!(table.allocate(1, 2), Some(1));
        assert_eq!(table.allocate(2, 2), None);
    }

    #[test]
    fn ui_snapshot_rewrites_addresses() {
        let table = PlayerTable::new();
        table.install_host("h", 7064);
        let id = table.allocate(0x0A00_0002, 16).unwrap();
        table.set_info(id, "c1", 0x0A00_0002, 40001);

        // as seen from the client (local id 1, host reached at 0x0A000001)
        let list = table.snapshot_for_ui(1, 0x0A00_0001);
        assert_eq!(list.len(), 2);
        let host = list.iter().find(|p| p.id == 0).unwrap();
        let me = list.iter().find(|p| p.id == 1).unwrap();
        assert_eq!(host.address, 0x0A00_0001);
        assert!(!host.is_local);
        assert_eq!(me.address, LOCALHOST);
        assert!(me.is_local);
    }

    #[test]
    fn bitmask_follows_game_membership() {
        let table = PlayerTable::new();
        table.install_host("h", 7064);
        let id = table.allocate(5, 16).unwrap();
        table.set_info(id, "c", 5, 40002);

        table.mark_in_game(0);
        table.mark_in_game(id);
        assert_eq!(table.connected_mask(), 0b11);

        // every set bit corresponds to an occupied Host/Client slot
        for bit in 0..16u8 {
            if table.connected_mask() & (1 << bit) != 0 {
                let p = table.get(bit).unwrap();
                assert!(matches!(p.status, PlayerStatus::Host | PlayerStatus::Client));
            }
        }

        table.mark_left_game(id);
        assert_eq!(table.connected_mask(), 0b01);
        table.clear();
        assert_eq!(table.connected_mask(), 0);
    }
}
