//! Session discovery over UDP broadcast.
//!
//! A hosting session advertises itself once a second; listeners drain the
//! socket without blocking and keep a map of live sessions keyed by source
//! address. Freshness is judged by the *receiver's* clock: the sender tick
//! only orders beacons from one source, so clock skew between machines does
//! not matter.

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use kestrel_netproto::constants::DISCOVERY_PORT;
use kestrel_netproto::discovery::{Beacon, BEACON_WIRE_LEN};

use crate::error::NetError;

/// Beacons older than this (receiver clock) are evicted.
const BEACON_TTL: Duration = Duration::from_secs(5);

/// Interval between beacon broadcasts.
const BEACON_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// UDP port beacons are sent to (and listeners bind).
    pub port: u16,
    /// Broadcast destination. Tests point this at a unicast address.
    pub broadcast_addr: Ipv4Addr,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            port: DISCOVERY_PORT,
            broadcast_addr: Ipv4Addr::BROADCAST,
        }
    }
}

/// One entry of the discovery list.
#[derive(Debug, Clone)]
pub struct BeaconEntry {
    pub beacon: Beacon,
    /// When the newest beacon from this source arrived (receiver clock).
    pub received: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Advertiser,
    Listener,
}

/// The discovery socket of one session.
pub struct Discovery {
    cfg: DiscoveryConfig,
    socket: UdpSocket,
    role: Role,
    last_beacon: Mutex<Option<Instant>>,
    list: Mutex<BTreeMap<u32, BeaconEntry>>,
}

impl Discovery {
    /// Advertiser side: binds an ephemeral port, sends to the broadcast
    /// address.
    pub fn advertiser(cfg: DiscoveryConfig) -> Result<Self, NetError> {
        Self::bind(cfg, Role::Advertiser)
    }

    /// Listener side: binds the well-known discovery port.
    pub fn listener(cfg: DiscoveryConfig) -> Result<Self, NetError> {
        Self::bind(cfg, Role::Listener)
    }

    fn bind(cfg: DiscoveryConfig, role: Role) -> Result<Self, NetError> {
        let bind_port = match role {
            Role::Advertiser => 0,
            Role::Listener => cfg.port,
        };
        let socket = UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], bind_port)))?;
        socket.set_broadcast(true)?;
        socket.set_nonblocking(true)?;
        debug!(?role, port = cfg.port, "discovery socket up");
        Ok(Self {
            cfg,
            socket,
            role,
            last_beacon: Mutex::new(None),
            list: Mutex::new(BTreeMap::new()),
        })
    }

    /// Advertise the session. Rate-limited internally to one beacon per
    /// second; call once per frame.
    pub fn tick_advertise(&self, beacon: &Beacon) {
        if self.role != Role::Advertiser {
            return;
        }
        {
            let mut last = self.last_beacon.lock();
            if let Some(t) = *last {
                if t.elapsed() < BEACON_INTERVAL {
                    return;
                }
            }
            *last = Some(Instant::now());
        }

        let mut buf = [0u8; BEACON_WIRE_LEN];
        beacon.encode_into(&mut buf);
        let dest = SocketAddrV4::new(self.cfg.broadcast_addr, self.cfg.port);
        if let Err(e) = self.socket.send_to(&buf, dest) {
            warn!("beacon send failed: {e}");
        }
    }

    /// Drain received beacons and evict expired entries; call once per
    /// frame on the listening side.
    pub fn tick_listen(&self) {
        if self.role != Role::Listener {
            return;
        }
        let now = Instant::now();
        let mut list = self.list.lock();

        let mut buf = [0u8; 512];
        loop {
            let (len, from) = match self.socket.recv_from(&mut buf) {
                Ok(r) => r,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("discovery recv failed: {e}");
                    break;
                }
            };
            let SocketAddr::V4(from) = from else { continue };
            let beacon = match Beacon::decode(&buf[..len]) {
                Ok(b) => b,
                Err(e) => {
                    trace!("beacon dropped: {e}");
                    continue;
                }
            };
            let key = u32::from(*from.ip());
            // An older (or replayed) beacon from a known source is stale.
            if let Some(existing) = list.get(&key) {
                if beacon.tick <= existing.beacon.tick {
                    continue;
                }
            }
            list.insert(
                key,
                BeaconEntry {
                    beacon,
                    received: now,
                },
            );
        }

        list.retain(|_, entry| now.duration_since(entry.received) < BEACON_TTL);
    }

    /// Copy of the current discovery list, keyed by source IPv4.
    pub fn snapshot(&self) -> BTreeMap<u32, BeaconEntry> {
        self.list.lock().clone()
    }

    pub fn clear(&self) {
        self.list.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_netproto::discovery::SessionStatus;

    fn beacon(tick: u32) -> Beacon {
        Beacon {
            tick,
            session_name: "test game".into(),
            num_players: 1,
            max_players: 4,
            status: SessionStatus::Waiting,
        }
    }

    fn localhost_pair() -> (Discovery, Discovery) {
        // Listener on an ephemeral port, advertiser aimed straight at it.
        let listener = Discovery::bind(
            DiscoveryConfig {
                port: 0,
                broadcast_addr: Ipv4Addr::LOCALHOST,
            },
            Role::Listener,
        )
        .unwrap();
        let port = listener.socket.local_addr().unwrap().port();
        let advertiser = Discovery::advertiser(DiscoveryConfig {
            port,
            broadcast_addr: Ipv4Addr::LOCALHOST,
        })
        .unwrap();
        (advertiser, listener)
    }

    #[test]
    fn beacon_reaches_listener() {
        let (advertiser, listener) = localhost_pair();

        advertiser.tick_advertise(&beacon(1));
        std::thread::sleep(Duration::from_millis(50));
        listener.tick_listen();

        let list = listener.snapshot();
        assert_eq!(list.len(), 1);
        let entry = list.values().next().unwrap();
        assert_eq!(entry.beacon.session_name, "test game");
        assert_eq!(entry.beacon.max_players, 4);
        assert_eq!(entry.beacon.num_players, 1);
    }

    #[test]
    fn older_tick_from_same_source_ignored() {
        let (advertiser, listener) = localhost_pair();

        advertiser.tick_advertise(&beacon(10));
        std::thread::sleep(Duration::from_millis(50));
        listener.tick_listen();

        // Bypass the rate limiter by resetting it, then send an older tick.
        *advertiser.last_beacon.lock() = None;
        advertiser.tick_advertise(&beacon(5));
        std::thread::sleep(Duration::from_millis(50));
        listener.tick_listen();

        let list = listener.snapshot();
        assert_eq!(list.values().next().unwrap().beacon.tick, 10);
    }

    #[test]
    fn advertise_is_rate_limited() {
        let (advertiser, listener) = localhost_pair();
        advertiser.tick_advertise(&beacon(1));
        advertiser.tick_advertise(&beacon(2));
        advertiser.tick_advertise(&beacon(3));
        std::thread::sleep(Duration::from_millis(50));
        listener.tick_listen();
        assert_eq!(listener.snapshot().values().next().unwrap().beacon.tick, 1);
    }

    #[test]
    fn garbage_datagrams_ignored() {
        let (advertiser, listener) = localhost_pair();
        let dest = SocketAddrV4::new(
            Ipv4Addr::LOCALHOST,
            listener.socket.local_addr().unwrap().port(),
        );
        advertiser.socket.send_to(&[0u8; 10], dest).unwrap();
        advertiser.socket.send_to(&[0xFFu8; 100], dest).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        listener.tick_listen();
        assert!(listener.snapshot().is_empty());
    }
}
