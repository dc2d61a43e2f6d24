//! Best-effort IGD port forwarding for hosted sessions.
//!
//! Every failure here is a warning, never an error: the session proceeds
//! without forwarding and LAN-local peers are unaffected.

use std::net::{SocketAddr, SocketAddrV4, UdpSocket};
use std::time::Duration;

use igd::{PortMappingProtocol, SearchOptions};
use parking_lot::Mutex;
use tracing::{info, warn};

const IGD_TIMEOUT: Duration = Duration::from_secs(2);
const MAPPING_DESCRIPTION: &str = "kestrel LAN";

/// Tracks at most one active UDP mapping.
#[derive(Default)]
pub struct PortMapper {
    mapped_port: Mutex<Option<u16>>,
}

impl PortMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to forward `port`. Returns whether a mapping now exists.
    pub fn forward(&self, port: u16) -> bool {
        let gateway = match igd::search_gateway(SearchOptions {
            timeout: Some(IGD_TIMEOUT),
            ..Default::default()
        }) {
            Ok(g) => g,
            Err(e) => {
                warn!("no IGD gateway found: {e}");
                return false;
            }
        };

        let Some(local_ip) = local_ipv4_toward(gateway.addr) else {
            warn!("could not determine local address toward gateway");
            return false;
        };

        match gateway.add_port(
            PortMappingProtocol::UDP,
            port,
            SocketAddrV4::new(local_ip, port),
            0,
            MAPPING_DESCRIPTION,
        ) {
            Ok(()) => {
                info!(port, %local_ip, "UPnP port forwarded");
                *self.mapped_port.lock() = Some(port);
                true
            }
            Err(e) => {
                warn!(port, "UPnP port mapping failed: {e}");
                false
            }
        }
    }

    /// Remove the forwarding for `port` if it is the one we added.
    pub fn remove(&self, port: u16) {
        {
            let mut mapped = self.mapped_port.lock();
            if *mapped != Some(port) {
                return;
            }
            *mapped = None;
        }

        let gateway = match igd::search_gateway(SearchOptions {
            timeout: Some(IGD_TIMEOUT),
            ..Default::default()
        }) {
            Ok(g) => g,
            Err(e) => {
                warn!("IGD gateway lost during port removal: {e}");
                return;
            }
        };
        match gateway.remove_port(PortMappingProtocol::UDP, port) {
            Ok(()) => info!(port, "UPnP mapping removed"),
            Err(e) => warn!(port, "UPnP mapping removal failed: {e}"),
        }
    }

    pub fn is_active(&self) -> bool {
        self.mapped_port.lock().is_some()
    }
}

/// The local IPv4 the OS would route toward `dest` from.
fn local_ipv4_toward(dest: SocketAddrV4) -> Option<std::net::Ipv4Addr> {
    let socket = UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], 0))).ok()?;
    socket.connect(dest).ok()?;
    match socket.local_addr().ok()? {
        SocketAddr::V4(addr) => Some(*addr.ip()),
        SocketAddr::V6(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remove_without_mapping_is_a_no_op() {
        let mapper = PortMapper::new();
        assert!(!mapper.is_active());
        // Must not attempt gateway discovery for a port we never mapped.
        mapper.remove(7064);
        assert!(!mapper.is_active());
    }
}
