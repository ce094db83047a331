//! LAN Discovery
//!
//! A relay with discovery enabled broadcasts `E2EE-SERVER:<ipv4>:<port>`
//! once per interval; clients listen for one announcement before falling
//! back to a local relay.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket as StdUdpSocket};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;

/// Well-known discovery port, used by both broadcaster and listener
pub const DISCOVERY_PORT: u16 = 9999;

pub const ANNOUNCE_PREFIX: &str = "E2EE-SERVER:";

/// Announcement datagram body
pub fn announcement(ip: Ipv4Addr, port: u16) -> String {
    format!("{}{}:{}", ANNOUNCE_PREFIX, ip, port)
}

/// Parse an announcement; anything else is ignored
pub fn parse_announcement(datagram: &str) -> Option<SocketAddr> {
    let rest = datagram.trim().strip_prefix(ANNOUNCE_PREFIX)?;
    let (ip, port) = rest.rsplit_once(':')?;
    let ip: Ipv4Addr = ip.parse().ok()?;
    let port: u16 = port.parse().ok()?;
    if port == 0 {
        return None;
    }
    Some(SocketAddr::V4(SocketAddrV4::new(ip, port)))
}

/// The address other LAN hosts can reach us on.
///
/// Connecting a UDP socket selects a route without sending anything.
pub fn local_ipv4() -> Ipv4Addr {
    let routed = || -> io::Result<Ipv4Addr> {
        let socket = StdUdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.connect((Ipv4Addr::new(10, 254, 254, 254), 1))?;
        match socket.local_addr()? {
            SocketAddr::V4(addr) if !addr.ip().is_unspecified() => Ok(*addr.ip()),
            _ => Err(io::Error::new(io::ErrorKind::Other, "no IPv4 route")),
        }
    };
    routed().unwrap_or(Ipv4Addr::LOCALHOST)
}

/// Announce `bound_port` to `target` every `interval` until `shutdown`
/// flips to true. `target` is normally `255.255.255.255:<discovery port>`.
pub async fn run_broadcaster(
    target: SocketAddrV4,
    bound_port: u16,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.set_broadcast(true)?;
    let message = announcement(local_ipv4(), bound_port);
    log::info!("Announcing {} to UDP {}", message, target);

    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = socket.send_to(message.as_bytes(), target).await {
                    log::debug!("Discovery broadcast failed: {}", e);
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    log::debug!("Discovery broadcaster stopped");
    Ok(())
}

/// Bound discovery socket
pub struct DiscoveryListener {
    socket: UdpSocket,
}

impl DiscoveryListener {
    pub async fn bind(port: u16) -> io::Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).await?;
        Ok(Self { socket })
    }

    pub fn local_port(&self) -> io::Result<u16> {
        Ok(self.socket.local_addr()?.port())
    }

    /// Wait up to `timeout` for a valid announcement. Unrelated datagrams
    /// are skipped without extending the deadline.
    pub async fn recv_announcement(&self, timeout: Duration) -> io::Result<Option<SocketAddr>> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut buf = [0u8; 512];
        loop {
            let received =
                tokio::time::timeout_at(deadline, self.socket.recv_from(&mut buf)).await;
            let (len, from) = match received {
                Err(_) => return Ok(None),
                Ok(result) => result?,
            };
            let datagram = String::from_utf8_lossy(&buf[..len]);
            match parse_announcement(&datagram) {
                Some(addr) => {
                    log::info!("Discovered relay {} (announced by {})", addr, from);
                    return Ok(Some(addr));
                }
                None => log::debug!("Ignoring datagram from {}: {:?}", from, datagram),
            }
        }
    }
}

/// Listen once on `port` for up to `timeout`
pub async fn listen_once(port: u16, timeout: Duration) -> io::Result<Option<SocketAddr>> {
    DiscoveryListener::bind(port)
        .await?
        .recv_announcement(timeout)
        .await
}
