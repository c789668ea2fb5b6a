//! # UDP Transport
//!
//! The socket side of a node. One [`UdpTransport`] wraps the bound UDP
//! socket and is handed to the switch as its [`Transport`]; the node actor
//! reads from a clone of the same socket.
//!
//! | Path kind | Handling |
//! |-----------|----------|
//! | `ipv4`, `ipv6` | `try_send_to` on the shared socket |
//! | `http`, `webrtc` | no carrier in this crate, dropped |
//! | `relay`, `bridge` | never reach the transport |
//!
//! Sends never await. A full socket buffer drops the datagram and the
//! channel layer retransmits.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tracing::{debug, trace};

use crate::path::Path;
use crate::protocols::Transport;

/// Largest datagram read off the socket.
pub const MAX_DATAGRAM: usize = 64 * 1024;

#[derive(Clone, Debug)]
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
}

impl UdpTransport {
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
        })
    }

    pub fn socket(&self) -> Arc<UdpSocket> {
        self.socket.clone()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Paths other hosts can use to reach this socket.
    ///
    /// A socket bound to a specific address yields exactly that address.
    /// An unspecified bind discovers the outbound interface address by
    /// connecting a throwaway UDP socket (nothing is sent), and always adds
    /// loopback.
    pub fn routable_paths(&self) -> Vec<Path> {
        let ip = self.local_addr.ip();
        let port = self.local_addr.port();
        if !ip.is_unspecified() {
            return vec![Path::from_socket_addr(self.local_addr)];
        }

        let mut paths = Vec::new();
        let probes: &[(&str, &str)] = if ip.is_ipv4() {
            &[("0.0.0.0:0", "8.8.8.8:53"), ("0.0.0.0:0", "1.1.1.1:53")]
        } else {
            &[("[::]:0", "[2001:4860:4860::8888]:53"), ("[::]:0", "[2606:4700:4700::1111]:53")]
        };
        for (bind, target) in probes {
            if let Ok(socket) = std::net::UdpSocket::bind(bind)
                && socket.connect(target).is_ok()
                && let Ok(local) = socket.local_addr()
            {
                let found = local.ip();
                if !found.is_loopback() && !found.is_unspecified() {
                    let path = Path::from_socket_addr(SocketAddr::new(found, port));
                    if !paths.contains(&path) {
                        paths.push(path);
                    }
                }
            }
        }

        let loopback = if ip.is_ipv4() {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        } else {
            IpAddr::V6(Ipv6Addr::LOCALHOST)
        };
        paths.push(Path::from_socket_addr(SocketAddr::new(loopback, port)));
        paths
    }
}

impl Transport for UdpTransport {
    fn send(&mut self, path: &Path, bytes: Vec<u8>) {
        let Some(addr) = path.socket_addr() else {
            trace!(path = %path, "no carrier for path, dropping datagram");
            return;
        };
        match self.socket.try_send_to(&bytes, addr) {
            Ok(_) => trace!(to = %addr, len = bytes.len(), "datagram sent"),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                debug!(to = %addr, "socket buffer full, dropping datagram");
            }
            Err(e) => debug!(to = %addr, error = %e, "send failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn specific_bind_reports_itself() {
        let transport = UdpTransport::bind("127.0.0.1:0".parse().expect("addr"))
            .await
            .expect("bind");
        let paths = transport.routable_paths();
        assert_eq!(paths, vec![Path::from_socket_addr(transport.local_addr())]);
    }

    #[tokio::test]
    async fn sends_to_direct_paths_only() {
        let mut a = UdpTransport::bind("127.0.0.1:0".parse().expect("addr"))
            .await
            .expect("bind");
        let b = UdpTransport::bind("127.0.0.1:0".parse().expect("addr"))
            .await
            .expect("bind");

        a.send(&Path::Http { http: "http://127.0.0.1:1".into() }, vec![9]);
        a.send(&Path::from_socket_addr(b.local_addr()), vec![1, 2, 3]);

        let mut buf = [0u8; 16];
        let (len, from) = b.socket().recv_from(&mut buf).await.expect("recv");
        assert_eq!(&buf[..len], &[1, 2, 3]);
        assert_eq!(from, a.local_addr());
    }
}
