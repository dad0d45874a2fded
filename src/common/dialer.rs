//! Outbound socket construction.
//!
//! Every relayed connection leaves the host through a socket built here.
//! The socket options applied before connecting keep that traffic from
//! being routed straight back into the TUN device:
//!
//! - Routing mark (Linux SO_MARK / fwmark) for policy routing
//! - Bind to a specific interface (SO_BINDTODEVICE)
//!
//! Sockets are created non-blocking and handed to mio; connect completion
//! is observed as writable readiness.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use serde::Deserialize;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::debug;

/// Dialer configuration (`outbound:` section).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DialerConfig {
    /// Bind to a specific network interface name (e.g., "eth0", "wlan0").
    pub interface: Option<String>,

    /// Routing mark (Linux SO_MARK / fwmark).
    pub mark: Option<u32>,
}

/// Builds non-blocking outbound sockets with the configured options applied.
#[derive(Debug, Clone, Default)]
pub struct Dialer {
    config: DialerConfig,
}

impl Dialer {
    pub fn new(config: DialerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DialerConfig {
        &self.config
    }

    /// Start a non-blocking TCP connect. The returned stream is usually
    /// still connecting.
    pub fn tcp(&self, addr: SocketAddr) -> io::Result<mio::net::TcpStream> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        self.apply(&socket)?;
        socket.set_nonblocking(true)?;
        // proxy traffic is latency sensitive
        socket.set_nodelay(true)?;

        match socket.connect(&SockAddr::from(addr)) {
            Ok(()) => {}
            Err(e) if is_in_progress(&e) => {}
            Err(e) => return Err(e),
        }

        debug!(
            addr = %addr,
            interface = self.config.interface.as_deref().unwrap_or("-"),
            mark = self.config.mark.unwrap_or(0),
            "dialer tcp connecting"
        );
        Ok(mio::net::TcpStream::from_std(socket.into()))
    }

    /// Open a UDP socket connected to `addr`.
    pub fn udp(&self, addr: SocketAddr) -> io::Result<mio::net::UdpSocket> {
        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
        self.apply(&socket)?;
        socket.set_nonblocking(true)?;
        socket.bind(&SockAddr::from(unspecified_for(addr)))?;
        socket.connect(&SockAddr::from(addr))?;

        debug!(
            addr = %addr,
            interface = self.config.interface.as_deref().unwrap_or("-"),
            mark = self.config.mark.unwrap_or(0),
            "dialer udp connected"
        );
        Ok(mio::net::UdpSocket::from_std(socket.into()))
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn apply(&self, socket: &Socket) -> io::Result<()> {
        if let Some(mark) = self.config.mark {
            socket.set_mark(mark)?;
        }
        if let Some(ref iface) = self.config.interface {
            socket.bind_device(Some(iface.as_bytes()))?;
        }
        Ok(())
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    fn apply(&self, _socket: &Socket) -> io::Result<()> {
        if self.config.mark.is_some() || self.config.interface.is_some() {
            tracing::warn!("outbound mark/interface are only supported on Linux, ignoring");
        }
        Ok(())
    }
}

fn unspecified_for(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    }
}

fn is_in_progress(err: &io::Error) -> bool {
    #[cfg(target_os = "linux")]
    if err.raw_os_error() == Some(libc::EINPROGRESS) {
        return true;
    }
    err.kind() == io::ErrorKind::WouldBlock
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::time::Duration;

    #[test]
    fn dialer_config_defaults() {
        let config = DialerConfig::default();
        assert!(config.interface.is_none());
        assert!(config.mark.is_none());
    }

    #[test]
    fn dialer_config_deserialize() {
        let yaml = r#"
interface: eth0
mark: 0x1
"#;
        let config: DialerConfig = serde_yml::from_str(yaml).unwrap();
        assert_eq!(config.interface.as_deref(), Some("eth0"));
        assert_eq!(config.mark, Some(1));
    }

    #[test]
    fn dialer_tcp_connects_localhost() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let dialer = Dialer::default();
        let mut stream = dialer.tcp(addr).unwrap();
        let (mut accepted, _) = listener.accept().unwrap();

        // the connect may still be completing; retry until the write lands
        let mut wrote = false;
        for _ in 0..100 {
            match stream.write(b"ping") {
                Ok(4) => {
                    wrote = true;
                    break;
                }
                _ => std::thread::sleep(Duration::from_millis(5)),
            }
        }
        assert!(wrote);

        let mut buf = [0u8; 4];
        accepted.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[test]
    fn dialer_udp_is_connected() {
        let peer = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let dialer = Dialer::default();
        let socket = dialer.udp(peer.local_addr().unwrap()).unwrap();
        assert_eq!(socket.peer_addr().unwrap(), peer.local_addr().unwrap());

        socket.send(b"hello").unwrap();
        let mut buf = [0u8; 16];
        let (n, from) = peer.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(from, socket.local_addr().unwrap());
    }
}
