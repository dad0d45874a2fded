//! Outbound sockets behind one capability interface.
//!
//! Every relay talks to the outside world through a `Box<dyn SocketOps>`.
//! The closed set of backends is chosen once per connection by the
//! dispatcher: direct TCP/UDP, SOCKS5 CONNECT, SOCKS5 UDP ASSOCIATE,
//! HTTP CONNECT and DNS-over-TCP. All of them are non-blocking and report
//! would-block as `io::ErrorKind::WouldBlock`.

pub mod direct;
pub mod http;
pub mod interest;
pub mod socks5;
pub(crate) mod stream;
pub mod tcpdns;

use std::io;
use std::net::{Shutdown, SocketAddr};

use bitflags::bitflags;

pub use direct::{DirectTcp, DirectUdp};
pub use http::{BasicAuth, HttpConnect};
pub use interest::Registration;
pub use socks5::{Socks5Auth, Socks5Tcp, Socks5Udp};
pub use tcpdns::DnsOverTcp;

bitflags! {
    /// Readiness as seen by the relays.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Ready: u8 {
        const READABLE = 1 << 0;
        const WRITABLE = 1 << 1;
        const ERROR = 1 << 2;
        const HUP = 1 << 3;
    }
}

impl Ready {
    /// relay 可登记的两种事件
    pub const IO: Ready = Ready::READABLE.union(Ready::WRITABLE);

    pub fn from_event(event: &mio::event::Event) -> Self {
        let mut ready = Ready::empty();
        if event.is_readable() {
            ready |= Ready::READABLE;
        }
        if event.is_writable() {
            ready |= Ready::WRITABLE;
        }
        if event.is_error() {
            ready |= Ready::ERROR;
        }
        // 仅对端 FIN 视为可读（读到 EOF）
        if event.is_read_closed() && event.is_write_closed() {
            ready |= Ready::HUP;
        }
        ready
    }
}

/// Uniform outbound transport capability.
pub trait SocketOps {
    /// Begin connecting to `target`. Completion is reported through later
    /// readiness.
    fn connect(&mut self, target: SocketAddr) -> io::Result<()>;

    /// Non-blocking read. `Ok(0)` is orderly EOF for stream backends.
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Non-blocking write; may be partial for stream backends.
    fn send(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Half-close one direction without releasing the socket.
    fn shutdown(&mut self, how: Shutdown) -> io::Result<()>;

    /// 开启或关闭 READABLE / WRITABLE 通知
    fn evctl(&mut self, interest: Ready, enabled: bool);

    /// 当前登记的关注事件
    fn interest(&self) -> Ready;

    /// Let the backend consume readiness for its own connect or proxy
    /// handshake. Returns what the relay should act on; a failed handshake
    /// comes back as `ERROR`.
    fn handle_event(&mut self, ready: Ready) -> Ready {
        ready
    }

    /// 释放全部资源，可重复调用
    fn destroy(&mut self);

    fn name(&self) -> &'static str;
}

/// Run raw readiness through the backend and drop the bits the relay has
/// not armed. Error and hangup always pass.
pub fn deliver(socket: &mut dyn SocketOps, raw: Ready) -> Ready {
    let ready = socket.handle_event(raw);
    ready & (socket.interest() | Ready::ERROR | Ready::HUP)
}


#[cfg(test)]
mod tests {
    use super::mock::MockSocket;
    use super::*;

    #[test]
    fn deliver_filters_unarmed_bits() {
        let (mut sock, _state) = MockSocket::new();
        sock.evctl(Ready::READABLE, true);

        let ready = deliver(&mut sock, Ready::READABLE | Ready::WRITABLE);
        assert_eq!(ready, Ready::READABLE);

        let ready = deliver(&mut sock, Ready::WRITABLE | Ready::HUP);
        assert_eq!(ready, Ready::HUP);

        sock.evctl(Ready::READABLE, false);
        assert_eq!(deliver(&mut sock, Ready::READABLE | Ready::ERROR), Ready::ERROR);
    }

    #[test]
    fn io_bits() {
        assert_eq!(Ready::IO, Ready::READABLE | Ready::WRITABLE);
        assert!(!Ready::IO.intersects(Ready::ERROR | Ready::HUP));
    }
}
