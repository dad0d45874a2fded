//! Userspace TCP/IP stack for the TUN device.
//!
//! smoltcp terminates TCP; UDP is lifted straight out of the IP packets.
//! The rest of the crate only sees lifecycle events ([`StackEvent`]) and
//! the PCB views in [`pcb`], which emulate the classic lwIP control block:
//! explicit receive-window credit, send buffer headroom and
//! acknowledgment callbacks.

pub mod chain;
pub(crate) mod device;
pub mod netstack;
pub mod pcb;
pub mod wire;

use std::fmt;
use std::net::SocketAddr;

use smoltcp::iface::SocketHandle;
use thiserror::Error;

pub use chain::SegmentChain;
pub use netstack::{Stack, StackConfig, StackTcp, StackUdp};
pub use pcb::{TcpPcb, TcpState, UdpPcb};
pub use wire::DatagramOrigin;

/// Maximum segment size used for relay writes.
pub const TCP_MSS: usize = 1460;
/// Receive window credit per connection.
pub const TCP_WND: usize = 65535;
/// Send buffer per connection.
pub const TCP_SND_BUF: usize = 65535;
/// Send buffer headroom above which a paused reader is resumed.
pub const TCP_SNDLOWAT: usize = {
    let half = TCP_SND_BUF / 2;
    let floor = 2 * TCP_MSS + 1;
    let low = if half > floor { half } else { floor };
    if low < TCP_SND_BUF - 1 {
        low
    } else {
        TCP_SND_BUF - 1
    }
};
/// Segment budget of the send queue.
pub const TCP_SND_QUEUELEN: usize = 4 * TCP_SND_BUF / TCP_MSS;

/// Maximum number of concurrent TCP connections through the stack.
pub const MAX_TCP_CONNECTIONS: usize = 4096;

/// A transport flow as seen on the TUN side: `src` is the local client,
/// `dst` the destination it originally addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub src: SocketAddr,
    pub dst: SocketAddr,
}

impl FlowKey {
    pub fn new(src: SocketAddr, dst: SocketAddr) -> Self {
        Self { src, dst }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.src, self.dst)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StackError {
    #[error("send buffer exhausted")]
    OutOfMemory,

    #[error("connection is not writable")]
    NotConnected,

    #[error("malformed packet")]
    Malformed,

    #[error("packet of {0} bytes exceeds the MTU")]
    Oversized(usize),

    #[error("connection table full")]
    Exhausted,

    #[error("listen failed: {0}")]
    Listen(String),
}

impl From<smoltcp::wire::Error> for StackError {
    fn from(_: smoltcp::wire::Error) -> Self {
        StackError::Malformed
    }
}

/// One inbound UDP datagram and what is needed to answer it.
#[derive(Debug, Clone)]
pub struct Datagram {
    pub payload: SegmentChain,
    pub origin: DatagramOrigin,
}

impl Datagram {
    pub fn key(&self) -> FlowKey {
        self.origin.key
    }
}

/// Lifecycle events, in the order the stack observed them.
#[derive(Debug)]
pub enum StackEvent {
    /// Handshake completed for a new connection.
    TcpNew { handle: SocketHandle, key: FlowKey },
    /// In-order bytes from the client, bounded by the receive credit.
    TcpData { handle: SocketHandle, chain: SegmentChain },
    /// `len` bytes previously written by the relay were acknowledged.
    TcpAcked { handle: SocketHandle, len: usize },
    /// The client sent FIN and every byte before it was delivered.
    TcpClosed { handle: SocketHandle },
    /// The connection vanished under an attached relay (RST or timeout).
    TcpReset { handle: SocketHandle },
    /// The control block is gone; the relay can be reaped.
    TcpReleased { handle: SocketHandle },
    UdpDatagram { datagram: Datagram },
}
