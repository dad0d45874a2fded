//! The protocol control block surface the relays drive.
//!
//! Relays never touch smoltcp directly. Each callback hands them a short
//! lived view implementing one of these traits, which keeps the relay logic
//! testable against mock stacks.

use std::fmt;

use super::{DatagramOrigin, StackError};

/// TCP connection state, named after the classic state diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Closed,
    Listen,
    SynSent,
    SynRcvd,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
}

impl TcpState {
    /// States in which the local side may still transmit.
    pub fn can_send(self) -> bool {
        matches!(self, TcpState::Established | TcpState::CloseWait)
    }
}

impl fmt::Display for TcpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TcpState::Closed => "CLOSED",
            TcpState::Listen => "LISTEN",
            TcpState::SynSent => "SYN-SENT",
            TcpState::SynRcvd => "SYN-RECEIVED",
            TcpState::Established => "ESTABLISHED",
            TcpState::FinWait1 => "FIN-WAIT-1",
            TcpState::FinWait2 => "FIN-WAIT-2",
            TcpState::CloseWait => "CLOSE-WAIT",
            TcpState::Closing => "CLOSING",
            TcpState::LastAck => "LAST-ACK",
            TcpState::TimeWait => "TIME-WAIT",
        };
        f.write_str(s)
    }
}

impl From<smoltcp::socket::tcp::State> for TcpState {
    fn from(state: smoltcp::socket::tcp::State) -> Self {
        use smoltcp::socket::tcp::State;
        match state {
            State::Closed => TcpState::Closed,
            State::Listen => TcpState::Listen,
            State::SynSent => TcpState::SynSent,
            State::SynReceived => TcpState::SynRcvd,
            State::Established => TcpState::Established,
            State::FinWait1 => TcpState::FinWait1,
            State::FinWait2 => TcpState::FinWait2,
            State::CloseWait => TcpState::CloseWait,
            State::Closing => TcpState::Closing,
            State::LastAck => TcpState::LastAck,
            State::TimeWait => TcpState::TimeWait,
        }
    }
}

/// Per-connection TCP control block.
pub trait TcpPcb {
    fn state(&self) -> TcpState;

    /// Maximum segment size for writes.
    fn mss(&self) -> usize;

    /// Free space in the send buffer.
    fn sndbuf(&self) -> usize;

    /// Number of segments queued for transmission or awaiting acknowledgment.
    fn sndqueuelen(&self) -> usize;

    fn set_nodelay(&mut self, nodelay: bool);

    /// Queue bytes for transmission. Fails with `OutOfMemory` when the stack
    /// cannot take all of `data`.
    fn write(&mut self, data: &[u8]) -> Result<(), StackError>;

    /// Ask the stack to push queued segments onto the wire.
    fn output(&mut self);

    /// Acknowledge received data right away.
    fn ack_now(&mut self);

    /// The relay has consumed `len` bytes; reopen that much receive window.
    fn recved(&mut self, len: usize);

    /// Half-close: send FIN, keep receiving.
    fn shutdown_tx(&mut self);

    /// Graceful close of both directions. The relay is detached afterwards.
    fn close(&mut self);

    /// Send RST and drop everything unacknowledged.
    fn abort(&mut self);
}

/// Per-flow UDP endpoint.
pub trait UdpPcb {
    /// Send one datagram back to the originator of the flow.
    fn send(&mut self, payload: &[u8]) -> Result<(), StackError>;

    /// Answer the datagram described by `origin` with ICMP port unreachable.
    fn port_unreachable(&mut self, origin: &DatagramOrigin);

    /// Release the flow. No further datagrams are accepted for it.
    fn remove(&mut self);
}
