//! Bridges between stack control blocks and outbound sockets.
//!
//! A [`TcpConnection`] pairs one TCP control block with one outbound
//! socket and moves bytes both ways under the stack's flow control. A
//! [`UdpFlow`] does the same for one UDP flow with a bounded datagram
//! queue. Both are driven from the runtime: stack events on one side,
//! filtered socket readiness on the other.

pub mod ring;
pub mod tcp;
pub mod udp;

pub use ring::{DatagramRing, DEFAULT_QUEUE_CAPACITY};
pub use tcp::{RelayState, TcpConnection};
pub use udp::UdpFlow;
