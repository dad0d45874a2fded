//! UDP flow relay: one client flow, one outbound socket, a bounded queue
//! of datagrams in between.

use std::io;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use super::ring::DatagramRing;
use crate::common::error::log_sock_error;
use crate::sock::{Ready, SocketOps};
use crate::stack::{Datagram, FlowKey, UdpPcb};

const MAX_DATAGRAM: usize = 65535;

pub struct UdpFlow {
    key: FlowKey,
    socket: Option<Box<dyn SocketOps>>,
    ring: DatagramRing,
    last_active: Instant,
    released: bool,
}

impl UdpFlow {
    pub fn new(key: FlowKey, capacity: usize) -> Self {
        Self {
            key,
            socket: None,
            ring: DatagramRing::new(capacity),
            last_active: Instant::now(),
            released: false,
        }
    }

    pub fn key(&self) -> FlowKey {
        self.key
    }

    pub fn is_attached(&self) -> bool {
        self.socket.is_some()
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    pub fn queued(&self) -> usize {
        self.ring.len()
    }

    pub fn socket_mut(&mut self) -> Option<&mut (dyn SocketOps + 'static)> {
        self.socket.as_deref_mut()
    }

    pub fn attach(&mut self, socket: Box<dyn SocketOps>) {
        debug!(flow = %self.key, backend = socket.name(), "udp flow attached");
        self.socket = Some(socket);
    }

    pub fn on_flow_ready(&mut self) {
        if let Some(socket) = self.socket.as_mut() {
            socket.evctl(Ready::READABLE, true);
        }
    }

    pub fn on_datagram_from_stack<P: UdpPcb>(&mut self, pcb: &mut P, datagram: Datagram) {
        if self.released {
            return;
        }
        self.touch();
        if self.socket.is_none() {
            trace!(flow = %self.key, "no transport, answering port unreachable");
            pcb.port_unreachable(&datagram.origin);
            self.teardown(pcb);
            return;
        }
        if let Some(old) = self.ring.push(datagram.payload.into_bytes()) {
            trace!(flow = %self.key, len = old.len(), "udp queue full, dropped oldest");
        }
        self.on_socket_event(pcb, Ready::WRITABLE);
    }

    pub fn on_socket_event<P: UdpPcb>(&mut self, pcb: &mut P, ready: Ready) {
        if self.socket.is_none() || ready.is_empty() {
            return;
        }
        if ready.intersects(Ready::ERROR | Ready::HUP) {
            self.teardown(pcb);
            return;
        }
        if ready.contains(Ready::READABLE) && !self.on_socket_readable(pcb) {
            self.teardown(pcb);
            return;
        }
        if ready.contains(Ready::WRITABLE) {
            self.flush();
        }
    }

    /// Forward everything readable to the client. False on a fatal socket
    /// error.
    fn on_socket_readable<P: UdpPcb>(&mut self, pcb: &mut P) -> bool {
        let Some(socket) = self.socket.as_mut() else {
            return true;
        };
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            match socket.recv(&mut buf) {
                Ok(0) => {}
                Ok(n) => {
                    self.last_active = Instant::now();
                    if let Err(e) = pcb.send(&buf[..n]) {
                        debug!(flow = %self.key, error = %e, "dropping reply");
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return true,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    log_sock_error("udp relay recv", &e);
                    return false;
                }
            }
        }
    }

    /// 按 FIFO 发送队列，遇到未能完整发出的数据报即停止
    fn flush(&mut self) {
        let Some(socket) = self.socket.as_mut() else {
            return;
        };
        while let Some(front) = self.ring.front() {
            match socket.send(front) {
                Ok(_) => {
                    self.ring.pop();
                }
                Err(e) => {
                    if e.kind() != io::ErrorKind::WouldBlock {
                        log_sock_error("udp relay send", &e);
                    }
                    break;
                }
            }
        }
        socket.evctl(Ready::WRITABLE, !self.ring.is_empty());
    }

    /// Release the socket, the queue and the stack side. Only the first call
    /// has an effect.
    pub fn teardown<P: UdpPcb>(&mut self, pcb: &mut P) {
        if self.released {
            return;
        }
        self.released = true;
        if let Some(mut socket) = self.socket.take() {
            socket.destroy();
        }
        self.ring.clear();
        pcb.remove();
        debug!(flow = %self.key, "udp flow closed");
    }

    pub fn touch(&mut self) {
        self.last_active = Instant::now();
    }

    pub fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_active) >= timeout
    }
}

impl Drop for UdpFlow {
    fn drop(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            socket.destroy();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::mock::MockUdpPcb;
    use crate::sock::mock::MockSocket;
    use crate::stack::{DatagramOrigin, SegmentChain};
    use bytes::Bytes;

    fn key() -> FlowKey {
        FlowKey::new("10.0.0.2:5353".parse().unwrap(), "10.0.0.1:53".parse().unwrap())
    }

    fn datagram(payload: &'static [u8]) -> Datagram {
        Datagram {
            payload: SegmentChain::from(Bytes::from_static(payload)),
            origin: DatagramOrigin {
                key: key(),
                hop_limit: 64,
                udp_len: 8 + payload.len(),
                udp_header: [0; 8],
            },
        }
    }

    fn attached(capacity: usize) -> (UdpFlow, std::rc::Rc<std::cell::RefCell<crate::sock::mock::MockState>>) {
        let (sock, state) = MockSocket::new();
        let mut flow = UdpFlow::new(key(), capacity);
        flow.attach(Box::new(sock));
        flow.on_flow_ready();
        (flow, state)
    }

    #[test]
    fn ready_arms_read() {
        let (_flow, state) = attached(8);
        assert_eq!(state.borrow().interest, Ready::READABLE);
    }

    #[test]
    fn datagram_sent_immediately() {
        let (mut flow, state) = attached(8);
        let mut pcb = MockUdpPcb::default();
        flow.on_datagram_from_stack(&mut pcb, datagram(b"query"));
        assert_eq!(state.borrow().datagrams, vec![b"query".to_vec()]);
        assert_eq!(flow.queued(), 0);
        assert!(!state.borrow().interest.contains(Ready::WRITABLE));
    }

    #[test]
    fn blocked_socket_keeps_newest_datagrams() {
        let (mut flow, state) = attached(2);
        let mut pcb = MockUdpPcb::default();
        state.borrow_mut().accept_all = false;
        for payload in [&b"one"[..], &b"two"[..], &b"three"[..]] {
            flow.on_datagram_from_stack(&mut pcb, datagram(payload));
        }
        assert_eq!(flow.queued(), 2);
        assert!(state.borrow().interest.contains(Ready::WRITABLE));

        state.borrow_mut().accept_all = true;
        flow.on_socket_event(&mut pcb, Ready::WRITABLE);
        assert_eq!(state.borrow().datagrams, vec![b"two".to_vec(), b"three".to_vec()]);
        assert!(!state.borrow().interest.contains(Ready::WRITABLE));
    }

    #[test]
    fn replies_are_relayed_unmodified() {
        let (mut flow, state) = attached(8);
        let mut pcb = MockUdpPcb::default();
        {
            let mut st = state.borrow_mut();
            st.reads.push_back(Ok(b"answer-1".to_vec()));
            st.reads.push_back(Ok(b"answer-2".to_vec()));
        }
        flow.on_socket_event(&mut pcb, Ready::READABLE);
        assert_eq!(pcb.sent, vec![b"answer-1".to_vec(), b"answer-2".to_vec()]);
        assert!(flow.is_attached());
    }

    #[test]
    fn stack_send_failures_are_dropped() {
        let (mut flow, state) = attached(8);
        let mut pcb = MockUdpPcb {
            fail_send: true,
            ..Default::default()
        };
        state.borrow_mut().reads.push_back(Ok(vec![0u8; 9000]));
        flow.on_socket_event(&mut pcb, Ready::READABLE);
        assert!(flow.is_attached());
        assert_eq!(pcb.removed, 0);
    }

    #[test]
    fn socket_error_tears_down_once() {
        let (mut flow, state) = attached(8);
        let mut pcb = MockUdpPcb::default();
        state
            .borrow_mut()
            .reads
            .push_back(Err(io::Error::from(io::ErrorKind::UnexpectedEof)));
        flow.on_socket_event(&mut pcb, Ready::READABLE);
        assert!(flow.is_released());
        assert_eq!(pcb.removed, 1);
        assert_eq!(state.borrow().destroyed, 1);

        flow.teardown(&mut pcb);
        flow.on_socket_event(&mut pcb, Ready::HUP);
        assert_eq!(pcb.removed, 1);
        assert_eq!(state.borrow().destroyed, 1);
    }

    #[test]
    fn unattached_flow_answers_port_unreachable() {
        let mut flow = UdpFlow::new(key(), 8);
        let mut pcb = MockUdpPcb::default();
        flow.on_datagram_from_stack(&mut pcb, datagram(b"x"));
        assert_eq!(pcb.unreachable, 1);
        assert_eq!(pcb.removed, 1);
        // later datagrams for the released flow are ignored
        flow.on_datagram_from_stack(&mut pcb, datagram(b"y"));
        assert_eq!(pcb.unreachable, 1);
    }

    #[test]
    fn idle_detection() {
        let (mut flow, _state) = attached(8);
        let start = Instant::now();
        flow.touch();
        assert!(!flow.is_idle(start, Duration::from_secs(60)));
        assert!(flow.is_idle(Instant::now() + Duration::from_secs(61), Duration::from_secs(60)));
    }
}
