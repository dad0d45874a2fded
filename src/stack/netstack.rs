//! smoltcp interface wrapper with lwIP-like connection bookkeeping.

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use ipnet::{Ipv4Net, Ipv6Net};
use smoltcp::iface::{Config, Interface, SocketHandle, SocketSet};
use smoltcp::socket::tcp;
use smoltcp::time::{Duration as SmolDuration, Instant as SmolInstant};
use smoltcp::wire::{HardwareAddress, IpAddress, IpCidr, IpEndpoint, IpListenEndpoint};
use tracing::{debug, trace, warn};

use super::device::VirtualDevice;
use super::pcb::{TcpPcb, TcpState, UdpPcb};
use super::wire::{self, DatagramOrigin, Inbound};
use super::{
    Datagram, FlowKey, SegmentChain, StackError, StackEvent, MAX_TCP_CONNECTIONS, TCP_MSS,
    TCP_SND_BUF, TCP_WND,
};

/// A SYN that never completes its handshake is dropped after this long.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// A closed connection still lingering in FIN states is aborted after this long.
const CLOSE_LINGER: Duration = Duration::from_secs(60);
const TCP_TIMEOUT: SmolDuration = SmolDuration::from_secs(120);
const TCP_KEEPALIVE: SmolDuration = SmolDuration::from_secs(60);
const IPV4_HEADER_LEN: usize = 20;
const TCP_HEADER_LEN: usize = 20;

/// Addressing of the stack's side of the TUN device.
#[derive(Debug, Clone)]
pub struct StackConfig {
    pub mtu: usize,
    pub ipv4: Ipv4Net,
    pub ipv6: Option<Ipv6Net>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Listening or mid-handshake, not yet announced.
    Handshake,
    /// Announced with `TcpNew`; a relay owns the other end.
    Open,
    /// The relay let go (close/abort/reset). Reaped once smoltcp is done.
    Detached { at_poll: u64, since: Instant },
}

#[derive(Debug)]
struct TcpEntry {
    key: FlowKey,
    phase: Phase,
    created: Instant,
    /// Bytes the relay may still be handed before it calls `recved`.
    credit: usize,
    /// Relay bytes written into the send buffer and not yet acknowledged.
    queued: usize,
    fin_reported: bool,
    tx_shut: bool,
}

impl TcpEntry {
    fn new(key: FlowKey) -> Self {
        Self {
            key,
            phase: Phase::Handshake,
            created: Instant::now(),
            credit: TCP_WND,
            queued: 0,
            fin_reported: false,
            tx_shut: false,
        }
    }

    fn detach(&mut self, polls: u64) {
        if !matches!(self.phase, Phase::Detached { .. }) {
            self.phase = Phase::Detached {
                at_poll: polls,
                since: Instant::now(),
            };
        }
    }
}

/// The embedded stack: smoltcp interface, its TCP sockets and the
/// hand-built UDP path, producing [`StackEvent`]s for the runtime.
pub struct Stack {
    device: VirtualDevice,
    iface: Interface,
    sockets: SocketSet<'static>,
    tcp: HashMap<SocketHandle, TcpEntry>,
    flows: HashMap<FlowKey, SocketHandle>,
    events: VecDeque<StackEvent>,
    released_udp: Vec<FlowKey>,
    /// IPv4 identification for fragmented UDP replies.
    next_ident: u16,
    polls: u64,
    mss: usize,
}

impl Stack {
    pub fn new(config: &StackConfig) -> Self {
        let mut device = VirtualDevice::new(config.mtu);

        let mut iface_config = Config::new(HardwareAddress::Ip);
        iface_config.random_seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0x5eed);
        let mut iface = Interface::new(iface_config, &mut device, SmolInstant::now());

        // 接受任意目的地址：默认路由指向自身地址
        iface.set_any_ip(true);
        let v4 = config.ipv4.addr();
        iface.update_ip_addrs(|addrs| {
            addrs
                .push(IpCidr::new(IpAddress::Ipv4(v4), config.ipv4.prefix_len()))
                .ok();
            if let Some(v6) = config.ipv6 {
                addrs
                    .push(IpCidr::new(IpAddress::Ipv6(v6.addr()), v6.prefix_len()))
                    .ok();
            }
        });
        iface.routes_mut().add_default_ipv4_route(v4).ok();
        if let Some(v6) = config.ipv6 {
            iface.routes_mut().add_default_ipv6_route(v6.addr()).ok();
        }

        let mss = TCP_MSS.min(config.mtu.saturating_sub(IPV4_HEADER_LEN + TCP_HEADER_LEN));
        debug!(ipv4 = %config.ipv4, ipv6 = ?config.ipv6, mtu = config.mtu, mss, "stack created");

        Stack {
            device,
            iface,
            sockets: SocketSet::new(vec![]),
            tcp: HashMap::new(),
            flows: HashMap::new(),
            events: VecDeque::new(),
            released_udp: Vec::new(),
            next_ident: 0,
            polls: 0,
            mss,
        }
    }

    /// Feed one IP packet read from the TUN device.
    pub fn input(&mut self, packet: &[u8]) {
        match wire::classify(packet) {
            Ok(Inbound::Udp { origin, payload }) => {
                trace!(flow = %origin.key, len = payload.len(), "udp datagram");
                let datagram = Datagram {
                    payload: SegmentChain::from(Bytes::copy_from_slice(payload)),
                    origin,
                };
                self.events.push_back(StackEvent::UdpDatagram { datagram });
            }
            Ok(Inbound::TcpSyn(key)) => {
                if let Err(e) = self.ensure_listener(key) {
                    debug!(flow = %key, error = %e, "no listener for SYN");
                }
                self.device.inject_packet(packet.to_vec());
            }
            Ok(Inbound::Fragment { src, dst, key, offset }) => {
                debug!(%src, %dst, flow = ?key.map(|k| k.to_string()), offset, len = packet.len(), "dropping ip fragment");
            }
            Ok(Inbound::Tcp(_)) | Ok(Inbound::Other) => {
                self.device.inject_packet(packet.to_vec());
            }
            Err(e) => {
                debug!(error = %e, len = packet.len(), "dropping inbound packet");
            }
        }
    }

    fn ensure_listener(&mut self, key: FlowKey) -> Result<(), StackError> {
        if self.flows.contains_key(&key) {
            return Ok(());
        }
        if self.tcp.len() >= MAX_TCP_CONNECTIONS {
            warn!(flow = %key, max = MAX_TCP_CONNECTIONS, "tcp connection limit reached");
            return Err(StackError::Exhausted);
        }

        let rx = tcp::SocketBuffer::new(vec![0u8; TCP_WND]);
        let tx = tcp::SocketBuffer::new(vec![0u8; TCP_SND_BUF]);
        let mut socket = tcp::Socket::new(rx, tx);
        socket.set_ack_delay(None);
        socket.set_timeout(Some(TCP_TIMEOUT));
        socket.set_keep_alive(Some(TCP_KEEPALIVE));
        socket
            .listen(IpListenEndpoint {
                addr: Some(IpAddress::from(key.dst.ip())),
                port: key.dst.port(),
            })
            .map_err(|e| StackError::Listen(format!("{:?}", e)))?;

        let handle = self.sockets.add(socket);
        self.tcp.insert(handle, TcpEntry::new(key));
        self.flows.insert(key, handle);
        trace!(flow = %key, "listener armed");
        Ok(())
    }

    /// Run smoltcp once and turn what changed into events.
    pub fn poll(&mut self) {
        self.polls += 1;
        let now = SmolInstant::now();
        let _ = self.iface.poll(now, &mut self.device, &mut self.sockets);
        self.collect();
    }

    /// Time until smoltcp needs to be polled again for its own timers.
    pub fn poll_delay(&mut self) -> Option<Duration> {
        if self.device.has_pending_rx() {
            return Some(Duration::ZERO);
        }
        self.iface
            .poll_delay(SmolInstant::now(), &self.sockets)
            .map(|d| Duration::from_micros(d.total_micros()))
    }

    fn collect(&mut self) {
        let Stack {
            sockets,
            tcp: entries,
            flows,
            events,
            polls,
            ..
        } = self;
        let mut reaped = Vec::new();

        for (&handle, entry) in entries.iter_mut() {
            let socket = sockets.get_mut::<tcp::Socket>(handle);
            let state = TcpState::from(socket.state());

            if entry.phase == Phase::Handshake {
                match state {
                    TcpState::Listen | TcpState::SynRcvd => {
                        if entry.created.elapsed() > HANDSHAKE_TIMEOUT {
                            socket.abort();
                            reaped.push(handle);
                        }
                        continue;
                    }
                    TcpState::Closed => {
                        reaped.push(handle);
                        continue;
                    }
                    _ => {
                        if let (Some(local), Some(remote)) =
                            (socket.local_endpoint(), socket.remote_endpoint())
                        {
                            let actual = FlowKey::new(to_socket_addr(remote), to_socket_addr(local));
                            if actual != entry.key {
                                if flows.get(&entry.key) == Some(&handle) {
                                    flows.remove(&entry.key);
                                }
                                flows.insert(actual, handle);
                                entry.key = actual;
                            }
                        }
                        entry.phase = Phase::Open;
                        debug!(flow = %entry.key, "tcp connection accepted");
                        events.push_back(StackEvent::TcpNew {
                            handle,
                            key: entry.key,
                        });
                    }
                }
            }

            if entry.phase == Phase::Open {
                let queued_now = socket.send_queue();
                if entry.queued > queued_now {
                    events.push_back(StackEvent::TcpAcked {
                        handle,
                        len: entry.queued - queued_now,
                    });
                }
                entry.queued = queued_now;

                let mut chain = SegmentChain::new();
                while entry.credit > 0 && socket.can_recv() {
                    let credit = entry.credit;
                    let seg = socket.recv(|buf| {
                        let n = buf.len().min(credit);
                        (n, Bytes::copy_from_slice(&buf[..n]))
                    });
                    match seg {
                        Ok(seg) if !seg.is_empty() => {
                            entry.credit -= seg.len();
                            chain.push(seg);
                        }
                        _ => break,
                    }
                }
                if !chain.is_empty() {
                    events.push_back(StackEvent::TcpData { handle, chain });
                }

                if !entry.fin_reported
                    && matches!(
                        state,
                        TcpState::CloseWait | TcpState::LastAck | TcpState::Closing | TcpState::TimeWait
                    )
                    && !socket.can_recv()
                {
                    entry.fin_reported = true;
                    events.push_back(StackEvent::TcpClosed { handle });
                }

                if state == TcpState::Closed && !(entry.fin_reported && entry.tx_shut) {
                    debug!(flow = %entry.key, "tcp connection reset");
                    events.push_back(StackEvent::TcpReset { handle });
                    entry.detach(*polls);
                }
            }

            if let Phase::Detached { at_poll, since } = entry.phase {
                while socket.can_recv() {
                    if socket.recv(|buf| (buf.len(), ())).is_err() {
                        break;
                    }
                }
                if state == TcpState::Closed && *polls > at_poll {
                    reaped.push(handle);
                } else if state != TcpState::Closed && since.elapsed() > CLOSE_LINGER {
                    debug!(flow = %entry.key, state = %state, "aborting lingering connection");
                    socket.abort();
                }
            }
        }

        for handle in reaped {
            if let Some(entry) = entries.remove(&handle) {
                if flows.get(&entry.key) == Some(&handle) {
                    flows.remove(&entry.key);
                }
                if entry.phase != Phase::Handshake {
                    events.push_back(StackEvent::TcpReleased { handle });
                }
            }
            sockets.remove(handle);
        }
    }

    pub fn next_event(&mut self) -> Option<StackEvent> {
        self.events.pop_front()
    }

    pub fn has_events(&self) -> bool {
        !self.events.is_empty()
    }

    /// Next IP packet to write to the TUN device.
    pub fn take_packet(&mut self) -> Option<Vec<u8>> {
        self.device.take_packet()
    }

    /// PCB view of a live connection.
    pub fn tcp_pcb(&mut self, handle: SocketHandle) -> Option<StackTcp<'_>> {
        let entry = self.tcp.get_mut(&handle)?;
        let socket = self.sockets.get_mut::<tcp::Socket>(handle);
        Some(StackTcp {
            socket,
            entry,
            mss: self.mss,
            polls: self.polls,
        })
    }

    /// PCB view of a UDP flow.
    pub fn udp_pcb(&mut self, key: FlowKey) -> StackUdp<'_> {
        StackUdp {
            device: &mut self.device,
            released: &mut self.released_udp,
            next_ident: &mut self.next_ident,
            key,
        }
    }

    /// Flows whose relay called [`UdpPcb::remove`] since the last call.
    pub fn take_released_udp(&mut self) -> Vec<FlowKey> {
        std::mem::take(&mut self.released_udp)
    }

    pub fn tcp_count(&self) -> usize {
        self.tcp.len()
    }
}

fn to_socket_addr(ep: IpEndpoint) -> SocketAddr {
    SocketAddr::new(IpAddr::from(ep.addr), ep.port)
}

/// Short-lived TCP control block view handed to a relay callback.
pub struct StackTcp<'a> {
    socket: &'a mut tcp::Socket<'static>,
    entry: &'a mut TcpEntry,
    mss: usize,
    polls: u64,
}

impl TcpPcb for StackTcp<'_> {
    fn state(&self) -> TcpState {
        self.socket.state().into()
    }

    fn mss(&self) -> usize {
        self.mss
    }

    fn sndbuf(&self) -> usize {
        self.socket.send_capacity() - self.socket.send_queue()
    }

    fn sndqueuelen(&self) -> usize {
        self.socket.send_queue().div_ceil(self.mss.max(1))
    }

    fn set_nodelay(&mut self, nodelay: bool) {
        self.socket.set_nagle_enabled(!nodelay);
    }

    fn write(&mut self, data: &[u8]) -> Result<(), StackError> {
        if !self.socket.may_send() {
            return Err(StackError::NotConnected);
        }
        match self.socket.send_slice(data) {
            Ok(n) => {
                self.entry.queued += n;
                if n == data.len() {
                    Ok(())
                } else {
                    Err(StackError::OutOfMemory)
                }
            }
            Err(_) => Err(StackError::NotConnected),
        }
    }

    // smoltcp transmits on the next interface poll, which the runtime runs
    // after every batch of relay callbacks.
    fn output(&mut self) {}

    // ACKs are never delayed (ack_delay is disabled per socket).
    fn ack_now(&mut self) {}

    fn recved(&mut self, len: usize) {
        self.entry.credit = (self.entry.credit + len).min(TCP_WND);
    }

    fn shutdown_tx(&mut self) {
        self.socket.close();
        self.entry.tx_shut = true;
    }

    fn close(&mut self) {
        self.socket.close();
        self.entry.tx_shut = true;
        self.entry.detach(self.polls);
    }

    fn abort(&mut self) {
        self.socket.abort();
        self.entry.detach(self.polls);
    }
}

/// UDP flow view: replies are emitted straight into the TUN queue.
pub struct StackUdp<'a> {
    device: &'a mut VirtualDevice,
    released: &'a mut Vec<FlowKey>,
    next_ident: &'a mut u16,
    key: FlowKey,
}

impl UdpPcb for StackUdp<'_> {
    fn send(&mut self, payload: &[u8]) -> Result<(), StackError> {
        let ident = *self.next_ident;
        let packets = wire::udp_reply_fragments(&self.key, payload, self.device.mtu(), ident)?;
        if packets.len() > 1 {
            *self.next_ident = ident.wrapping_add(1);
            trace!(flow = %self.key, len = payload.len(), fragments = packets.len(), "fragmented udp reply");
        }
        for packet in packets {
            self.device.push_tx(packet);
        }
        Ok(())
    }

    fn port_unreachable(&mut self, origin: &DatagramOrigin) {
        match wire::port_unreachable(origin) {
            Ok(packet) => self.device.push_tx(packet),
            Err(e) => debug!(flow = %origin.key, error = %e, "cannot build port unreachable"),
        }
    }

    fn remove(&mut self) {
        if !self.released.contains(&self.key) {
            self.released.push(self.key);
        }
    }
}
