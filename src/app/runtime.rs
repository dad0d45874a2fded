//! The poll loop tying the packet device, the stack and the relays together.
//!
//! One thread, one `mio::Poll`. Each turn reads packets from the device into
//! the stack, hands outbound socket readiness to the relay that owns the
//! token, then pumps stack events until the stack is quiet and writes the
//! resulting packets back to the device.

use std::collections::HashMap;
use std::io;
use std::rc::Rc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use mio::{Events, Interest, Poll, Token};
use smoltcp::iface::SocketHandle;
use tracing::{debug, info, trace, warn};

use super::dispatcher::Dispatcher;
use super::router::{EventRouter, Owner, TUN_TOKEN};
use crate::config::Config;
use crate::relay::{TcpConnection, UdpFlow};
use crate::sock::{self, Ready};
use crate::stack::{Datagram, FlowKey, Stack, StackConfig, StackEvent};
use crate::tun::PacketDevice;

const EVENTS_CAPACITY: usize = 1024;
/// Upper bound on one poll wait, so idle flows are swept even when quiet.
const MAX_WAIT: Duration = Duration::from_secs(1);
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);
/// 每轮最多驱动协议栈的次数
const MAX_PUMP_ROUNDS: usize = 64;

struct TcpSlot {
    relay: TcpConnection,
    token: Token,
}

struct UdpSlot {
    flow: UdpFlow,
    token: Token,
}

pub struct Runtime<D: PacketDevice> {
    poll: Poll,
    events: Events,
    device: D,
    stack: Stack,
    dispatcher: Dispatcher,
    router: EventRouter,
    tcp: HashMap<SocketHandle, TcpSlot>,
    udp: HashMap<FlowKey, UdpSlot>,
    rx_buf: Vec<u8>,
    udp_capacity: usize,
    udp_idle_timeout: Duration,
    last_sweep: Instant,
}

impl<D: PacketDevice> Runtime<D> {
    pub fn new(config: &Config, mut device: D) -> Result<Self> {
        let poll = Poll::new().context("failed to create poll")?;
        let registry = Rc::new(poll.registry().try_clone().context("failed to clone registry")?);
        poll.registry()
            .register(&mut device, TUN_TOKEN, Interest::READABLE)
            .context("failed to register packet device")?;

        let stack = Stack::new(&StackConfig {
            mtu: config.tunnel.mtu,
            ipv4: config.tunnel.ipv4,
            ipv6: config.tunnel.ipv6,
        });
        let dispatcher = Dispatcher::new(config, registry)?;

        Ok(Self {
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            device,
            stack,
            dispatcher,
            router: EventRouter::new(),
            tcp: HashMap::new(),
            udp: HashMap::new(),
            rx_buf: vec![0u8; config.tunnel.mtu],
            udp_capacity: config.udp.queue_capacity,
            udp_idle_timeout: Duration::from_secs(config.udp.idle_timeout),
            last_sweep: Instant::now(),
        })
    }

    pub fn run(&mut self) -> Result<()> {
        info!(
            mode = self.dispatcher.policy().proxy_mode.as_str(),
            hijack = self.dispatcher.policy().hijack.as_str(),
            "relay running"
        );
        loop {
            self.turn(None)?;
        }
    }

    /// One iteration of the loop, waiting at most `max_wait` for readiness.
    pub fn turn(&mut self, max_wait: Option<Duration>) -> Result<()> {
        let mut timeout = self.stack.poll_delay().unwrap_or(MAX_WAIT).min(MAX_WAIT);
        if let Some(max_wait) = max_wait {
            timeout = timeout.min(max_wait);
        }
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e).context("poll failed"),
        }

        let ready: Vec<(Token, Ready)> = self
            .events
            .iter()
            .map(|event| (event.token(), Ready::from_event(event)))
            .collect();
        // TUN 读入 + 出站 socket 就绪分发
        for (token, ready) in ready {
            if token == TUN_TOKEN {
                self.read_device();
            } else {
                self.on_socket_ready(token, ready);
            }
        }
        self.pump();

        // 空闲 UDP 流清理，最多每秒一次
        let now = Instant::now();
        if now.saturating_duration_since(self.last_sweep) >= SWEEP_INTERVAL {
            self.last_sweep = now;
            self.sweep_idle(now);
        }
        Ok(())
    }

    pub fn tcp_count(&self) -> usize {
        self.tcp.len()
    }

    pub fn udp_count(&self) -> usize {
        self.udp.len()
    }

    fn read_device(&mut self) {
        loop {
            match self.device.read_packet(&mut self.rx_buf) {
                Ok(0) => break,
                Ok(n) => self.stack.input(&self.rx_buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "packet device read failed");
                    break;
                }
            }
        }
    }

    fn write_device(&mut self) {
        while let Some(packet) = self.stack.take_packet() {
            match self.device.write_packet(&packet) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    trace!(len = packet.len(), "packet device full, dropping packet");
                }
                Err(e) => warn!(error = %e, len = packet.len(), "packet device write failed"),
            }
        }
    }

    fn on_socket_ready(&mut self, token: Token, raw: Ready) {
        match self.router.owner(token) {
            Some(Owner::Tcp(handle)) => {
                let Some(slot) = self.tcp.get_mut(&handle) else {
                    return;
                };
                let Some(socket) = slot.relay.socket_mut() else {
                    return;
                };
                let ready = sock::deliver(socket, raw);
                if ready.is_empty() {
                    return;
                }
                match self.stack.tcp_pcb(handle) {
                    Some(mut pcb) => slot.relay.on_socket_event(&mut pcb, ready),
                    None => slot.relay.on_stack_reset(),
                }
            }
            Some(Owner::Udp(key)) => {
                let Some(slot) = self.udp.get_mut(&key) else {
                    return;
                };
                let Some(socket) = slot.flow.socket_mut() else {
                    return;
                };
                let ready = sock::deliver(socket, raw);
                if !ready.is_empty() {
                    slot.flow.on_socket_event(&mut self.stack.udp_pcb(key), ready);
                }
            }
            None => trace!(token = token.0, "readiness for unknown token"),
        }
    }

    /// 驱动协议栈直到不再产生事件，然后写出数据包
    fn pump(&mut self) {
        for _ in 0..MAX_PUMP_ROUNDS {
            self.stack.poll();
            if !self.stack.has_events() {
                break;
            }
            while let Some(event) = self.stack.next_event() {
                self.on_stack_event(event);
            }
        }
        self.reap_udp();
        self.write_device();
    }

    fn on_stack_event(&mut self, event: StackEvent) {
        match event {
            StackEvent::TcpNew { handle, key } => self.on_tcp_new(handle, key),
            StackEvent::TcpData { handle, chain } => {
                if let (Some(slot), Some(mut pcb)) = (self.tcp.get_mut(&handle), self.stack.tcp_pcb(handle)) {
                    slot.relay.on_data_from_stack(&mut pcb, chain);
                }
            }
            StackEvent::TcpAcked { handle, len } => {
                if let (Some(slot), Some(mut pcb)) = (self.tcp.get_mut(&handle), self.stack.tcp_pcb(handle)) {
                    slot.relay.on_stack_acked(&mut pcb, len);
                }
            }
            StackEvent::TcpClosed { handle } => {
                if let Some(slot) = self.tcp.get_mut(&handle) {
                    slot.relay.on_stack_closed();
                }
            }
            StackEvent::TcpReset { handle } => {
                if let Some(slot) = self.tcp.get_mut(&handle) {
                    slot.relay.on_stack_reset();
                }
            }
            StackEvent::TcpReleased { handle } => {
                if let Some(slot) = self.tcp.remove(&handle) {
                    self.router.release(slot.token);
                    trace!(local = %slot.relay.local(), "tcp relay reaped");
                }
            }
            StackEvent::UdpDatagram { datagram } => self.on_udp_datagram(datagram),
        }
    }

    fn on_tcp_new(&mut self, handle: SocketHandle, key: FlowKey) {
        let Some(mut pcb) = self.stack.tcp_pcb(handle) else {
            return;
        };
        let mut relay = TcpConnection::new(key.src);
        relay.on_connection_new(&mut pcb);

        let token = self.router.allocate(Owner::Tcp(handle));
        let route = self.dispatcher.policy().select_tcp(key.dst);
        match self.dispatcher.open(route, token) {
            Ok(socket) => relay.attach(socket),
            Err(e) => {
                debug!(flow = %key, target = %route.target, error = %e, "tcp outbound failed");
                relay.on_attach_failed(&mut pcb);
            }
        }
        self.tcp.insert(handle, TcpSlot { relay, token });
    }

    fn on_udp_datagram(&mut self, datagram: Datagram) {
        let key = datagram.key();
        if !self.udp.contains_key(&key) {
            let slot = self.open_flow(key);
            self.udp.insert(key, slot);
        }
        if let Some(slot) = self.udp.get_mut(&key) {
            slot.flow.on_datagram_from_stack(&mut self.stack.udp_pcb(key), datagram);
        }
    }

    fn open_flow(&mut self, key: FlowKey) -> UdpSlot {
        let mut flow = UdpFlow::new(key, self.udp_capacity);
        let token = self.router.allocate(Owner::Udp(key));
        match self.dispatcher.policy().select_udp(key.dst) {
            Some(route) => match self.dispatcher.open(route, token) {
                Ok(socket) => {
                    flow.attach(socket);
                    flow.on_flow_ready();
                }
                Err(e) => debug!(flow = %key, target = %route.target, error = %e, "udp outbound failed"),
            },
            None => debug!(flow = %key, "no udp transport for proxy mode"),
        }
        UdpSlot { flow, token }
    }

    fn reap_udp(&mut self) {
        for key in self.stack.take_released_udp() {
            if let Some(slot) = self.udp.remove(&key) {
                self.router.release(slot.token);
            }
        }
    }

    fn sweep_idle(&mut self, now: Instant) {
        let timeout = self.udp_idle_timeout;
        let idle: Vec<FlowKey> = self
            .udp
            .iter()
            .filter(|(_, slot)| slot.flow.is_idle(now, timeout))
            .map(|(key, _)| *key)
            .collect();
        if idle.is_empty() {
            return;
        }
        for key in idle {
            if let Some(slot) = self.udp.get_mut(&key) {
                debug!(flow = %key, "udp flow idle, closing");
                slot.flow.teardown(&mut self.stack.udp_pcb(key));
            }
        }
        self.reap_udp();
    }
}
