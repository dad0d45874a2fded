//! Plain sockets to the original destination.

use std::io;
use std::net::{Shutdown, SocketAddr};
use std::rc::Rc;

use mio::net::UdpSocket;
use tracing::debug;

use super::interest::Registration;
use super::stream::TcpChannel;
use super::{Ready, SocketOps};
use crate::common::error::log_sock_error;
use crate::common::Dialer;

/// 直连出站：非阻塞 TCP
pub struct DirectTcp {
    ch: TcpChannel,
    target: Option<SocketAddr>,
}

impl DirectTcp {
    pub fn new(reg: Registration, dialer: Rc<Dialer>) -> Self {
        Self {
            ch: TcpChannel::new(reg, dialer),
            target: None,
        }
    }
}

impl DirectTcp {
    fn poll_open(&mut self, ready: Ready) -> io::Result<bool> {
        if !self.ch.poll_connect(ready)? {
            return Ok(false);
        }
        self.ch.open()?;
        Ok(true)
    }
}

impl SocketOps for DirectTcp {
    fn connect(&mut self, target: SocketAddr) -> io::Result<()> {
        self.target = Some(target);
        self.ch.connect(target)
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.ch.read(buf)
    }

    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.ch.write(buf)
    }

    fn shutdown(&mut self, how: Shutdown) -> io::Result<()> {
        self.ch.shutdown(how)
    }

    fn evctl(&mut self, interest: Ready, enabled: bool) {
        self.ch.evctl(interest, enabled);
    }

    fn interest(&self) -> Ready {
        self.ch.interest()
    }

    fn handle_event(&mut self, ready: Ready) -> Ready {
        if self.ch.is_open() {
            return ready;
        }
        match self.poll_open(ready) {
            Ok(true) => {
                self.ch.set_internal(Ready::empty());
                debug!(target = ?self.target, "direct tcp connected");
                // 连接期间 relay 可能已登记任一方向
                Ready::IO | (ready & Ready::HUP)
            }
            Ok(false) => Ready::empty(),
            Err(e) => {
                log_sock_error("direct tcp connect", &e);
                Ready::ERROR
            }
        }
    }

    fn destroy(&mut self) {
        self.ch.destroy();
    }

    fn name(&self) -> &'static str {
        "direct-tcp"
    }
}

impl Drop for DirectTcp {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// 直连出站：已 connect 的 UDP socket
pub struct DirectUdp {
    reg: Registration,
    dialer: Rc<Dialer>,
    socket: Option<UdpSocket>,
}

impl DirectUdp {
    pub fn new(reg: Registration, dialer: Rc<Dialer>) -> Self {
        Self {
            reg,
            dialer,
            socket: None,
        }
    }
}

impl SocketOps for DirectUdp {
    fn connect(&mut self, target: SocketAddr) -> io::Result<()> {
        let mut socket = self.dialer.udp(target)?;
        self.reg.register(&mut socket)?;
        self.socket = Some(socket);
        Ok(())
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.socket.as_ref() {
            Some(socket) => socket.recv(buf),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.socket.as_ref() {
            Some(socket) => socket.send(buf),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    fn shutdown(&mut self, _how: Shutdown) -> io::Result<()> {
        Ok(())
    }

    fn evctl(&mut self, interest: Ready, enabled: bool) {
        if self.reg.set_user(interest, enabled) {
            if let Some(socket) = self.socket.as_mut() {
                if let Err(e) = self.reg.reregister(socket) {
                    log_sock_error("reregister", &e);
                }
            }
        }
    }

    fn interest(&self) -> Ready {
        self.reg.user()
    }

    fn destroy(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            self.reg.deregister(&mut socket);
        }
    }

    fn name(&self) -> &'static str {
        "direct-udp"
    }
}

impl Drop for DirectUdp {
    fn drop(&mut self) {
        self.destroy();
    }
}
