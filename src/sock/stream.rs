//! Shared plumbing for the TCP-based backends: non-blocking connect
//! tracking, handshake byte buffers and bytes that arrived together with a
//! proxy reply.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::rc::Rc;

use bytes::{Buf, BytesMut};
use mio::net::TcpStream;

use super::interest::Registration;
use super::Ready;
use crate::common::error::log_sock_error;
use crate::common::{Dialer, RelayError};

/// 握手阶段输入缓冲上限
pub(crate) const MAX_HANDSHAKE: usize = 8192;

pub(crate) fn protocol_error(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, RelayError::Protocol(msg.into()))
}

pub(crate) struct TcpChannel {
    reg: Registration,
    dialer: Rc<Dialer>,
    stream: Option<TcpStream>,
    connected: bool,
    /// 握手完成，可传输数据
    open: bool,
    /// 通道打开前请求的半关闭
    deferred_shutdown: Option<Shutdown>,
    /// Payload received behind a proxy reply, served before the socket.
    pending: BytesMut,
}

impl TcpChannel {
    pub(crate) fn new(reg: Registration, dialer: Rc<Dialer>) -> Self {
        Self {
            reg,
            dialer,
            stream: None,
            connected: false,
            open: false,
            deferred_shutdown: None,
            pending: BytesMut::new(),
        }
    }

    pub(crate) fn connect(&mut self, addr: SocketAddr) -> io::Result<()> {
        if self.stream.is_some() {
            return Err(io::Error::new(io::ErrorKind::AlreadyExists, "already connecting"));
        }
        let mut stream = self.dialer.tcp(addr)?;
        self.reg.set_internal(Ready::WRITABLE);
        self.reg.register(&mut stream)?;
        self.stream = Some(stream);
        Ok(())
    }

    /// Drive a pending connect. `Ok(true)` once the connection is up.
    pub(crate) fn poll_connect(&mut self, ready: Ready) -> io::Result<bool> {
        if self.connected {
            return Ok(true);
        }
        let stream = self.stream.as_ref().ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        if let Some(err) = stream.take_error()? {
            return Err(err);
        }
        if ready.contains(Ready::ERROR) {
            return Err(io::Error::from(io::ErrorKind::ConnectionRefused));
        }
        if !ready.intersects(Ready::WRITABLE | Ready::HUP) {
            return Ok(false);
        }
        match stream.peer_addr() {
            Ok(_) => {
                self.connected = true;
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotConnected && !ready.contains(Ready::HUP) => Ok(false),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => {
                Err(io::Error::from(io::ErrorKind::ConnectionRefused))
            }
            Err(e) => Err(e),
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open
    }

    /// Switch to the payload phase and apply a half-close requested while
    /// the handshake was still running.
    pub(crate) fn open(&mut self) -> io::Result<()> {
        self.open = true;
        match self.deferred_shutdown.take() {
            Some(how) => self.shutdown(how),
            None => Ok(()),
        }
    }

    pub(crate) fn pending_mut(&mut self) -> &mut BytesMut {
        &mut self.pending
    }

    pub(crate) fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.open {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        if !self.pending.is_empty() {
            let n = self.pending.len().min(buf.len());
            buf[..n].copy_from_slice(&self.pending[..n]);
            self.pending.advance(n);
            return Ok(n);
        }
        self.read_raw(buf)
    }

    pub(crate) fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.open {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        self.write_raw(buf)
    }

    /// 不区分阶段的读取，供握手使用
    pub(crate) fn read_raw(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.stream.as_mut() {
            Some(stream) if self.connected => stream.read(buf),
            _ => Err(io::ErrorKind::WouldBlock.into()),
        }
    }

    pub(crate) fn write_raw(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.stream.as_mut() {
            Some(stream) if self.connected => stream.write(buf),
            _ => Err(io::ErrorKind::WouldBlock.into()),
        }
    }

    pub(crate) fn shutdown(&mut self, how: Shutdown) -> io::Result<()> {
        if self.stream.is_some() && !self.open {
            self.deferred_shutdown = Some(how);
            return Ok(());
        }
        match self.stream.as_ref() {
            Some(stream) => stream.shutdown(how),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    pub(crate) fn interest(&self) -> Ready {
        self.reg.user()
    }

    pub(crate) fn evctl(&mut self, interest: Ready, enabled: bool) {
        if self.reg.set_user(interest, enabled) {
            self.rearm();
        }
    }

    pub(crate) fn set_internal(&mut self, interest: Ready) {
        if self.reg.set_internal(interest) {
            self.rearm();
        }
    }

    fn rearm(&mut self) {
        if let Some(stream) = self.stream.as_mut() {
            if let Err(e) = self.reg.reregister(stream) {
                log_sock_error("reregister", &e);
            }
        }
    }

    pub(crate) fn destroy(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            self.reg.deregister(&mut stream);
        }
        self.connected = false;
        self.open = false;
        self.deferred_shutdown = None;
        self.pending.clear();
    }
}

/// 握手收发缓冲
#[derive(Default)]
pub(crate) struct Handshake {
    out: BytesMut,
    input: BytesMut,
    eof: bool,
}

impl Handshake {
    pub(crate) fn queue(&mut self, bytes: &[u8]) {
        self.out.extend_from_slice(bytes);
    }

    /// Write queued output. `Ok(true)` when everything went out.
    pub(crate) fn flush(&mut self, ch: &mut TcpChannel) -> io::Result<bool> {
        while !self.out.is_empty() {
            match ch.write_raw(&self.out) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => self.out.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    /// Read everything available. EOF is recorded; bytes read before it
    /// still count towards the reply.
    pub(crate) fn fill(&mut self, ch: &mut TcpChannel) -> io::Result<()> {
        let mut buf = [0u8; 2048];
        while !self.eof && self.input.len() < MAX_HANDSHAKE {
            match ch.read_raw(&mut buf) {
                Ok(0) => {
                    self.eof = true;
                    return Ok(());
                }
                Ok(n) => self.input.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub(crate) fn input(&self) -> &[u8] {
        &self.input
    }

    pub(crate) fn is_full(&self) -> bool {
        self.input.len() >= MAX_HANDSHAKE
    }

    /// An incomplete reply that can never complete: the peer closed or the
    /// buffer is exhausted.
    pub(crate) fn stalled(&self, what: &str) -> Option<io::Error> {
        if self.eof {
            Some(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("{}: connection closed during handshake", what),
            ))
        } else if self.is_full() {
            Some(protocol_error(format!("{}: oversized reply", what)))
        } else {
            None
        }
    }

    pub(crate) fn consume(&mut self, n: usize) {
        self.input.advance(n);
    }

    pub(crate) fn has_output(&self) -> bool {
        !self.out.is_empty()
    }

    /// 将握手剩余输入作为应用数据交给通道
    pub(crate) fn finish(&mut self, ch: &mut TcpChannel) {
        let rest = self.input.split();
        ch.pending_mut().extend_from_slice(&rest);
        self.out.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::Poll;

    #[test]
    fn pending_served_before_socket() {
        let poll = Poll::new().unwrap();
        let registry = Rc::new(poll.registry().try_clone().unwrap());
        let mut ch = TcpChannel::new(Registration::new(registry, mio::Token(1)), Rc::new(Dialer::default()));
        ch.pending_mut().extend_from_slice(b"early");

        let mut buf = [0u8; 3];
        // pending bytes only flow once the channel is open
        assert_eq!(ch.read(&mut buf).unwrap_err().kind(), io::ErrorKind::WouldBlock);
        ch.open().unwrap();
        assert_eq!(ch.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf, b"ear");
        assert_eq!(ch.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"ly");
        // not connected: would block
        assert_eq!(ch.read(&mut buf).unwrap_err().kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn protocol_error_maps_to_invalid_data() {
        let err = protocol_error("bad reply");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(err.to_string().contains("bad reply"));
    }
}
