//! DNS-over-TCP: UDP DNS queries carried over one TCP connection to the
//! resolver, each message prefixed with its 16-bit length (RFC 1035 4.2.2).
//!
//! From the relay's point of view this is a datagram socket: `send` takes
//! one whole query and `recv` yields one whole response.

use std::io;
use std::net::{Shutdown, SocketAddr};
use std::rc::Rc;

use bytes::{Buf, BufMut, BytesMut};
use tracing::debug;

use super::interest::Registration;
use super::stream::TcpChannel;
use super::{Ready, SocketOps};
use crate::common::error::log_sock_error;
use crate::common::Dialer;

/// 从 `buf` 中取出一个完整帧
pub(crate) fn take_frame(buf: &mut BytesMut) -> Option<BytesMut> {
    if buf.len() < 2 {
        return None;
    }
    let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    if buf.len() < 2 + len {
        return None;
    }
    buf.advance(2);
    Some(buf.split_to(len))
}

pub(crate) fn put_frame(buf: &mut BytesMut, msg: &[u8]) -> io::Result<()> {
    let len = u16::try_from(msg.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "dns message exceeds 65535 bytes"))?;
    buf.reserve(2 + msg.len());
    buf.put_u16(len);
    buf.put_slice(msg);
    Ok(())
}

pub struct DnsOverTcp {
    ch: TcpChannel,
    resolver: Option<SocketAddr>,
    out: BytesMut,
    input: BytesMut,
}

impl DnsOverTcp {
    pub fn new(reg: Registration, dialer: Rc<Dialer>) -> Self {
        Self {
            ch: TcpChannel::new(reg, dialer),
            resolver: None,
            out: BytesMut::new(),
            input: BytesMut::new(),
        }
    }

    fn flush_out(&mut self) -> io::Result<()> {
        while !self.out.is_empty() {
            match self.ch.write(&self.out) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => self.out.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        let want = if self.out.is_empty() { Ready::empty() } else { Ready::WRITABLE };
        self.ch.set_internal(want);
        Ok(())
    }

    fn poll_open(&mut self, ready: Ready) -> io::Result<bool> {
        if !self.ch.poll_connect(ready)? {
            return Ok(false);
        }
        self.ch.open()?;
        self.ch.set_internal(Ready::empty());
        Ok(true)
    }
}

impl SocketOps for DnsOverTcp {
    fn connect(&mut self, target: SocketAddr) -> io::Result<()> {
        self.resolver = Some(target);
        self.ch.connect(target)
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut chunk = [0u8; 4096];
        loop {
            if let Some(frame) = take_frame(&mut self.input) {
                let n = frame.len().min(buf.len());
                buf[..n].copy_from_slice(&frame[..n]);
                return Ok(n);
            }
            match self.ch.read(&mut chunk) {
                Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(n) => self.input.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.ch.is_open() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        self.flush_out()?;
        if !self.out.is_empty() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        put_frame(&mut self.out, buf)?;
        self.flush_out()?;
        Ok(buf.len())
    }

    fn shutdown(&mut self, _how: Shutdown) -> io::Result<()> {
        Ok(())
    }

    fn evctl(&mut self, interest: Ready, enabled: bool) {
        self.ch.evctl(interest, enabled);
    }

    fn interest(&self) -> Ready {
        self.ch.interest()
    }

    fn handle_event(&mut self, ready: Ready) -> Ready {
        if !self.ch.is_open() {
            return match self.poll_open(ready) {
                Ok(true) => {
                    debug!(resolver = ?self.resolver, "dns-over-tcp connected");
                    Ready::IO
                }
                Ok(false) => Ready::empty(),
                Err(e) => {
                    log_sock_error("dns-over-tcp connect", &e);
                    Ready::ERROR
                }
            };
        }
        if ready.contains(Ready::WRITABLE) && !self.out.is_empty() {
            if let Err(e) = self.flush_out() {
                log_sock_error("dns-over-tcp write", &e);
                return Ready::ERROR;
            }
        }
        ready
    }

    fn destroy(&mut self) {
        self.ch.destroy();
        self.out.clear();
        self.input.clear();
    }

    fn name(&self) -> &'static str {
        "dns-over-tcp"
    }
}

impl Drop for DnsOverTcp {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_are_length_prefixed() {
        let mut buf = BytesMut::new();
        put_frame(&mut buf, b"abc").unwrap();
        assert_eq!(&buf[..], &[0, 3, b'a', b'b', b'c']);
    }

    #[test]
    fn take_frame_waits_for_whole_message() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0, 4, 1, 2]);
        assert!(take_frame(&mut buf).is_none());
        buf.extend_from_slice(&[3, 4, 0, 1]);
        assert_eq!(&take_frame(&mut buf).unwrap()[..], &[1, 2, 3, 4]);
        // the next frame header stays buffered
        assert_eq!(&buf[..], &[0, 1]);
        assert!(take_frame(&mut buf).is_none());
    }

    #[test]
    fn oversized_message_rejected() {
        let mut buf = BytesMut::new();
        let big = vec![0u8; 65536];
        assert_eq!(put_frame(&mut buf, &big).unwrap_err().kind(), io::ErrorKind::InvalidInput);
        assert!(buf.is_empty());
    }
}
