//! SOCKS5 outbound (RFC 1928), CONNECT and UDP ASSOCIATE.
//!
//! The handshake runs inside `handle_event` as a small state machine over
//! the non-blocking control connection:
//!
//! 1. greeting `[VER, NMETHODS, METHODS...]`, method reply `[VER, METHOD]`
//! 2. optional RFC 1929 sub-negotiation `[0x01, ULEN, UNAME, PLEN, PASSWD]`
//! 3. request `[VER, CMD, RSV, ATYP, DST.ADDR, DST.PORT]` and its reply
//!
//! Until the reply arrives the relay sees no readiness; afterwards the
//! socket behaves like a plain stream (CONNECT) or a datagram socket
//! carrying the SOCKS5 UDP header (UDP ASSOCIATE).

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr};
use std::rc::Rc;

use bytes::{BufMut, BytesMut};
use mio::net::UdpSocket;
use tracing::{debug, trace};

use super::interest::Registration;
use super::stream::{protocol_error, Handshake, TcpChannel};
use super::{Ready, SocketOps};
use crate::common::addr::encode_socks5_ip;
use crate::common::error::log_sock_error;
use crate::common::{Address, Dialer};

const VERSION: u8 = 0x05;
const AUTH_VERSION: u8 = 0x01;
const CMD_CONNECT: u8 = 0x01;
const CMD_UDP_ASSOCIATE: u8 = 0x03;
const METHOD_NONE: u8 = 0x00;
const METHOD_USERPASS: u8 = 0x02;
const METHOD_REJECTED: u8 = 0xFF;

/// RFC 1929 用户名/密码
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Socks5Auth {
    pub username: String,
    pub password: String,
}

pub(crate) fn greeting(auth: bool) -> &'static [u8] {
    if auth {
        // NO_AUTH 和 USERNAME_PASSWORD
        &[VERSION, 0x02, METHOD_NONE, METHOD_USERPASS]
    } else {
        &[VERSION, 0x01, METHOD_NONE]
    }
}

/// 解析方法选择回复，数据不完整时返回 `Ok(None)`
pub(crate) fn parse_method(buf: &[u8], auth_offered: bool) -> io::Result<Option<u8>> {
    if buf.len() < 2 {
        return Ok(None);
    }
    if buf[0] != VERSION {
        return Err(protocol_error(format!(
            "socks5: server returned unsupported version: 0x{:02x}",
            buf[0]
        )));
    }
    match buf[1] {
        METHOD_NONE => Ok(Some(METHOD_NONE)),
        METHOD_USERPASS if auth_offered => Ok(Some(METHOD_USERPASS)),
        METHOD_REJECTED => Err(protocol_error("socks5: server rejected all authentication methods")),
        method => Err(protocol_error(format!(
            "socks5: unsupported auth method selected: 0x{:02x}",
            method
        ))),
    }
}

pub(crate) fn auth_request(auth: &Socks5Auth) -> io::Result<BytesMut> {
    let user = auth.username.as_bytes();
    let pass = auth.password.as_bytes();
    if user.len() > 255 || pass.len() > 255 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "socks5: username and password are limited to 255 bytes",
        ));
    }
    let mut req = BytesMut::with_capacity(3 + user.len() + pass.len());
    req.put_u8(AUTH_VERSION);
    req.put_u8(user.len() as u8);
    req.put_slice(user);
    req.put_u8(pass.len() as u8);
    req.put_slice(pass);
    Ok(req)
}

pub(crate) fn parse_auth(buf: &[u8]) -> io::Result<Option<()>> {
    if buf.len() < 2 {
        return Ok(None);
    }
    if buf[1] != 0x00 {
        return Err(protocol_error(format!(
            "socks5: authentication failed (status: 0x{:02x})",
            buf[1]
        )));
    }
    Ok(Some(()))
}

pub(crate) fn request(cmd: u8, target: &SocketAddr) -> BytesMut {
    let mut req = BytesMut::with_capacity(22);
    req.put_u8(VERSION);
    req.put_u8(cmd);
    req.put_u8(0x00);
    encode_socks5_ip(target, &mut req);
    req
}

fn reply_reason(code: u8) -> &'static str {
    match code {
        0x01 => "general failure",
        0x02 => "connection not allowed",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown error",
    }
}

/// Parse a request reply. Returns the bound address and the reply length,
/// or `Ok(None)` while incomplete.
pub(crate) fn parse_reply(buf: &[u8]) -> io::Result<Option<(Address, usize)>> {
    if buf.len() < 2 {
        return Ok(None);
    }
    if buf[0] != VERSION {
        return Err(protocol_error(format!(
            "socks5: invalid reply version: 0x{:02x}",
            buf[0]
        )));
    }
    if buf[1] != 0x00 {
        return Err(protocol_error(format!(
            "socks5: request failed: {} (0x{:02x})",
            reply_reason(buf[1]),
            buf[1]
        )));
    }
    if buf.len() < 5 {
        return Ok(None);
    }
    let addr_len = match buf[3] {
        0x01 => 1 + 4 + 2,
        0x04 => 1 + 16 + 2,
        0x03 => 1 + 1 + buf[4] as usize + 2,
        atyp => {
            return Err(protocol_error(format!(
                "socks5: unsupported bind address type: 0x{:02x}",
                atyp
            )))
        }
    };
    if buf.len() < 3 + addr_len {
        return Ok(None);
    }
    let (bound, used) = Address::parse_socks5(&buf[3..]).map_err(|e| protocol_error(e.to_string()))?;
    Ok(Some((bound, 3 + used)))
}

/// UDP 请求头 `[RSV RSV FRAG ATYP DST.ADDR DST.PORT]`
pub fn udp_header(target: &SocketAddr) -> BytesMut {
    let mut hdr = BytesMut::with_capacity(22);
    hdr.put_u16(0);
    hdr.put_u8(0);
    encode_socks5_ip(target, &mut hdr);
    hdr
}

/// Length of the UDP header in `buf`, or `None` for datagrams that must be
/// dropped (truncated, fragmented, unknown address type).
pub fn parse_udp_header(buf: &[u8]) -> Option<(Address, usize)> {
    if buf.len() < 4 || buf[2] != 0 {
        return None;
    }
    let (addr, used) = Address::parse_socks5(&buf[3..]).ok()?;
    Some((addr, 3 + used))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Connecting,
    Method,
    Auth,
    Reply,
    Done,
    Failed,
}

/// SOCKS5 客户端协商流程，CONNECT 与 UDP ASSOCIATE 共用
struct Negotiator {
    server: SocketAddr,
    auth: Option<Socks5Auth>,
    cmd: u8,
    dst: SocketAddr,
    stage: Stage,
    hs: Handshake,
    bound: Option<Address>,
}

impl Negotiator {
    fn new(server: SocketAddr, auth: Option<Socks5Auth>, cmd: u8) -> Self {
        Self {
            server,
            auth,
            cmd,
            dst: unspecified_for(server),
            stage: Stage::Connecting,
            hs: Handshake::default(),
            bound: None,
        }
    }

    /// `Ok(true)` once the request reply has been consumed.
    fn advance(&mut self, ch: &mut TcpChannel, ready: Ready) -> io::Result<bool> {
        if !ch.poll_connect(ready)? {
            return Ok(false);
        }
        loop {
            if !self.hs.flush(ch)? {
                ch.set_internal(Ready::WRITABLE);
                return Ok(false);
            }
            match self.stage {
                // === 方法协商 ===
                Stage::Connecting => {
                    self.hs.queue(greeting(self.auth.is_some()));
                    self.stage = Stage::Method;
                }
                Stage::Method => {
                    self.hs.fill(ch)?;
                    let Some(method) = parse_method(self.hs.input(), self.auth.is_some())? else {
                        return self.wait(ch);
                    };
                    self.hs.consume(2);
                    match (method, self.auth.as_ref()) {
                        (METHOD_USERPASS, Some(auth)) => {
                            let req = auth_request(auth)?;
                            self.hs.queue(&req);
                            self.stage = Stage::Auth;
                        }
                        _ => {
                            debug!(server = %self.server, "socks5: no authentication required");
                            self.hs.queue(&request(self.cmd, &self.dst));
                            self.stage = Stage::Reply;
                        }
                    }
                }
                // === 用户名密码认证 (RFC 1929) ===
                Stage::Auth => {
                    self.hs.fill(ch)?;
                    if parse_auth(self.hs.input())?.is_none() {
                        return self.wait(ch);
                    }
                    self.hs.consume(2);
                    debug!(server = %self.server, "socks5: authentication successful");
                    self.hs.queue(&request(self.cmd, &self.dst));
                    self.stage = Stage::Reply;
                }
                // 读取回复，BND.ADDR 之后的字节属于应用数据
                Stage::Reply => {
                    self.hs.fill(ch)?;
                    let Some((bound, used)) = parse_reply(self.hs.input())? else {
                        return self.wait(ch);
                    };
                    self.hs.consume(used);
                    self.hs.finish(ch);
                    self.bound = Some(bound);
                    self.stage = Stage::Done;
                    ch.set_internal(Ready::empty());
                    return Ok(true);
                }
                Stage::Done => return Ok(true),
                Stage::Failed => return Err(protocol_error("socks5: handshake failed")),
            }
        }
    }

    fn wait(&mut self, ch: &mut TcpChannel) -> io::Result<bool> {
        if let Some(err) = self.hs.stalled("socks5") {
            return Err(err);
        }
        if !self.hs.has_output() {
            ch.set_internal(Ready::empty());
        }
        Ok(false)
    }
}

fn unspecified_for(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    }
}

/// SOCKS5 出站代理 (CONNECT)
pub struct Socks5Tcp {
    ch: TcpChannel,
    neg: Negotiator,
}

impl Socks5Tcp {
    pub fn new(reg: Registration, dialer: Rc<Dialer>, server: SocketAddr, auth: Option<Socks5Auth>) -> Self {
        Self {
            ch: TcpChannel::new(reg, dialer),
            neg: Negotiator::new(server, auth, CMD_CONNECT),
        }
    }

    fn progress(&mut self, ready: Ready) -> io::Result<bool> {
        if !self.neg.advance(&mut self.ch, ready)? {
            return Ok(false);
        }
        self.ch.open()?;
        Ok(true)
    }
}

impl SocketOps for Socks5Tcp {
    fn connect(&mut self, target: SocketAddr) -> io::Result<()> {
        self.neg.dst = target;
        self.ch.connect(self.neg.server)
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
        match self.neg.stage {
            Stage::Done => return ready,
            Stage::Failed => return Ready::ERROR,
            _ => {}
        }
        match self.progress(ready) {
            Ok(true) => {
                debug!(server = %self.neg.server, target = %self.neg.dst, "socks5: tunnel established");
                Ready::IO | (ready & Ready::HUP)
            }
            Ok(false) => Ready::empty(),
            Err(e) => {
                log_sock_error("socks5 handshake", &e);
                self.neg.stage = Stage::Failed;
                Ready::ERROR
            }
        }
    }

    fn destroy(&mut self) {
        self.ch.destroy();
    }

    fn name(&self) -> &'static str {
        "socks5-tcp"
    }
}

impl Drop for Socks5Tcp {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// UDP through a SOCKS5 UDP ASSOCIATE relay. The control connection and the
/// datagram socket share one token; the association ends when the control
/// connection closes.
pub struct Socks5Udp {
    ch: TcpChannel,
    neg: Negotiator,
    udp_reg: Registration,
    dialer: Rc<Dialer>,
    socket: Option<UdpSocket>,
    header: BytesMut,
}

impl Socks5Udp {
    pub fn new(
        ctl_reg: Registration,
        udp_reg: Registration,
        dialer: Rc<Dialer>,
        server: SocketAddr,
        auth: Option<Socks5Auth>,
    ) -> Self {
        Self {
            ch: TcpChannel::new(ctl_reg, dialer.clone()),
            neg: Negotiator::new(server, auth, CMD_UDP_ASSOCIATE),
            udp_reg,
            dialer,
            socket: None,
            header: BytesMut::new(),
        }
    }

    /// Where datagrams go: the bound address, with an unspecified or named
    /// host replaced by the proxy server's address.
    fn relay_addr(&self) -> SocketAddr {
        match self.neg.bound.as_ref() {
            Some(Address::Ip(addr)) if !addr.ip().is_unspecified() => *addr,
            Some(bound) => SocketAddr::new(self.neg.server.ip(), bound.port()),
            None => self.neg.server,
        }
    }

    fn progress(&mut self, ready: Ready) -> io::Result<bool> {
        if !self.neg.advance(&mut self.ch, ready)? {
            return Ok(false);
        }
        self.open_relay()?;
        Ok(true)
    }

    fn open_relay(&mut self) -> io::Result<()> {
        let relay = self.relay_addr();
        let mut socket = self.dialer.udp(relay)?;
        self.udp_reg.register(&mut socket)?;
        self.socket = Some(socket);
        self.ch.open()?;
        debug!(server = %self.neg.server, relay = %relay, "socks5: udp associated");
        Ok(())
    }

    /// 读空控制连接；EOF 或错误即结束关联
    fn check_control(&mut self) -> Ready {
        let mut scratch = [0u8; 64];
        loop {
            match self.ch.read_raw(&mut scratch) {
                Ok(0) => return Ready::HUP,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ready::empty(),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log_sock_error("socks5 control", &e);
                    return Ready::ERROR;
                }
            }
        }
    }
}

impl SocketOps for Socks5Udp {
    fn connect(&mut self, target: SocketAddr) -> io::Result<()> {
        self.header = udp_header(&target);
        self.ch.connect(self.neg.server)
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let socket = self.socket.as_ref().ok_or_else(|| io::Error::from(io::ErrorKind::WouldBlock))?;
        loop {
            let n = socket.recv(buf)?;
            match parse_udp_header(&buf[..n]) {
                Some((_, hdr)) => {
                    buf.copy_within(hdr..n, 0);
                    return Ok(n - hdr);
                }
                None => trace!(len = n, "socks5: dropping malformed or fragmented datagram"),
            }
        }
    }

    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        let socket = self.socket.as_ref().ok_or_else(|| io::Error::from(io::ErrorKind::WouldBlock))?;
        let mut pkt = BytesMut::with_capacity(self.header.len() + buf.len());
        pkt.put_slice(&self.header);
        pkt.put_slice(buf);
        socket.send(&pkt)?;
        Ok(buf.len())
    }

    fn shutdown(&mut self, _how: Shutdown) -> io::Result<()> {
        Ok(())
    }

    fn evctl(&mut self, interest: Ready, enabled: bool) {
        if self.udp_reg.set_user(interest, enabled) {
            if let Some(socket) = self.socket.as_mut() {
                if let Err(e) = self.udp_reg.reregister(socket) {
                    log_sock_error("reregister", &e);
                }
            }
        }
    }

    fn interest(&self) -> Ready {
        self.udp_reg.user()
    }

    fn handle_event(&mut self, ready: Ready) -> Ready {
        match self.neg.stage {
            Stage::Done => return ready | self.check_control(),
            Stage::Failed => return Ready::ERROR,
            _ => {}
        }
        match self.progress(ready) {
            Ok(true) => Ready::IO,
            Ok(false) => Ready::empty(),
            Err(e) => {
                log_sock_error("socks5 udp associate", &e);
                self.neg.stage = Stage::Failed;
                Ready::ERROR
            }
        }
    }

    fn destroy(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            self.udp_reg.deregister(&mut socket);
        }
        self.ch.destroy();
    }

    fn name(&self) -> &'static str {
        "socks5-udp"
    }
}

impl Drop for Socks5Udp {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn greeting_offers_userpass_only_with_credentials() {
        assert_eq!(greeting(false), &[0x05, 0x01, 0x00]);
        assert_eq!(greeting(true), &[0x05, 0x02, 0x00, 0x02]);
    }

    #[test]
    fn method_reply() {
        assert!(parse_method(&[0x05], false).unwrap().is_none());
        assert_eq!(parse_method(&[0x05, 0x00], false).unwrap(), Some(0x00));
        assert_eq!(parse_method(&[0x05, 0x02], true).unwrap(), Some(0x02));
        assert!(parse_method(&[0x05, 0x02], false).is_err());
        assert!(parse_method(&[0x05, 0xFF], true).is_err());
        assert!(parse_method(&[0x04, 0x00], true).is_err());
    }

    #[test]
    fn auth_request_layout() {
        let auth = Socks5Auth {
            username: "u".into(),
            password: "pw".into(),
        };
        let req = auth_request(&auth).unwrap();
        assert_eq!(&req[..], &[0x01, 1, b'u', 2, b'p', b'w']);
        assert!(parse_auth(&[0x01, 0x00]).unwrap().is_some());
        assert!(parse_auth(&[0x01, 0x01]).is_err());

        let long = Socks5Auth {
            username: "x".repeat(256),
            password: String::new(),
        };
        assert!(auth_request(&long).is_err());
    }

    #[test]
    fn connect_request_encodes_ip_target() {
        let req = request(CMD_CONNECT, &"93.184.216.34:80".parse().unwrap());
        assert_eq!(&req[..], &[0x05, 0x01, 0x00, 0x01, 93, 184, 216, 34, 0x00, 0x50]);
    }

    #[test]
    fn reply_parsing_waits_for_full_address() {
        let full = [0x05, 0x00, 0x00, 0x01, 10, 0, 0, 1, 0x04, 0x38, 0xAA];
        for cut in 0..10 {
            assert!(parse_reply(&full[..cut]).unwrap().is_none(), "cut {cut}");
        }
        let (bound, used) = parse_reply(&full).unwrap().unwrap();
        assert_eq!(bound, Address::Ip("10.0.0.1:1080".parse().unwrap()));
        assert_eq!(used, 10);
    }

    #[test]
    fn reply_with_domain_bind() {
        let mut reply = vec![0x05, 0x00, 0x00, 0x03, 4];
        reply.extend_from_slice(b"host");
        reply.extend_from_slice(&[0x1F, 0x90]);
        let (bound, used) = parse_reply(&reply).unwrap().unwrap();
        assert_eq!(bound, Address::Domain("host".into(), 8080));
        assert_eq!(used, reply.len());
    }

    #[test]
    fn reply_failure_names_reason() {
        let err = parse_reply(&[0x05, 0x05, 0x00, 0x01]).unwrap_err();
        assert!(err.to_string().contains("connection refused"));
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn udp_header_roundtrip_and_drop_rules() {
        let target: SocketAddr = "8.8.8.8:53".parse().unwrap();
        let mut pkt = udp_header(&target);
        assert_eq!(&pkt[..], &[0, 0, 0, 0x01, 8, 8, 8, 8, 0, 53]);
        pkt.put_slice(b"query");
        let (addr, hdr) = parse_udp_header(&pkt).unwrap();
        assert_eq!(addr, Address::Ip(target));
        assert_eq!(&pkt[hdr..], b"query");

        let mut frag = pkt.clone();
        frag[2] = 1;
        assert!(parse_udp_header(&frag).is_none());
        assert!(parse_udp_header(&[0, 0, 0]).is_none());
        assert!(parse_udp_header(&[0, 0, 0, 0x09, 1, 2]).is_none());
    }
}
