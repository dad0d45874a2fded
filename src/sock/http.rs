//! HTTP CONNECT tunnel outbound.

use std::io;
use std::net::{Shutdown, SocketAddr};
use std::rc::Rc;

use base64::Engine;
use tracing::debug;

use super::interest::Registration;
use super::stream::{protocol_error, Handshake, TcpChannel};
use super::{Ready, SocketOps};
use crate::common::error::log_sock_error;
use crate::common::Dialer;

/// `Proxy-Authorization` 使用的 Basic 认证凭据
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

pub(crate) fn connect_request(target: &SocketAddr, auth: Option<&BasicAuth>) -> String {
    let mut request = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n", target, target);
    if let Some(auth) = auth {
        let cred = base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", auth.username, auth.password));
        request.push_str(&format!("Proxy-Authorization: Basic {}\r\n", cred));
    }
    request.push_str("\r\n");
    request
}

/// Parse the proxy response head. Returns its length once the blank line
/// has arrived and the status is 200.
pub(crate) fn parse_response(buf: &[u8]) -> io::Result<Option<usize>> {
    let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
        return Ok(None);
    };
    let head = String::from_utf8_lossy(&buf[..end]);
    let status_line = head.lines().next().unwrap_or_default();
    let status_code = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| protocol_error(format!("http proxy: invalid response: {}", status_line.trim())))?;
    if status_code != 200 {
        return Err(protocol_error(format!("http proxy CONNECT failed: {}", status_line.trim())));
    }
    Ok(Some(end + 4))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Connecting,
    Response,
    Done,
    Failed,
}

pub struct HttpConnect {
    ch: TcpChannel,
    server: SocketAddr,
    auth: Option<BasicAuth>,
    target: Option<SocketAddr>,
    stage: Stage,
    hs: Handshake,
}

impl HttpConnect {
    pub fn new(reg: Registration, dialer: Rc<Dialer>, server: SocketAddr, auth: Option<BasicAuth>) -> Self {
        Self {
            ch: TcpChannel::new(reg, dialer),
            server,
            auth,
            target: None,
            stage: Stage::Connecting,
            hs: Handshake::default(),
        }
    }

    fn progress(&mut self, ready: Ready) -> io::Result<bool> {
        if !self.ch.poll_connect(ready)? {
            return Ok(false);
        }
        if self.stage == Stage::Connecting {
            let target = self.target.ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
            self.hs.queue(connect_request(&target, self.auth.as_ref()).as_bytes());
            self.stage = Stage::Response;
        }
        if !self.hs.flush(&mut self.ch)? {
            self.ch.set_internal(Ready::WRITABLE);
            return Ok(false);
        }
        self.hs.fill(&mut self.ch)?;
        match parse_response(self.hs.input())? {
            Some(head) => {
                self.hs.consume(head);
                self.hs.finish(&mut self.ch);
                self.stage = Stage::Done;
                self.ch.set_internal(Ready::empty());
                self.ch.open()?;
                Ok(true)
            }
            None => {
                if let Some(err) = self.hs.stalled("http proxy") {
                    return Err(err);
                }
                self.ch.set_internal(Ready::empty());
                Ok(false)
            }
        }
    }
}

impl SocketOps for HttpConnect {
    fn connect(&mut self, target: SocketAddr) -> io::Result<()> {
        self.target = Some(target);
        debug!(target = %target, server = %self.server, "http CONNECT proxy");
        self.ch.connect(self.server)
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
        match self.stage {
            Stage::Done => return ready,
            Stage::Failed => return Ready::ERROR,
            _ => {}
        }
        match self.progress(ready) {
            Ok(true) => {
                debug!(target = ?self.target, "http CONNECT tunnel established");
                Ready::IO | (ready & Ready::HUP)
            }
            Ok(false) => Ready::empty(),
            Err(e) => {
                log_sock_error("http CONNECT", &e);
                self.stage = Stage::Failed;
                Ready::ERROR
            }
        }
    }

    fn destroy(&mut self) {
        self.ch.destroy();
    }

    fn name(&self) -> &'static str {
        "http-connect"
    }
}

impl Drop for HttpConnect {
    fn drop(&mut self) {
        self.destroy();
    }
}
