use std::io;
use std::net::SocketAddr;
use std::rc::Rc;

use anyhow::{Context, Result};
use mio::{Registry, Token};
use tracing::debug;

use crate::common::Dialer;
use crate::config::{Config, HijackMode, ProxyMode};
use crate::sock::{
    BasicAuth, DirectTcp, DirectUdp, DnsOverTcp, HttpConnect, Registration, SocketOps, Socks5Auth,
    Socks5Tcp, Socks5Udp,
};

const DNS_PORT: u16 = 53;

/// 可分配给流的出站后端
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    DirectTcp,
    DirectUdp,
    Socks5Tcp,
    Socks5Udp,
    HttpConnect,
    DnsOverTcp,
}

impl Transport {
    pub fn as_str(self) -> &'static str {
        match self {
            Transport::DirectTcp => "direct-tcp",
            Transport::DirectUdp => "direct-udp",
            Transport::Socks5Tcp => "socks5-tcp",
            Transport::Socks5Udp => "socks5-udp",
            Transport::HttpConnect => "http-connect",
            Transport::DnsOverTcp => "dns-over-tcp",
        }
    }
}

/// Backend choice for one flow: what to open and where it connects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub transport: Transport,
    pub target: SocketAddr,
}

impl Route {
    fn new(transport: Transport, target: SocketAddr) -> Self {
        Self { transport, target }
    }
}

/// Routing decisions with every endpoint already resolved.
#[derive(Debug, Clone)]
pub struct Policy {
    pub proxy_mode: ProxyMode,
    pub proxy_server: Option<SocketAddr>,
    pub hijack: HijackMode,
    pub resolver: Option<SocketAddr>,
    pub hijack_tcp: bool,
}

impl Policy {
    /// Resolve the configured proxy and resolver. Names are looked up once,
    /// here; the data path never blocks on DNS.
    pub fn from_config(config: &Config) -> Result<Self> {
        let proxy_server = config
            .proxy
            .server
            .as_ref()
            .map(|addr| addr.resolve().with_context(|| format!("cannot resolve proxy server {}", addr)))
            .transpose()?;
        let resolver = config
            .dns
            .server
            .as_ref()
            .map(|addr| addr.resolve().with_context(|| format!("cannot resolve dns server {}", addr)))
            .transpose()?;
        Ok(Self {
            proxy_mode: config.proxy.mode,
            proxy_server,
            hijack: config.dns.hijack,
            resolver,
            hijack_tcp: config.dns.hijack_tcp,
        })
    }

    fn hijacks(&self, dst: SocketAddr) -> bool {
        dst.port() == DNS_PORT && self.hijack != HijackMode::Off
    }

    pub fn select_tcp(&self, dst: SocketAddr) -> Route {
        let mut target = dst;
        if self.hijack_tcp && self.hijacks(dst) {
            match self.hijack {
                HijackMode::Direct => return Route::new(Transport::DirectTcp, dst),
                HijackMode::Tcp => {
                    return Route::new(Transport::DirectTcp, self.resolver.unwrap_or(dst));
                }
                HijackMode::Udp => target = self.resolver.unwrap_or(dst),
                HijackMode::Off => {}
            }
        }
        let transport = match self.proxy_mode {
            ProxyMode::Direct => Transport::DirectTcp,
            ProxyMode::Socks5 => Transport::Socks5Tcp,
            ProxyMode::Http => Transport::HttpConnect,
        };
        Route::new(transport, target)
    }

    /// 代理模式不支持 UDP 时返回 `None`
    pub fn select_udp(&self, dst: SocketAddr) -> Option<Route> {
        let mut target = dst;
        if self.hijacks(dst) {
            match self.hijack {
                HijackMode::Direct => return Some(Route::new(Transport::DirectUdp, dst)),
                HijackMode::Tcp => {
                    return Some(Route::new(Transport::DnsOverTcp, self.resolver.unwrap_or(dst)));
                }
                HijackMode::Udp => target = self.resolver.unwrap_or(dst),
                HijackMode::Off => {}
            }
        }
        match self.proxy_mode {
            ProxyMode::Direct => Some(Route::new(Transport::DirectUdp, target)),
            ProxyMode::Socks5 => Some(Route::new(Transport::Socks5Udp, target)),
            ProxyMode::Http => None,
        }
    }
}

/// Opens the backend a [`Route`] names and starts its connect.
pub struct Dispatcher {
    policy: Policy,
    registry: Rc<Registry>,
    dialer: Rc<Dialer>,
    socks5_auth: Option<Socks5Auth>,
    http_auth: Option<BasicAuth>,
}

impl Dispatcher {
    pub fn new(config: &Config, registry: Rc<Registry>) -> Result<Self> {
        let policy = Policy::from_config(config)?;
        let credentials = match (&config.proxy.username, &config.proxy.password) {
            (Some(username), Some(password)) => Some((username.clone(), password.clone())),
            _ => None,
        };
        debug!(
            mode = config.proxy.mode.as_str(),
            server = ?policy.proxy_server,
            hijack = config.dns.hijack.as_str(),
            resolver = ?policy.resolver,
            "dispatcher ready"
        );
        Ok(Self {
            policy,
            registry,
            dialer: Rc::new(Dialer::new(config.outbound.clone())),
            socks5_auth: credentials.clone().map(|(username, password)| Socks5Auth { username, password }),
            http_auth: credentials.map(|(username, password)| BasicAuth { username, password }),
        })
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    fn proxy_server(&self) -> io::Result<SocketAddr> {
        self.policy
            .proxy_server
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no proxy server configured"))
    }

    /// Build the backend, register it under `token` and start connecting.
    /// A backend whose connect fails is released before returning.
    pub fn open(&self, route: Route, token: Token) -> io::Result<Box<dyn SocketOps>> {
        // SOCKS5 UDP 的控制连接与数据报 socket 共用同一个 token
        let reg = || Registration::new(self.registry.clone(), token);
        let dialer = self.dialer.clone();
        let mut socket: Box<dyn SocketOps> = match route.transport {
            Transport::DirectTcp => Box::new(DirectTcp::new(reg(), dialer)),
            Transport::DirectUdp => Box::new(DirectUdp::new(reg(), dialer)),
            Transport::Socks5Tcp => Box::new(Socks5Tcp::new(
                reg(),
                dialer,
                self.proxy_server()?,
                self.socks5_auth.clone(),
            )),
            Transport::Socks5Udp => Box::new(Socks5Udp::new(
                reg(),
                reg(),
                dialer,
                self.proxy_server()?,
                self.socks5_auth.clone(),
            )),
            Transport::HttpConnect => Box::new(HttpConnect::new(
                reg(),
                dialer,
                self.proxy_server()?,
                self.http_auth.clone(),
            )),
            Transport::DnsOverTcp => Box::new(DnsOverTcp::new(reg(), dialer)),
        };
        socket.connect(route.target)?;
        debug!(
            token = token.0,
            transport = route.transport.as_str(),
            target = %route.target,
            "outbound opened"
        );
        Ok(socket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn policy(mode: ProxyMode, hijack: HijackMode) -> Policy {
        Policy {
            proxy_mode: mode,
            proxy_server: Some(addr("127.0.0.1:1080")),
            hijack,
            resolver: Some(addr("10.0.0.1:53")),
            hijack_tcp: false,
        }
    }

    #[test]
    fn tcp_follows_proxy_mode() {
        let dst = addr("93.184.216.34:80");
        assert_eq!(
            policy(ProxyMode::Socks5, HijackMode::Off).select_tcp(dst),
            Route::new(Transport::Socks5Tcp, dst)
        );
        assert_eq!(
            policy(ProxyMode::Http, HijackMode::Off).select_tcp(dst),
            Route::new(Transport::HttpConnect, dst)
        );
        assert_eq!(
            policy(ProxyMode::Direct, HijackMode::Off).select_tcp(dst),
            Route::new(Transport::DirectTcp, dst)
        );
    }

    #[test]
    fn udp_follows_proxy_mode() {
        let dst = addr("1.2.3.4:443");
        assert_eq!(
            policy(ProxyMode::Socks5, HijackMode::Off).select_udp(dst),
            Some(Route::new(Transport::Socks5Udp, dst))
        );
        assert_eq!(
            policy(ProxyMode::Direct, HijackMode::Off).select_udp(dst),
            Some(Route::new(Transport::DirectUdp, dst))
        );
        assert_eq!(policy(ProxyMode::Http, HijackMode::Off).select_udp(dst), None);
    }

    #[test]
    fn dns_hijack_short_circuits_proxy() {
        let dst = addr("8.8.8.8:53");
        let resolver = addr("10.0.0.1:53");

        let p = policy(ProxyMode::Http, HijackMode::Direct);
        assert_eq!(p.select_udp(dst), Some(Route::new(Transport::DirectUdp, dst)));

        let p = policy(ProxyMode::Http, HijackMode::Tcp);
        assert_eq!(p.select_udp(dst), Some(Route::new(Transport::DnsOverTcp, resolver)));

        let p = policy(ProxyMode::Socks5, HijackMode::Udp);
        assert_eq!(p.select_udp(dst), Some(Route::new(Transport::Socks5Udp, resolver)));

        let p = policy(ProxyMode::Direct, HijackMode::Udp);
        assert_eq!(p.select_udp(dst), Some(Route::new(Transport::DirectUdp, resolver)));

        // rewritten, but http still has no udp transport
        let p = policy(ProxyMode::Http, HijackMode::Udp);
        assert_eq!(p.select_udp(dst), None);
    }

    #[test]
    fn tcp_hijack_needs_flag() {
        let dst = addr("8.8.8.8:53");
        let mut p = policy(ProxyMode::Socks5, HijackMode::Tcp);
        assert_eq!(p.select_tcp(dst), Route::new(Transport::Socks5Tcp, dst));

        p.hijack_tcp = true;
        assert_eq!(p.select_tcp(dst), Route::new(Transport::DirectTcp, addr("10.0.0.1:53")));

        p.hijack = HijackMode::Direct;
        assert_eq!(p.select_tcp(dst), Route::new(Transport::DirectTcp, dst));

        p.hijack = HijackMode::Udp;
        assert_eq!(p.select_tcp(dst), Route::new(Transport::Socks5Tcp, addr("10.0.0.1:53")));
    }

    #[test]
    fn non_dns_ports_never_hijacked() {
        let p = policy(ProxyMode::Direct, HijackMode::Tcp);
        let dst = addr("8.8.8.8:853");
        assert_eq!(p.select_udp(dst), Some(Route::new(Transport::DirectUdp, dst)));
    }

    #[test]
    fn policy_from_config_resolves_endpoints() {
        let config: Config = serde_yml::from_str(
            "proxy:\n  mode: socks5\n  server: 127.0.0.1:1080\ndns:\n  hijack: udp\n  server: 10.0.0.1:53\n",
        )
        .unwrap();
        let p = Policy::from_config(&config).unwrap();
        assert_eq!(p.proxy_server, Some(addr("127.0.0.1:1080")));
        assert_eq!(p.resolver, Some(addr("10.0.0.1:53")));
        assert_eq!(p.hijack, HijackMode::Udp);
    }

    #[test]
    fn open_direct_tcp_registers_under_token() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let poll = mio::Poll::new().unwrap();
        let registry = Rc::new(poll.registry().try_clone().unwrap());
        let dispatcher = Dispatcher::new(&Config::default(), registry).unwrap();

        let route = dispatcher.policy().select_tcp(listener.local_addr().unwrap());
        let mut socket = dispatcher.open(route, Token(7)).unwrap();
        assert_eq!(socket.name(), "direct-tcp");
        socket.destroy();
    }

    #[test]
    fn open_proxy_without_server_fails() {
        let poll = mio::Poll::new().unwrap();
        let registry = Rc::new(poll.registry().try_clone().unwrap());
        let dispatcher = Dispatcher::new(&Config::default(), registry).unwrap();
        let route = Route::new(Transport::Socks5Tcp, addr("1.1.1.1:443"));
        let err = dispatcher.open(route, Token(1)).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
