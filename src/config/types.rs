use anyhow::Result;
use ipnet::{Ipv4Net, Ipv6Net};
use serde::Deserialize;

use crate::common::{Address, DialerConfig};

/// Smallest MTU an IPv6-capable interface may use.
pub const MIN_MTU: usize = 1280;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    pub tunnel: TunnelConfig,
    pub proxy: ProxyConfig,
    pub dns: DnsConfig,
    pub udp: UdpConfig,
    /// Socket options for every outbound connection.
    pub outbound: DialerConfig,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.tunnel.name.is_empty() {
            anyhow::bail!("tunnel name must not be empty");
        }
        if self.tunnel.mtu < MIN_MTU {
            anyhow::bail!("tunnel mtu {} is below the minimum of {}", self.tunnel.mtu, MIN_MTU);
        }
        if self.proxy.mode != ProxyMode::Direct && self.proxy.server.is_none() {
            anyhow::bail!("proxy mode '{}' requires 'proxy.server'", self.proxy.mode.as_str());
        }
        if self.proxy.username.is_some() != self.proxy.password.is_some() {
            anyhow::bail!("proxy username and password must be set together");
        }
        if matches!(self.dns.hijack, HijackMode::Tcp | HijackMode::Udp) && self.dns.server.is_none() {
            anyhow::bail!("dns hijack '{}' requires 'dns.server'", self.dns.hijack.as_str());
        }
        if self.udp.queue_capacity == 0 {
            anyhow::bail!("udp queue_capacity must be at least 1");
        }
        if self.udp.idle_timeout == 0 {
            anyhow::bail!("udp idle_timeout must be at least 1 second");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    pub name: String,
    pub mtu: usize,
    /// Address of the interface; the stack answers for every other address.
    pub ipv4: Ipv4Net,
    pub ipv6: Option<Ipv6Net>,
    /// Assign addresses and bring the link up through `ip`.
    pub setup: bool,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            name: "tun0".to_string(),
            mtu: 8500,
            ipv4: Ipv4Net::new(std::net::Ipv4Addr::new(198, 18, 0, 1), 15).unwrap_or_default(),
            ipv6: None,
            setup: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyMode {
    #[default]
    Direct,
    Socks5,
    Http,
}

impl ProxyMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ProxyMode::Direct => "direct",
            ProxyMode::Socks5 => "socks5",
            ProxyMode::Http => "http",
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub mode: ProxyMode,
    pub server: Option<Address>,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// How DNS traffic (destination port 53) is treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HijackMode {
    /// DNS is ordinary traffic.
    #[default]
    Off,
    /// Always straight to the original destination.
    Direct,
    /// Queries go over TCP to the resolver.
    Tcp,
    /// Destination is rewritten to the resolver, then routed by proxy mode.
    Udp,
}

impl HijackMode {
    pub fn as_str(self) -> &'static str {
        match self {
            HijackMode::Off => "off",
            HijackMode::Direct => "direct",
            HijackMode::Tcp => "tcp",
            HijackMode::Udp => "udp",
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DnsConfig {
    pub hijack: HijackMode,
    pub server: Option<Address>,
    /// Also apply the hijack to TCP connections to port 53.
    pub hijack_tcp: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UdpConfig {
    /// Seconds without traffic before a flow is closed.
    pub idle_timeout: u64,
    pub queue_capacity: usize,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            idle_timeout: 60,
            queue_capacity: crate::relay::DEFAULT_QUEUE_CAPACITY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> Config {
        serde_yml::from_str(yaml).unwrap()
    }

    #[test]
    fn empty_document_uses_defaults() {
        let config = parse("{}");
        assert_eq!(config.log.level, "info");
        assert_eq!(config.tunnel.name, "tun0");
        assert_eq!(config.tunnel.mtu, 8500);
        assert_eq!(config.tunnel.ipv4.to_string(), "198.18.0.1/15");
        assert!(config.tunnel.setup);
        assert_eq!(config.proxy.mode, ProxyMode::Direct);
        assert_eq!(config.dns.hijack, HijackMode::Off);
        assert_eq!(config.udp.idle_timeout, 60);
        assert_eq!(config.udp.queue_capacity, 8);
        config.validate().unwrap();
    }

    #[test]
    fn full_document() {
        let config = parse(
            r#"
log:
  level: debug
tunnel:
  name: utun7
  mtu: 1500
  ipv4: 10.10.0.1/24
  ipv6: fc00::1/64
  setup: false
proxy:
  mode: socks5
  server: 127.0.0.1:1080
  username: u
  password: p
dns:
  hijack: udp
  server: 8.8.8.8:53
  hijack_tcp: true
udp:
  idle_timeout: 30
  queue_capacity: 16
outbound:
  mark: 255
  interface: eth0
"#,
        );
        assert_eq!(config.log.level, "debug");
        assert_eq!(config.tunnel.ipv6.unwrap().to_string(), "fc00::1/64");
        assert_eq!(config.proxy.mode, ProxyMode::Socks5);
        assert_eq!(config.proxy.server, Some(Address::Ip("127.0.0.1:1080".parse().unwrap())));
        assert_eq!(config.dns.hijack, HijackMode::Udp);
        assert!(config.dns.hijack_tcp);
        assert_eq!(config.udp.queue_capacity, 16);
        assert_eq!(config.outbound.mark, Some(255));
        assert_eq!(config.outbound.interface.as_deref(), Some("eth0"));
        config.validate().unwrap();
    }

    #[test]
    fn proxy_without_server_rejected() {
        let config = parse("proxy:\n  mode: http\n");
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("proxy.server"));
    }

    #[test]
    fn hijack_needs_resolver_unless_direct() {
        assert!(parse("dns:\n  hijack: tcp\n").validate().is_err());
        assert!(parse("dns:\n  hijack: udp\n").validate().is_err());
        parse("dns:\n  hijack: direct\n").validate().unwrap();
    }

    #[test]
    fn limits_checked() {
        assert!(parse("udp:\n  queue_capacity: 0\n").validate().is_err());
        assert!(parse("tunnel:\n  mtu: 576\n").validate().is_err());
        assert!(parse("proxy:\n  mode: socks5\n  server: 1.2.3.4:1080\n  username: u\n")
            .validate()
            .is_err());
    }

    #[test]
    fn unknown_mode_is_a_parse_error() {
        assert!(serde_yml::from_str::<Config>("proxy:\n  mode: vmess\n").is_err());
    }
}
