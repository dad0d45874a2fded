use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};

use anyhow::Result;
use bytes::{BufMut, BytesMut};
use serde::Deserialize;

/// 上游端点地址（代理服务器 / DNS 解析器），配置里可以写域名
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl Address {
    pub fn port(&self) -> u16 {
        match self {
            Address::Ip(addr) => addr.port(),
            Address::Domain(_, port) => *port,
        }
    }

    pub fn host(&self) -> String {
        match self {
            Address::Ip(addr) => addr.ip().to_string(),
            Address::Domain(domain, _) => domain.clone(),
        }
    }

    /// 编码为 SOCKS5 地址格式 [ATYP][ADDR][PORT]
    pub fn encode_socks5(&self, buf: &mut BytesMut) {
        match self {
            Address::Ip(addr) => encode_socks5_ip(addr, buf),
            Address::Domain(domain, port) => {
                buf.put_u8(0x03);
                buf.put_u8(domain.len() as u8);
                buf.put_slice(domain.as_bytes());
                buf.put_u16(*port);
            }
        }
    }

    /// 解析 SOCKS5 地址 [ATYP][ADDR][PORT]，返回 (Address, 消耗的字节数)
    pub fn parse_socks5(data: &[u8]) -> Result<(Self, usize)> {
        if data.is_empty() {
            anyhow::bail!("empty data for SOCKS5 address parsing");
        }
        let atyp = data[0];
        match atyp {
            0x01 => {
                // 1(atyp) + 4(ip) + 2(port)
                if data.len() < 7 {
                    anyhow::bail!("insufficient data for IPv4 SOCKS5 address");
                }
                let ip = Ipv4Addr::new(data[1], data[2], data[3], data[4]);
                let port = u16::from_be_bytes([data[5], data[6]]);
                Ok((Address::Ip(SocketAddr::new(IpAddr::V4(ip), port)), 7))
            }
            0x03 => {
                if data.len() < 2 {
                    anyhow::bail!("insufficient data for domain SOCKS5 address");
                }
                let domain_len = data[1] as usize;
                let total = 2 + domain_len + 2;
                if data.len() < total {
                    anyhow::bail!("insufficient data for domain SOCKS5 address");
                }
                let domain = String::from_utf8(data[2..2 + domain_len].to_vec())?;
                let port = u16::from_be_bytes([data[2 + domain_len], data[3 + domain_len]]);
                Ok((Address::Domain(domain, port), total))
            }
            0x04 => {
                // 1(atyp) + 16(ip) + 2(port)
                if data.len() < 19 {
                    anyhow::bail!("insufficient data for IPv6 SOCKS5 address");
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&data[1..17]);
                let ip = Ipv6Addr::from(octets);
                let port = u16::from_be_bytes([data[17], data[18]]);
                Ok((Address::Ip(SocketAddr::new(IpAddr::V6(ip), port)), 19))
            }
            _ => anyhow::bail!("unsupported SOCKS5 address type: 0x{:02x}", atyp),
        }
    }

    /// 阻塞解析，只在启动阶段调用一次
    pub fn resolve(&self) -> Result<SocketAddr> {
        match self {
            Address::Ip(addr) => Ok(*addr),
            Address::Domain(domain, port) => (domain.as_str(), *port)
                .to_socket_addrs()?
                .next()
                .ok_or_else(|| anyhow::anyhow!("DNS resolution failed for {}:{}", domain, port)),
        }
    }
}

/// SOCKS5 地址编码的 IP 版本，数据面上的目标永远是 IP
pub fn encode_socks5_ip(addr: &SocketAddr, buf: &mut BytesMut) {
    match addr {
        SocketAddr::V4(addr) => {
            buf.put_u8(0x01);
            buf.put_slice(&addr.ip().octets());
            buf.put_u16(addr.port());
        }
        SocketAddr::V6(addr) => {
            buf.put_u8(0x04);
            buf.put_slice(&addr.ip().octets());
            buf.put_u16(addr.port());
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address::Ip(addr)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ip(addr) => write!(f, "{}", addr),
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(Address::Ip(addr));
        }
        if let Some((host, port_str)) = s.rsplit_once(':') {
            if let Ok(port) = port_str.parse::<u16>() {
                if host.is_empty() {
                    return Err(serde::de::Error::custom(format!("invalid address: {}", s)));
                }
                return Ok(Address::Domain(host.to_string(), port));
            }
        }
        Err(serde::de::Error::custom(format!("invalid address: {}", s)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_and_host() {
        let ip_addr = Address::Ip("10.0.0.1:3000".parse().unwrap());
        assert_eq!(ip_addr.port(), 3000);
        assert_eq!(ip_addr.host(), "10.0.0.1");

        let domain_addr = Address::Domain("foo.bar".to_string(), 8443);
        assert_eq!(domain_addr.port(), 8443);
        assert_eq!(domain_addr.host(), "foo.bar");
    }

    #[test]
    fn display_format() {
        let addr = Address::Domain("example.com".to_string(), 443);
        assert_eq!(format!("{}", addr), "example.com:443");

        let addr = Address::Ip("1.2.3.4:80".parse().unwrap());
        assert_eq!(format!("{}", addr), "1.2.3.4:80");
    }

    #[test]
    fn encode_socks5_ipv4() {
        let addr = Address::Ip(SocketAddr::new(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)), 443));
        let mut buf = BytesMut::new();
        addr.encode_socks5(&mut buf);
        assert_eq!(&buf[..], &[0x01, 1, 2, 3, 4, 0x01, 0xBB]);
    }

    #[test]
    fn encode_socks5_ipv6() {
        let addr = Address::Ip(SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 80));
        let mut buf = BytesMut::new();
        addr.encode_socks5(&mut buf);
        assert_eq!(buf[0], 0x04);
        assert_eq!(buf.len(), 1 + 16 + 2);
        assert_eq!(&buf[17..19], &[0x00, 0x50]);
    }

    #[test]
    fn encode_socks5_domain() {
        let addr = Address::Domain("test.com".to_string(), 8080);
        let mut buf = BytesMut::new();
        addr.encode_socks5(&mut buf);
        assert_eq!(buf[0], 0x03);
        assert_eq!(buf[1], 8);
        assert_eq!(&buf[2..10], b"test.com");
        assert_eq!(u16::from_be_bytes([buf[10], buf[11]]), 8080);
    }

    #[test]
    fn parse_socks5_ipv4() {
        let data = [0x01, 127, 0, 0, 1, 0x00, 0x50];
        let (addr, consumed) = Address::parse_socks5(&data).unwrap();
        assert_eq!(addr, Address::Ip("127.0.0.1:80".parse().unwrap()));
        assert_eq!(consumed, 7);
    }

    #[test]
    fn parse_socks5_domain_with_trailing_payload() {
        let mut data = vec![0x03, 11];
        data.extend_from_slice(b"example.com");
        data.extend_from_slice(&[0x01, 0xBB]);
        data.extend_from_slice(b"payload");
        let (addr, consumed) = Address::parse_socks5(&data).unwrap();
        assert_eq!(addr, Address::Domain("example.com".to_string(), 443));
        assert_eq!(consumed, 15);
    }

    #[test]
    fn parse_socks5_rejects_short_and_unknown() {
        assert!(Address::parse_socks5(&[]).is_err());
        assert!(Address::parse_socks5(&[0x01, 1, 2]).is_err());
        assert!(Address::parse_socks5(&[0x04; 10]).is_err());
        assert!(Address::parse_socks5(&[0x05, 0, 0]).is_err());
    }

    #[test]
    fn deserialize_ip_and_domain() {
        let addr: Address = serde_yml::from_str("\"[::1]:1080\"").unwrap();
        assert_eq!(addr, Address::Ip("[::1]:1080".parse().unwrap()));
        let addr: Address = serde_yml::from_str("proxy.lan:3128").unwrap();
        assert_eq!(addr, Address::Domain("proxy.lan".to_string(), 3128));
        assert!(serde_yml::from_str::<Address>("no-port").is_err());
        assert!(serde_yml::from_str::<Address>("\":53\"").is_err());
    }

    #[test]
    fn resolve_ip_is_identity() {
        let addr = Address::Ip("10.0.0.1:53".parse().unwrap());
        assert_eq!(addr.resolve().unwrap(), "10.0.0.1:53".parse().unwrap());
    }
}
