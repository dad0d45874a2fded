//! Packet devices the runtime reads IP packets from.
//!
//! On Linux this is a TUN interface opened with `ioctl(TUNSETIFF)` in
//! non-blocking mode and polled through mio's `SourceFd`. A connected
//! `UnixDatagram` also works as a device, one datagram per packet, which is
//! how the runtime is driven without a real interface.

use std::io;

use mio::event::Source;

#[cfg(target_os = "linux")]
pub use linux::TunDevice;

/// A non-blocking source of whole IP packets.
pub trait PacketDevice: Source {
    /// Read one packet. Would-block when nothing is pending.
    fn read_packet(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write one packet.
    fn write_packet(&mut self, packet: &[u8]) -> io::Result<usize>;
}

#[cfg(unix)]
impl PacketDevice for mio::net::UnixDatagram {
    fn read_packet(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.recv(buf)
    }

    fn write_packet(&mut self, packet: &[u8]) -> io::Result<usize> {
        self.send(packet)
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use std::fs::{File, OpenOptions};
    use std::io::{self, Read, Write};
    use std::os::fd::AsRawFd;
    use std::os::unix::fs::OpenOptionsExt;
    use std::process::Command;

    use anyhow::{Context, Result};
    use mio::event::Source;
    use mio::unix::SourceFd;
    use mio::{Interest, Registry, Token};
    use tracing::{debug, info};

    use super::PacketDevice;
    use crate::config::TunnelConfig;

    const TUN_DEVICE_PATH: &str = "/dev/net/tun";
    const IFNAMSIZ: usize = 16;
    /// TUNSETIFF ioctl 编号
    const TUNSETIFF: u64 = 0x400454CA;
    const IFF_TUN: i16 = 0x0001;
    const IFF_NO_PI: i16 = 0x1000;

    #[repr(C)]
    struct IfReq {
        ifr_name: [u8; IFNAMSIZ],
        ifr_flags: i16,
        ifr_ifru: [u8; 24 - std::mem::size_of::<i16>()],
    }

    impl IfReq {
        fn new(name: &str, flags: i16) -> Result<Self> {
            if name.is_empty() || name.len() >= IFNAMSIZ {
                anyhow::bail!("invalid tun interface name: {:?}", name);
            }
            let mut ifr = IfReq {
                ifr_name: [0u8; IFNAMSIZ],
                ifr_flags: flags,
                ifr_ifru: [0u8; 24 - std::mem::size_of::<i16>()],
            };
            ifr.ifr_name[..name.len()].copy_from_slice(name.as_bytes());
            Ok(ifr)
        }
    }

    /// Linux TUN interface without packet information headers.
    #[derive(Debug)]
    pub struct TunDevice {
        file: File,
        name: String,
    }

    impl TunDevice {
        pub fn open(name: &str) -> Result<Self> {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .custom_flags(libc::O_NONBLOCK)
                .open(TUN_DEVICE_PATH)
                .with_context(|| format!("open({}) failed", TUN_DEVICE_PATH))?;

            let mut ifr = IfReq::new(name, IFF_TUN | IFF_NO_PI)?;
            // SAFETY: `ifr` is a properly sized `struct ifreq` that outlives the call.
            let ret = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF as _, &mut ifr as *mut IfReq) };
            if ret < 0 {
                let err = io::Error::last_os_error();
                anyhow::bail!("ioctl(TUNSETIFF) failed: {}", err);
            }

            let len = ifr.ifr_name.iter().position(|&b| b == 0).unwrap_or(IFNAMSIZ);
            let name = String::from_utf8_lossy(&ifr.ifr_name[..len]).into_owned();
            info!(name = %name, "tun device opened");
            Ok(Self { file, name })
        }

        pub fn name(&self) -> &str {
            &self.name
        }

        /// Assign addresses, set the MTU and bring the link up.
        pub fn configure(&self, config: &TunnelConfig) -> Result<()> {
            for args in setup_commands(&self.name, config) {
                run_ip_command(&args)?;
            }
            debug!(name = %self.name, mtu = config.mtu, "tun interface configured");
            Ok(())
        }
    }

    pub(super) fn setup_commands(name: &str, config: &TunnelConfig) -> Vec<Vec<String>> {
        let mut commands = vec![vec![
            "addr".to_string(),
            "replace".to_string(),
            config.ipv4.to_string(),
            "dev".to_string(),
            name.to_string(),
        ]];
        if let Some(v6) = config.ipv6 {
            commands.push(vec![
                "-6".to_string(),
                "addr".to_string(),
                "replace".to_string(),
                v6.to_string(),
                "dev".to_string(),
                name.to_string(),
            ]);
        }
        commands.push(vec![
            "link".to_string(),
            "set".to_string(),
            "dev".to_string(),
            name.to_string(),
            "mtu".to_string(),
            config.mtu.to_string(),
        ]);
        commands.push(vec![
            "link".to_string(),
            "set".to_string(),
            "dev".to_string(),
            name.to_string(),
            "up".to_string(),
        ]);
        commands
    }

    fn run_ip_command(args: &[String]) -> Result<()> {
        let status = Command::new("ip")
            .args(args)
            .status()
            .with_context(|| format!("failed to execute ip command: ip {}", args.join(" ")))?;

        if !status.success() {
            anyhow::bail!("ip command failed (status={}): ip {}", status, args.join(" "));
        }
        Ok(())
    }

    impl PacketDevice for TunDevice {
        fn read_packet(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.file.read(buf)
        }

        fn write_packet(&mut self, packet: &[u8]) -> io::Result<usize> {
            self.file.write(packet)
        }
    }

    impl Source for TunDevice {
        fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
            SourceFd(&self.file.as_raw_fd()).register(registry, token, interests)
        }

        fn reregister(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
            SourceFd(&self.file.as_raw_fd()).reregister(registry, token, interests)
        }

        fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
            SourceFd(&self.file.as_raw_fd()).deregister(registry)
        }
    }

}
