//! Token ownership for the poll loop.

use std::collections::HashMap;

use mio::Token;
use smoltcp::iface::SocketHandle;

use crate::stack::FlowKey;

/// 保留给 TUN 设备
pub const TUN_TOKEN: Token = Token(0);

/// 出站 socket 就绪事件的归属
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    Tcp(SocketHandle),
    Udp(FlowKey),
}

#[derive(Debug, Default)]
pub struct EventRouter {
    owners: HashMap<Token, Owner>,
    next: usize,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand out a token not currently in use. Never returns [`TUN_TOKEN`].
    pub fn allocate(&mut self, owner: Owner) -> Token {
        loop {
            self.next = if self.next >= usize::MAX - 1 { 1 } else { self.next + 1 };
            let token = Token(self.next);
            if !self.owners.contains_key(&token) {
                self.owners.insert(token, owner);
                return token;
            }
        }
    }

    pub fn owner(&self, token: Token) -> Option<Owner> {
        self.owners.get(&token).copied()
    }

    pub fn release(&mut self, token: Token) -> Option<Owner> {
        self.owners.remove(&token)
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn udp(port: u16) -> Owner {
        Owner::Udp(FlowKey::new(
            format!("10.0.0.2:{}", port).parse().unwrap(),
            "10.0.0.1:53".parse().unwrap(),
        ))
    }

    #[test]
    fn tokens_start_after_tun() {
        let mut router = EventRouter::new();
        let a = router.allocate(udp(1));
        let b = router.allocate(udp(2));
        assert_ne!(a, TUN_TOKEN);
        assert_ne!(a, b);
        assert_eq!(router.owner(a), Some(udp(1)));
        assert_eq!(router.len(), 2);
    }

    #[test]
    fn release_forgets_owner() {
        let mut router = EventRouter::new();
        let a = router.allocate(udp(1));
        assert_eq!(router.release(a), Some(udp(1)));
        assert_eq!(router.owner(a), None);
        assert!(router.is_empty());
        assert_eq!(router.release(a), None);
    }

    #[test]
    fn wraparound_skips_live_tokens() {
        let mut router = EventRouter::new();
        let first = router.allocate(udp(1));
        router.next = usize::MAX - 1;
        let wrapped = router.allocate(udp(2));
        assert_ne!(wrapped, first);
        assert_ne!(wrapped, TUN_TOKEN);
        assert_eq!(router.owner(first), Some(udp(1)));
    }
}
