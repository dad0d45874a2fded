//! Per-socket mio registration bookkeeping.
//!
//! Sources stay registered for READABLE at all times so hangups and
//! errors are never missed. WRITABLE is added while either the relay or
//! the backend itself (connect, handshake output) wants it. Arming an
//! interest bit re-registers the source, which makes epoll report a
//! condition that is already pending even in edge-triggered mode.

use std::io;
use std::rc::Rc;

use mio::event::Source;
use mio::{Interest, Registry, Token};
use tracing::trace;

use super::Ready;

pub struct Registration {
    registry: Rc<Registry>,
    token: Token,
    /// relay 登记的关注事件
    user: Ready,
    /// 后端自身推进（连接/握手）所需的关注事件
    internal: Ready,
    registered: bool,
}

impl Registration {
    pub fn new(registry: Rc<Registry>, token: Token) -> Self {
        Self {
            registry,
            token,
            user: Ready::empty(),
            internal: Ready::empty(),
            registered: false,
        }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn registry(&self) -> &Rc<Registry> {
        &self.registry
    }

    pub fn user(&self) -> Ready {
        self.user
    }

    pub fn internal(&self) -> Ready {
        self.internal
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    fn mio_interest(&self) -> Interest {
        if (self.user | self.internal).contains(Ready::WRITABLE) {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        }
    }

    pub fn register<S: Source + ?Sized>(&mut self, source: &mut S) -> io::Result<()> {
        self.registry.register(source, self.token, self.mio_interest())?;
        self.registered = true;
        Ok(())
    }

    pub fn reregister<S: Source + ?Sized>(&mut self, source: &mut S) -> io::Result<()> {
        if !self.registered {
            return self.register(source);
        }
        trace!(token = self.token.0, user = ?self.user, internal = ?self.internal, "reregister");
        self.registry.reregister(source, self.token, self.mio_interest())
    }

    pub fn deregister<S: Source + ?Sized>(&mut self, source: &mut S) {
        if self.registered {
            // fd 随后即关闭，忽略错误
            let _ = self.registry.deregister(source);
            self.registered = false;
        }
    }

    /// Update relay interest. Returns true when the source must be
    /// re-registered: a bit was newly armed.
    pub fn set_user(&mut self, interest: Ready, enabled: bool) -> bool {
        let interest = interest & Ready::IO;
        let before = self.user;
        if enabled {
            self.user |= interest;
        } else {
            self.user.remove(interest);
        }
        let armed = enabled && !before.contains(interest);
        armed || writable_changed(before | self.internal, self.user | self.internal)
    }

    /// Replace backend interest. Returns true when the mio interest set
    /// changed.
    pub fn set_internal(&mut self, interest: Ready) -> bool {
        let before = self.internal;
        self.internal = interest & Ready::IO;
        before != self.internal && writable_changed(self.user | before, self.user | self.internal)
    }
}

fn writable_changed(before: Ready, after: Ready) -> bool {
    before.contains(Ready::WRITABLE) != after.contains(Ready::WRITABLE)
}
