use std::io;

use thiserror::Error;

use crate::stack::StackError;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("stack error: {0}")]
    Stack(#[from] StackError),

    #[error("TUN device error: {0}")]
    Tun(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl RelayError {
    /// Get the kind/category of this error.
    pub fn kind(&self) -> RelayErrorKind {
        match self {
            RelayError::Io(e) if is_ignored(e) => RelayErrorKind::Transient,
            RelayError::Io(_) => RelayErrorKind::Io,
            RelayError::Protocol(_) => RelayErrorKind::Protocol,
            RelayError::Config(_) => RelayErrorKind::Config,
            RelayError::Stack(_) => RelayErrorKind::Stack,
            RelayError::Tun(_) => RelayErrorKind::Tun,
            RelayError::Unsupported(_) => RelayErrorKind::Unsupported,
            RelayError::Other(_) => RelayErrorKind::Other,
        }
    }
}

/// Lightweight error category for pattern matching without borrowing the error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayErrorKind {
    Transient,
    Io,
    Protocol,
    Config,
    Stack,
    Tun,
    Unsupported,
    Other,
}

impl RelayErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RelayErrorKind::Transient => "TRANSIENT",
            RelayErrorKind::Io => "IO",
            RelayErrorKind::Protocol => "PROTOCOL",
            RelayErrorKind::Config => "CONFIG",
            RelayErrorKind::Stack => "STACK",
            RelayErrorKind::Tun => "TUN",
            RelayErrorKind::Unsupported => "UNSUPPORTED",
            RelayErrorKind::Other => "OTHER",
        }
    }
}

impl From<RelayError> for io::Error {
    fn from(e: RelayError) -> Self {
        match e {
            RelayError::Io(inner) => inner,
            other => io::Error::other(other.to_string()),
        }
    }
}

/// Socket errors that are part of normal connection churn: resets, refusals,
/// timeouts, in-progress connects and would-block. They drive teardown or
/// flow control and are never worth more than a debug line.
pub fn is_ignored(err: &io::Error) -> bool {
    use io::ErrorKind::*;

    if matches!(
        err.kind(),
        ConnectionReset | ConnectionRefused | BrokenPipe | TimedOut | WouldBlock | NotConnected
    ) {
        return true;
    }
    #[cfg(target_os = "linux")]
    if err.raw_os_error() == Some(libc::EINPROGRESS) {
        return true;
    }
    false
}

/// Log a socket error at the level its classification deserves.
pub fn log_sock_error(what: &str, err: &io::Error) {
    if is_ignored(err) {
        tracing::debug!(error = %err, "{}", what);
    } else {
        tracing::warn!(error = %err, "{}", what);
    }
}

/// Relay buffer exhaustion. The stack's buffer budgets are sized up front,
/// so running out means the deployment is misconfigured; there is no
/// degraded mode to fall back to.
pub fn fatal(what: &str) -> ! {
    tracing::error!("{}: out of memory, aborting", what);
    std::process::abort()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn churn_errors_are_ignored() {
        for kind in [
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::ConnectionRefused,
            io::ErrorKind::BrokenPipe,
            io::ErrorKind::TimedOut,
            io::ErrorKind::WouldBlock,
            io::ErrorKind::NotConnected,
        ] {
            assert!(is_ignored(&io::Error::from(kind)), "{kind:?}");
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn in_progress_connect_is_ignored() {
        let err = io::Error::from_raw_os_error(libc::EINPROGRESS);
        assert!(is_ignored(&err));
    }

    #[test]
    fn other_errors_are_reported() {
        assert!(!is_ignored(&io::Error::from(io::ErrorKind::PermissionDenied)));
        assert!(!is_ignored(&io::Error::other("boom")));
    }

    #[test]
    fn relay_error_kind() {
        let e = RelayError::Io(io::Error::from(io::ErrorKind::ConnectionReset));
        assert_eq!(e.kind(), RelayErrorKind::Transient);
        let e = RelayError::Protocol("bad reply".into());
        assert_eq!(e.kind().as_str(), "PROTOCOL");
    }

    #[test]
    fn relay_error_into_io_keeps_io_kind() {
        let e = RelayError::Io(io::Error::from(io::ErrorKind::BrokenPipe));
        let io_err: io::Error = e.into();
        assert_eq!(io_err.kind(), io::ErrorKind::BrokenPipe);

        let e = RelayError::Protocol("socks5: general failure".into());
        let io_err: io::Error = e.into();
        assert!(io_err.to_string().contains("general failure"));
    }
}
