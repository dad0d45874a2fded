pub mod addr;
pub mod dialer;
pub mod error;

pub use addr::Address;
pub use dialer::{Dialer, DialerConfig};
pub use error::{fatal, is_ignored, RelayError};
