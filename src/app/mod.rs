pub mod dispatcher;
pub mod router;
pub mod runtime;

pub use dispatcher::{Dispatcher, Policy, Route, Transport};
pub use router::{EventRouter, Owner, TUN_TOKEN};
pub use runtime::Runtime;
