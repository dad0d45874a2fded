// Suppress style lints that fight the lwIP-shaped callback surface.
#![allow(
    clippy::new_without_default,
    clippy::len_without_is_empty,
    clippy::too_many_arguments,
    clippy::manual_div_ceil
)]

pub mod app;
pub mod common;
pub mod config;
pub mod relay;
pub mod sock;
pub mod stack;
pub mod tun;
