//! # egressd
//!
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![allow(clippy::cognitive_complexity)]
#![deny(rustdoc::broken_intra_doc_links)]
pub use anyhow;
pub use async_trait::async_trait;
pub use chrono;
pub use dhcproto;
pub use pnet;
pub use tokio;
pub use tokio_util;
pub use tracing;

pub mod config;
pub mod fw;
pub mod gateway;
pub mod ha;
pub mod metrics;
pub mod netlink;
pub mod task;
pub mod vaddr;
