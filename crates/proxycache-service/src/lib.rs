//! The caching engine behind the proxycache forwarding path.
//!
//! See the [`caching`] module for an overview of how requests are keyed, populated, refreshed and
//! persisted across restarts.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod logging;
pub mod response;
pub mod utils;
