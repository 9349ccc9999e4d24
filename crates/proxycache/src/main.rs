//! Proxycache.
//!
//! Proxycache answers repeated requests of a forwarding proxy from memory. Misses are fetched
//! upstream exactly once, no matter how many requests wait for them, popular entries are
//! refreshed in the background before they go stale, and all entries are written to a snapshot
//! file on shutdown so the next start is warm.
//!
//! This binary is the operator tool for the snapshot file.

#![warn(
    missing_docs,
    missing_debug_implementations,
    unused_crate_dependencies,
    clippy::all
)]

mod cli;
mod logging;
mod metrics;
mod snapshot;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}

