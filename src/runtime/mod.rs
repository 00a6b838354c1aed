//! The proactor-based worker runtime: shard-per-core workers, each a
//! complete vertical slice (listener, router, interpreter, connection
//! pool) driven by an io_uring event loop.
//!
//! Linux-only: the proactor model and the cBPF affinity filter are both
//! specific to this platform.

mod connection;
mod event_loop;
mod token;
mod worker;

use crate::config::Config;
use std::io;
use std::sync::Arc;

/// Runs the worker pool until the process exits (shutdown on signal is
/// out of scope; this returns only on a startup failure).
pub fn run(config: Config, script_source: String) -> io::Result<()> {
    worker::run(Arc::new(config), Arc::from(script_source))
}
