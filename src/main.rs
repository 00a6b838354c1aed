//! keystone: an HTTP/1.1 request gateway whose routing and policy layer
//! is embedded LuaJIT scripting.
//!
//! - Key-value-free request routing: a radix tree mapping method+path to
//!   a Lua handler, populated by the route script at startup
//! - One shard-per-core worker, each with its own io_uring event loop,
//!   LuaJIT interpreter, and connection pool
//! - SO_REUSEPORT + a cBPF affinity filter for kernel-assisted load
//!   balancing across workers
//! - Configuration via CLI arguments or TOML file

mod bpf;
mod buffer;
mod config;
mod http;
mod router;
mod runtime;
mod script;

use clap::Parser;
use config::{CliArgs, Config};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() {
    // Parse CLI args and stand up logging before any fallible file I/O
    // (config file read, script read) runs, so every failure past this
    // point is reported through `tracing::error!` rather than a bare
    // Debug-printed `Err` from `main`.
    let cli = CliArgs::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = match Config::from_cli(cli) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "failed to load configuration");
            std::process::exit(1);
        }
    };

    let script_source = match config.read_script() {
        Ok(source) => source,
        Err(e) => {
            tracing::error!(error = %e, "failed to read route script");
            std::process::exit(1);
        }
    };

    info!(
        listen = %config.listen,
        workers = config.workers,
        script = %config.script_path.display(),
        "starting keystone"
    );

    if let Err(e) = runtime::run(config, script_source) {
        tracing::error!(error = %e, "keystone exited with error");
        std::process::exit(1);
    }
}
