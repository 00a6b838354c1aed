//! Worker lifecycle: socket creation, the BPF attach-ordering barrier,
//! and the pool of worker threads.

use crate::bpf::{self, BpfReadyBarrier};
use crate::config::Config;
use crate::runtime::event_loop::{self, EventLoopConfig};
use crate::script::ScriptEngine;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::thread;
use tracing::{error, info, warn};

/// Spawns one worker thread per configured worker, waits for all of them
/// indefinitely (shutdown on signal is out of scope), and propagates the
/// first worker failure as the process's overall result.
pub fn run(config: Arc<Config>, script_source: Arc<str>) -> io::Result<()> {
    let addr = config.socket_addr()?;
    let barrier = Arc::new(BpfReadyBarrier::new());

    info!(
        workers = config.workers,
        addr = %addr,
        "starting keystone worker pool"
    );

    let mut handles = Vec::with_capacity(config.workers);

    for worker_id in 0..config.workers {
        let config = Arc::clone(&config);
        let script_source = Arc::clone(&script_source);
        let barrier = Arc::clone(&barrier);

        let handle = thread::Builder::new()
            .name(format!("keystone-worker-{worker_id}"))
            .spawn(move || {
                if let Err(e) = worker_main(worker_id, &config, &script_source, &barrier) {
                    error!(worker = worker_id, error = %e, "worker exited with error");
                }
            })?;

        handles.push(handle);
    }

    for handle in handles {
        let _ = handle.join();
    }

    Ok(())
}

fn worker_main(
    worker_id: usize,
    config: &Config,
    script_source: &str,
    barrier: &BpfReadyBarrier,
) -> io::Result<()> {
    let addr = config.socket_addr()?;
    let socket = create_worker_socket(addr)?;

    // The filter must be attached before any worker calls listen. Worker
    // 0 binds, attaches, signals; everyone else waits here, after their
    // own bind, before listen.
    if worker_id == 0 {
        if config.enable_bpf_affinity {
            match bpf::attach_affinity_filter(socket.as_raw_fd(), config.workers as u32) {
                Ok(()) => info!("attached SO_REUSEPORT cBPF affinity filter"),
                Err(e) => warn!(error = %e, "BPF affinity attach failed; continuing without affinity"),
            }
        }
        barrier.signal();
    } else {
        barrier.wait();
    }

    socket.listen(config.accept_backlog)?;

    let (engine, router) = ScriptEngine::load(script_source).map_err(|e| {
        io::Error::new(io::ErrorKind::InvalidData, e.to_string())
    })?;

    let event_loop_cfg = EventLoopConfig {
        ring_size: config.ring_size,
        read_buffer_size: config.read_buffer_size,
        max_connections: config.max_connections,
        batch_size: config.batch_size,
    };

    event_loop::run(worker_id, socket.as_raw_fd(), &event_loop_cfg, &router, &engine)
}

fn create_worker_socket(addr: SocketAddr) -> io::Result<socket2::Socket> {
    let domain = match addr {
        SocketAddr::V4(_) => socket2::Domain::IPV4,
        SocketAddr::V6(_) => socket2::Domain::IPV6,
    };

    let socket = socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))?;
    socket.set_reuse_port(true)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket)
}
