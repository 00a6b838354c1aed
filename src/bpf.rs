//! SO_REUSEPORT kernel-assisted connection affinity via classic BPF.
//!
//! A three-instruction cBPF program steers each new connection to
//! `rx_hash % num_workers`, binding it to one worker socket for its
//! lifetime. Attached once, to any one socket in the REUSEPORT group,
//! the kernel applies it to the whole group.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};

/// Not yet exposed by the `libc` crate on all targets; value is fixed by
/// the kernel's `include/uapi/asm-generic/socket.h`.
const SO_ATTACH_REUSEPORT_CBPF: libc::c_int = 51;

const SKF_AD_OFF: i32 = -0x1000;
const SKF_AD_RXHASH: i32 = 32;

#[derive(Debug)]
pub enum BpfError {
    InvalidWorkerCount,
    ProgramTooLarge(usize),
    AttachFailed(std::io::Error),
}

impl std::fmt::Display for BpfError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BpfError::InvalidWorkerCount => write!(f, "worker count must be at least 1"),
            BpfError::ProgramTooLarge(n) => write!(f, "cBPF program has {n} instructions, exceeds kernel limit"),
            BpfError::AttachFailed(e) => write!(f, "SO_ATTACH_REUSEPORT_CBPF failed: {e}"),
        }
    }
}

impl std::error::Error for BpfError {}

/// Builds the three-instruction affinity program: load the kernel's RX
/// hash for this packet, reduce modulo `num_workers`, return the result
/// as the socket index within the REUSEPORT group.
pub fn build_affinity_program(num_workers: u32) -> Result<Vec<libc::sock_filter>, BpfError> {
    if num_workers == 0 {
        return Err(BpfError::InvalidWorkerCount);
    }

    let program = vec![
        libc::sock_filter {
            code: (libc::BPF_LD | libc::BPF_W | libc::BPF_ABS) as u16,
            jt: 0,
            jf: 0,
            k: (SKF_AD_OFF + SKF_AD_RXHASH) as u32,
        },
        libc::sock_filter {
            code: (libc::BPF_ALU | libc::BPF_MOD | libc::BPF_K) as u16,
            jt: 0,
            jf: 0,
            k: num_workers,
        },
        libc::sock_filter {
            code: (libc::BPF_RET | libc::BPF_A) as u16,
            jt: 0,
            jf: 0,
            k: 0,
        },
    ];

    if program.len() > 4096 {
        return Err(BpfError::ProgramTooLarge(program.len()));
    }

    Ok(program)
}

/// Attaches the affinity program to `fd`'s REUSEPORT group. Callers treat
/// failure as tolerated: log and continue without affinity (old kernel,
/// missing capability).
pub fn attach_affinity_filter(fd: RawFd, num_workers: u32) -> Result<(), BpfError> {
    let mut program = build_affinity_program(num_workers)?;

    let fprog = libc::sock_fprog {
        len: program.len() as u16,
        filter: program.as_mut_ptr(),
    };

    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            SO_ATTACH_REUSEPORT_CBPF,
            &fprog as *const libc::sock_fprog as *const libc::c_void,
            std::mem::size_of::<libc::sock_fprog>() as libc::socklen_t,
        )
    };

    if ret != 0 {
        return Err(BpfError::AttachFailed(std::io::Error::last_os_error()));
    }

    Ok(())
}

/// One-shot barrier enforcing the attach-ordering invariant: the filter
/// must be attached before *any* worker calls `listen`. Worker 0 binds,
/// attaches (or tolerates failure), then signals; workers 1..N-1 spin-wait
/// on this flag after their own bind and before their own listen.
pub struct BpfReadyBarrier {
    ready: AtomicBool,
}

impl BpfReadyBarrier {
    pub fn new() -> Self {
        Self {
            ready: AtomicBool::new(false),
        }
    }

    pub fn signal(&self) {
        self.ready.store(true, Ordering::Release);
    }

    pub fn wait(&self) {
        while !self.ready.load(Ordering::Acquire) {
            std::hint::spin_loop();
        }
    }
}

impl Default for BpfReadyBarrier {
    fn default() -> Self {
        Self::new()
    }
}
