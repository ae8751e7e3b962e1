//! Signal handling for the main loop.
//!
//! Handlers do the minimum that is async-signal-safe: set a flag and write
//! one byte to a non-blocking self-pipe. The main loop blocks in `poll(2)`
//! on the pipe's read end instead of a bare sleep, so any handled signal
//! wakes it through a single selectable event source.
//!
//! - SIGTERM / SIGINT set the termination flag for a graceful exit.
//! - SIGHUP requests an immediate full rescan of the spool.
//! - SIGCHLD reaps every exited child; pure zombie bookkeeping, no status
//!   is reported anywhere.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use libc::c_int;

use crate::error::{Result, RunqError};

static TERMINATED: AtomicBool = AtomicBool::new(false);
static RESCAN: AtomicBool = AtomicBool::new(false);
static WAKE_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn on_terminate(_sig: c_int) {
    TERMINATED.store(true, Ordering::Relaxed);
    wake();
}

extern "C" fn on_hangup(_sig: c_int) {
    RESCAN.store(true, Ordering::Relaxed);
    wake();
}

extern "C" fn on_child(_sig: c_int) {
    // SAFETY: waitpid with WNOHANG is async-signal-safe. errno is saved and
    // restored because waitpid clobbers it and the handler may interrupt
    // code inspecting it.
    unsafe {
        let errno = libc::__errno_location();
        let saved = *errno;
        while libc::waitpid(-1, std::ptr::null_mut(), libc::WNOHANG) > 0 {}
        *errno = saved;
    }
}

fn wake() {
    let fd = WAKE_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        // SAFETY: write(2) is async-signal-safe; the pipe is non-blocking,
        // so a full pipe drops the byte, which is fine since one pending
        // byte already wakes the loop.
        unsafe {
            libc::write(fd, b"w".as_ptr().cast(), 1);
        }
    }
}

/// True once a termination signal has been observed.
pub fn terminated() -> bool {
    TERMINATED.load(Ordering::Relaxed)
}

/// Consume a pending SIGHUP rescan request.
pub fn take_rescan_request() -> bool {
    RESCAN.swap(false, Ordering::Relaxed)
}

/// Handle to the self-pipe's read end; the main loop's only blocking point.
#[derive(Debug)]
pub struct Wakeup {
    read_fd: c_int,
}

/// Install the signal disposition table and the self-pipe. Must run before
/// the first scan so one-shot runs also reap their workers.
pub fn install() -> Result<Wakeup> {
    let mut fds = [0 as c_int; 2];
    // SAFETY: fds points at two writable ints.
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) } != 0 {
        return Err(RunqError::syscall(
            "creating wakeup pipe",
            io::Error::last_os_error(),
        ));
    }
    WAKE_FD.store(fds[1], Ordering::Relaxed);

    set_handler(libc::SIGCHLD, on_child, libc::SA_NOCLDSTOP)?;
    set_handler(libc::SIGHUP, on_hangup, 0)?;
    set_handler(libc::SIGTERM, on_terminate, 0)?;
    set_handler(libc::SIGINT, on_terminate, 0)?;

    Ok(Wakeup { read_fd: fds[0] })
}

fn set_handler(sig: c_int, handler: extern "C" fn(c_int), flags: c_int) -> Result<()> {
    // SAFETY: the sigaction struct is fully initialized before use and the
    // handler only touches async-signal-safe state.
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handler as usize;
        action.sa_flags = flags;
        libc::sigemptyset(&mut action.sa_mask);
        if libc::sigaction(sig, &action, std::ptr::null_mut()) != 0 {
            return Err(RunqError::syscall(
                "installing signal handler",
                io::Error::last_os_error(),
            ));
        }
    }
    Ok(())
}

impl Wakeup {
    /// Sleep until `next_wake` or until a handled signal arrives, whichever
    /// comes first.
    pub fn sleep_until(&self, next_wake: i64, now: i64) {
        let seconds = next_wake - now;
        if seconds <= 0 {
            return;
        }
        let timeout_ms = seconds.saturating_mul(1000).min(c_int::MAX as i64) as c_int;
        let mut pollfd = libc::pollfd {
            fd: self.read_fd,
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: pollfd points at a valid struct for the duration of the
        // call. EINTR simply ends the sleep early; the loop recomputes.
        let ready = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
        if ready > 0 {
            self.drain();
        }
    }

    fn drain(&self) {
        let mut buf = [0u8; 64];
        // SAFETY: the fd is our non-blocking pipe; reading until EAGAIN
        // leaves it empty for the next sleep.
        unsafe {
            while libc::read(self.read_fd, buf.as_mut_ptr().cast(), buf.len()) > 0 {}
        }
    }
}
