//! Platform shims: the one area of the crate that must reach past `std`.
//!
//! `std` has no portable multiplexed-wait-with-timeout over a handful of
//! sockets plus a wake channel, and no fine-grained TCP keepalive tuning.
//! Everything else in this crate — sockets themselves, the wake channel's
//! loopback pairing, mutexes, condvars, threads, the monotonic clock — is
//! plain `std` and lives outside this module.

use std::net::TcpStream;
use std::time::Duration;

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

#[cfg(unix)]
pub use unix::{PendingSocket, RawHandle, WakeChannel, WakeReader, connect_nonblocking, network_cleanup, network_init, poll, set_keepalive};
#[cfg(windows)]
pub use windows::{PendingSocket, RawHandle, WakeChannel, WakeReader, connect_nonblocking, network_cleanup, network_init, poll, set_keepalive};

/// What a poll target is waiting for.
#[derive(Debug, Clone, Copy, Default)]
pub struct Interest {
    pub read: bool,
    pub write: bool,
}

impl Interest {
    pub fn read() -> Self {
        Self { read: true, write: false }
    }

    pub fn write() -> Self {
        Self { read: false, write: true }
    }
}

/// What became ready for a poll target.
#[derive(Debug, Clone, Copy, Default)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    /// Set when the OS reported an error/hangup condition on this handle.
    pub errored: bool,
}

impl Readiness {
    pub fn any(&self) -> bool {
        self.readable || self.writable || self.errored
    }
}

/// A single bounded multiplexed wait over `targets`, returning one
/// [`Readiness`] per target in the same order. `timeout` of zero means
/// "poll once, don't block", used to drain the wake channel without
/// blocking.
pub fn poll_timeout(targets: &[(RawHandle, Interest)], timeout: Duration) -> std::io::Result<Vec<Readiness>> {
    poll(targets, timeout)
}

/// The raw descriptor behind a connected `TcpStream`, for use as a
/// [`poll_timeout`] target.
#[cfg(unix)]
pub fn raw_of(stream: &TcpStream) -> RawHandle {
    use std::os::unix::io::AsRawFd;
    stream.as_raw_fd()
}

#[cfg(windows)]
pub fn raw_of(stream: &TcpStream) -> RawHandle {
    use std::os::windows::io::AsRawSocket;
    stream.as_raw_socket()
}
