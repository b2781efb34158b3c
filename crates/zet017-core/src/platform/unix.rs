use std::io;
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use super::{Interest, Readiness};

pub type RawHandle = RawFd;

/// A socket mid-`connect()`: created non-blocking, `connect` issued, not
/// yet known to have succeeded. Poll [`PendingSocket::raw`] for
/// writability, then call [`PendingSocket::finish`].
pub struct PendingSocket {
    fd: RawFd,
}

impl PendingSocket {
    pub fn raw(&self) -> RawHandle {
        self.fd
    }

    /// Consult `SO_ERROR` after the socket reports writable; on success,
    /// hand back a blocking `TcpStream` over the same descriptor.
    pub fn finish(self) -> io::Result<TcpStream> {
        let mut err: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        // Safety: `err`/`len` outlive the call and have the size the kernel expects for SO_ERROR.
        let rc = unsafe {
            libc::getsockopt(self.fd, libc::SOL_SOCKET, libc::SO_ERROR, &mut err as *mut _ as *mut libc::c_void, &mut len)
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        if err != 0 {
            return Err(io::Error::from_raw_os_error(err));
        }
        set_nonblocking(self.fd, false)?;
        let fd = self.fd;
        std::mem::forget(self);
        // Safety: `fd` is a valid, connected, open socket handed off by `mem::forget` above.
        Ok(unsafe { TcpStream::from_raw_fd(fd) })
    }
}

impl Drop for PendingSocket {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// Device addresses are IPv4; only `SocketAddrV4` is supported.
pub fn connect_nonblocking(addr: SocketAddr) -> io::Result<PendingSocket> {
    let v4 = match addr {
        SocketAddr::V4(v4) => v4,
        SocketAddr::V6(_) => return Err(io::Error::new(io::ErrorKind::InvalidInput, "IPv6 device addresses are not supported")),
    };

    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    if let Err(e) = set_nonblocking(fd, true) {
        unsafe { libc::close(fd) };
        return Err(e);
    }

    let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    sa.sin_family = libc::AF_INET as libc::sa_family_t;
    sa.sin_port = v4.port().to_be();
    sa.sin_addr = libc::in_addr { s_addr: u32::from_ne_bytes(v4.ip().octets()) };

    let rc = unsafe {
        libc::connect(
            fd,
            &sa as *const libc::sockaddr_in as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINPROGRESS) {
            unsafe { libc::close(fd) };
            return Err(err);
        }
    }
    Ok(PendingSocket { fd })
}

fn set_nonblocking(fd: RawFd, nonblocking: bool) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let new_flags = if nonblocking { flags | libc::O_NONBLOCK } else { flags & !libc::O_NONBLOCK };
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, new_flags) };
    if rc < 0 { Err(io::Error::last_os_error()) } else { Ok(()) }
}

/// The write end of a wake pair: any worker-owning thread can nudge the
/// worker's select loop out of its timeout early.
pub struct WakeChannel {
    writer: UnixStream,
}

/// The read end, held by the worker thread.
pub struct WakeReader {
    reader: UnixStream,
}

impl WakeChannel {
    pub fn new() -> io::Result<(WakeChannel, WakeReader)> {
        let (writer, reader) = UnixStream::pair()?;
        reader.set_nonblocking(true)?;
        Ok((WakeChannel { writer }, WakeReader { reader }))
    }

    pub fn wake(&self) -> io::Result<()> {
        use std::io::Write;
        match (&self.writer).write(&[1u8]) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl WakeReader {
    pub fn raw(&self) -> RawHandle {
        self.reader.as_raw_fd()
    }

    /// Drain every pending wake byte so a later poll doesn't spuriously
    /// report the channel readable again.
    pub fn drain(&self) {
        use std::io::Read;
        let mut buf = [0u8; 64];
        loop {
            match (&self.reader).read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(_) => break,
            }
        }
    }
}

pub fn poll(targets: &[(RawHandle, Interest)], timeout: Duration) -> io::Result<Vec<Readiness>> {
    let mut fds: Vec<libc::pollfd> = targets
        .iter()
        .map(|(fd, interest)| {
            let mut events = 0;
            if interest.read {
                events |= libc::POLLIN;
            }
            if interest.write {
                events |= libc::POLLOUT;
            }
            libc::pollfd { fd: *fd, events, revents: 0 }
        })
        .collect();

    let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;
    let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(fds
        .iter()
        .map(|pfd| Readiness {
            readable: pfd.revents & libc::POLLIN != 0,
            writable: pfd.revents & libc::POLLOUT != 0,
            errored: pfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0,
        })
        .collect())
}

/// Enable keepalive and, where the platform exposes the knobs, tune idle
/// time, probe interval, and probe count (idle=20s, interval=1s,
/// count=10).
pub fn set_keepalive(stream: &std::net::TcpStream) -> io::Result<()> {
    let fd = stream.as_raw_fd();
    set_sockopt(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, 1)?;

    #[cfg(target_os = "linux")]
    {
        set_sockopt(fd, libc::IPPROTO_TCP, libc::TCP_KEEPIDLE, 20)?;
        set_sockopt(fd, libc::IPPROTO_TCP, libc::TCP_KEEPINTVL, 1)?;
        set_sockopt(fd, libc::IPPROTO_TCP, libc::TCP_KEEPCNT, 10)?;
    }
    #[cfg(target_os = "macos")]
    {
        set_sockopt(fd, libc::IPPROTO_TCP, libc::TCP_KEEPALIVE, 20)?;
    }

    Ok(())
}

fn set_sockopt(fd: RawFd, level: libc::c_int, name: libc::c_int, value: libc::c_int) -> io::Result<()> {
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 { Err(io::Error::last_os_error()) } else { Ok(()) }
}

/// No process-wide network init is needed on Unix; kept symmetric with the
/// Windows side so `Server` doesn't need a `cfg` at its call site.
pub fn network_init() -> io::Result<()> {
    Ok(())
}

pub fn network_cleanup() {}
