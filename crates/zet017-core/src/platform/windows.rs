use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::windows::io::{AsRawSocket, FromRawSocket, RawSocket};
use std::time::Duration;

use windows::Win32::Networking::WinSock::{
    self, AF_INET, FIONBIO, IN_ADDR, IN_ADDR_0, SOCK_STREAM, SOCKADDR, SOCKADDR_IN, SOCKET, SOCKET_ERROR, SOL_SOCKET,
    SO_ERROR, SO_KEEPALIVE, WSADATA, WSAPOLLFD, POLLRDNORM, POLLWRNORM,
};

use super::{Interest, Readiness};

pub type RawHandle = RawSocket;

/// A socket mid-`connect()`, created non-blocking via WinSock directly
/// (`TcpStream::connect` has no way to race a wake channel alongside it).
pub struct PendingSocket {
    sock: SOCKET,
}

impl PendingSocket {
    pub fn raw(&self) -> RawHandle {
        self.sock.0 as RawHandle
    }

    pub fn finish(self) -> io::Result<TcpStream> {
        let mut err: i32 = 0;
        let mut len = std::mem::size_of::<i32>() as i32;
        // Safety: the byte view of `err` is exactly `size_of::<i32>()` and doesn't outlive the call.
        let rc = unsafe {
            WinSock::getsockopt(
                self.sock,
                SOL_SOCKET,
                SO_ERROR,
                Some(std::slice::from_raw_parts_mut(&mut err as *mut i32 as *mut u8, std::mem::size_of::<i32>())),
                &mut len,
            )
        };
        if rc == SOCKET_ERROR {
            return Err(io::Error::last_os_error());
        }
        if err != 0 {
            return Err(io::Error::from_raw_os_error(err));
        }
        set_nonblocking(self.sock, false)?;
        let raw = self.sock.0;
        std::mem::forget(self);
        // Safety: `raw` is a valid, connected socket handed off by `mem::forget` above.
        Ok(unsafe { TcpStream::from_raw_socket(raw as RawSocket) })
    }
}

impl Drop for PendingSocket {
    fn drop(&mut self) {
        unsafe {
            let _ = WinSock::closesocket(self.sock);
        }
    }
}

/// Device addresses are IPv4; only `SocketAddrV4` is supported.
pub fn connect_nonblocking(addr: SocketAddr) -> io::Result<PendingSocket> {
    let v4 = match addr {
        SocketAddr::V4(v4) => v4,
        SocketAddr::V6(_) => return Err(io::Error::new(io::ErrorKind::InvalidInput, "IPv6 device addresses are not supported")),
    };

    let sock = unsafe { WinSock::socket(AF_INET.0 as i32, SOCK_STREAM.0 as i32, 0) };
    if sock.0 == 0 || sock == WinSock::INVALID_SOCKET {
        return Err(io::Error::last_os_error());
    }
    if let Err(e) = set_nonblocking(sock, true) {
        unsafe { WinSock::closesocket(sock) };
        return Err(e);
    }

    let octets = v4.ip().octets();
    let sa = SOCKADDR_IN {
        sin_family: AF_INET,
        sin_port: v4.port().to_be(),
        sin_addr: IN_ADDR { S_un: IN_ADDR_0 { S_addr: u32::from_ne_bytes(octets) } },
        sin_zero: [0; 8],
    };

    let rc = unsafe {
        WinSock::connect(sock, &sa as *const SOCKADDR_IN as *const SOCKADDR, std::mem::size_of::<SOCKADDR_IN>() as i32)
    };
    if rc == SOCKET_ERROR {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(WinSock::WSAEWOULDBLOCK.0) {
            unsafe { WinSock::closesocket(sock) };
            return Err(err);
        }
    }
    Ok(PendingSocket { sock })
}

fn set_nonblocking(sock: SOCKET, nonblocking: bool) -> io::Result<()> {
    let mut mode: u32 = if nonblocking { 1 } else { 0 };
    let rc = unsafe { WinSock::ioctlsocket(sock, FIONBIO, &mut mode) };
    if rc == SOCKET_ERROR { Err(io::Error::last_os_error()) } else { Ok(()) }
}

/// Loopback-socket wake pair: Windows has no portable anonymous
/// socket-pair primitive usable with `WSAPoll`, so the worker listens on an
/// ephemeral loopback port once at startup and the writer connects to it.
/// Same nudge-the-select-loop role as the Unix pair.
pub struct WakeChannel {
    writer: TcpStream,
}

pub struct WakeReader {
    reader: TcpStream,
}

impl WakeChannel {
    pub fn new() -> io::Result<(WakeChannel, WakeReader)> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        let writer = TcpStream::connect(addr)?;
        let (reader, _) = listener.accept()?;
        reader.set_nonblocking(true)?;
        writer.set_nodelay(true)?;
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
        self.reader.as_raw_socket()
    }

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
    let mut fds: Vec<WSAPOLLFD> = targets
        .iter()
        .map(|(sock, interest)| {
            let mut events: i16 = 0;
            if interest.read {
                events |= POLLRDNORM as i16;
            }
            if interest.write {
                events |= POLLWRNORM as i16;
            }
            WSAPOLLFD { fd: SOCKET(*sock as usize), events, revents: 0 }
        })
        .collect();

    let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;
    let rc = unsafe { WinSock::WSAPoll(&mut fds, timeout_ms) };
    if rc == SOCKET_ERROR {
        return Err(io::Error::last_os_error());
    }

    Ok(fds
        .iter()
        .map(|pfd| Readiness {
            readable: pfd.revents & POLLRDNORM as i16 != 0,
            writable: pfd.revents & POLLWRNORM as i16 != 0,
            errored: pfd.revents & (WinSock::POLLERR | WinSock::POLLHUP | WinSock::POLLNVAL) as i16 != 0,
        })
        .collect())
}

/// Enables `SO_KEEPALIVE` only. WinSock exposes per-connection idle/interval
/// tuning through the `SIO_KEEPALIVE_VALS` ioctl rather than `setsockopt`
/// options; this crate leaves that tuning at the OS default on Windows.
pub fn set_keepalive(stream: &TcpStream) -> io::Result<()> {
    let sock = SOCKET(stream.as_raw_socket() as usize);
    let value: i32 = 1;
    let rc = unsafe {
        WinSock::setsockopt(
            sock,
            SOL_SOCKET,
            SO_KEEPALIVE,
            Some(std::slice::from_raw_parts(&value as *const i32 as *const u8, std::mem::size_of::<i32>())),
        )
    };
    if rc == SOCKET_ERROR {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

pub fn network_init() -> io::Result<()> {
    let mut data = WSADATA::default();
    let rc = unsafe { WinSock::WSAStartup(0x0202, &mut data) };
    if rc != 0 { Err(io::Error::from_raw_os_error(rc)) } else { Ok(()) }
}

pub fn network_cleanup() {
    unsafe {
        let _ = WinSock::WSACleanup();
    }
}
