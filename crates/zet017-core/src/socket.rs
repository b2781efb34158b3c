//! Opening one of the device's three TCP sessions: non-blocking connect
//! with a deadline, keepalive tuning, then the length-prefixed handshake.

use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpStream};
use std::time::{Duration, Instant};

use crate::codec::PACKET_SIZE;
use crate::error::{Error, Result};
use crate::platform::{self, Interest, WakeReader};

pub const PORT_COMMAND: u16 = 1808;
pub const PORT_ADC: u16 = 2320;
pub const PORT_DAC: u16 = 3344;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_HANDSHAKE_LEN: u32 = 1 << 20;

/// Open one stream socket end to end: connect, keepalive, handshake.
/// Returns `Ok(None)` if the wake channel fired before completion (a
/// teardown request arrived mid-connect, not a failure).
pub fn open(ip: Ipv4Addr, port: u16, wake: &WakeReader) -> Result<Option<TcpStream>> {
    let addr = SocketAddr::V4(SocketAddrV4::new(ip, port));
    let Some(stream) = connect_with_deadline(addr, wake, CONNECT_TIMEOUT)? else {
        return Ok(None);
    };
    platform::set_keepalive(&stream)?;
    if !handshake(&stream, wake, HANDSHAKE_TIMEOUT)? {
        return Ok(None);
    }
    Ok(Some(stream))
}

fn connect_with_deadline(addr: SocketAddr, wake: &WakeReader, timeout: Duration) -> Result<Option<TcpStream>> {
    let pending = platform::connect_nonblocking(addr)?;
    let deadline = Instant::now() + timeout;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(Error::SelectTimeout);
        }
        let targets = [(pending.raw(), Interest::write()), (wake.raw(), Interest::read())];
        let ready = platform::poll_timeout(&targets, remaining)?;

        if ready[1].readable {
            wake.drain();
            return Ok(None);
        }
        if ready[0].writable || ready[0].errored {
            return Ok(Some(pending.finish()?));
        }
    }
}

/// Receive a 4-byte little-endian length prefix, then exactly that many
/// bytes, both discarded, within `timeout`. Returns `Ok(false)` if the wake
/// channel interrupted the wait.
fn handshake(stream: &TcpStream, wake: &WakeReader, timeout: Duration) -> Result<bool> {
    let deadline = Instant::now() + timeout;
    let mut len_buf = [0u8; 4];
    if !read_exact_with_deadline(stream, wake, &mut len_buf, deadline)? {
        return Ok(false);
    }
    let len = u32::from_le_bytes(len_buf);
    if len > MAX_HANDSHAKE_LEN {
        return Err(Error::HandshakeFailed);
    }
    let mut rest = vec![0u8; len as usize];
    if !read_exact_with_deadline(stream, wake, &mut rest, deadline)? {
        return Ok(false);
    }
    Ok(true)
}

/// Send exactly `send_buf`, then receive exactly one 1024-byte reply, both
/// within [`EXCHANGE_TIMEOUT`]. A single send must transfer all 1024 bytes
/// and a single receive must accumulate exactly 1024 bytes; short I/O on
/// either side is an error, never a partial result. Returns `Ok(None)` if
/// the wake channel interrupted the exchange.
pub fn exchange(stream: &TcpStream, wake: &WakeReader, send_buf: &[u8; PACKET_SIZE]) -> Result<Option<[u8; PACKET_SIZE]>> {
    let deadline = Instant::now() + EXCHANGE_TIMEOUT;
    if !write_exact_with_deadline(stream, wake, send_buf, deadline)? {
        return Ok(None);
    }
    let mut reply = [0u8; PACKET_SIZE];
    if !read_exact_with_deadline(stream, wake, &mut reply, deadline)? {
        return Ok(None);
    }
    Ok(Some(reply))
}

/// Write `buf` completely via non-blocking writes gated by `poll`, honoring
/// the wake channel and an absolute deadline.
fn write_exact_with_deadline(stream: &TcpStream, wake: &WakeReader, buf: &[u8], deadline: Instant) -> Result<bool> {
    stream.set_nonblocking(true)?;
    let mut sent = 0;
    let result = (|| -> Result<bool> {
        while sent < buf.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::SelectTimeout);
            }
            let targets = [(platform::raw_of(stream), Interest::write()), (wake.raw(), Interest::read())];
            let ready = platform::poll_timeout(&targets, remaining)?;

            if ready[1].readable {
                wake.drain();
                return Ok(false);
            }
            if !ready[0].writable && !ready[0].errored {
                continue;
            }
            match (&*stream).write(&buf[sent..]) {
                Ok(0) => return Err(Error::ShortIo),
                Ok(n) => sent += n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    })();
    stream.set_nonblocking(false).ok();
    result
}

/// Fill `buf` completely via non-blocking reads gated by `poll`, honoring
/// the wake channel and an absolute deadline.
fn read_exact_with_deadline(stream: &TcpStream, wake: &WakeReader, buf: &mut [u8], deadline: Instant) -> Result<bool> {
    stream.set_nonblocking(true)?;
    let mut filled = 0;
    let result = (|| -> Result<bool> {
        while filled < buf.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::SelectTimeout);
            }
            let targets = [(platform::raw_of(stream), Interest::read()), (wake.raw(), Interest::read())];
            let ready = platform::poll_timeout(&targets, remaining)?;

            if ready[1].readable {
                wake.drain();
                return Ok(false);
            }
            if !ready[0].readable && !ready[0].errored {
                continue;
            }
            match (&*stream).read(&mut buf[filled..]) {
                Ok(0) => return Err(Error::ShortIo),
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    })();
    stream.set_nonblocking(false).ok();
    result
}
