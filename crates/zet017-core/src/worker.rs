//! The per-device worker thread: the connection state machine, the main
//! select loop, and the worker side of the command bridge. This is the
//! sole owner of the three stream sockets and the raw
//! device-info record; everything it learns is republished onto `Device`'s
//! mutex-guarded snapshots.

use std::io::{Read, Write};
use std::net::{Ipv4Addr, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::bridge::Command;
use crate::codec::{CommandPacket, CorrectionInfo, DeviceInfoRecord, CMD_GET_INFO, CMD_PUT_INFO, CMD_READ_CORRECTION, PACKET_SIZE};
use crate::config;
use crate::device::{Device, DeviceConfig};
use crate::error::{Error, Result};
use crate::platform::{self, Interest, WakeReader};
use crate::socket;

const DISCONNECTED_RETRY: Duration = Duration::from_millis(100);
const MAIN_SELECT_TIMEOUT: Duration = Duration::from_secs(10);
const INFO_REFRESH_INTERVAL: Duration = Duration::from_secs(60);
const STOP_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
const STOP_DRAIN_MAX_NONZERO: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Disconnected,
    Connecting,
    Initializing,
    Streaming,
    Stopping,
}

struct Session {
    command: Option<TcpStream>,
    adc: Option<TcpStream>,
    dac: Option<TcpStream>,
    record: DeviceInfoRecord,
    correction: CorrectionInfo,
    adc_count: u64,
    dac_count: u64,
    dac_enabled: bool,
    last_info_refresh: Instant,
}

impl Session {
    fn empty() -> Self {
        let buf = [0u8; PACKET_SIZE];
        Self {
            command: None,
            adc: None,
            dac: None,
            record: DeviceInfoRecord::decode(&buf),
            correction: CorrectionInfo::zeroed(),
            adc_count: 0,
            dac_count: 0,
            dac_enabled: false,
            last_info_refresh: Instant::now(),
        }
    }

    fn close(&mut self) {
        self.command = None;
        self.adc = None;
        self.dac = None;
    }
}

/// Worker entry point, spawned once per device by [`Device::spawn`].
pub fn run(device: Arc<Device>, wake: WakeReader) {
    let mut phase = Phase::Disconnected;
    let mut session = Session::empty();

    loop {
        phase = match phase {
            Phase::Disconnected => {
                if !device.is_running() {
                    break;
                }
                std::thread::sleep(DISCONNECTED_RETRY);
                Phase::Connecting
            }
            Phase::Connecting => connecting(&device, &wake, &mut session),
            Phase::Initializing => initializing(&device, &wake, &mut session),
            Phase::Streaming => streaming(&device, &wake, &mut session),
            Phase::Stopping => stopping(&device, &wake, &mut session),
        };
    }

    session.close();
}

fn connecting(device: &Device, wake: &WakeReader, session: &mut Session) -> Phase {
    if !device.is_running() {
        return Phase::Disconnected;
    }
    match open_all_sessions(device.ip, wake) {
        Ok(Some((command, adc, dac))) => {
            session.command = Some(command);
            session.adc = Some(adc);
            session.dac = Some(dac);
            Phase::Initializing
        }
        Ok(None) => Phase::Disconnected,
        Err(e) => {
            log::warn!("zet017 {}: connect failed: {e}", device.ip);
            Phase::Disconnected
        }
    }
}

fn open_all_sessions(ip: Ipv4Addr, wake: &WakeReader) -> Result<Option<(TcpStream, TcpStream, TcpStream)>> {
    let Some(command) = socket::open(ip, socket::PORT_COMMAND, wake)? else {
        return Ok(None);
    };
    let Some(adc) = socket::open(ip, socket::PORT_ADC, wake)? else {
        return Ok(None);
    };
    let Some(dac) = socket::open(ip, socket::PORT_DAC, wake)? else {
        return Ok(None);
    };
    Ok(Some((command, adc, dac)))
}

fn initializing(device: &Device, wake: &WakeReader, session: &mut Session) -> Phase {
    match initialize(device, wake, session) {
        Ok(()) => {
            log::info!("zet017 {}: initialized", device.ip);
            Phase::Streaming
        }
        Err(e) => {
            log::warn!("zet017 {}: initialize failed: {e}", device.ip);
            session.close();
            device.publish_disconnected();
            Phase::Disconnected
        }
    }
}

fn initialize(device: &Device, wake: &WakeReader, session: &mut Session) -> Result<()> {
    let command_stream = session.command.as_ref().ok_or(Error::Disconnected)?;

    let record = get_info(command_stream, wake)?;
    let mut record = record;

    record.start_adc = 0;
    record.start_dac = 0;
    let active = config::active_channel_count(record.quantity_channel_adc, record.mask_channel_adc);
    record.size_packet_adc = config::size_packet_adc(
        config::sample_rate_adc_from_mode(record.mode_adc),
        active,
        record.sample_size_adc() as u32,
    );
    let record = put_info(command_stream, wake, &record)?;

    let correction = read_correction(command_stream, wake).unwrap_or_else(|e| {
        log::warn!("zet017 {}: correction read failed, using nominal resolution: {e}", device.ip);
        CorrectionInfo::zeroed()
    });

    session.record = record.clone();
    session.correction = correction;
    session.adc_count = 0;
    session.dac_count = 0;
    session.dac_enabled = false;
    session.last_info_refresh = Instant::now();

    device.adc.lock().unwrap().reset();
    device.dac.lock().unwrap().reset();
    device.apply_device_info(&record, &correction);
    device.bump_reconnect();
    device.publish_state(0, 0);
    device.mark_started(false);

    Ok(())
}

fn get_info(stream: &TcpStream, wake: &WakeReader) -> Result<DeviceInfoRecord> {
    let mut send_buf = [0u8; PACKET_SIZE];
    send_buf[0..2].copy_from_slice(&CMD_GET_INFO.to_le_bytes());
    let reply = socket::exchange(stream, wake, &send_buf)?.ok_or(Error::Disconnected)?;
    Ok(DeviceInfoRecord::decode(&reply))
}

fn put_info(stream: &TcpStream, wake: &WakeReader, record: &DeviceInfoRecord) -> Result<DeviceInfoRecord> {
    let mut record = record.clone();
    record.command = CMD_PUT_INFO;
    let mut send_buf = [0u8; PACKET_SIZE];
    record.encode_into(&mut send_buf);
    let reply = socket::exchange(stream, wake, &send_buf)?.ok_or(Error::Disconnected)?;
    Ok(DeviceInfoRecord::decode(&reply))
}

fn read_correction(stream: &TcpStream, wake: &WakeReader) -> Result<CorrectionInfo> {
    let mut packet = CommandPacket::zeroed();
    packet.command = CMD_READ_CORRECTION;
    packet.error = 1;
    packet.size = CorrectionInfo::ENCODED_SIZE as u32;
    let mut send_buf = [0u8; PACKET_SIZE];
    packet.encode_into(&mut send_buf);

    let reply = socket::exchange(stream, wake, &send_buf)?.ok_or(Error::Disconnected)?;
    let response = CommandPacket::decode(&reply);
    if response.command != CMD_READ_CORRECTION {
        return Ok(CorrectionInfo::zeroed());
    }
    Ok(CorrectionInfo::decode(&response.payload))
}

fn streaming(device: &Device, wake: &WakeReader, session: &mut Session) -> Phase {
    loop {
        if !device.is_running() {
            return Phase::Stopping;
        }

        if let Some(command) = device.bridge().try_take() {
            let result = dispatch_command(device, wake, session, command.clone());
            let failed = result.is_err();
            device.bridge().complete(result);
            if failed {
                session.close();
                device.publish_disconnected();
                return Phase::Disconnected;
            }
            if matches!(command, Command::Stop) {
                continue;
            }
        }

        if session.last_info_refresh.elapsed() >= INFO_REFRESH_INTERVAL {
            match refresh_info(device, wake, session) {
                Ok(()) => {}
                Err(e) => {
                    log::warn!("zet017 {}: periodic refresh failed: {e}", device.ip);
                    session.close();
                    device.publish_disconnected();
                    return Phase::Disconnected;
                }
            }
        }

        device.publish_state(session.adc_count, session.dac_count);

        match poll_and_service(device, wake, session) {
            Ok(true) => continue,
            Ok(false) => {}
            Err(e) => {
                log::error!("zet017 {}: streaming I/O error: {e}", device.ip);
                session.close();
                device.publish_disconnected();
                return Phase::Disconnected;
            }
        }
    }
}

fn dispatch_command(device: &Device, wake: &WakeReader, session: &mut Session, command: Command) -> Result<()> {
    let command_stream = session.command.as_ref().ok_or(Error::Disconnected)?.try_clone()?;

    match command {
        Command::SetConfig(config) => {
            let mut record = session.record.clone();
            apply_config_to_record(&mut record, &config);
            let record = put_info(&command_stream, wake, &record)?;
            session.record = record.clone();
            device.apply_device_info(&record, &session.correction);
            Ok(())
        }
        Command::Start { dac_enable } => {
            let mut record = session.record.clone();
            record.start_adc = 1;
            record.start_dac = if dac_enable { 1 } else { 0 };
            record.atten = [0xffff; 4];
            record.atten_speed = 0;
            let record = put_info(&command_stream, wake, &record)?;
            session.record = record;
            session.dac_enabled = dac_enable;
            device.mark_started(true);
            Ok(())
        }
        Command::Stop => {
            let adc_stream = session.adc.as_ref().ok_or(Error::Disconnected)?.try_clone()?;
            let result = perform_stop_sequence(&command_stream, &adc_stream, wake, &mut session.record, session.dac_enabled);
            session.dac_enabled = false;
            device.mark_started(false);
            result
        }
    }
}

fn apply_config_to_record(record: &mut DeviceInfoRecord, config: &DeviceConfig) {
    record.mode_adc = config::mode_adc_from_sample_rate(config.sample_rate_adc);
    record.rate_dac = config::rate_dac_from_sample_rate(config.sample_rate_dac);
    record.type_data_adc = config.type_data_adc;
    record.type_data_dac = config.type_data_dac;

    let four_channel = record.quantity_channel_adc == 4;
    record.mask_channel_adc =
        if four_channel { config::mask_host_to_device_4ch(config.mask_channel_adc) } else { config.mask_channel_adc };
    record.mask_channel_dac = config.mask_channel_dac;
    record.mask_icp = if four_channel { config::mask_host_to_device_4ch(config.mask_icp) } else { config.mask_icp };

    for c in 0..record.quantity_channel_adc.min(8) as usize {
        let idx = if four_channel { config::four_channel_array_index(c) } else { c };
        record.amplify_code[idx.min(7)] = config::amplify_code_from_gain(config.gain[c]);
    }

    let sample_size = record.sample_size_adc() as u32;
    let active = config::active_channel_count(record.quantity_channel_adc, record.mask_channel_adc);
    record.size_packet_adc = config::size_packet_adc(config.sample_rate_adc, active, sample_size);
    record.work_channel_adc = active as u16;
}

fn refresh_info(device: &Device, wake: &WakeReader, session: &mut Session) -> Result<()> {
    let command_stream = session.command.as_ref().ok_or(Error::Disconnected)?.try_clone()?;
    let fresh = get_info(&command_stream, wake)?;
    session.record = fresh.clone();
    device.apply_device_info(&fresh, &session.correction);
    session.last_info_refresh = Instant::now();
    Ok(())
}

/// Returns `Ok(true)` if the caller should re-check the bridge/refresh
/// conditions immediately (a command was serviced this tick that doesn't
/// warrant waiting out the rest of the select), `Ok(false)` to loop
/// normally.
fn poll_and_service(device: &Device, wake: &WakeReader, session: &mut Session) -> Result<bool> {
    let adc_stream = session.adc.as_ref().ok_or(Error::Disconnected)?;
    let dac_stream = session.dac.as_ref().ok_or(Error::Disconnected)?;

    let want_dac_write = session.dac_enabled && dac_within_lead(session);

    let targets = [
        (wake.raw(), Interest::read()),
        (platform::raw_of(adc_stream), Interest::read()),
        (platform::raw_of(dac_stream), if want_dac_write { Interest::write() } else { Interest { read: false, write: false } }),
    ];
    let ready = platform::poll_timeout(&targets, MAIN_SELECT_TIMEOUT)?;

    if ready[0].readable {
        wake.drain();
        return Ok(true);
    }

    if ready[1].readable || ready[1].errored {
        recv_adc_packet(device, session)?;
    }

    if ready[2].writable {
        send_dac_packet(device, session)?;
    }

    Ok(false)
}

fn dac_within_lead(session: &Session) -> bool {
    let sample_rate_adc = config::sample_rate_adc_from_mode(session.record.mode_adc).max(1) as u64;
    let sample_rate_dac = config::sample_rate_dac_from_rate(session.record.rate_dac) as u64;
    if sample_rate_dac == 0 {
        return false;
    }
    session.dac_count < session.adc_count * sample_rate_dac / sample_rate_adc + sample_rate_dac / 5
}

fn recv_adc_packet(device: &Device, session: &mut Session) -> Result<()> {
    let stream = session.adc.as_ref().ok_or(Error::Disconnected)?;
    let mut buf = [0u8; PACKET_SIZE];
    let n = (&*stream).read(&mut buf)?;
    if n != PACKET_SIZE {
        return Err(Error::ShortIo);
    }

    let data_bytes = (2 * session.record.size_packet_adc as usize).min(PACKET_SIZE);
    let mut ring = device.adc.lock().unwrap();
    let stride = ring.sample_size as usize * ring.channel_count as usize;
    ring.push_frame_bytes(&buf[..data_bytes]);
    drop(ring);

    if stride > 0 {
        session.adc_count += (data_bytes / stride) as u64;
    }
    Ok(())
}

fn send_dac_packet(device: &Device, session: &mut Session) -> Result<()> {
    let stream = session.dac.as_ref().ok_or(Error::Disconnected)?;
    let mut buf = [0u8; PACKET_SIZE];
    let stride = {
        let mut ring = device.dac.lock().unwrap();
        ring.pull_frame_bytes(&mut buf);
        ring.sample_size as usize * ring.channel_count as usize
    };

    let n = (&*stream).write(&buf)?;
    if n != PACKET_SIZE {
        return Err(Error::ShortIo);
    }

    if stride > 0 {
        session.dac_count += (PACKET_SIZE / stride) as u64;
    }
    Ok(())
}

fn stopping(device: &Device, wake: &WakeReader, session: &mut Session) -> Phase {
    if let (Some(command), Some(adc)) = (session.command.as_ref(), session.adc.as_ref()) {
        if let (Ok(command), Ok(adc)) = (command.try_clone(), adc.try_clone()) {
            let _ = perform_stop_sequence(&command, &adc, wake, &mut session.record, session.dac_enabled);
        }
    }
    session.close();
    device.publish_disconnected();
    Phase::Disconnected
}

/// The graceful-stop handshake: `PutInfo(start_adc=-1, start_dac=-1 if
/// active)`, drain the ADC stream until a fully-zero packet or the abort
/// threshold, then `PutInfo(start_adc=0, start_dac=0)`.
fn perform_stop_sequence(
    command_stream: &TcpStream,
    adc_stream: &TcpStream,
    wake: &WakeReader,
    record: &mut DeviceInfoRecord,
    dac_active: bool,
) -> Result<()> {
    record.start_adc = -1;
    record.start_dac = if dac_active { -1 } else { record.start_dac };
    *record = put_info(command_stream, wake, record)?;

    drain_adc_until_zero(adc_stream, wake)?;

    record.start_adc = 0;
    record.start_dac = 0;
    *record = put_info(command_stream, wake, record)?;
    Ok(())
}

fn drain_adc_until_zero(adc_stream: &TcpStream, wake: &WakeReader) -> Result<()> {
    let deadline = Instant::now() + STOP_DRAIN_TIMEOUT;
    let mut nonzero_count = 0u32;
    adc_stream.set_nonblocking(true)?;
    let result = (|| -> Result<()> {
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::SelectTimeout);
            }
            let targets = [(platform::raw_of(adc_stream), Interest::read()), (wake.raw(), Interest::read())];
            let ready = platform::poll_timeout(&targets, remaining)?;
            if ready[1].readable {
                wake.drain();
            }
            if !ready[0].readable && !ready[0].errored {
                continue;
            }

            let mut buf = [0u8; PACKET_SIZE];
            match (&*adc_stream).read(&mut buf) {
                Ok(0) => return Err(Error::ShortIo),
                Ok(n) if n == PACKET_SIZE => {
                    if buf.iter().all(|&b| b == 0) {
                        return Ok(());
                    }
                    nonzero_count += 1;
                    if nonzero_count > STOP_DRAIN_MAX_NONZERO {
                        return Err(Error::ShortIo);
                    }
                }
                Ok(_) => return Err(Error::ShortIo),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e.into()),
            }
        }
    })();
    adc_stream.set_nonblocking(false).ok();
    result
}
