//! An in-process fake ZET 017 device: binds the three fixed ports on
//! loopback, performs the handshake, and answers the command protocol
//! well enough to drive a real `Server`/`Device`/worker through its full
//! lifecycle in a test process.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

use zet017_core::codec::{CommandPacket, CorrectionInfo, DeviceInfoRecord, CMD_GET_INFO, CMD_PUT_INFO, CMD_READ_CORRECTION, PACKET_SIZE};

pub const PORT_COMMAND: u16 = 1808;
pub const PORT_ADC: u16 = 2320;
pub const PORT_DAC: u16 = 3344;

/// The fixed ports mean only one fake device can exist in the process at a
/// time; this serializes tests that need one.
pub fn port_lock() -> std::sync::MutexGuard<'static, ()> {
    let _ = env_logger::try_init();
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(())).lock().unwrap_or_else(|e| e.into_inner())
}

pub fn wait_until<F: FnMut() -> bool>(mut cond: F, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

pub fn sample_record() -> DeviceInfoRecord {
    let zero = [0u8; PACKET_SIZE];
    let mut record = DeviceInfoRecord::decode(&zero);
    record.quantity_channel_adc = 8;
    record.quantity_channel_dac = 1;
    record.work_channel_adc = 3;
    record.work_channel_dac = 1;
    record.mask_channel_adc = 0x0e; // channels 1,2,3
    record.mask_channel_dac = 0x01; // channel 0
    record.mode_adc = 2; // 25 kHz
    record.rate_dac = 3200; // 25 kHz
    record.type_data_adc = 0; // i16
    record.type_data_dac = 0; // i16
    record.resolution_adc_def = 1.0;
    record.resolution_dac_def = 1.0;
    record.device_name = "ZET017".to_string();
    record.version_dsp = "1.0.0".to_string();
    record.serial = 17;
    record
}

/// Encode a `CorrectionInfo` the same way the wire format expects
/// (mirrors `CorrectionInfo::decode`'s field order); this crate only
/// needs to decode it in production, so the encoder lives here.
pub fn encode_correction(info: &CorrectionInfo, buf: &mut [u8]) {
    let mut off = 0;
    for ch in &info.amplify {
        for &g in ch {
            buf[off..off + 4].copy_from_slice(&g.to_le_bytes());
            off += 4;
        }
    }
    for ch in &info.offset_adc {
        for &g in ch {
            buf[off..off + 4].copy_from_slice(&g.to_le_bytes());
            off += 4;
        }
    }
    for &v in &info.reduction {
        buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
        off += 4;
    }
    for &v in &info.offset_dac {
        buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
        off += 4;
    }
}

fn handshake(stream: &mut TcpStream) {
    stream.write_all(&0u32.to_le_bytes()).unwrap();
}

pub struct FakeDevice {
    pub command: TcpStream,
    pub adc: TcpStream,
    pub dac: TcpStream,
}

impl FakeDevice {
    /// Bind all three ports, then block until the device under test
    /// connects and handshakes on each in turn (command, ADC, DAC —
    /// the same order `Device::spawn`'s worker opens them in).
    pub fn accept() -> Self {
        let command_listener = TcpListener::bind(("127.0.0.1", PORT_COMMAND)).expect("bind command port");
        let adc_listener = TcpListener::bind(("127.0.0.1", PORT_ADC)).expect("bind adc port");
        let dac_listener = TcpListener::bind(("127.0.0.1", PORT_DAC)).expect("bind dac port");

        let (mut command, _) = command_listener.accept().unwrap();
        handshake(&mut command);
        let (mut adc, _) = adc_listener.accept().unwrap();
        handshake(&mut adc);
        let (mut dac, _) = dac_listener.accept().unwrap();
        handshake(&mut dac);

        Self { command, adc, dac }
    }

    /// Serve exactly one request/response cycle on the command socket,
    /// dispatching on the command code the same way the real device
    /// would (`GetInfo` returns `record`, `PutInfo` echoes the posted
    /// record back as its own acknowledgement, `ReadCorrection` returns
    /// `correction`).
    pub fn serve_one_command(&mut self, record: &mut DeviceInfoRecord, correction: &CorrectionInfo) -> Option<u16> {
        serve_one_command_on(&mut self.command, record, correction)
    }

    /// Run the initial three-exchange handshake a real device performs
    /// right after the wake-channel-level handshake: GetInfo, PutInfo,
    /// ReadCorrection.
    pub fn serve_initial_exchange(&mut self, record: &mut DeviceInfoRecord, correction: &CorrectionInfo) {
        for _ in 0..3 {
            self.serve_one_command(record, correction);
        }
    }

    /// Keep answering command requests on a background thread until the
    /// socket closes, so later `set_config`/`start`/`stop` calls (which
    /// reuse the same TCP connection) get answered too. Returns the ADC/DAC
    /// streams (unaffected) plus a join handle for the command loop.
    pub fn spawn_command_server(self, mut record: DeviceInfoRecord, correction: CorrectionInfo) -> (TcpStream, TcpStream, std::thread::JoinHandle<()>) {
        let FakeDevice { mut command, adc, dac } = self;
        let handle = std::thread::spawn(move || loop {
            if serve_one_command_on(&mut command, &mut record, &correction).is_none() {
                return;
            }
        });
        (adc, dac, handle)
    }
}

fn serve_one_command_on(command: &mut TcpStream, record: &mut DeviceInfoRecord, correction: &CorrectionInfo) -> Option<u16> {
    let mut buf = [0u8; PACKET_SIZE];
    command.read_exact(&mut buf).ok()?;
    let code = u16::from_le_bytes([buf[0], buf[1]]);

    let mut out = [0u8; PACKET_SIZE];
    match code {
        CMD_GET_INFO => record.encode_into(&mut out),
        CMD_PUT_INFO => {
            *record = DeviceInfoRecord::decode(&buf);
            record.encode_into(&mut out);
        }
        CMD_READ_CORRECTION => {
            let mut response = CommandPacket::zeroed();
            response.command = CMD_READ_CORRECTION;
            response.size = CorrectionInfo::ENCODED_SIZE as u32;
            encode_correction(correction, &mut response.payload[..CorrectionInfo::ENCODED_SIZE]);
            response.encode_into(&mut out);
        }
        other => return Some(other),
    }
    command.write_all(&out).ok()?;
    Some(code)
}

pub fn send_adc_packet(adc: &mut TcpStream, buf: &[u8; PACKET_SIZE]) {
    adc.write_all(buf).unwrap();
}

pub fn recv_dac_packet(dac: &mut TcpStream) -> [u8; PACKET_SIZE] {
    let mut buf = [0u8; PACKET_SIZE];
    dac.read_exact(&mut buf).unwrap();
    buf
}
