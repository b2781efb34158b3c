//! The 1024-byte packet envelope and its two decodings: the device-info
//! register map and the command packet. Offsets are read and written
//! explicitly rather than cast through a `#[repr(C)]` struct so the layout
//! is immune to padding and endianness surprises on the host platform.

/// Every command/response frame on all three sockets is exactly this size.
pub const PACKET_SIZE: usize = 1024;

pub const CMD_GET_INFO: u16 = 0x0000;
pub const CMD_PUT_INFO: u16 = 0x0012;
pub const CMD_READ_CORRECTION: u16 = 0x0513;

const OFF_COMMAND: usize = 0x000;
const OFF_START_ADC: usize = 0x004;
const OFF_START_DAC: usize = 0x006;
const OFF_QTY_CHANNEL_ADC: usize = 0x00e;
const OFF_QTY_CHANNEL_DAC: usize = 0x010;
const OFF_TYPE_DATA_ADC: usize = 0x012;
const OFF_TYPE_DATA_DAC: usize = 0x013;
const OFF_MASK_CHANNEL_ADC: usize = 0x014;
const OFF_MASK_CHANNEL_DAC: usize = 0x018;
const OFF_MASK_ICP: usize = 0x01c;
const OFF_WORK_CHANNEL_ADC: usize = 0x024;
const OFF_WORK_CHANNEL_DAC: usize = 0x026;
const OFF_AMPLIFY_CODE: usize = 0x028;
const OFF_ATTEN: usize = 0x0a8;
const OFF_MODE_ADC: usize = 0x0ba;
const OFF_RATE_DAC: usize = 0x0be;
const OFF_SIZE_PACKET_ADC: usize = 0x0c0;
const OFF_DIGITAL_INPUT: usize = 0x0d8;
const OFF_DIGITAL_OUTPUT: usize = 0x0dc;
const OFF_VERSION_DSP: usize = 0x0ec;
const OFF_DEVICE_NAME: usize = 0x10c;
const OFF_SERIAL: usize = 0x12c;
const OFF_DIGITAL_OUTPUT_ENABLE: usize = 0x13c;
const OFF_RESOLUTION_ADC_DEF: usize = 0x140;
const OFF_RESOLUTION_DAC_DEF: usize = 0x148;
const OFF_RESOLUTION_ADC: usize = 0x150;
const OFF_ATTEN_SPEED: usize = 0x1b6;
const OFF_RESOLUTION_DAC: usize = 0x1d0;
const OFF_QUANTITY_CHANNEL_VIRT: usize = 0x1e8;

const VERSION_DSP_LEN: usize = 32;
const DEVICE_NAME_LEN: usize = 16;

/// The device-info record, decoded from and re-encoded into the
/// 1024-byte envelope. Reserved ranges are preserved verbatim across a
/// read-modify-write cycle by keeping the original 1024-byte buffer
/// alongside the decoded fields (`DeviceInfoRecord::encode_into`
/// overwrites only the fields this crate knows about).
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfoRecord {
    pub command: u16,
    pub start_adc: i16,
    pub start_dac: i16,
    pub quantity_channel_adc: u16,
    pub quantity_channel_dac: u16,
    pub type_data_adc: u8,
    pub type_data_dac: u8,
    pub mask_channel_adc: u32,
    pub mask_channel_dac: u32,
    pub mask_icp: u32,
    pub work_channel_adc: u16,
    pub work_channel_dac: u16,
    pub amplify_code: [u16; 8],
    pub atten: [u16; 4],
    pub mode_adc: u16,
    pub rate_dac: u16,
    pub size_packet_adc: u16,
    pub digital_input: u32,
    pub digital_output: u32,
    pub version_dsp: String,
    pub device_name: String,
    pub serial: u32,
    pub digital_output_enable: u32,
    pub resolution_adc_def: f32,
    pub resolution_dac_def: f32,
    pub resolution_adc: [f32; 16],
    pub atten_speed: u16,
    pub resolution_dac: [f32; 4],
    pub quantity_channel_virt: u16,
}

impl DeviceInfoRecord {
    /// Decode a device-info record from a 1024-byte packet.
    pub fn decode(buf: &[u8; PACKET_SIZE]) -> Self {
        Self {
            command: read_u16(buf, OFF_COMMAND),
            start_adc: read_i16(buf, OFF_START_ADC),
            start_dac: read_i16(buf, OFF_START_DAC),
            quantity_channel_adc: read_u16(buf, OFF_QTY_CHANNEL_ADC),
            quantity_channel_dac: read_u16(buf, OFF_QTY_CHANNEL_DAC),
            type_data_adc: buf[OFF_TYPE_DATA_ADC],
            type_data_dac: buf[OFF_TYPE_DATA_DAC],
            mask_channel_adc: read_u32(buf, OFF_MASK_CHANNEL_ADC),
            mask_channel_dac: read_u32(buf, OFF_MASK_CHANNEL_DAC),
            mask_icp: read_u32(buf, OFF_MASK_ICP),
            work_channel_adc: read_u16(buf, OFF_WORK_CHANNEL_ADC),
            work_channel_dac: read_u16(buf, OFF_WORK_CHANNEL_DAC),
            amplify_code: read_u16_array::<8>(buf, OFF_AMPLIFY_CODE),
            atten: read_u16_array::<4>(buf, OFF_ATTEN),
            mode_adc: read_u16(buf, OFF_MODE_ADC),
            rate_dac: read_u16(buf, OFF_RATE_DAC),
            size_packet_adc: read_u16(buf, OFF_SIZE_PACKET_ADC),
            digital_input: read_u32(buf, OFF_DIGITAL_INPUT),
            digital_output: read_u32(buf, OFF_DIGITAL_OUTPUT),
            version_dsp: read_cstr(buf, OFF_VERSION_DSP, VERSION_DSP_LEN),
            device_name: read_cstr(buf, OFF_DEVICE_NAME, DEVICE_NAME_LEN),
            serial: read_u32(buf, OFF_SERIAL),
            digital_output_enable: read_u32(buf, OFF_DIGITAL_OUTPUT_ENABLE),
            resolution_adc_def: read_f32(buf, OFF_RESOLUTION_ADC_DEF),
            resolution_dac_def: read_f32(buf, OFF_RESOLUTION_DAC_DEF),
            resolution_adc: read_f32_array::<16>(buf, OFF_RESOLUTION_ADC),
            atten_speed: read_u16(buf, OFF_ATTEN_SPEED),
            resolution_dac: read_f32_array::<4>(buf, OFF_RESOLUTION_DAC),
            quantity_channel_virt: read_u16(buf, OFF_QUANTITY_CHANNEL_VIRT),
        }
    }

    /// Re-encode into `buf`, overwriting only the fields this crate knows
    /// about and preserving every other (reserved) byte already in `buf`.
    pub fn encode_into(&self, buf: &mut [u8; PACKET_SIZE]) {
        write_u16(buf, OFF_COMMAND, self.command);
        write_i16(buf, OFF_START_ADC, self.start_adc);
        write_i16(buf, OFF_START_DAC, self.start_dac);
        write_u16(buf, OFF_QTY_CHANNEL_ADC, self.quantity_channel_adc);
        write_u16(buf, OFF_QTY_CHANNEL_DAC, self.quantity_channel_dac);
        buf[OFF_TYPE_DATA_ADC] = self.type_data_adc;
        buf[OFF_TYPE_DATA_DAC] = self.type_data_dac;
        write_u32(buf, OFF_MASK_CHANNEL_ADC, self.mask_channel_adc);
        write_u32(buf, OFF_MASK_CHANNEL_DAC, self.mask_channel_dac);
        write_u32(buf, OFF_MASK_ICP, self.mask_icp);
        write_u16(buf, OFF_WORK_CHANNEL_ADC, self.work_channel_adc);
        write_u16(buf, OFF_WORK_CHANNEL_DAC, self.work_channel_dac);
        write_u16_array(buf, OFF_AMPLIFY_CODE, &self.amplify_code);
        write_u16_array(buf, OFF_ATTEN, &self.atten);
        write_u16(buf, OFF_MODE_ADC, self.mode_adc);
        write_u16(buf, OFF_RATE_DAC, self.rate_dac);
        write_u16(buf, OFF_SIZE_PACKET_ADC, self.size_packet_adc);
        write_u32(buf, OFF_DIGITAL_INPUT, self.digital_input);
        write_u32(buf, OFF_DIGITAL_OUTPUT, self.digital_output);
        write_cstr(buf, OFF_VERSION_DSP, VERSION_DSP_LEN, &self.version_dsp);
        write_cstr(buf, OFF_DEVICE_NAME, DEVICE_NAME_LEN, &self.device_name);
        write_u32(buf, OFF_SERIAL, self.serial);
        write_u32(buf, OFF_DIGITAL_OUTPUT_ENABLE, self.digital_output_enable);
        write_f32(buf, OFF_RESOLUTION_ADC_DEF, self.resolution_adc_def);
        write_f32(buf, OFF_RESOLUTION_DAC_DEF, self.resolution_dac_def);
        write_f32_array(buf, OFF_RESOLUTION_ADC, &self.resolution_adc);
        write_u16(buf, OFF_ATTEN_SPEED, self.atten_speed);
        write_f32_array(buf, OFF_RESOLUTION_DAC, &self.resolution_dac);
        write_u16(buf, OFF_QUANTITY_CHANNEL_VIRT, self.quantity_channel_virt);
    }

    /// `type_data_adc`/`type_data_dac` decoded into a byte sample size.
    pub fn sample_size_adc(&self) -> u16 {
        if self.type_data_adc == 0 { 2 } else { 4 }
    }

    pub fn sample_size_dac(&self) -> u16 {
        if self.type_data_dac == 0 { 2 } else { 4 }
    }
}

/// Command packet: `u16 command, u16 error, u32 size, u8 payload[1012]`.
#[derive(Debug, Clone)]
pub struct CommandPacket {
    pub command: u16,
    pub error: u16,
    pub size: u32,
    pub payload: [u8; PACKET_SIZE - 8],
}

impl CommandPacket {
    pub fn zeroed() -> Self {
        Self {
            command: 0,
            error: 0,
            size: 0,
            payload: [0u8; PACKET_SIZE - 8],
        }
    }

    pub fn decode(buf: &[u8; PACKET_SIZE]) -> Self {
        let mut payload = [0u8; PACKET_SIZE - 8];
        payload.copy_from_slice(&buf[8..PACKET_SIZE]);
        Self {
            command: read_u16(buf, 0),
            error: read_u16(buf, 2),
            size: read_u32(buf, 4),
            payload,
        }
    }

    pub fn encode_into(&self, buf: &mut [u8; PACKET_SIZE]) {
        write_u16(buf, 0, self.command);
        write_u16(buf, 2, self.error);
        write_u32(buf, 4, self.size);
        buf[8..PACKET_SIZE].copy_from_slice(&self.payload);
    }
}

/// `zet017_correction_info`: per-channel/per-gain amplifier and offset
/// correction, plus DAC reduction/offset. 8 ADC channels × 4 gain slots.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CorrectionInfo {
    pub amplify: [[f32; 4]; 8],
    pub offset_adc: [[f32; 4]; 8],
    pub reduction: [f32; 2],
    pub offset_dac: [f32; 2],
}

impl CorrectionInfo {
    pub const ENCODED_SIZE: usize = 8 * 4 * 4 + 8 * 4 * 4 + 2 * 4 + 2 * 4;

    pub fn zeroed() -> Self {
        Self {
            amplify: [[0.0; 4]; 8],
            offset_adc: [[0.0; 4]; 8],
            reduction: [0.0; 2],
            offset_dac: [0.0; 2],
        }
    }

    pub fn decode(buf: &[u8]) -> Self {
        debug_assert!(buf.len() >= Self::ENCODED_SIZE);
        let mut out = Self::zeroed();
        let mut off = 0;
        for ch in &mut out.amplify {
            for g in ch.iter_mut() {
                *g = f32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
                off += 4;
            }
        }
        for ch in &mut out.offset_adc {
            for g in ch.iter_mut() {
                *g = f32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
                off += 4;
            }
        }
        for v in &mut out.reduction {
            *v = f32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
            off += 4;
        }
        for v in &mut out.offset_dac {
            *v = f32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
            off += 4;
        }
        out
    }
}

fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

fn read_i16(buf: &[u8], off: usize) -> i16 {
    i16::from_le_bytes([buf[off], buf[off + 1]])
}

fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(buf[off..off + 4].try_into().unwrap())
}

fn read_f32(buf: &[u8], off: usize) -> f32 {
    f32::from_le_bytes(buf[off..off + 4].try_into().unwrap())
}

fn read_u16_array<const N: usize>(buf: &[u8], off: usize) -> [u16; N] {
    let mut out = [0u16; N];
    for (i, slot) in out.iter_mut().enumerate() {
        *slot = read_u16(buf, off + i * 2);
    }
    out
}

fn read_f32_array<const N: usize>(buf: &[u8], off: usize) -> [f32; N] {
    let mut out = [0.0f32; N];
    for (i, slot) in out.iter_mut().enumerate() {
        *slot = read_f32(buf, off + i * 4);
    }
    out
}

fn read_cstr(buf: &[u8], off: usize, len: usize) -> String {
    let raw = &buf[off..off + len];
    let end = raw.iter().position(|&b| b == 0).unwrap_or(len);
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

fn write_u16(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

fn write_i16(buf: &mut [u8], off: usize, v: i16) {
    buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

fn write_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

fn write_f32(buf: &mut [u8], off: usize, v: f32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

fn write_u16_array(buf: &mut [u8], off: usize, vals: &[u16]) {
    for (i, &v) in vals.iter().enumerate() {
        write_u16(buf, off + i * 2, v);
    }
}

fn write_f32_array(buf: &mut [u8], off: usize, vals: &[f32]) {
    for (i, &v) in vals.iter().enumerate() {
        write_f32(buf, off + i * 4, v);
    }
}

fn write_cstr(buf: &mut [u8], off: usize, len: usize, s: &str) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(len.saturating_sub(1));
    buf[off..off + len].fill(0);
    buf[off..off + n].copy_from_slice(&bytes[..n]);
}
