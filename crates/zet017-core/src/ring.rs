//! Fixed-capacity byte rings for continuous ADC ingress and DAC egress.
//!
//! Single producer (the worker), bursted consumer (the façade). Capacity is
//! chosen so every legal `sample_size * channel_count` stride divides it
//! evenly — the constants below reproduce the original
//! implementation's literal grouping factor byte-for-byte rather than
//! re-deriving a "nicer" number, since the capacity is part of the
//! timing/layout contract, not a stylistic choice.
use crate::error::{Error, Result};

/// `1*2*3*2*5*1*7*2` frames, each up to 4 bytes (the widest legal sample),
/// rounded up from one second of 50 kHz * 8 channels * 4-byte samples.
const ADC_GROUP_BYTES: usize = 1 * 2 * 3 * 2 * 5 * 1 * 7 * 2 * 4;
const ADC_MAX_BYTES: usize = 50_000 * 8 * 4;
/// Capacity in bytes of the ADC ring: one second of max-rate 8-channel i32
/// samples, rounded up to a multiple of [`ADC_GROUP_BYTES`].
pub const ADC_CAPACITY: usize = (ADC_MAX_BYTES / ADC_GROUP_BYTES + 1) * ADC_GROUP_BYTES;

const DAC_MAX_BYTES: usize = 200_000 * 2 * 4;
/// Capacity in bytes of the DAC ring: four times one second of
/// worst-case 2-channel i32 samples.
pub const DAC_CAPACITY: usize = DAC_MAX_BYTES * 4;

pub const MAX_CHANNELS: usize = 8;
pub const MAX_GAINS: usize = 4;

/// Continuous ADC ingress ring. The worker is the sole writer; the façade
/// reads bursts of calibrated samples for a single channel at a time.
pub struct AdcRing {
    buffer: Vec<u8>,
    pointer: usize,
    pub channel_mask: u32,
    pub channel_count: u16,
    pub sample_size: u16,
    pub amplify_code: [u16; MAX_CHANNELS],
    pub resolution: [[f32; MAX_GAINS]; MAX_CHANNELS],
}

impl AdcRing {
    pub fn new() -> Self {
        Self {
            buffer: vec![0u8; ADC_CAPACITY],
            pointer: 0,
            channel_mask: 0,
            channel_count: 0,
            sample_size: 2,
            amplify_code: [0; MAX_CHANNELS],
            resolution: [[0.0; MAX_GAINS]; MAX_CHANNELS],
        }
    }

    pub fn reset(&mut self) {
        self.buffer.fill(0);
        self.pointer = 0;
    }

    /// Byte offset of the next write, always a multiple of
    /// `sample_size * channel_count`.
    pub fn pointer(&self) -> usize {
        self.pointer
    }

    pub fn pointer_frames(&self) -> u32 {
        let step = self.frame_stride();
        if step == 0 { 0 } else { (self.pointer / step) as u32 }
    }

    pub fn channel_capacity_frames(&self) -> u32 {
        let step = self.frame_stride();
        if step == 0 { 0 } else { (ADC_CAPACITY / step) as u32 }
    }

    fn frame_stride(&self) -> usize {
        self.sample_size as usize * self.channel_count as usize
    }

    /// Copy one ADC frame burst into the ring, wrapping with a split copy
    /// as needed, and advance the write pointer.
    pub fn push_frame_bytes(&mut self, data: &[u8]) {
        let size = data.len();
        if size == 0 {
            return;
        }
        let remaining = ADC_CAPACITY - self.pointer;
        if size <= remaining {
            self.buffer[self.pointer..self.pointer + size].copy_from_slice(data);
            self.pointer += size;
            if self.pointer >= ADC_CAPACITY {
                self.pointer -= ADC_CAPACITY;
            }
        } else {
            self.buffer[self.pointer..ADC_CAPACITY].copy_from_slice(&data[..remaining]);
            let tail = size - remaining;
            self.buffer[..tail].copy_from_slice(&data[remaining..]);
            self.pointer = tail;
        }
    }

    /// Read `out.len()` calibrated samples of `channel`, ending at
    /// `pointer - 1` (mod channel capacity).
    pub fn read_channel(&self, channel: u32, pointer: u32, out: &mut [f32]) -> Result<()> {
        if channel as usize >= MAX_CHANNELS {
            return Err(Error::BadChannel);
        }
        if self.channel_mask & (1 << channel) == 0 {
            return Err(Error::BadChannel);
        }
        let step = self.frame_stride();
        let channel_size = self.channel_capacity_frames();
        let size = out.len() as u32;
        if size > channel_size {
            return Err(Error::BadSize);
        }
        if pointer >= channel_size {
            return Err(Error::BadPointer);
        }

        let channel_offset = self.channel_byte_offset(channel);
        let start_frame = if pointer >= size {
            pointer - size
        } else {
            pointer + channel_size - size
        };
        let mut p = start_frame as usize * step + channel_offset;
        let amp = self.amplify_code[channel as usize] as usize;
        let resolution = self.resolution[channel as usize][amp.min(MAX_GAINS - 1)];

        for slot in out.iter_mut() {
            if p >= ADC_CAPACITY {
                p -= ADC_CAPACITY;
            }
            let raw = self.decode_sample(p);
            *slot = raw * resolution;
            p += step;
        }

        Ok(())
    }

    fn channel_byte_offset(&self, channel: u32) -> usize {
        let mut offset = 0usize;
        for i in 0..channel {
            if self.channel_mask & (1 << i) != 0 {
                offset += self.sample_size as usize;
            }
        }
        offset
    }

    fn decode_sample(&self, byte_offset: usize) -> f32 {
        if self.sample_size == 2 {
            i16::from_le_bytes([self.buffer[byte_offset], self.buffer[byte_offset + 1]]) as f32
        } else {
            i32::from_le_bytes(self.buffer[byte_offset..byte_offset + 4].try_into().unwrap()) as f32
        }
    }

    /// Expose the raw buffer for test fixtures that need to seed bytes
    /// directly without a live worker (round-trip property tests, P4).
    #[cfg(test)]
    pub fn raw_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }
}

impl Default for AdcRing {
    fn default() -> Self {
        Self::new()
    }
}

/// Continuous DAC egress ring. The façade is the sole writer; the worker
/// drains it to the device.
pub struct DacRing {
    buffer: Vec<u8>,
    pointer: usize,
    pub channel_mask: u32,
    pub channel_count: u16,
    pub sample_size: u16,
    pub resolution: [f32; MAX_CHANNELS],
}

impl DacRing {
    pub fn new() -> Self {
        Self {
            buffer: vec![0u8; DAC_CAPACITY],
            pointer: 0,
            channel_mask: 0,
            channel_count: 0,
            sample_size: 2,
            resolution: [0.0; MAX_CHANNELS],
        }
    }

    pub fn reset(&mut self) {
        self.buffer.fill(0);
        self.pointer = 0;
    }

    pub fn pointer(&self) -> usize {
        self.pointer
    }

    pub fn pointer_frames(&self) -> u32 {
        let step = self.frame_stride();
        if step == 0 { 0 } else { (self.pointer / step) as u32 }
    }

    pub fn channel_capacity_frames(&self) -> u32 {
        let step = self.frame_stride();
        if step == 0 { 0 } else { (DAC_CAPACITY / step) as u32 }
    }

    fn frame_stride(&self) -> usize {
        self.sample_size as usize * self.channel_count as usize
    }

    /// Splice `size` bytes out of the ring for transmission, zeroing the
    /// consumed region so stale samples never replay if the producer
    /// outruns the caller, and advance the read (egress) pointer.
    pub fn pull_frame_bytes(&mut self, out: &mut [u8]) {
        let size = out.len();
        if size == 0 {
            return;
        }
        let remaining = DAC_CAPACITY - self.pointer;
        if size <= remaining {
            out.copy_from_slice(&self.buffer[self.pointer..self.pointer + size]);
            self.buffer[self.pointer..self.pointer + size].fill(0);
            self.pointer += size;
            if self.pointer >= DAC_CAPACITY {
                self.pointer -= DAC_CAPACITY;
            }
        } else {
            out[..remaining].copy_from_slice(&self.buffer[self.pointer..DAC_CAPACITY]);
            self.buffer[self.pointer..DAC_CAPACITY].fill(0);
            let tail = size - remaining;
            out[remaining..].copy_from_slice(&self.buffer[..tail]);
            self.buffer[..tail].fill(0);
            self.pointer = tail;
        }
    }

    /// Encode `input` as raw DAC codes for `channel`, ending at
    /// `pointer - 1` (mod channel capacity).
    pub fn write_channel(&mut self, channel: u32, pointer: u32, input: &[f32]) -> Result<()> {
        if channel as usize >= MAX_CHANNELS {
            return Err(Error::BadChannel);
        }
        if self.channel_mask & (1 << channel) == 0 {
            return Err(Error::BadChannel);
        }
        let step = self.frame_stride();
        let channel_size = self.channel_capacity_frames();
        let size = input.len() as u32;
        if size > channel_size {
            return Err(Error::BadSize);
        }
        if pointer >= channel_size {
            return Err(Error::BadPointer);
        }

        let channel_offset = self.channel_byte_offset(channel);
        let start_frame = if pointer >= size {
            pointer - size
        } else {
            pointer + channel_size - size
        };
        let mut p = start_frame as usize * step + channel_offset;
        let resolution = self.resolution[channel as usize];

        for &sample in input {
            if p >= DAC_CAPACITY {
                p -= DAC_CAPACITY;
            }
            let code = if resolution != 0.0 { sample / resolution } else { 0.0 };
            self.encode_sample(p, code);
            p += step;
        }

        Ok(())
    }

    fn channel_byte_offset(&self, channel: u32) -> usize {
        let mut offset = 0usize;
        for i in 0..channel {
            if self.channel_mask & (1 << i) != 0 {
                offset += self.sample_size as usize;
            }
        }
        offset
    }

    fn encode_sample(&mut self, byte_offset: usize, value: f32) {
        if self.sample_size == 2 {
            let v = value as i16;
            self.buffer[byte_offset..byte_offset + 2].copy_from_slice(&v.to_le_bytes());
        } else {
            let v = value as i32;
            self.buffer[byte_offset..byte_offset + 4].copy_from_slice(&v.to_le_bytes());
        }
    }
}

impl Default for DacRing {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_channel_adc(sample_size: u16) -> AdcRing {
        let mut ring = AdcRing::new();
        ring.channel_mask = 0b1;
        ring.channel_count = 1;
        ring.sample_size = sample_size;
        ring.amplify_code = [0; MAX_CHANNELS];
        ring.resolution[0][0] = 2.0;
        ring
    }

    #[test]
    fn round_trip_raw_bytes_to_calibrated_float() {
        let mut ring = single_channel_adc(2);
        let raw: i16 = 1234;
        ring.push_frame_bytes(&raw.to_le_bytes());

        let mut out = [0.0f32; 1];
        ring.read_channel(0, ring.pointer_frames(), &mut out).unwrap();
        assert_eq!(out[0], raw as f32 * 2.0);
    }

    #[test]
    fn push_wraps_with_split_copy() {
        let mut ring = single_channel_adc(2);
        // Force the pointer near the end of the capacity so the next push wraps.
        let near_end = ADC_CAPACITY - 4;
        ring.push_frame_bytes(&vec![0u8; near_end]);
        assert_eq!(ring.pointer(), near_end);

        let raw: i16 = -7;
        ring.push_frame_bytes(&raw.to_le_bytes());
        ring.push_frame_bytes(&raw.to_le_bytes());
        assert_eq!(ring.pointer(), 2);
    }

    #[test]
    fn bad_channel_rejected() {
        let ring = single_channel_adc(2);
        let mut out = [0.0f32; 1];
        assert!(matches!(ring.read_channel(5, 0, &mut out), Err(Error::BadChannel)));
    }

    #[test]
    fn oversized_request_is_bad_size_not_bad_pointer() {
        let ring = single_channel_adc(2);
        let channel_size = ring.channel_capacity_frames();
        let mut out = vec![0.0f32; channel_size as usize + 1];
        assert!(matches!(ring.read_channel(0, 0, &mut out), Err(Error::BadSize)));
    }

    #[test]
    fn out_of_range_pointer_is_bad_pointer() {
        let ring = single_channel_adc(2);
        let channel_size = ring.channel_capacity_frames();
        let mut out = [0.0f32; 1];
        assert!(matches!(ring.read_channel(0, channel_size, &mut out), Err(Error::BadPointer)));
    }

    #[test]
    fn dac_write_then_drain_zeroes_consumed_region() {
        let mut ring = DacRing::new();
        ring.channel_mask = 0b1;
        ring.channel_count = 1;
        ring.sample_size = 2;
        ring.resolution[0] = 0.5;

        ring.write_channel(0, 1, &[1.0]).unwrap();
        let mut out = [0u8; 2];
        ring.pull_frame_bytes(&mut out);
        let sample = i16::from_le_bytes(out);
        assert_eq!(sample, 2); // 1.0 / 0.5

        // Consumed region is zeroed, so draining again never replays it.
        let mut again = [0xffu8; 2];
        ring.reset();
        ring.pull_frame_bytes(&mut again);
        assert_eq!(again, [0, 0]);
    }

    #[test]
    fn multi_channel_offset_is_interleaved() {
        let mut ring = AdcRing::new();
        ring.channel_mask = 0b11;
        ring.channel_count = 2;
        ring.sample_size = 2;
        ring.resolution[0][0] = 1.0;
        ring.resolution[1][0] = 1.0;

        let ch0: i16 = 10;
        let ch1: i16 = 20;
        let mut frame = Vec::new();
        frame.extend_from_slice(&ch0.to_le_bytes());
        frame.extend_from_slice(&ch1.to_le_bytes());
        ring.push_frame_bytes(&frame);

        let mut out0 = [0.0f32; 1];
        let mut out1 = [0.0f32; 1];
        let p = ring.pointer_frames();
        ring.read_channel(0, p, &mut out0).unwrap();
        ring.read_channel(1, p, &mut out1).unwrap();
        assert_eq!(out0[0], 10.0);
        assert_eq!(out1[0], 20.0);
    }
}
