//! Sample-rate, gain, and channel-mask encoding between device register
//! codes and host-facing engineering values.

/// `mode_adc` register code → sample rate in Hz.
pub fn sample_rate_adc_from_mode(mode_adc: u16) -> u32 {
    match mode_adc {
        1 => 50_000,
        3 => 5_000,
        4 => 2_500,
        // mode 2 and the "default" fallback both mean 25 kHz.
        _ => 25_000,
    }
}

/// Sample rate in Hz → `mode_adc` register code.
pub fn mode_adc_from_sample_rate(sample_rate_adc: u32) -> u16 {
    match sample_rate_adc {
        50_000 => 1,
        25_000 => 2,
        5_000 => 3,
        2_500 => 4,
        _ => 0,
    }
}

/// `rate_dac` register code → sample rate in Hz.
pub fn sample_rate_dac_from_rate(rate_dac: u16) -> u32 {
    if rate_dac == 0 {
        0
    } else {
        80_000_000 / u32::from(rate_dac)
    }
}

/// Sample rate in Hz → `rate_dac` register code.
pub fn rate_dac_from_sample_rate(sample_rate_dac: u32) -> u16 {
    if sample_rate_dac == 0 {
        0
    } else {
        (80_000_000 / sample_rate_dac) as u16
    }
}

/// `amplify_code` register value → gain multiplier.
pub fn gain_from_amplify_code(amplify_code: u16) -> u32 {
    match amplify_code {
        0 => 1,
        1 => 10,
        2 => 100,
        _ => 0,
    }
}

/// Gain multiplier → `amplify_code` register value.
pub fn amplify_code_from_gain(gain: u32) -> u16 {
    match gain {
        1 => 0,
        10 => 1,
        100 => 2,
        _ => 0,
    }
}

/// Translate a dense 4-bit host-facing mask into the device's sparse
/// odd-bit-position mask used on 4-channel hardware: `{b0→b1, b1→b3,
/// b2→b5, b3→b7}`.
pub fn mask_host_to_device_4ch(host_mask: u32) -> u32 {
    ((host_mask & 0x1) << 1) | ((host_mask & 0x2) << 2) | ((host_mask & 0x4) << 3) | ((host_mask & 0x8) << 4)
}

/// Inverse of [`mask_host_to_device_4ch`]: sparse odd-bit device mask →
/// dense 4-bit host mask.
pub fn mask_device_to_host_4ch(device_mask: u32) -> u32 {
    ((device_mask & 0x02) >> 1) | ((device_mask & 0x08) >> 2) | ((device_mask & 0x20) >> 3) | ((device_mask & 0x80) >> 4)
}

/// Translate a per-gain array index for the active channel layout: on a
/// 4-channel device the device-side `amplify_code`/`resolution_adc` arrays
/// are indexed `i*2+1` for dense host channel `i`.
pub fn four_channel_array_index(host_channel: usize) -> usize {
    host_channel * 2 + 1
}

/// Recompute `size_packet_adc`: `active` is the number of set bits in the
/// device-side channel mask under the 4- or 8-channel rule; `sample_size`
/// is 2 or 4 bytes.
pub fn size_packet_adc(sample_rate_adc: u32, active: u32, sample_size: u32) -> u16 {
    if active == 0 || sample_size == 0 {
        return 0;
    }
    let max_bytes = (crate::codec::PACKET_SIZE - 8) as u32;
    let max_samples = max_bytes / sample_size;
    let mut max_frames = max_samples / active;
    loop {
        if max_frames == 0 {
            break;
        }
        let count = sample_rate_adc / max_frames;
        if count >= 10 {
            break;
        }
        max_frames /= 2;
    }
    let max_frames = max_frames.max(1);
    (max_frames * active * sample_size / 2) as u16
}

/// Count the active ADC channels from the device-side mask, respecting
/// the 4-vs-8-channel bit-position rule.
pub fn active_channel_count(quantity_channel_adc: u16, device_mask_channel_adc: u32) -> u32 {
    let mut count = 0;
    for i in 0..quantity_channel_adc {
        let bit = if quantity_channel_adc == 4 { i * 2 + 1 } else { i };
        if device_mask_channel_adc & (1 << bit) != 0 {
            count += 1;
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_rate_round_trips_for_known_codes() {
        for (code, rate) in [(1u16, 50_000u32), (2, 25_000), (3, 5_000), (4, 2_500)] {
            assert_eq!(sample_rate_adc_from_mode(code), rate);
            assert_eq!(mode_adc_from_sample_rate(rate), code);
        }
        assert_eq!(sample_rate_adc_from_mode(0), 25_000);
    }

    #[test]
    fn dac_rate_is_reciprocal_of_code() {
        let rate = sample_rate_dac_from_rate(3200);
        assert_eq!(rate, 25_000);
        assert_eq!(rate_dac_from_sample_rate(rate), 3200);
        assert_eq!(sample_rate_dac_from_rate(0), 0);
        assert_eq!(rate_dac_from_sample_rate(0), 0);
    }

    #[test]
    fn gain_codes_round_trip() {
        for (code, gain) in [(0u16, 1u32), (1, 10), (2, 100)] {
            assert_eq!(gain_from_amplify_code(code), gain);
            assert_eq!(amplify_code_from_gain(gain), code);
        }
    }

    #[test]
    fn mask_remap_is_idempotent_for_all_4_bit_masks() {
        for host_mask in 0u32..16 {
            let device = mask_host_to_device_4ch(host_mask);
            let back = mask_device_to_host_4ch(device);
            assert_eq!(back, host_mask);
        }
    }

    #[test]
    fn size_packet_adc_matches_e2_scenario() {
        // 8-channel device, mask 0x0e -> channels 1,2,3 active, i16 samples.
        let active = active_channel_count(8, 0x0e);
        assert_eq!(active, 3);
        let size = size_packet_adc(25_000, active, 2);
        assert!(size > 0);
        assert_eq!(size % (active as u16 * 2), 0);
    }

    #[test]
    fn size_packet_adc_keeps_rate_above_ten_hz_when_room_allows() {
        let active = 1;
        let sample_size = 2;
        let size = size_packet_adc(50_000, active, sample_size);
        let max_frames = (size as u32 * 2) / (active * sample_size);
        assert!(50_000 / max_frames >= 10);
    }

    #[test]
    fn four_channel_device_uses_odd_array_slots() {
        assert_eq!(four_channel_array_index(0), 1);
        assert_eq!(four_channel_array_index(3), 7);
    }
}
