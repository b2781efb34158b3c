//! The `Device` handle: owns the public snapshots, the ring buffers, the
//! command bridge, and the worker thread for one ZET 017 device.
//!
//! The raw 1024-byte device-info record is never shared here; it is the
//! worker's exclusive, internal state, and the only mutator of it. This
//! module only holds the published snapshots the worker republishes after
//! each relevant event, plus the ring buffers the worker and the façade
//! both touch under their own leaf mutexes.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::bridge::{Command, CommandBridge};
use crate::codec::{CorrectionInfo, DeviceInfoRecord};
use crate::config;
use crate::error::{Error, Result};
use crate::platform::WakeChannel;
use crate::ring::{AdcRing, DacRing, MAX_CHANNELS};
use crate::worker;

/// Snapshot of device identity/register fields a caller might want without
/// going through the full register map.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceInfo {
    pub device_name: String,
    pub version_dsp: String,
    pub serial: u32,
    pub quantity_channel_adc: u16,
    pub quantity_channel_dac: u16,
    pub quantity_channel_virt: u16,
    pub digital_input: u32,
    pub digital_output: u32,
    pub digital_output_enable: u32,
}

/// Connection/liveness plus ring pointers in frames, as returned by
/// `get_state`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceState {
    pub connected: bool,
    pub reconnect: u32,
    pub pointer_adc: u32,
    pub buffer_size_adc: u32,
    pub pointer_dac: u32,
    pub buffer_size_dac: u32,
    pub adc_count: u64,
    pub dac_count: u64,
}

/// The `get_config`/`set_config` view: host-facing engineering values
/// only, never device register codes (`config.rs` owns that mapping).
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceConfig {
    pub sample_rate_adc: u32,
    pub sample_rate_dac: u32,
    pub mask_channel_adc: u32,
    pub mask_channel_dac: u32,
    pub mask_icp: u32,
    pub gain: [u32; MAX_CHANNELS],
    pub type_data_adc: u8,
    pub type_data_dac: u8,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            sample_rate_adc: 25_000,
            sample_rate_dac: 0,
            mask_channel_adc: 0,
            mask_channel_dac: 0,
            mask_icp: 0,
            gain: [1; MAX_CHANNELS],
            type_data_adc: 0,
            type_data_dac: 0,
        }
    }
}

pub struct Device {
    pub ip: Ipv4Addr,
    wake: WakeChannel,
    bridge: CommandBridge,
    info: Mutex<DeviceInfo>,
    state: Mutex<DeviceState>,
    config: Mutex<DeviceConfig>,
    pub(crate) adc: Mutex<AdcRing>,
    pub(crate) dac: Mutex<DacRing>,
    running: AtomicBool,
    started: AtomicBool,
    reconnect: AtomicU32,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Device {
    /// Allocate a device and spawn its worker thread.
    pub fn spawn(ip: Ipv4Addr) -> Result<Arc<Device>> {
        let (wake, wake_reader) = WakeChannel::new()?;
        let device = Arc::new(Device {
            ip,
            wake,
            bridge: CommandBridge::new(),
            info: Mutex::new(DeviceInfo::default()),
            state: Mutex::new(DeviceState::default()),
            config: Mutex::new(DeviceConfig::default()),
            adc: Mutex::new(AdcRing::new()),
            dac: Mutex::new(DacRing::new()),
            running: AtomicBool::new(true),
            started: AtomicBool::new(false),
            reconnect: AtomicU32::new(0),
            worker: Mutex::new(None),
        });

        let worker_device = Arc::clone(&device);
        let handle = std::thread::Builder::new()
            .name(format!("zet017-worker-{ip}"))
            .spawn(move || worker::run(worker_device, wake_reader))
            .map_err(|_| Error::ThreadSpawnFailed)?;
        *device.worker.lock().unwrap() = Some(handle);

        Ok(device)
    }

    /// Signal the worker to stop and join it, used by `remove_device` and
    /// server teardown.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.wake.wake();
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn wake_handle(&self) -> &WakeChannel {
        &self.wake
    }

    pub fn get_info(&self) -> DeviceInfo {
        self.info.lock().unwrap().clone()
    }

    pub fn get_state(&self) -> DeviceState {
        self.state.lock().unwrap().clone()
    }

    pub fn get_config(&self) -> DeviceConfig {
        self.config.lock().unwrap().clone()
    }

    pub fn set_config(&self, config: &DeviceConfig) -> Result<()> {
        if !self.state.lock().unwrap().connected {
            return Err(Error::Disconnected);
        }
        self.bridge.post(&self.wake, Command::SetConfig(config.clone()))
    }

    pub fn start(&self, dac_enable: bool) -> Result<()> {
        if !self.state.lock().unwrap().connected {
            return Err(Error::Disconnected);
        }
        if self.started.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.bridge.post(&self.wake, Command::Start { dac_enable })
    }

    /// Stop always reports success once the bridge round-trip completes,
    /// independent of the worker's internal result. Not silently "fixed"
    /// into a fallible stop; callers that care can still watch `get_state`.
    pub fn stop(&self) -> Result<()> {
        if !self.state.lock().unwrap().connected {
            return Err(Error::Disconnected);
        }
        let _ = self.bridge.post(&self.wake, Command::Stop);
        Ok(())
    }

    pub fn channel_get_data(&self, channel: u32, pointer: u32, out: &mut [f32]) -> Result<()> {
        self.adc.lock().unwrap().read_channel(channel, pointer, out)
    }

    pub fn channel_put_data(&self, channel: u32, pointer: u32, input: &[f32]) -> Result<()> {
        self.dac.lock().unwrap().write_channel(channel, pointer, input)
    }

    // --- worker-only mutators below; not part of the public façade ---

    pub(crate) fn bridge(&self) -> &CommandBridge {
        &self.bridge
    }

    pub(crate) fn mark_started(&self, started: bool) {
        self.started.store(started, Ordering::SeqCst);
    }

    pub(crate) fn bump_reconnect(&self) -> u32 {
        self.reconnect.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn publish_disconnected(&self) {
        let mut state = self.state.lock().unwrap();
        state.connected = false;
        self.started.store(false, Ordering::SeqCst);
    }

    pub(crate) fn publish_state(&self, adc_count: u64, dac_count: u64) {
        let mut state = self.state.lock().unwrap();
        state.connected = true;
        state.reconnect = self.reconnect.load(Ordering::SeqCst);
        state.pointer_adc = self.adc.lock().unwrap().pointer_frames();
        state.buffer_size_adc = self.adc.lock().unwrap().channel_capacity_frames();
        state.pointer_dac = self.dac.lock().unwrap().pointer_frames();
        state.buffer_size_dac = self.dac.lock().unwrap().channel_capacity_frames();
        state.adc_count = adc_count;
        state.dac_count = dac_count;
    }

    /// Republish `DeviceInfo`, `DeviceConfig`, and the ring buffers' mask /
    /// gain / resolution tables from a freshly decoded device-info record.
    /// Called once during `Initializing` and again on every 60s refresh
    /// during `Streaming`.
    pub(crate) fn apply_device_info(&self, record: &DeviceInfoRecord, correction: &CorrectionInfo) {
        *self.info.lock().unwrap() = DeviceInfo {
            device_name: record.device_name.clone(),
            version_dsp: record.version_dsp.clone(),
            serial: record.serial,
            quantity_channel_adc: record.quantity_channel_adc,
            quantity_channel_dac: record.quantity_channel_dac,
            quantity_channel_virt: record.quantity_channel_virt,
            digital_input: record.digital_input,
            digital_output: record.digital_output,
            digital_output_enable: record.digital_output_enable,
        };

        let four_channel = record.quantity_channel_adc == 4;
        let host_mask_adc = if four_channel {
            config::mask_device_to_host_4ch(record.mask_channel_adc)
        } else {
            record.mask_channel_adc
        };
        let host_mask_dac = record.mask_channel_dac;
        let host_mask_icp =
            if four_channel { config::mask_device_to_host_4ch(record.mask_icp) } else { record.mask_icp };

        let mut gain = [1u32; MAX_CHANNELS];
        for c in 0..record.quantity_channel_adc.min(MAX_CHANNELS as u16) {
            let idx = if four_channel { config::four_channel_array_index(c as usize) } else { c as usize };
            gain[c as usize] = config::gain_from_amplify_code(record.amplify_code[idx.min(7)]);
        }

        *self.config.lock().unwrap() = DeviceConfig {
            sample_rate_adc: config::sample_rate_adc_from_mode(record.mode_adc),
            sample_rate_dac: config::sample_rate_dac_from_rate(record.rate_dac),
            mask_channel_adc: host_mask_adc,
            mask_channel_dac: host_mask_dac,
            mask_icp: host_mask_icp,
            gain,
            type_data_adc: record.type_data_adc,
            type_data_dac: record.type_data_dac,
        };

        // Resolution (quantization weight) is indexed by the *effective*
        // ADC channel count, i.e. excluding virtual channels, which can
        // differ from the raw count used for the mask/amplify-code remap
        // above.
        let effective_adc_channels = record.quantity_channel_adc.saturating_sub(record.quantity_channel_virt);
        let four_channel_resolution = effective_adc_channels == 4;

        {
            let mut adc = self.adc.lock().unwrap();
            adc.channel_mask = host_mask_adc;
            adc.channel_count = record.work_channel_adc;
            adc.sample_size = record.sample_size_adc();
            for c in 0..record.quantity_channel_adc.min(MAX_CHANNELS as u16) as usize {
                let idx = if four_channel { config::four_channel_array_index(c) } else { c };
                adc.amplify_code[c] = record.amplify_code[idx.min(7)];
            }
            for c in 0..effective_adc_channels.min(MAX_CHANNELS as u16) as usize {
                let register_idx = if four_channel_resolution { config::four_channel_array_index(c) } else { c };
                let register_idx = register_idx.min(15);

                if correction.amplify[c][0] == 0.0 {
                    let base = resolved_resolution(record.resolution_adc[register_idx], record.resolution_adc_def);
                    adc.resolution[c][0] = base;
                    adc.resolution[c][1] = base / 10.0;
                    adc.resolution[c][2] = base / 100.0;
                } else {
                    adc.resolution[c][0] = correction.amplify[c][0];
                    adc.resolution[c][1] = adc.resolution[c][0] / correction.amplify[c][1];
                    adc.resolution[c][2] = adc.resolution[c][0] / correction.amplify[c][2];
                }
            }
        }

        {
            let mut dac = self.dac.lock().unwrap();
            dac.channel_mask = host_mask_dac;
            dac.channel_count = record.work_channel_dac;
            dac.sample_size = record.sample_size_dac();
            for c in 0..record.quantity_channel_dac.min(MAX_CHANNELS as u16) as usize {
                let reduction = correction.reduction.get(c).copied().unwrap_or(0.0);
                dac.resolution[c] = if reduction == 0.0 {
                    resolved_resolution(record.resolution_dac.get(c).copied().unwrap_or(0.0), record.resolution_dac_def)
                } else {
                    reduction
                };
            }
        }
    }
}

/// "Unset means use default": an explicit float comparison against zero,
/// not a bit-reinterpretation trick.
fn resolved_resolution(value: f32, default: f32) -> f32 {
    if value == 0.0 { default } else { value }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_fallback_uses_default_when_unset() {
        assert_eq!(resolved_resolution(0.0, 1.5e-4), 1.5e-4);
        assert_eq!(resolved_resolution(3.0e-4, 1.5e-4), 3.0e-4);
    }

    #[test]
    fn default_config_has_nominal_sample_rate() {
        let config = DeviceConfig::default();
        assert_eq!(config.sample_rate_adc, 25_000);
        assert_eq!(config.gain, [1; MAX_CHANNELS]);
    }

    fn bare_device() -> Device {
        let (wake, _reader) = WakeChannel::new().unwrap();
        Device {
            ip: Ipv4Addr::LOCALHOST,
            wake,
            bridge: CommandBridge::new(),
            info: Mutex::new(DeviceInfo::default()),
            state: Mutex::new(DeviceState::default()),
            config: Mutex::new(DeviceConfig::default()),
            adc: Mutex::new(AdcRing::new()),
            dac: Mutex::new(DacRing::new()),
            running: AtomicBool::new(true),
            started: AtomicBool::new(false),
            reconnect: AtomicU32::new(0),
            worker: Mutex::new(None),
        }
    }

    fn base_record() -> DeviceInfoRecord {
        let zero = [0u8; crate::codec::PACKET_SIZE];
        let mut record = DeviceInfoRecord::decode(&zero);
        record.quantity_channel_adc = 8;
        record.quantity_channel_dac = 1;
        record.resolution_adc_def = 1.0e-4;
        record.resolution_dac_def = 2.0e-4;
        record
    }

    #[test]
    fn apply_device_info_without_correction_divides_down_for_higher_gains() {
        let device = bare_device();
        let mut record = base_record();
        record.resolution_adc[2] = 5.0e-4;
        let correction = CorrectionInfo::zeroed();

        device.apply_device_info(&record, &correction);

        let adc = device.adc.lock().unwrap();
        assert_eq!(adc.resolution[2][0], 5.0e-4);
        assert_eq!(adc.resolution[2][1], 5.0e-5);
        assert_eq!(adc.resolution[2][2], 5.0e-6);
        // A channel with no register override falls back to the device default.
        assert_eq!(adc.resolution[0][0], 1.0e-4);
    }

    #[test]
    fn apply_device_info_with_correction_treats_gain_zero_as_absolute() {
        let device = bare_device();
        let record = base_record();
        let mut correction = CorrectionInfo::zeroed();
        correction.amplify[3] = [8.0e-4, 2.0, 4.0, 0.0];

        device.apply_device_info(&record, &correction);

        let adc = device.adc.lock().unwrap();
        assert_eq!(adc.resolution[3][0], 8.0e-4);
        assert_eq!(adc.resolution[3][1], 4.0e-4);
        assert_eq!(adc.resolution[3][2], 2.0e-4);
    }

    #[test]
    fn apply_device_info_remaps_four_channel_resolution_indices() {
        let device = bare_device();
        let mut record = base_record();
        record.quantity_channel_adc = 4;
        record.resolution_adc[3] = 9.0e-4; // slot for host channel 1 (2*1+1)

        device.apply_device_info(&record, &CorrectionInfo::zeroed());

        let adc = device.adc.lock().unwrap();
        assert_eq!(adc.resolution[1][0], 9.0e-4);
    }

    #[test]
    fn apply_device_info_remaps_icp_mask_for_four_channel_devices() {
        let device = bare_device();
        let mut record = base_record();
        record.quantity_channel_adc = 4;
        record.mask_icp = 0b1000_1000; // device-side bits for host channels 1 and 3

        device.apply_device_info(&record, &CorrectionInfo::zeroed());

        assert_eq!(device.config.lock().unwrap().mask_icp, 0b0000_1010);
    }

    #[test]
    fn apply_device_info_leaves_icp_mask_untouched_for_eight_channel_devices() {
        let device = bare_device();
        let mut record = base_record();
        record.mask_icp = 0b0000_1010;

        device.apply_device_info(&record, &CorrectionInfo::zeroed());

        assert_eq!(device.config.lock().unwrap().mask_icp, 0b0000_1010);
    }
}
