//! The device registry: owns the set of devices keyed by IP, in insertion
//! order.

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use crate::device::{Device, DeviceConfig, DeviceInfo, DeviceState};
use crate::error::{Error, Result};
use crate::platform;

/// Entry point of the crate. One `Server` owns zero or more devices;
/// dropping it tears every device down and releases the process-wide
/// network initialization (the Rust equivalent of the original's
/// `server_create`/`server_free` pair — RAII replaces the explicit free
/// call).
pub struct Server {
    devices: Mutex<Vec<(String, Arc<Device>)>>,
}

impl Server {
    pub fn new() -> Result<Self> {
        platform::network_init()?;
        Ok(Self { devices: Mutex::new(Vec::new()) })
    }

    /// Register a device and spawn its worker thread. Duplicate IPs are
    /// rejected.
    pub fn add_device(&self, ip: &str) -> Result<()> {
        let addr: Ipv4Addr = ip.parse().map_err(|_| Error::NullArgument)?;
        let mut devices = self.devices.lock().unwrap();
        if devices.iter().any(|(existing, _)| existing == ip) {
            return Err(Error::Duplicate);
        }
        let device = Device::spawn(addr)?;
        devices.push((ip.to_string(), device));
        Ok(())
    }

    /// Unregister and tear down a device. Missing IP is an error.
    pub fn remove_device(&self, ip: &str) -> Result<()> {
        let device = {
            let mut devices = self.devices.lock().unwrap();
            let pos = devices.iter().position(|(existing, _)| existing == ip).ok_or(Error::MissingDevice)?;
            devices.remove(pos).1
        };
        device.shutdown();
        Ok(())
    }

    pub fn device_count(&self) -> usize {
        self.devices.lock().unwrap().len()
    }

    /// Enumerate registered IPs in insertion order.
    pub fn device_ips(&self) -> Vec<String> {
        self.devices.lock().unwrap().iter().map(|(ip, _)| ip.clone()).collect()
    }

    pub fn get_info(&self, ip: &str) -> Result<DeviceInfo> {
        Ok(self.find(ip)?.get_info())
    }

    pub fn get_state(&self, ip: &str) -> Result<DeviceState> {
        Ok(self.find(ip)?.get_state())
    }

    pub fn get_config(&self, ip: &str) -> Result<DeviceConfig> {
        Ok(self.find(ip)?.get_config())
    }

    pub fn set_config(&self, ip: &str, config: &DeviceConfig) -> Result<()> {
        self.find(ip)?.set_config(config)
    }

    pub fn start(&self, ip: &str, dac_enable: bool) -> Result<()> {
        self.find(ip)?.start(dac_enable)
    }

    pub fn stop(&self, ip: &str) -> Result<()> {
        self.find(ip)?.stop()
    }

    pub fn channel_get_data(&self, ip: &str, channel: u32, pointer: u32, out: &mut [f32]) -> Result<()> {
        self.find(ip)?.channel_get_data(channel, pointer, out)
    }

    pub fn channel_put_data(&self, ip: &str, channel: u32, pointer: u32, input: &[f32]) -> Result<()> {
        self.find(ip)?.channel_put_data(channel, pointer, input)
    }

    fn find(&self, ip: &str) -> Result<Arc<Device>> {
        self.devices
            .lock()
            .unwrap()
            .iter()
            .find(|(existing, _)| existing == ip)
            .map(|(_, device)| Arc::clone(device))
            .ok_or(Error::MissingDevice)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        let devices: Vec<_> = self.devices.lock().unwrap().drain(..).collect();
        for (_, device) in devices {
            device.shutdown();
        }
        platform::network_cleanup();
    }
}
