//! Concurrent TCP device-management core for ZET 017 data-acquisition
//! hardware.
//!
//! A [`Server`] owns zero or more [`Device`](device::Device) handles, each
//! backed by a dedicated worker thread that multiplexes the device's three
//! TCP sessions (command, ADC, DAC) and a wake channel behind a single timed
//! poll. Foreground callers talk to a device through the command bridge
//! (config changes, start/stop) and read/write streaming samples directly
//! against lock-protected ring buffers — no request ever blocks on the
//! worker's I/O loop for longer than one wake-and-post round trip.

pub mod bridge;
pub mod codec;
pub mod config;
pub mod device;
pub mod error;
pub mod platform;
pub mod ring;
pub mod server;
pub mod socket;
mod worker;

pub use device::{DeviceConfig, DeviceInfo, DeviceState};
pub use error::{Error, Result};
pub use server::Server;
