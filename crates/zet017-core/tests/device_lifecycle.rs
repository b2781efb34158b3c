//! Full-lifecycle coverage against an in-process fake ZET 017 device:
//! config decode/remap for 8- and 4-channel shapes, streaming throughput
//! through `channel_get_data`/`channel_put_data`, disconnect/reconnect,
//! and the graceful stop handshake.
//!
//! All of these share the three fixed device ports, so every test takes
//! `common::port_lock()` first and runs the fake device end to end rather
//! than mocking `Server` at a trait boundary.

mod common;

use std::io::Write;
use std::thread;
use std::time::Duration;

use common::{port_lock, recv_dac_packet, sample_record, send_adc_packet, wait_until, FakeDevice};
use zet017_core::codec::{CorrectionInfo, PACKET_SIZE};
use zet017_core::Server;

const SETTLE: Duration = Duration::from_secs(5);

#[test]
fn eight_channel_device_reports_decoded_info_and_config() {
    let _guard = port_lock();
    let server = Server::new().unwrap();

    let fake_thread = thread::spawn(FakeDevice::accept);
    server.add_device("127.0.0.1").unwrap();
    let mut fake = fake_thread.join().unwrap();

    let mut record = sample_record();
    let correction = CorrectionInfo::zeroed();
    fake.serve_initial_exchange(&mut record, &correction);

    assert!(wait_until(|| server.get_state("127.0.0.1").unwrap().connected, SETTLE));

    let info = server.get_info("127.0.0.1").unwrap();
    assert_eq!(info.device_name, "ZET017");
    assert_eq!(info.version_dsp, "1.0.0");
    assert_eq!(info.serial, 17);
    assert_eq!(info.quantity_channel_adc, 8);
    assert_eq!(info.quantity_channel_dac, 1);

    let config = server.get_config("127.0.0.1").unwrap();
    assert_eq!(config.sample_rate_adc, 25_000);
    assert_eq!(config.sample_rate_dac, 25_000);
    assert_eq!(config.mask_channel_adc, 0x0e); // no remap: this is an 8-channel device
    assert_eq!(config.mask_channel_dac, 0x01);
    assert_eq!(config.gain[3], 1); // amplify_code defaults to 0 -> x1

    server.remove_device("127.0.0.1").unwrap();
}

#[test]
fn four_channel_device_remaps_mask_and_gain_array_slots() {
    let _guard = port_lock();
    let server = Server::new().unwrap();

    let fake_thread = thread::spawn(FakeDevice::accept);
    server.add_device("127.0.0.1").unwrap();
    let mut fake = fake_thread.join().unwrap();

    let mut record = sample_record();
    record.quantity_channel_adc = 4;
    record.quantity_channel_virt = 0;
    // Device-side mask for host channels {1, 3}: odd bit positions 3 and 7.
    record.mask_channel_adc = 0b1000_1000;
    record.work_channel_adc = 2;
    // Host channel 1's gain lives at array slot 1*2+1 = 3.
    record.amplify_code = [0, 0, 0, 1, 0, 0, 0, 0];
    record.resolution_adc[3] = 7.0e-4;
    let correction = CorrectionInfo::zeroed();
    fake.serve_initial_exchange(&mut record, &correction);

    assert!(wait_until(|| server.get_state("127.0.0.1").unwrap().connected, SETTLE));

    let config = server.get_config("127.0.0.1").unwrap();
    assert_eq!(config.mask_channel_adc, 0b0000_1010); // host-dense: channels 1 and 3
    assert_eq!(config.gain[1], 10);

    server.remove_device("127.0.0.1").unwrap();
}

#[test]
fn streaming_round_trips_adc_samples_and_dac_echo() {
    let _guard = port_lock();
    let server = Server::new().unwrap();

    let fake_thread = thread::spawn(FakeDevice::accept);
    server.add_device("127.0.0.1").unwrap();
    let fake = fake_thread.join().unwrap();

    let record = sample_record();
    let correction = CorrectionInfo::zeroed();
    let (mut adc, mut dac, _command_handle) = {
        let mut fake = fake;
        let mut record = record.clone();
        fake.serve_initial_exchange(&mut record, &correction);
        fake.spawn_command_server(record, correction)
    };

    assert!(wait_until(|| server.get_state("127.0.0.1").unwrap().connected, SETTLE));
    server.start("127.0.0.1", true).unwrap();

    // Three active channels (mask 0x0e), i16 samples, 169 frames fit in the
    // negotiated packet size (507 declared half-words -> 1014 bytes / 6).
    let mut wire = [0u8; PACKET_SIZE];
    for frame in 0..169 {
        let off = frame * 6;
        wire[off..off + 2].copy_from_slice(&100i16.to_le_bytes());
        wire[off + 2..off + 4].copy_from_slice(&(-200i16).to_le_bytes());
        wire[off + 4..off + 6].copy_from_slice(&300i16.to_le_bytes());
    }
    send_adc_packet(&mut adc, &wire);

    assert!(wait_until(|| server.get_state("127.0.0.1").unwrap().adc_count >= 169, SETTLE));

    let pointer = server.get_state("127.0.0.1").unwrap().pointer_adc;
    let mut ch1 = [0.0f32; 1];
    let mut ch2 = [0.0f32; 1];
    let mut ch3 = [0.0f32; 1];
    server.channel_get_data("127.0.0.1", 1, pointer, &mut ch1).unwrap();
    server.channel_get_data("127.0.0.1", 2, pointer, &mut ch2).unwrap();
    server.channel_get_data("127.0.0.1", 3, pointer, &mut ch3).unwrap();
    assert_eq!(ch1[0], 100.0);
    assert_eq!(ch2[0], -200.0);
    assert_eq!(ch3[0], 300.0);

    // DAC echo: keep retrying against the live ring pointer until the
    // worker's next transmitted packet carries the sample we just wrote.
    let expected: i16 = 4000;
    let mut observed = false;
    for _ in 0..500 {
        let state = server.get_state("127.0.0.1").unwrap();
        server.channel_put_data("127.0.0.1", 0, state.pointer_dac + 1, &[expected as f32]).unwrap();
        let packet = recv_dac_packet(&mut dac);
        if i16::from_le_bytes([packet[0], packet[1]]) == expected {
            observed = true;
            break;
        }
    }
    assert!(observed, "channel_put_data sample never appeared on the DAC wire");

    server.remove_device("127.0.0.1").unwrap();
}

#[test]
fn disconnect_mid_stream_bumps_reconnect_on_recovery() {
    let _guard = port_lock();
    let server = Server::new().unwrap();

    let fake_thread = thread::spawn(FakeDevice::accept);
    server.add_device("127.0.0.1").unwrap();
    let fake = fake_thread.join().unwrap();

    let mut record = sample_record();
    let correction = CorrectionInfo::zeroed();
    let (adc, dac, command_handle) = {
        let mut fake = fake;
        fake.serve_initial_exchange(&mut record, &correction);
        fake.spawn_command_server(record.clone(), correction)
    };

    assert!(wait_until(|| server.get_state("127.0.0.1").unwrap().connected, SETTLE));
    let first_generation = server.get_state("127.0.0.1").unwrap().reconnect;

    // Sever all three sockets out from under the worker; it should notice on
    // its next read/poll and fall back to `Disconnected`.
    drop(adc);
    drop(dac);
    drop(command_handle);

    assert!(wait_until(|| !server.get_state("127.0.0.1").unwrap().connected, SETTLE));

    // Bring the fake device back up on the same ports and let the worker's
    // retry loop find it.
    let fake_thread = thread::spawn(FakeDevice::accept);
    let mut fake = fake_thread.join().unwrap();
    let mut record = sample_record();
    fake.serve_initial_exchange(&mut record, &correction);

    assert!(wait_until(|| server.get_state("127.0.0.1").unwrap().connected, SETTLE));
    let second_generation = server.get_state("127.0.0.1").unwrap().reconnect;
    assert!(second_generation > first_generation);

    server.remove_device("127.0.0.1").unwrap();
}

#[test]
fn stop_runs_the_full_putinfo_drain_putinfo_handshake() {
    use std::io::Read;
    use zet017_core::codec::{CommandPacket, DeviceInfoRecord, CMD_GET_INFO, CMD_PUT_INFO, CMD_READ_CORRECTION};

    let _guard = port_lock();
    let server = Server::new().unwrap();

    let fake_thread = thread::spawn(FakeDevice::accept);
    server.add_device("127.0.0.1").unwrap();
    let mut fake = fake_thread.join().unwrap();

    let mut record = sample_record();
    let correction = CorrectionInfo::zeroed();
    fake.serve_initial_exchange(&mut record, &correction);
    let FakeDevice { mut command, mut adc, dac: _dac } = fake;

    assert!(wait_until(|| server.get_state("127.0.0.1").unwrap().connected, SETTLE));

    // Serve the rest of the command stream by hand so the test can observe
    // exactly what each PutInfo request carries, instead of an opaque echo.
    let (seen_tx, seen_rx) = std::sync::mpsc::channel();
    let command_thread = thread::spawn(move || {
        let mut record = record;
        loop {
            let mut buf = [0u8; PACKET_SIZE];
            if command.read_exact(&mut buf).is_err() {
                return;
            }
            let code = u16::from_le_bytes([buf[0], buf[1]]);
            let mut out = [0u8; PACKET_SIZE];
            match code {
                CMD_GET_INFO => record.encode_into(&mut out),
                CMD_PUT_INFO => {
                    record = DeviceInfoRecord::decode(&buf);
                    let _ = seen_tx.send((record.start_adc, record.start_dac));
                    record.encode_into(&mut out);
                }
                CMD_READ_CORRECTION => {
                    let mut response = CommandPacket::zeroed();
                    response.command = CMD_READ_CORRECTION;
                    response.size = CorrectionInfo::ENCODED_SIZE as u32;
                    response.encode_into(&mut out);
                }
                _ => return,
            }
            if command.write_all(&out).is_err() {
                return;
            }
        }
    });

    server.start("127.0.0.1", true).unwrap();

    // Feed the ADC drain an all-zero packet shortly after issuing the stop,
    // so `perform_stop_sequence` sees it and completes inside its deadline.
    let zero_feeder = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        let zero = [0u8; PACKET_SIZE];
        let _ = adc.write_all(&zero);
    });

    server.stop("127.0.0.1").unwrap();
    zero_feeder.join().unwrap();

    // The handshake is exactly two PutInfo calls: stop-request
    // (start_adc=-1) then stop-confirm (start_adc=0).
    let first = seen_rx.recv_timeout(SETTLE).unwrap();
    assert_eq!(first.0, -1);
    let second = seen_rx.recv_timeout(SETTLE).unwrap();
    assert_eq!(second.0, 0);
    assert_eq!(second.1, 0);

    server.remove_device("127.0.0.1").unwrap();
    drop(command_thread);
}
