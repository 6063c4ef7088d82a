/*
    iecfox
    https://github.com/dbalsom/iecfox

    Copyright 2025 Daniel Balsom

    Permission is hereby granted, free of charge, to any person obtaining a
    copy of this software and associated documentation files (the “Software”),
    to deal in the Software without restriction, including without limitation
    the rights to use, copy, modify, merge, publish, distribute, sublicense,
    and/or sell copies of the Software, and to permit persons to whom the
    Software is furnished to do so, subject to the following conditions:

    The above copyright notice and this permission notice shall be included in
    all copies or substantial portions of the Software.

    THE SOFTWARE IS PROVIDED “AS IS”, WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
    IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
    FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
    AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
    LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
    FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
    DEALINGS IN THE SOFTWARE.

    --------------------------------------------------------------------------

    tests/drive.rs

    CBM 1541 controller tests against the fake bridge: firmware upload
    bookkeeping, sector I/O command sequences, and argument checking.
*/

mod common;

use std::{collections::HashMap, os::unix::net::UnixStream, sync::Arc};

use common::*;
use iecfox::prelude::*;

const DEVICE: u8 = 8;

/// Payload of a command-channel write frame (`w` + device + 15 + length).
fn command_payload(frame: &[u8]) -> Option<&[u8]> {
    if frame.len() >= 4 && frame[0] == b'w' && frame[2] == 15 {
        Some(&frame[4..])
    } else {
        None
    }
}

fn count_mw(requests: &[Vec<u8>]) -> usize {
    requests
        .iter()
        .filter(|r| command_payload(r).is_some_and(|p| p.starts_with(b"M-W")))
        .count()
}

fn count_me(requests: &[Vec<u8>]) -> usize {
    requests
        .iter()
        .filter(|r| command_payload(r).is_some_and(|p| p.starts_with(b"M-E")))
        .count()
}

fn connect(responses: HashMap<Vec<u8>, Vec<u8>>) -> (FakeBridge, Arc<IecBusConnection<UnixStream>>) {
    let (near, far) = UnixStream::pair().unwrap();
    let bridge = FakeBridge::spawn(far, b"connect_arduino:3\r", b"", responses);
    let conn = IecBusConnection::create(near, default_log_sink(), BridgeConfig::default()).unwrap();
    (bridge, Arc::new(conn))
}

fn command_channel_ok() -> HashMap<Vec<u8>, Vec<u8>> {
    let mut responses = HashMap::new();
    responses.insert(vec![b'g', DEVICE, 15], ok_response());
    responses
}

#[test]
fn format_uploads_firmware_then_executes() {
    init();
    let (bridge, conn) = connect(command_channel_ok());
    let mut drive = Cbm1541Drive::new(conn.clone(), DEVICE, test_drive_config());

    drive.format_low_level(35).unwrap();

    let requests = bridge.requests_snapshot();
    // The 40-byte format fragment needs two M-W chunks (35 + 5), followed
    // by exactly one M-E at the entry point.
    assert_eq!(count_mw(&requests), 2);
    assert_eq!(count_me(&requests), 1);
    for request in &requests {
        if let Some(payload) = command_payload(request) {
            if payload.starts_with(b"M-W") {
                // M-W + addr lo/hi + count + data, data capped at 35 bytes.
                assert!(payload.len() <= 3 + 2 + 1 + 35, "oversized M-W: {}", payload.len());
                assert_eq!(payload[5] as usize, payload.len() - 6);
            }
            if payload.starts_with(b"M-E") {
                assert_eq!(&payload[3..], &[0x03, 0x05], "entry point mismatch");
            }
        }
    }
}

#[test]
fn format_with_resident_firmware_skips_upload() {
    init();
    let (bridge, conn) = connect(command_channel_ok());
    let mut drive = Cbm1541Drive::new(conn.clone(), DEVICE, test_drive_config());

    drive.format_low_level(35).unwrap();
    let after_first = bridge.requests_snapshot().len();
    drive.format_low_level(35).unwrap();

    let requests = bridge.requests_snapshot();
    let second: Vec<Vec<u8>> = requests[after_first..].to_vec();
    // The formatting fragment is already resident: one M-E, no M-W chunks.
    assert_eq!(count_mw(&second), 0);
    assert_eq!(count_me(&second), 1);
}

#[test]
fn failed_upload_forces_reupload() {
    init();
    // First command-channel read reports a write-protect error; the drive
    // controller must not believe the fragment is resident afterwards.
    let mut responses = HashMap::new();
    responses.insert(
        vec![b'g', DEVICE, 15],
        response_frame(b"26,WRITE PROTECT ON,00,00\r"),
    );
    let (bridge, conn) = connect(responses);
    let mut drive = Cbm1541Drive::new(conn.clone(), DEVICE, test_drive_config());

    let err = drive.format_low_level(35).unwrap_err();
    assert!(matches!(err, IecError::DriveError(_)), "{}", err);
    let uploads_after_failure = count_mw(&bridge.requests_snapshot());
    assert_eq!(uploads_after_failure, 1, "upload should stop at the failed chunk");
}

#[test]
fn write_sector_rejects_bad_length_without_io() {
    init();
    let (bridge, conn) = connect(HashMap::new());
    let mut drive = Cbm1541Drive::new(conn.clone(), DEVICE, test_drive_config());

    let err = drive.write_sector(0, &[0u8; 255]).unwrap_err();
    assert!(matches!(err, IecError::InvalidArgument(_)), "{}", err);
    assert!(bridge.requests_snapshot().is_empty());
}

#[test]
fn sector_access_rejects_tracks_past_the_ceiling() {
    init();
    let (bridge, conn) = connect(HashMap::new());
    let mut drive = Cbm1541Drive::new(conn.clone(), DEVICE, test_drive_config());

    // Linear sector 785 sits on track 42, one past the hardware ceiling.
    let err = drive.read_sector(785).unwrap_err();
    assert!(matches!(err, IecError::InvalidArgument(_)), "{}", err);
    let err = drive.write_sector(785, &[0u8; 256]).unwrap_err();
    assert!(matches!(err, IecError::InvalidArgument(_)), "{}", err);
    assert!(bridge.requests_snapshot().is_empty());
}

#[test]
fn sector_access_rejects_indices_whose_track_overflows_a_byte() {
    init();
    let (bridge, conn) = connect(HashMap::new());
    let mut drive = Cbm1541Drive::new(conn.clone(), DEVICE, test_drive_config());

    // Linear sector 4423 sits on track 256. Were the track narrowed to a
    // byte it would wrap to 0 and sail past the ceiling check.
    let err = drive.read_sector(4423).unwrap_err();
    assert!(matches!(err, IecError::InvalidArgument(_)), "{}", err);
    let err = drive.write_sector(4423, &[0u8; 256]).unwrap_err();
    assert!(matches!(err, IecError::InvalidArgument(_)), "{}", err);
    assert!(bridge.requests_snapshot().is_empty());
}

#[test]
fn read_sector_round_trip() {
    init();
    let sector: Vec<u8> = (0..=255).collect();
    let mut responses = command_channel_ok();
    responses.insert(vec![b'g', DEVICE, 3], response_frame(&sector));
    let (bridge, conn) = connect(responses);
    let mut drive = Cbm1541Drive::new(conn.clone(), DEVICE, test_drive_config());

    let content = drive.read_sector(0).unwrap();
    assert_eq!(content, sector);

    let requests = bridge.requests_snapshot();
    // Read/write firmware upload (70 bytes -> two chunks), both direct
    // access channels opened with their buffers, then the read job.
    assert_eq!(count_mw(&requests), 2);
    assert_eq!(count_me(&requests), 1);
    assert!(requests.contains(&b"o\x08\x02\x02#1".to_vec()));
    assert!(requests.contains(&b"o\x08\x03\x02#3".to_vec()));
    assert!(requests
        .iter()
        .any(|r| command_payload(r).is_some_and(|p| p == b"B-P:3 0")));

    // Dropping the controller closes the direct access channels.
    drop(drive);
    let requests = bridge.requests.clone();
    drop(conn);
    drop(bridge);
    let requests = requests.lock().unwrap().clone();
    assert!(requests.contains(&vec![b'c', DEVICE, 2]));
    assert!(requests.contains(&vec![b'c', DEVICE, 3]));
}

#[test]
fn write_sector_sends_content_then_commits() {
    init();
    let sector = vec![0x5au8; 256];
    let (bridge, conn) = connect(command_channel_ok());
    let mut drive = Cbm1541Drive::new(conn.clone(), DEVICE, test_drive_config());

    drive.write_sector(357, &sector).unwrap();

    let requests = bridge.requests_snapshot();
    // 256 bytes of sector data to channel 2, split across two frames.
    let data_frames: Vec<_> = requests.iter().filter(|r| r.len() >= 3 && r[0] == b'w' && r[2] == 2).collect();
    assert_eq!(data_frames.len(), 2);
    assert_eq!(data_frames[0][3], 255);
    assert_eq!(data_frames[1][3], 1);
    // The commit names track 18, sector 0, write option 1.
    let me: Vec<_> = requests
        .iter()
        .filter_map(|r| command_payload(r))
        .filter(|p| p.starts_with(b"M-E"))
        .collect();
    assert_eq!(me.len(), 1);
    assert_eq!(&me[0][3..], &[0x03, 0x05, 18, 0, 1]);
}

#[test]
fn drive_error_response_is_surfaced() {
    init();
    let mut responses = HashMap::new();
    responses.insert(
        vec![b'g', DEVICE, 15],
        response_frame(b"21,READ ERROR,18,00\r"),
    );
    let (_bridge, conn) = connect(responses);
    let mut drive = Cbm1541Drive::new(conn.clone(), DEVICE, test_drive_config());

    let err = drive.format_low_level(35).unwrap_err();
    match err {
        IecError::DriveError(message) => assert_eq!(message, "21,READ ERROR,18,00"),
        other => panic!("expected DriveError, got {}", other),
    }
}

#[test]
fn command_channel_read_needs_no_open() {
    init();
    let (bridge, conn) = connect(command_channel_ok());
    let mut drive = Cbm1541Drive::new(conn.clone(), DEVICE, test_drive_config());

    let status = drive.read_command_channel().unwrap();
    assert_eq!(status, "00, OK,00,00\r");
    let requests = bridge.requests_snapshot();
    assert!(requests.iter().all(|r| r[0] != b'o'), "no open call expected");
}
