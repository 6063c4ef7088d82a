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

    tests/common/mod.rs

    A fake bridge for integration tests: a background thread on the far end
    of a socketpair that plays the Arduino's part of the protocol. It sends
    the connect banner, accepts the configuration line, optionally emits a
    scripted preamble of unsolicited messages, then parses request frames
    and answers them from a request -> response map, recording every frame
    it sees.
*/
#![allow(dead_code)]

use std::{
    collections::HashMap,
    os::unix::net::UnixStream,
    sync::{Arc, Mutex},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use iecfox::prelude::*;

pub fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Build a terminated, escaped `r` response frame for a payload.
pub fn response_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![b'r'];
    frame.extend_from_slice(&iecfox::util::escape(payload));
    frame.push(b'\r');
    frame
}

/// The drive's canonical OK status, framed as a response followed by the
/// bridge's `s` acknowledgement byte.
pub fn ok_response() -> Vec<u8> {
    let mut frame = response_frame(b"00, OK,00,00\r");
    frame.extend_from_slice(b"s\r");
    frame
}

/// A pair of small synthetic firmware fragments for driving the 1541
/// controller in tests. Sized to need two `M-W` chunks each.
pub fn test_drive_config() -> DriveConfig {
    DriveConfig::new(
        FirmwareFragment::new(vec![0xa9; 40], 0x500, 0x503),
        FirmwareFragment::new(vec![0xea; 70], 0x500, 0x503),
    )
}

/// A log sink capturing bridge log messages for later assertions.
pub type CapturedLogs = Arc<Mutex<Vec<(char, String, String)>>>;

pub fn capture_log_sink() -> (iecfox::bus::LogSink, CapturedLogs) {
    let captured: CapturedLogs = Arc::new(Mutex::new(Vec::new()));
    let sink_captured = captured.clone();
    let sink: iecfox::bus::LogSink = Arc::new(move |severity, facility, message| {
        sink_captured
            .lock()
            .unwrap()
            .push((severity, facility.to_string(), message.to_string()));
    });
    (sink, captured)
}

/// Wait for a captured-logs predicate to become true, or time out.
pub fn wait_for<F: Fn() -> bool>(predicate: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !predicate() {
        assert!(Instant::now() < deadline, "timed out waiting for condition");
        thread::sleep(Duration::from_millis(1));
    }
}

pub struct FakeBridge {
    handle: Option<JoinHandle<()>>,
    /// Every request frame the bridge parsed, in order.
    pub requests: Arc<Mutex<Vec<Vec<u8>>>>,
    /// The configuration line the host sent back during the handshake.
    pub config_line: Arc<Mutex<Option<Vec<u8>>>>,
}

impl FakeBridge {
    /// Spawn a fake bridge on `far`. `banner` is sent verbatim before the
    /// handshake (a well-behaved bridge sends `connect_arduino:<n>\r`);
    /// `preamble` is sent right after the handshake completes.
    pub fn spawn(
        far: UnixStream,
        banner: &[u8],
        preamble: &[u8],
        responses: HashMap<Vec<u8>, Vec<u8>>,
    ) -> FakeBridge {
        let requests: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
        let config_line: Arc<Mutex<Option<Vec<u8>>>> = Arc::new(Mutex::new(None));
        let thread_requests = requests.clone();
        let thread_config_line = config_line.clone();
        let banner = banner.to_vec();
        let preamble = preamble.to_vec();
        let handle = thread::Builder::new()
            .name("fake-bridge".to_string())
            .spawn(move || {
                run_bridge(far, banner, preamble, responses, thread_requests, thread_config_line)
            })
            .unwrap();
        FakeBridge {
            handle: Some(handle),
            requests,
            config_line,
        }
    }

    pub fn requests_snapshot(&self) -> Vec<Vec<u8>> {
        self.requests.lock().unwrap().clone()
    }
}

impl Drop for FakeBridge {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run_bridge(
    far: UnixStream,
    banner: Vec<u8>,
    preamble: Vec<u8>,
    responses: HashMap<Vec<u8>, Vec<u8>>,
    requests: Arc<Mutex<Vec<Vec<u8>>>>,
    config_line: Arc<Mutex<Option<Vec<u8>>>>,
) {
    let mut port = BufferedPort::new(Arc::new(far));
    if port.write_all(&banner).is_err() {
        return;
    }
    // The host closing the socket without answering (e.g. after a rejected
    // handshake) is a normal way for this thread to end.
    let line = match port.read_terminated(b'\r', MAX_READ_AHEAD) {
        Ok(line) => line,
        Err(_) => return,
    };
    *config_line.lock().unwrap() = Some(line);
    if port.write_all(&preamble).is_err() {
        return;
    }

    loop {
        let tag = match port.read_upto(1, 1) {
            Ok(bytes) => bytes[0],
            Err(_) => return,
        };
        // Read the per-command parameters so the frame boundary is known.
        let mut request = vec![tag];
        match tag {
            b'r' => {}
            b'o' | b'w' => {
                let params = match port.read_upto(3, 3) {
                    Ok(params) => params,
                    Err(_) => return,
                };
                let data_len = params[2] as usize;
                request.extend_from_slice(&params);
                if data_len > 0 {
                    match port.read_upto(data_len, data_len) {
                        Ok(data) => request.extend_from_slice(&data),
                        Err(_) => return,
                    }
                }
            }
            b'g' | b'c' => match port.read_upto(2, 2) {
                Ok(params) => request.extend_from_slice(&params),
                Err(_) => return,
            },
            _ => {}
        }
        let response = responses.get(&request).cloned();
        requests.lock().unwrap().push(request);
        if let Some(response) = response {
            if port.write_all(&response).is_err() {
                return;
            }
        }
    }
}
