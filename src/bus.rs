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

    src/bus.rs

    The connection to the IEC bus through the bridge microcontroller.
    Performs the versioned handshake, then hands the transport's read side
    to a dispatch thread which demultiplexes bridge-originated log traffic
    from response data. Bus commands are serialized onto the write side;
    the one synchronous request/response pair (channel reads) is correlated
    through a queue fed by the dispatch thread, so exactly one thread ever
    drains the transport.
*/

use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc, Mutex,
    },
    thread::{self, JoinHandle},
};

use crate::{
    buffer::{write_all, BufferedPort, MAX_READ_AHEAD},
    transport::BusTransport,
    util::unescape,
    IecError, IecResult, RESPONSE_TERMINATOR,
};

/// The banner the bridge sends when it comes up, followed by its decimal
/// protocol version and a carriage return.
const HANDSHAKE_PREFIX: &[u8] = b"connect_arduino:";

/// The `o` and `w` frames carry a single length byte, bounding the payload
/// of one frame.
const MAX_FRAME_DATA: usize = 255;

/// Callback invoked for every log message the bridge sends: severity
/// character ('S', 'I', 'W' or 'E'), facility name, message text. Called
/// from the dispatch thread.
pub type LogSink = Arc<dyn Fn(char, &str, &str) + Send + Sync>;

/// A [`LogSink`] forwarding bridge log messages to the `log` facade.
pub fn default_log_sink() -> LogSink {
    Arc::new(|severity, facility, message| {
        let level = match severity {
            'E' => log::Level::Error,
            'W' => log::Level::Warn,
            'I' => log::Level::Info,
            _ => log::Level::Debug,
        };
        log::log!(level, "bridge[{}]: {}", facility, message);
    })
}

/// Connection parameters sent to the bridge during the handshake, plus the
/// handshake policy itself.
#[derive(Clone, Debug)]
pub struct BridgeConfig {
    /// IEC device number the bridge itself answers to in device mode.
    pub device: u8,
    pub atn_pin: u8,
    pub clock_pin: u8,
    pub data_pin: u8,
    pub reset_pin: u8,
    pub srq_in_pin: u8,
    /// Lowest bridge protocol version this host can talk to.
    pub min_protocol_version: u32,
    /// How many non-banner lines to tolerate before giving up on the
    /// handshake. The bridge may emit stray output while it boots.
    pub handshake_retries: u32,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            device: 8,
            atn_pin: 5,
            clock_pin: 4,
            data_pin: 3,
            reset_pin: 7,
            srq_in_pin: 2,
            min_protocol_version: 3,
            handshake_retries: 10,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum ConnectionState {
    Created,
    Handshaking,
    Ready,
    ShuttingDown,
    Closed,
}

/// A live connection to the bridge.
///
/// Constructed over any [`BusTransport`]; [`IecBusConnection::create`]
/// builds and initializes in one step. Command methods take `&self` so a
/// connection can be shared behind an `Arc` once it is ready; competing
/// writers are serialized internally.
pub struct IecBusConnection<T: BusTransport> {
    transport: Arc<T>,
    config: BridgeConfig,
    log_sink: LogSink,
    state: ConnectionState,
    /// Owns the transport's read side until the dispatch thread takes it.
    port: Option<BufferedPort<T>>,
    dispatch: Option<JoinHandle<()>>,
    /// Unescaped `r`-frame payloads (or their decode failures), in
    /// arrival order.
    responses: Option<Mutex<mpsc::Receiver<IecResult<Vec<u8>>>>>,
    shutdown: Arc<AtomicBool>,
    /// Serializes request frames from competing command issuers.
    write_lock: Mutex<()>,
}

impl<T: BusTransport> fmt::Debug for IecBusConnection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IecBusConnection")
            .field("config", &self.config)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl<T: BusTransport> IecBusConnection<T> {
    /// Wrap a transport. The connection is not usable until
    /// [`initialize`](Self::initialize) has completed the handshake.
    pub fn new(transport: T, log_sink: LogSink, config: BridgeConfig) -> Self {
        let transport = Arc::new(transport);
        let port = BufferedPort::new(transport.clone());
        Self {
            transport,
            config,
            log_sink,
            state: ConnectionState::Created,
            port: Some(port),
            dispatch: None,
            responses: None,
            shutdown: Arc::new(AtomicBool::new(false)),
            write_lock: Mutex::new(()),
        }
    }

    /// Construct a connection and run the handshake; the returned
    /// connection is ready for commands.
    pub fn create(transport: T, log_sink: LogSink, config: BridgeConfig) -> IecResult<Self> {
        let mut conn = Self::new(transport, log_sink, config);
        conn.initialize()?;
        Ok(conn)
    }

    /// Perform the handshake with the bridge and start the dispatch thread.
    ///
    /// Reads terminated lines until one carries the `connect_arduino:`
    /// banner (bounded by the configured retry budget), checks the
    /// advertised protocol version, and answers with the pin configuration
    /// line. Only after that does the connection become ready.
    pub fn initialize(&mut self) -> IecResult<()> {
        if self.state != ConnectionState::Created {
            return Err(IecError::InvalidArgument(format!(
                "initialize: connection already initialized (state {:?})",
                self.state
            )));
        }
        self.state = ConnectionState::Handshaking;

        let mut port = match self.port.take() {
            Some(port) => port,
            None => {
                return Err(IecError::BusConnectionFailure("initialize: no transport".to_string()));
            }
        };

        let mut version = None;
        for _ in 0..self.config.handshake_retries {
            let line = port.read_terminated(RESPONSE_TERMINATOR, MAX_READ_AHEAD)?;
            if let Some(rest) = line.strip_prefix(HANDSHAKE_PREFIX) {
                match std::str::from_utf8(rest).ok().and_then(|v| v.trim().parse::<u32>().ok()) {
                    Some(v) => {
                        version = Some(v);
                        break;
                    }
                    None => {
                        log::warn!(
                            "handshake: malformed version in banner '{}'",
                            String::from_utf8_lossy(&line)
                        );
                    }
                }
            } else {
                log::debug!("handshake: ignoring '{}'", String::from_utf8_lossy(&line));
            }
        }
        let version = version.ok_or_else(|| {
            IecError::BusConnectionFailure(format!(
                "handshake: no connect banner within {} lines",
                self.config.handshake_retries
            ))
        })?;
        if version < self.config.min_protocol_version {
            return Err(IecError::BusConnectionFailure(format!(
                "handshake: bridge protocol version {} < minimum supported {}",
                version, self.config.min_protocol_version
            )));
        }
        log::info!("connected to bridge, protocol version {}", version);

        let now = chrono::Local::now();
        let config_line = format!(
            "OK>{}|{}|{}|{}|{}|{}|{}\r",
            self.config.device,
            self.config.atn_pin,
            self.config.clock_pin,
            self.config.data_pin,
            self.config.reset_pin,
            self.config.srq_in_pin,
            now.format("%Y-%m-%d.%H:%M:%S"),
        );
        port.write_all(config_line.as_bytes())?;

        let (response_tx, response_rx) = mpsc::channel();
        let log_sink = self.log_sink.clone();
        let shutdown = self.shutdown.clone();
        let handle = thread::Builder::new()
            .name("iec-dispatch".to_string())
            .spawn(move || dispatch_loop(port, response_tx, log_sink, shutdown))
            .map_err(|e| IecError::io("spawn dispatch thread", &e))?;

        self.dispatch = Some(handle);
        self.responses = Some(Mutex::new(response_rx));
        self.state = ConnectionState::Ready;
        Ok(())
    }

    /// Reset the IEC bus by pulsing the reset line.
    pub fn reset(&self) -> IecResult<()> {
        self.send_request(&[b'r'])
    }

    /// Open a channel on a device, sending `data` (a filename or buffer
    /// command) along with the open.
    pub fn open_channel(&self, device: u8, channel: u8, data: &[u8]) -> IecResult<()> {
        if data.len() > MAX_FRAME_DATA {
            return Err(IecError::InvalidArgument(format!(
                "open_channel: data length {} > {}",
                data.len(),
                MAX_FRAME_DATA
            )));
        }
        let mut request = Vec::with_capacity(4 + data.len());
        request.extend_from_slice(&[b'o', device, channel, data.len() as u8]);
        request.extend_from_slice(data);
        self.send_request(&request)
    }

    /// Request a read from a channel and block until the bridge returns the
    /// response payload. This is the only command that waits for a
    /// correlated response.
    pub fn read_from_channel(&self, device: u8, channel: u8) -> IecResult<Vec<u8>> {
        self.ensure_ready("read_from_channel")?;
        let responses = match self.responses.as_ref() {
            Some(responses) => responses,
            None => {
                return Err(IecError::BusConnectionFailure(
                    "read_from_channel: no dispatch thread".to_string(),
                ));
            }
        };
        // Holding the receiver across request + reply keeps one request in
        // flight at a time, so the next payload is ours.
        let rx = responses
            .lock()
            .map_err(|_| IecError::BusConnectionFailure("read_from_channel: poisoned lock".to_string()))?;
        while let Ok(stale) = rx.try_recv() {
            match stale {
                Ok(payload) => {
                    log::warn!("read_from_channel: dropping {} stale response bytes", payload.len());
                }
                Err(e) => log::warn!("read_from_channel: dropping stale response error: {}", e),
            }
        }
        self.send_request(&[b'g', device, channel])?;
        rx.recv().map_err(|_| {
            IecError::BusConnectionFailure("read_from_channel: dispatch thread terminated".to_string())
        })?
    }

    /// Write data to an open channel. Frames carry a single length byte, so
    /// payloads larger than 255 bytes are split across several frames.
    pub fn write_to_channel(&self, device: u8, channel: u8, data: &[u8]) -> IecResult<()> {
        self.ensure_ready("write_to_channel")?;
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| IecError::BusConnectionFailure("write_to_channel: poisoned lock".to_string()))?;
        for chunk in data.chunks(MAX_FRAME_DATA) {
            let mut request = Vec::with_capacity(4 + chunk.len());
            request.extend_from_slice(&[b'w', device, channel, chunk.len() as u8]);
            request.extend_from_slice(chunk);
            write_all(self.transport.as_ref(), &request)?;
        }
        Ok(())
    }

    /// Close a channel on a device.
    pub fn close_channel(&self, device: u8, channel: u8) -> IecResult<()> {
        self.send_request(&[b'c', device, channel])
    }

    /// Shut the connection down: stop the dispatch thread by shutting down
    /// the transport under it, and join it before the transport is dropped.
    /// Also runs on drop; calling it twice is harmless.
    pub fn close(&mut self) {
        if matches!(self.state, ConnectionState::Closed) {
            return;
        }
        self.state = ConnectionState::ShuttingDown;
        self.shutdown.store(true, Ordering::SeqCst);
        if let Err(e) = self.transport.shutdown() {
            log::warn!("close: transport shutdown failed: {}", e);
        }
        if let Some(handle) = self.dispatch.take() {
            if handle.join().is_err() {
                log::error!("close: dispatch thread panicked");
            }
        }
        self.state = ConnectionState::Closed;
    }

    fn ensure_ready(&self, context: &str) -> IecResult<()> {
        if self.state != ConnectionState::Ready {
            return Err(IecError::BusConnectionFailure(format!(
                "{}: connection not ready (state {:?})",
                context, self.state
            )));
        }
        Ok(())
    }

    fn send_request(&self, request: &[u8]) -> IecResult<()> {
        self.ensure_ready("send_request")?;
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| IecError::BusConnectionFailure("send_request: poisoned lock".to_string()))?;
        write_all(self.transport.as_ref(), request)
    }
}

impl<T: BusTransport> Drop for IecBusConnection<T> {
    fn drop(&mut self) {
        self.close();
    }
}

/// The dispatch thread: sole reader of the transport for the lifetime of
/// the connection. Reads one tag byte, then the terminated remainder of the
/// message, and routes it: facility registrations update the local channel
/// map, debug messages go to the log sink, response data goes to the
/// correlation queue. Unknown tags are skipped. Any read error ends the
/// thread; after a requested shutdown that is the expected exit path.
fn dispatch_loop<T: BusTransport>(
    mut port: BufferedPort<T>,
    responses: mpsc::Sender<IecResult<Vec<u8>>>,
    log_sink: LogSink,
    shutdown: Arc<AtomicBool>,
) {
    let mut channel_map: HashMap<u8, String> = HashMap::new();

    let exit = |err: IecError, shutdown: &AtomicBool| {
        if shutdown.load(Ordering::SeqCst) {
            log::debug!("dispatch: exiting after shutdown: {}", err);
        } else {
            log::error!("dispatch: exiting on transport error: {}", err);
        }
    };

    loop {
        let tag = match port.read_upto(1, 1) {
            Ok(bytes) => bytes[0],
            Err(e) => return exit(e, &shutdown),
        };
        match tag {
            b'!' => {
                let line = match port.read_terminated(RESPONSE_TERMINATOR, MAX_READ_AHEAD) {
                    Ok(line) => line,
                    Err(e) => return exit(e, &shutdown),
                };
                if line.is_empty() {
                    log::warn!("dispatch: empty facility registration");
                    continue;
                }
                let name = String::from_utf8_lossy(&line[1..]).to_string();
                log::trace!("dispatch: channel '{}' registered as '{}'", line[0] as char, name);
                channel_map.insert(line[0], name);
            }
            b'D' => {
                let line = match port.read_terminated(RESPONSE_TERMINATOR, MAX_READ_AHEAD) {
                    Ok(line) => line,
                    Err(e) => return exit(e, &shutdown),
                };
                if line.len() < 2 {
                    log::warn!("dispatch: malformed debug message: '{}'", String::from_utf8_lossy(&line));
                    continue;
                }
                let severity = line[0] as char;
                let message = String::from_utf8_lossy(&line[2..]);
                match channel_map.get(&line[1]) {
                    Some(facility) => log_sink(severity, facility, &message),
                    None => {
                        // Malformed but non-fatal; surface it without a name.
                        log::warn!(
                            "dispatch: debug message for unregistered channel '{}': {}",
                            line[1] as char,
                            message
                        );
                    }
                }
            }
            b'r' => {
                let line = match port.read_terminated(RESPONSE_TERMINATOR, MAX_READ_AHEAD) {
                    Ok(line) => line,
                    Err(e) => return exit(e, &shutdown),
                };
                let payload = match unescape(&line) {
                    Ok(payload) => {
                        log::trace!("dispatch: {} byte response payload", payload.len());
                        Ok(payload)
                    }
                    Err(e) => {
                        // A waiting request must see this failure; silence
                        // here would leave it blocked forever.
                        log::warn!("dispatch: undecodable response payload: {}", e);
                        Err(IecError::ConnectionFailure(format!(
                            "undecodable response payload: {}",
                            e
                        )))
                    }
                };
                if responses.send(payload).is_err() {
                    // Receiver is gone; the connection is going away.
                    log::debug!("dispatch: response receiver dropped");
                }
            }
            other => {
                log::trace!("dispatch: ignoring message tag {:#04x}", other);
            }
        }
    }
}
