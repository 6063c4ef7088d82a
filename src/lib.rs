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

    src/lib.rs

    iecfox talks to Commodore serial-bus (IEC) disk drives from a host
    computer, either through an Arduino bridge speaking the uno2iec serial
    protocol, or through flat disc-image files presenting the same
    sector-oriented abstraction.
*/

pub mod buffer;
pub mod bus;
pub mod drive;
pub mod geometry;
pub mod transport;
pub mod util;

use std::io;

use thiserror::Error;

/// All Commodore drives supported here use 256-byte sectors.
pub const SECTOR_SIZE: usize = 256;

/// Channel 15 is the drive's command channel. It accepts control commands
/// and returns status/error text, and may be read without an open call.
pub const COMMAND_CHANNEL: u8 = 15;

/// Bridge-originated messages are terminated by a carriage return.
pub const RESPONSE_TERMINATOR: u8 = b'\r';

/// The error type threaded through every fallible operation in the crate.
/// Each variant carries a human-readable context message; callers match on
/// the variant to decide how to react.
#[derive(Debug, Error)]
pub enum IecError {
    #[error("Unimplemented: {0}")]
    Unimplemented(String),
    /// The serial transport to the bridge failed or framing was violated.
    #[error("Connection failure: {0}")]
    ConnectionFailure(String),
    /// The caller violated an interface contract (bad lengths, bad bounds).
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    /// The bus-level protocol to the bridge failed (handshake, dispatch).
    #[error("IEC connection failure: {0}")]
    BusConnectionFailure(String),
    /// The drive responded, but reported a logical failure. The message is
    /// the drive's own status text.
    #[error("Drive error: {0}")]
    DriveError(String),
    /// Clean end of input; only produced by the image-file backend.
    #[error("End of file")]
    EndOfFile,
}

impl IecError {
    /// Compose a `ConnectionFailure` from an operation name and the
    /// underlying I/O error.
    pub(crate) fn io(context: &str, e: &io::Error) -> IecError {
        IecError::ConnectionFailure(format!("{}: {}", context, e))
    }
}

pub type IecResult<T> = Result<T, IecError>;

pub mod prelude {
    pub use crate::{
        buffer::{BufferedPort, MAX_READ_AHEAD},
        bus::{default_log_sink, BridgeConfig, IecBusConnection},
        drive::{
            cbm1541::{Cbm1541Drive, DriveConfig, FirmwareFragment},
            d64::ImageDrive,
            open_drive, Drive,
        },
        geometry::TrackSector,
        transport::BusTransport,
        IecError, IecResult, COMMAND_CHANNEL, SECTOR_SIZE,
    };
}
