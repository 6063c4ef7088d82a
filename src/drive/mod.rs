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

    src/drive/mod.rs

    The sector-oriented drive contract and the factory choosing between a
    physical drive on the bus and a flat disc-image file. Physical sectors
    on a 1541 are addressed by (track, sector); this interface abstracts
    that away behind a 0-based linear sector index.
*/

pub mod cbm1541;
pub mod d64;

use std::sync::Arc;

use crate::{
    bus::IecBusConnection,
    drive::{
        cbm1541::{Cbm1541Drive, DriveConfig},
        d64::ImageDrive,
    },
    transport::BusTransport,
    IecError, IecResult,
};

/// A sector-oriented disk drive.
///
/// Implementations are not reentrant; callers serialize all access to one
/// drive instance.
pub trait Drive {
    /// Physically format the disc. This does not put logical structure
    /// (BAM, directory) onto the disc. C64 floppies may carry up to 41
    /// tracks; the standard is 35.
    fn format_low_level(&mut self, num_tracks: usize) -> IecResult<()>;

    /// The number of sectors on the current disc.
    fn num_sectors(&mut self) -> IecResult<usize>;

    /// Read the 256-byte sector at the given linear index.
    fn read_sector(&mut self, sector_number: usize) -> IecResult<Vec<u8>>;

    /// Write a 256-byte sector at the given linear index.
    fn write_sector(&mut self, sector_number: usize, content: &[u8]) -> IecResult<()>;

    /// Read the drive's status channel. Always permitted; no open call is
    /// necessary.
    fn read_command_channel(&mut self) -> IecResult<String>;
}

impl std::fmt::Debug for dyn Drive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Drive")
    }
}

/// Build a [`Drive`] from a target specification: a bare device number
/// selects a physical drive on the given bus connection, anything else is
/// treated as the path of a disc-image file.
pub fn open_drive<T: BusTransport>(
    target: &str,
    bus: Option<Arc<IecBusConnection<T>>>,
    config: DriveConfig,
    read_only: bool,
) -> IecResult<Box<dyn Drive>> {
    match target.parse::<u8>() {
        Ok(device) => {
            let bus = bus.ok_or_else(|| {
                IecError::InvalidArgument(format!(
                    "open_drive: device {} requested without a bus connection",
                    device
                ))
            })?;
            Ok(Box::new(Cbm1541Drive::new(bus, device, config)))
        }
        Err(_) => Ok(Box::new(ImageDrive::new(target, read_only))),
    }
}
