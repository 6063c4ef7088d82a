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

    src/drive/cbm1541.rs

    Drive implementation on top of a physical CBM 1541 on the bus. The
    stock drive firmware has no fast block read/write or low-level format
    entry points, so small relocatable machine-code fragments are uploaded
    into drive RAM over the command channel and executed there. The
    controller tracks which fragment is resident to avoid re-uploading it
    for every sector.
*/

use std::sync::Arc;

use crate::{
    bus::IecBusConnection, drive::Drive, geometry::TrackSector, transport::BusTransport, IecError,
    IecResult, COMMAND_CHANNEL, SECTOR_SIZE,
};

/// The drive's canonical everything-is-fine status line.
pub const OK_RESPONSE: &[u8] = b"00, OK,00,00\r";

/// Maximum payload of a single `M-W` command.
const MAX_MW_SIZE: usize = 35;

/// Third job parameter of the read/write fragment: read if zero, write
/// otherwise.
const READ_BLOCK: u8 = 0x00;
const WRITE_BLOCK: u8 = 0x01;

/// A relocatable machine-code fragment to be uploaded into drive RAM.
#[derive(Clone, Debug)]
pub struct FirmwareFragment {
    pub code: Vec<u8>,
    /// Address the fragment is assembled for.
    pub load_address: u16,
    /// Address execution starts at; the stock fragments begin with a
    /// three-byte jmp, so this is `load_address + 3`.
    pub entry_point: u16,
}

impl FirmwareFragment {
    pub fn new(code: impl Into<Vec<u8>>, load_address: u16, entry_point: u16) -> FirmwareFragment {
        FirmwareFragment {
            code: code.into(),
            load_address,
            entry_point,
        }
    }
}

/// Configuration of a [`Cbm1541Drive`]: the firmware fragments to upload
/// and the fixed resources they are wired to.
#[derive(Clone, Debug)]
pub struct DriveConfig {
    /// Low-level format routine.
    pub format_code: FirmwareFragment,
    /// Block read/write routine.
    pub read_write_code: FirmwareFragment,
    /// Direct access channel used for writing sector data.
    pub write_channel: u8,
    /// Direct access channel used for reading sector data.
    pub read_channel: u8,
    /// Highest track the drive will be asked to seek to. Going beyond the
    /// physical track range can damage the mechanism.
    pub max_track: u8,
}

impl DriveConfig {
    pub fn new(format_code: FirmwareFragment, read_write_code: FirmwareFragment) -> DriveConfig {
        DriveConfig {
            format_code,
            read_write_code,
            write_channel: 2,
            read_channel: 3,
            max_track: 41,
        }
    }
}

/// Which machine-code fragment currently resides in drive RAM.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum FirmwareState {
    /// Nothing uploaded yet (stock firmware only).
    NoCustomCode,
    /// An upload failed partway; whatever is resident cannot be trusted.
    Unknown,
    FormattingCode,
    ReadWriteCode,
}

/// [`Drive`] implementation on a physical CBM 1541 disk drive, addressed
/// over a live bus connection.
pub struct Cbm1541Drive<T: BusTransport> {
    bus: Arc<IecBusConnection<T>>,
    device: u8,
    config: DriveConfig,
    fw_state: FirmwareState,
    /// Direct access channels, opened lazily at most once per controller.
    write_channel: Option<u8>,
    read_channel: Option<u8>,
}

impl<T: BusTransport> Cbm1541Drive<T> {
    pub fn new(bus: Arc<IecBusConnection<T>>, device: u8, config: DriveConfig) -> Self {
        Self {
            bus,
            device,
            config,
            fw_state: FirmwareState::NoCustomCode,
            write_channel: None,
            read_channel: None,
        }
    }

    /// Make sure the fragment for `target` is resident, uploading it if
    /// necessary. Residency is only recorded once every upload chunk has
    /// been verified; a failed upload leaves the state unknown, forcing a
    /// re-upload on the next selection.
    fn set_firmware_state(&mut self, target: FirmwareState) -> IecResult<()> {
        if self.fw_state == target {
            return Ok(());
        }
        match target {
            FirmwareState::FormattingCode | FirmwareState::ReadWriteCode => {
                self.fw_state = FirmwareState::Unknown;
                let fragment = if target == FirmwareState::FormattingCode {
                    &self.config.format_code
                } else {
                    &self.config.read_write_code
                };
                log::debug!(
                    "uploading {} byte fragment to {:#06x}",
                    fragment.code.len(),
                    fragment.load_address
                );
                self.write_memory(fragment.load_address, &fragment.code)?;
            }
            _ => {}
        }
        self.fw_state = target;
        Ok(())
    }

    /// Upload `source` into drive RAM at `target_address` via chunked `M-W`
    /// commands, checking the drive's status after every chunk.
    fn write_memory(&self, target_address: u16, source: &[u8]) -> IecResult<()> {
        let mut written = 0;
        while written < source.len() {
            let chunk = &source[written..source.len().min(written + MAX_MW_SIZE)];
            let address = target_address.wrapping_add(written as u16);
            let mut request = Vec::with_capacity(6 + chunk.len());
            request.extend_from_slice(b"M-W");
            request.push((address & 0xff) as u8);
            request.push((address >> 8) as u8);
            request.push(chunk.len() as u8);
            request.extend_from_slice(chunk);
            self.bus.write_to_channel(self.device, COMMAND_CHANNEL, &request)?;
            self.expect_ok()?;
            written += chunk.len();
        }
        Ok(())
    }

    /// Issue an `M-E` (execute at address) command with optional job
    /// arguments appended.
    fn execute(&self, entry_point: u16, args: &[u8]) -> IecResult<()> {
        let mut request = Vec::with_capacity(5 + args.len());
        request.extend_from_slice(b"M-E");
        request.push((entry_point & 0xff) as u8);
        request.push((entry_point >> 8) as u8);
        request.extend_from_slice(args);
        self.bus.write_to_channel(self.device, COMMAND_CHANNEL, &request)
    }

    /// Read the command channel and fail with `DriveError` (carrying the
    /// drive's status text) unless it reports OK.
    fn expect_ok(&self) -> IecResult<()> {
        let response = self.bus.read_from_channel(self.device, COMMAND_CHANNEL)?;
        if response != OK_RESPONSE {
            return Err(IecError::DriveError(
                String::from_utf8_lossy(&response).trim_end_matches('\r').to_string(),
            ));
        }
        Ok(())
    }

    fn check_track(&self, ts: TrackSector, operation: &str) -> IecResult<()> {
        if ts.track > self.config.max_track as usize {
            return Err(IecError::InvalidArgument(format!(
                "not trying to {} track {} as it might cause hardware damage",
                operation, ts.track
            )));
        }
        Ok(())
    }

    /// Open both direct access channels if they haven't been opened yet.
    /// Each open is followed by a buffer-pointer reset.
    fn init_direct_access_channels(&mut self) -> IecResult<()> {
        if self.write_channel.is_none() {
            self.open_channel_with_buffer(self.config.write_channel, 1)?;
            self.write_channel = Some(self.config.write_channel);
        }
        if self.read_channel.is_none() {
            self.open_channel_with_buffer(self.config.read_channel, 3)?;
            self.read_channel = Some(self.config.read_channel);
        }
        Ok(())
    }

    fn open_channel_with_buffer(&self, channel: u8, buffer: u8) -> IecResult<()> {
        self.bus
            .open_channel(self.device, channel, format!("#{}", buffer).as_bytes())?;
        // Set the buffer pointer to the beginning of the buffer.
        self.reposition_buffer_pointer(channel)
    }

    fn reposition_buffer_pointer(&self, channel: u8) -> IecResult<()> {
        let command = format!("B-P:{} 0", channel);
        self.bus.write_to_channel(self.device, COMMAND_CHANNEL, command.as_bytes())
    }
}

impl<T: BusTransport> Drive for Cbm1541Drive<T> {
    fn format_low_level(&mut self, _num_tracks: usize) -> IecResult<()> {
        // TODO: pass num_tracks through to the format routine.
        self.set_firmware_state(FirmwareState::FormattingCode)?;
        self.execute(self.config.format_code.entry_point, &[])?;
        self.expect_ok()
    }

    fn num_sectors(&mut self) -> IecResult<usize> {
        // Hardcoded 35-track disc; 40-track discs would have 768.
        Ok(683)
    }

    fn read_sector(&mut self, sector_number: usize) -> IecResult<Vec<u8>> {
        let ts = TrackSector::from_linear(sector_number);
        self.check_track(ts, "read from")?;
        self.set_firmware_state(FirmwareState::ReadWriteCode)?;
        self.init_direct_access_channels()?;

        // check_track has bounded the track, so the narrowing is lossless.
        self.execute(
            self.config.read_write_code.entry_point,
            &[ts.track as u8, ts.sector as u8, READ_BLOCK],
        )?;
        // The block read job leaves the channel's buffer pointer wherever
        // it stopped; rewind it before draining the buffer.
        self.reposition_buffer_pointer(self.config.read_channel)?;

        let content = self.bus.read_from_channel(self.device, self.config.read_channel)?;
        if content.len() != SECTOR_SIZE {
            return Err(IecError::DriveError(format!(
                "read_sector: expected {} bytes from channel {}, got {}",
                SECTOR_SIZE,
                self.config.read_channel,
                content.len()
            )));
        }
        self.expect_ok()?;
        Ok(content)
    }

    fn write_sector(&mut self, sector_number: usize, content: &[u8]) -> IecResult<()> {
        if content.len() != SECTOR_SIZE {
            return Err(IecError::InvalidArgument(format!(
                "content length {} != sector size {}",
                content.len(),
                SECTOR_SIZE
            )));
        }
        let ts = TrackSector::from_linear(sector_number);
        self.check_track(ts, "write to")?;
        self.set_firmware_state(FirmwareState::ReadWriteCode)?;
        self.init_direct_access_channels()?;

        // Fill the drive-side buffer, then commit it to disc.
        self.bus
            .write_to_channel(self.device, self.config.write_channel, content)?;
        self.execute(
            self.config.read_write_code.entry_point,
            &[ts.track as u8, ts.sector as u8, WRITE_BLOCK],
        )?;
        self.expect_ok()
    }

    fn read_command_channel(&mut self) -> IecResult<String> {
        // Accessing the command channel is always ok, no open call necessary.
        let response = self.bus.read_from_channel(self.device, COMMAND_CHANNEL)?;
        Ok(String::from_utf8_lossy(&response).to_string())
    }
}

impl<T: BusTransport> Drop for Cbm1541Drive<T> {
    fn drop(&mut self) {
        // Close any direct access channel that was opened. There is no
        // recovery path for a failed close during teardown; log and move on.
        for channel in [self.write_channel.take(), self.read_channel.take()].into_iter().flatten() {
            if let Err(e) = self.bus.close_channel(self.device, channel) {
                log::warn!("failed to close direct access channel {}: {}", channel, e);
            }
        }
    }
}
