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

    src/drive/d64.rs

    Drive implementation on flat d64 disc images. A d64 file is the plain
    concatenation of all sectors in linear order, so sector I/O is just
    seek and read/write.
*/

use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::PathBuf,
};

use crate::{drive::Drive, IecError, IecResult, SECTOR_SIZE};

/// [`Drive`] implementation backed by a disc-image file. The file is
/// opened lazily on first access; in read-write mode a missing file is
/// created.
pub struct ImageDrive {
    image_path: PathBuf,
    read_only: bool,
    file: Option<File>,
}

impl ImageDrive {
    pub fn new(image_path: impl Into<PathBuf>, read_only: bool) -> ImageDrive {
        ImageDrive {
            image_path: image_path.into(),
            read_only,
            file: None,
        }
    }

    fn open_image(&mut self) -> IecResult<&mut File> {
        if self.file.is_none() {
            let file = OpenOptions::new()
                .read(true)
                .write(!self.read_only)
                .create(!self.read_only)
                .open(&self.image_path)
                .map_err(|e| {
                    IecError::DriveError(format!("open('{}'): {}", self.image_path.display(), e))
                })?;
            self.file = Some(file);
        }
        self.file
            .as_mut()
            .ok_or_else(|| IecError::DriveError("image file not open".to_string()))
    }

    fn seek_to_sector(file: &mut File, sector_number: usize) -> IecResult<()> {
        file.seek(SeekFrom::Start((sector_number * SECTOR_SIZE) as u64))
            .map_err(|e| IecError::DriveError(format!("seek to sector {}: {}", sector_number, e)))?;
        Ok(())
    }
}

impl Drive for ImageDrive {
    fn format_low_level(&mut self, _num_tracks: usize) -> IecResult<()> {
        Err(IecError::Unimplemented("ImageDrive::format_low_level".to_string()))
    }

    fn num_sectors(&mut self) -> IecResult<usize> {
        let file = self.open_image()?;
        let len = file
            .metadata()
            .map_err(|e| IecError::DriveError(format!("num_sectors: {}", e)))?
            .len() as usize;
        if len % SECTOR_SIZE != 0 {
            return Err(IecError::DriveError(
                "num_sectors: file size not a multiple of sector size".to_string(),
            ));
        }
        Ok(len / SECTOR_SIZE)
    }

    fn read_sector(&mut self, sector_number: usize) -> IecResult<Vec<u8>> {
        let file = self.open_image()?;
        Self::seek_to_sector(file, sector_number)?;
        let mut content = vec![0u8; SECTOR_SIZE];
        // A properly formatted disc image always holds whole sectors, so a
        // short read means we ran off the end of the image.
        match file.read_exact(&mut content) {
            Ok(()) => Ok(content),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(IecError::EndOfFile),
            Err(e) => Err(IecError::DriveError(format!("read_sector: {}", e))),
        }
    }

    fn write_sector(&mut self, sector_number: usize, content: &[u8]) -> IecResult<()> {
        if content.len() != SECTOR_SIZE {
            return Err(IecError::InvalidArgument(format!(
                "content length {} != sector size {}",
                content.len(),
                SECTOR_SIZE
            )));
        }
        if self.read_only {
            return Err(IecError::Unimplemented(
                "write_sector: image opened read-only".to_string(),
            ));
        }
        let file = self.open_image()?;
        Self::seek_to_sector(file, sector_number)?;
        file.write_all(content)
            .and_then(|_| file.flush())
            .map_err(|e| IecError::DriveError(format!("write_sector: {}", e)))
    }

    fn read_command_channel(&mut self) -> IecResult<String> {
        self.open_image()?;
        Ok(format!("Accessing image '{}'", self.image_path.display()))
    }
}
