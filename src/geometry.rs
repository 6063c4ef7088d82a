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

    src/geometry.rs

    Physical disk addressing for the 1541. Tracks are grouped into four
    zones with a decreasing sectors-per-track count towards the disk hub:

        tracks  1..=17  21 sectors/track   (linear sectors   0..=356)
        tracks 18..=24  19 sectors/track   (linear sectors 357..=489)
        tracks 25..=30  18 sectors/track   (linear sectors 490..=597)
        tracks 31..     17 sectors/track   (linear sectors 598..)

    The drive interface abstracts from this by addressing sectors linearly;
    the mapping in both directions lives here and is a pure function.
*/

use std::fmt::{Display, Formatter};

/// Sectors covered by zone 1 (tracks 1-17).
const ZONE_1_SECTORS: usize = 17 * 21;
/// Sectors covered by zones 1-2 (tracks 1-24).
const ZONE_2_SECTORS: usize = ZONE_1_SECTORS + 7 * 19;
/// Sectors covered by zones 1-3 (tracks 1-30).
const ZONE_3_SECTORS: usize = ZONE_2_SECTORS + 6 * 18;

/// A physical (track, sector) address. Tracks are 1-based, sectors 0-based,
/// matching the drive's own addressing. The fields are deliberately wider
/// than the drive's own track range: a large linear index maps to a large
/// track number, and narrowing it here would let an out-of-range address
/// masquerade as a valid one before anyone has checked it.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq)]
pub struct TrackSector {
    pub track: usize,
    pub sector: usize,
}

impl Display for TrackSector {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[t:{:2} s:{:2}]", self.track, self.sector)
    }
}

impl TrackSector {
    pub fn new(track: usize, sector: usize) -> TrackSector {
        TrackSector { track, sector }
    }

    /// Map a 0-based linear sector index to its physical address.
    pub fn from_linear(index: usize) -> TrackSector {
        if index >= ZONE_3_SECTORS {
            let s = index - ZONE_3_SECTORS;
            TrackSector::new(31 + s / 17, s % 17)
        } else if index >= ZONE_2_SECTORS {
            let s = index - ZONE_2_SECTORS;
            TrackSector::new(25 + s / 18, s % 18)
        } else if index >= ZONE_1_SECTORS {
            let s = index - ZONE_1_SECTORS;
            TrackSector::new(18 + s / 19, s % 19)
        } else {
            TrackSector::new(index / 21 + 1, index % 21)
        }
    }

    /// Map a physical address back to its linear sector index.
    /// The track must be at least 1.
    pub fn to_linear(self) -> usize {
        let t = self.track;
        let s = self.sector;
        match t {
            0..=17 => (t.saturating_sub(1)) * 21 + s,
            18..=24 => ZONE_1_SECTORS + (t - 18) * 19 + s,
            25..=30 => ZONE_2_SECTORS + (t - 25) * 18 + s,
            _ => ZONE_3_SECTORS + (t - 31) * 17 + s,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zone_boundaries() {
        // One probe either side of every zone boundary, plus deep zone 4.
        let expected = [
            (0, TrackSector::new(1, 0)),
            (356, TrackSector::new(17, 20)),
            (357, TrackSector::new(18, 0)),
            (489, TrackSector::new(24, 18)),
            (490, TrackSector::new(25, 0)),
            (597, TrackSector::new(30, 17)),
            (598, TrackSector::new(31, 0)),
            (682, TrackSector::new(35, 16)),
            // Way past any physical disk; the track must come out
            // unnarrowed so range checks downstream can reject it.
            (4423, TrackSector::new(256, 0)),
        ];
        for (index, ts) in expected {
            assert_eq!(TrackSector::from_linear(index), ts, "index {}", index);
        }
    }

    #[test]
    fn linear_round_trip() {
        // 768 covers a 40-track disk, past the standard 35-track layout.
        for index in 0..768 {
            assert_eq!(TrackSector::from_linear(index).to_linear(), index, "index {}", index);
        }
    }
}
