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

    src/util.rs

    Escaping for bridge response payloads. Data sent from the bridge is of
    unknown length and terminated by a carriage return, so any 0x0D inside
    the payload is escaped: '\' + 'r' stands for 0x0D, '\' + '\' for 0x5C.
    No other escape sequences exist.
*/

use crate::{IecError, IecResult};

/// Decode an escaped bridge payload. Fails with `InvalidArgument` on an
/// unknown or truncated escape sequence.
pub fn unescape(source: &[u8]) -> IecResult<Vec<u8>> {
    let mut result = Vec::with_capacity(source.len());
    let mut iter = source.iter();
    while let Some(&b) = iter.next() {
        if b != b'\\' {
            result.push(b);
            continue;
        }
        match iter.next() {
            Some(b'r') => result.push(b'\r'),
            Some(b'\\') => result.push(b'\\'),
            Some(&other) => {
                return Err(IecError::InvalidArgument(format!(
                    "invalid escape sequence '\\{}'",
                    other as char
                )));
            }
            None => {
                return Err(IecError::InvalidArgument(format!(
                    "incomplete escape sequence in '{}'",
                    String::from_utf8_lossy(source)
                )));
            }
        }
    }
    Ok(result)
}

/// Encode a payload for transmission as a terminated response frame; the
/// inverse of [`unescape`]. The terminator itself is not appended.
pub fn escape(source: &[u8]) -> Vec<u8> {
    let mut result = Vec::with_capacity(source.len());
    for &b in source {
        match b {
            b'\r' => result.extend_from_slice(b"\\r"),
            b'\\' => result.extend_from_slice(b"\\\\"),
            _ => result.push(b),
        }
    }
    result
}
