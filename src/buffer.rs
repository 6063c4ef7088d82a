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

    src/buffer.rs

    Buffered channel I/O over a bus transport. Responses from the bridge
    come in two shapes: terminator-delimited frames of unknown length, and
    fixed-length payloads (one 256-byte sector). BufferedPort provides a
    read primitive for each, sharing one buffer so that bytes already read
    ahead are not lost when switching between the two mid-stream. Writes
    are not buffered; they go to the transport immediately.
*/

use std::{sync::Arc, thread, time::Duration};

use crate::{
    transport::{is_transient, BusTransport},
    IecError, IecResult,
};

/// Maximum read-ahead that may be requested from `read_terminated`. Kept
/// small; we are dealing with a fairly slow bus.
pub const MAX_READ_AHEAD: usize = 1024;

/// The buffer must support a full read-ahead window starting anywhere in
/// its first half, so it holds one byte short of two windows. Once the
/// consumed region reaches the halfway mark the live region is moved back
/// to the front.
const BUFFER_SIZE: usize = 2 * MAX_READ_AHEAD - 1;

/// How long to yield between retries of a transiently-failing read or
/// write, instead of spinning on the descriptor.
const RETRY_INTERVAL: Duration = Duration::from_millis(1);

/// A buffered reader / immediate writer over one duplex transport.
///
/// Reading and terminator scanning happen against an internal buffer laid
/// out as `[consumed | buffered-unprocessed | free]`; raw offsets never
/// escape this type. None of the read calls time out: if the transport
/// produces no data they block until it does or fails.
pub struct BufferedPort<T: BusTransport> {
    transport: Arc<T>,
    buf: Box<[u8]>,
    /// Start of buffered, unprocessed data (inclusive).
    /// Invariant: 0 <= start < MAX_READ_AHEAD after every call.
    start: usize,
    /// End of buffered, unprocessed data (exclusive).
    /// Invariant: start <= end <= BUFFER_SIZE.
    end: usize,
}

impl<T: BusTransport> BufferedPort<T> {
    pub fn new(transport: Arc<T>) -> Self {
        Self {
            transport,
            buf: vec![0u8; BUFFER_SIZE].into_boxed_slice(),
            start: 0,
            end: 0,
        }
    }

    /// Returns true if unprocessed data is currently buffered.
    pub fn has_buffered_data(&self) -> bool {
        self.end > self.start
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Read until `term` is found within the first `max_lookahead` buffered
    /// bytes and return everything before it; the terminator itself is
    /// consumed but not returned. Fails with `InvalidArgument` if
    /// `max_lookahead` exceeds [`MAX_READ_AHEAD`] (no I/O is attempted),
    /// and with `ConnectionFailure` if the terminator is not found within
    /// the window. A failed search leaves the buffered data intact, so a
    /// retry with a larger window can still succeed.
    pub fn read_terminated(&mut self, term: u8, max_lookahead: usize) -> IecResult<Vec<u8>> {
        if max_lookahead > MAX_READ_AHEAD {
            return Err(IecError::InvalidArgument(format!(
                "max_lookahead({}) > MAX_READ_AHEAD({})",
                max_lookahead, MAX_READ_AHEAD
            )));
        }
        loop {
            let window_end = self.start + max_lookahead;
            let search_to = self.end.min(window_end);
            if let Some(pos) = self.buf[self.start..search_to].iter().position(|&b| b == term) {
                return Ok(self.consume(self.start + pos, 1));
            }
            if search_to == window_end {
                // The whole window is buffered and the terminator isn't in
                // it; this holds even when the window reaches the end of
                // the buffer, so no fill is attempted against a full one.
                return Err(IecError::ConnectionFailure(format!(
                    "couldn't find terminator {:#04x} within {} bytes",
                    term, max_lookahead
                )));
            }
            self.fill()?;
        }
    }

    /// Read at least `min_length` and at most `max_length` bytes. Buffered
    /// data is drained first; any remainder is read straight from the
    /// transport without terminator or look-ahead logic. Returning fewer
    /// than `min_length` bytes only happens for `min_length == 0`.
    pub fn read_upto(&mut self, min_length: usize, max_length: usize) -> IecResult<Vec<u8>> {
        if min_length > max_length {
            return Err(IecError::InvalidArgument(format!(
                "min_length({}) > max_length({})",
                min_length, max_length
            )));
        }
        let buffered = (self.end - self.start).min(max_length);
        let mut result = self.consume(self.start + buffered, 0);
        if result.len() == max_length {
            return Ok(result);
        }

        // The buffer is drained now; read the rest directly into the result.
        debug_assert!(!self.has_buffered_data());
        while result.len() < min_length {
            let mut chunk = vec![0u8; max_length - result.len()];
            match self.transport.read(&mut chunk) {
                Ok(0) => {
                    return Err(IecError::ConnectionFailure("read: transport closed".to_string()));
                }
                Ok(n) => result.extend_from_slice(&chunk[..n]),
                Err(e) if is_transient(&e) => thread::sleep(RETRY_INTERVAL),
                Err(e) => return Err(IecError::io("read", &e)),
            }
        }
        Ok(result)
    }

    /// Write all of `content`, retrying transient failures until every byte
    /// has been accepted by the transport.
    pub fn write_all(&mut self, content: &[u8]) -> IecResult<()> {
        write_all(self.transport.as_ref(), content)
    }

    /// Consume buffered data up to `consume_to`, returning it, then skip
    /// `skip` additional bytes without returning them. Compacts the buffer
    /// when the consumed region has grown past the halfway mark.
    fn consume(&mut self, consume_to: usize, skip: usize) -> Vec<u8> {
        debug_assert!(consume_to + skip <= self.end);
        let result = self.buf[self.start..consume_to].to_vec();
        self.start = consume_to + skip;
        if self.start >= MAX_READ_AHEAD {
            // The first half of the buffer is now unused; move the live
            // region to the front. The regions never overlap.
            self.buf.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;
        }
        result
    }

    /// Read at least one more byte into the free region, retrying transient
    /// failures.
    fn fill(&mut self) -> IecResult<()> {
        if self.end == BUFFER_SIZE {
            // Can't happen while the read-ahead bound holds, but a zero-byte
            // read must not be reported as data.
            return Err(IecError::ConnectionFailure("read: buffer exhausted".to_string()));
        }
        loop {
            match self.transport.read(&mut self.buf[self.end..]) {
                Ok(0) => {
                    return Err(IecError::ConnectionFailure("read: transport closed".to_string()));
                }
                Ok(n) => {
                    self.end += n;
                    return Ok(());
                }
                Err(e) if is_transient(&e) => thread::sleep(RETRY_INTERVAL),
                Err(e) => return Err(IecError::io("read", &e)),
            }
        }
    }
}

/// Write all of `content` to a transport, retrying transient failures.
/// Used both by [`BufferedPort`] and by writers that bypass the read buffer.
pub(crate) fn write_all<T: BusTransport>(transport: &T, content: &[u8]) -> IecResult<()> {
    let mut pos = 0;
    while pos < content.len() {
        match transport.write(&content[pos..]) {
            Ok(n) => pos += n,
            Err(e) if is_transient(&e) => thread::sleep(RETRY_INTERVAL),
            Err(e) => return Err(IecError::io("write", &e)),
        }
    }
    Ok(())
}
