// Copyright 2016 Pierre-Étienne Meunier
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! Growable byte queues used for the three streams of each channel.
use crate::sys;
use cryptovec::CryptoVec;
use std::os::unix::io::RawFd;

/// Advisory cap on the contents of a single channel buffer. Reads
/// from descriptors stop when `avail()` runs out; `extend` does not
/// check it, data from the peer being bounded by the local window.
pub const CHAN_BUF_MAX: usize = 16 * 1024 * 1024;

/// A FIFO of bytes. Data is appended at the end and consumed from
/// the front; consumed space is reclaimed lazily.
#[derive(Debug)]
pub struct ChannelBuffer {
    buf: CryptoVec,
    off: usize,
    max: usize,
}

impl Default for ChannelBuffer {
    fn default() -> Self {
        ChannelBuffer::new()
    }
}

impl ChannelBuffer {
    pub fn new() -> Self {
        ChannelBuffer {
            buf: CryptoVec::new(),
            off: 0,
            max: CHAN_BUF_MAX,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len() - self.off
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes that can still be read in before hitting the cap.
    pub fn avail(&self) -> usize {
        self.max.saturating_sub(self.len())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf[self.off..]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf[self.off..]
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.compact();
        self.buf.extend(data)
    }

    /// Drop `n` bytes from the front.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.len());
        self.off += n.min(self.len());
        if self.off == self.buf.len() {
            self.clear()
        }
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.off = 0;
    }

    /// Read at most `max` bytes from `fd` at the end of the buffer.
    /// `Ok(0)` means end of file.
    pub fn read_from(&mut self, fd: RawFd, max: usize) -> std::io::Result<usize> {
        self.compact();
        let start = self.buf.len();
        self.buf.resize(start + max);
        match sys::read(fd, &mut self.buf[start..]) {
            Ok(n) => {
                self.buf.resize(start + n);
                Ok(n)
            }
            Err(e) => {
                self.buf.resize(start);
                Err(e)
            }
        }
    }

    fn compact(&mut self) {
        if self.off > 0 && self.off >= self.buf.len() / 2 {
            let rest = CryptoVec::from_slice(&self.buf[self.off..]);
            self.buf = rest;
            self.off = 0;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn consume_then_extend() {
        let mut b = ChannelBuffer::new();
        b.extend(b"hello, world");
        b.consume(7);
        assert_eq!(b.as_slice(), b"world");
        b.extend(b"!");
        assert_eq!(b.as_slice(), b"world!");
        assert_eq!(b.len(), 6);
        b.consume(6);
        assert!(b.is_empty());
        assert_eq!(b.avail(), CHAN_BUF_MAX);
    }

    #[test]
    fn extend_past_cap() {
        let mut b = ChannelBuffer::new();
        b.max = 4;
        b.extend(b"abc");
        assert_eq!(b.avail(), 1);
        b.extend(b"defg");
        assert_eq!(b.as_slice(), b"abcdefg");
        assert_eq!(b.avail(), 0);
    }
}
