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

//! SSH wire encoding of strings, integers and booleans.
use crate::Error;
use byteorder::{BigEndian, ByteOrder};
use cryptovec::CryptoVec;

/// Encode in the SSH format.
pub trait Encoding {
    /// Push an SSH-encoded string to `self`.
    fn extend_ssh_string(&mut self, s: &[u8]);
    /// Push a big-endian `u32`.
    fn push_u32_be(&mut self, x: u32);
    /// Push an SSH-encoded boolean.
    fn push_bool(&mut self, b: bool);
}

impl Encoding for Vec<u8> {
    fn extend_ssh_string(&mut self, s: &[u8]) {
        self.push_u32_be(s.len() as u32);
        self.extend_from_slice(s);
    }
    fn push_u32_be(&mut self, x: u32) {
        let mut b = [0; 4];
        BigEndian::write_u32(&mut b, x);
        self.extend_from_slice(&b)
    }
    fn push_bool(&mut self, b: bool) {
        self.push(if b { 1 } else { 0 })
    }
}

impl Encoding for CryptoVec {
    fn extend_ssh_string(&mut self, s: &[u8]) {
        CryptoVec::push_u32_be(self, s.len() as u32);
        self.extend(s);
    }
    fn push_u32_be(&mut self, x: u32) {
        CryptoVec::push_u32_be(self, x)
    }
    fn push_bool(&mut self, b: bool) {
        self.push(if b { 1 } else { 0 })
    }
}

/// A cursor-like trait to read SSH-encoded things.
pub trait Reader {
    /// Create an SSH reader for `self`.
    fn reader(&self, starting_at: usize) -> Position;
}

impl Reader for [u8] {
    fn reader(&self, starting_at: usize) -> Position {
        Position { s: self, position: starting_at }
    }
}

impl Reader for CryptoVec {
    fn reader(&self, starting_at: usize) -> Position {
        Position { s: &self[..], position: starting_at }
    }
}

/// A cursor over an SSH-encoded buffer.
#[derive(Debug)]
pub struct Position<'a> {
    s: &'a [u8],
    #[doc(hidden)]
    pub position: usize,
}

impl<'a> Position<'a> {
    /// Read one string from this reader.
    pub fn read_string(&mut self) -> Result<&'a [u8], Error> {
        let len = self.read_u32()? as usize;
        if self.position + len <= self.s.len() {
            let result = &self.s[self.position..(self.position + len)];
            self.position += len;
            Ok(result)
        } else {
            Err(Error::IndexOutOfBounds)
        }
    }

    /// Read one string, and check that it is valid UTF-8.
    pub fn read_utf8(&mut self) -> Result<&'a str, Error> {
        Ok(std::str::from_utf8(self.read_string()?)?)
    }

    /// Read a `u32` from this reader.
    pub fn read_u32(&mut self) -> Result<u32, Error> {
        if self.position + 4 <= self.s.len() {
            let u = BigEndian::read_u32(&self.s[self.position..]);
            self.position += 4;
            Ok(u)
        } else {
            Err(Error::IndexOutOfBounds)
        }
    }

    /// Read one byte from this reader.
    pub fn read_byte(&mut self) -> Result<u8, Error> {
        if self.position + 1 <= self.s.len() {
            let u = self.s[self.position];
            self.position += 1;
            Ok(u)
        } else {
            Err(Error::IndexOutOfBounds)
        }
    }

    /// Read a boolean.
    pub fn read_bool(&mut self) -> Result<bool, Error> {
        Ok(self.read_byte()? != 0)
    }

    /// What is left to read.
    pub fn remaining(&self) -> &'a [u8] {
        &self.s[self.position.min(self.s.len())..]
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn read_past_end() {
        let mut v = Vec::new();
        v.extend_ssh_string(b"direct-tcpip");
        v.push_u32_be(7);
        let mut r = v.reader(0);
        assert_eq!(r.read_utf8().unwrap(), "direct-tcpip");
        assert_eq!(r.read_u32().unwrap(), 7);
        assert!(r.remaining().is_empty());
        assert!(r.read_byte().is_err());

        // A string claiming more bytes than the packet holds.
        let bogus = [0, 0, 0, 9, b'a', b'b'];
        assert!(bogus.reader(0).read_string().is_err());
    }
}
