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

//! SOCKS4, SOCKS4A and SOCKS5 server-side handshakes, as spoken by
//! dynamic forwardings.
//!
//! The decoders read the client's request from one buffer and append
//! their reply to another. Nothing is consumed until a complete
//! request is available, so they can be called again each time more
//! bytes arrive.
use crate::buffer::ChannelBuffer;
use byteorder::{BigEndian, ByteOrder};
use std::net::{Ipv4Addr, Ipv6Addr};

const SOCKS4_REQUEST_LEN: usize = 8;
const SOCKS4_MAX_SCAN: usize = 1024;
const SOCKS5_NOAUTH: u8 = 0x00;
const SOCKS5_IPV4: u8 = 0x01;
const SOCKS5_DOMAIN: u8 = 0x03;
const SOCKS5_IPV6: u8 = 0x04;
const SOCKS5_CONNECT: u8 = 0x01;
const SOCKS5_SUCCESS: u8 = 0x00;
const NI_MAXHOST: usize = 1025;

/// Outcome of a decoding attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    /// The request is incomplete.
    NeedMore,
    /// Malformed or unsupported request.
    Failed,
    /// The client wants to connect to `host:port`.
    Done { host: String, port: u16 },
}

/// Select the protocol from the first byte. `auth_done` carries the
/// SOCKS5 negotiation state between calls.
pub fn decode(auth_done: &mut bool, input: &mut ChannelBuffer, output: &mut ChannelBuffer) -> Progress {
    match input.as_slice().first() {
        None => Progress::NeedMore,
        Some(4) => decode_socks4(input, output),
        Some(5) => decode_socks5(auth_done, input, output),
        Some(v) => {
            debug!("wrong socks version {}", v);
            Progress::Failed
        }
    }
}

pub fn decode_socks4(input: &mut ChannelBuffer, output: &mut ChannelBuffer) -> Progress {
    let p = input.as_slice();
    if p.len() < SOCKS4_REQUEST_LEN {
        return Progress::NeedMore;
    }
    // SOCKS4A marks the address as 0.0.0.x and appends a host name.
    let need = if p[4] == 0 && p[5] == 0 && p[6] == 0 && p[7] != 0 {
        debug!("socks4a request");
        2
    } else {
        1
    };
    let mut found = 0;
    for (i, b) in p.iter().enumerate().skip(SOCKS4_REQUEST_LEN) {
        if *b == 0 {
            found += 1;
            if found == need {
                break;
            }
        }
        if i > SOCKS4_MAX_SCAN {
            debug!("decode socks4: too long");
            return Progress::Failed;
        }
    }
    if found < need {
        return Progress::NeedMore;
    }
    let command = p[1];
    let port = BigEndian::read_u16(&p[2..]);
    let addr = Ipv4Addr::new(p[4], p[5], p[6], p[7]);

    let rest = &p[SOCKS4_REQUEST_LEN..];
    let user_len = match rest.iter().position(|b| *b == 0) {
        Some(n) => n,
        None => return Progress::Failed,
    };
    debug!("decode socks4: user {}/{}", String::from_utf8_lossy(&rest[..user_len]), user_len);
    let rest = &rest[user_len + 1..];
    let (host, host_len) = if need == 1 {
        (addr.to_string(), 0)
    } else {
        let len = match rest.iter().position(|b| *b == 0) {
            Some(n) => n,
            None => return Progress::Failed,
        };
        if len + 1 > NI_MAXHOST {
            error!("decode socks4a: hostname too long");
            return Progress::Failed;
        }
        (String::from_utf8_lossy(&rest[..len]).into_owned(), len + 1)
    };
    input.consume(SOCKS4_REQUEST_LEN + user_len + 1 + host_len);
    debug!("dynamic request: socks4 host {} port {} command {}", host, port, command);
    if command != 1 {
        debug!("cannot handle: {} cn {}", if need == 1 { "SOCKS4" } else { "SOCKS4A" }, command);
        return Progress::Failed;
    }
    // vn 0, "request granted", then ignored port and address.
    output.extend(&[0, 90, 0, 0, 0, 0, 0, 0]);
    Progress::Done { host, port }
}

pub fn decode_socks5(auth_done: &mut bool, input: &mut ChannelBuffer, output: &mut ChannelBuffer) -> Progress {
    let p = input.as_slice();
    if p.first() != Some(&5) {
        return Progress::Failed;
    }
    if !*auth_done {
        if p.len() < 2 {
            return Progress::NeedMore;
        }
        let nmethods = p[1] as usize;
        if p.len() < nmethods + 2 {
            return Progress::NeedMore;
        }
        if !p[2..nmethods + 2].contains(&SOCKS5_NOAUTH) {
            debug!("method SOCKS5_NOAUTH not found");
            return Progress::Failed;
        }
        input.consume(nmethods + 2);
        output.extend(&[5, SOCKS5_NOAUTH]);
        *auth_done = true;
        debug!("socks5 auth done");
        return Progress::NeedMore;
    }
    debug!("socks5 post auth");
    if p.len() < 5 {
        return Progress::NeedMore;
    }
    if p[1] != SOCKS5_CONNECT || p[2] != 0 {
        debug!("only socks5 connect supported");
        return Progress::Failed;
    }
    let atyp = p[3];
    let (addr_len, skip) = match atyp {
        SOCKS5_IPV4 => (4, 0),
        SOCKS5_DOMAIN => (p[4] as usize, 1),
        SOCKS5_IPV6 => (16, 0),
        _ => {
            debug!("bad socks5 atyp {}", atyp);
            return Progress::Failed;
        }
    };
    let need = 4 + skip + addr_len + 2;
    if p.len() < need {
        return Progress::NeedMore;
    }
    let addr = &p[4 + skip..4 + skip + addr_len];
    let port = BigEndian::read_u16(&p[4 + skip + addr_len..]);
    let host = match atyp {
        SOCKS5_DOMAIN => {
            if addr_len >= NI_MAXHOST {
                error!("dynamic request: socks5 hostname too long");
                return Progress::Failed;
            }
            String::from_utf8_lossy(addr).into_owned()
        }
        SOCKS5_IPV4 => Ipv4Addr::new(addr[0], addr[1], addr[2], addr[3]).to_string(),
        _ => {
            let mut a = [0; 16];
            a.copy_from_slice(addr);
            Ipv6Addr::from(a).to_string()
        }
    };
    input.consume(need);
    debug!("dynamic request: socks5 host {} port {} command {}", host, port, SOCKS5_CONNECT);
    // Success, bound to 0.0.0.0:0.
    output.extend(&[5, SOCKS5_SUCCESS, 0, SOCKS5_IPV4, 0, 0, 0, 0, 0, 0]);
    Progress::Done { host, port }
}

#[cfg(test)]
mod test {
    use super::*;

    fn buffers(data: &[u8]) -> (ChannelBuffer, ChannelBuffer) {
        let mut input = ChannelBuffer::new();
        input.extend(data);
        (input, ChannelBuffer::new())
    }

    #[test]
    fn socks4_connect() {
        let (mut input, mut output) = buffers(b"\x04\x01\x1f\x90\x0a\x00\x00\x02user\x00");
        let mut auth = false;
        assert_eq!(
            decode(&mut auth, &mut input, &mut output),
            Progress::Done { host: "10.0.0.2".to_string(), port: 8080 }
        );
        assert!(input.is_empty());
        assert_eq!(output.as_slice(), &[0, 90, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn socks4a_waits_for_hostname() {
        let (mut input, mut output) = buffers(b"\x04\x01\x00\x50\x00\x00\x00\x01\x00");
        assert_eq!(decode_socks4(&mut input, &mut output), Progress::NeedMore);
        assert_eq!(input.len(), 9);
        input.extend(b"test.example\x00");
        assert_eq!(
            decode_socks4(&mut input, &mut output),
            Progress::Done { host: "test.example".to_string(), port: 80 }
        );
        assert!(input.is_empty());
    }

    #[test]
    fn socks4_unterminated_is_an_error() {
        let mut req = b"\x04\x01\x00\x50\x7f\x00\x00\x01".to_vec();
        req.extend(std::iter::repeat(b'a').take(2000));
        let (mut input, mut output) = buffers(&req);
        assert_eq!(decode_socks4(&mut input, &mut output), Progress::Failed);
        assert!(output.is_empty());
    }

    #[test]
    fn socks4_bind_is_refused() {
        let (mut input, mut output) = buffers(b"\x04\x02\x00\x50\x7f\x00\x00\x01\x00");
        assert_eq!(decode_socks4(&mut input, &mut output), Progress::Failed);
    }

    #[test]
    fn socks5_byte_by_byte() {
        let request: &[u8] = b"\x05\x02\x02\x00\x05\x01\x00\x03\x0bexample.org\x01\xbb";

        let mut auth = false;
        let (mut input, mut output) = buffers(request);
        let mut all_at_once = decode(&mut auth, &mut input, &mut output);
        if all_at_once == Progress::NeedMore {
            all_at_once = decode(&mut auth, &mut input, &mut output);
        }
        let reply = output.as_slice().to_vec();

        let mut auth = false;
        let mut input = ChannelBuffer::new();
        let mut output = ChannelBuffer::new();
        let mut result = Progress::NeedMore;
        for b in request {
            input.extend(&[*b]);
            result = decode(&mut auth, &mut input, &mut output);
            if result != Progress::NeedMore {
                break;
            }
        }
        assert_eq!(result, Progress::Done { host: "example.org".to_string(), port: 443 });
        assert_eq!(result, all_at_once);
        assert_eq!(output.as_slice(), &reply[..]);
        assert_eq!(&reply[..2], &[5, 0]);
        assert_eq!(&reply[2..], &[5, 0, 0, 1, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn socks5_ipv6_and_no_acceptable_method() {
        let mut req = vec![5, 1, 0, 5, 1, 0, 4];
        req.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
        req.extend_from_slice(&[0, 22]);
        let (mut input, mut output) = buffers(&req);
        let mut auth = false;
        assert_eq!(decode(&mut auth, &mut input, &mut output), Progress::NeedMore);
        assert_eq!(
            decode(&mut auth, &mut input, &mut output),
            Progress::Done { host: "::1".to_string(), port: 22 }
        );

        let (mut input, mut output) = buffers(b"\x05\x01\x02");
        let mut auth = false;
        assert_eq!(decode(&mut auth, &mut input, &mut output), Progress::Failed);
    }
}
