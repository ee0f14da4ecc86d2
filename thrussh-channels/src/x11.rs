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

//! X11 forwarding.
//!
//! The client never gives the real authentication cookie of its
//! display to the server. It sends a random cookie of the same length
//! instead, and when the server opens an `x11` channel, the first
//! bytes the X client sends (its connection setup) are checked for
//! that fake cookie, which is then replaced by the real one before
//! anything reaches the display.
use crate::channel::{ChannelType, ExtendedUsage};
use crate::config::{CHAN_TCP_WINDOW_DEFAULT, CHAN_X11_PACKET_DEFAULT, CHAN_X11_WINDOW_DEFAULT};
use crate::encoding::Encoding;
use crate::forward::listen_tcp;
use crate::session::Session;
use crate::{sys, ChannelId, Error};
use rand::RngCore;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpStream};
use std::os::unix::io::{IntoRawFd, RawFd};
use std::os::unix::net::UnixStream;

/// Display `n` listens on TCP port `X11_BASE_PORT + n`.
pub const X11_BASE_PORT: u16 = 6000;
/// Displays above this are never tried.
pub const MAX_DISPLAYS: u32 = 1000;
const X11_UNIX_DIR: &str = "/tmp/.X11-unix";

/// The saved credentials of the display we forward.
#[derive(Default)]
pub struct X11State {
    pub(crate) saved_display: Option<String>,
    pub(crate) proto: Option<String>,
    pub(crate) real: Vec<u8>,
    pub(crate) fake: Vec<u8>,
    /// Connections are refused from this time on, if non-zero.
    pub(crate) refuse_time: u64,
}

impl std::fmt::Debug for X11State {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("X11State")
            .field("saved_display", &self.saved_display)
            .field("proto", &self.proto)
            .field("refuse_time", &self.refuse_time)
            .finish()
    }
}

/// Result of looking at the connection setup of an X11 client.
#[derive(Debug, PartialEq, Eq)]
enum Auth {
    NeedMore,
    Accepted,
    Rejected,
}

fn pad4(n: usize) -> usize {
    (n + 3) & !3
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b.iter()).fold(0, |acc, (x, y)| acc | (x ^ y)) == 0
}

impl X11State {
    /// Check the connection setup in `buf`, substituting the real
    /// cookie for the fake one when it matches.
    fn open_helper(&self, buf: &mut [u8], now: u64) -> Auth {
        if self.refuse_time != 0 && now >= self.refuse_time {
            info!("Rejected X11 connection after ForwardX11Timeout expired");
            return Auth::Rejected;
        }
        if buf.len() < 12 {
            return Auth::NeedMore;
        }
        let (proto_len, data_len) = match buf[0] {
            // MSB first.
            0x42 => (
                256 * buf[6] as usize + buf[7] as usize,
                256 * buf[8] as usize + buf[9] as usize,
            ),
            // LSB first.
            0x6c => (
                buf[6] as usize + 256 * buf[7] as usize,
                buf[8] as usize + 256 * buf[9] as usize,
            ),
            b => {
                debug!("Initial X11 packet contains bad byte order byte: {:#x}", b);
                return Auth::Rejected;
            }
        };
        if buf.len() < 12 + pad4(proto_len) + pad4(data_len) {
            return Auth::NeedMore;
        }
        let proto = match self.proto {
            Some(ref p) => p.as_bytes(),
            None => return Auth::Rejected,
        };
        if proto_len != proto.len() || &buf[12..12 + proto_len] != proto {
            debug!("X11 connection uses different authentication protocol.");
            return Auth::Rejected;
        }
        let data = 12 + pad4(proto_len);
        if data_len != self.fake.len() || !constant_time_eq(&buf[data..data + data_len], &self.fake) {
            debug!("X11 auth data does not match fake data.");
            return Auth::Rejected;
        }
        if self.fake.len() != self.real.len() {
            error!("X11 fake_data_len {} != saved_data_len {}", self.fake.len(), self.real.len());
            return Auth::Rejected;
        }
        buf[data..data + data_len].copy_from_slice(&self.real);
        Auth::Accepted
    }
}

fn from_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len() / 2)
        .map(|i| s.get(2 * i..2 * i + 2).and_then(|h| u8::from_str_radix(h, 16).ok()))
        .collect()
}

fn to_hex(b: &[u8]) -> String {
    b.iter().map(|x| format!("{:02x}", x)).collect()
}

/// The leading digits of `s`, as `sscanf("%u")` would read them.
fn leading_number(s: &str) -> Option<u32> {
    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    s[..end].parse().ok()
}

/// Where a `DISPLAY` value points.
#[derive(Debug, PartialEq, Eq)]
pub enum Display {
    /// `:N`, `unix:N` or `::N`: the local socket of display N.
    Unix(u32),
    /// `host:N`: TCP port 6000 + N on host.
    Tcp(String, u16),
}

impl Display {
    pub fn parse(display: &str) -> Option<Display> {
        if display.starts_with("unix:") || display.starts_with(':') {
            let n = display.rfind(':').and_then(|i| leading_number(&display[i + 1..]));
            return n.map(Display::Unix);
        }
        let colon = display.find(':')?;
        let n = leading_number(&display[colon + 1..])?;
        if n > (u16::max_value() - X11_BASE_PORT) as u32 {
            return None;
        }
        Some(Display::Tcp(display[..colon].to_string(), X11_BASE_PORT + n as u16))
    }

    /// Connect to the display. The connection is blocking.
    pub fn connect(&self) -> io::Result<RawFd> {
        match *self {
            Display::Unix(n) => {
                let path = format!("{}/X{}", X11_UNIX_DIR, n);
                let s = UnixStream::connect(&path).map_err(|e| {
                    error!("connect {}: {}", path, e);
                    e
                })?;
                Ok(s.into_raw_fd())
            }
            Display::Tcp(ref host, port) => {
                let s = TcpStream::connect((host.as_str(), port)).map_err(|e| {
                    error!("connect {} port {}: {}", host, port, e);
                    e
                })?;
                let fd = s.into_raw_fd();
                sys::set_nodelay(fd);
                Ok(fd)
            }
        }
    }
}

/// The screen number of a `DISPLAY` value (`host:d.s`).
fn screen_number(display: &str) -> u32 {
    display
        .find(':')
        .and_then(|i| display[i..].find('.').map(|j| i + j))
        .and_then(|i| leading_number(&display[i + 1..]))
        .filter(|s| *s <= 400)
        .unwrap_or(0)
}

impl Session {
    /// Absolute time after which X11 channels are refused.
    pub fn set_x11_refuse_time(&mut self, refuse_time: u64) {
        debug!("x11 refuse time {}", refuse_time);
        self.x11.refuse_time = refuse_time
    }

    /// Ask the server to forward X11 connections over the session
    /// channel `id`. `data` is the real cookie, in hexadecimal; the
    /// server only ever sees a random cookie of the same length.
    pub fn x11_request_forwarding_with_spoofing(
        &mut self,
        id: ChannelId,
        display: &str,
        proto: &str,
        data: &str,
        want_reply: bool,
    ) -> Result<(), Error> {
        match self.x11.saved_display {
            None => self.x11.saved_display = Some(display.to_string()),
            Some(ref d) if d != display => {
                error!("x11_request_forwarding_with_spoofing: different $DISPLAY already forwarded");
                return Ok(());
            }
            _ => {}
        }
        if self.x11.proto.is_none() {
            let real = match from_hex(data) {
                Some(real) => real,
                None => {
                    error!("x11_request_forwarding: bad authentication data: {}", data);
                    return Err(Error::Inconsistent);
                }
            };
            let mut fake = vec![0; real.len()];
            rand::thread_rng().fill_bytes(&mut fake);
            self.x11.proto = Some(proto.to_string());
            self.x11.real = real;
            self.x11.fake = fake;
        }
        if self.x11.refuse_time == 0 {
            if let Some(timeout) = self.config.x11_forward_timeout {
                let t = self.now + timeout;
                self.set_x11_refuse_time(t)
            }
        }
        let mut req = Vec::new();
        req.push(0); // single connection
        req.extend_ssh_string(proto.as_bytes());
        req.extend_ssh_string(to_hex(&self.x11.fake).as_bytes());
        req.push_u32_be(screen_number(display));
        self.channel_request(id, "x11-req", want_reply, &req, None)
    }

    /// Verify the cookie of a new X11 channel.
    pub(crate) fn pre_x11_open(&mut self, id: ChannelId) -> Result<(), Error> {
        let now = self.now;
        let c = match self.channels.get_mut(id) {
            Some(c) => c,
            None => return Ok(()),
        };
        match self.x11.open_helper(c.output.as_mut_slice(), now) {
            Auth::NeedMore => Ok(()),
            Auth::Accepted => {
                c.kind = ChannelType::Open;
                c.lastused = now;
                self.pre_open(id)
            }
            Auth::Rejected => {
                warn!("X11 connection rejected because of wrong authentication.");
                debug!("X11 rejected {} i{:?}/o{:?}", id, c.istate, c.ostate);
                c.read_failed();
                c.input.clear();
                c.ibuf_empty(&mut self.write)?;
                c.output.clear();
                c.write_failed(&mut self.write)?;
                debug!("X11 closed {} i{:?}/o{:?}", id, c.istate, c.ostate);
                Ok(())
            }
        }
    }

    /// The server opened an `x11` channel: connect to our display.
    pub(crate) fn open_x11(&mut self, originator: &str, originator_port: u32) -> Option<ChannelId> {
        if !self.config.forward_x11 {
            error!("Warning: ssh server tried X11 forwarding.");
            error!("Warning: this is probably a break-in attempt by a malicious server.");
            return None;
        }
        if self.x11.refuse_time != 0 && self.now >= self.x11.refuse_time {
            info!("Rejected X11 connection after ForwardX11Timeout expired");
            return None;
        }
        debug!("client_request_x11: request from {} {}", originator, originator_port);
        let display = match self.config.x11_display {
            Some(ref d) => d.clone(),
            None => {
                error!("DISPLAY not set.");
                return None;
            }
        };
        let sock = match Display::parse(&display) {
            Some(d) => d.connect().ok()?,
            None => {
                error!("Could not parse display number from DISPLAY: {}", display);
                return None;
            }
        };
        let id = self.new_channel(
            "x11",
            ChannelType::X11Open,
            Some(sock),
            Some(sock),
            None,
            CHAN_TCP_WINDOW_DEFAULT,
            CHAN_X11_PACKET_DEFAULT,
            ExtendedUsage::Ignore,
            "x11",
            true,
        );
        if let Some(c) = self.channels.get_mut(id) {
            c.force_drain = true
        }
        Some(id)
    }

    /// Listen for X11 connections on the first free display at or
    /// above `offset`. Returns the display number and the listeners.
    pub fn x11_create_display_inet(
        &mut self,
        offset: u32,
        use_localhost: bool,
        single_connection: bool,
    ) -> Result<(u32, Vec<ChannelId>), Error> {
        let addrs: [IpAddr; 2] = if use_localhost {
            [Ipv4Addr::LOCALHOST.into(), Ipv6Addr::LOCALHOST.into()]
        } else {
            [Ipv4Addr::UNSPECIFIED.into(), Ipv6Addr::UNSPECIFIED.into()]
        };
        let mut socks = Vec::new();
        let mut display = offset;
        while display < MAX_DISPLAYS {
            let port = X11_BASE_PORT as u32 + display;
            if port > u16::max_value() as u32 {
                break;
            }
            for ip in addrs.iter() {
                match listen_tcp(SocketAddr::new(*ip, port as u16)) {
                    Ok(fd) => socks.push(fd),
                    Err(ref e) if e.kind() == io::ErrorKind::AddrInUse => {
                        debug!("bind port {}: {}", port, e);
                        for fd in socks.drain(..) {
                            let _ = sys::close(fd);
                        }
                        break;
                    }
                    // No such address family here.
                    Err(e) => debug!("x11 listener [{}]:{}: {}", ip, port, e),
                }
            }
            if !socks.is_empty() {
                break;
            }
            display += 1
        }
        if socks.is_empty() {
            error!("Failed to allocate internet-domain X11 display socket.");
            return Err(Error::CannotListen);
        }
        let ids = socks
            .into_iter()
            .map(|sock| {
                let id = self.new_channel(
                    "x11-listener",
                    ChannelType::X11Listener,
                    Some(sock),
                    Some(sock),
                    None,
                    CHAN_X11_WINDOW_DEFAULT,
                    CHAN_X11_PACKET_DEFAULT,
                    ExtendedUsage::Ignore,
                    "X11 inet listener",
                    true,
                );
                if let Some(c) = self.channels.get_mut(id) {
                    c.single_connection = single_connection
                }
                id
            })
            .collect();
        Ok((display, ids))
    }

    pub(crate) fn post_x11_listener(&mut self, id: ChannelId) -> Result<(), Error> {
        let ready = self.channels.get(id).map(|c| c.io_ready.contains(crate::channel::IoFlags::SOCK_R));
        if ready != Some(true) {
            return Ok(());
        }
        debug!("X11 connection requested.");
        let newsock = self.accept_on(id);
        if let Some(c) = self.channels.get_mut(id) {
            if c.single_connection {
                debug!("single_connection: closing X11 listener.");
                c.close_fds();
                c.mark_dead()
            }
        }
        let (newsock, (window, maxpacket)) = match (newsock, self.listener_window(id)) {
            (Some(s), Some(w)) => (s, w),
            (Some(s), None) => (s, (CHAN_X11_WINDOW_DEFAULT, CHAN_X11_PACKET_DEFAULT)),
            (None, _) => return Ok(()),
        };
        sys::set_nodelay(newsock);
        let (ip, port) = match sys::peer_addr(newsock) {
            Some(a) => (a.ip().to_string(), a.port() as u32),
            None => ("127.0.0.1".to_string(), 65535),
        };
        let name = format!("X11 connection from {} port {}", ip, port);
        let nc = self.new_channel(
            "x11",
            ChannelType::Opening,
            Some(newsock),
            Some(newsock),
            None,
            window,
            maxpacket,
            ExtendedUsage::Ignore,
            &name,
            true,
        );
        self.send_channel_open(nc, "x11", |w| {
            w.extend_ssh_string(ip.as_bytes());
            w.push_u32_be(port);
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn state() -> X11State {
        X11State {
            proto: Some("MIT-MAGIC-COOKIE-1".to_string()),
            real: vec![0xaa; 16],
            fake: (0..16).collect(),
            ..X11State::default()
        }
    }

    fn setup(order: u8, proto: &[u8], data: &[u8]) -> Vec<u8> {
        let mut b = vec![order, 0, 11, 0, 0, 0];
        if order == 0x42 {
            b.extend(&[0, proto.len() as u8, 0, data.len() as u8]);
        } else {
            b.extend(&[proto.len() as u8, 0, data.len() as u8, 0]);
        }
        b.extend(&[0, 0]);
        b.extend(proto);
        b.resize(12 + pad4(proto.len()), 0);
        b.extend(data);
        b
    }

    #[test]
    fn both_byte_orders() {
        let s = state();
        let fake: Vec<u8> = (0..16).collect();
        for order in &[0x42, 0x6c] {
            let mut b = setup(*order, b"MIT-MAGIC-COOKIE-1", &fake);
            assert_eq!(s.open_helper(&mut b[..11], 0), Auth::NeedMore);
            assert_eq!(s.open_helper(&mut b[..30], 0), Auth::NeedMore);
            assert_eq!(s.open_helper(&mut b, 0), Auth::Accepted);
            assert_eq!(&b[32..], &[0xaa; 16][..]);
        }
        let mut b = setup(0x42, b"XDM-AUTHORIZATION-1", &fake);
        assert_eq!(s.open_helper(&mut b, 0), Auth::Rejected);
        let mut b = setup(0x00, b"MIT-MAGIC-COOKIE-1", &fake);
        assert_eq!(s.open_helper(&mut b, 0), Auth::Rejected);
    }

    #[test]
    fn refuse_time() {
        let mut s = state();
        s.refuse_time = 10;
        let fake: Vec<u8> = (0..16).collect();
        let mut b = setup(0x6c, b"MIT-MAGIC-COOKIE-1", &fake);
        assert_eq!(s.open_helper(&mut b, 10), Auth::Rejected);
        assert_eq!(s.open_helper(&mut b, 9), Auth::Accepted);
    }

    #[test]
    fn displays() {
        assert_eq!(Display::parse(":0"), Some(Display::Unix(0)));
        assert_eq!(Display::parse("unix:10.0"), Some(Display::Unix(10)));
        assert_eq!(Display::parse("localhost:10.0"), Some(Display::Tcp("localhost".to_string(), 6010)));
        assert_eq!(Display::parse("localhost"), None);
        assert_eq!(Display::parse("host:x"), None);
        assert_eq!(screen_number("localhost:10.2"), 2);
        assert_eq!(screen_number(":0"), 0);
        assert_eq!(from_hex("00ff10"), Some(vec![0, 255, 16]));
        assert_eq!(from_hex("0g"), None);
        assert_eq!(to_hex(&[0, 255, 16]), "00ff10");
    }
}
