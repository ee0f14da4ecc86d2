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

//! Connection sharing.
//!
//! Local clients connect to a control socket, say hello, and ask to
//! be proxied. From then on they speak SSH channel messages, framed
//! as `[u32 length][u8 padding length][u8 type][payload]`, and their
//! channels are relayed over our connection under ids of our own: a
//! *mux proxy* channel records, for each of them, the client it
//! belongs to and the id the client uses.
use crate::buffer::ChannelBuffer;
use crate::channel::{ChanFlags, Channel, ChannelType, ExtendedUsage, InputState, IoFlags, OutputState};
use crate::config::{CHAN_TCP_PACKET_DEFAULT, CHAN_TCP_WINDOW_DEFAULT};
use crate::encoding::{Encoding, Reader};
use crate::handlers::CHAN_RBUF;
use crate::permission::{rfwd_bind_host, Direction, Permission, Who};
use crate::session::Session;
use crate::{msg, sys, ChannelId, Error};
use std::os::unix::io::IntoRawFd;
use std::os::unix::net::UnixListener;

/// Frames larger than this close the control connection.
const MUX_MAX_PACKET: usize = 256 * 1024;

/// Protocol state of a control connection.
#[derive(Debug, Default)]
pub struct MuxState {
    pub(crate) hello_sent: bool,
    pub(crate) hello_rcvd: bool,
    /// Frames are channel messages to relay.
    pub(crate) proxy: bool,
}

fn put_frame(out: &mut ChannelBuffer, body: &[u8]) {
    let mut f = Vec::with_capacity(body.len() + 4);
    f.extend_ssh_string(body);
    out.extend(&f)
}

fn failure(rid: u32, reason: &str) -> Vec<u8> {
    let mut reply = Vec::new();
    reply.push_u32_be(msg::mux::S_FAILURE);
    reply.push_u32_be(rid);
    reply.extend_ssh_string(reason.as_bytes());
    reply
}

/// Read up to `need` bytes in total into the input buffer,
/// never more, so that frames are read one at a time.
fn read_mux(c: &mut Channel, need: usize) -> usize {
    if c.input.len() < need {
        let rfd = match c.rfd {
            Some(fd) => fd,
            None => return 0,
        };
        let want = (need - c.input.len()).min(CHAN_RBUF);
        match c.input.read_from(rfd, want) {
            Err(ref e) if sys::is_transient(e) => {}
            Ok(n) if n > 0 => {}
            r => {
                debug!("channel {}: ctl read<=0 rfd {}: {:?}", c.id, rfd, r);
                c.read_failed();
                return 0;
            }
        }
    }
    c.input.len()
}

impl Session {
    /// Accept control connections on `listener`.
    pub fn new_mux_listener(&mut self, listener: UnixListener, control_path: &str) -> Result<ChannelId, Error> {
        listener.set_nonblocking(true)?;
        let sock = listener.into_raw_fd();
        Ok(self.new_channel(
            "mux-listener",
            ChannelType::MuxListener,
            Some(sock),
            Some(sock),
            None,
            CHAN_TCP_WINDOW_DEFAULT,
            CHAN_TCP_PACKET_DEFAULT,
            ExtendedUsage::Ignore,
            control_path,
            true,
        ))
    }

    pub(crate) fn post_mux_listener(&mut self, id: ChannelId) -> Result<(), Error> {
        match self.channels.get(id) {
            Some(c) if c.io_ready.contains(IoFlags::SOCK_R) => {}
            _ => return Ok(()),
        }
        debug!("multiplexing control connection");
        let newsock = match self.accept_on(id) {
            Some(s) => s,
            None => return Ok(()),
        };
        let euid = match sys::peer_uid(newsock) {
            Ok(uid) => uid,
            Err(e) => {
                error!("post_mux_listener: getpeereid failed: {}", e);
                let _ = sys::close(newsock);
                return Ok(());
            }
        };
        let uid = sys::getuid();
        if euid != 0 && euid != uid {
            error!("multiplex uid mismatch: peer euid {} != uid {}", euid, uid);
            let _ = sys::close(newsock);
            return Ok(());
        }
        let (window, maxpacket) = self.listener_window(id).unwrap_or((CHAN_TCP_WINDOW_DEFAULT, CHAN_TCP_PACKET_DEFAULT));
        let nc = self.new_channel(
            "mux-control",
            ChannelType::MuxClient(MuxState::default()),
            Some(newsock),
            Some(newsock),
            None,
            window,
            maxpacket,
            ExtendedUsage::Ignore,
            "mux-control",
            true,
        );
        debug!("post_mux_listener: new mux channel {} fd {}", nc, newsock);
        // Says hello.
        if !self.mux_read(nc, Vec::new())? {
            if let Some(c) = self.channels.get_mut(nc) {
                c.mark_dead()
            }
        }
        if let Some(c) = self.channels.get_mut(nc) {
            c.flags |= ChanFlags::LOCAL
        }
        Ok(())
    }

    pub(crate) fn pre_mux_client(&mut self, id: ChannelId) -> Result<(), Error> {
        let c = match self.channels.get_mut(id) {
            Some(c) => c,
            None => return Ok(()),
        };
        c.io_want = IoFlags::empty();
        if c.istate == InputState::Open && c.input.avail() >= CHAN_RBUF {
            c.io_want |= IoFlags::RFD
        }
        if c.istate == InputState::WaitDrain {
            // Drop any partial frame.
            c.input.clear();
            c.ibuf_empty(&mut self.write)?;
            c.rcvd_oclose(&mut self.write)?;
        }
        if c.output_open() {
            if !c.output.is_empty() {
                c.io_want |= IoFlags::WFD
            } else if c.ostate == OutputState::WaitDrain {
                c.obuf_empty()
            }
        }
        Ok(())
    }

    pub(crate) fn post_mux_client(&mut self, id: ChannelId) -> Result<(), Error> {
        self.mux_client_read(id)?;
        self.mux_client_write(id);
        Ok(())
    }

    fn mux_client_read(&mut self, id: ChannelId) -> Result<(), Error> {
        let frame = {
            let c = match self.channels.get_mut(id) {
                Some(c) => c,
                None => return Ok(()),
            };
            if !c.io_ready.contains(IoFlags::RFD) {
                return Ok(());
            }
            if c.istate != InputState::Open && c.istate != InputState::WaitDrain {
                return Ok(());
            }
            if read_mux(c, 4) < 4 {
                return Ok(());
            }
            let need = {
                use byteorder::{BigEndian, ByteOrder};
                BigEndian::read_u32(c.input.as_slice()) as usize
            };
            if need > MUX_MAX_PACKET {
                debug!("channel {}: packet too big {} > {}", id, need, MUX_MAX_PACKET);
                return c.rcvd_oclose(&mut self.write);
            }
            if read_mux(c, need + 4) < need + 4 {
                return Ok(());
            }
            let frame = c.input.as_slice()[4..4 + need].to_vec();
            c.input.consume(need + 4);
            frame
        };
        if !self.mux_read(id, frame)? {
            debug!("channel {}: mux_rcb failed", id);
            if let Some(c) = self.channels.get_mut(id) {
                c.mark_dead()
            }
        }
        Ok(())
    }

    fn mux_client_write(&mut self, id: ChannelId) {
        let c = match self.channels.get_mut(id) {
            Some(c) => c,
            None => return,
        };
        if !c.io_ready.contains(IoFlags::WFD) || c.output.is_empty() {
            return;
        }
        let wfd = match c.wfd {
            Some(fd) => fd,
            None => return,
        };
        match sys::write(wfd, c.output.as_slice()) {
            Ok(n) if n > 0 => c.output.consume(n),
            Err(ref e) if sys::is_transient(e) => {}
            _ => c.mark_dead(),
        }
    }

    /// Process one frame from a control client. The first call, with
    /// no frame, sends our hello. `Ok(false)` closes the connection.
    pub(crate) fn mux_read(&mut self, id: ChannelId, frame: Vec<u8>) -> Result<bool, Error> {
        let proxy = {
            let c = match self.channels.get_mut(id) {
                Some(c) => c,
                None => return Ok(true),
            };
            let state = match c.kind {
                ChannelType::MuxClient(ref mut state) => state,
                _ => return Ok(true),
            };
            if !state.hello_sent {
                let mut hello = Vec::new();
                hello.push_u32_be(msg::mux::HELLO);
                hello.push_u32_be(msg::mux::VERSION);
                state.hello_sent = true;
                put_frame(&mut c.output, &hello);
                debug!("channel {}: hello sent", id);
                return Ok(true);
            }
            state.proxy
        };
        if proxy {
            return self.proxy_downstream(id, &frame);
        }
        let c = match self.channels.get_mut(id) {
            Some(c) => c,
            None => return Ok(true),
        };
        let state = match c.kind {
            ChannelType::MuxClient(ref mut state) => state,
            _ => return Ok(true),
        };
        let mut r = frame.reader(0);
        let typ = match r.read_u32() {
            Ok(t) => t,
            Err(_) => return Ok(false),
        };
        debug!("channel {}: packet type {:#010x} len {}", id, typ, frame.len());
        let rid = if typ == msg::mux::HELLO {
            0
        } else {
            if !state.hello_rcvd {
                error!("expected MUX_MSG_HELLO({:#010x}), received {:#010x}", msg::mux::HELLO, typ);
                return Ok(false);
            }
            match r.read_u32() {
                Ok(rid) => rid,
                Err(_) => return Ok(false),
            }
        };
        let reply = match typ {
            msg::mux::HELLO => {
                if state.hello_rcvd {
                    error!("channel {}: HELLO received twice", id);
                    return Ok(false);
                }
                let ver = match r.read_u32() {
                    Ok(v) => v,
                    Err(_) => return Ok(false),
                };
                if ver != msg::mux::VERSION {
                    error!(
                        "unsupported multiplexing protocol version {} (expected {})",
                        ver,
                        msg::mux::VERSION
                    );
                    return Ok(false);
                }
                debug!("channel {}: client version {}", id, ver);
                while let (Ok(name), Ok(_)) = (r.read_string(), r.read_string()) {
                    debug!("unrecognised extension {:?}", String::from_utf8_lossy(name))
                }
                state.hello_rcvd = true;
                None
            }
            msg::mux::C_PROXY => {
                debug!("channel {}: proxy request", id);
                state.proxy = true;
                let mut reply = Vec::new();
                reply.push_u32_be(msg::mux::S_PROXY);
                reply.push_u32_be(rid);
                Some(reply)
            }
            _ => {
                error!("unsupported mux message {:#010x}", typ);
                Some(failure(rid, "unsupported request"))
            }
        };
        if let Some(reply) = reply {
            put_frame(&mut c.output, &reply)
        }
        Ok(true)
    }

    /// Relay a channel message from a mux client to the peer,
    /// giving new channels ids of our own.
    pub(crate) fn proxy_downstream(&mut self, downstream: ChannelId, frame: &[u8]) -> Result<bool, Error> {
        let mut r = frame.reader(0);
        let typ = match r.read_byte().and_then(|_| r.read_byte()) {
            Ok(t) => t,
            Err(_) => return Ok(false),
        };
        let rest = r.remaining();
        debug!("channel {}: down->up: type {}", downstream, typ);
        let mut modified = None;
        match typ {
            msg::CHANNEL_OPEN => {
                let mut r = rest.reader(0);
                let (ctype, downstream_id) = match (r.read_utf8(), r.read_u32()) {
                    (Ok(ctype), Ok(id)) => (ctype, id),
                    _ => {
                        error!("proxy_downstream: parse CHANNEL_OPEN");
                        return Ok(false);
                    }
                };
                let id = self.new_channel(
                    "mux-proxy",
                    ChannelType::MuxProxy { downstream, downstream_id },
                    None,
                    None,
                    None,
                    0,
                    0,
                    ExtendedUsage::Ignore,
                    ctype,
                    true,
                );
                let mut m = Vec::new();
                m.extend_ssh_string(ctype.as_bytes());
                m.push_u32_be(id.0);
                m.extend(r.remaining());
                modified = Some(m)
            }
            msg::CHANNEL_OPEN_CONFIRMATION => {
                let mut r = rest.reader(0);
                let (remote_id, downstream_id) = match (r.read_u32(), r.read_u32()) {
                    (Ok(a), Ok(b)) => (a, b),
                    _ => {
                        error!("proxy_downstream: parse CHANNEL_OPEN_CONFIRMATION");
                        return Ok(false);
                    }
                };
                let id = self.new_channel(
                    "mux-proxy",
                    ChannelType::MuxProxy { downstream, downstream_id },
                    None,
                    None,
                    None,
                    0,
                    0,
                    ExtendedUsage::Ignore,
                    "mux-down-connect",
                    true,
                );
                if let Some(c) = self.channels.get_mut(id) {
                    c.remote_id = Some(remote_id)
                }
                let mut m = Vec::new();
                m.push_u32_be(remote_id);
                m.push_u32_be(id.0);
                m.extend(r.remaining());
                modified = Some(m)
            }
            msg::GLOBAL_REQUEST => {
                let mut r = rest.reader(0);
                let request = match r.read_utf8() {
                    Ok(req) => req,
                    Err(_) => return Ok(false),
                };
                if request != "tcpip-forward" {
                    error!("proxy_downstream: unsupported request {}", request);
                    return Ok(false);
                }
                let (want_reply, host, port) = match (r.read_bool(), r.read_utf8(), r.read_u32()) {
                    (Ok(w), Ok(h), Ok(p)) => (w, h, p),
                    _ => return Ok(false),
                };
                if port > u16::max_value() as u32 {
                    error!("proxy_downstream: tcpip-forward for {}: bad port {}", host, port);
                    return Ok(false);
                }
                let mut perm = Permission::listen(host, port as u16);
                perm.host_to_connect = Some("<mux>".to_string());
                perm.downstream = Some(downstream);
                self.permissions.add(Who::User, Direction::Local, perm);
                if want_reply {
                    // Replies come back in order: relay this one.
                    self.global_confirms.push_back(Box::new(move |session: &mut Session, success: bool, data: &[u8]| {
                        let mut b = vec![0, if success { msg::REQUEST_SUCCESS } else { msg::REQUEST_FAILURE }];
                        b.extend(data);
                        session.mux_send(downstream, &b)
                    }))
                }
            }
            msg::CHANNEL_CLOSE => {
                if let Ok(remote_id) = rest.reader(0).read_u32() {
                    let proxy = self
                        .channels
                        .iter()
                        .find(|c| {
                            c.remote_id == Some(remote_id)
                                && match c.kind {
                                    ChannelType::MuxProxy { downstream: d, .. } => d == downstream,
                                    _ => false,
                                }
                        })
                        .map(|c| c.id);
                    if let Some(id) = proxy {
                        let close_rcvd = self
                            .channels
                            .get(id)
                            .map(|c| c.flags.contains(ChanFlags::CLOSE_RCVD))
                            .unwrap_or(false);
                        if close_rcvd {
                            self.free(id)
                        } else if let Some(c) = self.channels.get_mut(id) {
                            c.flags |= ChanFlags::CLOSE_SENT
                        }
                    }
                }
            }
            _ => {}
        }
        let body = match modified {
            Some(ref m) => &m[..],
            None => rest,
        };
        push_packet!(self.write, {
            self.write.push(typ);
            self.write.extend(body);
        });
        Ok(true)
    }

    /// Relay a message from the peer to the mux client owning proxy
    /// channel `id`. `rest` is the payload after the channel id.
    /// Returns whether the message was relayed.
    pub(crate) fn proxy_upstream(&mut self, id: ChannelId, typ: u8, rest: &[u8]) -> bool {
        let (downstream, downstream_id) = match self.channels.get(id).map(|c| &c.kind) {
            Some(ChannelType::MuxProxy { downstream, downstream_id }) => (*downstream, *downstream_id),
            _ => return false,
        };
        match typ {
            msg::CHANNEL_CLOSE
            | msg::CHANNEL_DATA
            | msg::CHANNEL_EOF
            | msg::CHANNEL_EXTENDED_DATA
            | msg::CHANNEL_OPEN_CONFIRMATION
            | msg::CHANNEL_OPEN_FAILURE
            | msg::CHANNEL_WINDOW_ADJUST
            | msg::CHANNEL_SUCCESS
            | msg::CHANNEL_FAILURE
            | msg::CHANNEL_REQUEST => {}
            _ => {
                debug!("channel {}: proxy_upstream: unsupported type {}", id, typ);
                return false;
            }
        }
        let mut b = Vec::with_capacity(rest.len() + 6);
        b.push(0);
        b.push(typ);
        b.push_u32_be(downstream_id);
        b.extend(rest);
        match self.channels.get_mut(downstream) {
            Some(d) => put_frame(&mut d.output, &b),
            None => debug!("channel {}: downstream {} is gone", id, downstream),
        }
        debug!("channel {}: up->down: type {}", id, typ);
        match typ {
            msg::CHANNEL_OPEN_CONFIRMATION => {
                if let Ok(remote_id) = rest.reader(0).read_u32() {
                    if let Some(c) = self.channels.get_mut(id) {
                        c.remote_id = Some(remote_id)
                    }
                }
            }
            msg::CHANNEL_CLOSE => {
                let close_sent = self
                    .channels
                    .get(id)
                    .map(|c| c.flags.contains(ChanFlags::CLOSE_SENT))
                    .unwrap_or(false);
                if close_sent {
                    self.free(id)
                } else if let Some(c) = self.channels.get_mut(id) {
                    c.flags |= ChanFlags::CLOSE_RCVD
                }
            }
            _ => {}
        }
        true
    }

    /// Send a frame to a mux client.
    pub(crate) fn mux_send(&mut self, downstream: ChannelId, body: &[u8]) {
        if let Some(d) = self.channels.get_mut(downstream) {
            put_frame(&mut d.output, body)
        }
    }

    /// A mux client is being freed: its proxy channels become plain
    /// channels, closed on our side, and its remote forwardings are
    /// cancelled.
    pub(crate) fn mux_client_teardown(&mut self, id: ChannelId) {
        for c in self.channels.iter_mut() {
            let owned = match c.kind {
                ChannelType::MuxProxy { downstream, .. } => downstream == id,
                _ => false,
            };
            if owned {
                debug!("channel {}: detached from mux client {}", c.id, id);
                c.kind = ChannelType::Open;
                c.istate = InputState::Closed;
                c.ostate = OutputState::Closed;
            }
        }
        for perm in self.permissions.take_downstream(id) {
            debug!(
                "channel {}: cleanup remote forward for {:?}:{}",
                id, perm.listen_host, perm.listen_port
            );
            let mut req = Vec::new();
            req.extend_ssh_string(rfwd_bind_host(perm.listen_host.as_ref().map(|h| h.as_str())).as_bytes());
            req.push_u32_be(perm.listen_port as u32);
            self.global_request("cancel-tcpip-forward", &req, None)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::Config;
    use std::sync::Arc;

    fn mux_client(session: &mut Session) -> ChannelId {
        let id = session.new_channel(
            "mux-control",
            ChannelType::MuxClient(MuxState::default()),
            None,
            None,
            None,
            0,
            0,
            ExtendedUsage::Ignore,
            "mux-control",
            true,
        );
        session.channels.get_mut(id).unwrap().flags |= ChanFlags::LOCAL;
        id
    }

    fn frames(buf: &ChannelBuffer) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        let mut r = buf.as_slice().reader(0);
        while let Ok(f) = r.read_string() {
            out.push(f.to_vec())
        }
        out
    }

    #[test]
    fn hello_then_proxy() {
        crate::init();
        let mut session = Session::new(Arc::new(Config::default()));
        let id = mux_client(&mut session);
        assert!(session.mux_read(id, Vec::new()).unwrap());

        // Anything before hello is fatal to the control connection.
        let mut early = Vec::new();
        early.push_u32_be(msg::mux::C_PROXY);
        early.push_u32_be(1);
        assert!(!session.mux_read(id, early.clone()).unwrap());

        let mut hello = Vec::new();
        hello.push_u32_be(msg::mux::HELLO);
        hello.push_u32_be(msg::mux::VERSION);
        assert!(session.mux_read(id, hello).unwrap());

        let mut other = Vec::new();
        other.push_u32_be(0x1000_0002);
        other.push_u32_be(5);
        assert!(session.mux_read(id, other).unwrap());
        assert!(session.mux_read(id, early).unwrap());

        let out = frames(&session.channel(id).unwrap().output);
        assert_eq!(out.len(), 3);
        assert_eq!(&out[0][..4], &[0, 0, 0, 1]);
        let mut r = out[1].reader(0);
        assert_eq!(r.read_u32().unwrap(), msg::mux::S_FAILURE);
        assert_eq!(r.read_u32().unwrap(), 5);
        assert_eq!(r.read_utf8().unwrap(), "unsupported request");
        let mut r = out[2].reader(0);
        assert_eq!(r.read_u32().unwrap(), msg::mux::S_PROXY);
        assert_eq!(r.read_u32().unwrap(), 1);
        match session.channel(id).unwrap().kind {
            ChannelType::MuxClient(ref s) => assert!(s.proxy),
            _ => panic!(),
        }
    }

    #[test]
    fn bad_version() {
        let mut session = Session::new(Arc::new(Config::default()));
        let id = mux_client(&mut session);
        session.mux_read(id, Vec::new()).unwrap();
        let mut hello = Vec::new();
        hello.push_u32_be(msg::mux::HELLO);
        hello.push_u32_be(3);
        assert!(!session.mux_read(id, hello).unwrap());
    }

    #[test]
    fn teardown_cancels_forwardings() {
        crate::init();
        let mut session = Session::new(Arc::new(Config::default()));
        let id = mux_client(&mut session);
        let mut frame = vec![0, msg::GLOBAL_REQUEST];
        frame.extend_ssh_string(b"tcpip-forward");
        frame.push(1);
        frame.extend_ssh_string(b"localhost");
        frame.push_u32_be(8022);
        assert!(session.proxy_downstream(id, &frame).unwrap());
        assert!(session.permissions().find_listen(Some("localhost"), 8022).is_some());
        session.take_packets();

        session.free(id);
        assert!(session.permissions().find_listen(Some("localhost"), 8022).is_none());
        let packets = session.take_packets();
        assert_eq!(packets.len(), 1);
        let mut r = packets[0].reader(1);
        assert_eq!(r.read_utf8().unwrap(), "cancel-tcpip-forward");
        assert_eq!(r.read_byte().unwrap(), 0);
        assert_eq!(r.read_utf8().unwrap(), "localhost");
        assert_eq!(r.read_u32().unwrap(), 8022);
    }

    #[test]
    fn close_only_reaches_own_proxies() {
        crate::init();
        let mut session = Session::new(Arc::new(Config::default()));
        let a = mux_client(&mut session);
        let b = mux_client(&mut session);
        let plain = session.new_channel(
            "session",
            ChannelType::Open,
            None,
            None,
            None,
            1000,
            2000,
            ExtendedUsage::Ignore,
            "session",
            true,
        );
        session.channels.get_mut(plain).unwrap().remote_id = Some(7);

        let mut confirm = vec![0, msg::CHANNEL_OPEN_CONFIRMATION];
        confirm.push_u32_be(7);
        confirm.push_u32_be(3);
        confirm.push_u32_be(1000);
        confirm.push_u32_be(2000);
        assert!(session.proxy_downstream(b, &confirm).unwrap());
        let proxy = session
            .channels()
            .find(|c| match c.kind {
                ChannelType::MuxProxy { downstream, .. } => downstream == b,
                _ => false,
            })
            .map(|c| c.id)
            .unwrap();
        let close_sent =
            |session: &Session, id: ChannelId| session.channel(id).unwrap().flags.contains(ChanFlags::CLOSE_SENT);

        let mut close = vec![0, msg::CHANNEL_CLOSE];
        close.push_u32_be(7);
        session.proxy_downstream(a, &close).unwrap();
        assert!(!close_sent(&session, plain));
        assert!(!close_sent(&session, proxy));

        session.proxy_downstream(b, &close).unwrap();
        assert!(!close_sent(&session, plain));
        assert!(close_sent(&session, proxy));
    }
}
