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

//! Messages from the peer.
use crate::channel::{ChanFlags, Channel, ChannelType, ExtendedUsage, InputState, OutputState};
use crate::config::{Endpoint, Forward, Side, CHAN_TCP_PACKET_DEFAULT};
use crate::encoding::{Encoding, Position, Reader};
use crate::forward::Route;
use crate::session::{Handler, Session};
use crate::{msg, ChannelId, ChannelOpenFailure, Error};
use std::path::PathBuf;

/// The peer may overrun the window by `1 / WINDOW_GRACE` of its
/// maximum before the connection is closed.
const WINDOW_GRACE: u32 = 10;

/// The peer's side of a channel it opens.
#[derive(Debug, Clone, Copy)]
struct PeerChannel {
    id: u32,
    window: u32,
    maxpacket: u32,
}

/// Result of an inbound `CHANNEL_OPEN`.
enum Opened {
    Local(ChannelId),
    /// Handed over to a mux client, which will answer.
    Relayed,
}

impl Channel {
    /// Charge `len` bytes from the peer against the local window.
    fn charge_window(&mut self, len: u32) -> Result<(), Error> {
        if len > self.local_window {
            self.local_window_exceeded = self.local_window_exceeded.saturating_add(len - self.local_window);
            info!(
                "channel {}: rcvd too much data {}, win {}/{} (excess {})",
                self.id, len, self.local_window, self.local_window_max, self.local_window_exceeded
            );
            self.local_window = 0;
            if self.local_window_exceeded > self.local_window_max / WINDOW_GRACE {
                error!("channel {}: peer ignored channel window", self.id);
                return Err(Error::WindowExceeded(self.id));
            }
        } else {
            self.local_window -= len;
            self.local_window_exceeded = 0;
        }
        Ok(())
    }
}

impl Session {
    /// Process one message from the peer. `payload` starts with the
    /// message number. Errors are fatal to the connection.
    pub fn handle_message<H: Handler>(&mut self, handler: &mut H, payload: &[u8]) -> Result<(), Error> {
        let typ = match payload.first() {
            Some(&t) => t,
            None => return Err(Error::IndexOutOfBounds),
        };
        let mut r = payload.reader(1);
        match typ {
            msg::CHANNEL_OPEN => self.input_channel_open(handler, &mut r),
            msg::GLOBAL_REQUEST => self.input_global_request(handler, &mut r),
            msg::REQUEST_SUCCESS | msg::REQUEST_FAILURE => {
                self.input_global_reply(typ == msg::REQUEST_SUCCESS, r.remaining());
                Ok(())
            }
            msg::CHANNEL_OPEN_CONFIRMATION
            | msg::CHANNEL_OPEN_FAILURE
            | msg::CHANNEL_WINDOW_ADJUST
            | msg::CHANNEL_DATA
            | msg::CHANNEL_EXTENDED_DATA
            | msg::CHANNEL_EOF
            | msg::CHANNEL_CLOSE
            | msg::CHANNEL_REQUEST
            | msg::CHANNEL_SUCCESS
            | msg::CHANNEL_FAILURE => self.input_channel_message(handler, typ, &mut r),
            msg::IGNORE => Ok(()),
            msg::DEBUG => {
                r.read_byte()?;
                debug!("Remote: {}", String::from_utf8_lossy(r.read_string()?));
                Ok(())
            }
            _ => {
                error!("unexpected message type {}", typ);
                Err(Error::Inconsistent)
            }
        }
    }

    fn input_channel_message<H: Handler>(&mut self, handler: &mut H, typ: u8, r: &mut Position) -> Result<(), Error> {
        let num = r.read_u32()?;
        let id = match self.channels.get_public(num) {
            Some(c) => c.id,
            None => match typ {
                // Late replies for a channel we already freed.
                msg::CHANNEL_WINDOW_ADJUST | msg::CHANNEL_SUCCESS | msg::CHANNEL_FAILURE => {
                    info!("message {} for unknown channel {}", typ, num);
                    return Ok(());
                }
                _ => {
                    error!("message {} referred to nonexistent channel {}", typ, num);
                    return Err(Error::WrongChannel(num));
                }
            },
        };
        if self.proxy_upstream(id, typ, r.remaining()) {
            return Ok(());
        }
        match typ {
            msg::CHANNEL_OPEN_CONFIRMATION => self.input_open_confirmation(id, r),
            msg::CHANNEL_OPEN_FAILURE => self.input_open_failure(id, r),
            msg::CHANNEL_WINDOW_ADJUST => self.input_window_adjust(id, r),
            msg::CHANNEL_DATA => self.input_data(id, r),
            msg::CHANNEL_EXTENDED_DATA => self.input_extended_data(id, r),
            msg::CHANNEL_EOF => {
                if let Some(c) = self.channels.get_mut(id) {
                    c.rcvd_ieof();
                    if c.force_drain && c.istate == InputState::Open {
                        debug!("channel {}: FORCE input drain", id);
                        c.istate = InputState::WaitDrain;
                        if c.input.is_empty() {
                            c.ibuf_empty(&mut self.write)?
                        }
                    }
                }
                Ok(())
            }
            msg::CHANNEL_CLOSE => match self.channels.get_mut(id) {
                Some(c) => c.rcvd_oclose(&mut self.write),
                None => Ok(()),
            },
            msg::CHANNEL_REQUEST => self.input_channel_request(handler, id, r),
            _ => {
                let cc = self.channels.get_mut(id).and_then(|c| c.status_confirms.pop_front());
                if let Some(cc) = cc {
                    (cc.cb)(self, id, typ == msg::CHANNEL_SUCCESS)
                }
                Ok(())
            }
        }
    }

    fn input_open_confirmation(&mut self, id: ChannelId, r: &mut Position) -> Result<(), Error> {
        let remote_id = r.read_u32()?;
        let remote_window = r.read_u32()?;
        let remote_maxpacket = r.read_u32()?;
        let cb = {
            let c = match self.channels.get_mut(id) {
                Some(c) => c,
                None => return Ok(()),
            };
            match c.kind {
                ChannelType::Opening => {}
                _ => return Err(Error::NotOpening(id)),
            }
            c.remote_id = Some(remote_id);
            c.remote_window = remote_window;
            c.remote_maxpacket = remote_maxpacket;
            c.kind = ChannelType::Open;
            debug!("channel {}: open confirm rwindow {} rmax {}", id, remote_window, remote_maxpacket);
            c.open_confirm.take()
        };
        if let Some(cb) = cb {
            cb(self, id, true);
        }
        self.set_used_time(id);
        Ok(())
    }

    fn input_open_failure(&mut self, id: ChannelId, r: &mut Position) -> Result<(), Error> {
        let reason = r.read_u32()?;
        let description = r.read_utf8().unwrap_or("");
        let cb = {
            let c = match self.channels.get_mut(id) {
                Some(c) => c,
                None => return Ok(()),
            };
            match c.kind {
                ChannelType::Opening => {}
                _ => return Err(Error::NotOpening(id)),
            }
            c.open_confirm.take()
        };
        let reason = ChannelOpenFailure::from_u32(reason)
            .map(|f| f.description())
            .unwrap_or("unknown reason");
        if description.is_empty() {
            info!("channel {}: open failed: {}", id, reason)
        } else {
            info!("channel {}: open failed: {}: {}", id, reason, description)
        }
        if let Some(cb) = cb {
            cb(self, id, false)
        }
        if let Some(c) = self.channels.get_mut(id) {
            c.mark_dead()
        }
        Ok(())
    }

    fn input_window_adjust(&mut self, id: ChannelId, r: &mut Position) -> Result<(), Error> {
        let adjust = r.read_u32()?;
        let c = match self.channels.get_mut(id) {
            Some(c) => c,
            None => return Ok(()),
        };
        debug!("channel {}: rcvd adjust {}", id, adjust);
        c.remote_window = match c.remote_window.checked_add(adjust) {
            Some(w) => w,
            None => {
                error!("channel {}: adjust {} overflows remote window {}", id, adjust, c.remote_window);
                return Err(Error::WindowOverflow(id, adjust));
            }
        };
        Ok(())
    }

    fn input_data(&mut self, id: ChannelId, r: &mut Position) -> Result<(), Error> {
        let data = r.read_string()?;
        let c = match self.channels.get_mut(id) {
            Some(c) => c,
            None => return Ok(()),
        };
        match c.kind {
            ChannelType::Open | ChannelType::RDynamicOpen | ChannelType::RDynamicFinish(_) | ChannelType::X11Open => {}
            // Might happen while closing.
            _ => return Ok(()),
        }
        let len = data.len() as u32;
        if c.ostate != OutputState::Open {
            // The peer already counted it: pretend we consumed it, so
            // that the window is reopened.
            c.local_window = c.local_window.saturating_sub(len);
            c.local_consumed = c.local_consumed.saturating_add(len);
            return Ok(());
        }
        if len > c.local_maxpacket {
            info!("channel {}: rcvd big packet {}, maxpack {}", id, len, c.local_maxpacket);
            return Ok(());
        }
        c.charge_window(len)?;
        c.output.extend(data);
        Ok(())
    }

    fn input_extended_data(&mut self, id: ChannelId, r: &mut Position) -> Result<(), Error> {
        let code = r.read_u32()?;
        let data = r.read_string()?;
        let c = match self.channels.get_mut(id) {
            Some(c) => c,
            None => return Ok(()),
        };
        if !c.is_open() {
            info!("channel {}: ext data for non open", id);
            return Ok(());
        }
        if c.flags.contains(ChanFlags::EOF_RCVD) {
            error!("Received extended_data after EOF on channel {}.", id);
            return Err(Error::Inconsistent);
        }
        if c.efd.is_none() || c.extended_usage != ExtendedUsage::Write || code != msg::EXTENDED_DATA_STDERR {
            info!("channel {}: bad ext data", id);
            return Ok(());
        }
        let len = data.len() as u32;
        if len > c.local_window {
            info!("channel {}: rcvd too much extended_data {}, win {}", id, len, c.local_window);
            return Ok(());
        }
        debug!("channel {}: rcvd ext data {}", id, len);
        c.extended.extend(data);
        c.local_window -= len;
        Ok(())
    }

    fn input_channel_request<H: Handler>(&mut self, handler: &mut H, id: ChannelId, r: &mut Position) -> Result<(), Error> {
        let request = r.read_utf8()?;
        let want_reply = r.read_bool()?;
        debug!("channel {}: rcvd request for {} reply {}", id, request, want_reply);
        let success = if request == "eow@openssh.com" {
            if let Some(c) = self.channels.get_mut(id) {
                c.rcvd_eow()
            }
            true
        } else {
            handler.channel_request(self, id, request, r.remaining())
        };
        if want_reply {
            let remote_id = match self.channels.get(id) {
                Some(c) if !c.flags.contains(ChanFlags::CLOSE_SENT) => c.require_remote_id()?,
                _ => return Ok(()),
            };
            push_packet!(self.write, {
                self.write.push(if success { msg::CHANNEL_SUCCESS } else { msg::CHANNEL_FAILURE });
                self.write.push_u32_be(remote_id);
            })
        }
        Ok(())
    }

    fn input_channel_open<H: Handler>(&mut self, handler: &mut H, r: &mut Position) -> Result<(), Error> {
        let ctype = r.read_utf8()?;
        let peer = PeerChannel {
            id: r.read_u32()?,
            window: r.read_u32()?,
            maxpacket: r.read_u32()?,
        };
        debug!(
            "input_channel_open: ctype {} rchan {} win {} max {}",
            ctype, peer.id, peer.window, peer.maxpacket
        );
        let opened = match self.config.side {
            Side::Client => self.client_channel_open(ctype, peer, r),
            Side::Server => self.server_channel_open(handler, ctype, peer, r),
        };
        let id = match opened {
            Ok(Opened::Local(id)) => id,
            Ok(Opened::Relayed) => return Ok(()),
            Err((reason, description)) => {
                debug!("input_channel_open: failure {}", ctype);
                self.open_failure(peer.id, reason, description);
                return Ok(());
            }
        };
        let connecting = match self.channels.get_mut(id) {
            Some(c) => {
                c.remote_id = Some(peer.id);
                c.remote_window = peer.window;
                c.remote_maxpacket = peer.maxpacket;
                if let ChannelType::Connecting(_) = c.kind { true } else { false }
            }
            None => return Ok(()),
        };
        debug!("input_channel_open: confirm {}", ctype);
        if !connecting {
            self.open_confirmation(id)?
        }
        Ok(())
    }

    /// Opens the server may send us.
    fn client_channel_open(
        &mut self,
        ctype: &str,
        peer: PeerChannel,
        r: &mut Position,
    ) -> Result<Opened, (ChannelOpenFailure, &'static str)> {
        let refused = (ChannelOpenFailure::AdministrativelyProhibited, "open failed");
        let route = match ctype {
            "forwarded-tcpip" => {
                let fields = r.remaining();
                let (host, port, originator, originator_port) =
                    match (r.read_utf8(), r.read_u32(), r.read_utf8(), r.read_u32()) {
                        (Ok(a), Ok(b), Ok(c), Ok(d)) => (a, b, c, d),
                        _ => return Err(refused),
                    };
                debug!(
                    "forwarded-tcpip: listen {} port {}, originator {} port {}",
                    host, port, originator, originator_port
                );
                if port > u16::max_value() as u32 {
                    error!("invalid listen port {}", port);
                    return Err(refused);
                }
                if originator_port > u16::max_value() as u32 {
                    error!("invalid originator port {}", originator_port);
                    return Err(refused);
                }
                match self.connect_by_listen_address(host, port as u16, ctype, originator) {
                    Some(Route::Downstream(downstream)) => return Ok(self.relay_open(downstream, ctype, peer, fields)),
                    Some(Route::Local(id)) => id,
                    None => return Err(refused),
                }
            }
            "forwarded-streamlocal@openssh.com" => {
                let fields = r.remaining();
                let path = match r.read_utf8() {
                    Ok(p) => p,
                    Err(_) => return Err(refused),
                };
                // Reserved.
                let _ = r.read_string();
                debug!("forwarded-streamlocal: listen path {}", path);
                match self.connect_by_listen_path(path, ctype, "forwarded-streamlocal") {
                    Some(Route::Downstream(downstream)) => return Ok(self.relay_open(downstream, ctype, peer, fields)),
                    Some(Route::Local(id)) => id,
                    None => return Err(refused),
                }
            }
            "x11" => {
                let (originator, originator_port) = match (r.read_utf8(), r.read_u32()) {
                    (Ok(a), Ok(b)) => (a, b),
                    _ => return Err(refused),
                };
                match self.open_x11(originator, originator_port) {
                    Some(id) => id,
                    None => return Err(refused),
                }
            }
            "auth-agent@openssh.com" => match self.open_agent() {
                Some(id) => id,
                None => return Err(refused),
            },
            _ => {
                info!("input_channel_open: unsupported channel type {}", ctype);
                return Err((ChannelOpenFailure::UnknownChannelType, "unknown channel type"));
            }
        };
        Ok(Opened::Local(route))
    }

    /// Opens the client may send us.
    fn server_channel_open<H: Handler>(
        &mut self,
        handler: &mut H,
        ctype: &str,
        peer: PeerChannel,
        r: &mut Position,
    ) -> Result<Opened, (ChannelOpenFailure, &'static str)> {
        let refused = (ChannelOpenFailure::AdministrativelyProhibited, "open failed");
        let failure = |e: ChannelOpenFailure| (e, e.description());
        match ctype {
            "session" => {
                // No descriptors until the session's command starts.
                let id = self.new_channel(
                    "session",
                    ChannelType::Larval,
                    None,
                    None,
                    None,
                    0,
                    CHAN_TCP_PACKET_DEFAULT,
                    ExtendedUsage::Write,
                    "server-session",
                    true,
                );
                // Known before the handler runs, so that it may send
                // requests on the channel.
                if let Some(c) = self.channels.get_mut(id) {
                    c.remote_id = Some(peer.id);
                    c.remote_window = peer.window;
                    c.remote_maxpacket = peer.maxpacket;
                }
                if handler.channel_open_session(self, id) {
                    Ok(Opened::Local(id))
                } else {
                    debug!("session open failed, free channel {}", id);
                    self.free(id);
                    Err(refused)
                }
            }
            "direct-tcpip" => {
                let (host, port, originator, originator_port) =
                    match (r.read_utf8(), r.read_u32(), r.read_utf8(), r.read_u32()) {
                        (Ok(a), Ok(b), Ok(c), Ok(d)) => (a, b, c, d),
                        _ => return Err(refused),
                    };
                if port > u16::max_value() as u32 || originator_port > u16::max_value() as u32 {
                    error!("direct-tcpip: invalid port");
                    return Err(refused);
                }
                debug!(
                    "direct-tcpip: originator {} port {}, target {} port {}",
                    originator, originator_port, host, port
                );
                if !self.config.allow_tcp_forwarding {
                    info!(
                        "refused local port forward: originator {} port {}, target {} port {}",
                        originator, originator_port, host, port
                    );
                    return Err(refused);
                }
                let rname = format!("{} port {}", originator, originator_port);
                self.connect_to_port(host, port as u16, ctype, &rname)
                    .map(Opened::Local)
                    .map_err(failure)
            }
            "direct-streamlocal@openssh.com" => {
                let (path, originator, originator_port) = match (r.read_utf8(), r.read_utf8(), r.read_u32()) {
                    (Ok(a), Ok(b), Ok(c)) => (a, b, c),
                    _ => return Err(refused),
                };
                debug!("direct-streamlocal: originator {} port {}, target {}", originator, originator_port, path);
                if !self.config.allow_streamlocal_forwarding {
                    info!("refused streamlocal port forward: originator {} port {}, target {}", originator, originator_port, path);
                    return Err(refused);
                }
                self.connect_to_path(path, ctype, "direct-streamlocal")
                    .map(Opened::Local)
                    .map_err(failure)
            }
            _ => {
                info!("input_channel_open: unsupported channel type {}", ctype);
                Err((ChannelOpenFailure::UnknownChannelType, "unknown channel type"))
            }
        }
    }

    /// Hand an open over to the mux client that requested the
    /// forwarding. `fields` are the type-specific fields.
    fn relay_open(&mut self, downstream: ChannelId, ctype: &str, peer: PeerChannel, fields: &[u8]) -> Opened {
        debug!("input_channel_open: {} for mux client {}", ctype, downstream);
        let mut b = vec![0, msg::CHANNEL_OPEN];
        b.extend_ssh_string(ctype.as_bytes());
        b.push_u32_be(peer.id);
        b.push_u32_be(peer.window);
        b.push_u32_be(peer.maxpacket);
        b.extend(fields);
        self.mux_send(downstream, &b);
        Opened::Relayed
    }

    fn input_global_request<H: Handler>(&mut self, handler: &mut H, r: &mut Position) -> Result<(), Error> {
        let request = r.read_utf8()?;
        let want_reply = r.read_bool()?;
        debug!("input_global_request: rtype {} want_reply {}", request, want_reply);
        let mut reply = Vec::new();
        let server = self.config.side == Side::Server;
        let success = match request {
            "tcpip-forward" if server => {
                let host = r.read_utf8()?;
                let port = r.read_u32()?;
                debug!("tcpip-forward listen {} port {}", host, port);
                let mut fwd = Forward {
                    listen: Endpoint::Tcp {
                        host: Some(host.to_string()),
                        port: port as u16,
                    },
                    connect: None,
                    allocated_port: None,
                };
                if port > u16::max_value() as u32
                    || !self.remote_forward_allowed(&fwd)
                    || (!want_reply && port == 0)
                {
                    self.send_debug("Server has disabled port forwarding.");
                    false
                } else {
                    match self.setup_remote_forward(&mut fwd) {
                        Ok(()) => {
                            if port == 0 {
                                if let Some(p) = fwd.allocated_port {
                                    reply.push_u32_be(p as u32)
                                }
                            }
                            true
                        }
                        Err(e) => {
                            debug!("tcpip-forward {}:{}: {}", host, port, e);
                            false
                        }
                    }
                }
            }
            "cancel-tcpip-forward" if server => {
                let host = r.read_utf8()?;
                let port = r.read_u32()?;
                debug!("cancel-tcpip-forward addr {} port {}", host, port);
                port <= u16::max_value() as u32
                    && self.cancel_remote_forward(&Forward {
                        listen: Endpoint::Tcp {
                            host: Some(host.to_string()),
                            port: port as u16,
                        },
                        connect: None,
                        allocated_port: None,
                    })
            }
            "streamlocal-forward@openssh.com" if server => {
                let path = r.read_utf8()?;
                debug!("streamlocal-forward listen path {}", path);
                let mut fwd = Forward {
                    listen: Endpoint::Unix(PathBuf::from(path)),
                    connect: None,
                    allocated_port: None,
                };
                if !self.remote_forward_allowed(&fwd) {
                    self.send_debug("Server has disabled streamlocal forwarding.");
                    false
                } else {
                    match self.setup_remote_forward(&mut fwd) {
                        Ok(()) => true,
                        Err(e) => {
                            debug!("streamlocal-forward {}: {}", path, e);
                            false
                        }
                    }
                }
            }
            "cancel-streamlocal-forward@openssh.com" if server => {
                let path = r.read_utf8()?;
                debug!("cancel-streamlocal-forward path {}", path);
                self.cancel_remote_forward(&Forward {
                    listen: Endpoint::Unix(PathBuf::from(path)),
                    connect: None,
                    allocated_port: None,
                })
            }
            _ => handler.global_request(self, request, r.remaining()),
        };
        if want_reply {
            if !success {
                reply.clear()
            }
            self.request_reply(success, &reply)
        }
        Ok(())
    }

    fn input_global_reply(&mut self, success: bool, data: &[u8]) {
        match self.global_confirms.pop_front() {
            Some(cb) => cb(self, success, data),
            None => debug!("global request reply with no pending request"),
        }
    }
}
