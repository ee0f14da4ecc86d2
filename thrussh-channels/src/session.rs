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
use crate::channel::*;
use crate::config::Config;
use crate::encoding::{Encoding, Reader};
use crate::permission::Permissions;
use crate::table::ChannelTable;
use crate::x11::X11State;
use crate::{msg, ChannelId, ChannelOpenFailure, Disconnect, Error};
use cryptovec::CryptoVec;
use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::sync::Arc;

/// Continuation for a global request we sent: called with the
/// outcome and the reply's payload.
pub type GlobalConfirm = Box<dyn FnOnce(&mut Session, bool, &[u8])>;

/// A connection's channels, and everything they share.
pub struct Session {
    pub(crate) config: Arc<Config>,
    pub(crate) channels: ChannelTable,
    pub(crate) permissions: Permissions,
    pub(crate) write: CryptoVec,
    pub(crate) x11: X11State,
    pub(crate) global_confirms: VecDeque<GlobalConfirm>,
    /// Last read or write on any channel.
    pub(crate) lastused: u64,
    /// Collective inactivity deadline of open channels.
    pub(crate) global_deadline: u64,
    pub(crate) now: u64,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("channels", &self.channels)
            .field("permissions", &self.permissions)
            .field("pending_global_confirms", &self.global_confirms.len())
            .finish()
    }
}

/// Decisions the channel layer leaves to the session layer.
#[allow(unused_variables)]
pub trait Handler {
    /// The peer wants a `session` channel. The channel exists, as a
    /// larval channel, when this is called. Once the confirmation is
    /// sent, attach descriptors with
    /// [`Session::set_fds`](struct.Session.html#method.set_fds), for
    /// instance on a `shell` request. Refuse by default.
    fn channel_open_session(&mut self, session: &mut Session, channel: ChannelId) -> bool {
        false
    }

    /// A channel request the channel layer does not handle. Return
    /// `true` to report success to the peer.
    fn channel_request(
        &mut self,
        session: &mut Session,
        channel: ChannelId,
        request: &str,
        data: &[u8],
    ) -> bool {
        false
    }

    /// A global request the channel layer does not handle.
    fn global_request(&mut self, session: &mut Session, request: &str, data: &[u8]) -> bool {
        false
    }
}

impl Handler for () {}

impl Session {
    /// Create a session.
    pub fn new(config: Arc<Config>) -> Self {
        let global_deadline = config.global_timeout();
        let mut permissions = Permissions::default();
        if let crate::Side::Server = config.side {
            permissions.permit_all(crate::Direction::Local);
            permissions.permit_all(crate::Direction::Remote);
        }
        Session {
            channels: ChannelTable::new(config.max_channels),
            config,
            permissions,
            write: CryptoVec::new(),
            x11: X11State::default(),
            global_confirms: VecDeque::new(),
            lastused: 0,
            global_deadline,
            now: 0,
        }
    }

    /// Retrieves the configuration of this session.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The time of the last tick, in seconds.
    pub fn now(&self) -> u64 {
        self.now
    }

    pub fn channel(&self, id: ChannelId) -> Option<&Channel> {
        self.channels.get(id)
    }

    /// All channels, in table order.
    pub fn channels(&self) -> impl Iterator<Item = &Channel> {
        self.channels.iter()
    }

    pub fn permissions(&self) -> &Permissions {
        &self.permissions
    }

    pub fn permissions_mut(&mut self) -> &mut Permissions {
        &mut self.permissions
    }

    /// Drain the payloads queued for the peer.
    pub fn take_packets(&mut self) -> Vec<CryptoVec> {
        let mut packets = Vec::new();
        {
            let mut r = self.write.reader(0);
            while let Ok(p) = r.read_string() {
                packets.push(CryptoVec::from_slice(p))
            }
        }
        self.write.clear();
        packets
    }

    /// Queue a disconnection message. Nothing else should be sent
    /// afterwards.
    pub fn disconnect(&mut self, reason: Disconnect, description: &str, language_tag: &str) {
        push_packet!(self.write, {
            self.write.push(msg::DISCONNECT);
            self.write.push_u32_be(reason as u32);
            self.write.extend_ssh_string(description.as_bytes());
            self.write.extend_ssh_string(language_tag.as_bytes());
        })
    }

    /// Disconnect because of `err`.
    pub fn disconnect_on_error(&mut self, err: &Error) {
        error!("disconnecting: {}", err);
        let reason = match *err {
            Error::IO(_) | Error::CannotListen => Disconnect::ByApplication,
            _ => Disconnect::ProtocolError,
        };
        self.disconnect(reason, &err.to_string(), "")
    }

    /// Queue a debug message, shown to the peer's user.
    pub(crate) fn send_debug(&mut self, message: &str) {
        push_packet!(self.write, {
            self.write.push(msg::DEBUG);
            self.write.push(0);
            self.write.extend_ssh_string(message.as_bytes());
            self.write.extend_ssh_string(b"");
        })
    }

    /// Allocate a channel in the first free slot.
    pub fn new_channel(
        &mut self,
        ctype: &str,
        kind: ChannelType,
        rfd: Option<RawFd>,
        wfd: Option<RawFd>,
        efd: Option<RawFd>,
        window: u32,
        maxpacket: u32,
        extended_usage: ExtendedUsage,
        remote_name: &str,
        nonblock: bool,
    ) -> ChannelId {
        let now = self.now;
        let inactive_deadline = self.config.timeout_for(ctype);
        let id = self.channels.insert_with(|id| {
            let mut c = Channel::new(id, ctype, kind, window, maxpacket, remote_name, now);
            c.register_fds(rfd, wfd, efd, extended_usage, nonblock, false);
            c.inactive_deadline = inactive_deadline;
            c
        });
        debug!("channel {}: new {} [{}] (inactive timeout: {})", id, ctype, remote_name, inactive_deadline);
        id
    }

    /// Attach descriptors to a larval channel, making it open.
    pub fn set_fds(
        &mut self,
        id: ChannelId,
        rfd: Option<RawFd>,
        wfd: Option<RawFd>,
        efd: Option<RawFd>,
        extended_usage: ExtendedUsage,
        nonblock: bool,
        is_tty: bool,
        window_max: u32,
    ) -> Result<(), Error> {
        let c = self.channels.get_mut(id).ok_or(Error::WrongChannel(id.0))?;
        match c.kind {
            ChannelType::Larval => {}
            _ => return Err(Error::Inconsistent),
        }
        c.register_fds(rfd, wfd, efd, extended_usage, nonblock, is_tty);
        c.kind = ChannelType::Open;
        c.lastused = self.now;
        c.local_window = window_max;
        c.local_window_max = window_max;
        let remote_id = c.require_remote_id()?;
        push_packet!(self.write, {
            self.write.push(msg::CHANNEL_WINDOW_ADJUST);
            self.write.push_u32_be(remote_id);
            self.write.push_u32_be(window_max);
        });
        Ok(())
    }

    /// Record an extended type (used to look up inactivity timeouts).
    pub fn set_xtype(&mut self, id: ChannelId, xctype: &str) {
        let timeout = self.config.timeout_for(xctype);
        if let Some(c) = self.channels.get_mut(id) {
            c.xctype = Some(xctype.to_string());
            c.inactive_deadline = timeout;
            debug!("channel {}: labeled \"{}\" (inactive timeout {})", id, xctype, timeout);
        }
    }

    pub fn register_open_confirm(&mut self, id: ChannelId, cb: OpenConfirm) {
        match self.channels.get_mut(id) {
            Some(c) => c.open_confirm = Some(cb),
            None => error!("register_open_confirm: {}: bad id", id),
        }
    }

    /// Called when the channel is about to be freed, or forced closed.
    /// With `do_close`, the callback waits for the close handshake.
    pub fn register_cleanup(&mut self, id: ChannelId, cb: DetachCallback, do_close: bool) {
        match self.channels.get_mut(id) {
            Some(c) => {
                c.detach_user = Some(cb);
                c.detach_close = do_close
            }
            None => error!("register_cleanup: {}: bad id", id),
        }
    }

    pub fn cancel_cleanup(&mut self, id: ChannelId) {
        if let Some(c) = self.channels.get_mut(id) {
            c.detach_user = None;
            c.detach_close = false
        }
    }

    pub fn register_filter(&mut self, id: ChannelId, filter: Box<dyn Filter>) {
        match self.channels.get_mut(id) {
            Some(c) => c.filter = Some(filter),
            None => error!("register_filter: {}: bad id", id),
        }
    }

    /// Send the `CHANNEL_OPEN` of a channel we created.
    pub fn send_open(&mut self, id: ChannelId) -> Result<(), Error> {
        let ctype = self.channels.get(id).ok_or(Error::WrongChannel(id.0))?.ctype.clone();
        self.send_channel_open(id, &ctype, |_| ())
    }

    /// Send a `CHANNEL_OPEN` for `id`, with `fields` appending the
    /// type-specific part.
    pub(crate) fn send_channel_open<F: FnOnce(&mut CryptoVec)>(
        &mut self,
        id: ChannelId,
        ctype: &str,
        fields: F,
    ) -> Result<(), Error> {
        let c = self.channels.get(id).ok_or(Error::WrongChannel(id.0))?;
        debug!("channel {}: send open {}", id, ctype);
        let (window, maxpacket) = (c.local_window, c.local_maxpacket);
        push_packet!(self.write, {
            self.write.push(msg::CHANNEL_OPEN);
            self.write.extend_ssh_string(ctype.as_bytes());
            self.write.push_u32_be(id.0);
            self.write.push_u32_be(window);
            self.write.push_u32_be(maxpacket);
            fields(&mut self.write);
        });
        Ok(())
    }

    /// Send the request `name` on a channel; `confirm` is queued for
    /// the reply when `want_reply` is set.
    pub fn channel_request(
        &mut self,
        id: ChannelId,
        name: &str,
        want_reply: bool,
        data: &[u8],
        confirm: Option<StatusConfirm>,
    ) -> Result<(), Error> {
        let c = self.channels.get_mut(id).ok_or(Error::WrongChannel(id.0))?;
        let remote_id = c.require_remote_id()?;
        debug!("channel {}: request {} confirm {}", id, name, want_reply);
        if want_reply {
            if let Some(confirm) = confirm {
                c.status_confirms.push_back(confirm)
            }
        }
        push_packet!(self.write, {
            self.write.push(msg::CHANNEL_REQUEST);
            self.write.push_u32_be(remote_id);
            self.write.extend_ssh_string(name.as_bytes());
            self.write.push_bool(want_reply);
            self.write.extend(data);
        });
        Ok(())
    }

    /// Send a global request, and queue `confirm` for its reply.
    pub fn global_request(&mut self, name: &str, data: &[u8], confirm: Option<GlobalConfirm>) {
        debug!("global request {}", name);
        let want_reply = confirm.is_some();
        push_packet!(self.write, {
            self.write.push(msg::GLOBAL_REQUEST);
            self.write.extend_ssh_string(name.as_bytes());
            self.write.push_bool(want_reply);
            self.write.extend(data);
        });
        if let Some(confirm) = confirm {
            self.global_confirms.push_back(confirm)
        }
    }

    pub(crate) fn open_confirmation(&mut self, id: ChannelId) -> Result<(), Error> {
        let c = self.channels.get(id).ok_or(Error::WrongChannel(id.0))?;
        let remote_id = c.require_remote_id()?;
        push_packet!(self.write, {
            self.write.push(msg::CHANNEL_OPEN_CONFIRMATION);
            self.write.push_u32_be(remote_id);
            self.write.push_u32_be(id.0);
            self.write.push_u32_be(c.local_window);
            self.write.push_u32_be(c.local_maxpacket);
        });
        Ok(())
    }

    pub(crate) fn open_failure(&mut self, remote_id: u32, reason: ChannelOpenFailure, description: &str) {
        push_packet!(self.write, {
            self.write.push(msg::CHANNEL_OPEN_FAILURE);
            self.write.push_u32_be(remote_id);
            self.write.push_u32_be(reason as u32);
            self.write.extend_ssh_string(description.as_bytes());
            self.write.extend_ssh_string(b"");
        })
    }

    pub(crate) fn request_reply(&mut self, success: bool, data: &[u8]) {
        push_packet!(self.write, {
            self.write.push(if success { msg::REQUEST_SUCCESS } else { msg::REQUEST_FAILURE });
            self.write.extend(data);
        })
    }

    /// Close a channel abruptly: fail both directions, notify the
    /// cleanup callback. An abandoned channel no longer takes part in
    /// the close handshake's bookkeeping but stays addressable.
    pub fn force_close(&mut self, id: ChannelId, abandon: bool) -> Result<(), Error> {
        {
            let c = match self.channels.get_mut(id) {
                Some(c) => c,
                None => return Ok(()),
            };
            debug!("channel {}: forcibly closing", id);
            if c.istate == InputState::Open {
                c.read_failed()
            }
            if c.istate == InputState::WaitDrain {
                c.input.clear();
                c.ibuf_empty(&mut self.write)?
            }
            if c.ostate == OutputState::Open || c.ostate == OutputState::WaitDrain {
                c.output.clear();
                c.write_failed(&mut self.write)?
            }
        }
        self.notify_detach(id, true);
        if let Some(c) = self.channels.get_mut(id) {
            if let Err(e) = c.close_efd() {
                debug!("channel {}: close efd: {}", id, e)
            }
            if abandon {
                c.kind = ChannelType::Abandoned
            }
            c.inactive_deadline = 0;
            c.lastused = 0;
        }
        Ok(())
    }

    /// Call the detach callback. It stays registered unless it
    /// returns `true`.
    fn notify_detach(&mut self, id: ChannelId, forced: bool) -> bool {
        let cb = self.channels.get_mut(id).and_then(|c| c.detach_user.take());
        if let Some(mut cb) = cb {
            let done = cb(self, id, forced);
            if !done {
                if let Some(c) = self.channels.get_mut(id) {
                    if c.detach_user.is_none() {
                        c.detach_user = Some(cb)
                    }
                }
            }
            done
        } else {
            true
        }
    }

    /// Free `id` if it is dead.
    pub(crate) fn garbage_collect(&mut self, id: ChannelId) -> Result<(), Error> {
        let c = match self.channels.get_mut(id) {
            Some(c) => c,
            None => return Ok(()),
        };
        if c.detach_user.is_some() {
            let do_close = c.detach_close;
            if !c.is_dead(&mut self.write, do_close)? {
                return Ok(());
            }
            debug!("channel {}: gc: notify user", id);
            if !self.notify_detach(id, false) {
                return Ok(());
            }
            debug!("channel {}: gc: user detached", id);
        }
        let c = match self.channels.get_mut(id) {
            Some(c) => c,
            None => return Ok(()),
        };
        if !c.is_dead(&mut self.write, true)? {
            return Ok(());
        }
        debug!("channel {}: garbage collecting", id);
        self.free(id);
        Ok(())
    }

    /// Free a channel, closing its descriptors.
    pub fn free(&mut self, id: ChannelId) {
        let is_mux_client = match self.channels.get(id) {
            Some(c) => {
                debug!("channel {}: free: {}, nchannels {}", id, c.remote_name, self.channels.len());
                if let ChannelType::MuxClient(_) = c.kind { true } else { false }
            }
            None => return,
        };
        if is_mux_client {
            self.mux_client_teardown(id)
        }
        let mut c = match self.channels.take(id) {
            Some(c) => c,
            None => return,
        };
        c.close_fds();
        while let Some(cc) = c.status_confirms.pop_front() {
            if let Some(abandon) = cc.abandon {
                abandon(self, id)
            }
        }
        if let Some(mut filter) = c.filter.take() {
            filter.cleanup(id)
        }
    }

    /// Free every channel. Used when the connection is gone.
    pub fn free_all(&mut self) {
        debug!("channel_free_all: nchannels {}", self.channels.len());
        for id in self.channels.ids() {
            self.free(id)
        }
    }

    /// Close every listener, for instance before forking.
    pub fn close_all(&mut self) {
        for c in self.channels.iter_mut() {
            c.close_fds()
        }
    }

    /// Is any channel still carrying data?
    pub fn still_open(&self) -> bool {
        self.channels.iter().any(|c| c.kind.is_active())
    }

    /// Describe the channels, for the `~#` escape and debugging.
    pub fn open_message(&self) -> String {
        let mut s = String::from("The following connections are open:\r\n");
        for c in self.channels.iter() {
            if !c.kind.is_active() {
                continue;
            }
            s.push_str(&format!(
                "  #{} {} (t{} r{} i{:?}/{} o{:?}/{} {})\r\n",
                c.id,
                c.remote_name,
                c.kind.name(),
                c.remote_id.map(|r| r as i64).unwrap_or(-1),
                c.istate,
                c.input.len(),
                c.ostate,
                c.output.len(),
                c.xctype.as_ref().unwrap_or(&c.ctype),
            ))
        }
        s
    }
}
