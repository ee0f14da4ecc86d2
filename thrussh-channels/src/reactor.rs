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

//! One tick of the event loop: readiness wanted by each channel, a
//! single `poll(2)`, then reactions to what became ready.
use crate::channel::{ChanFlags, Channel, ChannelType, ExtendedUsage, InputState, IoFlags, OutputState};
use crate::encoding::Encoding;
use crate::session::Session;
use crate::{msg, sys, ChannelId, Error};
use std::os::unix::io::RawFd;
use std::time::Duration;

/// Descriptors to wait on, and how they map back to channels.
#[derive(Debug)]
pub struct PollSet {
    fds: Vec<libc::pollfd>,
    /// Per channel, the index of the pollfd of each role (read,
    /// write, extended, socket), if polled.
    roles: Vec<(ChannelId, [Option<usize>; 4])>,
    /// Seconds until the earliest channel deadline.
    timeout: Option<u64>,
}

fn role_fds(c: &Channel) -> [Option<RawFd>; 4] {
    [c.rfd, c.wfd, c.efd, c.sock]
}

/// Readiness bits carried by each role, for reading and for writing.
const ROLE_BITS: [(IoFlags, IoFlags); 4] = [
    (IoFlags::RFD, IoFlags::empty()),
    (IoFlags::empty(), IoFlags::WFD),
    (IoFlags::EFD_R, IoFlags::EFD_W),
    (IoFlags::SOCK_R, IoFlags::SOCK_W),
];

impl PollSet {
    /// Add a descriptor that is not a channel's, such as the
    /// transport connection. Returns its index.
    pub fn add(&mut self, fd: RawFd, events: i16) -> usize {
        self.fds.push(libc::pollfd { fd, events, revents: 0 });
        self.fds.len() - 1
    }

    pub fn revents(&self, index: usize) -> i16 {
        self.fds.get(index).map(|p| p.revents).unwrap_or(0)
    }

    /// How long the wait may last, `None` for no limit.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_secs)
    }

    pub fn len(&self) -> usize {
        self.fds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    /// Wait until something is ready or the timeout expires.
    pub fn poll(&mut self) -> std::io::Result<usize> {
        let ms = match self.timeout {
            Some(t) => t.saturating_mul(1000).min(i32::max_value() as u64) as i32,
            None => -1,
        };
        sys::poll(&mut self.fds, ms)
    }

    fn deadline(&mut self, now: u64, when: u64) {
        let left = when.saturating_sub(now);
        self.timeout = Some(self.timeout.map(|t| t.min(left)).unwrap_or(left));
    }

    /// One pollfd per distinct descriptor, with the events of every
    /// role sharing it.
    fn add_channel(&mut self, c: &Channel) {
        let fds = role_fds(c);
        let mut idx = [None; 4];
        for i in 0..4 {
            let fd = match fds[i] {
                Some(fd) => fd,
                None => continue,
            };
            if fds[..i].contains(&Some(fd)) {
                continue;
            }
            let mut events = 0;
            for k in i..4 {
                if fds[k] == Some(fd) {
                    let (r, w) = ROLE_BITS[k];
                    if !r.is_empty() && c.io_want.contains(r) {
                        events |= libc::POLLIN
                    }
                    if !w.is_empty() && c.io_want.contains(w) {
                        events |= libc::POLLOUT
                    }
                }
            }
            if events != 0 {
                idx[i] = Some(self.add(fd, events));
            }
        }
        if idx.iter().any(|x| x.is_some()) {
            self.roles.push((c.id, idx))
        }
    }

    fn ready(&self, c: &mut Channel, idx: &[Option<usize>; 4]) -> Result<(), Error> {
        let fds = role_fds(c);
        for i in 0..4 {
            let p = match idx[i] {
                Some(p) => p,
                None => continue,
            };
            let pfd = match self.fds.get(p) {
                Some(pfd) => pfd,
                None => return Err(Error::Inconsistent),
            };
            if fds[i] != Some(pfd.fd) {
                error!("channel {}: inconsistent fd {:?}, pollfd[{}].fd {}", c.id, fds[i], p, pfd.fd);
                return Err(Error::Inconsistent);
            }
            if pfd.revents & libc::POLLNVAL != 0 {
                error!("channel {}: invalid pollfd[{}].fd {}", c.id, p, pfd.fd);
                return Err(Error::Inconsistent);
            }
            let hup = libc::POLLHUP | libc::POLLERR;
            for k in i..4 {
                if fds[k] == fds[i] {
                    let (r, w) = ROLE_BITS[k];
                    if pfd.revents & (libc::POLLIN | hup) != 0 {
                        c.io_ready |= r & c.io_want
                    }
                    if pfd.revents & (libc::POLLOUT | hup) != 0 {
                        c.io_ready |= w & c.io_want
                    }
                }
            }
        }
        Ok(())
    }
}

impl Session {
    /// Run the pre-I/O handlers and collect the descriptors to wait
    /// on. `now` is a monotonic time in seconds.
    pub fn prepare(&mut self, now: u64) -> Result<PollSet, Error> {
        self.now = now;
        let mut set = PollSet {
            fds: Vec::new(),
            roles: Vec::new(),
            timeout: None,
        };
        for id in self.channels.ids() {
            let rdynamic = match self.channels.get(id) {
                Some(c) => {
                    if let ChannelType::RDynamicOpen = c.kind { true } else { false }
                }
                None => false,
            };
            if rdynamic {
                self.pre_rdynamic(id)?
            }
        }
        self.channel_handler(true, Some(&mut set))?;
        for c in self.channels.iter() {
            set.add_channel(c)
        }
        Ok(set)
    }

    /// React to the readiness observed by `set.poll()`.
    pub fn dispatch(&mut self, set: &PollSet, now: u64) -> Result<(), Error> {
        self.now = now;
        for c in self.channels.iter_mut() {
            c.io_ready = IoFlags::empty()
        }
        for &(id, ref idx) in set.roles.iter() {
            if let Some(c) = self.channels.get_mut(id) {
                set.ready(c, idx)?
            }
        }
        self.channel_handler(false, None)
    }

    /// When an open channel expires, zero if never.
    pub(crate) fn expiry(&self, c: &Channel) -> u64 {
        let mut expiry = 0;
        if self.lastused != 0 && self.global_deadline != 0 {
            expiry = self.lastused + self.global_deadline
        }
        if c.inactive_deadline != 0 {
            let own = c.lastused + c.inactive_deadline;
            if expiry == 0 || own < expiry {
                expiry = own
            }
        }
        expiry
    }

    pub(crate) fn set_used_time(&mut self, id: ChannelId) {
        let now = self.now;
        self.lastused = now;
        if let Some(c) = self.channels.get_mut(id) {
            c.lastused = now
        }
    }

    fn channel_handler(&mut self, pre: bool, mut set: Option<&mut PollSet>) -> Result<(), Error> {
        let now = self.now;
        for id in self.channels.ids() {
            let (has_handler, is_open, notbefore) = {
                let c = match self.channels.get_mut(id) {
                    Some(c) => c,
                    None => continue,
                };
                if c.delayed {
                    if pre {
                        c.delayed = false
                    } else {
                        continue;
                    }
                }
                (has_handler(&c.kind), c.is_open(), c.notbefore)
            };
            if has_handler {
                let expiry = match self.channels.get(id) {
                    Some(c) if is_open => self.expiry(c),
                    _ => 0,
                };
                if pre && is_open && expiry != 0 && now >= expiry {
                    let deadline = self.channels.get(id).map(|c| c.inactive_deadline).unwrap_or(0);
                    info!("channel {}: closing after {} seconds of inactivity", id, deadline);
                    self.force_close(id, true)?;
                } else if notbefore <= now {
                    if pre {
                        self.pre_handler(id)?
                    } else {
                        self.post_handler(id)?
                    }
                    let still_open = self.channels.get(id).map(|c| c.is_open()).unwrap_or(false);
                    if let Some(ref mut set) = set {
                        if still_open && expiry != 0 {
                            set.deadline(now, expiry)
                        }
                    }
                } else if let Some(ref mut set) = set {
                    set.deadline(now, notbefore)
                }
            }
            self.garbage_collect(id)?;
        }
        Ok(())
    }

    fn pre_handler(&mut self, id: ChannelId) -> Result<(), Error> {
        let c = match self.channels.get_mut(id) {
            Some(c) => c,
            None => return Ok(()),
        };
        c.io_want = IoFlags::empty();
        match c.kind {
            ChannelType::Open => self.pre_open(id),
            ChannelType::X11Open => self.pre_x11_open(id),
            ChannelType::Connecting(_) | ChannelType::RDynamicFinish(_) => {
                c.io_want = IoFlags::SOCK_W;
                Ok(())
            }
            ChannelType::Dynamic => self.pre_dynamic(id),
            ChannelType::MuxClient(_) => self.pre_mux_client(id),
            ref k if k.is_listener() => {
                c.io_want = IoFlags::SOCK_R;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn post_handler(&mut self, id: ChannelId) -> Result<(), Error> {
        let kind = match self.channels.get(id) {
            Some(c) => match c.kind {
                ChannelType::Open | ChannelType::Dynamic | ChannelType::X11Open => 0,
                ChannelType::PortListener
                | ChannelType::RPortListener
                | ChannelType::UnixListener
                | ChannelType::RUnixListener => 1,
                ChannelType::X11Listener => 2,
                ChannelType::AuthSocketListener => 3,
                ChannelType::Connecting(_) | ChannelType::RDynamicFinish(_) => 4,
                ChannelType::MuxListener => 5,
                ChannelType::MuxClient(_) => 6,
                _ => return Ok(()),
            },
            None => return Ok(()),
        };
        match kind {
            0 => self.post_open(id),
            1 => self.post_port_listener(id),
            2 => self.post_x11_listener(id),
            3 => self.post_auth_listener(id),
            4 => self.post_connecting(id),
            5 => self.post_mux_listener(id),
            _ => self.post_mux_client(id),
        }
    }

    /// Turn buffered input into `CHANNEL_DATA` and
    /// `CHANNEL_EXTENDED_DATA`, within the peer's window and packet
    /// size.
    pub fn output_poll(&mut self) -> Result<(), Error> {
        for id in self.channels.ids() {
            let c = match self.channels.get_mut(id) {
                Some(c) => c,
                None => continue,
            };
            if !c.is_open() {
                continue;
            }
            if c.flags.intersects(ChanFlags::CLOSE_SENT | ChanFlags::CLOSE_RCVD) {
                // Only EOF may follow.
                debug!("channel {}: output_poll: close sent or received", id);
                continue;
            }
            if c.istate == InputState::Open || c.istate == InputState::WaitDrain {
                if !c.input.is_empty() {
                    let remote_id = c.require_remote_id()?;
                    let len = c.input.len().min(c.remote_window as usize).min(c.remote_maxpacket as usize);
                    if len > 0 {
                        push_packet!(self.write, {
                            self.write.push(msg::CHANNEL_DATA);
                            self.write.push_u32_be(remote_id);
                            self.write.extend_ssh_string(&c.input.as_slice()[..len]);
                        });
                        c.input.consume(len);
                        c.remote_window -= len as u32;
                    }
                } else if c.istate == InputState::WaitDrain {
                    // EOF must not overtake pending extended data.
                    if c.efd_input_active() {
                        debug!("channel {}: ibuf_empty delayed efd {:?}/({})", id, c.efd, c.extended.len());
                    } else {
                        c.ibuf_empty(&mut self.write)?
                    }
                }
            }
            if c.extended_usage == ExtendedUsage::Read && !c.flags.contains(ChanFlags::EOF_SENT) && !c.extended.is_empty() {
                let remote_id = c.require_remote_id()?;
                let len = c.extended.len().min(c.remote_window as usize).min(c.remote_maxpacket as usize);
                if len > 0 {
                    debug!("channel {}: rwin {} elen {} euse {:?}", id, c.remote_window, c.extended.len(), c.extended_usage);
                    push_packet!(self.write, {
                        self.write.push(msg::CHANNEL_EXTENDED_DATA);
                        self.write.push_u32_be(remote_id);
                        self.write.push_u32_be(msg::EXTENDED_DATA_STDERR);
                        self.write.extend_ssh_string(&c.extended.as_slice()[..len]);
                    });
                    c.extended.consume(len);
                    c.remote_window -= len as u32;
                    debug!("channel {}: sent ext data {}", id, len);
                }
            }
        }
        Ok(())
    }
}

fn has_handler(kind: &ChannelType) -> bool {
    match *kind {
        ChannelType::Open
        | ChannelType::X11Open
        | ChannelType::Connecting(_)
        | ChannelType::RDynamicFinish(_)
        | ChannelType::Dynamic
        | ChannelType::MuxClient(_) => true,
        ref k => k.is_listener(),
    }
}

impl Channel {
    /// Does the window need to be reopened?
    pub(crate) fn window_adjust_due(&self) -> bool {
        self.is_open()
            && !self.flags.intersects(ChanFlags::CLOSE_SENT | ChanFlags::CLOSE_RCVD)
            && (self.local_window_max.saturating_sub(self.local_window) > self.local_maxpacket.saturating_mul(3)
                || self.local_window < self.local_window_max / 2)
            && self.local_consumed > 0
    }

    pub(crate) fn output_open(&self) -> bool {
        self.ostate == OutputState::Open || self.ostate == OutputState::WaitDrain
    }
}
