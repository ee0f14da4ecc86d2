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

//! The channel record.
use crate::buffer::ChannelBuffer;
use crate::config::HostPort;
use crate::connect::ConnectContext;
use crate::mux::MuxState;
use crate::session::Session;
use crate::{sys, ChannelId, Error};
use std::collections::VecDeque;
use std::os::unix::io::RawFd;

bitflags! {
    /// Readiness of a channel's descriptors, by role.
    pub struct IoFlags: u32 {
        const RFD = 0x01;
        const WFD = 0x02;
        const EFD_R = 0x04;
        const EFD_W = 0x08;
        const SOCK_R = 0x10;
        const SOCK_W = 0x20;
    }
}

bitflags! {
    /// Protocol-level facts about a channel.
    pub struct ChanFlags: u32 {
        const CLOSE_SENT = 0x01;
        const CLOSE_RCVD = 0x02;
        const EOF_SENT = 0x04;
        const EOF_RCVD = 0x08;
        /// Never reported to the peer: the mux control channels.
        const LOCAL = 0x10;
        /// SOCKS5 method negotiation is over.
        const SOCKS5_AUTHDONE = 0x1000;
    }
}

/// State of the direction from the local descriptor to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputState {
    Open,
    WaitDrain,
    Closed,
}

/// State of the direction from the peer to the local descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputState {
    Open,
    WaitDrain,
    Closed,
}

/// What the extended descriptor is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtendedUsage {
    /// We write the peer's stderr to it.
    Write,
    /// We read our stderr from it.
    Read,
    Ignore,
}

/// The kind of a channel, with the data only that kind needs.
#[derive(Debug)]
pub enum ChannelType {
    /// Local forwarding listener.
    PortListener,
    /// Remote forwarding listener (server side).
    RPortListener,
    UnixListener,
    RUnixListener,
    X11Listener,
    AuthSocketListener,
    /// Waiting for the peer's confirmation.
    Opening,
    /// Non-blocking connect in progress.
    Connecting(ConnectContext),
    /// Reverse dynamic forwarding: waiting for the peer's SOCKS request.
    RDynamicOpen,
    /// Reverse dynamic forwarding: connecting to the SOCKS target.
    RDynamicFinish(ConnectContext),
    Open,
    /// Open, until the X11 cookie has been checked.
    X11Open,
    /// SOCKS negotiation on a locally accepted connection.
    Dynamic,
    /// Allocated, not yet usable.
    Larval,
    MuxListener,
    MuxClient(MuxState),
    /// Stands for a channel of a mux client.
    MuxProxy {
        downstream: ChannelId,
        downstream_id: u32,
    },
    Closed,
    Abandoned,
    /// Detached from its descriptors, freed at the next collection.
    Zombie,
}

impl ChannelType {
    pub fn name(&self) -> &'static str {
        match *self {
            ChannelType::PortListener => "port-listener",
            ChannelType::RPortListener => "rport-listener",
            ChannelType::UnixListener => "unix-listener",
            ChannelType::RUnixListener => "runix-listener",
            ChannelType::X11Listener => "x11-listener",
            ChannelType::AuthSocketListener => "auth-listener",
            ChannelType::Opening => "opening",
            ChannelType::Connecting(_) => "connecting",
            ChannelType::RDynamicOpen => "rdynamic-open",
            ChannelType::RDynamicFinish(_) => "rdynamic-finish",
            ChannelType::Open => "open",
            ChannelType::X11Open => "x11-open",
            ChannelType::Dynamic => "dynamic",
            ChannelType::Larval => "larval",
            ChannelType::MuxListener => "mux-listener",
            ChannelType::MuxClient(_) => "mux-client",
            ChannelType::MuxProxy { .. } => "mux-proxy",
            ChannelType::Closed => "closed",
            ChannelType::Abandoned => "abandoned",
            ChannelType::Zombie => "zombie",
        }
    }

    /// Can the peer address this channel?
    pub fn is_public(&self) -> bool {
        match *self {
            ChannelType::X11Open
            | ChannelType::Larval
            | ChannelType::Connecting(_)
            | ChannelType::Dynamic
            | ChannelType::RDynamicOpen
            | ChannelType::RDynamicFinish(_)
            | ChannelType::Opening
            | ChannelType::Open
            | ChannelType::Abandoned
            | ChannelType::MuxProxy { .. } => true,
            _ => false,
        }
    }

    pub fn is_listener(&self) -> bool {
        match *self {
            ChannelType::PortListener
            | ChannelType::RPortListener
            | ChannelType::UnixListener
            | ChannelType::RUnixListener
            | ChannelType::X11Listener
            | ChannelType::AuthSocketListener
            | ChannelType::MuxListener => true,
            _ => false,
        }
    }

    /// Channels that still carry (or are about to carry) user data.
    pub(crate) fn is_active(&self) -> bool {
        match *self {
            ChannelType::Open
            | ChannelType::X11Open
            | ChannelType::Opening
            | ChannelType::Connecting(_)
            | ChannelType::Dynamic
            | ChannelType::RDynamicOpen
            | ChannelType::RDynamicFinish(_)
            | ChannelType::Larval
            | ChannelType::MuxProxy { .. } => true,
            _ => false,
        }
    }
}

/// Called once the peer confirmed (or refused) a channel we opened.
pub type OpenConfirm = Box<dyn FnOnce(&mut Session, ChannelId, bool)>;

/// Called when the channel is being freed. The flag tells whether
/// the close was forced; returning `true` frees the channel at once.
pub type DetachCallback = Box<dyn FnMut(&mut Session, ChannelId, bool) -> bool>;

/// A pending reply to a channel request.
pub struct StatusConfirm {
    pub(crate) cb: Box<dyn FnOnce(&mut Session, ChannelId, bool)>,
    pub(crate) abandon: Option<Box<dyn FnOnce(&mut Session, ChannelId)>>,
}

/// Transforms the data of a channel on its way through.
pub trait Filter {
    /// Bytes read from the local descriptor. Append whatever should
    /// be sent to `input`; an error closes the read side.
    fn input(&mut self, input: &mut ChannelBuffer, data: &[u8]) -> Result<(), Error>;

    /// How many bytes from the front of `output` to write to the
    /// local descriptor, after consuming any framing. `None` closes
    /// the write side.
    fn output(&mut self, output: &mut ChannelBuffer) -> Option<usize>;

    fn cleanup(&mut self, _id: ChannelId) {}
}

/// A channel.
pub struct Channel {
    pub(crate) kind: ChannelType,
    pub(crate) id: ChannelId,
    pub(crate) remote_id: Option<u32>,
    pub(crate) istate: InputState,
    pub(crate) ostate: OutputState,
    pub(crate) flags: ChanFlags,
    pub(crate) rfd: Option<RawFd>,
    pub(crate) wfd: Option<RawFd>,
    pub(crate) efd: Option<RawFd>,
    pub(crate) sock: Option<RawFd>,
    pub(crate) io_want: IoFlags,
    pub(crate) io_ready: IoFlags,
    pub(crate) isatty: bool,
    pub(crate) force_drain: bool,
    pub(crate) single_connection: bool,
    pub(crate) delayed: bool,
    pub(crate) notbefore: u64,
    pub(crate) lastused: u64,
    pub(crate) inactive_deadline: u64,
    pub(crate) input: ChannelBuffer,
    pub(crate) output: ChannelBuffer,
    pub(crate) extended: ChannelBuffer,
    pub(crate) path: Option<String>,
    pub(crate) host_port: HostPort,
    pub(crate) listening_addr: Option<String>,
    pub(crate) listening_port: u16,
    pub(crate) remote_window: u32,
    pub(crate) remote_maxpacket: u32,
    pub(crate) local_window: u32,
    pub(crate) local_window_max: u32,
    pub(crate) local_consumed: u32,
    pub(crate) local_maxpacket: u32,
    pub(crate) local_window_exceeded: u32,
    pub(crate) extended_usage: ExtendedUsage,
    pub(crate) ctype: String,
    pub(crate) xctype: Option<String>,
    pub(crate) remote_name: String,
    pub(crate) open_confirm: Option<OpenConfirm>,
    pub(crate) detach_user: Option<DetachCallback>,
    pub(crate) detach_close: bool,
    pub(crate) filter: Option<Box<dyn Filter>>,
    pub(crate) status_confirms: VecDeque<StatusConfirm>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("ctype", &self.ctype)
            .field("remote_id", &self.remote_id)
            .field("istate", &self.istate)
            .field("ostate", &self.ostate)
            .field("flags", &self.flags)
            .field("rfd", &self.rfd)
            .field("wfd", &self.wfd)
            .field("efd", &self.efd)
            .field("sock", &self.sock)
            .finish()
    }
}

impl Channel {
    pub(crate) fn new(
        id: ChannelId,
        ctype: &str,
        kind: ChannelType,
        window: u32,
        maxpacket: u32,
        remote_name: &str,
        now: u64,
    ) -> Self {
        Channel {
            kind,
            id,
            remote_id: None,
            istate: InputState::Open,
            ostate: OutputState::Open,
            flags: ChanFlags::empty(),
            rfd: None,
            wfd: None,
            efd: None,
            sock: None,
            io_want: IoFlags::empty(),
            io_ready: IoFlags::empty(),
            isatty: false,
            force_drain: false,
            single_connection: false,
            delayed: true,
            notbefore: 0,
            lastused: now,
            inactive_deadline: 0,
            input: ChannelBuffer::new(),
            output: ChannelBuffer::new(),
            extended: ChannelBuffer::new(),
            path: None,
            host_port: HostPort::default(),
            listening_addr: None,
            listening_port: 0,
            remote_window: 0,
            remote_maxpacket: 0,
            local_window: window,
            local_window_max: window,
            local_consumed: 0,
            local_maxpacket: maxpacket,
            local_window_exceeded: 0,
            extended_usage: ExtendedUsage::Ignore,
            ctype: ctype.to_string(),
            xctype: None,
            remote_name: remote_name.to_string(),
            open_confirm: None,
            detach_user: None,
            detach_close: false,
            filter: None,
            status_confirms: VecDeque::new(),
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn kind(&self) -> &ChannelType {
        &self.kind
    }

    /// The peer's id for this channel, once known.
    pub fn remote_id(&self) -> Option<u32> {
        self.remote_id
    }

    pub fn input_state(&self) -> InputState {
        self.istate
    }

    pub fn output_state(&self) -> OutputState {
        self.ostate
    }

    pub fn ctype(&self) -> &str {
        &self.ctype
    }

    pub fn remote_name(&self) -> &str {
        &self.remote_name
    }

    /// Target host or socket path, for forwarded channels.
    pub fn path(&self) -> Option<&str> {
        self.path.as_ref().map(|x| x.as_str())
    }

    pub fn host_port(&self) -> HostPort {
        self.host_port
    }

    pub fn listening_port(&self) -> u16 {
        self.listening_port
    }

    pub fn local_window(&self) -> u32 {
        self.local_window
    }

    pub fn remote_window(&self) -> u32 {
        self.remote_window
    }

    /// Data read locally, not yet sent to the peer.
    pub fn input(&self) -> &ChannelBuffer {
        &self.input
    }

    /// Data from the peer, not yet written locally.
    pub fn output(&self) -> &ChannelBuffer {
        &self.output
    }

    pub fn close_sent(&self) -> bool {
        self.flags.contains(ChanFlags::CLOSE_SENT)
    }

    pub fn close_rcvd(&self) -> bool {
        self.flags.contains(ChanFlags::CLOSE_RCVD)
    }

    pub fn eof_sent(&self) -> bool {
        self.flags.contains(ChanFlags::EOF_SENT)
    }

    pub fn eof_rcvd(&self) -> bool {
        self.flags.contains(ChanFlags::EOF_RCVD)
    }

    pub(crate) fn require_remote_id(&self) -> Result<u32, Error> {
        self.remote_id.ok_or(Error::NoRemoteId(self.id))
    }

    pub(crate) fn is_open(&self) -> bool {
        if let ChannelType::Open = self.kind {
            true
        } else {
            false
        }
    }

    /// Attach descriptors. A descriptor used for both reading and
    /// writing is treated as a socket.
    pub(crate) fn register_fds(
        &mut self,
        rfd: Option<RawFd>,
        wfd: Option<RawFd>,
        efd: Option<RawFd>,
        extended_usage: ExtendedUsage,
        nonblock: bool,
        is_tty: bool,
    ) {
        for fd in rfd.iter().chain(wfd.iter()).chain(efd.iter()) {
            sys::set_cloexec(*fd);
        }
        self.rfd = rfd;
        self.wfd = wfd;
        self.sock = if rfd.is_some() && rfd == wfd { rfd } else { None };
        self.efd = efd;
        self.extended_usage = extended_usage;
        self.isatty = is_tty;
        if is_tty {
            debug!("channel {}: rfd {:?} isatty", self.id, rfd);
        }
        if nonblock {
            for fd in rfd.iter().chain(wfd.iter()).chain(efd.iter()) {
                if let Err(e) = sys::set_nonblock(*fd) {
                    debug!("channel {}: set_nonblock({}): {}", self.id, fd, e)
                }
            }
        }
    }

    fn aliased(&self, fd: RawFd) -> usize {
        [self.rfd, self.wfd, self.efd, self.sock]
            .iter()
            .filter(|x| **x == Some(fd))
            .count()
    }

    /// Detach the read descriptor, closing it unless another role
    /// still uses it.
    pub(crate) fn close_rfd(&mut self) -> std::io::Result<()> {
        if let Some(fd) = self.rfd {
            let last = self.aliased(fd) == 1;
            self.rfd = None;
            if last {
                return sys::close(fd);
            }
        }
        Ok(())
    }

    pub(crate) fn close_wfd(&mut self) -> std::io::Result<()> {
        if let Some(fd) = self.wfd {
            let last = self.aliased(fd) == 1;
            self.wfd = None;
            if last {
                return sys::close(fd);
            }
        }
        Ok(())
    }

    pub(crate) fn close_efd(&mut self) -> std::io::Result<()> {
        if let Some(fd) = self.efd {
            let last = self.aliased(fd) == 1;
            self.efd = None;
            if last {
                return sys::close(fd);
            }
        }
        Ok(())
    }

    pub(crate) fn close_sock(&mut self) -> std::io::Result<()> {
        if let Some(fd) = self.sock {
            let last = self.aliased(fd) == 1;
            self.sock = None;
            if last {
                return sys::close(fd);
            }
        }
        Ok(())
    }

    /// Close every descriptor exactly once.
    pub(crate) fn close_fds(&mut self) {
        let mut fds: Vec<RawFd> = [self.sock, self.rfd, self.wfd, self.efd]
            .iter()
            .flatten()
            .cloned()
            .collect();
        fds.sort();
        fds.dedup();
        for fd in fds {
            if let Err(e) = sys::close(fd) {
                debug!("channel {}: close({}): {}", self.id, fd, e)
            }
        }
        self.sock = None;
        self.rfd = None;
        self.wfd = None;
        self.efd = None;
    }

    pub(crate) fn has_fds(&self) -> bool {
        self.rfd.is_some() || self.wfd.is_some() || self.efd.is_some() || self.sock.is_some()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn aliased_descriptors_close_once() {
        let (a, b) = sys::socketpair().unwrap();
        let mut c = Channel::new(ChannelId(0), "t", ChannelType::Open, 1024, 512, "t", 0);
        c.register_fds(Some(a), Some(a), None, ExtendedUsage::Ignore, true, false);
        assert_eq!(c.sock, Some(a));
        c.close_rfd().unwrap();
        assert_eq!(c.rfd, None);
        // Still open through the other roles.
        assert!(sys::write(b, b"x").is_ok());
        assert_eq!(sys::read(a, &mut [0; 1]).unwrap(), 1);
        c.close_fds();
        assert!(!c.has_fds());
        sys::close(b).unwrap();
    }

    #[test]
    fn public_kinds() {
        assert!(ChannelType::Open.is_public());
        assert!(ChannelType::Larval.is_public());
        assert!(!ChannelType::PortListener.is_public());
        assert!(!ChannelType::Zombie.is_public());
        assert!(!ChannelType::MuxListener.is_public());
    }
}
