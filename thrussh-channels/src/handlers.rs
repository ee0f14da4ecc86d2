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

//! Pre- and post-I/O handlers of data channels: open, dynamic,
//! reverse dynamic and connecting channels.
use crate::channel::{ChanFlags, ChannelType, ExtendedUsage, InputState, IoFlags, OutputState};
use crate::config::HostPort;
use crate::encoding::Encoding;
use crate::session::Session;
use crate::socks::{self, Progress};
use crate::{msg, sys, ChannelId, ChannelOpenFailure, Error};
use std::io;

/// Largest single read from a local descriptor.
pub(crate) const CHAN_RBUF: usize = 16 * 1024;

fn retry_later(e: &io::Error, force: bool) -> bool {
    e.kind() == io::ErrorKind::Interrupted || (!force && sys::is_transient(e))
}

fn still_connecting(e: &io::Error) -> bool {
    match e.raw_os_error() {
        Some(libc::EINTR) | Some(libc::EAGAIN) | Some(libc::EINPROGRESS) => true,
        _ => false,
    }
}

impl Session {
    pub(crate) fn pre_open(&mut self, id: ChannelId) -> Result<(), Error> {
        let c = match self.channels.get_mut(id) {
            Some(c) => c,
            None => return Ok(()),
        };
        c.io_want = IoFlags::empty();
        if c.istate == InputState::Open
            && c.remote_window > 0
            && c.input.len() < c.remote_window as usize
            && c.input.avail() >= CHAN_RBUF
        {
            c.io_want |= IoFlags::RFD
        }
        if c.output_open() {
            if !c.output.is_empty() {
                c.io_want |= IoFlags::WFD
            } else if c.ostate == OutputState::WaitDrain {
                if c.efd_output_active() {
                    debug!("channel {}: obuf_empty delayed efd {:?}/({})", id, c.efd, c.extended.len())
                } else {
                    c.obuf_empty()
                }
            }
        }
        if c.efd.is_some() && !(c.istate == InputState::Closed && c.ostate == OutputState::Closed) {
            if c.extended_usage == ExtendedUsage::Write && !c.extended.is_empty() {
                c.io_want |= IoFlags::EFD_W
            } else if !c.flags.contains(ChanFlags::EOF_SENT)
                && c.extended_usage != ExtendedUsage::Write
                && c.extended.len() < c.remote_window as usize
            {
                c.io_want |= IoFlags::EFD_R
            }
        }
        Ok(())
    }

    /// SOCKS negotiation on a locally accepted connection.
    pub(crate) fn pre_dynamic(&mut self, id: ChannelId) -> Result<(), Error> {
        let c = match self.channels.get_mut(id) {
            Some(c) => c,
            None => return Ok(()),
        };
        debug!("channel {}: pre_dynamic: have {}", id, c.input.len());
        if c.input.len() < 3 {
            c.io_want |= IoFlags::RFD;
            return Ok(());
        }
        let mut auth_done = c.flags.contains(ChanFlags::SOCKS5_AUTHDONE);
        let progress = socks::decode(&mut auth_done, &mut c.input, &mut c.output);
        c.flags.set(ChanFlags::SOCKS5_AUTHDONE, auth_done);
        match progress {
            Progress::Failed => c.mark_dead(),
            Progress::NeedMore => {
                debug!("channel {}: pre_dynamic: need more", id);
                c.io_want |= IoFlags::RFD;
                if !c.output.is_empty() {
                    c.io_want |= IoFlags::WFD
                }
            }
            Progress::Done { host, port } => {
                c.path = Some(host);
                c.host_port = HostPort::Port(port);
                c.kind = ChannelType::Opening;
                self.port_open_helper(id, "direct-tcpip")?
            }
        }
        Ok(())
    }

    /// Reverse dynamic forwarding: the SOCKS request comes from the
    /// peer, in the output buffer, and replies go back as data.
    pub(crate) fn pre_rdynamic(&mut self, id: ChannelId) -> Result<(), Error> {
        let c = match self.channels.get_mut(id) {
            Some(c) => c,
            None => return Ok(()),
        };
        debug!("channel {}: pre_rdynamic: have {}", id, c.output.len());
        if c.flags.contains(ChanFlags::EOF_RCVD) {
            c.output.clear();
            return self.rdynamic_close(id);
        }
        if c.output.len() < 3 {
            return Ok(());
        }
        let mut auth_done = c.flags.contains(ChanFlags::SOCKS5_AUTHDONE);
        let progress = socks::decode(&mut auth_done, &mut c.output, &mut c.input);
        c.flags.set(ChanFlags::SOCKS5_AUTHDONE, auth_done);
        match progress {
            Progress::Failed => self.rdynamic_close(id),
            Progress::NeedMore => {
                debug!("channel {}: pre_rdynamic: need more", id);
                let len = c.input.len();
                if len > 0 && len < c.remote_window as usize {
                    let remote_id = c.require_remote_id()?;
                    push_packet!(self.write, {
                        self.write.push(msg::CHANNEL_DATA);
                        self.write.push_u32_be(remote_id);
                        self.write.extend_ssh_string(c.input.as_slice());
                    });
                    c.input.clear();
                    c.remote_window -= len as u32;
                }
                Ok(())
            }
            Progress::Done { host, port } => {
                c.path = Some(host);
                c.host_port = HostPort::Port(port);
                if !self.rdynamic_connect_finish(id)? {
                    self.rdynamic_close(id)?
                }
                Ok(())
            }
        }
    }

    /// Give up on a reverse dynamic channel the peer already
    /// considers open: fail both directions locally.
    pub(crate) fn rdynamic_close(&mut self, id: ChannelId) -> Result<(), Error> {
        let c = match self.channels.get_mut(id) {
            Some(c) => c,
            None => return Ok(()),
        };
        c.kind = ChannelType::Open;
        c.read_failed();
        c.input.clear();
        c.ibuf_empty(&mut self.write)?;
        c.output.clear();
        c.write_failed(&mut self.write)
    }

    pub(crate) fn post_open(&mut self, id: ChannelId) -> Result<(), Error> {
        self.handle_rfd(id)?;
        self.handle_wfd(id)?;
        self.handle_efd(id)?;
        self.check_window(id)
    }

    fn handle_rfd(&mut self, id: ChannelId) -> Result<(), Error> {
        let now = self.now;
        let c = match self.channels.get_mut(id) {
            Some(c) => c,
            None => return Ok(()),
        };
        let force = c.isatty && c.detach_close && c.istate != InputState::Closed;
        if !force && !c.io_ready.contains(IoFlags::RFD) {
            return Ok(());
        }
        let rfd = match c.rfd {
            Some(fd) => fd,
            None => return Ok(()),
        };
        let avail = c.input.avail();
        if avail == 0 {
            return Ok(());
        }
        let result = if c.filter.is_none() {
            let mut max = CHAN_RBUF.min(avail);
            // Only open channels have a meaningful remote window.
            if c.is_open() {
                let have = c.input.len();
                if have >= c.remote_window as usize {
                    return Ok(());
                }
                max = max.min(c.remote_window as usize - have)
            }
            c.input.read_from(rfd, max)
        } else {
            let mut buf = [0; CHAN_RBUF];
            match sys::read(rfd, &mut buf) {
                Ok(0) => Ok(0),
                Ok(n) => {
                    let stop = match c.filter {
                        Some(ref mut filter) => filter.input(&mut c.input, &buf[..n]).err(),
                        None => None,
                    };
                    if let Some(e) = stop {
                        debug!("channel {}: filter stops: {}", id, e);
                        c.read_failed()
                    }
                    Ok(n)
                }
                Err(e) => Err(e),
            }
        };
        match result {
            Ok(n) if n > 0 => {
                c.lastused = now;
                self.lastused = now;
                return Ok(());
            }
            Ok(_) => debug!("channel {}: read<=0 rfd {}", id, rfd),
            Err(ref e) if retry_later(e, force) => return Ok(()),
            Err(e) => debug!("channel {}: read failed rfd {}: {}", id, rfd, e),
        }
        if c.is_open() {
            c.read_failed()
        } else {
            debug!("channel {}: not open", id);
            c.mark_dead()
        }
        Ok(())
    }

    fn handle_wfd(&mut self, id: ChannelId) -> Result<(), Error> {
        let now = self.now;
        let c = match self.channels.get_mut(id) {
            Some(c) => c,
            None => return Ok(()),
        };
        if !c.io_ready.contains(IoFlags::WFD) || c.output.is_empty() {
            return Ok(());
        }
        let wfd = match c.wfd {
            Some(fd) => fd,
            None => return Ok(()),
        };
        let olen = c.output.len();
        let len = match c.filter {
            Some(ref mut filter) => filter.output(&mut c.output),
            None => Some(olen),
        };
        let failed = match len {
            None => {
                debug!("channel {}: filter stops", id);
                true
            }
            Some(0) => false,
            Some(len) => {
                let len = len.min(c.output.len());
                match sys::write(wfd, &c.output.as_slice()[..len]) {
                    Ok(0) => true,
                    Ok(n) => {
                        c.output.consume(n);
                        c.lastused = now;
                        self.lastused = now;
                        false
                    }
                    Err(ref e) if sys::is_transient(e) => false,
                    Err(e) => {
                        debug!("channel {}: write failed wfd {}: {}", id, wfd, e);
                        true
                    }
                }
            }
        };
        if failed {
            if c.is_open() {
                c.write_failed(&mut self.write)?
            } else {
                debug!("channel {}: not open", id);
                c.mark_dead()
            }
            return Ok(());
        }
        c.local_consumed = c.local_consumed.saturating_add((olen - c.output.len()) as u32);
        Ok(())
    }

    fn handle_efd(&mut self, id: ChannelId) -> Result<(), Error> {
        let now = self.now;
        let c = match self.channels.get_mut(id) {
            Some(c) => c,
            None => return Ok(()),
        };
        let efd = match c.efd {
            Some(fd) => fd,
            None => return Ok(()),
        };
        match c.extended_usage {
            ExtendedUsage::Write => {
                if !c.io_ready.contains(IoFlags::EFD_W) || c.extended.is_empty() {
                    return Ok(());
                }
                match sys::write(efd, c.extended.as_slice()) {
                    Ok(n) if n > 0 => {
                        debug!("channel {}: written {} to efd {}", id, n, efd);
                        c.extended.consume(n);
                        c.local_consumed = c.local_consumed.saturating_add(n as u32);
                        c.lastused = now;
                        self.lastused = now;
                    }
                    Err(ref e) if sys::is_transient(e) => {}
                    _ => {
                        debug!("channel {}: closing write-efd {}", id, efd);
                        if let Err(e) = c.close_efd() {
                            debug!("channel {}: close efd: {}", id, e)
                        }
                    }
                }
            }
            ExtendedUsage::Read | ExtendedUsage::Ignore => {
                let force = c.isatty && c.detach_close && c.istate != InputState::Closed;
                if !force && !c.io_ready.contains(IoFlags::EFD_R) {
                    return Ok(());
                }
                let mut buf = [0; CHAN_RBUF];
                match sys::read(efd, &mut buf) {
                    Ok(n) if n > 0 => {
                        debug!("channel {}: read {} from efd {}", id, n, efd);
                        c.lastused = now;
                        self.lastused = now;
                        if c.extended_usage == ExtendedUsage::Ignore {
                            debug!("channel {}: discard efd", id)
                        } else {
                            c.extended.extend(&buf[..n])
                        }
                    }
                    Err(ref e) if retry_later(e, force) => {}
                    _ => {
                        debug!("channel {}: closing read-efd {}", id, efd);
                        if let Err(e) = c.close_efd() {
                            debug!("channel {}: close efd: {}", id, e)
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Reopen the peer's window once enough has been consumed.
    fn check_window(&mut self, id: ChannelId) -> Result<(), Error> {
        let c = match self.channels.get_mut(id) {
            Some(c) => c,
            None => return Ok(()),
        };
        if c.window_adjust_due() {
            let remote_id = c.require_remote_id()?;
            push_packet!(self.write, {
                self.write.push(msg::CHANNEL_WINDOW_ADJUST);
                self.write.push_u32_be(remote_id);
                self.write.push_u32_be(c.local_consumed);
            });
            debug!("channel {}: window {} sent adjust {}", id, c.local_window, c.local_consumed);
            c.local_window = c.local_window.saturating_add(c.local_consumed);
            c.local_consumed = 0;
        }
        Ok(())
    }

    /// Completion of a non-blocking connect.
    pub(crate) fn post_connecting(&mut self, id: ChannelId) -> Result<(), Error> {
        let now = self.now;
        let c = match self.channels.get_mut(id) {
            Some(c) => c,
            None => return Ok(()),
        };
        if !c.io_ready.contains(IoFlags::SOCK_W) {
            return Ok(());
        }
        let remote_id = c.require_remote_id()?;
        // The peer was told about reverse dynamic channels already.
        let isopen = if let ChannelType::RDynamicFinish(_) = c.kind { true } else { false };
        let sock = match c.sock {
            Some(s) => s,
            None => return Ok(()),
        };
        let err = match sys::take_error(sock) {
            Ok(e) => e,
            Err(e) => {
                error!("getsockopt SO_ERROR failed: {}", e);
                Some(e)
            }
        };
        let (host, port) = match c.kind {
            ChannelType::Connecting(ref cx) | ChannelType::RDynamicFinish(ref cx) => {
                (cx.host().to_string(), cx.port())
            }
            _ => return Ok(()),
        };
        let err = match err {
            None => {
                debug!("channel {}: connected to {} port {}", id, host, port);
                c.kind = ChannelType::Open;
                c.lastused = now;
                self.lastused = now;
                if !isopen {
                    self.open_confirmation(id)?
                }
                return Ok(());
            }
            Some(ref e) if still_connecting(e) => return Ok(()),
            Some(e) => e,
        };
        debug!("channel {}: connection failed: {}", id, err);
        let next = match c.kind {
            ChannelType::Connecting(ref mut cx) | ChannelType::RDynamicFinish(ref mut cx) => cx.try_next(),
            _ => None,
        };
        match next {
            Some(fd) => {
                c.close_fds();
                c.sock = Some(fd);
                c.rfd = Some(fd);
                c.wfd = Some(fd);
            }
            None => {
                error!("connect_to {} port {}: failed.", host, port);
                if isopen {
                    self.rdynamic_close(id)?
                } else {
                    self.open_failure(remote_id, ChannelOpenFailure::ConnectFailed, &err.to_string());
                    if let Some(c) = self.channels.get_mut(id) {
                        c.mark_dead()
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::channel::ExtendedUsage;
    use crate::config::Config;
    use crate::encoding::Reader;
    use std::sync::Arc;

    fn open(session: &mut Session, fd: std::os::unix::io::RawFd) -> ChannelId {
        let id = session.new_channel(
            "direct-tcpip",
            ChannelType::Open,
            Some(fd),
            Some(fd),
            None,
            4096,
            1024,
            ExtendedUsage::Ignore,
            "test",
            true,
        );
        let c = session.channels.get_mut(id).unwrap();
        c.remote_id = Some(7);
        c.remote_window = 1 << 20;
        c.remote_maxpacket = 1 << 15;
        id
    }

    #[test]
    fn reads_are_bounded_by_the_remote_window() {
        crate::init();
        let mut session = Session::new(Arc::new(Config::default()));
        let (a, b) = sys::socketpair().unwrap();
        let id = open(&mut session, a);
        session.channels.get_mut(id).unwrap().remote_window = 5;
        sys::write(b, b"hello, world").unwrap();

        let mut set = session.prepare(1).unwrap();
        set.poll().unwrap();
        session.dispatch(&set, 1).unwrap();
        assert_eq!(session.channel(id).unwrap().input().as_slice(), b"hello");
        sys::close(b).unwrap();
    }

    #[test]
    fn consumed_output_reopens_the_window() {
        crate::init();
        let mut session = Session::new(Arc::new(Config::default()));
        let (a, b) = sys::socketpair().unwrap();
        let id = open(&mut session, a);
        {
            let c = session.channels.get_mut(id).unwrap();
            c.output.extend(&[1; 3000]);
            c.local_window -= 3000;
        }
        let mut set = session.prepare(1).unwrap();
        set.poll().unwrap();
        session.dispatch(&set, 1).unwrap();
        let c = session.channel(id).unwrap();
        assert!(c.output().is_empty());
        assert_eq!(c.local_window(), 4096);
        let packets = session.take_packets();
        let adjust = packets.iter().find(|p| p[0] == msg::CHANNEL_WINDOW_ADJUST).unwrap();
        let mut r = adjust.reader(1);
        assert_eq!(r.read_u32().unwrap(), 7);
        assert_eq!(r.read_u32().unwrap(), 3000);
        sys::close(b).unwrap();
    }

    #[test]
    fn eof_on_local_socket_sends_eof() {
        crate::init();
        let mut session = Session::new(Arc::new(Config::default()));
        let (a, b) = sys::socketpair().unwrap();
        let id = open(&mut session, a);
        sys::close(b).unwrap();
        let mut set = session.prepare(1).unwrap();
        set.poll().unwrap();
        session.dispatch(&set, 1).unwrap();
        assert_eq!(session.channel(id).unwrap().input_state(), InputState::WaitDrain);
        session.output_poll().unwrap();
        assert!(session.channel(id).unwrap().eof_sent());
        let packets = session.take_packets();
        assert!(packets.iter().any(|p| p[0] == msg::CHANNEL_EOF));
    }
}
