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

//! The two half-close state machines of a channel.
//!
//! Input (local descriptor to peer): `Open` until the local read side
//! fails or the peer closes, then `WaitDrain` until everything read
//! has been sent, then `Closed` once EOF has been sent.
//!
//! Output (peer to local descriptor): `Open` until the peer sends EOF
//! or CLOSE, then `WaitDrain` until everything received has been
//! written, then `Closed` once the write side is shut down.
//!
//! CLOSE is sent once both are `Closed`; the channel is dead once
//! CLOSE has been both sent and received.
use crate::channel::{ChanFlags, Channel, ChannelType, ExtendedUsage, InputState, OutputState};
use crate::encoding::Encoding;
use crate::sys;
use crate::{msg, Error};
use cryptovec::CryptoVec;
use std::net::Shutdown;

impl Channel {
    fn set_istate(&mut self, next: InputState) {
        debug!("channel {}: input {:?} -> {:?}", self.id, self.istate, next);
        self.istate = next
    }

    fn set_ostate(&mut self, next: OutputState) {
        debug!("channel {}: output {:?} -> {:?}", self.id, self.ostate, next);
        self.ostate = next
    }

    /// Is the extended descriptor still going to receive data?
    pub(crate) fn efd_output_active(&self) -> bool {
        self.extended_usage == ExtendedUsage::Write
            && self.efd.is_some()
            && (!self.flags.intersects(ChanFlags::EOF_RCVD | ChanFlags::CLOSE_RCVD)
                || !self.extended.is_empty())
    }

    pub(crate) fn efd_input_active(&self) -> bool {
        self.extended_usage == ExtendedUsage::Read
            && (self.efd.is_some() || !self.extended.is_empty())
    }

    pub(crate) fn read_failed(&mut self) {
        debug!("channel {}: read failed", self.id);
        match self.istate {
            InputState::Open => {
                self.shutdown_read();
                self.set_istate(InputState::WaitDrain)
            }
            s => error!("channel {}: read_failed for istate {:?}", self.id, s),
        }
    }

    /// Everything read locally has been sent.
    pub(crate) fn ibuf_empty(&mut self, write: &mut CryptoVec) -> Result<(), Error> {
        debug!("channel {}: ibuf empty", self.id);
        if !self.input.is_empty() {
            error!("channel {}: ibuf_empty for non empty buffer", self.id);
            return Ok(());
        }
        match self.istate {
            InputState::WaitDrain => {
                if !self.flags.intersects(ChanFlags::CLOSE_SENT | ChanFlags::LOCAL) {
                    self.send_eof(write)?
                }
                self.set_istate(InputState::Closed)
            }
            s => error!("channel {}: ibuf_empty for istate {:?}", self.id, s),
        }
        Ok(())
    }

    /// Everything received has been written locally.
    pub(crate) fn obuf_empty(&mut self) {
        debug!("channel {}: obuf empty", self.id);
        if !self.output.is_empty() {
            error!("channel {}: obuf_empty for non empty buffer", self.id);
            return;
        }
        match self.ostate {
            OutputState::WaitDrain => {
                self.shutdown_write();
                self.set_ostate(OutputState::Closed)
            }
            s => error!("channel {}: obuf_empty for ostate {:?}", self.id, s),
        }
    }

    pub(crate) fn rcvd_ieof(&mut self) {
        debug!("channel {}: rcvd eof", self.id);
        self.flags |= ChanFlags::EOF_RCVD;
        if self.ostate == OutputState::Open {
            self.set_ostate(OutputState::WaitDrain)
        }
        if self.ostate == OutputState::WaitDrain && self.output.is_empty() && !self.efd_output_active() {
            self.obuf_empty()
        }
    }

    pub(crate) fn rcvd_oclose(&mut self, write: &mut CryptoVec) -> Result<(), Error> {
        debug!("channel {}: rcvd close", self.id);
        if !self.flags.contains(ChanFlags::LOCAL) {
            if self.flags.contains(ChanFlags::CLOSE_RCVD) {
                error!("channel {}: protocol error: close rcvd twice", self.id);
            }
            self.flags |= ChanFlags::CLOSE_RCVD;
        }
        if let ChannelType::Larval = self.kind {
            self.set_ostate(OutputState::Closed);
            self.set_istate(InputState::Closed);
            return Ok(());
        }
        if self.ostate == OutputState::Open {
            // Let what we already received drain first.
            self.set_ostate(OutputState::WaitDrain)
        }
        match self.istate {
            InputState::Open => {
                self.shutdown_read();
                self.shutdown_extended_read();
                self.set_istate(InputState::Closed)
            }
            InputState::WaitDrain => {
                if !self.flags.contains(ChanFlags::LOCAL) {
                    self.send_eof(write)?
                }
                self.shutdown_extended_read();
                self.set_istate(InputState::Closed)
            }
            InputState::Closed => {}
        }
        Ok(())
    }

    pub(crate) fn write_failed(&mut self, write: &mut CryptoVec) -> Result<(), Error> {
        debug!("channel {}: write failed", self.id);
        match self.ostate {
            OutputState::Open | OutputState::WaitDrain => {
                self.shutdown_write();
                if self.ctype == "session" {
                    self.send_eow(write)?
                }
                self.set_ostate(OutputState::Closed)
            }
            s => error!("channel {}: write_failed for ostate {:?}", self.id, s),
        }
        Ok(())
    }

    /// The peer will not write to our descriptor anymore
    /// (`eow@openssh.com`).
    pub(crate) fn rcvd_eow(&mut self) {
        debug!("channel {}: rcvd eow", self.id);
        if self.istate == InputState::Open {
            self.shutdown_read();
            self.set_istate(InputState::Closed)
        }
    }

    fn send_eof(&mut self, write: &mut CryptoVec) -> Result<(), Error> {
        debug!("channel {}: send eof", self.id);
        if self.istate != InputState::WaitDrain {
            error!("channel {}: cannot send eof for istate {:?}", self.id, self.istate);
            return Ok(());
        }
        let remote_id = self.require_remote_id()?;
        push_packet!(write, {
            write.push(msg::CHANNEL_EOF);
            write.push_u32_be(remote_id);
        });
        self.flags |= ChanFlags::EOF_SENT;
        Ok(())
    }

    pub(crate) fn send_close(&mut self, write: &mut CryptoVec) -> Result<(), Error> {
        debug!("channel {}: send close", self.id);
        if self.ostate != OutputState::Closed || self.istate != InputState::Closed {
            error!(
                "channel {}: cannot send close for istate/ostate {:?}/{:?}",
                self.id, self.istate, self.ostate
            );
        } else if self.flags.contains(ChanFlags::CLOSE_SENT) {
            error!("channel {}: already sent close", self.id);
        } else {
            let remote_id = self.require_remote_id()?;
            push_packet!(write, {
                write.push(msg::CHANNEL_CLOSE);
                write.push_u32_be(remote_id);
            });
            self.flags |= ChanFlags::CLOSE_SENT;
        }
        Ok(())
    }

    fn send_eow(&mut self, write: &mut CryptoVec) -> Result<(), Error> {
        debug!("channel {}: send eow", self.id);
        if self.ostate == OutputState::Closed {
            error!("channel {}: must not send eow on closed output", self.id);
            return Ok(());
        }
        let remote_id = self.require_remote_id()?;
        push_packet!(write, {
            write.push(msg::CHANNEL_REQUEST);
            write.push_u32_be(remote_id);
            write.extend_ssh_string(b"eow@openssh.com");
            write.push(0);
        });
        Ok(())
    }

    pub(crate) fn mark_dead(&mut self) {
        debug!("channel {}: marked dead", self.id);
        self.kind = ChannelType::Zombie
    }

    /// Can this channel be freed? With `do_send`, a channel whose
    /// both directions are closed sends its CLOSE now.
    pub(crate) fn is_dead(&mut self, write: &mut CryptoVec, do_send: bool) -> Result<bool, Error> {
        if let ChannelType::Zombie = self.kind {
            debug!("channel {}: zombie", self.id);
            return Ok(true);
        }
        if self.istate != InputState::Closed || self.ostate != OutputState::Closed {
            return Ok(false);
        }
        if self.flags.contains(ChanFlags::LOCAL) {
            debug!("channel {}: is dead (local)", self.id);
            return Ok(true);
        }
        if !self.flags.contains(ChanFlags::CLOSE_SENT) {
            if do_send {
                self.send_close(write)?
            } else if self.flags.contains(ChanFlags::CLOSE_RCVD) {
                // Would be dead once we send our close.
                debug!("channel {}: almost dead", self.id);
                return Ok(true);
            }
        }
        if self.flags.contains(ChanFlags::CLOSE_SENT | ChanFlags::CLOSE_RCVD) {
            debug!("channel {}: is dead", self.id);
            return Ok(true);
        }
        Ok(false)
    }

    fn shutdown_read(&mut self) {
        if let ChannelType::Larval = self.kind {
            return;
        }
        debug!("channel {}: close_read", self.id);
        if let Some(sock) = self.sock {
            if let Err(e) = sys::shutdown(sock, Shutdown::Read) {
                // The write side may already be gone.
                if e.raw_os_error() != Some(libc::ENOTCONN) {
                    error!("channel {}: shutdown({}, SHUT_RD): {}", self.id, sock, e)
                }
            }
        } else if let Err(e) = self.close_rfd() {
            info!("channel {}: close_read: {}", self.id, e)
        }
    }

    fn shutdown_write(&mut self) {
        self.output.clear();
        if let ChannelType::Larval = self.kind {
            return;
        }
        debug!("channel {}: close_write", self.id);
        if let Some(sock) = self.sock {
            if let Err(e) = sys::shutdown(sock, Shutdown::Write) {
                if e.raw_os_error() != Some(libc::ENOTCONN) {
                    error!("channel {}: shutdown({}, SHUT_WR): {}", self.id, sock, e)
                }
            }
        } else if let Err(e) = self.close_wfd() {
            info!("channel {}: close_write: {}", self.id, e)
        }
    }

    pub(crate) fn shutdown_extended_read(&mut self) {
        if let ChannelType::Larval = self.kind {
            return;
        }
        if self.efd.is_none() || self.extended_usage == ExtendedUsage::Write {
            return;
        }
        debug!("channel {}: close_read (extended)", self.id);
        if let Err(e) = self.close_efd() {
            info!("channel {}: close_read (extended): {}", self.id, e)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ChannelId;

    fn open_channel() -> Channel {
        let mut c = Channel::new(ChannelId(3), "direct-tcpip", ChannelType::Open, 1024, 512, "t", 0);
        c.remote_id = Some(42);
        c
    }

    #[test]
    fn orderly_close_sends_eof_then_close() {
        crate::init();
        let mut write = CryptoVec::new();
        let mut c = open_channel();
        c.read_failed();
        assert_eq!(c.istate, InputState::WaitDrain);
        c.ibuf_empty(&mut write).unwrap();
        assert_eq!(c.istate, InputState::Closed);
        assert!(c.eof_sent());

        c.rcvd_ieof();
        assert_eq!(c.ostate, OutputState::Closed);
        assert!(!c.is_dead(&mut write, false).unwrap());
        assert!(!c.is_dead(&mut write, true).unwrap());
        assert!(c.close_sent());
        c.rcvd_oclose(&mut write).unwrap();
        assert!(c.is_dead(&mut write, true).unwrap());

        // EOF then CLOSE, both for remote id 42.
        assert_eq!(&write[..], &[0, 0, 0, 5, msg::CHANNEL_EOF, 0, 0, 0, 42,
                                 0, 0, 0, 5, msg::CHANNEL_CLOSE, 0, 0, 0, 42][..]);
    }

    #[test]
    fn close_waits_for_output_to_drain() {
        let mut write = CryptoVec::new();
        let mut c = open_channel();
        c.output.extend(b"pending");
        c.rcvd_oclose(&mut write).unwrap();
        assert_eq!(c.istate, InputState::Closed);
        assert_eq!(c.ostate, OutputState::WaitDrain);
        assert!(!c.is_dead(&mut write, false).unwrap());
        c.output.consume(7);
        c.obuf_empty();
        assert_eq!(c.ostate, OutputState::Closed);
        // Close received, not yet sent.
        assert!(c.is_dead(&mut write, false).unwrap());
    }

    #[test]
    fn larval_close_is_immediate() {
        let mut write = CryptoVec::new();
        let mut c = Channel::new(ChannelId(0), "session", ChannelType::Larval, 1024, 512, "t", 0);
        c.remote_id = Some(1);
        c.rcvd_oclose(&mut write).unwrap();
        assert_eq!((c.istate, c.ostate), (InputState::Closed, OutputState::Closed));
        assert!(write.is_empty());
    }

    #[test]
    fn no_message_without_remote_id() {
        let mut write = CryptoVec::new();
        let mut c = Channel::new(ChannelId(0), "direct-tcpip", ChannelType::Opening, 1024, 512, "t", 0);
        c.read_failed();
        match c.ibuf_empty(&mut write) {
            Err(Error::NoRemoteId(ChannelId(0))) => {}
            e => panic!("{:?}", e),
        }
        assert!(write.is_empty());
    }
}
