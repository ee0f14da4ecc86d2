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

#![deny(trivial_casts,
        unstable_features,
        unused_import_braces)]
#![allow(clippy::too_many_arguments)]

//! Multiplexed SSH channels over a single, already keyed and
//! authenticated transport.
//!
//! This crate turns one ordered, reliable message pipe into many
//! independent logical streams: interactive sessions, TCP/IP and
//! Unix-domain port forwarding (local, remote and dynamic/SOCKS),
//! X11 forwarding with cookie spoofing, agent forwarding, and mux
//! proxying (several local client sessions sharing one connection).
//!
//! # The session
//!
//! Everything lives in a [`Session`](struct.Session.html): the
//! channel table, the forwarding permissions, the X11 state and the
//! queue of outgoing packets. There are no globals, and no threads:
//! the session is driven by a single loop, one *tick* at a time.
//!
//! ```no_run
//! use std::sync::Arc;
//! use thrussh_channels::{Config, Session, Forward, Endpoint};
//!
//! let mut session = Session::new(Arc::new(Config::default()));
//! let mut fwd = Forward {
//!     listen: Endpoint::Tcp { host: Some("127.0.0.1".to_string()), port: 9000 },
//!     connect: Some(Endpoint::Tcp { host: Some("example".to_string()), port: 80 }),
//!     allocated_port: None,
//! };
//! session.setup_local_forward(&mut fwd).unwrap();
//! let start = std::time::Instant::now();
//! loop {
//!     let mut set = session.prepare(start.elapsed().as_secs()).unwrap();
//!     // add the transport's own descriptor to `set` here.
//!     set.poll().unwrap();
//!     session.dispatch(&set, start.elapsed().as_secs()).unwrap();
//!     // feed decrypted packets to `session.handle_message`, then:
//!     session.output_poll().unwrap();
//!     for packet in session.take_packets() {
//!         // frame, encrypt and send `packet`.
//!         # drop(packet)
//!     }
//! }
//! ```
//!
//! # Internal details of the event loop
//!
//! As in thrussh, none of the methods that generate protocol
//! messages write to the network. They push length-prefixed payloads
//! into the session's write buffer, and the packet layer picks them
//! up with [`Session::take_packets`](struct.Session.html#method.take_packets).
//!
//! A tick is: compute the readiness each channel wants
//! ([`prepare`](struct.Session.html#method.prepare)), wait once on all
//! descriptors, react to what became ready
//! ([`dispatch`](struct.Session.html#method.dispatch)), process
//! inbound messages, turn buffered input into `CHANNEL_DATA`
//! ([`output_poll`](struct.Session.html#method.output_poll)). Dead
//! channels are garbage-collected along the way.
//!
//! Any `Err` returned by these methods is fatal to the connection:
//! the caller should call
//! [`Session::disconnect`](struct.Session.html#method.disconnect) and
//! stop.

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate log;
extern crate byteorder;
extern crate cryptovec;

pub use cryptovec::CryptoVec;

macro_rules! push_packet {
    ( $buffer:expr, $x:expr ) => {
        {
            use byteorder::{BigEndian, ByteOrder};
            let i0 = $buffer.len();
            $buffer.extend(b"\0\0\0\0");
            let x = $x;
            let i1 = $buffer.len();
            use std::ops::DerefMut;
            let buf = $buffer.deref_mut();
            BigEndian::write_u32(&mut buf[i0..], (i1 - i0 - 4) as u32);
            x
        }
    };
}

mod msg;
mod encoding;
pub mod buffer;
mod config;
pub mod permission;
pub mod channel;
mod table;
mod session;
mod halfclose;
mod handlers;
mod input;
mod reactor;
mod sys;
mod connect;
pub mod socks;
mod forward;
mod mux;
pub mod x11;

#[cfg(test)]
mod tests;

pub use buffer::ChannelBuffer;
pub use channel::{Channel, ChannelType, ExtendedUsage, Filter, InputState, OutputState};
pub use config::{ChannelTimeout, Config, Endpoint, Forward, GatewayPorts, HostPort, Side};
pub use connect::ConnectContext;
pub use encoding::{Encoding, Position, Reader};
pub use permission::{Direction, Permission, Permissions, Who};
pub use reactor::PollSet;
pub use session::{Handler, Session};

/// The identifier of a channel: its index in the channel table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u32);

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug)]
/// Errors. Every error coming out of the message handlers or the
/// event loop ends the connection.
pub enum Error {
    /// Index out of bounds in a packet.
    IndexOutOfBounds,

    /// The protocol is in an inconsistent state.
    Inconsistent,

    /// Message received for a nonexistent or non-public channel.
    WrongChannel(u32),

    /// A message addressed to the peer's id was about to be sent
    /// before that id was known.
    NoRemoteId(ChannelId),

    /// The peer ignored the channel window.
    WindowExceeded(ChannelId),

    /// A window adjustment would overflow the remote window.
    WindowOverflow(ChannelId, u32),

    /// Open confirmation or failure for a channel that was not opening.
    NotOpening(ChannelId),

    /// UTF-8 decoding error (most probably ASCII error).
    Utf8(std::str::Utf8Error),

    /// I/O error.
    IO(std::io::Error),

    /// Invalid channel type pattern.
    Pattern(regex::Error),

    /// No listening socket could be set up for a forwarding.
    CannotListen,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match *self {
            Error::IndexOutOfBounds => write!(f, "Index out of bounds in a packet"),
            Error::Inconsistent => write!(f, "Unexpected message"),
            Error::WrongChannel(id) => {
                write!(f, "Packet referred to nonexistent channel {}", id)
            }
            Error::NoRemoteId(id) => write!(f, "channel {}: no remote id", id),
            Error::WindowExceeded(id) => {
                write!(f, "channel {}: peer ignored channel window", id)
            }
            Error::WindowOverflow(id, adjust) => {
                write!(f, "channel {}: adjust {} overflows remote window", id, adjust)
            }
            Error::NotOpening(id) => {
                write!(f, "Received open reply for non-opening channel {}", id)
            }
            Error::Utf8(ref e) => e.fmt(f),
            Error::IO(ref e) => e.fmt(f),
            Error::Pattern(ref e) => e.fmt(f),
            Error::CannotListen => write!(f, "Could not set up a listening socket"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            Error::Utf8(ref e) => Some(e),
            Error::IO(ref e) => Some(e),
            Error::Pattern(ref e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Error {
        Error::IO(e)
    }
}

impl From<std::str::Utf8Error> for Error {
    fn from(e: std::str::Utf8Error) -> Error {
        Error::Utf8(e)
    }
}

impl From<regex::Error> for Error {
    fn from(e: regex::Error) -> Error {
        Error::Pattern(e)
    }
}

/// A reason for disconnection.
#[allow(missing_docs)] // This should be relatively self-explanatory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disconnect {
    HostNotAllowedToConnect = 1,
    ProtocolError = 2,
    KeyExchangeFailed = 3,
    #[doc(hidden)]
    Reserved = 4,
    MACError = 5,
    CompressionError = 6,
    ServiceNotAvailable = 7,
    ProtocolVersionNotSupported = 8,
    HostKeyNotVerifiable = 9,
    ConnectionLost = 10,
    ByApplication = 11,
    TooManyConnections = 12,
    AuthCancelledByUser = 13,
    NoMoreAuthMethodsAvailable = 14,
    IllegalUserName = 15,
}

/// Reason for not being able to open a channel.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum ChannelOpenFailure {
    AdministrativelyProhibited = 1,
    ConnectFailed = 2,
    UnknownChannelType = 3,
    ResourceShortage = 4,
}

impl ChannelOpenFailure {
    fn from_u32(x: u32) -> Option<ChannelOpenFailure> {
        match x {
            1 => Some(ChannelOpenFailure::AdministrativelyProhibited),
            2 => Some(ChannelOpenFailure::ConnectFailed),
            3 => Some(ChannelOpenFailure::UnknownChannelType),
            4 => Some(ChannelOpenFailure::ResourceShortage),
            _ => None,
        }
    }

    fn description(&self) -> &'static str {
        match *self {
            ChannelOpenFailure::AdministrativelyProhibited => "administratively prohibited",
            ChannelOpenFailure::ConnectFailed => "connect failed",
            ChannelOpenFailure::UnknownChannelType => "unknown channel type",
            ChannelOpenFailure::ResourceShortage => "resource shortage",
        }
    }
}

#[cfg(test)]
use std::sync::Once;

#[cfg(test)]
static INIT: Once = Once::new();

#[cfg(test)]
fn init() {
    INIT.call_once(|| {
        let _ = env_logger::try_init();
    })
}
