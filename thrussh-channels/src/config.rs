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
use crate::Error;
use regex::Regex;
use std::path::PathBuf;

/// Default window of TCP/IP, agent and session channels.
pub const CHAN_TCP_PACKET_DEFAULT: u32 = 32 * 1024;
pub const CHAN_TCP_WINDOW_DEFAULT: u32 = 64 * CHAN_TCP_PACKET_DEFAULT;
pub const CHAN_X11_PACKET_DEFAULT: u32 = 16 * 1024;
pub const CHAN_X11_WINDOW_DEFAULT: u32 = 4 * CHAN_X11_PACKET_DEFAULT;

/// Which end of the connection this session is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

/// Who may bind remote forwardings to non-loopback addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayPorts {
    /// Always bind to loopback.
    No,
    /// Always bind to the wildcard address.
    Yes,
    /// Let the client choose.
    ClientSpecified,
}

/// Inactivity timeout for channels whose type matches a glob.
#[derive(Debug, Clone)]
pub struct ChannelTimeout {
    pattern: String,
    regex: Regex,
    timeout: u64,
}

impl ChannelTimeout {
    /// `pattern` is a glob over channel types (`*` and `?`). The
    /// special pattern `global` sets the session-wide deadline.
    pub fn new(pattern: &str, timeout: u64) -> Result<Self, Error> {
        let mut re = String::with_capacity(pattern.len() + 2);
        re.push('^');
        for c in pattern.chars() {
            match c {
                '*' => re.push_str(".*"),
                '?' => re.push('.'),
                c => re.push_str(&regex::escape(c.encode_utf8(&mut [0; 4]))),
            }
        }
        re.push('$');
        Ok(ChannelTimeout {
            pattern: pattern.to_string(),
            regex: Regex::new(&re)?,
            timeout,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Timeout in seconds, zero for none.
    pub fn timeout(&self) -> u64 {
        self.timeout
    }

    pub fn is_global(&self) -> bool {
        self.pattern == "global"
    }

    pub fn matches(&self, ctype: &str) -> bool {
        self.regex.is_match(ctype)
    }
}

/// One side of a forwarding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// A TCP address. A missing host means the default for the
    /// context (loopback, or whatever the gateway policy dictates).
    Tcp { host: Option<String>, port: u16 },
    /// A Unix-domain socket path.
    Unix(PathBuf),
}

/// A forwarding, as requested on the command line or by the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Forward {
    pub listen: Endpoint,
    /// `None` for dynamic (SOCKS) forwardings.
    pub connect: Option<Endpoint>,
    /// Port chosen by the system when listening on port 0.
    pub allocated_port: Option<u16>,
}

impl Forward {
    pub fn is_dynamic(&self) -> bool {
        self.connect.is_none()
    }

    pub(crate) fn listen_host(&self) -> Option<&str> {
        match self.listen {
            Endpoint::Tcp { ref host, .. } => host.as_ref().map(|h| h.as_str()),
            Endpoint::Unix(_) => None,
        }
    }

    pub(crate) fn listen_port(&self) -> u16 {
        match self.listen {
            Endpoint::Tcp { port, .. } => port,
            Endpoint::Unix(_) => 0,
        }
    }
}

/// Port of a channel's target: a TCP port, or a marker for Unix
/// sockets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostPort {
    Port(u16),
    StreamLocal,
}

impl Default for HostPort {
    fn default() -> Self {
        HostPort::Port(0)
    }
}

impl std::fmt::Display for HostPort {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match *self {
            HostPort::Port(p) => write!(f, "{}", p),
            HostPort::StreamLocal => write!(f, "streamlocal"),
        }
    }
}

/// Configuration of a session.
#[derive(Debug)]
pub struct Config {
    /// Whether we are the client or the server.
    pub side: Side,
    /// The initial window of channels we open or accept.
    pub window_size: u32,
    /// The maximal size of a single packet.
    pub maximum_packet_size: u32,
    /// Bind policy for remote forwardings (server side) and for
    /// local forwardings with an explicit address (client side).
    pub gateway_ports: GatewayPorts,
    /// Whether the server accepts `tcpip-forward` and `direct-tcpip`.
    pub allow_tcp_forwarding: bool,
    /// Whether the server accepts Unix-domain forwardings.
    pub allow_streamlocal_forwarding: bool,
    /// Remove stale Unix sockets before binding.
    pub streamlocal_bind_unlink: bool,
    /// umask applied while binding Unix sockets.
    pub streamlocal_bind_mask: u32,
    /// Per-type inactivity timeouts.
    pub channel_timeouts: Vec<ChannelTimeout>,
    /// The channel table never grows past this.
    pub max_channels: usize,
    /// Accept X11 channels opened by the server (client side).
    pub forward_x11: bool,
    /// Local display to connect X11 channels to (client side).
    pub x11_display: Option<String>,
    /// Seconds after which X11 connections are refused, if any.
    pub x11_forward_timeout: Option<u64>,
    /// First display number tried by the server.
    pub x11_display_offset: u32,
    /// Whether X11 listeners bind to loopback only.
    pub x11_use_localhost: bool,
    /// Accept agent channels opened by the server (client side).
    pub forward_agent: bool,
    /// The local agent socket.
    pub agent_socket: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            side: Side::Client,
            window_size: CHAN_TCP_WINDOW_DEFAULT,
            maximum_packet_size: CHAN_TCP_PACKET_DEFAULT,
            gateway_ports: GatewayPorts::No,
            allow_tcp_forwarding: true,
            allow_streamlocal_forwarding: true,
            streamlocal_bind_unlink: false,
            streamlocal_bind_mask: 0o177,
            channel_timeouts: Vec::new(),
            max_channels: 16 * 1024,
            forward_x11: false,
            x11_display: std::env::var("DISPLAY").ok(),
            x11_forward_timeout: None,
            x11_display_offset: 10,
            x11_use_localhost: true,
            forward_agent: false,
            agent_socket: std::env::var_os("SSH_AUTH_SOCK").map(PathBuf::from),
        }
    }
}

impl Config {
    /// The inactivity timeout of a channel type, zero for none. The
    /// first matching pattern wins.
    pub fn timeout_for(&self, ctype: &str) -> u64 {
        self.channel_timeouts
            .iter()
            .filter(|t| !t.is_global())
            .find(|t| t.matches(ctype))
            .map(|t| t.timeout())
            .unwrap_or(0)
    }

    /// The session-wide inactivity deadline, zero for none.
    pub fn global_timeout(&self) -> u64 {
        self.channel_timeouts
            .iter()
            .find(|t| t.is_global())
            .map(|t| t.timeout())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn timeout_patterns() {
        let config = Config {
            channel_timeouts: vec![
                ChannelTimeout::new("direct-*", 30).unwrap(),
                ChannelTimeout::new("session", 300).unwrap(),
                ChannelTimeout::new("global", 600).unwrap(),
                ChannelTimeout::new("*", 5).unwrap(),
            ],
            ..Config::default()
        };
        assert_eq!(config.timeout_for("direct-tcpip"), 30);
        assert_eq!(config.timeout_for("direct-streamlocal@openssh.com"), 30);
        assert_eq!(config.timeout_for("session"), 300);
        assert_eq!(config.timeout_for("x11-connection"), 5);
        assert_eq!(config.global_timeout(), 600);

        // Dots are literal.
        let t = ChannelTimeout::new("a.b", 1).unwrap();
        assert!(t.matches("a.b"));
        assert!(!t.matches("axb"));
    }
}
