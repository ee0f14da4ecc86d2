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

//! Parse `~/.ssh/config`-style files into the forwarding settings of
//! a [`thrussh_channels::Session`].
//!
//! ```
//! let file = "Host build\n  LocalForward 8080 localhost:80\n  ChannelTimeout session=5m\n";
//! let config = thrussh_config::parse(file, "build").unwrap();
//! assert_eq!(config.local_forwards.len(), 1);
//! let mut channels = thrussh_channels::Config::default();
//! config.apply(&mut channels);
//! assert_eq!(channels.timeout_for("session"), 300);
//! ```
extern crate thrussh_channels;
extern crate regex;
#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate log;
extern crate dirs;
#[cfg(test)]
extern crate env_logger;

use regex::Regex;
use std::io::Read;
use std::path::{Path, PathBuf};
use thrussh_channels::{ChannelTimeout, Direction, Forward, GatewayPorts, Permissions, Who};

mod forward;
pub use forward::*;

#[derive(Debug)]
pub enum Error {
    IO(std::io::Error),
    HostNotFound,
    NoHome,
    /// A forwarding spec that could not be parsed.
    BadForward(String),
    /// A malformed time spec.
    BadTime(String),
    /// A malformed argument to a keyword.
    BadValue(String),
}

impl std::convert::From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::IO(e)
    }
}
impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match *self {
            Error::IO(ref e) => e.fmt(f),
            Error::HostNotFound => write!(f, "Host not found"),
            Error::NoHome => write!(f, "No home directory"),
            Error::BadForward(ref s) => write!(f, "Bad forwarding specification {:?}", s),
            Error::BadTime(ref s) => write!(f, "Invalid time value {:?}", s),
            Error::BadValue(ref s) => write!(f, "Invalid argument {:?}", s),
        }
    }
}
impl std::error::Error for Error {
    fn description(&self) -> &str {
        match *self {
            Error::IO(ref e) => e.description(),
            Error::HostNotFound => "Host not found",
            Error::NoHome => "No home directory",
            Error::BadForward(_) => "Bad forwarding specification",
            Error::BadTime(_) => "Invalid time value",
            Error::BadValue(_) => "Invalid argument",
        }
    }
    fn cause(&self) -> Option<&dyn std::error::Error> {
        if let Error::IO(ref e) = *self {
            Some(e)
        } else {
            None
        }
    }
}

lazy_static! {
    // `Keyword value` or `Keyword=value`.
    static ref LINE: Regex = Regex::new(r"^([A-Za-z0-9]+)(?:\s*=\s*|\s+)(.*)$").unwrap();
}

#[derive(Debug, Default)]
pub struct Config {
    pub user: Option<String>,
    pub host_name: Option<String>,
    pub port: Option<u16>,
    pub identity_file: Option<String>,
    pub proxy_command: Option<String>,
    pub add_keys_to_agent: AddKeysToAgent,
    pub local_forwards: Vec<Forward>,
    /// Remote forwardings. Those without a connect part are reverse
    /// dynamic (SOCKS on the server side).
    pub remote_forwards: Vec<Forward>,
    pub dynamic_forwards: Vec<Forward>,
    pub gateway_ports: Option<GatewayPorts>,
    pub channel_timeouts: Vec<ChannelTimeout>,
    pub permit_open: Option<PermitList>,
    pub permit_listen: Option<PermitList>,
    pub streamlocal_bind_unlink: Option<bool>,
    pub streamlocal_bind_mask: Option<u32>,
    /// In seconds.
    pub forward_x11_timeout: Option<u64>,
    pub forward_x11: Option<bool>,
    pub forward_agent: Option<bool>,
    pub identity_agent: Option<PathBuf>,
}

impl Config {
    pub fn update_proxy_command(&mut self) {
        if let Some(ref h) = self.host_name {
            if let Some(ref mut prox) = self.proxy_command {
                *prox = prox.replace("%h", h);
            }
        }
        if let Some(ref p) = self.port {
            if let Some(ref mut prox) = self.proxy_command {
                *prox = prox.replace("%p", &format!("{}", p));
            }
        }
    }

    /// Copy the channel-layer settings found in the file into
    /// `config`. Keywords absent from the file leave it untouched.
    pub fn apply(&self, config: &mut thrussh_channels::Config) {
        if let Some(g) = self.gateway_ports {
            config.gateway_ports = g
        }
        if !self.channel_timeouts.is_empty() {
            config.channel_timeouts = self.channel_timeouts.clone()
        }
        if let Some(u) = self.streamlocal_bind_unlink {
            config.streamlocal_bind_unlink = u
        }
        if let Some(m) = self.streamlocal_bind_mask {
            config.streamlocal_bind_mask = m
        }
        if let Some(t) = self.forward_x11_timeout {
            config.x11_forward_timeout = Some(t)
        }
        if let Some(x) = self.forward_x11 {
            config.forward_x11 = x
        }
        if let Some(a) = self.forward_agent {
            config.forward_agent = a
        }
        if let Some(ref s) = self.identity_agent {
            config.agent_socket = Some(s.clone())
        }
    }

    /// Install `PermitOpen` and `PermitListen` as administrative
    /// restrictions.
    pub fn apply_permissions(&self, permissions: &mut Permissions) {
        let lists = [
            (&self.permit_open, Direction::Local),
            (&self.permit_listen, Direction::Remote),
        ];
        for &(list, dir) in lists.iter() {
            match *list {
                None | Some(PermitList::Any) => {}
                Some(PermitList::Deny) => permissions.disable_admin(dir),
                Some(PermitList::Only(ref v)) => {
                    permissions.clear(Who::Admin, dir);
                    for p in v {
                        permissions.add(Who::Admin, dir, p.clone());
                    }
                }
            }
        }
    }
}

pub fn parse_home(host: &str) -> Result<Config, Error> {
    let mut home = if let Some(home) = dirs::home_dir() {
        home
    } else {
        return Err(Error::NoHome)
    };
    home.push(".ssh");
    home.push("config");
    parse_path(&home, host)
}

pub fn parse_path<P:AsRef<Path>>(path: P, host: &str) -> Result<Config, Error> {
    let mut s = String::new();
    let mut b = std::fs::File::open(path)?;
    b.read_to_string(&mut s)?;
    parse(&s, host)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddKeysToAgent {
    Yes,
    Confirm,
    Ask,
    No
}

impl Default for AddKeysToAgent {
    fn default() -> Self {
        AddKeysToAgent::No
    }
}

/// Does `host` match a `Host` line? Patterns use `*` and `?`, and a
/// matching negated pattern (`!pattern`) rejects the host.
fn host_matches(patterns: &str, host: &str) -> bool {
    let mut matched = false;
    for pattern in patterns.split_whitespace() {
        let (negated, pattern) = if pattern.starts_with('!') {
            (true, &pattern[1..])
        } else {
            (false, pattern)
        };
        let mut re = String::from("^");
        for c in pattern.chars() {
            match c {
                '*' => re.push_str(".*"),
                '?' => re.push('.'),
                c => re.push_str(&regex::escape(c.encode_utf8(&mut [0; 4]))),
            }
        }
        re.push('$');
        let is_match = Regex::new(&re).map(|re| re.is_match(host)).unwrap_or(false);
        if is_match && negated {
            return false;
        }
        matched |= is_match
    }
    matched
}

fn yes_no(value: &str) -> Result<bool, Error> {
    match value.to_lowercase().as_str() {
        "yes" => Ok(true),
        "no" => Ok(false),
        _ => Err(Error::BadValue(value.to_string())),
    }
}

fn expand_home(path: &str) -> Result<PathBuf, Error> {
    if path.starts_with("~/") {
        let mut home = dirs::home_dir().ok_or(Error::NoHome)?;
        home.push(&path[2..]);
        Ok(home)
    } else {
        Ok(PathBuf::from(path))
    }
}

/// A `LocalForward` or `RemoteForward` line: the listen and connect
/// parts are separate arguments.
fn forward_args(value: &str, dynamic_alone: bool) -> Result<Forward, Error> {
    let args: Vec<&str> = value.split_whitespace().collect();
    match args[..] {
        [listen] if dynamic_alone => parse_forward(listen, true),
        [listen, connect] => parse_forward(&format!("{}:{}", listen, connect), false),
        _ => Err(Error::BadForward(value.to_string())),
    }
}

/// `type=interval` pairs, or `none`.
fn channel_timeouts(value: &str) -> Result<Vec<ChannelTimeout>, Error> {
    if value == "none" {
        return Ok(Vec::new());
    }
    let mut timeouts = Vec::new();
    for arg in value.split_whitespace() {
        let n = match arg.find('=') {
            Some(n) if n > 0 => n,
            _ => return Err(Error::BadValue(arg.to_string())),
        };
        let secs = parse_time(&arg[n + 1..])?;
        let t = ChannelTimeout::new(&arg[..n], secs).map_err(|_| Error::BadValue(arg.to_string()))?;
        timeouts.push(t)
    }
    Ok(timeouts)
}

pub fn parse(file: &str, host: &str) -> Result<Config, Error> {
    let mut config: Option<Config> = None;
    for line in file.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, value) = match LINE.captures(line) {
            Some(cap) => (cap.get(1).map(|m| m.as_str()).unwrap_or(""), cap.get(2).map(|m| m.as_str().trim()).unwrap_or("")),
            None => continue,
        };
        let lower = key.to_lowercase();
        if let Some(ref mut config) = config {
            match lower.as_str() {
                "host" | "match" => break,
                "user" => config.user = Some(value.to_string()),
                "hostname" => config.host_name = Some(value.to_string()),
                "port" => config.port = value.parse().ok(),
                "identityfile" => config.identity_file = Some(value.to_string()),
                "proxycommand" => config.proxy_command = Some(value.to_string()),
                "addkeystoagent" => {
                    match value.to_lowercase().as_str() {
                        "yes" => config.add_keys_to_agent = AddKeysToAgent::Yes,
                        "confirm" => config.add_keys_to_agent = AddKeysToAgent::Confirm,
                        "ask" => config.add_keys_to_agent = AddKeysToAgent::Ask,
                        _ => config.add_keys_to_agent = AddKeysToAgent::No,
                    }
                },
                "localforward" => config.local_forwards.push(forward_args(value, false)?),
                "remoteforward" => config.remote_forwards.push(forward_args(value, true)?),
                "dynamicforward" => config.dynamic_forwards.push(parse_forward(value, true)?),
                "gatewayports" => {
                    config.gateway_ports = Some(match value.to_lowercase().as_str() {
                        "yes" => GatewayPorts::Yes,
                        "no" => GatewayPorts::No,
                        "clientspecified" => GatewayPorts::ClientSpecified,
                        _ => return Err(Error::BadValue(value.to_string())),
                    })
                }
                "channeltimeout" => config.channel_timeouts = channel_timeouts(value)?,
                "permitopen" => {
                    let args: Vec<&str> = value.split_whitespace().collect();
                    config.permit_open = Some(parse_permit_open(&args)?)
                }
                "permitlisten" => {
                    let args: Vec<&str> = value.split_whitespace().collect();
                    config.permit_listen = Some(parse_permit_listen(&args)?)
                }
                "streamlocalbindunlink" => config.streamlocal_bind_unlink = Some(yes_no(value)?),
                "streamlocalbindmask" => {
                    match u32::from_str_radix(value, 8) {
                        Ok(m) if m <= 0o777 => config.streamlocal_bind_mask = Some(m),
                        _ => return Err(Error::BadValue(value.to_string())),
                    }
                }
                "forwardx11timeout" => config.forward_x11_timeout = Some(parse_time(value)?),
                "forwardx11" => config.forward_x11 = Some(yes_no(value)?),
                "forwardagent" => config.forward_agent = Some(yes_no(value)?),
                "identityagent" => {
                    match value {
                        "none" => {
                            config.identity_agent = None;
                            config.forward_agent = Some(false)
                        }
                        "SSH_AUTH_SOCK" => config.identity_agent = std::env::var_os("SSH_AUTH_SOCK").map(PathBuf::from),
                        path => config.identity_agent = Some(expand_home(path)?),
                    }
                }
                key => {
                    debug!("{:?}", key);
                }
            }
        } else {
            match lower.as_str() {
                "host" => {
                    if host_matches(value, host) {
                        config = Some(Config::default())
                    }
                }
                _ => {}
            }
        }

    }
    if let Some(config) = config {
        Ok(config)
    } else {
        Err(Error::HostNotFound)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use thrussh_channels::Endpoint;

    const FILE: &str = "
# Build machines.
Host *.internal !bastion.internal
    User deploy
    Port 2222

Host build
    HostName build.example.com
    LocalForward 8080 localhost:80
    LocalForward [::1]:5432 /var/run/postgresql/.s.PGSQL.5432
    RemoteForward 9000 127.0.0.1:9000
    RemoteForward 1080
    DynamicForward localhost:1081
    GatewayPorts clientspecified
    ChannelTimeout session=5m direct-*=1h30m global=2h
    PermitOpen db:5432 cache:*
    PermitListen none
    StreamLocalBindUnlink yes
    StreamLocalBindMask 0077
    ForwardX11Timeout 20m
    ForwardAgent=yes
    IdentityAgent /run/agent.sock
    ProxyCommand nc %h %p

Host other
    User nobody
";

    #[test]
    fn host_patterns() {
        let config = parse(FILE, "db.internal").unwrap();
        assert_eq!(config.user.as_ref().map(|u| u.as_str()), Some("deploy"));
        assert_eq!(config.port, Some(2222));
        match parse(FILE, "bastion.internal") {
            Err(Error::HostNotFound) => {}
            r => panic!("{:?}", r),
        }
    }

    #[test]
    fn forwarding_keywords() {
        let _ = env_logger::try_init();
        let mut config = parse(FILE, "build").unwrap();
        assert!(config.user.is_none());
        assert_eq!(config.local_forwards.len(), 2);
        assert_eq!(
            config.local_forwards[1].connect,
            Some(Endpoint::Unix(PathBuf::from("/var/run/postgresql/.s.PGSQL.5432")))
        );
        assert_eq!(config.remote_forwards.len(), 2);
        assert!(!config.remote_forwards[0].is_dynamic());
        assert!(config.remote_forwards[1].is_dynamic());
        assert_eq!(
            config.dynamic_forwards[0].listen,
            Endpoint::Tcp {
                host: Some("localhost".to_string()),
                port: 1081
            }
        );
        assert_eq!(config.gateway_ports, Some(GatewayPorts::ClientSpecified));
        assert_eq!(config.channel_timeouts.len(), 3);
        assert_eq!(config.permit_listen, Some(PermitList::Deny));
        assert_eq!(config.streamlocal_bind_mask, Some(0o077));
        assert_eq!(config.forward_x11_timeout, Some(1200));
        assert_eq!(config.forward_agent, Some(true));

        config.update_proxy_command();
        assert_eq!(config.proxy_command.as_ref().map(|p| p.as_str()), Some("nc build.example.com %p"));

        let mut channels = thrussh_channels::Config::default();
        config.apply(&mut channels);
        assert_eq!(channels.timeout_for("session"), 300);
        assert_eq!(channels.timeout_for("direct-tcpip"), 5400);
        assert_eq!(channels.global_timeout(), 7200);
        assert_eq!(channels.timeout_for("x11"), 0);
        assert!(channels.streamlocal_bind_unlink);
        assert_eq!(channels.x11_forward_timeout, Some(1200));
        assert_eq!(channels.agent_socket, Some(PathBuf::from("/run/agent.sock")));

        let mut permissions = Permissions::default();
        config.apply_permissions(&mut permissions);
        assert!(permissions.check_connect_admin("db", thrussh_channels::HostPort::Port(5432)));
        assert!(permissions.check_connect_admin("cache", thrussh_channels::HostPort::Port(6379)));
        assert!(!permissions.check_connect_admin("db", thrussh_channels::HostPort::Port(22)));
    }

    #[test]
    fn bad_values() {
        for file in &[
            "Host a\n LocalForward 8080\n",
            "Host a\n GatewayPorts maybe\n",
            "Host a\n ChannelTimeout session\n",
            "Host a\n ForwardX11Timeout 3 minutes\n",
            "Host a\n StreamLocalBindMask 999\n",
        ] {
            assert!(parse(file, "a").is_err(), "{:?}", file);
        }
    }
}
