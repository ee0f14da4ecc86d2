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
use crate::config::HostPort;
use socket2::{SockAddr, Socket, Type};
use std::collections::VecDeque;
use std::io;
use std::net::ToSocketAddrs;
use std::os::unix::io::{IntoRawFd, RawFd};

/// A non-blocking connection attempt over a list of candidate
/// addresses.
#[derive(Debug)]
pub struct ConnectContext {
    host: String,
    port: HostPort,
    addrs: VecDeque<SockAddr>,
}

impl ConnectContext {
    /// Resolve the target. For `HostPort::StreamLocal`, `host` is a
    /// socket path.
    pub fn new(host: &str, port: HostPort) -> io::Result<Self> {
        let addrs = match port {
            HostPort::StreamLocal => {
                let mut v = VecDeque::new();
                v.push_back(SockAddr::unix(host)?);
                v
            }
            HostPort::Port(p) => (host, p).to_socket_addrs()?.map(SockAddr::from).collect(),
        };
        Ok(ConnectContext {
            host: host.to_string(),
            port,
            addrs,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> HostPort {
        self.port
    }

    /// Start connecting to the next candidate. Candidates failing
    /// synchronously are skipped; `None` once all have been tried.
    pub fn try_next(&mut self) -> Option<RawFd> {
        while let Some(addr) = self.addrs.pop_front() {
            match connect_nonblocking(&addr) {
                Ok(fd) => {
                    debug!("connect_next: host {} ([{:?}]:{}) in progress, fd={}",
                           self.host, addr.as_socket().map(|a| a.ip()), self.port, fd);
                    return Some(fd);
                }
                Err(e) => {
                    debug!("connect_next: host {} port {}: {}", self.host, self.port, e);
                }
            }
        }
        None
    }
}

fn connect_nonblocking(addr: &SockAddr) -> io::Result<RawFd> {
    let sock = Socket::new(addr.domain(), Type::STREAM, None)?;
    sock.set_nonblocking(true)?;
    match sock.connect(addr) {
        Ok(()) => {}
        Err(ref e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(e) => return Err(e),
    }
    Ok(sock.into_raw_fd())
}
