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

//! Port forwarding: listeners, the channels they accept, and the
//! outbound connections of forwarded channels.
use crate::channel::{ChannelType, ExtendedUsage, IoFlags};
use crate::config::{
    Endpoint, Forward, GatewayPorts, HostPort, Side, CHAN_TCP_PACKET_DEFAULT, CHAN_X11_PACKET_DEFAULT,
    CHAN_X11_WINDOW_DEFAULT, CHAN_TCP_WINDOW_DEFAULT,
};
use crate::connect::ConnectContext;
use crate::encoding::Encoding;
use crate::permission::{rfwd_bind_host, Direction, Permission, Who};
use crate::session::Session;
use crate::{sys, ChannelId, ChannelOpenFailure, Error};
use socket2::{Domain, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::os::unix::io::{IntoRawFd, RawFd};
use std::os::unix::net::UnixListener;
use std::path::Path;

const LISTEN_BACKLOG: i32 = 128;

/// Where a forwarding listener binds.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Bind {
    Wildcard,
    Loopback,
    Addr(String),
}

impl Bind {
    fn addrs(&self, port: u16) -> io::Result<Vec<SocketAddr>> {
        Ok(match *self {
            Bind::Wildcard => vec![
                SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
                SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port),
            ],
            Bind::Loopback => vec![
                SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
                SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), port),
            ],
            Bind::Addr(ref a) => (a.as_str(), port).to_socket_addrs()?.collect(),
        })
    }

    fn listening_addr(&self) -> Option<String> {
        match *self {
            Bind::Addr(ref a) => Some(a.clone()),
            _ => None,
        }
    }
}

/// Where an inbound open on a remote forwarding goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Route {
    Local(ChannelId),
    /// A mux client that requested this forwarding.
    Downstream(ChannelId),
}

/// A listening TCP socket, non-blocking and close-on-exec.
pub(crate) fn listen_tcp(addr: SocketAddr) -> io::Result<RawFd> {
    let sock = Socket::new(Domain::for_address(addr), Type::STREAM, None)?;
    sock.set_reuse_address(true)?;
    if addr.is_ipv6() {
        sock.set_only_v6(true)?;
    }
    sock.bind(&addr.into())?;
    sock.listen(LISTEN_BACKLOG)?;
    sock.set_nonblocking(true)?;
    Ok(sock.into_raw_fd())
}

/// A listening Unix socket, created under `mask`.
fn listen_unix(path: &Path, mask: u32, unlink: bool) -> io::Result<RawFd> {
    if unlink {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != io::ErrorKind::NotFound {
                error!("unlink({}): {}", path.display(), e)
            }
        }
    }
    let old = unsafe { libc::umask(mask as libc::mode_t) };
    let listener = UnixListener::bind(path);
    unsafe { libc::umask(old) };
    let listener = listener?;
    listener.set_nonblocking(true)?;
    let fd = listener.into_raw_fd();
    sys::set_cloexec(fd);
    Ok(fd)
}

impl Session {
    /// Apply the gateway policy to a requested listen address.
    fn fwd_bind_addr(&mut self, listen_addr: Option<&str>, is_client: bool, notify: bool) -> Bind {
        let gateway_ports = self.config.gateway_ports;
        let listen_addr = match listen_addr {
            None if gateway_ports != GatewayPorts::No => return Bind::Wildcard,
            None => return Bind::Loopback,
            Some(a) => a,
        };
        if gateway_ports != GatewayPorts::No || is_client {
            if listen_addr.is_empty()
                || listen_addr == "*"
                || (!is_client && gateway_ports == GatewayPorts::Yes)
            {
                if notify && !listen_addr.is_empty() && listen_addr != "0.0.0.0" && listen_addr != "*" {
                    self.send_debug(&format!(
                        "Forwarding listen address \"{}\" overridden by server GatewayPorts",
                        listen_addr
                    ))
                }
                Bind::Wildcard
            } else if listen_addr != "localhost" {
                // "localhost" listens on every loopback address family.
                Bind::Addr(listen_addr.to_string())
            } else {
                Bind::Loopback
            }
        } else if listen_addr == "127.0.0.1" || listen_addr == "::1" {
            Bind::Addr(listen_addr.to_string())
        } else {
            Bind::Loopback
        }
    }

    /// One listener channel per bound address. Returns the port,
    /// which is the one allocated by the system if `listen_port` was 0.
    fn setup_listener_tcpip(
        &mut self,
        remote: bool,
        listen_host: Option<&str>,
        listen_port: u16,
        path: &str,
        host_port: HostPort,
    ) -> Result<u16, Error> {
        let bind = self.fwd_bind_addr(listen_host, !remote, true);
        debug!("fwd_bind_addr {:?} -> {:?}", listen_host, bind);
        let addrs = match bind.addrs(listen_port) {
            Ok(a) => a,
            Err(e) => {
                error!("{:?}: {}", listen_host, e);
                return Err(Error::CannotListen);
            }
        };
        let (window, maxpacket) = (self.config.window_size, self.config.maximum_packet_size);
        let mut allocated = 0;
        for mut addr in addrs {
            // The same port for every address family.
            if listen_port == 0 && allocated > 0 {
                addr.set_port(allocated)
            }
            debug!("Local forwarding listening on {} port {}.", addr.ip(), addr.port());
            let sock = match listen_tcp(addr) {
                Ok(s) => s,
                Err(e) => {
                    error!("bind [{}]:{}: {}", addr.ip(), addr.port(), e);
                    continue;
                }
            };
            if allocated == 0 {
                allocated = if listen_port == 0 {
                    let port = sys::local_addr(sock).map(|a| a.port()).unwrap_or(0);
                    debug!("Allocated listen port {}", port);
                    port
                } else {
                    listen_port
                }
            }
            let id = self.new_channel(
                "port-listener",
                if remote { ChannelType::RPortListener } else { ChannelType::PortListener },
                Some(sock),
                Some(sock),
                None,
                window,
                maxpacket,
                ExtendedUsage::Ignore,
                "port listener",
                true,
            );
            if let Some(c) = self.channels.get_mut(id) {
                c.path = Some(path.to_string());
                c.host_port = host_port;
                c.listening_addr = bind.listening_addr();
                c.listening_port = allocated;
            }
        }
        if allocated == 0 {
            error!("cannot listen to port: {}", listen_port);
            return Err(Error::CannotListen);
        }
        Ok(allocated)
    }

    fn setup_listener_streamlocal(
        &mut self,
        kind: ChannelType,
        listen_path: &Path,
        path: &str,
        host_port: HostPort,
    ) -> Result<(), Error> {
        debug!("setup_listener_streamlocal: {:?} path {}", kind, listen_path.display());
        let sock = match listen_unix(listen_path, self.config.streamlocal_bind_mask, self.config.streamlocal_bind_unlink) {
            Ok(s) => s,
            Err(e) => {
                error!("bind {}: {}", listen_path.display(), e);
                return Err(Error::CannotListen);
            }
        };
        info!("Local forwarding listening on path {}.", listen_path.display());
        let (window, maxpacket) = (self.config.window_size, self.config.maximum_packet_size);
        let id = self.new_channel(
            "unix-listener",
            kind,
            Some(sock),
            Some(sock),
            None,
            window,
            maxpacket,
            ExtendedUsage::Ignore,
            "unix listener",
            true,
        );
        if let Some(c) = self.channels.get_mut(id) {
            c.path = Some(path.to_string());
            c.host_port = host_port;
            c.listening_addr = Some(listen_path.to_string_lossy().into_owned());
        }
        Ok(())
    }

    /// Listen locally, forwarding connections to `fwd.connect`
    /// through the peer (or acting as a SOCKS server if
    /// `fwd.connect` is `None`).
    pub fn setup_local_forward(&mut self, fwd: &mut Forward) -> Result<(), Error> {
        let (path, host_port) = match fwd.connect {
            Some(Endpoint::Tcp { host: Some(ref h), port }) => (h.clone(), HostPort::Port(port)),
            Some(Endpoint::Tcp { host: None, .. }) => {
                error!("No forward host name.");
                return Err(Error::CannotListen);
            }
            Some(Endpoint::Unix(ref p)) => (p.to_string_lossy().into_owned(), HostPort::StreamLocal),
            None => ("socks".to_string(), HostPort::Port(0)),
        };
        match fwd.listen {
            Endpoint::Tcp { ref host, port } => {
                let host = host.clone();
                let port = self.setup_listener_tcpip(
                    false,
                    host.as_ref().map(|h| h.as_str()),
                    port,
                    &path,
                    host_port,
                )?;
                fwd.allocated_port = Some(port);
                Ok(())
            }
            Endpoint::Unix(ref listen_path) => {
                let listen_path = listen_path.clone();
                self.setup_listener_streamlocal(ChannelType::UnixListener, &listen_path, &path, host_port)
            }
        }
    }

    /// Server side: listen on behalf of the peer. Refusals are
    /// reported to the peer with a debug message.
    pub fn setup_remote_forward(&mut self, fwd: &mut Forward) -> Result<(), Error> {
        match fwd.listen {
            Endpoint::Unix(ref listen_path) => {
                let listen_path = listen_path.clone();
                let path = listen_path.to_string_lossy().into_owned();
                self.setup_listener_streamlocal(ChannelType::RUnixListener, &listen_path, &path, HostPort::StreamLocal)
            }
            Endpoint::Tcp { ref host, port } => {
                let host = host.clone();
                if !self.permissions.check_listen(host.as_ref().map(|h| h.as_str()), port) {
                    self.send_debug("port forwarding refused");
                    match host {
                        Some(ref h) => info!("host \"{}\" port {}: port forwarding refused", h, port),
                        None => info!("port {}: port forwarding refused", port),
                    }
                    return Err(Error::CannotListen);
                }
                let h = match host {
                    Some(ref h) => h.as_str(),
                    None => {
                        error!("No forward host name.");
                        return Err(Error::CannotListen);
                    }
                };
                let port = self.setup_listener_tcpip(true, Some(h), port, h, HostPort::Port(0))?;
                fwd.allocated_port = Some(port);
                Ok(())
            }
        }
    }

    /// Close the local listeners of a forwarding. Returns whether
    /// anything was found.
    pub fn cancel_local_forward(&mut self, fwd: &Forward) -> bool {
        let found: Vec<ChannelId> = match fwd.listen {
            Endpoint::Unix(ref p) => {
                let p = p.to_string_lossy();
                self.channels
                    .iter()
                    .filter(|c| match c.kind {
                        ChannelType::UnixListener => c.listening_addr.as_ref().map(|a| **a == *p).unwrap_or(false),
                        _ => false,
                    })
                    .map(|c| c.id)
                    .collect()
            }
            Endpoint::Tcp { ref host, port } => {
                let host = host.clone();
                let addr = self.fwd_bind_addr(host.as_ref().map(|h| h.as_str()), true, false).listening_addr();
                let dynamic = fwd.is_dynamic();
                self.channels
                    .iter()
                    .filter(|c| match c.kind {
                        ChannelType::PortListener => {
                            c.listening_port == port
                                && (c.host_port == HostPort::Port(0)) == dynamic
                                && c.listening_addr == addr
                        }
                        _ => false,
                    })
                    .map(|c| c.id)
                    .collect()
            }
        };
        for id in found.iter() {
            debug!("cancel_local_forward: close channel {}", id);
            self.free(*id)
        }
        !found.is_empty()
    }

    /// Server side: close the listeners of a remote forwarding.
    pub fn cancel_remote_forward(&mut self, fwd: &Forward) -> bool {
        let found: Vec<ChannelId> = match fwd.listen {
            Endpoint::Unix(ref p) => {
                let p = p.to_string_lossy();
                self.channels
                    .iter()
                    .filter(|c| match c.kind {
                        ChannelType::RUnixListener => c.path.as_ref().map(|a| **a == *p).unwrap_or(false),
                        _ => false,
                    })
                    .map(|c| c.id)
                    .collect()
            }
            Endpoint::Tcp { ref host, port } => {
                let host = host.as_ref().map(|h| h.as_str()).unwrap_or("");
                self.channels
                    .iter()
                    .filter(|c| match c.kind {
                        ChannelType::RPortListener => {
                            c.listening_port == port && c.path.as_ref().map(|p| p == host).unwrap_or(false)
                        }
                        _ => false,
                    })
                    .map(|c| c.id)
                    .collect()
            }
        };
        for id in found.iter() {
            debug!("cancel_remote_forward: close channel {}", id);
            self.free(*id)
        }
        !found.is_empty()
    }

    /// Client side: ask the peer to listen for us, and remember where
    /// its connections should go. Returns the index of the permission
    /// entry.
    pub fn request_remote_forward(&mut self, fwd: &Forward) -> usize {
        let (host_to_connect, port_to_connect) = match fwd.connect {
            Some(Endpoint::Tcp { ref host, port }) => {
                (host.clone().unwrap_or_else(|| "localhost".to_string()), HostPort::Port(port))
            }
            Some(Endpoint::Unix(ref p)) => (p.to_string_lossy().into_owned(), HostPort::StreamLocal),
            None => ("socks".to_string(), HostPort::Port(0)),
        };
        let mut req = Vec::new();
        let mut perm = Permission {
            host_to_connect: Some(host_to_connect.clone()),
            port_to_connect,
            listen_host: None,
            listen_path: None,
            listen_port: 0,
            downstream: None,
        };
        let name = match fwd.listen {
            Endpoint::Unix(ref p) => {
                let p = p.to_string_lossy().into_owned();
                req.extend_ssh_string(p.as_bytes());
                perm.listen_path = Some(p);
                "streamlocal-forward@openssh.com"
            }
            Endpoint::Tcp { ref host, port } => {
                req.extend_ssh_string(rfwd_bind_host(host.as_ref().map(|h| h.as_str())).as_bytes());
                req.push_u32_be(port as u32);
                perm.listen_host = host.clone();
                perm.listen_port = port;
                "tcpip-forward"
            }
        };
        let idx = self.permissions.add(Who::User, Direction::Local, perm);
        let listen_port = fwd.listen_port();
        let is_tcp = if let Endpoint::Tcp { .. } = fwd.listen { true } else { false };
        self.global_request(
            name,
            &req,
            Some(Box::new(move |session: &mut Session, success: bool, data: &[u8]| {
                if success && is_tcp && listen_port == 0 {
                    let port = if data.len() >= 4 {
                        use byteorder::{BigEndian, ByteOrder};
                        BigEndian::read_u32(data)
                    } else {
                        u32::max_value()
                    };
                    if port > u16::max_value() as u32 || port == 0 {
                        error!(
                            "Invalid allocated port {} for remote forward to {}:{}",
                            port, host_to_connect, port_to_connect
                        );
                        session.permissions.update_listen_port(idx, 0);
                    } else {
                        info!("Allocated port {} for remote forward to {}:{}", port, host_to_connect, port_to_connect);
                        session.permissions.update_listen_port(idx, port as u16);
                    }
                    return;
                }
                if !success {
                    warn!("Warning: remote port forwarding failed for listen port {}", listen_port)
                }
            })),
        );
        idx
    }

    /// Client side: cancel a forwarding set up with
    /// [`request_remote_forward`](#method.request_remote_forward).
    pub fn cancel_remote_forward_request(&mut self, fwd: &Forward) -> bool {
        let mut req = Vec::new();
        let (idx, name) = match fwd.listen {
            Endpoint::Unix(ref p) => {
                let p = p.to_string_lossy();
                req.extend_ssh_string(p.as_bytes());
                (self.permissions.position_listen_path(&p), "cancel-streamlocal-forward@openssh.com")
            }
            Endpoint::Tcp { ref host, port } => {
                let host = host.as_ref().map(|h| h.as_str());
                req.extend_ssh_string(rfwd_bind_host(host).as_bytes());
                req.push_u32_be(port as u32);
                (self.permissions.position_listen(host, port), "cancel-tcpip-forward")
            }
        };
        match idx {
            Some(idx) => {
                self.global_request(name, &req, None);
                self.permissions.clear_entry(Who::User, Direction::Local, idx);
                true
            }
            None => {
                debug!("cancel_remote_forward_request: requested forward not found");
                false
            }
        }
    }

    /// Accept on a listener. Running out of descriptors pauses the
    /// listener for a second.
    pub(crate) fn accept_on(&mut self, id: ChannelId) -> Option<RawFd> {
        let now = self.now;
        let c = self.channels.get_mut(id)?;
        let sock = c.sock?;
        match sys::accept(sock) {
            Ok(fd) => Some(fd),
            Err(e) => {
                match e.raw_os_error() {
                    Some(libc::EINTR) | Some(libc::EWOULDBLOCK) | Some(libc::ECONNABORTED) => {}
                    _ => error!("accept: {}", e),
                }
                match e.raw_os_error() {
                    Some(libc::EMFILE) | Some(libc::ENFILE) => c.notbefore = now + 1,
                    _ => {}
                }
                None
            }
        }
    }

    /// Window and packet size given to the channels a listener accepts.
    pub(crate) fn listener_window(&self, id: ChannelId) -> Option<(u32, u32)> {
        self.channels.get(id).map(|c| (c.local_window_max, c.local_maxpacket))
    }

    pub(crate) fn post_port_listener(&mut self, id: ChannelId) -> Result<(), Error> {
        let (rtype, kind, listening_port, host_port, path) = {
            let c = match self.channels.get(id) {
                Some(c) => c,
                None => return Ok(()),
            };
            if !c.io_ready.contains(IoFlags::SOCK_R) {
                return Ok(());
            }
            debug!(
                "Connection to port {} forwarding to {:?} port {} requested.",
                c.listening_port, c.path, c.host_port
            );
            let (rtype, kind) = match (&c.kind, c.host_port) {
                (ChannelType::RPortListener, _) => ("forwarded-tcpip", ChannelType::Opening),
                (ChannelType::RUnixListener, _) => ("forwarded-streamlocal@openssh.com", ChannelType::Opening),
                (_, HostPort::StreamLocal) => ("direct-streamlocal@openssh.com", ChannelType::Opening),
                (_, HostPort::Port(0)) => ("dynamic-tcpip", ChannelType::Dynamic),
                _ => ("direct-tcpip", ChannelType::Opening),
            };
            (rtype, kind, c.listening_port, c.host_port, c.path.clone())
        };
        let newsock = match self.accept_on(id) {
            Some(s) => s,
            None => return Ok(()),
        };
        if host_port != HostPort::StreamLocal {
            sys::set_nodelay(newsock)
        }
        let dynamic = if let ChannelType::Dynamic = kind { true } else { false };
        let (window, maxpacket) = self.listener_window(id).unwrap_or((CHAN_TCP_WINDOW_DEFAULT, CHAN_TCP_PACKET_DEFAULT));
        let nc = self.new_channel(
            rtype,
            kind,
            Some(newsock),
            Some(newsock),
            None,
            window,
            maxpacket,
            ExtendedUsage::Ignore,
            rtype,
            true,
        );
        if let Some(c) = self.channels.get_mut(nc) {
            c.listening_port = listening_port;
            c.host_port = host_port;
            c.path = path;
        }
        if !dynamic {
            self.port_open_helper(nc, rtype)?
        }
        Ok(())
    }

    /// Send the `CHANNEL_OPEN` of a channel accepted by a forwarding
    /// listener.
    pub(crate) fn port_open_helper(&mut self, id: ChannelId, rtype: &str) -> Result<(), Error> {
        let (path, host_port, listening_port, local, peer) = {
            let c = self.channels.get(id).ok_or(Error::WrongChannel(id.0))?;
            let local = c.sock.and_then(sys::local_addr);
            let peer = c.sock.and_then(sys::peer_addr);
            (c.path.clone().unwrap_or_default(), c.host_port, c.listening_port, local, peer)
        };
        let (local_ip, local_port) = match local {
            Some(a) => (a.ip().to_string(), a.port() as u32),
            None => ("UNKNOWN".to_string(), 65536),
        };
        // Some peers validate the originator.
        let (remote_ip, remote_port) = match peer {
            Some(a) => (a.ip().to_string(), a.port() as u32),
            None => ("127.0.0.1".to_string(), 65535),
        };
        let remote_name = format!(
            "{}: listening port {} for {} port {}, connect from {} port {} to {} port {}",
            rtype, listening_port, path, host_port, remote_ip, remote_port, local_ip, local_port
        );
        info!("{}", remote_name);
        if let Some(c) = self.channels.get_mut(id) {
            c.remote_name = remote_name
        }
        self.send_channel_open(id, rtype, |w| {
            match rtype {
                "direct-tcpip" => {
                    w.extend_ssh_string(path.as_bytes());
                    w.push_u32_be(match host_port {
                        HostPort::Port(p) => p as u32,
                        HostPort::StreamLocal => 0,
                    });
                }
                "direct-streamlocal@openssh.com" | "forwarded-streamlocal@openssh.com" => {
                    w.extend_ssh_string(path.as_bytes());
                }
                _ => {
                    w.extend_ssh_string(path.as_bytes());
                    w.push_u32_be(local_port);
                }
            }
            if rtype == "forwarded-streamlocal@openssh.com" {
                // Reserved for owner and mode.
                w.extend_ssh_string(b"");
            } else {
                w.extend_ssh_string(remote_ip.as_bytes());
                w.push_u32_be(remote_port);
            }
        })
    }

    /// Wrap an agent-forwarding socket (server side).
    pub fn new_auth_listener(&mut self, listener: UnixListener) -> Result<ChannelId, Error> {
        listener.set_nonblocking(true)?;
        let sock = listener.into_raw_fd();
        sys::set_cloexec(sock);
        Ok(self.new_channel(
            "auth-listener",
            ChannelType::AuthSocketListener,
            Some(sock),
            Some(sock),
            None,
            CHAN_X11_WINDOW_DEFAULT,
            CHAN_X11_PACKET_DEFAULT,
            ExtendedUsage::Ignore,
            "auth socket",
            true,
        ))
    }

    pub(crate) fn post_auth_listener(&mut self, id: ChannelId) -> Result<(), Error> {
        match self.channels.get(id) {
            Some(c) if c.io_ready.contains(IoFlags::SOCK_R) => {}
            _ => return Ok(()),
        }
        let newsock = match self.accept_on(id) {
            Some(s) => s,
            None => return Ok(()),
        };
        let (window, maxpacket) = self.listener_window(id).unwrap_or((CHAN_X11_WINDOW_DEFAULT, CHAN_X11_PACKET_DEFAULT));
        let nc = self.new_channel(
            "agent-connection",
            ChannelType::Opening,
            Some(newsock),
            Some(newsock),
            None,
            window,
            maxpacket,
            ExtendedUsage::Ignore,
            "accepted auth socket",
            true,
        );
        self.send_channel_open(nc, "auth-agent@openssh.com", |_| ())
    }

    /// Client side: where a `forwarded-tcpip` open for `host:port`
    /// goes.
    pub(crate) fn connect_by_listen_address(
        &mut self,
        host: &str,
        port: u16,
        ctype: &str,
        rname: &str,
    ) -> Option<Route> {
        let perm = match self.permissions.find_listen(Some(host), port) {
            Some(p) => p.clone(),
            None => {
                error!("WARNING: Server requests forwarding for unknown listen_port {}", port);
                return None;
            }
        };
        if let Some(downstream) = perm.downstream {
            return Some(Route::Downstream(downstream));
        }
        if perm.port_to_connect == HostPort::Port(0) {
            return Some(Route::Local(self.rdynamic_connect_prepare(ctype, rname)));
        }
        let target = perm.host_to_connect.unwrap_or_default();
        self.connect_to(&target, perm.port_to_connect, ctype, rname).map(Route::Local)
    }

    /// Client side: where a `forwarded-streamlocal` open for `path`
    /// goes.
    pub(crate) fn connect_by_listen_path(&mut self, path: &str, ctype: &str, rname: &str) -> Option<Route> {
        let perm = match self.permissions.find_listen_path(path) {
            Some(p) => p.clone(),
            None => {
                error!("WARNING: Server requests forwarding for unknown path {}", path);
                return None;
            }
        };
        if let Some(downstream) = perm.downstream {
            return Some(Route::Downstream(downstream));
        }
        let target = perm.host_to_connect.unwrap_or_default();
        self.connect_to(&target, perm.port_to_connect, ctype, rname).map(Route::Local)
    }

    /// Server side: a `direct-tcpip` open.
    pub(crate) fn connect_to_port(
        &mut self,
        host: &str,
        port: u16,
        ctype: &str,
        rname: &str,
    ) -> Result<ChannelId, ChannelOpenFailure> {
        if !self.permissions.check_connect(host, port) {
            info!(
                "Received request from {} to connect to host {} port {}, but the request was denied.",
                rname, host, port
            );
            return Err(ChannelOpenFailure::AdministrativelyProhibited);
        }
        self.connect_to(host, HostPort::Port(port), ctype, rname)
            .ok_or(ChannelOpenFailure::ConnectFailed)
    }

    /// Server side: a `direct-streamlocal` open.
    pub(crate) fn connect_to_path(&mut self, path: &str, ctype: &str, rname: &str) -> Result<ChannelId, ChannelOpenFailure> {
        if !self.permissions.check_connect_path(path) {
            info!("Received request to connect to path {}, but the request was denied.", path);
            return Err(ChannelOpenFailure::AdministrativelyProhibited);
        }
        self.connect_to(path, HostPort::StreamLocal, ctype, rname)
            .ok_or(ChannelOpenFailure::ConnectFailed)
    }

    /// Start a non-blocking connection, in a new Connecting channel.
    pub fn connect_to(&mut self, host: &str, port: HostPort, ctype: &str, rname: &str) -> Option<ChannelId> {
        let mut cx = match ConnectContext::new(host, port) {
            Ok(cx) => cx,
            Err(e) => {
                error!("connect_to {} port {}: {}", host, port, e);
                return None;
            }
        };
        let sock = match cx.try_next() {
            Some(s) => s,
            None => {
                error!("connect_to {} port {}: failed.", host, port);
                return None;
            }
        };
        let id = self.new_channel(
            ctype,
            ChannelType::Connecting(cx),
            Some(sock),
            Some(sock),
            None,
            CHAN_TCP_WINDOW_DEFAULT,
            CHAN_TCP_PACKET_DEFAULT,
            ExtendedUsage::Ignore,
            rname,
            true,
        );
        if let Some(c) = self.channels.get_mut(id) {
            c.path = Some(host.to_string());
            c.host_port = port;
        }
        Some(id)
    }

    /// A reverse dynamic channel, open before it has any descriptor:
    /// the SOCKS request comes from the peer.
    pub(crate) fn rdynamic_connect_prepare(&mut self, ctype: &str, rname: &str) -> ChannelId {
        self.new_channel(
            ctype,
            ChannelType::RDynamicOpen,
            None,
            None,
            None,
            CHAN_TCP_WINDOW_DEFAULT,
            CHAN_TCP_PACKET_DEFAULT,
            ExtendedUsage::Ignore,
            rname,
            true,
        )
    }

    /// The SOCKS request of a reverse dynamic channel is complete:
    /// connect to its target. `false` if that is not possible.
    pub(crate) fn rdynamic_connect_finish(&mut self, id: ChannelId) -> Result<bool, Error> {
        let (host, port) = match self.channels.get(id) {
            Some(c) => (c.path.clone().unwrap_or_default(), c.host_port),
            None => return Ok(false),
        };
        if !self.permissions.check_connect_admin(&host, port) {
            info!(
                "Received request from channel {} to connect to host {} port {}, but the request was denied.",
                id, host, port
            );
            return Ok(false);
        }
        let mut cx = match ConnectContext::new(&host, port) {
            Ok(cx) => cx,
            Err(e) => {
                debug!("channel {}: rdynamic connect {}: {}", id, host, e);
                return Ok(false);
            }
        };
        let sock = match cx.try_next() {
            Some(s) => s,
            None => return Ok(false),
        };
        let now = self.now;
        match self.channels.get_mut(id) {
            Some(c) => {
                c.kind = ChannelType::RDynamicFinish(cx);
                c.lastused = now;
                c.register_fds(Some(sock), Some(sock), None, ExtendedUsage::Ignore, true, false);
                Ok(true)
            }
            None => {
                let _ = sys::close(sock);
                Ok(false)
            }
        }
    }

    /// Client side: the server opened an agent channel.
    pub(crate) fn open_agent(&mut self) -> Option<ChannelId> {
        if !self.config.forward_agent {
            error!("Warning: ssh server tried agent forwarding.");
            error!("Warning: this is probably a break-in attempt by a malicious server.");
            return None;
        }
        let path = match self.config.agent_socket {
            Some(ref p) => p.clone(),
            None => {
                debug!("open_agent: no agent socket");
                return None;
            }
        };
        let sock = match std::os::unix::net::UnixStream::connect(&path) {
            Ok(s) => s.into_raw_fd(),
            Err(e) => {
                debug!("open_agent: {}: {}", path.display(), e);
                return None;
            }
        };
        let id = self.new_channel(
            "authentication agent connection",
            ChannelType::Open,
            Some(sock),
            Some(sock),
            None,
            CHAN_X11_WINDOW_DEFAULT,
            CHAN_TCP_PACKET_DEFAULT,
            ExtendedUsage::Ignore,
            "authentication agent connection",
            true,
        );
        if let Some(c) = self.channels.get_mut(id) {
            c.force_drain = true
        }
        Some(id)
    }

    /// Is `fwd` acceptable from a server-side point of view?
    pub(crate) fn remote_forward_allowed(&self, fwd: &Forward) -> bool {
        match fwd.listen {
            Endpoint::Unix(_) => self.config.allow_streamlocal_forwarding,
            Endpoint::Tcp { port, .. } => {
                self.config.allow_tcp_forwarding && (port == 0 || port >= 1024 || sys::getuid() == 0)
            }
        }
    }

    pub(crate) fn is_client(&self) -> bool {
        self.config.side == Side::Client
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::Config;
    use std::sync::Arc;

    fn session(gateway_ports: GatewayPorts, side: Side) -> Session {
        Session::new(Arc::new(Config {
            gateway_ports,
            side,
            ..Config::default()
        }))
    }

    #[test]
    fn bind_policy() {
        let mut s = session(GatewayPorts::No, Side::Server);
        assert_eq!(s.fwd_bind_addr(None, false, true), Bind::Loopback);
        assert_eq!(s.fwd_bind_addr(Some(""), false, true), Bind::Loopback);
        assert_eq!(s.fwd_bind_addr(Some("10.0.0.1"), false, true), Bind::Loopback);
        assert_eq!(s.fwd_bind_addr(Some("::1"), false, true), Bind::Addr("::1".to_string()));
        // The client chooses its own local addresses.
        assert_eq!(s.fwd_bind_addr(Some("10.0.0.1"), true, true), Bind::Addr("10.0.0.1".to_string()));
        assert_eq!(s.fwd_bind_addr(Some("*"), true, true), Bind::Wildcard);
        assert_eq!(s.fwd_bind_addr(Some("localhost"), true, true), Bind::Loopback);

        let mut s = session(GatewayPorts::Yes, Side::Server);
        assert_eq!(s.fwd_bind_addr(None, false, true), Bind::Wildcard);
        assert_eq!(s.fwd_bind_addr(Some("10.0.0.1"), false, true), Bind::Wildcard);
        assert!(!s.take_packets().is_empty());

        let mut s = session(GatewayPorts::ClientSpecified, Side::Server);
        assert_eq!(s.fwd_bind_addr(Some("10.0.0.1"), false, true), Bind::Addr("10.0.0.1".to_string()));
        assert_eq!(s.fwd_bind_addr(Some(""), false, true), Bind::Wildcard);
        assert!(s.take_packets().is_empty());
    }

    #[test]
    fn local_forward_listens_and_cancels() {
        crate::init();
        let mut s = session(GatewayPorts::No, Side::Client);
        let mut fwd = Forward {
            listen: Endpoint::Tcp { host: Some("127.0.0.1".to_string()), port: 0 },
            connect: Some(Endpoint::Tcp { host: Some("example".to_string()), port: 80 }),
            allocated_port: None,
        };
        s.setup_local_forward(&mut fwd).unwrap();
        let port = fwd.allocated_port.unwrap();
        assert!(port > 0);
        let listeners: Vec<_> = s.channels().filter(|c| c.kind().is_listener()).collect();
        assert_eq!(listeners.len(), 1);
        assert_eq!(listeners[0].path(), Some("example"));
        assert_eq!(listeners[0].host_port(), HostPort::Port(80));
        assert_eq!(listeners[0].listening_port(), port);

        fwd.listen = Endpoint::Tcp { host: Some("127.0.0.1".to_string()), port };
        assert!(s.cancel_local_forward(&fwd));
        assert_eq!(s.channels().count(), 0);
        assert!(!s.cancel_local_forward(&fwd));
    }

    #[test]
    fn remote_forward_refused() {
        crate::init();
        let mut s = session(GatewayPorts::No, Side::Server);
        s.permissions_mut().add(Who::User, Direction::Remote, Permission::listen("localhost", 2222));
        let mut fwd = Forward {
            listen: Endpoint::Tcp { host: Some("localhost".to_string()), port: 2223 },
            connect: None,
            allocated_port: None,
        };
        assert!(s.setup_remote_forward(&mut fwd).is_err());
        assert_eq!(s.channels().count(), 0);
        let packets = s.take_packets();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0][0], crate::msg::DEBUG);
    }

    #[test]
    fn remote_forward_request_bookkeeping() {
        crate::init();
        let mut s = session(GatewayPorts::No, Side::Client);
        let fwd = Forward {
            listen: Endpoint::Tcp { host: None, port: 0 },
            connect: Some(Endpoint::Tcp { host: Some("localhost".to_string()), port: 22 }),
            allocated_port: None,
        };
        let idx = s.request_remote_forward(&fwd);
        assert_eq!(s.global_confirms.len(), 1);
        let cb = s.global_confirms.pop_front().unwrap();
        cb(&mut s, true, &[0, 0, 0x10, 0x92]);
        let e = s.permissions().get(Who::User, Direction::Local, idx).unwrap();
        assert_eq!(e.listen_port, 4242);
        assert!(s.permissions().find_listen(Some("localhost"), 4242).is_some());

        let fwd = Forward {
            listen: Endpoint::Tcp { host: None, port: 4242 },
            ..fwd
        };
        s.take_packets();
        assert!(s.cancel_remote_forward_request(&fwd));
        assert!(s.permissions().get(Who::User, Direction::Local, idx).is_none());
        let packets = s.take_packets();
        assert_eq!(packets[0][0], crate::msg::GLOBAL_REQUEST);
    }
}
