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

//! Which forwardings are allowed, and where they lead.
//!
//! There are two directions: *local* entries describe where a
//! connection may go (or, on the client, where a remote forwarding
//! we requested should be connected to), *remote* entries describe
//! what the peer may ask us to listen on. Each direction has a list
//! set by the user (or learned at runtime) and a list set by the
//! administrator; a request must pass both.
//!
//! Entries are never moved once added: cancelled entries become
//! holes, so indices stay valid.

use crate::config::HostPort;
use crate::ChannelId;

/// Matches any host in permit lists.
pub const FWD_PERMIT_ANY_HOST: &str = "*";
/// Matches any port in permit lists.
pub const FWD_PERMIT_ANY_PORT: u16 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Who {
    User,
    Admin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Local,
    Remote,
}

/// One permitted forwarding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Permission {
    /// Where to connect: a host name, `*`, or a socket path. `None`
    /// never matches.
    pub host_to_connect: Option<String>,
    pub port_to_connect: HostPort,
    pub listen_host: Option<String>,
    pub listen_path: Option<String>,
    pub listen_port: u16,
    /// When set, connections for this forwarding go to this mux
    /// client instead.
    pub downstream: Option<ChannelId>,
}

impl Permission {
    /// A permitted connection target.
    pub fn connect(host: &str, port: u16) -> Self {
        Permission {
            host_to_connect: Some(host.to_string()),
            port_to_connect: HostPort::Port(port),
            listen_host: None,
            listen_path: None,
            listen_port: 0,
            downstream: None,
        }
    }

    /// A permitted listening address.
    pub fn listen(host: &str, port: u16) -> Self {
        Permission {
            host_to_connect: None,
            port_to_connect: HostPort::Port(0),
            listen_host: Some(host.to_string()),
            listen_path: None,
            listen_port: port,
            downstream: None,
        }
    }

    fn open_match(&self, host: &str, port: HostPort) -> bool {
        let allowed = match self.host_to_connect {
            Some(ref h) => h,
            None => return false,
        };
        if self.port_to_connect != HostPort::Port(FWD_PERMIT_ANY_PORT) && self.port_to_connect != port {
            return false;
        }
        allowed == FWD_PERMIT_ANY_HOST || allowed == host
    }

    /// Client side: does this forwarding listen on `host:port`?
    /// With `translate`, `host` is the address as it appears on the
    /// wire.
    fn listen_match_tcp(&self, host: Option<&str>, port: u16, translate: bool) -> bool {
        if self.host_to_connect.is_none() || self.listen_path.is_some() || self.listen_port != port {
            return false;
        }
        if !translate && self.listen_host.is_none() && host.is_none() {
            return true;
        }
        let allowed = if translate {
            Some(rfwd_bind_host(self.listen_host.as_ref().map(|x| x.as_str())))
        } else {
            self.listen_host.as_ref().map(|x| x.as_str())
        };
        match (allowed, host) {
            (Some(a), Some(h)) => a == h,
            _ => false,
        }
    }

    /// Server side: may the peer listen on `host:port`?
    fn remote_match(&self, host: Option<&str>, port: u16) -> bool {
        let (host, allowed) = match (host, self.listen_host.as_ref()) {
            (Some(h), Some(a)) => (h, a),
            _ => return false,
        };
        if self.listen_port != FWD_PERMIT_ANY_PORT && self.listen_port != port {
            return false;
        }
        allowed == FWD_PERMIT_ANY_HOST || allowed.eq_ignore_ascii_case(host)
    }

    fn listen_match_path(&self, path: &str) -> bool {
        self.listen_path.as_ref().map(|p| p == path).unwrap_or(false)
    }
}

/// The host we send in `tcpip-forward` for a listen address.
pub fn rfwd_bind_host(listen_host: Option<&str>) -> &str {
    match listen_host {
        None => "localhost",
        Some("") | Some("*") => "",
        Some(h) => h,
    }
}

#[derive(Debug, Default)]
struct PermissionSet {
    user: Vec<Option<Permission>>,
    admin: Vec<Option<Permission>>,
    all_permitted: bool,
}

impl PermissionSet {
    fn list(&self, who: Who) -> &[Option<Permission>] {
        match who {
            Who::User => &self.user,
            Who::Admin => &self.admin,
        }
    }

    fn list_mut(&mut self, who: Who) -> &mut Vec<Option<Permission>> {
        match who {
            Who::User => &mut self.user,
            Who::Admin => &mut self.admin,
        }
    }

    fn check<F: Fn(&Permission) -> bool>(&self, f: F) -> bool {
        let user = self.all_permitted || self.user.iter().flatten().any(|p| f(p));
        let admin = self.admin.is_empty() || self.admin.iter().flatten().any(|p| f(p));
        user && admin
    }
}

/// The four permission lists of a session.
#[derive(Debug, Default)]
pub struct Permissions {
    local: PermissionSet,
    remote: PermissionSet,
}

impl Permissions {
    fn set(&self, dir: Direction) -> &PermissionSet {
        match dir {
            Direction::Local => &self.local,
            Direction::Remote => &self.remote,
        }
    }

    fn set_mut(&mut self, dir: Direction) -> &mut PermissionSet {
        match dir {
            Direction::Local => &mut self.local,
            Direction::Remote => &mut self.remote,
        }
    }

    /// Add an entry, returning its index. A user entry revokes
    /// "permit all".
    pub fn add(&mut self, who: Who, dir: Direction, perm: Permission) -> usize {
        debug!("permission add: {:?} {:?} {:?}", who, dir, perm);
        let set = self.set_mut(dir);
        if who == Who::User {
            set.all_permitted = false;
        }
        let list = set.list_mut(who);
        list.push(Some(perm));
        list.len() - 1
    }

    /// Permit everything in this direction, unless the user list
    /// already restricts it.
    pub fn permit_all(&mut self, dir: Direction) {
        let set = self.set_mut(dir);
        if set.user.is_empty() {
            set.all_permitted = true
        }
    }

    pub fn all_permitted(&self, dir: Direction) -> bool {
        self.set(dir).all_permitted
    }

    /// Deny everything the administrator has not explicitly allowed,
    /// by installing an entry that never matches.
    pub fn disable_admin(&mut self, dir: Direction) {
        let set = self.set_mut(dir);
        set.admin.clear();
        set.admin.push(Some(Permission {
            host_to_connect: None,
            port_to_connect: HostPort::Port(0),
            listen_host: None,
            listen_path: None,
            listen_port: 0,
            downstream: None,
        }))
    }

    /// Drop a whole list.
    pub fn clear(&mut self, who: Who, dir: Direction) {
        self.set_mut(dir).list_mut(who).clear()
    }

    /// Turn entry `idx` into a hole.
    pub fn clear_entry(&mut self, who: Who, dir: Direction, idx: usize) {
        if let Some(e) = self.set_mut(dir).list_mut(who).get_mut(idx) {
            *e = None
        }
    }

    pub fn get(&self, who: Who, dir: Direction, idx: usize) -> Option<&Permission> {
        self.set(dir).list(who).get(idx).and_then(|x| x.as_ref())
    }

    /// Record the port the peer allocated for a forwarding to port 0.
    pub fn update_listen_port(&mut self, idx: usize, port: u16) {
        if let Some(slot) = self.local.user.get_mut(idx) {
            if port == 0 {
                debug!("removing allowed forwarding {}", idx);
                *slot = None
            } else if let Some(ref mut e) = *slot {
                debug!("updating allowed port {} to {}", e.listen_port, port);
                e.listen_port = port
            }
        }
    }

    /// May we connect to `host:port`?
    pub fn check_connect(&self, host: &str, port: u16) -> bool {
        self.local.check(|p| p.open_match(host, HostPort::Port(port)))
    }

    /// May we connect to the Unix socket at `path`?
    pub fn check_connect_path(&self, path: &str) -> bool {
        self.local.check(|p| p.open_match(path, HostPort::StreamLocal))
    }

    /// Does the administrator allow connecting to `host:port`? Used
    /// for targets chosen through SOCKS on reverse dynamic forwardings.
    pub fn check_connect_admin(&self, host: &str, port: HostPort) -> bool {
        let admin = &self.local.admin;
        admin.is_empty() || admin.iter().flatten().any(|p| p.open_match(host, port))
    }

    /// May the peer make us listen on `host:port`?
    pub fn check_listen(&self, host: Option<&str>, port: u16) -> bool {
        self.remote.check(|p| p.remote_match(host, port))
    }

    /// The user entry describing the remote forwarding that listens
    /// on `host:port`, on the client.
    pub fn find_listen(&self, host: Option<&str>, port: u16) -> Option<&Permission> {
        self.local.user.iter().flatten().find(|p| p.listen_match_tcp(host, port, true))
    }

    pub fn find_listen_path(&self, path: &str) -> Option<&Permission> {
        self.local.user.iter().flatten().find(|p| p.listen_match_path(path))
    }

    /// Index of the user entry of the remote forwarding configured
    /// as `host:port`.
    pub fn position_listen(&self, host: Option<&str>, port: u16) -> Option<usize> {
        self.local.user.iter().position(|p| {
            p.as_ref().map(|p| p.listen_match_tcp(host, port, false)).unwrap_or(false)
        })
    }

    /// Index of the user entry matching a Unix remote forwarding.
    pub fn position_listen_path(&self, path: &str) -> Option<usize> {
        self.local.user.iter().position(|p| {
            p.as_ref().map(|p| p.listen_match_path(path)).unwrap_or(false)
        })
    }

    /// Remove and return the user entries routed to `downstream`.
    pub fn take_downstream(&mut self, downstream: ChannelId) -> Vec<Permission> {
        let mut taken = Vec::new();
        for e in self.local.user.iter_mut() {
            if e.as_ref().map(|p| p.downstream == Some(downstream)).unwrap_or(false) {
                taken.extend(e.take())
            }
        }
        taken
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn user_and_admin_lists() {
        let mut p = Permissions::default();
        p.permit_all(Direction::Local);
        assert!(p.check_connect("anything", 22));

        p.add(Who::User, Direction::Local, Permission::connect("example", 80));
        assert!(!p.all_permitted(Direction::Local));
        assert!(p.check_connect("example", 80));
        assert!(!p.check_connect("example", 81));
        // Too late for "permit all".
        p.permit_all(Direction::Local);
        assert!(!p.check_connect("other", 80));

        p.add(Who::User, Direction::Local, Permission::connect("*", 443));
        assert!(p.check_connect("other", 443));

        p.add(Who::Admin, Direction::Local, Permission::connect("example", 0));
        assert!(p.check_connect("example", 80));
        assert!(!p.check_connect("other", 443));

        p.disable_admin(Direction::Local);
        assert!(!p.check_connect("example", 80));
    }

    #[test]
    fn listen_translation() {
        let mut p = Permissions::default();
        let mut wild = Permission::listen("*", 8080);
        wild.host_to_connect = Some("localhost".to_string());
        wild.port_to_connect = HostPort::Port(80);
        let i = p.add(Who::User, Direction::Local, wild);
        // The server reports "" for a wildcard listener.
        assert_eq!(p.find_listen(Some(""), 8080).map(|e| e.port_to_connect), Some(HostPort::Port(80)));
        assert!(p.find_listen(Some(""), 8081).is_none());

        let mut zero = Permission::listen("localhost", 0);
        zero.host_to_connect = Some("h".to_string());
        let j = p.add(Who::User, Direction::Local, zero);
        p.update_listen_port(j, 4242);
        assert!(p.find_listen(Some("localhost"), 4242).is_some());
        assert_eq!(p.position_listen(Some("localhost"), 4242), Some(j));
        assert_eq!(p.position_listen(Some("*"), 8080), Some(i));

        // Entries without a target are never selected.
        p.add(Who::User, Direction::Local, Permission::listen("localhost", 7000));
        assert!(p.find_listen(Some("localhost"), 7000).is_none());

        p.clear_entry(Who::User, Direction::Local, i);
        assert!(p.find_listen(Some(""), 8080).is_none());
        assert!(p.get(Who::User, Direction::Local, j).is_some());
    }

    #[test]
    fn remote_listen_checks() {
        let mut p = Permissions::default();
        p.permit_all(Direction::Remote);
        assert!(p.check_listen(Some("0.0.0.0"), 2222));
        p.add(Who::User, Direction::Remote, Permission::listen("*", 2222));
        assert!(p.check_listen(Some("0.0.0.0"), 2222));
        assert!(!p.check_listen(Some("0.0.0.0"), 2223));
        p.add(Who::User, Direction::Remote, Permission::listen("localhost", 0));
        assert!(p.check_listen(Some("LocalHost"), 9999));
        assert!(!p.check_listen(None, 9999));

        assert_eq!(rfwd_bind_host(None), "localhost");
        assert_eq!(rfwd_bind_host(Some("*")), "");
        assert_eq!(rfwd_bind_host(Some("10.0.0.1")), "10.0.0.1");
    }
}
