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
use regex::Regex;
use std::path::PathBuf;
use thrussh_channels::permission::{FWD_PERMIT_ANY_HOST, FWD_PERMIT_ANY_PORT};
use thrussh_channels::{Endpoint, Forward, Permission};
use crate::Error;

lazy_static! {
    static ref TIME_SPEC: Regex = Regex::new(r"^(?:[0-9]+[sSmMhHdDwW]?)+$").unwrap();
    static ref TIME_PART: Regex = Regex::new(r"([0-9]+)([sSmMhHdDwW]?)").unwrap();
}

/// Split a forwarding spec on colons. Bracketed fields (IPv6
/// literals) are kept whole, without their brackets.
fn fields(spec: &str) -> Result<Vec<&str>, Error> {
    let mut out = Vec::new();
    let mut rest = spec;
    loop {
        let (field, tail) = if rest.starts_with('[') {
            let end = match rest.find(']') {
                Some(end) => end,
                None => return Err(Error::BadForward(spec.to_string())),
            };
            let tail = &rest[end + 1..];
            if !tail.is_empty() && !tail.starts_with(':') {
                return Err(Error::BadForward(spec.to_string()));
            }
            (&rest[1..end], tail)
        } else {
            match rest.find(':') {
                Some(i) => (&rest[..i], &rest[i..]),
                None => (rest, ""),
            }
        };
        out.push(field);
        if tail.is_empty() {
            return Ok(out);
        }
        rest = &tail[1..]
    }
}

fn is_path(field: &str) -> bool {
    field.contains('/')
}

fn port(spec: &str, field: &str) -> Result<u16, Error> {
    field.parse().map_err(|_| Error::BadForward(spec.to_string()))
}

fn listen_tcp(spec: &str, host: Option<&str>, p: &str) -> Result<Endpoint, Error> {
    Ok(Endpoint::Tcp {
        host: host.map(|h| h.to_string()),
        port: port(spec, p)?,
    })
}

fn connect_tcp(spec: &str, host: &str, p: &str) -> Result<Endpoint, Error> {
    let port = port(spec, p)?;
    if host.is_empty() || port == 0 {
        return Err(Error::BadForward(spec.to_string()));
    }
    Ok(Endpoint::Tcp {
        host: Some(host.to_string()),
        port,
    })
}

/// Parse a forwarding in OpenSSH syntax, the listen and connect
/// parts joined by a colon:
///
/// - `[bind:]port:host:hostport`, `bind` and `host` possibly
///   bracketed IPv6 literals;
/// - Unix socket paths (anything containing a `/`) in place of
///   `[bind:]port` or `host:hostport`.
///
/// Dynamic forwardings only have a listen part.
pub fn parse_forward(spec: &str, dynamic: bool) -> Result<Forward, Error> {
    let f = fields(spec)?;
    let (listen, connect) = if dynamic {
        match f.len() {
            1 if is_path(f[0]) => (Endpoint::Unix(PathBuf::from(f[0])), None),
            1 => (listen_tcp(spec, None, f[0])?, None),
            2 => (listen_tcp(spec, Some(f[0]), f[1])?, None),
            _ => return Err(Error::BadForward(spec.to_string())),
        }
    } else {
        match f.len() {
            2 if is_path(f[0]) && is_path(f[1]) => (
                Endpoint::Unix(PathBuf::from(f[0])),
                Some(Endpoint::Unix(PathBuf::from(f[1]))),
            ),
            3 if is_path(f[0]) => (
                Endpoint::Unix(PathBuf::from(f[0])),
                Some(connect_tcp(spec, f[1], f[2])?),
            ),
            3 if is_path(f[2]) => (
                listen_tcp(spec, Some(f[0]), f[1])?,
                Some(Endpoint::Unix(PathBuf::from(f[2]))),
            ),
            3 => (listen_tcp(spec, None, f[0])?, Some(connect_tcp(spec, f[1], f[2])?)),
            4 => (
                listen_tcp(spec, Some(f[0]), f[1])?,
                Some(connect_tcp(spec, f[2], f[3])?),
            ),
            _ => return Err(Error::BadForward(spec.to_string())),
        }
    };
    debug!("forward {:?}: {:?} -> {:?}", spec, listen, connect);
    Ok(Forward {
        listen,
        connect,
        allocated_port: None,
    })
}

/// Parse a time spec such as `90`, `5m` or `1h30m` into seconds.
pub fn parse_time(spec: &str) -> Result<u64, Error> {
    if !TIME_SPEC.is_match(spec) {
        return Err(Error::BadTime(spec.to_string()));
    }
    let mut total: u64 = 0;
    for cap in TIME_PART.captures_iter(spec) {
        let n: u64 = cap[1].parse().map_err(|_| Error::BadTime(spec.to_string()))?;
        let unit = match &cap[2] {
            "" | "s" | "S" => 1,
            "m" | "M" => 60,
            "h" | "H" => 3600,
            "d" | "D" => 86400,
            _ => 7 * 86400,
        };
        total = n
            .checked_mul(unit)
            .and_then(|n| total.checked_add(n))
            .ok_or_else(|| Error::BadTime(spec.to_string()))?
    }
    Ok(total)
}

/// An administrative permission list (`PermitOpen`, `PermitListen`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermitList {
    /// `any`: no restriction.
    Any,
    /// `none`: nothing is permitted.
    Deny,
    Only(Vec<Permission>),
}

fn permit_port(arg: &str, p: &str) -> Result<u16, Error> {
    if p == "*" {
        Ok(FWD_PERMIT_ANY_PORT)
    } else {
        match p.parse() {
            Ok(0) | Err(_) => Err(Error::BadValue(arg.to_string())),
            Ok(p) => Ok(p),
        }
    }
}

fn permit_list<F: Fn(&str) -> Result<Permission, Error>>(args: &[&str], f: F) -> Result<PermitList, Error> {
    match args {
        [] => Err(Error::BadValue(String::new())),
        ["any"] => Ok(PermitList::Any),
        ["none"] => Ok(PermitList::Deny),
        _ => Ok(PermitList::Only(args.iter().map(|&a| f(a)).collect::<Result<_, _>>()?)),
    }
}

/// `host:port` targets, `*` standing for any port.
pub fn parse_permit_open(args: &[&str]) -> Result<PermitList, Error> {
    permit_list(args, |arg| {
        let f = fields(arg).map_err(|_| Error::BadValue(arg.to_string()))?;
        match f[..] {
            [host, p] if !host.is_empty() => Ok(Permission::connect(host, permit_port(arg, p)?)),
            _ => Err(Error::BadValue(arg.to_string())),
        }
    })
}

/// `[host:]port` listen addresses. A bare port may be bound on any
/// address.
pub fn parse_permit_listen(args: &[&str]) -> Result<PermitList, Error> {
    permit_list(args, |arg| {
        let f = fields(arg).map_err(|_| Error::BadValue(arg.to_string()))?;
        match f[..] {
            [p] => Ok(Permission::listen(FWD_PERMIT_ANY_HOST, permit_port(arg, p)?)),
            [host, p] if !host.is_empty() => Ok(Permission::listen(host, permit_port(arg, p)?)),
            _ => Err(Error::BadValue(arg.to_string())),
        }
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn tcp(host: Option<&str>, port: u16) -> Endpoint {
        Endpoint::Tcp {
            host: host.map(|h| h.to_string()),
            port,
        }
    }

    #[test]
    fn local_forwards() {
        let f = parse_forward("8080:example.com:80", false).unwrap();
        assert_eq!(f.listen, tcp(None, 8080));
        assert_eq!(f.connect, Some(tcp(Some("example.com"), 80)));

        let f = parse_forward("[::1]:8080:[2001:db8::1]:443", false).unwrap();
        assert_eq!(f.listen, tcp(Some("::1"), 8080));
        assert_eq!(f.connect, Some(tcp(Some("2001:db8::1"), 443)));

        let f = parse_forward(":8080:localhost:22", false).unwrap();
        assert_eq!(f.listen, tcp(Some(""), 8080));
    }

    #[test]
    fn unix_forwards() {
        let f = parse_forward("/tmp/a.sock:/var/run/b.sock", false).unwrap();
        assert_eq!(f.listen, Endpoint::Unix(PathBuf::from("/tmp/a.sock")));
        assert_eq!(f.connect, Some(Endpoint::Unix(PathBuf::from("/var/run/b.sock"))));

        let f = parse_forward("/tmp/a.sock:db:5432", false).unwrap();
        assert_eq!(f.listen, Endpoint::Unix(PathBuf::from("/tmp/a.sock")));
        assert_eq!(f.connect, Some(tcp(Some("db"), 5432)));

        let f = parse_forward("localhost:2000:/run/x.sock", false).unwrap();
        assert_eq!(f.listen, tcp(Some("localhost"), 2000));
        assert_eq!(f.connect, Some(Endpoint::Unix(PathBuf::from("/run/x.sock"))));
    }

    #[test]
    fn dynamic_forwards() {
        let f = parse_forward("1080", true).unwrap();
        assert!(f.is_dynamic());
        assert_eq!(f.listen, tcp(None, 1080));
        let f = parse_forward("[::1]:1080", true).unwrap();
        assert_eq!(f.listen, tcp(Some("::1"), 1080));
        assert!(parse_forward("a:b:c", true).is_err());
    }

    #[test]
    fn bad_forwards() {
        for spec in &["", "8080", "8080:host", "x:host:80", "8080:host:0", "8080::80", "[::1:8080:h:1", "70000:h:1"] {
            match parse_forward(spec, false) {
                Err(Error::BadForward(_)) => {}
                r => panic!("{:?}: {:?}", spec, r),
            }
        }
    }

    #[test]
    fn time_specs() {
        assert_eq!(parse_time("90").unwrap(), 90);
        assert_eq!(parse_time("5m").unwrap(), 300);
        assert_eq!(parse_time("1h30m").unwrap(), 5400);
        assert_eq!(parse_time("1w1d1s").unwrap(), 8 * 86400 + 1);
        assert!(parse_time("").is_err());
        assert!(parse_time("m5").is_err());
        assert!(parse_time("5x").is_err());
        assert!(parse_time("99999999999999999999w").is_err());
    }

    #[test]
    fn permit_lists() {
        assert_eq!(parse_permit_open(&["any"]).unwrap(), PermitList::Any);
        assert_eq!(parse_permit_listen(&["none"]).unwrap(), PermitList::Deny);
        match parse_permit_open(&["db:5432", "[::1]:*"]).unwrap() {
            PermitList::Only(v) => {
                assert_eq!(v[0], Permission::connect("db", 5432));
                assert_eq!(v[1], Permission::connect("::1", FWD_PERMIT_ANY_PORT));
            }
            l => panic!("{:?}", l),
        }
        match parse_permit_listen(&["2222", "localhost:8080"]).unwrap() {
            PermitList::Only(v) => {
                assert_eq!(v[0], Permission::listen("*", 2222));
                assert_eq!(v[1], Permission::listen("localhost", 8080));
            }
            l => panic!("{:?}", l),
        }
        assert!(parse_permit_open(&["db"]).is_err());
        assert!(parse_permit_open(&["db:0"]).is_err());
        assert!(parse_permit_listen(&[]).is_err());
    }
}
