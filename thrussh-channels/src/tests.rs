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

//! Whole-session scenarios, driven through real sockets and the
//! session's packet queue.
use crate::channel::{ChannelType, ExtendedUsage, InputState, OutputState};
use crate::config::{ChannelTimeout, Config, Endpoint, Forward, Side};
use crate::encoding::{Encoding, Reader};
use crate::mux::MuxState;
use crate::permission::Direction;
use crate::session::Session;
use crate::{msg, sys, ChannelId, Error};
use std::io::Write;
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

fn tick(session: &mut Session, now: u64) {
    let mut set = session.prepare(now).unwrap();
    set.poll().unwrap();
    session.dispatch(&set, now).unwrap();
}

/// An open channel, as if confirmed by the peer as `remote_id`.
fn open_channel(session: &mut Session, ctype: &str, remote_id: u32) -> ChannelId {
    let id = session.new_channel(
        ctype,
        ChannelType::Open,
        None,
        None,
        None,
        1000,
        2000,
        ExtendedUsage::Ignore,
        ctype,
        true,
    );
    let c = session.channels.get_mut(id).unwrap();
    c.remote_id = Some(remote_id);
    id
}

fn data(id: u32, bytes: &[u8]) -> Vec<u8> {
    let mut p = vec![msg::CHANNEL_DATA];
    p.push_u32_be(id);
    p.extend_ssh_string(bytes);
    p
}

#[test]
fn local_forward_opens_direct_tcpip() {
    crate::init();
    let mut session = Session::new(Arc::new(Config::default()));
    let mut fwd = Forward {
        listen: Endpoint::Tcp {
            host: Some("127.0.0.1".to_string()),
            port: 0,
        },
        connect: Some(Endpoint::Tcp {
            host: Some("example".to_string()),
            port: 80,
        }),
        allocated_port: None,
    };
    session.setup_local_forward(&mut fwd).unwrap();
    let port = fwd.allocated_port.unwrap();
    assert_ne!(port, 0);

    let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
    let client_port = client.local_addr().unwrap().port();
    tick(&mut session, 1);

    let packets = session.take_packets();
    assert_eq!(packets.len(), 1);
    let mut r = packets[0].reader(0);
    assert_eq!(r.read_byte().unwrap(), msg::CHANNEL_OPEN);
    assert_eq!(r.read_utf8().unwrap(), "direct-tcpip");
    let id = r.read_u32().unwrap();
    r.read_u32().unwrap();
    r.read_u32().unwrap();
    assert_eq!(r.read_utf8().unwrap(), "example");
    assert_eq!(r.read_u32().unwrap(), 80);
    assert_eq!(r.read_utf8().unwrap(), "127.0.0.1");
    assert_eq!(r.read_u32().unwrap(), client_port as u32);

    let mut confirm = vec![msg::CHANNEL_OPEN_CONFIRMATION];
    confirm.push_u32_be(id);
    confirm.push_u32_be(33);
    confirm.push_u32_be(1 << 20);
    confirm.push_u32_be(1024);
    session.handle_message(&mut (), &confirm).unwrap();
    let c = session.channel(ChannelId(id)).unwrap();
    assert!(c.is_open());
    assert_eq!(c.remote_id(), Some(33));

    client.write_all(&[7; 3000]).unwrap();
    std::thread::sleep(Duration::from_millis(50));
    tick(&mut session, 2);
    session.output_poll().unwrap();
    let packets = session.take_packets();
    assert!(!packets.is_empty());
    let mut total = 0;
    for p in packets.iter() {
        let mut r = p.reader(0);
        assert_eq!(r.read_byte().unwrap(), msg::CHANNEL_DATA);
        assert_eq!(r.read_u32().unwrap(), 33);
        let d = r.read_string().unwrap();
        assert!(d.len() <= 1024);
        assert!(d.iter().all(|&b| b == 7));
        total += d.len();
    }
    assert!(total > 0 && total <= 3000);
}

#[test]
fn dynamic_socks4a() {
    crate::init();
    let mut session = Session::new(Arc::new(Config::default()));
    let (a, b) = sys::socketpair().unwrap();
    let id = session.new_channel(
        "dynamic-tcpip",
        ChannelType::Dynamic,
        Some(a),
        Some(a),
        None,
        1 << 20,
        1 << 15,
        ExtendedUsage::Ignore,
        "dynamic-tcpip",
        true,
    );
    sys::write(b, b"\x04\x01\x00\x50\x00\x00\x00\x01\x00").unwrap();
    tick(&mut session, 1);
    // The hostname is still missing.
    session.prepare(1).unwrap();
    match session.channel(id).unwrap().kind {
        ChannelType::Dynamic => {}
        ref k => panic!("{:?}", k),
    }
    assert!(session.take_packets().is_empty());

    sys::write(b, b"test.example\x00").unwrap();
    tick(&mut session, 2);
    session.prepare(2).unwrap();
    let c = session.channel(id).unwrap();
    match c.kind {
        ChannelType::Opening => {}
        ref k => panic!("{:?}", k),
    }
    assert_eq!(c.path(), Some("test.example"));
    assert_eq!(c.host_port(), crate::HostPort::Port(80));

    let packets = session.take_packets();
    assert_eq!(packets.len(), 1);
    let mut r = packets[0].reader(0);
    assert_eq!(r.read_byte().unwrap(), msg::CHANNEL_OPEN);
    assert_eq!(r.read_utf8().unwrap(), "direct-tcpip");
    assert_eq!(r.read_u32().unwrap(), id.0);
    r.read_u32().unwrap();
    r.read_u32().unwrap();
    assert_eq!(r.read_utf8().unwrap(), "test.example");
    assert_eq!(r.read_u32().unwrap(), 80);
    sys::close(b).unwrap();
}

#[test]
fn window_adjust_overflow_is_fatal() {
    crate::init();
    let mut session = Session::new(Arc::new(Config::default()));
    let id = open_channel(&mut session, "direct-tcpip", 3);
    let mut adjust = vec![msg::CHANNEL_WINDOW_ADJUST];
    adjust.push_u32_be(id.0);
    adjust.push_u32_be(1000);
    session.handle_message(&mut (), &adjust).unwrap();
    assert_eq!(session.channel(id).unwrap().remote_window(), 1000);

    let mut adjust = vec![msg::CHANNEL_WINDOW_ADJUST];
    adjust.push_u32_be(id.0);
    adjust.push_u32_be(0xFFFF_FFFF);
    match session.handle_message(&mut (), &adjust) {
        Err(Error::WindowOverflow(i, 0xFFFF_FFFF)) => assert_eq!(i, id),
        r => panic!("{:?}", r),
    }
    assert_eq!(session.channel(id).unwrap().remote_window(), 1000);
}

#[test]
fn window_exceeded_has_bounded_grace() {
    crate::init();
    let mut session = Session::new(Arc::new(Config::default()));
    let id = open_channel(&mut session, "direct-tcpip", 3);

    // Exactly the window.
    session.handle_message(&mut (), &data(id.0, &[0; 1000])).unwrap();
    assert_eq!(session.channel(id).unwrap().local_window(), 0);
    assert_eq!(session.channel(id).unwrap().output().len(), 1000);

    // One byte more is tolerated.
    session.handle_message(&mut (), &data(id.0, &[0; 1])).unwrap();
    assert_eq!(session.channel(id).unwrap().output().len(), 1001);

    // A whole window more is not.
    match session.handle_message(&mut (), &data(id.0, &[0; 1000])) {
        Err(Error::WindowExceeded(i)) => assert_eq!(i, id),
        r => panic!("{:?}", r),
    }
}

#[test]
fn messages_for_unknown_channels() {
    crate::init();
    let mut session = Session::new(Arc::new(Config::default()));
    match session.handle_message(&mut (), &data(12, b"x")) {
        Err(Error::WrongChannel(12)) => {}
        r => panic!("{:?}", r),
    }
    // Listeners cannot be addressed by the peer.
    let path = std::env::temp_dir().join(format!("thrussh-channels-test-{}", std::process::id()));
    let _ = std::fs::remove_file(&path);
    let listener = std::os::unix::net::UnixListener::bind(&path).unwrap();
    let id = session.new_auth_listener(listener).unwrap();
    match session.handle_message(&mut (), &data(id.0, b"x")) {
        Err(Error::WrongChannel(_)) => {}
        r => panic!("{:?}", r),
    }
    let _ = std::fs::remove_file(&path);
    assert!(session.handle_message(&mut (), &[]).is_err());
}

#[test]
fn mux_proxy_translates_ids() {
    crate::init();
    let mut session = Session::new(Arc::new(Config::default()));
    let client = session.new_channel(
        "mux-control",
        ChannelType::MuxClient(MuxState {
            hello_sent: true,
            hello_rcvd: true,
            proxy: true,
        }),
        None,
        None,
        None,
        0,
        0,
        ExtendedUsage::Ignore,
        "mux-control",
        true,
    );

    let mut frame = vec![0, msg::CHANNEL_OPEN];
    frame.extend_ssh_string(b"session");
    frame.push_u32_be(7);
    frame.push_u32_be(1 << 21);
    frame.push_u32_be(1 << 15);
    assert!(session.proxy_downstream(client, &frame).unwrap());

    let proxy = session
        .channels()
        .find(|c| match c.kind {
            ChannelType::MuxProxy { downstream, downstream_id } => downstream == client && downstream_id == 7,
            _ => false,
        })
        .map(|c| c.id())
        .unwrap();
    assert_ne!(proxy.0, 7);

    let packets = session.take_packets();
    assert_eq!(packets.len(), 1);
    let mut r = packets[0].reader(0);
    assert_eq!(r.read_byte().unwrap(), msg::CHANNEL_OPEN);
    assert_eq!(r.read_utf8().unwrap(), "session");
    assert_eq!(r.read_u32().unwrap(), proxy.0);
    assert_eq!(r.read_u32().unwrap(), 1 << 21);
    assert_eq!(r.read_u32().unwrap(), 1 << 15);

    let mut confirm = vec![msg::CHANNEL_OPEN_CONFIRMATION];
    confirm.push_u32_be(proxy.0);
    confirm.push_u32_be(42);
    confirm.push_u32_be(1 << 20);
    confirm.push_u32_be(1 << 14);
    session.handle_message(&mut (), &confirm).unwrap();
    assert!(session.take_packets().is_empty());
    assert_eq!(session.channel(proxy).unwrap().remote_id(), Some(42));

    let out = session.channel(client).unwrap().output().as_slice().to_vec();
    let mut r = out.reader(0);
    let relayed = r.read_string().unwrap();
    assert_eq!(r.remaining().len(), 0);
    let mut r = relayed.reader(0);
    assert_eq!(r.read_byte().unwrap(), 0);
    assert_eq!(r.read_byte().unwrap(), msg::CHANNEL_OPEN_CONFIRMATION);
    assert_eq!(r.read_u32().unwrap(), 7);
    assert_eq!(r.read_u32().unwrap(), 42);
    assert_eq!(r.read_u32().unwrap(), 1 << 20);
    assert_eq!(r.read_u32().unwrap(), 1 << 14);

    // Both closes free the proxy.
    let mut close = vec![0, msg::CHANNEL_CLOSE];
    close.push_u32_be(42);
    assert!(session.proxy_downstream(client, &close).unwrap());
    assert!(session.channel(proxy).unwrap().close_sent());
    let mut close = vec![msg::CHANNEL_CLOSE];
    close.push_u32_be(proxy.0);
    session.handle_message(&mut (), &close).unwrap();
    assert!(session.channel(proxy).is_none());
}

#[test]
fn freeing_a_mux_client_detaches_its_proxies() {
    crate::init();
    let mut session = Session::new(Arc::new(Config::default()));
    let client = session.new_channel(
        "mux-control",
        ChannelType::MuxClient(MuxState::default()),
        None,
        None,
        None,
        0,
        0,
        ExtendedUsage::Ignore,
        "mux-control",
        true,
    );
    for downstream_id in 0..3 {
        let mut frame = vec![0, msg::CHANNEL_OPEN];
        frame.extend_ssh_string(b"direct-tcpip");
        frame.push_u32_be(downstream_id);
        frame.push_u32_be(1 << 21);
        frame.push_u32_be(1 << 15);
        assert!(session.proxy_downstream(client, &frame).unwrap());
    }
    let mut frame = vec![0, msg::GLOBAL_REQUEST];
    frame.extend_ssh_string(b"tcpip-forward");
    frame.push(0);
    frame.extend_ssh_string(b"127.0.0.1");
    frame.push_u32_be(2222);
    assert!(session.proxy_downstream(client, &frame).unwrap());
    session.take_packets();

    let proxies = |s: &Session| {
        s.channels()
            .filter(|c| if let ChannelType::MuxProxy { .. } = c.kind { true } else { false })
            .count()
    };
    assert_eq!(proxies(&session), 3);
    assert!(session.permissions().find_listen(Some("127.0.0.1"), 2222).is_some());
    let before = session.channels().count();

    session.free(client);
    assert_eq!(proxies(&session), 0);
    assert_eq!(session.channels().count(), before - 1);
    let detached: Vec<_> = session.channels().collect();
    assert_eq!(detached.len(), 3);
    for c in detached {
        assert!(c.is_open());
        assert_eq!(c.input_state(), InputState::Closed);
        assert_eq!(c.output_state(), OutputState::Closed);
    }
    assert!(session.permissions().find_listen(Some("127.0.0.1"), 2222).is_none());
    let packets = session.take_packets();
    assert_eq!(packets.len(), 1);
    let mut r = packets[0].reader(0);
    assert_eq!(r.read_byte().unwrap(), msg::GLOBAL_REQUEST);
    assert_eq!(r.read_utf8().unwrap(), "cancel-tcpip-forward");
}

#[test]
fn x11_cookie_substitution() {
    crate::init();
    let real = vec![0xaa; 16];
    let fake: Vec<u8> = (0..16).collect();
    let mut setup = vec![0x6c, 0, 11, 0, 0, 0, 18, 0, 16, 0, 0, 0];
    setup.extend(b"MIT-MAGIC-COOKIE-1");
    setup.extend(&[0, 0]);

    for &corrupt in &[false, true] {
        let mut session = Session::new(Arc::new(Config::default()));
        session.x11.proto = Some("MIT-MAGIC-COOKIE-1".to_string());
        session.x11.real = real.clone();
        session.x11.fake = fake.clone();
        let id = session.new_channel(
            "x11",
            ChannelType::X11Open,
            None,
            None,
            None,
            1 << 16,
            1 << 14,
            ExtendedUsage::Ignore,
            "x11",
            true,
        );
        {
            let c = session.channels.get_mut(id).unwrap();
            c.remote_id = Some(9);
            c.output.extend(&setup);
            let mut cookie = fake.clone();
            if corrupt {
                cookie[5] ^= 1
            }
            c.output.extend(&cookie);
        }
        session.prepare(1).unwrap();
        let c = session.channel(id).unwrap();
        if corrupt {
            assert!(!c.is_open());
            assert_eq!(c.input_state(), InputState::Closed);
            assert_eq!(c.output_state(), OutputState::Closed);
            assert!(c.output().is_empty());
        } else {
            assert!(c.is_open());
            assert_eq!(&c.output().as_slice()[32..], &real[..]);
        }
    }
}

#[test]
fn inactivity_timeout() {
    crate::init();
    let config = Config {
        channel_timeouts: vec![ChannelTimeout::new("session", 5).unwrap()],
        ..Config::default()
    };
    let mut session = Session::new(Arc::new(config));
    let id = open_channel(&mut session, "direct-tcpip", 4);
    session.set_xtype(id, "session");

    for now in 1..5 {
        let set = session.prepare(now).unwrap();
        let left = Duration::from_secs(5 - now);
        assert!(set.timeout().unwrap() <= left);
        assert!(session.channel(id).unwrap().is_open());
    }
    session.take_packets();

    session.prepare(6).unwrap();
    let c = session.channel(id).unwrap();
    assert!(!c.is_open());
    assert_eq!(c.input_state(), InputState::Closed);
    assert_eq!(c.output_state(), OutputState::Closed);
    let packets = session.take_packets();
    assert!(packets.iter().any(|p| p[0] == msg::CHANNEL_EOF));
    assert!(packets.iter().any(|p| p[0] == msg::CHANNEL_CLOSE));
}

#[test]
fn slow_confirmation_restarts_inactivity_clock() {
    crate::init();
    let config = Config {
        channel_timeouts: vec![ChannelTimeout::new("direct-tcpip", 5).unwrap()],
        ..Config::default()
    };
    let mut session = Session::new(Arc::new(config));
    session.prepare(1).unwrap();
    let id = session.new_channel(
        "direct-tcpip",
        ChannelType::Opening,
        None,
        None,
        None,
        1000,
        2000,
        ExtendedUsage::Ignore,
        "direct-tcpip",
        true,
    );
    session.prepare(10).unwrap();

    let mut confirm = vec![msg::CHANNEL_OPEN_CONFIRMATION];
    confirm.push_u32_be(id.0);
    confirm.push_u32_be(33);
    confirm.push_u32_be(1000);
    confirm.push_u32_be(1000);
    session.handle_message(&mut (), &confirm).unwrap();

    session.prepare(11).unwrap();
    let c = session.channel(id).unwrap();
    assert!(c.is_open());
    assert_eq!(c.input_state(), InputState::Open);
    assert!(session.take_packets().is_empty());

    session.prepare(15).unwrap();
    assert!(!session.channel(id).unwrap().is_open());
    let packets = session.take_packets();
    assert!(packets.iter().any(|p| p[0] == msg::CHANNEL_CLOSE));
}

#[test]
fn extended_data_drains_before_eof() {
    crate::init();
    let mut session = Session::new(Arc::new(Config::default()));
    let (efd, _peer) = sys::socketpair().unwrap();
    let id = session.new_channel(
        "session",
        ChannelType::Open,
        None,
        None,
        Some(efd),
        1000,
        2000,
        ExtendedUsage::Read,
        "session",
        true,
    );
    {
        let c = session.channels.get_mut(id).unwrap();
        c.remote_id = Some(9);
        c.remote_window = 1000;
        c.remote_maxpacket = 1000;
        c.extended.extend(b"stderr bytes");
        c.istate = InputState::WaitDrain;
    }

    session.output_poll().unwrap();
    let packets = session.take_packets();
    assert_eq!(packets.len(), 1);
    let mut r = packets[0].reader(0);
    assert_eq!(r.read_byte().unwrap(), msg::CHANNEL_EXTENDED_DATA);
    assert_eq!(r.read_u32().unwrap(), 9);
    assert_eq!(r.read_u32().unwrap(), msg::EXTENDED_DATA_STDERR);
    assert_eq!(r.read_string().unwrap(), b"stderr bytes");
    assert_eq!(session.channel(id).unwrap().remote_window, 988);

    // The stderr descriptor is still open: EOF waits.
    session.output_poll().unwrap();
    assert!(session.take_packets().is_empty());
    assert_eq!(session.channel(id).unwrap().input_state(), InputState::WaitDrain);

    session.channels.get_mut(id).unwrap().close_efd().unwrap();
    session.output_poll().unwrap();
    let packets = session.take_packets();
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0][0], msg::CHANNEL_EOF);
    assert_eq!(session.channel(id).unwrap().input_state(), InputState::Closed);
}

#[test]
fn server_refuses_unknown_opens() {
    crate::init();
    let config = Config {
        side: Side::Server,
        ..Config::default()
    };
    let mut session = Session::new(Arc::new(config));
    for ctype in &["session", "tun@openssh.com"] {
        let mut open = vec![msg::CHANNEL_OPEN];
        open.extend_ssh_string(ctype.as_bytes());
        open.push_u32_be(5);
        open.push_u32_be(1 << 20);
        open.push_u32_be(1 << 15);
        session.handle_message(&mut (), &open).unwrap();
        let packets = session.take_packets();
        assert_eq!(packets.len(), 1);
        let mut r = packets[0].reader(0);
        assert_eq!(r.read_byte().unwrap(), msg::CHANNEL_OPEN_FAILURE);
        assert_eq!(r.read_u32().unwrap(), 5);
    }
    assert_eq!(session.channels().count(), 0);
}

#[test]
fn server_accepts_session_and_requests() {
    crate::init();
    struct Shell {
        requests: Vec<String>,
    }
    impl crate::Handler for Shell {
        fn channel_open_session(&mut self, _: &mut Session, _: ChannelId) -> bool {
            true
        }
        fn channel_request(&mut self, _: &mut Session, _: ChannelId, request: &str, _: &[u8]) -> bool {
            self.requests.push(request.to_string());
            request == "shell"
        }
    }
    let config = Config {
        side: Side::Server,
        ..Config::default()
    };
    let mut session = Session::new(Arc::new(config));
    let mut shell = Shell { requests: Vec::new() };
    let mut open = vec![msg::CHANNEL_OPEN];
    open.extend_ssh_string(b"session");
    open.push_u32_be(5);
    open.push_u32_be(1 << 20);
    open.push_u32_be(1 << 15);
    session.handle_message(&mut shell, &open).unwrap();
    let packets = session.take_packets();
    assert_eq!(packets.len(), 1);
    let mut r = packets[0].reader(0);
    assert_eq!(r.read_byte().unwrap(), msg::CHANNEL_OPEN_CONFIRMATION);
    assert_eq!(r.read_u32().unwrap(), 5);
    let id = r.read_u32().unwrap();

    for (request, reply) in &[("shell", msg::CHANNEL_SUCCESS), ("pty-req", msg::CHANNEL_FAILURE)] {
        let mut req = vec![msg::CHANNEL_REQUEST];
        req.push_u32_be(id);
        req.extend_ssh_string(request.as_bytes());
        req.push(1);
        session.handle_message(&mut shell, &req).unwrap();
        let packets = session.take_packets();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0][0], *reply);
    }
    assert_eq!(shell.requests, vec!["shell".to_string(), "pty-req".to_string()]);
}

#[test]
fn server_remote_forward_allocates_port() {
    crate::init();
    let config = Config {
        side: Side::Server,
        ..Config::default()
    };
    let mut session = Session::new(Arc::new(config));
    let mut req = vec![msg::GLOBAL_REQUEST];
    req.extend_ssh_string(b"tcpip-forward");
    req.push(1);
    req.extend_ssh_string(b"localhost");
    req.push_u32_be(0);
    // Nothing is permitted yet.
    session.handle_message(&mut (), &req).unwrap();
    let packets = session.take_packets();
    assert_eq!(packets.last().unwrap()[0], msg::REQUEST_FAILURE);

    session.permissions_mut().permit_all(Direction::Remote);
    let mut req = vec![msg::GLOBAL_REQUEST];
    req.extend_ssh_string(b"tcpip-forward");
    req.push(1);
    req.extend_ssh_string(b"localhost");
    req.push_u32_be(0);
    session.handle_message(&mut (), &req).unwrap();
    let packets = session.take_packets();
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0][0], msg::REQUEST_SUCCESS);
    let port = packets[0].reader(1).read_u32().unwrap();
    assert!(port > 0 && port <= 0xffff);

    let mut cancel = vec![msg::GLOBAL_REQUEST];
    cancel.extend_ssh_string(b"cancel-tcpip-forward");
    cancel.push(1);
    cancel.extend_ssh_string(b"localhost");
    cancel.push_u32_be(port);
    session.handle_message(&mut (), &cancel).unwrap();
    let packets = session.take_packets();
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0][0], msg::REQUEST_SUCCESS);
    assert!(session.channels().all(|c| !c.kind.is_listener()));

    // Port 0 without a reply cannot be reported.
    let mut req = vec![msg::GLOBAL_REQUEST];
    req.extend_ssh_string(b"tcpip-forward");
    req.push(0);
    req.extend_ssh_string(b"localhost");
    req.push_u32_be(0);
    session.handle_message(&mut (), &req).unwrap();
    let packets = session.take_packets();
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0][0], msg::DEBUG);
}
