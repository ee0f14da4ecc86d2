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

//! Thin wrappers around the system calls the reactor needs.
use socket2::SockRef;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::os::unix::io::{BorrowedFd, RawFd};

fn cvt(r: libc::c_int) -> io::Result<libc::c_int> {
    if r < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(r)
    }
}

fn cvt_size(r: libc::ssize_t) -> io::Result<usize> {
    if r < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(r as usize)
    }
}

/// Errors after which the operation should simply be retried later.
pub fn is_transient(e: &io::Error) -> bool {
    match e.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => true,
        _ => false,
    }
}

pub fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    cvt_size(unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) })
}

pub fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    cvt_size(unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) })
}

pub fn close(fd: RawFd) -> io::Result<()> {
    cvt(unsafe { libc::close(fd) }).map(|_| ())
}

pub fn shutdown(fd: RawFd, how: Shutdown) -> io::Result<()> {
    with_sock(fd, |s| s.shutdown(how))
}

pub fn set_nonblock(fd: RawFd) -> io::Result<()> {
    let flags = cvt(unsafe { libc::fcntl(fd, libc::F_GETFL) })?;
    if flags & libc::O_NONBLOCK == 0 {
        cvt(unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) })?;
    }
    Ok(())
}

pub fn set_cloexec(fd: RawFd) {
    unsafe {
        libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
    }
}

pub fn getuid() -> u32 {
    unsafe { libc::getuid() }
}

/// Accept a connection on a non-blocking listener. The new socket
/// is non-blocking and close-on-exec.
pub fn accept(fd: RawFd) -> io::Result<RawFd> {
    let new = cvt(unsafe { libc::accept(fd, std::ptr::null_mut(), std::ptr::null_mut()) })?;
    set_cloexec(new);
    if let Err(e) = set_nonblock(new) {
        let _ = close(new);
        return Err(e);
    }
    Ok(new)
}

pub fn poll(fds: &mut [libc::pollfd], timeout_ms: i32) -> io::Result<usize> {
    match cvt(unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) }) {
        Ok(n) => Ok(n as usize),
        Err(ref e) if e.kind() == io::ErrorKind::Interrupted => Ok(0),
        Err(e) => Err(e),
    }
}

fn with_sock<T, F: FnOnce(SockRef) -> io::Result<T>>(fd: RawFd, f: F) -> io::Result<T> {
    let fd = unsafe { BorrowedFd::borrow_raw(fd) };
    f(SockRef::from(&fd))
}

/// Pending error on a socket (`SO_ERROR`).
pub fn take_error(fd: RawFd) -> io::Result<Option<io::Error>> {
    with_sock(fd, |s| s.take_error())
}

pub fn set_nodelay(fd: RawFd) {
    if let Err(e) = with_sock(fd, |s| s.set_nodelay(true)) {
        debug!("fd {}: TCP_NODELAY: {}", fd, e)
    }
}

pub fn local_addr(fd: RawFd) -> Option<SocketAddr> {
    with_sock(fd, |s| s.local_addr()).ok().and_then(|a| a.as_socket())
}

pub fn peer_addr(fd: RawFd) -> Option<SocketAddr> {
    with_sock(fd, |s| s.peer_addr()).ok().and_then(|a| a.as_socket())
}

/// Effective uid of the process on the other end of a Unix socket.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn peer_uid(fd: RawFd) -> io::Result<u32> {
    let mut cred = libc::ucred { pid: 0, uid: 0, gid: 0 };
    let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;
    cvt(unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            std::ptr::addr_of_mut!(cred).cast(),
            &mut len,
        )
    })?;
    Ok(cred.uid)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub fn peer_uid(fd: RawFd) -> io::Result<u32> {
    let mut uid = 0;
    let mut gid = 0;
    cvt(unsafe { libc::getpeereid(fd, &mut uid, &mut gid) })?;
    Ok(uid)
}

#[cfg(test)]
pub fn socketpair() -> io::Result<(RawFd, RawFd)> {
    use std::os::unix::io::IntoRawFd;
    let (a, b) = std::os::unix::net::UnixStream::pair()?;
    a.set_nonblocking(true)?;
    b.set_nonblocking(true)?;
    Ok((a.into_raw_fd(), b.into_raw_fd()))
}
