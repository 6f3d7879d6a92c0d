//! Unix-domain stream transport with ancillary file-descriptor passing.
//!
//! Every message on the wire is an 8-byte little-endian length followed by
//! that many payload bytes (see `protocol`). This module only moves bytes
//! and descriptors; framing state lives in the client agent.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::ptr;

use crate::event_loop::{set_cloexec, set_nonblock};

/// Upper bound on descriptors carried by one control message.
pub const MAX_FDS_PER_MSG: usize = 32;

const CMSG_BUF_LEN: usize = 256;

pub fn socket_cloexec() -> io::Result<OwnedFd> {
    let fd = unsafe {
        libc::socket(
            libc::PF_LOCAL,
            libc::SOCK_STREAM | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn sockaddr_un(path: &Path) -> io::Result<(libc::sockaddr_un, libc::socklen_t)> {
    let mut addr: libc::sockaddr_un = unsafe { mem::zeroed() };
    addr.sun_family = libc::AF_LOCAL as libc::sa_family_t;
    let bytes = path.as_os_str().as_encoded_bytes();
    if bytes.len() >= addr.sun_path.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "socket path too long",
        ));
    }
    for (dst, src) in addr.sun_path.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }
    Ok((addr, mem::size_of::<libc::sockaddr_un>() as libc::socklen_t))
}

/// Bind and listen on `path`, removing any stale socket first.
pub fn bind_listen(sock: &OwnedFd, path: &Path) -> io::Result<()> {
    let _ = std::fs::remove_file(path);
    let (addr, len) = sockaddr_un(path)?;
    if unsafe {
        libc::bind(
            sock.as_raw_fd(),
            &addr as *const _ as *const libc::sockaddr,
            len,
        )
    } < 0
    {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::listen(sock.as_raw_fd(), 200) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub fn connect(path: &Path) -> io::Result<OwnedFd> {
    let sock = socket_cloexec()?;
    let (addr, len) = sockaddr_un(path)?;
    if unsafe {
        libc::connect(
            sock.as_raw_fd(),
            &addr as *const _ as *const libc::sockaddr,
            len,
        )
    } < 0
    {
        return Err(io::Error::last_os_error());
    }
    Ok(sock)
}

/// Accept one connection, close-on-exec and non-blocking.
pub fn accept_cloexec(sock: RawFd) -> io::Result<OwnedFd> {
    let fd = unsafe {
        libc::accept4(
            sock,
            ptr::null_mut(),
            ptr::null_mut(),
            libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Send `buf` and up to `MAX_FDS_PER_MSG` descriptors in one message.
/// `WouldBlock` means nothing was queued; retry when the socket is writable.
pub fn send_with_fds(sock: RawFd, buf: &[u8], fds: &[RawFd]) -> io::Result<usize> {
    if fds.len() > MAX_FDS_PER_MSG {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "too many fds for one message",
        ));
    }

    let mut iov = libc::iovec {
        iov_base: buf.as_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    let mut cmsg_buf = [0u8; CMSG_BUF_LEN];
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;

    if !fds.is_empty() {
        let payload = fds.len() * mem::size_of::<RawFd>();
        msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = unsafe { libc::CMSG_SPACE(payload as u32) } as _;
        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(payload as u32) as _;
            ptr::copy_nonoverlapping(
                fds.as_ptr() as *const u8,
                libc::CMSG_DATA(cmsg),
                payload,
            );
        }
    }

    loop {
        let ret = unsafe { libc::sendmsg(sock, &msg, libc::MSG_NOSIGNAL | libc::MSG_DONTWAIT) };
        if ret >= 0 {
            return Ok(ret as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Receive into `buf`; received descriptors are appended to `fds` with
/// close-on-exec already set. `Ok(0)` means the peer hung up.
pub fn recv_with_fds(sock: RawFd, buf: &mut [u8], fds: &mut Vec<OwnedFd>) -> io::Result<usize> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    let mut cmsg_buf = [0u8; CMSG_BUF_LEN];
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = CMSG_BUF_LEN as _;

    let ret = loop {
        let ret = unsafe { libc::recvmsg(sock, &mut msg, libc::MSG_DONTWAIT) };
        if ret >= 0 {
            break ret as usize;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    };

    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let data = libc::CMSG_DATA(cmsg) as *const RawFd;
                let count =
                    ((*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize)
                        / mem::size_of::<RawFd>();
                for i in 0..count {
                    let fd = *data.add(i);
                    let _ = set_cloexec(fd);
                    if fds.len() < MAX_FDS_PER_MSG {
                        fds.push(OwnedFd::from_raw_fd(fd));
                    } else {
                        libc::close(fd);
                    }
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    Ok(ret)
}

/// Connected non-blocking stream pair, mostly for tests.
pub fn socketpair_stream() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as RawFd; 2];
    if unsafe {
        libc::socketpair(
            libc::PF_LOCAL,
            libc::SOCK_STREAM | libc::SOCK_CLOEXEC,
            0,
            fds.as_mut_ptr(),
        )
    } < 0
    {
        return Err(io::Error::last_os_error());
    }
    set_nonblock(fds[0])?;
    set_nonblock(fds[1])?;
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom, Write};

    fn memfd_with(content: &[u8]) -> OwnedFd {
        let name = std::ffi::CString::new("ipc-test").unwrap();
        let fd = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
        assert!(fd >= 0);
        let owned = unsafe { OwnedFd::from_raw_fd(fd) };
        let mut f = std::fs::File::from(owned.try_clone().unwrap());
        f.write_all(content).unwrap();
        owned
    }

    #[test]
    fn bytes_round_trip() {
        let (a, b) = socketpair_stream().unwrap();
        let sent = send_with_fds(a.as_raw_fd(), b"hello", &[]).unwrap();
        assert_eq!(sent, 5);

        let mut buf = [0u8; 16];
        let mut fds = Vec::new();
        let n = recv_with_fds(b.as_raw_fd(), &mut buf, &mut fds).unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert!(fds.is_empty());
    }

    #[test]
    fn fd_travels_in_ancillary_data() {
        let (a, b) = socketpair_stream().unwrap();
        let memfd = memfd_with(b"payload");

        send_with_fds(a.as_raw_fd(), b"m", &[memfd.as_raw_fd()]).unwrap();

        let mut buf = [0u8; 4];
        let mut fds = Vec::new();
        let n = recv_with_fds(b.as_raw_fd(), &mut buf, &mut fds).unwrap();
        assert_eq!(n, 1);
        assert_eq!(fds.len(), 1);

        // The received descriptor references the same file.
        let mut f = std::fs::File::from(fds.pop().unwrap());
        f.seek(SeekFrom::Start(0)).unwrap();
        let mut content = String::new();
        f.read_to_string(&mut content).unwrap();
        assert_eq!(content, "payload");
    }

    #[test]
    fn hangup_reads_zero() {
        let (a, b) = socketpair_stream().unwrap();
        drop(a);
        let mut buf = [0u8; 4];
        let mut fds = Vec::new();
        assert_eq!(recv_with_fds(b.as_raw_fd(), &mut buf, &mut fds).unwrap(), 0);
    }

    #[test]
    fn too_many_fds_is_rejected() {
        let (a, _b) = socketpair_stream().unwrap();
        let fds = [0 as RawFd; MAX_FDS_PER_MSG + 1];
        let err = send_with_fds(a.as_raw_fd(), b"x", &fds).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
