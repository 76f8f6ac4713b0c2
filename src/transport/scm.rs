//! SCM_RIGHTS descriptor passing over Unix stream sockets.
//!
//! `O_CLOEXEC` is process-scoped; it does **not** block `SCM_RIGHTS`
//! transfers. Descriptors we receive are marked close-on-exec so a card's
//! child never inherits another card's socket. On Linux the kernel sets the
//! flag during `recvmsg` (`MSG_CMSG_CLOEXEC`), so a fork on another thread
//! cannot catch the descriptor without it.

use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use crate::sys;

/// Room for this many descriptors in one ancillary buffer.
const MAX_FDS_PER_MESSAGE: usize = 4;

#[cfg(any(target_os = "linux", target_os = "android"))]
const RECV_FLAGS: libc::c_int = libc::MSG_CMSG_CLOEXEC;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const RECV_FLAGS: libc::c_int = 0;

/// Send `data` bytes with `fd` attached via `sendmsg` + SCM_RIGHTS.
///
/// The kernel duplicates the descriptor into the receiving process; the
/// sender keeps its own copy.
pub fn send_with_fd(stream: &UnixStream, data: &[u8], fd: RawFd) -> io::Result<()> {
    let sock_fd = stream.as_raw_fd();
    let fd_size = std::mem::size_of::<libc::c_int>();
    // SAFETY: CMSG_SPACE is a pure size computation.
    let cmsg_space = unsafe { libc::CMSG_SPACE(fd_size as u32) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];

    let mut iov = libc::iovec {
        iov_base: data.as_ptr() as *mut libc::c_void,
        iov_len: data.len(),
    };

    // SAFETY: msghdr is plain old data; all-zero is a valid empty header.
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr().cast::<libc::c_void>();
    msg.msg_controllen = cmsg_space as _;

    // SAFETY: the control buffer is CMSG_SPACE(sizeof(int)) bytes, so the
    // first header and its one-int payload fit.
    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(fd_size as u32) as _;
        let data_ptr = libc::CMSG_DATA(cmsg).cast::<libc::c_int>();
        std::ptr::write_unaligned(data_ptr, fd);
    }

    loop {
        // SAFETY: `msg` points at live buffers for the duration of the call.
        let n = unsafe { libc::sendmsg(sock_fd, &msg, 0) };
        if n >= 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            continue;
        }
        if err.kind() == io::ErrorKind::WouldBlock {
            let mut fds = [sys::pollfd(sock_fd, libc::POLLOUT)];
            match sys::poll(&mut fds, None) {
                Ok(_) => continue,
                Err(e) if sys::is_transient(&e) => continue,
                Err(e) => return Err(e),
            }
        }
        return Err(err);
    }
}

/// Receive up to `max_bytes` from a Unix stream socket using `recvmsg`,
/// capturing any file descriptors passed via SCM_RIGHTS ancillary data.
///
/// Returns `(bytes, fds)`. Both empty means the peer closed the connection.
pub fn recv_with_fds(sock_fd: RawFd, max_bytes: usize) -> io::Result<(Vec<u8>, Vec<OwnedFd>)> {
    let mut data_buf = vec![0u8; max_bytes];
    // SAFETY: CMSG_SPACE is a pure size computation.
    let cmsg_space =
        unsafe { libc::CMSG_SPACE(std::mem::size_of::<libc::c_int>() as _) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space * MAX_FDS_PER_MESSAGE];

    let mut iov = libc::iovec {
        iov_base: data_buf.as_mut_ptr().cast::<libc::c_void>(),
        iov_len: data_buf.len(),
    };
    // SAFETY: msghdr is plain old data; all-zero is a valid empty header.
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr().cast::<libc::c_void>();
    msg.msg_controllen = cmsg_buf.len() as _;

    // SAFETY: `msg` points at live, writable buffers of the stated sizes.
    let n = unsafe { libc::recvmsg(sock_fd, &mut msg, RECV_FLAGS) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    data_buf.truncate(n as usize);

    let mut fds = Vec::new();
    // SAFETY: the kernel filled `msg_control` with well-formed cmsg headers
    // and `msg_controllen` bounds the walk; each SCM_RIGHTS payload holds
    // descriptors that are now owned by this process.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let data = libc::CMSG_DATA(cmsg);
                let fd_count = ((*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize)
                    / std::mem::size_of::<libc::c_int>();
                for i in 0..fd_count {
                    let fd: libc::c_int = std::ptr::read_unaligned(
                        data.add(i * std::mem::size_of::<libc::c_int>())
                            .cast::<libc::c_int>(),
                    );
                    fds.push(OwnedFd::from_raw_fd(fd));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }
    if RECV_FLAGS == 0 {
        for fd in &fds {
            let _ = sys::set_cloexec(fd.as_raw_fd());
        }
    }

    Ok((data_buf, fds))
}
