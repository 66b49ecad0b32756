//! SCM_RIGHTS file descriptor passing over a Unix stream socket.
//!
//! Both calls are non-blocking and report `WouldBlock` as an error, so they
//! can run inside tokio's `async_io` readiness loop.

use std::io::{Error as IoError, Result as IoResult};
use std::mem::{size_of, zeroed};
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

const MAX_FDS_PER_MESSAGE: usize = 4;

/// Send `data` with `fd` attached. Returns how many bytes of `data` went out.
pub fn send_with_fd(socket: RawFd, data: &[u8], fd: RawFd) -> IoResult<usize> {
    let fd_size = size_of::<libc::c_int>();
    let cmsg_space = unsafe { libc::CMSG_SPACE(fd_size as u32) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];

    let mut iov = libc::iovec {
        iov_base: data.as_ptr() as *mut libc::c_void,
        iov_len: data.len(),
    };

    let mut msg: libc::msghdr = unsafe { zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_space as _;

    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(fd_size as u32) as _;
        let data_ptr = libc::CMSG_DATA(cmsg) as *mut libc::c_int;
        std::ptr::write_unaligned(data_ptr, fd);
    }

    let sent = unsafe { libc::sendmsg(socket, &msg, 0) };
    if sent < 0 {
        return Err(IoError::last_os_error());
    }
    Ok(sent as usize)
}

/// Receive into `buffer`, collecting any descriptors that came along.
///
/// Returns `(0, _)` at end of stream.
pub fn recv_with_fds(socket: RawFd, buffer: &mut [u8]) -> IoResult<(usize, Vec<OwnedFd>)> {
    let fd_size = size_of::<libc::c_int>();
    let cmsg_space = unsafe { libc::CMSG_SPACE((fd_size * MAX_FDS_PER_MESSAGE) as u32) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];

    let mut iov = libc::iovec {
        iov_base: buffer.as_mut_ptr() as *mut libc::c_void,
        iov_len: buffer.len(),
    };

    let mut msg: libc::msghdr = unsafe { zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_space as _;

    #[cfg(target_os = "linux")]
    let flags = libc::MSG_CMSG_CLOEXEC;
    #[cfg(not(target_os = "linux"))]
    let flags = 0;

    let received = unsafe { libc::recvmsg(socket, &mut msg, flags) };
    if received < 0 {
        return Err(IoError::last_os_error());
    }

    let mut fds = Vec::new();
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let data = libc::CMSG_DATA(cmsg);
                let count = ((*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize) / fd_size;
                for index in 0..count {
                    let fd: libc::c_int =
                        std::ptr::read_unaligned(data.add(index * fd_size) as *const libc::c_int);
                    fds.push(OwnedFd::from_raw_fd(fd));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    Ok((received as usize, fds))
}
