//! Datagram I/O over `AF_UNIX` sockets with `SCM_RIGHTS` handle transfer.
//!
//! Every message is sent as one `sendmsg` carrying the payload bytes plus zero
//! or more file descriptors in a single control message. The receiving side
//! always gets the payload and the descriptors together, or neither.

use std::ffi::OsStr;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Socket type used for a connected message channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// `SOCK_SEQPACKET`: message boundaries plus end-of-file on peer close.
    SeqPacket,
    /// `SOCK_DGRAM`: message boundaries only; a vanished peer shows up as a
    /// send error.
    Datagram,
}

impl ChannelKind {
    /// Best channel type available on this platform.
    pub fn preferred() -> Self {
        if cfg!(any(target_os = "linux", target_os = "android")) {
            ChannelKind::SeqPacket
        } else {
            ChannelKind::Datagram
        }
    }

    /// Whether a zero-length read means the peer is gone.
    pub fn reports_eof(self) -> bool {
        self == ChannelKind::SeqPacket
    }

    fn sock_type(self) -> libc::c_int {
        match self {
            ChannelKind::SeqPacket => libc::SOCK_SEQPACKET,
            ChannelKind::Datagram => libc::SOCK_DGRAM,
        }
    }
}

/// One received message.
#[derive(Debug)]
pub struct Received {
    /// Number of payload bytes written into the caller's buffer.
    pub len: usize,
    /// Descriptors that arrived with the payload, already close-on-exec.
    pub fds: Vec<OwnedFd>,
    /// The payload or the descriptor list did not fit and was cut short.
    pub truncated: bool,
    /// Filesystem address of the sender, when it has one.
    pub from: Option<PathBuf>,
}

/// Create a connected, close-on-exec `AF_UNIX` socket pair.
pub fn socketpair(kind: ChannelKind) -> io::Result<(OwnedFd, OwnedFd)> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    let ty = kind.sock_type() | libc::SOCK_CLOEXEC;
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    let ty = kind.sock_type();

    let mut fds = [0 as RawFd; 2];
    // SAFETY: `fds` points to 2 valid slots.
    let rc = unsafe { libc::socketpair(libc::AF_UNIX, ty, 0, fds.as_mut_ptr()) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: ownership transferred from raw fds created by socketpair.
    let (a, b) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        set_cloexec(a.as_raw_fd())?;
        set_cloexec(b.as_raw_fd())?;
    }

    Ok((a, b))
}

/// Send `bytes` and `fds` as one message.
///
/// With `to` set, the message is addressed to that filesystem socket
/// (unconnected datagram sockets); otherwise it goes to the connected peer.
/// Never raises `SIGPIPE`.
pub fn send_with_fds(
    sock: BorrowedFd<'_>,
    bytes: &[u8],
    fds: &[BorrowedFd<'_>],
    to: Option<&Path>,
) -> io::Result<usize> {
    let mut iov = libc::iovec {
        iov_base: bytes.as_ptr() as *mut libc::c_void,
        iov_len: bytes.len(),
    };

    // SAFETY: zeroed msghdr is valid before assigning pointers.
    let mut msghdr: libc::msghdr = unsafe { mem::zeroed() };
    msghdr.msg_iov = &mut iov;
    msghdr.msg_iovlen = 1;

    let mut addr = to.map(sockaddr_un_from_path).transpose()?;
    if let Some((addr, len)) = addr.as_mut() {
        msghdr.msg_name = (addr as *mut libc::sockaddr_un).cast();
        msghdr.msg_namelen = *len;
    }

    let mut control_buf = Vec::new();
    if !fds.is_empty() {
        let data_len = fds.len() * mem::size_of::<RawFd>();
        let cmsg_space = unsafe { libc::CMSG_SPACE(data_len as u32) as usize };
        control_buf.resize(cmsg_space, 0);

        msghdr.msg_control = control_buf.as_mut_ptr().cast();
        msghdr.msg_controllen = control_buf.len() as _;

        // SAFETY: control buffer sized with CMSG_SPACE and owned here.
        let cmsg = unsafe { libc::CMSG_FIRSTHDR(&msghdr) };
        if cmsg.is_null() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "failed to allocate SCM_RIGHTS cmsg",
            ));
        }

        let raw: Vec<RawFd> = fds.iter().map(|fd| fd.as_raw_fd()).collect();
        // SAFETY: cmsg points into `control_buf`, which has room for `raw.len()` fds.
        unsafe {
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(data_len as u32) as _;
            std::ptr::copy_nonoverlapping(
                raw.as_ptr(),
                libc::CMSG_DATA(cmsg).cast::<RawFd>(),
                raw.len(),
            );
        }
    }

    sendmsg_no_sigpipe(sock.as_raw_fd(), &msghdr)
}

fn sendmsg_no_sigpipe(fd: RawFd, msghdr: &libc::msghdr) -> io::Result<usize> {
    #[cfg(target_vendor = "apple")]
    ensure_socket_no_sigpipe(fd)?;

    #[cfg(any(target_os = "linux", target_os = "android"))]
    let flags = libc::MSG_NOSIGNAL;
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    let flags = 0;

    // SAFETY: caller guarantees `msghdr` points to valid iov/cmsg buffers.
    let n = unsafe { libc::sendmsg(fd, msghdr, flags) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

#[cfg(target_vendor = "apple")]
fn ensure_socket_no_sigpipe(fd: RawFd) -> io::Result<()> {
    let one: libc::c_int = 1;
    // SAFETY: setsockopt reads `one` for the provided length.
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_NOSIGPIPE,
            (&one as *const libc::c_int).cast(),
            mem::size_of_val(&one) as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Receive one message into `buf`, accepting up to `max_fds` descriptors.
///
/// With `nonblocking` set, an empty socket yields `ErrorKind::WouldBlock`.
/// Descriptors that arrive are always taken into ownership, even when the
/// message is reported as truncated, so none leak.
pub fn recv_with_fds(
    sock: BorrowedFd<'_>,
    buf: &mut [u8],
    max_fds: usize,
    nonblocking: bool,
) -> io::Result<Received> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast(),
        iov_len: buf.len(),
    };

    // SAFETY: zeroed sockaddr_un is a valid "no address" value.
    let mut addr: libc::sockaddr_un = unsafe { mem::zeroed() };

    let mut control = Vec::new();
    if max_fds > 0 {
        let data_len = max_fds * mem::size_of::<RawFd>();
        control.resize(unsafe { libc::CMSG_SPACE(data_len as u32) } as usize, 0);
    }

    // SAFETY: zeroed msghdr is valid before assigning pointers.
    let mut msghdr: libc::msghdr = unsafe { mem::zeroed() };
    msghdr.msg_name = (&mut addr as *mut libc::sockaddr_un).cast();
    msghdr.msg_namelen = mem::size_of::<libc::sockaddr_un>() as libc::socklen_t;
    msghdr.msg_iov = &mut iov;
    msghdr.msg_iovlen = 1;
    if !control.is_empty() {
        msghdr.msg_control = control.as_mut_ptr().cast();
        msghdr.msg_controllen = control.len() as _;
    }

    let mut flags = 0;
    if nonblocking {
        flags |= libc::MSG_DONTWAIT;
    }
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        flags |= libc::MSG_CMSG_CLOEXEC;
    }

    // SAFETY: msghdr points to live name/iov/control buffers.
    let n = unsafe { libc::recvmsg(sock.as_raw_fd(), &mut msghdr, flags) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    let fds: Vec<OwnedFd> = parse_fds(&msghdr)
        .into_iter()
        // SAFETY: SCM_RIGHTS hands us fresh descriptors nobody else owns.
        .map(|fd| unsafe { OwnedFd::from_raw_fd(fd) })
        .collect();

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    for fd in &fds {
        set_cloexec(fd.as_raw_fd())?;
    }

    let truncated = (msghdr.msg_flags & (libc::MSG_TRUNC | libc::MSG_CTRUNC)) != 0;
    let from = path_from_sockaddr_un(&addr, msghdr.msg_namelen);

    Ok(Received {
        len: n as usize,
        fds,
        truncated,
        from,
    })
}

fn parse_fds(msghdr: &libc::msghdr) -> Vec<RawFd> {
    let mut out = Vec::new();
    if msghdr.msg_control.is_null() {
        return out;
    }
    // SAFETY: msghdr points at a valid control buffer owned by caller.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(msghdr);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let cmsg_len = (*cmsg).cmsg_len as usize;
                let base_len = libc::CMSG_LEN(0) as usize;
                if cmsg_len >= base_len + mem::size_of::<RawFd>() {
                    let count = (cmsg_len - base_len) / mem::size_of::<RawFd>();
                    let data = libc::CMSG_DATA(cmsg).cast::<RawFd>();
                    for i in 0..count {
                        out.push(data.add(i).read_unaligned());
                    }
                }
            }
            cmsg = libc::CMSG_NXTHDR(msghdr, cmsg);
        }
    }
    out
}

/// Wait until `fd` is readable (or hung up). `None` waits forever.
///
/// Returns `false` on timeout.
pub fn wait_readable(fd: BorrowedFd<'_>, timeout: Option<Duration>) -> io::Result<bool> {
    let timeout_ms = match timeout {
        Some(t) => libc::c_int::try_from(t.as_millis()).unwrap_or(libc::c_int::MAX),
        None => -1,
    };
    let mut pfd = libc::pollfd {
        fd: fd.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    };

    loop {
        // SAFETY: one valid pollfd.
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        return Ok(rc > 0);
    }
}

/// Toggle `O_NONBLOCK` on `fd`.
pub fn set_nonblocking(fd: BorrowedFd<'_>, nonblocking: bool) -> io::Result<()> {
    let raw = fd.as_raw_fd();
    // SAFETY: F_GETFL/F_SETFL on a live descriptor.
    unsafe {
        let flags = libc::fcntl(raw, libc::F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        let flags = if nonblocking {
            flags | libc::O_NONBLOCK
        } else {
            flags & !libc::O_NONBLOCK
        };
        if libc::fcntl(raw, libc::F_SETFL, flags) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// The message channel type of socket `fd`.
///
/// Fails with `ENOTSOCK` for non-sockets and `InvalidInput` for sockets that
/// do not preserve message boundaries.
pub fn channel_kind(fd: BorrowedFd<'_>) -> io::Result<ChannelKind> {
    let mut ty: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    // SAFETY: getsockopt writes at most `len` bytes into `ty`.
    let rc = unsafe {
        libc::getsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_TYPE,
            (&mut ty as *mut libc::c_int).cast(),
            &mut len,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    match ty {
        libc::SOCK_SEQPACKET => Ok(ChannelKind::SeqPacket),
        libc::SOCK_DGRAM => Ok(ChannelKind::Datagram),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("socket type {ty} does not preserve message boundaries"),
        )),
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn set_cloexec(fd: RawFd) -> io::Result<()> {
    // SAFETY: F_SETFD on a live descriptor.
    if unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn sockaddr_un_from_path(path: &Path) -> io::Result<(libc::sockaddr_un, libc::socklen_t)> {
    // SAFETY: zeroed sockaddr_un is valid; we fill family and path below.
    let mut addr: libc::sockaddr_un = unsafe { mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;

    let bytes = path.as_os_str().as_bytes();
    // Leave room for the terminating NUL.
    if bytes.is_empty() || bytes.len() >= addr.sun_path.len() || bytes.contains(&0) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unusable socket path {}", path.display()),
        ));
    }
    for (dst, src) in addr.sun_path.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }

    let len = mem::offset_of!(libc::sockaddr_un, sun_path) + bytes.len() + 1;
    Ok((addr, len as libc::socklen_t))
}

fn path_from_sockaddr_un(addr: &libc::sockaddr_un, len: libc::socklen_t) -> Option<PathBuf> {
    let base = mem::offset_of!(libc::sockaddr_un, sun_path);
    let len = len as usize;
    if len <= base || addr.sun_family != libc::AF_UNIX as libc::sa_family_t {
        return None;
    }
    let raw = &addr.sun_path[..(len - base).min(addr.sun_path.len())];
    // Abstract addresses start with NUL and have no filesystem path.
    if raw.first().is_none_or(|&c| c == 0) {
        return None;
    }
    let bytes: Vec<u8> = raw
        .iter()
        .take_while(|&&c| c != 0)
        .map(|&c| c as u8)
        .collect();
    Some(PathBuf::from(OsStr::from_bytes(&bytes)))
}
