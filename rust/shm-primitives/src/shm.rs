//! Anonymous shared-memory objects.
//!
//! A [`ShmObject`] is a file descriptor naming a sized memory object that can
//! be mapped by any process holding a copy of the descriptor. On Linux the
//! object comes from `memfd_create` and is sealed against resizing, so no
//! holder can shrink it underneath another holder's mapping.
//!
//! Elsewhere it is an unlinked temp file. Those cannot be sealed: any process
//! holding the descriptor can truncate it, and a peer mapping the truncated
//! range faults with `SIGBUS`.

use std::fs::File;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};

use crate::MmapRegion;

/// An fd-backed shared-memory object of a known size.
#[derive(Debug)]
pub struct ShmObject {
    fd: OwnedFd,
    len: u64,
}

impl ShmObject {
    /// Create a new zero-filled object of exactly `len` bytes.
    pub fn create(len: u64) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "shared memory size must be > 0",
            ));
        }

        let file = File::from(create_anonymous_fd()?);
        file.set_len(len)?;
        seal_size(file.as_fd())?;

        Ok(Self {
            fd: OwnedFd::from(file),
            len,
        })
    }

    /// Adopt an fd received from another process, claiming it is `len` bytes.
    ///
    /// Fails with `InvalidData` unless the fd names a regular (memfd or file)
    /// object at least `len` bytes long. On Linux the object must also be
    /// sealed against shrinking. Nothing beyond `len` is ever mapped.
    pub fn from_fd(fd: OwnedFd, len: u64) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "shared memory size must be > 0",
            ));
        }

        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::fstat(fd.as_raw_fd(), &mut stat) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        if (stat.st_mode & libc::S_IFMT) != libc::S_IFREG {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "handle is not a shared memory object",
            ));
        }

        check_size_sealed(fd.as_fd())?;

        let actual = u64::try_from(stat.st_size).unwrap_or(0);
        if actual < len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("shared memory object is {actual} bytes, {len} claimed"),
            ));
        }

        Ok(Self { fd, len })
    }

    /// Size of the object in bytes.
    #[inline]
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Always false: zero-sized objects cannot be constructed.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Duplicate the underlying descriptor (close-on-exec).
    pub fn try_clone_fd(&self) -> io::Result<OwnedFd> {
        self.fd.try_clone()
    }

    /// Map the whole object read/write, shared.
    pub fn map(&self) -> io::Result<MmapRegion> {
        let len = usize::try_from(self.len).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "shared memory object does not fit in the address space",
            )
        })?;
        MmapRegion::map(self.fd.as_fd(), len)
    }

    /// Give up the object, returning its descriptor.
    pub fn into_fd(self) -> OwnedFd {
        self.fd
    }
}

impl AsFd for ShmObject {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn create_anonymous_fd() -> io::Result<OwnedFd> {
    use std::os::fd::FromRawFd;

    let fd = unsafe {
        libc::memfd_create(
            c"shmq-segment".as_ptr(),
            libc::MFD_CLOEXEC | libc::MFD_ALLOW_SEALING,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: memfd_create returned a fresh descriptor that nothing else owns.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

#[cfg(any(target_os = "linux", target_os = "android"))]
const SIZE_SEALS: libc::c_int = libc::F_SEAL_SHRINK | libc::F_SEAL_GROW | libc::F_SEAL_SEAL;

/// Freeze the size of a freshly created object.
#[cfg(any(target_os = "linux", target_os = "android"))]
fn seal_size(fd: BorrowedFd<'_>) -> io::Result<()> {
    // SAFETY: F_ADD_SEALS on a live descriptor.
    if unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_ADD_SEALS, SIZE_SEALS) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn seal_size(_fd: BorrowedFd<'_>) -> io::Result<()> {
    Ok(())
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn check_size_sealed(fd: BorrowedFd<'_>) -> io::Result<()> {
    // SAFETY: F_GET_SEALS on a live descriptor.
    let seals = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GET_SEALS) };
    if seals < 0 {
        let err = io::Error::last_os_error();
        // EINVAL: the object does not support sealing at all.
        if err.raw_os_error() == Some(libc::EINVAL) {
            return Err(not_sealed());
        }
        return Err(err);
    }
    if seals & libc::F_SEAL_SHRINK == 0 {
        return Err(not_sealed());
    }
    Ok(())
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn check_size_sealed(_fd: BorrowedFd<'_>) -> io::Result<()> {
    Ok(())
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn not_sealed() -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        "shared memory object is not sealed against shrinking",
    )
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn create_anonymous_fd() -> io::Result<OwnedFd> {
    // Already unlinked: the object disappears with its last descriptor.
    Ok(OwnedFd::from(tempfile::tempfile()?))
}
