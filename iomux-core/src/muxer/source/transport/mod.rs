use std::{
    fmt::{self, Display},
    io,
    os::fd::{AsRawFd, FromRawFd, OwnedFd},
    str::FromStr,
};

use super::endpoint::Endpoint;
use crate::error::ParseTransportError;

/// The local socket kind backing every endpoint of a multiplexer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Connection-oriented byte stream (`SOCK_STREAM`).
    #[default]
    Stream,
    /// Connectionless datagrams (`SOCK_DGRAM`).
    Datagram,
    /// Connection-oriented, message-preserving (`SOCK_SEQPACKET`).
    SeqPacket,
}

#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
const SOCK_FLAGS: libc::c_int = libc::SOCK_CLOEXEC;
#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
)))]
const SOCK_FLAGS: libc::c_int = 0;

impl TransportKind {
    pub const ALL: [TransportKind; 3] = [
        TransportKind::Stream,
        TransportKind::Datagram,
        TransportKind::SeqPacket,
    ];

    /// The conventional network name for this kind of unix socket.
    pub fn network(self) -> &'static str {
        match self {
            TransportKind::Stream => "unix",
            TransportKind::Datagram => "unixgram",
            TransportKind::SeqPacket => "unixpacket",
        }
    }

    /// Whether each write arrives as its own unit. Records read from such
    /// endpoints are never merged.
    pub fn preserves_boundaries(self) -> bool {
        !matches!(self, TransportKind::Stream)
    }

    /// Checks that the host supports this kind by creating and discarding one
    /// endpoint.
    pub(crate) fn probe(self) -> io::Result<()> {
        Endpoint::pair(self).map(drop)
    }
}

/// Creates a connected `SOCK_SEQPACKET` pair, which std has no type for. The
/// first descriptor is the non-blocking read side, the second the blocking
/// write side.
pub(crate) fn seqpacket_pair() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds: [libc::c_int; 2] = [-1, -1];
    let rc = unsafe {
        libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_SEQPACKET | SOCK_FLAGS,
            0,
            fds.as_mut_ptr(),
        )
    };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: socketpair succeeded, so both descriptors are open and
    // nothing else owns them.
    let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    if SOCK_FLAGS == 0 {
        set_cloexec(&read)?;
        set_cloexec(&write)?;
    }
    set_nonblocking(&read)?;
    Ok((read, write))
}

fn set_nonblocking(fd: &OwnedFd) -> io::Result<()> {
    let raw = fd.as_raw_fd();
    let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
    if flags == -1 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn set_cloexec(fd: &OwnedFd) -> io::Result<()> {
    let raw = fd.as_raw_fd();
    if unsafe { libc::fcntl(raw, libc::F_SETFD, libc::FD_CLOEXEC) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

impl Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.network())
    }
}

impl FromStr for TransportKind {
    type Err = ParseTransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unix" | "stream" => Ok(TransportKind::Stream),
            "unixgram" | "datagram" | "dgram" => Ok(TransportKind::Datagram),
            "unixpacket" | "seqpacket" => Ok(TransportKind::SeqPacket),
            other => Err(ParseTransportError(other.to_owned())),
        }
    }
}
