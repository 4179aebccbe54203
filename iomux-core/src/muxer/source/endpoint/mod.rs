use std::{
    io::{self, ErrorKind, Read, Write},
    os::{
        fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd},
        unix::net::{UnixDatagram, UnixStream},
    },
    process::Stdio,
};

use mio::{event::Source, unix::SourceFd, Interest, Token};

use super::{
    transport::{self, TransportKind},
    EventStream, SourceInstruction,
};

#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
)))]
const SEND_FLAGS: libc::c_int = 0;

#[derive(Debug)]
enum Socket {
    Stream(UnixStream),
    Datagram(UnixDatagram),
    SeqPacket(OwnedFd),
}

impl Socket {
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Socket::Stream(stream) => (&*stream).read(buf),
            Socket::Datagram(socket) => socket.recv(buf),
            Socket::SeqPacket(fd) => {
                let n = unsafe { libc::recv(fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len(), 0) };
                if n < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(n as usize)
            }
        }
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Socket::Stream(stream) => stream.as_raw_fd(),
            Socket::Datagram(socket) => socket.as_raw_fd(),
            Socket::SeqPacket(fd) => fd.as_raw_fd(),
        }
    }
}

/// Whether the peer of a packet socket is gone and no data is left queued.
///
/// A packet socket reads zero bytes both for an empty message and at end of
/// stream. Only a hangup with nothing but empty messages queued is end of
/// stream.
fn hung_up(fd: RawFd) -> io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    loop {
        if unsafe { libc::poll(&mut pfd, 1, 0) } != -1 {
            break;
        }
        let err = io::Error::last_os_error();
        if err.kind() != ErrorKind::Interrupted {
            return Err(err);
        }
    }
    if pfd.revents & libc::POLLHUP == 0 {
        return Ok(false);
    }
    let mut queued: libc::c_int = 0;
    if unsafe { libc::ioctl(fd, libc::FIONREAD, &mut queued as *mut libc::c_int) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(queued == 0)
}

/// The read side of one tagged socket pair. Only the drainer reads from it.
#[derive(Debug)]
pub(crate) struct Endpoint {
    socket: Socket,
}

impl Endpoint {
    pub(crate) fn pair(transport: TransportKind) -> io::Result<(Endpoint, TagWriter)> {
        let (socket, write) = match transport {
            TransportKind::Stream => {
                let (read, write) = UnixStream::pair()?;
                read.set_nonblocking(true)?;
                (Socket::Stream(read), OwnedFd::from(write))
            }
            TransportKind::Datagram => {
                let (read, write) = UnixDatagram::pair()?;
                read.set_nonblocking(true)?;
                (Socket::Datagram(read), OwnedFd::from(write))
            }
            TransportKind::SeqPacket => {
                let (read, write) = transport::seqpacket_pair()?;
                (Socket::SeqPacket(read), write)
            }
        };
        Ok((Endpoint { socket }, TagWriter { fd: write }))
    }

    /// Reads one chunk (or one message) into `buf`.
    pub(crate) fn next(&self, buf: &mut [u8]) -> io::Result<EventStream<usize>> {
        loop {
            let n = match self.socket.recv(buf) {
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    return Ok(EventStream::Drained(SourceInstruction::Reregister))
                }
                Err(e) if e.kind() == ErrorKind::ConnectionReset => {
                    return Ok(EventStream::Drained(SourceInstruction::Deregister))
                }
                Err(e) => return Err(e),
            };
            if n > 0 {
                return Ok(EventStream::Emit(n));
            }
            let end = match &self.socket {
                Socket::Stream(_) => true,
                // datagram sockets never hang up
                Socket::Datagram(_) => false,
                Socket::SeqPacket(fd) => hung_up(fd.as_raw_fd())?,
            };
            if end {
                return Ok(EventStream::Drained(SourceInstruction::Deregister));
            }
            // an empty message carries nothing worth a record
        }
    }
}

impl Source for Endpoint {
    fn register(
        &mut self,
        registry: &mio::Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        SourceFd(&self.socket.as_raw_fd()).register(registry, token, interests)
    }

    fn reregister(
        &mut self,
        registry: &mio::Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        SourceFd(&self.socket.as_raw_fd()).reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &mio::Registry) -> io::Result<()> {
        SourceFd(&self.socket.as_raw_fd()).deregister(registry)
    }
}

/// The producer's half of a tagged endpoint.
///
/// Everything written here is read back by the multiplexer under the tag it
/// was created for. Writes block while the socket buffer is full. A writer can
/// be cloned and handed to a child process as its stdout or stderr:
///
/// ```no_run
/// use std::process::{Command, Stdio};
///
/// let mux = iomux_core::Mux::<&str>::new()?;
/// let out = mux.tag("out")?;
/// let mut cmd = Command::new("date");
/// cmd.stdout(Stdio::from(out));
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
///
/// On stream and message-preserving transports, dropping every copy of a
/// writer is what tells the multiplexer that the tag has no more data.
/// Empty writes are dropped; a raw descriptor given to a child may still send
/// empty messages, which the multiplexer skips.
#[derive(Debug)]
pub struct TagWriter {
    fd: OwnedFd,
}

impl TagWriter {
    /// Creates a second handle to the same endpoint.
    pub fn try_clone(&self) -> io::Result<TagWriter> {
        Ok(TagWriter {
            fd: self.fd.try_clone()?,
        })
    }

    // Empty writes send nothing: on packet transports they would arrive as
    // empty messages.
    fn send(&self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let n = unsafe {
                libc::send(
                    self.fd.as_raw_fd(),
                    buf.as_ptr().cast(),
                    buf.len(),
                    SEND_FLAGS,
                )
            };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() != ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}

impl Write for TagWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.send(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Write for &TagWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.send(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl AsFd for TagWriter {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for TagWriter {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl From<TagWriter> for OwnedFd {
    fn from(writer: TagWriter) -> OwnedFd {
        writer.fd
    }
}

impl From<TagWriter> for Stdio {
    fn from(writer: TagWriter) -> Stdio {
        Stdio::from(writer.fd)
    }
}
