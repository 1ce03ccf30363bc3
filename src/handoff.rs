//! Dispatcher-to-worker channel over a Unix socket
//!
//! Each frame is a single tag byte. A connection frame also carries the
//! accepted socket as `SCM_RIGHTS` ancillary data, so ownership of the
//! connection moves to the worker; the dispatcher closes its descriptor as
//! soon as the frame is sent.

use std::io;
use std::mem;
use std::net::TcpStream;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::time::Duration;
use tokio::io::Interest;
use tokio::net::UnixStream;
use tokio::time::{timeout_at, Instant};

const TAG_CONNECTION: u8 = b'C';
const TAG_CLEAR_CACHE: u8 = b'X';
const TAG_LIST_CACHE: u8 = b'L';
const TAG_VERBOSE_ON: u8 = b'V';
const TAG_VERBOSE_OFF: u8 = b'v';

/// Messages a worker accepts from the dispatcher.
#[derive(Debug)]
pub enum ControlMessage {
    /// An accepted client connection no byte of which has been read yet
    Connection(TcpStream),
    ClearCache,
    ListCache,
    Verbose(bool),
}

impl ControlMessage {
    fn tag(&self) -> u8 {
        match self {
            ControlMessage::Connection(_) => TAG_CONNECTION,
            ControlMessage::ClearCache => TAG_CLEAR_CACHE,
            ControlMessage::ListCache => TAG_LIST_CACHE,
            ControlMessage::Verbose(true) => TAG_VERBOSE_ON,
            ControlMessage::Verbose(false) => TAG_VERBOSE_OFF,
        }
    }

    fn decode(tag: u8, passed: Option<OwnedFd>) -> io::Result<Self> {
        match (tag, passed) {
            (TAG_CONNECTION, Some(fd)) => Ok(ControlMessage::Connection(TcpStream::from(fd))),
            (TAG_CONNECTION, None) => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "connection frame without a descriptor",
            )),
            (TAG_CLEAR_CACHE, _) => Ok(ControlMessage::ClearCache),
            (TAG_LIST_CACHE, _) => Ok(ControlMessage::ListCache),
            (TAG_VERBOSE_ON, _) => Ok(ControlMessage::Verbose(true)),
            (TAG_VERBOSE_OFF, _) => Ok(ControlMessage::Verbose(false)),
            (other, _) => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown control tag {:#04x}", other),
            )),
        }
    }
}

/// A message that could not be delivered, handed back to the caller.
#[derive(Debug)]
pub struct SendError {
    pub error: io::Error,
    pub message: ControlMessage,
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "failed to send {:?} frame: {}", self.message.tag() as char, self.error)
    }
}

impl std::error::Error for SendError {}

// cmsghdr must be suitably aligned
#[repr(C, align(8))]
struct ControlBuffer([u8; 64]);

fn fd_space() -> usize {
    unsafe { libc::CMSG_SPACE(mem::size_of::<RawFd>() as u32) as usize }
}

fn send_frame(socket: RawFd, tag: u8, passed: Option<RawFd>) -> io::Result<()> {
    let mut payload = [tag];
    let mut iov = libc::iovec {
        iov_base: payload.as_mut_ptr().cast(),
        iov_len: payload.len(),
    };
    let mut control = ControlBuffer([0; 64]);

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;

    if let Some(fd) = passed {
        msg.msg_control = control.0.as_mut_ptr().cast();
        msg.msg_controllen = fd_space() as _;
        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of::<RawFd>() as u32) as _;
            ptr::write_unaligned(libc::CMSG_DATA(cmsg).cast::<RawFd>(), fd);
        }
    }

    let sent = unsafe { libc::sendmsg(socket, &msg, 0) };
    match sent {
        n if n < 0 => Err(io::Error::last_os_error()),
        0 => Err(io::ErrorKind::WriteZero.into()),
        _ => Ok(()),
    }
}

fn recv_frame(socket: RawFd) -> io::Result<Option<(u8, Option<OwnedFd>)>> {
    let mut payload = [0u8; 1];
    let mut iov = libc::iovec {
        iov_base: payload.as_mut_ptr().cast(),
        iov_len: payload.len(),
    };
    let mut control = ControlBuffer([0; 64]);

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.0.as_mut_ptr().cast();
    msg.msg_controllen = control.0.len() as _;

    let received = unsafe { libc::recvmsg(socket, &mut msg, 0) };
    if received < 0 {
        return Err(io::Error::last_os_error());
    }
    if received == 0 {
        return Ok(None);
    }

    let mut passed: Option<OwnedFd> = None;
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let fd = ptr::read_unaligned(libc::CMSG_DATA(cmsg).cast::<RawFd>());
                // Any descriptor beyond the first is closed on drop.
                let owned = OwnedFd::from_raw_fd(fd);
                if passed.is_none() {
                    passed = Some(owned);
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    if msg.msg_flags & libc::MSG_CTRUNC != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "control data truncated",
        ));
    }
    Ok(Some((payload[0], passed)))
}

/// Dispatcher end of a worker channel.
#[derive(Debug)]
pub struct Sender {
    stream: UnixStream,
}

impl Sender {
    pub fn new(stream: UnixStream) -> Self {
        Self { stream }
    }

    pub fn from_std(stream: std::os::unix::net::UnixStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self::new(UnixStream::from_std(stream)?))
    }

    /// Deliver `message`. On failure the message, including any
    /// connection, is returned untouched so it can go elsewhere.
    pub async fn send(&self, message: ControlMessage) -> Result<(), SendError> {
        self.deliver(message, None).await
    }

    /// Like [`send`](Self::send), but gives up with `TimedOut` when the
    /// peer has not drained its socket within `limit`.
    pub async fn send_within(&self, message: ControlMessage, limit: Duration) -> Result<(), SendError> {
        self.deliver(message, Some(limit)).await
    }

    async fn deliver(&self, message: ControlMessage, limit: Option<Duration>) -> Result<(), SendError> {
        let deadline = limit.map(|limit| Instant::now() + limit);
        let tag = message.tag();
        let passed = match &message {
            ControlMessage::Connection(conn) => Some(conn.as_raw_fd()),
            _ => None,
        };
        let socket = self.stream.as_raw_fd();

        loop {
            let ready = match deadline {
                Some(deadline) => match timeout_at(deadline, self.stream.writable()).await {
                    Ok(ready) => ready,
                    Err(_) => Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "worker did not drain its control channel",
                    )),
                },
                None => self.stream.writable().await,
            };
            if let Err(error) = ready {
                return Err(SendError { error, message });
            }
            match self
                .stream
                .try_io(Interest::WRITABLE, || send_frame(socket, tag, passed))
            {
                // The worker owns its duplicate now; ours closes here.
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(error) => return Err(SendError { error, message }),
            }
        }
    }
}

/// Worker end of the channel.
#[derive(Debug)]
pub struct Receiver {
    stream: UnixStream,
}

impl Receiver {
    pub fn new(stream: UnixStream) -> Self {
        Self { stream }
    }

    pub fn from_std(stream: std::os::unix::net::UnixStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self::new(UnixStream::from_std(stream)?))
    }

    /// Next message, or `None` once the dispatcher has hung up.
    pub async fn recv(&self) -> io::Result<Option<ControlMessage>> {
        let socket = self.stream.as_raw_fd();
        loop {
            self.stream.readable().await?;
            match self
                .stream
                .try_io(Interest::READABLE, || recv_frame(socket))
            {
                Ok(None) => return Ok(None),
                Ok(Some((tag, passed))) => return ControlMessage::decode(tag, passed).map(Some),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

/// Connected in-process channel pair.
pub fn channel() -> io::Result<(Sender, Receiver)> {
    let (left, right) = UnixStream::pair()?;
    Ok((Sender::new(left), Receiver::new(right)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_control_frames_round_trip() {
        let (sender, receiver) = channel().unwrap();
        sender.send(ControlMessage::ClearCache).await.unwrap();
        sender.send(ControlMessage::Verbose(true)).await.unwrap();
        sender.send(ControlMessage::ListCache).await.unwrap();

        assert!(matches!(receiver.recv().await.unwrap(), Some(ControlMessage::ClearCache)));
        assert!(matches!(receiver.recv().await.unwrap(), Some(ControlMessage::Verbose(true))));
        assert!(matches!(receiver.recv().await.unwrap(), Some(ControlMessage::ListCache)));

        drop(sender);
        assert!(receiver.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_send_within_times_out_on_undrained_peer() {
        let (sender, _receiver) = channel().unwrap();
        let limit = Duration::from_millis(20);
        for _ in 0..1_000_000 {
            match sender.send_within(ControlMessage::ClearCache, limit).await {
                Ok(()) => continue,
                Err(e) => {
                    assert_eq!(e.error.kind(), io::ErrorKind::TimedOut);
                    assert!(matches!(e.message, ControlMessage::ClearCache));
                    return;
                }
            }
        }
        panic!("socket buffer never filled");
    }

    #[test]
    fn test_connection_frame_requires_descriptor() {
        assert!(ControlMessage::decode(TAG_CONNECTION, None).is_err());
        assert!(ControlMessage::decode(b'?', None).is_err());
    }
}
