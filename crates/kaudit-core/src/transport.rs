//! Raw exchanges with the kernel over a `NETLINK_AUDIT` socket.
//!
//! [`NetlinkSocket`] is the seam between protocol logic and the OS. The
//! production implementation is [`AuditSocket`]; [`Transport`] layers the
//! retry, origin and framing checks on top of any implementation.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};

use tracing::{debug, error};

use crate::client::SequenceCounter;
use crate::wire::{self, Envelope, FrameError, MAX_PAYLOAD_LEN, Reply};

/// Length the kernel reports for its own `sockaddr_nl`.
pub const KERNEL_ADDR_LEN: usize = std::mem::size_of::<libc::sockaddr_nl>();

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("audit netlink channel unavailable: {0}")]
    ChannelUnavailable(#[source] io::Error),

    #[error("netlink I/O error: {0}")]
    Io(#[source] io::Error),

    #[error("netlink protocol fault: {0}")]
    ProtocolFault(String),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("rejected netlink message from pid {pid}: only the kernel may send audit replies")]
    SpoofedSender { pid: u32 },

    #[error("payload of {len} bytes exceeds the {max}-byte netlink limit")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("kernel rejected request {seq}: {source}")]
    Kernel {
        seq: u32,
        #[source]
        source: io::Error,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl TransportError {
    /// OS error code behind this failure, if any.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::ChannelUnavailable(e) | Self::Io(e) => e.raw_os_error(),
            Self::Kernel { source, .. } => source.raw_os_error(),
            Self::ProtocolFault(_) => Some(libc::EPROTO),
            Self::SpoofedSender { .. } | Self::InvalidArgument(_) => Some(libc::EINVAL),
            Self::PayloadTooLarge { .. } => Some(libc::EINVAL),
            Self::Frame(FrameError::TooLarge { .. }) => Some(libc::EFBIG),
            Self::Frame(FrameError::Malformed { .. }) => Some(libc::EBADE),
        }
    }
}

// ---------------------------------------------------------------------------
// Socket seam
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveMode {
    Blocking,
    /// `MSG_DONTWAIT`: an empty queue is reported as "no message".
    NonBlocking,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Peek {
    Consume,
    /// `MSG_PEEK`: leave the message queued.
    PeekOnly,
}

/// Source address reported by `recvfrom`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenderAddr {
    /// Address length the OS filled in.
    pub len: usize,
    /// `nl_pid`; zero for the kernel.
    pub pid: u32,
}

impl SenderAddr {
    pub const KERNEL: Self = Self {
        len: KERNEL_ADDR_LEN,
        pid: 0,
    };
}

/// The OS operations the audit protocol needs from a netlink socket.
pub trait NetlinkSocket {
    /// Send one frame to the kernel; returns the byte count the OS accepted.
    fn send(&self, frame: &[u8]) -> io::Result<usize>;

    /// Receive one frame into `buf`.
    fn recv(&self, buf: &mut [u8], mode: ReceiveMode, peek: Peek) -> io::Result<(usize, SenderAddr)>;

    /// Block until the socket is readable. `Ok(false)` means the wait
    /// returned without readiness.
    fn wait_readable(&self) -> io::Result<bool>;

    /// Release the socket.
    fn close(self)
    where
        Self: Sized,
    {
        drop(self);
    }
}

/// A `NETLINK_AUDIT` socket.
#[derive(Debug)]
pub struct AuditSocket {
    fd: OwnedFd,
}

impl AuditSocket {
    pub fn open() -> Result<Self, TransportError> {
        let fd = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                libc::NETLINK_AUDIT,
            )
        };
        if fd < 0 {
            let err = io::Error::last_os_error();
            error!("could not open audit netlink socket: {err}");
            return Err(TransportError::ChannelUnavailable(err));
        }
        // SAFETY: `fd` was just returned by socket(2) and has no other owner.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        debug!(fd = fd.as_raw_fd(), "audit netlink socket opened");
        Ok(Self { fd })
    }
}

impl AsRawFd for AuditSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl NetlinkSocket for AuditSocket {
    fn send(&self, frame: &[u8]) -> io::Result<usize> {
        // SAFETY: sockaddr_nl is plain old data; all-zero is a valid value.
        let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;

        let rc = unsafe {
            libc::sendto(
                self.fd.as_raw_fd(),
                frame.as_ptr().cast(),
                frame.len(),
                0,
                std::ptr::addr_of!(addr).cast(),
                KERNEL_ADDR_LEN as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(rc as usize)
    }

    fn recv(&self, buf: &mut [u8], mode: ReceiveMode, peek: Peek) -> io::Result<(usize, SenderAddr)> {
        let mut flags = 0;
        if mode == ReceiveMode::NonBlocking {
            flags |= libc::MSG_DONTWAIT;
        }
        if peek == Peek::PeekOnly {
            flags |= libc::MSG_PEEK;
        }

        // SAFETY: sockaddr_nl is plain old data; all-zero is a valid value.
        let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
        let mut addr_len = KERNEL_ADDR_LEN as libc::socklen_t;
        let rc = unsafe {
            libc::recvfrom(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr().cast(),
                buf.len(),
                flags,
                std::ptr::addr_of_mut!(addr).cast(),
                &mut addr_len,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok((
            rc as usize,
            SenderAddr {
                len: addr_len as usize,
                pid: addr.nl_pid,
            },
        ))
    }

    fn wait_readable(&self) -> io::Result<bool> {
        let mut pfd = libc::pollfd {
            fd: self.fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let rc = unsafe { libc::poll(&mut pfd, 1, -1) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(rc > 0)
    }

    fn close(self) {
        let fd = self.fd.into_raw_fd();
        if unsafe { libc::close(fd) } < 0 {
            error!(
                fd,
                "attempted to close invalid audit socket: {}",
                io::Error::last_os_error()
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Retrying, origin-checking exchanges over a [`NetlinkSocket`].
#[derive(Debug)]
pub struct Transport<S> {
    socket: S,
}

impl<S: NetlinkSocket> Transport<S> {
    pub fn new(socket: S) -> Self {
        Self { socket }
    }

    pub fn socket(&self) -> &S {
        &self.socket
    }

    pub fn into_socket(self) -> S {
        self.socket
    }

    /// Receive one kernel message into `envelope`.
    ///
    /// Returns `Ok(None)` when a non-blocking receive finds nothing queued.
    pub fn receive<'e>(
        &self,
        envelope: &'e mut Envelope,
        mode: ReceiveMode,
        peek: Peek,
    ) -> Result<Option<Reply<'e>>, TransportError> {
        let (len, sender) = loop {
            match self.socket.recv(envelope.as_mut_bytes(), mode, peek) {
                Ok(received) => break received,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if mode == ReceiveMode::NonBlocking {
                        return Ok(None);
                    }
                }
                Err(e) => {
                    error!("error receiving from audit netlink socket: {e}");
                    return Err(TransportError::Io(e));
                }
            }
        };

        if sender.len != KERNEL_ADDR_LEN {
            error!(
                addr_len = sender.len,
                "protocol fault: unexpected netlink sender address length"
            );
            return Err(TransportError::ProtocolFault(format!(
                "sender address length {} (expected {KERNEL_ADDR_LEN})",
                sender.len
            )));
        }
        if sender.pid != 0 {
            error!(pid = sender.pid, "invalid netlink pid received, expected 0");
            return Err(TransportError::SpoofedSender { pid: sender.pid });
        }

        match wire::decode(envelope, len) {
            Ok(reply) => Ok(Some(reply)),
            Err(e) => {
                error!("bad kernel response: {e}");
                Err(e.into())
            }
        }
    }

    /// Send `payload` as a `message_type` request with the next sequence
    /// number from `sequence`, returning that number.
    ///
    /// Oversized payloads are rejected before the counter moves.
    pub fn send(
        &self,
        message_type: u16,
        payload: &[u8],
        sequence: &mut SequenceCounter,
    ) -> Result<u32, TransportError> {
        let too_large = TransportError::PayloadTooLarge {
            len: payload.len(),
            max: MAX_PAYLOAD_LEN,
        };
        if wire::request_frame_len(payload.len()).is_none() {
            error!(len = payload.len(), "netlink message is too large");
            return Err(too_large);
        }

        let seq = sequence.advance();
        let mut envelope = Envelope::new();
        let frame_len = envelope
            .encode_request(message_type, seq, payload)
            .ok_or(too_large)?;
        let frame = &envelope.as_bytes()[..frame_len];

        let sent = loop {
            match self.socket.send(frame) {
                Ok(sent) => break sent,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("error sending data over the netlink socket: {e}");
                    return Err(TransportError::Io(e));
                }
            }
        };
        if sent != frame_len {
            return Err(TransportError::ProtocolFault(format!(
                "short send: {sent} of {frame_len} bytes"
            )));
        }

        debug!(message_type, seq, frame_len, "netlink request sent");
        Ok(seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedSocket, SendOutcome, kernel_frame};
    use crate::wire::{AUDIT_SET, NLM_F_ACK, NLM_F_REQUEST, ReplyBody};

    #[test]
    fn nonblocking_receive_without_data_is_no_message() {
        let transport = Transport::new(ScriptedSocket::new());
        let mut env = Envelope::new();
        let reply = transport
            .receive(&mut env, ReceiveMode::NonBlocking, Peek::Consume)
            .unwrap();
        assert!(reply.is_none());
    }

    #[test]
    fn receive_retries_interrupts() {
        let socket = ScriptedSocket::new();
        socket.push_errno(libc::EINTR);
        socket.push_errno(libc::EINTR);
        socket.push_kernel(1300, 0, b"type=1300 msg=audit(1.2:3): syscall=2");
        let transport = Transport::new(socket);

        let mut env = Envelope::new();
        let reply = transport
            .receive(&mut env, ReceiveMode::Blocking, Peek::Consume)
            .unwrap()
            .unwrap();
        assert_eq!(reply.message_type(), 1300);
        assert_eq!(reply.payload(), b"type=1300 msg=audit(1.2:3): syscall=2");
        assert_eq!(transport.socket().recv_calls(), 3);
    }

    #[test]
    fn blocking_receive_retries_would_block() {
        let socket = ScriptedSocket::new();
        socket.push_errno(libc::EAGAIN);
        socket.push_kernel(1300, 0, b"x");
        let transport = Transport::new(socket);

        let mut env = Envelope::new();
        let reply = transport
            .receive(&mut env, ReceiveMode::Blocking, Peek::Consume)
            .unwrap();
        assert!(reply.is_some());
    }

    #[test]
    fn receive_surfaces_os_error_code() {
        let socket = ScriptedSocket::new();
        socket.push_errno(libc::ENOBUFS);
        let transport = Transport::new(socket);

        let mut env = Envelope::new();
        let err = transport
            .receive(&mut env, ReceiveMode::Blocking, Peek::Consume)
            .unwrap_err();
        assert!(matches!(err, TransportError::Io(_)));
        assert_eq!(err.raw_os_error(), Some(libc::ENOBUFS));
    }

    #[test]
    fn receive_rejects_non_kernel_sender() {
        let socket = ScriptedSocket::new();
        socket.push_frame(
            kernel_frame(1300, 0, b"type=1300 forged"),
            SenderAddr {
                len: KERNEL_ADDR_LEN,
                pid: 4321,
            },
        );
        let transport = Transport::new(socket);

        let mut env = Envelope::new();
        let err = transport
            .receive(&mut env, ReceiveMode::Blocking, Peek::Consume)
            .unwrap_err();
        assert!(matches!(err, TransportError::SpoofedSender { pid: 4321 }));
        // The forged message was consumed, not left for the next reader.
        assert_eq!(transport.socket().pending(), 0);
    }

    #[test]
    fn receive_rejects_wrong_address_length() {
        let socket = ScriptedSocket::new();
        socket.push_frame(
            kernel_frame(1300, 0, b"x"),
            SenderAddr {
                len: KERNEL_ADDR_LEN - 4,
                pid: 0,
            },
        );
        let transport = Transport::new(socket);

        let mut env = Envelope::new();
        let err = transport
            .receive(&mut env, ReceiveMode::Blocking, Peek::Consume)
            .unwrap_err();
        assert!(matches!(err, TransportError::ProtocolFault(_)));
    }

    #[test]
    fn receive_reports_malformed_frames() {
        let socket = ScriptedSocket::new();
        let mut frame = kernel_frame(1300, 0, b"abcdef");
        frame.truncate(frame.len() - 3);
        socket.push_frame(frame, SenderAddr::KERNEL);
        let transport = Transport::new(socket);

        let mut env = Envelope::new();
        let err = transport
            .receive(&mut env, ReceiveMode::Blocking, Peek::Consume)
            .unwrap_err();
        assert!(matches!(
            err,
            TransportError::Frame(FrameError::Malformed { .. })
        ));
    }

    #[test]
    fn receive_reports_frame_filling_envelope_as_too_large() {
        let socket = ScriptedSocket::new();
        let mut frame = kernel_frame(1300, 0, &[b'a'; wire::ENVELOPE_CAPACITY]);
        frame.truncate(wire::ENVELOPE_CAPACITY);
        socket.push_frame(frame, SenderAddr::KERNEL);
        let transport = Transport::new(socket);

        let mut env = Envelope::new();
        let err = transport
            .receive(&mut env, ReceiveMode::Blocking, Peek::Consume)
            .unwrap_err();
        assert!(matches!(
            err,
            TransportError::Frame(FrameError::TooLarge { len }) if len == wire::ENVELOPE_CAPACITY
        ));
        assert_eq!(err.raw_os_error(), Some(libc::EFBIG));
    }

    #[test]
    fn peek_leaves_message_queued() {
        let socket = ScriptedSocket::new();
        socket.push_kernel(wire::NLMSG_ERROR, 1, &0i32.to_ne_bytes());
        let transport = Transport::new(socket);

        let mut env = Envelope::new();
        let reply = transport
            .receive(&mut env, ReceiveMode::Blocking, Peek::PeekOnly)
            .unwrap()
            .unwrap();
        assert!(matches!(reply.body(), ReplyBody::Error(n) if n.is_ack()));
        assert_eq!(transport.socket().pending(), 1);
    }

    #[test]
    fn send_builds_ack_requested_frame() {
        let transport = Transport::new(ScriptedSocket::new());
        let mut sequence = SequenceCounter::new();

        let seq = transport.send(AUDIT_SET, b"payload", &mut sequence).unwrap();
        assert_eq!(seq, 1);

        let sent = transport.socket().sent_frames();
        assert_eq!(sent.len(), 1);
        let header = wire::MessageHeader::parse(&sent[0]).unwrap();
        assert_eq!(header.message_type, AUDIT_SET);
        assert_eq!(header.flags, NLM_F_REQUEST | NLM_F_ACK);
        assert_eq!(header.seq, 1);
        assert_eq!(header.len as usize, sent[0].len());
        assert_eq!(&sent[0][16..23], b"payload");
    }

    #[test]
    fn send_retries_interrupts() {
        let socket = ScriptedSocket::new();
        socket.push_send(SendOutcome::Errno(libc::EINTR));
        let transport = Transport::new(socket);
        let mut sequence = SequenceCounter::new();

        assert_eq!(transport.send(AUDIT_SET, b"", &mut sequence).unwrap(), 1);
        assert_eq!(transport.socket().sent_frames().len(), 1);
    }

    #[test]
    fn short_send_is_protocol_fault() {
        let socket = ScriptedSocket::new();
        socket.push_send(SendOutcome::Short(8));
        let transport = Transport::new(socket);
        let mut sequence = SequenceCounter::new();

        let err = transport.send(AUDIT_SET, b"abcd", &mut sequence).unwrap_err();
        assert!(matches!(err, TransportError::ProtocolFault(_)));
        // The attempt still consumed a sequence number.
        assert_eq!(sequence.current(), 1);
    }

    #[test]
    fn send_error_carries_os_code() {
        let socket = ScriptedSocket::new();
        socket.push_send(SendOutcome::Errno(libc::ECONNREFUSED));
        let transport = Transport::new(socket);
        let mut sequence = SequenceCounter::new();

        let err = transport.send(AUDIT_SET, b"", &mut sequence).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ECONNREFUSED));
    }

    #[test]
    fn oversized_payload_rejected_before_sending() {
        let transport = Transport::new(ScriptedSocket::new());
        let mut sequence = SequenceCounter::new();

        let payload = vec![b'a'; MAX_PAYLOAD_LEN + 1];
        let err = transport
            .send(wire::AUDIT_ADD_RULE, &payload, &mut sequence)
            .unwrap_err();
        assert!(matches!(
            err,
            TransportError::PayloadTooLarge { len, max } if len == MAX_PAYLOAD_LEN + 1 && max == MAX_PAYLOAD_LEN
        ));
        assert!(transport.socket().sent_frames().is_empty());
        assert_eq!(sequence.current(), 0);

        let payload = vec![b'a'; MAX_PAYLOAD_LEN];
        assert!(
            transport
                .send(wire::AUDIT_ADD_RULE, &payload, &mut sequence)
                .is_ok()
        );
    }
}
