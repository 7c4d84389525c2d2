//! Netlink framing for the kernel audit interface.
//!
//! Every exchange with the kernel is a single `nlmsghdr`-prefixed frame held
//! in an [`Envelope`]. [`decode`] turns a filled envelope into a typed
//! [`Reply`] that borrows the envelope's payload instead of copying it, so a
//! reply can never outlive the buffer it was received into.
//!
//! All integers are native endian: the peer is the running kernel.

use bitflags::bitflags;

// ---------------------------------------------------------------------------
// Frame geometry
// ---------------------------------------------------------------------------

/// Size of `struct nlmsghdr`.
pub const NLMSG_HDRLEN: usize = 16;

const NLMSG_ALIGNTO: usize = 4;

/// Upper bound on a whole request frame (header included), and the size of
/// the data area behind the header in an [`Envelope`].
pub const MAX_AUDIT_MESSAGE_LENGTH: usize = 8970;

/// Total bytes an [`Envelope`] can hold.
pub const ENVELOPE_CAPACITY: usize = NLMSG_HDRLEN + MAX_AUDIT_MESSAGE_LENGTH;

/// Largest payload whose aligned frame still fits in
/// [`MAX_AUDIT_MESSAGE_LENGTH`].
pub const MAX_PAYLOAD_LEN: usize =
    (MAX_AUDIT_MESSAGE_LENGTH & !(NLMSG_ALIGNTO - 1)) - NLMSG_HDRLEN;

const fn nlmsg_align(len: usize) -> usize {
    (len + NLMSG_ALIGNTO - 1) & !(NLMSG_ALIGNTO - 1)
}

/// `NLMSG_SPACE(payload_len)`, or `None` if the frame would exceed
/// [`MAX_AUDIT_MESSAGE_LENGTH`].
pub fn request_frame_len(payload_len: usize) -> Option<usize> {
    let space = nlmsg_align(NLMSG_HDRLEN.checked_add(payload_len)?);
    (space <= MAX_AUDIT_MESSAGE_LENGTH).then_some(space)
}

// ---------------------------------------------------------------------------
// Message types and flags
// ---------------------------------------------------------------------------

/// Error / acknowledgement notification.
pub const NLMSG_ERROR: u16 = 2;
/// Get status.
pub const AUDIT_GET: u16 = 1000;
/// Set status (enable/disable, pid, ...).
pub const AUDIT_SET: u16 = 1001;
/// Get info about the sender of a signal to the audit daemon.
pub const AUDIT_SIGNAL_INFO: u16 = 1010;
/// Add a syscall filtering rule.
pub const AUDIT_ADD_RULE: u16 = 1011;
/// Delete a syscall filtering rule.
pub const AUDIT_DEL_RULE: u16 = 1012;
/// List syscall filtering rules.
pub const AUDIT_LIST_RULES: u16 = 1013;

/// `NLM_F_REQUEST`.
pub const NLM_F_REQUEST: u16 = 0x1;
/// `NLM_F_ACK`.
pub const NLM_F_ACK: u16 = 0x4;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A received frame that failed `NLMSG_OK` validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("netlink message too large: {len} bytes received, envelope is full")]
    TooLarge { len: usize },

    #[error("malformed netlink message: {len} bytes received, header claims {claimed}")]
    Malformed { len: usize, claimed: usize },
}

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

/// `struct nlmsghdr`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageHeader {
    pub len: u32,
    pub message_type: u16,
    pub flags: u16,
    pub seq: u32,
    pub pid: u32,
}

impl MessageHeader {
    /// Parse a header from the first [`NLMSG_HDRLEN`] bytes of `bytes`.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < NLMSG_HDRLEN {
            return None;
        }
        Some(Self {
            len: read_u32(bytes, 0),
            message_type: read_u16(bytes, 4),
            flags: read_u16(bytes, 6),
            seq: read_u32(bytes, 8),
            pid: read_u32(bytes, 12),
        })
    }

    pub fn to_bytes(&self) -> [u8; NLMSG_HDRLEN] {
        let mut out = [0u8; NLMSG_HDRLEN];
        out[0..4].copy_from_slice(&self.len.to_ne_bytes());
        out[4..6].copy_from_slice(&self.message_type.to_ne_bytes());
        out[6..8].copy_from_slice(&self.flags.to_ne_bytes());
        out[8..12].copy_from_slice(&self.seq.to_ne_bytes());
        out[12..16].copy_from_slice(&self.pid.to_ne_bytes());
        out
    }
}

fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    let mut raw = [0u8; 2];
    raw.copy_from_slice(&bytes[offset..offset + 2]);
    u16::from_ne_bytes(raw)
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_ne_bytes(raw)
}

/// Read the `index`th native-endian u32, or 0 past the end of `bytes`.
fn u32_at(bytes: &[u8], index: usize) -> u32 {
    let offset = index * 4;
    if bytes.len() < offset + 4 {
        return 0;
    }
    read_u32(bytes, offset)
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Fixed-capacity buffer for one netlink frame, outbound or inbound.
pub struct Envelope {
    buf: [u8; ENVELOPE_CAPACITY],
}

impl Envelope {
    pub fn new() -> Self {
        Self {
            buf: [0u8; ENVELOPE_CAPACITY],
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn as_mut_bytes(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// The header currently at the front of the buffer.
    pub fn header(&self) -> MessageHeader {
        MessageHeader::parse(&self.buf).unwrap_or_default()
    }

    /// Lay out a kernel request carrying `payload`, flagged
    /// `NLM_F_REQUEST | NLM_F_ACK`. Returns the frame length to transmit, or
    /// `None` if the payload does not fit.
    pub fn encode_request(&mut self, message_type: u16, seq: u32, payload: &[u8]) -> Option<usize> {
        let frame_len = request_frame_len(payload.len())?;
        let header = MessageHeader {
            len: frame_len as u32,
            message_type,
            flags: NLM_F_REQUEST | NLM_F_ACK,
            seq,
            pid: 0,
        };
        self.buf[..NLMSG_HDRLEN].copy_from_slice(&header.to_bytes());
        let data_end = NLMSG_HDRLEN + payload.len();
        self.buf[NLMSG_HDRLEN..data_end].copy_from_slice(payload);
        self.buf[data_end..frame_len].fill(0);
        Some(frame_len)
    }
}

impl Default for Envelope {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Envelope")
            .field("header", &self.header())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

bitflags! {
    /// Which fields of an [`AuditStatus`] an `AUDIT_SET` request changes.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct StatusMask: u32 {
        const ENABLED = 0x0001;
        const FAILURE = 0x0002;
        const PID = 0x0004;
        const RATE_LIMIT = 0x0008;
        const BACKLOG_LIMIT = 0x0010;
        const BACKLOG_WAIT_TIME = 0x0020;
        const LOST = 0x0040;
    }
}

/// Encoded size of `struct audit_status`.
pub const AUDIT_STATUS_LEN: usize = 40;

/// `struct audit_status`, used both as the `AUDIT_SET` request body and as
/// the decoded form of an `AUDIT_GET` reply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AuditStatus {
    pub mask: StatusMask,
    pub enabled: u32,
    pub failure: u32,
    pub pid: u32,
    pub rate_limit: u32,
    pub backlog_limit: u32,
    pub lost: u32,
    pub backlog: u32,
    pub feature_bitmap: u32,
    pub backlog_wait_time: u32,
}

impl AuditStatus {
    /// Decode from a status payload. Older kernels send a shorter struct;
    /// absent trailing fields read as zero.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            mask: StatusMask::from_bits_retain(u32_at(bytes, 0)),
            enabled: u32_at(bytes, 1),
            failure: u32_at(bytes, 2),
            pid: u32_at(bytes, 3),
            rate_limit: u32_at(bytes, 4),
            backlog_limit: u32_at(bytes, 5),
            lost: u32_at(bytes, 6),
            backlog: u32_at(bytes, 7),
            feature_bitmap: u32_at(bytes, 8),
            backlog_wait_time: u32_at(bytes, 9),
        }
    }

    pub fn to_bytes(&self) -> [u8; AUDIT_STATUS_LEN] {
        let words = [
            self.mask.bits(),
            self.enabled,
            self.failure,
            self.pid,
            self.rate_limit,
            self.backlog_limit,
            self.lost,
            self.backlog,
            self.feature_bitmap,
            self.backlog_wait_time,
        ];
        let mut out = [0u8; AUDIT_STATUS_LEN];
        for (chunk, word) in out.chunks_exact_mut(4).zip(words) {
            chunk.copy_from_slice(&word.to_ne_bytes());
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Reply views
// ---------------------------------------------------------------------------

/// `struct nlmsgerr`: an error, or an ack when `code` is zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorNotice {
    /// Negative errno as reported by the kernel, 0 for an ack.
    pub code: i32,
    /// Header of the request being answered, when the kernel echoed it.
    pub request: Option<MessageHeader>,
}

impl ErrorNotice {
    fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < 4 {
            return None;
        }
        Some(Self {
            code: read_u32(payload, 0) as i32,
            request: MessageHeader::parse(&payload[4..]),
        })
    }

    pub fn is_ack(&self) -> bool {
        self.code == 0
    }

    /// The positive errno carried by a nack.
    pub fn errno(&self) -> i32 {
        self.code.saturating_neg()
    }
}

/// Borrowed `struct audit_status` payload.
#[derive(Debug, Clone, Copy)]
pub struct StatusView<'a> {
    bytes: &'a [u8],
}

impl<'a> StatusView<'a> {
    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn status(&self) -> AuditStatus {
        AuditStatus::from_bytes(self.bytes)
    }
}

/// `struct audit_sig_info`: who last signalled the audit daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalInfo<'a> {
    pub uid: u32,
    pub pid: i32,
    /// Security context of the sender, possibly empty.
    pub context: &'a [u8],
}

impl<'a> SignalInfo<'a> {
    fn parse(payload: &'a [u8]) -> Option<Self> {
        if payload.len() < 8 {
            return None;
        }
        Some(Self {
            uid: read_u32(payload, 0),
            pid: read_u32(payload, 4) as i32,
            context: &payload[8..],
        })
    }
}

/// Payload of a reply, typed by its message type.
#[derive(Debug, Clone, Copy)]
pub enum ReplyBody<'a> {
    Error(ErrorNotice),
    Status(StatusView<'a>),
    RuleData(&'a [u8]),
    SignalInfo(SignalInfo<'a>),
    Message(&'a [u8]),
}

/// A validated frame received from the kernel.
#[derive(Debug, Clone, Copy)]
pub struct Reply<'a> {
    header: MessageHeader,
    payload: &'a [u8],
    body: ReplyBody<'a>,
}

impl<'a> Reply<'a> {
    pub fn header(&self) -> &MessageHeader {
        &self.header
    }

    pub fn message_type(&self) -> u16 {
        self.header.message_type
    }

    pub fn seq(&self) -> u32 {
        self.header.seq
    }

    /// Raw bytes following the header, bounded by the header's length.
    pub fn payload(&self) -> &'a [u8] {
        self.payload
    }

    pub fn body(&self) -> &ReplyBody<'a> {
        &self.body
    }

    pub fn error_notice(&self) -> Option<ErrorNotice> {
        match self.body {
            ReplyBody::Error(notice) => Some(notice),
            _ => None,
        }
    }
}

/// Interpret the first `len` received bytes of `envelope`.
pub fn decode(envelope: &Envelope, len: usize) -> Result<Reply<'_>, FrameError> {
    let header = envelope.header();
    let claimed = header.len as usize;

    if len > ENVELOPE_CAPACITY {
        return Err(FrameError::TooLarge { len });
    }
    if len < NLMSG_HDRLEN || claimed < NLMSG_HDRLEN || claimed > len {
        return Err(if len == ENVELOPE_CAPACITY {
            FrameError::TooLarge { len }
        } else {
            FrameError::Malformed { len, claimed }
        });
    }

    let payload = &envelope.as_bytes()[NLMSG_HDRLEN..claimed];
    let malformed = FrameError::Malformed { len, claimed };
    let body = match header.message_type {
        NLMSG_ERROR => ReplyBody::Error(ErrorNotice::parse(payload).ok_or(malformed)?),
        AUDIT_GET => ReplyBody::Status(StatusView { bytes: payload }),
        AUDIT_LIST_RULES => ReplyBody::RuleData(payload),
        AUDIT_SIGNAL_INFO => ReplyBody::SignalInfo(SignalInfo::parse(payload).ok_or(malformed)?),
        _ => ReplyBody::Message(payload),
    };

    Ok(Reply {
        header,
        payload,
        body,
    })
}
