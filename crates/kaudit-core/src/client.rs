//! Request/acknowledgement correlation with the kernel.
//!
//! [`AuditClient`] owns the transport and the sequence counter. Every request
//! is sent with `NLM_F_ACK` and the client waits for the matching ack before
//! returning, so at most one request is ever outstanding.

use std::io;

use tracing::{debug, error, warn};

use crate::rule::Rule;
use crate::transport::{NetlinkSocket, Peek, ReceiveMode, Transport, TransportError};
use crate::wire::{
    AUDIT_ADD_RULE, AUDIT_SET, AuditStatus, Envelope, Reply, StatusMask,
};

// ---------------------------------------------------------------------------
// Sequence counter
// ---------------------------------------------------------------------------

/// Per-request sequence numbers.
///
/// The kernel echoes a u32, but only a signed 16-bit value survives every
/// user/kernel word-size split unchanged, so the counter lives in an `i16`
/// and restarts at zero instead of going negative.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SequenceCounter {
    current: i16,
}

impl SequenceCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from `value` (clamped to zero).
    pub fn starting_at(value: i16) -> Self {
        Self {
            current: value.max(0),
        }
    }

    /// The most recently issued number (0 before the first request).
    pub fn current(&self) -> i16 {
        self.current
    }

    /// Issue the next number.
    pub fn advance(&mut self) -> u32 {
        let next = self.current.wrapping_add(1);
        self.current = if next < 0 {
            warn!("audit sequence number has rolled over");
            0
        } else {
            next
        };
        self.current as u32
    }
}

// ---------------------------------------------------------------------------
// Request parameters
// ---------------------------------------------------------------------------

/// Whether [`AuditClient::set_pid`] drains the kernel's follow-up message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckWait {
    No,
    Yes,
}

/// `audit_status.enabled` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnabledState {
    Disabled = 0,
    Enabled = 1,
    /// Enabled and immutable until reboot.
    Locked = 2,
}

impl TryFrom<u32> for EnabledState {
    type Error = TransportError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Disabled),
            1 => Ok(Self::Enabled),
            2 => Ok(Self::Locked),
            other => Err(TransportError::InvalidArgument(format!(
                "audit enabled state {other} (expected 0, 1 or 2)"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct AuditClient<S> {
    transport: Transport<S>,
    sequence: SequenceCounter,
}

impl<S: NetlinkSocket> AuditClient<S> {
    pub fn new(socket: S) -> Self {
        Self::with_sequence(socket, SequenceCounter::new())
    }

    pub fn with_sequence(socket: S, sequence: SequenceCounter) -> Self {
        Self {
            transport: Transport::new(socket),
            sequence,
        }
    }

    pub fn transport(&self) -> &Transport<S> {
        &self.transport
    }

    pub fn sequence(&self) -> &SequenceCounter {
        &self.sequence
    }

    pub fn into_socket(self) -> S {
        self.transport.into_socket()
    }

    /// Send a request and wait for its acknowledgement. Returns the request's
    /// sequence number.
    pub fn send(&mut self, message_type: u16, payload: &[u8]) -> Result<u32, TransportError> {
        let seq = self.transport.send(message_type, payload, &mut self.sequence)?;
        self.await_ack(seq)?;
        Ok(seq)
    }

    /// Wait for the kernel's answer to request `seq`.
    ///
    /// The next message is peeked; only an error notification is consumed.
    /// A sequence mismatch is logged but accepted, since unrelated audit
    /// traffic can interleave with acks.
    pub fn await_ack(&self, seq: u32) -> Result<(), TransportError> {
        let mut envelope = Envelope::new();
        let (is_notice, mut received_seq) =
            match self
                .transport
                .receive(&mut envelope, ReceiveMode::Blocking, Peek::PeekOnly)?
            {
                Some(reply) => (reply.error_notice().is_some(), reply.seq()),
                None => return Ok(()),
            };

        if is_notice
            && let Some(reply) =
                self.transport
                    .receive(&mut envelope, ReceiveMode::Blocking, Peek::Consume)?
        {
            received_seq = reply.seq();
            if let Some(notice) = reply.error_notice()
                && !notice.is_ack()
            {
                return Err(TransportError::Kernel {
                    seq,
                    source: io::Error::from_raw_os_error(notice.errno()),
                });
            }
        }

        if received_seq != seq {
            warn!(
                expected = seq,
                got = received_seq,
                "sequence number between user space and kernel space is out of skew"
            );
        }
        Ok(())
    }

    /// Receive one message; see [`Transport::receive`].
    pub fn receive<'e>(
        &self,
        envelope: &'e mut Envelope,
        mode: ReceiveMode,
        peek: Peek,
    ) -> Result<Option<Reply<'e>>, TransportError> {
        self.transport.receive(envelope, mode, peek)
    }

    /// Register `pid` as the audit event consumer; `0` de-registers.
    pub fn set_pid(&mut self, pid: u32, wait: AckWait) -> Result<(), TransportError> {
        let status = AuditStatus {
            mask: StatusMask::PID,
            pid,
            ..AuditStatus::default()
        };

        if let Err(e) = self.send(AUDIT_SET, &status.to_bytes()) {
            error!(pid, "could not set pid for audit events: {e}");
            return Err(e);
        }

        // The kernel may follow up with a status message; swallow it so the
        // event loop starts from a clean queue. Non-blocking, because after a
        // daemon restart the follow-up does not always arrive.
        if wait == AckWait::Yes {
            let mut envelope = Envelope::new();
            match self
                .transport
                .receive(&mut envelope, ReceiveMode::NonBlocking, Peek::Consume)
            {
                Ok(Some(reply)) => debug!(
                    message_type = reply.message_type(),
                    "discarded registration follow-up"
                ),
                Ok(None) => {}
                Err(e) => debug!("no registration follow-up: {e}"),
            }
        }
        Ok(())
    }

    pub fn set_enabled(&mut self, state: EnabledState) -> Result<u32, TransportError> {
        let status = AuditStatus {
            mask: StatusMask::ENABLED,
            enabled: state as u32,
            ..AuditStatus::default()
        };
        self.send(AUDIT_SET, &status.to_bytes())
    }

    /// Submit `rule` to the kernel's filter list.
    pub fn add_rule(&mut self, rule: Rule) -> Result<u32, TransportError> {
        self.send(AUDIT_ADD_RULE, &rule.to_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedSocket, SendOutcome};
    use crate::wire::{self, AUDIT_STATUS_LEN, MessageHeader, NLMSG_HDRLEN};

    fn client() -> AuditClient<ScriptedSocket> {
        AuditClient::new(ScriptedSocket::new())
    }

    fn sent_header(client: &AuditClient<ScriptedSocket>, index: usize) -> MessageHeader {
        let sent = client.transport().socket().sent_frames();
        MessageHeader::parse(&sent[index]).unwrap()
    }

    fn sent_status(client: &AuditClient<ScriptedSocket>, index: usize) -> AuditStatus {
        let sent = client.transport().socket().sent_frames();
        AuditStatus::from_bytes(&sent[index][NLMSG_HDRLEN..NLMSG_HDRLEN + AUDIT_STATUS_LEN])
    }

    #[test]
    fn counter_tracks_number_of_sends() {
        let mut client = client();
        for n in 1..=5u32 {
            client.transport().socket().push_ack(n);
            assert_eq!(client.send(AUDIT_SET, b"").unwrap(), n);
        }
        assert_eq!(client.sequence().current(), 5);
        assert_eq!(client.transport().socket().pending(), 0);
    }

    #[test]
    fn counter_wraps_to_zero_instead_of_negative() {
        let mut counter = SequenceCounter::starting_at(i16::MAX - 1);
        assert_eq!(counter.advance(), i16::MAX as u32);
        assert_eq!(counter.advance(), 0);
        assert_eq!(counter.current(), 0);
        assert_eq!(counter.advance(), 1);
    }

    #[test]
    fn counter_after_full_cycle_is_count_mod_wrap_point() {
        let mut counter = SequenceCounter::new();
        let sends = 40_000u32;
        for _ in 0..sends {
            let seq = counter.advance();
            assert!(counter.current() >= 0);
            assert!(seq <= i16::MAX as u32);
        }
        assert_eq!(counter.current() as u32, sends % 32_768);
    }

    #[test]
    fn starting_at_negative_clamps() {
        assert_eq!(SequenceCounter::starting_at(-5).current(), 0);
    }

    #[test]
    fn nack_maps_to_kernel_error() {
        let mut client = client();
        client.transport().socket().push_nack(1, libc::EPERM);

        let err = client.send(AUDIT_SET, b"").unwrap_err();
        match err {
            TransportError::Kernel { seq, source } => {
                assert_eq!(seq, 1);
                assert_eq!(source.raw_os_error(), Some(libc::EPERM));
            }
            other => panic!("expected kernel error, got {other:?}"),
        }
        assert_eq!(client.transport().socket().pending(), 0);
    }

    #[test]
    fn mismatched_ack_sequence_is_tolerated() {
        let mut client = client();
        client.transport().socket().push_ack(99);
        assert_eq!(client.send(AUDIT_SET, b"").unwrap(), 1);
        assert_eq!(client.transport().socket().pending(), 0);
    }

    #[test]
    fn non_notice_reply_is_left_queued() {
        let mut client = client();
        client
            .transport()
            .socket()
            .push_kernel(1300, 0, b"type=1300 msg=audit(1.0:1)");

        assert_eq!(client.send(AUDIT_SET, b"").unwrap(), 1);
        assert_eq!(client.transport().socket().pending(), 1);
    }

    #[test]
    fn ack_wait_propagates_spoofed_sender() {
        let mut client = client();
        client.transport().socket().push_frame(
            crate::testing::kernel_frame(wire::NLMSG_ERROR, 1, &0i32.to_ne_bytes()),
            crate::transport::SenderAddr {
                len: crate::transport::KERNEL_ADDR_LEN,
                pid: 77,
            },
        );
        assert!(matches!(
            client.send(AUDIT_SET, b"").unwrap_err(),
            TransportError::SpoofedSender { pid: 77 }
        ));
    }

    #[test]
    fn failed_send_still_advances_counter() {
        let mut client = client();
        client
            .transport()
            .socket()
            .push_send(SendOutcome::Errno(libc::ENOBUFS));
        assert!(client.send(AUDIT_SET, b"").is_err());
        assert_eq!(client.sequence().current(), 1);

        client.transport().socket().push_ack(2);
        assert_eq!(client.send(AUDIT_SET, b"").unwrap(), 2);
    }

    #[test]
    fn set_pid_registers_and_drains_follow_up() {
        let mut client = client();
        let socket = client.transport().socket();
        socket.push_ack(1);
        socket.push_kernel(wire::AUDIT_GET, 0, &AuditStatus::default().to_bytes());

        client.set_pid(4242, AckWait::Yes).unwrap();

        let header = sent_header(&client, 0);
        assert_eq!(header.message_type, AUDIT_SET);
        let status = sent_status(&client, 0);
        assert_eq!(status.mask, StatusMask::PID);
        assert_eq!(status.pid, 4242);
        assert_eq!(client.transport().socket().pending(), 0);
    }

    #[test]
    fn set_pid_without_follow_up_is_fine() {
        let mut client = client();
        client.transport().socket().push_ack(1);
        client.set_pid(10, AckWait::Yes).unwrap();
    }

    #[test]
    fn deregistration_does_not_drain() {
        let mut client = client();
        let socket = client.transport().socket();
        socket.push_ack(1);
        socket.push_kernel(1300, 0, b"late event");

        client.set_pid(0, AckWait::No).unwrap();

        assert_eq!(sent_status(&client, 0).pid, 0);
        assert_eq!(client.transport().socket().pending(), 1);
    }

    #[test]
    fn set_enabled_sends_enabled_mask() {
        let mut client = client();
        client.transport().socket().push_ack(1);
        client.set_enabled(EnabledState::Locked).unwrap();

        let status = sent_status(&client, 0);
        assert_eq!(status.mask, StatusMask::ENABLED);
        assert_eq!(status.enabled, 2);
    }

    #[test]
    fn enabled_state_rejects_out_of_range() {
        assert_eq!(EnabledState::try_from(1).unwrap(), EnabledState::Enabled);
        assert!(matches!(
            EnabledState::try_from(3),
            Err(TransportError::InvalidArgument(_))
        ));
    }

    #[test]
    fn add_rule_submits_rule_layout() {
        let mut client = client();
        client.transport().socket().push_ack(1);
        let rule = Rule::directory_watch("/data/secure");
        let expected = rule.to_bytes();

        client.add_rule(rule).unwrap();

        let sent = client.transport().socket().sent_frames();
        assert_eq!(sent_header(&client, 0).message_type, AUDIT_ADD_RULE);
        assert_eq!(&sent[0][NLMSG_HDRLEN..NLMSG_HDRLEN + expected.len()], &expected[..]);
    }
}
