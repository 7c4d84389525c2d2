//! Scripted stand-in for the kernel side of the audit socket.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::transport::{NetlinkSocket, Peek, ReceiveMode, SenderAddr};
use crate::wire::{MessageHeader, NLMSG_ERROR, NLMSG_HDRLEN};

/// Build a frame as the kernel would send it.
pub(crate) fn kernel_frame(message_type: u16, seq: u32, payload: &[u8]) -> Vec<u8> {
    let header = MessageHeader {
        len: (NLMSG_HDRLEN + payload.len()) as u32,
        message_type,
        flags: 0,
        seq,
        pid: 0,
    };
    let mut frame = header.to_bytes().to_vec();
    frame.extend_from_slice(payload);
    frame
}

enum Inbound {
    Frame { bytes: Vec<u8>, sender: SenderAddr },
    Errno(i32),
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum SendOutcome {
    Short(usize),
    Errno(i32),
}

#[derive(Default)]
pub(crate) struct ScriptedSocket {
    inbound: RefCell<VecDeque<Inbound>>,
    send_script: RefCell<VecDeque<SendOutcome>>,
    readiness: RefCell<VecDeque<i32>>,
    sent: RefCell<Vec<Vec<u8>>>,
    recv_calls: Cell<usize>,
    shutdown_when_drained: RefCell<Option<Arc<AtomicBool>>>,
}

impl ScriptedSocket {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push_frame(&self, bytes: Vec<u8>, sender: SenderAddr) {
        self.inbound
            .borrow_mut()
            .push_back(Inbound::Frame { bytes, sender });
    }

    pub(crate) fn push_kernel(&self, message_type: u16, seq: u32, payload: &[u8]) {
        self.push_frame(kernel_frame(message_type, seq, payload), SenderAddr::KERNEL);
    }

    pub(crate) fn push_ack(&self, seq: u32) {
        self.push_kernel(NLMSG_ERROR, seq, &0i32.to_ne_bytes());
    }

    pub(crate) fn push_nack(&self, seq: u32, errno: i32) {
        self.push_kernel(NLMSG_ERROR, seq, &(-errno).to_ne_bytes());
    }

    /// Make the next receive fail with `errno`.
    pub(crate) fn push_errno(&self, errno: i32) {
        self.inbound.borrow_mut().push_back(Inbound::Errno(errno));
    }

    pub(crate) fn push_send(&self, outcome: SendOutcome) {
        self.send_script.borrow_mut().push_back(outcome);
    }

    /// Make the next readiness wait fail with `errno`.
    pub(crate) fn push_wait_errno(&self, errno: i32) {
        self.readiness.borrow_mut().push_back(errno);
    }

    /// Once every scripted message is consumed, the next readiness wait
    /// raises `flag` and reports an interrupted wait, like a signal would.
    pub(crate) fn shutdown_when_drained(&self, flag: Arc<AtomicBool>) {
        *self.shutdown_when_drained.borrow_mut() = Some(flag);
    }

    pub(crate) fn sent_frames(&self) -> Vec<Vec<u8>> {
        self.sent.borrow().clone()
    }

    pub(crate) fn pending(&self) -> usize {
        self.inbound.borrow().len()
    }

    pub(crate) fn recv_calls(&self) -> usize {
        self.recv_calls.get()
    }
}

impl NetlinkSocket for ScriptedSocket {
    fn send(&self, frame: &[u8]) -> io::Result<usize> {
        match self.send_script.borrow_mut().pop_front() {
            Some(SendOutcome::Errno(errno)) => Err(io::Error::from_raw_os_error(errno)),
            Some(SendOutcome::Short(n)) => Ok(n.min(frame.len())),
            None => {
                self.sent.borrow_mut().push(frame.to_vec());
                Ok(frame.len())
            }
        }
    }

    fn recv(&self, buf: &mut [u8], mode: ReceiveMode, peek: Peek) -> io::Result<(usize, SenderAddr)> {
        self.recv_calls.set(self.recv_calls.get() + 1);
        let mut inbound = self.inbound.borrow_mut();
        let Some(front) = inbound.front() else {
            return Err(match mode {
                ReceiveMode::NonBlocking => io::Error::from_raw_os_error(libc::EAGAIN),
                ReceiveMode::Blocking => io::Error::other("scripted socket exhausted"),
            });
        };

        match front {
            Inbound::Errno(errno) => {
                let errno = *errno;
                inbound.pop_front();
                Err(io::Error::from_raw_os_error(errno))
            }
            Inbound::Frame { bytes, sender } => {
                let len = bytes.len().min(buf.len());
                buf[..len].copy_from_slice(&bytes[..len]);
                let sender = *sender;
                if peek == Peek::Consume {
                    inbound.pop_front();
                }
                Ok((len, sender))
            }
        }
    }

    fn wait_readable(&self) -> io::Result<bool> {
        if let Some(errno) = self.readiness.borrow_mut().pop_front() {
            return Err(io::Error::from_raw_os_error(errno));
        }
        if self.pending() > 0 {
            return Ok(true);
        }
        if let Some(flag) = self.shutdown_when_drained.borrow().as_ref() {
            flag.store(true, Ordering::Relaxed);
        }
        Err(io::Error::from_raw_os_error(libc::EINTR))
    }
}

/// Lets a test keep the socket after handing it to code that consumes it.
impl NetlinkSocket for &ScriptedSocket {
    fn send(&self, frame: &[u8]) -> io::Result<usize> {
        (**self).send(frame)
    }

    fn recv(&self, buf: &mut [u8], mode: ReceiveMode, peek: Peek) -> io::Result<(usize, SenderAddr)> {
        (**self).recv(buf, mode, peek)
    }

    fn wait_readable(&self) -> io::Result<bool> {
        (**self).wait_readable()
    }
}
