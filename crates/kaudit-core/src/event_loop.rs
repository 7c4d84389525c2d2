//! The daemon's main loop: wait for kernel events and record them.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, error, info, warn};

use crate::audit_log::{AuditLog, LogError, LogFileOpener, SyncFileOpener};
use crate::client::{AckWait, AuditClient};
use crate::transport::{NetlinkSocket, Peek, ReceiveMode};
use crate::wire::Envelope;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    WaitingForEvent,
    Dispatching,
    ShuttingDown,
}

/// Outcome of one loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Turn {
    /// A kernel message was appended to the log.
    Recorded,
    /// Nothing was recorded; the failure has been logged.
    Skipped,
    /// The readiness wait was interrupted by a signal.
    Interrupted,
}

pub struct EventLoop<S: NetlinkSocket, O: LogFileOpener = SyncFileOpener> {
    client: AuditClient<S>,
    log: AuditLog<O>,
    state: LoopState,
    envelope: Box<Envelope>,
}

impl<S: NetlinkSocket, O: LogFileOpener> EventLoop<S, O> {
    pub fn new(client: AuditClient<S>, log: AuditLog<O>) -> Self {
        Self {
            client,
            log,
            state: LoopState::Idle,
            envelope: Box::default(),
        }
    }

    pub fn client(&self) -> &AuditClient<S> {
        &self.client
    }

    pub fn log(&self) -> &AuditLog<O> {
        &self.log
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Run until `shutdown` is raised. The flag is checked before every wait,
    /// so a signal takes effect once the current wait returns.
    ///
    /// Returns the number of records written.
    pub fn run(&mut self, shutdown: &AtomicBool) -> u64 {
        info!("waiting for audit events");
        let mut recorded = 0;
        while !shutdown.load(Ordering::Relaxed) {
            if self.turn() == Turn::Recorded {
                recorded += 1;
            }
        }
        self.state = LoopState::ShuttingDown;
        info!(recorded, "audit event loop stopped");
        recorded
    }

    /// Wait for one kernel message and append it to the log.
    pub fn turn(&mut self) -> Turn {
        self.state = LoopState::WaitingForEvent;
        match self.client.transport().socket().wait_readable() {
            Ok(true) => {}
            Ok(false) => {
                self.state = LoopState::Idle;
                return Turn::Skipped;
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {
                self.state = LoopState::Idle;
                return Turn::Interrupted;
            }
            Err(e) => {
                error!("poll on audit socket failed: {e}");
                self.state = LoopState::Idle;
                return Turn::Skipped;
            }
        }

        self.state = LoopState::Dispatching;
        let turn = match self.client.receive(
            &mut self.envelope,
            ReceiveMode::Blocking,
            Peek::Consume,
        ) {
            Ok(Some(reply)) => {
                debug!(
                    message_type = reply.message_type(),
                    len = reply.payload().len(),
                    "audit event received"
                );
                match self.log.append(reply.payload()) {
                    Ok(()) => Turn::Recorded,
                    Err(e) => {
                        error!("failed to write audit event: {e}");
                        Turn::Skipped
                    }
                }
            }
            Ok(None) => Turn::Skipped,
            Err(e) => {
                error!("failed to receive audit event: {e}");
                Turn::Skipped
            }
        };
        self.state = LoopState::Idle;
        turn
    }

    /// Tell the kernel to stop sending events, then release the socket and
    /// the log.
    pub fn shutdown(self) -> Result<(), LogError> {
        let Self {
            mut client, log, ..
        } = self;

        if let Err(e) = client.set_pid(0, AckWait::No) {
            warn!("audit de-registration failed: {e}");
        }
        client.into_socket().close();
        log.close()
    }
}
