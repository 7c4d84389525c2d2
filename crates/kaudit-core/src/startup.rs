//! Bringing the kernel side up before the event loop starts.

use tracing::{error, info};

use crate::client::{AckWait, AuditClient};
use crate::config::DaemonConfig;
use crate::transport::{NetlinkSocket, TransportError};

/// Watches handled by [`configure_kernel`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StartupReport {
    pub watches_installed: usize,
    pub watches_failed: usize,
}

/// Install the configured watches, apply the configured audit state, then
/// register `pid` as the event consumer.
///
/// Registration has to come last. Until then the kernel queues nothing but
/// acks on this socket, so each ack wait sees the answer to its own request.
/// A rejected watch or state change is logged and startup continues; only a
/// failed registration is returned.
pub fn configure_kernel<S: NetlinkSocket>(
    client: &mut AuditClient<S>,
    config: &DaemonConfig,
    pid: u32,
) -> Result<StartupReport, TransportError> {
    let mut report = StartupReport::default();

    for watch in &config.watch {
        let installed = match watch.build_rule() {
            Ok(rule) => match client.add_rule(rule) {
                Ok(_) => true,
                Err(e) => {
                    error!(path = %watch.path.display(), "could not install audit watch: {e}");
                    false
                }
            },
            Err(e) => {
                error!(path = %watch.path.display(), "skipping audit watch: {e}");
                false
            }
        };
        if installed {
            info!(path = %watch.path.display(), "audit watch installed");
            report.watches_installed += 1;
        } else {
            report.watches_failed += 1;
        }
    }

    if let Some(state) = config.enabled_state() {
        match client.set_enabled(state) {
            Ok(_) => info!(?state, "audit state set"),
            Err(e) => error!(?state, "could not set audit state: {e}"),
        }
    }

    client.set_pid(pid, AckWait::Yes)?;
    info!(
        pid,
        installed = report.watches_installed,
        failed = report.watches_failed,
        "registered as audit event consumer"
    );
    Ok(report)
}
