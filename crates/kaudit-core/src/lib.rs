//! Kernel audit netlink client and rotating audit log.

pub mod audit_log;
pub mod client;
pub mod config;
pub mod event_loop;
pub mod rule;
pub mod startup;
pub mod transport;
pub mod wire;

#[cfg(test)]
mod testing;

/// Default config file read by `kauditd`.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/kauditd.toml";
