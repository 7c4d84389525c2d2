use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use clap::Parser;
use kaudit_core::audit_log::{AuditLog, LogError};
use kaudit_core::client::AuditClient;
use kaudit_core::config::{ConfigError, DaemonConfig, load_config_file, validate};
use kaudit_core::event_loop::EventLoop;
use kaudit_core::startup::configure_kernel;
use kaudit_core::transport::{AuditSocket, NetlinkSocket, TransportError};
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "kauditd", version, about = "Kernel audit event collector")]
struct Cli {
    /// Config file (missing file means defaults).
    #[arg(long, default_value = kaudit_core::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Active log file.
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Where the previous log generation is kept.
    #[arg(long)]
    rotated_file: Option<PathBuf>,

    /// Rotate once the active log exceeds this many bytes.
    #[arg(long)]
    max_bytes: Option<u64>,
}

#[derive(Debug, thiserror::Error)]
enum DaemonError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("could not register signal handler: {0}")]
    Signal(#[source] std::io::Error),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Log(#[from] LogError),
}

impl DaemonError {
    /// Process exit status: the OS error behind the failure, else 1.
    fn exit_code(&self) -> i32 {
        let code = match self {
            Self::Config(ConfigError::Read { source, .. }) => source.raw_os_error(),
            Self::Config(_) => None,
            Self::Signal(e) => e.raw_os_error(),
            Self::Transport(e) => e.raw_os_error(),
            Self::Log(e) => e.raw_os_error(),
        };
        code.filter(|&c| c > 0).unwrap_or(1)
    }
}

fn main() {
    init_tracing();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("kauditd: {e}");
        std::process::exit(e.exit_code());
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_config(cli: &Cli) -> Result<DaemonConfig, ConfigError> {
    let mut config = load_config_file(&cli.config)?;
    if let Some(path) = &cli.log_file {
        config.log.path = path.clone();
    }
    if let Some(path) = &cli.rotated_file {
        config.log.rotated_path = path.clone();
    }
    if let Some(max_bytes) = cli.max_bytes {
        config.log.max_bytes = max_bytes;
    }
    validate(&config)?;
    Ok(config)
}

fn run(cli: Cli) -> Result<(), DaemonError> {
    let config = load_config(&cli)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register(signal, Arc::clone(&shutdown)).map_err(DaemonError::Signal)?;
    }

    let socket = AuditSocket::open()?;
    let log = AuditLog::open(
        &config.log.path,
        &config.log.rotated_path,
        config.log.max_bytes,
    )?;

    // Watches and the audit state go in before registration, while the
    // socket still carries only acks.
    let mut client = AuditClient::new(socket);
    if let Err(e) = configure_kernel(&mut client, &config, std::process::id()) {
        // Registration failed, so there is nothing to undo in the kernel.
        client.into_socket().close();
        if let Err(close_err) = log.close() {
            warn!("closing audit log: {close_err}");
        }
        return Err(e.into());
    }

    let mut event_loop = EventLoop::new(client, log);
    event_loop.run(&shutdown);
    event_loop.shutdown()?;

    info!("kauditd stopped");
    Ok(())
}
