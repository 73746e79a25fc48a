//! `mailbridge-host`: the native messaging host launched by the mail client.
//!
//! Speaks framed JSON on stdin/stdout; logs to stderr and the queue's log
//! file. The client appends its own arguments (manifest path, extension id),
//! which are accepted and ignored.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use mailbridge::config::{self, HostConfig, LOG_FILE_NAME};
use mailbridge::{BridgeHost, HostError, LockError, MAILBRIDGE_VERSION};

#[derive(Debug, Parser)]
#[command(name = "mailbridge-host", version, about = "Native messaging host for mailbridge")]
struct Args {
    /// Queue root directory.
    #[arg(long, env = config::QUEUE_DIR_ENV)]
    queue_dir: Option<PathBuf>,

    /// Milliseconds between queue scans.
    #[arg(long)]
    poll_interval_ms: Option<u64>,

    /// Delete results and abandoned processing files older than this.
    #[arg(long)]
    result_retention_secs: Option<u64>,

    /// Log file path [default: <queue-dir>/native_host.log].
    #[arg(long, conflicts_with = "no_log_file")]
    log_file: Option<PathBuf>,

    /// Log to stderr only.
    #[arg(long)]
    no_log_file: bool,

    /// Arguments appended by the mail client.
    #[arg(hide = true, trailing_var_arg = true, allow_hyphen_values = true)]
    client_args: Vec<String>,
}

impl Args {
    fn host_config(&self, queue_root: PathBuf) -> HostConfig {
        let mut config = HostConfig::new(queue_root);
        if let Some(ms) = self.poll_interval_ms.filter(|ms| *ms > 0) {
            config = config.with_poll_interval(Duration::from_millis(ms));
        }
        if let Some(secs) = self.result_retention_secs {
            config = config.with_result_retention(Duration::from_secs(secs));
        }
        config
    }

    fn log_path(&self, queue_root: &std::path::Path) -> Option<PathBuf> {
        if self.no_log_file {
            return None;
        }
        Some(
            self.log_file
                .clone()
                .unwrap_or_else(|| queue_root.join(LOG_FILE_NAME)),
        )
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    let queue_root = config::resolve_queue_root(args.queue_dir.clone());
    mailbridge_cli::init_tracing(args.log_path(&queue_root).as_deref());

    tracing::info!(
        version = MAILBRIDGE_VERSION,
        queue = %queue_root.display(),
        client_args = ?args.client_args,
        "mailbridge-host starting"
    );

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "Failed to start async runtime");
            return ExitCode::FAILURE;
        }
    };

    let outcome = runtime.block_on(run(args.host_config(queue_root)));
    // Reading stdin parks a blocking thread that never returns on its own.
    runtime.shutdown_timeout(Duration::from_millis(200));

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(HostError::Lock(LockError::AlreadyRunning { pid, .. })) => {
            tracing::info!(pid, "Another host is already serving this queue, exiting");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "Host failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: HostConfig) -> Result<(), HostError> {
    let host = BridgeHost::open(config)?;
    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));
    host.run_stdio(shutdown).await
}

async fn cancel_on_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
    shutdown.cancel();
}
