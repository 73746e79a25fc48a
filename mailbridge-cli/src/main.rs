//! `mailbridge`: queue emails for the extension and manage the host install.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use mailbridge::config::{self, HOST_NAME};
use mailbridge::manifest::{self, DEFAULT_EXTENSION_ID, ManifestStatus, NativeHostManifest};
use mailbridge::producer::DEFAULT_RESULT_TIMEOUT;
use mailbridge::queue::SweepReport;
use mailbridge::singleton::{is_process_alive, lock_owner};
use mailbridge::{AttachmentRef, EmailPayload, JobProducer, JobStore, ProducerError, VersionInfo};

#[derive(Debug, Parser)]
#[command(name = "mailbridge", version, about = "Send email through the mail-client extension")]
struct Cli {
    /// Queue root directory.
    #[arg(long, global = true, env = config::QUEUE_DIR_ENV)]
    queue_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Queue an email and wait for the extension to report back.
    Send {
        #[arg(long, required = true)]
        to: Vec<String>,
        #[arg(long)]
        cc: Vec<String>,
        #[arg(long)]
        bcc: Vec<String>,
        #[arg(long, default_value = "")]
        subject: String,
        /// HTML body.
        #[arg(long, conflicts_with = "body_file")]
        body: Option<String>,
        /// Read the HTML body from a file.
        #[arg(long)]
        body_file: Option<PathBuf>,
        /// File to attach. Repeatable.
        #[arg(long = "attach")]
        attachments: Vec<PathBuf>,
        #[arg(long, default_value_t = DEFAULT_RESULT_TIMEOUT.as_secs())]
        timeout_secs: u64,
        /// Print the job id and exit without waiting.
        #[arg(long)]
        no_wait: bool,
    },
    /// Show queue counts and whether a host is running.
    Status,
    /// Delete results and abandoned processing files older than the window.
    /// While a host is running only results are swept.
    Sweep {
        #[arg(long)]
        retention_secs: u64,
    },
    /// Register the host executable with the mail client.
    InstallManifest {
        /// Host executable [default: mailbridge-host next to this binary].
        #[arg(long)]
        host_path: Option<PathBuf>,
        #[arg(long, default_value = DEFAULT_EXTENSION_ID)]
        extension_id: String,
        /// Manifest directory [default: the mail client's per-user directory].
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    UninstallManifest {
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    CheckManifest {
        #[arg(long)]
        dir: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    mailbridge_cli::init_tracing(None);

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("error: failed to start async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let queue_root = config::resolve_queue_root(cli.queue_dir);

    match cli.command {
        Command::Send {
            to,
            cc,
            bcc,
            subject,
            body,
            body_file,
            attachments,
            timeout_secs,
            no_wait,
        } => {
            let body_html = match (body, body_file) {
                (Some(body), _) => body,
                (None, Some(path)) => std::fs::read_to_string(&path)
                    .with_context(|| format!("reading body from {}", path.display()))?,
                (None, None) => String::new(),
            };
            let payload = EmailPayload {
                to,
                cc,
                bcc,
                subject,
                body_html,
                attachments: absolute_attachments(attachments)?,
            };
            send(&queue_root, payload, Duration::from_secs(timeout_secs), no_wait).await
        }
        Command::Status => status(&queue_root),
        Command::Sweep { retention_secs } => {
            let store = JobStore::open(&queue_root)?;
            let (report, host_running) = sweep(&store, Duration::from_secs(retention_secs))?;
            println!(
                "removed {} result(s), {} processing file(s)",
                report.results_removed, report.processing_removed
            );
            if host_running {
                println!("host is running; processing files were left alone");
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::InstallManifest {
            host_path,
            extension_id,
            dir,
        } => {
            let host_path = match host_path {
                Some(path) => path,
                None => default_host_path()?,
            };
            let dir = manifest::resolve_dir(dir)?;
            let path = manifest::install(&NativeHostManifest::new(host_path, extension_id), &dir)?;
            println!("installed {}", path.display());
            Ok(ExitCode::SUCCESS)
        }
        Command::UninstallManifest { dir } => {
            let dir = manifest::resolve_dir(dir)?;
            if manifest::uninstall(HOST_NAME, &dir)? {
                println!("removed {}", manifest::manifest_path(&dir, HOST_NAME).display());
            } else {
                println!("no manifest installed in {}", dir.display());
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::CheckManifest { dir } => {
            let dir = manifest::resolve_dir(dir)?;
            Ok(report_manifest(manifest::check(HOST_NAME, &dir)?))
        }
    }
}

async fn send(
    queue_root: &Path,
    payload: EmailPayload,
    timeout: Duration,
    no_wait: bool,
) -> Result<ExitCode> {
    let producer = JobProducer::open(queue_root)?.with_client("mailbridge-cli");
    let id = producer.submit(payload)?;
    if no_wait {
        println!("{id}");
        return Ok(ExitCode::SUCCESS);
    }

    match producer.await_result(&id, timeout).await {
        Ok(result) if result.success => {
            println!("sent ({id})");
            Ok(ExitCode::SUCCESS)
        }
        Ok(result) => {
            let reason = result.error.unwrap_or_else(|| "unknown error".to_string());
            eprintln!("failed ({id}): {reason}");
            Ok(ExitCode::FAILURE)
        }
        Err(ProducerError::Timeout { timeout, .. }) => {
            bail!(
                "no result for job {id} after {}s; is the mail client running with the extension?",
                timeout.as_secs()
            )
        }
        Err(e) => Err(e.into()),
    }
}

/// Only the running host knows which processing files are in flight, so
/// those are skipped while it is alive.
fn sweep(store: &JobStore, retention: Duration) -> Result<(SweepReport, bool)> {
    let host_running = lock_owner(store.root()).is_some_and(is_process_alive);
    let report = if host_running {
        store.sweep_results(retention)?
    } else {
        store.sweep(retention, &Default::default())?
    };
    Ok((report, host_running))
}

fn status(queue_root: &Path) -> Result<ExitCode> {
    let store = JobStore::open(queue_root)?;
    let counts = store.status()?;
    let version = VersionInfo::new();

    println!("mailbridge {} (protocol {})", version.mailbridge, version.protocol);
    println!("queue:      {}", store.root().display());
    println!("pending:    {}", counts.pending);
    println!("processing: {}", counts.processing);
    println!("results:    {}", counts.results);
    match lock_owner(store.root()) {
        Some(pid) if is_process_alive(pid) => println!("host:       running (pid {pid})"),
        Some(pid) => println!("host:       not running (stale lock from pid {pid})"),
        None => println!("host:       not running"),
    }
    Ok(ExitCode::SUCCESS)
}

fn report_manifest(status: ManifestStatus) -> ExitCode {
    match status {
        ManifestStatus::Installed(m) => {
            println!("installed: {} -> {}", m.name, m.path.display());
            ExitCode::SUCCESS
        }
        ManifestStatus::Missing => {
            println!("not installed");
            ExitCode::FAILURE
        }
        ManifestStatus::Invalid(reason) => {
            println!("invalid manifest: {reason}");
            ExitCode::FAILURE
        }
        ManifestStatus::HostMissing(m) => {
            println!("manifest points at missing executable {}", m.path.display());
            ExitCode::FAILURE
        }
    }
}

/// The host resolves attachment paths itself, so relative ones are anchored
/// to the caller's working directory here.
fn absolute_attachments(paths: Vec<PathBuf>) -> Result<Vec<AttachmentRef>> {
    let cwd = std::env::current_dir().context("reading current directory")?;
    paths
        .into_iter()
        .map(|path| {
            let path = if path.is_absolute() { path } else { cwd.join(path) };
            if !path.is_file() {
                bail!("attachment {} does not exist", path.display());
            }
            Ok(AttachmentRef::new(path))
        })
        .collect()
}

fn default_host_path() -> Result<PathBuf> {
    let exe = std::env::current_exe().context("locating current executable")?;
    Ok(exe.with_file_name(format!(
        "mailbridge-host{}",
        std::env::consts::EXE_SUFFIX
    )))
}
