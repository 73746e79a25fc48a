//! Tracing setup shared by the `mailbridge-host` and `mailbridge` binaries.
//!
//! stdout belongs to the framed channel when running as a host, so nothing
//! is ever logged there: logs go to stderr and, optionally, a log file.

use std::fs::{self, File, OpenOptions};
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

/// Level used when neither `RUST_LOG` nor `MAILBRIDGE_LOG` is set.
const DEFAULT_LEVEL: &str = "info";

fn level_from_env() -> &'static str {
    match std::env::var("MAILBRIDGE_LOG").as_deref() {
        Ok("trace") => "trace",
        Ok("debug") => "debug",
        Ok("warn") | Ok("warning") => "warn",
        Ok("error") => "error",
        _ => DEFAULT_LEVEL,
    }
}

fn build_filter() -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        return EnvFilter::from_default_env();
    }

    let filter_str = format!(
        "mailbridge={level},mailbridge_cli={level},mailbridge_host={level}",
        level = level_from_env()
    );
    EnvFilter::new(filter_str)
}

fn open_log_file(path: &Path) -> Option<File> {
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    match OpenOptions::new().create(true).append(true).open(path) {
        Ok(file) => Some(file),
        Err(e) => {
            eprintln!("mailbridge: cannot open log file {}: {e}", path.display());
            None
        }
    }
}

/// Install the global subscriber. `LOG_FORMAT=json` switches every output
/// to JSON lines. Safe to call more than once; later calls are ignored.
pub fn init_tracing(log_file: Option<&Path>) {
    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    if use_json {
        layers.push(fmt::layer().json().with_writer(std::io::stderr).boxed());
    } else {
        layers.push(fmt::layer().with_writer(std::io::stderr).boxed());
    }

    if let Some(file) = log_file.and_then(open_log_file) {
        let writer = Mutex::new(file);
        if use_json {
            layers.push(fmt::layer().json().with_writer(writer).boxed());
        } else {
            layers.push(fmt::layer().with_ansi(false).with_writer(writer).boxed());
        }
    }

    let _ = tracing_subscriber::registry()
        .with(layers)
        .with(build_filter())
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_file_is_created_with_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue").join("native_host.log");

        assert!(open_log_file(&path).is_some());
        assert!(path.exists());
    }

    #[test]
    fn init_twice_does_not_panic() {
        init_tracing(None);
        init_tracing(None);
    }
}
