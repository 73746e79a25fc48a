//! Runtime settings for the host, the producer and the socket channel.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

/// Overrides the queue root for every component.
pub const QUEUE_DIR_ENV: &str = "TB_QUEUE_DIR";
/// Host poll interval in milliseconds.
pub const POLL_INTERVAL_ENV: &str = "MAILBRIDGE_POLL_INTERVAL_MS";

/// Native messaging host name registered with the mail client.
pub const HOST_NAME: &str = "com.emailautomation.tbhost";
/// Log file the host writes next to the queue.
pub const LOG_FILE_NAME: &str = "native_host.log";

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Queue root: `explicit`, then `TB_QUEUE_DIR`, then the platform default.
pub fn resolve_queue_root(explicit: Option<PathBuf>) -> PathBuf {
    explicit
        .or_else(|| {
            std::env::var_os(QUEUE_DIR_ENV)
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
        })
        .unwrap_or_else(default_queue_root)
}

/// Platform data directory plus an app-specific suffix, or `./tb_queue` when
/// the platform has no data directory.
pub fn default_queue_root() -> PathBuf {
    let suffix = if cfg!(any(windows, target_os = "macos")) {
        ["EmailAutomation", "tb_queue"]
    } else {
        ["email_automation", "tb_queue"]
    };
    match dirs::data_dir() {
        Some(base) => base.join(suffix[0]).join(suffix[1]),
        None => PathBuf::from("tb_queue"),
    }
}

fn env_millis(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
}

/// Settings for [`crate::host::BridgeHost`].
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub queue_root: PathBuf,
    /// Delay between scan cycles.
    pub poll_interval: Duration,
    /// Pause after a failed frame read.
    pub read_retry_delay: Duration,
    /// Longer pause once `max_read_failures` consecutive reads failed.
    pub read_backoff: Duration,
    pub max_read_failures: u32,
    /// Age after which results and abandoned processing files are deleted.
    /// `None` disables the sweep.
    pub result_retention: Option<Duration>,
    pub sweep_interval: Duration,
}

impl HostConfig {
    pub fn new(queue_root: impl Into<PathBuf>) -> Self {
        Self {
            queue_root: queue_root.into(),
            poll_interval: env_millis(POLL_INTERVAL_ENV).unwrap_or(DEFAULT_POLL_INTERVAL),
            read_retry_delay: Duration::from_millis(50),
            read_backoff: Duration::from_secs(1),
            max_read_failures: 100,
            result_retention: None,
            sweep_interval: Duration::from_secs(60),
        }
    }

    /// Config for the queue root resolved from the environment.
    pub fn from_env() -> Self {
        Self::new(resolve_queue_root(None))
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_read_backoff(mut self, retry_delay: Duration, backoff: Duration) -> Self {
        self.read_retry_delay = retry_delay;
        self.read_backoff = backoff;
        self
    }

    pub fn with_result_retention(mut self, retention: Duration) -> Self {
        self.result_retention = Some(retention);
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

/// Settings for [`crate::channel::ExtensionChannel`].
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub host: IpAddr,
    pub preferred_port: u16,
    /// Ports tried, starting at `preferred_port`.
    pub max_attempts: u16,
    pub request_timeout: Duration,
    /// Sending can involve SMTP round trips, so it gets longer.
    pub send_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            preferred_port: 8765,
            max_attempts: 10,
            request_timeout: Duration::from_secs(30),
            send_timeout: Duration::from_secs(60),
        }
    }
}

impl ChannelConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.preferred_port = port;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u16) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }
}
