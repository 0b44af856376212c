//! Client-side endpoint configuration (§4.6, §6).
//!
//! Mirrors the host's `HostConfig`: a plain builder-ish struct rather than a
//! CLI parser — the client is a library, embedded in a host process the
//! caller already configures its own way.

use std::path::PathBuf;
use std::time::Duration;

/// Recommended connect-retry deadline when the client spawned the host child (§4.6, §5).
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
/// Sleep between connect attempts while retrying (§4.6).
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Cpu,
    Gpu,
}

#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    /// Path to the `mlx-host` binary. When set, `connect()` spawns it as a
    /// supervised child; when absent, the client attaches to an
    /// already-running host at `socket_path`.
    pub host_binary: Option<PathBuf>,
    pub socket_path: Option<PathBuf>,
    pub auth_token: Option<String>,
    pub device: Option<Device>,
    pub connect_timeout: Option<Duration>,
    pub retry_interval: Option<Duration>,
}

impl ClientConfig {
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT)
    }

    pub fn retry_interval(&self) -> Duration {
        self.retry_interval.unwrap_or(DEFAULT_RETRY_INTERVAL)
    }

    /// Resolve the socket path, defaulting to `<temp-dir>/mlx-host-<pid>.sock`
    /// when the client itself spawns the host (§6).
    pub fn resolved_socket_path(&self) -> PathBuf {
        self.socket_path.clone().unwrap_or_else(|| default_socket_path(std::process::id()))
    }
}

pub fn default_socket_path(pid: u32) -> PathBuf {
    std::env::temp_dir().join(format!("mlx-host-{pid}.sock"))
}
