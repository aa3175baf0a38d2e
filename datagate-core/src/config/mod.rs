use std::{num::NonZeroUsize, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::listener::ListenerBuilder;

// Default iouring/epoll entries: 32k
const DEFAULT_ENTRIES: u32 = 32768;
// Max frame size: 16 MB
const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

pub const DEFAULT_HANDSHAKE_TIMEOUT_SECONDS: u64 = 30;
pub const DEFAULT_SESSION_IDLE_SECONDS: u64 = 1800;
pub const DEFAULT_REAP_INTERVAL_SECONDS: u64 = 60;
pub const MIN_SQPOLL_IDLE_TIME: u32 = 1000; // 1s idle time.
pub const FALLBACK_PARALLELISM: NonZeroUsize = unsafe { NonZeroUsize::new_unchecked(1) };

macro_rules! define_const {
    ($name: ident, $val: expr, $type: ty) => {
        const fn $name() -> $type {
            $val
        }
    };
}

/// Runtime settings shared by the I/O threads and the worker pool threads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Number of I/O threads, each owning a listener and its connections.
    #[serde(default = "default_workers")]
    pub worker_threads: usize,
    #[serde(default = "default_entries")]
    pub entries: u32,
    pub sqpoll_idle: Option<u32>,
    #[serde(default)]
    pub runtime_type: RuntimeType,
    #[serde(default = "default_cpu_affinity")]
    pub cpu_affinity: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            worker_threads: default_workers(),
            entries: default_entries(),
            sqpoll_idle: None,
            runtime_type: Default::default(),
            cpu_affinity: default_cpu_affinity(),
        }
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .unwrap_or(FALLBACK_PARALLELISM)
        .into()
}

define_const!(default_entries, DEFAULT_ENTRIES, u32);
define_const!(default_cpu_affinity, false, bool);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeType {
    #[cfg(target_os = "linux")]
    IoUring,
    Legacy,
}

impl Default for RuntimeType {
    #[cfg(target_os = "linux")]
    fn default() -> Self {
        Self::IoUring
    }
    #[cfg(not(target_os = "linux"))]
    fn default() -> Self {
        Self::Legacy
    }
}

/// Invocation worker pool sizing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PoolConfig {
    /// Maximum number of invocations running at the same time.
    #[serde(default = "default_workers")]
    pub worker_threads: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_threads: default_workers(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ListenerConfig {
    Socket(std::net::SocketAddr),
    Unix(PathBuf),
}

impl TryFrom<ListenerConfig> for ListenerBuilder {
    type Error = std::io::Error;

    fn try_from(value: ListenerConfig) -> Result<Self, Self::Error> {
        match value {
            ListenerConfig::Socket(addr) => ListenerBuilder::bind_tcp(addr, Default::default()),
            ListenerConfig::Unix(addr) => ListenerBuilder::bind_unix(addr),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransportConfig {
    pub listener: ListenerConfig,
    // Negotiate payload encryption during the handshake.
    #[serde(default = "default_encryption")]
    pub encryption: bool,
    // Time allowed for the client to answer the server handshake.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_sec: u64,
    // Close the connection if no frame arrives within this time.
    pub keepalive_timeout_sec: Option<u64>,
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
}

define_const!(default_encryption, true, bool);
define_const!(
    default_handshake_timeout,
    DEFAULT_HANDSHAKE_TIMEOUT_SECONDS,
    u64
);
define_const!(default_max_frame_size, DEFAULT_MAX_FRAME_SIZE, usize);

impl TransportConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_sec)
    }

    pub fn keepalive_timeout(&self) -> Option<Duration> {
        self.keepalive_timeout_sec.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionConfig {
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_sec: u64,
    #[serde(default = "default_reap_interval")]
    pub reap_interval_sec: u64,
    #[serde(default = "default_product_name")]
    pub product_name: String,
    #[serde(default = "default_product_version")]
    pub product_version: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_sec: default_idle_timeout(),
            reap_interval_sec: default_reap_interval(),
            product_name: default_product_name(),
            product_version: default_product_version(),
        }
    }
}

define_const!(default_idle_timeout, DEFAULT_SESSION_IDLE_SECONDS, u64);
define_const!(default_reap_interval, DEFAULT_REAP_INTERVAL_SECONDS, u64);

fn default_product_name() -> String {
    "datagate".to_string()
}

fn default_product_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

impl SessionConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_sec)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_sec.max(1))
    }
}
