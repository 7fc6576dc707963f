use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::types::TransferOptions;

/// Top-level configuration (loaded from ferry.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FerryConfig {
    pub manager: ManagerConfig,
    /// Defaults for every new transfer
    pub transfer: TransferOptions,
    pub crypto: CryptoConfig,
    pub logging: LoggingConfig,
    pub cleanup: CleanupConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Directory holding one JSON state record per transfer
    pub state_dir: PathBuf,
    /// Sessions allowed to transfer at the same time (default: 3)
    pub max_concurrent_transfers: usize,
    /// Backoff unit: a retry waits `base * 2^retry_count` (default: 1000 ms)
    pub retry_base_delay_ms: u64,
    /// Upper bound for a single backoff wait (default: 30 s)
    pub retry_max_delay_ms: u64,
    /// Trailing window for the current-speed estimate (default: 10 s)
    pub progress_window_secs: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("~/.local/share/ferry/state"),
            max_concurrent_transfers: 3,
            retry_base_delay_ms: 1000,
            retry_max_delay_ms: 30_000,
            progress_window_secs: 10,
        }
    }
}

/// Chunk encryption key material
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// File containing a base64-encoded 32-byte transfer key
    pub key_file: Option<PathBuf>,
    /// Argon2id memory cost in KiB for passphrase keys (default: 65536 = 64 MiB)
    pub argon2_mem_cost_kib: u32,
    /// Argon2id time cost (iterations, default: 3)
    pub argon2_time_cost: u32,
    /// Argon2id parallelism (default: 4)
    pub argon2_parallelism: u32,
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            key_file: None,
            argon2_mem_cost_kib: 65536,
            argon2_time_cost: 3,
            argon2_parallelism: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (default: warn, progress bars own the terminal)
    pub log_level: String,
    /// Log format: "json" or "text"
    pub log_format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "warn".into(),
            log_format: "text".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    /// Completed/cancelled sessions older than this are removed by `cleanup`
    pub retention_hours: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self { retention_hours: 24 }
    }
}

/// Expand a leading `~/` using `$HOME`. Other paths are returned unchanged.
pub fn expand_tilde(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join(rest),
            None => {
                tracing::warn!(path = %path.display(), "HOME not set, leaving path unexpanded");
                path.to_path_buf()
            }
        },
        Err(_) => path.to_path_buf(),
    }
}
