//! CLI arguments and server configuration defaults.

use clap::Parser;
use std::time::Duration;

use crate::archive::{ArchiveConfig, ExtractLimits};

pub const DEFAULT_AUTH_USER: &str = "axo";
pub const DEFAULT_AUTH_PASS: &str = "axo";
pub const DEFAULT_UPLOAD_TTL_SECS: u64 = 180;
pub const DEFAULT_UPLOAD_SWEEP_SECS: u64 = 15;
pub const DEFAULT_MAX_ARCHIVE_SIZE: u64 = 1024 * 1024 * 1024;
pub const DEFAULT_MAX_ARCHIVE_ENTRIES: usize = 10_000;
pub const DEFAULT_MAX_TOTAL_UNCOMPRESSED: u64 = 10 * 1024 * 1024 * 1024;
pub const DEFAULT_MAX_ENTRY_UNCOMPRESSED: u64 = 2 * 1024 * 1024 * 1024;
pub const DEFAULT_MIN_COMPRESSION_RATIO: f64 = 0.001;
pub const LOCK_PRUNE_INTERVAL_SECS: u64 = 300;

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "axo-transfer", version, about = "AxoTransfer file transfer server")]
pub struct Args {
    #[arg(
        short = 's',
        long,
        env = "AXO_STORAGE_DIR",
        default_value = ".axo/storage",
        help = "Storage directory for files"
    )]
    pub storage_dir: String,
    #[arg(
        short = 'u',
        long,
        env = "AXO_USERS_FILE",
        help = "JSON file with users, permissions and global rules"
    )]
    pub users_file: Option<String>,
    #[arg(
        long,
        env = "AXO_AUTH_USER",
        default_value = DEFAULT_AUTH_USER,
        help = "Auth username when no users file is given"
    )]
    pub auth_user: String,
    #[arg(
        long,
        env = "AXO_AUTH_PASS",
        default_value = DEFAULT_AUTH_PASS,
        help = "Auth password when no users file is given"
    )]
    pub auth_pass: String,
    #[arg(
        short = 'b',
        long = "bind",
        env = "AXO_BIND",
        default_value = "0.0.0.0",
        help = "Bind address for HTTP/HTTPS"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "AXO_HTTP_PORT",
        default_value_t = 5005,
        help = "HTTP port"
    )]
    pub http_port: u16,
    #[arg(
        short = 'P',
        long,
        env = "AXO_HTTPS_PORT",
        default_value_t = 5006,
        help = "HTTPS port (only used with --tls-cert and --tls-key)"
    )]
    pub https_port: u16,
    #[arg(short = 'c', long, env = "AXO_TLS_CERT", help = "TLS cert path")]
    pub tls_cert: Option<String>,
    #[arg(short = 'k', long, env = "AXO_TLS_KEY", help = "TLS key path")]
    pub tls_key: Option<String>,
    #[arg(long, env = "AXO_CORS_ORIGINS", help = "Comma separated CORS origins")]
    pub cors_origins: Option<String>,
    #[arg(
        long,
        env = "AXO_UPLOAD_TTL_SECS",
        default_value_t = DEFAULT_UPLOAD_TTL_SECS,
        help = "Idle time before an unfinished upload expires"
    )]
    pub upload_ttl_secs: u64,
    #[arg(
        long,
        env = "AXO_UPLOAD_SWEEP_SECS",
        default_value_t = DEFAULT_UPLOAD_SWEEP_SECS,
        help = "Sweep interval of the in-memory upload registry"
    )]
    pub upload_sweep_secs: u64,
    #[arg(
        long,
        env = "AXO_REDIS_URL",
        help = "Redis URL for a registry shared between instances"
    )]
    pub redis_url: Option<String>,
    #[arg(
        long,
        env = "AXO_UNZIP_ENABLED",
        default_value_t = false,
        help = "Allow extracting archives on the server"
    )]
    pub unzip_enabled: bool,
    #[arg(
        long,
        env = "AXO_MAX_ARCHIVE_SIZE",
        default_value_t = DEFAULT_MAX_ARCHIVE_SIZE,
        help = "Max archive file size accepted for extraction, in bytes"
    )]
    pub max_archive_size: u64,
    #[arg(
        long,
        env = "AXO_MAX_ARCHIVE_ENTRIES",
        default_value_t = DEFAULT_MAX_ARCHIVE_ENTRIES,
        help = "Max number of entries in an extracted archive"
    )]
    pub max_archive_entries: usize,
    #[arg(
        long,
        env = "AXO_MAX_TOTAL_UNCOMPRESSED",
        default_value_t = DEFAULT_MAX_TOTAL_UNCOMPRESSED,
        help = "Max total uncompressed size of an extracted archive, in bytes"
    )]
    pub max_total_uncompressed: u64,
    #[arg(
        long,
        env = "AXO_MAX_ENTRY_UNCOMPRESSED",
        default_value_t = DEFAULT_MAX_ENTRY_UNCOMPRESSED,
        help = "Max uncompressed size of a single archive entry, in bytes"
    )]
    pub max_entry_uncompressed: u64,
    #[arg(
        long,
        env = "AXO_MIN_COMPRESSION_RATIO",
        default_value_t = DEFAULT_MIN_COMPRESSION_RATIO,
        help = "Min compressed/uncompressed ratio of an archive entry"
    )]
    pub min_compression_ratio: f64,
}

impl Args {
    pub fn upload_ttl(&self) -> Duration {
        Duration::from_secs(self.upload_ttl_secs.max(1))
    }

    pub fn upload_sweep(&self) -> Duration {
        Duration::from_secs(self.upload_sweep_secs.max(1))
    }

    pub fn archive_config(&self) -> ArchiveConfig {
        ArchiveConfig {
            unzip_enabled: self.unzip_enabled,
            limits: ExtractLimits {
                max_archive_size: self.max_archive_size,
                max_entries: self.max_archive_entries,
                max_total_uncompressed: self.max_total_uncompressed,
                max_entry_uncompressed: self.max_entry_uncompressed,
                min_compression_ratio: self.min_compression_ratio,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_limits() {
        let args = Args::parse_from(["axo-transfer"]);
        assert_eq!(args.upload_ttl(), Duration::from_secs(180));
        assert_eq!(args.upload_sweep(), Duration::from_secs(15));
        assert!(args.redis_url.is_none());

        let config = args.archive_config();
        assert!(!config.unzip_enabled);
        assert_eq!(config.limits.max_entries, 10_000);
        assert_eq!(config.limits.max_archive_size, 1 << 30);
    }

    #[test]
    fn flags_override_limits() {
        let args = Args::parse_from([
            "axo-transfer",
            "--unzip-enabled",
            "--max-archive-entries",
            "5",
            "--min-compression-ratio",
            "0.05",
            "--bind",
            "127.0.0.1",
        ]);
        let config = args.archive_config();
        assert!(config.unzip_enabled);
        assert_eq!(config.limits.max_entries, 5);
        assert_eq!(config.limits.min_compression_ratio, 0.05);
        assert_eq!(args.host, "127.0.0.1");
    }
}
