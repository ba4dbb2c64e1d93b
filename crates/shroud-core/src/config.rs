use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{ShroudError, ShroudResult};

/// Top-level configuration (loaded from shroud.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ShroudConfig {
    pub storage: StorageConfig,
    pub sync: SyncConfig,
    pub crypto: CryptoConfig,
    pub log: LogConfig,
}

impl ShroudConfig {
    /// Load a config file, falling back to defaults when it does not exist.
    pub fn load(path: &Path) -> ShroudResult<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let content =
            std::fs::read_to_string(path).map_err(|e| ShroudError::local_io(path, e))?;
        toml::from_str(&content)
            .map_err(|e| ShroudError::Config(format!("parsing {}: {e}", path.display())))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// S3-compatible endpoint
    pub endpoint: String,
    /// S3 region (default: us-east-1)
    pub region: String,
    /// Bucket holding the mirrored tree
    pub bucket: String,
    /// Refuse plaintext HTTP endpoints
    pub enforce_tls: bool,
    /// Part size for multipart uploads, in bytes
    pub multipart_chunk_size: usize,
    /// Parts uploaded concurrently per large file
    pub multipart_concurrency: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Local directory to mirror (overridden by the CLI path argument)
    pub root: Option<PathBuf>,
    /// Upload worker count
    pub workers: usize,
    /// Delete remote objects with no live local counterpart
    pub delete_orphans: bool,
    /// Do not upload namefile-only changes (renames, touches)
    pub skip_renames: bool,
    /// Encrypted size above which the multipart path is used
    pub large_file_threshold: u64,
    /// Plaintext bytes per encrypted stream frame
    pub stream_chunk_size: usize,
    /// Where ciphertext is staged before upload (default: system temp dir)
    pub staging_dir: Option<PathBuf>,
    /// Glob patterns (matched against file names) to exclude
    pub exclude_patterns: Vec<String>,
    /// Whether to descend into dot-directories and include dotfiles
    pub include_hidden: bool,
    /// Log a progress line every N scanned files
    pub progress_interval: u64,
}

/// Argon2id parameters for sealing the keyfile
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// Argon2id memory cost in KiB (default: 65536 = 64 MiB)
    pub argon2_mem_cost_kib: u32,
    /// Argon2id time cost (iterations, default: 3)
    pub argon2_time_cost: u32,
    /// Argon2id parallelism (default: 4)
    pub argon2_parallelism: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://s3.us-east-1.amazonaws.com".into(),
            region: "us-east-1".into(),
            bucket: "shroud".into(),
            enforce_tls: true,
            multipart_chunk_size: 64 * 1024 * 1024,
            multipart_concurrency: 4,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            root: None,
            workers: 2,
            delete_orphans: false,
            skip_renames: false,
            large_file_threshold: 500_000_000,
            stream_chunk_size: 500_000_000,
            staging_dir: None,
            exclude_patterns: Vec::new(),
            include_hidden: true,
            progress_interval: 1000,
        }
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            argon2_mem_cost_kib: 65536,
            argon2_time_cost: 3,
            argon2_parallelism: 4,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
[storage]
endpoint = "https://s3.example.com:8333"
region = "eu-west-1"
bucket = "family-photos"
enforce_tls = true
multipart_chunk_size = 16777216

[sync]
root = "/srv/photos"
workers = 8
delete_orphans = true
skip_renames = true
large_file_threshold = 1000000
exclude_patterns = ["*.tmp", "Thumbs.db"]
include_hidden = false

[crypto]
argon2_mem_cost_kib = 131072
argon2_time_cost = 4
argon2_parallelism = 8

[log]
level = "debug"
format = "json"
"#;
        let config: ShroudConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(config.storage.endpoint, "https://s3.example.com:8333");
        assert_eq!(config.storage.bucket, "family-photos");
        assert_eq!(config.storage.multipart_chunk_size, 16_777_216);
        assert_eq!(config.sync.root, Some(PathBuf::from("/srv/photos")));
        assert_eq!(config.sync.workers, 8);
        assert!(config.sync.delete_orphans);
        assert!(config.sync.skip_renames);
        assert_eq!(config.sync.large_file_threshold, 1_000_000);
        assert_eq!(config.sync.exclude_patterns.len(), 2);
        assert!(!config.sync.include_hidden);
        assert_eq!(config.crypto.argon2_mem_cost_kib, 131072);
        assert_eq!(config.log.format, "json");
    }

    #[test]
    fn test_parse_defaults() {
        let config: ShroudConfig = toml::from_str("").unwrap();

        assert_eq!(config.storage.region, "us-east-1");
        assert!(config.storage.enforce_tls);
        assert_eq!(config.sync.workers, 2);
        assert!(!config.sync.delete_orphans);
        assert!(!config.sync.skip_renames);
        assert_eq!(config.sync.large_file_threshold, 500_000_000);
        assert_eq!(config.sync.stream_chunk_size, 500_000_000);
        assert_eq!(config.sync.progress_interval, 1000);
        assert_eq!(config.crypto.argon2_time_cost, 3);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_parse_partial_config() {
        let toml_str = r#"
[sync]
workers = 4
"#;
        let config: ShroudConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(config.sync.workers, 4);
        assert!(config.sync.include_hidden);
        assert_eq!(config.storage.bucket, "shroud");
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ShroudConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.sync.workers, 2);
    }

    #[test]
    fn test_load_invalid_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "[sync\nworkers = ").unwrap();

        let err = ShroudConfig::load(&path).unwrap_err();
        assert!(matches!(err, ShroudError::Config(_)), "got: {err:?}");
    }

    #[test]
    fn test_serialize_roundtrip() {
        let config = ShroudConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: ShroudConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.storage.endpoint, parsed.storage.endpoint);
        assert_eq!(config.sync.large_file_threshold, parsed.sync.large_file_threshold);
    }
}
