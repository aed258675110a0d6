//! Configuration management for ch-backup.
//!
//! Loads configuration from a YAML file with environment variable overrides
//! (`CH_BACKUP__STORAGE__CREDENTIALS__BUCKET=...`). The result is validated
//! once and then shared read-only by every coordinator.

use crate::utils::errors::{BackupError, Result};
use crate::utils::retry::RetryPolicy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Smallest part size S3 accepts for every part but the last of a multipart upload.
pub const MIN_STORAGE_CHUNK_SIZE: usize = 5 * 1024 * 1024;

/// Default location of the configuration file
pub const DEFAULT_CONFIG_PATH: &str = "/etc/yandex/ch-backup/ch-backup.conf";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub encryption: EncryptionConfig,
    #[serde(default)]
    pub compression: CompressionConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub clickhouse: ClickhouseConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Key prefix for manifests and chunks
    #[serde(default = "default_path_root")]
    pub path_root: String,

    /// Backups older than this are purged (humantime, e.g. "7d")
    #[serde(default)]
    pub retain_time: Option<String>,

    /// Number of newest backups kept by purge
    #[serde(default)]
    pub retain_count: Option<usize>,

    /// A new backup is skipped while the last one is younger than this,
    /// unless forced
    #[serde(default)]
    pub min_interval: Option<String>,

    #[serde(default = "default_true")]
    pub deduplicate_parts: bool,

    #[serde(default)]
    pub validate_part_after_upload: bool,

    /// Replica name substituted into replicated engines on restore
    #[serde(default)]
    pub override_replica_name: Option<String>,

    #[serde(default)]
    pub restore_fail_on_attach_error: bool,

    /// Parallel chunk transfers per operation
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Part files are read and stored in slices of at most this many bytes
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: usize,

    /// Unreferenced chunks younger than this survive garbage collection
    #[serde(default = "default_gc_grace_period")]
    pub gc_grace_period: String,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionType {
    None,
    Nacl,
    Xchacha20poly1305,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionConfig {
    #[serde(rename = "type", default = "default_encryption_type")]
    pub kind: EncryptionType,

    /// 32 raw bytes or 64 hex characters
    #[serde(default)]
    pub key: Option<String>,

    /// Plaintext frame size
    #[serde(default = "default_encryption_chunk_size")]
    pub chunk_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionType {
    None,
    Zstd,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    #[serde(rename = "type", default = "default_compression_type")]
    pub kind: CompressionType,

    /// Compression level (1-22 for zstd)
    #[serde(default = "default_compression_level")]
    pub level: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    S3,
    Local,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(rename = "type", default = "default_storage_type")]
    pub kind: StorageType,

    #[serde(default)]
    pub credentials: StorageCredentials,

    /// Root directory for the `local` backend
    #[serde(default)]
    pub local_path: Option<PathBuf>,

    #[serde(default)]
    pub proxy_resolver: Option<ProxyResolverConfig>,

    /// Multipart threshold and part size in bytes
    #[serde(default = "default_storage_chunk_size")]
    pub chunk_size: usize,

    /// Extra PEM CA files trusted for storage TLS
    #[serde(default)]
    pub ca_bundle: Vec<PathBuf>,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default = "default_storage_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageCredentials {
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub endpoint_url: Option<String>,
    #[serde(default = "default_region")]
    pub region: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyResolverConfig {
    /// Endpoint answering with the proxy host name
    pub uri: String,
    pub proxy_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_interval_ms")]
    pub initial_interval_ms: u64,
    #[serde(default = "default_max_interval_ms")]
    pub max_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClickhouseConfig {
    /// http or https
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub ca_path: Option<PathBuf>,
    #[serde(default)]
    pub insecure: bool,
    #[serde(default = "default_clickhouse_timeout")]
    pub timeout_secs: u64,

    /// Server configuration directory, used to discover the data path
    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,

    #[serde(default)]
    pub data_path: Option<PathBuf>,

    /// Owner applied to restored detached parts
    #[serde(default = "default_owner")]
    pub user_owner: String,
    #[serde(default = "default_owner")]
    pub group_owner: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (text, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default values
fn default_path_root() -> String {
    "ch_backup/".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_concurrency() -> usize {
    8
}

fn default_max_chunk_size() -> usize {
    64 * 1024 * 1024 // 64MB
}

fn default_gc_grace_period() -> String {
    "1h".to_string()
}

fn default_encryption_type() -> EncryptionType {
    EncryptionType::Nacl
}

fn default_encryption_chunk_size() -> usize {
    4 * 1024 * 1024 // 4MB
}

fn default_compression_type() -> CompressionType {
    CompressionType::Zstd
}

fn default_compression_level() -> i32 {
    3
}

fn default_storage_type() -> StorageType {
    StorageType::S3
}

fn default_storage_chunk_size() -> usize {
    8 * 1024 * 1024 // 8MB
}

fn default_storage_timeout() -> u64 {
    60
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_interval_ms() -> u64 {
    500
}

fn default_max_interval_ms() -> u64 {
    5000
}

fn default_protocol() -> String {
    "http".to_string()
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    8123
}

fn default_clickhouse_timeout() -> u64 {
    300
}

fn default_config_dir() -> PathBuf {
    PathBuf::from("/etc/clickhouse-server")
}

fn default_owner() -> String {
    "clickhouse".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            path_root: default_path_root(),
            retain_time: None,
            retain_count: None,
            min_interval: None,
            deduplicate_parts: true,
            validate_part_after_upload: false,
            override_replica_name: None,
            restore_fail_on_attach_error: false,
            max_concurrency: default_max_concurrency(),
            max_chunk_size: default_max_chunk_size(),
            gc_grace_period: default_gc_grace_period(),
            labels: BTreeMap::new(),
        }
    }
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            kind: default_encryption_type(),
            key: None,
            chunk_size: default_encryption_chunk_size(),
        }
    }
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            kind: default_compression_type(),
            level: default_compression_level(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            kind: default_storage_type(),
            credentials: StorageCredentials::default(),
            local_path: None,
            proxy_resolver: None,
            chunk_size: default_storage_chunk_size(),
            ca_bundle: Vec::new(),
            retry: RetryConfig::default(),
            timeout_secs: default_storage_timeout(),
        }
    }
}

impl Default for StorageCredentials {
    fn default() -> Self {
        Self {
            access_key_id: None,
            secret_access_key: None,
            bucket: None,
            endpoint_url: None,
            region: default_region(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_interval_ms: default_initial_interval_ms(),
            max_interval_ms: default_max_interval_ms(),
        }
    }
}

impl Default for ClickhouseConfig {
    fn default() -> Self {
        Self {
            protocol: default_protocol(),
            host: default_host(),
            port: default_port(),
            user: None,
            password: None,
            ca_path: None,
            insecure: false,
            timeout_secs: default_clickhouse_timeout(),
            config_dir: default_config_dir(),
            data_path: None,
            user_owner: default_owner(),
            group_owner: default_owner(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from a file (if given) layered with environment overrides,
    /// then validate it.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            let format = match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => config::FileFormat::Toml,
                Some("json") => config::FileFormat::Json,
                _ => config::FileFormat::Yaml,
            };
            builder = builder.add_source(config::File::from(path).format(format).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("CH_BACKUP")
                .separator("__")
                .try_parsing(true),
        );

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings no operation could run with.
    pub fn validate(&self) -> Result<()> {
        self.backup.retain_time()?;
        self.backup.min_interval()?;
        self.backup.gc_grace_period()?;

        if self.backup.max_concurrency == 0 {
            return Err(BackupError::Configuration(
                "backup.max_concurrency must be at least 1".to_string(),
            ));
        }
        if self.backup.max_chunk_size == 0 {
            return Err(BackupError::Configuration(
                "backup.max_chunk_size must be positive".to_string(),
            ));
        }

        if self.encryption.kind != EncryptionType::None {
            self.encryption.key_bytes()?;
        }
        if self.encryption.chunk_size == 0 {
            return Err(BackupError::Configuration(
                "encryption.chunk_size must be positive".to_string(),
            ));
        }

        if self.storage.chunk_size < MIN_STORAGE_CHUNK_SIZE {
            return Err(BackupError::Configuration(format!(
                "storage.chunk_size {} is below the backend minimum of {} bytes",
                self.storage.chunk_size, MIN_STORAGE_CHUNK_SIZE
            )));
        }

        match self.storage.kind {
            StorageType::S3 => {
                let creds = &self.storage.credentials;
                for (name, value) in [
                    ("bucket", &creds.bucket),
                    ("endpoint_url", &creds.endpoint_url),
                    ("access_key_id", &creds.access_key_id),
                    ("secret_access_key", &creds.secret_access_key),
                ] {
                    if value.as_deref().map_or(true, str::is_empty) {
                        return Err(BackupError::Configuration(format!(
                            "storage.credentials.{name} is required for s3 storage"
                        )));
                    }
                }
            }
            StorageType::Local => {
                if self.storage.local_path.is_none() {
                    return Err(BackupError::Configuration(
                        "storage.local_path is required for local storage".to_string(),
                    ));
                }
            }
            StorageType::Memory => {}
        }

        if !matches!(self.clickhouse.protocol.as_str(), "http" | "https") {
            return Err(BackupError::Configuration(format!(
                "clickhouse.protocol must be http or https, got {}",
                self.clickhouse.protocol
            )));
        }

        Ok(())
    }
}

impl BackupConfig {
    pub fn retain_time(&self) -> Result<Option<Duration>> {
        self.retain_time
            .as_deref()
            .map(|value| parse_duration("backup.retain_time", value))
            .transpose()
    }

    pub fn min_interval(&self) -> Result<Option<Duration>> {
        self.min_interval
            .as_deref()
            .map(|value| parse_duration("backup.min_interval", value))
            .transpose()
    }

    pub fn gc_grace_period(&self) -> Result<Duration> {
        parse_duration("backup.gc_grace_period", &self.gc_grace_period)
    }
}

impl EncryptionConfig {
    /// Decode the configured key into exactly 32 bytes.
    pub fn key_bytes(&self) -> Result<[u8; 32]> {
        let key = self.key.as_deref().ok_or_else(|| {
            BackupError::Configuration("encryption.key is required when encryption is enabled".to_string())
        })?;

        let bytes = if key.len() == 64 && key.chars().all(|c| c.is_ascii_hexdigit()) {
            hex::decode(key).map_err(|e| BackupError::Configuration(format!("encryption.key: {e}")))?
        } else {
            key.as_bytes().to_vec()
        };

        bytes.try_into().map_err(|b: Vec<u8>| {
            BackupError::Configuration(format!(
                "encryption.key must be 32 bytes (or 64 hex characters), got {} bytes",
                b.len()
            ))
        })
    }
}

impl StorageConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            initial_interval: Duration::from_millis(self.retry.initial_interval_ms),
            max_interval: Duration::from_millis(self.retry.max_interval_ms),
        }
    }
}

impl ClickhouseConfig {
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.protocol, self.host, self.port)
    }

    /// Data path from config, else `<path>` from `config_dir/config.xml`,
    /// else the packaged default.
    pub fn resolve_data_path(&self) -> PathBuf {
        if let Some(path) = &self.data_path {
            return path.clone();
        }

        let config_xml = self.config_dir.join("config.xml");
        if let Ok(content) = std::fs::read_to_string(&config_xml) {
            if let Some(path) = data_path_from_server_config(&content) {
                tracing::debug!("Discovered data path {} from {}", path.display(), config_xml.display());
                return path;
            }
        }

        PathBuf::from("/var/lib/clickhouse/")
    }
}

fn data_path_from_server_config(content: &str) -> Option<PathBuf> {
    let re = Regex::new(r"<path>\s*([^<]+?)\s*</path>").ok()?;
    re.captures(content)
        .and_then(|c| c.get(1))
        .map(|m| PathBuf::from(m.as_str()))
}

fn parse_duration(setting: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value)
        .map_err(|e| BackupError::Configuration(format!("{setting}: cannot parse {value:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const KEY: &str = "0123456789abcdef0123456789abcdef";

    fn write_yaml(content: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_load_yaml_config() {
        let file = write_yaml(
            r#"
backup:
  retain_time: 7d
  retain_count: 3
  min_interval: 30m
  max_chunk_size: 1048576
  deduplicate_parts: false
  validate_part_after_upload: true
  override_replica_name: "{replica}"
  restore_fail_on_attach_error: true
encryption:
  type: nacl
  key: "0123456789abcdef0123456789abcdef"
storage:
  type: s3
  credentials:
    access_key_id: AKIA
    secret_access_key: secret
    bucket: dbaas
    endpoint_url: http://minio:9000
  proxy_resolver:
    uri: http://resolver.local/proxy
    proxy_port: 4443
  chunk_size: 5242880
clickhouse:
  config_dir: /etc/clickhouse-server/
"#,
        );

        let config = Config::load(Some(file.path())).unwrap();

        assert_eq!(config.backup.retain_count, Some(3));
        assert_eq!(config.backup.retain_time().unwrap(), Some(Duration::from_secs(7 * 86400)));
        assert_eq!(config.backup.min_interval().unwrap(), Some(Duration::from_secs(1800)));
        assert_eq!(config.backup.max_chunk_size, 1 << 20);
        assert!(!config.backup.deduplicate_parts);
        assert!(config.backup.validate_part_after_upload);
        assert!(config.backup.restore_fail_on_attach_error);
        assert_eq!(config.backup.override_replica_name.as_deref(), Some("{replica}"));
        assert_eq!(config.storage.credentials.bucket.as_deref(), Some("dbaas"));
        assert_eq!(config.storage.proxy_resolver.as_ref().unwrap().proxy_port, 4443);
        assert_eq!(config.encryption.kind, EncryptionType::Nacl);
        assert_eq!(config.compression.kind, CompressionType::Zstd);
    }

    #[test]
    fn test_chunk_size_below_minimum_is_rejected() {
        let mut config = Config::default();
        config.encryption.kind = EncryptionType::None;
        config.storage.kind = StorageType::Memory;
        config.storage.chunk_size = 1024;

        assert!(matches!(config.validate(), Err(BackupError::Configuration(_))));
    }

    #[test]
    fn test_s3_requires_bucket() {
        let mut config = Config::default();
        config.encryption.key = Some(KEY.to_string());

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("bucket"));
    }

    #[test]
    fn test_key_formats() {
        let mut enc = EncryptionConfig::default();

        enc.key = Some(KEY.to_string());
        assert_eq!(&enc.key_bytes().unwrap(), KEY.as_bytes());

        enc.key = Some("ab".repeat(32));
        assert_eq!(enc.key_bytes().unwrap(), [0xab; 32]);

        enc.key = Some("short".to_string());
        assert!(enc.key_bytes().is_err());

        enc.key = None;
        assert!(enc.key_bytes().is_err());
    }

    #[test]
    fn test_bad_retain_time_is_rejected() {
        let mut config = Config::default();
        config.encryption.kind = EncryptionType::None;
        config.storage.kind = StorageType::Memory;
        config.backup.retain_time = Some("forever".to_string());

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_min_interval_and_slice_size_are_checked() {
        let mut config = Config::default();
        config.encryption.kind = EncryptionType::None;
        config.storage.kind = StorageType::Memory;
        assert_eq!(config.backup.min_interval().unwrap(), None);

        config.backup.min_interval = Some("often".to_string());
        assert!(config.validate().unwrap_err().to_string().contains("min_interval"));

        config.backup.min_interval = None;
        config.backup.max_chunk_size = 0;
        assert!(config.validate().unwrap_err().to_string().contains("max_chunk_size"));
    }

    #[test]
    fn test_data_path_discovery() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.xml"),
            "<clickhouse>\n  <tmp_path>/tmp/ch/</tmp_path>\n  <path>/data/clickhouse/</path>\n</clickhouse>\n",
        )
        .unwrap();

        let ch = ClickhouseConfig {
            config_dir: dir.path().to_path_buf(),
            ..ClickhouseConfig::default()
        };
        assert_eq!(ch.resolve_data_path(), PathBuf::from("/data/clickhouse/"));

        let explicit = ClickhouseConfig {
            data_path: Some(PathBuf::from("/srv/ch/")),
            ..ch
        };
        assert_eq!(explicit.resolve_data_path(), PathBuf::from("/srv/ch/"));
    }
}
