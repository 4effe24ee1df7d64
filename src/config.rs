use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::net::{Ipv6Addr, SocketAddr};
use std::path::PathBuf;

use crate::error::{Result, TftpError};

/// Write operation configuration for TFTP
///
/// NIST 800-53 Controls:
/// - AC-3: Access Enforcement (restrict write access)
/// - AC-6: Least Privilege (minimal write permissions)
/// - CM-5: Access Restrictions for Change (control file modifications)
///
/// STIG V-222602: Applications must enforce access restrictions
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct WriteConfig {
    /// Enable write operations (disabled by default for security)
    pub enabled: bool,

    /// Allow overwriting existing files
    /// When false, returns "File already exists" error per RFC 1350
    pub allow_overwrite: bool,

    /// List of glob patterns that are allowed to be written
    /// Examples: ["*.txt", "configs/*.cfg", "firmware/device-*.bin"]
    /// Empty list means no writes are allowed
    pub allowed_patterns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TftpConfig {
    pub root_dir: PathBuf,
    pub bind_addr: SocketAddr,
    pub logging: LoggingConfig,
    pub write_config: WriteConfig,
    pub performance: PerformanceConfig,
    /// Maximum file size in bytes that can be served (default: 100MB)
    /// Set to 0 for unlimited (not recommended for security)
    pub max_file_size_bytes: u64,
}

impl Default for TftpConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("/var/lib/tftpd/root"),
            bind_addr: SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 69),
            logging: LoggingConfig::default(),
            write_config: WriteConfig::default(),
            performance: PerformanceConfig::default(),
            max_file_size_bytes: 104_857_600, // 100 MB default
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub file: Option<PathBuf>,
    /// Enable structured audit logging for SIEM integration
    /// When enabled, all security-relevant events are logged as structured JSON
    pub audit_enabled: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
            file: Some(PathBuf::from("/var/log/tftpd/audit.json")),
            audit_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Plain text logging for human readability
    Text,
    /// JSON structured logging for SIEM integration
    /// All log entries are formatted as JSON for easy parsing by log aggregators
    Json,
}

/// Load a [`TftpConfig`] from a TOML file. The shipped `tftpd` binary does
/// not read one itself (its CLI flags are the whole configuration surface)
/// but this remains available to embedders that want file-based config.
pub fn load_config(path: &std::path::Path) -> Result<TftpConfig> {
    let contents = std::fs::read_to_string(path)?;
    let config: TftpConfig = toml::from_str(&contents)
        .map_err(|e| TftpError::Config(format!("invalid config file {}: {}", path.display(), e)))?;
    Ok(config)
}

pub fn write_default_config(path: &std::path::Path) -> Result<()> {
    write_config(path, &TftpConfig::default())
}

pub fn write_config(path: &std::path::Path, config: &TftpConfig) -> Result<()> {
    let contents = toml::to_string_pretty(config)
        .map_err(|e| TftpError::Config(format!("failed to serialize config: {}", e)))?;
    std::fs::write(path, contents)?;
    Ok(())
}

/// Validate TFTP configuration for security and correctness
///
/// NIST 800-53 Controls:
/// - CM-6: Configuration Settings (validate all configuration parameters)
/// - AC-3: Access Enforcement (validate directory permissions)
/// - SC-7: Boundary Protection (validate network bindings)
///
/// STIG V-222564: Applications must protect configuration data
/// STIG V-222566: Applications must validate configuration parameters
/// STIG V-222602: Applications must enforce access restrictions
pub fn validate_config(config: &TftpConfig, validate_bind: bool) -> Result<()> {
    if !config.root_dir.is_absolute() {
        return Err(TftpError::Config(
            "root_dir must be an absolute path".to_string(),
        ));
    }

    match std::fs::metadata(&config.root_dir) {
        Ok(meta) => {
            if !meta.is_dir() {
                return Err(TftpError::Config("root_dir must be a directory".to_string()));
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(TftpError::Config(
                "root_dir does not exist; create it or adjust config".to_string(),
            ));
        }
        Err(e) => return Err(TftpError::Io(e)),
    }

    if let Err(e) = std::fs::read_dir(&config.root_dir) {
        return Err(TftpError::Config(format!("root_dir is not readable: {}", e)));
    }

    if config.bind_addr.port() == 0 {
        return Err(TftpError::Config(
            "bind_addr port must be non-zero".to_string(),
        ));
    }

    if validate_bind {
        if let Err(e) = std::net::UdpSocket::bind(config.bind_addr) {
            return Err(TftpError::Config(format!("bind_addr is not available: {}", e)));
        }
    }

    if let Some(ref log_file) = config.logging.file {
        let parent = log_file.parent().ok_or_else(|| {
            TftpError::Config("logging.file must include a parent directory".to_string())
        })?;
        match std::fs::metadata(parent) {
            Ok(meta) => {
                if !meta.is_dir() {
                    return Err(TftpError::Config(
                        "logging.file parent must be a directory".to_string(),
                    ));
                }
            }
            Err(e) => return Err(TftpError::Config(format!("logging.file parent error: {}", e))),
        }
        let _ = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .map_err(|e| TftpError::Config(format!("logging.file not writable: {}", e)))?;
    }

    validate_write_config(&config.write_config)?;
    Ok(())
}

pub fn validate_write_config(config: &WriteConfig) -> Result<()> {
    // NIST AC-3: If writes are enabled, require at least one allowed pattern
    // STIG V-222602: Enforce explicit access restrictions
    if config.enabled && config.allowed_patterns.is_empty() {
        return Err(TftpError::Config(
            "write operations enabled but no allowed_patterns specified. \
            Add patterns to allowed_patterns or disable writes."
                .to_string(),
        ));
    }

    for pattern in &config.allowed_patterns {
        if pattern.trim().is_empty() {
            return Err(TftpError::Config(
                "write allowed_patterns cannot contain empty patterns".to_string(),
            ));
        }

        if pattern == "*" || pattern == "**" || pattern == "**/*" {
            return Err(TftpError::Config(format!(
                "write pattern '{}' is too permissive; use specific patterns like '*.txt' or 'subdir/*.cfg'",
                pattern
            )));
        }
    }

    Ok(())
}

/// Performance tuning configuration
///
/// These settings control performance optimizations for high-throughput scenarios
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    /// Default block size for transfers (bytes)
    /// RFC 1350 standard is 512, but larger sizes improve throughput
    /// Valid range: 512-65464
    pub default_block_size: usize,

    /// Default window size for RFC 7440 sliding window (blocks)
    /// RFC 7440: valid range 1-65535, default 1 for RFC 1350 compatibility
    pub default_windowsize: usize,

    /// Platform-specific performance optimizations (Linux/BSD)
    pub platform: PlatformPerformanceConfig,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            default_block_size: 512,
            default_windowsize: 1,
            platform: PlatformPerformanceConfig::default(),
        }
    }
}

/// Platform-specific performance optimizations for Linux/BSD systems.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PlatformPerformanceConfig {
    /// Socket-level optimizations
    pub socket: SocketConfig,

    /// File I/O optimization hints
    pub file_io: FileIoConfig,
}

/// Socket-level performance configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    /// Receive buffer size in KB (SO_RCVBUF)
    pub recv_buffer_kb: usize,

    /// Send buffer size in KB (SO_SNDBUF)
    pub send_buffer_kb: usize,

    /// Enable SO_REUSEADDR for faster restarts
    pub reuse_address: bool,

    /// Enable SO_REUSEPORT for multi-process scaling (Linux 3.9+, BSD)
    pub reuse_port: bool,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            recv_buffer_kb: 2048,
            send_buffer_kb: 2048,
            reuse_address: true,
            reuse_port: true,
        }
    }
}

/// File I/O optimization configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileIoConfig {
    /// Use POSIX_FADV_SEQUENTIAL hint for sequential file reads
    pub use_sequential_hint: bool,

    /// Use POSIX_FADV_WILLNEED to prefetch file data
    pub use_willneed_hint: bool,

    /// Use POSIX_FADV_DONTNEED after transfer to free page cache
    pub fadvise_dontneed_after: bool,
}

impl Default for FileIoConfig {
    fn default() -> Self {
        Self {
            use_sequential_hint: true,
            use_willneed_hint: true,
            fadvise_dontneed_after: false,
        }
    }
}

#[cfg(test)]
#[allow(clippy::field_reassign_with_default)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> std::io::Result<PathBuf> {
        let mut dir = std::env::temp_dir();
        dir.push(format!("tftpd_config_test_{}_{}", name, uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    #[test]
    fn parses_minimal_toml() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let root_dir = temp_dir("parse")?;
        let log_dir = temp_dir("parse_log")?;
        let toml = format!(
            r#"
root_dir = "{}"
bind_addr = "127.0.0.1:6969"

[logging]
file = "{}/tftp.log"
"#,
            root_dir.display(),
            log_dir.display()
        );
        let config: TftpConfig = toml::from_str(&toml)?;
        validate_config(&config, false)?;
        Ok(())
    }

    #[test]
    fn rejects_non_absolute_root_dir() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let log_dir = temp_dir("non_abs_log")?;
        let config = TftpConfig {
            root_dir: PathBuf::from("relative/path"),
            logging: LoggingConfig {
                file: Some(log_dir.join("tftp.log")),
                ..Default::default()
            },
            ..Default::default()
        };
        match validate_config(&config, false) {
            Ok(()) => return Err("expected error for relative root_dir".into()),
            Err(err) => {
                assert!(format!("{err}").contains("root_dir must be an absolute path"));
            }
        }
        Ok(())
    }

    #[test]
    fn rejects_unreadable_root_dir() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let log_dir = temp_dir("unreadable_log")?;
        let config = TftpConfig {
            root_dir: PathBuf::from("/nonexistent/tftpd-root"),
            logging: LoggingConfig {
                file: Some(log_dir.join("tftp.log")),
                ..Default::default()
            },
            ..Default::default()
        };
        match validate_config(&config, false) {
            Ok(()) => return Err("expected error for missing root_dir".into()),
            Err(err) => {
                assert!(format!("{err}").contains("root_dir does not exist"));
            }
        }
        Ok(())
    }

    #[test]
    fn rejects_zero_bind_port() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let mut config = TftpConfig::default();
        config.root_dir = temp_dir("bind")?;
        config.bind_addr = "127.0.0.1:0".parse()?;
        match validate_config(&config, false) {
            Ok(()) => return Err("expected error for zero bind port".into()),
            Err(err) => {
                assert!(format!("{err}").contains("bind_addr port must be non-zero"));
            }
        }
        Ok(())
    }

    #[test]
    fn rejects_logging_file_with_missing_parent()
    -> std::result::Result<(), Box<dyn std::error::Error>> {
        let mut config = TftpConfig::default();
        config.root_dir = temp_dir("logfile")?;
        config.logging.file = Some(PathBuf::from("/nonexistent/tftpd-root/log.txt"));
        match validate_config(&config, false) {
            Ok(()) => return Err("expected error for logging.file parent".into()),
            Err(err) => {
                assert!(format!("{err}").contains("logging.file parent error"));
            }
        }
        Ok(())
    }

    #[test]
    fn validates_bind_addr_availability_on_free_port()
    -> std::result::Result<(), Box<dyn std::error::Error>> {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0")?;
        let port = socket.local_addr()?.port();
        drop(socket);

        let log_dir = temp_dir("bind_av_log")?;
        let mut config = TftpConfig::default();
        config.root_dir = temp_dir("bind-available")?;
        config.bind_addr = format!("127.0.0.1:{port}").parse()?;
        config.logging.file = Some(log_dir.join("tftp.log"));
        validate_config(&config, true)?;
        Ok(())
    }

    #[test]
    fn rejects_bind_addr_when_in_use() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0")?;
        let port = socket.local_addr()?.port();

        let mut config = TftpConfig::default();
        config.root_dir = temp_dir("bind-in-use")?;
        config.bind_addr = format!("127.0.0.1:{port}").parse()?;
        match validate_config(&config, true) {
            Ok(()) => return Err("expected error for bind_addr in use".into()),
            Err(err) => {
                assert!(format!("{err}").contains("bind_addr is not available"));
            }
        }
        Ok(())
    }

    #[test]
    fn rejects_writes_enabled_with_no_patterns()
    -> std::result::Result<(), Box<dyn std::error::Error>> {
        let log_dir = temp_dir("write_no_pat_log")?;
        let mut config = TftpConfig::default();
        config.root_dir = temp_dir("write-no-patterns")?;
        config.logging.file = Some(log_dir.join("tftp.log"));
        config.write_config.enabled = true;
        config.write_config.allowed_patterns = vec![];
        match validate_config(&config, false) {
            Ok(()) => return Err("expected error for writes enabled without patterns".into()),
            Err(err) => {
                assert!(format!("{err}").contains("no allowed_patterns specified"));
            }
        }
        Ok(())
    }

    #[test]
    fn rejects_empty_pattern() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let log_dir = temp_dir("empty_pat_log")?;
        let mut config = TftpConfig::default();
        config.root_dir = temp_dir("empty-pattern")?;
        config.logging.file = Some(log_dir.join("tftp.log"));
        config.write_config.enabled = true;
        config.write_config.allowed_patterns = vec!["".to_string()];
        match validate_config(&config, false) {
            Ok(()) => return Err("expected error for empty pattern".into()),
            Err(err) => {
                assert!(format!("{err}").contains("cannot contain empty patterns"));
            }
        }
        Ok(())
    }

    #[test]
    fn rejects_overly_permissive_patterns() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let log_dir = temp_dir("permissive_log")?;

        for pattern in &["*", "**", "**/*"] {
            let mut config = TftpConfig::default();
            config.root_dir = temp_dir("permissive-pattern")?;
            config.logging.file = Some(log_dir.join("tftp.log"));
            config.write_config.enabled = true;
            config.write_config.allowed_patterns = vec![pattern.to_string()];
            match validate_config(&config, false) {
                Ok(()) => return Err(format!("expected error for pattern {}", pattern).into()),
                Err(err) => {
                    assert!(format!("{err}").contains("too permissive"));
                }
            }
        }
        Ok(())
    }

    #[test]
    fn accepts_valid_write_config() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let log_dir = temp_dir("valid_write_log")?;
        let mut config = TftpConfig::default();
        config.root_dir = temp_dir("valid-write")?;
        config.logging.file = Some(log_dir.join("tftp.log"));
        config.write_config.enabled = true;
        config.write_config.allow_overwrite = true;
        config.write_config.allowed_patterns = vec![
            "*.txt".to_string(),
            "configs/*.cfg".to_string(),
            "firmware/device-*.bin".to_string(),
        ];
        validate_config(&config, false)?;
        Ok(())
    }

    #[test]
    fn accepts_write_disabled() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let log_dir = temp_dir("write_disabled_log")?;
        let mut config = TftpConfig::default();
        config.root_dir = temp_dir("write-disabled")?;
        config.logging.file = Some(log_dir.join("tftp.log"));
        config.write_config.enabled = false;
        config.write_config.allowed_patterns = vec![]; // Empty is OK when disabled
        validate_config(&config, false)?;
        Ok(())
    }
}
