//! `tftpd`: the reference command-line front-end around
//! [`tftpd_rs::server::TftpServer`]. Wires the filesystem-backed handlers
//! (`tftpd_rs::handler::BasicReadHandler`/`BasicWriteHandler`) to the core
//! event loop, following the CLI surface fixed for test compatibility plus
//! the logging/audit surface layered around it.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tftpd_rs::audit::AuditLogger;
use tftpd_rs::config::LogFormat;
use tftpd_rs::error::{HandlerError, Result, TftpError};
use tftpd_rs::handler::{disable_write_factory, BasicReadHandler, BasicWriteHandler};
use tftpd_rs::server::{ServerConfig, TftpServer};
use tftpd_rs::TransferMode;

#[derive(Parser, Debug)]
#[command(name = "tftpd", about = "A TFTP (RFC 1350) server")]
struct Cli {
    /// Directory served to RRQ/WRQ clients
    base_dir: PathBuf,

    /// Write destination for logs ("-" for stderr)
    #[arg(short = 'l', long = "log-file", default_value = "-")]
    log_file: String,

    /// Enable debug-level logging
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// chroot(2) to this directory after resolving base_dir (Unix only)
    #[arg(short = 'C', long = "chroot")]
    chroot: Option<PathBuf>,

    /// Address to listen on
    #[arg(short = 'H', long = "host", default_value = "127.0.0.1")]
    host: IpAddr,

    /// Port to listen on
    #[arg(short = 'p', long = "port", default_value_t = 69)]
    port: u16,

    /// Per-session timeout used when a peer does not request `timeout`, in
    /// seconds
    #[arg(short = 't', long = "default-timeout", default_value_t = 30)]
    default_timeout: u64,

    /// Glob pattern (relative to base_dir) clients may write to; repeat to
    /// allow more than one. Absent entirely, WRQ is refused.
    #[arg(short = 'w', long = "allow-write")]
    allow_write: Vec<String>,

    /// Allow WRQ to overwrite an existing file
    #[arg(long = "allow-overwrite")]
    allow_overwrite: bool,

    /// Maximum file size servable/writable in bytes (0 = unlimited)
    #[arg(long = "max-file-size", default_value_t = 0)]
    max_file_size: u64,

    /// Server-side ceiling on negotiated `windowsize`
    #[arg(long = "window-size", default_value_t = 1)]
    window_size: usize,

    /// Log output format
    #[arg(long = "log-format", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn request_shutdown(_signum: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGINT, request_shutdown as libc::sighandler_t);
        libc::signal(libc::SIGTERM, request_shutdown as libc::sighandler_t);
    }
}

fn init_logging(cli: &Cli) {
    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::new(level);

    if cli.log_file == "-" {
        match cli.log_format {
            LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
            LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        }
    } else {
        let path = Path::new(&cli.log_file);
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("tftpd.log");
        let appender = tracing_appender::rolling::never(dir, file_name);
        // Leaking the guard is deliberate: it must outlive the subscriber,
        // which lives for the process's whole lifetime.
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);
        Box::leak(Box::new(guard));
        match cli.log_format {
            LogFormat::Json => tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .with_writer(non_blocking)
                .init(),
            LogFormat::Text => tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(non_blocking)
                .init(),
        }
    }
}

/// Resolve `base_dir` to an absolute path and, if `chroot` was requested,
/// jail the process there (Unix only) and rebase `base_dir` relative to the
/// new root.
fn apply_chroot(base_dir: &Path, chroot: Option<&Path>) -> Result<PathBuf> {
    let absolute = base_dir
        .canonicalize()
        .map_err(|e| TftpError::Config(format!("base_dir {}: {}", base_dir.display(), e)))?;

    let Some(root) = chroot else {
        return Ok(absolute);
    };

    #[cfg(unix)]
    {
        let root = root
            .canonicalize()
            .map_err(|e| TftpError::Config(format!("chroot dir {}: {}", root.display(), e)))?;
        let relative = absolute.strip_prefix(&root).map_err(|_| {
            TftpError::Config(format!(
                "base_dir {} does not lie under chroot dir {}",
                absolute.display(),
                root.display()
            ))
        })?;
        let relative = PathBuf::from("/").join(relative);

        let root_c = std::ffi::CString::new(root.as_os_str().to_string_lossy().as_bytes())
            .map_err(|e| TftpError::Config(e.to_string()))?;
        // SAFETY: chroot(2) requires the effective user to hold
        // CAP_SYS_CHROOT; callers without it get an Err back from errno.
        let result = unsafe { libc::chroot(root_c.as_ptr()) };
        if result != 0 {
            return Err(TftpError::Io(std::io::Error::last_os_error()));
        }
        std::env::set_current_dir("/")?;
        Ok(relative)
    }

    #[cfg(not(unix))]
    {
        let _ = root;
        Err(TftpError::Config(
            "chroot is not supported on this platform".to_string(),
        ))
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);
    install_signal_handlers();

    let base_dir = apply_chroot(&cli.base_dir, cli.chroot.as_deref())?;
    let bind_addr = SocketAddr::new(cli.host, cli.port);

    let max_file_size = cli.max_file_size;
    let allow_overwrite = cli.allow_overwrite;
    let allow_write = cli.allow_write.clone();
    let writes_enabled = !allow_write.is_empty();

    let read_base = base_dir.clone();
    let read_factory: Arc<tftpd_rs::handler::ReadHandlerFactory> = Arc::new(
        move |filename: &str,
              mode: TransferMode,
              _remote: SocketAddr|
              -> std::result::Result<Box<dyn tftpd_rs::handler::ReadHandler>, HandlerError> {
            Ok(Box::new(BasicReadHandler::new(
                read_base.clone(),
                filename.to_string(),
                mode,
                max_file_size,
            )))
        },
    );

    let write_base = base_dir.clone();
    let write_factory: Arc<tftpd_rs::handler::WriteHandlerFactory> = if writes_enabled {
        Arc::new(
            move |filename: &str,
                  mode: TransferMode,
                  _remote: SocketAddr|
                  -> std::result::Result<Box<dyn tftpd_rs::handler::WriteHandler>, HandlerError> {
                Ok(Box::new(BasicWriteHandler::new(
                    write_base.clone(),
                    filename.to_string(),
                    mode,
                    allow_overwrite,
                    allow_write.clone(),
                )))
            },
        )
    } else {
        Arc::new(disable_write_factory)
    };

    let config = ServerConfig {
        bind_addr,
        read_factory,
        write_factory,
        window_size_ceiling: cli.window_size,
        default_timeout_secs: cli.default_timeout,
        default_block_size: tftpd_rs::codec::DEFAULT_BLOCK_SIZE,
        poll_interval: Duration::from_secs(5),
        socket: tftpd_rs::config::SocketConfig::default(),
    };

    AuditLogger::server_started(&bind_addr.to_string(), &base_dir.display().to_string());
    info!(%bind_addr, base_dir = %base_dir.display(), writes_enabled, "starting tftpd");

    let mut server = TftpServer::bind(config)?;
    while !SHUTDOWN_REQUESTED.load(Ordering::SeqCst) {
        if let Err(e) = server.run_once() {
            warn!(error = %e, "event loop iteration failed");
        }
    }
    server.close();
    AuditLogger::server_shutdown("signal received");
    info!("tftpd shut down cleanly");

    Ok(())
}
