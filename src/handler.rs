//! ReadHandler / WriteHandler contracts consumed by [`crate::session`], plus
//! the reference filesystem-backed implementations the shipped `tftpd`
//! binary wires up.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use glob::Pattern;

use crate::codec::{self, ErrorCode, TransferMode};
use crate::error::HandlerError;

type HResult<T> = std::result::Result<T, HandlerError>;

/// Source side of a transfer: the server reads from this and streams DATA.
pub trait ReadHandler: Send {
    fn open(&mut self) -> HResult<()>;
    /// Total byte length of the underlying source, if known up front.
    fn length(&self) -> Option<u64>;
    /// Return up to `end - start` bytes starting at the given offset. A
    /// short return (fewer bytes than requested) signals end-of-file.
    fn read(&mut self, start: u64, end: u64) -> HResult<Vec<u8>>;
    fn close(&mut self);
}

/// Sink side of a transfer: the server appends received DATA payloads here.
pub trait WriteHandler: Send {
    fn open(&mut self) -> HResult<()>;
    fn write(&mut self, bytes: &[u8]) -> HResult<()>;
    /// Called once the short terminating DATA block has been written and
    /// acknowledged, before `close()`. Handlers that stage writes (e.g. to
    /// a temp file) use this to mark the transfer as eligible to commit.
    fn mark_completed(&mut self) {}
    fn close(&mut self);
}

pub type ReadHandlerFactory =
    dyn Fn(&str, TransferMode, SocketAddr) -> HResult<Box<dyn ReadHandler>> + Send + Sync;
pub type WriteHandlerFactory =
    dyn Fn(&str, TransferMode, SocketAddr) -> HResult<Box<dyn WriteHandler>> + Send + Sync;

/// Always refuses with ILLEGAL_OP; wired up when reads or writes are
/// administratively disabled.
pub fn disable_read_factory(
    _filename: &str,
    _mode: TransferMode,
    _remote: SocketAddr,
) -> HResult<Box<dyn ReadHandler>> {
    Err(HandlerError::new(
        ErrorCode::IllegalOperation,
        "Transfer not allowed",
    ))
}

pub fn disable_write_factory(
    _filename: &str,
    _mode: TransferMode,
    _remote: SocketAddr,
) -> HResult<Box<dyn WriteHandler>> {
    Err(HandlerError::new(
        ErrorCode::IllegalOperation,
        "Transfer not allowed",
    ))
}

/// Resolve `filename` (as received on the wire, always `/`-separated)
/// against `base_dir`, rejecting absolute paths, `..` traversal, and
/// symlinks whose target escapes `base_dir`. `base_dir` must already be
/// canonical.
fn resolve_under(base_dir: &Path, filename: &str) -> HResult<PathBuf> {
    let relative = Path::new(filename);
    if relative.is_absolute() {
        return Err(HandlerError::new(
            ErrorCode::AccessViolation,
            "absolute paths are not allowed",
        ));
    }
    if relative
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return Err(HandlerError::new(
            ErrorCode::AccessViolation,
            "path traversal is not allowed",
        ));
    }
    let joined = base_dir.join(relative);

    // For an existing path, canonicalize and re-check containment so a
    // symlink can't point us outside base_dir. A not-yet-existing WRQ
    // target can't be canonicalized (its final component doesn't exist
    // yet); check its parent instead.
    let check_target = if joined.exists() {
        joined
            .canonicalize()
            .map_err(|e| HandlerError::new(ErrorCode::AccessViolation, e.to_string()))?
    } else {
        let parent = joined.parent().unwrap_or(base_dir);
        let canonical_parent = parent
            .canonicalize()
            .map_err(|e| HandlerError::new(ErrorCode::AccessViolation, e.to_string()))?;
        canonical_parent.join(joined.file_name().unwrap_or_default())
    };

    if !check_target.starts_with(base_dir) {
        return Err(HandlerError::new(
            ErrorCode::AccessViolation,
            "resolved path escapes base_dir",
        ));
    }
    Ok(joined)
}

fn relative_to_base<'a>(base_dir: &Path, path: &'a Path) -> &'a Path {
    path.strip_prefix(base_dir).unwrap_or(path)
}

#[cfg(unix)]
fn apply_sequential_hint(file: &File) {
    use std::os::unix::io::AsRawFd;
    unsafe {
        libc::posix_fadvise(file.as_raw_fd(), 0, 0, libc::POSIX_FADV_SEQUENTIAL);
    }
}

#[cfg(not(unix))]
fn apply_sequential_hint(_file: &File) {}

/// Filesystem-backed [`ReadHandler`] rooted at `base_dir`.
///
/// Netascii transforms are applied here, not at the codec layer: since the
/// transform can change the byte length of a read, this handler keeps the
/// whole transformed stream produced so far so that retransmission (which
/// re-reads the same `start`) sees stable bytes.
pub struct BasicReadHandler {
    base_dir: PathBuf,
    filename: String,
    mode: TransferMode,
    max_file_size_bytes: u64,
    file: Option<File>,
    raw_length: Option<u64>,
    transformed: Vec<u8>,
    raw_cursor: u64,
    raw_eof: bool,
}

impl BasicReadHandler {
    pub fn new(
        base_dir: PathBuf,
        filename: String,
        mode: TransferMode,
        max_file_size_bytes: u64,
    ) -> Self {
        Self {
            base_dir,
            filename,
            mode,
            max_file_size_bytes,
            file: None,
            raw_length: None,
            transformed: Vec::new(),
            raw_cursor: 0,
            raw_eof: false,
        }
    }

    /// Ensure at least `want` transformed bytes are buffered (or raw EOF is
    /// reached), pulling and transforming more of the file as needed.
    fn fill_to(&mut self, want: u64) -> HResult<()> {
        const CHUNK: usize = 8192;
        while !self.raw_eof && (self.transformed.len() as u64) < want {
            let mut chunk = vec![0u8; CHUNK];
            let file = self.file.as_mut().expect("open() called before read()");
            let n = file
                .read(&mut chunk)
                .map_err(|e| HandlerError::new(ErrorCode::NotDefined, e.to_string()))?;
            if n == 0 {
                self.raw_eof = true;
                break;
            }
            chunk.truncate(n);
            self.raw_cursor += n as u64;
            match self.mode {
                TransferMode::Netascii => {
                    self.transformed.extend(codec::to_netascii(&chunk));
                }
                _ => self.transformed.extend(chunk),
            }
        }
        Ok(())
    }
}

impl ReadHandler for BasicReadHandler {
    fn open(&mut self) -> HResult<()> {
        let path = resolve_under(&self.base_dir, &self.filename)?;
        let metadata = std::fs::symlink_metadata(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                HandlerError::new(ErrorCode::FileNotFound, "File not found")
            } else {
                HandlerError::new(ErrorCode::AccessViolation, e.to_string())
            }
        })?;
        if metadata.file_type().is_symlink() {
            return Err(HandlerError::new(
                ErrorCode::AccessViolation,
                "symlinks are not served",
            ));
        }
        if !metadata.is_file() {
            return Err(HandlerError::new(
                ErrorCode::AccessViolation,
                "not a regular file",
            ));
        }
        if self.max_file_size_bytes > 0 && metadata.len() > self.max_file_size_bytes {
            return Err(HandlerError::new(
                ErrorCode::AccessViolation,
                format!(
                    "file size {} exceeds configured maximum {}",
                    metadata.len(),
                    self.max_file_size_bytes
                ),
            ));
        }
        let file = File::open(&path)
            .map_err(|e| HandlerError::new(ErrorCode::AccessViolation, e.to_string()))?;
        apply_sequential_hint(&file);
        self.raw_length = Some(metadata.len());
        self.file = Some(file);
        Ok(())
    }

    fn length(&self) -> Option<u64> {
        self.raw_length
    }

    fn read(&mut self, start: u64, end: u64) -> HResult<Vec<u8>> {
        if self.mode == TransferMode::Netascii {
            self.fill_to(end)?;
            let start = start.min(self.transformed.len() as u64) as usize;
            let end = end.min(self.transformed.len() as u64) as usize;
            return Ok(self.transformed[start..end].to_vec());
        }
        let file = self.file.as_mut().expect("open() called before read()");
        file.seek(SeekFrom::Start(start))
            .map_err(|e| HandlerError::new(ErrorCode::NotDefined, e.to_string()))?;
        let want = (end - start) as usize;
        let mut buf = vec![0u8; want];
        let mut total = 0;
        while total < want {
            let n = file
                .read(&mut buf[total..])
                .map_err(|e| HandlerError::new(ErrorCode::NotDefined, e.to_string()))?;
            if n == 0 {
                break;
            }
            total += n;
        }
        buf.truncate(total);
        Ok(buf)
    }

    fn close(&mut self) {
        self.file = None;
    }
}

/// Filesystem-backed [`WriteHandler`] rooted at `base_dir`, gated by a glob
/// allowlist. Writes go to a temporary sibling and are renamed into place
/// on a successful `close()`, so an aborted transfer never leaves a partial
/// file at the final path.
pub struct BasicWriteHandler {
    base_dir: PathBuf,
    filename: String,
    mode: TransferMode,
    allow_overwrite: bool,
    allowed_patterns: Vec<String>,
    final_path: Option<PathBuf>,
    tmp_path: Option<PathBuf>,
    file: Option<File>,
    pending_cr: bool,
    completed: bool,
}

impl BasicWriteHandler {
    pub fn new(
        base_dir: PathBuf,
        filename: String,
        mode: TransferMode,
        allow_overwrite: bool,
        allowed_patterns: Vec<String>,
    ) -> Self {
        Self {
            base_dir,
            filename,
            mode,
            allow_overwrite,
            allowed_patterns,
            final_path: None,
            tmp_path: None,
            file: None,
            pending_cr: false,
            completed: false,
        }
    }

    fn is_allowed(&self, relative: &Path) -> bool {
        let candidate = relative.to_string_lossy();
        self.allowed_patterns.iter().any(|pattern| {
            Pattern::new(pattern)
                .map(|p| p.matches(&candidate))
                .unwrap_or(false)
        })
    }
}

impl WriteHandler for BasicWriteHandler {
    /// Called once the final short DATA block has been accepted, so `close`
    /// commits the temp file into place instead of discarding it.
    fn mark_completed(&mut self) {
        self.completed = true;
    }

    fn open(&mut self) -> HResult<()> {
        let path = resolve_under(&self.base_dir, &self.filename)?;
        let relative = relative_to_base(&self.base_dir, &path).to_path_buf();
        if !self.is_allowed(&relative) {
            return Err(HandlerError::new(
                ErrorCode::AccessViolation,
                "path does not match any allowed write pattern",
            ));
        }
        if path.exists() && !self.allow_overwrite {
            return Err(HandlerError::new(
                ErrorCode::FileAlreadyExists,
                "File already exists",
            ));
        }
        let tmp_path = path.with_extension(match path.extension() {
            Some(ext) => format!("{}.tftp-tmp", ext.to_string_lossy()),
            None => "tftp-tmp".to_string(),
        });
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)
            .map_err(|e| HandlerError::new(ErrorCode::AccessViolation, e.to_string()))?;
        self.file = Some(file);
        self.tmp_path = Some(tmp_path);
        self.final_path = Some(path);
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) -> HResult<()> {
        let transformed = match self.mode {
            TransferMode::Netascii => {
                codec::from_netascii_streaming(bytes, &mut self.pending_cr)
            }
            _ => bytes.to_vec(),
        };
        let file = self.file.as_mut().expect("open() called before write()");
        file.write_all(&transformed)
            .map_err(|e| HandlerError::new(ErrorCode::DiskFull, e.to_string()))?;
        Ok(())
    }

    fn close(&mut self) {
        if self.mode == TransferMode::Netascii {
            if let Some(trailing) = codec::flush_pending_cr(self.pending_cr) {
                if let Some(file) = self.file.as_mut() {
                    let _ = file.write_all(&[trailing]);
                }
            }
        }
        self.file = None;
        if self.completed {
            if let (Some(tmp), Some(final_path)) = (&self.tmp_path, &self.final_path) {
                let _ = std::fs::rename(tmp, final_path);
            }
        } else if let Some(tmp) = &self.tmp_path {
            let _ = std::fs::remove_file(tmp);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("tftpd_handler_test_{}_{}", name, uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir.canonicalize().unwrap()
    }

    #[test]
    fn read_handler_serves_small_file() {
        let dir = temp_dir("read_small");
        std::fs::write(dir.join("foobar"), b"foobarbaz").unwrap();
        let mut h = BasicReadHandler::new(dir, "foobar".into(), TransferMode::Octet, 0);
        h.open().unwrap();
        assert_eq!(h.length(), Some(9));
        let data = h.read(0, 512).unwrap();
        assert_eq!(data, b"foobarbaz");
    }

    #[test]
    fn read_handler_rejects_missing_file() {
        let dir = temp_dir("read_missing");
        let mut h = BasicReadHandler::new(dir, "nope".into(), TransferMode::Octet, 0);
        assert!(h.open().is_err());
    }

    #[test]
    fn read_handler_rejects_traversal() {
        let dir = temp_dir("read_traversal");
        let mut h = BasicReadHandler::new(dir, "../etc/passwd".into(), TransferMode::Octet, 0);
        assert!(h.open().is_err());
    }

    #[test]
    fn read_handler_rejects_absolute_path() {
        let dir = temp_dir("read_abs");
        let mut h = BasicReadHandler::new(dir, "/etc/passwd".into(), TransferMode::Octet, 0);
        assert!(h.open().is_err());
    }

    #[test]
    fn read_handler_enforces_max_size() {
        let dir = temp_dir("read_maxsize");
        std::fs::write(dir.join("big"), vec![0u8; 100]).unwrap();
        let mut h = BasicReadHandler::new(dir, "big".into(), TransferMode::Octet, 10);
        assert!(h.open().is_err());
    }

    #[test]
    fn read_handler_applies_netascii_on_read() {
        let dir = temp_dir("read_netascii");
        std::fs::write(dir.join("text"), b"a\nb").unwrap();
        let mut h = BasicReadHandler::new(dir, "text".into(), TransferMode::Netascii, 0);
        h.open().unwrap();
        let data = h.read(0, 512).unwrap();
        assert_eq!(data, b"a\r\nb");
    }

    #[test]
    fn write_handler_rejects_disallowed_pattern() {
        let dir = temp_dir("write_disallowed");
        let mut h = BasicWriteHandler::new(
            dir,
            "secret.bin".into(),
            TransferMode::Octet,
            false,
            vec!["*.txt".to_string()],
        );
        assert!(h.open().is_err());
    }

    #[test]
    fn write_handler_happy_path_renames_on_completion() {
        let dir = temp_dir("write_ok");
        let mut h = BasicWriteHandler::new(
            dir.clone(),
            "upload.txt".into(),
            TransferMode::Octet,
            false,
            vec!["*.txt".to_string()],
        );
        h.open().unwrap();
        h.write(b"hello").unwrap();
        h.mark_completed();
        h.close();
        assert_eq!(std::fs::read(dir.join("upload.txt")).unwrap(), b"hello");
    }

    #[test]
    fn write_handler_discards_tmp_file_when_not_completed() {
        let dir = temp_dir("write_abort");
        let mut h = BasicWriteHandler::new(
            dir.clone(),
            "upload.txt".into(),
            TransferMode::Octet,
            false,
            vec!["*.txt".to_string()],
        );
        h.open().unwrap();
        h.write(b"partial").unwrap();
        h.close();
        assert!(!dir.join("upload.txt").exists());
    }

    #[test]
    fn write_handler_rejects_existing_file_without_overwrite() {
        let dir = temp_dir("write_exists");
        std::fs::write(dir.join("upload.txt"), b"old").unwrap();
        let mut h = BasicWriteHandler::new(
            dir,
            "upload.txt".into(),
            TransferMode::Octet,
            false,
            vec!["*.txt".to_string()],
        );
        assert!(h.open().is_err());
    }

    #[test]
    fn write_handler_applies_netascii_on_write() {
        let dir = temp_dir("write_netascii");
        let mut h = BasicWriteHandler::new(
            dir.clone(),
            "upload.txt".into(),
            TransferMode::Netascii,
            false,
            vec!["*.txt".to_string()],
        );
        h.open().unwrap();
        h.write(b"a\r\nb").unwrap();
        h.mark_completed();
        h.close();
        assert_eq!(std::fs::read(dir.join("upload.txt")).unwrap(), b"a\nb");
    }
}
