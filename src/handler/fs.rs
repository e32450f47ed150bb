//! Filesystem operations.
//!
//! Paths are resolved against the host root. Descriptors handed to the
//! sandbox are the real host descriptors of files held in a [`FileTable`].
//! Blocking positional I/O runs on tokio's blocking pool.

use std::collections::HashMap;
use std::fs::{File, Metadata, OpenOptions};
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::{FileExt, MetadataExt, OpenOptionsExt};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::UNIX_EPOCH;

use serde_json::{json, Value};

use super::{Args, HostState};
use crate::error::{PassthroughError, Result};
use crate::protocol::Outcome;

/// Filesystem methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsMethod {
    /// `stat(path)` → stat object, following links.
    Stat,
    /// `lstat(path)` → stat object of the link itself.
    Lstat,
    /// `fstat(fd)` → stat object.
    Fstat,
    /// `open(path, flags, mode?)` → fd.
    Open,
    /// `close(fd)` → null.
    Close,
    /// `read(fd, length, position?, encoding?)` → `[data, bytesRead]`.
    Read,
    /// `write(fd, data, position?, encoding?)` → `[bytesWritten, data]`.
    Write,
    /// `readdir(path)` → sorted entry names.
    Readdir,
    /// `readFile(path, encoding?)` → contents as text or hex.
    ReadFile,
    /// `writeFile(path, data, encoding?)` → null.
    WriteFile,
    /// `mkdir(path, mode?)` → null.
    Mkdir,
    /// `rmdir(path)` → null.
    Rmdir,
    /// `unlink(path)` → null.
    Unlink,
    /// `rename(from, to)` → null.
    Rename,
    /// `exists(path)` → bool.
    Exists,
    /// `realpath(path)` → canonical path.
    Realpath,
    /// `readlink(path)` → link target.
    Readlink,
}

impl FsMethod {
    /// Parse a normalized method name.
    pub fn parse(method: &str) -> Option<Self> {
        let parsed = match method {
            "stat" => Self::Stat,
            "lstat" => Self::Lstat,
            "fstat" => Self::Fstat,
            "open" => Self::Open,
            "close" => Self::Close,
            "read" => Self::Read,
            "write" => Self::Write,
            "readdir" => Self::Readdir,
            "readFile" => Self::ReadFile,
            "writeFile" => Self::WriteFile,
            "mkdir" => Self::Mkdir,
            "rmdir" => Self::Rmdir,
            "unlink" => Self::Unlink,
            "rename" => Self::Rename,
            "exists" => Self::Exists,
            "realpath" => Self::Realpath,
            "readlink" => Self::Readlink,
            _ => return None,
        };
        Some(parsed)
    }

    /// Canonical name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Stat => "stat",
            Self::Lstat => "lstat",
            Self::Fstat => "fstat",
            Self::Open => "open",
            Self::Close => "close",
            Self::Read => "read",
            Self::Write => "write",
            Self::Readdir => "readdir",
            Self::ReadFile => "readFile",
            Self::WriteFile => "writeFile",
            Self::Mkdir => "mkdir",
            Self::Rmdir => "rmdir",
            Self::Unlink => "unlink",
            Self::Rename => "rename",
            Self::Exists => "exists",
            Self::Realpath => "realpath",
            Self::Readlink => "readlink",
        }
    }
}

/// Files opened on behalf of the sandbox, keyed by host descriptor.
#[derive(Debug, Default)]
pub struct FileTable {
    files: Mutex<HashMap<i32, Arc<File>>>,
}

impl FileTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    fn files(&self) -> MutexGuard<'_, HashMap<i32, Arc<File>>> {
        self.files
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register an open file and return its descriptor.
    pub fn insert(&self, file: File) -> i32 {
        let fd = file.as_raw_fd();
        self.files().insert(fd, Arc::new(file));
        fd
    }

    /// Look up an open file.
    pub fn get(&self, fd: i64) -> Result<Arc<File>> {
        let key = i32::try_from(fd).map_err(|_| PassthroughError::BadDescriptor(fd))?;
        self.files()
            .get(&key)
            .cloned()
            .ok_or(PassthroughError::BadDescriptor(fd))
    }

    /// Unregister a file; it closes once no in-flight operation holds it.
    pub fn remove(&self, fd: i64) -> Result<Arc<File>> {
        let key = i32::try_from(fd).map_err(|_| PassthroughError::BadDescriptor(fd))?;
        self.files()
            .remove(&key)
            .ok_or(PassthroughError::BadDescriptor(fd))
    }

    /// Number of open files.
    pub fn len(&self) -> usize {
        self.files().len()
    }

    /// Check if no file is open.
    pub fn is_empty(&self) -> bool {
        self.files().is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Encoding {
    Utf8,
    Hex,
}

impl Encoding {
    fn parse(encoding: Option<&str>) -> Result<Self> {
        match encoding {
            None | Some("utf8") | Some("utf-8") => Ok(Self::Utf8),
            Some("hex") => Ok(Self::Hex),
            Some(other) => Err(PassthroughError::invalid_arg(format!(
                "Unknown encoding: {}",
                other
            ))),
        }
    }

    fn encode(self, data: &[u8]) -> String {
        match self {
            Self::Utf8 => String::from_utf8_lossy(data).into_owned(),
            Self::Hex => hex::encode(data),
        }
    }

    fn decode(self, data: &str) -> Result<Vec<u8>> {
        match self {
            Self::Utf8 => Ok(data.as_bytes().to_vec()),
            Self::Hex => Ok(hex::decode(data)?),
        }
    }
}

// Linux open(2) flag bits, as the sandboxed runtime passes them.
const O_ACCMODE: i64 = 0o3;
const O_WRONLY: i64 = 0o1;
const O_RDWR: i64 = 0o2;
const O_CREAT: i64 = 0o100;
const O_EXCL: i64 = 0o200;
const O_TRUNC: i64 = 0o1000;
const O_APPEND: i64 = 0o2000;

const DEFAULT_FILE_MODE: u32 = 0o666;
const DEFAULT_DIR_MODE: u32 = 0o777;

fn string_flags(flags: &str) -> Result<i64> {
    let bits = match flags {
        "r" | "rs" | "sr" => 0,
        "r+" | "rs+" | "sr+" => O_RDWR,
        "w" => O_TRUNC | O_CREAT | O_WRONLY,
        "wx" | "xw" => O_TRUNC | O_CREAT | O_WRONLY | O_EXCL,
        "w+" => O_TRUNC | O_CREAT | O_RDWR,
        "wx+" | "xw+" => O_TRUNC | O_CREAT | O_RDWR | O_EXCL,
        "a" => O_APPEND | O_CREAT | O_WRONLY,
        "ax" | "xa" => O_APPEND | O_CREAT | O_WRONLY | O_EXCL,
        "a+" => O_APPEND | O_CREAT | O_RDWR,
        "ax+" | "xa+" => O_APPEND | O_CREAT | O_RDWR | O_EXCL,
        other => {
            return Err(PassthroughError::invalid_arg(format!(
                "Unknown file open flag: {}",
                other
            )))
        }
    };
    Ok(bits)
}

fn open_flags(args: &Args, index: usize) -> Result<i64> {
    match args.value(index) {
        None => Ok(0),
        Some(Value::String(s)) => string_flags(s),
        Some(_) => args.int(index, "flags"),
    }
}

fn open_options(flags: i64, mode: u32) -> OpenOptions {
    let access = flags & O_ACCMODE;
    let mut options = OpenOptions::new();
    options
        .read(access != O_WRONLY)
        .write(access != 0)
        .append(flags & O_APPEND != 0)
        .truncate(flags & O_TRUNC != 0)
        .mode(mode);
    if flags & O_CREAT != 0 {
        if flags & O_EXCL != 0 {
            options.create_new(true);
        } else {
            options.create(true);
        }
    }
    options
}

fn millis(secs: i64, nsec: i64) -> i64 {
    secs * 1000 + nsec / 1_000_000
}

/// Stat object in the shape the sandboxed runtime's stats constructor reads.
fn stat_value(meta: &Metadata) -> Value {
    let ctime = millis(meta.ctime(), meta.ctime_nsec());
    let birthtime = meta
        .created()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(ctime);
    json!({
        "dev": meta.dev(),
        "mode": meta.mode(),
        "nlink": meta.nlink(),
        "uid": meta.uid(),
        "gid": meta.gid(),
        "rdev": meta.rdev(),
        "blksize": meta.blksize(),
        "ino": meta.ino(),
        "size": meta.size(),
        "blocks": meta.blocks(),
        "atim_msec": millis(meta.atime(), meta.atime_nsec()),
        "mtim_msec": millis(meta.mtime(), meta.mtime_nsec()),
        "ctim_msec": ctime,
        "birthtim_msec": birthtime,
    })
}

async fn blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> std::io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => Ok(result?),
        Err(e) => Err(std::io::Error::new(std::io::ErrorKind::Other, e).into()),
    }
}

fn position(args: &Args, index: usize) -> Result<Option<u64>> {
    // Negative positions mean "current position", as in read(2) callers.
    Ok(args
        .opt_int(index, "position")?
        .and_then(|p| u64::try_from(p).ok()))
}

pub(super) async fn call(state: &HostState, method: FsMethod, args: &Args) -> Result<Outcome> {
    match method {
        FsMethod::Stat => {
            let meta = tokio::fs::metadata(state.resolve(args.str(0, "path")?)).await?;
            Ok(Outcome::Single(stat_value(&meta)))
        }
        FsMethod::Lstat => {
            let meta = tokio::fs::symlink_metadata(state.resolve(args.str(0, "path")?)).await?;
            Ok(Outcome::Single(stat_value(&meta)))
        }
        FsMethod::Fstat => {
            let file = state.files().get(args.int(0, "fd")?)?;
            let meta = blocking(move || file.metadata()).await?;
            Ok(Outcome::Single(stat_value(&meta)))
        }
        FsMethod::Open => {
            let path = state.resolve(args.str(0, "path")?);
            let flags = open_flags(args, 1)?;
            let mode = args
                .opt_int(2, "mode")?
                .map_or(DEFAULT_FILE_MODE, |m| m as u32);
            let options = open_options(flags, mode);
            let file = blocking(move || options.open(path)).await?;
            let fd = state.files().insert(file);
            tracing::debug!(fd, "Opened file");
            Ok(Outcome::single(fd))
        }
        FsMethod::Close => {
            state.files().remove(args.int(0, "fd")?)?;
            Ok(Outcome::Unit)
        }
        FsMethod::Read => {
            let file = state.files().get(args.int(0, "fd")?)?;
            let length = args.size(1, "length")?;
            if length > state.max_read_size() {
                return Err(PassthroughError::invalid_arg(format!(
                    "read length {} exceeds maximum {}",
                    length,
                    state.max_read_size()
                )));
            }
            let position = position(args, 2)?;
            let encoding = Encoding::parse(args.opt_str(3, "encoding")?)?;

            let data = blocking(move || {
                let mut buf = vec![0u8; length];
                let n = match position {
                    Some(offset) => file.read_at(&mut buf, offset)?,
                    None => (&*file).read(&mut buf)?,
                };
                buf.truncate(n);
                Ok(buf)
            })
            .await?;
            Ok(Outcome::pair(encoding.encode(&data), data.len()))
        }
        FsMethod::Write => {
            let file = state.files().get(args.int(0, "fd")?)?;
            let text = args.str(1, "data")?.to_string();
            let position = position(args, 2)?;
            let encoding = Encoding::parse(args.opt_str(3, "encoding")?)?;
            let data = encoding.decode(&text)?;

            let written = blocking(move || {
                match position {
                    Some(offset) => file.write_all_at(&data, offset)?,
                    None => (&*file).write_all(&data)?,
                }
                Ok(data.len())
            })
            .await?;
            Ok(Outcome::pair(written, text))
        }
        FsMethod::Readdir => {
            let mut dir = tokio::fs::read_dir(state.resolve(args.str(0, "path")?)).await?;
            let mut names = Vec::new();
            while let Some(entry) = dir.next_entry().await? {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
            names.sort();
            Ok(Outcome::single(names))
        }
        FsMethod::ReadFile => {
            let path = state.resolve(args.str(0, "path")?);
            let encoding = Encoding::parse(args.opt_str(1, "encoding")?)?;
            let data = tokio::fs::read(path).await?;
            Ok(Outcome::single(encoding.encode(&data)))
        }
        FsMethod::WriteFile => {
            let path = state.resolve(args.str(0, "path")?);
            let encoding = Encoding::parse(args.opt_str(2, "encoding")?)?;
            let data = encoding.decode(args.str(1, "data")?)?;
            tokio::fs::write(path, data).await?;
            Ok(Outcome::Unit)
        }
        FsMethod::Mkdir => {
            let path = state.resolve(args.str(0, "path")?);
            let mode = args
                .opt_int(1, "mode")?
                .map_or(DEFAULT_DIR_MODE, |m| m as u32);
            tokio::fs::DirBuilder::new().mode(mode).create(path).await?;
            Ok(Outcome::Unit)
        }
        FsMethod::Rmdir => {
            tokio::fs::remove_dir(state.resolve(args.str(0, "path")?)).await?;
            Ok(Outcome::Unit)
        }
        FsMethod::Unlink => {
            tokio::fs::remove_file(state.resolve(args.str(0, "path")?)).await?;
            Ok(Outcome::Unit)
        }
        FsMethod::Rename => {
            let from = state.resolve(args.str(0, "oldPath")?);
            let to = state.resolve(args.str(1, "newPath")?);
            tokio::fs::rename(from, to).await?;
            Ok(Outcome::Unit)
        }
        FsMethod::Exists => {
            let exists = tokio::fs::metadata(state.resolve(args.str(0, "path")?))
                .await
                .is_ok();
            Ok(Outcome::single(exists))
        }
        FsMethod::Realpath => {
            let real = tokio::fs::canonicalize(state.resolve(args.str(0, "path")?)).await?;
            Ok(Outcome::single(real.to_string_lossy().into_owned()))
        }
        FsMethod::Readlink => {
            let target = tokio::fs::read_link(state.resolve(args.str(0, "path")?)).await?;
            Ok(Outcome::single(target.to_string_lossy().into_owned()))
        }
    }
}
