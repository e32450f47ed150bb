//! Handler module - host operations behind each API namespace.
//!
//! Provides:
//! - [`Api`] - closed set of `(namespace, method)` pairs the host serves
//! - [`HostState`] - the resources those operations act on
//! - [`CallContext`] - routes a finished call to the channel or the queue
//!
//! # Example
//!
//! ```
//! use sandbox_passthrough::handler::{Api, FsMethod};
//!
//! assert_eq!(Api::resolve("fs", "stat").unwrap(), Api::Fs(FsMethod::Stat));
//! assert!(Api::resolve("gpu", "draw").is_err());
//! ```

mod args;
mod context;
mod crypto;
mod dns;
mod fs;
mod net;

use std::borrow::Cow;
use std::path::{Path, PathBuf};

pub use args::Args;
pub use context::{CallContext, CallConvention};
pub use crypto::{CryptoMethod, DEFAULT_MAX_RANDOM_BYTES};
pub use dns::DnsMethod;
pub use fs::{FileTable, FsMethod};
pub use net::NetMethod;

use crate::error::{PassthroughError, Result};
use crate::net::ConnectionTable;
use crate::protocol::Outcome;

/// A resolved `(namespace, method)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Api {
    /// Filesystem primitives.
    Fs(FsMethod),
    /// Name resolution.
    Dns(DnsMethod),
    /// Virtual sockets.
    Net(NetMethod),
    /// Host entropy.
    Crypto(CryptoMethod),
}

impl Api {
    /// Look up a namespace and an already normalized method name.
    ///
    /// # Errors
    ///
    /// `UnhandledApi` for an unknown namespace, `UnhandledMethod` for an
    /// unknown method inside a known one.
    pub fn resolve(api: &str, method: &str) -> Result<Self> {
        let resolved = match api {
            "fs" => FsMethod::parse(method).map(Api::Fs),
            "dns" => DnsMethod::parse(method).map(Api::Dns),
            "net" => NetMethod::parse(method).map(Api::Net),
            "crypto" => CryptoMethod::parse(method).map(Api::Crypto),
            _ => return Err(PassthroughError::UnhandledApi(api.to_string())),
        };
        resolved.ok_or_else(|| PassthroughError::UnhandledMethod {
            api: api.to_string(),
            method: method.to_string(),
        })
    }

    /// Namespace name.
    pub fn namespace(&self) -> &'static str {
        match self {
            Api::Fs(_) => "fs",
            Api::Dns(_) => "dns",
            Api::Net(_) => "net",
            Api::Crypto(_) => "crypto",
        }
    }

    /// Canonical method name.
    pub fn method_name(&self) -> &'static str {
        match self {
            Api::Fs(m) => m.name(),
            Api::Dns(m) => m.name(),
            Api::Net(m) => m.name(),
            Api::Crypto(m) => m.name(),
        }
    }
}

/// Rewrite an absolute sandbox path to a relative one by prefixing `.`.
///
/// ```
/// use sandbox_passthrough::handler::virtual_path;
///
/// assert_eq!(virtual_path("/etc/passwd"), "./etc/passwd");
/// assert_eq!(virtual_path("foo.txt"), "foo.txt");
/// ```
pub fn virtual_path(path: &str) -> Cow<'_, str> {
    if path.starts_with('/') {
        Cow::Owned(format!(".{}", path))
    } else {
        Cow::Borrowed(path)
    }
}

/// Resources shared by every host call on one host.
#[derive(Debug)]
pub struct HostState {
    root: PathBuf,
    max_read_size: usize,
    max_random_bytes: usize,
    files: FileTable,
    sockets: ConnectionTable,
}

impl HostState {
    /// Create host state rooted at `root`.
    pub fn new(root: PathBuf, max_read_size: usize, max_random_bytes: usize) -> Self {
        Self {
            root,
            max_read_size,
            max_random_bytes,
            files: FileTable::new(),
            sockets: ConnectionTable::new(),
        }
    }

    /// Directory relative sandbox paths resolve against.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a sandbox path onto the host filesystem.
    pub fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(virtual_path(path).as_ref())
    }

    /// Open host files.
    pub fn files(&self) -> &FileTable {
        &self.files
    }

    /// Live virtual sockets.
    pub fn sockets(&self) -> &ConnectionTable {
        &self.sockets
    }

    /// Largest single `fs.read` length accepted.
    pub fn max_read_size(&self) -> usize {
        self.max_read_size
    }

    /// Largest `randomBytes` size accepted.
    pub fn max_random_bytes(&self) -> usize {
        self.max_random_bytes
    }

    /// Run one host operation.
    pub async fn invoke(&self, api: Api, args: &Args) -> Result<Outcome> {
        match api {
            Api::Fs(method) => fs::call(self, method, args).await,
            Api::Dns(method) => dns::call(method, args).await,
            Api::Net(method) => net::call(&self.sockets, method, args).await,
            Api::Crypto(method) => crypto::call(self, method, args),
        }
    }
}
