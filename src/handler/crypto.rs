//! Host entropy.

use rand::rngs::OsRng;
use rand::RngCore;

use super::{Args, HostState};
use crate::error::{PassthroughError, Result};
use crate::protocol::Outcome;

/// Default upper bound for one `randomBytes` call.
pub const DEFAULT_MAX_RANDOM_BYTES: usize = 64 * 1024;

/// Crypto methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoMethod {
    /// `randomBytes(size)` → hex string of `size` random bytes.
    RandomBytes,
}

impl CryptoMethod {
    /// Parse a normalized method name.
    pub fn parse(method: &str) -> Option<Self> {
        match method {
            "randomBytes" => Some(Self::RandomBytes),
            _ => None,
        }
    }

    /// Canonical name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::RandomBytes => "randomBytes",
        }
    }
}

pub(super) fn call(state: &HostState, method: CryptoMethod, args: &Args) -> Result<Outcome> {
    match method {
        CryptoMethod::RandomBytes => {
            let size = args.size(0, "size")?;
            if size > state.max_random_bytes() {
                return Err(PassthroughError::invalid_arg(format!(
                    "size {} exceeds maximum {}",
                    size,
                    state.max_random_bytes()
                )));
            }
            let mut buf = vec![0u8; size];
            OsRng.fill_bytes(&mut buf);
            Ok(Outcome::single(hex::encode(buf)))
        }
    }
}
