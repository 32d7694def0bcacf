//! Error types for palisade-core

use std::collections::TryReserveError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FilterError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("conflict: {0}")]
    Exists(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("syscall {syscall} has no equivalent on {arch}")]
    OutOfDomain { syscall: i32, arch: String },

    #[error("resource exhausted while building filter state")]
    ResourceExhausted,

    #[error("attribute is read-only: {0}")]
    ReadOnly(&'static str),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl FilterError {
    /// Negative errno value reported through the C ABI.
    #[must_use]
    pub const fn errno(&self) -> i32 {
        let code = match self {
            Self::InvalidArgument(_) | Self::Config(_) => libc::EINVAL,
            Self::Exists(_) => libc::EEXIST,
            Self::NotFound(_) => libc::ENOENT,
            Self::Unsupported(_) => libc::EOPNOTSUPP,
            Self::OutOfDomain { .. } => libc::EDOM,
            Self::ResourceExhausted => libc::ENOMEM,
            Self::ReadOnly(_) => libc::EACCES,
            Self::Io(_) => libc::EIO,
        };
        -code
    }

    /// True for the translation failure that priority propagation ignores.
    #[must_use]
    pub const fn is_out_of_domain(&self) -> bool {
        matches!(self, Self::OutOfDomain { .. })
    }
}

impl From<TryReserveError> for FilterError {
    fn from(_: TryReserveError) -> Self {
        Self::ResourceExhausted
    }
}
