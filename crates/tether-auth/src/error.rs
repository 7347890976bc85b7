//! Token storage errors.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    /// The token file exists but could not be read.
    #[error("Failed to read token file {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The token file or its directory could not be written.
    #[error("Failed to write token file {path:?}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The token file is not a JSON object keyed by server name.
    #[error("Token file {path:?} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Failed to encode tokens: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Could not determine data directory")]
    NoDataDir,

    /// The file was written but could not be restricted to its owner.
    #[error("Failed to restrict permissions on {path:?}: {source}")]
    Permissions {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub type AuthResult<T> = Result<T, AuthError>;
