//! Crate-wide error type, composing each component's error enum so the
//! `luatt` binary can map a failure to its process exit code without
//! every call site matching on five different error types.

use thiserror::Error;

use crate::attach::AttachError;
use crate::issuer::IssuerError;
use crate::loader::LoaderError;
use crate::router::RouterError;
use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum LuattError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Router(#[from] RouterError),
    #[error(transparent)]
    Issuer(#[from] IssuerError),
    #[error(transparent)]
    Loader(#[from] LoaderError),
    #[error(transparent)]
    Attach(#[from] AttachError),
    #[error("invalid option combination: {0}")]
    BadOptions(String),
}

pub type Result<T> = std::result::Result<T, LuattError>;

impl LuattError {
    /// Map an error to its process exit code.
    pub fn exit_code(&self) -> u8 {
        match self {
            LuattError::Transport(_) => 5,
            LuattError::Issuer(IssuerError::VersionTimeout) => 3,
            LuattError::BadOptions(_) => 2,
            LuattError::Issuer(_) | LuattError::Router(_) | LuattError::Loader(_) | LuattError::Attach(_) => 1,
        }
    }
}
