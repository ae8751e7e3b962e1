use thiserror::Error;

use crate::worker::session::SessionError;

#[derive(Error, Debug)]
pub enum RunqError {
    #[error("{context}: {source}")]
    Syscall {
        context: &'static str,
        source: std::io::Error,
    },

    #[error("cannot resolve service identity: {0}")]
    Identity(String),

    #[error("job header is in the wrong format: {0}")]
    Header(String),

    #[error("job file changed from under us: {0}")]
    Tampered(&'static str),

    #[error("userid {0} not found")]
    UnknownUid(u32),

    #[error("illegal mail name {0}")]
    IllegalMailName(String),

    #[error("authentication session failed: {0}")]
    Session(#[from] SessionError),
}

impl RunqError {
    pub fn syscall(context: &'static str, source: std::io::Error) -> Self {
        Self::Syscall { context, source }
    }
}

pub type Result<T> = std::result::Result<T, RunqError>;
