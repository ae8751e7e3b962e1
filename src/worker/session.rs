use thiserror::Error;

/// Failure in one phase of the authentication session protocol. Each phase
/// aborts the worker with its own message, mirroring the host stack's
/// per-call error reporting.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session start failed for {0}")]
    Start(String),
    #[error("account check failed for {0}")]
    Account(String),
    #[error("opening session failed for {0}")]
    Open(String),
    #[error("establishing credentials failed for {0}")]
    Credentials(String),
    #[error("closing session failed for {0}")]
    Close(String),
}

/// Pluggable authentication stack. `open` stands for the four-phase
/// protocol (start, account check, open session, establish credentials);
/// the returned handle's `close` deletes credentials and ends the session.
pub trait SessionProvider {
    fn open(&self, login: &str) -> Result<Box<dyn UserSession>, SessionError>;
}

pub trait UserSession {
    fn close(self: Box<Self>) -> Result<(), SessionError>;
}

/// Provider used when no authentication stack is configured. Inert: a
/// build without a session stack behaves identically in every other
/// respect.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSession;

impl SessionProvider for NullSession {
    fn open(&self, _login: &str) -> Result<Box<dyn UserSession>, SessionError> {
        Ok(Box::new(NullHandle))
    }
}

struct NullHandle;

impl UserSession for NullHandle {
    fn close(self: Box<Self>) -> Result<(), SessionError> {
        Ok(())
    }
}
