//! Error types for the server library.

use shared::codec::CodecError;
use shared::level::LevelError;
use std::io;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: String, source: io::Error },

    #[error("invalid configuration: {0}")]
    Config(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("world error: {0}")]
    Level(#[from] LevelError),
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("scheduler is shutting down")]
    ShuttingDown,

    #[error("repeat count must be positive, got {0}")]
    InvalidRepeatCount(u32),

    #[error("failed to spawn scheduler thread: {0}")]
    Spawn(io::Error),
}

/// Errors that end a session's I/O loop.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("protocol error: {0}")]
    Codec(#[from] CodecError),

    #[error("world error: {0}")]
    Level(#[from] LevelError),

    #[error("kick was not delivered in time")]
    KickTimeout,
}

impl SessionError {
    /// Transport failures are ordinary disconnects rather than bugs.
    pub fn is_transport(&self) -> bool {
        match self {
            SessionError::Io(err) => is_transport_kind(err.kind()),
            SessionError::Codec(CodecError::Io(err)) => is_transport_kind(err.kind()),
            SessionError::KickTimeout => true,
            _ => false,
        }
    }
}

fn is_transport_kind(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::TimedOut
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::NotConnected
    )
}
