use thiserror::Error;

use crate::transfer::EngineError;

/// Errors surfaced by the session manager, the streaming reader and the HTTP surface.
#[derive(Debug, Error)]
pub enum StreamError {
    /// Missing or invalid request parameters.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The engine could not produce metadata for the descriptor.
    #[error("resolution failed: {0}")]
    Resolution(String),

    /// The swarm exposes no file that could be streamed.
    #[error("no playable file in transfer")]
    NoPlayableFile,

    /// A stream was requested while no file is selected.
    #[error("no active session")]
    NoActiveSession,

    /// The requested range starts beyond the end of the file.
    #[error("range not satisfiable for length {length}")]
    RangeNotSatisfiable { length: u64 },

    /// The read was aborted because its session was stopped or replaced.
    #[error("read cancelled")]
    Cancelled,

    /// No piece arrived within the stall timeout.
    #[error("timed out waiting for piece {piece}")]
    ReadTimeout { piece: u32 },

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
}
