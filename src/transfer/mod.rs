// Transfer engine abstraction: the capability seam to the swarm engine, plus an in-memory backend.

pub mod memory;
pub mod traits;

pub use traits::{
    EngineError, FileEntry, PiecePriority, Transfer, TransferEngine, TransferInfo, TransferStats,
};
