pub mod config;
pub mod engine;
pub mod error;
pub mod server;
pub mod telemetry;
pub mod transfer;

pub use config::StreamConfig;
pub use engine::{SessionManager, SessionState, StatusSnapshot};
pub use error::StreamError;
pub use server::{shutdown_signal, StreamServer};
