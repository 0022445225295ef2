// Loopback HTTP surface for the player.

pub mod handler;

pub use handler::{router, shutdown_signal, StreamServer};
