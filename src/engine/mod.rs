// Streaming core: session lifecycle, file selection, piece scheduling, blocking reads and stats.

pub mod file;
pub mod reader;
pub mod scheduler;
pub mod selector;
pub mod session;
pub mod stats;
pub mod status;

pub use file::FileDescriptor;
pub use reader::FileReader;
pub use scheduler::{PieceScheduler, PriorityWindow};
pub use selector::select_file;
pub use session::SessionManager;
pub use stats::{progress_percent, StatsCollector, StatsSample};
pub use status::{SessionState, StatusSnapshot};
