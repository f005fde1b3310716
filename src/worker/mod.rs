//! Worker CLI integration: event codec, process driver, kill primitive.

pub mod events;
pub mod kill;
pub mod runner;

pub use events::{parse_line, WorkerEvent};
pub use runner::{WorkerRunner, WORKER_TIMEOUT};
