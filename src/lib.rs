//! shepherd-mcp - a long-lived supervisor that multiplexes Worker CLI tasks.
//!
//! Each task is one supervised invocation of an external command-line worker
//! whose NDJSON event stream drives a bounded lifecycle (working,
//! input_required, completed, failed, cancelled). A small set of control
//! tools (start, list, respond, cancel, health) is exposed over a line-framed
//! stdio protocol; task artifacts are checkpointed to disk for inspection and
//! crash recovery.

pub mod config;
pub mod persistence;
pub mod pool;
pub mod server;
pub mod task;
pub mod tools;
pub mod worker;
