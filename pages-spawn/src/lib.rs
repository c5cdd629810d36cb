//! Pages Spawn - Supervised child processes
//!
//! Spawns shell commands (or programs) as child processes, relays their
//! stdout/stderr as ordered [`LogItem`](pages_core::LogItem) streams, and
//! guarantees the child is terminated when its stream is cancelled or
//! dropped. Every live child is tracked in an explicitly owned
//! [`ProcessRegistry`] so the application can terminate everything on exit.

mod error;
mod registry;
mod shell;
mod signal;
mod supervisor;

pub use error::*;
pub use registry::*;
pub use shell::{Invocation, split_command_line};
pub use supervisor::*;
