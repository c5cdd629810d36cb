//! Pages Core - Shared types
//!
//! Types shared between the process supervisor (`pages-spawn`), the local
//! reverse proxy (`pages-dev-proxy`) and the `pages` CLI: supervised log
//! lines, project kinds, and the payloads exchanged with the remote dev
//! session API and with function request handlers.

mod log;
mod protocol;

pub use log::*;
pub use protocol::*;
