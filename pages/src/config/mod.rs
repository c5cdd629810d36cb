mod error;
mod global;
mod project;

pub use error::*;
pub use global::*;
pub use project::*;
