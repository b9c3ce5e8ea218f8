//! External collaborators the core treats as contracts only (spec.md §6):
//! the platform audio sink and the platform file abstraction.

pub mod file;
pub mod sink;

pub use file::AsyncFile;
pub use sink::{FakeSink, Sink};
