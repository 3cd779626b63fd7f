//! Execution layer: result sets and the stores that produce them.

pub mod result;
pub mod store;

pub use result::{QueryResult, NO_OUTPUT_MARKER};
pub use store::{BackingStore, FrameStore, SqliteStore};
