//! Core domain types and errors shared across the engine.

pub mod errors;
pub mod types;

pub use errors::BinaryError;
pub use types::{BuildId, DsoType, BUILD_ID_SIZE};
