pub mod error;

pub use error::{Error, ErrorKind, Result};

/// External user identifier. Assigned by the chat transport, never
/// generated by the core.
pub type UserId = i64;
