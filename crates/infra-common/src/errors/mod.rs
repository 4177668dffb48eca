//! Error types and status codes shared by every LWS crate

pub mod code;
pub mod types;

pub use code::*;
pub use types::{Error, Result};
