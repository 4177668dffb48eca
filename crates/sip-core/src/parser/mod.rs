//! nom-based parsers for SIP messages and header values

pub mod address;
pub mod common;
pub mod framer;
pub mod message;
pub mod uri;
pub mod via;

pub use common::ParseResult;
pub use framer::StreamFramer;
pub use message::{
    parse_headers, parse_incremental, parse_message, parse_start_line, Parsed, StartLine,
    MAX_MESSAGE_SIZE,
};
