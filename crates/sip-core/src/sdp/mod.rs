//! Session Description Protocol model, parser and serializer

pub mod candidate;
pub mod media;
pub mod parser;
pub mod session;

pub use candidate::{Candidate, CandidateType};
pub use media::{Attribute, Direction, MediaDescription, RtpMap};
pub use parser::parse_sdp;
pub use session::{Connection, Origin, SessionDescription};
