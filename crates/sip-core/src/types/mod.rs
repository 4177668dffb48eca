//! SIP message model

pub mod address;
pub mod cseq;
pub mod header;
pub mod message;
pub mod method;
pub mod param;
pub mod status;
pub mod uri;
pub mod via;

pub use address::NameAddr;
pub use cseq::CSeq;
pub use header::{Header, HeaderName, Headers};
pub use message::{Message, Request, Response, SipMessage, SIP_VERSION};
pub use method::Method;
pub use param::Param;
pub use status::StatusCode;
pub use uri::{Scheme, Uri};
pub use via::{Via, BRANCH_MAGIC_COOKIE, MAX_BRANCH_LEN};
