//! SIP dialogs (RFC 3261 §12)
//!
//! A dialog is the peer-to-peer relationship created by an INVITE and a
//! 101-299 response with a To tag. It carries the state needed to build
//! requests inside the call: route set, remote target and CSeq numbers.

mod dialog_id;
mod dialog_impl;
mod dialog_state;
mod table;

pub use dialog_id::DialogId;
pub use dialog_impl::Dialog;
pub use dialog_state::DialogState;
pub use table::DialogTable;
