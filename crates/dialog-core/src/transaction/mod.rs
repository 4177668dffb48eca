//! SIP transaction state machines (RFC 3261 §17)
//!
//! Four machines cover every transaction:
//!
//! ```text
//! INVITE client      Calling ─1xx─▶ Proceeding ─2xx─▶ Terminated
//!                       │               │
//!                       └───3xx-6xx─────┴──▶ Completed ─Timer D─▶ Terminated
//!
//! INVITE server      Proceeding ─2xx─▶ Terminated
//!                       └─3xx-6xx─▶ Completed ─ACK─▶ Confirmed ─Timer I─▶ Terminated
//!
//! non-INVITE client  Trying ─1xx─▶ Proceeding ─final─▶ Completed ─Timer K─▶ Terminated
//! non-INVITE server  Trying ─1xx─▶ Proceeding ─final─▶ Completed ─Timer J─▶ Terminated
//! ```
//!
//! The machines here are pure: they consume responses, requests and timer
//! expirations and return [`Action`]s. The engine owns the timers, the
//! transport and the dialog table, and applies the actions.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use lws_sip_core::{Method, Response, SipMessage};
use serde::{Deserialize, Serialize};

pub mod client;
pub mod server;
pub mod timer;

pub use client::ClientTransaction;
pub use server::ServerTransaction;
pub use timer::{TimerSettings, TimerType};

/// Matches messages to transactions: top Via branch plus CSeq method.
///
/// ACK to a non-2xx final shares the INVITE's key; CANCEL has its own key
/// with the INVITE's branch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionKey {
    pub branch: String,
    pub method: Method,
    pub is_server: bool,
}

impl TransactionKey {
    pub fn new(branch: impl Into<String>, method: Method, is_server: bool) -> Self {
        Self {
            branch: branch.into(),
            method,
            is_server,
        }
    }

    /// Key of the client transaction a response belongs to
    pub fn for_response(response: &Response) -> lws_sip_core::Result<Self> {
        Ok(Self::new(response.branch()?, response.cseq()?.method, false))
    }

    /// Same branch and role, different method (CANCEL ↔ INVITE)
    pub fn with_method(&self, method: Method) -> Self {
        Self::new(self.branch.clone(), method, self.is_server)
    }
}

impl fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.branch,
            self.method,
            if self.is_server { "server" } else { "client" }
        )
    }
}

/// Which of the four machines a transaction runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionKind {
    InviteClient,
    NonInviteClient,
    InviteServer,
    NonInviteServer,
}

impl TransactionKind {
    pub fn is_server(&self) -> bool {
        matches!(
            self,
            TransactionKind::InviteServer | TransactionKind::NonInviteServer
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionState {
    Calling,
    Trying,
    Proceeding,
    Completed,
    Confirmed,
    Terminated,
}

/// Effects requested by a state machine
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Put bytes on the wire towards the transaction's peer
    Transmit(Bytes),
    StartTimer(TimerType, Duration),
    StopTimer(TimerType),
    /// Hand a response to the transaction user
    Deliver(Response),
    /// The transaction timed out (Timer B, F or H)
    Timeout,
    /// Remove the transaction
    Terminate,
}

/// Records a state change in the transaction's state field
pub(crate) fn transition(
    key: &TransactionKey,
    state: &mut TransactionState,
    next: TransactionState,
) {
    if *state != next {
        tracing::debug!(transaction = %key, from = ?*state, to = ?next, "Transaction state changed");
        *state = next;
    }
}
