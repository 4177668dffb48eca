//! # LWS Dialog Core
//!
//! Transaction and dialog layer of the LWS SIP user agent (RFC 3261 §12,
//! §13, §17) plus the client side of Digest authentication.
//!
//! ```text
//!        transaction user (agent)
//!             ▲          │
//!   EngineEvent          │ send_request / send_response / cancel
//!             │          ▼
//!   ┌──────────────────────────────────┐
//!   │            SipEngine             │
//!   │  ┌────────────┐  ┌────────────┐  │      ┌────────────┐
//!   │  │transactions│  │  dialogs   │  │◀────▶│ TimerWheel │
//!   │  └────────────┘  └────────────┘  │      └────────────┘
//!   └──────────────────────────────────┘
//!             ▲          │
//!    on_message          │ poll_transmit
//!             │          ▼
//!               transport
//! ```
//!
//! The engine never touches a socket. Its owner reads from a transport,
//! feeds parsed messages in, and writes out whatever
//! [`SipEngine::poll_transmit`] returns.

pub mod auth;
pub mod dialog;
pub mod engine;
pub mod error;
pub mod transaction;

pub use auth::{AuthContext, Credentials};
pub use dialog::{Dialog, DialogId, DialogState, DialogTable};
pub use engine::{
    EngineConfig, EngineEvent, Outgoing, SipEngine, TimerFired, TimerTarget, UserTimer,
};
pub use error::{Error, Result};
pub use transaction::{
    Action, ClientTransaction, ServerTransaction, TimerSettings, TimerType, TransactionKey,
    TransactionKind, TransactionState,
};

/// Commonly used items
pub mod prelude {
    pub use crate::auth::{AuthContext, Credentials};
    pub use crate::dialog::{DialogId, DialogState};
    pub use crate::engine::{EngineConfig, EngineEvent, Outgoing, SipEngine, UserTimer};
    pub use crate::error::{Error, Result};
    pub use crate::transaction::{TimerSettings, TransactionKey, TransactionState};
}
