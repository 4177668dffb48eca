//! Callback interfaces and the states they report
//!
//! An application implements [`AgentHandler`] for signaling events and
//! [`SessionHandler`] for media events of established calls. Both are called
//! from inside [`Agent::run_once`](crate::Agent::run_once) and the agent
//! operations, one at a time, so callbacks of one agent never overlap.
//!
//! ```rust
//! use async_trait::async_trait;
//! use lws_client_core::{AgentHandler, CallAction, CallStatusInfo, IncomingCallInfo};
//!
//! struct AutoAnswer;
//!
//! #[async_trait]
//! impl AgentHandler for AutoAnswer {
//!     async fn on_incoming_call(&self, call: IncomingCallInfo) -> CallAction {
//!         println!("{} is calling", call.from);
//!         CallAction::Accept
//!     }
//!
//!     async fn on_call_state(&self, info: CallStatusInfo) {
//!         println!("{} is now {}", info.peer, info.state);
//!     }
//! }
//! ```

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use lws_infra_common::ErrorCode;
use lws_media_core::MediaInfo;
use serde::{Deserialize, Serialize};

/// Stable handle of one call. Handles are never reused by an agent; an
/// operation on the handle of a finished call does nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallHandle(pub u64);

impl fmt::Display for CallHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "call-{}", self.0)
    }
}

/// Registration with the configured server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistrationState {
    None,
    Registering,
    Registered,
    Unregistering,
    Unregistered,
    Failed,
}

impl fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RegistrationState::None => "none",
            RegistrationState::Registering => "registering",
            RegistrationState::Registered => "registered",
            RegistrationState::Unregistering => "unregistering",
            RegistrationState::Unregistered => "unregistered",
            RegistrationState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Call progress as seen by the application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    /// INVITE sent, nothing heard back beyond 100
    Calling,
    /// INVITE received, not answered yet
    Incoming,
    /// The peer is alerting (180/183)
    Ringing,
    /// 2xx exchanged, media running
    Established,
    /// BYE sent, waiting for its response
    Terminating,
    /// The call ended after being set up, or was cancelled
    Terminated,
    /// The call never got established
    Failed,
}

impl CallState {
    /// Whether the call is over
    pub fn is_final(&self) -> bool {
        matches!(self, CallState::Terminated | CallState::Failed)
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallState::Calling => "calling",
            CallState::Incoming => "incoming",
            CallState::Ringing => "ringing",
            CallState::Established => "established",
            CallState::Terminating => "terminating",
            CallState::Terminated => "terminated",
            CallState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Which side placed the call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

/// A call changed state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallStatusInfo {
    pub call: CallHandle,
    /// Remote party URI
    pub peer: String,
    pub direction: CallDirection,
    pub state: CallState,
    pub previous: Option<CallState>,
    /// SIP status behind the change, when a response caused it
    pub status: Option<u16>,
}

/// A new INVITE arrived
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingCallInfo {
    pub call: CallHandle,
    /// From URI
    pub from: String,
    /// To URI
    pub to: String,
    pub display_name: Option<String>,
    /// The offer, if the INVITE carried one
    pub sdp: Option<String>,
}

/// What to do with an incoming call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallAction {
    /// Answer right away
    Accept,
    /// Refuse with 486 Busy Here
    Reject,
    /// Leave it ringing; the application answers or rejects it later
    Ignore,
}

/// Signaling callbacks. Every method has a no-op default.
#[async_trait]
pub trait AgentHandler: Send + Sync {
    /// Registration moved to `state`; `code` is the SIP status behind it or 0
    async fn on_reg_state(&self, state: RegistrationState, code: u16) {
        let _ = (state, code);
    }

    async fn on_call_state(&self, info: CallStatusInfo) {
        let _ = info;
    }

    /// 180 Ringing has already been sent when this is called
    async fn on_incoming_call(&self, call: IncomingCallInfo) -> CallAction {
        let _ = call;
        CallAction::Ignore
    }

    /// Asynchronous failures: transport errors, failed MESSAGEs
    async fn on_error(&self, code: ErrorCode, description: &str) {
        let _ = (code, description);
    }

    /// A MESSAGE request arrived (it has been answered with 200)
    async fn on_message(&self, from: &str, to: &str, content: &str) {
        let _ = (from, to, content);
    }
}

/// Media callbacks for calls of one agent
#[async_trait]
pub trait SessionHandler: Send + Sync {
    /// Media is flowing with the negotiated codecs
    async fn on_media_ready(&self, call: CallHandle, info: MediaInfo) {
        let _ = (call, info);
    }

    /// One decoded audio frame. `timestamp` is the RTP timestamp.
    async fn on_audio_frame(&self, call: CallHandle, data: Bytes, timestamp: u32) {
        let _ = (call, data, timestamp);
    }

    /// One reassembled video frame
    async fn on_video_frame(&self, call: CallHandle, data: Bytes, timestamp: u32) {
        let _ = (call, data, timestamp);
    }

    /// The peer hung up
    async fn on_bye(&self, call: CallHandle) {
        let _ = call;
    }

    async fn on_error(&self, call: CallHandle, code: ErrorCode) {
        let _ = (call, code);
    }
}

/// Handler that ignores everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHandler;

impl AgentHandler for NoopHandler {}

impl SessionHandler for NoopHandler {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_names() {
        assert_eq!(RegistrationState::Unregistering.to_string(), "unregistering");
        assert_eq!(CallState::Established.to_string(), "established");
        assert_eq!(CallHandle(7).to_string(), "call-7");
        assert!(CallState::Failed.is_final());
        assert!(!CallState::Terminating.is_final());
    }

    #[tokio::test]
    async fn test_default_handler_leaves_calls_ringing() {
        let info = IncomingCallInfo {
            call: CallHandle(1),
            from: "sip:alice@example.com".into(),
            to: "sip:bob@example.com".into(),
            display_name: None,
            sdp: None,
        };
        assert_eq!(NoopHandler.on_incoming_call(info).await, CallAction::Ignore);
    }
}
