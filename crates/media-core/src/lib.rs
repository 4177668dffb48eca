//! Media layer of the LWS stack
//!
//! - `codec`: codec catalogue and G.711 companding
//! - `payload`: RTP payload formats (G.711, H.264, H.265, VP8, VP9)
//! - `sdp`: offer/answer negotiation
//! - `ice`: the interface an ICE agent implements, plus a host-only agent
//! - `session`: [`MediaSession`], which owns the sockets of one call

mod error;

pub mod codec;
pub mod ice;
pub mod payload;
pub mod sdp;
pub mod session;

pub use error::{Error, Result};

pub use codec::{CodecId, MediaKind};
pub use ice::{HostIceAgent, IceAgent, IceRole, IceState};
pub use sdp::{IceCredentials, NegotiatedStream};
pub use session::{
    AudioInfo, MediaEvent, MediaInfo, MediaSession, MediaSessionStats, SessionConfig,
    SessionEvent, SessionId, SessionState, StreamSettings, VideoFormat, VideoInfo,
};

/// Prelude module with commonly used types
pub mod prelude {
    pub use crate::{
        CodecId, Error, MediaEvent, MediaInfo, MediaKind, MediaSession, Result, SessionConfig,
        SessionEvent, SessionId, SessionState, StreamSettings,
    };
}
