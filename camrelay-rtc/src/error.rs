use crate::types::SessionId;
use camrelay_hls::{HlsError, MpegTsError};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RelayError>;

/// Per-frame and per-leg media failures
#[derive(Error, Debug)]
pub enum MediaError {
    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Codec unavailable: {0}")]
    CodecUnavailable(String),

    #[error("Read timed out")]
    Timeout,

    #[error("Track ended")]
    TrackEnded,

    #[error("Mux error: {0}")]
    Mux(#[from] MpegTsError),
}

impl MediaError {
    /// Errors after which the source yields nothing more.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::TrackEnded)
    }
}

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("WebRTC error: {0}")]
    WebRtc(#[from] webrtc::Error),

    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("Invalid signaling message: {0}")]
    InvalidMessage(String),

    #[error("Signaling send failed: {0}")]
    Signaling(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("HLS error: {0}")]
    Hls(#[from] HlsError),

    #[error("Manager is shut down")]
    ShutDown,
}

impl From<serde_json::Error> for RelayError {
    fn from(e: serde_json::Error) -> Self {
        Self::InvalidMessage(e.to_string())
    }
}
