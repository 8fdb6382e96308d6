//! Signaling messages exchanged with the camera's signaling channel.
//!
//! Inbound messages are JSON objects discriminated by their `key` field and
//! parse into the closed [`InboundSignal`] enum. Outbound messages are sent
//! through a [`SignalingSink`].

use crate::error::{RelayError, Result};
use crate::types::{DeviceId, SessionId, SiteId};
use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};

/// Session description record (`{"type": "...", "sdp": "..."}`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescriptionPayload {
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
}

impl SessionDescriptionPayload {
    #[must_use]
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: "answer".to_string(),
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidatePayload {
    /// Candidate attribute value (`candidate:...`)
    #[serde(rename = "sdp", alias = "candidate")]
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
}

/// Relay (TURN) server credentials for one session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayCredentials {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub username: String,
    #[serde(default, alias = "credential")]
    pub password: String,
}

impl RelayCredentials {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        !self.url.is_empty() && !self.username.is_empty() && !self.password.is_empty()
    }
}

/// Camera offer
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Offer {
    pub session_id: SessionId,
    pub device_id: DeviceId,
    #[serde(default = "unknown_site")]
    pub site_id: SiteId,
    #[serde(deserialize_with = "description_from_object_or_text")]
    pub offer: SessionDescriptionPayload,
}

fn unknown_site() -> SiteId {
    SiteId::new("unknown")
}

/// Inbound signaling message
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "key")]
pub enum InboundSignal {
    #[serde(rename = "video.webrtc.offer")]
    Offer(Offer),

    #[serde(rename = "video.webrtc.candidate")]
    Candidate {
        session_id: SessionId,
        candidate: CandidatePayload,
    },

    #[serde(rename = "video.webrtc.turn.config")]
    RelayCredentials {
        session_id: SessionId,
        #[serde(rename = "turn")]
        credentials: RelayCredentials,
    },

    #[serde(rename = "video.webrtc.hang_up")]
    HangUp { session_id: SessionId },

    #[serde(rename = "video.webrtc.keep_alive")]
    KeepAlive {
        #[serde(default)]
        session_id: Option<SessionId>,
    },

    #[serde(rename = "video.webrtc.start")]
    Start {
        #[serde(default)]
        session_id: Option<SessionId>,
    },

    #[serde(rename = "video.webrtc.session")]
    Session {
        #[serde(default)]
        session_id: Option<SessionId>,
    },

    /// Answer echoed back by the signaling service.
    #[serde(rename = "video.webrtc.answer")]
    Answer {
        #[serde(default)]
        session_id: Option<SessionId>,
    },
}

impl InboundSignal {
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    #[must_use]
    pub const fn key(&self) -> &'static str {
        match self {
            Self::Offer(_) => "video.webrtc.offer",
            Self::Candidate { .. } => "video.webrtc.candidate",
            Self::RelayCredentials { .. } => "video.webrtc.turn.config",
            Self::HangUp { .. } => "video.webrtc.hang_up",
            Self::KeepAlive { .. } => "video.webrtc.keep_alive",
            Self::Start { .. } => "video.webrtc.start",
            Self::Session { .. } => "video.webrtc.session",
            Self::Answer { .. } => "video.webrtc.answer",
        }
    }
}

/// Offers may arrive as an object or as that object serialized to text,
/// sometimes wrapped in tuple-like punctuation.
fn description_from_object_or_text<'de, D>(
    deserializer: D,
) -> std::result::Result<SessionDescriptionPayload, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Object(SessionDescriptionPayload),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Object(description) => Ok(description),
        Raw::Text(text) => {
            let trimmed = text.trim().trim_matches(|c| matches!(c, '(' | ')' | '\'' | ','));
            serde_json::from_str(trimmed).map_err(serde::de::Error::custom)
        }
    }
}

/// Outbound signaling message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "key")]
pub enum OutboundSignal {
    #[serde(rename = "video.webrtc.answer")]
    Answer {
        session_id: SessionId,
        answer: SessionDescriptionPayload,
        forward: bool,
    },

    #[serde(rename = "video.webrtc.candidate")]
    Candidate {
        session_id: SessionId,
        candidate: CandidatePayload,
        forward: bool,
    },
}

impl OutboundSignal {
    #[must_use]
    pub fn answer(session_id: SessionId, sdp: impl Into<String>) -> Self {
        Self::Answer {
            session_id,
            answer: SessionDescriptionPayload::answer(sdp),
            forward: true,
        }
    }

    #[must_use]
    pub fn candidate(session_id: SessionId, candidate: CandidatePayload) -> Self {
        Self::Candidate {
            session_id,
            candidate,
            forward: true,
        }
    }

    #[must_use]
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::Answer { session_id, .. } | Self::Candidate { session_id, .. } => session_id,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Delivers outbound messages to the signaling channel.
#[async_trait]
pub trait SignalingSink: Send + Sync {
    async fn send(&self, message: OutboundSignal) -> Result<()>;
}

#[async_trait]
impl SignalingSink for tokio::sync::mpsc::UnboundedSender<OutboundSignal> {
    async fn send(&self, message: OutboundSignal) -> Result<()> {
        tokio::sync::mpsc::UnboundedSender::send(self, message)
            .map_err(|_| RelayError::Signaling("signaling channel closed".to_string()))
    }
}
