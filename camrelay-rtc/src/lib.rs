//! Camera relay sessions
//!
//! Answers WebRTC offers from cameras and turns their media into one of two
//! outputs, chosen by [`StreamingMode`]:
//!
//! - **publish-to-bus**: every decoded picture becomes a JPEG snapshot on
//!   `<prefix>/<site>/<device>/snapshot`
//! - **relay-to-playlist**: decoded frames are re-encoded into MPEG-TS
//!   segments and served as a rolling HLS playlist per device
//!
//! ## Architecture
//!
//! - **`SessionManager`**: owns sessions, dispatches signaling, runs teardown
//! - **`Negotiator`**: peer connection setup, answers, candidates
//! - **`FrameRouter`**: decides what each received track feeds
//! - **`SegmentWriter`**: per-device segmenting loop over bounded queues
//! - **`SnapshotLoop`**: per-track JPEG publishing loop
//!
//! ## Usage
//!
//! ```rust,ignore
//! use camrelay_rtc::{RelayConfig, SessionManager};
//!
//! let manager = SessionManager::new(RelayConfig::default(), signaling, publisher)?;
//! manager.dispatch_json(r#"{"key":"video.webrtc.hang_up","session_id":"s1"}"#).await;
//! manager.shutdown().await;
//! ```

pub mod codec;
mod config;
mod error;
mod manager;
mod muxer;
mod negotiator;
mod queue;
mod router;
pub mod sdp;
mod session;
mod signaling;
mod snapshot;
mod source;
mod tasks;
mod types;

pub use config::{HlsConfig, IceConfig, MediaConfig, RelayConfig, SnapshotConfig, StreamingMode};
pub use error::{MediaError, RelayError, Result};
pub use manager::SessionManager;
pub use muxer::{MuxerSettings, MuxerShared, SegmentWriter};
pub use negotiator::Negotiator;
pub use queue::{FrameQueue, OverflowPolicy, PushOutcome};
pub use router::{AudioReadPolicy, FrameRouter, Route};
pub use session::{Session, SessionState};
pub use signaling::{
    CandidatePayload, InboundSignal, Offer, OutboundSignal, RelayCredentials,
    SessionDescriptionPayload, SignalingSink,
};
pub use snapshot::{snapshot_topic, BusPublisher, Qos, SnapshotLoop};
pub use source::{AudioSource, RemoteCodec, VideoSource};
pub use tasks::TaskRegistry;
pub use types::{DeviceId, SessionId, SiteId, TrackKind};
