//! Session Manager - top-level owner of every relay session
//!
//! This module provides:
//! - Closed dispatch of inbound signaling messages
//! - Offer handling, trickled answers and remote candidates
//! - Relay credential caching for offers that have not arrived yet
//! - Per-device segment pipelines and the lazily started HLS exposer
//! - A single task registry swept at shutdown

use crate::codec::{EncoderFactory, NativeEncoders};
use crate::config::{RelayConfig, StreamingMode};
use crate::error::{RelayError, Result};
use crate::muxer::{MuxerSettings, MuxerShared, SegmentWriter};
use crate::negotiator::{pump_silence, watch_connectivity, Negotiator};
use crate::router::{feed_audio, feed_video, FrameRouter, Route};
use crate::sdp::{extract_candidates, has_media, rewrite_h264_profile, strip_candidates};
use crate::session::{Session, SessionState};
use crate::signaling::{
    CandidatePayload, InboundSignal, Offer, OutboundSignal, RelayCredentials, SignalingSink,
};
use crate::snapshot::BusPublisher;
use crate::source::{RemoteAudioSource, RemoteCodec, RemoteVideoSource};
use crate::tasks::TaskRegistry;
use crate::types::{DeviceId, SessionId};
use camrelay_hls::{
    FileStorage, HlsError, HlsRegistry, HlsServer, HlsServerHandle, PlaylistBuilder,
    SegmentStorage, WindowConfig,
};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use tempfile::TempDir;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::track::track_remote::TrackRemote;

/// A streaming device's segment writer and its scratch directory.
struct DevicePipeline {
    session_id: SessionId,
    shared: Arc<MuxerShared>,
    writer: AbortHandle,
    // removed from disk on drop
    _segments: TempDir,
}

pub struct SessionManager {
    config: RelayConfig,
    negotiator: Negotiator,
    router: FrameRouter,
    signaling: Arc<dyn SignalingSink>,
    encoders: Arc<dyn EncoderFactory>,

    /// Active sessions (uses DashMap for lock-free concurrent access)
    sessions: DashMap<SessionId, Arc<Session>>,
    /// One active session per device
    device_sessions: DashMap<DeviceId, SessionId>,
    pipelines: DashMap<DeviceId, DevicePipeline>,
    pipeline_lock: tokio::sync::Mutex<()>,
    relay_credentials: DashMap<SessionId, RelayCredentials>,

    hls: HlsRegistry,
    exposer: tokio::sync::Mutex<Option<HlsServerHandle>>,
    tasks: TaskRegistry,
    this: Weak<Self>,
}

impl SessionManager {
    /// Create a manager encoding with openh264 and libopus.
    pub fn new(
        config: RelayConfig,
        signaling: Arc<dyn SignalingSink>,
        publisher: Arc<dyn BusPublisher>,
    ) -> Result<Arc<Self>> {
        Self::with_encoders(config, signaling, publisher, Arc::new(NativeEncoders))
    }

    pub fn with_encoders(
        config: RelayConfig,
        signaling: Arc<dyn SignalingSink>,
        publisher: Arc<dyn BusPublisher>,
        encoders: Arc<dyn EncoderFactory>,
    ) -> Result<Arc<Self>> {
        let negotiator = Negotiator::new(config.ice.clone())?;
        let router = FrameRouter::new(
            config.mode,
            config.media.clone(),
            config.snapshot.clone(),
            publisher,
        );

        let manager = Arc::new_cyclic(|this| Self {
            config,
            negotiator,
            router,
            signaling,
            encoders,
            sessions: DashMap::new(),
            device_sessions: DashMap::new(),
            pipelines: DashMap::new(),
            pipeline_lock: tokio::sync::Mutex::new(()),
            relay_credentials: DashMap::new(),
            hls: HlsRegistry::new(),
            exposer: tokio::sync::Mutex::new(None),
            tasks: TaskRegistry::new(),
            this: this.clone(),
        });

        info!(
            mode = ?manager.config.mode,
            stun_servers = manager.config.ice.stun_servers.len(),
            "Session manager initialized"
        );
        Ok(manager)
    }

    #[must_use]
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn session(&self, session_id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.get(session_id).map(|s| Arc::clone(s.value()))
    }

    #[must_use]
    pub fn session_for_device(&self, device_id: &DeviceId) -> Option<SessionId> {
        self.device_sessions.get(device_id).map(|s| s.value().clone())
    }

    #[must_use]
    pub fn relay_credentials(&self, session_id: &SessionId) -> Option<RelayCredentials> {
        self.relay_credentials.get(session_id).map(|c| c.value().clone())
    }

    #[must_use]
    pub fn hls_registry(&self) -> &HlsRegistry {
        &self.hls
    }

    /// Address of the HLS exposer, once started.
    pub async fn exposer_addr(&self) -> Option<SocketAddr> {
        self.exposer.lock().await.as_ref().map(HlsServerHandle::local_addr)
    }

    #[must_use]
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Routes one inbound message. Failures are logged, never propagated.
    pub async fn dispatch(&self, signal: InboundSignal) {
        debug!(key = signal.key(), "Inbound signaling message");
        match signal {
            InboundSignal::Offer(offer) => {
                let session_id = offer.session_id.clone();
                if let Err(e) = self.handle_offer(offer).await {
                    error!(session_id = %session_id, error = %e, "Offer handling failed");
                }
            }
            InboundSignal::Candidate {
                session_id,
                candidate,
            } => self.add_remote_candidate(&session_id, candidate).await,
            InboundSignal::RelayCredentials {
                session_id,
                credentials,
            } => self.store_relay_credentials(session_id, credentials),
            InboundSignal::HangUp { session_id } => {
                info!(session_id = %session_id, "Hang-up received");
                self.close_session(&session_id).await;
            }
            InboundSignal::KeepAlive { session_id } => {
                debug!(session_id = ?session_id, "Keep-alive acknowledged");
            }
            InboundSignal::Start { session_id }
            | InboundSignal::Session { session_id }
            | InboundSignal::Answer { session_id } => {
                debug!(session_id = ?session_id, "Informational message acknowledged");
            }
        }
    }

    /// Parses and dispatches one JSON message; unparseable input is dropped.
    pub async fn dispatch_json(&self, text: &str) {
        match InboundSignal::from_json(text) {
            Ok(signal) => self.dispatch(signal).await,
            Err(e) => warn!(error = %e, "Dropping unrecognized signaling message"),
        }
    }

    /// Negotiates a session for `offer` and emits the answer followed by
    /// the local candidates. A previous session of the same device, or
    /// with the same id, is closed first.
    pub async fn handle_offer(&self, offer: Offer) -> Result<()> {
        if self.tasks.is_shut_down() {
            return Err(RelayError::ShutDown);
        }
        let Offer {
            session_id,
            device_id,
            site_id,
            offer,
        } = offer;
        info!(session_id = %session_id, device_id = %device_id, site_id = %site_id, "Offer received");

        let credentials = self.relay_credentials(&session_id);
        if let Some(previous) = self.session_for_device(&device_id) {
            if previous != session_id {
                info!(device_id = %device_id, previous = %previous, "Replacing device session");
            }
            self.close_session(&previous).await;
        }
        if self.sessions.contains_key(&session_id) {
            self.close_session(&session_id).await;
        }
        if let Some(credentials) = &credentials {
            self.relay_credentials
                .insert(session_id.clone(), credentials.clone());
        } else {
            debug!(session_id = %session_id, "No relay credentials, direct connectivity only");
        }

        debug!(
            session_id = %session_id,
            audio = has_media(&offer.sdp, "audio"),
            video = has_media(&offer.sdp, "video"),
            "Offer media sections"
        );
        let sdp = rewrite_h264_profile(&offer.sdp);
        let peer_connection = self.negotiator.create_connection(credentials.as_ref()).await?;
        let session = Arc::new(Session::new(
            session_id.clone(),
            device_id.clone(),
            site_id,
            peer_connection,
            credentials,
        ));
        self.sessions.insert(session_id.clone(), Arc::clone(&session));
        self.device_sessions.insert(device_id, session_id.clone());
        self.attach_callbacks(&session);

        if let Err(e) = self.negotiate(&session, sdp).await {
            self.close_session(&session_id).await;
            return Err(e);
        }

        self.spawn_watchdog(&session);
        Ok(())
    }

    async fn negotiate(&self, session: &Arc<Session>, sdp: String) -> Result<()> {
        let peer_connection = &session.peer_connection;
        session.transition(SessionState::Negotiating);
        Negotiator::apply_offer(peer_connection, sdp).await?;

        // A waiting camera wants a non-empty audio leg before it streams.
        if self.config.mode == StreamingMode::PublishToBus {
            let track = Negotiator::attach_silence(peer_connection).await?;
            session.track_task(self.tasks.spawn("silence-pump", pump_silence(track)));
        }

        self.negotiator.create_answer(peer_connection).await?;

        let mut answer_sent = session.answer_gate().lock().await;
        let local = Negotiator::local_sdp(peer_connection).await?;
        self.signaling
            .send(OutboundSignal::answer(
                session.id.clone(),
                strip_candidates(&local),
            ))
            .await?;
        let candidates = extract_candidates(&local);
        let count = candidates.len();
        for candidate in candidates {
            self.signaling
                .send(OutboundSignal::candidate(session.id.clone(), candidate))
                .await?;
        }
        *answer_sent = true;

        info!(session_id = %session.id, candidates = count, "Answer sent");
        Ok(())
    }

    /// Applies a remote candidate. Unknown sessions and bad candidates are
    /// logged and ignored.
    pub async fn add_remote_candidate(&self, session_id: &SessionId, candidate: CandidatePayload) {
        let Some(session) = self.session(session_id) else {
            warn!(session_id = %session_id, "Candidate for unknown session");
            return;
        };
        if let Err(e) = Negotiator::add_remote_candidate(&session.peer_connection, candidate).await {
            warn!(session_id = %session_id, error = %e, "Failed to apply remote candidate");
        }
    }

    /// Caches relay credentials for the session's (possibly future) offer.
    pub fn store_relay_credentials(&self, session_id: SessionId, credentials: RelayCredentials) {
        if !credentials.is_complete() {
            warn!(session_id = %session_id, "Storing incomplete relay credentials");
        }
        debug!(session_id = %session_id, url = %credentials.url, "Relay credentials stored");
        self.relay_credentials.insert(session_id, credentials);
    }

    /// Closes a session. Idempotent; returns whether a session was open.
    pub async fn close_session(&self, session_id: &SessionId) -> bool {
        self.relay_credentials.remove(session_id);
        let Some((_, session)) = self.sessions.remove(session_id) else {
            debug!(session_id = %session_id, "Session already closed");
            return false;
        };
        self.device_sessions
            .remove_if(&session.device_id, |_, current| current == session_id);
        session.transition(SessionState::Closed);

        if let Err(e) = session.peer_connection.close().await {
            warn!(session_id = %session_id, error = %e, "Error closing peer connection");
        }
        self.teardown_pipeline(&session.device_id, session_id);
        let aborted = session.abort_tasks();

        info!(
            session_id = %session_id,
            device_id = %session.device_id,
            aborted_tasks = aborted,
            lifetime_secs = session.created_at.elapsed().as_secs(),
            "Session closed"
        );
        true
    }

    /// Cancels every task, closes every session and stops the exposer.
    pub async fn shutdown(&self) {
        info!(sessions = self.sessions.len(), "Shutting down session manager");
        self.tasks.shutdown().await;

        let session_ids: Vec<SessionId> = self.sessions.iter().map(|s| s.key().clone()).collect();
        for session_id in session_ids {
            self.close_session(&session_id).await;
        }

        self.pipelines.clear();
        self.relay_credentials.clear();
        self.hls.clear();
        if let Some(exposer) = self.exposer.lock().await.take() {
            exposer.shutdown().await;
        }
        info!("Session manager shut down");
    }

    /// Starts the HLS exposer on first use.
    pub async fn ensure_exposer(&self) -> Result<SocketAddr> {
        let mut exposer = self.exposer.lock().await;
        if let Some(handle) = exposer.as_ref() {
            return Ok(handle.local_addr());
        }
        let handle = HlsServer::new(self.config.hls.bind_addr(), self.hls.clone())
            .start()
            .await?;
        let addr = handle.local_addr();
        *exposer = Some(handle);
        Ok(addr)
    }

    fn schedule_close(&self, session_id: SessionId) {
        let manager = self.this.clone();
        self.tasks.spawn("close-session", async move {
            if let Some(manager) = manager.upgrade() {
                manager.close_session(&session_id).await;
            }
        });
    }

    fn spawn_watchdog(&self, session: &Arc<Session>) {
        let ice = self.negotiator.ice_config();
        let (checks, interval) = (ice.watchdog_checks, ice.watchdog_interval());
        let peer_connection = Arc::clone(&session.peer_connection);
        let session_id = session.id.clone();
        let manager = self.this.clone();

        let handle = self.tasks.spawn("ice-watchdog", async move {
            if watch_connectivity(&peer_connection, checks, interval).await {
                warn!(session_id = %session_id, "Connectivity never established, closing session");
                if let Some(manager) = manager.upgrade() {
                    manager.schedule_close(session_id);
                }
            }
        });
        session.track_task(handle);
    }

    fn attach_callbacks(&self, session: &Arc<Session>) {
        let peer_connection = &session.peer_connection;

        let (manager, weak_session) = (self.this.clone(), Arc::downgrade(session));
        peer_connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                let (manager, session) = (manager.clone(), weak_session.clone());
                Box::pin(async move {
                    let (Some(manager), Some(session)) = (manager.upgrade(), session.upgrade()) else {
                        return;
                    };
                    manager.on_connection_state(&session, state);
                })
            },
        ));

        let (manager, weak_session) = (self.this.clone(), Arc::downgrade(session));
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let (manager, session) = (manager.clone(), weak_session.clone());
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                let (Some(manager), Some(session)) = (manager.upgrade(), session.upgrade()) else {
                    return;
                };
                manager.trickle_candidate(&session, &candidate).await;
            })
        }));

        let (manager, weak_session) = (self.this.clone(), Arc::downgrade(session));
        peer_connection.on_track(Box::new(move |track, _receiver, _transceiver| {
            let (manager, session) = (manager.clone(), weak_session.clone());
            Box::pin(async move {
                let (Some(manager), Some(session)) = (manager.upgrade(), session.upgrade()) else {
                    return;
                };
                let attach = Arc::clone(&manager);
                manager.tasks.spawn("attach-track", async move {
                    if let Err(e) = attach.attach_track(&session, track).await {
                        error!(session_id = %session.id, error = %e, "Failed to attach track");
                    }
                });
            })
        }));
    }

    fn on_connection_state(&self, session: &Session, state: RTCPeerConnectionState) {
        match state {
            RTCPeerConnectionState::Connected => {
                if session.transition(SessionState::Connected) {
                    info!(session_id = %session.id, device_id = %session.device_id, "Session connected");
                }
            }
            RTCPeerConnectionState::Failed => {
                if session.transition(SessionState::Failed) {
                    warn!(session_id = %session.id, "Transport failed, closing session");
                    self.schedule_close(session.id.clone());
                }
            }
            RTCPeerConnectionState::Disconnected => {
                info!(session_id = %session.id, "Transport disconnected");
            }
            other => debug!(session_id = %session.id, state = %other, "Transport state changed"),
        }
    }

    /// Sends a candidate gathered after the answer went out.
    async fn trickle_candidate(&self, session: &Session, candidate: &RTCIceCandidate) {
        let answer_sent = session.answer_gate().lock().await;
        if !*answer_sent {
            // still part of the answer's local description
            return;
        }
        let init = match candidate.to_json() {
            Ok(init) => init,
            Err(e) => {
                warn!(session_id = %session.id, error = %e, "Unserializable local candidate");
                return;
            }
        };
        let payload = CandidatePayload {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
        };
        if let Err(e) = self
            .signaling
            .send(OutboundSignal::candidate(session.id.clone(), payload))
            .await
        {
            warn!(session_id = %session.id, error = %e, "Failed to trickle candidate");
        }
    }

    async fn attach_track(&self, session: &Arc<Session>, track: Arc<TrackRemote>) -> Result<()> {
        let capability = track.codec().capability;
        let Some(codec) = RemoteCodec::from_mime(&capability.mime_type, capability.channels) else {
            warn!(
                session_id = %session.id,
                codec = %capability.mime_type,
                "Unsupported track codec, ignoring"
            );
            return Ok(());
        };
        info!(
            session_id = %session.id,
            device_id = %session.device_id,
            codec = %capability.mime_type,
            ssrc = track.ssrc(),
            "Track received"
        );

        let route = self.router.route(codec.kind());
        match route {
            Route::Snapshot => {
                self.request_keyframe(session, &track).await;
                let source = RemoteVideoSource::new(track)?;
                let snapshots = self.router.snapshot_loop(&session.site_id, &session.device_id);
                let handle = self.tasks.spawn("snapshot-loop", async move {
                    snapshots.run(source).await;
                });
                session.track_task(handle);
            }
            Route::MuxVideo => {
                self.request_keyframe(session, &track).await;
                let shared = self.ensure_pipeline(session).await?;
                let source = RemoteVideoSource::new(track)?;
                let quiet = self.router.quiet_failures();
                session.track_task(self.tasks.spawn("video-reader", feed_video(source, shared, quiet)));
            }
            Route::MuxAudio => {
                let shared = self.ensure_pipeline(session).await?;
                match RemoteAudioSource::new(track, codec) {
                    Ok(source) => {
                        let policy = self.router.audio_policy();
                        session.track_task(self.tasks.spawn("audio-reader", feed_audio(source, shared, policy)));
                    }
                    Err(e) => {
                        warn!(session_id = %session.id, error = %e, "No decoder for audio track");
                        shared.mark_audio_failed();
                    }
                }
            }
            Route::Ignore => {
                debug!(session_id = %session.id, kind = %codec.kind(), "No consumer for track in this mode");
            }
        }
        Ok(())
    }

    async fn request_keyframe(&self, session: &Session, track: &TrackRemote) {
        let pli = PictureLossIndication {
            sender_ssrc: 0,
            media_ssrc: track.ssrc(),
        };
        if let Err(e) = session.peer_connection.write_rtcp(&[Box::new(pli)]).await {
            debug!(session_id = %session.id, error = %e, "Keyframe request not sent");
        }
    }

    /// Returns the device's muxer state, creating the pipeline on first use.
    async fn ensure_pipeline(&self, session: &Session) -> Result<Arc<MuxerShared>> {
        let _guard = self.pipeline_lock.lock().await;
        if let Some(pipeline) = self.pipelines.get(&session.device_id) {
            if pipeline.session_id == session.id {
                return Ok(Arc::clone(&pipeline.shared));
            }
        }
        if !self.sessions.contains_key(&session.id) {
            return Err(RelayError::SessionNotFound(session.id.clone()));
        }

        if let Err(e) = self.ensure_exposer().await {
            error!(error = %e, "HLS exposer unavailable, segments will not be served");
        }

        let segments = tempfile::Builder::new()
            .prefix("camrelay-")
            .tempdir()
            .map_err(HlsError::from)?;
        let storage: Arc<dyn SegmentStorage> = Arc::new(FileStorage::new(segments.path()));
        let store = self.hls.register(session.device_id.as_str());
        let window = WindowConfig {
            max_segments: self.config.hls.max_segments,
            grace: self.config.hls.grace_segments,
            segment_duration: self.config.hls.segment_duration(),
        };
        let builder = PlaylistBuilder::new(window, Arc::clone(&storage), store);

        let media = &self.config.media;
        let shared = Arc::new(MuxerShared::new(
            session.device_id.clone(),
            media.queue_capacity,
            media.overflow,
        ));
        let writer = SegmentWriter::new(
            Arc::clone(&shared),
            Arc::clone(&self.encoders),
            storage,
            builder,
            MuxerSettings::from_config(&self.config.hls, media),
        );
        let writer = self.tasks.spawn("segment-writer", writer.run());

        info!(
            device_id = %session.device_id,
            dir = %segments.path().display(),
            "Device pipeline started"
        );
        let previous = self.pipelines.insert(
            session.device_id.clone(),
            DevicePipeline {
                session_id: session.id.clone(),
                shared: Arc::clone(&shared),
                writer,
                _segments: segments,
            },
        );
        if let Some(previous) = previous {
            previous.writer.abort();
        }
        Ok(shared)
    }

    fn teardown_pipeline(&self, device_id: &DeviceId, session_id: &SessionId) {
        let Some((_, pipeline)) = self
            .pipelines
            .remove_if(device_id, |_, pipeline| &pipeline.session_id == session_id)
        else {
            return;
        };
        pipeline.writer.abort();
        self.hls.unregister(device_id.as_str());
        debug!(
            device_id = %device_id,
            segments = pipeline.shared.segments_written(),
            "Device pipeline torn down"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{OpenH264Encoder, VideoEncoder, VideoFrame, VideoProfile};
    use crate::config::IceConfig;
    use crate::signaling::SessionDescriptionPayload;
    use crate::snapshot::Qos;
    use crate::types::SiteId;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264, MIME_TYPE_OPUS};
    use webrtc::api::APIBuilder;
    use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
    use webrtc::media::Sample;
    use webrtc::peer_connection::configuration::RTCConfiguration;
    use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
    use webrtc::peer_connection::RTCPeerConnection;
    use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
    use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
    use webrtc::track::track_local::TrackLocal;

    struct NullPublisher;

    #[async_trait]
    impl BusPublisher for NullPublisher {
        async fn publish(&self, _topic: &str, _payload: Bytes, _retained: bool, _qos: Qos) -> Result<()> {
            Ok(())
        }
    }

    fn test_config(mode: StreamingMode) -> RelayConfig {
        let mut config = RelayConfig {
            mode,
            ice: IceConfig {
                stun_servers: Vec::new(),
                ..IceConfig::default()
            },
            ..RelayConfig::default()
        };
        config.hls.host = std::net::Ipv4Addr::LOCALHOST.into();
        config.hls.port = 0;
        config
    }

    fn manager(mode: StreamingMode) -> (Arc<SessionManager>, mpsc::UnboundedReceiver<OutboundSignal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = SessionManager::new(test_config(mode), Arc::new(tx), Arc::new(NullPublisher)).unwrap();
        (manager, rx)
    }

    /// A camera-side peer offering H.264 video and Opus audio.
    async fn camera_offer() -> (Arc<RTCPeerConnection>, String) {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().unwrap();
        let api = APIBuilder::new().with_media_engine(media_engine).build();
        let camera = Arc::new(api.new_peer_connection(RTCConfiguration::default()).await.unwrap());

        let video = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_string(),
                clock_rate: 90_000,
                ..Default::default()
            },
            "video".to_string(),
            "camera".to_string(),
        ));
        let audio = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48_000,
                channels: 2,
                ..Default::default()
            },
            "audio".to_string(),
            "camera".to_string(),
        ));
        camera
            .add_track(video as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .unwrap();
        camera
            .add_track(audio as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .unwrap();

        let offer = camera.create_offer(None).await.unwrap();
        let mut gathered = camera.gathering_complete_promise().await;
        camera.set_local_description(offer).await.unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(5), gathered.recv()).await;
        let sdp = camera.local_description().await.unwrap().sdp;
        (camera, sdp)
    }

    /// A camera-side peer with an H.264 track that trickles its candidates
    /// instead of embedding them in the offer.
    async fn trickling_camera() -> (
        Arc<RTCPeerConnection>,
        Arc<TrackLocalStaticSample>,
        mpsc::UnboundedReceiver<CandidatePayload>,
        String,
    ) {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().unwrap();
        let api = APIBuilder::new().with_media_engine(media_engine).build();
        let camera = Arc::new(api.new_peer_connection(RTCConfiguration::default()).await.unwrap());

        let video = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_string(),
                clock_rate: 90_000,
                ..Default::default()
            },
            "video".to_string(),
            "camera".to_string(),
        ));
        camera
            .add_track(Arc::clone(&video) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .unwrap();

        let (candidate_tx, candidate_rx) = mpsc::unbounded_channel();
        camera.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let candidate_tx = candidate_tx.clone();
            Box::pin(async move {
                let Some(init) = candidate.and_then(|c| c.to_json().ok()) else {
                    return;
                };
                let _ = candidate_tx.send(CandidatePayload {
                    candidate: init.candidate,
                    sdp_mid: init.sdp_mid,
                    sdp_mline_index: init.sdp_mline_index,
                });
            })
        }));

        let offer = camera.create_offer(None).await.unwrap();
        let sdp = strip_candidates(&offer.sdp);
        camera.set_local_description(offer).await.unwrap();
        (camera, video, candidate_rx, sdp)
    }

    fn offer(session_id: &str, device_id: &str, sdp: String) -> Offer {
        Offer {
            session_id: SessionId::from(session_id),
            device_id: DeviceId::from(device_id),
            site_id: SiteId::from("home"),
            offer: SessionDescriptionPayload {
                kind: "offer".to_string(),
                sdp,
            },
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<OutboundSignal>) -> Vec<OutboundSignal> {
        let mut messages = Vec::new();
        while let Ok(message) = rx.try_recv() {
            messages.push(message);
        }
        messages
    }

    #[tokio::test]
    async fn test_answer_precedes_candidates_without_relay() {
        let (manager, mut rx) = manager(StreamingMode::PublishToBus);
        let (camera, sdp) = camera_offer().await;

        manager.handle_offer(offer("s1", "cam1", sdp)).await.unwrap();

        let messages = drain(&mut rx);
        let Some(OutboundSignal::Answer { session_id, answer, forward }) = messages.first() else {
            panic!("first message is not an answer: {messages:?}");
        };
        assert_eq!(session_id.as_str(), "s1");
        assert!(*forward);
        assert_eq!(answer.kind, "answer");
        assert!(answer.sdp.contains("a=setup:passive"));
        assert!(!answer.sdp.contains("a=candidate:"));
        for message in &messages[1..] {
            assert!(matches!(message, OutboundSignal::Candidate { .. }));
        }

        let session = manager.session(&SessionId::from("s1")).unwrap();
        assert!(session.credentials.is_none());
        assert_eq!(session.state(), SessionState::Negotiating);

        let answer = RTCSessionDescription::answer(answer.sdp.clone()).unwrap();
        camera.set_remote_description(answer).await.unwrap();

        manager.shutdown().await;
        camera.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_session_is_idempotent() {
        let (manager, _rx) = manager(StreamingMode::PublishToBus);
        let (camera, sdp) = camera_offer().await;
        manager.handle_offer(offer("s1", "cam1", sdp)).await.unwrap();
        assert_eq!(manager.session_count(), 1);

        assert!(manager.close_session(&SessionId::from("s1")).await);
        assert!(!manager.close_session(&SessionId::from("s1")).await);
        assert!(!manager.close_session(&SessionId::from("never-existed")).await);

        assert_eq!(manager.session_count(), 0);
        assert!(manager.session_for_device(&DeviceId::from("cam1")).is_none());
        camera.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_credentials_before_offer_are_applied_then_discarded() {
        let (manager, _rx) = manager(StreamingMode::PublishToBus);
        let credentials = RelayCredentials {
            url: "turn:127.0.0.1:3478".to_string(),
            username: "user".to_string(),
            password: "secret".to_string(),
        };
        manager
            .dispatch(InboundSignal::RelayCredentials {
                session_id: SessionId::from("s1"),
                credentials: credentials.clone(),
            })
            .await;

        let (camera, sdp) = camera_offer().await;
        manager.handle_offer(offer("s1", "cam1", sdp)).await.unwrap();

        let session = manager.session(&SessionId::from("s1")).unwrap();
        assert_eq!(session.credentials.as_ref(), Some(&credentials));

        manager
            .dispatch(InboundSignal::HangUp {
                session_id: SessionId::from("s1"),
            })
            .await;
        assert!(manager.relay_credentials(&SessionId::from("s1")).is_none());
        assert_eq!(manager.session_count(), 0);
        camera.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_new_offer_replaces_device_session() {
        let (manager, _rx) = manager(StreamingMode::PublishToBus);
        let (first, sdp) = camera_offer().await;
        manager.handle_offer(offer("s1", "cam1", sdp)).await.unwrap();
        let (second, sdp) = camera_offer().await;
        manager.handle_offer(offer("s2", "cam1", sdp)).await.unwrap();

        assert_eq!(manager.session_count(), 1);
        assert!(manager.session(&SessionId::from("s1")).is_none());
        assert_eq!(
            manager.session_for_device(&DeviceId::from("cam1")),
            Some(SessionId::from("s2"))
        );

        manager.shutdown().await;
        first.close().await.unwrap();
        second.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_offer_does_not_leave_session() {
        let (manager, mut rx) = manager(StreamingMode::PublishToBus);
        manager
            .dispatch(InboundSignal::Offer(offer("bad", "cam1", "garbage".to_string())))
            .await;

        assert_eq!(manager.session_count(), 0);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_candidate_for_unknown_session_is_ignored() {
        let (manager, _rx) = manager(StreamingMode::PublishToBus);
        manager
            .dispatch_json(
                r#"{"key":"video.webrtc.candidate","session_id":"nobody","candidate":{"sdp":"candidate:1 1 udp 1 10.0.0.1 5000 typ host","sdpMid":"0","sdpMLineIndex":0}}"#,
            )
            .await;
        manager.dispatch_json(r#"{"key":"video.webrtc.unknown"}"#).await;
        assert_eq!(manager.session_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_offers() {
        let (manager, _rx) = manager(StreamingMode::PublishToBus);
        let (camera, sdp) = camera_offer().await;
        manager.handle_offer(offer("s1", "cam1", sdp.clone())).await.unwrap();

        manager.shutdown().await;

        assert_eq!(manager.session_count(), 0);
        assert_eq!(manager.task_count(), 0);
        assert!(matches!(
            manager.handle_offer(offer("s2", "cam2", sdp)).await,
            Err(RelayError::ShutDown)
        ));
        camera.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_exposer_starts_once() {
        let (manager, _rx) = manager(StreamingMode::RelayToPlaylist);
        assert!(manager.exposer_addr().await.is_none());

        let first = manager.ensure_exposer().await.unwrap();
        let second = manager.ensure_exposer().await.unwrap();
        assert_eq!(first, second);
        assert_ne!(first.port(), 0);

        manager.shutdown().await;
        assert!(manager.exposer_addr().await.is_none());
    }

    #[tokio::test]
    async fn test_watchdog_closes_stalled_session() {
        let mut config = test_config(StreamingMode::PublishToBus);
        config.ice.watchdog_checks = 2;
        config.ice.watchdog_interval_ms = 50;
        let (tx, _rx) = mpsc::unbounded_channel();
        let manager = SessionManager::new(config, Arc::new(tx), Arc::new(NullPublisher)).unwrap();
        let (camera, sdp) = camera_offer().await;
        manager.handle_offer(offer("s1", "cam1", sdp)).await.unwrap();

        // the camera never applies the answer, so connectivity never forms
        tokio::time::timeout(Duration::from_secs(5), async {
            while manager.session_count() > 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        assert!(manager.session_for_device(&DeviceId::from("cam1")).is_none());
        manager.shutdown().await;
        camera.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_connected_camera_gets_device_pipeline() {
        let (manager, mut rx) = manager(StreamingMode::RelayToPlaylist);
        let (camera, video, mut camera_candidates, sdp) = trickling_camera().await;
        let session_id = SessionId::from("s1");
        let device_id = DeviceId::from("cam1");

        manager.handle_offer(offer("s1", "cam1", sdp)).await.unwrap();

        // relay -> camera: answer first, then trickled candidates
        let to_camera = Arc::clone(&camera);
        let relay_side = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match message {
                    OutboundSignal::Answer { answer, .. } => {
                        let answer = RTCSessionDescription::answer(answer.sdp).unwrap();
                        to_camera.set_remote_description(answer).await.unwrap();
                    }
                    OutboundSignal::Candidate { candidate, .. } => {
                        let init = RTCIceCandidateInit {
                            candidate: candidate.candidate,
                            sdp_mid: candidate.sdp_mid,
                            sdp_mline_index: candidate.sdp_mline_index,
                            ..Default::default()
                        };
                        let _ = to_camera.add_ice_candidate(init).await;
                    }
                }
            }
        });

        // camera -> relay
        let to_relay = Arc::clone(&manager);
        let camera_side = tokio::spawn(async move {
            while let Some(candidate) = camera_candidates.recv().await {
                to_relay
                    .add_remote_candidate(&SessionId::from("s1"), candidate)
                    .await;
            }
        });

        tokio::time::timeout(Duration::from_secs(10), async {
            while manager.session(&session_id).map(|s| s.state()) != Some(SessionState::Connected) {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("camera never connected");

        let mut encoder = OpenH264Encoder::new(&VideoProfile {
            width: 64,
            height: 64,
            frame_rate: 30,
            keyframe_interval: 30,
            bitrate_bps: 200_000,
        })
        .unwrap();
        let mut frame_index = 0u64;
        tokio::time::timeout(Duration::from_secs(10), async {
            while manager.hls_registry().get("cam1").is_none() {
                let frame = VideoFrame::filled(64, 64, (frame_index % 200) as u8 + 16);
                for packet in encoder.encode(&frame, frame_index * 3000).unwrap() {
                    video
                        .write_sample(&Sample {
                            data: packet.data,
                            duration: Duration::from_millis(33),
                            ..Default::default()
                        })
                        .await
                        .unwrap();
                }
                frame_index += 1;
                tokio::time::sleep(Duration::from_millis(33)).await;
            }
        })
        .await
        .expect("no pipeline for the streaming device");
        assert!(manager.pipelines.contains_key(&device_id));

        assert!(manager.close_session(&session_id).await);
        assert!(manager.hls_registry().get("cam1").is_none());
        assert!(!manager.pipelines.contains_key(&device_id));

        manager.shutdown().await;
        camera.close().await.unwrap();
        relay_side.abort();
        camera_side.abort();
    }
}
