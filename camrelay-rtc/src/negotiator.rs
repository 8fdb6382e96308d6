// Session negotiation primitives
//
// Builds the WebRTC API (answering side is always DTLS passive), creates
// peer connections with the configured ICE servers, produces answers and
// applies remote candidates. Session bookkeeping lives in the manager.

use crate::config::IceConfig;
use crate::error::{RelayError, Result};
use crate::signaling::{CandidatePayload, RelayCredentials};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::dtls_transport::dtls_role::DTLSRole;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_gathering_state::RTCIceGatheringState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// 20 ms of Opus silence (a single CELT frame).
const OPUS_SILENCE_FRAME: [u8; 3] = [0xf8, 0xff, 0xfe];
pub const SILENCE_FRAME_DURATION: Duration = Duration::from_millis(20);

pub struct Negotiator {
    api: API,
    ice: IceConfig,
}

impl Negotiator {
    pub fn new(ice: IceConfig) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

        let mut settings = SettingEngine::default();
        settings.set_answering_dtls_role(DTLSRole::Server)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(settings)
            .build();

        Ok(Self { api, ice })
    }

    #[must_use]
    pub fn ice_config(&self) -> &IceConfig {
        &self.ice
    }

    /// STUN servers plus the relay, when complete credentials are known.
    #[must_use]
    pub fn ice_servers(&self, credentials: Option<&RelayCredentials>) -> Vec<RTCIceServer> {
        let mut servers = Vec::new();
        if !self.ice.stun_servers.is_empty() {
            servers.push(RTCIceServer {
                urls: self.ice.stun_servers.clone(),
                ..Default::default()
            });
        }
        match credentials {
            Some(relay) if relay.is_complete() => servers.push(RTCIceServer {
                urls: vec![relay.url.clone()],
                username: relay.username.clone(),
                credential: relay.password.clone(),
                ..Default::default()
            }),
            Some(_) => warn!("Ignoring incomplete relay credentials"),
            None => {}
        }
        servers
    }

    pub async fn create_connection(
        &self,
        credentials: Option<&RelayCredentials>,
    ) -> Result<Arc<RTCPeerConnection>> {
        let config = RTCConfiguration {
            ice_servers: self.ice_servers(credentials),
            ..Default::default()
        };
        let peer_connection = self
            .api
            .new_peer_connection(config)
            .await
            .map_err(|e| RelayError::Negotiation(format!("peer connection: {e}")))?;
        Ok(Arc::new(peer_connection))
    }

    pub async fn apply_offer(peer_connection: &RTCPeerConnection, sdp: String) -> Result<()> {
        let offer = RTCSessionDescription::offer(sdp)
            .map_err(|e| RelayError::Negotiation(format!("malformed offer: {e}")))?;
        peer_connection
            .set_remote_description(offer)
            .await
            .map_err(|e| RelayError::Negotiation(format!("remote description: {e}")))
    }

    /// Creates and applies the local answer, then waits (bounded) for
    /// candidate gathering so the answer carries them.
    pub async fn create_answer(&self, peer_connection: &RTCPeerConnection) -> Result<()> {
        let answer = peer_connection.create_answer(None).await?;
        peer_connection.set_local_description(answer).await?;

        let gathered = wait_for_gathering(
            peer_connection,
            self.ice.gathering_timeout(),
            self.ice.gathering_poll(),
        )
        .await;
        if !gathered {
            debug!("ICE gathering still running, answering with what we have");
        }
        Ok(())
    }

    pub async fn local_sdp(peer_connection: &RTCPeerConnection) -> Result<String> {
        peer_connection
            .local_description()
            .await
            .map(|description| description.sdp)
            .ok_or_else(|| RelayError::Negotiation("no local description after answer".to_string()))
    }

    pub async fn add_remote_candidate(
        peer_connection: &RTCPeerConnection,
        candidate: CandidatePayload,
    ) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        peer_connection.add_ice_candidate(init).await?;
        Ok(())
    }

    /// Adds a send-only Opus track for the silence pump.
    pub async fn attach_silence(
        peer_connection: &RTCPeerConnection,
    ) -> Result<Arc<TrackLocalStaticSample>> {
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48_000,
                channels: 2,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
            "audio".to_string(),
            "camrelay-silence".to_string(),
        ));
        peer_connection
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        Ok(track)
    }
}

/// Polls the gathering state until it completes or `timeout` elapses.
pub async fn wait_for_gathering(
    peer_connection: &RTCPeerConnection,
    timeout: Duration,
    poll: Duration,
) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if peer_connection.ice_gathering_state() == RTCIceGatheringState::Complete {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(poll).await;
    }
}

/// Writes 20 ms Opus silence frames until the track is closed.
pub async fn pump_silence(track: Arc<TrackLocalStaticSample>) {
    let mut ticker = tokio::time::interval(SILENCE_FRAME_DURATION);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let frame = Bytes::from_static(&OPUS_SILENCE_FRAME);

    loop {
        ticker.tick().await;
        let sample = Sample {
            data: frame.clone(),
            duration: SILENCE_FRAME_DURATION,
            ..Default::default()
        };
        if let Err(e) = track.write_sample(&sample).await {
            if matches!(e, webrtc::Error::ErrClosedPipe) {
                break;
            }
            debug!(error = %e, "Silence frame not sent");
        }
    }
}

/// Whether the watchdog should close a connection in this state.
#[must_use]
pub const fn is_stalled(state: RTCIceConnectionState) -> bool {
    matches!(
        state,
        RTCIceConnectionState::New | RTCIceConnectionState::Checking
    )
}

/// Polls connectivity `checks` times. Returns `true` when the connection
/// never left the early states.
pub async fn watch_connectivity(
    peer_connection: &RTCPeerConnection,
    checks: u32,
    interval: Duration,
) -> bool {
    for _ in 0..checks {
        tokio::time::sleep(interval).await;
        if !is_stalled(peer_connection.ice_connection_state()) {
            return false;
        }
    }
    is_stalled(peer_connection.ice_connection_state())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn negotiator(stun: Vec<String>) -> Negotiator {
        Negotiator::new(IceConfig {
            stun_servers: stun,
            ..IceConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_ice_servers_without_credentials() {
        let negotiator = negotiator(vec!["stun:stun.example.org:3478".to_string()]);
        let servers = negotiator.ice_servers(None);

        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].urls, vec!["stun:stun.example.org:3478".to_string()]);
        assert!(servers[0].username.is_empty());
    }

    #[test]
    fn test_ice_servers_with_relay() {
        let negotiator = negotiator(vec!["stun:stun.example.org:3478".to_string()]);
        let relay = RelayCredentials {
            url: "turn:relay.example.org:3478".to_string(),
            username: "user".to_string(),
            password: "secret".to_string(),
        };
        let servers = negotiator.ice_servers(Some(&relay));

        assert_eq!(servers.len(), 2);
        assert_eq!(servers[1].urls, vec!["turn:relay.example.org:3478".to_string()]);
        assert_eq!(servers[1].username, "user");
        assert_eq!(servers[1].credential, "secret");
    }

    #[test]
    fn test_incomplete_relay_is_skipped() {
        let negotiator = negotiator(Vec::new());
        let relay = RelayCredentials {
            url: "turn:relay.example.org:3478".to_string(),
            ..RelayCredentials::default()
        };
        assert!(negotiator.ice_servers(Some(&relay)).is_empty());
    }

    #[test]
    fn test_stalled_states() {
        assert!(is_stalled(RTCIceConnectionState::New));
        assert!(is_stalled(RTCIceConnectionState::Checking));
        assert!(!is_stalled(RTCIceConnectionState::Connected));
        assert!(!is_stalled(RTCIceConnectionState::Failed));
    }

    #[tokio::test]
    async fn test_malformed_offer_is_negotiation_error() {
        let negotiator = negotiator(Vec::new());
        let peer_connection = negotiator.create_connection(None).await.unwrap();

        let result = Negotiator::apply_offer(&peer_connection, "not sdp".to_string()).await;
        assert!(matches!(result, Err(RelayError::Negotiation(_))));
        peer_connection.close().await.unwrap();
    }
}
