// Decoded frame sources
//
// A received WebRTC track is wrapped in a source that turns RTP into raw
// frames. The router only sees the traits, so tests drive it with fakes.

use crate::codec::{
    AudioDecoder, AudioFrame, G711Decoder, G711Law, H264Decoder, OpusAudioDecoder, VideoDecoder,
    VideoFrame,
};
use crate::error::MediaError;
use crate::types::TrackKind;
use async_trait::async_trait;
use bytes::BytesMut;
use std::sync::Arc;
use tracing::debug;
use webrtc::api::media_engine::{MIME_TYPE_H264, MIME_TYPE_OPUS, MIME_TYPE_PCMA, MIME_TYPE_PCMU};
use webrtc::rtp::codecs::h264::H264Packet;
use webrtc::rtp::packetizer::Depacketizer;
use webrtc::track::track_remote::TrackRemote;

/// Yields decoded pictures until the track ends.
#[async_trait]
pub trait VideoSource: Send {
    async fn next_frame(&mut self) -> Result<VideoFrame, MediaError>;
}

/// Yields decoded PCM until the track ends.
#[async_trait]
pub trait AudioSource: Send {
    async fn next_frame(&mut self) -> Result<AudioFrame, MediaError>;
}

/// Receive-side codec of a remote track, from its negotiated MIME type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteCodec {
    H264,
    Opus { channels: u16 },
    G711(G711Law),
}

impl RemoteCodec {
    #[must_use]
    pub fn from_mime(mime_type: &str, channels: u16) -> Option<Self> {
        if mime_type.eq_ignore_ascii_case(MIME_TYPE_H264) {
            Some(Self::H264)
        } else if mime_type.eq_ignore_ascii_case(MIME_TYPE_OPUS) {
            Some(Self::Opus {
                channels: channels.clamp(1, 2),
            })
        } else if mime_type.eq_ignore_ascii_case(MIME_TYPE_PCMU) {
            Some(Self::G711(G711Law::MuLaw))
        } else if mime_type.eq_ignore_ascii_case(MIME_TYPE_PCMA) {
            Some(Self::G711(G711Law::ALaw))
        } else {
            None
        }
    }

    #[must_use]
    pub const fn kind(&self) -> TrackKind {
        match self {
            Self::H264 => TrackKind::Video,
            Self::Opus { .. } | Self::G711(_) => TrackKind::Audio,
        }
    }
}

fn map_read_error(e: &webrtc::Error) -> MediaError {
    debug!(error = %e, "Track read ended");
    MediaError::TrackEnded
}

/// H.264 over RTP, reassembled into access units on the marker bit.
pub struct RemoteVideoSource {
    track: Arc<TrackRemote>,
    depacketizer: H264Packet,
    decoder: H264Decoder,
    access_unit: BytesMut,
}

impl RemoteVideoSource {
    pub fn new(track: Arc<TrackRemote>) -> Result<Self, MediaError> {
        Ok(Self {
            track,
            depacketizer: H264Packet::default(),
            decoder: H264Decoder::new()?,
            access_unit: BytesMut::new(),
        })
    }
}

#[async_trait]
impl VideoSource for RemoteVideoSource {
    async fn next_frame(&mut self) -> Result<VideoFrame, MediaError> {
        loop {
            let (packet, _) = self
                .track
                .read_rtp()
                .await
                .map_err(|e| map_read_error(&e))?;
            if packet.payload.is_empty() {
                continue;
            }

            let nal = self.depacketizer.depacketize(&packet.payload).map_err(|e| {
                self.access_unit.clear();
                MediaError::Decode(format!("H264 depacketize: {e}"))
            })?;
            self.access_unit.extend_from_slice(&nal);

            if !packet.header.marker || self.access_unit.is_empty() {
                continue;
            }

            let access_unit = self.access_unit.split().freeze();
            if let Some(frame) = self.decoder.decode(&access_unit)? {
                return Ok(frame);
            }
        }
    }
}

/// Opus or G.711 over RTP, one frame per packet.
pub struct RemoteAudioSource {
    track: Arc<TrackRemote>,
    decoder: Box<dyn AudioDecoder>,
}

impl RemoteAudioSource {
    pub fn new(track: Arc<TrackRemote>, codec: RemoteCodec) -> Result<Self, MediaError> {
        let decoder: Box<dyn AudioDecoder> = match codec {
            RemoteCodec::Opus { channels } => Box::new(OpusAudioDecoder::new(48_000, channels)?),
            RemoteCodec::G711(law) => Box::new(G711Decoder::new(law)),
            RemoteCodec::H264 => {
                return Err(MediaError::CodecUnavailable(
                    "H264 is not an audio codec".to_string(),
                ))
            }
        };
        Ok(Self { track, decoder })
    }
}

#[async_trait]
impl AudioSource for RemoteAudioSource {
    async fn next_frame(&mut self) -> Result<AudioFrame, MediaError> {
        loop {
            let (packet, _) = self
                .track
                .read_rtp()
                .await
                .map_err(|e| map_read_error(&e))?;
            if packet.payload.is_empty() {
                continue;
            }
            return self.decoder.decode(&packet.payload);
        }
    }
}
