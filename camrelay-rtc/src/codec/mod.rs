//! Raw frames and the codec seams the relay encodes and decodes through.

pub mod audio;
pub mod h264;
pub mod jpeg;

use crate::error::MediaError;
use bytes::Bytes;
use camrelay_hls::StreamCodec;

pub use audio::{G711Decoder, G711Law, OpusAudioDecoder, OpusAudioEncoder};
pub use h264::{H264Decoder, OpenH264Encoder};
pub use jpeg::encode_jpeg;

/// Decoded picture in packed I420 layout (Y, then U, then V).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl VideoFrame {
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Result<Self, MediaError> {
        let expected = i420_len(width, height);
        if data.len() != expected {
            return Err(MediaError::Decode(format!(
                "I420 frame {width}x{height} needs {expected} bytes, got {}",
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    /// Uniform frame of the given luma, neutral chroma.
    #[must_use]
    pub fn filled(width: u32, height: u32, luma: u8) -> Self {
        let luma_len = (width * height) as usize;
        let mut data = vec![128u8; i420_len(width, height)];
        data[..luma_len].fill(luma);
        Self {
            width,
            height,
            data,
        }
    }

    #[must_use]
    pub fn y_plane(&self) -> &[u8] {
        &self.data[..(self.width * self.height) as usize]
    }

    #[must_use]
    pub fn u_plane(&self) -> &[u8] {
        let luma = (self.width * self.height) as usize;
        &self.data[luma..luma + chroma_len(self.width, self.height)]
    }

    #[must_use]
    pub fn v_plane(&self) -> &[u8] {
        let start = (self.width * self.height) as usize + chroma_len(self.width, self.height);
        &self.data[start..]
    }
}

const fn chroma_len(width: u32, height: u32) -> usize {
    (width.div_ceil(2) * height.div_ceil(2)) as usize
}

const fn i420_len(width: u32, height: u32) -> usize {
    (width * height) as usize + 2 * chroma_len(width, height)
}

/// Interleaved signed 16-bit PCM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub samples: Vec<i16>,
    pub channels: u16,
    pub sample_rate: u32,
}

impl AudioFrame {
    #[must_use]
    pub fn samples_per_channel(&self) -> usize {
        self.samples.len() / usize::from(self.channels.max(1))
    }
}

/// One compressed access unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPacket {
    pub data: Bytes,
    /// Presentation time in the stream's own clock (90 kHz for video,
    /// samples for audio).
    pub pts: u64,
    pub keyframe: bool,
}

/// Encoding parameters of the live playlist's video leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoProfile {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub keyframe_interval: u32,
    pub bitrate_bps: u32,
}

/// Audio encodings tried in order when a segment opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioCodec {
    /// Opus in the source channel layout.
    Opus,
    /// Opus after downmixing to mono.
    OpusMono,
}

impl AudioCodec {
    pub const FALLBACK_ORDER: [Self; 2] = [Self::Opus, Self::OpusMono];
}

pub trait VideoEncoder: Send {
    fn encode(&mut self, frame: &VideoFrame, pts: u64) -> Result<Vec<EncodedPacket>, MediaError>;

    /// Drains buffered packets at end of stream.
    fn flush(&mut self) -> Result<Vec<EncodedPacket>, MediaError>;
}

pub trait AudioEncoder: Send {
    fn stream_codec(&self) -> StreamCodec;

    fn sample_rate(&self) -> u32;

    /// `pts` counts samples per channel since the stream started.
    fn encode(&mut self, frame: &AudioFrame, pts: u64) -> Result<Vec<EncodedPacket>, MediaError>;

    fn flush(&mut self) -> Result<Vec<EncodedPacket>, MediaError>;
}

pub trait VideoDecoder: Send {
    /// Decodes one Annex B access unit; `None` while the decoder buffers.
    fn decode(&mut self, access_unit: &[u8]) -> Result<Option<VideoFrame>, MediaError>;
}

pub trait AudioDecoder: Send {
    fn decode(&mut self, payload: &[u8]) -> Result<AudioFrame, MediaError>;
}

/// Creates the encoders a segment needs.
pub trait EncoderFactory: Send + Sync {
    fn video_encoder(&self, profile: &VideoProfile) -> Result<Box<dyn VideoEncoder>, MediaError>;

    fn audio_encoder(
        &self,
        codec: AudioCodec,
        channels: u16,
        sample_rate: u32,
    ) -> Result<Box<dyn AudioEncoder>, MediaError>;
}

/// openh264 for video, libopus for audio.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeEncoders;

impl EncoderFactory for NativeEncoders {
    fn video_encoder(&self, profile: &VideoProfile) -> Result<Box<dyn VideoEncoder>, MediaError> {
        Ok(Box::new(OpenH264Encoder::new(profile)?))
    }

    fn audio_encoder(
        &self,
        codec: AudioCodec,
        channels: u16,
        sample_rate: u32,
    ) -> Result<Box<dyn AudioEncoder>, MediaError> {
        Ok(Box::new(OpusAudioEncoder::new(codec, channels, sample_rate)?))
    }
}
