//! Opus (libopus) and G.711 audio

use super::{AudioCodec, AudioDecoder, AudioEncoder, AudioFrame, EncodedPacket};
use crate::error::MediaError;
use bytes::Bytes;
use camrelay_hls::StreamCodec;
use opus::{Application, Channels};

const OPUS_SAMPLE_RATES: [u32; 5] = [8_000, 12_000, 16_000, 24_000, 48_000];
const MAX_OPUS_PACKET: usize = 4000;
/// 120 ms at 48 kHz, the longest Opus frame.
const MAX_OPUS_FRAME_SAMPLES: usize = 5760;

fn opus_channels(channels: u16) -> Result<Channels, MediaError> {
    match channels {
        1 => Ok(Channels::Mono),
        2 => Ok(Channels::Stereo),
        n => Err(MediaError::CodecUnavailable(format!(
            "opus supports 1 or 2 channels, got {n}"
        ))),
    }
}

/// Encodes PCM to 20 ms Opus packets, carrying partial frames over.
pub struct OpusAudioEncoder {
    encoder: opus::Encoder,
    input_channels: u16,
    output_channels: u16,
    sample_rate: u32,
    frame_samples: usize,
    pending: Vec<i16>,
    pending_pts: u64,
}

impl OpusAudioEncoder {
    pub fn new(codec: AudioCodec, channels: u16, sample_rate: u32) -> Result<Self, MediaError> {
        if !OPUS_SAMPLE_RATES.contains(&sample_rate) {
            return Err(MediaError::CodecUnavailable(format!(
                "opus does not support {sample_rate} Hz"
            )));
        }
        if channels == 0 {
            return Err(MediaError::CodecUnavailable("zero channels".to_string()));
        }

        let output_channels = match codec {
            AudioCodec::Opus => channels,
            AudioCodec::OpusMono => 1,
        };
        let encoder = opus::Encoder::new(sample_rate, opus_channels(output_channels)?, Application::Audio)
            .map_err(|e| MediaError::CodecUnavailable(format!("opus encoder: {e}")))?;

        Ok(Self {
            encoder,
            input_channels: channels,
            output_channels,
            sample_rate,
            frame_samples: sample_rate as usize / 50,
            pending: Vec::new(),
            pending_pts: 0,
        })
    }

    fn encode_ready(&mut self) -> Result<Vec<EncodedPacket>, MediaError> {
        let chunk = self.frame_samples * usize::from(self.output_channels);
        let mut packets = Vec::new();
        while self.pending.len() >= chunk {
            let data = self
                .encoder
                .encode_vec(&self.pending[..chunk], MAX_OPUS_PACKET)
                .map_err(|e| MediaError::Encode(e.to_string()))?;
            self.pending.drain(..chunk);
            packets.push(EncodedPacket {
                data: Bytes::from(data),
                pts: self.pending_pts,
                keyframe: false,
            });
            self.pending_pts += self.frame_samples as u64;
        }
        Ok(packets)
    }
}

impl AudioEncoder for OpusAudioEncoder {
    fn stream_codec(&self) -> StreamCodec {
        StreamCodec::Opus {
            channels: self.output_channels as u8,
        }
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn encode(&mut self, frame: &AudioFrame, pts: u64) -> Result<Vec<EncodedPacket>, MediaError> {
        if frame.channels != self.input_channels || frame.sample_rate != self.sample_rate {
            return Err(MediaError::Encode(format!(
                "audio format changed to {} ch / {} Hz",
                frame.channels, frame.sample_rate
            )));
        }

        if self.pending.is_empty() {
            self.pending_pts = pts;
        }
        if self.output_channels == self.input_channels {
            self.pending.extend_from_slice(&frame.samples);
        } else {
            let channels = usize::from(self.input_channels);
            self.pending.extend(frame.samples.chunks_exact(channels).map(|group| {
                let sum: i32 = group.iter().map(|s| i32::from(*s)).sum();
                (sum / channels as i32) as i16
            }));
        }

        self.encode_ready()
    }

    fn flush(&mut self) -> Result<Vec<EncodedPacket>, MediaError> {
        if self.pending.is_empty() {
            return Ok(Vec::new());
        }
        let chunk = self.frame_samples * usize::from(self.output_channels);
        self.pending.resize(chunk, 0);
        self.encode_ready()
    }
}

pub struct OpusAudioDecoder {
    decoder: opus::Decoder,
    channels: u16,
    sample_rate: u32,
    buffer: Vec<i16>,
}

impl OpusAudioDecoder {
    pub fn new(sample_rate: u32, channels: u16) -> Result<Self, MediaError> {
        let decoder = opus::Decoder::new(sample_rate, opus_channels(channels)?)
            .map_err(|e| MediaError::CodecUnavailable(format!("opus decoder: {e}")))?;
        Ok(Self {
            decoder,
            channels,
            sample_rate,
            buffer: vec![0; MAX_OPUS_FRAME_SAMPLES * usize::from(channels)],
        })
    }
}

impl AudioDecoder for OpusAudioDecoder {
    fn decode(&mut self, payload: &[u8]) -> Result<AudioFrame, MediaError> {
        let samples = self
            .decoder
            .decode(payload, &mut self.buffer, false)
            .map_err(|e| MediaError::Decode(e.to_string()))?;
        Ok(AudioFrame {
            samples: self.buffer[..samples * usize::from(self.channels)].to_vec(),
            channels: self.channels,
            sample_rate: self.sample_rate,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum G711Law {
    MuLaw,
    ALaw,
}

/// G.711 decoder: one byte per sample, mono, 8 kHz.
#[derive(Debug, Clone, Copy)]
pub struct G711Decoder {
    law: G711Law,
}

impl G711Decoder {
    #[must_use]
    pub const fn new(law: G711Law) -> Self {
        Self { law }
    }
}

impl AudioDecoder for G711Decoder {
    fn decode(&mut self, payload: &[u8]) -> Result<AudioFrame, MediaError> {
        if payload.is_empty() {
            return Err(MediaError::Decode("empty G.711 payload".to_string()));
        }
        let samples = match self.law {
            G711Law::MuLaw => payload.iter().map(|b| ulaw_to_linear(*b)).collect(),
            G711Law::ALaw => payload.iter().map(|b| alaw_to_linear(*b)).collect(),
        };
        Ok(AudioFrame {
            samples,
            channels: 1,
            sample_rate: 8_000,
        })
    }
}

fn ulaw_to_linear(byte: u8) -> i16 {
    const BIAS: i32 = 0x84;
    let u = !byte;
    let exponent = (u >> 4) & 0x07;
    let magnitude = ((i32::from(u & 0x0f) << 3) + BIAS) << exponent;
    if u & 0x80 != 0 {
        (BIAS - magnitude) as i16
    } else {
        (magnitude - BIAS) as i16
    }
}

fn alaw_to_linear(byte: u8) -> i16 {
    let a = byte ^ 0x55;
    let segment = (a & 0x70) >> 4;
    let mut magnitude = i32::from(a & 0x0f) << 4;
    match segment {
        0 => magnitude += 8,
        1 => magnitude += 0x108,
        _ => magnitude = (magnitude + 0x108) << (segment - 1),
    }
    if a & 0x80 != 0 {
        magnitude as i16
    } else {
        -magnitude as i16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(samples_per_channel: usize, channels: u16) -> AudioFrame {
        let samples = (0..samples_per_channel)
            .flat_map(|i| {
                let v = ((i as f32 * 0.05).sin() * 8000.0) as i16;
                std::iter::repeat(v).take(usize::from(channels))
            })
            .collect();
        AudioFrame {
            samples,
            channels,
            sample_rate: 48_000,
        }
    }

    #[test]
    fn test_g711_reference_values() {
        assert_eq!(ulaw_to_linear(0xff), 0);
        assert_eq!(ulaw_to_linear(0x00), -32124);
        assert_eq!(ulaw_to_linear(0x80), 32124);
        assert_eq!(alaw_to_linear(0xd5), 8);
        assert_eq!(alaw_to_linear(0x55), -8);
    }

    #[test]
    fn test_g711_decoder_frame_shape() {
        let mut decoder = G711Decoder::new(G711Law::MuLaw);
        let frame = decoder.decode(&[0xff; 160]).unwrap();
        assert_eq!(frame.samples.len(), 160);
        assert_eq!(frame.sample_rate, 8_000);
        assert_eq!(frame.channels, 1);
        assert!(decoder.decode(&[]).is_err());
    }

    #[test]
    fn test_opus_encoder_emits_20ms_packets_with_sample_pts() {
        let mut encoder = OpusAudioEncoder::new(AudioCodec::Opus, 2, 48_000).unwrap();
        assert_eq!(encoder.stream_codec(), StreamCodec::Opus { channels: 2 });

        // 30 ms in, one 20 ms packet out, 10 ms carried over
        let packets = encoder.encode(&tone(1440, 2), 0).unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].pts, 0);

        let packets = encoder.encode(&tone(1440, 2), 1440).unwrap();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].pts, 960);
        assert_eq!(packets[1].pts, 1920);

        assert!(encoder.flush().unwrap().is_empty());
    }

    #[test]
    fn test_opus_mono_fallback_downmixes() {
        let mut encoder = OpusAudioEncoder::new(AudioCodec::OpusMono, 2, 48_000).unwrap();
        assert_eq!(encoder.stream_codec(), StreamCodec::Opus { channels: 1 });
        let packets = encoder.encode(&tone(960, 2), 0).unwrap();
        assert_eq!(packets.len(), 1);
    }

    #[test]
    fn test_opus_rejects_unsupported_layouts() {
        assert!(OpusAudioEncoder::new(AudioCodec::Opus, 6, 48_000).is_err());
        assert!(OpusAudioEncoder::new(AudioCodec::OpusMono, 6, 48_000).is_ok());
        assert!(OpusAudioEncoder::new(AudioCodec::Opus, 1, 44_100).is_err());
    }

    #[test]
    fn test_opus_round_trip_length() {
        let mut encoder = OpusAudioEncoder::new(AudioCodec::Opus, 1, 48_000).unwrap();
        let mut decoder = OpusAudioDecoder::new(48_000, 1).unwrap();

        let packets = encoder.encode(&tone(960, 1), 0).unwrap();
        let frame = decoder.decode(&packets[0].data).unwrap();
        assert_eq!(frame.samples_per_channel(), 960);
    }

    #[test]
    fn test_flush_pads_partial_frame() {
        let mut encoder = OpusAudioEncoder::new(AudioCodec::Opus, 1, 48_000).unwrap();
        assert!(encoder.encode(&tone(480, 1), 0).unwrap().is_empty());
        let packets = encoder.flush().unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].pts, 0);
    }
}
