//! H.264 through openh264

use super::{EncodedPacket, VideoDecoder, VideoEncoder, VideoFrame, VideoProfile};
use crate::error::MediaError;
use bytes::Bytes;
use openh264::decoder::Decoder;
use openh264::encoder::{
    BitRate, Encoder, EncoderConfig, FrameRate, FrameType, IntraFramePeriod, RateControlMode,
    UsageType,
};
use openh264::formats::{YUVBuffer, YUVSource};
use openh264::OpenH264API;

pub struct H264Decoder {
    decoder: Decoder,
}

impl H264Decoder {
    pub fn new() -> Result<Self, MediaError> {
        let decoder = Decoder::new()
            .map_err(|e| MediaError::CodecUnavailable(format!("H264 decoder: {e}")))?;
        Ok(Self { decoder })
    }
}

impl VideoDecoder for H264Decoder {
    fn decode(&mut self, access_unit: &[u8]) -> Result<Option<VideoFrame>, MediaError> {
        match self.decoder.decode(access_unit) {
            Ok(Some(yuv)) => Ok(Some(copy_planes(&yuv))),
            Ok(None) => Ok(None),
            Err(e) => Err(MediaError::Decode(e.to_string())),
        }
    }
}

/// Copies a strided decoder picture into a packed frame.
fn copy_planes(yuv: &impl YUVSource) -> VideoFrame {
    let (width, height) = yuv.dimensions();
    let (y_stride, u_stride, v_stride) = yuv.strides();
    let (chroma_w, chroma_h) = (width.div_ceil(2), height.div_ceil(2));

    let mut data = Vec::with_capacity(width * height + 2 * chroma_w * chroma_h);
    for row in 0..height {
        data.extend_from_slice(&yuv.y()[row * y_stride..row * y_stride + width]);
    }
    for row in 0..chroma_h {
        data.extend_from_slice(&yuv.u()[row * u_stride..row * u_stride + chroma_w]);
    }
    for row in 0..chroma_h {
        data.extend_from_slice(&yuv.v()[row * v_stride..row * v_stride + chroma_w]);
    }

    VideoFrame {
        width: width as u32,
        height: height as u32,
        data,
    }
}

/// Fixed-profile H.264 encoder.
///
/// Scene-cut keyframes are off, so keyframes land exactly every
/// `keyframe_interval` frames. A fresh encoder starts with an IDR.
pub struct OpenH264Encoder {
    encoder: Encoder,
    width: u32,
    height: u32,
}

impl OpenH264Encoder {
    pub fn new(profile: &VideoProfile) -> Result<Self, MediaError> {
        if profile.width == 0 || profile.height == 0 || profile.width % 2 != 0 || profile.height % 2 != 0 {
            return Err(MediaError::CodecUnavailable(format!(
                "unsupported picture size {}x{}",
                profile.width, profile.height
            )));
        }

        let config = EncoderConfig::new()
            .usage_type(UsageType::CameraVideoRealTime)
            .max_frame_rate(FrameRate::from_hz(profile.frame_rate as f32))
            .bitrate(BitRate::from_bps(profile.bitrate_bps))
            .rate_control_mode(RateControlMode::Bitrate)
            .skip_frames(false)
            .scene_change_detect(false)
            .intra_frame_period(IntraFramePeriod::from_num_frames(profile.keyframe_interval));

        let encoder = Encoder::with_api_config(OpenH264API::from_source(), config)
            .map_err(|e| MediaError::CodecUnavailable(format!("H264 encoder: {e}")))?;

        Ok(Self {
            encoder,
            width: profile.width,
            height: profile.height,
        })
    }
}

impl VideoEncoder for OpenH264Encoder {
    fn encode(&mut self, frame: &VideoFrame, pts: u64) -> Result<Vec<EncodedPacket>, MediaError> {
        if frame.width != self.width || frame.height != self.height {
            return Err(MediaError::Encode(format!(
                "frame is {}x{}, encoder expects {}x{}",
                frame.width, frame.height, self.width, self.height
            )));
        }

        let yuv = YUVBuffer::from_vec(frame.data.clone(), self.width as usize, self.height as usize);
        let bitstream = self
            .encoder
            .encode(&yuv)
            .map_err(|e| MediaError::Encode(e.to_string()))?;

        let keyframe = matches!(bitstream.frame_type(), FrameType::IDR | FrameType::I);
        let data = bitstream.to_vec();
        if data.is_empty() {
            return Ok(Vec::new());
        }

        Ok(vec![EncodedPacket {
            data: Bytes::from(data),
            pts,
            keyframe,
        }])
    }

    fn flush(&mut self) -> Result<Vec<EncodedPacket>, MediaError> {
        // no frame reordering, nothing is held back
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> VideoProfile {
        VideoProfile {
            width: 64,
            height: 48,
            frame_rate: 30,
            keyframe_interval: 30,
            bitrate_bps: 200_000,
        }
    }

    #[test]
    fn test_first_frame_is_keyframe() {
        let mut encoder = OpenH264Encoder::new(&profile()).unwrap();
        let packets = encoder.encode(&VideoFrame::filled(64, 48, 80), 0).unwrap();

        assert_eq!(packets.len(), 1);
        assert!(packets[0].keyframe);
        assert!(packets[0].data.starts_with(&[0, 0, 0, 1]) || packets[0].data.starts_with(&[0, 0, 1]));
    }

    #[test]
    fn test_encode_then_decode_preserves_size() {
        let mut encoder = OpenH264Encoder::new(&profile()).unwrap();
        let mut decoder = H264Decoder::new().unwrap();

        let packets = encoder.encode(&VideoFrame::filled(64, 48, 120), 0).unwrap();
        let frame = decoder.decode(&packets[0].data).unwrap().unwrap();
        assert_eq!((frame.width, frame.height), (64, 48));
        assert_eq!(frame.data.len(), 64 * 48 * 3 / 2);
    }

    #[test]
    fn test_size_change_is_rejected() {
        let mut encoder = OpenH264Encoder::new(&profile()).unwrap();
        assert!(encoder.encode(&VideoFrame::filled(32, 32, 0), 0).is_err());
    }

    #[test]
    fn test_odd_size_is_unavailable() {
        let mut odd = profile();
        odd.width = 63;
        assert!(matches!(
            OpenH264Encoder::new(&odd),
            Err(MediaError::CodecUnavailable(_))
        ));
    }

    #[test]
    fn test_garbage_fails_to_decode() {
        let mut decoder = H264Decoder::new().unwrap();
        let result = decoder.decode(&[0, 0, 0, 1, 0x65, 0xff, 0xff, 0xff]);
        assert!(!matches!(result, Ok(Some(_))));
    }
}
