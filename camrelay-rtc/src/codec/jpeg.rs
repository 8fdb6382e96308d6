//! Still-image encoding for snapshots

use super::VideoFrame;
use crate::error::MediaError;
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;

/// Encodes an I420 frame as a baseline JPEG.
pub fn encode_jpeg(frame: &VideoFrame, quality: u8) -> Result<Bytes, MediaError> {
    let rgb = i420_to_rgb(frame);
    let image = RgbImage::from_raw(frame.width, frame.height, rgb)
        .ok_or_else(|| MediaError::Encode("RGB buffer does not match frame size".to_string()))?;

    let mut out = Vec::with_capacity(frame.data.len() / 4);
    JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100))
        .encode_image(&image)
        .map_err(|e| MediaError::Encode(format!("jpeg: {e}")))?;
    Ok(Bytes::from(out))
}

/// BT.601 limited-range YUV to RGB24.
fn i420_to_rgb(frame: &VideoFrame) -> Vec<u8> {
    let w = frame.width as usize;
    let h = frame.height as usize;
    let chroma_w = w.div_ceil(2);
    let (y_plane, u_plane, v_plane) = (frame.y_plane(), frame.u_plane(), frame.v_plane());

    let mut rgb = vec![0u8; w * h * 3];
    for row in 0..h {
        for col in 0..w {
            let c = i32::from(y_plane[row * w + col]) - 16;
            let chroma = (row / 2) * chroma_w + col / 2;
            let d = i32::from(u_plane[chroma]) - 128;
            let e = i32::from(v_plane[chroma]) - 128;

            let r = (298 * c + 409 * e + 128) >> 8;
            let g = (298 * c - 100 * d - 208 * e + 128) >> 8;
            let b = (298 * c + 516 * d + 128) >> 8;

            let idx = (row * w + col) * 3;
            rgb[idx] = r.clamp(0, 255) as u8;
            rgb[idx + 1] = g.clamp(0, 255) as u8;
            rgb[idx + 2] = b.clamp(0, 255) as u8;
        }
    }
    rgb
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grey_levels_convert() {
        let black = i420_to_rgb(&VideoFrame::filled(2, 2, 16));
        assert!(black.iter().all(|v| *v == 0));
        let white = i420_to_rgb(&VideoFrame::filled(2, 2, 235));
        assert!(white.iter().all(|v| *v == 255));
    }

    #[test]
    fn test_encode_jpeg_produces_decodable_image() {
        let frame = VideoFrame::filled(32, 24, 100);
        let jpeg = encode_jpeg(&frame, 85).unwrap();

        assert_eq!(&jpeg[..2], &[0xff, 0xd8]);
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (32, 24));
    }
}
