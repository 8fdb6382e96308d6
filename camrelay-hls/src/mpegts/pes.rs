use bytes::{BufMut, BytesMut};

const PTS_ONLY: u8 = 0x02;
const PTS_WITH_DTS: u8 = 0x03;
const DTS: u8 = 0x01;

/// Writes a 33-bit timestamp in the 5-byte marker-bit layout.
pub fn put_timestamp(out: &mut BytesMut, prefix: u8, ts: u64) {
    let ts = ts & 0x1_ffff_ffff;
    out.put_u8((prefix << 4) | ((((ts >> 30) & 0x07) as u8) << 1) | 1);
    out.put_u8(((ts >> 22) & 0xff) as u8);
    out.put_u8(((((ts >> 15) & 0x7f) as u8) << 1) | 1);
    out.put_u8(((ts >> 7) & 0xff) as u8);
    out.put_u8((((ts & 0x7f) as u8) << 1) | 1);
}

/// Builds a PES packet around `payload`.
///
/// The length field is zeroed when it would overflow, which is only legal
/// for video streams.
#[must_use]
pub fn build_pes(stream_id: u8, pts: u64, dts: u64, payload: &[u8]) -> BytesMut {
    let with_dts = pts != dts;
    let header_data_len: usize = if with_dts { 10 } else { 5 };
    let mut out = BytesMut::with_capacity(9 + header_data_len + payload.len());

    out.put_slice(&[0x00, 0x00, 0x01, stream_id]);
    let packet_len = 3 + header_data_len + payload.len();
    out.put_u16(u16::try_from(packet_len).unwrap_or(0));
    /*marker bits '10', data_alignment_indicator*/
    out.put_u8(0x84);
    out.put_u8(if with_dts { 0xc0 } else { 0x80 });
    out.put_u8(header_data_len as u8);

    if with_dts {
        put_timestamp(&mut out, PTS_WITH_DTS, pts);
        put_timestamp(&mut out, DTS, dts);
    } else {
        put_timestamp(&mut out, PTS_ONLY, pts);
    }

    out.put_slice(payload);
    out
}

/// Writes a 6-byte PCR with a zero extension.
pub fn put_pcr(out: &mut BytesMut, base: u64) {
    let base = base & 0x1_ffff_ffff;
    out.put_u8((base >> 25) as u8);
    out.put_u8((base >> 17) as u8);
    out.put_u8((base >> 9) as u8);
    out.put_u8((base >> 1) as u8);
    out.put_u8((((base & 1) as u8) << 7) | 0x7e);
    out.put_u8(0x00);
}

/// Prefix carried by every Opus access unit in a transport stream.
pub fn put_opus_control_header(out: &mut BytesMut, au_size: usize) {
    out.put_u8(0x7f);
    out.put_u8(0xe0);
    let mut remaining = au_size;
    while remaining >= 255 {
        out.put_u8(0xff);
        remaining -= 255;
    }
    out.put_u8(remaining as u8);
}

#[cfg(test)]
pub(crate) fn read_timestamp(bytes: &[u8]) -> u64 {
    (u64::from(bytes[0] >> 1) & 0x07) << 30
        | u64::from(bytes[1]) << 22
        | u64::from(bytes[2] >> 1) << 15
        | u64::from(bytes[3]) << 7
        | u64::from(bytes[4] >> 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pes_header_pts_only() {
        let pes = build_pes(0xe0, 183_000, 183_000, &[1, 2, 3]);
        assert_eq!(&pes[..4], &[0x00, 0x00, 0x01, 0xe0]);
        assert_eq!(u16::from_be_bytes([pes[4], pes[5]]), 3 + 5 + 3);
        assert_eq!(pes[7], 0x80);
        assert_eq!(pes[8], 5);
        assert_eq!(pes[9] >> 4, PTS_ONLY);
        assert_eq!(read_timestamp(&pes[9..14]), 183_000);
        assert_eq!(&pes[14..], &[1, 2, 3]);
    }

    #[test]
    fn test_pes_header_with_dts() {
        let pes = build_pes(0xe0, 9_000, 6_000, &[]);
        assert_eq!(pes[7], 0xc0);
        assert_eq!(read_timestamp(&pes[9..14]), 9_000);
        assert_eq!(read_timestamp(&pes[14..19]), 6_000);
    }

    #[test]
    fn test_oversized_video_pes_has_zero_length() {
        let payload = vec![0u8; 70_000];
        let pes = build_pes(0xe0, 0, 0, &payload);
        assert_eq!(&pes[4..6], &[0, 0]);
    }

    #[test]
    fn test_opus_control_header_size_bytes() {
        let mut out = BytesMut::new();
        put_opus_control_header(&mut out, 300);
        assert_eq!(&out[..], &[0x7f, 0xe0, 0xff, 45]);

        let mut out = BytesMut::new();
        put_opus_control_header(&mut out, 255);
        assert_eq!(&out[..], &[0x7f, 0xe0, 0xff, 0]);
    }
}
