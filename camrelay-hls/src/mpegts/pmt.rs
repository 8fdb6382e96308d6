use {
    super::{crc32, define},
    bytes::{BufMut, Bytes, BytesMut},
};

/// Elementary stream entry of a program map.
#[derive(Debug, Clone)]
pub struct EsInfo {
    pub stream_type: u8,
    pub pid: u16,
    pub descriptors: Bytes,
}

#[derive(Debug, Clone)]
pub struct Pmt {
    pub program_number: u16,
    pub pcr_pid: u16,
    pub version_number: u8,
    pub streams: Vec<EsInfo>,
}

impl Pmt {
    #[must_use]
    pub fn write(&self) -> BytesMut {
        let es_len: usize = self.streams.iter().map(|s| 5 + s.descriptors.len()).sum();
        let mut out = BytesMut::with_capacity(16 + es_len);

        out.put_u8(define::table_id::PMT);
        /*section length: header(9) + streams + crc(4)*/
        let length = (9 + es_len + 4) as u16;
        out.put_u16(0xb000 | length);
        out.put_u16(self.program_number);
        out.put_u8(0xc1 | ((self.version_number & 0x1f) << 1));
        out.put_u16(0x0000);
        out.put_u16(0xe000 | self.pcr_pid);
        /*program_info_length*/
        out.put_u16(0xf000);

        for stream in &self.streams {
            out.put_u8(stream.stream_type);
            out.put_u16(0xe000 | stream.pid);
            out.put_u16(0xf000 | stream.descriptors.len() as u16);
            out.put_slice(&stream.descriptors);
        }

        let crc = crc32::gen_crc32(&out);
        out.put_u32(crc);
        out
    }
}

/// Registration and extension descriptors announcing an Opus stream.
#[must_use]
pub fn opus_descriptors(channels: u8) -> Bytes {
    let mut out = BytesMut::with_capacity(10);
    out.put_u8(define::descriptor_tag::REGISTRATION);
    out.put_u8(4);
    out.put_slice(b"Opus");
    out.put_u8(define::descriptor_tag::EXTENSION);
    out.put_u8(2);
    /*opus_audio_descriptor extension tag*/
    out.put_u8(0x80);
    out.put_u8(channels);
    out.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pmt_with_video_and_opus() {
        let pmt = Pmt {
            program_number: 1,
            pcr_pid: 0x100,
            version_number: 0,
            streams: vec![
                EsInfo {
                    stream_type: define::stream_type::H264,
                    pid: 0x100,
                    descriptors: Bytes::new(),
                },
                EsInfo {
                    stream_type: define::stream_type::PRIVATE_DATA,
                    pid: 0x101,
                    descriptors: opus_descriptors(2),
                },
            ],
        };

        let data = pmt.write();
        assert_eq!(data[0], define::table_id::PMT);
        assert_eq!(data.len(), 12 + 5 + 5 + 10 + 4);
        assert_eq!(crc32::gen_crc32(&data), 0);
        // PCR pid
        assert_eq!(u16::from_be_bytes([data[8], data[9]]) & 0x1fff, 0x100);
        assert!(data.windows(4).any(|w| w == b"Opus"));
    }
}
