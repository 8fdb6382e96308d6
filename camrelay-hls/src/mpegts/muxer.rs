use {
    super::{
        define::{self, stream_id, stream_type},
        errors::{MpegTsError, MpegTsErrorValue},
        pat::{Pat, ProgramEntry},
        pes,
        pmt::{self, EsInfo, Pmt},
    },
    bytes::{BufMut, Bytes, BytesMut},
};

const MAX_STREAMS: usize = 8;

/// Codec carried by an elementary stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamCodec {
    /// Annex B H.264 access units.
    H264,
    /// Raw Opus packets, one per access unit.
    Opus { channels: u8 },
}

impl StreamCodec {
    const fn stream_type(self) -> u8 {
        match self {
            Self::H264 => stream_type::H264,
            Self::Opus { .. } => stream_type::PRIVATE_DATA,
        }
    }

    const fn stream_id(self) -> u8 {
        match self {
            Self::H264 => stream_id::VIDEO,
            Self::Opus { .. } => stream_id::PRIVATE_STREAM_1,
        }
    }

    const fn is_video(self) -> bool {
        matches!(self, Self::H264)
    }
}

#[derive(Debug)]
struct ElementaryStream {
    pid: u16,
    codec: StreamCodec,
    continuity_counter: u8,
}

/// Writes one MPEG-TS program into an in-memory buffer.
///
/// PAT and PMT are emitted before the first packet and again ahead of every
/// video keyframe, so a segment produced by a fresh muxer is self-contained.
#[derive(Debug)]
pub struct TsMuxer {
    streams: Vec<ElementaryStream>,
    pat_cc: u8,
    pmt_cc: u8,
    tables_written: bool,
    out: BytesMut,
}

impl Default for TsMuxer {
    fn default() -> Self {
        Self::new()
    }
}

impl TsMuxer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            streams: Vec::new(),
            pat_cc: 0,
            pmt_cc: 0,
            tables_written: false,
            out: BytesMut::with_capacity(512 * 1024),
        }
    }

    /// Registers an elementary stream and returns its PID.
    pub fn add_stream(&mut self, codec: StreamCodec) -> Result<u16, MpegTsError> {
        if self.tables_written {
            return Err(MpegTsErrorValue::StreamsSealed.into());
        }
        if self.streams.len() >= MAX_STREAMS {
            return Err(MpegTsErrorValue::StreamCountExceeded.into());
        }

        let pid = define::FIRST_ES_PID + self.streams.len() as u16;
        self.streams.push(ElementaryStream {
            pid,
            codec,
            continuity_counter: 0,
        });
        Ok(pid)
    }

    /// Muxes one access unit. Timestamps are in 90 kHz units.
    pub fn write_frame(
        &mut self,
        pid: u16,
        pts: u64,
        dts: u64,
        keyframe: bool,
        payload: &[u8],
    ) -> Result<(), MpegTsError> {
        if payload.is_empty() {
            return Err(MpegTsErrorValue::EmptyPayload.into());
        }
        let index = self
            .streams
            .iter()
            .position(|s| s.pid == pid)
            .ok_or(MpegTsErrorValue::StreamNotFound(pid))?;
        let codec = self.streams[index].codec;

        if !self.tables_written || (keyframe && codec.is_video()) {
            self.write_tables();
        }

        let mut body = BytesMut::with_capacity(payload.len() + 16);
        match codec {
            StreamCodec::H264 => {
                if !payload.starts_with(&define::H264_AUD) {
                    body.put_slice(&define::H264_AUD);
                }
                body.put_slice(payload);
            }
            StreamCodec::Opus { .. } => {
                pes::put_opus_control_header(&mut body, payload.len());
                body.put_slice(payload);
            }
        }

        let packet = pes::build_pes(codec.stream_id(), pts, dts, &body);
        let carries_pcr = self.pcr_pid() == Some(pid);
        self.write_pes_packets(index, &packet, carries_pcr.then_some(dts), keyframe);
        Ok(())
    }

    /// Bytes written so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.out.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.out.is_empty()
    }

    /// Consumes the muxer, returning the finished transport stream.
    #[must_use]
    pub fn finish(self) -> Bytes {
        self.out.freeze()
    }

    fn pcr_pid(&self) -> Option<u16> {
        self.streams
            .iter()
            .find(|s| s.codec.is_video())
            .or_else(|| self.streams.first())
            .map(|s| s.pid)
    }

    fn write_tables(&mut self) {
        let mut pat = Pat::new();
        pat.programs.push(ProgramEntry {
            program_number: define::PROGRAM_NUMBER,
            pmt_pid: define::PMT_PID,
        });

        let pmt = Pmt {
            program_number: define::PROGRAM_NUMBER,
            pcr_pid: self.pcr_pid().unwrap_or(0x1fff),
            version_number: 0,
            streams: self
                .streams
                .iter()
                .map(|s| EsInfo {
                    stream_type: s.codec.stream_type(),
                    pid: s.pid,
                    descriptors: match s.codec {
                        StreamCodec::H264 => Bytes::new(),
                        StreamCodec::Opus { channels } => pmt::opus_descriptors(channels),
                    },
                })
                .collect(),
        };

        let pat_cc = next_cc(&mut self.pat_cc);
        write_section(&mut self.out, define::PAT_PID, pat_cc, &pat.write());
        let pmt_cc = next_cc(&mut self.pmt_cc);
        write_section(&mut self.out, define::PMT_PID, pmt_cc, &pmt.write());
        self.tables_written = true;
    }

    fn write_pes_packets(&mut self, index: usize, pes: &[u8], pcr: Option<u64>, keyframe: bool) {
        let pid = self.streams[index].pid;
        let mut offset = 0;
        let mut first = true;

        while offset < pes.len() {
            let mut adaptation = BytesMut::new();
            if first && (pcr.is_some() || keyframe) {
                let mut flags = 0u8;
                if keyframe {
                    /*random_access_indicator*/
                    flags |= 0x40;
                }
                if pcr.is_some() {
                    flags |= 0x10;
                }
                adaptation.put_u8(flags);
                if let Some(base) = pcr {
                    pes::put_pcr(&mut adaptation, base);
                }
            }

            let header_af = if adaptation.is_empty() { 0 } else { 1 + adaptation.len() };
            let capacity = define::TS_PAYLOAD_SIZE - header_af;
            let chunk = (pes.len() - offset).min(capacity);
            let stuffing = capacity - chunk;
            if stuffing > 0 {
                if adaptation.is_empty() {
                    // the length byte itself accounts for one stuffing byte
                    if stuffing >= 2 {
                        adaptation.put_u8(0x00);
                        adaptation.put_bytes(0xff, stuffing - 2);
                    }
                } else {
                    adaptation.put_bytes(0xff, stuffing);
                }
            }
            let has_adaptation = header_af > 0 || stuffing > 0;

            let cc = next_cc(&mut self.streams[index].continuity_counter);
            self.out.put_u8(define::SYNC_BYTE);
            let pusi = if first { 0x40 } else { 0x00 };
            self.out.put_u8(pusi | ((pid >> 8) as u8 & 0x1f));
            self.out.put_u8((pid & 0xff) as u8);
            let control = if has_adaptation { 0x30 } else { 0x10 };
            self.out.put_u8(control | cc);
            if has_adaptation {
                self.out.put_u8(adaptation.len() as u8);
                self.out.put_slice(&adaptation);
            }
            self.out.put_slice(&pes[offset..offset + chunk]);

            offset += chunk;
            first = false;
        }
    }
}

fn next_cc(counter: &mut u8) -> u8 {
    let cc = *counter;
    *counter = (cc + 1) & 0x0f;
    cc
}

fn write_section(out: &mut BytesMut, pid: u16, cc: u8, section: &[u8]) {
    let start = out.len();
    out.put_u8(define::SYNC_BYTE);
    out.put_u8(0x40 | ((pid >> 8) as u8 & 0x1f));
    out.put_u8((pid & 0xff) as u8);
    out.put_u8(0x10 | cc);
    /*pointer_field*/
    out.put_u8(0x00);
    out.put_slice(section);
    let written = out.len() - start;
    out.put_bytes(0xff, define::TS_PACKET_SIZE - written);
}
