use {
    super::{crc32, define},
    bytes::{BufMut, BytesMut},
};

/// One program association entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramEntry {
    pub program_number: u16,
    pub pmt_pid: u16,
}

#[derive(Debug, Clone)]
pub struct Pat {
    pub transport_stream_id: u16,
    pub version_number: u8, //5bits
    pub programs: Vec<ProgramEntry>,
}

impl Default for Pat {
    fn default() -> Self {
        Self::new()
    }
}

impl Pat {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            transport_stream_id: define::TRANSPORT_STREAM_ID,
            version_number: 0,
            programs: Vec::new(),
        }
    }

    /// Serializes the section, CRC included.
    #[must_use]
    pub fn write(&self) -> BytesMut {
        let mut out = BytesMut::with_capacity(12 + self.programs.len() * 4);

        /*table id*/
        out.put_u8(define::table_id::PAT);
        /*section length: header(5) + programs + crc(4)*/
        let length = self.programs.len() as u16 * 4 + 5 + 4;
        out.put_u16(0xb000 | length);
        out.put_u16(self.transport_stream_id);
        /*version_number + current_next_indicator*/
        out.put_u8(0xc1 | ((self.version_number & 0x1f) << 1));
        /*section_number + last_section_number*/
        out.put_u16(0x0000);

        for program in &self.programs {
            out.put_u16(program.program_number);
            out.put_u16(0xe000 | program.pmt_pid);
        }

        let crc = crc32::gen_crc32(&out);
        out.put_u32(crc);
        out
    }
}
