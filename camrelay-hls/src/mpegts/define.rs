//ITU-T H.222.0 constants used by the segment writer.

pub const TS_PACKET_SIZE: usize = 188;
pub const TS_PAYLOAD_SIZE: usize = TS_PACKET_SIZE - 4;
pub const SYNC_BYTE: u8 = 0x47;

pub const PAT_PID: u16 = 0x0000;
pub const PMT_PID: u16 = 0x1000;
pub const FIRST_ES_PID: u16 = 0x0100;

pub const PROGRAM_NUMBER: u16 = 1;
pub const TRANSPORT_STREAM_ID: u16 = 1;

/// 90 kHz system clock used for PTS, DTS and PCR base.
pub const PTS_HZ: u64 = 90_000;

pub mod table_id {
    pub const PAT: u8 = 0x00;
    pub const PMT: u8 = 0x02;
}

pub mod stream_type {
    pub const H264: u8 = 0x1b;
    pub const PRIVATE_DATA: u8 = 0x06;
}

pub mod stream_id {
    pub const VIDEO: u8 = 0xe0;
    pub const PRIVATE_STREAM_1: u8 = 0xbd;
}

pub mod descriptor_tag {
    pub const REGISTRATION: u8 = 0x05;
    pub const EXTENSION: u8 = 0x7f;
}

/// H.264 access unit delimiter, primary_pic_type = 7 (any slice type).
pub const H264_AUD: [u8; 6] = [0x00, 0x00, 0x00, 0x01, 0x09, 0xf0];
