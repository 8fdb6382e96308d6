//! Minimal MPEG-TS writer for HLS segments.

pub mod crc32;
pub mod define;
pub mod errors;
pub mod muxer;
pub mod pat;
pub mod pes;
pub mod pmt;

pub use errors::{MpegTsError, MpegTsErrorValue};
pub use muxer::{StreamCodec, TsMuxer};
