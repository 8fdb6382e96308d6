//! Live HLS output for relayed camera streams: an MPEG-TS segment writer,
//! segment storage backends, the per-device sliding window with its
//! playlist, and the HTTP exposer that serves both.

pub mod error;
pub mod hls;
pub mod mpegts;
pub mod storage;

pub use error::HlsError;
pub use hls::{
    HlsRegistry, HlsServer, HlsServerHandle, Playlist, PlaylistBuilder, Rotation, Segment,
    SegmentStore, WindowConfig,
};
pub use mpegts::{MpegTsError, StreamCodec, TsMuxer};
pub use storage::{FileStorage, MemoryStorage, SegmentStorage};
