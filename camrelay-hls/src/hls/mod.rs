pub mod playlist;
pub mod server;
pub mod store;

pub use playlist::{segment_file_name, segment_key, Playlist, PlaylistEntry};
pub use server::{router, HlsServer, HlsServerHandle};
pub use store::{HlsRegistry, PlaylistBuilder, Rotation, Segment, SegmentStore, WindowConfig};
