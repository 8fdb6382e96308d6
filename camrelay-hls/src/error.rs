use crate::mpegts::MpegTsError;
use std::net::SocketAddr;

#[derive(Debug, thiserror::Error)]
pub enum HlsError {
    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("Container error: {0}")]
    Container(#[from] MpegTsError),

    #[error("Failed to bind HLS exposer on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}
