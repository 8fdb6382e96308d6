// HTTP exposer for live playlists and segments
//
// Routes:
//   GET /{device_id}/playlist[.m3u8]  -> current playlist document
//   GET /{device_id}/segment{N}[.ts]  -> segment N while resident

use super::store::HlsRegistry;
use crate::error::HlsError;
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::net::SocketAddr;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const PLAYLIST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";
const SEGMENT_CONTENT_TYPE: &str = "video/mp2t";

pub struct HlsServer {
    addr: SocketAddr,
    registry: HlsRegistry,
    shutdown_token: CancellationToken,
}

impl HlsServer {
    #[must_use]
    pub fn new(addr: SocketAddr, registry: HlsRegistry) -> Self {
        Self {
            addr,
            registry,
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Binds the listener and serves in a background task.
    pub async fn start(self) -> Result<HlsServerHandle, HlsError> {
        let listener = tokio::net::TcpListener::bind(self.addr)
            .await
            .map_err(|source| HlsError::Bind {
                addr: self.addr,
                source,
            })?;
        let local_addr = listener.local_addr()?;
        tracing::info!(addr = %local_addr, "HLS exposer listening");

        let app = router(self.registry);
        let shutdown = self.shutdown_token.clone();
        let task = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
            match result {
                Ok(()) => tracing::info!("HLS exposer shut down gracefully"),
                Err(e) => tracing::error!(error = %e, "HLS exposer error"),
            }
        });

        Ok(HlsServerHandle {
            local_addr,
            shutdown_token: self.shutdown_token,
            task,
        })
    }
}

/// Running exposer.
pub struct HlsServerHandle {
    local_addr: SocketAddr,
    shutdown_token: CancellationToken,
    task: JoinHandle<()>,
}

impl HlsServerHandle {
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting connections and waits for the server task.
    pub async fn shutdown(self) {
        self.shutdown_token.cancel();
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "HLS exposer task ended abnormally");
        }
    }
}

/// Builds the exposer's router over `registry`.
pub fn router(registry: HlsRegistry) -> Router {
    Router::new()
        .route("/{device_id}/{resource}", get(serve_resource))
        .with_state(registry)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resource {
    Playlist,
    Segment(u64),
}

fn parse_resource(name: &str) -> Option<Resource> {
    match name {
        "playlist" | "playlist.m3u8" => Some(Resource::Playlist),
        _ => {
            let stem = name.strip_suffix(".ts").unwrap_or(name);
            let digits = stem.strip_prefix("segment")?;
            if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            digits.parse().ok().map(Resource::Segment)
        }
    }
}

async fn serve_resource(
    Path((device_id, resource)): Path<(String, String)>,
    State(registry): State<HlsRegistry>,
) -> Response {
    let Some(resource) = parse_resource(&resource) else {
        return not_found("Unknown resource");
    };
    let Some(store) = registry.get(&device_id) else {
        tracing::debug!(device_id = %device_id, "Stream not found");
        return not_found("Stream not found");
    };

    match resource {
        Resource::Playlist => match store.playlist() {
            Some(body) => (
                StatusCode::OK,
                [
                    (header::CONTENT_TYPE, PLAYLIST_CONTENT_TYPE),
                    (header::CACHE_CONTROL, "no-cache"),
                    (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
                ],
                body,
            )
                .into_response(),
            None => not_found("Playlist not ready"),
        },
        Resource::Segment(index) => match store.segment(index) {
            Some(body) => (
                StatusCode::OK,
                [
                    (header::CONTENT_TYPE, SEGMENT_CONTENT_TYPE),
                    (header::CACHE_CONTROL, "public, max-age=30"),
                    (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
                ],
                body,
            )
                .into_response(),
            None => {
                tracing::debug!(device_id = %device_id, index, "Segment not found");
                not_found("Segment not found")
            }
        },
    }
}

fn not_found(message: &'static str) -> Response {
    (
        StatusCode::NOT_FOUND,
        [(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")],
        message,
    )
        .into_response()
}
