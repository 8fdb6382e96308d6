//! Per-device segment store and the playlist builder that rotates it.
//!
//! A store serves exactly the segments its playlist lists. Every rotation
//! evicts whatever fell below the window, so the playlist's media sequence
//! is always the oldest segment still being served.

use super::playlist::{segment_file_name, segment_key, Playlist, PlaylistEntry};
use crate::error::HlsError;
use crate::storage::SegmentStorage;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;

/// A closed, immutable segment.
#[derive(Debug, Clone)]
pub struct Segment {
    pub index: u64,
    pub data: Bytes,
    pub duration: Duration,
}

#[derive(Debug, Default)]
struct StoreState {
    playlist: Option<Bytes>,
    segments: BTreeMap<u64, Segment>,
}

/// Segments and rendered playlist of one device.
///
/// Readers take a shared lock and clone `Bytes`; the single writer swaps
/// the playlist and maps under one exclusive lock.
#[derive(Debug)]
pub struct SegmentStore {
    device_id: String,
    state: RwLock<StoreState>,
}

impl SegmentStore {
    #[must_use]
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            state: RwLock::new(StoreState::default()),
        }
    }

    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Current playlist document, if a segment was ever published.
    #[must_use]
    pub fn playlist(&self) -> Option<Bytes> {
        self.state.read().playlist.clone()
    }

    #[must_use]
    pub fn segment(&self, index: u64) -> Option<Bytes> {
        self.state.read().segments.get(&index).map(|s| s.data.clone())
    }

    #[must_use]
    pub fn resident_count(&self) -> usize {
        self.state.read().segments.len()
    }

    /// Oldest segment still served.
    #[must_use]
    pub fn oldest_resident(&self) -> Option<u64> {
        self.state.read().segments.keys().next().copied()
    }

    fn contains(&self, index: u64) -> bool {
        self.state.read().segments.contains_key(&index)
    }
}

/// Process-wide map of device id to segment store, shared with the exposer.
#[derive(Debug, Clone, Default)]
pub struct HlsRegistry {
    stores: Arc<DashMap<String, Arc<SegmentStore>>>,
}

impl HlsRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the device's store, creating it on first use.
    pub fn register(&self, device_id: &str) -> Arc<SegmentStore> {
        self.stores
            .entry(device_id.to_string())
            .or_insert_with(|| Arc::new(SegmentStore::new(device_id)))
            .clone()
    }

    #[must_use]
    pub fn get(&self, device_id: &str) -> Option<Arc<SegmentStore>> {
        self.stores.get(device_id).map(|s| s.clone())
    }

    pub fn unregister(&self, device_id: &str) -> Option<Arc<SegmentStore>> {
        self.stores.remove(device_id).map(|(_, store)| store)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.stores.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }

    pub fn clear(&self) {
        self.stores.clear();
    }
}

/// Retention parameters of the sliding window.
#[derive(Debug, Clone, Copy)]
pub struct WindowConfig {
    pub max_segments: usize,
    /// Width of the storage sweep below the window, catching segments that
    /// never made it into memory.
    pub grace: usize,
    pub segment_duration: Duration,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            max_segments: 8,
            grace: 10,
            segment_duration: Duration::from_secs(1),
        }
    }
}

/// Result of one rotation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rotation {
    pub media_sequence: u64,
    pub listed: usize,
    pub resident: usize,
    pub evicted: Vec<u64>,
}

/// Maintains a device's window after every segment close.
pub struct PlaylistBuilder {
    window: WindowConfig,
    storage: Arc<dyn SegmentStorage>,
    store: Arc<SegmentStore>,
}

impl PlaylistBuilder {
    pub fn new(
        window: WindowConfig,
        storage: Arc<dyn SegmentStorage>,
        store: Arc<SegmentStore>,
    ) -> Self {
        Self {
            window,
            storage,
            store,
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<SegmentStore> {
        &self.store
    }

    /// Recomputes the window `[max(0, next - max_segments), next)`, loads
    /// segments missing from memory out of backing storage, re-renders the
    /// playlist and evicts every segment below the window, sweeping
    /// `grace` indices below it out of backing storage as well.
    pub async fn rotate(&self, next_index: u64) -> Result<Rotation, HlsError> {
        let start = next_index.saturating_sub(self.window.max_segments as u64);

        let mut loaded = Vec::new();
        for index in start..next_index {
            if self.store.contains(index) {
                continue;
            }
            match self.storage.read(&segment_key(index)).await {
                Ok(data) if !data.is_empty() => loaded.push(Segment {
                    index,
                    data,
                    duration: self.window.segment_duration,
                }),
                Ok(_) => {
                    tracing::debug!(device_id = %self.store.device_id, index, "Skipping empty segment");
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    tracing::debug!(device_id = %self.store.device_id, index, "Segment not in storage");
                }
                Err(e) => return Err(HlsError::Storage(e)),
            }
        }

        let rotation = {
            let mut state = self.store.state.write();
            for segment in loaded {
                state.segments.insert(segment.index, segment);
            }

            let kept = state.segments.split_off(&start);
            let evicted: Vec<u64> = std::mem::replace(&mut state.segments, kept)
                .into_keys()
                .collect();

            let media_sequence = state.segments.keys().next().copied().unwrap_or(start);
            let entries = state
                .segments
                .values()
                .map(|s| PlaylistEntry {
                    index: s.index,
                    duration: s.duration,
                })
                .collect();
            let document = Playlist::new(media_sequence, entries).render(segment_file_name);
            state.playlist = Some(Bytes::from(document));

            Rotation {
                media_sequence,
                listed: state.segments.len(),
                resident: state.segments.len(),
                evicted,
            }
        };

        let sweep = start.saturating_sub(self.window.grace as u64)..start;
        let mut stale: Vec<u64> = rotation.evicted.clone();
        stale.extend(sweep.filter(|index| !rotation.evicted.contains(index)));
        for index in stale {
            if let Err(e) = self.storage.delete(&segment_key(index)).await {
                tracing::warn!(device_id = %self.store.device_id, index, error = %e, "Failed to delete evicted segment");
            }
        }

        tracing::debug!(
            device_id = %self.store.device_id,
            media_sequence = rotation.media_sequence,
            listed = rotation.listed,
            resident = rotation.resident,
            "Playlist rotated"
        );

        Ok(rotation)
    }

}
