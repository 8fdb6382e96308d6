use std::fmt::Write as _;
use std::time::Duration;

/// Public name of a segment as referenced from the playlist.
#[must_use]
pub fn segment_file_name(index: u64) -> String {
    format!("segment{index}.ts")
}

/// Backing-storage key of a segment.
#[must_use]
pub fn segment_key(index: u64) -> String {
    format!("segment{index}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaylistEntry {
    pub index: u64,
    pub duration: Duration,
}

/// Live (sliding window) media playlist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Playlist {
    pub media_sequence: u64,
    pub entries: Vec<PlaylistEntry>,
}

impl Playlist {
    #[must_use]
    pub fn new(media_sequence: u64, entries: Vec<PlaylistEntry>) -> Self {
        Self {
            media_sequence,
            entries,
        }
    }

    /// Longest entry rounded up to whole seconds, at least 1.
    #[must_use]
    pub fn target_duration(&self) -> u64 {
        self.entries
            .iter()
            .map(|e| e.duration.as_millis().div_ceil(1000) as u64)
            .max()
            .unwrap_or(1)
            .max(1)
    }

    /// Renders the M3U8 document; `segment_uri` maps an index to its URI.
    pub fn render<F>(&self, mut segment_uri: F) -> String
    where
        F: FnMut(u64) -> String,
    {
        let mut m3u8 = String::with_capacity(128 + self.entries.len() * 32);

        m3u8.push_str("#EXTM3U\n");
        m3u8.push_str("#EXT-X-VERSION:3\n");
        m3u8.push_str("#EXT-X-INDEPENDENT-SEGMENTS\n");
        let _ = writeln!(m3u8, "#EXT-X-TARGETDURATION:{}", self.target_duration());
        let _ = writeln!(m3u8, "#EXT-X-MEDIA-SEQUENCE:{}", self.media_sequence);

        for entry in &self.entries {
            let _ = writeln!(m3u8, "#EXTINF:{:.3},", entry.duration.as_secs_f64());
            let _ = writeln!(m3u8, "{}", segment_uri(entry.index));
        }

        m3u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_live_playlist() {
        let entries = (3..6)
            .map(|index| PlaylistEntry {
                index,
                duration: Duration::from_secs(1),
            })
            .collect();
        let playlist = Playlist::new(3, entries);

        let doc = playlist.render(segment_file_name);
        let expected = "#EXTM3U\n\
                        #EXT-X-VERSION:3\n\
                        #EXT-X-INDEPENDENT-SEGMENTS\n\
                        #EXT-X-TARGETDURATION:1\n\
                        #EXT-X-MEDIA-SEQUENCE:3\n\
                        #EXTINF:1.000,\n\
                        segment3.ts\n\
                        #EXTINF:1.000,\n\
                        segment4.ts\n\
                        #EXTINF:1.000,\n\
                        segment5.ts\n";
        assert_eq!(doc, expected);
        assert!(!doc.contains("#EXT-X-ENDLIST"));
    }

    #[test]
    fn test_target_duration_rounds_up() {
        let playlist = Playlist::new(
            0,
            vec![
                PlaylistEntry {
                    index: 0,
                    duration: Duration::from_millis(1500),
                },
                PlaylistEntry {
                    index: 1,
                    duration: Duration::from_millis(2001),
                },
            ],
        );
        assert_eq!(playlist.target_duration(), 3);
        assert_eq!(Playlist::new(0, Vec::new()).target_duration(), 1);
    }

    #[test]
    fn test_segment_names() {
        assert_eq!(segment_file_name(12), "segment12.ts");
        assert_eq!(segment_key(12), "segment12");
    }
}
