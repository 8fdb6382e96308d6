//! Session description text helpers.

use crate::signaling::CandidatePayload;
use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

/// Constrained baseline 3.1, decodable by every H.264 decoder we ship.
pub const COMPATIBLE_H264_PROFILE: &str = "42e01f";

static PROFILE_LEVEL_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"profile-level-id=[^;\s]+").expect("invalid profile-level-id regex")
});
static H264_RTPMAP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^a=rtpmap:(\d+)\s+H264/").expect("invalid rtpmap regex")
});
static FMTP_PAYLOAD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^a=fmtp:(\d+)\s").expect("invalid fmtp regex"));

/// Forces every H.264 format line to the compatible profile.
///
/// A format line is H.264 when it mentions the codec or when an rtpmap
/// line maps its payload type to H.264. An existing `profile-level-id` is
/// replaced; a missing one is appended.
#[must_use]
pub fn rewrite_h264_profile(sdp: &str) -> String {
    let h264_payloads: HashSet<&str> = sdp
        .lines()
        .filter_map(|line| H264_RTPMAP.captures(line.trim_end()))
        .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
        .collect();

    let mut out = String::with_capacity(sdp.len() + 64);
    for line in sdp.lines() {
        let line = line.trim_end_matches('\r');
        if line.starts_with("a=fmtp:") {
            let payload = FMTP_PAYLOAD
                .captures(line)
                .and_then(|caps| caps.get(1))
                .map(|m| m.as_str());
            let is_h264 = line.contains("H264") || payload.is_some_and(|pt| h264_payloads.contains(pt));
            if is_h264 {
                let rewritten = if PROFILE_LEVEL_ID.is_match(line) {
                    PROFILE_LEVEL_ID
                        .replace(line, format!("profile-level-id={COMPATIBLE_H264_PROFILE}"))
                        .into_owned()
                } else {
                    format!("{line};profile-level-id={COMPATIBLE_H264_PROFILE}")
                };
                if rewritten != line {
                    tracing::debug!(original = %line, rewritten = %rewritten, "Rewrote H264 format line");
                }
                out.push_str(&rewritten);
                out.push_str("\r\n");
                continue;
            }
        }
        out.push_str(line);
        out.push_str("\r\n");
    }
    out
}

/// Drops candidate lines; candidates are trickled separately.
#[must_use]
pub fn strip_candidates(sdp: &str) -> String {
    let mut out = String::with_capacity(sdp.len());
    for line in sdp.lines() {
        let line = line.trim_end_matches('\r');
        if line.starts_with("a=candidate:") || line.starts_with("a=end-of-candidates") {
            continue;
        }
        out.push_str(line);
        out.push_str("\r\n");
    }
    out
}

/// Candidates embedded in a description, tagged with the mid and media-line
/// index of the section they appear in.
#[must_use]
pub fn extract_candidates(sdp: &str) -> Vec<CandidatePayload> {
    struct Section {
        mid: Option<String>,
        candidates: Vec<String>,
    }

    let mut sections: Vec<Section> = Vec::new();
    for line in sdp.lines() {
        let line = line.trim_end_matches('\r');
        if line.starts_with("m=") {
            sections.push(Section {
                mid: None,
                candidates: Vec::new(),
            });
        } else if let Some(mid) = line.strip_prefix("a=mid:") {
            if let Some(section) = sections.last_mut() {
                section.mid = Some(mid.to_string());
            }
        } else if let Some(candidate) = line.strip_prefix("a=") {
            if candidate.starts_with("candidate:") {
                if let Some(section) = sections.last_mut() {
                    section.candidates.push(candidate.to_string());
                }
            }
        }
    }

    sections
        .into_iter()
        .enumerate()
        .flat_map(|(index, section)| {
            let mid = section.mid;
            section.candidates.into_iter().map(move |candidate| CandidatePayload {
                candidate,
                sdp_mid: mid.clone(),
                sdp_mline_index: u16::try_from(index).ok(),
            })
        })
        .collect()
}

/// Whether the description has a media section of `kind` (`audio`, `video`).
#[must_use]
pub fn has_media(sdp: &str, kind: &str) -> bool {
    sdp.lines()
        .filter_map(|line| line.strip_prefix("m="))
        .any(|media| media.split_whitespace().next() == Some(kind))
}
