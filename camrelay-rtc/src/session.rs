//! One negotiated camera session.

use crate::signaling::RelayCredentials;
use crate::types::{DeviceId, SessionId, SiteId};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::AbortHandle;
use webrtc::peer_connection::RTCPeerConnection;

/// Lifecycle of a session.
///
/// `New -> Negotiating -> Connected -> Closed`, with `Failed` reachable from
/// any open state when the transport reports failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    New,
    Negotiating,
    Connected,
    Failed,
    Closed,
}

impl SessionState {
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::New, Self::Negotiating)
                | (Self::Negotiating, Self::Connected)
                | (Self::New | Self::Negotiating | Self::Connected, Self::Failed)
                | (Self::New | Self::Negotiating | Self::Connected | Self::Failed, Self::Closed)
        )
    }

    #[must_use]
    pub const fn is_open(self) -> bool {
        !matches!(self, Self::Failed | Self::Closed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::New => "new",
            Self::Negotiating => "negotiating",
            Self::Connected => "connected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

pub struct Session {
    pub id: SessionId,
    pub device_id: DeviceId,
    pub site_id: SiteId,
    pub peer_connection: Arc<RTCPeerConnection>,
    pub credentials: Option<RelayCredentials>,
    pub created_at: Instant,
    state: Mutex<SessionState>,
    /// Held while the answer and its candidates go out; `true` once sent.
    /// Late candidates wait on it so none overtakes the answer.
    answer_sent: tokio::sync::Mutex<bool>,
    tasks: Mutex<Vec<AbortHandle>>,
}

impl Session {
    pub fn new(
        id: SessionId,
        device_id: DeviceId,
        site_id: SiteId,
        peer_connection: Arc<RTCPeerConnection>,
        credentials: Option<RelayCredentials>,
    ) -> Self {
        Self {
            id,
            device_id,
            site_id,
            peer_connection,
            credentials,
            created_at: Instant::now(),
            state: Mutex::new(SessionState::New),
            answer_sent: tokio::sync::Mutex::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Moves to `next` if the lifecycle allows it. Returns whether it moved.
    pub fn transition(&self, next: SessionState) -> bool {
        let mut state = self.state.lock();
        if state.can_transition_to(next) {
            tracing::debug!(session_id = %self.id, from = %*state, to = %next, "Session state changed");
            *state = next;
            true
        } else {
            false
        }
    }

    pub(crate) fn answer_gate(&self) -> &tokio::sync::Mutex<bool> {
        &self.answer_sent
    }

    /// Ties a background task's lifetime to this session.
    pub fn track_task(&self, handle: AbortHandle) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
    }

    /// Aborts every task tied to the session.
    pub fn abort_tasks(&self) -> usize {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        let count = tasks.len();
        for handle in tasks {
            handle.abort();
        }
        count
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("device_id", &self.device_id)
            .field("site_id", &self.site_id)
            .field("state", &self.state())
            .field("relay", &self.credentials.is_some())
            .finish_non_exhaustive()
    }
}
