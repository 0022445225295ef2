use serde::{Deserialize, Serialize};

/// Lifecycle state of the active session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    #[default]
    Idle,
    Loading,
    Ready,
    Error,
}

impl SessionState {
    /// Whether the session state machine allows moving from `self` to `next`.
    ///
    /// `stop()` may always return to idle and any state may fail. A new `start()` goes through
    /// idle first, so ready never falls back to loading.
    pub fn can_transition(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (_, Idle) | (_, Error) => true,
            (Idle, Loading) | (Loading, Ready) => true,
            (a, b) => a == b && a != Error,
        }
    }
}

/// Copy of the session's progress handed to callers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub state: SessionState,
    /// Percent of the selected file downloaded, 0-100.
    pub progress: f64,
    pub download_mb: f64,
    pub speed_kbs: f64,
    pub peers: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatusSnapshot {
    pub fn with_state(state: SessionState) -> Self {
        Self {
            state,
            ..Self::default()
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            state: SessionState::Error,
            error: Some(message.into()),
            ..Self::default()
        }
    }
}
