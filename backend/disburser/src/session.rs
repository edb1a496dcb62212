//! Per-session user and notification state.
//!
//! One [`SessionStore`] is created at process start and passed by reference
//! to whoever needs it. Starting a session for a different user, or ending
//! the session, clears the notification list.

use std::collections::VecDeque;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::orchestrator::StepListener;
use crate::types::{MilestoneId, Status, Step, StepEvent};

/// Oldest notifications are dropped past this many.
pub const MAX_NOTIFICATIONS: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub milestone_id: MilestoneId,
    pub step: Step,
    pub status: Status,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn from_event(event: &StepEvent) -> Self {
        let message = match &event.error {
            Some(error) => format!(
                "Milestone {}: {} is {} ({error})",
                event.milestone_id, event.step, event.status
            ),
            None => format!(
                "Milestone {}: {} is {}",
                event.milestone_id, event.step, event.status
            ),
        };
        Notification {
            milestone_id: event.milestone_id,
            step: event.step,
            status: event.status,
            message,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Default)]
struct SessionState {
    user: Option<String>,
    notifications: VecDeque<Notification>,
}

#[derive(Debug, Default)]
pub struct SessionStore {
    state: RwLock<SessionState>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a session for `user`. Notifications belonging to a previous,
    /// different user are discarded.
    pub fn begin(&self, user: impl Into<String>) {
        let user = user.into();
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if state.user.as_deref() != Some(user.as_str()) {
            state.notifications.clear();
        }
        state.user = Some(user);
    }

    /// End the current session and clear everything it held.
    pub fn end(&self) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.user = None;
        state.notifications.clear();
    }

    pub fn user(&self) -> Option<String> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .user
            .clone()
    }

    /// Add a notification to the active session. Ignored when no session is active.
    pub fn push(&self, notification: Notification) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if state.user.is_none() {
            return;
        }
        if state.notifications.len() == MAX_NOTIFICATIONS {
            state.notifications.pop_front();
        }
        state.notifications.push_back(notification);
    }

    /// Notifications, oldest first.
    pub fn notifications(&self) -> Vec<Notification> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .notifications
            .iter()
            .cloned()
            .collect()
    }

    /// A step listener that turns events into notifications for this store.
    pub fn listener(self: &Arc<Self>) -> Arc<dyn StepListener> {
        let store = Arc::clone(self);
        Arc::new(move |event: &StepEvent| store.push(Notification::from_event(event)))
    }
}
