//! User-facing sync alerts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use uuid::Uuid;

/// Alerts kept in memory; older ones fall off.
pub const MAX_ALERTS: usize = 50;
/// Alerts written to storage.
pub const PERSISTED_ALERTS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    NewTransactions,
    DuplicateDetected,
    AuthRequired,
    SyncFailed,
}

impl AlertType {
    /// Whether the user has to do something about the alert.
    pub fn requires_action(self) -> bool {
        matches!(self, AlertType::AuthRequired | AlertType::DuplicateDetected)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncAlert {
    pub id: String,
    #[serde(rename = "type")]
    pub alert_type: AlertType,
    pub title: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub read: bool,
    pub action_required: bool,
}

/// Newest-first alert list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AlertCenter {
    alerts: VecDeque<SyncAlert>,
}

impl AlertCenter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_persisted(alerts: Vec<SyncAlert>) -> Self {
        let mut alerts: VecDeque<SyncAlert> = alerts.into();
        alerts.truncate(MAX_ALERTS);
        Self { alerts }
    }

    pub fn add_alert(
        &mut self,
        alert_type: AlertType,
        title: impl Into<String>,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> SyncAlert {
        let alert = SyncAlert {
            id: Uuid::new_v4().to_string(),
            alert_type,
            title: title.into(),
            message: message.into(),
            timestamp: now,
            read: false,
            action_required: alert_type.requires_action(),
        };
        self.alerts.push_front(alert.clone());
        self.alerts.truncate(MAX_ALERTS);
        alert
    }

    /// Returns false when no alert has that id.
    pub fn mark_alert_as_read(&mut self, alert_id: &str) -> bool {
        match self.alerts.iter_mut().find(|alert| alert.id == alert_id) {
            Some(alert) => {
                alert.read = true;
                true
            }
            None => false,
        }
    }

    pub fn unread_alerts(&self) -> Vec<SyncAlert> {
        self.alerts.iter().filter(|a| !a.read).cloned().collect()
    }

    pub fn unread_count(&self) -> usize {
        self.alerts.iter().filter(|a| !a.read).count()
    }

    pub fn all(&self) -> Vec<SyncAlert> {
        self.alerts.iter().cloned().collect()
    }

    pub fn clear_alerts(&mut self) {
        self.alerts.clear();
    }

    /// Used by callers to avoid repeating an alert for a condition that is still open.
    pub fn has_unread(&self, alert_type: AlertType, title: &str) -> bool {
        self.alerts
            .iter()
            .any(|a| !a.read && a.alert_type == alert_type && a.title == title)
    }

    pub fn persisted(&self) -> Vec<SyncAlert> {
        self.alerts.iter().take(PERSISTED_ALERTS).cloned().collect()
    }
}
