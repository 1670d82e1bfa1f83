//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Primary orchestration and lifecycle management."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Downstream notifications (user alerts, operator reports). Delivery is
//! someone else's job; the orchestrator only says what happened.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;

use crate::request::ActivationMode;

/// Who receives an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertAudience {
    AllUsers,
    LevelOneUsers,
}

impl AlertAudience {
    /// Audience implied by an activation mode; `None` means no alert.
    pub fn for_mode(mode: ActivationMode) -> Option<Self> {
        match mode {
            ActivationMode::Survival => Some(AlertAudience::AllUsers),
            ActivationMode::Exercise => Some(AlertAudience::LevelOneUsers),
            ActivationMode::Preheat => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    Alert {
        organization_id: String,
        mode: ActivationMode,
        audience: AlertAudience,
    },
    ActivationReport {
        organization_id: String,
        launched: Vec<String>,
        not_launched: Vec<String>,
    },
    CertificateReport {
        renewed: Vec<String>,
        skipped: Vec<String>,
        failed: Vec<String>,
    },
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: Notification);
}

/// Writes notifications to the structured log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: Notification) {
        match serde_json::to_string(&notification) {
            Ok(payload) => info!(target: "tso::notify", %payload, "notification"),
            Err(err) => info!(target: "tso::notify", error = %err, ?notification, "notification"),
        }
    }
}

/// Keeps every notification for assertions.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    received: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn received(&self) -> Vec<Notification> {
        self.received.lock().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: Notification) {
        self.received.lock().push(notification);
    }
}
