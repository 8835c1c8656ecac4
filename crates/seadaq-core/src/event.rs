//! Asynchronous driver notifications.
//!
//! A driver owns one broadcast channel of [`Notification`]s. Samples,
//! state changes, configuration changes, and asynchronous errors all
//! flow through it; callers subscribe through the driver layer and
//! filter on [`Notification::kind`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Discriminant for the asynchronous notifications a driver emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationKind {
    /// A connection-level or protocol-level FSM entered a new state.
    /// Value: the state name.
    StateChange,
    /// The instrument configuration changed. Value: the full
    /// name → value parameter map.
    ConfigChange,
    /// A parsed sample left the chunker. Value: the sample record.
    Sample,
    /// An asynchronous failure (scheduler job, sample parse, reader).
    /// Value: the error message.
    Error,
    /// The result of a scheduled or otherwise caller-less operation.
    Result,
    /// Raw pass-through bytes received while in direct access.
    DirectAccess,
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            NotificationKind::StateChange => "STATE_CHANGE",
            NotificationKind::ConfigChange => "CONFIG_CHANGE",
            NotificationKind::Sample => "SAMPLE",
            NotificationKind::Error => "ERROR",
            NotificationKind::Result => "RESULT",
            NotificationKind::DirectAccess => "DIRECT_ACCESS",
        };
        f.write_str(name)
    }
}

/// One tagged asynchronous notification: `{type, value, time}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    /// What kind of payload this is.
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    /// Kind-specific payload.
    pub value: serde_json::Value,
    /// Wall-clock emission time.
    pub time: DateTime<Utc>,
}

impl Notification {
    /// Build a notification stamped with the current wall-clock time.
    pub fn new(kind: NotificationKind, value: serde_json::Value) -> Self {
        Self {
            kind,
            value,
            time: Utc::now(),
        }
    }
}

/// Sender half of a driver's notification channel.
pub type NotificationSender = broadcast::Sender<Notification>;

/// Receiver half of a driver's notification channel.
pub type NotificationReceiver = broadcast::Receiver<Notification>;

/// Create a notification channel with the given capacity.
///
/// Slow subscribers lag and drop rather than blocking the driver.
pub fn notification_channel(capacity: usize) -> (NotificationSender, NotificationReceiver) {
    broadcast::channel(capacity)
}
