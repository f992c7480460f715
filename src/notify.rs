// =============================================================================
// Notification dispatcher — alert routing, independent of transport
// =============================================================================
//
// Grounded on the teacher's `tracing`-first logging idiom: the default
// dispatcher routes alerts through `tracing` so the crate is runnable with
// no external transport wired up. Channel transports (Slack, email, SMS)
// are out of process — this module only defines the trait boundary and a
// logging fallback.
// =============================================================================

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertPriority {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    Price,
    Performance,
    Risk,
    Health,
    Milestone,
    Custom,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub priority: AlertPriority,
    pub alert_type: AlertType,
    pub message: String,
    pub throttle_window_secs: u64,
    pub created_at: DateTime<Utc>,
    pub delivery_status: HashMap<String, bool>,
}

impl Alert {
    pub fn new(priority: AlertPriority, alert_type: AlertType, message: impl Into<String>) -> Self {
        Self {
            priority,
            alert_type,
            message: message.into(),
            throttle_window_secs: 60,
            created_at: Utc::now(),
            delivery_status: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchOutcome {
    pub success: bool,
    pub error: Option<String>,
}

#[async_trait]
pub trait AlertDispatcher: Send + Sync {
    async fn send(&self, alert: &Alert) -> DispatchOutcome;
}

/// Default dispatcher: routes every alert through `tracing` at a level
/// matched to its priority. Always reports `success=true` since there is no
/// external channel to fail against.
pub struct LoggingDispatcher;

#[async_trait]
impl AlertDispatcher for LoggingDispatcher {
    async fn send(&self, alert: &Alert) -> DispatchOutcome {
        match alert.priority {
            AlertPriority::Critical | AlertPriority::High => {
                error!(alert_type = ?alert.alert_type, priority = ?alert.priority, "{}", alert.message);
            }
            AlertPriority::Medium => {
                warn!(alert_type = ?alert.alert_type, priority = ?alert.priority, "{}", alert.message);
            }
            AlertPriority::Low | AlertPriority::Info => {
                info!(alert_type = ?alert.alert_type, priority = ?alert.priority, "{}", alert.message);
            }
        }
        DispatchOutcome { success: true, error: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn logging_dispatcher_always_succeeds() {
        let dispatcher = LoggingDispatcher;
        let alert = Alert::new(AlertPriority::Critical, AlertType::Risk, "position quarantined");
        let outcome = dispatcher.send(&alert).await;
        assert!(outcome.success);
        assert!(outcome.error.is_none());
    }

    #[test]
    fn priority_ordering_places_critical_above_info() {
        assert!(AlertPriority::Critical > AlertPriority::Info);
        assert!(AlertPriority::High > AlertPriority::Medium);
    }
}
