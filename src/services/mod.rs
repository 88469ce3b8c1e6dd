//! Consumer services.
//!
//! Each service owns one durable queue bound to the orders exchange and one
//! [`EventHandler`] holding its in-memory state.

pub mod analytics;
pub mod email;
pub mod inventory;
pub mod sms;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::bus::{EventHandler, HandlerError};
use crate::envelope::Envelope;
use crate::events::text;

pub use analytics::{AnalyticsHandler, AnalyticsMetrics};
pub use email::{EmailHandler, EmailMessage};
pub use inventory::{Inventory, InventoryHandler, StockLevel};
pub use sms::{SmsHandler, SmsMessage};

/// The four consumer services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceKind {
    Analytics,
    Email,
    Inventory,
    Sms,
}

impl ServiceKind {
    pub const ALL: [ServiceKind; 4] = [
        ServiceKind::Analytics,
        ServiceKind::Email,
        ServiceKind::Inventory,
        ServiceKind::Sms,
    ];

    /// Durable queue owned by the service.
    pub fn queue(self) -> &'static str {
        match self {
            ServiceKind::Analytics => "analytics_queue",
            ServiceKind::Email => "email_queue",
            ServiceKind::Inventory => "inventory_queue",
            ServiceKind::Sms => "sms_queue",
        }
    }

    /// Name used when `service.name` is not configured.
    pub fn default_name(self) -> &'static str {
        match self {
            ServiceKind::Analytics => "analytics-service",
            ServiceKind::Email => "email-service",
            ServiceKind::Inventory => "inventory-service",
            ServiceKind::Sms => "sms-service",
        }
    }

    /// Fresh handler with empty (or seeded) state.
    pub fn handler(self, name: &str) -> Box<dyn EventHandler> {
        match self {
            ServiceKind::Analytics => Box::new(AnalyticsHandler::new(name)),
            ServiceKind::Email => Box::new(EmailHandler::new(name)),
            ServiceKind::Inventory => Box::new(InventoryHandler::new(name)),
            ServiceKind::Sms => Box::new(SmsHandler::new(name)),
        }
    }
}

impl std::fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.default_name())
    }
}

/// Typed view of an envelope payload. Only data that is not a JSON object
/// fails; missing fields fall back to their defaults.
pub(crate) fn decode<T: DeserializeOwned>(envelope: &Envelope) -> Result<T, HandlerError> {
    envelope
        .decode_data()
        .map_err(|source| HandlerError::InvalidPayload {
            event_type: envelope.event_type.clone(),
            source,
        })
}

/// Money rendering: `100` for whole values, `99.5` otherwise, `n/a` when absent.
pub(crate) fn amount(value: &Value) -> String {
    match value {
        Value::Null => "n/a".to_string(),
        other => text(other),
    }
}
