use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Engine-internal notification published on the event bus. The realtime
/// runtime polls the store for authoritative state; events only wake pollers
/// early on significant transitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEvent {
    pub event_type: String,
    pub properties: Value,
    pub at: DateTime<Utc>,
}

impl EngineEvent {
    pub fn new(event_type: &str, properties: Value) -> Self {
        Self {
            event_type: event_type.to_string(),
            properties,
            at: Utc::now(),
        }
    }
}
