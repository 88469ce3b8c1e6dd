//! Event envelope: the unit published to and consumed from the broker.
//!
//! Wire format is a UTF-8 JSON object:
//! `{ "eventType": string, "data": object, "eventId": string, "timestamp": string }`

use std::sync::Mutex;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Length of the random suffix appended to event ids.
const EVENT_ID_SUFFIX_LEN: usize = 9;

const BASE36: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Published event.
///
/// Immutable once built; consumers only ever see a deserialized copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub event_type: String,
    pub data: Value,
    pub event_id: String,
    pub timestamp: String,
}

impl Envelope {
    /// Serialize to the JSON wire body.
    pub fn to_vec(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Deserialize from a JSON wire body.
    pub fn from_slice(body: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(body)
    }

    /// Decode the payload into a typed view.
    pub fn decode_data<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        T::deserialize(&self.data)
    }
}

/// Builds envelopes for one producer instance.
///
/// Timestamps are strictly increasing per factory (at millisecond
/// resolution), so ids derived from them never repeat within a process.
#[derive(Debug, Default)]
pub struct EnvelopeFactory {
    last: Mutex<Option<DateTime<Utc>>>,
}

impl EnvelopeFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a new envelope stamped with the next timestamp.
    pub fn build(&self, event_type: impl Into<String>, data: Value) -> Envelope {
        let event_type = event_type.into();
        let at = self.next_timestamp();
        let event_id = format!(
            "{}-{}-{}",
            event_type,
            at.timestamp_millis(),
            random_suffix()
        );

        Envelope {
            event_type,
            data,
            event_id,
            timestamp: at.to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }

    fn next_timestamp(&self) -> DateTime<Utc> {
        let now = Utc::now();
        let mut last = match self.last.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let at = match *last {
            Some(prev) if now.timestamp_millis() <= prev.timestamp_millis() => {
                prev + Duration::milliseconds(1)
            }
            _ => now,
        };
        *last = Some(at);
        at
    }
}

fn random_suffix() -> String {
    let mut rng = rand::rng();
    (0..EVENT_ID_SUFFIX_LEN)
        .map(|_| BASE36[rng.random_range(0..BASE36.len())] as char)
        .collect()
}
