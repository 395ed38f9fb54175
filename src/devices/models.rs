//! Device data models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::store::Document;

/// How a feeding was triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedAction {
    Manual,
    Auto,
}

/// Feed level together with the device's alert threshold.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeedReading {
    pub level: f64,
    pub threshold: f64,
}

impl FeedReading {
    pub fn is_low(&self) -> bool {
        self.level < self.threshold
    }

    pub fn is_empty(&self) -> bool {
        self.level == 0.0
    }
}

/// A feeder as stored under `devices/{id}`.
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    pub id: String,
    pub feed_level: Option<Value>,
    pub food_level_threshold: Option<Value>,
    pub schedule: Option<Value>,
}

impl Device {
    pub fn from_document(document: &Document) -> Self {
        Self {
            id: document.id.clone(),
            feed_level: document.get("feedLevel").cloned(),
            food_level_threshold: document.get("foodLevelThreshold").cloned(),
            schedule: document.get("schedule").cloned(),
        }
    }

    /// `None` unless both fields are present and numeric.
    pub fn reading(&self) -> Option<FeedReading> {
        let level = self.feed_level.as_ref()?.as_f64()?;
        let threshold = self.food_level_threshold.as_ref()?.as_f64()?;
        Some(FeedReading { level, threshold })
    }
}

/// A feeding event under `devices/{id}/histories`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feed_level: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feed_action: Option<FeedAction>,
    pub triggered_at: DateTime<Utc>,
    /// Any other field written by the reporter.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl HistoryEntry {
    pub fn from_document(document: &Document) -> Self {
        let mut extra = document.data.clone();
        let feed_level = extra.remove("feedLevel");
        let feed_action = match extra.remove("feedAction") {
            Some(raw) => match serde_json::from_value::<FeedAction>(raw.clone()) {
                Ok(action) => Some(action),
                Err(_) => {
                    extra.insert("feedAction".to_string(), raw);
                    None
                }
            },
            None => None,
        };
        extra.remove("triggeredAt");
        extra.remove("id");
        Self {
            id: document.id.clone(),
            feed_level,
            feed_action,
            triggered_at: document.create_time,
            extra,
        }
    }
}

/// Wire payload of a `newHistory` message: the entry's fields with its id merged in.
///
/// Stored `id` and `triggeredAt` fields win over the derived ones.
pub fn history_payload(document: &Document) -> Value {
    let mut payload = match serde_json::to_value(HistoryEntry::from_document(document)) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    };
    for key in ["id", "triggeredAt"] {
        if let Some(stored) = document.data.get(key) {
            payload.insert(key.to_string(), stored.clone());
        }
    }
    Value::Object(payload)
}

/// A notification written under `devices/{id}/notifications`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub title: String,
    #[serde(rename = "message")]
    pub body: String,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(skip)]
    pub created_at: Option<DateTime<Utc>>,
}

impl NotificationRecord {
    pub fn new(title: impl Into<String>, body: impl Into<String>, action: Option<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            action,
            created_at: None,
        }
    }

    /// Store fields; the creation time is stamped by the store.
    pub fn to_fields(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }

    pub fn from_document(document: &Document) -> Option<Self> {
        let mut record: Self = serde_json::from_value(Value::Object(document.data.clone())).ok()?;
        record.created_at = Some(document.create_time);
        Some(record)
    }
}
