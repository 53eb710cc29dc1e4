//! Importer for the flat key/value export written by older releases.
//!
//! The export looks like `{"localStorage": [{"key": "...", "value": "<json>"}]}`.
//! Nothing outside this module knows about the old key names or shapes.

use serde::Deserialize;
use serde_json::{Map, Value};
use shared_types::HttpRequest;

use crate::exchange::now_ms;
use crate::headers::parse_header_line;
use crate::storage::StorageKey;

const EXPORT_MARKER: &str = "localStorage";

#[derive(Debug, Deserialize)]
struct LegacyItem {
    key: String,
    #[serde(default)]
    value: Value,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LegacyBundle {
    name: String,
    method: Option<String>,
    url: Option<String>,
    headers: Vec<String>,
    body: Option<String>,
}

pub fn is_legacy_export(body: &Value) -> bool {
    body.get(EXPORT_MARKER).is_some_and(Value::is_array)
}

/// Convert a legacy export into current keys and shapes. Items that cannot
/// be converted are carried over as they are.
pub fn import(body: &Value) -> Map<String, Value> {
    let mut imported = Map::new();

    let Some(items) = body.get(EXPORT_MARKER).and_then(Value::as_array) else {
        return imported;
    };

    for item in items {
        let item: LegacyItem = match serde_json::from_value(item.clone()) {
            Ok(item) => item,
            Err(err) => {
                tracing::warn!("Skipping legacy item: {}", err);
                continue;
            }
        };

        let value = decode(item.value);
        let (key, value) = match item.key.as_str() {
            "uriHistory" => (StorageKey::UrlHistory.as_str().to_string(), value),
            "bundles" => (
                StorageKey::SavedRequests.as_str().to_string(),
                import_requests(value),
            ),
            "simpleOAuth" => (StorageKey::OAuths.as_str().to_string(), import_requests(value)),
            "settings" => (StorageKey::LegacySettings.as_str().to_string(), value),
            "savedRequests" => (
                StorageKey::LegacySavedRequests.as_str().to_string(),
                value,
            ),
            _ => (item.key, value),
        };

        tracing::trace!("imported legacy item as {}", key);
        imported.insert(key, value);
    }

    imported
}

// values were stored as JSON text
fn decode(value: Value) -> Value {
    match value {
        Value::String(text) => serde_json::from_str(&text).unwrap_or(Value::String(text)),
        other => other,
    }
}

fn import_requests(value: Value) -> Value {
    let bundles: Vec<LegacyBundle> = match serde_json::from_value(value.clone()) {
        Ok(bundles) => bundles,
        Err(err) => {
            tracing::warn!("Keeping unrecognized legacy requests as they are: {}", err);
            return value;
        }
    };

    let timestamp = now_ms();
    let requests: Vec<Value> = bundles
        .into_iter()
        .filter_map(|bundle| {
            let request = HttpRequest {
                id: uuid::Uuid::new_v4().to_string(),
                name: bundle.name,
                is_oauth: None,
                timestamp: Some(timestamp),
                timeout: None,
                method: bundle.method.filter(|m| !m.is_empty()).unwrap_or_else(|| "GET".to_string()),
                url: bundle.url.unwrap_or_default(),
                headers: bundle.headers.iter().map(|line| parse_header_line(line)).collect(),
                unresolved_headers: Vec::new(),
                body: bundle.body,
            };
            serde_json::to_value(request).ok()
        })
        .collect();

    Value::Array(requests)
}
