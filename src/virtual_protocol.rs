//! `crest://persistence[/<key>]` served from storage instead of the network.

use serde_json::{json, Map, Value};
use shared_types::{Exchange, HttpRequest, HttpResponse, NameValuePair};
use url::Url;

use crate::exchange::now_ms;
use crate::legacy;
use crate::storage::{StorageContext, StorageKey};

pub const SCHEME: &str = "crest://";
const PERSISTENCE: &str = "persistence";
const SUPPORTED_METHODS: &str = "GET, PUT, DELETE";

pub fn is_virtual(url: &str) -> bool {
    url.starts_with(SCHEME)
}

/// Serve one virtual request. Every outcome, errors included, is an
/// [`Exchange`] shaped like a network response.
pub fn handle(request: &HttpRequest, ctx: &StorageContext) -> Exchange {
    let start_time = now_ms();
    tracing::debug!("virtual {} {}", request.method, request.url);

    let response = match route(request, ctx) {
        Ok(body) => response(200, "application/json", body),
        Err((status, message)) => {
            tracing::debug!("virtual request failed with {}: {}", status, message);
            response(status, "text/plain", message)
        }
    };

    Exchange {
        timedout: false,
        timeout: None,
        aborted: false,
        start_time: Some(start_time),
        end_time: Some(now_ms()),
        request: request.clone(),
        response,
    }
}

type Routed = Result<String, (u16, String)>;

fn route(request: &HttpRequest, ctx: &StorageContext) -> Routed {
    let url = Url::parse(&request.url)
        .map_err(|err| (500, format!("Error handling crest resource: {}", err)))?;

    if url.host_str() != Some(PERSISTENCE) {
        return Err((
            400,
            format!("Not sure how to handle this request. URL: {}", request.url),
        ));
    }

    let key = match url.path().trim_matches('/') {
        "" => None,
        key => match key.parse::<StorageKey>() {
            Ok(key) => Some(key),
            Err(_) => return Err((400, format!("'{}' is not a supported key.", key))),
        },
    };

    match request.method.to_ascii_uppercase().as_str() {
        "GET" => Ok(get(ctx, key).to_string()),
        "PUT" => put(request, ctx, key),
        "DELETE" => Ok(delete(ctx, key).to_string()),
        _ => Err((
            405,
            format!("Only {} methods are supported.", SUPPORTED_METHODS),
        )),
    }
}

fn get(ctx: &StorageContext, key: Option<StorageKey>) -> Value {
    match key {
        Some(key) => read(ctx.get_item(key.as_str())),
        None => Value::Object(
            StorageKey::ALL
                .iter()
                .map(|key| (key.as_str().to_string(), read(ctx.get_item(key.as_str()))))
                .collect(),
        ),
    }
}

fn delete(ctx: &StorageContext, key: Option<StorageKey>) -> Value {
    ctx.write(|items| match key {
        Some(key) => {
            let deleted = read(items.remove(key.as_str()));
            json!({ "deleted": { key.as_str(): deleted } })
        }
        None => {
            let deleted: Map<String, Value> = StorageKey::ALL
                .iter()
                .map(|key| (key.as_str().to_string(), read(items.remove(key.as_str()))))
                .collect();
            json!({ "deleted": deleted })
        }
    })
}

fn put(request: &HttpRequest, ctx: &StorageContext, key: Option<StorageKey>) -> Routed {
    let body = request.body.as_deref().unwrap_or_default();
    if body.trim().is_empty() {
        return Err((
            400,
            format!("{}ing something to storage requires a body.", request.method),
        ));
    }

    let json: Value = serde_json::from_str(body)
        .map_err(|err| (400, format!("Error parsing body to JSON: {}", err)))?;

    if let Some(key) = key {
        ctx.set_item(key.as_str(), json.to_string());
        return Ok(json!({ "putItems": { key.as_str(): json } }).to_string());
    }

    let values = if legacy::is_legacy_export(&json) {
        tracing::debug!("importing legacy export");
        legacy::import(&json)
    } else {
        match json {
            Value::Object(values) => values,
            _ => {
                return Err((
                    400,
                    format!(
                        "{}ing something to storage without a key requires a JSON object.",
                        request.method
                    ),
                ))
            }
        }
    };

    let mut put_items = Map::new();
    let mut not_put_items = Map::new();
    ctx.write(|items| {
        for (name, value) in values {
            match name.parse::<StorageKey>() {
                Ok(key) => {
                    items.set(key.as_str(), value.to_string());
                    put_items.insert(name, value);
                }
                Err(reason) => {
                    not_put_items.insert(name, Value::String(reason));
                }
            }
        }
    });

    let mut result = Map::new();
    result.insert("putItems".to_string(), Value::Object(put_items));
    if !not_put_items.is_empty() {
        result.insert("notPutItems".to_string(), Value::Object(not_put_items));
    }
    Ok(Value::Object(result).to_string())
}

fn read(raw: Option<String>) -> Value {
    match raw {
        Some(raw) => serde_json::from_str(&raw).unwrap_or(Value::String(raw)),
        None => Value::Null,
    }
}

fn response(status_code: u16, content_type: &str, body: String) -> HttpResponse {
    HttpResponse {
        status_code,
        headers: vec![NameValuePair::new("content-type", content_type)],
        body: Some(body),
    }
}
