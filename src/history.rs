use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use shared_types::{HttpRequest, NameValuePair};

use crate::draft::RequestDraft;
use crate::error::ValidationError;
use crate::exchange::now_ms;
use crate::headers::{is_oauth_reference, same_headers};
use crate::storage::{ChangeSubscription, Items, StorageContext, StorageKey};

const MIN_SUGGEST_LEN: usize = 3;
const MAX_SUGGESTIONS: usize = 100;
const PERSISTENCE_URL: &str = "crest://persistence";

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub service_timeout: u64,
    pub history_limit: usize,
    // settings owned by other consumers are kept as they are
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Settings {
    pub fn new(service_timeout: u64, history_limit: usize) -> Self {
        Self {
            service_timeout,
            history_limit,
            extra: Map::new(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::new(30_000, 50)
    }
}

#[derive(Clone, Copy)]
enum Collection {
    SavedRequests,
    OAuths,
}

impl Collection {
    fn key(&self) -> StorageKey {
        match self {
            Collection::SavedRequests => StorageKey::SavedRequests,
            Collection::OAuths => StorageKey::OAuths,
        }
    }

    fn noun(&self) -> &'static str {
        match self {
            Collection::SavedRequests => "A request",
            Collection::OAuths => "An oauth",
        }
    }
}

/// Request history, saved requests, OAuth definitions, autocomplete corpora
/// and settings on top of one storage context.
#[derive(Clone, Debug)]
pub struct HistoryStore {
    ctx: StorageContext,
    defaults: Settings,
}

impl HistoryStore {
    pub fn new(ctx: StorageContext, defaults: Settings) -> Self {
        Self { ctx, defaults }
    }

    pub fn context(&self) -> &StorageContext {
        &self.ctx
    }

    /// Changes to any collection, made here or in another context.
    pub fn subscribe(&self) -> ChangeSubscription {
        self.ctx.subscribe()
    }

    /// Stored settings, written with defaults on first use. Fields missing
    /// from the stored value fall back to the defaults.
    pub fn settings(&self) -> Settings {
        let defaults = self.defaults.clone();
        self.ctx.write(|items| {
            let Some(raw) = items.get(StorageKey::Settings.as_str()).map(str::to_string) else {
                tracing::debug!("storing default settings");
                store(items, StorageKey::Settings, &defaults);
                return defaults;
            };

            match merge_settings(&defaults, &raw) {
                Ok(settings) => settings,
                Err(err) => {
                    tracing::warn!("Ignoring unreadable {}: {}", StorageKey::Settings, err);
                    defaults
                }
            }
        })
    }

    pub fn set_service_timeout(&self, timeout_ms: u64) {
        let mut settings = self.settings();
        settings.service_timeout = timeout_ms;
        self.ctx.write(|items| store(items, StorageKey::Settings, &settings));
    }

    /// Lowering the limit trims the request history right away.
    pub fn set_history_limit(&self, limit: usize) {
        let mut settings = self.settings();
        settings.history_limit = limit;
        self.ctx.write(|items| {
            store(items, StorageKey::Settings, &settings);

            let mut history: Vec<HttpRequest> = read_list(items, StorageKey::RequestHistory);
            if history.len() > limit {
                history.truncate(limit);
                store(items, StorageKey::RequestHistory, &history);
            }
        });
    }

    pub fn list_request_history(&self) -> Vec<HttpRequest> {
        self.read(StorageKey::RequestHistory)
    }

    /// Record a request at the front of the history, replacing an earlier
    /// entry with the same method, url, body and authored headers.
    pub fn update_request_history(&self, request: &HttpRequest) {
        let limit = self.settings().history_limit;

        self.ctx.write(|items| {
            let mut history: Vec<HttpRequest> = read_list(items, StorageKey::RequestHistory);
            let before = history.len();
            history.retain(|entry| !same_request(entry, request));
            if history.len() != before {
                tracing::trace!("replacing history entry for {} {}", request.method, request.url);
            }

            history.insert(0, request.clone());
            history.truncate(limit);
            store(items, StorageKey::RequestHistory, &history);
        });
    }

    pub fn remove_history_entry(&self, id: &str) -> Option<HttpRequest> {
        self.remove_by_id(StorageKey::RequestHistory, id)
    }

    pub fn clear_request_history(&self) {
        self.ctx.remove_item(StorageKey::RequestHistory.as_str());
    }

    pub fn list_saved_requests(&self) -> Vec<HttpRequest> {
        self.read(StorageKey::SavedRequests)
    }

    pub fn get_saved_request(&self, name: &str) -> Option<HttpRequest> {
        self.list_saved_requests()
            .into_iter()
            .find(|request| request.name == name)
    }

    pub fn save_request(&self, draft: &RequestDraft) -> Result<HttpRequest, ValidationError> {
        self.save(Collection::SavedRequests, draft)
    }

    pub fn delete_saved_request(&self, id: &str) -> Option<HttpRequest> {
        self.remove_by_id(StorageKey::SavedRequests, id)
    }

    pub fn list_oauths(&self) -> Vec<HttpRequest> {
        self.read(StorageKey::OAuths)
    }

    pub fn get_oauth(&self, name: &str) -> Option<HttpRequest> {
        self.list_oauths()
            .into_iter()
            .find(|oauth| oauth.name == name)
    }

    /// Renaming an OAuth definition also rewrites the saved requests that
    /// reference it.
    pub fn save_oauth(&self, draft: &RequestDraft) -> Result<HttpRequest, ValidationError> {
        self.save(Collection::OAuths, draft)
    }

    pub fn delete_oauth(&self, id: &str) -> Option<HttpRequest> {
        self.remove_by_id(StorageKey::OAuths, id)
    }

    pub fn list_urls(&self) -> Vec<String> {
        self.read(StorageKey::UrlHistory)
    }

    pub fn store_url(&self, url: &str) {
        self.store_urls(&[url.to_string()]);
    }

    pub fn store_urls(&self, urls: &[String]) {
        self.merge(StorageKey::UrlHistory, urls);
    }

    pub fn list_headers(&self) -> Vec<String> {
        self.read(StorageKey::HeaderHistory)
    }

    pub fn store_headers(&self, lines: &[String]) {
        self.merge(StorageKey::HeaderHistory, lines);
    }

    /// URLs containing every whitespace separated token of `input`.
    pub fn suggest_urls(&self, input: &str) -> Vec<String> {
        let input = input.trim();
        if input.len() < MIN_SUGGEST_LEN {
            return Vec::new();
        }
        let tokens: Vec<&str> = input.split_whitespace().collect();

        let mut candidates = self.list_urls();
        candidates.push(PERSISTENCE_URL.to_string());
        candidates.extend(
            StorageKey::ALL
                .iter()
                .map(|key| format!("{}/{}", PERSISTENCE_URL, key)),
        );
        candidates.sort();
        candidates.dedup();

        candidates
            .into_iter()
            .filter(|url| url != input && tokens.iter().all(|token| url.contains(token)))
            .take(MAX_SUGGESTIONS)
            .collect()
    }

    fn read<T: DeserializeOwned>(&self, key: StorageKey) -> Vec<T> {
        parse_list(key, self.ctx.get_item(key.as_str()).as_deref())
    }

    fn remove_by_id(&self, key: StorageKey, id: &str) -> Option<HttpRequest> {
        self.ctx.write(|items| {
            let mut list: Vec<HttpRequest> = read_list(items, key);
            let index = list.iter().position(|request| request.id == id)?;
            let removed = list.remove(index);
            store(items, key, &list);
            Some(removed)
        })
    }

    fn merge(&self, key: StorageKey, values: &[String]) {
        self.ctx.write(|items| {
            let mut existing: Vec<String> = read_list(items, key);
            let before = existing.len();
            for value in values {
                if !existing.contains(value) {
                    existing.push(value.clone());
                }
            }

            if existing.len() == before {
                tracing::trace!("not storing history for key {}", key);
                return;
            }

            existing.sort();
            store(items, key, &existing);
        });
    }

    fn save(
        &self,
        collection: Collection,
        draft: &RequestDraft,
    ) -> Result<HttpRequest, ValidationError> {
        let mut problems = Vec::new();
        let name = draft.name.trim();
        if name.is_empty() {
            problems.push("Name is required".to_string());
        }
        let headers = match draft.validate() {
            Ok(headers) => headers,
            Err(err) => {
                problems.extend(err.problems);
                Vec::new()
            }
        };

        let key = collection.key();
        self.ctx.write(|items| {
            let mut list: Vec<HttpRequest> = read_list(items, key);
            let editing = draft
                .id
                .as_deref()
                .and_then(|id| list.iter().position(|request| request.id == id));

            let duplicate = list.iter().enumerate().any(|(index, request)| {
                request.name == name && Some(index) != editing
            });
            if !name.is_empty() && duplicate {
                problems.push(format!(
                    "{} named '{}' already exists, please pick another name.",
                    collection.noun(),
                    name
                ));
            }

            if !problems.is_empty() {
                return Err(ValidationError::new(problems));
            }

            let previous = editing.map(|index| list[index].clone());
            let request = HttpRequest {
                id: draft
                    .id
                    .clone()
                    .filter(|id| !id.is_empty())
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                name: name.to_string(),
                is_oauth: matches!(collection, Collection::OAuths).then_some(true),
                timestamp: previous
                    .as_ref()
                    .and_then(|previous| previous.timestamp)
                    .or_else(|| Some(now_ms())),
                timeout: draft.timeout,
                method: draft.method.to_ascii_uppercase(),
                url: draft.url.clone(),
                headers,
                unresolved_headers: Vec::new(),
                body: (!draft.body.is_empty()).then(|| draft.body.clone()),
            };

            match editing {
                Some(index) => list[index] = request.clone(),
                None => list.push(request.clone()),
            }
            sort_by_name(&mut list);
            store(items, key, &list);

            if let (Collection::OAuths, Some(previous)) = (collection, previous) {
                if previous.name != request.name {
                    rename_oauth_references(items, &previous.name, &request.name);
                }
            }

            tracing::debug!("saved {} '{}'", key, request.name);
            Ok(request)
        })
    }
}

fn rename_oauth_references(items: &mut Items<'_>, from: &str, to: &str) {
    let mut saved: Vec<HttpRequest> = read_list(items, StorageKey::SavedRequests);

    let mut renamed = 0;
    for request in &mut saved {
        for header in request
            .headers
            .iter_mut()
            .chain(request.unresolved_headers.iter_mut())
        {
            if is_oauth_reference(&header.name) && header.value == from {
                header.value = to.to_string();
                renamed += 1;
            }
        }
    }

    if renamed > 0 {
        tracing::debug!("renamed {} oauth references from '{}' to '{}'", renamed, from, to);
        store(items, StorageKey::SavedRequests, &saved);
    }
}

fn authored_headers(request: &HttpRequest) -> &[NameValuePair] {
    if request.unresolved_headers.is_empty() {
        &request.headers
    } else {
        &request.unresolved_headers
    }
}

fn same_request(left: &HttpRequest, right: &HttpRequest) -> bool {
    left.method == right.method
        && left.url == right.url
        && left.body == right.body
        && same_headers(authored_headers(left), authored_headers(right))
}

fn sort_by_name(list: &mut [HttpRequest]) {
    list.sort_by_key(|request| request.name.to_lowercase());
}

fn parse_list<T: DeserializeOwned>(key: StorageKey, raw: Option<&str>) -> Vec<T> {
    let Some(raw) = raw else {
        return Vec::new();
    };

    match serde_json::from_str(raw) {
        Ok(list) => list,
        Err(err) => {
            tracing::warn!("Ignoring unreadable {}: {}", key, err);
            Vec::new()
        }
    }
}

fn read_list<T: DeserializeOwned>(items: &Items<'_>, key: StorageKey) -> Vec<T> {
    parse_list(key, items.get(key.as_str()))
}

fn merge_settings(defaults: &Settings, raw: &str) -> serde_json::Result<Settings> {
    let stored: Map<String, Value> = serde_json::from_str(raw)?;
    let mut merged = match serde_json::to_value(defaults)? {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    merged.extend(stored);
    serde_json::from_value(Value::Object(merged))
}

fn store<T: Serialize + ?Sized>(items: &mut Items<'_>, key: StorageKey, value: &T) {
    match serde_json::to_string(value) {
        Ok(json) => items.set(key.as_str(), json),
        Err(err) => tracing::error!("Failed to serialize {}: {}", key, err),
    }
}
