use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
pub struct NameValuePair {
    pub name: String,
    pub value: String,
}

impl NameValuePair {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A dispatchable request.
///
/// `headers` are wire-ready. `unresolved_headers` are the headers as the user
/// wrote them and may still hold virtual references.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRequest {
    #[serde(default)]
    pub id: String,
    // empty for ad-hoc and history entries
    #[serde(default)]
    pub name: String,
    #[serde(rename = "isOAuth", default, skip_serializing_if = "Option::is_none")]
    pub is_oauth: Option<bool>,
    // epoch milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    // milliseconds, overrides the default budget
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: Vec<NameValuePair>,
    #[serde(default)]
    pub unresolved_headers: Vec<NameValuePair>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpResponse {
    /// 0 means no response was received: network failure, abort or timeout.
    pub status_code: u16,
    #[serde(default)]
    pub headers: Vec<NameValuePair>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl HttpResponse {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|header| header.name.eq_ignore_ascii_case(name))
            .map(|header| header.value.as_str())
    }
}

/// The terminal record of one execution attempt.
///
/// `response.status_code == 0` if and only if the exchange was aborted, timed
/// out or failed in transport. `aborted` and `timedout` are never both set.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Exchange {
    pub timedout: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    pub aborted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
    pub request: HttpRequest,
    pub response: HttpResponse,
}

impl Exchange {
    pub fn has_response(&self) -> bool {
        self.response.status_code != 0
    }

    pub fn elapsed_ms(&self) -> Option<i64> {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}
