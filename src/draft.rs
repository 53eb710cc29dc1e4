use serde::{Deserialize, Serialize};
use shared_types::{HttpRequest, NameValuePair};

use crate::error::ValidationError;
use crate::headers::{parse_header_lines, to_header_line};

const ACCEPTED_SCHEMES: [&str; 3] = ["http://", "https://", "crest://"];
const BODY_METHODS: [&str; 3] = ["POST", "PUT", "PATCH"];

/// A request as it is being edited. Headers are the raw authored lines.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RequestDraft {
    pub id: Option<String>,
    pub name: String,
    pub method: String,
    pub url: String,
    pub headers: String,
    pub body: String,
    pub timeout: Option<u64>,
}

impl RequestDraft {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_headers(mut self, headers: impl Into<String>) -> Self {
        self.headers = headers.into();
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Re-open a stored request for editing, preferring the authored headers.
    pub fn from_request(request: &HttpRequest) -> Self {
        let headers = if request.unresolved_headers.is_empty() {
            &request.headers
        } else {
            &request.unresolved_headers
        };

        Self {
            id: (!request.id.is_empty()).then(|| request.id.clone()),
            name: request.name.clone(),
            method: request.method.clone(),
            url: request.url.clone(),
            headers: headers.iter().map(to_header_line).collect::<Vec<_>>().join("\n"),
            body: request.body.clone().unwrap_or_default(),
            timeout: request.timeout,
        }
    }

    /// Check the URL scheme and every header line, returning the parsed
    /// headers when there are no problems.
    pub fn validate(&self) -> Result<Vec<NameValuePair>, ValidationError> {
        let mut problems = Vec::new();

        if !ACCEPTED_SCHEMES
            .iter()
            .any(|scheme| self.url.starts_with(scheme))
        {
            problems.push("Enter a valid URL that starts with http://, https:// or crest://".to_string());
        }

        let (headers, header_problems) = parse_header_lines(&self.headers);
        problems.extend(header_problems);

        if problems.is_empty() {
            Ok(headers)
        } else {
            Err(ValidationError::new(problems))
        }
    }

    /// The body actually sent: only for methods that carry one, trimmed,
    /// and never empty.
    pub fn dispatch_body(&self) -> Option<String> {
        let method = self.method.to_ascii_uppercase();
        if !BODY_METHODS.contains(&method.as_str()) {
            return None;
        }

        let body = self.body.trim();
        (!body.is_empty()).then(|| body.to_string())
    }

    /// The dispatchable request for one send. Authored headers are kept as
    /// both the wire headers and the unresolved headers until resolution.
    pub fn to_request(&self, id: &str, timestamp: i64) -> Result<HttpRequest, ValidationError> {
        let headers = self.validate()?;

        Ok(HttpRequest {
            id: id.to_string(),
            name: String::new(),
            is_oauth: None,
            timestamp: Some(timestamp),
            timeout: self.timeout,
            method: self.method.to_ascii_uppercase(),
            url: self.url.clone(),
            headers: headers.clone(),
            unresolved_headers: headers,
            body: self.dispatch_body(),
        })
    }
}
