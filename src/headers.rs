use std::collections::HashMap;

use shared_types::NameValuePair;

/// Header names starting with this marker reference a stored OAuth definition
/// by name.
pub const OAUTH_HEADER_MARKER: &str = "crest-oauth";

const CONTENT_TYPE: &str = "content-type";
const ORIGINAL_SUFFIX: &str = "-original";

// Header names that carry one-time values. They are never offered back as
// autocomplete suggestions.
const NON_REUSABLE_FRAGMENTS: &[&str] = &[
    "authorization",
    "cookie",
    "token",
    "signature",
    "nonce",
    "request-id",
    "requestid",
    "correlation",
    "trace",
];

pub fn is_oauth_reference(name: &str) -> bool {
    name.trim().starts_with(OAUTH_HEADER_MARKER)
}

/// Split a `name: value` line on the first colon.
pub fn parse_header_line(line: &str) -> NameValuePair {
    match line.split_once(':') {
        Some((name, value)) => NameValuePair::new(name.trim(), value.trim()),
        None => NameValuePair::new(line.trim(), ""),
    }
}

/// Parse the non-blank lines of an authored header block, collecting one
/// problem per invalid line.
pub fn parse_header_lines(text: &str) -> (Vec<NameValuePair>, Vec<String>) {
    let mut headers = Vec::new();
    let mut problems = Vec::new();

    for line in text.lines().filter(|line| !line.trim().is_empty()) {
        let header = parse_header_line(line);
        if header.name.is_empty() || header.value.is_empty() {
            problems.push(format!("Invalid header '{}'", line.trim()));
        }
        headers.push(header);
    }

    (headers, problems)
}

pub fn to_header_line(header: &NameValuePair) -> String {
    format!("{}: {}", header.name, header.value)
}

pub fn is_reusable(header: &NameValuePair) -> bool {
    let name = header.name.to_ascii_lowercase();
    !NON_REUSABLE_FRAGMENTS
        .iter()
        .any(|fragment| name.contains(fragment))
}

/// Copy response headers, splitting a parameterized `content-type` into the
/// bare MIME type plus the full value under `content-type-original`.
pub fn shape_response_headers(headers: Vec<NameValuePair>) -> Vec<NameValuePair> {
    let mut shaped = Vec::with_capacity(headers.len() + 1);

    for header in headers {
        if header.name.eq_ignore_ascii_case(CONTENT_TYPE) {
            if let Some((mime, _)) = header.value.split_once(';') {
                shaped.push(NameValuePair::new(header.name.clone(), mime.trim()));
                shaped.push(NameValuePair::new(
                    format!("{}{}", header.name, ORIGINAL_SUFFIX),
                    header.value,
                ));
                continue;
            }
        }
        shaped.push(header);
    }

    shaped
}

/// Order-insensitive comparison of two header sets, duplicates included.
pub fn same_headers(left: &[NameValuePair], right: &[NameValuePair]) -> bool {
    if left.len() != right.len() {
        return false;
    }

    let mut counts: HashMap<(&str, &str), i32> = HashMap::new();
    for header in left {
        *counts.entry((&header.name, &header.value)).or_default() += 1;
    }
    for header in right {
        *counts.entry((&header.name, &header.value)).or_default() -= 1;
    }

    counts.values().all(|count| *count == 0)
}

/// Whether a response body looks like an OAuth token response.
pub fn is_token_response(body: Option<&str>) -> bool {
    access_token(body).is_some()
}

pub fn access_token(body: Option<&str>) -> Option<String> {
    let json: serde_json::Value = serde_json::from_str(body?).ok()?;
    match json.get("access_token")? {
        serde_json::Value::String(token) if !token.is_empty() => Some(token.clone()),
        serde_json::Value::Number(token) => Some(token.to_string()),
        _ => None,
    }
}
