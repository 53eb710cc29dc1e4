use std::fmt;

use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::HeaderValue;
use reqwest::Url;

/// Host cookie jar.
///
/// Only cookies set by servers are stored, with their expiry and path rules.
/// Cookies authored on a request are layered over the stored ones for that
/// request alone and never enter the jar.
#[derive(Default)]
pub struct CookieJar {
    server: Jar,
}

impl fmt::Debug for CookieJar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CookieJar").finish_non_exhaustive()
    }
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a `Set-Cookie` value as if `url` had sent it.
    pub fn add_server_cookie(&self, url: &Url, set_cookie: &str) {
        self.server.add_cookie_str(set_cookie, url);
    }

    /// Value of a stored cookie that would be sent to `url`.
    pub fn get(&self, url: &Url, name: &str) -> Option<String> {
        self.stored_pairs(url)
            .into_iter()
            .find(|(stored, _)| stored == name)
            .map(|(_, value)| value)
    }

    /// The `cookie` header for one request: the stored cookies for `url`,
    /// overridden and extended by the well-formed authored pairs.
    pub fn request_header(&self, url: &Url, authored: &[&str]) -> Option<String> {
        let mut pairs = self.stored_pairs(url);

        for (name, value) in authored.iter().flat_map(|header| parse_cookie_header(header)) {
            match pairs.iter_mut().find(|(stored, _)| *stored == name) {
                Some(pair) => pair.1 = value,
                None => pairs.push((name, value)),
            }
        }

        if pairs.is_empty() {
            return None;
        }

        Some(
            pairs
                .iter()
                .map(|(name, value)| format!("{}={}", name, value))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    fn stored_pairs(&self, url: &Url) -> Vec<(String, String)> {
        self.server
            .cookies(url)
            .and_then(|header| header.to_str().ok().map(parse_cookie_header))
            .unwrap_or_default()
    }
}

impl CookieStore for CookieJar {
    fn set_cookies(&self, cookie_headers: &mut dyn Iterator<Item = &HeaderValue>, url: &Url) {
        self.server.set_cookies(cookie_headers, url);
    }

    fn cookies(&self, url: &Url) -> Option<HeaderValue> {
        self.server.cookies(url)
    }
}

/// Split a `cookie` header value into `name=value` pairs, skipping malformed
/// pairs.
pub fn parse_cookie_header(header_value: &str) -> Vec<(String, String)> {
    header_value
        .split(';')
        .filter(|pair| !pair.trim().is_empty())
        .filter_map(parse_cookie_pair)
        .collect()
}

fn parse_cookie_pair(pair: &str) -> Option<(String, String)> {
    let Some((name, value)) = pair.trim().split_once('=') else {
        tracing::warn!("Skipping cookie without a name: {:?}", pair);
        return None;
    };

    let name = name.trim();
    if name.is_empty() {
        tracing::warn!("Skipping cookie without a name: {:?}", pair);
        return None;
    }

    if name
        .chars()
        .any(|c| c.is_whitespace() || c == ';' || c == ',' || c == '=')
    {
        tracing::warn!("Skipping cookie with an invalid name: {:?}", name);
        return None;
    }

    Some((name.to_string(), value.trim().to_string()))
}
