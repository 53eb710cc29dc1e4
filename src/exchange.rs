use std::sync::Arc;

use anyhow::{Context, Result};
use reqwest::Url;
use shared_types::{Exchange, HttpRequest, HttpResponse, NameValuePair};
use tokio::sync::watch;
use tokio::time::{sleep_until, Duration, Instant};

use crate::cookies::CookieJar;
use crate::headers::shape_response_headers;

/// Outbound HTTP client shared by every exchange.
#[derive(Clone, Debug)]
pub struct Client {
    http: reqwest::Client,
    cookie_jar: Option<Arc<CookieJar>>,
}

impl Client {
    /// A client backed by a host cookie jar. Request `cookie` headers are
    /// merged with the jar's cookies for that request only.
    pub fn with_cookie_jar() -> Result<Self> {
        let cookie_jar = Arc::new(CookieJar::new());
        let http = reqwest::Client::builder()
            .cookie_provider(Arc::clone(&cookie_jar))
            .build()
            .context("Failed to build http client")?;

        Ok(Self {
            http,
            cookie_jar: Some(cookie_jar),
        })
    }

    /// A client without a cookie jar. Request `cookie` headers are forwarded
    /// verbatim.
    pub fn without_cookie_jar() -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context("Failed to build http client")?;

        Ok(Self {
            http,
            cookie_jar: None,
        })
    }

    pub fn cookie_jar(&self) -> Option<&Arc<CookieJar>> {
        self.cookie_jar.as_ref()
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum CallState {
    InFlight,
    Completed,
    Aborted,
    TimedOut,
}

/// Cancels one exchange. Abort, timeout and completion are mutually
/// exclusive: whichever settles the call first wins.
#[derive(Clone, Debug)]
pub struct AbortHandle {
    state: Arc<watch::Sender<CallState>>,
}

impl AbortHandle {
    fn new() -> Self {
        let (state, _) = watch::channel(CallState::InFlight);
        Self {
            state: Arc::new(state),
        }
    }

    /// Returns false when the call had already settled.
    pub fn abort(&self) -> bool {
        let aborted = self.settle(CallState::Aborted);
        if aborted {
            tracing::debug!("exchange aborted");
        }
        aborted
    }

    pub fn is_settled(&self) -> bool {
        *self.state.borrow() != CallState::InFlight
    }

    fn settle(&self, to: CallState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == CallState::InFlight {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    fn current(&self) -> CallState {
        *self.state.borrow()
    }

    async fn cancelled(&self) {
        let mut state = self.state.subscribe();
        // the sender lives as long as self, so this only returns once cancelled
        let _ = state
            .wait_for(|state| matches!(state, CallState::Aborted | CallState::TimedOut))
            .await;
    }
}

/// Executes exactly one HTTP call and always produces an [`Exchange`].
pub struct ExchangeHandler {
    client: Client,
    request: HttpRequest,
    timeout_ms: u64,
    deadline: Option<Instant>,
    handle: AbortHandle,
}

impl ExchangeHandler {
    /// The request's own timeout overrides `default_timeout_ms`. A budget of
    /// zero disables the timer. The deadline starts counting now.
    pub fn new(client: &Client, request: HttpRequest, default_timeout_ms: u64) -> Self {
        let timeout_ms = request.timeout.unwrap_or(default_timeout_ms);
        let deadline = (timeout_ms > 0).then(|| Instant::now() + Duration::from_millis(timeout_ms));

        Self {
            client: client.clone(),
            request,
            timeout_ms,
            deadline,
            handle: AbortHandle::new(),
        }
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.handle.clone()
    }

    pub fn abort(&self) -> bool {
        self.handle.abort()
    }

    pub fn request(&self) -> &HttpRequest {
        &self.request
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    pub async fn submit(self) -> Exchange {
        let start_time = now_ms();
        let handle = self.handle.clone();

        let response = tokio::select! {
            result = send(&self.client, &self.request) => match result {
                Ok(response) => Some(response),
                Err(error) => {
                    tracing::warn!("Error sending {} {}: {:?}", self.request.method, self.request.url, error);
                    None
                }
            },
            _ = handle.cancelled() => None,
            _ = expire(self.deadline) => {
                if handle.settle(CallState::TimedOut) {
                    tracing::debug!("Timeout after {} ms for {}", self.timeout_ms, self.request.url);
                }
                None
            }
        };

        handle.settle(CallState::Completed);

        let state = handle.current();
        // a response that raced a cancellation is discarded
        let response = match state {
            CallState::Completed => response.unwrap_or_else(HttpResponse::none),
            _ => HttpResponse::none(),
        };

        tracing::debug!(
            "Exchange {} {} --> {}",
            self.request.method,
            self.request.url,
            response.status_code
        );

        Exchange {
            timedout: state == CallState::TimedOut,
            timeout: Some(self.timeout_ms),
            aborted: state == CallState::Aborted,
            start_time: Some(start_time),
            end_time: Some(now_ms()),
            request: self.request,
            response,
        }
    }
}

async fn send(client: &Client, request: &HttpRequest) -> Result<HttpResponse> {
    let method = reqwest::Method::from_bytes(request.method.as_bytes())
        .with_context(|| format!("Invalid method {}", request.method))?;
    let url = Url::parse(&request.url).with_context(|| format!("Invalid url {}", request.url))?;

    let mut builder = client.http.request(method, url.clone());
    let mut authored_cookies = Vec::new();
    for header in &request.headers {
        if client.cookie_jar.is_some() && header.name.eq_ignore_ascii_case("cookie") {
            authored_cookies.push(header.value.as_str());
            continue;
        }
        builder = builder.header(header.name.as_str(), header.value.as_str());
    }

    // an explicit cookie header stops the client from adding the jar's own
    if !authored_cookies.is_empty() {
        let cookie = client
            .cookie_jar
            .as_ref()
            .and_then(|jar| jar.request_header(&url, &authored_cookies));
        if let Some(cookie) = cookie {
            builder = builder.header(reqwest::header::COOKIE, cookie);
        }
    }
    if let Some(body) = &request.body {
        builder = builder.body(body.clone());
    }

    let response = builder.send().await?;

    let status_code = response.status().as_u16();
    let headers = response
        .headers()
        .iter()
        .map(|(name, value)| {
            NameValuePair::new(
                name.as_str(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();
    let body = response.text().await?;

    Ok(HttpResponse {
        status_code,
        headers: shape_response_headers(headers),
        body: Some(body),
    })
}

async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
