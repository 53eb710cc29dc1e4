use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::time::{sleep, Duration};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crest::config::{Config, Exchange, History};
use crest::notify::Notifier;

pub const TOKEN: &str = "abc123";

static TRACING_INITIALIZED: Once = Once::new();

// Help function to add tracing to tests
// Note: This is safe to use for multiple tests, but since tests are run concurrently the
// output may be interleaved
#[allow(dead_code)]
pub fn enable_tracing() {
    TRACING_INITIALIZED.call_once(|| {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "crest=trace".into()),
            )
            .with(tracing_subscriber::fmt::layer())
            .init();
    });
}

pub fn config() -> Config {
    Config {
        database_url: "sqlite::memory:".to_string(),
        listen: "127.0.0.1:0".to_string(),
        exchange: Exchange {
            default_timeout_ms: 5_000,
            oauth_timeout_ms: 5_000,
            grace_period_ms: 100,
            cookie_jar: false,
        },
        history: History { limit: 50 },
    }
}

pub type Notes = Arc<Mutex<Vec<(String, String)>>>;

/// A notifier that remembers every notification.
pub fn notes() -> (Arc<dyn Notifier>, Notes) {
    let notes: Notes = Arc::default();
    let sink = Arc::clone(&notes);
    let notifier: Arc<dyn Notifier> = Arc::new(move |title: &str, content: &str| {
        sink.lock().push((title.to_string(), content.to_string()));
    });
    (notifier, notes)
}

#[derive(Clone, Default)]
pub struct Hits {
    protected: Arc<AtomicUsize>,
}

impl Hits {
    pub fn protected(&self) -> usize {
        self.protected.load(Ordering::SeqCst)
    }
}

pub struct Origin {
    pub port: u16,
    pub hits: Hits,
}

impl Origin {
    pub fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{}", self.port, path)
    }
}

async fn json_handler() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "application/json; charset=utf-8")],
        r#"{"ok":true}"#,
    )
}

async fn slow_handler() -> impl IntoResponse {
    sleep(Duration::from_millis(2_000)).await;
    "We shouldn't see this"
}

async fn token_handler() -> impl IntoResponse {
    Json(json!({"access_token": TOKEN, "token_type": "bearer", "expires_in": 300}))
}

async fn slow_token_handler() -> impl IntoResponse {
    sleep(Duration::from_millis(2_000)).await;
    Json(json!({"access_token": TOKEN}))
}

async fn tokenless_handler() -> impl IntoResponse {
    Json(json!({"error": "invalid_client"}))
}

async fn denied_handler() -> impl IntoResponse {
    (StatusCode::UNAUTHORIZED, "bad client credentials")
}

async fn protected_handler(State(hits): State<Hits>, headers: HeaderMap) -> impl IntoResponse {
    hits.protected.fetch_add(1, Ordering::SeqCst);

    let expected = format!("Bearer {}", TOKEN);
    match headers.get(header::AUTHORIZATION) {
        Some(value) if value.as_bytes() == expected.as_bytes() => (StatusCode::OK, "secret"),
        _ => (StatusCode::UNAUTHORIZED, "no token"),
    }
}

async fn cookie_handler(headers: HeaderMap) -> impl IntoResponse {
    headers
        .get(header::COOKIE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

async fn login_handler() -> impl IntoResponse {
    ([(header::SET_COOKIE, "server=1; Path=/")], "welcome")
}

async fn status_handler(Path(code): Path<u16>) -> impl IntoResponse {
    (
        StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        "status",
    )
}

/// An origin server on an ephemeral port.
pub async fn origin() -> Origin {
    let listener = TcpListener::bind("0.0.0.0:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let hits = Hits::default();

    let app = Router::new()
        .route("/json", get(json_handler))
        .route("/slow", get(slow_handler))
        .route("/token", post(token_handler))
        .route("/token/slow", post(slow_token_handler))
        .route("/token/none", post(tokenless_handler))
        .route("/token/denied", post(denied_handler))
        .route("/protected", get(protected_handler))
        .route("/cookies", get(cookie_handler))
        .route("/login", get(login_handler))
        .route("/status/:code", get(status_handler))
        .with_state(hits.clone());

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Origin { port, hits }
}

/// A url nothing listens on.
pub async fn closed_url(scheme: &str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    format!("{}://127.0.0.1:{}/", scheme, port)
}
