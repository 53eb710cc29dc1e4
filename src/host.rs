use std::result::Result as StdResult;

use axum::extract::{Extension, Json, Path};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{
    routing::{delete, get, post},
    Router,
};
use shared_types::{Exchange, HttpRequest};
use tower_http::trace::TraceLayer;

use crate::error::AppError;
use crate::exchange::{Client, ExchangeHandler};
use crate::headers::is_oauth_reference;
use crate::history::HistoryStore;
use crate::registry::{CancelScope, InFlightRegistry};
use crate::virtual_protocol;

/// Executes exchanges for other contexts and accepts aborts by correlation
/// id.
pub fn router(client: Client, registry: InFlightRegistry, history: HistoryStore) -> Router {
    Router::new()
        .route("/exchanges", post(execute))
        .route("/exchanges", get(list_in_flight))
        .route("/exchanges/:id", delete(abort))
        .layer(TraceLayer::new_for_http())
        .layer(Extension(client))
        .layer(Extension(registry))
        .layer(Extension(history))
}

#[tracing::instrument(level = "trace", "execute", skip_all)]
async fn execute(
    Extension(client): Extension<Client>,
    Extension(registry): Extension<InFlightRegistry>,
    Extension(history): Extension<HistoryStore>,
    Json(mut request): Json<HttpRequest>,
) -> StdResult<Json<Exchange>, AppError> {
    if let Some(header) = request
        .headers
        .iter()
        .find(|header| is_oauth_reference(&header.name))
    {
        return Err(AppError::BadRequest(format!(
            "Header '{}' must be resolved before the request is sent.",
            header.name
        )));
    }

    if request.id.is_empty() {
        request.id = uuid::Uuid::new_v4().to_string();
    }
    tracing::debug!("request = {} {} {}", request.id, request.method, request.url);

    if virtual_protocol::is_virtual(&request.url) {
        return Ok(Json(virtual_protocol::handle(&request, history.context())));
    }

    let entry = Registered::open(&registry, &request.id);
    let handler = ExchangeHandler::new(&client, request, history.settings().service_timeout);
    entry.scope.attach(handler.abort_handle());

    // the call settles even if the caller goes away, and stays abortable by id
    let exchange = tokio::spawn(async move {
        let exchange = handler.submit().await;
        drop(entry);
        exchange
    })
    .await?;

    tracing::debug!("response = {}", exchange.response.status_code);
    Ok(Json(exchange))
}

#[tracing::instrument(level = "trace", "list_in_flight", skip_all)]
async fn list_in_flight(Extension(registry): Extension<InFlightRegistry>) -> Json<Vec<String>> {
    Json(registry.ids())
}

#[tracing::instrument(level = "trace", "abort", skip_all)]
async fn abort(
    Extension(registry): Extension<InFlightRegistry>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    tracing::debug!("abort id = {}", id);
    if registry.abort(&id) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

// closes the registry entry once the call settles
struct Registered {
    registry: InFlightRegistry,
    id: String,
    scope: CancelScope,
}

impl Registered {
    fn open(registry: &InFlightRegistry, id: &str) -> Self {
        Self {
            registry: registry.clone(),
            id: id.to_string(),
            scope: registry.open(id),
        }
    }
}

impl Drop for Registered {
    fn drop(&mut self) {
        self.registry.close(&self.id);
    }
}
