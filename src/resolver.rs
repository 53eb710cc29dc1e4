use std::sync::Arc;

use parking_lot::Mutex;
use shared_types::{HttpRequest, NameValuePair};

use crate::error::ResolveError;
use crate::exchange::{AbortHandle, Client, ExchangeHandler};
use crate::headers::{access_token, is_oauth_reference};
use crate::history::HistoryStore;
use crate::notify::Notifier;
use crate::registry::CancelScope;

/// Expands virtual headers into wire-ready ones. An OAuth reference is
/// replaced, in place, by the bearer token fetched with the referenced
/// definition.
pub struct HeaderResolver {
    client: Client,
    history: HistoryStore,
    correlation_id: String,
    notifier: Arc<dyn Notifier>,
    timeout_ms: u64,
    in_flight: Mutex<Option<AbortHandle>>,
    scope: Option<CancelScope>,
}

impl HeaderResolver {
    pub fn new(
        client: &Client,
        history: HistoryStore,
        correlation_id: impl Into<String>,
        notifier: Arc<dyn Notifier>,
        timeout_ms: u64,
    ) -> Self {
        Self {
            client: client.clone(),
            history,
            correlation_id: correlation_id.into(),
            notifier,
            timeout_ms,
            in_flight: Mutex::new(None),
            scope: None,
        }
    }

    /// Nested calls join `scope`, so aborting it reaches them as well.
    pub fn with_scope(mut self, scope: CancelScope) -> Self {
        self.scope = Some(scope);
        self
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// The token call, while it runs.
    pub fn in_flight(&self) -> Option<AbortHandle> {
        self.in_flight.lock().clone()
    }

    pub async fn resolve(
        &self,
        headers: &[NameValuePair],
    ) -> Result<Vec<NameValuePair>, ResolveError> {
        let mut problems = Vec::new();
        let mut references = 0;
        let mut oauth = None;

        for (index, header) in headers.iter().enumerate() {
            if !is_oauth_reference(&header.name) {
                continue;
            }

            references += 1;
            match self.history.get_oauth(&header.value) {
                Some(definition) => {
                    // the token call is sent as stored, so it cannot hold a reference
                    if definition.headers.iter().any(|nested| is_oauth_reference(&nested.name)) {
                        problems.push(format!(
                            "The oauth request '{}' cannot use a crest-oauth header itself.",
                            header.value
                        ));
                    }
                    oauth = Some((index, definition));
                }
                None => problems.push(format!(
                    "Unable to find an oauth request named '{}', check your configs.",
                    header.value
                )),
            }
        }

        if references > 1 {
            problems.push("Only one crest-oauth header is supported per request.".to_string());
        }

        if !problems.is_empty() {
            self.notifier.notify("Invalid Request", &problems.join("\n"));
            return Err(ResolveError::Invalid(problems));
        }

        let mut resolved = headers.to_vec();
        if let Some((index, definition)) = oauth {
            let token = self.fetch_token(definition).await?;
            resolved[index] = NameValuePair::new("Authorization", format!("Bearer {}", token));
        }

        Ok(resolved)
    }

    async fn fetch_token(&self, definition: HttpRequest) -> Result<String, ResolveError> {
        tracing::debug!("fetching oauth token '{}'", definition.name);

        let request = HttpRequest {
            id: self.correlation_id.clone(),
            unresolved_headers: definition.headers.clone(),
            ..definition
        };
        let handler = ExchangeHandler::new(&self.client, request, self.timeout_ms);
        let timeout_ms = handler.timeout_ms();

        *self.in_flight.lock() = Some(handler.abort_handle());
        if let Some(scope) = &self.scope {
            scope.attach(handler.abort_handle());
        }

        let exchange = handler.submit().await;

        self.in_flight.lock().take();
        if let Some(scope) = &self.scope {
            scope.detach();
        }

        let body = exchange.response.body.as_deref().unwrap_or_default();

        if exchange.response.status_code == 200 && !body.is_empty() {
            return access_token(Some(body)).ok_or_else(|| {
                self.notifier.notify(
                    "OAuth Issue",
                    &format!("Unable to find a token in this response: \n{}", body),
                );
                ResolveError::MissingToken
            });
        }

        if exchange.aborted {
            tracing::debug!("oauth request aborted");
            return Err(ResolveError::Aborted);
        }

        if exchange.timedout {
            self.notifier.notify(
                "OAuth Timed out",
                &format!(
                    "OAuth token retrieval timed out after {} milliseconds.",
                    timeout_ms
                ),
            );
            return Err(ResolveError::TimedOut(timeout_ms));
        }

        let status = exchange.response.status_code;
        self.notifier.notify(
            "OAuth Issue",
            &format!(
                "There was an issue getting your OAuth token. The server responded with a {}. \
                 The response body may give you a clue: \n{}",
                status, body
            ),
        );
        Err(ResolveError::Rejected(status))
    }
}
