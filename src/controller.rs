use std::sync::Arc;

use parking_lot::Mutex;
use shared_types::{Exchange, HttpRequest};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};

use crate::config;
use crate::draft::RequestDraft;
use crate::error::{ResolveError, ValidationError};
use crate::exchange::{now_ms, Client, ExchangeHandler};
use crate::headers::{is_reusable, is_token_response, to_header_line};
use crate::history::HistoryStore;
use crate::notify::Notifier;
use crate::registry::{CancelScope, InFlightRegistry};
use crate::resolver::HeaderResolver;
use crate::virtual_protocol;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Phase {
    Idle,
    Validating,
    ResolvingHeaders,
    Executing,
}

/// What the send control offers while a send is pending.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SendAffordance {
    Send,
    Disabled,
    Cancel,
}

#[derive(Debug)]
pub enum SendOutcome {
    // another send is still in flight
    Busy,
    Rejected(ValidationError),
    Unresolved(ResolveError),
    Aborted,
    TimedOut(Exchange),
    NetworkError(Exchange),
    Completed(Exchange),
}

impl SendOutcome {
    pub fn exchange(&self) -> Option<&Exchange> {
        match self {
            SendOutcome::TimedOut(exchange)
            | SendOutcome::NetworkError(exchange)
            | SendOutcome::Completed(exchange) => Some(exchange),
            _ => None,
        }
    }
}

enum Step {
    // draft has been received
    Validating(RequestDraft),
    // authored headers may still hold virtual references
    Resolving(HttpRequest),
    // headers are wire-ready
    Executing(HttpRequest),
    // a terminal exchange was produced
    Finished(Exchange),
    Done(SendOutcome),
}

/// Drives one send at a time from a draft to a terminal outcome.
pub struct RequestLifecycleController {
    client: Client,
    history: HistoryStore,
    registry: InFlightRegistry,
    notifier: Arc<dyn Notifier>,
    config: config::Exchange,
    phase: watch::Sender<Phase>,
    affordance: Arc<watch::Sender<SendAffordance>>,
    in_flight: Arc<Mutex<Option<String>>>,
}

impl RequestLifecycleController {
    pub fn new(
        client: Client,
        history: HistoryStore,
        registry: InFlightRegistry,
        notifier: Arc<dyn Notifier>,
        config: config::Exchange,
    ) -> Self {
        let (phase, _) = watch::channel(Phase::Idle);
        let (affordance, _) = watch::channel(SendAffordance::Send);

        Self {
            client,
            history,
            registry,
            notifier,
            config,
            phase,
            affordance: Arc::new(affordance),
            in_flight: Arc::new(Mutex::new(None)),
        }
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    pub fn affordance(&self) -> SendAffordance {
        *self.affordance.borrow()
    }

    pub fn subscribe_affordance(&self) -> watch::Receiver<SendAffordance> {
        self.affordance.subscribe()
    }

    /// Correlation id of the pending send.
    pub fn in_flight(&self) -> Option<String> {
        self.in_flight.lock().clone()
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    /// Cancel whichever call of the pending send is active. Returns false
    /// when nothing is pending.
    pub fn abort(&self) -> bool {
        match self.in_flight() {
            Some(id) => self.registry.abort(&id),
            None => false,
        }
    }

    pub async fn send(&self, draft: &RequestDraft) -> SendOutcome {
        let id = uuid::Uuid::new_v4().to_string();
        let Some(pending) = Pending::begin(self, &id) else {
            tracing::debug!("send ignored, {:?} still in flight", self.in_flight());
            return SendOutcome::Busy;
        };

        let mut step = Step::Validating(draft.clone());
        loop {
            step = match self.next(&pending, step).await {
                Step::Done(outcome) => {
                    tracing::trace!("send {} finished", id);
                    return outcome;
                }
                next => next,
            };
        }
    }

    async fn next(&self, pending: &Pending<'_>, step: Step) -> Step {
        match step {
            Step::Validating(draft) => {
                self.phase.send_replace(Phase::Validating);
                match draft.to_request(&pending.id, now_ms()) {
                    Ok(request) => {
                        pending.start_grace_timer(self.config.grace_period_ms);
                        Step::Resolving(request)
                    }
                    Err(err) => {
                        self.notifier.notify("Invalid Request", &err.to_string());
                        Step::Done(SendOutcome::Rejected(err))
                    }
                }
            }
            Step::Resolving(mut request) => {
                self.phase.send_replace(Phase::ResolvingHeaders);
                let resolver = HeaderResolver::new(
                    &self.client,
                    self.history.clone(),
                    pending.id.clone(),
                    Arc::clone(&self.notifier),
                    self.config.oauth_timeout_ms,
                )
                .with_scope(pending.scope.clone());

                match resolver.resolve(&request.unresolved_headers).await {
                    Ok(headers) => {
                        request.headers = headers;
                        Step::Executing(request)
                    }
                    Err(ResolveError::Aborted) => {
                        tracing::debug!("{} aborted during header resolution", pending.id);
                        Step::Done(SendOutcome::Aborted)
                    }
                    Err(err) => {
                        tracing::debug!("header resolution failed: {}", err);
                        Step::Done(SendOutcome::Unresolved(err))
                    }
                }
            }
            Step::Executing(request) => {
                if pending.scope.is_aborted() {
                    tracing::debug!("{} aborted before dispatch", pending.id);
                    return Step::Done(SendOutcome::Aborted);
                }

                self.phase.send_replace(Phase::Executing);
                if virtual_protocol::is_virtual(&request.url) {
                    return Step::Finished(virtual_protocol::handle(&request, self.history.context()));
                }

                let default_timeout = self.history.settings().service_timeout;
                let handler = ExchangeHandler::new(&self.client, request, default_timeout);
                pending.scope.attach(handler.abort_handle());
                let exchange = handler.submit().await;
                pending.scope.detach();

                Step::Finished(exchange)
            }
            Step::Finished(exchange) => Step::Done(self.complete(exchange)),
            Step::Done(outcome) => Step::Done(outcome),
        }
    }

    fn complete(&self, mut exchange: Exchange) -> SendOutcome {
        if !exchange.has_response() {
            if exchange.aborted {
                return SendOutcome::Aborted;
            }

            if exchange.timedout {
                let mut content = format!(
                    "The request timed out after {} milliseconds.",
                    exchange.timeout.unwrap_or_default()
                );
                if let Some(elapsed) = exchange.elapsed_ms() {
                    content.push_str(&format!(" Elapsed time: {} milliseconds.", elapsed));
                }
                self.notifier.notify("Timed Out", &content);
                return SendOutcome::TimedOut(exchange);
            }

            let mut content = "No response from the server. Ensure your URL is correct.".to_string();
            if exchange.request.url.starts_with("https") {
                content.push_str(
                    "\nThis could also be due to SSL issues. Check that the server certificate is trusted.",
                );
            }
            self.notifier.notify("Network Error", &content);
            return SendOutcome::NetworkError(exchange);
        }

        if is_token_response(exchange.response.body.as_deref()) {
            exchange.request.is_oauth = Some(true);
        }

        if exchange.response.status_code < 300 {
            self.record(&exchange.request);
        }

        SendOutcome::Completed(exchange)
    }

    fn record(&self, request: &HttpRequest) {
        // a resolved bearer token never reaches storage
        let entry = HttpRequest {
            headers: request.unresolved_headers.clone(),
            ..request.clone()
        };

        let reusable: Vec<String> = request
            .unresolved_headers
            .iter()
            .filter(|header| is_reusable(header))
            .map(to_header_line)
            .collect();

        self.history.store_url(&request.url);
        self.history.store_headers(&reusable);
        self.history.update_request_history(&entry);
    }
}

/// The pending send. Dropping it releases the send control, whether the
/// send finished or was dropped midway.
struct Pending<'a> {
    controller: &'a RequestLifecycleController,
    id: String,
    scope: CancelScope,
    grace_timer: Mutex<Option<JoinHandle<()>>>,
}

impl<'a> Pending<'a> {
    fn begin(controller: &'a RequestLifecycleController, id: &str) -> Option<Self> {
        {
            let mut in_flight = controller.in_flight.lock();
            if in_flight.is_some() {
                return None;
            }
            *in_flight = Some(id.to_string());
        }

        Some(Self {
            controller,
            id: id.to_string(),
            scope: controller.registry.open(id),
            grace_timer: Mutex::new(None),
        })
    }

    fn start_grace_timer(&self, grace_period_ms: u64) {
        self.controller.affordance.send_replace(SendAffordance::Disabled);

        let id = self.id.clone();
        let in_flight = Arc::clone(&self.controller.in_flight);
        let affordance = Arc::clone(&self.controller.affordance);
        let timer = tokio::spawn(async move {
            sleep(Duration::from_millis(grace_period_ms)).await;
            let in_flight = in_flight.lock();
            if in_flight.as_deref() == Some(id.as_str()) {
                tracing::trace!("{} still in flight, offering cancel", id);
                affordance.send_replace(SendAffordance::Cancel);
            }
        });
        *self.grace_timer.lock() = Some(timer);
    }
}

impl Drop for Pending<'_> {
    fn drop(&mut self) {
        if let Some(timer) = self.grace_timer.lock().take() {
            timer.abort();
        }
        self.controller.registry.close(&self.id);

        let mut in_flight = self.controller.in_flight.lock();
        *in_flight = None;
        self.controller.phase.send_replace(Phase::Idle);
        self.controller
            .affordance
            .send_replace(SendAffordance::Send);
    }
}
