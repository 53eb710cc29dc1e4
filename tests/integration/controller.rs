use crate::common;

use shared_types::NameValuePair;
use tokio::time::{sleep, Duration};

use crest::app;
use crest::controller::{Phase, RequestLifecycleController, SendAffordance, SendOutcome};
use crest::draft::RequestDraft;
use crest::error::ResolveError;
use crest::history::HistoryStore;

async fn controller() -> (RequestLifecycleController, common::Notes) {
    let (_, engine) = app(&common::config()).await.unwrap();
    let (notifier, notes) = common::notes();
    (engine.controller(notifier), notes)
}

fn save_oauth(history: &HistoryStore, name: &str, url: String) {
    history
        .save_oauth(
            &RequestDraft::new("POST", url)
                .with_name(name)
                .with_headers("Content-Type: application/x-www-form-urlencoded")
                .with_body("grant_type=client_credentials"),
        )
        .unwrap();
}

async fn wait_for_phase(controller: &RequestLifecycleController, phase: Phase) {
    while controller.phase() != phase {
        sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn oauth_reference_is_resolved_before_dispatch() {
    common::enable_tracing();
    let origin = common::origin().await;
    let (controller, notes) = controller().await;
    save_oauth(controller.history(), "local", origin.url("/token"));

    let draft = RequestDraft::new("GET", origin.url("/protected"))
        .with_headers("Accept: text/plain\ncrest-oauth: local");
    let outcome = controller.send(&draft).await;

    let exchange = outcome.exchange().unwrap();
    assert_eq!(exchange.response.status_code, 200);
    assert_eq!(exchange.response.body.as_deref(), Some("secret"));
    assert_eq!(
        exchange.request.headers,
        vec![
            NameValuePair::new("Accept", "text/plain"),
            NameValuePair::new("Authorization", format!("Bearer {}", common::TOKEN)),
        ]
    );
    assert!(notes.lock().is_empty());

    // the token itself is never stored
    let history = controller.history().list_request_history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].headers, history[0].unresolved_headers);
    assert_eq!(history[0].headers[1], NameValuePair::new("crest-oauth", "local"));
    assert_eq!(controller.history().list_headers(), vec!["Accept: text/plain", "crest-oauth: local"]);
}

#[tokio::test]
async fn token_responses_are_flagged() {
    let origin = common::origin().await;
    let (controller, _) = controller().await;

    let draft = RequestDraft::new("POST", origin.url("/token")).with_body("grant_type=client_credentials");
    let outcome = controller.send(&draft).await;

    let exchange = outcome.exchange().unwrap();
    assert_eq!(exchange.request.is_oauth, Some(true));
    assert_eq!(exchange.request.body.as_deref(), Some("grant_type=client_credentials"));
}

#[tokio::test]
async fn tokenless_oauth_response_stops_the_send() {
    let origin = common::origin().await;
    let (controller, notes) = controller().await;
    save_oauth(controller.history(), "broken", origin.url("/token/none"));

    let draft = RequestDraft::new("GET", origin.url("/protected")).with_headers("crest-oauth: broken");
    let outcome = controller.send(&draft).await;

    assert!(matches!(outcome, SendOutcome::Unresolved(ResolveError::MissingToken)));
    assert_eq!(origin.hits.protected(), 0);
    let notes = notes.lock();
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].0, "OAuth Issue");
    assert!(notes[0].1.starts_with("Unable to find a token in this response:"));
    assert!(controller.history().list_request_history().is_empty());
}

#[tokio::test]
async fn rejected_oauth_call_reports_its_status() {
    let origin = common::origin().await;
    let (controller, notes) = controller().await;
    save_oauth(controller.history(), "denied", origin.url("/token/denied"));

    let draft = RequestDraft::new("GET", origin.url("/protected")).with_headers("crest-oauth: denied");
    let outcome = controller.send(&draft).await;

    assert!(matches!(outcome, SendOutcome::Unresolved(ResolveError::Rejected(401))));
    let notes = notes.lock();
    assert_eq!(notes[0].0, "OAuth Issue");
    assert!(notes[0].1.contains("The server responded with a 401."));
    assert!(notes[0].1.contains("bad client credentials"));
}

#[tokio::test]
async fn unknown_oauth_reference_is_invalid() {
    let origin = common::origin().await;
    let (controller, notes) = controller().await;

    let draft = RequestDraft::new("GET", origin.url("/protected")).with_headers("crest-oauth: nobody");
    let outcome = controller.send(&draft).await;

    assert!(matches!(outcome, SendOutcome::Unresolved(ResolveError::Invalid(_))));
    assert_eq!(notes.lock()[0].0, "Invalid Request");
    assert_eq!(origin.hits.protected(), 0);
}

#[tokio::test]
async fn abort_during_oauth_prevents_the_main_call() {
    let origin = common::origin().await;
    let (controller, notes) = controller().await;
    save_oauth(controller.history(), "slow", origin.url("/token/slow"));

    let draft = RequestDraft::new("GET", origin.url("/protected")).with_headers("crest-oauth: slow");
    let (outcome, aborted) = tokio::join!(controller.send(&draft), async {
        wait_for_phase(&controller, Phase::ResolvingHeaders).await;
        sleep(Duration::from_millis(100)).await;
        controller.abort()
    });

    assert!(aborted);
    assert!(matches!(outcome, SendOutcome::Aborted));
    assert_eq!(origin.hits.protected(), 0);
    assert!(notes.lock().is_empty());
    assert_eq!(controller.phase(), Phase::Idle);
    assert!(controller.in_flight().is_none());
}

#[tokio::test]
async fn cancel_is_offered_after_the_grace_period() {
    let origin = common::origin().await;
    let (controller, notes) = controller().await;
    let draft = RequestDraft::new("GET", origin.url("/slow"));

    let (outcome, (early, late)) = tokio::join!(controller.send(&draft), async {
        wait_for_phase(&controller, Phase::Executing).await;
        let early = controller.affordance();
        sleep(Duration::from_millis(300)).await;
        let late = controller.affordance();
        controller.abort();
        (early, late)
    });

    assert!(matches!(outcome, SendOutcome::Aborted));
    assert_eq!(early, SendAffordance::Disabled);
    assert_eq!(late, SendAffordance::Cancel);
    assert_eq!(controller.affordance(), SendAffordance::Send);
    assert!(notes.lock().is_empty());
    assert!(controller.history().list_request_history().is_empty());
}

#[tokio::test]
async fn second_send_while_in_flight_is_busy() {
    let origin = common::origin().await;
    let (controller, _) = controller().await;
    let draft = RequestDraft::new("GET", origin.url("/slow"));

    let (first, second) = tokio::join!(controller.send(&draft), async {
        wait_for_phase(&controller, Phase::Executing).await;
        let second = controller.send(&draft).await;
        controller.abort();
        second
    });

    assert!(matches!(second, SendOutcome::Busy));
    assert!(matches!(first, SendOutcome::Aborted));
}

#[tokio::test]
async fn timeout_is_notified_with_the_budget() {
    let origin = common::origin().await;
    let (controller, notes) = controller().await;
    controller.history().set_service_timeout(500);

    let outcome = controller.send(&RequestDraft::new("GET", origin.url("/slow"))).await;

    let exchange = match outcome {
        SendOutcome::TimedOut(exchange) => exchange,
        other => panic!("expected a timeout, got {:?}", other),
    };
    assert!(exchange.timedout);
    assert_eq!(exchange.response.status_code, 0);

    let notes = notes.lock();
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].0, "Timed Out");
    assert!(notes[0].1.starts_with("The request timed out after 500 milliseconds."));
}

#[tokio::test]
async fn network_error_over_https_hints_at_certificates() {
    let (controller, notes) = controller().await;
    let url = common::closed_url("https").await;

    let outcome = controller.send(&RequestDraft::new("GET", url)).await;

    assert!(matches!(outcome, SendOutcome::NetworkError(_)));
    let notes = notes.lock();
    assert_eq!(notes[0].0, "Network Error");
    assert!(notes[0].1.starts_with("No response from the server. Ensure your URL is correct."));
    assert!(notes[0].1.contains("SSL"));
}

#[tokio::test]
async fn rerun_keeps_one_history_entry() {
    let origin = common::origin().await;
    let (controller, _) = controller().await;
    let draft = RequestDraft::new("GET", origin.url("/json")).with_headers("Accept: application/json");

    let first = controller.send(&draft).await;
    let second = controller.send(&draft).await;

    let history = controller.history().list_request_history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, second.exchange().unwrap().request.id);
    assert_ne!(history[0].id, first.exchange().unwrap().request.id);
    assert_eq!(controller.history().list_urls(), vec![origin.url("/json")]);
}

#[tokio::test]
async fn failures_are_not_recorded() {
    let origin = common::origin().await;
    let (controller, notes) = controller().await;

    let outcome = controller.send(&RequestDraft::new("GET", origin.url("/status/404"))).await;

    assert_eq!(outcome.exchange().unwrap().response.status_code, 404);
    assert!(notes.lock().is_empty());
    assert!(controller.history().list_request_history().is_empty());
    assert!(controller.history().list_urls().is_empty());
}

#[tokio::test]
async fn contexts_see_each_others_history() {
    let origin = common::origin().await;
    let (_, engine) = app(&common::config()).await.unwrap();
    let (notifier, _) = common::notes();
    let controller = engine.controller(notifier);

    let other_tab = engine.history();
    let mut changes = other_tab.subscribe();

    controller.send(&RequestDraft::new("GET", origin.url("/json"))).await;

    let mut keys = Vec::new();
    while let Some(change) = changes.try_recv() {
        keys.push(change.key);
    }
    assert!(keys.contains(&"requestHistory".to_string()));
    assert_eq!(other_tab.list_request_history().len(), 1);
}
