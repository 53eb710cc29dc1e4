use crate::common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use serde_json::json;
use shared_types::Exchange;
use tokio::time::{sleep, Duration};
use tower::util::ServiceExt;

use crest::app;

fn post_exchange(request: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/exchanges")
        .header("Content-Type", "application/json")
        .body(Body::from(request.to_string()))
        .unwrap()
}

async fn read_body(response: Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

#[tokio::test]
async fn executes_an_exchange() {
    common::enable_tracing();
    let origin = common::origin().await;
    let (router, _) = app(&common::config()).await.unwrap();

    let response = router
        .oneshot(post_exchange(json!({
            "method": "GET",
            "url": origin.url("/json"),
        })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let exchange: Exchange = serde_json::from_slice(&read_body(response).await).unwrap();
    assert_eq!(exchange.response.status_code, 200);
    assert_eq!(exchange.response.body.as_deref(), Some(r#"{"ok":true}"#));
    assert!(!exchange.request.id.is_empty());
}

#[tokio::test]
async fn executes_virtual_requests() {
    let (router, engine) = app(&common::config()).await.unwrap();
    engine.history().store_url("http://localhost:8080/");

    let response = router
        .oneshot(post_exchange(json!({
            "id": "virtual",
            "method": "GET",
            "url": "crest://persistence/urlHistory",
        })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let exchange: Exchange = serde_json::from_slice(&read_body(response).await).unwrap();
    assert_eq!(exchange.request.id, "virtual");
    assert_eq!(exchange.response.status_code, 200);
    let body: serde_json::Value =
        serde_json::from_str(exchange.response.body.as_deref().unwrap()).unwrap();
    assert_eq!(body, json!(["http://localhost:8080/"]));
}

#[tokio::test]
async fn unresolved_references_are_refused() {
    let origin = common::origin().await;
    let (router, _) = app(&common::config()).await.unwrap();

    let response = router
        .oneshot(post_exchange(json!({
            "method": "GET",
            "url": origin.url("/protected"),
            "headers": [{"name": "crest-oauth", "value": "local"}],
        })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = String::from_utf8(read_body(response).await).unwrap();
    assert_eq!(body, "Header 'crest-oauth' must be resolved before the request is sent.");
    assert_eq!(origin.hits.protected(), 0);
}

#[tokio::test]
async fn abort_of_unknown_id_is_not_found() {
    let (router, _) = app(&common::config()).await.unwrap();

    let response = router
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/exchanges/nobody")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn abort_by_correlation_id() {
    let origin = common::origin().await;
    let (router, engine) = app(&common::config()).await.unwrap();

    let execute = router.clone().oneshot(post_exchange(json!({
        "id": "slow-one",
        "method": "GET",
        "url": origin.url("/slow"),
    })));

    let abort = async {
        while !engine.registry.contains("slow-one") {
            sleep(Duration::from_millis(10)).await;
        }

        let listed = router
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/exchanges")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let ids: Vec<String> = serde_json::from_slice(&read_body(listed).await).unwrap();

        let aborted = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/exchanges/slow-one")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        (ids, aborted.status())
    };

    let (executed, (ids, status)) = tokio::join!(execute, abort);

    assert_eq!(ids, vec!["slow-one".to_string()]);
    assert_eq!(status, StatusCode::NO_CONTENT);

    let exchange: Exchange = serde_json::from_slice(&read_body(executed.unwrap()).await).unwrap();
    assert!(exchange.aborted);
    assert!(!exchange.timedout);
    assert_eq!(exchange.response.status_code, 0);
    assert!(!engine.registry.contains("slow-one"));
}
