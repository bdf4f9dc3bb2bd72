//! HTTP surface tests over the assembled router with in-memory fakes.

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use tower::util::ServiceExt;

use parleql_core::CoreConfig;
use parleql_server::{router, AppState};
use parleql_test_utils::{orders_core, ScriptedLlm};

fn app(llm: ScriptedLlm, config: CoreConfig) -> axum::Router {
    let (core, _driver) = orders_core(llm, config);
    router(AppState::new(core))
}

fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-user-id", "alice")
        .header("x-user-role", "analyst")
        .header("x-session-id", "s1")
        .body(Body::from(body.to_string()))
        .expect("request builds")
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body reads");
    serde_json::from_slice(&bytes).expect("body is JSON")
}

#[tokio::test]
async fn health_answers() {
    let app = app(ScriptedLlm::new(), CoreConfig::default());
    let response = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .expect("request builds"),
        )
        .await
        .expect("routes");
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn process_returns_the_full_envelope() {
    let llm = ScriptedLlm::new().reply_sql(
        "SELECT region, SUM(sales_amount) AS total FROM orders GROUP BY region",
        85,
    );
    let app = app(llm, CoreConfig::default());
    let response = app
        .oneshot(post_json(
            "/queries/process",
            serde_json::json!({
                "query": "total sales by region from orders",
                "database_type": "postgres",
                "auto_approve": true,
            }),
        ))
        .await
        .expect("routes");
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "success");
    assert_eq!(body["needs_approval"], false);
    assert!(body["query_id"].as_str().is_some());
    assert!(body["sql_query"].as_str().expect("sql").contains("SUM"));
    assert_eq!(body["sql_confidence"], 85);
    assert!(body["results"]["row_count"].as_u64().is_some());
    assert!(body["validation"]["valid"].as_bool().expect("validation"));
}

#[tokio::test]
async fn unknown_database_type_is_rejected() {
    let app = app(ScriptedLlm::new(), CoreConfig::default());
    let response = app
        .oneshot(post_json(
            "/queries/process",
            serde_json::json!({"query": "anything", "database_type": "mysql"}),
        ))
        .await
        .expect("routes");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn missing_identity_is_forbidden_outside_dev_mode() {
    let app = app(ScriptedLlm::new(), CoreConfig::default());
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/queries/process")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    serde_json::json!({"query": "hello"}).to_string(),
                ))
                .expect("request builds"),
        )
        .await
        .expect("routes");
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn dev_mode_allows_anonymous_access() {
    let mut config = CoreConfig::default();
    config.dev_mode = true;
    let app = app(ScriptedLlm::new(), config);
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/queries/process")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    serde_json::json!({"query": "hello there"}).to_string(),
                ))
                .expect("request builds"),
        )
        .await
        .expect("routes");
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "success");
    assert!(body["message"].as_str().is_some());
}

#[tokio::test]
async fn injection_maps_to_400_with_taxonomy() {
    let app = app(ScriptedLlm::new(), CoreConfig::default());
    let response = app
        .oneshot(post_json(
            "/queries/process",
            serde_json::json!({
                "query": "show sales; DROP TABLE users",
                "database_type": "postgres",
            }),
        ))
        .await
        .expect("routes");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert_eq!(body["status"], "error");
    assert_eq!(
        body["llm_metadata"]["error_details"]["error_taxonomy"],
        "injection_blocked"
    );
    assert!(body["error"].as_str().expect("error").contains("injection"));
}

#[tokio::test]
async fn approval_round_trip_and_duplicate_conflict() {
    let mut config = CoreConfig::default();
    config.sensitive_tables.push("ORDERS".to_string());
    let llm = ScriptedLlm::new().reply_sql("SELECT region FROM orders", 90);
    let (core, _driver) = orders_core(llm, config);
    let app = router(AppState::new(std::sync::Arc::clone(&core)));

    let response = app
        .clone()
        .oneshot(post_json(
            "/queries/process",
            serde_json::json!({
                "query": "show region from orders",
                "database_type": "postgres",
                "auto_approve": false,
            }),
        ))
        .await
        .expect("routes");
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "pending_approval");
    assert_eq!(body["needs_approval"], true);
    let id = body["query_id"].as_str().expect("id").to_string();

    let approve = app
        .clone()
        .oneshot(post_json(
            &format!("/queries/{id}/approve"),
            serde_json::json!({"approved": true}),
        ))
        .await
        .expect("routes");
    assert_eq!(approve.status(), StatusCode::OK);
    let body = json_body(approve).await;
    assert_eq!(body["status"], "success");

    let duplicate = app
        .oneshot(post_json(
            &format!("/queries/{id}/approve"),
            serde_json::json!({"approved": true}),
        ))
        .await
        .expect("routes");
    assert_eq!(duplicate.status(), StatusCode::CONFLICT);
    let body = json_body(duplicate).await;
    assert_eq!(body["error"], "approval_duplicate");
}

#[tokio::test]
async fn status_is_owner_only() {
    let llm = ScriptedLlm::new().reply_sql("SELECT region FROM orders", 90);
    let (core, _driver) = orders_core(llm, CoreConfig::default());
    let app = router(AppState::new(std::sync::Arc::clone(&core)));

    let response = app
        .clone()
        .oneshot(post_json(
            "/queries/process",
            serde_json::json!({
                "query": "show region from orders",
                "database_type": "postgres",
                "auto_approve": true,
            }),
        ))
        .await
        .expect("routes");
    let body = json_body(response).await;
    let id = body["query_id"].as_str().expect("id").to_string();

    let mine = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/queries/{id}/status"))
                .header("x-user-id", "alice")
                .header("x-user-role", "analyst")
                .body(Body::empty())
                .expect("request builds"),
        )
        .await
        .expect("routes");
    assert_eq!(mine.status(), StatusCode::OK);
    let body = json_body(mine).await;
    assert_eq!(body["metadata"]["owner_user"], "alice");

    let theirs = app
        .oneshot(
            Request::builder()
                .uri(format!("/queries/{id}/status"))
                .header("x-user-id", "mallory")
                .header("x-user-role", "analyst")
                .body(Body::empty())
                .expect("request builds"),
        )
        .await
        .expect("routes");
    assert_eq!(theirs.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn connections_lists_registered_backends() {
    let app = app(ScriptedLlm::new(), CoreConfig::default());
    let response = app
        .oneshot(
            Request::builder()
                .uri("/connections")
                .header("x-user-id", "alice")
                .body(Body::empty())
                .expect("request builds"),
        )
        .await
        .expect("routes");
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["connections"], serde_json::json!(["postgres"]));
}

#[tokio::test]
async fn stream_replays_the_event_history() {
    let llm = ScriptedLlm::new().reply_sql("SELECT region FROM orders", 90);
    let (core, _driver) = orders_core(llm, CoreConfig::default());
    let app = router(AppState::new(std::sync::Arc::clone(&core)));

    let response = app
        .clone()
        .oneshot(post_json(
            "/queries/process",
            serde_json::json!({
                "query": "show region from orders",
                "database_type": "postgres",
                "auto_approve": true,
            }),
        ))
        .await
        .expect("routes");
    let body = json_body(response).await;
    let id = body["query_id"].as_str().expect("id").to_string();

    let stream = app
        .oneshot(
            Request::builder()
                .uri(format!("/queries/{id}/stream"))
                .header("x-user-id", "alice")
                .header("x-user-role", "analyst")
                .body(Body::empty())
                .expect("request builds"),
        )
        .await
        .expect("routes");
    assert_eq!(stream.status(), StatusCode::OK);
    assert_eq!(
        stream
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok()),
        Some("text/event-stream")
    );
    assert_eq!(
        stream
            .headers()
            .get("x-accel-buffering")
            .and_then(|v| v.to_str().ok()),
        Some("no")
    );
    let text = String::from_utf8(
        to_bytes(stream.into_body(), usize::MAX)
            .await
            .expect("body reads")
            .to_vec(),
    )
    .expect("utf8");
    assert!(text.contains("event: received"));
    assert!(text.contains("event: finished"));
}
