//! Router-level tests driven through `tower::ServiceExt::oneshot`.

mod common;

use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use tower::ServiceExt;

use estate_rag::api::{create_app, AppState};
use estate_rag::generator::PropertyGenerator;
use estate_rag::Config;

async fn app_with(config: Config) -> Router {
    let (rag, _) = common::seeded(config, 40).await.unwrap();
    create_app(AppState::new(rag))
}

fn json_request(method: Method, uri: &str, token: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn empty_request(method: Method, uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    builder.body(Body::empty()).unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

async fn login(app: &Router, username: &str) -> (String, String) {
    let (status, body) = send(
        app,
        json_request(
            Method::POST,
            "/api/v1/auth/login",
            None,
            json!({"username": username, "password": common::PASSWORD}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    (
        body["data"]["access_token"].as_str().unwrap().to_string(),
        body["data"]["refresh_token"].as_str().unwrap().to_string(),
    )
}

fn secured_config(dir: &std::path::Path) -> Config {
    let mut config = common::test_config(dir);
    config.auth.enabled = true;
    config
}

#[tokio::test]
async fn test_health_reports_in_memory_backends() {
    let dir = tempfile::tempdir().unwrap();
    let app = app_with(common::test_config(dir.path())).await;

    let (status, body) = send(&app, empty_request(Method::GET, "/health", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["status"], "healthy");
    assert_eq!(body["data"]["redis_fallback"], true);
    assert_eq!(body["data"]["backends"]["vector_backend"], "in_memory");
}

#[tokio::test]
async fn test_hybrid_search_with_auth_disabled() {
    let dir = tempfile::tempdir().unwrap();
    let app = app_with(common::test_config(dir.path())).await;

    let (status, body) = send(
        &app,
        json_request(
            Method::POST,
            "/api/v1/search/hybrid",
            None,
            json!({"query": "apartment with pool", "limit": 5}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let results = body["data"]["results"].as_array().unwrap();
    assert!(!results.is_empty());
    assert!(results.len() <= 5);
    assert_eq!(body["data"]["total"], results.len());

    // The second identical request is served from the cache.
    let (_, again) = send(
        &app,
        json_request(
            Method::POST,
            "/api/v1/search/hybrid",
            None,
            json!({"query": "apartment with pool", "limit": 5}),
        ),
    )
    .await;
    assert_eq!(again["data"]["cached"], true);

    let (status, perf) = send(&app, empty_request(Method::GET, "/api/v1/search/performance", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(perf["data"]["total_searches"], 2);
    assert_eq!(perf["data"]["cache_hits"], 1);
}

#[tokio::test]
async fn test_invalid_search_is_bad_request() {
    let dir = tempfile::tempdir().unwrap();
    let app = app_with(common::test_config(dir.path())).await;

    let (status, body) = send(
        &app,
        json_request(
            Method::POST,
            "/api/v1/search/hybrid",
            None,
            json!({"query": "villa", "min_price": 5000000.0, "max_price": 1000000.0}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().unwrap().contains("min_price"));
}

#[tokio::test]
async fn test_protected_routes_require_token() {
    let dir = tempfile::tempdir().unwrap();
    let app = app_with(secured_config(dir.path())).await;

    let (status, _) = send(&app, empty_request(Method::GET, "/api/v1/auth/me", None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(&app, empty_request(Method::GET, "/api/v1/auth/me", Some("not-a-jwt"))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(
        &app,
        json_request(
            Method::POST,
            "/api/v1/auth/login",
            None,
            json!({"username": "admin", "password": "wrong"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // Health stays public.
    let (status, _) = send(&app, empty_request(Method::GET, "/health", None)).await;
    assert_eq!(status, StatusCode::OK);

    let (access, _) = login(&app, "agent").await;
    let (status, body) = send(&app, empty_request(Method::GET, "/api/v1/auth/me", Some(&access))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["user_id"], "agent");
    assert_eq!(body["data"]["role"], "agent");
}

#[tokio::test]
async fn test_role_checks_on_admin_routes() {
    let dir = tempfile::tempdir().unwrap();
    let app = app_with(secured_config(dir.path())).await;

    let (viewer, _) = login(&app, "viewer").await;
    let (status, _) = send(&app, empty_request(Method::DELETE, "/api/v1/search/cache", Some(&viewer))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = send(
        &app,
        json_request(
            Method::POST,
            "/api/v1/knowledge/documents",
            Some(&viewer),
            json!({"content": "Service charges in Dubai Marina average AED 18 per sqft."}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (admin, _) = login(&app, "admin").await;
    let (status, body) = send(&app, empty_request(Method::DELETE, "/api/v1/search/cache", Some(&admin))).await;
    assert_eq!(status, StatusCode::OK, "{body}");
}

#[tokio::test]
async fn test_refresh_rotates_and_logout_revokes() {
    let dir = tempfile::tempdir().unwrap();
    let app = app_with(secured_config(dir.path())).await;
    let (access, refresh) = login(&app, "agent").await;

    let (status, body) = send(
        &app,
        json_request(Method::POST, "/api/v1/auth/refresh", None, json!({"refresh_token": refresh})),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let rotated = body["data"]["refresh_token"].as_str().unwrap().to_string();

    // A consumed refresh token cannot be replayed.
    let (status, _) = send(
        &app,
        json_request(Method::POST, "/api/v1/auth/refresh", None, json!({"refresh_token": refresh})),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = send(
        &app,
        json_request(Method::POST, "/api/v1/auth/logout", Some(&access), json!({"refresh_token": rotated})),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["revoked"], 2);

    let (status, _) = send(&app, empty_request(Method::GET, "/api/v1/auth/me", Some(&access))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _) = send(
        &app,
        json_request(Method::POST, "/api/v1/auth/refresh", None, json!({"refresh_token": rotated})),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_viewer_search_hides_nothing_public_but_requires_login() {
    let dir = tempfile::tempdir().unwrap();
    let app = app_with(secured_config(dir.path())).await;
    let (viewer, _) = login(&app, "viewer").await;

    let (status, body) = send(
        &app,
        json_request(
            Method::POST,
            "/api/v1/search/hybrid",
            Some(&viewer),
            json!({"query": "villa", "limit": 3}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    for hit in body["data"]["results"].as_array().unwrap() {
        assert!(hit["metadata"].get("commission").is_none());
    }
}

#[tokio::test]
async fn test_rate_limit_returns_429() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = common::test_config(dir.path());
    config.server.rate_limit_per_minute = 2;
    let app = app_with(config).await;

    for _ in 0..2 {
        let (status, _) = send(&app, empty_request(Method::GET, "/api/v1/knowledge/stats", None)).await;
        assert_eq!(status, StatusCode::OK);
    }
    let (status, body) = send(&app, empty_request(Method::GET, "/api/v1/knowledge/stats", None)).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["success"], false);

    // Public routes are not limited.
    let (status, _) = send(&app, empty_request(Method::GET, "/health", None)).await;
    assert_eq!(status, StatusCode::OK);
}

fn multipart(filename: &str, content: &[u8], ingest: bool) -> Request<Body> {
    let boundary = "estate-rag-test-boundary";
    let mut body = Vec::new();
    body.extend_from_slice(
        format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{f}\"\r\nContent-Type: application/octet-stream\r\n\r\n",
            b = boundary,
            f = filename
        )
        .as_bytes(),
    );
    body.extend_from_slice(content);
    body.extend_from_slice(
        format!(
            "\r\n--{b}\r\nContent-Disposition: form-data; name=\"ingest\"\r\n\r\n{i}\r\n--{b}--\r\n",
            b = boundary,
            i = ingest
        )
        .as_bytes(),
    );
    Request::builder()
        .method(Method::POST)
        .uri("/api/v1/files/upload")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", boundary),
        )
        .body(Body::from(body))
        .unwrap()
}

#[tokio::test]
async fn test_upload_stores_and_ingests_text() {
    let dir = tempfile::tempdir().unwrap();
    let app = app_with(common::test_config(dir.path())).await;

    let guide = "Dubai Creek Harbour handover schedule. ".repeat(80);
    let (status, body) = send(&app, multipart("creek guide.txt", guide.as_bytes(), true)).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let stored = &body["data"]["file"];
    assert!(stored["stored_name"].as_str().unwrap().ends_with("_creek_guide.txt"));
    assert_eq!(stored["size"], guide.len());
    assert!(body["data"]["ingested"]["chunks"].as_u64().unwrap() >= 2);

    let path = std::path::PathBuf::from(stored["path"].as_str().unwrap());
    assert!(path.starts_with(dir.path()));
    assert_eq!(std::fs::read(&path).unwrap(), guide.as_bytes());
}

#[tokio::test]
async fn test_upload_rejects_dangerous_files() {
    let dir = tempfile::tempdir().unwrap();
    let app = app_with(common::test_config(dir.path())).await;

    let (status, body) = send(&app, multipart("invoice.pdf.exe", b"MZ\x90\x00", false)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);

    let (status, _) = send(&app, multipart("listing.pdf", b"not really a pdf", false)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Nothing was written for rejected uploads.
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_chat_turn_and_history() {
    let dir = tempfile::tempdir().unwrap();
    let app = app_with(common::test_config(dir.path())).await;

    let (status, body) = send(
        &app,
        json_request(
            Method::POST,
            "/api/v1/chat",
            None,
            json!({"session_id": "session-1", "message": "Show me 2 bedroom apartments in JVC under 2 million"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["answer"], common::ANSWER);
    assert_eq!(body["data"]["filters"]["bedrooms"], 2);
    assert_eq!(body["data"]["filters"]["location"], "Jumeirah Village Circle");
    assert!(body["data"]["intents"]
        .as_array()
        .unwrap()
        .iter()
        .any(|i| i == "property_search"));

    let (status, history) = send(&app, empty_request(Method::GET, "/api/v1/chat/session-1/history", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(history["data"].as_array().unwrap().len(), 1);

    let (status, cleared) = send(&app, empty_request(Method::DELETE, "/api/v1/chat/session-1", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cleared["data"]["cleared"], true);

    let (status, _) = send(&app, empty_request(Method::GET, "/api/v1/chat/bad%20id/history", None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_chat_sessions_are_private_to_their_owner() {
    let dir = tempfile::tempdir().unwrap();
    let app = app_with(secured_config(dir.path())).await;
    let (agent, _) = login(&app, "agent").await;
    let (viewer, _) = login(&app, "viewer").await;

    let (status, body) = send(
        &app,
        json_request(
            Method::POST,
            "/api/v1/chat",
            Some(&agent),
            json!({"session_id": "agent-private", "message": "My client Omar wants a villa, call him on 050"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");

    let (status, history) = send(
        &app,
        empty_request(Method::GET, "/api/v1/chat/agent-private/history", Some(&viewer)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(history["data"].as_array().unwrap().is_empty());

    let (status, cleared) = send(&app, empty_request(Method::DELETE, "/api/v1/chat/agent-private", Some(&viewer))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cleared["data"]["cleared"], false);

    let (_, history) = send(
        &app,
        empty_request(Method::GET, "/api/v1/chat/agent-private/history", Some(&agent)),
    )
    .await;
    let turns = history["data"].as_array().unwrap();
    assert_eq!(turns.len(), 1);
    assert!(turns[0]["user"].as_str().unwrap().contains("Omar"));
}

#[tokio::test]
async fn test_model_registry_routes() {
    let dir = tempfile::tempdir().unwrap();
    let app = app_with(common::test_config(dir.path())).await;

    let (status, body) = send(
        &app,
        json_request(
            Method::POST,
            "/api/v1/models",
            None,
            json!({"name": "price-estimator", "version": "1.0.0", "task": "Valuation", "provider": "local"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let id = body["data"]["id"].as_str().unwrap().to_string();

    let (status, body) = send(
        &app,
        empty_request(Method::POST, &format!("/api/v1/models/{}/activate", id), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["active"], true);

    let (_, listed) = send(&app, empty_request(Method::GET, "/api/v1/models?task=valuation", None)).await;
    assert_eq!(listed["data"].as_array().unwrap().len(), 1);

    let (status, _) = send(&app, empty_request(Method::DELETE, &format!("/api/v1/models/{}", id), None)).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(&app, empty_request(Method::GET, &format!("/api/v1/models/{}", id), None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_batch_ingest_job_completes() {
    let dir = tempfile::tempdir().unwrap();
    let app = app_with(common::test_config(dir.path())).await;

    let mut properties = PropertyGenerator::new(99).generate(12);
    for (i, p) in properties.iter_mut().enumerate() {
        p.id = format!("BATCH-{:03}", i);
    }
    properties[3].price = -1.0;

    let (status, body) = send(
        &app,
        json_request(Method::POST, "/api/v1/batch/ingest", None, json!({"properties": properties})),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let job_id = body["data"]["job_id"].as_str().unwrap().to_string();

    let mut job = Value::Null;
    for _ in 0..500 {
        let (_, body) = send(&app, empty_request(Method::GET, &format!("/api/v1/batch/{}", job_id), None)).await;
        job = body["data"].clone();
        if job["finished_at"].is_string() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(job["status"], "completed", "{job}");
    assert_eq!(job["total"], 12);
    assert_eq!(job["succeeded"], 11);
    assert_eq!(job["failed"], 1);

    let (_, jobs) = send(&app, empty_request(Method::GET, "/api/v1/batch", None)).await;
    assert_eq!(jobs["data"].as_array().unwrap().len(), 1);

    let (status, _) = send(&app, empty_request(Method::GET, "/api/v1/batch/unknown", None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
