//! End-to-end tests against a live demo server.
//!
//! The router from `build_router` is served on an ephemeral port and
//! exercised over real HTTP with `reqwest`, covering the wiring the
//! in-process tests cannot see: listener setup, host middleware (request
//! id), and actual header transmission.
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::time::Duration;

use reqwest::Client;
use serde_json::{Value, json};
use tokio::net::TcpListener;

use turnpike::{Config, build_router};

/// Test fixture serving the demo router on an ephemeral port.
struct TestServer {
    base_url: String,
    client: Client,
}

impl TestServer {
    async fn start(config: Config) -> anyhow::Result<Self> {
        let (router, _store) = build_router(&config);

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });

        // The listener is bound before serve is spawned, so requests queue
        // rather than fail; no readiness polling needed
        Ok(Self {
            base_url: format!("http://{addr}"),
            client: Client::builder().timeout(Duration::from_secs(5)).build()?,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

fn test_config() -> Config {
    let mut config = Config::default();
    config
        .api_tokens
        .insert("tok-admin".to_string(), "admin-1".to_string());
    config
        .api_tokens
        .insert("tok-user".to_string(), "user-1".to_string());
    config.admin_user_ids = vec!["admin-1".to_string()];
    config
}

#[tokio::test]
async fn health_endpoint_is_open() -> anyhow::Result<()> {
    let server = TestServer::start(test_config()).await?;

    let response = server.client.get(server.url("/health")).send().await?;

    assert_eq!(response.status(), 200);
    let body: Value = response.json().await?;
    assert_eq!(body["status"], "healthy");
    Ok(())
}

#[tokio::test]
async fn listing_is_public_and_carries_pipeline_headers() -> anyhow::Result<()> {
    let server = TestServer::start(test_config()).await?;

    let response = server
        .client
        .get(server.url("/items?limit=7"))
        .header("origin", "http://localhost:5173")
        .send()
        .await?;

    assert_eq!(response.status(), 200);
    // Host middleware
    assert!(response.headers().contains_key("x-request-id"));
    // Pipeline CORS + hardening
    assert_eq!(
        response.headers()["access-control-allow-origin"],
        "http://localhost:5173"
    );
    assert_eq!(response.headers()["x-content-type-options"], "nosniff");
    // Rate-limit observability
    assert!(response.headers().contains_key("x-ratelimit-remaining"));

    let body: Value = response.json().await?;
    assert_eq!(body["limit"], 7);
    Ok(())
}

#[tokio::test]
async fn create_requires_bearer_token() -> anyhow::Result<()> {
    let server = TestServer::start(test_config()).await?;

    let response = server
        .client
        .post(server.url("/items"))
        .json(&json!({"name": "deploy"}))
        .send()
        .await?;
    assert_eq!(response.status(), 401);

    let response = server
        .client
        .post(server.url("/items"))
        .bearer_auth("tok-user")
        .json(&json!({"name": "deploy", "priority": 2}))
        .send()
        .await?;
    assert_eq!(response.status(), 201);

    let body: Value = response.json().await?;
    assert_eq!(body["created_by"], "user-1");
    assert_eq!(body["item"]["name"], "deploy");
    Ok(())
}

#[tokio::test]
async fn invalid_body_and_query_fail_in_one_round_trip() -> anyhow::Result<()> {
    let server = TestServer::start(test_config()).await?;

    let response = server
        .client
        .post(server.url("/items?limit=abc"))
        .bearer_auth("tok-user")
        .json(&json!({"name": ""}))
        .send()
        .await?;

    assert_eq!(response.status(), 400);
    let body: Value = response.json().await?;
    assert_eq!(body["error"], "Validation failed");
    assert_eq!(body["details"].as_array().unwrap().len(), 2);
    Ok(())
}

#[tokio::test]
async fn admin_route_enforces_allow_list() -> anyhow::Result<()> {
    let server = TestServer::start(test_config()).await?;

    let response = server
        .client
        .get(server.url("/admin/stats"))
        .bearer_auth("tok-user")
        .send()
        .await?;
    assert_eq!(response.status(), 403);

    let response = server
        .client
        .get(server.url("/admin/stats"))
        .bearer_auth("tok-admin")
        .send()
        .await?;
    assert_eq!(response.status(), 200);

    let body: Value = response.json().await?;
    assert_eq!(body["admin"], "admin-1");
    Ok(())
}

#[tokio::test]
async fn preflight_is_answered_without_auth() -> anyhow::Result<()> {
    let server = TestServer::start(test_config()).await?;

    let response = server
        .client
        .request(reqwest::Method::OPTIONS, server.url("/items"))
        .header("origin", "http://localhost:5173")
        .header("access-control-request-method", "POST")
        .send()
        .await?;

    assert_eq!(response.status(), 204);
    assert_eq!(response.headers()["access-control-allow-methods"], "POST");
    Ok(())
}
