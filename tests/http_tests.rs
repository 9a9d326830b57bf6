//! End-to-end HTTP tests against the assembled router, driven with
//! `tower::ServiceExt::oneshot` rather than a bound socket.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use mcpgw::config::Config;
use mcpgw::http::AppContext;
use tower::ServiceExt;

fn test_context() -> AppContext {
    let mut config = Config::default();
    config.auth_server.external_url = "https://gateway.example.com".to_string();
    config.scopes.config_path = None;
    AppContext::build(config).expect("building a default-config context must not fail")
}

#[tokio::test]
async fn well_known_authorization_server_metadata_advertises_endpoints() {
    let ctx = test_context();
    let app = ctx.router();

    let response = app
        .oneshot(
            Request::builder()
                .uri("/.well-known/oauth-authorization-server")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["issuer"], "https://gateway.example.com");
    assert!(json["token_endpoint"].as_str().unwrap().ends_with("/oauth2/token"));
    assert!(json["grant_types_supported"].as_array().unwrap().contains(&serde_json::json!("client_credentials")));
}

#[tokio::test]
async fn jwks_endpoint_returns_empty_key_set() {
    let ctx = test_context();
    let app = ctx.router();

    let response = app
        .oneshot(Request::builder().uri("/.well-known/jwks.json").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["keys"], serde_json::json!([]));
}

#[tokio::test]
async fn validate_without_credentials_is_unauthorized() {
    let ctx = test_context();
    let app = ctx.router();

    let response = app
        .oneshot(Request::builder().uri("/api/validate").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(response.headers().get("www-authenticate").is_some());
}

#[tokio::test]
async fn search_tools_without_scopes_fails_closed() {
    let ctx = test_context();
    let app = ctx.router();

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/discovery/search/tools")
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&serde_json::json!({"query": "search the web"})).unwrap()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json, serde_json::json!([]));
}

#[tokio::test]
async fn search_semantic_rejects_an_empty_query() {
    let ctx = test_context();
    let app = ctx.router();

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/discovery/search/semantic")
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&serde_json::json!({"query": "", "max_results": 5})).unwrap()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn health_endpoint_is_always_ok() {
    let ctx = test_context();
    let app = ctx.router();

    let response = app.oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap()).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn readiness_endpoint_is_ok_against_the_in_memory_store() {
    let ctx = test_context();
    let app = ctx.router();

    let response = app.oneshot(Request::builder().uri("/healthz/ready").body(Body::empty()).unwrap()).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn authorize_shim_redirects_to_prefixed_login_route() {
    let ctx = test_context();
    let app = ctx.router();

    let response = app
        .oneshot(Request::builder().uri("/authorize?provider=keycloak&client_id=abc").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    let location = response.headers().get("location").unwrap().to_str().unwrap();
    assert!(location.contains("/oauth2/login/keycloak"));
    assert!(location.contains("client_id=abc"));
}

#[tokio::test]
async fn oauth_providers_list_is_empty_with_no_configured_providers() {
    let ctx = test_context();
    let app = ctx.router();

    let response = app
        .oneshot(Request::builder().uri("/api/oauth2/providers").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json, serde_json::json!([]));
}
