//! HTTP authenticator tests against a mock credentials endpoint

use courier_mqtt::auth::{AuthError, Authenticator, HttpAuthenticator, HttpAuthenticatorConfig};
use serde_json::json;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config_for(server: &MockServer, token_env: Option<&str>) -> HttpAuthenticatorConfig {
    HttpAuthenticatorConfig {
        endpoint: format!("{}/credentials", server.uri()),
        token_env: token_env.map(String::from),
        request_timeout_secs: 5,
    }
}

fn credentials() -> serde_json::Value {
    json!({
        "host": "broker.example",
        "port": 8883,
        "username": "device",
        "password": "s3cret",
        "keep_alive_secs": 45,
        "user_properties": {"region": "eu"}
    })
}

#[tokio::test]
async fn test_fetches_and_maps_credentials() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/credentials"))
        .and(query_param("client_id", "device-9"))
        .respond_with(ResponseTemplate::new(200).set_body_json(credentials()))
        .expect(1)
        .mount(&server)
        .await;

    let auth = HttpAuthenticator::new("device-9", &config_for(&server, None)).unwrap();
    let options = auth.get_connect_options().await.unwrap();

    assert_eq!(options.host, "broker.example");
    assert_eq!(options.port, 8883);
    assert_eq!(options.client_id, "device-9");
    assert_eq!(options.username, "device");
    assert_eq!(options.keep_alive_secs, 45);
    assert_eq!(
        options.user_properties.unwrap().get("region"),
        Some(&"eu".to_string())
    );
}

#[tokio::test]
async fn test_response_is_cached_until_cleared() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/credentials"))
        .respond_with(ResponseTemplate::new(200).set_body_json(credentials()))
        .expect(2)
        .mount(&server)
        .await;

    let auth = HttpAuthenticator::new("device-9", &config_for(&server, None)).unwrap();
    auth.get_connect_options().await.unwrap();
    auth.get_connect_options().await.unwrap();
    auth.clear_cached_auth_response();
    auth.get_connect_options().await.unwrap();
}

#[tokio::test]
async fn test_bearer_token_is_sent_from_environment() {
    std::env::set_var("COURIER_TEST_AUTH_TOKEN", "tok-123");
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(header("authorization", "Bearer tok-123"))
        .respond_with(ResponseTemplate::new(200).set_body_json(credentials()))
        .expect(1)
        .mount(&server)
        .await;

    let auth = HttpAuthenticator::new(
        "device-9",
        &config_for(&server, Some("COURIER_TEST_AUTH_TOKEN")),
    )
    .unwrap();

    assert!(auth.get_connect_options().await.is_ok());
}

#[tokio::test]
async fn test_http_error_status_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance, token=abc"))
        .mount(&server)
        .await;

    let auth = HttpAuthenticator::new("device-9", &config_for(&server, None)).unwrap();
    let error = auth.get_connect_options().await.unwrap_err();

    match error {
        AuthError::Http { status, message } => {
            assert_eq!(status, 503);
            assert!(!message.contains("abc"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_malformed_body_is_invalid_response() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"unexpected": true})))
        .mount(&server)
        .await;

    let auth = HttpAuthenticator::new("device-9", &config_for(&server, None)).unwrap();

    assert!(matches!(
        auth.get_connect_options().await,
        Err(AuthError::InvalidResponse(_))
    ));
}

#[tokio::test]
async fn test_unreachable_endpoint_is_network_unavailable() {
    let config = HttpAuthenticatorConfig {
        endpoint: "http://127.0.0.1:9/credentials".to_string(),
        token_env: None,
        request_timeout_secs: 2,
    };
    let auth = HttpAuthenticator::new("device-9", &config).unwrap();

    let error = auth.get_connect_options().await.unwrap_err();
    assert!(error.is_network_unavailable());
}
