#![cfg(feature = "http-api")]
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
//! `HttpTokenApi` against a mock HTTP server.

use httpmock::{Method, MockServer};
use imlink::{HttpTokenApi, ImError, TokenApi};
use serde_json::json;

fn api(server: &MockServer) -> HttpTokenApi {
    HttpTokenApi::new(&server.base_url()).unwrap()
}

#[tokio::test]
async fn check_expiry_returns_minutes() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(Method::GET)
            .path("/im/checkWsTokenExpiry")
            .query_param("wsToken", "t0");
        then.status(200)
            .json_body(json!({"code": 200, "data": 8, "message": "ok"}));
    });

    assert_eq!(api(&server).check_expiry("t0").await.unwrap(), 8);
    mock.assert();
}

#[tokio::test]
async fn renew_sends_old_token() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(Method::GET)
            .path("/im/renewWsToken")
            .query_param("oldToken", "a+b/c");
        then.status(200)
            .json_body(json!({"code": 200, "data": "t1", "message": null}));
    });

    assert_eq!(api(&server).renew("a+b/c").await.unwrap(), "t1");
    mock.assert();
}

#[tokio::test]
async fn regenerate_authorizes_with_user_token() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(Method::GET)
            .path("/im/getWsToken")
            .header("Authorization", "user-1");
        then.status(200)
            .json_body(json!({"code": 200, "data": "t2"}));
    });

    assert_eq!(api(&server).regenerate("user-1").await.unwrap(), "t2");
    mock.assert();
}

#[tokio::test]
async fn heartbeat_without_data_is_none() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(Method::GET)
            .path("/im/heartbeat")
            .query_param("wsToken", "t0");
        then.status(200).json_body(json!({"code": 200, "message": "ok"}));
    });

    assert_eq!(api(&server).heartbeat("t0").await.unwrap(), None);
    mock.assert();
}

#[tokio::test]
async fn heartbeat_with_rotated_token() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(Method::GET).path("/im/heartbeat");
        then.status(200)
            .json_body(json!({"code": 200, "data": "t9", "message": "ok"}));
    });

    assert_eq!(
        api(&server).heartbeat("t0").await.unwrap().as_deref(),
        Some("t9")
    );
}

#[tokio::test]
async fn non_success_envelope_is_a_rejection() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(Method::GET).path("/im/renewWsToken");
        then.status(200)
            .json_body(json!({"code": 401, "data": null, "message": "token expired"}));
    });

    let err = api(&server).renew("old").await.unwrap_err();
    assert!(err.is_rejection());
    assert!(matches!(err, ImError::Api { code: 401, ref message } if message == "token expired"));
}

#[tokio::test]
async fn missing_data_is_a_rejection() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(Method::GET).path("/im/checkWsTokenExpiry");
        then.status(200).json_body(json!({"code": 200}));
    });

    let err = api(&server).check_expiry("t0").await.unwrap_err();
    assert!(matches!(err, ImError::MissingData));
    assert!(err.is_rejection());
}

#[tokio::test]
async fn http_error_status_is_not_a_rejection() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(Method::GET).path("/im/renewWsToken");
        then.status(503);
    });

    let err = api(&server).renew("old").await.unwrap_err();
    assert!(matches!(err, ImError::Http(_)));
    assert!(!err.is_rejection());
}

#[tokio::test]
async fn base_path_is_preserved() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(Method::GET).path("/api/im/checkWsTokenExpiry");
        then.status(200).json_body(json!({"code": 200, "data": 30}));
    });

    let api = HttpTokenApi::new(&format!("{}/api", server.base_url())).unwrap();
    assert_eq!(api.check_expiry("t0").await.unwrap(), 30);
    mock.assert();
}
