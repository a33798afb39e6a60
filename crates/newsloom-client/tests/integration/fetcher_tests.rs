use std::time::Duration;

use newsloom_core::error::AppError;
use newsloom_core::traits::{FetchRequest, Fetcher};
use serde_json::json;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::integration::common::fetcher;

#[tokio::test]
async fn get_sends_headers_and_query() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/everything"))
        .and(query_param("q", "machine learning"))
        .and(header("X-Api-Key", "secret"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .expect(1)
        .mount(&server)
        .await;

    let request = FetchRequest::get(format!("{}/v2/everything", server.uri()))
        .with_query("q", "machine learning")
        .with_header("X-Api-Key", "secret");
    let body = fetcher().fetch(&request).await.unwrap();
    assert_eq!(body, "ok");
}

#[tokio::test]
async fn post_sends_json_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/search"))
        .and(body_json(json!({"q": "ai"})))
        .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
        .expect(1)
        .mount(&server)
        .await;

    let request = FetchRequest::post(format!("{}/search", server.uri()), json!({"q": "ai"}));
    assert_eq!(fetcher().fetch(&request).await.unwrap(), "[]");
}

#[tokio::test]
async fn statuses_map_onto_taxonomy() {
    let server = MockServer::start().await;
    for (route, status) in [("/limited", 429), ("/auth", 401), ("/missing", 404), ("/broken", 502)] {
        let mut template = ResponseTemplate::new(status);
        if status == 429 {
            template = template.insert_header("Retry-After", "7");
        }
        Mock::given(path(route)).respond_with(template).mount(&server).await;
    }
    let get = |route: &str| FetchRequest::get(format!("{}{route}", server.uri()));
    let fetcher = fetcher();

    let limited = fetcher.fetch(&get("/limited")).await.unwrap_err();
    assert!(limited.is_retryable());
    assert_eq!(limited.retry_after(), Some(Duration::from_secs(7)));

    let auth = fetcher.fetch(&get("/auth")).await.unwrap_err();
    assert!(matches!(auth, AppError::AuthError(_)));

    let missing = fetcher.fetch(&get("/missing")).await.unwrap_err();
    assert!(matches!(missing, AppError::ClientError { status: 404, .. }));
    assert!(!missing.is_retryable());

    let broken = fetcher.fetch(&get("/broken")).await.unwrap_err();
    assert!(matches!(broken, AppError::ServerError { status: 502, .. }));
    assert!(broken.is_retryable());
}

#[tokio::test]
async fn slow_response_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;

    let request = FetchRequest::get(server.uri()).with_timeout(Duration::from_millis(100));
    let err = fetcher().fetch(&request).await.unwrap_err();
    assert!(matches!(err, AppError::Timeout(d) if d == Duration::from_millis(100)));
}

#[tokio::test]
async fn private_addresses_blocked_unless_allowed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(&server)
        .await;

    let guarded = newsloom_client::ReqwestFetcher::new().unwrap();
    let err = guarded
        .fetch(&FetchRequest::get(server.uri()))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Config(_)));
}
