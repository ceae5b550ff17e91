//! HTTP provider tests against a mock control plane.

use serde_json::json;
use stackform::error::{ProviderError, StackformError};
use stackform::provider::{Attributes, HttpProvider, Provider, RetryPolicy};
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn attrs(value: serde_json::Value) -> Attributes {
    value.as_object().cloned().unwrap_or_default()
}

fn provider(server: &MockServer) -> HttpProvider {
    HttpProvider::new(&server.uri(), "test-token").expect("client")
}

#[tokio::test]
async fn test_check_auth_sends_bearer_token() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/whoami"))
        .and(header("authorization", "Bearer test-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"account": "acct-42"})))
        .expect(1)
        .mount(&server)
        .await;

    let account = provider(&server).check_auth().await.expect("auth");
    assert_eq!(account, "acct-42");
}

#[tokio::test]
async fn test_unauthorized_is_fatal() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/whoami"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({"message": "bad token"})))
        .mount(&server)
        .await;

    let err = provider(&server).check_auth().await.expect_err("401");
    match err {
        StackformError::Provider(ProviderError::Authentication { message }) => {
            assert_eq!(message, "bad token");
        }
        other => panic!("expected authentication error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_create_posts_attributes() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/resources/bucket"))
        .and(body_json(json!({"attributes": {"bucket_name": "docs"}})))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "id": "b-1",
            "attributes": {"bucket_name": "docs", "domain_name": "docs.cdn.test"}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let created = provider(&server)
        .create("bucket", &attrs(json!({"bucket_name": "docs"})))
        .await
        .expect("create");
    assert_eq!(created.id, "b-1");
    assert_eq!(created.attributes["domain_name"], json!("docs.cdn.test"));
}

#[tokio::test]
async fn test_region_header_is_sent_when_configured() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/resources/bucket/b-1"))
        .and(header("x-stackform-region", "eu-west-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"attributes": {}})))
        .expect(1)
        .mount(&server)
        .await;

    let client = provider(&server)
        .with_region(Some(String::from("eu-west-1")));
    assert!(client.read("bucket", "b-1").await.expect("read").is_some());
}

#[tokio::test]
async fn test_read_of_missing_resource_is_none() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/resources/bucket/gone"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let read = provider(&server).read("bucket", "gone").await.expect("read");
    assert!(read.is_none());
}

#[tokio::test]
async fn test_delete_of_missing_resource_is_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/v1/resources/bucket/gone"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let err = provider(&server)
        .delete("bucket", "gone")
        .await
        .expect_err("404");
    assert!(matches!(
        err,
        StackformError::Provider(ProviderError::NotFound { ref kind, ref id }) if kind == "bucket" && id == "gone"
    ));
}

#[tokio::test]
async fn test_rate_limit_carries_retry_after() {
    let server = MockServer::start().await;
    Mock::given(method("PATCH"))
        .and(path("/v1/resources/distribution/d-1"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "7"))
        .mount(&server)
        .await;

    let err = provider(&server)
        .update("distribution", "d-1", &attrs(json!({"enabled": false})))
        .await
        .expect_err("429");
    assert!(err.is_retryable());
    assert!(matches!(
        err,
        StackformError::Provider(ProviderError::RateLimited { retry_after_secs: 7 })
    ));
}

#[tokio::test]
async fn test_conflict_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/resources/bucket"))
        .respond_with(
            ResponseTemplate::new(409).set_body_json(json!({"message": "name already taken"})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = provider(&server);
    let empty = Attributes::new();
    let err = RetryPolicy::immediate(4)
        .run("create bucket.site", || client.create("bucket", &empty))
        .await
        .expect_err("409");
    assert!(!err.is_retryable());
    assert!(err.to_string().contains("name already taken"));
}

#[tokio::test]
async fn test_server_errors_are_retried_until_exhausted() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/v1/resources/bucket/b-1"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .expect(3)
        .mount(&server)
        .await;

    let client = provider(&server);
    let err = RetryPolicy::immediate(3)
        .run("delete bucket.site", || client.delete("bucket", "b-1"))
        .await
        .expect_err("503");
    assert!(matches!(
        err,
        StackformError::Provider(ProviderError::RetriesExhausted { attempts: 3, .. })
    ));
}

#[tokio::test]
async fn test_transient_then_success() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/resources/bucket/b-1"))
        .respond_with(ResponseTemplate::new(502))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/resources/bucket/b-1"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"attributes": {"acl": "private"}})),
        )
        .mount(&server)
        .await;

    let client = provider(&server);
    let read = RetryPolicy::immediate(3)
        .run("refresh bucket.site", || client.read("bucket", "b-1"))
        .await
        .expect("read")
        .expect("exists");
    assert_eq!(read["acl"], json!("private"));
}
