//! REST adapter behaviour against a mock Gmail endpoint

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use inbox_triage::client::{
    decode_base64url, normalize_base64url, ClientFactory, GmailClient, RestClientFactory,
    RestGmailClient,
};
use inbox_triage::error::TriageError;
use inbox_triage::rate_limiter::RateLimiter;
use inbox_triage::store::{KvStore, MemoryStore};
use proptest::prelude::*;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client(server: &MockServer) -> RestGmailClient {
    RestGmailClient::new(reqwest::Client::new(), &server.uri(), "test-access-token")
}

#[tokio::test]
async fn test_list_threads_sends_query_and_page_token() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/threads"))
        .and(query_param("q", "in:inbox"))
        .and(query_param("maxResults", "20"))
        .and(query_param("pageToken", "page-2"))
        .and(header("authorization", "Bearer test-access-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "threads": [{"id": "t1"}, {"id": "t2"}],
            "nextPageToken": "page-3"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let page = client(&server)
        .list_threads("in:inbox", 20, Some("page-2".to_string()))
        .await
        .unwrap();

    assert_eq!(page.ids, vec!["t1", "t2"]);
    assert_eq!(page.next_page_token.as_deref(), Some("page-3"));
}

#[tokio::test]
async fn test_empty_listing_has_no_ids() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/threads"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"resultSizeEstimate": 0})))
        .mount(&server)
        .await;

    let page = client(&server).list_threads("in:inbox", 20, None).await.unwrap();
    assert!(page.ids.is_empty());
    assert!(page.next_page_token.is_none());
}

#[tokio::test]
async fn test_get_thread_decodes_messages_in_order() {
    let server = MockServer::start().await;
    let body = URL_SAFE_NO_PAD.encode("Hi, see https://example.com/track?id=1 for details");
    Mock::given(method("GET"))
        .and(path("/threads/t1"))
        .and(query_param("format", "full"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "t1",
            "messages": [
                {
                    "id": "m1",
                    "threadId": "t1",
                    "labelIds": ["INBOX"],
                    "snippet": "first",
                    "payload": {
                        "mimeType": "text/plain",
                        "headers": [{"name": "Subject", "value": "First"}],
                        "body": {"data": body}
                    }
                },
                {
                    "id": "m2",
                    "threadId": "t1",
                    "labelIds": ["INBOX", "UNREAD"],
                    "snippet": "second",
                    "payload": {
                        "mimeType": "multipart/alternative",
                        "headers": [
                            {"name": "From", "value": "Alice <alice@example.com>"},
                            {"name": "Subject", "value": "Re: First"}
                        ],
                        "parts": []
                    }
                }
            ]
        })))
        .mount(&server)
        .await;

    let messages = client(&server).get_thread("t1").await.unwrap();

    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].id, "m1");
    assert_eq!(messages[0].body_text, "Hi, see URL OMITTED for details");
    assert_eq!(messages[1].id, "m2");
    assert_eq!(messages[1].from, "Alice <alice@example.com>");
    assert_eq!(messages[1].body_text, "");
    assert!(messages[1].has_label("UNREAD"));
}

#[tokio::test]
async fn test_unreadable_newest_message_fails_thread() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/threads/t1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "t1",
            "messages": [
                {
                    "id": "old",
                    "threadId": "t1",
                    "payload": {
                        "mimeType": "text/plain",
                        "headers": [{"name": "Subject", "value": "Older"}]
                    }
                },
                {"id": "new", "threadId": "t1", "payload": {}}
            ]
        })))
        .mount(&server)
        .await;

    let error = client(&server).get_thread("t1").await.unwrap_err();
    assert!(matches!(error, TriageError::InvalidMessageFormat(_)));
}

#[tokio::test]
async fn test_unreadable_older_message_is_dropped() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/threads/t1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "t1",
            "messages": [
                {"id": "old", "threadId": "t1", "payload": {}},
                {
                    "id": "new",
                    "threadId": "t1",
                    "payload": {
                        "mimeType": "text/plain",
                        "headers": [{"name": "Subject", "value": "Newer"}]
                    }
                }
            ]
        })))
        .mount(&server)
        .await;

    let messages = client(&server).get_thread("t1").await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id, "new");
}

#[tokio::test]
async fn test_429_is_rate_limited_with_retry_after() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/profile"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("Retry-After", "17")
                .set_body_string("Too Many Requests"),
        )
        .mount(&server)
        .await;

    let error = client(&server).get_profile().await.unwrap_err();
    assert!(matches!(error, TriageError::RateLimited { retry_after: 17 }));
}

#[tokio::test]
async fn test_403_distinguishes_quota_from_permission() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/labels"))
        .respond_with(ResponseTemplate::new(403).set_body_json(json!({
            "error": {"code": 403, "message": "Insufficient Permission"}
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/profile"))
        .respond_with(ResponseTemplate::new(403).set_body_json(json!({
            "error": {"code": 403, "errors": [{"reason": "userRateLimitExceeded"}]}
        })))
        .mount(&server)
        .await;

    let gmail = client(&server);
    assert!(matches!(gmail.list_labels().await, Err(TriageError::Forbidden(_))));
    assert!(matches!(gmail.get_profile().await, Err(TriageError::RateLimited { .. })));
}

#[tokio::test]
async fn test_modify_sends_both_label_lists_in_one_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/messages/m1/modify"))
        .and(body_json(json!({
            "addLabelIds": ["Label_2"],
            "removeLabelIds": ["Label_1"]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "m1"})))
        .expect(1)
        .mount(&server)
        .await;

    client(&server)
        .modify_message("m1", &["Label_2".to_string()], &["Label_1".to_string()])
        .await
        .unwrap();
}

#[tokio::test]
async fn test_create_label_returns_new_id() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/labels"))
        .and(body_json(json!({
            "name": "To Reply",
            "labelListVisibility": "labelShow",
            "messageListVisibility": "show"
        })))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"id": "Label_9", "name": "To Reply"})),
        )
        .mount(&server)
        .await;

    let id = client(&server).create_label("To Reply").await.unwrap();
    assert_eq!(id, "Label_9");
}

#[tokio::test]
async fn test_server_error_is_transient() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/messages/m1"))
        .respond_with(ResponseTemplate::new(503).set_body_string("Backend Error"))
        .mount(&server)
        .await;

    let error = client(&server).get_message("m1").await.unwrap_err();
    assert!(matches!(error, TriageError::Transient { status: 503, .. }));
    assert!(error.is_retryable());
}

#[tokio::test]
async fn test_unmetered_client_skips_mailbox_budget() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/profile"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"emailAddress": "new@example.com"})),
        )
        .mount(&server)
        .await;

    let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
    let limiter = RateLimiter::with_config(store.clone(), Duration::from_secs(3600), 1);
    let factory =
        RestClientFactory::new(&server.uri(), Duration::from_secs(5), limiter.clone()).unwrap();

    for _ in 0..3 {
        let email = factory.connect_unmetered("token").get_profile().await.unwrap();
        assert_eq!(email, "new@example.com");
    }
    assert!(store.keys_with_prefix("ratelimit:").await.unwrap().is_empty());

    let metered = factory.connect("new@example.com", "token");
    metered.get_profile().await.unwrap();
    assert!(matches!(
        metered.get_profile().await,
        Err(TriageError::RateLimited { .. })
    ));
}

proptest! {
    #[test]
    fn prop_unpadded_base64url_decodes(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
        let encoded = URL_SAFE_NO_PAD.encode(&bytes);
        prop_assert_eq!(normalize_base64url(&encoded).len() % 4, 0);
        prop_assert_eq!(decode_base64url(&encoded).unwrap(), bytes);
    }
}
