use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use voicewire::{CredentialBroker, CredentialError, CredentialSource};

fn broker_for(urls: Vec<Url>) -> CredentialBroker {
    CredentialBroker::new(reqwest::Client::new(), urls)
}

fn session_url(server: &MockServer) -> Url {
    Url::parse(&format!("{}/session", server.uri())).unwrap()
}

#[tokio::test]
async fn acquire_returns_credential_on_success() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/session"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": "sess_1",
            "client_secret": { "value": "ek_test", "expires_at": 1_735_689_600 }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let broker = broker_for(vec![session_url(&server)]);
    let credential = broker.acquire().await.unwrap();
    assert_eq!(credential.secret(), "ek_test");
    assert_eq!(credential.expires_at(), Some(1_735_689_600));
}

#[tokio::test]
async fn non_success_status_is_broker_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/session"))
        .respond_with(ResponseTemplate::new(500).set_body_string("key not configured"))
        .mount(&server)
        .await;

    let broker = broker_for(vec![session_url(&server)]);
    let err = broker.acquire().await.unwrap_err();
    match err {
        CredentialError::BrokerRejected { status, detail } => {
            assert_eq!(status, 500);
            assert!(detail.contains("key not configured"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn missing_secret_value_is_malformed_response() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/session"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": "sess_1",
            "client_secret": { "expires_at": 1 }
        })))
        .mount(&server)
        .await;

    let broker = broker_for(vec![session_url(&server)]);
    let err = broker.acquire().await.unwrap_err();
    assert!(matches!(err, CredentialError::MalformedResponse(_)));
}

#[tokio::test]
async fn non_json_body_is_malformed_response() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/session"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>login</html>"))
        .mount(&server)
        .await;

    let broker = broker_for(vec![session_url(&server)]);
    let err = broker.acquire().await.unwrap_err();
    assert!(matches!(err, CredentialError::MalformedResponse(_)));
}

#[tokio::test]
async fn unreachable_endpoint_falls_through_to_next_candidate() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/session"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "client_secret": { "value": "ek_fallback" }
        })))
        .expect(1)
        .mount(&server)
        .await;

    // Port 9 on localhost refuses connections.
    let dead = Url::parse("http://127.0.0.1:9/session").unwrap();
    let broker = broker_for(vec![dead, session_url(&server)]);
    let credential = broker.acquire().await.unwrap();
    assert_eq!(credential.secret(), "ek_fallback");
}

#[tokio::test]
async fn rejection_does_not_fall_through() {
    let rejecting = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/session"))
        .respond_with(ResponseTemplate::new(403).set_body_string("nope"))
        .mount(&rejecting)
        .await;

    let fallback = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/session"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "client_secret": { "value": "ek_never" }
        })))
        .expect(0)
        .mount(&fallback)
        .await;

    let broker = broker_for(vec![session_url(&rejecting), session_url(&fallback)]);
    let err = broker.acquire().await.unwrap_err();
    assert!(matches!(err, CredentialError::BrokerRejected { status: 403, .. }));
}

#[tokio::test]
async fn all_endpoints_unreachable_reports_unreachable() {
    let broker = broker_for(vec![
        Url::parse("http://127.0.0.1:9/session").unwrap(),
        Url::parse("http://127.0.0.1:10/session").unwrap(),
    ]);
    let err = broker.acquire().await.unwrap_err();
    assert!(matches!(err, CredentialError::Unreachable(_)));
}

#[tokio::test]
async fn no_endpoints_configured_reports_unreachable() {
    let broker = broker_for(Vec::new());
    let err = broker.acquire().await.unwrap_err();
    assert!(matches!(err, CredentialError::Unreachable(_)));
}
