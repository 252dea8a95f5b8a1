//! End-to-end ACME exchanges against the router

mod common;

use axum::http::{Method, StatusCode};
use common::{csr_for, fresh_nonce, send, test_server, TestClient, BASE_URL};
use serde_json::json;

const MALFORMED: &str = "urn:ietf:params:acme:error:malformed";

#[tokio::test]
async fn test_directory_and_nonces() {
    let server = test_server().await;

    let response = send(
        &server.app,
        Method::GET,
        &format!("{}/acme/profiles/default/directory", BASE_URL),
        None,
    )
    .await;
    assert_eq!(response.status, StatusCode::OK);
    let directory = response.json();
    assert_eq!(
        directory["newAccount"],
        "https://acme.test/acme/profiles/default/new-account"
    );
    assert_eq!(directory["meta"]["externalAccountRequired"], false);
    assert_eq!(directory["meta"]["termsOfService"], "https://acme.test/terms");
    assert!(response.header("replay-nonce").is_some());

    // Bare profile URL serves the same directory
    let bare = send(
        &server.app,
        Method::GET,
        &format!("{}/acme/profiles/default", BASE_URL),
        None,
    )
    .await;
    assert_eq!(bare.json()["newOrder"], directory["newOrder"]);

    let url = format!("{}/acme/profiles/default/new-nonce", BASE_URL);
    let head = send(&server.app, Method::HEAD, &url, None).await;
    assert_eq!(head.status, StatusCode::OK);
    assert_eq!(head.header("cache-control").as_deref(), Some("no-store"));
    let get = send(&server.app, Method::GET, &url, None).await;
    assert_eq!(get.status, StatusCode::NO_CONTENT);
    assert_ne!(head.header("replay-nonce"), get.header("replay-nonce"));
    assert!(get
        .header("link")
        .unwrap()
        .contains("/acme/profiles/default/directory>;rel=\"index\""));
}

#[tokio::test]
async fn test_unknown_profile_is_not_found() {
    let server = test_server().await;
    let response = send(
        &server.app,
        Method::GET,
        &format!("{}/acme/profiles/nope/directory", BASE_URL),
        None,
    )
    .await;
    assert_eq!(response.status, StatusCode::NOT_FOUND);
    assert_eq!(response.content_type(), "application/problem+json");
}

#[tokio::test]
async fn test_new_account_then_only_return_existing() {
    let server = test_server().await;
    let mut client = TestClient::new("default");

    let created = client.register(&server.app).await;
    assert_eq!(created.status, StatusCode::CREATED);
    let location = created.location();
    assert!(location.starts_with("https://acme.test/acme/profiles/default/accounts/"));
    let body = created.json();
    assert_eq!(body["status"], "valid");
    assert_eq!(body["contact"][0], "mailto:a@example.com");

    // Existing-account lookup signs with the JWK again
    client.kid = None;
    let url = client.profile_url("new-account");
    let existing = client
        .post(&server.app, &url, Some(&json!({"onlyReturnExisting": true})))
        .await;
    assert_eq!(existing.status, StatusCode::OK);
    assert_eq!(existing.location(), location);
}

#[tokio::test]
async fn test_nonce_is_single_use() {
    let server = test_server().await;
    let client = TestClient::new("default");
    let url = client.profile_url("new-account");
    let nonce = fresh_nonce(&server.app, "default").await;

    let first = send(
        &server.app,
        Method::POST,
        &url,
        Some(client.sign(&url, &nonce, Some(&json!({})))),
    )
    .await;
    assert_eq!(first.status, StatusCode::CREATED);

    let replay = send(
        &server.app,
        Method::POST,
        &url,
        Some(client.sign(&url, &nonce, Some(&json!({})))),
    )
    .await;
    assert_eq!(replay.status, StatusCode::BAD_REQUEST);
    assert_eq!(replay.json()["type"], "urn:ietf:params:acme:error:badNonce");
    assert!(replay.header("replay-nonce").is_some());
}

#[tokio::test]
async fn test_url_mismatch_is_malformed() {
    let server = test_server().await;
    let client = TestClient::new("default");
    let nonce = fresh_nonce(&server.app, "default").await;
    let signed = client.sign(
        "https://acme.test/acme/profiles/default/new-order",
        &nonce,
        Some(&json!({})),
    );

    let response = send(&server.app, Method::POST, &client.profile_url("new-account"), Some(signed)).await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.json()["type"], MALFORMED);
}

#[tokio::test]
async fn test_wrong_content_type_is_malformed() {
    let server = test_server().await;
    let client = TestClient::new("default");
    let url = client.profile_url("new-account");
    let nonce = fresh_nonce(&server.app, "default").await;

    let request = axum::http::Request::builder()
        .method(Method::POST)
        .uri("/acme/profiles/default/new-account")
        .header("content-type", "application/json")
        .body(axum::body::Body::from(client.sign(&url, &nonce, Some(&json!({})))))
        .unwrap();
    let response = tower::ServiceExt::oneshot(server.app.clone(), request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_new_order_exposes_two_pending_challenges() {
    let server = test_server().await;
    let mut client = TestClient::new("default");
    client.register(&server.app).await;

    let response = client
        .post(
            &server.app,
            &client.profile_url("new-order"),
            Some(&json!({"identifiers": [{"type": "dns", "value": "example.com"}]})),
        )
        .await;
    assert_eq!(response.status, StatusCode::CREATED);
    assert!(response.location().contains("/orders/"));
    let order = response.json();
    assert_eq!(order["status"], "pending");
    assert_eq!(order["identifiers"], json!([{"type": "dns", "value": "example.com"}]));
    assert!(order["finalize"].as_str().unwrap().ends_with("/finalize"));

    let authz_url = order["authorizations"][0].as_str().unwrap().to_string();
    let authz = client.post(&server.app, &authz_url, None).await;
    assert_eq!(authz.status, StatusCode::OK);
    let authz = authz.json();
    assert_eq!(authz["status"], "pending");
    assert_eq!(authz["identifier"]["value"], "example.com");

    let challenges = authz["challenges"].as_array().unwrap();
    assert_eq!(challenges.len(), 2);
    assert_eq!(challenges[0]["type"], "http-01");
    assert_eq!(challenges[1]["type"], "dns-01");
    for challenge in challenges {
        assert_eq!(challenge["status"], "pending");
        assert!(!challenge["token"].as_str().unwrap().is_empty());
    }

    let orders = client
        .post(
            &server.app,
            &format!("{}/orders", client.kid.clone().unwrap()),
            None,
        )
        .await;
    assert_eq!(orders.json()["orders"][0], response.location());
}

#[tokio::test]
async fn test_rejected_identifier_subproblems() {
    let server = test_server().await;
    let mut client = TestClient::new("default");
    client.register(&server.app).await;

    let response = client
        .post(
            &server.app,
            &client.profile_url("new-order"),
            Some(&json!({"identifiers": [
                {"type": "dns", "value": "*.example.com"},
                {"type": "dns", "value": "ok.example.com"}
            ]})),
        )
        .await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    let problem = response.json();
    assert_eq!(problem["type"], "urn:ietf:params:acme:error:rejectedIdentifier");
    assert_eq!(problem["subproblems"][0]["identifier"]["value"], "*.example.com");
}

#[tokio::test]
async fn test_private_address_challenge_is_refused() {
    let server = test_server().await;
    let mut client = TestClient::new("default");
    client.register(&server.app).await;

    let order = client
        .post(
            &server.app,
            &client.profile_url("new-order"),
            Some(&json!({"identifiers": [{"type": "dns", "value": "10.0.0.5"}]})),
        )
        .await
        .json();
    let authz_url = order["authorizations"][0].as_str().unwrap().to_string();
    let authz = client.post(&server.app, &authz_url, None).await.json();
    let challenge_url = authz["challenges"][0]["url"].as_str().unwrap().to_string();

    let response = client
        .post(&server.app, &challenge_url, Some(&json!({})))
        .await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.json()["type"], MALFORMED);

    let challenge = client.post(&server.app, &challenge_url, None).await;
    assert_eq!(challenge.json()["status"], "pending");
    assert!(challenge
        .header("link")
        .unwrap()
        .contains(&format!("<{}>;rel=\"up\"", authz_url)));
}

#[tokio::test]
async fn test_finalize_rejects_unauthorized_name_then_issues() {
    let server = test_server().await;
    let mut client = TestClient::new("fast");
    client.register(&server.app).await;

    let created = client
        .post(
            &server.app,
            &client.profile_url("new-order"),
            Some(&json!({"identifiers": [{"type": "dns", "value": "example.com"}]})),
        )
        .await;
    let order_url = created.location();
    let order = created.json();
    assert_eq!(order["status"], "ready");
    let finalize_url = order["finalize"].as_str().unwrap().to_string();

    let rejected = client
        .post(
            &server.app,
            &finalize_url,
            Some(&json!({"csr": csr_for(&["example.com", "evil.com"])})),
        )
        .await;
    assert_eq!(rejected.status, StatusCode::BAD_REQUEST);
    assert_eq!(rejected.json()["type"], "urn:ietf:params:acme:error:badCSR");

    let still_ready = client.post(&server.app, &order_url, None).await.json();
    assert_eq!(still_ready["status"], "ready");

    let finalized = client
        .post(
            &server.app,
            &finalize_url,
            Some(&json!({"csr": csr_for(&["example.com"])})),
        )
        .await;
    assert_eq!(finalized.status, StatusCode::OK);
    assert_eq!(finalized.location(), order_url);
    let finalized = finalized.json();
    assert_eq!(finalized["status"], "valid");

    let certificate_url = finalized["certificate"].as_str().unwrap().to_string();
    let download = client.post(&server.app, &certificate_url, None).await;
    assert_eq!(download.status, StatusCode::OK);
    assert_eq!(download.content_type(), "application/pem-certificate-chain");
    let chain = String::from_utf8(download.body.clone()).unwrap();
    assert!(chain.starts_with("-----BEGIN CERTIFICATE-----\r\n"));
    assert_eq!(chain.matches("BEGIN CERTIFICATE").count(), 2);
}

#[tokio::test]
async fn test_missing_and_foreign_orders() {
    let server = test_server().await;
    let mut owner = TestClient::new("default");
    owner.register(&server.app).await;
    let mut other = TestClient::new("default");
    other.register(&server.app).await;

    let order_url = owner
        .post(
            &server.app,
            &owner.profile_url("new-order"),
            Some(&json!({"identifiers": [{"type": "dns", "value": "mine.example.com"}]})),
        )
        .await
        .location();

    let foreign = other.post(&server.app, &order_url, None).await;
    assert_eq!(foreign.status, StatusCode::FORBIDDEN);
    assert_eq!(foreign.json()["type"], "urn:ietf:params:acme:error:unauthorized");

    let missing = owner
        .post(&server.app, &owner.profile_url("orders/does-not-exist"), None)
        .await;
    assert_eq!(missing.status, StatusCode::NOT_FOUND);
    assert_eq!(missing.json()["type"], MALFORMED);
}

#[tokio::test]
async fn test_account_deactivation() {
    let server = test_server().await;
    let mut client = TestClient::new("default");
    client.register(&server.app).await;
    let account_url = client.kid.clone().unwrap();

    let updated = client
        .post(
            &server.app,
            &account_url,
            Some(&json!({"contact": ["mailto:b@example.com"]})),
        )
        .await;
    assert_eq!(updated.status, StatusCode::OK);
    assert_eq!(updated.json()["contact"][0], "mailto:b@example.com");

    let deactivated = client
        .post(&server.app, &account_url, Some(&json!({"status": "deactivated"})))
        .await;
    assert_eq!(deactivated.json()["status"], "deactivated");

    let after = client.post(&server.app, &account_url, None).await;
    assert_eq!(after.status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_openapi_document_served() {
    let server = test_server().await;
    let response = send(
        &server.app,
        Method::GET,
        &format!("{}/acme/openapi.json", BASE_URL),
        None,
    )
    .await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.json()["info"]["title"], "PKI ACME API");
}
