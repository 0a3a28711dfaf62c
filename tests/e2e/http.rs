//! The HTTP surface, driven through the router and over a real socket.

use super::harness::{API_KEY, CAPABILITY, EVM_NETWORK, GROUP, RESOURCE};
use super::TestHarness;
use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use axum::response::Response;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rolegate::api::{PAYMENT_HEADER, PAYMENT_RESPONSE_HEADER};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::net::TcpListener;
use tower::ServiceExt;

fn post(uri: &str, body: &Value, proof: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(proof) = proof {
        builder = builder.header(PAYMENT_HEADER, proof);
    }
    builder
        .body(Body::from(body.to_string()))
        .expect("request")
}

fn get(uri: &str, authorized: bool) -> Request<Body> {
    let mut builder = Request::builder().uri(uri);
    if authorized {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {API_KEY}"));
    }
    builder.body(Body::empty()).expect("request")
}

async fn body_json(response: Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json")
}

fn access_body(subject: &str, duration: u64) -> Value {
    json!({
        "discordId": subject,
        "networkId": EVM_NETWORK,
        "serverId": GROUP,
        "channelId": RESOURCE,
        "roleApplicableTime": duration,
    })
}

#[tokio::test]
async fn test_paid_access_over_http() {
    let harness = TestHarness::setup().await.expect("setup");
    let app = harness.gate.router();

    // Provisioning goes through the administrative route.
    let response = app
        .clone()
        .oneshot(get("/api/user/alice", true))
        .await
        .expect("call");
    assert_eq!(response.status(), StatusCode::OK);
    let accounts = body_json(response).await;
    assert_eq!(accounts["accounts"][0]["balance"], "2000000");

    let response = app
        .clone()
        .oneshot(post("/api/user/access", &access_body("alice", 43_200), None))
        .await
        .expect("call");
    assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
    let challenge = body_json(response).await;
    assert_eq!(challenge["x402Version"], 1);
    let accepts = challenge["accepts"].as_array().expect("accepts");
    assert_eq!(accepts.len(), 1);
    assert_eq!(accepts[0]["scheme"], "exact");
    assert_eq!(accepts[0]["maxAmountRequired"], "500000");
    assert_eq!(
        accepts[0]["payTo"],
        "0x209693Bc6afc0C5328bA36FaF03C514EF312287C"
    );
    assert_eq!(
        accepts[0]["resource"],
        "http://localhost:3000/api/user/access"
    );

    let proof = harness.proof(EVM_NETWORK);
    let response = app
        .oneshot(post(
            "/api/user/access",
            &access_body("alice", 43_200),
            Some(&proof),
        ))
        .await
        .expect("call");
    assert_eq!(response.status(), StatusCode::OK);
    let receipt = response
        .headers()
        .get(PAYMENT_RESPONSE_HEADER)
        .expect("receipt header")
        .to_str()
        .expect("ascii")
        .to_string();
    let receipt: Value =
        serde_json::from_slice(&STANDARD.decode(receipt).expect("base64")).expect("json");
    assert_eq!(receipt["success"], true);
    assert_eq!(receipt["transaction"], "0xsettled");
    assert_eq!(receipt["payer"], "0xpayer");

    let body = body_json(response).await;
    assert_eq!(body["success"], true);
    assert!(body["expiresAt"].is_string());
    assert!(harness.authority.holds("alice", CAPABILITY));
}

#[tokio::test]
async fn test_rejection_reports_payer() {
    let harness = TestHarness::setup().await.expect("setup");
    harness.provision("alice", EVM_NETWORK).await.expect("provision");
    harness.facilitator.reject_with(Some("invalid_signature"));

    let proof = harness.proof(EVM_NETWORK);
    let response = harness
        .gate
        .router()
        .oneshot(post(
            "/api/user/access",
            &access_body("alice", 43_200),
            Some(&proof),
        ))
        .await
        .expect("call");
    assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
    let body = body_json(response).await;
    assert!(body["error"]
        .as_str()
        .expect("error")
        .contains("invalid_signature"));
    assert_eq!(body["payer"], "0xpayer");
    assert_eq!(body["accepts"].as_array().expect("accepts").len(), 1);
}

#[tokio::test]
async fn test_error_statuses() {
    let harness = TestHarness::setup().await.expect("setup");
    let app = harness.gate.router();

    let cases = [
        (access_body("alice", 3_600), StatusCode::BAD_REQUEST),
        (access_body("alice", 43_200), StatusCode::NOT_FOUND),
        (json!({ "subject": "alice" }), StatusCode::BAD_REQUEST),
    ];
    for (body, status) in cases {
        let response = app
            .clone()
            .oneshot(post("/api/user/access", &body, None))
            .await
            .expect("call");
        assert_eq!(response.status(), status, "{body}");
        assert_eq!(body_json(response).await["success"], false);
    }

    harness.provision("alice", EVM_NETWORK).await.expect("provision");
    harness.evm.set_balance(Some(10));
    let response = app
        .oneshot(post("/api/user/access", &access_body("alice", 43_200), None))
        .await
        .expect("call");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        body_json(response).await["kind"],
        "insufficient_balance"
    );
}

#[tokio::test]
async fn test_invoice_over_http() {
    let harness = TestHarness::setup().await.expect("setup");
    let app = harness.gate.router();

    let response = app
        .clone()
        .oneshot(post(
            "/api/user/invoice",
            &json!({
                "subject": "bob",
                "group": GROUP,
                "resource": RESOURCE,
                "duration": 43_200,
            }),
            None,
        ))
        .await
        .expect("call");
    assert_eq!(response.status(), StatusCode::OK);
    let token = body_json(response).await["token"]
        .as_str()
        .expect("token")
        .to_string();

    let response = app
        .clone()
        .oneshot(get(&format!("/api/user/invoice/{token}"), false))
        .await
        .expect("call");
    let details = body_json(response).await;
    assert_eq!(details["invoice"]["subject"], "bob");
    assert_eq!(details["invoice"]["duration"], 43_200);
    assert_eq!(details["invoice"]["price"], "500000");

    let proof = harness.proof(EVM_NETWORK);
    let response = app
        .clone()
        .oneshot(post(
            &format!("/api/user/invoice/{token}/pay"),
            &json!({}),
            Some(&proof),
        ))
        .await
        .expect("call");
    assert_eq!(response.status(), StatusCode::OK);
    assert!(harness.authority.holds("bob", CAPABILITY));

    let response = app
        .oneshot(post(
            &format!("/api/user/invoice/{token}/pay"),
            &json!({}),
            Some(&harness.proof(EVM_NETWORK)),
        ))
        .await
        .expect("call");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_catalog_routes() {
    let harness = TestHarness::setup().await.expect("setup");
    let app = harness.gate.router();

    let response = app
        .clone()
        .oneshot(get("/api/servers", false))
        .await
        .expect("call");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .clone()
        .oneshot(get(&format!("/api/server/{GROUP}"), true))
        .await
        .expect("call");
    let server = body_json(response).await;
    assert_eq!(server["server"]["resourceCount"], 2);
    assert_eq!(server["server"]["defaultResource"], RESOURCE);

    let response = app
        .clone()
        .oneshot(get(&format!("/api/channel/{RESOURCE}"), true))
        .await
        .expect("call");
    let channel = body_json(response).await;
    assert_eq!(channel["channel"]["capability"], CAPABILITY);
    assert_eq!(channel["channel"]["pricePerUnit"], "1000000");
    assert_eq!(channel["channel"]["allowedDurations"], json!([43_200, 86_400]));

    let response = app
        .oneshot(get("/api/server/unknown", true))
        .await
        .expect("call");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_serves_over_tcp() {
    let harness = TestHarness::setup().await.expect("setup");
    let mut gate = harness.gate;
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let shutdown = gate.shutdown_handle();
    let server = tokio::spawn(async move { gate.serve(listener).await });

    let health: Value = reqwest::get(format!("http://{addr}/health"))
        .await
        .expect("request")
        .json()
        .await
        .expect("json");
    assert_eq!(health["status"], "ok");

    shutdown.shutdown();
    tokio::time::timeout(Duration::from_secs(10), server)
        .await
        .expect("stops")
        .expect("join")
        .expect("serve");
}
