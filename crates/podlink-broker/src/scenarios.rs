//! End-to-end stories
//!
//! Each test walks a user through the broker's public surface: the HTTP
//! routes via `oneshot`, and the tunnel exactly as the WebSocket handler
//! drives it after the upgrade, over in-memory channels.

use std::time::Duration;

use axum::body::Body;
use axum::extract::ws::Message;
use axum::http::{Request, StatusCode};
use chrono::Utc;
use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tower::ServiceExt;

use podlink_common::{IdentityProof, SessionId, TokenSet};
use podlink_identity::{LoginStart, MockIdentityExchange};

use crate::locator::MockWorkloadLocator;
use crate::registry::SessionTokenSigner;
use crate::server::build_router;
use crate::testing::{alice_workload, default_registry_config, test_app, TestApp, SECRET};
use crate::tunnel::{self, run_tunnel};

const STEP_TIMEOUT: Duration = Duration::from_secs(5);

fn alice() -> IdentityProof {
    IdentityProof {
        subject: "alice@example.org".into(),
        email: Some("alice@example.org".into()),
        name: Some("Alice".into()),
        assertion: json!({"sub": "http://cilogon.org/serverA/users/1234"}),
    }
}

/// Identity provider that knows one user and one authorization code
fn provider() -> MockIdentityExchange {
    let mut identity = MockIdentityExchange::new();
    identity.expect_start_login().returning(|| {
        Ok(LoginStart {
            authorization_url: "https://cilogon.org/authorize?state=st".into(),
            flow_state: "flow-state".into(),
        })
    });
    identity
        .expect_complete_login()
        .withf(|code, state| code == "valid-code" && state == "flow-state")
        .returning(|_, _| {
            Ok(TokenSet {
                access_token: "alice-access".into(),
                refresh_token: Some("alice-refresh".into()),
                expires_in: Some(900),
                token_type: "Bearer".into(),
                id_token: None,
            })
        });
    identity
        .expect_validate_access()
        .withf(|token| token == "alice-access")
        .returning(|_| Ok(alice()));
    identity
}

fn hub() -> MockWorkloadLocator {
    let mut locator = MockWorkloadLocator::new();
    locator
        .expect_ensure_running()
        .withf(|username| username == "alice")
        .returning(|_| Ok(alice_workload()));
    locator
}

async fn call(app: &TestApp, request: Request<Body>) -> (StatusCode, Value) {
    let response = build_router(app.state.clone())
        .oneshot(request)
        .await
        .unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
}

fn get(uri: &str) -> Request<Body> {
    Request::get(uri)
        .header("host", "broker.example.org")
        .body(Body::empty())
        .unwrap()
}

fn upgrade(uri: &str) -> Request<Body> {
    Request::get(uri)
        .header("host", "broker.example.org")
        .header("connection", "upgrade")
        .header("upgrade", "websocket")
        .header("sec-websocket-version", "13")
        .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==")
        .body(Body::empty())
        .unwrap()
}

/// Log in and create a session; returns the session response
async fn login_and_create_session(app: &TestApp) -> Value {
    let (status, start) = call(app, get("/auth/start")).await;
    assert_eq!(status, StatusCode::OK);
    let flow_state = start["state"].as_str().unwrap();

    let (status, tokens) = call(
        app,
        get(&format!("/auth/callback?code=valid-code&state={}", flow_state)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let create = Request::post("/session")
        .header("host", "broker.example.org")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({
                "access_token": tokens["access_token"],
                "refresh_token": tokens["refresh_token"],
            })
            .to_string(),
        ))
        .unwrap();
    let (status, session) = call(app, create).await;
    assert_eq!(status, StatusCode::OK, "{}", session);
    session
}

struct Client {
    tx: mpsc::Sender<Result<Message, axum::Error>>,
    rx: mpsc::Receiver<Message>,
    task: tokio::task::JoinHandle<()>,
}

impl Client {
    /// Bind a tunnel the way the upgrade handler does
    async fn connect(app: &TestApp, session_id: &str, token: &str) -> Self {
        let ctx = tunnel::open(&app.state, &SessionId::from(session_id), Some(token))
            .await
            .unwrap_or_else(|e| panic!("tunnel rejected: {}", e));
        let (server_tx, rx) = mpsc::channel(64);
        let (tx, client_rx) = mpsc::channel(64);
        let task = tokio::spawn(run_tunnel(server_tx, client_rx, ctx));
        Self { tx, rx, task }
    }

    async fn send(&mut self, frame: Value) {
        self.tx
            .send(Ok(Message::Text(frame.to_string().into())))
            .await
            .unwrap();
    }

    async fn recv(&mut self) -> Message {
        tokio::time::timeout(STEP_TIMEOUT, self.rx.next())
            .await
            .expect("tunnel answered in time")
            .expect("tunnel open")
    }

    async fn recv_json(&mut self) -> Value {
        match self.recv().await {
            Message::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
            other => panic!("expected text frame, got {:?}", other),
        }
    }
}

/// Story: Alice logs in, gets a session for her notebook pod and runs a
/// command in it through the tunnel.
#[tokio::test]
async fn story_login_session_and_exec() {
    let app = test_app(provider(), hub(), default_registry_config());

    let session = login_and_create_session(&app).await;
    assert_eq!(session["pod"], "nb-alice");
    assert_eq!(session["namespace"], "user-alice");

    let id = session["session_id"].as_str().unwrap();
    let token = session["session_token"].as_str().unwrap();
    let mut client = Client::connect(&app, id, token).await;

    client
        .send(json!({"type": "exec", "payload": {"command": "echo", "args": ["hi"]}}))
        .await;

    let output = client.recv_json().await;
    assert_eq!(output["type"], "exec_response");
    assert_eq!(output["payload"]["stdout"], "hi\n");

    let done = client.recv_json().await;
    assert_eq!(done["payload"]["exit_code"], 0);
    assert_eq!(done["payload"]["done"], true);

    // The workload was reached with the minted credential, not the broker's
    let principal = &app.cluster.principals()[0].1;
    assert_eq!(app.connector.bearers(), vec![format!("bearer-{}", principal)]);
}

/// Story: a stale client presents an expired session token. The upgrade is
/// refused and no cluster access is set up for it.
#[tokio::test]
async fn story_expired_token_is_refused_before_upgrade() {
    let app = test_app(provider(), hub(), default_registry_config());
    let session = login_and_create_session(&app).await;
    let id = session["session_id"].as_str().unwrap();

    let signer = SessionTokenSigner::new(SECRET).unwrap();
    let issued_at = Utc::now() - chrono::Duration::hours(2);
    let expired = signer
        .issue(
            &SessionId::from(id),
            "alice@example.org",
            issued_at,
            issued_at + chrono::Duration::minutes(15),
        )
        .unwrap();

    let (status, body) = call(&app, upgrade(&format!("/tunnel/{}?token={}", id, expired))).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "authentication failed: invalid session token");
    assert_eq!(app.cluster.principals().len(), 1);
    assert!(app.connector.bearers().is_empty());
}

/// Story: Mallory holds Bob's session token and tries it against Alice's
/// session id. The request is never upgraded.
#[tokio::test]
async fn story_token_for_another_session_is_never_upgraded() {
    let app = test_app(provider(), hub(), default_registry_config());
    let alice_session = login_and_create_session(&app).await;

    let bob = IdentityProof {
        subject: "bob@example.org".into(),
        email: Some("bob@example.org".into()),
        name: None,
        assertion: Value::Null,
    };
    let bob_session = app
        .state
        .registry
        .create(&bob, "bob", alice_workload(), None)
        .await
        .unwrap();

    let uri = format!(
        "/tunnel/{}?token={}",
        alice_session["session_id"].as_str().unwrap(),
        bob_session.token.token.as_str()
    );
    let (status, _) = call(&app, upgrade(&uri)).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(app.connector.bearers().is_empty());

    let (status, _) = call(&app, upgrade(&format!("/tunnel/{}", bob_session.session.id))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

/// Story: Alice deletes her session from another window while the tunnel is
/// open. The tunnel tells her why it is closing and the principal is gone
/// from the cluster.
#[tokio::test]
async fn story_delete_while_tunnel_is_open() {
    let app = test_app(provider(), hub(), default_registry_config());
    let session = login_and_create_session(&app).await;
    let id = session["session_id"].as_str().unwrap();
    let token = session["session_token"].as_str().unwrap();

    let (namespace, principal) = app.cluster.principals()[0].clone();
    let mut client = Client::connect(&app, id, token).await;

    let delete = Request::delete(format!("/session/{}", id))
        .body(Body::empty())
        .unwrap();
    let (status, _) = call(&app, delete).await;
    assert_eq!(status, StatusCode::OK);

    let notice = client.recv_json().await;
    assert_eq!(notice["type"], "error");
    assert_eq!(notice["payload"]["reason"], "session_deleted");
    assert!(matches!(client.recv().await, Message::Close(Some(_))));

    tokio::time::timeout(STEP_TIMEOUT, client.task)
        .await
        .unwrap()
        .unwrap();

    assert!(!app.cluster.has_principal(&namespace, &principal));
    assert_eq!(app.cluster.binding_count(), 0);

    let (status, _) = call(&app, get(&format!("/session/{}", id))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
