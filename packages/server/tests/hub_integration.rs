//! Hub integration tests
//!
//! Agents are simulated over the in-memory transport so the tests can decide
//! exactly when, and in which order, replies arrive.

use std::sync::Arc;
use std::time::Duration;

use outpost_protocol::payloads::{AuthPayload, CommandRequest, CommandResult, ErrorPayload};
use outpost_protocol::transport::memory;
use outpost_protocol::{Envelope, MemoryTransport, MessageType, Payload, Transport, TransportError};
use outpost_server::config::{AuthConfig, HubConfig};
use outpost_server::{serve_connection, Authenticator, Hub, HubError};
use tokio::time::{timeout, Instant};

const API_KEY: &str = "integration-key";

fn hub_with(config: HubConfig) -> (Hub, Arc<Authenticator>) {
    let auth = Authenticator::new(&AuthConfig {
        api_key: Some(API_KEY.to_string()),
        jwt_secret: Some("integration-secret".to_string()),
        ..AuthConfig::default()
    });
    (Hub::new(config), Arc::new(auth))
}

fn hub() -> (Hub, Arc<Authenticator>) {
    hub_with(HubConfig::default())
}

/// Agent end of an in-memory connection that answers on command.
struct FakeAgent {
    transport: MemoryTransport,
}

impl FakeAgent {
    async fn connect(hub: &Hub, auth: &Arc<Authenticator>, agent_id: &str) -> Self {
        let (transport, reply) = handshake(hub, auth, agent_id, API_KEY).await;
        assert_eq!(reply.kind, MessageType::AuthSuccess, "auth failed: {}", reply.data);

        // Registration happens before auth_success is written.
        assert!(hub.get(agent_id).await.is_some());
        Self { transport }
    }

    /// Next request from the hub.
    async fn next_request(&mut self) -> Envelope {
        loop {
            let envelope = timeout(Duration::from_secs(5), self.transport.receive())
                .await
                .expect("no request within 5s")
                .expect("transport closed");
            if envelope.kind.is_request() {
                return envelope;
            }
        }
    }

    async fn reply(&mut self, request: &Envelope, payload: Payload) {
        let reply = request.reply(payload).unwrap();
        self.transport.send(&reply).await.unwrap();
    }

    async fn reply_stdout(&mut self, request: &Envelope, stdout: &str) {
        self.reply(
            request,
            Payload::CommandResult(CommandResult {
                stdout: stdout.to_string(),
                ..Default::default()
            }),
        )
        .await;
    }
}

async fn handshake(
    hub: &Hub,
    auth: &Arc<Authenticator>,
    agent_id: &str,
    token: &str,
) -> (MemoryTransport, Envelope) {
    let (mut agent_side, server_side) = memory::pair();
    tokio::spawn(serve_connection(hub.clone(), auth.clone(), server_side));

    let mut request = AuthPayload::new(token);
    request.agent_id = Some(agent_id.to_string());
    agent_side
        .send(&Envelope::request(Payload::Auth(request)).unwrap())
        .await
        .unwrap();
    let reply = timeout(Duration::from_secs(5), agent_side.receive())
        .await
        .unwrap()
        .unwrap();
    (agent_side, reply)
}

fn command(text: &str) -> CommandRequest {
    CommandRequest::new(text).with_timeout(10)
}

#[tokio::test]
async fn test_concurrent_requests_same_agent_get_their_own_reply() {
    let (hub, auth) = hub();
    let mut agent = FakeAgent::connect(&hub, &auth, "a").await;

    let first = tokio::spawn({
        let hub = hub.clone();
        async move { hub.execute_command("a", command("first")).await }
    });
    let second = tokio::spawn({
        let hub = hub.clone();
        async move { hub.execute_command("a", command("second")).await }
    });

    let r1 = agent.next_request().await;
    let r2 = agent.next_request().await;
    assert_ne!(r1.id, r2.id);

    // Answer in reverse order of arrival.
    for request in [&r2, &r1] {
        let text = request.data["command"].as_str().unwrap().to_string();
        agent.reply_stdout(request, &format!("{text}-out")).await;
    }

    assert_eq!(first.await.unwrap().unwrap().stdout, "first-out");
    assert_eq!(second.await.unwrap().unwrap().stdout, "second-out");
}

#[tokio::test]
async fn test_concurrent_requests_different_agents() {
    let (hub, auth) = hub();
    let mut a = FakeAgent::connect(&hub, &auth, "a").await;
    let mut b = FakeAgent::connect(&hub, &auth, "b").await;

    let to_a = tokio::spawn({
        let hub = hub.clone();
        async move { hub.execute_command("a", command("hostname")).await }
    });
    let to_b = tokio::spawn({
        let hub = hub.clone();
        async move { hub.execute_command("b", command("hostname")).await }
    });

    let ra = a.next_request().await;
    let rb = b.next_request().await;
    b.reply_stdout(&rb, "host-b").await;
    a.reply_stdout(&ra, "host-a").await;

    assert_eq!(to_a.await.unwrap().unwrap().stdout, "host-a");
    assert_eq!(to_b.await.unwrap().unwrap().stdout, "host-b");
}

#[tokio::test]
async fn test_disconnect_wakes_waiter_before_timeout() {
    let (hub, auth) = hub();
    let mut agent = FakeAgent::connect(&hub, &auth, "a").await;

    let started = Instant::now();
    let call = tokio::spawn({
        let hub = hub.clone();
        async move {
            hub.send_with_response(
                "a",
                Envelope::request(Payload::CommandExecute(command("sleep 60"))).unwrap(),
                Duration::from_secs(30),
            )
            .await
        }
    });

    agent.next_request().await;
    agent.transport.close().await.unwrap();

    let err = timeout(Duration::from_secs(2), call)
        .await
        .expect("waiter not woken")
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, HubError::Disconnected(_)), "got {err:?}");
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_late_reply_is_dropped() {
    let (hub, auth) = hub();
    let mut agent = FakeAgent::connect(&hub, &auth, "a").await;

    let slow = tokio::spawn({
        let hub = hub.clone();
        async move {
            hub.request(
                "a",
                Payload::CommandExecute(command("slow")),
                Some(Duration::from_millis(100)),
            )
            .await
        }
    });
    let stale = agent.next_request().await;
    let err = slow.await.unwrap().unwrap_err();
    assert!(matches!(err, HubError::Timeout { .. }));

    // The orphaned reply arrives while a new request is waiting.
    let fresh = tokio::spawn({
        let hub = hub.clone();
        async move { hub.execute_command("a", command("fresh")).await }
    });
    let current = agent.next_request().await;
    agent.reply_stdout(&stale, "stale").await;
    agent.reply_stdout(&current, "fresh").await;

    assert_eq!(fresh.await.unwrap().unwrap().stdout, "fresh");
    let handle = hub.get("a").await.unwrap();
    assert_eq!(handle.correlator().pending(), 0);
}

#[tokio::test]
async fn test_reply_with_unknown_id_is_dropped() {
    let (hub, auth) = hub();
    let mut agent = FakeAgent::connect(&hub, &auth, "a").await;

    let call = tokio::spawn({
        let hub = hub.clone();
        async move { hub.execute_command("a", command("echo ok")).await }
    });
    let request = agent.next_request().await;

    let bogus = request
        .reply(Payload::CommandResult(CommandResult {
            stdout: "not yours".to_string(),
            ..Default::default()
        }))
        .unwrap()
        .with_id("nobody-asked");
    agent.transport.send(&bogus).await.unwrap();
    agent.reply_stdout(&request, "ok").await;

    assert_eq!(call.await.unwrap().unwrap().stdout, "ok");
}

#[tokio::test]
async fn test_bad_token_rejected() {
    let (hub, auth) = hub();
    let (mut transport, reply) = handshake(&hub, &auth, "intruder", "wrong-key").await;

    assert_eq!(reply.kind, MessageType::AuthError);
    assert_eq!(reply.data["code"], "AUTH_FAILED");
    assert!(matches!(
        timeout(Duration::from_secs(2), transport.receive()).await.unwrap(),
        Err(TransportError::Closed)
    ));
    assert!(hub.get("intruder").await.is_none());
}

#[tokio::test]
async fn test_signed_token_sets_identity() {
    let (hub, auth) = hub();
    let token = auth.mint("from-token", None).unwrap();
    let (_transport, reply) = handshake(&hub, &auth, "asked-for", &token).await;

    assert_eq!(reply.kind, MessageType::AuthSuccess);
    assert_eq!(reply.data["agent_id"], "from-token");
    assert!(hub.get("from-token").await.is_some());
    assert!(hub.get("asked-for").await.is_none());
}

#[tokio::test]
async fn test_reconnect_replaces_previous_connection() {
    let (hub, auth) = hub();
    let mut old = FakeAgent::connect(&hub, &auth, "a").await;

    let pending = tokio::spawn({
        let hub = hub.clone();
        async move { hub.execute_command("a", command("on old")).await }
    });
    old.next_request().await;

    let mut new = FakeAgent::connect(&hub, &auth, "a").await;
    let err = timeout(Duration::from_secs(2), pending)
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, HubError::Disconnected(_)));

    // The old socket is shut and requests go to the new one.
    let closed = timeout(Duration::from_secs(2), async {
        loop {
            if let Err(TransportError::Closed) = old.transport.receive().await {
                break;
            }
        }
    })
    .await;
    assert!(closed.is_ok());

    let call = tokio::spawn({
        let hub = hub.clone();
        async move { hub.execute_command("a", command("on new")).await }
    });
    let request = new.next_request().await;
    new.reply_stdout(&request, "new").await;
    assert_eq!(call.await.unwrap().unwrap().stdout, "new");
    assert_eq!(hub.agents().await.len(), 1);
}

#[tokio::test]
async fn test_remote_error_is_not_a_timeout() {
    let (hub, auth) = hub();
    let mut agent = FakeAgent::connect(&hub, &auth, "a").await;

    // Blocked command: error reply.
    let blocked = tokio::spawn({
        let hub = hub.clone();
        async move { hub.execute_command("a", command("rm -rf /")).await }
    });
    let request = agent.next_request().await;
    agent
        .reply(
            &request,
            Payload::CommandError(ErrorPayload::new("COMMAND_BLOCKED", "blocked")),
        )
        .await;
    match blocked.await.unwrap() {
        Err(HubError::Remote { code, .. }) => assert_eq!(code, "COMMAND_BLOCKED"),
        other => panic!("expected remote error, got {other:?}"),
    }

    // Command ran out of time on the agent: still a result.
    let slow = tokio::spawn({
        let hub = hub.clone();
        async move { hub.execute_command("a", command("sleep 5")).await }
    });
    let request = agent.next_request().await;
    agent
        .reply(
            &request,
            Payload::CommandResult(CommandResult {
                exit_code: -1,
                timed_out: true,
                ..Default::default()
            }),
        )
        .await;
    let result = slow.await.unwrap().unwrap();
    assert!(result.timed_out);
    assert_eq!(result.exit_code, -1);

    // No reply at all: correlation timeout.
    let err = hub
        .request(
            "a",
            Payload::CommandExecute(command("ignored")),
            Some(Duration::from_millis(100)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, HubError::Timeout { .. }));
}

#[tokio::test]
async fn test_unexpected_reply_type() {
    let (hub, auth) = hub();
    let mut agent = FakeAgent::connect(&hub, &auth, "a").await;

    let call = tokio::spawn({
        let hub = hub.clone();
        async move { hub.execute_command("a", command("x")).await }
    });
    let request = agent.next_request().await;
    agent
        .reply(&request, Payload::Pong(Default::default()))
        .await;

    assert!(matches!(
        call.await.unwrap(),
        Err(HubError::UnexpectedResponse {
            expected: MessageType::CommandResult,
            actual: MessageType::Pong,
        })
    ));
}

#[tokio::test]
async fn test_silent_agent_is_swept() {
    let (hub, auth) = hub_with(HubConfig {
        inactivity_timeout_secs: 1,
        sweep_interval_secs: 1,
        ..HubConfig::default()
    });
    let mut agent = FakeAgent::connect(&hub, &auth, "quiet").await;

    let closed = timeout(Duration::from_secs(5), async {
        loop {
            if let Err(TransportError::Closed) = agent.transport.receive().await {
                break;
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "silent agent was never dropped");
    assert!(hub.get("quiet").await.is_none());
}

#[cfg(unix)]
mod websocket {
    use super::*;
    use outpost_agent::agent::dispatch::RequestHandler;
    use outpost_agent::cli::config::Config as AgentConfig;
    use outpost_agent::{AgentStateManager, SessionClient};
    use outpost_server::{router, AppState};
    use std::net::SocketAddr;
    use tokio::sync::watch;

    async fn serve(hub: &Hub, auth: Arc<Authenticator>) -> SocketAddr {
        let app = router(AppState {
            hub: hub.clone(),
            auth,
            require_api_key: true,
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn test_non_utf8_binary_frame_keeps_agent() {
        use futures_util::{SinkExt, StreamExt};
        use tokio_tungstenite::tungstenite::Message;

        let (hub, auth) = hub();
        let addr = serve(&hub, auth).await;
        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws/agent"))
            .await
            .unwrap();

        let mut request = AuthPayload::new(API_KEY);
        request.agent_id = Some("raw".to_string());
        let auth_frame = Envelope::request(Payload::Auth(request)).unwrap();
        ws.send(Message::Text(auth_frame.to_json().unwrap()))
            .await
            .unwrap();

        async fn next_envelope(
            ws: &mut tokio_tungstenite::WebSocketStream<
                tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
            >,
        ) -> Envelope {
            loop {
                let frame = timeout(Duration::from_secs(5), ws.next())
                    .await
                    .expect("no frame within 5s")
                    .expect("socket closed")
                    .unwrap();
                if let Message::Text(text) = frame {
                    return Envelope::from_json(&text).unwrap();
                }
            }
        }
        assert_eq!(next_envelope(&mut ws).await.kind, MessageType::AuthSuccess);

        ws.send(Message::Binary(vec![0xff, 0xfe, 0x00])).await.unwrap();
        let ping = Envelope::request(Payload::Ping(Default::default())).unwrap();
        ws.send(Message::Text(ping.to_json().unwrap())).await.unwrap();

        let pong = next_envelope(&mut ws).await;
        assert_eq!(pong.kind, MessageType::Pong);
        assert_eq!(pong.id, ping.id);
        assert!(hub.get("raw").await.is_some());
    }

    #[tokio::test]
    async fn test_real_agent_over_websocket() {
        let (hub, auth) = hub();
        let addr = serve(&hub, auth).await;

        let mut config = AgentConfig::default_config();
        config.agent_id = "e2e".to_string();
        config.server.url = format!("ws://{addr}/ws/agent");
        config.server.token = API_KEY.to_string();
        config.server.reconnect_interval_ms = 100;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let client = SessionClient::new(
            config.agent_id.clone(),
            "e2e agent",
            config.server.clone(),
            Arc::new(RequestHandler::from_config(&config)),
            AgentStateManager::new(),
            shutdown_rx,
        );
        let running = tokio::spawn(async move { client.run().await });

        let deadline = Instant::now() + Duration::from_secs(10);
        while hub.get("e2e").await.is_none() {
            assert!(Instant::now() < deadline, "agent never registered");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let cd = hub
            .execute_command("e2e", command("cd /tmp"))
            .await
            .unwrap();
        assert_eq!(cd.exit_code, 0);

        let pwd = hub.execute_command("e2e", command("pwd")).await.unwrap();
        let tmp = std::fs::canonicalize("/tmp").unwrap();
        let reported = pwd.stdout.trim_end();
        assert!(
            reported == "/tmp" || reported == tmp.to_string_lossy(),
            "unexpected pwd: {reported}"
        );

        let blocked = hub.execute_command("e2e", command("rm -rf /")).await;
        assert!(matches!(blocked, Err(HubError::Remote { ref code, .. }) if code == "COMMAND_BLOCKED"));

        let info = hub.get("e2e").await.unwrap().info();
        assert_eq!(info.name.as_deref(), Some("e2e agent"));

        shutdown_tx.send(true).unwrap();
        let outcome = timeout(Duration::from_secs(5), running).await.unwrap().unwrap();
        assert!(outcome.is_ok());
    }
}
