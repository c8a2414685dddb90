//! End-to-end tests against in-process servers.
//!
//! The WebSocket side runs a real `tokio-tungstenite` server; the
//! polling side runs a minimal HTTP/1.1 responder speaking the
//! `{mode, msg?, suid}` protocol. Both are loopback-only and torn down
//! with the test.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;

use commandwire::{
    Client, ConnectionState, PollingTransport, Transport, TransportEvent, TransportKind,
    lifecycle,
};

// ============================================================================
// Helpers
// ============================================================================

/// Installs the test subscriber once; `RUST_LOG` controls verbosity.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Polls `condition` every 10ms until it holds or the deadline passes.
async fn wait_until(condition: impl Fn() -> bool) -> bool {
    for _ in 0..300 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

// ============================================================================
// WebSocket echo server
// ============================================================================

/// Accepts one connection and speaks the envelope protocol:
///
/// - `["who", {"id": n}]` → replies `["who", {"id": n, "players": ["Alice"]}]`
/// - `["announce", {}]` → pushes an uncorrelated `["chat", ...]` event
/// - `["quit", {}]` → closes the stream
/// - anything else is recorded
async fn ws_server(listener: TcpListener, recorded: Arc<Mutex<Vec<Value>>>) {
    let (stream, _) = listener.accept().await.expect("accept");
    let mut ws = tokio_tungstenite::accept_async(stream)
        .await
        .expect("upgrade");

    while let Some(message) = ws.next().await {
        let Ok(Message::Text(text)) = message else {
            break;
        };
        let envelope: Value = serde_json::from_str(&text).expect("client sends valid JSON");
        let command = envelope[0].as_str().unwrap_or_default().to_string();

        match command.as_str() {
            "who" => {
                let id = envelope[1]["id"].clone();
                let reply = json!(["who", {"id": id, "players": ["Alice"]}]);
                ws.send(Message::Text(reply.to_string().into()))
                    .await
                    .expect("reply");
            }
            "announce" => {
                let event = json!(["chat", {"text": "welcome"}]);
                ws.send(Message::Text(event.to_string().into()))
                    .await
                    .expect("event");
            }
            "quit" => {
                ws.close(None).await.expect("close");
                break;
            }
            _ => recorded.lock().push(envelope),
        }
    }
}

async fn spawn_ws_server() -> (SocketAddr, Arc<Mutex<Vec<Value>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let recorded = Arc::new(Mutex::new(Vec::new()));
    tokio::spawn(ws_server(listener, Arc::clone(&recorded)));
    (addr, recorded)
}

// ============================================================================
// Polling server
// ============================================================================

#[derive(Default)]
struct PollState {
    /// Bodies of every `input` request, in arrival order.
    inputs: Mutex<Vec<Value>>,
    /// Wire strings handed out by `receive` polls.
    outbox: Mutex<VecDeque<String>>,
    /// Number of `receive` polls the server has seen.
    receives: AtomicUsize,
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Reads one HTTP/1.1 request, returning (headers, body).
async fn read_request(stream: &mut TcpStream) -> Option<(String, Vec<u8>)> {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 4096];

    let header_end = loop {
        let n = stream.read(&mut tmp).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&tmp[..n]);
        if let Some(pos) = find_subsequence(&buf, b"\r\n\r\n") {
            break pos + 4;
        }
        if buf.len() > 64 * 1024 {
            return None;
        }
    };

    let headers = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let content_length = headers
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            if name.eq_ignore_ascii_case("content-length") {
                value.trim().parse::<usize>().ok()
            } else {
                None
            }
        })
        .unwrap_or(0);

    let mut body = buf[header_end..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut tmp).await.ok()?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&tmp[..n]);
    }

    Some((headers, body))
}

async fn respond(stream: &mut TcpStream, status: &str, body: &str) {
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len(),
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}

async fn handle_poll_request(mut stream: TcpStream, state: Arc<PollState>) {
    let Some((_headers, body)) = read_request(&mut stream).await else {
        return;
    };

    let Ok(request) = serde_json::from_slice::<Value>(&body) else {
        // Non-JSON body, e.g. a WebSocket upgrade attempt.
        respond(&mut stream, "400 Bad Request", "").await;
        return;
    };

    match request.get("mode").and_then(Value::as_str) {
        // Handshake: empty object, no mode field.
        None => {
            respond(&mut stream, "200 OK", r#"{"suid": "itest-session"}"#).await;
        }

        Some("input") => {
            state.inputs.lock().push(request);
            respond(&mut stream, "200 OK", "{}").await;
        }

        Some("receive") => {
            state.receives.fetch_add(1, Ordering::SeqCst);
            // Hold briefly when no data is pending, like a long poll.
            let message = {
                let popped = state.outbox.lock().pop_front();
                match popped {
                    Some(message) => Some(message),
                    None => {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        state.outbox.lock().pop_front()
                    }
                }
            };
            let body = message.unwrap_or_default();
            respond(&mut stream, "200 OK", &body).await;
        }

        Some(_) => {
            respond(&mut stream, "400 Bad Request", "").await;
        }
    }
}

async fn spawn_poll_server() -> (SocketAddr, Arc<PollState>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let state = Arc::new(PollState::default());

    let state_clone = Arc::clone(&state);
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(handle_poll_request(stream, Arc::clone(&state_clone)));
        }
    });

    (addr, state)
}

// ============================================================================
// WebSocket end-to-end
// ============================================================================

#[tokio::test]
async fn ws_send_call_and_events() -> Result<()> {
    init_tracing();
    let (addr, recorded) = spawn_ws_server().await;

    let dispatcher = Arc::new(commandwire::Dispatcher::new());
    let opens = Arc::new(AtomicUsize::new(0));
    let chats = Arc::new(Mutex::new(Vec::new()));

    let opens_clone = Arc::clone(&opens);
    dispatcher.on(
        lifecycle::OPEN,
        Box::new(move |_| {
            opens_clone.fetch_add(1, Ordering::SeqCst);
        }),
    );
    let chats_clone = Arc::clone(&chats);
    dispatcher.on(
        "chat",
        Box::new(move |payload| {
            chats_clone.lock().push(payload);
        }),
    );

    let client = Client::builder(format!("ws://{addr}/wire"))
        .transport(TransportKind::WebSocket)
        .dispatcher(Arc::clone(&dispatcher))
        .connect()
        .await?;

    assert_eq!(client.transport_kind(), TransportKind::WebSocket);
    assert_eq!(client.state(), ConnectionState::Open);
    assert!(wait_until(|| opens.load(Ordering::SeqCst) == 1).await);

    // Fire-and-forget send reaches the server with no id injected.
    client.send("look", json!({"target": "door"}))?;
    assert!(wait_until(|| !recorded.lock().is_empty()).await);
    {
        let recorded = recorded.lock();
        assert_eq!(recorded[0][0], "look");
        assert!(recorded[0][1].get("id").is_none());
    }

    // Correlated call resolves through the table, not the dispatcher.
    let who_listener_calls = Arc::new(AtomicUsize::new(0));
    let who_clone = Arc::clone(&who_listener_calls);
    client.on(
        "who",
        Box::new(move |_| {
            who_clone.fetch_add(1, Ordering::SeqCst);
        }),
    );

    let reply = client.call("who", json!({})).await?;
    assert_eq!(reply.payload["players"][0], "Alice");
    assert_eq!(who_listener_calls.load(Ordering::SeqCst), 0);
    assert_eq!(client.pending_calls(), 0);

    // Uncorrelated server events reach the listener.
    client.send("announce", json!({}))?;
    assert!(wait_until(|| !chats.lock().is_empty()).await);
    assert_eq!(chats.lock()[0]["text"], "welcome");

    Ok(())
}

#[tokio::test]
async fn ws_close_is_terminal() -> Result<()> {
    init_tracing();
    let (addr, _recorded) = spawn_ws_server().await;

    let dispatcher = Arc::new(commandwire::Dispatcher::new());
    let closes = Arc::new(AtomicUsize::new(0));
    let errors = Arc::new(AtomicUsize::new(0));

    let closes_clone = Arc::clone(&closes);
    dispatcher.on(
        lifecycle::CLOSE,
        Box::new(move |_| {
            closes_clone.fetch_add(1, Ordering::SeqCst);
        }),
    );
    let errors_clone = Arc::clone(&errors);
    dispatcher.on(
        lifecycle::ERROR,
        Box::new(move |_| {
            errors_clone.fetch_add(1, Ordering::SeqCst);
        }),
    );

    let client = Client::builder(format!("ws://{addr}/wire"))
        .transport(TransportKind::WebSocket)
        .dispatcher(dispatcher)
        .connect()
        .await?;

    client.send("quit", json!({}))?;
    assert!(wait_until(|| closes.load(Ordering::SeqCst) == 1).await);
    assert_eq!(client.state(), ConnectionState::Closed);

    // Sends after close are no-ops plus a socket:error event.
    client.send("look", json!({}))?;
    assert!(wait_until(|| errors.load(Ordering::SeqCst) >= 1).await);

    // Still exactly one close.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(closes.load(Ordering::SeqCst), 1);

    Ok(())
}

// ============================================================================
// Polling end-to-end
// ============================================================================

#[tokio::test]
async fn polling_handshake_input_and_receive() -> Result<()> {
    init_tracing();
    let (addr, state) = spawn_poll_server().await;

    let dispatcher = Arc::new(commandwire::Dispatcher::new());
    let chats = Arc::new(Mutex::new(Vec::new()));
    let chats_clone = Arc::clone(&chats);
    dispatcher.on(
        "chat",
        Box::new(move |payload| {
            chats_clone.lock().push(payload);
        }),
    );

    let client = Client::builder(format!("http://{addr}/wire"))
        .transport(TransportKind::Polling)
        .poll_timeout(Duration::from_secs(2))
        .dispatcher(dispatcher)
        .connect()
        .await?;

    assert_eq!(client.transport_kind(), TransportKind::Polling);
    assert_eq!(client.state(), ConnectionState::Open);

    // Outbound sends arrive as input requests tagged with the token.
    client.send("look", json!({}))?;
    assert!(wait_until(|| !state.inputs.lock().is_empty()).await);
    {
        let inputs = state.inputs.lock();
        assert_eq!(inputs[0]["mode"], "input");
        assert_eq!(inputs[0]["suid"], "itest-session");
        let wire = inputs[0]["msg"].as_str().expect("msg is a string");
        assert_eq!(serde_json::from_str::<Value>(wire)?[0], "look");
    }

    // Server data flows back through the receive loop.
    state
        .outbox
        .lock()
        .push_back(json!(["chat", {"text": "polled"}]).to_string());
    assert!(wait_until(|| !chats.lock().is_empty()).await);
    assert_eq!(chats.lock()[0]["text"], "polled");

    client.shutdown();
    Ok(())
}

#[tokio::test]
async fn polling_queues_sends_until_token_arrives() -> Result<()> {
    init_tracing();
    let (addr, state) = spawn_poll_server().await;

    let (events_tx, _events_rx) = tokio::sync::mpsc::unbounded_channel::<TransportEvent>();
    let transport = PollingTransport::with_poll_timeout(
        format!("http://{addr}/wire"),
        events_tx,
        Duration::from_secs(2),
    );

    // Before the handshake: queued, not dropped.
    transport.send(r#"["look",{}]"#.to_string());
    transport.send(r#"["who",{}]"#.to_string());
    assert_eq!(transport.queued_len(), 2);
    assert!(state.inputs.lock().is_empty());

    transport.connect().await?;
    assert_eq!(transport.state(), ConnectionState::Open);
    assert_eq!(transport.queued_len(), 0);

    // Both flushed, in order, tagged with the session token.
    assert!(wait_until(|| state.inputs.lock().len() == 2).await);
    {
        let inputs = state.inputs.lock();
        assert_eq!(inputs[0]["msg"].as_str().unwrap(), r#"["look",{}]"#);
        assert_eq!(inputs[1]["msg"].as_str().unwrap(), r#"["who",{}]"#);
        assert!(inputs.iter().all(|i| i["suid"] == "itest-session"));
    }

    transport.shutdown();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn polling_sends_racing_the_handshake_all_arrive() -> Result<()> {
    init_tracing();
    let (addr, state) = spawn_poll_server().await;

    let (events_tx, _events_rx) = tokio::sync::mpsc::unbounded_channel::<TransportEvent>();
    let transport = Arc::new(PollingTransport::with_poll_timeout(
        format!("http://{addr}/wire"),
        events_tx,
        Duration::from_secs(2),
    ));

    const TOTAL: usize = 32;

    // A few before the handshake even starts.
    for i in 0..4 {
        transport.send(format!(r#"["say",{{"n":{i}}}]"#));
    }

    // The rest race the handshake from other workers, so some land
    // while the transport is still Connecting and some after it opens.
    let connect = {
        let transport = Arc::clone(&transport);
        tokio::spawn(async move { transport.connect().await })
    };
    let senders: Vec<_> = (4..TOTAL)
        .map(|i| {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move {
                transport.send(format!(r#"["say",{{"n":{i}}}]"#));
            })
        })
        .collect();

    connect.await.expect("connect task")?;
    for sender in senders {
        sender.await.expect("sender task");
    }

    // Every message reaches the server; none is stranded in the queue.
    assert!(wait_until(|| state.inputs.lock().len() == TOTAL).await);
    assert_eq!(transport.queued_len(), 0);

    transport.shutdown();
    Ok(())
}

#[tokio::test]
async fn polling_shutdown_stops_receive_loop_promptly() -> Result<()> {
    init_tracing();
    let (addr, state) = spawn_poll_server().await;

    let (events_tx, _events_rx) = tokio::sync::mpsc::unbounded_channel::<TransportEvent>();
    let transport = PollingTransport::with_poll_timeout(
        format!("http://{addr}/wire"),
        events_tx,
        Duration::from_secs(10),
    );

    transport.connect().await?;
    assert!(wait_until(|| state.receives.load(Ordering::SeqCst) >= 1).await);

    // Shutdown interrupts the loop well inside the 10s poll window.
    transport.shutdown();
    tokio::time::sleep(Duration::from_millis(300)).await;
    let settled = state.receives.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(
        state.receives.load(Ordering::SeqCst),
        settled,
        "receive loop kept polling after shutdown"
    );
    assert_eq!(transport.state(), ConnectionState::Closed);

    Ok(())
}

// ============================================================================
// Strategy selection
// ============================================================================

#[tokio::test]
async fn auto_falls_back_to_polling() -> Result<()> {
    init_tracing();
    // The server only speaks HTTP: the WebSocket upgrade gets a 400,
    // so Auto must settle on the polling strategy.
    let (addr, _state) = spawn_poll_server().await;

    let client = Client::builder(format!("http://{addr}/wire"))
        .poll_timeout(Duration::from_secs(2))
        .connect()
        .await?;

    assert_eq!(client.transport_kind(), TransportKind::Polling);
    assert_eq!(client.state(), ConnectionState::Open);

    client.shutdown();
    Ok(())
}

#[tokio::test]
async fn auto_prefers_websocket() -> Result<()> {
    init_tracing();
    let (addr, _recorded) = spawn_ws_server().await;

    let client = Client::builder(format!("ws://{addr}/wire")).connect().await?;

    assert_eq!(client.transport_kind(), TransportKind::WebSocket);
    assert_eq!(client.state(), ConnectionState::Open);

    Ok(())
}
