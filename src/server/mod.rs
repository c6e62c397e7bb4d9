//! Client transport: a small HTTP server that serves the static frontend
//! and exchanges JSON messages with connected clients.
//!
//! Clients POST messages and collect queued outbound messages in the same
//! round trip; the runtime sees connection lifecycle and inbound traffic as
//! [`ServerEvent`]s and pushes outbound traffic as [`ServerCommand`]s.

pub mod http;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::sandbox::fs::ConfinedFileAccess;

/// Events emitted by the transport to the runtime.
#[derive(Debug)]
pub enum ServerEvent {
    Connected { client: String },
    Message {
        msg_type: String,
        data: Value,
        source: String,
    },
    Disconnected { client: String },
}

/// Commands sent by the runtime to the transport.
#[derive(Debug)]
pub enum ServerCommand {
    Send { client: String, message: Value },
    Broadcast { message: Value },
}

/// Per-client queues of messages awaiting pickup. A key existing at all is
/// what "connected" means to the transport.
type Outboxes = Arc<Mutex<HashMap<String, Vec<Value>>>>;

pub struct HttpServer {
    config: ServerConfig,
}

impl HttpServer {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    /// Binds the listener and returns the event channel.
    ///
    /// Binding is completed synchronously so a bad address fails here; the
    /// accept loop and the command loop then run as background tasks.
    pub async fn start(
        self,
        mut cmd_rx: mpsc::UnboundedReceiver<ServerCommand>,
    ) -> std::io::Result<mpsc::Receiver<ServerEvent>> {
        let (event_tx, event_rx) = mpsc::channel::<ServerEvent>(100);
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        info!("Listening on http://{addr}");

        let outboxes: Outboxes = Arc::new(Mutex::new(HashMap::new()));
        let static_files = ConfinedFileAccess::new(&self.config.base_path);

        // Command loop: fill outboxes for clients to drain on their next poll
        {
            let outboxes = outboxes.clone();
            tokio::spawn(async move {
                while let Some(cmd) = cmd_rx.recv().await {
                    let mut boxes = outboxes.lock();
                    match cmd {
                        ServerCommand::Send { client, message } => {
                            match boxes.get_mut(&client) {
                                Some(queue) => queue.push(message),
                                None => {
                                    warn!(%client, "dropping message for unknown client")
                                }
                            }
                        }
                        ServerCommand::Broadcast { message } => {
                            for queue in boxes.values_mut() {
                                queue.push(message.clone());
                            }
                        }
                    }
                }
            });
        }

        let default_file = self.config.default_file.clone();
        tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("accept failed: {e}");
                        continue;
                    }
                };
                debug!(%peer, "connection accepted");
                let event_tx = event_tx.clone();
                let outboxes = outboxes.clone();
                let static_files = static_files.clone();
                let default_file = default_file.clone();
                tokio::spawn(async move {
                    if let Err(e) =
                        handle_connection(stream, &static_files, &default_file, &event_tx, &outboxes)
                            .await
                    {
                        debug!(%peer, "connection error: {e}");
                    }
                });
            }
        });

        Ok(event_rx)
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    static_files: &ConfinedFileAccess,
    default_file: &str,
    event_tx: &mpsc::Sender<ServerEvent>,
    outboxes: &Outboxes,
) -> std::io::Result<()> {
    let request = match http::read_request(&mut stream).await? {
        Some(request) => request,
        None => return Ok(()),
    };

    match (request.method.as_str(), request.path.as_str()) {
        ("GET", _) => serve_static(&mut stream, static_files, default_file, &request.path).await,
        ("POST", "/message") => {
            handle_message(&mut stream, &request, event_tx, outboxes).await
        }
        ("POST", "/disconnect") => {
            handle_disconnect(&mut stream, &request, event_tx, outboxes).await
        }
        _ => {
            http::write_response(
                &mut stream,
                "405 Method Not Allowed",
                Some("text/plain; charset=utf-8"),
                &[("Allow", "GET, POST")],
                b"method not allowed",
            )
            .await
        }
    }
}

async fn serve_static(
    stream: &mut TcpStream,
    static_files: &ConfinedFileAccess,
    default_file: &str,
    path: &str,
) -> std::io::Result<()> {
    let path = path.split('?').next().unwrap_or(path);
    let file = if path == "/" { default_file } else { path };

    match static_files.read(file).await {
        Ok(bytes) => {
            http::write_response(stream, "200 OK", http::content_type_for(file), &[], &bytes).await
        }
        Err(crate::error::SandboxError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            http::write_response(
                stream,
                "404 Not Found",
                Some("text/plain; charset=utf-8"),
                &[],
                b"not found",
            )
            .await
        }
        Err(e) => {
            warn!(%file, "static file read failed: {e}");
            http::write_response(
                stream,
                "500 Internal Server Error",
                Some("text/plain; charset=utf-8"),
                &[],
                b"internal error",
            )
            .await
        }
    }
}

/// Receives one client message and drains the client's outbox in the
/// response. A client id first seen here counts as a new connection.
async fn handle_message(
    stream: &mut TcpStream,
    request: &http::Request,
    event_tx: &mpsc::Sender<ServerEvent>,
    outboxes: &Outboxes,
) -> std::io::Result<()> {
    let payload: Value = match serde_json::from_slice(&request.body) {
        Ok(payload) => payload,
        Err(e) => {
            return http::write_response(
                stream,
                "400 Bad Request",
                Some("application/json"),
                &[],
                serde_json::json!({ "error": e.to_string() }).to_string().as_bytes(),
            )
            .await;
        }
    };

    let client = request
        .header("x-client-id")
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    // A client id first seen here counts as a new connection
    let is_new = {
        let mut boxes = outboxes.lock();
        if boxes.contains_key(&client) {
            false
        } else {
            boxes.insert(client.clone(), Vec::new());
            true
        }
    };
    if is_new {
        info!(%client, "client connected");
        let _ = event_tx
            .send(ServerEvent::Connected {
                client: client.clone(),
            })
            .await;
    }

    let msg_type = payload
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("message")
        .to_string();
    let data = payload.get("data").cloned().unwrap_or(Value::Null);
    let _ = event_tx
        .send(ServerEvent::Message {
            msg_type,
            data,
            source: client.clone(),
        })
        .await;

    // Give queued outbound messages time to land before the drain; the
    // runtime reacts to the event we just sent on another task.
    tokio::task::yield_now().await;

    let queued = outboxes
        .lock()
        .get_mut(&client)
        .map(std::mem::take)
        .unwrap_or_default();
    let body = serde_json::json!({ "client": client, "messages": queued });
    http::write_response(
        stream,
        "200 OK",
        Some("application/json"),
        &[],
        body.to_string().as_bytes(),
    )
    .await
}

async fn handle_disconnect(
    stream: &mut TcpStream,
    request: &http::Request,
    event_tx: &mpsc::Sender<ServerEvent>,
    outboxes: &Outboxes,
) -> std::io::Result<()> {
    let Some(client) = request.header("x-client-id").map(str::to_string) else {
        return http::write_response(
            stream,
            "400 Bad Request",
            Some("text/plain; charset=utf-8"),
            &[],
            b"missing X-Client-Id",
        )
        .await;
    };

    if outboxes.lock().remove(&client).is_some() {
        info!(%client, "client disconnected");
        let _ = event_tx
            .send(ServerEvent::Disconnected {
                client: client.clone(),
            })
            .await;
    }
    http::write_response(stream, "200 OK", Some("application/json"), &[], b"{}").await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn start_server(base: &std::path::Path) -> (u16, mpsc::Receiver<ServerEvent>, mpsc::UnboundedSender<ServerCommand>) {
        // Ask the OS for a free ephemeral port
        let placeholder = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = placeholder.local_addr().unwrap().port();
        drop(placeholder);

        let config = ServerConfig {
            host: "127.0.0.1".into(),
            port,
            base_path: base.to_path_buf(),
            default_file: "index.html".into(),
        };
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let event_rx = HttpServer::new(config).start(cmd_rx).await.unwrap();
        (port, event_rx, cmd_tx)
    }

    async fn raw_request(port: u16, raw: &[u8]) -> String {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        stream.write_all(raw).await.unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        String::from_utf8_lossy(&response).to_string()
    }

    #[tokio::test]
    async fn test_serves_default_file_at_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<h1>hi</h1>").unwrap();
        let (port, _events, _cmds) = start_server(dir.path()).await;

        let response = raw_request(port, b"GET / HTTP/1.1\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains("Content-Type: text/html"));
        assert!(response.ends_with("<h1>hi</h1>"));
    }

    #[tokio::test]
    async fn test_missing_static_file_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let (port, _events, _cmds) = start_server(dir.path()).await;

        let response = raw_request(port, b"GET /nope.html HTTP/1.1\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 404"));
    }

    #[tokio::test]
    async fn test_unsupported_method_is_405_with_allow() {
        let dir = tempfile::tempdir().unwrap();
        let (port, _events, _cmds) = start_server(dir.path()).await;

        let response = raw_request(port, b"DELETE /index.html HTTP/1.1\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 405"));
        assert!(response.contains("Allow: GET, POST"));
    }

    #[tokio::test]
    async fn test_message_roundtrip_and_connection_events() {
        let dir = tempfile::tempdir().unwrap();
        let (port, mut events, cmds) = start_server(dir.path()).await;

        let body = br#"{"type":"chat","data":"hello"}"#;
        let raw = format!(
            "POST /message HTTP/1.1\r\nX-Client-Id: c1\r\nContent-Length: {}\r\n\r\n",
            body.len()
        );
        let mut request = raw.into_bytes();
        request.extend_from_slice(body);

        let response = raw_request(port, &request).await;
        assert!(response.starts_with("HTTP/1.1 200"));

        match events.recv().await {
            Some(ServerEvent::Connected { client }) => assert_eq!(client, "c1"),
            other => panic!("expected Connected, got {other:?}"),
        }
        match events.recv().await {
            Some(ServerEvent::Message {
                msg_type,
                data,
                source,
            }) => {
                assert_eq!(msg_type, "chat");
                assert_eq!(data, "hello");
                assert_eq!(source, "c1");
            }
            other => panic!("expected Message, got {other:?}"),
        }

        // Queue a message for the client; the next poll drains it
        cmds.send(ServerCommand::Send {
            client: "c1".into(),
            message: serde_json::json!({ "type": "pong" }),
        })
        .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let body = br#"{"type":"poll"}"#;
        let raw = format!(
            "POST /message HTTP/1.1\r\nX-Client-Id: c1\r\nContent-Length: {}\r\n\r\n",
            body.len()
        );
        let mut request = raw.into_bytes();
        request.extend_from_slice(body);
        let response = raw_request(port, &request).await;
        assert!(response.contains("\"pong\""));
    }

    #[tokio::test]
    async fn test_disconnect_emits_event_and_forgets_client() {
        let dir = tempfile::tempdir().unwrap();
        let (port, mut events, _cmds) = start_server(dir.path()).await;

        let body = br#"{"type":"hello"}"#;
        let raw = format!(
            "POST /message HTTP/1.1\r\nX-Client-Id: c9\r\nContent-Length: {}\r\n\r\n",
            body.len()
        );
        let mut request = raw.into_bytes();
        request.extend_from_slice(body);
        raw_request(port, &request).await;
        events.recv().await; // Connected
        events.recv().await; // Message

        let response = raw_request(
            port,
            b"POST /disconnect HTTP/1.1\r\nX-Client-Id: c9\r\nContent-Length: 0\r\n\r\n",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 200"));
        match events.recv().await {
            Some(ServerEvent::Disconnected { client }) => assert_eq!(client, "c9"),
            other => panic!("expected Disconnected, got {other:?}"),
        }
    }
}
