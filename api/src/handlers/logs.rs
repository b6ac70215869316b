// Log reads shared by the run and build endpoints: JSON-wrapped tails for
// REST and push streams over WebSocket.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use common::loghub::LogHub;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Query string for tail reads
#[derive(Debug, Deserialize)]
pub struct TailQuery {
    #[serde(default = "default_tail")]
    pub tail: usize,
}

fn default_tail() -> usize {
    100
}

#[derive(Debug, Serialize)]
pub struct LogsResponse {
    pub logs: String,
    pub lines: usize,
}

/// Last `lines` lines of a log key, active or historical
pub fn tail_lines(hub: &LogHub, key: &str, lines: usize) -> Option<LogsResponse> {
    // The ring bounds what a tail can return; grab everything it has and
    // trim to the requested line count
    let bytes = hub.tail(key, usize::MAX)?;
    let text = String::from_utf8_lossy(&bytes);
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(lines);
    let selected = all[start..].join("\n");
    Some(LogsResponse {
        lines: all.len() - start,
        logs: if selected.is_empty() {
            selected
        } else {
            format!("{}\n", selected)
        },
    })
}

/// Upgrade to a WebSocket pushing text frames until the log closes. For an
/// already-terminal run/build the on-disk log arrives as one frame.
pub fn stream(hub: Arc<LogHub>, key: String, ws: WebSocketUpgrade) -> Option<Response> {
    let rx = hub.subscribe(&key)?;
    Some(ws.on_upgrade(move |socket| forward(socket, rx)))
}

async fn forward(mut socket: WebSocket, mut rx: tokio::sync::mpsc::Receiver<bytes::Bytes>) {
    loop {
        tokio::select! {
            chunk = rx.recv() => match chunk {
                Some(chunk) => {
                    let text = String::from_utf8_lossy(&chunk).into_owned();
                    if socket.send(Message::Text(text)).await.is_err() {
                        return;
                    }
                }
                // Publisher reached terminal state and the entry drained
                None => {
                    let _ = socket.send(Message::Close(None)).await;
                    return;
                }
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                Some(Ok(_)) => {}
            },
        }
    }
}
