//! Local mock venue speaking the `req_id` JSON protocol.
//!
//! Behaviour by request key:
//! - `authorize`: succeeds for token "good", fails otherwise
//! - `ticks`: three pushes under the same `req_id` and stream id `stream-<req_id>`
//!   (`"repeat": true` sends quotes 1, 1, 2)
//! - `forget` / `forget_all`: acknowledged
//! - `silent`: never answered
//! - `reject`: answered with an error object
//! - `delay_ms`: echoed after the delay, so replies can overtake each other
//! - anything else: echoed back

#![allow(dead_code)]

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{broadcast, mpsc},
    time::{sleep, timeout},
};
use tokio_tungstenite::{accept_async, tungstenite::Message};

pub struct MockVenue {
    pub url: String,
    received: mpsc::UnboundedReceiver<Value>,
    connections: Arc<AtomicUsize>,
    kill_tx: broadcast::Sender<()>,
}

impl MockVenue {
    pub async fn start() -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (received_tx, received) = mpsc::unbounded_channel();
        let connections = Arc::new(AtomicUsize::new(0));
        let (kill_tx, _) = broadcast::channel(4);

        let accept_connections = Arc::clone(&connections);
        let accept_kill = kill_tx.clone();
        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(_) => return,
                };
                let kill_rx = accept_kill.subscribe();
                tokio::spawn(serve(
                    stream,
                    received_tx.clone(),
                    Arc::clone(&accept_connections),
                    kill_rx,
                ));
            }
        });

        Ok(Self {
            url: format!("ws://{addr}"),
            received,
            connections,
            kill_tx,
        })
    }

    /// Number of WebSocket sessions accepted so far.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Abruptly drop every open session.
    pub fn drop_connections(&self) {
        let _ = self.kill_tx.send(());
    }

    /// Next request the venue received.
    pub async fn next_request(&mut self) -> Option<Value> {
        timeout(Duration::from_secs(5), self.received.recv())
            .await
            .ok()
            .flatten()
    }

    /// Wait for a request carrying `key`, skipping others.
    pub async fn wait_for_request(&mut self, key: &str) -> Option<Value> {
        loop {
            let request = self.next_request().await?;
            if request.get(key).is_some() {
                return Some(request);
            }
        }
    }
}

async fn serve(
    stream: TcpStream,
    received: mpsc::UnboundedSender<Value>,
    connections: Arc<AtomicUsize>,
    mut kill_rx: broadcast::Receiver<()>,
) {
    let Ok(ws) = accept_async(stream).await else {
        return;
    };
    connections.fetch_add(1, Ordering::SeqCst);

    let (mut sink, mut source) = ws.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            _ = kill_rx.recv() => break,
            frame = source.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let Ok(request) = serde_json::from_str::<Value>(&text) else {
                        continue;
                    };
                    let _ = received.send(request.clone());
                    respond(request, &out_tx);
                }
                Some(Ok(_)) => {}
                _ => break,
            },
        }
    }

    writer.abort();
}

fn send(out_tx: &mpsc::UnboundedSender<Message>, value: Value) {
    let _ = out_tx.send(Message::Text(value.to_string()));
}

fn respond(request: Value, out_tx: &mpsc::UnboundedSender<Message>) {
    let Some(req_id) = request.get("req_id").and_then(Value::as_u64) else {
        return;
    };

    if let Some(token) = request.get("authorize") {
        if token == "good" {
            send(
                out_tx,
                json!({"msg_type": "authorize", "authorize": {"loginid": "CR1"}, "req_id": req_id}),
            );
        } else {
            send(
                out_tx,
                json!({
                    "msg_type": "authorize",
                    "error": {"code": "InvalidToken", "message": "The token is invalid."},
                    "req_id": req_id
                }),
            );
        }
    } else if request.get("ticks").is_some() {
        let quotes = if request.get("repeat") == Some(&Value::Bool(true)) {
            vec![1, 1, 2]
        } else {
            vec![1, 2, 3]
        };
        for quote in quotes {
            send(
                out_tx,
                json!({
                    "msg_type": "tick",
                    "tick": {"quote": quote},
                    "subscription": {"id": format!("stream-{req_id}")},
                    "req_id": req_id
                }),
            );
        }
    } else if let Some(stream_id) = request.get("forget") {
        send(
            out_tx,
            json!({"msg_type": "forget", "forget": 1, "echo": stream_id, "req_id": req_id}),
        );
    } else if let Some(kind) = request.get("forget_all") {
        send(
            out_tx,
            json!({"msg_type": "forget_all", "forget_all": [], "echo": kind, "req_id": req_id}),
        );
    } else if request.get("silent").is_some() {
        // never answered
    } else if request.get("reject").is_some() {
        send(
            out_tx,
            json!({
                "msg_type": "reject",
                "error": {"code": "InputValidationFailed", "message": "Input validation failed"},
                "req_id": req_id
            }),
        );
    } else if let Some(delay) = request.get("delay_ms").and_then(Value::as_u64) {
        let out_tx = out_tx.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(delay)).await;
            send(&out_tx, json!({"msg_type": "echo", "echo": request, "req_id": req_id}));
        });
    } else {
        send(
            out_tx,
            json!({"msg_type": "echo", "echo": request, "req_id": req_id}),
        );
    }
}
