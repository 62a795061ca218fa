//! Websocket multiplexer for the DevTools protocol.
//!
//! One connection serves the whole browser. Responses are matched to
//! requests by `id`; events fan out to subscribers over a broadcast
//! channel and are filtered by `sessionId` at the receiving end.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;

use bd_domain::error::{Error, Result};

/// Hard ceiling for a single protocol command round trip.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct CdpEvent {
    pub method: String,
    pub params: Value,
    pub session_id: Option<String>,
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value>>>>>;

pub struct CdpConnection {
    out_tx: mpsc::UnboundedSender<String>,
    pending: PendingMap,
    event_tx: broadcast::Sender<CdpEvent>,
    next_id: AtomicU64,
}

impl CdpConnection {
    /// Connect to the browser's DevTools websocket and start the reader
    /// and writer pumps.
    pub async fn connect(ws_url: &str) -> Result<Arc<Self>> {
        let (ws, _) = tokio_tungstenite::connect_async(ws_url)
            .await
            .map_err(|e| Error::Driver(format!("websocket connect failed: {e}")))?;
        let (mut sink, mut stream) = ws.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (event_tx, _) = broadcast::channel(1024);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));

        let conn = Arc::new(Self {
            out_tx,
            pending: pending.clone(),
            event_tx: event_tx.clone(),
            next_id: AtomicU64::new(1),
        });

        // Writer pump.
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Err(e) = sink.send(Message::Text(frame)).await {
                    tracing::warn!(error = %e, "CDP websocket write failed");
                    break;
                }
            }
        });

        // Reader pump: route responses by id, fan events out.
        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                let value: Value = match serde_json::from_str(&text) {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::warn!(error = %e, "unparseable CDP frame");
                        continue;
                    }
                };

                if let Some(id) = value.get("id").and_then(Value::as_u64) {
                    let tx = pending.lock().remove(&id);
                    if let Some(tx) = tx {
                        let outcome = match value.get("error") {
                            Some(err) => Err(Error::Driver(
                                err.get("message")
                                    .and_then(Value::as_str)
                                    .unwrap_or("unknown CDP error")
                                    .to_string(),
                            )),
                            None => Ok(value.get("result").cloned().unwrap_or(Value::Null)),
                        };
                        let _ = tx.send(outcome);
                    }
                } else if let Some(method) = value.get("method").and_then(Value::as_str) {
                    let _ = event_tx.send(CdpEvent {
                        method: method.to_string(),
                        params: value.get("params").cloned().unwrap_or(Value::Null),
                        session_id: value
                            .get("sessionId")
                            .and_then(Value::as_str)
                            .map(str::to_string),
                    });
                }
            }
            // Connection gone: fail every caller still waiting.
            let mut map = pending.lock();
            for (_, tx) in map.drain() {
                let _ = tx.send(Err(Error::Driver("CDP connection closed".into())));
            }
            tracing::debug!("CDP reader pump finished");
        });

        Ok(conn)
    }

    /// Send a command, optionally scoped to a page session, and wait for
    /// its response.
    pub async fn send(
        &self,
        method: &str,
        params: Value,
        session_id: Option<&str>,
    ) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut frame = json!({ "id": id, "method": method, "params": params });
        if let Some(session) = session_id {
            frame["sessionId"] = json!(session);
        }

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        if self.out_tx.send(frame.to_string()).is_err() {
            self.pending.lock().remove(&id);
            return Err(Error::Driver("CDP connection closed".into()));
        }

        match tokio::time::timeout(COMMAND_TIMEOUT, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(Error::Driver("CDP response channel dropped".into())),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(Error::Driver(format!("CDP command timed out: {method}")))
            }
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<CdpEvent> {
        self.event_tx.subscribe()
    }
}
