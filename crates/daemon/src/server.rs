//! Framed TCP server.
//!
//! Newline-delimited UTF-8 JSON, one object per line in each direction.
//! Every accepted request yields exactly one response line; errors are
//! in-band and never close the connection. Each connection is one
//! cooperative task; within a connection, responses come back in
//! request order because the handler is awaited per message.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use bd_domain::error::{Error, Result};
use bd_domain::response::Response;

use crate::paths::StatePaths;

#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: Value) -> Response;
}

pub struct TcpServer {
    paths: Arc<StatePaths>,
    handler: Arc<dyn RequestHandler>,
}

impl TcpServer {
    pub fn new(paths: Arc<StatePaths>, handler: Arc<dyn RequestHandler>) -> Self {
        Self { paths, handler }
    }

    /// Bind, publish the pid/port rendezvous files, and serve until the
    /// shutdown token fires. The rendezvous files are removed on the
    /// way out.
    pub async fn run(&self, port: u16, shutdown: CancellationToken) -> Result<()> {
        let addr = format!("127.0.0.1:{port}");
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::Fatal(format!("cannot bind {addr}: {e}")))?;
        let local_port = listener
            .local_addr()
            .map_err(|e| Error::Fatal(format!("cannot read local addr: {e}")))?
            .port();

        self.paths.write_pid()?;
        self.paths.write_port(local_port)?;
        tracing::info!(port = local_port, instance = %self.paths.instance_id, "browserd listening");

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((socket, peer)) => {
                            tracing::debug!(%peer, "connection accepted");
                            let paths = self.paths.clone();
                            let handler = self.handler.clone();
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(socket, paths, handler).await {
                                    tracing::debug!(error = %e, "connection ended with error");
                                }
                            });
                        }
                        Err(e) => tracing::warn!(error = %e, "accept failed"),
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }

        self.paths.remove_runtime_files();
        tracing::info!("server stopped");
        Ok(())
    }
}

/// One connection: read lines, answer each with exactly one line.
async fn serve_connection(
    socket: TcpStream,
    paths: Arc<StatePaths>,
    handler: Arc<dyn RequestHandler>,
) -> Result<()> {
    let (read_half, mut write_half) = socket.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = respond_to_line(&line, &paths, handler.as_ref()).await;
        let mut serialized = serde_json::to_string(&response)
            .unwrap_or_else(|_| r#"{"status":"error","message":"serialization failed"}"#.into());
        serialized.push('\n');
        write_half.write_all(serialized.as_bytes()).await?;
    }
    Ok(())
}

async fn respond_to_line(
    line: &str,
    paths: &StatePaths,
    handler: &dyn RequestHandler,
) -> Response {
    // 1. Parse.
    let request: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(e) => return Response::from(&Error::Parse(e.to_string())),
    };

    // 2. Authenticate against the token currently on disk. The feature
    //    layer is never reached on a mismatch.
    let presented = request.get("token").and_then(Value::as_str).unwrap_or("");
    if !paths.token_matches(presented) {
        return Response::from(&Error::Auth);
    }

    // 3. Dispatch.
    handler.handle(request).await
}
