//! Plugin child-process transport.
//!
//! Each invocation is one newline-delimited JSON exchange: the host
//! writes `{"id", "type", "name", "payload"}` to the plugin's stdin and
//! reads lines until the matching `id` comes back. The plugin's stdio
//! is bundled behind a single async mutex, so concurrent callers
//! serialize whole exchanges, and everything inside an exchange —
//! including skipping noise the plugin prints to stdout — is bounded by
//! the per-invocation timeout.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::Mutex;

use bd_domain::error::{Error, Result};

/// How long `shutdown` waits for a plugin to exit on its own after its
/// stdin closes, before killing it.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Interpreter for each allowed entry extension.
fn interpreter_for(extension: &str) -> Result<&'static str> {
    match extension {
        "js" | "mjs" | "cjs" => Ok("node"),
        "py" => Ok("python3"),
        "sh" => Ok("sh"),
        other => Err(Error::Plugin(format!("no interpreter for .{other}"))),
    }
}

/// The plugin's stdio and request counter, bundled so one lock covers a
/// full request/response exchange.
struct PluginPipe {
    writer: ChildStdin,
    reader: BufReader<ChildStdout>,
    next_id: u64,
}

pub struct PluginProcess {
    /// `None` once the plugin has exited or been shut down; dropping
    /// the pipe closes the plugin's stdin.
    pipe: Mutex<Option<PluginPipe>>,
    child: Mutex<Option<Child>>,
    gone: AtomicBool,
}

impl PluginProcess {
    /// Spawn the plugin entry with its interpreter, cwd'd to the plugin
    /// directory.
    pub fn spawn(plugin_dir: &Path, entry: &Path) -> Result<Self> {
        let extension = entry
            .extension()
            .and_then(|e| e.to_str())
            .ok_or_else(|| Error::Plugin("entry has no extension".into()))?;
        let interpreter = interpreter_for(extension)?;

        let mut child = tokio::process::Command::new(interpreter)
            .arg(entry)
            .current_dir(plugin_dir)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Plugin(format!("failed to spawn plugin: {e}")))?;

        let writer = child
            .stdin
            .take()
            .ok_or_else(|| Error::Plugin("failed to capture plugin stdin".into()))?;
        let reader = child
            .stdout
            .take()
            .ok_or_else(|| Error::Plugin("failed to capture plugin stdout".into()))?;

        Ok(Self {
            pipe: Mutex::new(Some(PluginPipe {
                writer,
                reader: BufReader::new(reader),
                next_id: 0,
            })),
            child: Mutex::new(Some(child)),
            gone: AtomicBool::new(false),
        })
    }

    pub fn is_alive(&self) -> bool {
        !self.gone.load(Ordering::SeqCst)
    }

    fn exited(&self) -> Error {
        self.gone.store(true, Ordering::SeqCst);
        Error::Plugin("plugin process has exited".into())
    }

    /// One command or hook invocation, raced against `timeout`.
    pub async fn invoke(
        &self,
        plugin_name: &str,
        kind: &str,
        name: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value> {
        let response = tokio::time::timeout(timeout, self.exchange(kind, name, payload))
            .await
            .map_err(|_| Error::PluginTimeout(plugin_name.to_string(), timeout.as_secs()))??;

        if let Some(error) = response.get("error").and_then(Value::as_str) {
            return Err(Error::Plugin(format!("{plugin_name}: {error}")));
        }
        Ok(response.get("result").cloned().unwrap_or(Value::Null))
    }

    /// Write one request and read until its response id comes back.
    /// A response abandoned by an earlier timed-out call carries a
    /// stale id and is skipped here.
    async fn exchange(&self, kind: &str, name: &str, payload: Value) -> Result<Value> {
        let mut slot = self.pipe.lock().await;
        let pipe = slot
            .as_mut()
            .ok_or_else(|| Error::Plugin("plugin process has exited".into()))?;

        pipe.next_id += 1;
        let id = pipe.next_id;
        let frame = json!({ "id": id, "type": kind, "name": name, "payload": payload }).to_string();

        if pipe.writer.write_all(frame.as_bytes()).await.is_err()
            || pipe.writer.write_all(b"\n").await.is_err()
            || pipe.writer.flush().await.is_err()
        {
            *slot = None;
            return Err(self.exited());
        }

        let mut line = String::new();
        loop {
            line.clear();
            if pipe.reader.read_line(&mut line).await? == 0 {
                *slot = None;
                return Err(self.exited());
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let value: Value = match serde_json::from_str(trimmed) {
                Ok(value) => value,
                Err(_) => {
                    // Log noise on stdout; the invocation timeout
                    // bounds how long this can go on.
                    tracing::debug!(line = %trimmed, "ignoring non-JSON plugin output");
                    continue;
                }
            };
            if value.get("id").and_then(Value::as_u64) == Some(id) {
                return Ok(value);
            }
            tracing::debug!(stale_id = ?value.get("id"), "skipping stale plugin response");
        }
    }

    /// Close the plugin's stdin and give it a moment to exit on its
    /// own; kill it if it does not. Idempotent.
    pub async fn shutdown(&self) {
        *self.pipe.lock().await = None;
        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            if tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await.is_err() {
                if let Err(e) = child.kill().await {
                    tracing::debug!(error = %e, "plugin kill failed (already gone?)");
                }
            }
        }
        self.gone.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Echo plugin: answers every request with `{"ok":true}` and exits
    /// when its stdin closes.
    const ECHO_PLUGIN: &str = r#"#!/bin/sh
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  printf '{"id":%s,"result":{"ok":true}}\n' "$id"
done
"#;

    fn write_plugin(dir: &Path, script: &str) -> std::path::PathBuf {
        let entry = dir.join("main.sh");
        std::fs::write(&entry, script).unwrap();
        entry
    }

    #[tokio::test]
    async fn invoke_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let entry = write_plugin(tmp.path(), ECHO_PLUGIN);
        let process = PluginProcess::spawn(tmp.path(), &entry).unwrap();

        let result = process
            .invoke("demo", "command", "x", json!({}), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result["ok"], true);

        process.shutdown().await;
        assert!(!process.is_alive());
    }

    #[tokio::test]
    async fn cooperative_plugin_exits_on_stdin_close() {
        let tmp = tempfile::tempdir().unwrap();
        let entry = write_plugin(tmp.path(), ECHO_PLUGIN);
        let process = PluginProcess::spawn(tmp.path(), &entry).unwrap();

        // The read loop ends at EOF, so shutdown's grace wait succeeds
        // without a kill.
        let started = std::time::Instant::now();
        process.shutdown().await;
        assert!(started.elapsed() < SHUTDOWN_GRACE);
        assert!(!process.is_alive());

        // Further invocations refuse cleanly.
        let err = process
            .invoke("demo", "command", "x", json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exited"));
    }

    #[tokio::test]
    async fn slow_plugin_times_out() {
        let tmp = tempfile::tempdir().unwrap();
        let entry = write_plugin(tmp.path(), "#!/bin/sh\nwhile true; do sleep 1; done\n");
        let process = PluginProcess::spawn(tmp.path(), &entry).unwrap();

        let err = process
            .invoke("demo", "command", "x", json!({}), Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PluginTimeout(..)));
        process.shutdown().await;
    }

    #[tokio::test]
    async fn error_field_becomes_plugin_error() {
        let tmp = tempfile::tempdir().unwrap();
        let script = r#"#!/bin/sh
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  printf '{"id":%s,"error":"nope"}\n' "$id"
done
"#;
        let entry = write_plugin(tmp.path(), script);
        let process = PluginProcess::spawn(tmp.path(), &entry).unwrap();

        let err = process
            .invoke("demo", "command", "x", json!({}), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("nope"));
        process.shutdown().await;
    }

    #[tokio::test]
    async fn noisy_plugin_output_is_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let script = r#"#!/bin/sh
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  echo "starting up..."
  echo "[debug] handling request"
  printf '{"id":%s,"result":{"ok":true}}\n' "$id"
done
"#;
        let entry = write_plugin(tmp.path(), script);
        let process = PluginProcess::spawn(tmp.path(), &entry).unwrap();

        let result = process
            .invoke("demo", "command", "x", json!({}), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result["ok"], true);
        process.shutdown().await;
    }

    #[tokio::test]
    async fn exited_plugin_reports_dead() {
        let tmp = tempfile::tempdir().unwrap();
        let entry = write_plugin(tmp.path(), "#!/bin/sh\nexit 0\n");
        let process = PluginProcess::spawn(tmp.path(), &entry).unwrap();

        let err = process
            .invoke("demo", "command", "x", json!({}), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exited"));
        assert!(!process.is_alive());
    }
}
