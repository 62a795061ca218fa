//! Parallel test orchestrator.
//!
//! Spawns N peer daemons with disjoint ports and instance IDs, deals
//! the discovered tests round-robin across them, runs each test script
//! against its peer over the wire protocol, and folds the results.
//!
//! A test script is a JSON file: `{ "name"?, "commands": [{cmd, args}] }`.
//! The test passes when every command answers `status:"ok"`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use bd_domain::config::OrchestratorConfig;
use bd_domain::error::{Error, Result};
use bd_domain::trace::TraceEvent;

use crate::paths::StatePaths;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Results
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Passed,
    Failed,
    Error,
    TimedOut,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    pub file: String,
    pub instance_id: String,
    pub status: TestStatus,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSummary {
    pub instance_id: String,
    pub browser_port: u16,
    pub vite_port: u16,
    pub tests: usize,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorReport {
    pub passed: usize,
    pub failed: usize,
    pub errors: usize,
    pub pass_rate: f64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub instances: Vec<InstanceSummary>,
    pub results: Vec<TestResult>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Port / instance allocation & partitioning
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceSlot {
    pub instance_id: String,
    pub browser_port: u16,
    pub vite_port: u16,
}

/// Disjoint `(browser_port, vite_port, instance_id)` triples from the
/// configured bases.
pub fn allocate_slots(config: &OrchestratorConfig, count: usize) -> Vec<InstanceSlot> {
    (0..count)
        .map(|i| InstanceSlot {
            instance_id: format!("parallel-{}", i + 1),
            browser_port: config.browser_port_base + i as u16,
            vite_port: config.vite_port_base + i as u16,
        })
        .collect()
}

/// Deal tests round-robin across `count` queues.
pub fn partition_round_robin(tests: &[PathBuf], count: usize) -> Vec<Vec<PathBuf>> {
    let mut queues = vec![Vec::new(); count.max(1)];
    let n = queues.len();
    for (i, test) in tests.iter().enumerate() {
        queues[i % n].push(test.clone());
    }
    queues
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Orchestrator
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct Orchestrator {
    config: OrchestratorConfig,
    base_dir: PathBuf,
    /// The daemon binary to spawn as peers; normally `current_exe`.
    binary: PathBuf,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig, base_dir: PathBuf, binary: PathBuf) -> Self {
        Self {
            config,
            base_dir,
            binary,
        }
    }

    /// Discover tests for a glob pattern, sorted for determinism.
    pub fn discover_tests(pattern: &str) -> Result<Vec<PathBuf>> {
        let paths = glob::glob(pattern)
            .map_err(|e| Error::Handler(format!("bad glob pattern: {e}")))?;
        let mut tests: Vec<PathBuf> = paths
            .filter_map(|entry| match entry {
                Ok(path) if path.is_file() => Some(path),
                Ok(_) => None,
                Err(e) => {
                    tracing::warn!(error = %e, "skipping unreadable glob entry");
                    None
                }
            })
            .collect();
        tests.sort();
        Ok(tests)
    }

    pub async fn run(
        &self,
        pattern: &str,
        instances: usize,
        abort: CancellationToken,
    ) -> Result<OrchestratorReport> {
        let started_at = Utc::now();
        let tests = Self::discover_tests(pattern)?;
        if tests.is_empty() {
            return Err(Error::Handler(format!("no tests match {pattern}")));
        }
        let instances = instances.clamp(1, tests.len());
        let slots = allocate_slots(&self.config, instances);
        let queues = partition_round_robin(&tests, instances);

        // Spawn every peer, then fan the queues out.
        let mut peers = Vec::with_capacity(slots.len());
        for slot in &slots {
            peers.push(self.spawn_peer(slot).await?);
        }

        let mut handles = Vec::new();
        for (peer, queue) in peers.iter().zip(queues.into_iter()) {
            let peer = peer.clone();
            let abort = abort.clone();
            let timeout = Duration::from_secs(self.config.test_timeout_sec);
            let continue_on_failure = self.config.continue_on_failure;
            handles.push(tokio::spawn(async move {
                run_instance_queue(peer, queue, timeout, continue_on_failure, abort).await
            }));
        }

        let mut results = Vec::new();
        let mut summaries = Vec::new();
        for ((handle, slot), peer) in handles.into_iter().zip(slots.iter()).zip(peers.iter()) {
            let instance_results = handle
                .await
                .unwrap_or_else(|e| {
                    vec![TestResult {
                        file: "<instance>".into(),
                        instance_id: slot.instance_id.clone(),
                        status: TestStatus::Error,
                        duration_ms: 0,
                        detail: Some(format!("instance task panicked: {e}")),
                    }]
                });
            let duration_ms = instance_results.iter().map(|r| r.duration_ms).sum::<u64>();
            let passed = instance_results
                .iter()
                .filter(|r| r.status == TestStatus::Passed)
                .count();
            TraceEvent::OrchestratorInstanceFinished {
                instance_id: slot.instance_id.clone(),
                passed,
                failed: instance_results.len() - passed,
                errors: instance_results
                    .iter()
                    .filter(|r| matches!(r.status, TestStatus::Error | TestStatus::TimedOut))
                    .count(),
                duration_ms,
            }
            .emit();
            summaries.push(InstanceSummary {
                instance_id: slot.instance_id.clone(),
                browser_port: slot.browser_port,
                vite_port: slot.vite_port,
                tests: instance_results.len(),
                duration_ms,
            });
            results.extend(instance_results);
            peer.shutdown().await;
        }

        let passed = results.iter().filter(|r| r.status == TestStatus::Passed).count();
        let failed = results.iter().filter(|r| r.status == TestStatus::Failed).count();
        let errors = results
            .iter()
            .filter(|r| matches!(r.status, TestStatus::Error | TestStatus::TimedOut))
            .count();
        let graded = passed + failed + errors;
        Ok(OrchestratorReport {
            passed,
            failed,
            errors,
            pass_rate: if graded == 0 {
                0.0
            } else {
                passed as f64 / graded as f64
            },
            started_at,
            finished_at: Utc::now(),
            instances: summaries,
            results,
        })
    }

    async fn spawn_peer(&self, slot: &InstanceSlot) -> Result<PeerDaemon> {
        let mut cmd = tokio::process::Command::new(&self.binary);
        cmd.arg("serve")
            .env("BROWSER_INSTANCE", &slot.instance_id)
            .env("BROWSER_PORT", slot.browser_port.to_string())
            .env("VITE_PORT", slot.vite_port.to_string())
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);
        let child = cmd
            .spawn()
            .map_err(|e| Error::Other(format!("cannot spawn peer daemon: {e}")))?;

        let paths = StatePaths::resolve(&self.base_dir, &slot.instance_id);
        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(self.config.ready_timeout_sec);
        let port = loop {
            if let Ok(port) = paths.read_port() {
                break port;
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Other(format!(
                    "peer {} did not publish its port in time",
                    slot.instance_id
                )));
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        };

        Ok(PeerDaemon {
            inner: Arc::new(PeerInner {
                instance_id: slot.instance_id.clone(),
                port,
                paths,
                child: tokio::sync::Mutex::new(Some(child)),
            }),
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Peer daemon client
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct PeerInner {
    instance_id: String,
    port: u16,
    paths: StatePaths,
    child: tokio::sync::Mutex<Option<tokio::process::Child>>,
}

#[derive(Clone)]
pub struct PeerDaemon {
    inner: Arc<PeerInner>,
}

impl PeerDaemon {
    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    /// Run one test script file against this peer.
    async fn run_test(&self, file: &Path) -> Result<TestStatus> {
        let raw = std::fs::read_to_string(file)?;
        let script: Value = serde_json::from_str(&raw)
            .map_err(|e| Error::Handler(format!("test file is not JSON: {e}")))?;
        let commands = script
            .get("commands")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::Handler("test file has no commands array".into()))?;

        let token = self.inner.paths.read_token()?;
        let stream = TcpStream::connect(("127.0.0.1", self.inner.port)).await?;
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        for entry in commands {
            let mut request = entry.get("args").cloned().unwrap_or_else(|| json!({}));
            if !request.is_object() {
                return Err(Error::Handler("test entry args must be an object".into()));
            }
            request["cmd"] = entry.get("cmd").cloned().unwrap_or(Value::Null);
            request["token"] = json!(token);

            write_half
                .write_all(format!("{request}\n").as_bytes())
                .await?;
            let line = lines
                .next_line()
                .await?
                .ok_or_else(|| Error::Other("peer closed the connection".into()))?;
            let response: Value = serde_json::from_str(&line)?;
            if response["status"] != "ok" {
                tracing::debug!(
                    instance = %self.inner.instance_id,
                    cmd = %request["cmd"],
                    message = %response["message"],
                    "test command failed"
                );
                return Ok(TestStatus::Failed);
            }
        }
        Ok(TestStatus::Passed)
    }

    /// Kill the peer and remove its instance state directory.
    pub async fn shutdown(&self) {
        if let Some(mut child) = self.inner.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                tracing::debug!(error = %e, "peer kill failed (already gone?)");
            }
        }
        if self.inner.paths.instance_id != crate::paths::DEFAULT_INSTANCE {
            if let Err(e) = std::fs::remove_dir_all(&self.inner.paths.state_dir) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::debug!(error = %e, "peer state dir cleanup failed");
                }
            }
        }
    }
}

/// Drain one instance's queue. An abort stops dispatching new tests
/// (in-flight tests settle); a failing test stops the queue unless
/// `continue_on_failure`.
async fn run_instance_queue(
    peer: PeerDaemon,
    queue: Vec<PathBuf>,
    timeout: Duration,
    continue_on_failure: bool,
    abort: CancellationToken,
) -> Vec<TestResult> {
    let mut results = Vec::with_capacity(queue.len());
    let mut stopped = false;
    for file in queue {
        let display = file.display().to_string();
        if stopped || abort.is_cancelled() {
            results.push(TestResult {
                file: display,
                instance_id: peer.instance_id().to_string(),
                status: TestStatus::Skipped,
                duration_ms: 0,
                detail: Some("not dispatched".into()),
            });
            continue;
        }

        let started = std::time::Instant::now();
        let (status, detail) = match tokio::time::timeout(timeout, peer.run_test(&file)).await {
            Ok(Ok(status)) => (status, None),
            Ok(Err(e)) => (TestStatus::Error, Some(e.to_string())),
            Err(_) => (
                TestStatus::TimedOut,
                Some(format!("exceeded {}s", timeout.as_secs())),
            ),
        };
        if status != TestStatus::Passed && !continue_on_failure {
            stopped = true;
        }
        results.push(TestResult {
            file: display,
            instance_id: peer.instance_id().to_string(),
            status,
            duration_ms: started.elapsed().as_millis() as u64,
            detail,
        });
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_are_disjoint() {
        let config = OrchestratorConfig::default();
        let slots = allocate_slots(&config, 3);
        assert_eq!(slots.len(), 3);
        assert_eq!(slots[0].instance_id, "parallel-1");
        assert_eq!(slots[0].browser_port, config.browser_port_base);
        assert_eq!(slots[2].browser_port, config.browser_port_base + 2);
        assert_eq!(slots[1].vite_port, config.vite_port_base + 1);

        let mut ids: Vec<_> = slots.iter().map(|s| &s.instance_id).collect();
        ids.dedup();
        assert_eq!(ids.len(), 3);
    }

    #[test]
    fn round_robin_deals_evenly() {
        let tests: Vec<PathBuf> = (0..7).map(|i| PathBuf::from(format!("t{i}.json"))).collect();
        let queues = partition_round_robin(&tests, 3);
        assert_eq!(queues[0].len(), 3);
        assert_eq!(queues[1].len(), 2);
        assert_eq!(queues[2].len(), 2);
        assert_eq!(queues[0][0], PathBuf::from("t0.json"));
        assert_eq!(queues[1][0], PathBuf::from("t1.json"));
        assert_eq!(queues[0][1], PathBuf::from("t3.json"));
    }

    #[test]
    fn round_robin_with_zero_instances_does_not_panic() {
        let tests = vec![PathBuf::from("t.json")];
        let queues = partition_round_robin(&tests, 0);
        assert_eq!(queues.len(), 1);
        assert_eq!(queues[0].len(), 1);
    }

    #[test]
    fn discover_tests_sorts_matches() {
        let tmp = tempfile::tempdir().unwrap();
        for name in ["b.json", "a.json", "c.txt"] {
            std::fs::write(tmp.path().join(name), "{}").unwrap();
        }
        let pattern = format!("{}/*.json", tmp.path().display());
        let tests = Orchestrator::discover_tests(&pattern).unwrap();
        assert_eq!(tests.len(), 2);
        assert!(tests[0].ends_with("a.json"));
        assert!(tests[1].ends_with("b.json"));
    }
}
