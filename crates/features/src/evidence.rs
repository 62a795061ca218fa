//! Evidence chains.
//!
//! A chain records a requirement and its analysis, implementation and
//! validation phases, each attributed to an agent and a task, with
//! bidirectional upstream/downstream/verification links. Chains persist
//! to `evidence.json` in the instance state directory.

use std::any::Any;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use bd_domain::error::{Error, Result};
use bd_domain::response::Response;

use crate::{Feature, FeatureContext};

pub const NAME: &str = "evidenceChain";
pub const COMMANDS: &[&str] = &["evidenceRecord", "evidenceLink", "evidenceStatus"];

const PHASES: &[&str] = &["analysis", "implementation", "validation"];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseRecord {
    pub agent_id: String,
    pub task_id: String,
    pub recorded_at: DateTime<Utc>,
    #[serde(default)]
    pub acceptance_criteria_total: usize,
    #[serde(default)]
    pub acceptance_criteria_verified: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChainLinks {
    #[serde(default)]
    pub upstream: Vec<String>,
    #[serde(default)]
    pub downstream: Vec<String>,
    #[serde(default)]
    pub verification: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvidenceChainRecord {
    pub id: String,
    /// Immutable once recorded.
    pub requirement: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub phases: HashMap<String, PhaseRecord>,
    #[serde(default)]
    pub links: ChainLinks,
}

pub struct EvidenceChain {
    path: PathBuf,
    chains: Mutex<HashMap<String, EvidenceChainRecord>>,
}

impl EvidenceChain {
    pub fn new(ctx: &FeatureContext) -> Result<Self> {
        let path = ctx.state_dir.join("evidence.json");
        let chains = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            serde_json::from_str(&raw).unwrap_or_default()
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            chains: Mutex::new(chains),
        })
    }

    fn flush(&self) -> Result<()> {
        let chains = self.chains.lock();
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(&*chains)?)?;
        Ok(())
    }
}

#[async_trait]
impl Feature for EvidenceChain {
    fn name(&self) -> &'static str {
        NAME
    }

    fn commands(&self) -> &'static [&'static str] {
        COMMANDS
    }

    async fn handle(&self, cmd: &str, args: &Value) -> Result<Response> {
        match cmd {
            "evidenceRecord" => {
                // Either creates a chain (requirement given) or records a
                // phase on an existing one.
                if let Some(requirement) = args.get("requirement").and_then(Value::as_str) {
                    let id = uuid::Uuid::new_v4().to_string();
                    let record = EvidenceChainRecord {
                        id: id.clone(),
                        requirement: requirement.to_string(),
                        created_at: Utc::now(),
                        phases: HashMap::new(),
                        links: ChainLinks::default(),
                    };
                    self.chains.lock().insert(id.clone(), record);
                    self.flush()?;
                    return Ok(Response::ok(json!({ "id": id })));
                }

                let id = args
                    .get("id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::Handler("requirement or id is required".into()))?;
                let phase = args
                    .get("phase")
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::Handler("phase is required".into()))?;
                if !PHASES.contains(&phase) {
                    return Err(Error::Handler(format!(
                        "unknown phase: {phase} (expected one of {})",
                        PHASES.join(", ")
                    )));
                }
                let record = PhaseRecord {
                    agent_id: args
                        .get("agentId")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown")
                        .to_string(),
                    task_id: args
                        .get("taskId")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown")
                        .to_string(),
                    recorded_at: Utc::now(),
                    acceptance_criteria_total: args
                        .get("acceptanceCriteriaTotal")
                        .and_then(Value::as_u64)
                        .unwrap_or(0) as usize,
                    acceptance_criteria_verified: args
                        .get("acceptanceCriteriaVerified")
                        .and_then(Value::as_u64)
                        .unwrap_or(0) as usize,
                };
                {
                    let mut chains = self.chains.lock();
                    let chain = chains
                        .get_mut(id)
                        .ok_or_else(|| Error::Handler(format!("no chain with id {id}")))?;
                    chain.phases.insert(phase.to_string(), record);
                }
                self.flush()?;
                Ok(Response::ok(json!({ "id": id, "phase": phase })))
            }
            "evidenceLink" => {
                let from = args
                    .get("from")
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::Handler("from is required".into()))?;
                let to = args
                    .get("to")
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::Handler("to is required".into()))?;
                let kind = args
                    .get("kind")
                    .and_then(Value::as_str)
                    .unwrap_or("downstream");

                {
                    let mut chains = self.chains.lock();
                    if !chains.contains_key(from) {
                        return Err(Error::Handler(format!("no chain with id {from}")));
                    }
                    if !chains.contains_key(to) {
                        return Err(Error::Handler(format!("no chain with id {to}")));
                    }
                    match kind {
                        // Links are bidirectional: the inverse edge is
                        // written on the other chain.
                        "downstream" => {
                            chains.get_mut(from).map(|c| c.links.downstream.push(to.into()));
                            chains.get_mut(to).map(|c| c.links.upstream.push(from.into()));
                        }
                        "upstream" => {
                            chains.get_mut(from).map(|c| c.links.upstream.push(to.into()));
                            chains.get_mut(to).map(|c| c.links.downstream.push(from.into()));
                        }
                        "verification" => {
                            chains.get_mut(from).map(|c| c.links.verification.push(to.into()));
                            chains.get_mut(to).map(|c| c.links.verification.push(from.into()));
                        }
                        other => {
                            return Err(Error::Handler(format!("unknown link kind: {other}")));
                        }
                    }
                }
                self.flush()?;
                Ok(Response::ok(json!({ "from": from, "to": to, "kind": kind })))
            }
            "evidenceStatus" => {
                let chains = self.chains.lock();
                let total = chains.len();
                let mut phase_slots = 0usize;
                let mut criteria_total = 0usize;
                let mut criteria_verified = 0usize;
                for chain in chains.values() {
                    phase_slots += chain.phases.len();
                    for phase in chain.phases.values() {
                        criteria_total += phase.acceptance_criteria_total;
                        criteria_verified += phase.acceptance_criteria_verified;
                    }
                }
                let coverage = if total == 0 {
                    0.0
                } else {
                    phase_slots as f64 / (total * PHASES.len()) as f64 * 100.0
                };
                Ok(Response::ok(json!({
                    "chains": total,
                    "coveragePercent": (coverage * 10.0).round() / 10.0,
                    "acceptanceCriteria": {
                        "total": criteria_total,
                        "verified": criteria_verified,
                    },
                })))
            }
            _ => Err(Error::UnknownCommand(cmd.to_string())),
        }
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make(dir: &std::path::Path) -> EvidenceChain {
        let ctx = FeatureContext::new(dir.to_path_buf(), Default::default(), Default::default());
        EvidenceChain::new(&ctx).unwrap()
    }

    #[tokio::test]
    async fn record_phases_and_status() {
        let tmp = tempfile::tempdir().unwrap();
        let evidence = make(tmp.path());

        let resp = evidence
            .handle("evidenceRecord", &json!({"requirement": "login works"}))
            .await
            .unwrap();
        let id = resp.data.unwrap()["id"].as_str().unwrap().to_string();

        evidence
            .handle(
                "evidenceRecord",
                &json!({"id": id, "phase": "analysis", "agentId": "a1", "taskId": "t1"}),
            )
            .await
            .unwrap();
        evidence
            .handle(
                "evidenceRecord",
                &json!({"id": id, "phase": "validation", "agentId": "a2", "taskId": "t2",
                        "acceptanceCriteriaTotal": 4, "acceptanceCriteriaVerified": 3}),
            )
            .await
            .unwrap();

        let resp = evidence.handle("evidenceStatus", &json!({})).await.unwrap();
        let data = resp.data.unwrap();
        assert_eq!(data["chains"], 1);
        assert_eq!(data["coveragePercent"], 66.7);
        assert_eq!(data["acceptanceCriteria"]["verified"], 3);
    }

    #[tokio::test]
    async fn links_are_bidirectional() {
        let tmp = tempfile::tempdir().unwrap();
        let evidence = make(tmp.path());
        let a = evidence
            .handle("evidenceRecord", &json!({"requirement": "A"}))
            .await
            .unwrap()
            .data
            .unwrap()["id"]
            .as_str()
            .unwrap()
            .to_string();
        let b = evidence
            .handle("evidenceRecord", &json!({"requirement": "B"}))
            .await
            .unwrap()
            .data
            .unwrap()["id"]
            .as_str()
            .unwrap()
            .to_string();

        evidence
            .handle("evidenceLink", &json!({"from": a, "to": b, "kind": "downstream"}))
            .await
            .unwrap();

        let chains = evidence.chains.lock();
        assert_eq!(chains[&a].links.downstream, vec![b.clone()]);
        assert_eq!(chains[&b].links.upstream, vec![a.clone()]);
    }

    #[tokio::test]
    async fn persists_across_reload() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let evidence = make(tmp.path());
            evidence
                .handle("evidenceRecord", &json!({"requirement": "persisted"}))
                .await
                .unwrap();
        }
        let reloaded = make(tmp.path());
        let resp = reloaded.handle("evidenceStatus", &json!({})).await.unwrap();
        assert_eq!(resp.data.unwrap()["chains"], 1);
    }

    #[tokio::test]
    async fn unknown_phase_and_missing_chain_fail() {
        let tmp = tempfile::tempdir().unwrap();
        let evidence = make(tmp.path());
        assert!(evidence
            .handle("evidenceRecord", &json!({"id": "nope", "phase": "analysis"}))
            .await
            .is_err());
        let id = evidence
            .handle("evidenceRecord", &json!({"requirement": "x"}))
            .await
            .unwrap()
            .data
            .unwrap()["id"]
            .as_str()
            .unwrap()
            .to_string();
        assert!(evidence
            .handle("evidenceRecord", &json!({"id": id, "phase": "guessing"}))
            .await
            .is_err());
    }
}
