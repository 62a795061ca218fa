//! Interaction state tracking.
//!
//! Keeps a short history of navigations and actions so the snapshot can
//! annotate what changed since the last look.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};

use bd_domain::error::{Error, Result};
use bd_domain::response::Response;
use bd_ring::RingBuffer;

use crate::{Feature, FeatureContext};

pub const NAME: &str = "stateTracking";
pub const COMMANDS: &[&str] = &["getInteractionState"];

const HISTORY_CAPACITY: usize = 50;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Interaction {
    Navigation { url: String, timestamp: DateTime<Utc> },
    Action { description: String, timestamp: DateTime<Utc> },
}

pub struct StateTracking {
    history: Mutex<RingBuffer<Interaction>>,
}

impl StateTracking {
    pub fn new(_ctx: &FeatureContext) -> Result<Self> {
        Ok(Self {
            history: Mutex::new(RingBuffer::new(HISTORY_CAPACITY)?),
        })
    }

    pub fn record_navigation(&self, url: &str) {
        self.history.lock().push(Interaction::Navigation {
            url: url.to_string(),
            timestamp: Utc::now(),
        });
    }

    pub fn record_action(&self, description: &str) {
        self.history.lock().push(Interaction::Action {
            description: description.to_string(),
            timestamp: Utc::now(),
        });
    }

    pub fn recent(&self, n: usize) -> Vec<Interaction> {
        self.history.lock().last_n(n)
    }
}

#[async_trait]
impl Feature for StateTracking {
    fn name(&self) -> &'static str {
        NAME
    }

    fn commands(&self) -> &'static [&'static str] {
        COMMANDS
    }

    async fn handle(&self, cmd: &str, args: &Value) -> Result<Response> {
        match cmd {
            "getInteractionState" => {
                let limit = args.get("limit").and_then(Value::as_u64).unwrap_or(20) as usize;
                let history = self.recent(limit);
                Ok(Response::ok(json!({
                    "interactions": history,
                    "count": history.len(),
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
    use std::path::PathBuf;

    fn ctx() -> FeatureContext {
        FeatureContext::new(PathBuf::from("."), Default::default(), Default::default())
    }

    #[tokio::test]
    async fn records_and_reports_interactions() {
        let tracking = StateTracking::new(&ctx()).unwrap();
        tracking.record_navigation("http://localhost/a");
        tracking.record_action("click #submit");

        let resp = tracking
            .handle("getInteractionState", &json!({}))
            .await
            .unwrap();
        assert!(resp.is_ok());
        let data = resp.data.unwrap();
        assert_eq!(data["count"], 2);
        assert_eq!(data["interactions"][0]["kind"], "navigation");
    }

    #[tokio::test]
    async fn history_is_bounded() {
        let tracking = StateTracking::new(&ctx()).unwrap();
        for i in 0..200 {
            tracking.record_action(&format!("action {i}"));
        }
        assert_eq!(tracking.recent(500).len(), HISTORY_CAPACITY);
    }
}
