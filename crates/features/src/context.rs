//! Construction context handed to every feature.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use bd_browser::driver::{ContextHandle, PageHandle};
use bd_domain::config::{CaptureConfig, PluginsConfig};
use bd_domain::error::Result;
use bd_domain::response::Response;

use crate::bus::FeatureBus;

/// Shared current-page accessor. Only the lifecycle writes it; features
/// must re-read after any re-initialization signal.
#[derive(Clone, Default)]
pub struct PageRef {
    inner: Arc<RwLock<Option<Arc<dyn PageHandle>>>>,
}

impl PageRef {
    pub fn get(&self) -> Option<Arc<dyn PageHandle>> {
        self.inner.read().clone()
    }

    pub fn set(&self, page: Option<Arc<dyn PageHandle>>) {
        *self.inner.write() = page;
    }
}

/// Shared current-context accessor, same ownership rules as [`PageRef`].
#[derive(Clone, Default)]
pub struct ContextRef {
    inner: Arc<RwLock<Option<Arc<dyn ContextHandle>>>>,
}

impl ContextRef {
    pub fn get(&self) -> Option<Arc<dyn ContextHandle>> {
        self.inner.read().clone()
    }

    pub fn set(&self, context: Option<Arc<dyn ContextHandle>>) {
        *self.inner.write() = context;
    }
}

/// Executes a command through the full dispatch pipeline. Injected into
/// the multi-command feature by the daemon.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, cmd: &str, args: Value) -> Response;
}

/// The slice of the browser lifecycle that features may drive: tab
/// switching and storage-state restoration. Implemented by the daemon's
/// lifecycle component.
#[async_trait]
pub trait LifecycleLink: Send + Sync {
    async fn set_page(&self, page: Arc<dyn PageHandle>, url: String);
    async fn recreate_with_state(&self, state: Value, url: Option<String>) -> Result<()>;
}

/// Validates a mock response body against a caller-supplied schema.
/// Passed to the mocking feature at construction.
pub trait MockValidator: Send + Sync {
    fn validate(&self, response: &Value, schema: &Value) -> std::result::Result<(), String>;
}

/// Shallow structural validator: the schema is an object whose values
/// name the expected JSON type of each required field.
#[derive(Debug, Clone, Default)]
pub struct BasicMockValidator;

impl MockValidator for BasicMockValidator {
    fn validate(&self, response: &Value, schema: &Value) -> std::result::Result<(), String> {
        let schema_obj = match schema.as_object() {
            Some(o) => o,
            None => return Err("schema must be an object".into()),
        };
        for (field, expected) in schema_obj {
            let expected = expected.as_str().unwrap_or("any");
            let actual = match response.get(field) {
                Some(v) => v,
                None => return Err(format!("missing field: {field}")),
            };
            let matches = match expected {
                "string" => actual.is_string(),
                "number" => actual.is_number(),
                "boolean" => actual.is_boolean(),
                "array" => actual.is_array(),
                "object" => actual.is_object(),
                _ => true,
            };
            if !matches {
                return Err(format!("field {field} is not a {expected}"));
            }
        }
        Ok(())
    }
}

/// Everything a feature may need at construction time.
#[derive(Clone)]
pub struct FeatureContext {
    pub bus: FeatureBus,
    pub page: PageRef,
    pub context: ContextRef,
    pub capture: CaptureConfig,
    pub plugins: PluginsConfig,
    /// Instance state directory (`states/`, `har-exports/`, evidence).
    pub state_dir: PathBuf,
    /// Slot the daemon fills once the manager exists; features re-read
    /// it on every use.
    pub executor: Arc<RwLock<Option<Arc<dyn CommandExecutor>>>>,
    /// Slot for the lifecycle link, same ownership rules.
    pub lifecycle: Arc<RwLock<Option<Arc<dyn LifecycleLink>>>>,
    pub mock_validator: Arc<dyn MockValidator>,
}

impl FeatureContext {
    pub fn new(state_dir: PathBuf, capture: CaptureConfig, plugins: PluginsConfig) -> Self {
        Self {
            bus: FeatureBus::new(),
            page: PageRef::default(),
            context: ContextRef::default(),
            capture,
            plugins,
            state_dir,
            executor: Arc::new(RwLock::new(None)),
            lifecycle: Arc::new(RwLock::new(None)),
            mock_validator: Arc::new(BasicMockValidator),
        }
    }

    pub fn executor(&self) -> Option<Arc<dyn CommandExecutor>> {
        self.executor.read().clone()
    }

    pub fn lifecycle(&self) -> Option<Arc<dyn LifecycleLink>> {
        self.lifecycle.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn basic_validator_accepts_matching_shape() {
        let validator = BasicMockValidator;
        let ok = validator.validate(
            &json!({"id": 1, "name": "x"}),
            &json!({"id": "number", "name": "string"}),
        );
        assert!(ok.is_ok());
    }

    #[test]
    fn basic_validator_rejects_missing_and_mistyped() {
        let validator = BasicMockValidator;
        assert!(validator
            .validate(&json!({"id": "one"}), &json!({"id": "number"}))
            .is_err());
        assert!(validator
            .validate(&json!({}), &json!({"id": "number"}))
            .is_err());
    }
}
