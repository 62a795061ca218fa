//! Accessibility audit over the current page's tree.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};

use bd_browser::driver::PageHandle;
use bd_domain::error::{Error, Result};
use bd_domain::response::Response;

use crate::{Feature, FeatureContext};

pub const NAME: &str = "accessibilityAudit";
pub const COMMANDS: &[&str] = &["auditAccessibility"];

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Violation {
    pub rule: &'static str,
    pub role: String,
    pub detail: String,
}

pub struct AccessibilityAudit {
    ctx: FeatureContext,
}

impl AccessibilityAudit {
    pub fn new(ctx: &FeatureContext) -> Result<Self> {
        Ok(Self { ctx: ctx.clone() })
    }

    fn check_node(node: &Value, violations: &mut Vec<Violation>) {
        let role = node["role"].as_str().unwrap_or("generic");
        let name = node["name"].as_str().unwrap_or("");

        match role {
            "image" | "img" if name.is_empty() => violations.push(Violation {
                rule: "image-alt",
                role: role.to_string(),
                detail: "image without alternative text".into(),
            }),
            "button" if name.is_empty() => violations.push(Violation {
                rule: "button-name",
                role: role.to_string(),
                detail: "button without an accessible name".into(),
            }),
            "link" if name.is_empty() => violations.push(Violation {
                rule: "link-name",
                role: role.to_string(),
                detail: "link without an accessible name".into(),
            }),
            "textbox" | "searchbox" | "combobox" if name.is_empty() => {
                violations.push(Violation {
                    rule: "input-label",
                    role: role.to_string(),
                    detail: "form control without a label".into(),
                })
            }
            _ => {}
        }

        if let Some(children) = node["children"].as_array() {
            for child in children {
                Self::check_node(child, violations);
            }
        }
    }
}

#[async_trait]
impl Feature for AccessibilityAudit {
    fn name(&self) -> &'static str {
        NAME
    }

    fn commands(&self) -> &'static [&'static str] {
        COMMANDS
    }

    async fn handle(&self, cmd: &str, _args: &Value) -> Result<Response> {
        if cmd != "auditAccessibility" {
            return Err(Error::UnknownCommand(cmd.to_string()));
        }
        let page = self
            .ctx
            .page
            .get()
            .ok_or_else(|| Error::Handler("no page open".into()))?;
        let tree = page.accessibility_snapshot().await?;
        if tree.is_null() {
            return Ok(Response::ok(json!({
                "violations": [],
                "note": "accessibility tree is empty",
            })));
        }

        let mut violations = Vec::new();
        Self::check_node(&tree, &mut violations);
        Ok(Response::ok(json!({
            "violations": violations,
            "count": violations.len(),
        })))
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
