use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Plugins
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginsConfig {
    /// Directories plugins may be loaded from. Relative paths resolve
    /// against the instance state directory.
    #[serde(default = "d_roots")]
    pub roots: Vec<String>,
    /// Entry-file extensions accepted by the loader.
    #[serde(default = "d_extensions")]
    pub allowed_extensions: Vec<String>,
    /// Hard ceiling for a single plugin command or hook invocation.
    #[serde(default = "d_30")]
    pub invoke_timeout_sec: u64,
    /// Bound on the per-plugin hook-failure log kept for diagnostics.
    #[serde(default = "d_50")]
    pub failure_history: usize,
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            roots: d_roots(),
            allowed_extensions: d_extensions(),
            invoke_timeout_sec: 30,
            failure_history: 50,
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_roots() -> Vec<String> {
    vec!["plugins".into()]
}
fn d_extensions() -> Vec<String> {
    vec!["js".into(), "mjs".into(), "cjs".into(), "py".into(), "sh".into()]
}
fn d_30() -> u64 {
    30
}
fn d_50() -> usize {
    50
}
