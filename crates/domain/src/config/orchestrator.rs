use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Parallel orchestrator
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// First browser port handed to a peer daemon; instance `i` gets
    /// `browser_port_base + i`.
    #[serde(default = "d_browser_base")]
    pub browser_port_base: u16,
    /// First dev-server port reserved for a peer; instance `i` gets
    /// `vite_port_base + i`.
    #[serde(default = "d_vite_base")]
    pub vite_port_base: u16,
    #[serde(default = "d_test_timeout")]
    pub test_timeout_sec: u64,
    /// Whether a failing test stops that instance's queue.
    #[serde(default = "d_true")]
    pub continue_on_failure: bool,
    /// How long to wait for a spawned peer to publish its port file.
    #[serde(default = "d_ready_timeout")]
    pub ready_timeout_sec: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            browser_port_base: 3460,
            vite_port_base: 5173,
            test_timeout_sec: 60,
            continue_on_failure: true,
            ready_timeout_sec: 20,
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_browser_base() -> u16 {
    3460
}
fn d_vite_base() -> u16 {
    5173
}
fn d_test_timeout() -> u64 {
    60
}
fn d_true() -> bool {
    true
}
fn d_ready_timeout() -> u64 {
    20
}
