use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// TCP port. Overridden by `BROWSER_PORT` and `--port`.
    #[serde(default = "d_3456")]
    pub port: u16,
    /// The daemon only ever binds loopback; this exists so tests can pick
    /// an address family explicitly.
    #[serde(default = "d_host")]
    pub host: String,
    /// Base state directory (pid/port/token/state artifacts).
    #[serde(default = "d_base_dir")]
    pub base_dir: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3456,
            host: "127.0.0.1".into(),
            base_dir: "BROWSER-CLI".into(),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_3456() -> u16 {
    3456
}
fn d_host() -> String {
    "127.0.0.1".into()
}
fn d_base_dir() -> String {
    "BROWSER-CLI".into()
}
