use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Browser
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserConfig {
    #[serde(default)]
    pub viewport: ViewportConfig,
    /// Headless is off by default so a developer watching the daemon sees
    /// the real window; the orchestrator flips it on for fan-out runs.
    #[serde(default)]
    pub headless: bool,
    #[serde(default = "d_user_agent")]
    pub user_agent: String,
    /// Explicit browser binary. When unset the driver probes well-known
    /// Chromium/Chrome install locations.
    #[serde(default)]
    pub executable: Option<String>,
    /// Extra arguments appended to the browser command line.
    #[serde(default)]
    pub extra_args: Vec<String>,
    #[serde(default = "d_nav_timeout")]
    pub navigation_timeout_ms: u64,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            viewport: ViewportConfig::default(),
            headless: false,
            user_agent: d_user_agent(),
            executable: None,
            extra_args: Vec::new(),
            navigation_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ViewportConfig {
    #[serde(default = "d_2560")]
    pub width: u32,
    #[serde(default = "d_1440")]
    pub height: u32,
}

impl Default for ViewportConfig {
    fn default() -> Self {
        Self {
            width: 2560,
            height: 1440,
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_2560() -> u32 {
    2560
}
fn d_1440() -> u32 {
    1440
}
fn d_user_agent() -> String {
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) \
     Chrome/126.0.0.0 Safari/537.36 browserd/0.1"
        .into()
}
fn d_nav_timeout() -> u64 {
    30_000
}
