use serde::Serialize;

/// Structured trace events emitted across all browserd crates.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum TraceEvent {
    CommandDispatched {
        cmd: String,
        duration_ms: u64,
        ok: bool,
    },
    FeatureLoaded {
        feature: String,
        lazy: bool,
    },
    FeaturesInitialized {
        core_count: usize,
        command_count: usize,
    },
    BrowserStarted {
        url: String,
        headless: bool,
    },
    BrowserClosed {
        uptime_ms: u64,
    },
    ContextRecreated {
        restored_url: Option<String>,
    },
    StorageStateRejected {
        reason: String,
    },
    PluginLoaded {
        plugin: String,
        commands: usize,
    },
    PluginUnloaded {
        plugin: String,
    },
    PluginHookFailed {
        plugin: String,
        hook: String,
        error: String,
    },
    OrchestratorInstanceFinished {
        instance_id: String,
        passed: usize,
        failed: usize,
        errors: usize,
        duration_ms: u64,
    },
}

impl TraceEvent {
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(trace_event = %json, "bd_event");
    }
}
