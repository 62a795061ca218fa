//! Loaded-plugin registry and hook pipelines.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{json, Value};

use bd_domain::config::PluginsConfig;
use bd_domain::error::{Error, Result};
use bd_domain::trace::TraceEvent;

use crate::host::PluginProcess;
use crate::manifest::PluginManifest;
use crate::sandbox;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Hooks
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookName {
    BeforeCommand,
    AfterCommand,
    OnError,
    OnNavigate,
    OnSnapshot,
}

impl HookName {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "beforeCommand" => Some(Self::BeforeCommand),
            "afterCommand" => Some(Self::AfterCommand),
            "onError" => Some(Self::OnError),
            "onNavigate" => Some(Self::OnNavigate),
            "onSnapshot" => Some(Self::OnSnapshot),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BeforeCommand => "beforeCommand",
            Self::AfterCommand => "afterCommand",
            Self::OnError => "onError",
            Self::OnNavigate => "onNavigate",
            Self::OnSnapshot => "onSnapshot",
        }
    }
}

/// A `beforeCommand` hook may veto the command.
#[derive(Debug, Clone)]
pub struct SkipVerdict {
    pub plugin: String,
    pub reason: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct LoadedPlugin {
    manifest: PluginManifest,
    process: Arc<PluginProcess>,
    loaded_at: DateTime<Utc>,
}

impl LoadedPlugin {
    fn has_hook(&self, hook: HookName) -> bool {
        self.manifest.hooks.iter().any(|h| h == hook.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginInfo {
    pub name: String,
    pub version: String,
    pub description: String,
    pub commands: Vec<String>,
    pub hooks: Vec<String>,
    pub alive: bool,
    pub loaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HookFailure {
    pub plugin: String,
    pub hook: String,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

/// Owns every loaded plugin. Hooks run across plugins in load order;
/// a failure in one plugin is recorded and the rest still run.
pub struct PluginHost {
    config: PluginsConfig,
    roots: Vec<PathBuf>,
    plugins: RwLock<Vec<Arc<LoadedPlugin>>>,
    failures: Mutex<Vec<HookFailure>>,
}

impl PluginHost {
    /// `base_dir` anchors relative roots from the config (the instance
    /// state directory).
    pub fn new(config: PluginsConfig, base_dir: &std::path::Path) -> Self {
        let roots = config
            .roots
            .iter()
            .map(|r| {
                let path = PathBuf::from(r);
                if path.is_absolute() {
                    path
                } else {
                    base_dir.join(path)
                }
            })
            .collect();
        Self {
            config,
            roots,
            plugins: RwLock::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
        }
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.invoke_timeout_sec)
    }

    /// Load pipeline: sandbox-resolve, manifest-validate, extension
    /// check, spawn, register.
    pub fn load_plugin(&self, requested: &str) -> Result<PluginInfo> {
        let plugin_dir = sandbox::resolve_plugin_dir(&self.roots, requested)?;
        let manifest = PluginManifest::load(&plugin_dir)?;

        if self
            .plugins
            .read()
            .iter()
            .any(|p| p.manifest.name == manifest.name)
        {
            return Err(Error::Plugin(format!(
                "plugin already loaded: {}",
                manifest.name
            )));
        }

        let entry = sandbox::check_entry(&plugin_dir, &manifest.entry, &self.config.allowed_extensions)?;
        let process = Arc::new(PluginProcess::spawn(&plugin_dir, &entry)?);

        let loaded = Arc::new(LoadedPlugin {
            manifest: manifest.clone(),
            process,
            loaded_at: Utc::now(),
        });
        let info = Self::info(&loaded);
        self.plugins.write().push(loaded);

        TraceEvent::PluginLoaded {
            plugin: manifest.name.clone(),
            commands: manifest.commands.len(),
        }
        .emit();
        Ok(info)
    }

    pub async fn unload_plugin(&self, name: &str) -> Result<()> {
        let removed = {
            let mut plugins = self.plugins.write();
            let index = plugins
                .iter()
                .position(|p| p.manifest.name == name)
                .ok_or_else(|| Error::Plugin(format!("plugin not loaded: {name}")))?;
            plugins.remove(index)
        };
        removed.process.shutdown().await;
        TraceEvent::PluginUnloaded {
            plugin: name.to_string(),
        }
        .emit();
        Ok(())
    }

    pub fn list(&self) -> Vec<PluginInfo> {
        self.plugins.read().iter().map(|p| Self::info(p)).collect()
    }

    fn info(plugin: &LoadedPlugin) -> PluginInfo {
        PluginInfo {
            name: plugin.manifest.name.clone(),
            version: plugin.manifest.version.clone(),
            description: plugin.manifest.description.clone(),
            commands: plugin.manifest.commands.clone(),
            hooks: plugin.manifest.hooks.clone(),
            alive: plugin.process.is_alive(),
            loaded_at: plugin.loaded_at,
        }
    }

    pub fn hook_failures(&self) -> Vec<HookFailure> {
        self.failures.lock().clone()
    }

    /// The plugin registering `cmd`, if any. Plugin commands live in
    /// this registry, parallel to the daemon's command index.
    pub fn find_command(&self, cmd: &str) -> Option<String> {
        self.plugins
            .read()
            .iter()
            .find(|p| p.manifest.commands.iter().any(|c| c == cmd))
            .map(|p| p.manifest.name.clone())
    }

    pub async fn run_command(&self, cmd: &str, args: Value) -> Result<Value> {
        let plugin = {
            let plugins = self.plugins.read();
            plugins
                .iter()
                .find(|p| p.manifest.commands.iter().any(|c| c == cmd))
                .cloned()
                .ok_or_else(|| Error::UnknownCommand(cmd.to_string()))?
        };
        plugin
            .process
            .invoke(&plugin.manifest.name, "command", cmd, args, self.timeout())
            .await
    }

    fn record_failure(&self, plugin: &str, hook: HookName, error: &Error) {
        TraceEvent::PluginHookFailed {
            plugin: plugin.to_string(),
            hook: hook.as_str().to_string(),
            error: error.to_string(),
        }
        .emit();
        tracing::warn!(plugin, hook = hook.as_str(), error = %error, "plugin hook failed");
        let mut failures = self.failures.lock();
        failures.push(HookFailure {
            plugin: plugin.to_string(),
            hook: hook.as_str().to_string(),
            error: error.to_string(),
            timestamp: Utc::now(),
        });
        let cap = self.config.failure_history;
        if failures.len() > cap {
            let drop = failures.len() - cap;
            failures.drain(..drop);
        }
    }

    fn participants(&self, hook: HookName) -> Vec<Arc<LoadedPlugin>> {
        self.plugins
            .read()
            .iter()
            .filter(|p| p.has_hook(hook))
            .cloned()
            .collect()
    }

    /// `beforeCommand` pipeline: first `{skip:true}` verdict wins; hook
    /// failures are swallowed and the command proceeds.
    pub async fn before_command(&self, cmd: &str, args: &Value) -> Option<SkipVerdict> {
        let payload = json!({ "cmd": cmd, "args": args });
        for plugin in self.participants(HookName::BeforeCommand) {
            match plugin
                .process
                .invoke(
                    &plugin.manifest.name,
                    "hook",
                    HookName::BeforeCommand.as_str(),
                    payload.clone(),
                    self.timeout(),
                )
                .await
            {
                Ok(result) => {
                    if result.get("skip").and_then(Value::as_bool) == Some(true) {
                        let reason = result
                            .get("reason")
                            .and_then(Value::as_str)
                            .unwrap_or("no reason given")
                            .to_string();
                        return Some(SkipVerdict {
                            plugin: plugin.manifest.name.clone(),
                            reason,
                        });
                    }
                }
                Err(e) => self.record_failure(&plugin.manifest.name, HookName::BeforeCommand, &e),
            }
        }
        None
    }

    /// Fire a non-vetoing hook across all participants, isolating
    /// failures per plugin.
    pub async fn fire_hook(&self, hook: HookName, payload: Value) {
        for plugin in self.participants(hook) {
            if let Err(e) = plugin
                .process
                .invoke(
                    &plugin.manifest.name,
                    "hook",
                    hook.as_str(),
                    payload.clone(),
                    self.timeout(),
                )
                .await
            {
                self.record_failure(&plugin.manifest.name, hook, &e);
            }
        }
    }

    pub async fn shutdown(&self) {
        let drained: Vec<Arc<LoadedPlugin>> = self.plugins.write().drain(..).collect();
        for plugin in drained {
            plugin.process.shutdown().await;
        }
    }
}
