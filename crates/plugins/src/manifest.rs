//! Plugin manifest (`plugin.toml`) parsing and shape validation.

use std::path::Path;

use serde::{Deserialize, Serialize};

use bd_domain::error::{Error, Result};

use crate::registry::HookName;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginManifest {
    pub name: String,
    #[serde(default = "d_version")]
    pub version: String,
    #[serde(default)]
    pub description: String,
    /// Entry file, relative to the plugin directory.
    pub entry: String,
    /// Commands this plugin registers.
    #[serde(default)]
    pub commands: Vec<String>,
    /// Hooks this plugin participates in.
    #[serde(default)]
    pub hooks: Vec<String>,
}

fn d_version() -> String {
    "0.0.0".into()
}

impl PluginManifest {
    pub fn load(plugin_dir: &Path) -> Result<Self> {
        let path = plugin_dir.join("plugin.toml");
        let raw = std::fs::read_to_string(&path).map_err(|e| {
            Error::Plugin(format!("cannot read {}: {e}", path.display()))
        })?;
        let manifest: PluginManifest =
            toml::from_str(&raw).map_err(|e| Error::Plugin(format!("invalid plugin.toml: {e}")))?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Shape checks beyond what serde enforces.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty()
            || !self
                .name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
        {
            return Err(Error::Plugin(format!(
                "invalid plugin name: {:?} (lowercase letters, digits, - and _)",
                self.name
            )));
        }
        if self.entry.is_empty() {
            return Err(Error::Plugin("entry is required".into()));
        }
        if self.entry.contains("..") || self.entry.starts_with('/') {
            return Err(Error::Plugin(format!(
                "entry must be a plain relative file: {}",
                self.entry
            )));
        }
        for hook in &self.hooks {
            if HookName::parse(hook).is_none() {
                return Err(Error::Plugin(format!("unknown hook: {hook}")));
            }
        }
        for command in &self.commands {
            if command.is_empty() {
                return Err(Error::Plugin("empty command name".into()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(toml_str: &str) -> Result<PluginManifest> {
        let m: PluginManifest =
            toml::from_str(toml_str).map_err(|e| Error::Plugin(e.to_string()))?;
        m.validate()?;
        Ok(m)
    }

    #[test]
    fn minimal_manifest_parses() {
        let m = manifest(
            r#"
name = "demo"
entry = "main.sh"
commands = ["demoCmd"]
hooks = ["beforeCommand"]
"#,
        )
        .unwrap();
        assert_eq!(m.name, "demo");
        assert_eq!(m.version, "0.0.0");
        assert_eq!(m.commands, vec!["demoCmd"]);
    }

    #[test]
    fn uppercase_name_is_rejected() {
        assert!(manifest("name = \"Demo\"\nentry = \"main.sh\"\n").is_err());
    }

    #[test]
    fn traversing_entry_is_rejected() {
        assert!(manifest("name = \"demo\"\nentry = \"../evil.sh\"\n").is_err());
        assert!(manifest("name = \"demo\"\nentry = \"/etc/passwd\"\n").is_err());
    }

    #[test]
    fn unknown_hook_is_rejected() {
        assert!(manifest(
            "name = \"demo\"\nentry = \"main.sh\"\nhooks = [\"onTeleport\"]\n"
        )
        .is_err());
    }

    #[test]
    fn all_known_hooks_accepted() {
        let m = manifest(
            "name = \"demo\"\nentry = \"main.sh\"\n\
             hooks = [\"beforeCommand\", \"afterCommand\", \"onError\", \"onNavigate\", \"onSnapshot\"]\n",
        );
        assert!(m.is_ok());
    }
}
