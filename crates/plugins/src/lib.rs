//! `bd-plugins` — sandboxed external command plugins.
//!
//! A plugin is a directory holding a `plugin.toml` manifest and an
//! executable entry file. The host spawns the entry as a child process
//! and speaks newline-delimited JSON over its stdio; every command and
//! hook invocation races a configurable timeout. Loading is a
//! result-valued pipeline: resolve inside allow-listed roots, reject
//! traversal and unknown extensions, validate the manifest shape, then
//! spawn.

pub mod host;
pub mod manifest;
pub mod registry;
pub mod sandbox;

pub use host::PluginProcess;
pub use manifest::PluginManifest;
pub use registry::{HookName, PluginHost, PluginInfo, SkipVerdict};
