//! Feature registry: core initialization, lazy loading, command index,
//! preload hints.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use bd_domain::error::{Error, Result};
use bd_domain::trace::TraceEvent;
use bd_features::{Feature, FeatureContext, FeatureKind};

/// One command-index entry.
#[derive(Debug, Clone, Copy)]
pub struct IndexEntry {
    pub kind: FeatureKind,
    pub lazy: bool,
}

/// Commands whose success hints that other features are about to be
/// needed; hinted features load in a detached task.
const PRELOAD_HINTS: &[(&str, &[FeatureKind])] = &[
    ("navigate", &[FeatureKind::NetworkCapture]),
    ("snapshot", &[FeatureKind::AccessibilityAudit]),
    ("setupNetworkCapture", &[FeatureKind::NetworkMocking, FeatureKind::HarExport]),
    ("saveBrowserState", &[FeatureKind::BrowserState]),
    ("getPerformanceMetrics", &[FeatureKind::Performance]),
];

pub struct FeatureRegistry {
    ctx: FeatureContext,
    index: RwLock<HashMap<&'static str, IndexEntry>>,
    /// Serializes lazy loads so a feature is constructed at most once.
    load_lock: tokio::sync::Mutex<()>,
}

impl FeatureRegistry {
    pub fn new(ctx: FeatureContext) -> Self {
        Self {
            ctx,
            index: RwLock::new(HashMap::new()),
            load_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn ctx(&self) -> &FeatureContext {
        &self.ctx
    }

    /// Construct and set up every core feature in declaration order,
    /// then build the command index. Lazy commands come from the
    /// declarative per-kind tables, so no feature is constructed just
    /// to be asked for its command names.
    pub async fn initialize_core(&self) -> Result<()> {
        for kind in FeatureKind::CORE {
            let feature = self.construct_and_setup(*kind).await?;
            self.ctx.bus.publish(feature);
        }
        self.build_index();

        TraceEvent::FeaturesInitialized {
            core_count: FeatureKind::CORE.len(),
            command_count: self.index.read().len(),
        }
        .emit();
        Ok(())
    }

    fn build_index(&self) {
        let mut index = HashMap::new();
        for kind in FeatureKind::CORE {
            for cmd in kind.commands() {
                index.insert(*cmd, IndexEntry { kind: *kind, lazy: false });
            }
        }
        for kind in FeatureKind::LAZY {
            for cmd in kind.commands() {
                index.insert(*cmd, IndexEntry { kind: *kind, lazy: true });
            }
        }
        *self.index.write() = index;
    }

    pub fn lookup(&self, cmd: &str) -> Option<IndexEntry> {
        self.index.read().get(cmd).copied()
    }

    pub fn command_count(&self) -> usize {
        self.index.read().len()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Feature>> {
        self.ctx.bus.get(name)
    }

    pub fn is_loaded(&self, kind: FeatureKind) -> bool {
        self.ctx.bus.contains(kind.name())
    }

    async fn construct_and_setup(&self, kind: FeatureKind) -> Result<Arc<dyn Feature>> {
        let feature = kind.construct(&self.ctx).map_err(|e| Error::FeatureLoad {
            feature: kind.name().to_string(),
            message: e.to_string(),
        })?;
        feature.setup().await.map_err(|e| Error::FeatureLoad {
            feature: kind.name().to_string(),
            message: e.to_string(),
        })?;
        Ok(feature)
    }

    /// Load a lazy feature on first use. Idempotent: a concurrent or
    /// repeated load returns the cached instance. Publishing on the bus
    /// is what makes the new feature visible to everything already
    /// loaded (assertions find network capture the next time they look).
    pub async fn load_lazy(&self, kind: FeatureKind) -> Result<Arc<dyn Feature>> {
        if let Some(existing) = self.ctx.bus.get(kind.name()) {
            return Ok(existing);
        }
        let _guard = self.load_lock.lock().await;
        if let Some(existing) = self.ctx.bus.get(kind.name()) {
            return Ok(existing);
        }

        let feature = self.construct_and_setup(kind).await?;
        self.ctx.bus.publish(feature.clone());
        TraceEvent::FeatureLoaded {
            feature: kind.name().to_string(),
            lazy: true,
        }
        .emit();
        Ok(feature)
    }

    /// Fire the preload hints for a command. Non-blocking; load
    /// failures are logged and dropped.
    pub fn fire_preload_hints(self: &Arc<Self>, cmd: &str) {
        let hinted = PRELOAD_HINTS
            .iter()
            .find(|(hint_cmd, _)| *hint_cmd == cmd)
            .map(|(_, kinds)| *kinds);
        let kinds = match hinted {
            Some(kinds) => kinds,
            None => return,
        };
        for kind in kinds {
            if self.is_loaded(*kind) {
                continue;
            }
            let registry = self.clone();
            let kind = *kind;
            tokio::spawn(async move {
                if let Err(e) = registry.load_lazy(kind).await {
                    tracing::debug!(feature = kind.name(), error = %e, "preload failed");
                }
            });
        }
    }

    /// Await every feature's cleanup and drop the whole set. Errors are
    /// logged and do not stop the cascade.
    pub async fn cleanup_all(&self) {
        for feature in self.ctx.bus.all() {
            if let Err(e) = feature.cleanup().await {
                tracing::warn!(feature = feature.name(), error = %e, "feature cleanup failed");
            }
        }
        self.ctx.bus.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bd_browser::driver::{BrowserDriver, BrowserHandle, ContextHandle, ContextOptions, LaunchOptions};
    use bd_browser::stub::StubDriver;

    async fn registry_with_page(dir: &std::path::Path) -> Arc<FeatureRegistry> {
        let driver = StubDriver::new();
        let ctx = FeatureContext::new(dir.to_path_buf(), Default::default(), Default::default());
        let browser = driver.launch(LaunchOptions::default()).await.unwrap();
        let context = browser.new_context(ContextOptions::default()).await.unwrap();
        ctx.page.set(Some(context.new_page().await.unwrap()));
        ctx.context.set(Some(context));
        Arc::new(FeatureRegistry::new(ctx))
    }

    #[tokio::test]
    async fn index_covers_every_declared_command() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = registry_with_page(tmp.path()).await;
        registry.initialize_core().await.unwrap();

        for kind in FeatureKind::CORE.iter().chain(FeatureKind::LAZY.iter()) {
            for cmd in kind.commands() {
                let entry = registry.lookup(cmd).unwrap_or_else(|| {
                    panic!("command missing from index: {cmd}")
                });
                assert_eq!(entry.kind.name(), kind.name());
                assert_eq!(entry.lazy, kind.is_lazy());
            }
        }
    }

    #[tokio::test]
    async fn core_features_are_published_lazy_are_not() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = registry_with_page(tmp.path()).await;
        registry.initialize_core().await.unwrap();

        for kind in FeatureKind::CORE {
            assert!(registry.is_loaded(*kind), "{} not loaded", kind.name());
        }
        for kind in FeatureKind::LAZY {
            assert!(!registry.is_loaded(*kind), "{} loaded eagerly", kind.name());
        }
    }

    #[tokio::test]
    async fn lazy_load_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = registry_with_page(tmp.path()).await;
        registry.initialize_core().await.unwrap();

        let first = registry.load_lazy(FeatureKind::NetworkCapture).await.unwrap();
        let second = registry.load_lazy(FeatureKind::NetworkCapture).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn cleanup_drops_everything() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = registry_with_page(tmp.path()).await;
        registry.initialize_core().await.unwrap();
        registry.load_lazy(FeatureKind::NetworkMocking).await.unwrap();

        registry.cleanup_all().await;
        assert!(registry.ctx().bus.is_empty());
    }

    #[tokio::test]
    async fn preload_hint_loads_hinted_feature() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = registry_with_page(tmp.path()).await;
        registry.initialize_core().await.unwrap();

        registry.fire_preload_hints("navigate");
        // Detached task; give it a moment.
        for _ in 0..50 {
            if registry.is_loaded(FeatureKind::NetworkCapture) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(registry.is_loaded(FeatureKind::NetworkCapture));
    }

    #[tokio::test]
    async fn unhinted_command_preloads_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = registry_with_page(tmp.path()).await;
        registry.initialize_core().await.unwrap();

        registry.fire_preload_hints("getConsole");
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        for kind in FeatureKind::LAZY {
            assert!(!registry.is_loaded(*kind));
        }
    }
}
