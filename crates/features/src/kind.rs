//! Declarative feature table.
//!
//! The registry never constructs a feature just to ask what commands it
//! has: `FeatureKind::commands()` answers from static tables, and
//! `construct` is the single place a kind becomes a live feature.

use std::sync::Arc;

use bd_domain::error::Result;

use crate::{
    actions, assertions, audit, console, events, evidence, multi, network, perf, plugins_bridge,
    snapshot, state, tabs, tracking, video, Feature, FeatureContext,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeatureKind {
    StateTracking,
    Console,
    Snapshot,
    CoreActions,
    Assertions,
    Tabs,
    Events,
    MultiCommand,
    NetworkCapture,
    NetworkMocking,
    HarExport,
    Performance,
    VideoRecording,
    BrowserState,
    EvidenceChain,
    AccessibilityAudit,
    Plugins,
}

impl FeatureKind {
    /// Core features, in initialization order.
    pub const CORE: &'static [FeatureKind] = &[
        FeatureKind::StateTracking,
        FeatureKind::Console,
        FeatureKind::Snapshot,
        FeatureKind::CoreActions,
        FeatureKind::Assertions,
        FeatureKind::Tabs,
        FeatureKind::Events,
        FeatureKind::MultiCommand,
    ];

    /// Features instantiated on first use.
    pub const LAZY: &'static [FeatureKind] = &[
        FeatureKind::NetworkCapture,
        FeatureKind::NetworkMocking,
        FeatureKind::HarExport,
        FeatureKind::Performance,
        FeatureKind::VideoRecording,
        FeatureKind::BrowserState,
        FeatureKind::EvidenceChain,
        FeatureKind::AccessibilityAudit,
        FeatureKind::Plugins,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            FeatureKind::StateTracking => tracking::NAME,
            FeatureKind::Console => console::NAME,
            FeatureKind::Snapshot => snapshot::NAME,
            FeatureKind::CoreActions => actions::NAME,
            FeatureKind::Assertions => assertions::NAME,
            FeatureKind::Tabs => tabs::NAME,
            FeatureKind::Events => events::NAME,
            FeatureKind::MultiCommand => multi::NAME,
            FeatureKind::NetworkCapture => network::capture::NAME,
            FeatureKind::NetworkMocking => network::mocking::NAME,
            FeatureKind::HarExport => network::har::NAME,
            FeatureKind::Performance => perf::NAME,
            FeatureKind::VideoRecording => video::NAME,
            FeatureKind::BrowserState => state::NAME,
            FeatureKind::EvidenceChain => evidence::NAME,
            FeatureKind::AccessibilityAudit => audit::NAME,
            FeatureKind::Plugins => plugins_bridge::NAME,
        }
    }

    /// Command names, without constructing the feature.
    pub fn commands(&self) -> &'static [&'static str] {
        match self {
            FeatureKind::StateTracking => tracking::COMMANDS,
            FeatureKind::Console => console::COMMANDS,
            FeatureKind::Snapshot => snapshot::COMMANDS,
            FeatureKind::CoreActions => actions::COMMANDS,
            FeatureKind::Assertions => assertions::COMMANDS,
            FeatureKind::Tabs => tabs::COMMANDS,
            FeatureKind::Events => events::COMMANDS,
            FeatureKind::MultiCommand => multi::COMMANDS,
            FeatureKind::NetworkCapture => network::capture::COMMANDS,
            FeatureKind::NetworkMocking => network::mocking::COMMANDS,
            FeatureKind::HarExport => network::har::COMMANDS,
            FeatureKind::Performance => perf::COMMANDS,
            FeatureKind::VideoRecording => video::COMMANDS,
            FeatureKind::BrowserState => state::COMMANDS,
            FeatureKind::EvidenceChain => evidence::COMMANDS,
            FeatureKind::AccessibilityAudit => audit::COMMANDS,
            FeatureKind::Plugins => plugins_bridge::COMMANDS,
        }
    }

    pub fn is_lazy(&self) -> bool {
        Self::LAZY.contains(self)
    }

    pub fn from_name(name: &str) -> Option<FeatureKind> {
        Self::CORE
            .iter()
            .chain(Self::LAZY.iter())
            .find(|k| k.name() == name)
            .copied()
    }

    pub fn construct(&self, ctx: &FeatureContext) -> Result<Arc<dyn Feature>> {
        Ok(match self {
            FeatureKind::StateTracking => Arc::new(tracking::StateTracking::new(ctx)?),
            FeatureKind::Console => Arc::new(console::ConsoleCapture::new(ctx)?),
            FeatureKind::Snapshot => Arc::new(snapshot::Snapshot::new(ctx)?),
            FeatureKind::CoreActions => Arc::new(actions::CoreActions::new(ctx)?),
            FeatureKind::Assertions => Arc::new(assertions::Assertions::new(ctx)?),
            FeatureKind::Tabs => Arc::new(tabs::Tabs::new(ctx)?),
            FeatureKind::Events => Arc::new(events::Events::new(ctx)?),
            FeatureKind::MultiCommand => Arc::new(multi::MultiCommand::new(ctx)?),
            FeatureKind::NetworkCapture => Arc::new(network::capture::NetworkCapture::new(ctx)?),
            FeatureKind::NetworkMocking => Arc::new(network::mocking::NetworkMocking::new(ctx)?),
            FeatureKind::HarExport => Arc::new(network::har::HarExport::new(ctx)?),
            FeatureKind::Performance => Arc::new(perf::PerformanceMetrics::new(ctx)?),
            FeatureKind::VideoRecording => Arc::new(video::VideoRecording::new(ctx)?),
            FeatureKind::BrowserState => Arc::new(state::BrowserState::new(ctx)?),
            FeatureKind::EvidenceChain => Arc::new(evidence::EvidenceChain::new(ctx)?),
            FeatureKind::AccessibilityAudit => Arc::new(audit::AccessibilityAudit::new(ctx)?),
            FeatureKind::Plugins => Arc::new(plugins_bridge::PluginsFeature::new(ctx)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn names_are_unique() {
        let mut seen = HashSet::new();
        for kind in FeatureKind::CORE.iter().chain(FeatureKind::LAZY.iter()) {
            assert!(seen.insert(kind.name()), "duplicate name: {}", kind.name());
        }
    }

    #[test]
    fn commands_are_globally_unique() {
        let mut seen = HashSet::new();
        for kind in FeatureKind::CORE.iter().chain(FeatureKind::LAZY.iter()) {
            for cmd in kind.commands() {
                assert!(seen.insert(*cmd), "duplicate command: {cmd}");
            }
        }
    }

    #[test]
    fn from_name_round_trips() {
        for kind in FeatureKind::CORE.iter().chain(FeatureKind::LAZY.iter()) {
            assert_eq!(FeatureKind::from_name(kind.name()), Some(*kind));
        }
        assert_eq!(FeatureKind::from_name("ghost"), None);
    }

    #[test]
    fn lazy_and_core_are_disjoint() {
        for kind in FeatureKind::CORE {
            assert!(!kind.is_lazy());
        }
        for kind in FeatureKind::LAZY {
            assert!(kind.is_lazy());
        }
    }

    #[tokio::test]
    async fn every_kind_constructs_without_a_page() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = FeatureContext::new(
            tmp.path().to_path_buf(),
            Default::default(),
            Default::default(),
        );
        for kind in FeatureKind::CORE.iter().chain(FeatureKind::LAZY.iter()) {
            let feature = kind.construct(&ctx).unwrap();
            assert_eq!(feature.name(), kind.name());
            assert_eq!(feature.commands(), kind.commands());
        }
    }
}
