//! Persistent storage-state validation.
//!
//! The daemon persists cookies/localStorage/sessionStorage across restarts
//! in `browser-state.json`. A captured accessibility tree once leaked into
//! that file through a buggy writer, so every load defends against injected
//! content: structural checks first, then a sentinel scan over the raw text.

use std::path::Path;

use serde_json::Value;

use bd_domain::error::Result;
use bd_domain::trace::TraceEvent;

/// Substrings that only ever appear in captured tree/snapshot output,
/// never in legitimate browser storage. Matched case-insensitively
/// against the serialized file content.
const CORRUPTION_SENTINELS: &[&str] = &[
    "=== snapshot",
    "[ref=e",
    "element state",
    "accessibility tree",
    "- document:",
    "- heading",
    "- button",
];

/// Why a storage-state file was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageRejection {
    NotAnObject,
    CookiesNotArray,
    OriginsNotArray,
    Sentinel(String),
    Unparseable(String),
}

impl std::fmt::Display for StorageRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageRejection::NotAnObject => write!(f, "top level is not an object"),
            StorageRejection::CookiesNotArray => write!(f, "cookies present but not an array"),
            StorageRejection::OriginsNotArray => write!(f, "origins present but not an array"),
            StorageRejection::Sentinel(s) => write!(f, "corruption sentinel found: {s}"),
            StorageRejection::Unparseable(e) => write!(f, "not valid JSON: {e}"),
        }
    }
}

/// Validate raw storage-state text. Returns the parsed state or the
/// reason it was rejected.
///
/// The sentinel scan runs over the raw text, so a state file whose
/// user-controlled localStorage legitimately contains a sentinel string
/// is rejected too. That trade is deliberate: a false positive costs one
/// clean start, a false negative injects captured tree text into the
/// browser profile.
pub fn validate_storage_state(raw: &str) -> std::result::Result<Value, StorageRejection> {
    let parsed: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => return Err(StorageRejection::Unparseable(e.to_string())),
    };

    let obj = match parsed.as_object() {
        Some(o) => o,
        None => return Err(StorageRejection::NotAnObject),
    };
    if let Some(cookies) = obj.get("cookies") {
        if !cookies.is_array() {
            return Err(StorageRejection::CookiesNotArray);
        }
    }
    if let Some(origins) = obj.get("origins") {
        if !origins.is_array() {
            return Err(StorageRejection::OriginsNotArray);
        }
    }

    let lowered = raw.to_lowercase();
    for sentinel in CORRUPTION_SENTINELS {
        if lowered.contains(sentinel) {
            return Err(StorageRejection::Sentinel((*sentinel).to_string()));
        }
    }

    Ok(parsed)
}

/// Load and validate a storage-state file. A rejected or unreadable file
/// is deleted and `None` is returned, so the browser starts clean.
pub fn load_storage_state(path: &Path) -> Result<Option<Value>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "storage state unreadable, ignoring");
            return Ok(None);
        }
    };

    match validate_storage_state(&raw) {
        Ok(state) => Ok(Some(state)),
        Err(rejection) => {
            TraceEvent::StorageStateRejected {
                reason: rejection.to_string(),
            }
            .emit();
            tracing::warn!(
                path = %path.display(),
                reason = %rejection,
                "storage state rejected, deleting file and starting clean"
            );
            if let Err(e) = std::fs::remove_file(path) {
                tracing::warn!(path = %path.display(), error = %e, "failed to delete rejected storage state");
            }
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accepts_well_formed_state() {
        let raw = json!({
            "cookies": [{"name": "sid", "value": "abc", "domain": "localhost"}],
            "origins": [{"origin": "http://localhost", "localStorage": [{"name": "k", "value": "v"}]}]
        })
        .to_string();
        assert!(validate_storage_state(&raw).is_ok());
    }

    #[test]
    fn accepts_empty_object() {
        assert!(validate_storage_state("{}").is_ok());
    }

    #[test]
    fn rejects_non_object_top_level() {
        assert_eq!(
            validate_storage_state("[1,2,3]"),
            Err(StorageRejection::NotAnObject)
        );
    }

    #[test]
    fn rejects_non_array_cookies() {
        let raw = r#"{"cookies": {"name": "sid"}}"#;
        assert_eq!(
            validate_storage_state(raw),
            Err(StorageRejection::CookiesNotArray)
        );
    }

    #[test]
    fn rejects_non_array_origins() {
        let raw = r#"{"origins": "http://localhost"}"#;
        assert_eq!(
            validate_storage_state(raw),
            Err(StorageRejection::OriginsNotArray)
        );
    }

    #[test]
    fn rejects_snapshot_sentinel_case_insensitively() {
        let raw = r#"{"cookies": [], "note": "=== SNAPSHOT of page"}"#;
        assert!(matches!(
            validate_storage_state(raw),
            Err(StorageRejection::Sentinel(_))
        ));
    }

    #[test]
    fn rejects_ref_marker_inside_local_storage_value() {
        // Sentinels in user-controlled values still reject; see the doc
        // comment on validate_storage_state.
        let raw = json!({
            "origins": [{"origin": "http://localhost", "localStorage": [
                {"name": "saved", "value": "click [ref=e12]"}
            ]}]
        })
        .to_string();
        assert!(matches!(
            validate_storage_state(&raw),
            Err(StorageRejection::Sentinel(_))
        ));
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            validate_storage_state("not json at all"),
            Err(StorageRejection::Unparseable(_))
        ));
    }

    #[test]
    fn load_deletes_rejected_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("browser-state.json");
        std::fs::write(&path, r#"{"cookies": [], "x": "ACCESSIBILITY TREE"}"#).unwrap();

        let loaded = load_storage_state(&path).unwrap();
        assert!(loaded.is_none());
        assert!(!path.exists());
    }

    #[test]
    fn load_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = load_storage_state(&dir.path().join("absent.json")).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn load_keeps_valid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("browser-state.json");
        std::fs::write(&path, r#"{"cookies": [], "origins": []}"#).unwrap();

        let loaded = load_storage_state(&path).unwrap();
        assert!(loaded.is_some());
        assert!(path.exists());
    }
}
