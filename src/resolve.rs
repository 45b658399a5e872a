//! Pick exactly one boot entry for a distribution.
//!
//! Rule:
//!
//! 1. Exact duplicates (same label, kernel, initrds and parameters) collapse
//!    to the first occurrence.
//! 2. No entries at all is `NoMatchingConfig`.
//! 3. With an expected label (caller override, else the distribution's
//!    `boot_label`), the entries whose label or menu text equal it
//!    case-insensitively are candidates. None is `NoMatchingConfig`; more
//!    than one is `AmbiguousSelection`. There is no fallback to an unrelated
//!    entry.
//! 4. Without an expected label the first entry wins.

use crate::bootconfig::BootEntry;
use crate::catalog::Distribution;
use crate::error::ResolveError;

pub fn resolve(entries: &[BootEntry], distro: &Distribution) -> Result<BootEntry, ResolveError> {
    resolve_label(entries, distro, None)
}

/// Like [`resolve`], with `label` taking precedence over `distro.boot_label`.
pub fn resolve_label(
    entries: &[BootEntry],
    distro: &Distribution,
    label: Option<&str>,
) -> Result<BootEntry, ResolveError> {
    let entries = dedup(entries);
    let expected = label.or(distro.boot_label.as_deref());

    let no_match = || ResolveError::NoMatchingConfig {
        distro: distro.name.clone(),
        label: expected.map(str::to_string),
        available: entries.iter().map(|e| e.label.clone()).collect(),
    };

    let Some(expected) = expected else {
        let first = entries.first().ok_or_else(no_match)?;
        tracing::info!("selected boot entry '{}' (first of {})", first.label, entries.len());
        return Ok((*first).clone());
    };

    let candidates: Vec<&BootEntry> = entries
        .iter()
        .copied()
        .filter(|e| label_matches(e, expected))
        .collect();

    match candidates.as_slice() {
        [] => Err(no_match()),
        [only] => {
            tracing::info!("selected boot entry '{}' for '{}'", only.label, distro.name);
            Ok((*only).clone())
        }
        many => Err(ResolveError::AmbiguousSelection {
            distro: distro.name.clone(),
            label: expected.to_string(),
            count: many.len(),
        }),
    }
}

fn label_matches(entry: &BootEntry, expected: &str) -> bool {
    entry.label.eq_ignore_ascii_case(expected)
        || entry
            .display
            .as_deref()
            .is_some_and(|d| d.eq_ignore_ascii_case(expected))
}

/// Drop exact duplicates, keeping the first occurrence and source order.
fn dedup(entries: &[BootEntry]) -> Vec<&BootEntry> {
    let mut kept: Vec<&BootEntry> = Vec::with_capacity(entries.len());
    for entry in entries {
        let duplicate = kept.iter().any(|k| {
            k.label == entry.label
                && k.kernel_path == entry.kernel_path
                && k.initrd_paths == entry.initrd_paths
                && k.parameters == entry.parameters
        });
        if duplicate {
            tracing::debug!("dropping duplicate boot entry '{}'", entry.label);
        } else {
            kept.push(entry);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::error::ErrorKind;
    use std::path::{Path, PathBuf};

    fn distro(boot_label: Option<&str>) -> Distribution {
        let label = boot_label
            .map(|l| format!(r#", "boot_label": "{l}""#))
            .unwrap_or_default();
        let raw = format!(r#"{{ "core": {{ "match_pattern": ".*"{label} }} }}"#);
        Catalog::from_json_str(&raw, Path::new("."))
            .unwrap()
            .get("core")
            .unwrap()
            .clone()
    }

    fn entry(label: &str, kernel: &str, params: &str) -> BootEntry {
        BootEntry {
            label: label.to_string(),
            display: None,
            kernel_path: PathBuf::from(kernel),
            initrd_paths: vec![],
            parameters: params.to_string(),
            source_config: PathBuf::from("/mnt/isolinux.cfg"),
        }
    }

    #[test]
    fn test_zero_entries_is_no_matching_config() {
        let err = resolve(&[], &distro(None)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoMatchingConfig);

        let err = resolve(&[], &distro(Some("live"))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoMatchingConfig);
    }

    #[test]
    fn test_without_label_first_entry_wins() {
        let entries = vec![entry("a", "/k1", ""), entry("b", "/k2", "")];
        assert_eq!(resolve(&entries, &distro(None)).unwrap().label, "a");
    }

    #[test]
    fn test_boot_label_selects_case_insensitively() {
        let entries = vec![entry("install", "/k1", ""), entry("Live", "/k2", "quiet")];
        let picked = resolve(&entries, &distro(Some("live"))).unwrap();
        assert_eq!(picked.kernel_path, PathBuf::from("/k2"));
    }

    #[test]
    fn test_display_text_also_matches() {
        let mut live = entry("l1", "/k2", "");
        live.display = Some("Live System".to_string());
        let entries = vec![entry("install", "/k1", ""), live];
        assert_eq!(
            resolve(&entries, &distro(Some("live system"))).unwrap().label,
            "l1"
        );
    }

    #[test]
    fn test_override_beats_boot_label() {
        let entries = vec![entry("live", "/k1", ""), entry("safe", "/k2", "")];
        let picked = resolve_label(&entries, &distro(Some("live")), Some("safe")).unwrap();
        assert_eq!(picked.label, "safe");
    }

    #[test]
    fn test_missing_label_never_falls_back() {
        let entries = vec![entry("install", "/k1", "")];
        match resolve(&entries, &distro(Some("live"))).unwrap_err() {
            ResolveError::NoMatchingConfig { label, available, .. } => {
                assert_eq!(label.as_deref(), Some("live"));
                assert_eq!(available, vec!["install".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_exact_duplicates_collapse() {
        let entries = vec![entry("live", "/k", "quiet"), entry("live", "/k", "quiet")];
        let picked = resolve(&entries, &distro(Some("live"))).unwrap();
        assert_eq!(picked.parameters, "quiet");
    }

    #[test]
    fn test_distinct_entries_with_same_label_are_ambiguous() {
        let entries = vec![entry("live", "/k", "quiet"), entry("LIVE", "/k", "nomodeset")];
        let err = resolve(&entries, &distro(Some("live"))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AmbiguousSelection);
    }
}
