//! Package filename version handling.
//!
//! CI names packages `<name>-<ref-slug>-<version>.iesa`, e.g.
//! `ow_core_apps-release-master-0.9.8.4.iesa`; the version is the four-part
//! numeric suffix.

use std::cmp::Ordering;

use once_cell::sync::Lazy;
use regex::Regex;

pub const UNKNOWN_VERSION: &str = "Unknown Version";

/// Extensions the server accepts for installation.
const INSTALLABLE_EXTENSIONS: &[&str] = &[".iesa"];

static VERSION_SUFFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"-(\d+\.\d+\.\d+\.\d+)\.iesa$").expect("version regex is valid"));

/// Pulls the dotted version out of a package filename, falling back to the
/// [`UNKNOWN_VERSION`] sentinel for names that don't carry one.
pub fn extract_version(file_name: &str) -> String {
    VERSION_SUFFIX
        .captures(file_name)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| UNKNOWN_VERSION.to_string())
}

/// Compares two dotted numeric versions field by field, treating missing or
/// unparsable fields as zero. Total order even when the tuple lengths differ.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let parts_a: Vec<u64> = a.split('.').map(|p| p.parse().unwrap_or(0)).collect();
    let parts_b: Vec<u64> = b.split('.').map(|p| p.parse().unwrap_or(0)).collect();

    for i in 0..parts_a.len().max(parts_b.len()) {
        let part_a = parts_a.get(i).copied().unwrap_or(0);
        let part_b = parts_b.get(i).copied().unwrap_or(0);
        match part_a.cmp(&part_b) {
            Ordering::Equal => continue,
            other => return other,
        }
    }

    Ordering::Equal
}

/// Extension allow-list gate applied before any hashing or registration.
pub fn is_installable(file_name: &str) -> bool {
    INSTALLABLE_EXTENSIONS
        .iter()
        .any(|ext| file_name.ends_with(ext))
}
