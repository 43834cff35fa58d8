//! Deterministic group/test-case identity and filesystem-safe path generation.
//!
//! Identity is a pure function of an ordered path: the same ancestor chain and
//! name always produce the same ID, and two groups with the same path are the
//! same group (see [`group_id`]). Path sanitization turns an arbitrary display
//! name into a single filesystem path component that is safe on every
//! supported platform (see [`sanitize_component`]).

use std::path::PathBuf;

use sha2::{Digest, Sha256};

/// A 128-bit deterministic identity, the first 16 bytes of a SHA-256 digest of
/// the colon-joined path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId([u8; 16]);

impl GroupId {
    pub fn as_hex(&self) -> String {
        hex_encode(&self.0)
    }
}

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_hex())
    }
}

/// Identity of a [`crate::model::TestCase`], same construction as [`GroupId`]
/// but over `parentNames + testName` rather than `parentNames + groupName`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TestCaseId([u8; 16]);

impl TestCaseId {
    pub fn as_hex(&self) -> String {
        hex_encode(&self.0)
    }
}

impl std::fmt::Display for TestCaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_hex())
    }
}

fn hex_encode(bytes: &[u8; 16]) -> String {
    let mut s = String::with_capacity(32);
    for b in bytes {
        s.push_str(&format!("{:02x}", b));
    }
    s
}

/// Joins an ordered path with `:` and returns the first 16 bytes of its
/// SHA-256 digest. No escaping is applied: two distinct inputs that collide
/// under the string join are treated as the same identity by design (this
/// keeps discovery idempotent under upstream name normalization, per the
/// identity contract).
fn path_hash(segments: &[&str]) -> [u8; 16] {
    let joined = segments.join(":");
    let digest = Sha256::digest(joined.as_bytes());
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest[..16]);
    out
}

/// `GroupID = lowercase_hex(first_16_bytes(SHA-256(ancestors ":" ... ":" name)))`.
pub fn group_id(ancestors: &[String], name: &str) -> GroupId {
    let mut segments: Vec<&str> = ancestors.iter().map(String::as_str).collect();
    segments.push(name);
    GroupId(path_hash(&segments))
}

/// Same construction as [`group_id`], over the test case's parent path and its
/// own name.
pub fn test_case_id(parent_path: &[String], test_name: &str) -> TestCaseId {
    let mut segments: Vec<&str> = parent_path.iter().map(String::as_str).collect();
    segments.push(test_name);
    TestCaseId(path_hash(&segments))
}

/// Default component-length cap, in bytes. Configurable between 100 and 252.
pub const DEFAULT_COMPONENT_CAP: usize = 100;

/// Default depth cap. Hierarchies deeper than this collapse their middle
/// levels into one synthetic `_collapsed_<hex>_` component.
pub const DEFAULT_DEPTH_CAP: usize = 20;

const RESERVED_DEVICE_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Sanitizes a single display name into a filesystem-safe path component.
///
/// Applies the eight-step rule in order: trim, separator replacement,
/// dot/dash folding, reserved-character stripping, whitespace/underscore
/// collapsing, reserved-device-name wrapping, empty-string fallback, and
/// length capping with a content hash suffix. Idempotent, non-empty, free of
/// path separators, bounded by `cap`, and pure.
pub fn sanitize_component(input: &str, cap: usize) -> String {
    let cap = cap.clamp(100, 252);

    // 1. Trim surrounding whitespace, then at most one leading and one
    // trailing `.` (a second leading/trailing dot survives to be folded to
    // `_` by step 3, e.g. "../etc/passwd" -> "__etc_passwd").
    let mut s = input.trim().to_string();
    if let Some(rest) = s.strip_prefix('.') {
        s = rest.to_string();
    }
    if let Some(rest) = s.strip_suffix('.') {
        s = rest.to_string();
    }

    // 2. Replace `/` and `\` with `_`.
    s = s.replace(['/', '\\'], "_");

    // 3. Replace `.` and `-` with `_` (all occurrences, not just leading/trailing).
    s = s.replace(['.', '-'], "_");

    // 4. Replace reserved characters and control bytes with `_`.
    s = s
        .chars()
        .map(|c| {
            if matches!(c, '<' | '>' | ':' | '"' | '|' | '?' | '*') || (c as u32) < 0x20 {
                '_'
            } else {
                c
            }
        })
        .collect();

    // 5. Collapse runs of whitespace/underscore into a single `_`.
    s = collapse_runs(&s);

    // 6. Reserved device names are wrapped as `_name_`, lowercased.
    if RESERVED_DEVICE_NAMES
        .iter()
        .any(|r| r.eq_ignore_ascii_case(&s))
    {
        s = format!("_{}_", s.to_ascii_lowercase());
    }

    // 7. Empty after steps 1-6 becomes `_empty_`.
    if s.is_empty() {
        s = "_empty_".to_string();
    }

    // 8. Components longer than the cap are truncated and suffixed with a
    // hash of the pre-truncation value.
    if s.len() > cap {
        let digest = Sha256::digest(s.as_bytes());
        let suffix = format!("_{}", hex_prefix(&digest, 4));
        let keep = cap.saturating_sub(suffix.len());
        let truncated = truncate_at_char_boundary(&s, keep);
        s = format!("{}{}", truncated, suffix);
    }

    s
}

fn hex_prefix(digest: &[u8], n_bytes: usize) -> String {
    digest[..n_bytes]
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

fn truncate_at_char_boundary(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

fn collapse_runs(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut last_was_collapsible = false;
    for c in s.chars() {
        let collapsible = c.is_whitespace() || c == '_';
        if collapsible {
            if !last_was_collapsible {
                out.push('_');
            }
            last_was_collapsible = true;
        } else {
            out.push(c);
            last_was_collapsible = false;
        }
    }
    out
}

/// Collapses a path deeper than `depth_cap` into one synthetic
/// `_collapsed_<hex>_` middle segment, preserving the first and last halves.
pub fn collapse_depth(components: &[String], depth_cap: usize) -> Vec<String> {
    if components.len() <= depth_cap {
        return components.to_vec();
    }

    let keep_each_side = depth_cap.saturating_sub(1) / 2;
    let head = &components[..keep_each_side];
    let tail_start = components.len() - (depth_cap - 1 - keep_each_side);
    let tail = &components[tail_start..];
    let removed = &components[keep_each_side..tail_start];

    let digest = Sha256::digest(removed.join("_").as_bytes());
    let collapsed = format!("_collapsed_{}_", hex_prefix(&digest, 4));

    let mut out = Vec::with_capacity(depth_cap);
    out.extend_from_slice(head);
    out.push(collapsed);
    out.extend_from_slice(tail);
    out
}

/// Builds the on-disk path for a group's `index.md`, applying sanitization to
/// every path component, depth collapsing, and (on Windows) the platform
/// length cap.
pub fn group_report_path(
    run_reports_dir: &std::path::Path,
    ancestors: &[String],
    name: &str,
    component_cap: usize,
    depth_cap: usize,
) -> PathBuf {
    let mut full_path: Vec<String> = ancestors.to_vec();
    full_path.push(name.to_string());

    let sanitized: Vec<String> = full_path
        .iter()
        .map(|c| sanitize_component(c, component_cap))
        .collect();

    let collapsed = collapse_depth(&sanitized, depth_cap);

    let mut path = run_reports_dir.to_path_buf();
    for component in &collapsed {
        path.push(component);
    }
    path.push("index.md");

    apply_windows_length_cap(path)
}

#[cfg(target_os = "windows")]
const WINDOWS_PATH_CAP: usize = 260;

fn apply_windows_length_cap(path: PathBuf) -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        let as_str = path.to_string_lossy();
        if as_str.len() > WINDOWS_PATH_CAP {
            let components: Vec<_> = path.components().collect();
            let last = components.last().cloned();
            let mut rebuilt = PathBuf::new();
            let hashable: Vec<String> = components[..components.len().saturating_sub(1)]
                .iter()
                .map(|c| c.as_os_str().to_string_lossy().to_string())
                .collect();
            let digest = sha2::Sha256::digest(hashable.join("/").as_bytes());
            rebuilt.push(hex_prefix(&digest, 4));
            if let Some(last) = last {
                rebuilt.push(last.as_os_str());
            }
            return rebuilt;
        }
        path
    }
    #[cfg(not(target_os = "windows"))]
    {
        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_is_idempotent() {
        let long_input = "a".repeat(150);
        let inputs = [
            "../etc/passwd",
            "CON",
            "コンポーネント.test.tsx",
            long_input.as_str(),
            "",
            "   ...   ",
        ];
        for input in inputs {
            let once = sanitize_component(input, DEFAULT_COMPONENT_CAP);
            let twice = sanitize_component(&once, DEFAULT_COMPONENT_CAP);
            assert_eq!(once, twice, "not idempotent for {:?}", input);
        }
    }

    #[test]
    fn sanitize_never_empty() {
        assert_eq!(sanitize_component("", DEFAULT_COMPONENT_CAP), "_empty_");
        // A single `.` is fully consumed by step 1's leading-dot strip.
        assert_eq!(sanitize_component(".", DEFAULT_COMPONENT_CAP), "_empty_");
        // Only one leading and one trailing `.` are stripped in step 1; the
        // middle `.` survives to be folded to `_` by step 3.
        assert_eq!(sanitize_component("...", DEFAULT_COMPONENT_CAP), "_");
    }

    #[test]
    fn sanitize_no_separators() {
        let out = sanitize_component("../etc/passwd", DEFAULT_COMPONENT_CAP);
        assert!(!out.contains('/'));
        assert!(!out.contains('\\'));
    }

    #[test]
    fn sanitize_respects_cap() {
        let long = "a".repeat(150);
        let out = sanitize_component(&long, DEFAULT_COMPONENT_CAP);
        assert!(out.len() <= DEFAULT_COMPONENT_CAP);
        assert!(out.ends_with(char::is_alphanumeric) || out.contains('_'));
    }

    #[test]
    fn sanitize_valid_utf8_on_any_input() {
        let out = sanitize_component("コンポーネント.test.tsx", DEFAULT_COMPONENT_CAP);
        assert!(!out.is_empty());
        assert!(!out.contains('/'));
        assert!(!out.contains('\\'));
    }

    #[test]
    fn scenario_sanitize_traversal() {
        assert_eq!(
            sanitize_component("../etc/passwd", DEFAULT_COMPONENT_CAP),
            "__etc_passwd"
        );
    }

    #[test]
    fn scenario_sanitize_reserved_device_name() {
        assert_eq!(sanitize_component("CON", DEFAULT_COMPONENT_CAP), "_con_");
    }

    #[test]
    fn scenario_sanitize_long_name() {
        let long = "a".repeat(150);
        let out = sanitize_component(&long, DEFAULT_COMPONENT_CAP);
        assert_eq!(out.len(), 100);
        assert!(out.chars().nth(out.len() - 9) == Some('_'));
    }

    #[test]
    fn group_id_is_pure() {
        let ancestors = vec!["a".to_string(), "b".to_string()];
        let id1 = group_id(&ancestors, "c");
        let id2 = group_id(&ancestors, "c");
        assert_eq!(id1, id2);
    }

    #[test]
    fn group_id_distinguishes_paths() {
        let a = group_id(&["x".to_string()], "y");
        let b = group_id(&["y".to_string()], "x");
        assert_ne!(a, b);
    }

    #[test]
    fn collapse_depth_preserves_shallow_paths() {
        let components: Vec<String> = (0..10).map(|i| format!("level{i}")).collect();
        let out = collapse_depth(&components, DEFAULT_DEPTH_CAP);
        assert_eq!(out, components);
    }

    #[test]
    fn collapse_depth_of_25_yields_20_with_one_collapsed_segment() {
        let components: Vec<String> = (0..25).map(|i| format!("level{i}")).collect();
        let out = collapse_depth(&components, DEFAULT_DEPTH_CAP);
        assert_eq!(out.len(), DEFAULT_DEPTH_CAP);
        let collapsed_count = out.iter().filter(|c| c.starts_with("_collapsed_")).count();
        assert_eq!(collapsed_count, 1);
        assert_eq!(out[0], "level0");
        assert_eq!(out[out.len() - 1], "level24");
    }

    #[test]
    fn group_report_path_has_no_separators_within_components() {
        let path = group_report_path(
            std::path::Path::new("/tmp/run/reports"),
            &["weird/name".to_string()],
            "also\\bad",
            DEFAULT_COMPONENT_CAP,
            DEFAULT_DEPTH_CAP,
        );
        let joined = path.to_string_lossy();
        assert!(joined.starts_with("/tmp/run/reports"));
        assert!(joined.ends_with("index.md"));
    }
}
