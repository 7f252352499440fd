//! Version ordering and host-binary range matching

use semver::{Version, VersionReq};

pub const WILDCARD_RANGE: &str = "*";

/// Parse a version leniently: a leading `v` is ignored and missing minor/patch
/// components are zero-filled (`"2.1"` -> `2.1.0`).
pub fn parse_version(raw: &str) -> Option<Version> {
    let trimmed = raw.trim().trim_start_matches(['v', 'V']);
    if let Ok(version) = Version::parse(trimmed) {
        return Some(version);
    }

    let parts: Vec<&str> = trimmed.split('.').collect();
    if parts.is_empty() || parts.len() > 3 || parts.iter().any(|p| p.parse::<u64>().is_err()) {
        return None;
    }
    let mut padded = parts.join(".");
    for _ in parts.len()..3 {
        padded.push_str(".0");
    }
    Version::parse(&padded).ok()
}

/// `Some(true)` when `candidate` is strictly newer than `current`,
/// `None` when either side is not a semantic version.
pub fn is_newer(candidate: &str, current: &str) -> Option<bool> {
    let candidate = parse_version(candidate)?;
    let current = parse_version(current)?;
    Some(candidate > current)
}

pub fn is_wildcard(range: &str) -> bool {
    let trimmed = range.trim();
    trimmed.is_empty() || trimmed == WILDCARD_RANGE
}

/// A parsed `targetBinaryRange` expression
#[derive(Debug, Clone, PartialEq)]
pub enum BinaryRange {
    Any,
    /// A bare version pins the host binary exactly
    Exact(Version),
    /// Alternatives separated by `||`
    AnyOf(Vec<VersionReq>),
}

impl BinaryRange {
    pub fn parse(raw: &str) -> Result<Self, String> {
        if is_wildcard(raw) {
            return Ok(BinaryRange::Any);
        }

        let trimmed = raw.trim();
        let is_bare = trimmed
            .trim_start_matches(['v', 'V'])
            .chars()
            .all(|c| c.is_ascii_digit() || c == '.');
        if is_bare {
            return parse_version(trimmed)
                .map(BinaryRange::Exact)
                .ok_or_else(|| format!("Invalid binary version: {}", raw));
        }

        let mut alternatives = Vec::new();
        for alternative in trimmed.split("||") {
            let normalized = normalize_comparators(alternative);
            let req = VersionReq::parse(&normalized)
                .map_err(|e| format!("Invalid binary range '{}': {}", raw, e))?;
            alternatives.push(req);
        }
        Ok(BinaryRange::AnyOf(alternatives))
    }

    pub fn admits(&self, host: &Version) -> bool {
        match self {
            BinaryRange::Any => true,
            BinaryRange::Exact(version) => version == host,
            BinaryRange::AnyOf(reqs) => reqs.iter().any(|req| req.matches(host)),
        }
    }
}

/// `">= 1.0 <2"` -> `">=1.0, <2"`
fn normalize_comparators(expr: &str) -> String {
    let mut comparators: Vec<String> = Vec::new();
    let mut pending_op = String::new();

    for token in expr.split([' ', ',']).filter(|t| !t.is_empty()) {
        if token.chars().all(|c| matches!(c, '<' | '>' | '=' | '~' | '^')) {
            pending_op.push_str(token);
            continue;
        }
        comparators.push(format!("{}{}", pending_op, token));
        pending_op.clear();
    }

    comparators.join(", ")
}

/// Whether a release targeting `range` may be offered to a host binary.
/// Without a host version only wildcard ranges qualify.
pub fn range_admits(range: &str, host_binary_version: Option<&str>) -> bool {
    if is_wildcard(range) {
        return true;
    }
    let Some(host) = host_binary_version.and_then(parse_version) else {
        return false;
    };
    match BinaryRange::parse(range) {
        Ok(parsed) => parsed.admits(&host),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lenient_parse() {
        assert_eq!(parse_version("v1.2.3"), Some(Version::new(1, 2, 3)));
        assert_eq!(parse_version("2.1"), Some(Version::new(2, 1, 0)));
        assert_eq!(parse_version("7"), Some(Version::new(7, 0, 0)));
        assert!(parse_version("1.0.0-beta.1").is_some());
        assert_eq!(parse_version("nightly"), None);
        assert_eq!(parse_version("1.2.3.4"), None);
    }

    #[test]
    fn test_is_newer() {
        assert_eq!(is_newer("2.0.0", "1.0.0"), Some(true));
        assert_eq!(is_newer("1.0.0", "1.0.0"), Some(false));
        assert_eq!(is_newer("0.9.0", "1.0.0"), Some(false));
        assert_eq!(is_newer("1.10.0", "1.9.0"), Some(true));
        assert_eq!(is_newer("build-42", "1.0.0"), None);
    }

    #[test]
    fn test_wildcard_admits_without_host() {
        assert!(range_admits("*", None));
        assert!(range_admits("", None));
        assert!(!range_admits("1.0.0", None));
    }

    #[test]
    fn test_bare_version_is_exact() {
        assert!(range_admits("1.2.3", Some("1.2.3")));
        assert!(!range_admits("1.2.3", Some("1.2.4")));
        assert!(range_admits("1.2", Some("1.2.0")));
    }

    #[test]
    fn test_range_expressions() {
        assert!(range_admits("^1.2.0", Some("1.9.0")));
        assert!(!range_admits("^1.2.0", Some("2.0.0")));
        assert!(range_admits(">=1.0.0 <2.0.0", Some("1.5.0")));
        assert!(range_admits(">= 1.0.0, < 2.0.0", Some("1.5.0")));
        assert!(!range_admits(">=1.0.0 <2.0.0", Some("2.0.0")));
        assert!(range_admits("1.2.*", Some("1.2.7")));
        assert!(range_admits("~1.0.0 || ^3.0.0", Some("3.1.0")));
        assert!(!range_admits("~1.0.0 || ^3.0.0", Some("2.0.0")));
    }

    #[test]
    fn test_invalid_range_admits_nothing() {
        assert!(BinaryRange::parse(">>garbage").is_err());
        assert!(!range_admits(">>garbage", Some("1.0.0")));
        assert!(!range_admits("^1.0.0", Some("not-a-version")));
    }
}
