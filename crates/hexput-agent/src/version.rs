// SPDX-License-Identifier: CC-BY-NC-ND-4.0

//! Version tag normalization and comparison

use std::cmp::Ordering;

/// Extract version from a release tag (strips leading "v" and whitespace)
pub fn version_from_tag(tag: &str) -> &str {
    let tag = tag.trim();
    tag.strip_prefix(['v', 'V']).unwrap_or(tag)
}

/// Tags naming the same release, ignoring a `v` prefix
pub fn same_version(a: &str, b: &str) -> bool {
    version_from_tag(a) == version_from_tag(b)
}

/// Parse semver-like version strings (e.g., "0.2.38", "v0.2.38")
pub fn parse_version(s: &str) -> Option<(u32, u32, u32)> {
    let mut parts = version_from_tag(s).split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    let patch = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((major, minor, patch))
}

/// Orders `remote` against `local` when both are plain `X.Y.Z` versions
pub fn compare(local: &str, remote: &str) -> Option<Ordering> {
    Some(parse_version(remote)?.cmp(&parse_version(local)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_from_tag_strips_v() {
        assert_eq!(version_from_tag("v0.2.38"), "0.2.38");
        assert_eq!(version_from_tag("V0.2.38"), "0.2.38");
        assert_eq!(version_from_tag("0.2.38\n"), "0.2.38");
        assert_eq!(version_from_tag("vV1.0.0"), "V1.0.0");
    }

    #[test]
    fn test_same_version() {
        assert!(same_version("v1.0.0", "v1.0.0"));
        assert!(same_version("v1.0.0", "1.0.0"));
        assert!(!same_version("v1.0.0", "v1.0.1"));
        assert!(!same_version("v1.0.0-rc1", "v1.0.0"));
        assert!(!same_version("vv1.0.0", "1.0.0"));
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("v2.3.1"), Some((2, 3, 1)));
        assert_eq!(parse_version("10.20.30"), Some((10, 20, 30)));
        assert_eq!(parse_version("1.2"), None);
        assert_eq!(parse_version("1.2.3.4"), None);
        assert_eq!(parse_version("1.2.3-beta"), None);
    }

    #[test]
    fn test_compare() {
        assert_eq!(compare("0.2.38", "0.2.39"), Some(Ordering::Greater));
        assert_eq!(compare("v1.0.0", "1.0.0"), Some(Ordering::Equal));
        assert_eq!(compare("1.0.0", "0.9.99"), Some(Ordering::Less));
        assert_eq!(compare("nightly", "1.0.0"), None);
    }
}
