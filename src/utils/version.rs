// src/utils/version.rs

//! Registry-agnostic version ordering.
//!
//! npm (semver), PyPI (PEP 440) and RubyGems versions are all compared with
//! the same segment rules:
//!
//! - numeric segments compare numerically, alphanumeric ones lexically
//! - a release outranks its prereleases (`1.0.0` > `1.0.0-1`, `1.0` > `1.0a1`)
//! - `dev` tags sort below every other prerelease tag (`1.0.dev1` < `1.0a1`)
//! - `post` segments outrank the release (`1.0.post1` > `1.0`)
//! - trailing zero segments are ignored (`1.0` == `1.0.0`)
//! - build metadata and a leading `v` are ignored

use std::cmp::Ordering;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Num(u64),
    Alpha(String),
}

/// A version split at the first `-` into release and prerelease parts.
#[derive(Debug)]
struct Parsed {
    release: Vec<Segment>,
    prerelease: Option<Vec<Segment>>,
}

fn parse(version: &str) -> Parsed {
    let trimmed = version.trim();
    let trimmed = trimmed
        .strip_prefix('v')
        .or_else(|| trimmed.strip_prefix('V'))
        .unwrap_or(trimmed);
    let core = trimmed.split('+').next().unwrap_or("");

    match core.split_once('-') {
        None => Parsed {
            release: segments(core),
            prerelease: None,
        },
        Some((release, suffix)) => {
            let mut release = segments(release);
            let suffix = segments(suffix);
            match suffix.first() {
                None => Parsed {
                    release,
                    prerelease: None,
                },
                // `1.0-post1` is a post release, not a prerelease.
                Some(first) if is_post(first) => {
                    release.extend(suffix);
                    Parsed {
                        release,
                        prerelease: None,
                    }
                }
                Some(_) => Parsed {
                    release,
                    prerelease: Some(suffix),
                },
            }
        }
    }
}

fn segments(text: &str) -> Vec<Segment> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut numeric = false;

    let flush = |current: &mut String, numeric: bool, out: &mut Vec<Segment>| {
        if current.is_empty() {
            return;
        }
        let segment = if numeric {
            // Absurdly long digit runs saturate instead of failing.
            Segment::Num(current.parse().unwrap_or(u64::MAX))
        } else {
            Segment::Alpha(normalize_tag(&current.to_lowercase()))
        };
        out.push(segment);
        current.clear();
    };

    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            let is_digit = c.is_ascii_digit();
            if !current.is_empty() && is_digit != numeric {
                flush(&mut current, numeric, &mut out);
            }
            numeric = is_digit;
            current.push(c);
        } else {
            flush(&mut current, numeric, &mut out);
        }
    }
    flush(&mut current, numeric, &mut out);
    out
}

/// PEP 440 spellings of the same prerelease tag.
fn normalize_tag(tag: &str) -> String {
    match tag {
        "alpha" => "a",
        "beta" => "b",
        "c" | "pre" | "preview" => "rc",
        other => other,
    }
    .to_string()
}

fn is_post(segment: &Segment) -> bool {
    matches!(segment, Segment::Alpha(s) if s == "post" || s == "rev" || s == "r")
}

fn is_dev(segment: &Segment) -> bool {
    matches!(segment, Segment::Alpha(s) if s == "dev")
}

fn compare_tags(l: &Segment, r: &Segment, x: &str, y: &str) -> Ordering {
    match (is_post(l), is_post(r)) {
        (true, false) => return Ordering::Greater,
        (false, true) => return Ordering::Less,
        _ => {}
    }
    match (is_dev(l), is_dev(r)) {
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        _ => x.cmp(y),
    }
}

/// Ordering of a version that ended against the remaining segments of the other.
fn ended_against(rest: &[Segment]) -> Ordering {
    match rest.iter().find(|s| **s != Segment::Num(0)) {
        None => Ordering::Equal,
        Some(Segment::Num(_)) => Ordering::Less,
        Some(seg) if is_post(seg) => Ordering::Less,
        // The other side continues with a prerelease tag
        Some(Segment::Alpha(_)) => Ordering::Greater,
    }
}

fn compare_release(left: &[Segment], right: &[Segment]) -> Ordering {
    for (l, r) in left.iter().zip(right.iter()) {
        let ord = match (l, r) {
            (Segment::Num(x), Segment::Num(y)) => x.cmp(y),
            (Segment::Alpha(x), Segment::Alpha(y)) => compare_tags(l, r, x, y),
            (Segment::Num(_), Segment::Alpha(_)) => {
                if is_post(r) {
                    Ordering::Less
                } else {
                    Ordering::Greater
                }
            }
            (Segment::Alpha(_), Segment::Num(_)) => {
                if is_post(l) {
                    Ordering::Greater
                } else {
                    Ordering::Less
                }
            }
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }

    match left.len().cmp(&right.len()) {
        Ordering::Equal => Ordering::Equal,
        Ordering::Less => ended_against(&right[left.len()..]),
        Ordering::Greater => ended_against(&left[right.len()..]).reverse(),
    }
}

/// Semver precedence of two prerelease parts: numeric identifiers sort
/// below alphanumeric ones and a longer identical prefix wins.
fn compare_prerelease(left: &[Segment], right: &[Segment]) -> Ordering {
    for (l, r) in left.iter().zip(right.iter()) {
        let ord = match (l, r) {
            (Segment::Num(x), Segment::Num(y)) => x.cmp(y),
            (Segment::Alpha(x), Segment::Alpha(y)) => compare_tags(l, r, x, y),
            (Segment::Num(_), Segment::Alpha(_)) => Ordering::Less,
            (Segment::Alpha(_), Segment::Num(_)) => Ordering::Greater,
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    left.len().cmp(&right.len())
}

/// Compare two version strings.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let left = parse(a);
    let right = parse(b);

    compare_release(&left.release, &right.release).then_with(|| {
        match (&left.prerelease, &right.prerelease) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(l), Some(r)) => compare_prerelease(l, r),
        }
    })
}

/// Whether `candidate` is newer than or equal to `current`.
pub fn is_at_least(candidate: &str, current: &str) -> bool {
    compare_versions(candidate, current) != Ordering::Less
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_segments_compare_numerically() {
        assert_eq!(compare_versions("1.10.0", "1.9.9"), Ordering::Greater);
        assert_eq!(compare_versions("2.0.0", "10.0.0"), Ordering::Less);
        assert_eq!(compare_versions("4.17.21", "4.17.21"), Ordering::Equal);
    }

    #[test]
    fn test_release_outranks_prerelease() {
        assert_eq!(compare_versions("1.0.0", "1.0.0-rc.1"), Ordering::Greater);
        assert_eq!(compare_versions("1.0.0-alpha", "1.0.0-beta"), Ordering::Less);
        assert_eq!(compare_versions("1.0a1", "1.0"), Ordering::Less);
        assert_eq!(compare_versions("7.1.0.rc1", "7.1.0"), Ordering::Less);
    }

    #[test]
    fn test_post_release_outranks_release() {
        assert_eq!(compare_versions("1.0.post1", "1.0"), Ordering::Greater);
        assert_eq!(compare_versions("1.0", "1.0.post2"), Ordering::Less);
    }

    #[test]
    fn test_trailing_zeros_and_decorations_ignored() {
        assert_eq!(compare_versions("1.0", "1.0.0"), Ordering::Equal);
        assert_eq!(compare_versions("v2.3.1", "2.3.1"), Ordering::Equal);
        assert_eq!(compare_versions("1.0.0+build.5", "1.0.0"), Ordering::Equal);
        assert_eq!(compare_versions("1.0", "1.0.1"), Ordering::Less);
        assert_eq!(compare_versions("1.0", "1.0.0-rc1"), Ordering::Greater);
    }

    #[test]
    fn test_numeric_prerelease_ranks_below_release() {
        assert_eq!(compare_versions("1.0.0", "1.0.0-1"), Ordering::Greater);
        assert_eq!(compare_versions("2.0.0-0", "2.0.0"), Ordering::Less);
        assert_eq!(compare_versions("1.0.0-1", "1.0.0-alpha"), Ordering::Less);
        assert_eq!(compare_versions("1.0.0-alpha", "1.0.0-alpha.1"), Ordering::Less);
        assert_eq!(compare_versions("1.0.0-rc.2", "1.0.0-rc.10"), Ordering::Less);
        assert!(is_at_least("1.0.0", "1.0.0-1"));
        assert!(!is_at_least("2.0.0-0", "2.0.0"));
    }

    #[test]
    fn test_dev_release_ranks_below_alpha() {
        assert_eq!(compare_versions("1.0.dev1", "1.0a1"), Ordering::Less);
        assert_eq!(compare_versions("1.0a1", "1.0b1"), Ordering::Less);
        assert_eq!(compare_versions("1.0b2", "1.0rc1"), Ordering::Less);
        assert_eq!(compare_versions("1.0a1.dev1", "1.0a1"), Ordering::Less);
        assert_eq!(compare_versions("1.0.dev1", "1.0"), Ordering::Less);
        assert_eq!(compare_versions("1.0alpha1", "1.0a1"), Ordering::Equal);
    }

    #[test]
    fn test_hyphenated_post_release() {
        assert_eq!(compare_versions("1.0-post1", "1.0"), Ordering::Greater);
        assert_eq!(compare_versions("1.0-post1", "1.0.post1"), Ordering::Equal);
    }

    #[test]
    fn test_is_at_least() {
        assert!(is_at_least("2.0.0", "2.0.0"));
        assert!(is_at_least("2.0.1", "2.0.0"));
        assert!(!is_at_least("1.9.0", "2.0.0"));
    }
}
