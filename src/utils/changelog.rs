// src/utils/changelog.rs

//! Changelog extraction from package descriptions.

use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha256};

static HEADING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^(#{1,6})[ \t]+(.+?)[ \t#]*$").unwrap_or_else(|e| panic!("heading regex: {e}"))
});

static CHANGELOG_TITLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(changelog|change\s+log|changes|history|release\s+notes)\b")
        .unwrap_or_else(|e| panic!("title regex: {e}"))
});

/// Pull the changelog section out of a Markdown README.
///
/// The section runs from the first changelog-like heading to the next
/// heading of the same or a higher level. Returns `None` if there is no
/// such heading or the section is empty.
pub fn extract_section(markdown: &str) -> Option<String> {
    let headings: Vec<(usize, usize, usize, &str)> = HEADING
        .captures_iter(markdown)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let level = caps.get(1)?.as_str().len();
            let title = caps.get(2)?.as_str().trim();
            Some((whole.start(), whole.end(), level, title))
        })
        .collect();

    let (idx, &(_, body_start, level, _)) = headings
        .iter()
        .enumerate()
        .find(|(_, (_, _, _, title))| CHANGELOG_TITLE.is_match(title))?;

    let body_end = headings[idx + 1..]
        .iter()
        .find(|(_, _, l, _)| *l <= level)
        .map(|(start, _, _, _)| *start)
        .unwrap_or(markdown.len());

    let section = markdown[body_start..body_end].trim();
    (!section.is_empty()).then(|| section.to_string())
}

/// Truncate to at most `max_bytes`, cutting on a char boundary.
pub fn truncate_utf8(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Normalize changelog text: unify line endings, trim, and bound its size.
pub fn normalize(text: &str, max_bytes: usize) -> Option<String> {
    let unified = text.replace("\r\n", "\n");
    let trimmed = truncate_utf8(unified.trim(), max_bytes).trim_end();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Hex SHA-256 of the crawled content, used to detect unchanged recrawls.
pub fn content_digest(version: &str, changelog: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(version.as_bytes());
    hasher.update([0u8]);
    if let Some(text) = changelog {
        hasher.update(text.as_bytes());
    }
    hex::encode(hasher.finalize())
}
