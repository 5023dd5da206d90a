//! Tracked package records and the merge rules every store applies.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::utils::version::{compare_versions, is_at_least};

/// Package registries the pipeline watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryKind {
    Npm,
    Pypi,
    Rubygems,
}

impl RegistryKind {
    pub const ALL: [RegistryKind; 3] = [RegistryKind::Npm, RegistryKind::Pypi, RegistryKind::Rubygems];

    pub fn as_str(&self) -> &'static str {
        match self {
            RegistryKind::Npm => "npm",
            RegistryKind::Pypi => "pypi",
            RegistryKind::Rubygems => "rubygems",
        }
    }

    /// Normalize a package name the way the registry treats it.
    ///
    /// PyPI names follow PEP 503: lowercase, and runs of `-`, `_` and `.`
    /// collapse to a single `-`.
    pub fn normalize_name(&self, name: &str) -> String {
        let name = name.trim();
        match self {
            RegistryKind::Pypi => {
                let mut out = String::with_capacity(name.len());
                let mut in_separator = false;
                for c in name.chars() {
                    if matches!(c, '-' | '_' | '.') {
                        if !in_separator {
                            out.push('-');
                        }
                        in_separator = true;
                    } else {
                        out.extend(c.to_lowercase());
                        in_separator = false;
                    }
                }
                out
            }
            RegistryKind::Npm | RegistryKind::Rubygems => name.to_string(),
        }
    }
}

impl fmt::Display for RegistryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RegistryKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "npm" => Ok(RegistryKind::Npm),
            "pypi" => Ok(RegistryKind::Pypi),
            "rubygems" | "gems" => Ok(RegistryKind::Rubygems),
            other => Err(AppError::validation(format!("unknown registry '{other}'"))),
        }
    }
}

/// Globally unique key of a tracked package: registry plus package name.
///
/// Rendered and serialized as `"{registry}:{name}"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identity {
    registry: RegistryKind,
    name: String,
}

impl Identity {
    pub fn new(registry: RegistryKind, name: &str) -> Result<Self> {
        let name = registry.normalize_name(name);
        if name.is_empty() {
            return Err(AppError::validation("package name is empty"));
        }
        Ok(Self { registry, name })
    }

    pub fn registry(&self) -> RegistryKind {
        self.registry
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.registry, self.name)
    }
}

impl FromStr for Identity {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        let (registry, name) = s
            .split_once(':')
            .ok_or_else(|| AppError::validation(format!("identity '{s}' must be registry:name")))?;
        Identity::new(registry.parse()?, name)
    }
}

impl TryFrom<String> for Identity {
    type Error = AppError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Identity> for String {
    fn from(identity: Identity) -> Self {
        identity.to_string()
    }
}

/// Crawl state of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrawlStatus {
    Pending,
    Crawled,
    Failed,
}

/// Durable crawl state of one package identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangelogRecord {
    pub identity: Identity,
    /// Version whose content is stored
    pub last_known_version: Option<String>,
    /// Normalized changelog text
    pub changelog: Option<String>,
    /// SHA-256 of `changelog`
    pub content_digest: Option<String>,
    /// Upstream changelog or project page
    pub source_url: Option<String>,
    pub status: CrawlStatus,
    pub discovered_at: DateTime<Utc>,
    /// Last successful crawl; never moves backwards
    pub last_crawled_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub next_eligible_at: DateTime<Utc>,
    /// Consecutive failed crawls
    #[serde(default)]
    pub failure_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl ChangelogRecord {
    /// A fresh record for a newly discovered identity.
    pub fn pending(identity: Identity, now: DateTime<Utc>, next_eligible_at: DateTime<Utc>) -> Self {
        Self {
            identity,
            last_known_version: None,
            changelog: None,
            content_digest: None,
            source_url: None,
            status: CrawlStatus::Pending,
            discovered_at: now,
            last_crawled_at: None,
            last_attempt_at: None,
            next_eligible_at,
            failure_count: 0,
            last_error: None,
        }
    }

    /// Whether derived views should show this record.
    ///
    /// True once any crawl succeeded, so a failing recrawl keeps serving
    /// the last good content.
    pub fn is_published(&self) -> bool {
        self.last_crawled_at.is_some()
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_eligible_at <= now
    }
}

/// Successful crawl result to merge into a record.
#[derive(Debug, Clone, PartialEq)]
pub struct CrawlResult {
    pub version: String,
    pub changelog: Option<String>,
    pub content_digest: Option<String>,
    pub source_url: Option<String>,
}

/// A single mutation of a record.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordPatch {
    /// Watcher saw the identity; inserts a Pending record if absent.
    Discover { next_eligible_at: DateTime<Utc> },
    /// Crawl worker fetched current content.
    CrawlSucceeded {
        result: CrawlResult,
        next_eligible_at: DateTime<Utc>,
    },
    /// Crawl worker gave up on this identity for now.
    CrawlFailed {
        error: String,
        next_eligible_at: DateTime<Utc>,
    },
    /// Reconciler pushed the next eligibility time.
    Reschedule { next_eligible_at: DateTime<Utc> },
}

impl RecordPatch {
    /// Version the patch carries, used as the upsert's expected minimum.
    pub fn version(&self) -> Option<&str> {
        match self {
            RecordPatch::CrawlSucceeded { result, .. } => Some(&result.version),
            _ => None,
        }
    }
}

/// What an upsert did to the stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// Record did not exist and was created
    Inserted,
    /// Content or version changed
    Updated,
    /// Only bookkeeping fields changed
    Touched,
    /// Fetched version was older than the stored one; content kept
    Stale,
    /// Nothing changed
    Unchanged,
}

impl UpsertOutcome {
    /// Whether the stored content changed.
    pub fn content_changed(&self) -> bool {
        matches!(self, UpsertOutcome::Inserted | UpsertOutcome::Updated)
    }
}

/// Merge `patch` into `existing`, returning the new state.
///
/// Returns `None` when the patch has nothing to apply to (a non-discovery
/// patch on an absent record). `last_crawled_at` is max-merged, and content
/// only moves forward by version, so applying the same patch twice or a
/// stale patch after a newer one yields the same record.
pub fn apply_patch(
    identity: &Identity,
    existing: Option<&ChangelogRecord>,
    patch: &RecordPatch,
    now: DateTime<Utc>,
) -> Option<(ChangelogRecord, UpsertOutcome)> {
    let Some(current) = existing else {
        let mut record = ChangelogRecord::pending(identity.clone(), now, now);
        return match patch {
            RecordPatch::Discover { next_eligible_at } => {
                record.next_eligible_at = *next_eligible_at;
                Some((record, UpsertOutcome::Inserted))
            }
            RecordPatch::CrawlSucceeded { .. } | RecordPatch::CrawlFailed { .. } => {
                // Crawls may race ahead of discovery; merge into a blank record.
                let (merged, _) = apply_patch(identity, Some(&record), patch, now)?;
                Some((merged, UpsertOutcome::Inserted))
            }
            RecordPatch::Reschedule { .. } => None,
        };
    };

    let mut record = current.clone();
    let outcome = match patch {
        RecordPatch::Discover { .. } => UpsertOutcome::Unchanged,
        RecordPatch::CrawlSucceeded {
            result,
            next_eligible_at,
        } => {
            let newer_or_equal = record
                .last_known_version
                .as_deref()
                .is_none_or(|stored| is_at_least(&result.version, stored));

            let content_changed = newer_or_equal
                && (record.last_known_version.as_deref() != Some(result.version.as_str())
                    || record.content_digest != result.content_digest
                    || record.source_url != result.source_url);

            if content_changed {
                record.last_known_version = Some(result.version.clone());
                record.changelog = result.changelog.clone();
                record.content_digest = result.content_digest.clone();
                record.source_url = result.source_url.clone();
            }

            record.status = CrawlStatus::Crawled;
            record.failure_count = 0;
            record.last_error = None;
            record.last_crawled_at = Some(record.last_crawled_at.map_or(now, |t| t.max(now)));
            record.last_attempt_at = Some(record.last_attempt_at.map_or(now, |t| t.max(now)));
            record.next_eligible_at = record.next_eligible_at.max(*next_eligible_at);

            if content_changed {
                UpsertOutcome::Updated
            } else if newer_or_equal {
                UpsertOutcome::Touched
            } else {
                UpsertOutcome::Stale
            }
        }
        RecordPatch::CrawlFailed {
            error,
            next_eligible_at,
        } => {
            record.status = CrawlStatus::Failed;
            record.failure_count = record.failure_count.saturating_add(1);
            record.last_error = Some(error.clone());
            record.last_attempt_at = Some(record.last_attempt_at.map_or(now, |t| t.max(now)));
            record.next_eligible_at = record.next_eligible_at.max(*next_eligible_at);
            UpsertOutcome::Touched
        }
        RecordPatch::Reschedule { next_eligible_at } => {
            if *next_eligible_at > record.next_eligible_at {
                record.next_eligible_at = *next_eligible_at;
                UpsertOutcome::Touched
            } else {
                UpsertOutcome::Unchanged
            }
        }
    };

    if outcome == UpsertOutcome::Unchanged {
        return Some((current.clone(), outcome));
    }
    Some((record, outcome))
}

/// Whether `remote` differs from what the record holds.
pub fn version_differs(record: &ChangelogRecord, remote: Option<&str>) -> bool {
    match (record.last_known_version.as_deref(), remote) {
        (_, None) => true,
        (None, Some(_)) => true,
        (Some(stored), Some(remote)) => compare_versions(stored, remote) != std::cmp::Ordering::Equal,
    }
}
