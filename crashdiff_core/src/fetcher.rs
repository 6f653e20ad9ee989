use crate::cancel::CancelToken;
use crate::resolver::BuildTarget;
use crate::retry::{RetryPolicy, Retryable};
use crate::source::{ArtifactSource, SourceError};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

const SNAPSHOT_SUFFIX: &str = ".srcmap.json";
const STAMP_FORMAT: &str = "%Y%m%d%H%M";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactKind {
    EnvironmentSnapshot,
    TriggeringInput,
}

impl ArtifactKind {
    fn cache_dir_name(&self) -> &'static str {
        match self {
            ArtifactKind::EnvironmentSnapshot => "snapshots",
            ArtifactKind::TriggeringInput => "inputs",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactKind::EnvironmentSnapshot => f.write_str("environment snapshot"),
            ArtifactKind::TriggeringInput => f.write_str("triggering input"),
        }
    }
}

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("{kind} not found at {locator}")]
    NotFound { kind: ArtifactKind, locator: String },

    #[error("Transient failure fetching {locator}: {reason}")]
    Transient { locator: String, reason: String },

    #[error("Target for record {0} names no testcase")]
    MissingTestcase(String),

    #[error("Artifact source rejected {locator}: {reason}")]
    Invalid { locator: String, reason: String },

    #[error("Fetch cancelled")]
    Cancelled,
}

impl Retryable for FetchError {
    fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient { .. })
    }
}

impl FetchError {
    fn from_source(kind: ArtifactKind, locator: &str, err: SourceError) -> Self {
        match err {
            SourceError::NotFound(_) => FetchError::NotFound {
                kind,
                locator: locator.to_string(),
            },
            SourceError::Transient(reason) => FetchError::Transient {
                locator: locator.to_string(),
                reason,
            },
            SourceError::Malformed(reason) => FetchError::Invalid {
                locator: locator.to_string(),
                reason,
            },
        }
    }
}

/// Immutable bytes needed to build or drive a target.
#[derive(Debug, Clone, Serialize)]
pub struct Artifact {
    pub kind: ArtifactKind,
    pub locator: String,
    #[serde(skip)]
    pub content: Arc<[u8]>,
    /// md5 of `content`, hex encoded.
    pub digest: String,
    pub retrieved_at: DateTime<Utc>,
}

impl Artifact {
    pub fn new(kind: ArtifactKind, locator: impl Into<String>, content: Vec<u8>) -> Self {
        let digest = format!("{:x}", md5::compute(&content));
        Self {
            kind,
            locator: locator.into(),
            content: Arc::from(content),
            digest,
            retrieved_at: Utc::now(),
        }
    }
}

/// The artifacts one target needs.
#[derive(Debug, Clone, Serialize)]
pub struct ArtifactSet {
    pub snapshot: Artifact,
    pub input: Artifact,
}

/// `<project>/<project>-<sanitizer>-` prefix shared by a target's snapshots.
pub fn snapshot_prefix(target: &BuildTarget) -> String {
    format!(
        "{project}/{project}-{sanitizer}-",
        project = target.project,
        sanitizer = target.sanitizer
    )
}

pub fn snapshot_locator(target: &BuildTarget) -> String {
    format!(
        "{}{}{SNAPSHOT_SUFFIX}",
        snapshot_prefix(target),
        target.pin.snapshot_stamp()
    )
}

pub fn testcase_locator(testcase_id: &str) -> String {
    format!("testcases/{testcase_id}")
}

fn stamp_of(locator: &str, prefix: &str) -> Option<DateTime<Utc>> {
    let stamp = locator.strip_prefix(prefix)?.strip_suffix(SNAPSHOT_SUFFIX)?;
    NaiveDateTime::parse_from_str(stamp, STAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Picks the snapshot closest to `pin`; on a tie the later one wins.
fn nearest_snapshot(candidates: &[String], prefix: &str, pin: DateTime<Utc>) -> Option<String> {
    candidates
        .iter()
        .filter_map(|locator| stamp_of(locator, prefix).map(|ts| (locator, ts)))
        .min_by_key(|(_, ts)| {
            let distance = (*ts - pin).num_seconds().unsigned_abs();
            (distance, std::cmp::Reverse(*ts))
        })
        .map(|(locator, _)| locator.clone())
}

/// Fetches and caches the artifacts of build targets.
///
/// Artifacts are cached by `(locator, kind)` in memory and, when a cache
/// directory is set, on disk, so a repeated fetch returns the same bytes.
pub struct ArtifactFetcher {
    source: Arc<dyn ArtifactSource>,
    retry: RetryPolicy,
    nearest_snapshot: bool,
    cache_dir: Option<PathBuf>,
    memory: Mutex<HashMap<(String, ArtifactKind), Artifact>>,
}

impl ArtifactFetcher {
    pub fn new(source: Arc<dyn ArtifactSource>, retry: RetryPolicy) -> Self {
        Self {
            source,
            retry,
            nearest_snapshot: false,
            cache_dir: None,
            memory: Mutex::new(HashMap::new()),
        }
    }

    /// Allows substituting the closest snapshot when the exact one is absent.
    pub fn with_nearest_snapshot(mut self, enabled: bool) -> Self {
        self.nearest_snapshot = enabled;
        self
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    pub fn fetch(&self, target: &BuildTarget, cancel: &CancelToken) -> Result<ArtifactSet, FetchError> {
        let snapshot = self.fetch_snapshot(target, cancel)?;
        let testcase_id = target
            .testcase_id
            .as_deref()
            .ok_or_else(|| FetchError::MissingTestcase(target.record_id.clone()))?;
        let input = self.get(ArtifactKind::TriggeringInput, &testcase_locator(testcase_id), cancel)?;
        tracing::info!(
            record = %target.record_id,
            role = %target.role,
            snapshot = %snapshot.locator,
            input = %input.locator,
            "Fetched artifacts"
        );
        Ok(ArtifactSet { snapshot, input })
    }

    fn fetch_snapshot(&self, target: &BuildTarget, cancel: &CancelToken) -> Result<Artifact, FetchError> {
        let exact = snapshot_locator(target);
        match self.get(ArtifactKind::EnvironmentSnapshot, &exact, cancel) {
            Err(FetchError::NotFound { .. }) if self.nearest_snapshot => {
                let prefix = snapshot_prefix(target);
                let candidates = self
                    .retry
                    .run(&format!("Listing {prefix}"), cancel, |_| {
                        self.source.list(&prefix).map_err(|e| {
                            FetchError::from_source(ArtifactKind::EnvironmentSnapshot, &prefix, e)
                        })
                    })
                    .map_err(|e| self.cancelled_or(cancel, e))?;
                let Some(nearest) = nearest_snapshot(&candidates, &prefix, target.pin.timestamp)
                else {
                    return Err(FetchError::NotFound {
                        kind: ArtifactKind::EnvironmentSnapshot,
                        locator: exact,
                    });
                };
                tracing::warn!(
                    record = %target.record_id,
                    role = %target.role,
                    requested = %exact,
                    substituted = %nearest,
                    "Exact environment snapshot missing, using nearest"
                );
                self.get(ArtifactKind::EnvironmentSnapshot, &nearest, cancel)
            }
            other => other,
        }
    }

    fn cancelled_or(&self, cancel: &CancelToken, err: FetchError) -> FetchError {
        if cancel.is_cancelled() {
            FetchError::Cancelled
        } else {
            err
        }
    }

    fn get(&self, kind: ArtifactKind, locator: &str, cancel: &CancelToken) -> Result<Artifact, FetchError> {
        if cancel.is_cancelled() {
            return Err(FetchError::Cancelled);
        }
        let key = (locator.to_string(), kind);
        if let Some(hit) = self
            .memory
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            tracing::debug!(locator, "Artifact served from memory cache");
            return Ok(hit.clone());
        }

        let disk_path = self.disk_path(kind, locator);
        let artifact = match disk_path.as_deref().and_then(|p| fs::read(p).ok()) {
            Some(bytes) => {
                tracing::debug!(locator, "Artifact served from disk cache");
                Artifact::new(kind, locator, bytes)
            }
            None => {
                let bytes = self
                    .retry
                    .run(&format!("Downloading {locator}"), cancel, |_| {
                        self.source
                            .download(locator)
                            .map_err(|e| FetchError::from_source(kind, locator, e))
                    })
                    .map_err(|e| self.cancelled_or(cancel, e))?;
                if let Some(path) = &disk_path {
                    if let Err(e) = write_atomically(path, &bytes) {
                        tracing::warn!(locator, error = %e, "Failed to persist artifact to disk cache");
                    }
                }
                Artifact::new(kind, locator, bytes)
            }
        };

        let mut memory = self.memory.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(memory.entry(key).or_insert(artifact).clone())
    }

    fn disk_path(&self, kind: ArtifactKind, locator: &str) -> Option<PathBuf> {
        let dir = self.cache_dir.as_ref()?;
        let relative = Path::new(locator);
        if !relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
        {
            return None;
        }
        Some(dir.join("artifacts").join(kind.cache_dir_name()).join(relative))
    }
}

/// Writes through a temp file in the destination directory, then renames.
fn write_atomically(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(bytes)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
