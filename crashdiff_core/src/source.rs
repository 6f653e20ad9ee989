//! Read-only capabilities the pipeline consumes from the outside world, and
//! filesystem-backed implementations of them.
//!
//! Each collaborator is a narrow trait injected at construction time; the
//! pipeline never reaches for a global registry of handlers.

use crate::record::VulnerabilityRecord;
use crate::retry::Retryable;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

/// Failure classes shared by all external sources.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// The requested item does not exist. Permanent; never retried.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A network or service error that may succeed on retry.
    #[error("Transient source failure: {0}")]
    Transient(String),

    /// The source answered, but the payload could not be understood.
    #[error("Malformed data from source: {0}")]
    Malformed(String),
}

impl Retryable for SourceError {
    fn is_transient(&self) -> bool {
        matches!(self, SourceError::Transient(_))
    }
}

impl SourceError {
    fn from_io(what: &str, err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::NotFound {
            SourceError::NotFound(what.to_string())
        } else {
            SourceError::Transient(format!("{what}: {err}"))
        }
    }
}

/// Metadata about one commit of a project repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub parents: Vec<String>,
    /// Whether the project's own CI built this commit, when known.
    #[serde(default)]
    pub build_ok: Option<bool>,
}

/// Fetches vulnerability records by identifier.
pub trait VulnerabilitySource: Send + Sync {
    fn fetch_record(&self, id: &str) -> Result<VulnerabilityRecord, SourceError>;
}

/// Object storage holding environment snapshots and testcases.
pub trait ArtifactSource: Send + Sync {
    /// Lists the locators starting with `prefix`, sorted.
    fn list(&self, prefix: &str) -> Result<Vec<String>, SourceError>;

    /// Downloads the object at `locator`.
    fn download(&self, locator: &str) -> Result<Vec<u8>, SourceError>;
}

/// Resolves commit identifiers of a project's repository.
pub trait SourceHost: Send + Sync {
    fn commit_info(&self, project: &str, commit: &str) -> Result<CommitInfo, SourceError>;
}

/// Rejects locators that would escape the storage root.
fn checked_relative(locator: &str) -> Result<&Path, SourceError> {
    let path = Path::new(locator);
    if locator.is_empty()
        || path
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
    {
        return Err(SourceError::Malformed(format!(
            "Locator {locator:?} is not a plain relative path"
        )));
    }
    Ok(path)
}

/// OSV records stored as `<dir>/<ID>.json`.
#[derive(Debug, Clone)]
pub struct RecordDirectory {
    dir: PathBuf,
}

impl RecordDirectory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl VulnerabilitySource for RecordDirectory {
    fn fetch_record(&self, id: &str) -> Result<VulnerabilityRecord, SourceError> {
        let file_name = format!("{id}.json");
        let path = self.dir.join(checked_relative(&file_name)?);
        tracing::debug!(record = id, path = ?path, "Loading vulnerability record");
        let content = fs::read_to_string(&path)
            .map_err(|e| SourceError::from_io(&format!("record {id} at {path:?}"), e))?;
        VulnerabilityRecord::from_osv_json(&content)
            .map_err(|e| SourceError::Malformed(format!("record {id} at {path:?}: {e}")))
    }
}

/// A local directory mirroring an object-storage bucket.
#[derive(Debug, Clone)]
pub struct LocalBucket {
    root: PathBuf,
}

impl LocalBucket {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ArtifactSource for LocalBucket {
    fn list(&self, prefix: &str) -> Result<Vec<String>, SourceError> {
        let (dir_part, name_prefix) = match prefix.rsplit_once('/') {
            Some((dir, name)) => (Some(dir), name),
            None => (None, prefix),
        };
        let dir = match dir_part {
            Some(d) => self.root.join(checked_relative(d)?),
            None => self.root.clone(),
        };

        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(SourceError::from_io(&format!("listing {dir:?}"), e)),
        };

        let mut locators = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| SourceError::from_io(&format!("listing {dir:?}"), e))?;
            if !entry.path().is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if name.starts_with(name_prefix) {
                locators.push(match dir_part {
                    Some(d) => format!("{d}/{name}"),
                    None => name,
                });
            }
        }
        locators.sort();
        Ok(locators)
    }

    fn download(&self, locator: &str) -> Result<Vec<u8>, SourceError> {
        let path = self.root.join(checked_relative(locator)?);
        fs::read(&path).map_err(|e| SourceError::from_io(locator, e))
    }
}

/// Commit metadata stored as `<dir>/<project>.json`, a JSON array of
/// [`CommitInfo`] objects.
#[derive(Debug, Clone)]
pub struct CommitIndex {
    dir: PathBuf,
}

impl CommitIndex {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl SourceHost for CommitIndex {
    fn commit_info(&self, project: &str, commit: &str) -> Result<CommitInfo, SourceError> {
        let file_name = format!("{project}.json");
        let path = self.dir.join(checked_relative(&file_name)?);
        let content = fs::read_to_string(&path)
            .map_err(|e| SourceError::from_io(&format!("commit index for {project}"), e))?;
        let commits: Vec<CommitInfo> = serde_json::from_str(&content)
            .map_err(|e| SourceError::Malformed(format!("commit index {path:?}: {e}")))?;

        // Abbreviated ids are accepted when unambiguous.
        let mut matching = commits
            .into_iter()
            .filter(|c| c.id == commit || (commit.len() >= 7 && c.id.starts_with(commit)));
        match (matching.next(), matching.next()) {
            (Some(found), None) => Ok(found),
            (Some(_), Some(_)) => Err(SourceError::Malformed(format!(
                "commit {commit} is ambiguous in {project}"
            ))),
            (None, _) => Err(SourceError::NotFound(format!(
                "commit {commit} in {project}"
            ))),
        }
    }
}
