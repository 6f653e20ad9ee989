use crate::record::VulnerabilityRecord;
use crate::retry::Retryable;
use crate::source::{SourceError, SourceHost};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

const DEFAULT_SANITIZER: &str = "address";
const DEFAULT_ARCHITECTURE: &str = "x86_64";
const DEFAULT_ENGINE: &str = "libfuzzer";
const KNOWN_ARCHITECTURES: &[&str] = &["x86_64", "i386", "aarch64"];

#[derive(Error, Debug)]
pub enum ResolveError {
    /// The record does not pin both ends of the affected range.
    #[error("Record {record} has no resolvable commit range: {reason}")]
    UnresolvedRange { record: String, reason: String },

    /// The fuzz entry point could not be determined from the record.
    #[error("Record {record} does not name a fuzz entry point for project {project:?}")]
    UnknownEntryPoint { record: String, project: String },

    /// The source host failed for a reason other than absence.
    #[error("Source host failed while resolving record {record}: {source}")]
    Host {
        record: String,
        #[source]
        source: SourceError,
    },
}

impl Retryable for ResolveError {
    fn is_transient(&self) -> bool {
        matches!(self, ResolveError::Host { source, .. } if source.is_transient())
    }
}

/// Which side of the fix a build target represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    Vulnerable,
    Fixed,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Vulnerable => "vulnerable",
            Role::Fixed => "fixed",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A point in the project's history: commit id plus its commit time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pin {
    pub commit: String,
    pub timestamp: DateTime<Utc>,
}

impl Pin {
    /// The `YYYYMMDDHHMM` stamp environment snapshots are addressed by.
    pub fn snapshot_stamp(&self) -> String {
        self.timestamp.format("%Y%m%d%H%M").to_string()
    }
}

/// One reproducible build point.
///
/// Both targets resolved from a record share every field except `role` and
/// `pin`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BuildTarget {
    pub record_id: String,
    pub project: String,
    pub repository: Option<String>,
    pub pin: Pin,
    pub fuzz_target: String,
    pub engine: String,
    pub sanitizer: String,
    pub architecture: String,
    pub testcase_id: Option<String>,
    pub role: Role,
}

impl BuildTarget {
    /// Container platform string for this target's architecture.
    pub fn platform(&self) -> &'static str {
        if self.architecture == "aarch64" {
            "linux/arm64"
        } else {
            "linux/amd64"
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetPair {
    pub vulnerable: BuildTarget,
    pub fixed: BuildTarget,
}

/// `address (ASAN)` -> `address`; falls back to the job type's sanitizer token.
pub fn normalize_sanitizer(sanitizer: Option<&str>, job_type: Option<&str>) -> String {
    if let Some(word) = sanitizer
        .and_then(|s| s.split_whitespace().next())
        .map(str::to_ascii_lowercase)
    {
        return word;
    }
    let from_job = job_type.and_then(|job| {
        job.split('_').find_map(|token| match token {
            "asan" => Some("address"),
            "msan" => Some("memory"),
            "ubsan" => Some("undefined"),
            "hwasan" => Some("hwaddress"),
            _ => None,
        })
    });
    from_job.unwrap_or(DEFAULT_SANITIZER).to_string()
}

/// `libfuzzer_asan_i386_project` -> `i386`; defaults to `x86_64`.
pub fn architecture_from_job(job_type: Option<&str>) -> String {
    job_type
        .and_then(|job| {
            job.split('_')
                .find(|token| KNOWN_ARCHITECTURES.contains(token))
        })
        .unwrap_or(DEFAULT_ARCHITECTURE)
        .to_string()
}

/// Turns a record's commit range into a vulnerable and a fixed [`BuildTarget`].
pub struct VersionResolver<'a> {
    host: &'a dyn SourceHost,
}

impl<'a> VersionResolver<'a> {
    pub fn new(host: &'a dyn SourceHost) -> Self {
        Self { host }
    }

    pub fn resolve(&self, record: &VulnerabilityRecord) -> Result<TargetPair, ResolveError> {
        let unresolved = |reason: String| ResolveError::UnresolvedRange {
            record: record.id.clone(),
            reason,
        };

        let mut missing = Vec::new();
        if record.introduced.is_none() {
            missing.push("introduced commit");
        }
        if record.fixed.is_none() {
            missing.push("fixed commit");
        }
        let (Some(introduced), Some(fixed)) = (&record.introduced, &record.fixed) else {
            return Err(unresolved(format!("missing {}", missing.join(" and "))));
        };

        let fuzz_target = record
            .issue
            .fuzz_target
            .clone()
            .ok_or_else(|| ResolveError::UnknownEntryPoint {
                record: record.id.clone(),
                project: record.project.clone(),
            })?;
        if record.project.is_empty() {
            return Err(unresolved("record names no affected project".to_string()));
        }

        let vulnerable_pin = self.pin(record, introduced)?;
        let fixed_pin = self.pin(record, fixed)?;
        if vulnerable_pin.timestamp > fixed_pin.timestamp {
            return Err(unresolved(format!(
                "introduced commit {introduced} is newer than fixed commit {fixed}"
            )));
        }

        let job_type = record.issue.job_type.as_deref();
        let template = BuildTarget {
            record_id: record.id.clone(),
            project: record.project.clone(),
            repository: record.repository.clone(),
            pin: vulnerable_pin,
            fuzz_target,
            engine: record
                .issue
                .fuzzing_engine
                .as_deref()
                .map(str::to_ascii_lowercase)
                .unwrap_or_else(|| DEFAULT_ENGINE.to_string()),
            sanitizer: normalize_sanitizer(record.issue.sanitizer.as_deref(), job_type),
            architecture: architecture_from_job(job_type),
            testcase_id: record.issue.testcase_id.clone(),
            role: Role::Vulnerable,
        };

        tracing::info!(
            record = %record.id,
            introduced = %introduced,
            fixed = %fixed,
            fuzz_target = %template.fuzz_target,
            "Resolved build targets"
        );

        Ok(TargetPair {
            fixed: BuildTarget {
                pin: fixed_pin,
                role: Role::Fixed,
                ..template.clone()
            },
            vulnerable: template,
        })
    }

    fn pin(&self, record: &VulnerabilityRecord, commit: &str) -> Result<Pin, ResolveError> {
        match self.host.commit_info(&record.project, commit) {
            Ok(info) => Ok(Pin {
                commit: info.id,
                timestamp: info.timestamp,
            }),
            Err(SourceError::NotFound(what)) => Err(ResolveError::UnresolvedRange {
                record: record.id.clone(),
                reason: format!("source host does not know {what}"),
            }),
            Err(source) => Err(ResolveError::Host {
                record: record.id.clone(),
                source,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::IssueReport;
    use crate::source::CommitInfo;
    use chrono::TimeZone;
    use std::collections::HashMap;

    struct FakeHost {
        commits: HashMap<String, CommitInfo>,
    }

    impl FakeHost {
        fn with(commits: &[(&str, i64)]) -> Self {
            let commits = commits
                .iter()
                .map(|(id, secs)| {
                    (
                        id.to_string(),
                        CommitInfo {
                            id: id.to_string(),
                            timestamp: Utc.timestamp_opt(*secs, 0).unwrap(),
                            parents: vec![],
                            build_ok: None,
                        },
                    )
                })
                .collect();
            Self { commits }
        }
    }

    impl SourceHost for FakeHost {
        fn commit_info(&self, project: &str, commit: &str) -> Result<CommitInfo, SourceError> {
            self.commits
                .get(commit)
                .cloned()
                .ok_or_else(|| SourceError::NotFound(format!("{project}@{commit}")))
        }
    }

    fn record(introduced: Option<&str>, fixed: Option<&str>) -> VulnerabilityRecord {
        VulnerabilityRecord {
            id: "OSV-2021-1361".to_string(),
            aliases: vec![],
            project: "wolfmqtt".to_string(),
            repository: Some("https://github.com/wolfSSL/wolfMQTT".to_string()),
            introduced: introduced.map(str::to_string),
            fixed: fixed.map(str::to_string),
            severity: Some("HIGH".to_string()),
            details: String::new(),
            issue: IssueReport {
                fuzz_target: Some("wolfmqtt-fuzzer".to_string()),
                fuzzing_engine: Some("libFuzzer".to_string()),
                job_type: Some("libfuzzer_asan_wolfmqtt".to_string()),
                sanitizer: Some("address (ASAN)".to_string()),
                testcase_id: Some("5187284128333824".to_string()),
                ..IssueReport::default()
            },
        }
    }

    #[test]
    fn resolves_two_targets_differing_only_in_role_and_pin() {
        let host = FakeHost::with(&[("aaaa", 1_620_800_000), ("bbbb", 1_620_900_000)]);
        let pair = VersionResolver::new(&host)
            .resolve(&record(Some("aaaa"), Some("bbbb")))
            .unwrap();

        assert_eq!(pair.vulnerable.role, Role::Vulnerable);
        assert_eq!(pair.fixed.role, Role::Fixed);
        assert_eq!(pair.vulnerable.pin.commit, "aaaa");
        assert_eq!(pair.fixed.pin.commit, "bbbb");

        let normalized_fixed = BuildTarget {
            role: Role::Vulnerable,
            pin: pair.vulnerable.pin.clone(),
            ..pair.fixed.clone()
        };
        assert_eq!(
            normalized_fixed, pair.vulnerable,
            "Targets must be identical apart from role and pin"
        );
        assert_eq!(pair.vulnerable.sanitizer, "address");
        assert_eq!(pair.vulnerable.engine, "libfuzzer");
        assert_eq!(pair.vulnerable.architecture, "x86_64");
    }

    #[test]
    fn missing_commit_is_unresolved_range() {
        let host = FakeHost::with(&[("aaaa", 1)]);
        let err = VersionResolver::new(&host)
            .resolve(&record(Some("aaaa"), None))
            .unwrap_err();
        match err {
            ResolveError::UnresolvedRange { reason, .. } => {
                assert!(reason.contains("fixed commit"), "Unexpected reason: {reason}")
            }
            other => panic!("Expected UnresolvedRange, got {other:?}"),
        }
    }

    #[test]
    fn unknown_commit_is_not_substituted() {
        let host = FakeHost::with(&[("aaaa", 1)]);
        let err = VersionResolver::new(&host)
            .resolve(&record(Some("aaaa"), Some("bbbb")))
            .unwrap_err();
        assert!(matches!(err, ResolveError::UnresolvedRange { .. }));
    }

    #[test]
    fn reversed_range_is_rejected() {
        let host = FakeHost::with(&[("aaaa", 200), ("bbbb", 100)]);
        let err = VersionResolver::new(&host)
            .resolve(&record(Some("aaaa"), Some("bbbb")))
            .unwrap_err();
        assert!(matches!(err, ResolveError::UnresolvedRange { .. }));
    }

    #[test]
    fn missing_fuzz_target_is_unknown_entry_point() {
        let host = FakeHost::with(&[("aaaa", 1), ("bbbb", 2)]);
        let mut rec = record(Some("aaaa"), Some("bbbb"));
        rec.issue.fuzz_target = None;
        let err = VersionResolver::new(&host).resolve(&rec).unwrap_err();
        assert!(matches!(err, ResolveError::UnknownEntryPoint { .. }));
    }

    #[test]
    fn sanitizer_and_architecture_fallbacks() {
        assert_eq!(normalize_sanitizer(None, Some("libfuzzer_msan_proj")), "memory");
        assert_eq!(normalize_sanitizer(None, None), "address");
        assert_eq!(
            architecture_from_job(Some("libfuzzer_asan_i386_proj")),
            "i386"
        );
        assert_eq!(architecture_from_job(None), "x86_64");
    }

    #[test]
    fn snapshot_stamp_is_minute_precision() {
        let pin = Pin {
            commit: "x".to_string(),
            timestamp: Utc.with_ymd_and_hms(2021, 5, 12, 6, 12, 45).unwrap(),
        };
        assert_eq!(pin.snapshot_stamp(), "202105120612");
    }
}
