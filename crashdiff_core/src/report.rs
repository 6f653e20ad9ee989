use crate::builder::BuildStatus;
use crate::record::VulnerabilityRecord;
use crate::resolver::Role;
use crate::runner::{ExitClassification, ReproductionOutcome, Stage};
use crate::signature::CrashSignature;
use crate::verifier::CrashVerifier;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const REPORT_FILENAME: &str = "report.json";

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Failed to write report to {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize report: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Verdict {
    Confirmed,
    NotReproduced,
    Inconclusive,
    BuildFailed,
}

impl Verdict {
    /// Whether the reproduction reached a definitive answer.
    pub fn is_success(&self) -> bool {
        matches!(self, Verdict::Confirmed | Verdict::NotReproduced)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Verdict::Confirmed => "confirmed",
            Verdict::NotReproduced => "not-reproduced",
            Verdict::Inconclusive => "inconclusive",
            Verdict::BuildFailed => "build-failed",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Confidence {
    High,
    Low,
}

/// The stage that kept the verdict from being definitive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockingStage {
    pub role: Role,
    pub stage: Stage,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DifferentialReport {
    pub record_id: String,
    pub project: String,
    pub generated_at: DateTime<Utc>,
    pub verdict: Verdict,
    pub confidence: Confidence,
    pub blocking: Option<BlockingStage>,
    pub expected: Option<CrashSignature>,
    pub vulnerable: ReproductionOutcome,
    pub fixed: ReproductionOutcome,
    pub notes: Vec<String>,
}

fn build_failed(outcome: &ReproductionOutcome) -> bool {
    outcome.build_status == Some(BuildStatus::Failed)
}

fn vulnerable_matches_expected(
    vulnerable: &ReproductionOutcome,
    expected: Option<&CrashSignature>,
    verifier: &CrashVerifier,
) -> bool {
    match (&vulnerable.signature, expected) {
        (Some(observed), Some(expected)) => verifier.verify(observed, expected),
        (Some(_), None) => true,
        (None, _) => false,
    }
}

/// Maps two outcomes to a verdict. Pure: the same inputs always give the
/// same verdict.
///
/// Precedence: a failed build, then an unconfirmed vulnerable crash or a
/// fixed run that never completed, then a fixed crash identical to the
/// vulnerable one; anything else confirms the report.
pub fn decide_verdict(
    vulnerable: &ReproductionOutcome,
    fixed: &ReproductionOutcome,
    expected: Option<&CrashSignature>,
    verifier: &CrashVerifier,
) -> Verdict {
    if build_failed(vulnerable) || build_failed(fixed) {
        return Verdict::BuildFailed;
    }
    if !vulnerable.is_crashed() || !vulnerable_matches_expected(vulnerable, expected, verifier) {
        return Verdict::Inconclusive;
    }
    if fixed.classification == ExitClassification::RunnerError {
        return Verdict::Inconclusive;
    }
    let fixed_crashes_identically = match (&vulnerable.signature, &fixed.signature) {
        (Some(v), Some(f)) => fixed.is_crashed() && f.matches(v),
        _ => false,
    };
    if fixed_crashes_identically {
        return Verdict::NotReproduced;
    }
    Verdict::Confirmed
}

fn confidence(
    vulnerable: &ReproductionOutcome,
    fixed: &ReproductionOutcome,
    expected: Option<&CrashSignature>,
) -> Confidence {
    if expected.is_none()
        || vulnerable.has_degraded_signature()
        || fixed.has_degraded_signature()
        || fixed.classification == ExitClassification::Timeout
    {
        Confidence::Low
    } else {
        Confidence::High
    }
}

fn halted_or(outcome: &ReproductionOutcome, fallback: Stage, reason: String) -> BlockingStage {
    BlockingStage {
        role: outcome.target.role,
        stage: outcome.halted_at.unwrap_or(fallback),
        reason: outcome.notes.first().cloned().unwrap_or(reason),
    }
}

fn blocking_stage(
    verdict: Verdict,
    vulnerable: &ReproductionOutcome,
    fixed: &ReproductionOutcome,
    expected: Option<&CrashSignature>,
    verifier: &CrashVerifier,
) -> Option<BlockingStage> {
    match verdict {
        Verdict::Confirmed | Verdict::NotReproduced => None,
        Verdict::BuildFailed => {
            let failed = if build_failed(vulnerable) { vulnerable } else { fixed };
            Some(BlockingStage {
                role: failed.target.role,
                stage: Stage::Build,
                reason: format!("Image build for commit {} failed", failed.target.pin.commit),
            })
        }
        Verdict::Inconclusive if !vulnerable.is_crashed() => Some(halted_or(
            vulnerable,
            Stage::Run,
            format!("Vulnerable run ended as {:?}", vulnerable.classification),
        )),
        Verdict::Inconclusive if fixed.classification == ExitClassification::RunnerError
            && vulnerable_matches_expected(vulnerable, expected, verifier) =>
        {
            Some(halted_or(fixed, Stage::Run, "Fixed run did not complete".to_string()))
        }
        Verdict::Inconclusive => Some(BlockingStage {
            role: vulnerable.target.role,
            stage: Stage::Verify,
            reason: match (&vulnerable.signature, expected) {
                (Some(observed), Some(expected)) => {
                    format!("Observed crash {observed} does not match reported crash {expected}")
                }
                _ => "Observed crash could not be compared with the report".to_string(),
            },
        }),
    }
}

/// Joins the two sub-pipelines into a verdict and persists it.
#[derive(Debug, Clone)]
pub struct DifferentialReporter {
    output_dir: PathBuf,
    verifier: CrashVerifier,
}

impl DifferentialReporter {
    pub fn new(output_dir: impl Into<PathBuf>, verifier: CrashVerifier) -> Self {
        Self {
            output_dir: output_dir.into(),
            verifier,
        }
    }

    pub fn report(
        &self,
        record: &VulnerabilityRecord,
        expected: Option<CrashSignature>,
        vulnerable: ReproductionOutcome,
        fixed: ReproductionOutcome,
        notes: Vec<String>,
    ) -> DifferentialReport {
        let verdict = decide_verdict(&vulnerable, &fixed, expected.as_ref(), &self.verifier);
        let confidence = confidence(&vulnerable, &fixed, expected.as_ref());
        let blocking = blocking_stage(verdict, &vulnerable, &fixed, expected.as_ref(), &self.verifier);
        tracing::info!(
            record = %record.id,
            verdict = %verdict,
            confidence = ?confidence,
            "Differential verdict"
        );
        DifferentialReport {
            record_id: record.id.clone(),
            project: record.project.clone(),
            generated_at: Utc::now(),
            verdict,
            confidence,
            blocking,
            expected,
            vulnerable,
            fixed,
            notes,
        }
    }

    /// Where the report for `record_id` is written.
    pub fn report_path(&self, record_id: &str) -> PathBuf {
        let dir_name: String = record_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.output_dir.join(dir_name).join(REPORT_FILENAME)
    }

    /// Writes the report as pretty JSON, replacing any earlier report for
    /// the same record.
    pub fn persist(&self, report: &DifferentialReport) -> Result<PathBuf, ReportError> {
        let path = self.report_path(&report.record_id);
        let io_err = |source| ReportError::Io {
            path: path.clone(),
            source,
        };
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir).map_err(io_err)?;
        let tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
        let mut writer = BufWriter::new(tmp);
        serde_json::to_writer_pretty(&mut writer, report)?;
        writer.flush().map_err(io_err)?;
        let tmp = writer.into_inner().map_err(|e| io_err(e.into_error()))?;
        tmp.persist(&path).map_err(|e| io_err(e.error))?;
        tracing::info!(path = ?path, "Report written");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::IssueReport;
    use crate::resolver::{BuildTarget, Pin};
    use crate::signature::{Access, CrashKind};

    fn target(role: Role) -> BuildTarget {
        BuildTarget {
            record_id: "OSV-2021-1361".to_string(),
            project: "wolfmqtt".to_string(),
            repository: None,
            pin: Pin {
                commit: match role {
                    Role::Vulnerable => "aaaa".to_string(),
                    Role::Fixed => "bbbb".to_string(),
                },
                timestamp: Utc::now(),
            },
            fuzz_target: "wolfmqtt-fuzzer".to_string(),
            engine: "libfuzzer".to_string(),
            sanitizer: "address".to_string(),
            architecture: "x86_64".to_string(),
            testcase_id: None,
            role,
        }
    }

    fn signature(kind: CrashKind, frames: &[&str]) -> CrashSignature {
        CrashSignature::new(
            kind,
            frames.iter().map(|f| f.to_string()).collect(),
            Some("address".to_string()),
        )
    }

    fn write_overflow() -> CrashSignature {
        signature(
            CrashKind::new("heap-buffer-overflow")
                .with_access(Access::Write)
                .with_size(1),
            &["MqttClient_DecodePacket", "MqttClient_WaitType", "MqttClient_Subscribe"],
        )
    }

    fn segv_write() -> CrashSignature {
        signature(
            CrashKind::new("SEGV").with_access(Access::Write),
            &["MqttProps_Free", "MqttClient_Unsubscribe"],
        )
    }

    fn outcome(role: Role, classification: ExitClassification, sig: Option<CrashSignature>) -> ReproductionOutcome {
        ReproductionOutcome {
            target: target(role),
            classification,
            exit_code: None,
            signature: sig,
            raw_output: format!("{role} output"),
            build_status: Some(BuildStatus::Built),
            build_log: Some(String::new()),
            halted_at: None,
            notes: Vec::new(),
        }
    }

    fn crashed(role: Role, sig: CrashSignature) -> ReproductionOutcome {
        outcome(role, ExitClassification::Crashed, Some(sig))
    }

    fn verdict(v: &ReproductionOutcome, f: &ReproductionOutcome, expected: Option<&CrashSignature>) -> Verdict {
        decide_verdict(v, f, expected, &CrashVerifier::default())
    }

    #[test]
    fn scenario_confirmed() {
        let expected = write_overflow();
        let v = crashed(Role::Vulnerable, write_overflow());
        let f = outcome(Role::Fixed, ExitClassification::CleanExit, None);
        assert_eq!(verdict(&v, &f, Some(&expected)), Verdict::Confirmed);
    }

    #[test]
    fn scenario_not_reproduced() {
        let expected = segv_write();
        let v = crashed(Role::Vulnerable, segv_write());
        let f = crashed(Role::Fixed, segv_write());
        assert_eq!(verdict(&v, &f, Some(&expected)), Verdict::NotReproduced);
    }

    #[test]
    fn scenario_build_failed() {
        let expected = write_overflow();
        let v = crashed(Role::Vulnerable, write_overflow());
        let mut f = ReproductionOutcome::halted(&target(Role::Fixed), Stage::Build, "compile error");
        f.build_status = Some(BuildStatus::Failed);
        assert_eq!(verdict(&v, &f, Some(&expected)), Verdict::BuildFailed);
    }

    #[test]
    fn scenario_inconclusive() {
        let expected = write_overflow();
        let v = outcome(Role::Vulnerable, ExitClassification::CleanExit, None);
        let f = outcome(Role::Fixed, ExitClassification::CleanExit, None);
        assert_eq!(verdict(&v, &f, Some(&expected)), Verdict::Inconclusive);
    }

    #[test]
    fn build_failure_takes_precedence_over_everything() {
        let mut v = outcome(Role::Vulnerable, ExitClassification::CleanExit, None);
        v.build_status = Some(BuildStatus::Failed);
        let f = crashed(Role::Fixed, write_overflow());
        assert_eq!(verdict(&v, &f, None), Verdict::BuildFailed);
    }

    #[test]
    fn mismatching_vulnerable_crash_is_inconclusive() {
        let v = crashed(Role::Vulnerable, segv_write());
        let f = outcome(Role::Fixed, ExitClassification::CleanExit, None);
        assert_eq!(verdict(&v, &f, Some(&write_overflow())), Verdict::Inconclusive);
    }

    #[test]
    fn fixed_runner_error_is_inconclusive() {
        let v = crashed(Role::Vulnerable, write_overflow());
        let f = ReproductionOutcome::halted(&target(Role::Fixed), Stage::Fetch, "snapshot missing");
        assert_eq!(verdict(&v, &f, Some(&write_overflow())), Verdict::Inconclusive);
    }

    #[test]
    fn fixed_crashing_differently_confirms() {
        let v = crashed(Role::Vulnerable, write_overflow());
        let f = crashed(Role::Fixed, segv_write());
        assert_eq!(verdict(&v, &f, Some(&write_overflow())), Verdict::Confirmed);
    }

    #[test]
    fn verdict_is_total() {
        let classifications = [
            ExitClassification::Crashed,
            ExitClassification::CleanExit,
            ExitClassification::Timeout,
            ExitClassification::RunnerError,
        ];
        let statuses = [BuildStatus::Built, BuildStatus::CachedHit, BuildStatus::Failed];
        let expected = write_overflow();
        let sig = |c: ExitClassification| (c == ExitClassification::Crashed).then(write_overflow);
        for vc in classifications {
            for fc in classifications {
                for vs in statuses {
                    for fs in statuses {
                        let mut v = outcome(Role::Vulnerable, vc, sig(vc));
                        let mut f = outcome(Role::Fixed, fc, sig(fc));
                        v.build_status = Some(vs);
                        f.build_status = Some(fs);

                        let got = verdict(&v, &f, Some(&expected));
                        if vs == BuildStatus::Failed || fs == BuildStatus::Failed {
                            assert_eq!(got, Verdict::BuildFailed);
                        } else if vc != ExitClassification::Crashed {
                            assert_eq!(got, Verdict::Inconclusive);
                        } else if fc == ExitClassification::Crashed {
                            assert_eq!(got, Verdict::NotReproduced);
                        } else if fc == ExitClassification::RunnerError {
                            assert_eq!(got, Verdict::Inconclusive);
                        } else {
                            assert_eq!(got, Verdict::Confirmed, "{vc:?}/{fc:?}");
                        }
                        assert_eq!(
                            got,
                            verdict(&v, &f, Some(&expected)),
                            "Verdicts must be deterministic"
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn missing_expectation_lowers_confidence() {
        let reporter = DifferentialReporter::new("unused", CrashVerifier::default());
        let record = VulnerabilityRecord {
            id: "OSV-2021-1361".to_string(),
            aliases: vec![],
            project: "wolfmqtt".to_string(),
            repository: None,
            introduced: None,
            fixed: None,
            severity: None,
            details: String::new(),
            issue: IssueReport::default(),
        };
        let report = reporter.report(
            &record,
            None,
            crashed(Role::Vulnerable, write_overflow()),
            outcome(Role::Fixed, ExitClassification::CleanExit, None),
            vec![],
        );
        assert_eq!(report.verdict, Verdict::Confirmed);
        assert_eq!(report.confidence, Confidence::Low);
        assert_eq!(report.blocking, None);
    }

    #[test]
    fn inconclusive_report_names_blocking_stage() {
        let blocking = blocking_stage(
            Verdict::Inconclusive,
            &ReproductionOutcome::halted(&target(Role::Vulnerable), Stage::Fetch, "testcase missing"),
            &outcome(Role::Fixed, ExitClassification::CleanExit, None),
            None,
            &CrashVerifier::default(),
        )
        .unwrap();
        assert_eq!(blocking.role, Role::Vulnerable);
        assert_eq!(blocking.stage, Stage::Fetch);
        assert_eq!(blocking.reason, "testcase missing");
    }

    #[test]
    fn persisted_report_contains_both_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let reporter = DifferentialReporter::new(dir.path(), CrashVerifier::default());
        let record = VulnerabilityRecord {
            id: "OSV-2021-1361".to_string(),
            aliases: vec![],
            project: "wolfmqtt".to_string(),
            repository: None,
            introduced: Some("aaaa".to_string()),
            fixed: Some("bbbb".to_string()),
            severity: None,
            details: String::new(),
            issue: IssueReport::default(),
        };
        let report = reporter.report(
            &record,
            Some(write_overflow()),
            crashed(Role::Vulnerable, write_overflow()),
            outcome(Role::Fixed, ExitClassification::CleanExit, None),
            vec![],
        );
        let path = reporter.persist(&report).unwrap();
        assert_eq!(path, dir.path().join("OSV-2021-1361").join("report.json"));

        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["verdict"], "confirmed");
        assert_eq!(json["confidence"], "high");
        assert_eq!(json["vulnerable"]["raw_output"], "vulnerable output");
        assert_eq!(json["fixed"]["raw_output"], "fixed output");

        let reloaded: DifferentialReport = serde_json::from_value(json).unwrap();
        assert_eq!(reloaded.verdict, report.verdict);
    }
}
