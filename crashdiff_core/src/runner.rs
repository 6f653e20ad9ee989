use crate::builder::{BuildResult, BuildStatus};
use crate::cancel::CancelToken;
use crate::fetcher::Artifact;
use crate::resolver::BuildTarget;
use crate::runtime::{ContainerRuntime, Mount, ProcessExit, RunOutput, RunRequest};
use crate::signature::CrashSignature;
use crate::verifier::CrashVerifier;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub const DEFAULT_REPRODUCE_COMMAND: &str = "reproduce {fuzz_target} -runs=100";
pub const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(300);
const TESTCASE_MOUNT: &str = "/testcase";

/// Exit codes the container runtime itself uses when it cannot create or
/// start a container.
const RUNTIME_EXIT_CODES: std::ops::RangeInclusive<i32> = 125..=127;

/// SIGILL, SIGABRT, SIGBUS, SIGFPE and SIGSEGV.
const FAULT_SIGNALS: [i32; 5] = [4, 6, 7, 8, 11];

/// Whether the process died of a memory or arithmetic fault, either directly
/// or as reported by a shell through `128 + signal`.
fn is_fault(exit: ProcessExit) -> bool {
    match exit {
        ProcessExit::Signaled(signal) => FAULT_SIGNALS.contains(&signal),
        ProcessExit::Exited(code) => code > 128 && FAULT_SIGNALS.contains(&(code - 128)),
        ProcessExit::TimedOut | ProcessExit::Cancelled => false,
    }
}

static CONTAINER_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExitClassification {
    Crashed,
    CleanExit,
    Timeout,
    RunnerError,
}

/// Pipeline stage at which a sub-pipeline stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    Resolve,
    Fetch,
    Build,
    Run,
    Verify,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Resolve => "resolve",
            Stage::Fetch => "fetch",
            Stage::Build => "build",
            Stage::Run => "run",
            Stage::Verify => "verify",
        };
        f.write_str(name)
    }
}

/// Result of running (or failing to run) one target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReproductionOutcome {
    pub target: BuildTarget,
    pub classification: ExitClassification,
    pub exit_code: Option<i32>,
    /// Present only for `crashed`.
    pub signature: Option<CrashSignature>,
    pub raw_output: String,
    pub build_status: Option<BuildStatus>,
    pub build_log: Option<String>,
    pub halted_at: Option<Stage>,
    pub notes: Vec<String>,
}

impl ReproductionOutcome {
    /// An outcome for a sub-pipeline that stopped before its run completed.
    pub fn halted(target: &BuildTarget, stage: Stage, note: impl Into<String>) -> Self {
        Self {
            target: target.clone(),
            classification: ExitClassification::RunnerError,
            exit_code: None,
            signature: None,
            raw_output: String::new(),
            build_status: None,
            build_log: None,
            halted_at: Some(stage),
            notes: vec![note.into()],
        }
    }

    /// Attaches the build that produced (or failed to produce) the image.
    pub fn with_build(mut self, build: &BuildResult) -> Self {
        self.build_status = Some(build.status);
        self.build_log = Some(build.log.clone());
        self
    }

    pub fn is_crashed(&self) -> bool {
        self.classification == ExitClassification::Crashed
    }

    pub fn has_degraded_signature(&self) -> bool {
        self.signature.as_ref().is_some_and(CrashSignature::is_degraded)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSettings {
    pub timeout: Duration,
    /// Command run in the container; `{fuzz_target}` is substituted.
    pub reproduce_command: String,
    pub keep_containers: bool,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_RUN_TIMEOUT,
            reproduce_command: DEFAULT_REPRODUCE_COMMAND.to_string(),
            keep_containers: false,
        }
    }
}

fn container_name(target: &BuildTarget) -> String {
    let record: String = target
        .record_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect();
    format!(
        "crashdiff-{record}-{}-{}-{}",
        target.role,
        std::process::id(),
        CONTAINER_SEQ.fetch_add(1, Ordering::Relaxed)
    )
}

/// Runs the triggering input against a built image in a fresh container.
pub struct ReproductionRunner {
    runtime: Arc<dyn ContainerRuntime>,
    verifier: CrashVerifier,
    settings: RunSettings,
}

impl ReproductionRunner {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, verifier: CrashVerifier, settings: RunSettings) -> Self {
        Self {
            runtime,
            verifier,
            settings,
        }
    }

    pub fn run(&self, build: &BuildResult, input: &Artifact, cancel: &CancelToken) -> ReproductionOutcome {
        let target = &build.target;
        let Some(image) = build.image.as_deref().filter(|_| build.is_usable()) else {
            return ReproductionOutcome::halted(target, Stage::Run, "Image is not usable")
                .with_build(build);
        };

        let testcase = match write_testcase(input) {
            Ok(file) => file,
            Err(e) => {
                return ReproductionOutcome::halted(
                    target,
                    Stage::Run,
                    format!("Failed to stage triggering input: {e}"),
                )
                .with_build(build);
            }
        };

        let request = RunRequest {
            image: image.to_string(),
            name: container_name(target),
            platform: target.platform().to_string(),
            command: self
                .settings
                .reproduce_command
                .replace("{fuzz_target}", &target.fuzz_target)
                .split_whitespace()
                .map(str::to_string)
                .collect(),
            env: vec![
                ("HELPER".to_string(), "True".to_string()),
                ("RUN_FUZZER_MODE".to_string(), "interactive".to_string()),
                ("SANITIZER".to_string(), target.sanitizer.clone()),
                ("ARCHITECTURE".to_string(), target.architecture.clone()),
                ("FUZZ_TARGET".to_string(), target.fuzz_target.clone()),
            ],
            mounts: vec![Mount {
                host: testcase.path().to_path_buf(),
                container: TESTCASE_MOUNT.to_string(),
                read_only: true,
            }],
            timeout: self.settings.timeout,
            keep: self.settings.keep_containers,
        };

        tracing::info!(
            record = %target.record_id,
            role = %target.role,
            container = %request.name,
            "Running reproduction"
        );
        let result = self.runtime.run_container(&request, cancel);

        // A timed-out or cancelled run was already stopped by the runtime.
        let stopped = matches!(
            &result,
            Ok(RunOutput { exit: ProcessExit::TimedOut | ProcessExit::Cancelled, .. })
        );
        if !self.settings.keep_containers && !stopped {
            if let Err(e) = self.runtime.remove_container(&request.name) {
                tracing::warn!(container = %request.name, error = %e, "Failed to remove container");
            }
        }

        let output = match result {
            Ok(output) => output,
            Err(e) => {
                return ReproductionOutcome::halted(target, Stage::Run, e.to_string()).with_build(build);
            }
        };

        let mut outcome = ReproductionOutcome {
            target: target.clone(),
            classification: ExitClassification::RunnerError,
            exit_code: None,
            signature: None,
            raw_output: output.output,
            build_status: None,
            build_log: None,
            halted_at: None,
            notes: Vec::new(),
        }
        .with_build(build);

        match output.exit {
            ProcessExit::Exited(0) => outcome.classification = ExitClassification::CleanExit,
            ProcessExit::Exited(code) if RUNTIME_EXIT_CODES.contains(&code) => {
                outcome.exit_code = Some(code);
                outcome.halted_at = Some(Stage::Run);
                outcome
                    .notes
                    .push(format!("Container runtime could not start the container (exit {code})"));
            }
            ProcessExit::TimedOut => {
                outcome.classification = ExitClassification::Timeout;
                outcome
                    .notes
                    .push(format!("Run exceeded {:?} and was terminated", self.settings.timeout));
            }
            ProcessExit::Cancelled => {
                outcome.halted_at = Some(Stage::Run);
                outcome.notes.push("Run cancelled".to_string());
            }
            ProcessExit::Exited(code) | ProcessExit::Signaled(code) => {
                outcome.exit_code = Some(code);
                match self.verifier.extract(&outcome.raw_output) {
                    Ok(signature) => {
                        outcome.classification = ExitClassification::Crashed;
                        outcome.signature = Some(signature);
                    }
                    Err(e) if is_fault(output.exit) => {
                        outcome.classification = ExitClassification::Crashed;
                        outcome
                            .notes
                            .push(format!("{e}; crash fingerprint degraded, low confidence"));
                        outcome.signature = Some(CrashSignature::degraded(Some(target.sanitizer.clone())));
                    }
                    Err(e) => {
                        outcome.halted_at = Some(Stage::Run);
                        outcome
                            .notes
                            .push(format!("Run exited with {code} without a sanitizer report: {e}"));
                    }
                }
            }
        }

        tracing::info!(
            record = %target.record_id,
            role = %target.role,
            classification = ?outcome.classification,
            signature = %outcome.signature.as_ref().map(ToString::to_string).unwrap_or_default(),
            "Reproduction finished"
        );
        outcome
    }
}

fn write_testcase(input: &Artifact) -> std::io::Result<tempfile::NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("crashdiff-testcase-")
        .tempfile()?;
    file.write_all(&input.content)?;
    file.flush()?;
    Ok(file)
}
