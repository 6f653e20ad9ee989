//! End-to-end reproduction of one vulnerability record.
//!
//! Resolution happens once; the vulnerable and fixed targets then go through
//! fetch, build and run on their own threads, and the reporter joins them.

use crate::builder::{BuildCache, BuildCacheError, EnvironmentBuilder};
use crate::cancel::CancelToken;
use crate::config::CrashdiffConfig;
use crate::fetcher::ArtifactFetcher;
use crate::report::{DifferentialReport, DifferentialReporter, ReportError};
use crate::resolver::{BuildTarget, ResolveError, VersionResolver};
use crate::retry::RetryPolicy;
use crate::runner::{ReproductionOutcome, ReproductionRunner, Stage};
use crate::runtime::{ContainerRuntime, DockerCli};
use crate::source::{
    ArtifactSource, CommitIndex, LocalBucket, RecordDirectory, SourceError, SourceHost,
    VulnerabilitySource,
};
use crate::verifier::CrashVerifier;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, ScopedJoinHandle};
use std::time::Duration;
use thiserror::Error;

/// Failures that make the whole reproduction meaningless. Anything local to
/// one target is reported in its outcome instead.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Failed to fetch record {id}: {source}")]
    Record {
        id: String,
        #[source]
        source: SourceError,
    },

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Cache(#[from] BuildCacheError),

    #[error(transparent)]
    Report(#[from] ReportError),

    #[error("Reproduction of {0} cancelled before any container work")]
    Cancelled(String),
}

/// The external systems a reproduction talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub records: Arc<dyn VulnerabilitySource>,
    pub host: Arc<dyn SourceHost>,
    pub artifacts: Arc<dyn ArtifactSource>,
    pub runtime: Arc<dyn ContainerRuntime>,
}

impl Collaborators {
    /// Directory-backed sources and the `docker` CLI, as configured.
    pub fn from_config(config: &CrashdiffConfig) -> Self {
        Self {
            records: Arc::new(RecordDirectory::new(&config.sources.records_dir)),
            host: Arc::new(CommitIndex::new(&config.sources.commits_dir)),
            artifacts: Arc::new(LocalBucket::new(&config.sources.bucket_dir)),
            runtime: Arc::new(
                DockerCli::new(&config.docker.binary)
                    .with_limits(config.run.memory_limit.clone(), config.run.cpus.clone()),
            ),
        }
    }
}

pub struct Reproducer {
    records: Arc<dyn VulnerabilitySource>,
    host: Arc<dyn SourceHost>,
    fetcher: ArtifactFetcher,
    builder: EnvironmentBuilder,
    runner: ReproductionRunner,
    reporter: DifferentialReporter,
    verifier: CrashVerifier,
    retry: RetryPolicy,
    overall_timeout: Duration,
}

impl Reproducer {
    pub fn new(collaborators: Collaborators, config: &CrashdiffConfig, cache: BuildCache) -> Self {
        let retry = config.retry_policy();
        let verifier = config.verifier();
        Self {
            fetcher: ArtifactFetcher::new(collaborators.artifacts, retry.clone())
                .with_nearest_snapshot(config.fetch.nearest_snapshot)
                .with_cache_dir(&config.cache.dir),
            builder: EnvironmentBuilder::new(
                Arc::clone(&collaborators.runtime),
                cache,
                config.build_settings(),
                retry.clone(),
            ),
            runner: ReproductionRunner::new(collaborators.runtime, verifier, config.run_settings()),
            reporter: DifferentialReporter::new(&config.output.dir, verifier),
            records: collaborators.records,
            host: collaborators.host,
            verifier,
            retry,
            overall_timeout: config.overall_timeout(),
        }
    }

    /// Opens the persisted build cache under the configured cache directory.
    pub fn from_config(
        config: &CrashdiffConfig,
        collaborators: Collaborators,
    ) -> Result<Self, PipelineError> {
        let cache = BuildCache::on_disk(&config.cache.builds_dir())?;
        Ok(Self::new(collaborators, config, cache))
    }

    pub fn report_path(&self, record_id: &str) -> PathBuf {
        self.reporter.report_path(record_id)
    }

    /// Reproduces record `id` at both ends of its range and persists the
    /// differential report.
    pub fn reproduce(
        &self,
        id: &str,
        cancel: &CancelToken,
    ) -> Result<DifferentialReport, PipelineError> {
        let record = self
            .retry
            .run("Fetching vulnerability record", cancel, |attempt| {
                tracing::debug!(record = %id, attempt, "Fetching vulnerability record");
                self.records.fetch_record(id)
            })
            .map_err(|source| PipelineError::Record {
                id: id.to_string(),
                source,
            })?;

        let resolver = VersionResolver::new(self.host.as_ref());
        let pair = self
            .retry
            .run("Resolving commit range", cancel, |_| resolver.resolve(&record))?;

        let mut notes = Vec::new();
        let expected = match self.verifier.expected_from_report(&record.issue) {
            Ok(signature) => Some(signature),
            Err(e) => {
                tracing::warn!(record = %record.id, error = %e, "No expected crash signature");
                notes.push(format!("Expected signature unavailable: {e}"));
                None
            }
        };

        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled(record.id));
        }
        let _deadline = cancel.arm_deadline(self.overall_timeout);

        let (vulnerable, fixed) = thread::scope(|scope| {
            let vulnerable = scope.spawn(|| self.reproduce_target(&pair.vulnerable, cancel));
            let fixed = scope.spawn(|| self.reproduce_target(&pair.fixed, cancel));
            (
                join_outcome(vulnerable, &pair.vulnerable),
                join_outcome(fixed, &pair.fixed),
            )
        });

        if cancel.is_cancelled() {
            notes.push("Reproduction was cancelled before both runs completed".to_string());
        }

        let report = self.reporter.report(&record, expected, vulnerable, fixed, notes);
        self.reporter.persist(&report)?;
        Ok(report)
    }

    /// Fetch, build and run for one side. Never fails: every error becomes
    /// a halted outcome naming its stage.
    fn reproduce_target(&self, target: &BuildTarget, cancel: &CancelToken) -> ReproductionOutcome {
        if cancel.is_cancelled() {
            return ReproductionOutcome::halted(target, Stage::Fetch, "Cancelled before fetch");
        }

        let artifacts = match self.fetcher.fetch(target, cancel) {
            Ok(artifacts) => artifacts,
            Err(e) => {
                tracing::warn!(record = %target.record_id, role = %target.role, error = %e, "Fetch failed");
                return ReproductionOutcome::halted(target, Stage::Fetch, e.to_string());
            }
        };

        let build = match self.builder.build(target, &artifacts, cancel) {
            Ok(build) => build,
            Err(e) => return ReproductionOutcome::halted(target, Stage::Build, e.to_string()),
        };
        if !build.is_usable() {
            tracing::warn!(
                record = %target.record_id,
                role = %target.role,
                fingerprint = %build.fingerprint,
                "Image build failed"
            );
            return ReproductionOutcome::halted(target, Stage::Build, "Image build failed")
                .with_build(&build);
        }

        self.runner.run(&build, &artifacts.input, cancel)
    }
}

fn join_outcome(
    handle: ScopedJoinHandle<'_, ReproductionOutcome>,
    target: &BuildTarget,
) -> ReproductionOutcome {
    handle.join().unwrap_or_else(|_| {
        tracing::error!(record = %target.record_id, role = %target.role, "Sub-pipeline panicked");
        ReproductionOutcome::halted(target, Stage::Run, "Sub-pipeline panicked")
    })
}
