pub mod builder;
pub mod cancel;
pub mod config;
pub mod fetcher;
pub mod pipeline;
pub mod record;
pub mod report;
pub mod resolver;
pub mod retry;
pub mod runner;
pub mod runtime;
pub mod signature;
pub mod source;
pub mod verifier;

#[cfg(test)]
mod testing;

pub use builder::{BuildCache, BuildResult, BuildStatus, EnvironmentBuilder};
pub use cancel::CancelToken;
pub use config::{ConfigError, CrashdiffConfig};
pub use fetcher::{Artifact, ArtifactFetcher, ArtifactKind, ArtifactSet, FetchError};
pub use pipeline::{Collaborators, PipelineError, Reproducer};
pub use record::{IssueReport, VulnerabilityRecord};
pub use report::{Confidence, DifferentialReport, DifferentialReporter, ReportError, Verdict};
pub use resolver::{BuildTarget, ResolveError, Role, TargetPair, VersionResolver};
pub use retry::{RetryPolicy, Retryable};
pub use runner::{ExitClassification, ReproductionOutcome, ReproductionRunner, Stage};
pub use runtime::{ContainerRuntime, DockerCli, RuntimeError};
pub use signature::{Access, CrashKind, CrashSignature};
pub use source::{ArtifactSource, SourceError, SourceHost, VulnerabilitySource};
pub use verifier::{CrashVerifier, SignatureError};
