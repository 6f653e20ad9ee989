use crate::builder::{BuildSettings, DEFAULT_BASE_IMAGE, DEFAULT_BUILD_COMMAND};
use crate::retry::RetryPolicy;
use crate::runner::{DEFAULT_REPRODUCE_COMMAND, RunSettings};
use crate::verifier::{CrashVerifier, DEFAULT_FRAME_DEPTH};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file at {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse TOML from config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct SourcesConfig {
    /// OSV JSON documents, one `<ID>.json` per record.
    #[serde(default = "default_records_dir")]
    pub records_dir: PathBuf,
    /// Commit metadata, one `<project>.json` per project.
    #[serde(default = "default_commits_dir")]
    pub commits_dir: PathBuf,
    /// Mirror of the snapshot/testcase bucket layout.
    #[serde(default = "default_bucket_dir")]
    pub bucket_dir: PathBuf,
}

fn default_records_dir() -> PathBuf {
    PathBuf::from("./records")
}
fn default_commits_dir() -> PathBuf {
    PathBuf::from("./commits")
}
fn default_bucket_dir() -> PathBuf {
    PathBuf::from("./bucket")
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            records_dir: default_records_dir(),
            commits_dir: default_commits_dir(),
            bucket_dir: default_bucket_dir(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,
}

pub fn default_cache_dir() -> PathBuf {
    PathBuf::from("./.crashdiff_cache")
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: default_cache_dir(),
        }
    }
}

impl CacheConfig {
    pub fn builds_dir(&self) -> PathBuf {
        self.dir.join("builds")
    }

    pub fn contexts_dir(&self) -> PathBuf {
        self.dir.join("contexts")
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct OutputConfig {
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,
}

pub fn default_output_dir() -> PathBuf {
    PathBuf::from("./reports")
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct BuildConfig {
    #[serde(default = "default_base_image")]
    pub base_image: String,
    #[serde(default = "default_build_command")]
    pub build_command: String,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_base_image() -> String {
    DEFAULT_BASE_IMAGE.to_string()
}
fn default_build_command() -> String {
    DEFAULT_BUILD_COMMAND.to_string()
}
fn default_max_attempts() -> u32 {
    4
}
fn default_initial_backoff_ms() -> u64 {
    500
}
fn default_max_backoff_ms() -> u64 {
    8_000
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            base_image: default_base_image(),
            build_command: default_build_command(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    #[serde(default = "default_run_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_reproduce_command")]
    pub reproduce_command: String,
    /// Passed to `docker run --memory`, e.g. `"4g"`.
    #[serde(default)]
    pub memory_limit: Option<String>,
    #[serde(default)]
    pub cpus: Option<String>,
    #[serde(default)]
    pub keep_containers: bool,
}

fn default_run_timeout_secs() -> u64 {
    300
}
fn default_reproduce_command() -> String {
    DEFAULT_REPRODUCE_COMMAND.to_string()
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_run_timeout_secs(),
            reproduce_command: default_reproduce_command(),
            memory_limit: None,
            cpus: None,
            keep_containers: false,
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct VerifyConfig {
    #[serde(default = "default_frame_depth")]
    pub frame_depth: usize,
}

fn default_frame_depth() -> usize {
    DEFAULT_FRAME_DEPTH
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            frame_depth: default_frame_depth(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FetchConfig {
    /// Fall back to the closest snapshot when the exact one is missing.
    #[serde(default)]
    pub nearest_snapshot: bool,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    #[serde(default = "default_overall_timeout_secs")]
    pub overall_timeout_secs: u64,
}

fn default_overall_timeout_secs() -> u64 {
    3 * 60 * 60
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            overall_timeout_secs: default_overall_timeout_secs(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct DockerConfig {
    #[serde(default = "default_docker_binary")]
    pub binary: PathBuf,
}

fn default_docker_binary() -> PathBuf {
    PathBuf::from("docker")
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            binary: default_docker_binary(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CrashdiffConfig {
    #[serde(default)]
    pub sources: SourcesConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub build: BuildConfig,
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub verify: VerifyConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub docker: DockerConfig,
}

impl CrashdiffConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: CrashdiffConfig =
            toml::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values no pipeline can run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.build.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "build.max-attempts must be at least 1".to_string(),
            ));
        }
        if self.build.initial_backoff_ms > self.build.max_backoff_ms {
            return Err(ConfigError::Invalid(
                "build.initial-backoff-ms exceeds build.max-backoff-ms".to_string(),
            ));
        }
        if self.run.timeout_secs == 0 {
            return Err(ConfigError::Invalid("run.timeout-secs must be positive".to_string()));
        }
        if self.verify.frame_depth == 0 {
            return Err(ConfigError::Invalid(
                "verify.frame-depth must be at least 1".to_string(),
            ));
        }
        if self.pipeline.overall_timeout_secs < self.run.timeout_secs {
            return Err(ConfigError::Invalid(
                "pipeline.overall-timeout-secs is shorter than run.timeout-secs".to_string(),
            ));
        }
        if !self.run.reproduce_command.contains("{fuzz_target}") {
            tracing::warn!(
                command = %self.run.reproduce_command,
                "Reproduce command does not name the fuzz target"
            );
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.build.max_attempts,
            initial_backoff: Duration::from_millis(self.build.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.build.max_backoff_ms),
        }
    }

    pub fn build_settings(&self) -> BuildSettings {
        BuildSettings {
            base_image: self.build.base_image.clone(),
            build_command: self.build.build_command.clone(),
            context_root: self.cache.contexts_dir(),
        }
    }

    pub fn run_settings(&self) -> RunSettings {
        RunSettings {
            timeout: Duration::from_secs(self.run.timeout_secs),
            reproduce_command: self.run.reproduce_command.clone(),
            keep_containers: self.run.keep_containers,
        }
    }

    pub fn verifier(&self) -> CrashVerifier {
        CrashVerifier::new(self.verify.frame_depth)
    }

    pub fn overall_timeout(&self) -> Duration {
        Duration::from_secs(self.pipeline.overall_timeout_secs)
    }
}
