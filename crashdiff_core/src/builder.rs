use crate::cancel::CancelToken;
use crate::fetcher::{Artifact, ArtifactSet};
use crate::resolver::BuildTarget;
use crate::retry::RetryPolicy;
use crate::runtime::{ContainerRuntime, ImageBuildRequest, RuntimeError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

pub const DEFAULT_BASE_IMAGE: &str = "gcr.io/oss-fuzz/{project}";
pub const DEFAULT_BUILD_COMMAND: &str = "compile";

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("Build cancelled")]
    Cancelled,
}

#[derive(Error, Debug)]
pub enum BuildCacheError {
    #[error("Build cache I/O error: {0}")]
    Io(String),
    #[error("Build cache index is unreadable: {0}")]
    Index(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BuildStatus {
    Built,
    CachedHit,
    Failed,
}

/// Outcome of materializing one target as an image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildResult {
    pub fingerprint: String,
    pub target: BuildTarget,
    /// Image tag; absent when the build failed.
    pub image: Option<String>,
    pub status: BuildStatus,
    pub log: String,
}

impl BuildResult {
    pub fn is_usable(&self) -> bool {
        self.status != BuildStatus::Failed && self.image.is_some()
    }

    fn failed(fingerprint: String, target: &BuildTarget, log: String) -> Self {
        Self {
            fingerprint,
            target: target.clone(),
            image: None,
            status: BuildStatus::Failed,
            log,
        }
    }

    fn as_cached_hit(&self, target: &BuildTarget) -> Self {
        Self {
            fingerprint: self.fingerprint.clone(),
            target: target.clone(),
            image: self.image.clone(),
            status: BuildStatus::CachedHit,
            log: format!("Reused image built for fingerprint {}", self.fingerprint),
        }
    }
}

/// How images are derived from a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildSettings {
    /// Builder image; `{project}` is replaced by the project name.
    pub base_image: String,
    pub build_command: String,
    /// Where per-fingerprint build contexts are written.
    pub context_root: PathBuf,
}

impl BuildSettings {
    pub fn base_image_for(&self, project: &str) -> String {
        self.base_image.replace("{project}", project)
    }
}

/// Deterministic key of a build: identical inputs give identical fingerprints.
///
/// The role is not hashed: a vulnerable and a fixed target with the same pin
/// share one image.
pub fn build_fingerprint(target: &BuildTarget, snapshot: &Artifact, settings: &BuildSettings) -> String {
    let timestamp = target.pin.timestamp.to_rfc3339();
    let base_image = settings.base_image_for(&target.project);
    let mut context = md5::Context::new();
    for part in [
        target.project.as_str(),
        target.pin.commit.as_str(),
        timestamp.as_str(),
        target.fuzz_target.as_str(),
        target.engine.as_str(),
        target.sanitizer.as_str(),
        target.architecture.as_str(),
        snapshot.digest.as_str(),
        base_image.as_str(),
        settings.build_command.as_str(),
    ] {
        context.consume(part.as_bytes());
        context.consume([0u8]);
    }
    format!("{:x}", context.compute())
}

pub fn image_tag(project: &str, fingerprint: &str) -> String {
    format!("crashdiff/{}:{fingerprint}", project.to_ascii_lowercase())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEntry {
    image: String,
    project: String,
    commit: String,
    built_at: DateTime<Utc>,
}

type Slot = Arc<Mutex<Option<BuildResult>>>;

/// Built images keyed by fingerprint.
///
/// Each fingerprint owns a slot; a request holds its slot's lock for the whole
/// build, so a second request with the same fingerprint waits and then sees
/// the first one's result. Only successful builds are recorded.
pub struct BuildCache {
    slots: Mutex<HashMap<String, Slot>>,
    index: Mutex<BTreeMap<String, IndexEntry>>,
    index_file_path: Option<PathBuf>,
}

impl BuildCache {
    const INDEX_FILENAME: &'static str = "build_index.json";

    pub fn in_memory() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            index: Mutex::new(BTreeMap::new()),
            index_file_path: None,
        }
    }

    /// Opens the cache persisted in `dir`, creating the directory and an
    /// empty index if needed.
    pub fn on_disk(dir: &Path) -> Result<Self, BuildCacheError> {
        if !dir.exists() {
            fs::create_dir_all(dir).map_err(|e| {
                BuildCacheError::Io(format!("Failed to create cache directory at {dir:?}: {e}"))
            })?;
        } else if !dir.is_dir() {
            return Err(BuildCacheError::Io(format!(
                "Cache path {dir:?} exists but is not a directory"
            )));
        }

        let index_file_path = dir.join(Self::INDEX_FILENAME);
        let index = Self::load_index(&index_file_path)?;
        let cache = Self {
            slots: Mutex::new(HashMap::new()),
            index: Mutex::new(index),
            index_file_path: Some(index_file_path),
        };
        if cache
            .index_file_path
            .as_ref()
            .is_some_and(|p| !p.exists())
        {
            cache.save_index()?;
        }
        Ok(cache)
    }

    fn load_index(path: &Path) -> Result<BTreeMap<String, IndexEntry>, BuildCacheError> {
        if !path.is_file() {
            return Ok(BTreeMap::new());
        }
        let file = File::open(path)
            .map_err(|e| BuildCacheError::Io(format!("Failed to open index file {path:?}: {e}")))?;
        let len = file
            .metadata()
            .map_err(|e| BuildCacheError::Io(format!("Failed to stat index file {path:?}: {e}")))?
            .len();
        if len == 0 {
            return Ok(BTreeMap::new());
        }
        serde_json::from_reader(BufReader::new(file)).map_err(|e| {
            BuildCacheError::Index(format!(
                "Failed to parse JSON from index file {path:?}: {e}. The file might be corrupted."
            ))
        })
    }

    fn save_index(&self) -> Result<(), BuildCacheError> {
        let Some(path) = &self.index_file_path else {
            return Ok(());
        };
        let index = self.index.lock().unwrap_or_else(PoisonError::into_inner);
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        let tmp = tempfile::NamedTempFile::new_in(parent)
            .map_err(|e| BuildCacheError::Io(format!("Failed to create temp index in {parent:?}: {e}")))?;
        let mut writer = BufWriter::new(tmp);
        serde_json::to_writer_pretty(&mut writer, &*index)
            .map_err(|e| BuildCacheError::Io(format!("Failed to serialize build index: {e}")))?;
        writer
            .flush()
            .map_err(|e| BuildCacheError::Io(format!("Failed to write build index: {e}")))?;
        let tmp = writer
            .into_inner()
            .map_err(|e| BuildCacheError::Io(format!("Failed to write build index: {e}")))?;
        tmp.persist(path)
            .map_err(|e| BuildCacheError::Io(format!("Failed to replace index {path:?}: {e}")))?;
        Ok(())
    }

    fn slot(&self, fingerprint: &str) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(fingerprint.to_string()).or_default())
    }

    fn persisted_image(&self, fingerprint: &str) -> Option<String> {
        self.index
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(fingerprint)
            .map(|entry| entry.image.clone())
    }

    fn record(&self, result: &BuildResult) {
        let Some(image) = &result.image else {
            return;
        };
        self.index
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                result.fingerprint.clone(),
                IndexEntry {
                    image: image.clone(),
                    project: result.target.project.clone(),
                    commit: result.target.pin.commit.clone(),
                    built_at: Utc::now(),
                },
            );
        if let Err(e) = self.save_index() {
            tracing::warn!(fingerprint = %result.fingerprint, error = %e, "Failed to persist build index");
        }
    }

    pub fn len(&self) -> usize {
        self.index.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Deserialize)]
struct SrcmapEntry {
    #[serde(rename = "type")]
    kind: String,
    url: String,
    rev: String,
}

fn normalize_repo_url(url: &str) -> String {
    url.trim_end_matches('/')
        .trim_end_matches(".git")
        .to_ascii_lowercase()
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// A script pinning every git source of the snapshot, with the project's own
/// repository moved to the target commit.
fn checkout_script(target: &BuildTarget, srcmap: &BTreeMap<String, SrcmapEntry>) -> String {
    let main_url = target.repository.as_deref().map(normalize_repo_url);
    let main_path = format!("/src/{}", target.project);
    let mut sources: Vec<(String, String, String)> = Vec::new();
    let mut main_seen = false;

    for (path, entry) in srcmap {
        if entry.kind != "git" {
            continue;
        }
        let is_main = main_url.as_deref() == Some(normalize_repo_url(&entry.url).as_str())
            || (main_url.is_none() && *path == main_path);
        let rev = if is_main {
            main_seen = true;
            target.pin.commit.clone()
        } else {
            entry.rev.clone()
        };
        sources.push((path.clone(), entry.url.clone(), rev));
    }
    if !main_seen {
        if let Some(url) = &target.repository {
            sources.push((main_path, url.clone(), target.pin.commit.clone()));
        }
    }

    let mut script = String::from("#!/bin/sh\nset -eu\n");
    for (path, url, rev) in sources {
        let (path, url, rev) = (shell_quote(&path), shell_quote(&url), shell_quote(&rev));
        script.push_str(&format!(
            "if [ ! -d {path}/.git ]; then rm -rf {path}; git clone --quiet {url} {path}; fi\n\
             git -C {path} fetch --quiet origin {rev} || true\n\
             git -C {path} checkout --quiet --force {rev}\n"
        ));
    }
    script
}

fn dockerfile(target: &BuildTarget, settings: &BuildSettings) -> String {
    format!(
        "FROM {base}\n\
         ENV FUZZING_ENGINE={engine} SANITIZER={sanitizer} ARCHITECTURE={arch}\n\
         COPY srcmap.json checkout.sh /crashdiff/\n\
         RUN sh /crashdiff/checkout.sh\n\
         RUN {command}\n",
        base = settings.base_image_for(&target.project),
        engine = target.engine,
        sanitizer = target.sanitizer,
        arch = target.architecture,
        command = settings.build_command,
    )
}

/// Materializes build targets as container images, at most once per
/// fingerprint.
pub struct EnvironmentBuilder {
    runtime: Arc<dyn ContainerRuntime>,
    cache: BuildCache,
    settings: BuildSettings,
    retry: RetryPolicy,
}

impl EnvironmentBuilder {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        cache: BuildCache,
        settings: BuildSettings,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            runtime,
            cache,
            settings,
            retry,
        }
    }

    pub fn cache(&self) -> &BuildCache {
        &self.cache
    }

    /// Returns the image for `target`, building it only when no usable
    /// image exists for its fingerprint. A failed build is returned as data.
    pub fn build(
        &self,
        target: &BuildTarget,
        artifacts: &ArtifactSet,
        cancel: &CancelToken,
    ) -> Result<BuildResult, BuildError> {
        let fingerprint = build_fingerprint(target, &artifacts.snapshot, &self.settings);
        let slot = self.cache.slot(&fingerprint);
        let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(built) = slot.as_ref() {
            tracing::info!(role = %target.role, fingerprint = %fingerprint, "Build cache hit");
            return Ok(built.as_cached_hit(target));
        }

        if let Some(image) = self.cache.persisted_image(&fingerprint) {
            match self.runtime.image_exists(&image) {
                Ok(true) => {
                    tracing::info!(role = %target.role, fingerprint = %fingerprint, image = %image, "Persisted build cache hit");
                    let built = BuildResult {
                        fingerprint: fingerprint.clone(),
                        target: target.clone(),
                        image: Some(image),
                        status: BuildStatus::Built,
                        log: String::new(),
                    };
                    let hit = built.as_cached_hit(target);
                    *slot = Some(built);
                    return Ok(hit);
                }
                Ok(false) => {
                    tracing::info!(fingerprint = %fingerprint, image = %image, "Cached image is gone, rebuilding");
                }
                Err(e) => {
                    tracing::warn!(fingerprint = %fingerprint, error = %e, "Could not check cached image, rebuilding");
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(BuildError::Cancelled);
        }

        let context_dir = self.settings.context_root.join(&fingerprint);
        if let Err(e) = self.write_context(&context_dir, target, &artifacts.snapshot) {
            return Ok(BuildResult::failed(fingerprint, target, e));
        }

        let tag = image_tag(&target.project, &fingerprint);
        let request = ImageBuildRequest {
            tag: tag.clone(),
            context_dir,
            platform: target.platform().to_string(),
        };
        tracing::info!(role = %target.role, commit = %target.pin.commit, fingerprint = %fingerprint, "Building environment");

        let outcome = self
            .retry
            .run(&format!("Image build {tag}"), cancel, |_| {
                self.runtime.build_image(&request, cancel)
            });
        match outcome {
            Ok(out) if out.success => {
                let built = BuildResult {
                    fingerprint,
                    target: target.clone(),
                    image: Some(tag),
                    status: BuildStatus::Built,
                    log: out.log,
                };
                self.cache.record(&built);
                *slot = Some(built.clone());
                Ok(built)
            }
            Ok(out) => {
                tracing::warn!(role = %target.role, fingerprint = %fingerprint, "Image build failed");
                Ok(BuildResult::failed(fingerprint, target, out.log))
            }
            Err(RuntimeError::Cancelled) => Err(BuildError::Cancelled),
            Err(_) if cancel.is_cancelled() => Err(BuildError::Cancelled),
            Err(e) => {
                tracing::warn!(role = %target.role, fingerprint = %fingerprint, error = %e, "Image build could not be performed");
                Ok(BuildResult::failed(fingerprint, target, e.to_string()))
            }
        }
    }

    fn write_context(
        &self,
        dir: &Path,
        target: &BuildTarget,
        snapshot: &Artifact,
    ) -> Result<(), String> {
        let srcmap: BTreeMap<String, SrcmapEntry> = serde_json::from_slice(&snapshot.content)
            .map_err(|e| format!("Environment snapshot {} is not a source map: {e}", snapshot.locator))?;
        let write = |name: &str, content: &[u8]| {
            fs::write(dir.join(name), content)
                .map_err(|e| format!("Failed to write {name} into build context {dir:?}: {e}"))
        };
        fs::create_dir_all(dir)
            .map_err(|e| format!("Failed to create build context {dir:?}: {e}"))?;
        write("srcmap.json", &snapshot.content[..])?;
        write("checkout.sh", checkout_script(target, &srcmap).as_bytes())?;
        write("Dockerfile", dockerfile(target, &self.settings).as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::ArtifactKind;
    use crate::resolver::{Pin, Role};
    use crate::runtime::ImageBuildOutput;
    use crate::testing::FakeRuntime;
    use chrono::TimeZone;
    use std::thread;
    use std::time::Duration;

    const SRCMAP: &str = r#"{
        "/src/wolfmqtt": {"type": "git", "url": "https://github.com/wolfSSL/wolfMQTT.git", "rev": "ffff0000"},
        "/src/wolfssl": {"type": "git", "url": "https://github.com/wolfSSL/wolfssl", "rev": "1234abcd"}
    }"#;

    fn target(commit: &str, role: Role) -> BuildTarget {
        BuildTarget {
            record_id: "OSV-2021-1361".to_string(),
            project: "wolfmqtt".to_string(),
            repository: Some("https://github.com/wolfSSL/wolfMQTT".to_string()),
            pin: Pin {
                commit: commit.to_string(),
                timestamp: Utc.with_ymd_and_hms(2021, 5, 12, 6, 12, 0).unwrap(),
            },
            fuzz_target: "wolfmqtt-fuzzer".to_string(),
            engine: "libfuzzer".to_string(),
            sanitizer: "address".to_string(),
            architecture: "x86_64".to_string(),
            testcase_id: Some("1".to_string()),
            role,
        }
    }

    fn artifacts() -> ArtifactSet {
        ArtifactSet {
            snapshot: Artifact::new(
                ArtifactKind::EnvironmentSnapshot,
                "wolfmqtt/wolfmqtt-address-202105120612.srcmap.json",
                SRCMAP.as_bytes().to_vec(),
            ),
            input: Artifact::new(ArtifactKind::TriggeringInput, "testcases/1", b"x".to_vec()),
        }
    }

    fn settings(root: &Path) -> BuildSettings {
        BuildSettings {
            base_image: DEFAULT_BASE_IMAGE.to_string(),
            build_command: DEFAULT_BUILD_COMMAND.to_string(),
            context_root: root.to_path_buf(),
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(1),
        }
    }

    fn builder(runtime: Arc<FakeRuntime>, cache: BuildCache, root: &Path) -> EnvironmentBuilder {
        EnvironmentBuilder::new(runtime, cache, settings(root), fast_retry())
    }

    #[test]
    fn second_identical_build_is_a_cache_hit() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        let builder = builder(runtime.clone(), BuildCache::in_memory(), dir.path());
        let cancel = CancelToken::new();

        let first = builder.build(&target("aaaa", Role::Vulnerable), &artifacts(), &cancel).unwrap();
        let second = builder.build(&target("aaaa", Role::Vulnerable), &artifacts(), &cancel).unwrap();

        assert_eq!(first.status, BuildStatus::Built);
        assert_eq!(second.status, BuildStatus::CachedHit);
        assert_eq!(first.image, second.image);
        assert_eq!(runtime.build_count(), 1, "A cache hit must not rebuild");
    }

    #[test]
    fn fingerprint_ignores_role_but_not_pin() {
        let dir = tempfile::tempdir().unwrap();
        let s = settings(dir.path());
        let snapshot = artifacts().snapshot;
        assert_eq!(
            build_fingerprint(&target("aaaa", Role::Vulnerable), &snapshot, &s),
            build_fingerprint(&target("aaaa", Role::Fixed), &snapshot, &s)
        );
        assert_ne!(
            build_fingerprint(&target("aaaa", Role::Vulnerable), &snapshot, &s),
            build_fingerprint(&target("bbbb", Role::Vulnerable), &snapshot, &s)
        );
    }

    #[test]
    fn concurrent_builds_of_one_fingerprint_build_once() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new().on_build(|_| {
            thread::sleep(Duration::from_millis(100));
            Ok(ImageBuildOutput {
                success: true,
                log: String::new(),
            })
        }));
        let builder = builder(runtime.clone(), BuildCache::in_memory(), dir.path());
        let cancel = CancelToken::new();

        let statuses: Vec<BuildStatus> = thread::scope(|s| {
            let handles: Vec<_> = [Role::Vulnerable, Role::Fixed]
                .into_iter()
                .map(|role| {
                    let builder = &builder;
                    let cancel = &cancel;
                    s.spawn(move || builder.build(&target("aaaa", role), &artifacts(), cancel).unwrap().status)
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(runtime.build_count(), 1);
        assert!(statuses.contains(&BuildStatus::Built));
        assert!(statuses.contains(&BuildStatus::CachedHit));
    }

    #[test]
    fn persisted_index_is_honoured_while_image_exists() {
        let cache_dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        let cancel = CancelToken::new();

        let first = builder(runtime.clone(), BuildCache::on_disk(cache_dir.path()).unwrap(), cache_dir.path())
            .build(&target("aaaa", Role::Vulnerable), &artifacts(), &cancel)
            .unwrap();
        assert!(cache_dir.path().join("build_index.json").is_file());

        let reopened = builder(runtime.clone(), BuildCache::on_disk(cache_dir.path()).unwrap(), cache_dir.path());
        assert_eq!(reopened.cache().len(), 1);
        let second = reopened
            .build(&target("aaaa", Role::Vulnerable), &artifacts(), &cancel)
            .unwrap();
        assert_eq!(second.status, BuildStatus::CachedHit);
        assert_eq!(second.image, first.image);
        assert_eq!(runtime.build_count(), 1);

        runtime.images.lock().unwrap().clear();
        let third = builder(runtime.clone(), BuildCache::on_disk(cache_dir.path()).unwrap(), cache_dir.path())
            .build(&target("aaaa", Role::Vulnerable), &artifacts(), &cancel)
            .unwrap();
        assert_eq!(third.status, BuildStatus::Built, "A vanished image must be rebuilt");
        assert_eq!(runtime.build_count(), 2);
    }

    #[test]
    fn corrupted_index_is_rejected() {
        let cache_dir = tempfile::tempdir().unwrap();
        fs::write(cache_dir.path().join("build_index.json"), "{not json").unwrap();
        assert!(matches!(
            BuildCache::on_disk(cache_dir.path()),
            Err(BuildCacheError::Index(_))
        ));
    }

    #[test]
    fn failed_build_is_data_and_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new().on_build(|_| {
            Ok(ImageBuildOutput {
                success: false,
                log: "error: compile failed".to_string(),
            })
        }));
        let builder = builder(runtime.clone(), BuildCache::in_memory(), dir.path());
        let cancel = CancelToken::new();

        let first = builder.build(&target("aaaa", Role::Fixed), &artifacts(), &cancel).unwrap();
        assert_eq!(first.status, BuildStatus::Failed);
        assert!(!first.is_usable());
        assert!(first.log.contains("compile failed"));

        builder.build(&target("aaaa", Role::Fixed), &artifacts(), &cancel).unwrap();
        assert_eq!(runtime.build_count(), 2, "Failures are never cached");
    }

    #[test]
    fn transient_runtime_errors_are_retried() {
        let dir = tempfile::tempdir().unwrap();
        let calls = AtomicCalls::default();
        let runtime = Arc::new(FakeRuntime::new().on_build(move |_| {
            if calls.next() < 2 {
                Err(RuntimeError::Transient("TLS handshake timeout".to_string()))
            } else {
                Ok(ImageBuildOutput {
                    success: true,
                    log: String::new(),
                })
            }
        }));
        let result = builder(runtime.clone(), BuildCache::in_memory(), dir.path())
            .build(&target("aaaa", Role::Vulnerable), &artifacts(), &CancelToken::new())
            .unwrap();
        assert_eq!(result.status, BuildStatus::Built);
        assert_eq!(runtime.build_count(), 3);
    }

    #[derive(Default)]
    struct AtomicCalls(std::sync::atomic::AtomicUsize);

    impl AtomicCalls {
        fn next(&self) -> usize {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst)
        }
    }

    #[test]
    fn build_context_pins_sources() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        let result = builder(runtime, BuildCache::in_memory(), dir.path())
            .build(&target("aaaa1111", Role::Vulnerable), &artifacts(), &CancelToken::new())
            .unwrap();

        let context = dir.path().join(&result.fingerprint);
        let script = fs::read_to_string(context.join("checkout.sh")).unwrap();
        assert!(script.contains("checkout --quiet --force 'aaaa1111'"), "{script}");
        assert!(script.contains("'1234abcd'"), "Dependencies keep their snapshot revision");
        assert!(!script.contains("ffff0000"), "The main repository follows the pin");

        let dockerfile = fs::read_to_string(context.join("Dockerfile")).unwrap();
        assert!(dockerfile.starts_with("FROM gcr.io/oss-fuzz/wolfmqtt\n"));
        assert_eq!(result.image, Some(image_tag("wolfmqtt", &result.fingerprint)));
    }

    #[test]
    fn invalid_snapshot_fails_the_build() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        let mut set = artifacts();
        set.snapshot = Artifact::new(ArtifactKind::EnvironmentSnapshot, "x", b"garbage".to_vec());
        let result = builder(runtime.clone(), BuildCache::in_memory(), dir.path())
            .build(&target("aaaa", Role::Vulnerable), &set, &CancelToken::new())
            .unwrap();
        assert_eq!(result.status, BuildStatus::Failed);
        assert_eq!(runtime.build_count(), 0);
    }

    #[test]
    fn cancelled_build_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        let result = builder(Arc::new(FakeRuntime::new()), BuildCache::in_memory(), dir.path())
            .build(&target("aaaa", Role::Vulnerable), &artifacts(), &cancel);
        assert!(matches!(result, Err(BuildError::Cancelled)));
    }
}
