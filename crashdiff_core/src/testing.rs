//! In-test fakes for the container runtime.

use crate::cancel::CancelToken;
use crate::runtime::{
    ContainerRuntime, ImageBuildOutput, ImageBuildRequest, ProcessExit, RunOutput, RunRequest,
    RuntimeError,
};
use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

type BuildFn = dyn Fn(&ImageBuildRequest) -> Result<ImageBuildOutput, RuntimeError> + Send + Sync;
type RunFn = dyn Fn(&RunRequest) -> Result<RunOutput, RuntimeError> + Send + Sync;

pub(crate) struct FakeRuntime {
    pub builds: AtomicUsize,
    pub runs: Mutex<Vec<RunRequest>>,
    pub removed: Mutex<Vec<String>>,
    pub images: Mutex<HashSet<String>>,
    on_build: Box<BuildFn>,
    on_run: Box<RunFn>,
    run_delay: Duration,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            builds: AtomicUsize::new(0),
            runs: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
            images: Mutex::new(HashSet::new()),
            on_build: Box::new(|_| {
                Ok(ImageBuildOutput {
                    success: true,
                    log: "Successfully built".to_string(),
                })
            }),
            on_run: Box::new(|_| {
                Ok(RunOutput {
                    exit: ProcessExit::Exited(0),
                    output: "Done 100 runs".to_string(),
                })
            }),
            run_delay: Duration::ZERO,
        }
    }

    pub fn on_build(
        mut self,
        f: impl Fn(&ImageBuildRequest) -> Result<ImageBuildOutput, RuntimeError> + Send + Sync + 'static,
    ) -> Self {
        self.on_build = Box::new(f);
        self
    }

    pub fn on_run(
        mut self,
        f: impl Fn(&RunRequest) -> Result<RunOutput, RuntimeError> + Send + Sync + 'static,
    ) -> Self {
        self.on_run = Box::new(f);
        self
    }

    /// Makes every run take `delay`, ending early as cancelled if the token
    /// trips meanwhile.
    pub fn with_run_delay(mut self, delay: Duration) -> Self {
        self.run_delay = delay;
        self
    }

    pub fn build_count(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

impl ContainerRuntime for FakeRuntime {
    fn image_exists(&self, image: &str) -> Result<bool, RuntimeError> {
        Ok(self.images.lock().unwrap().contains(image))
    }

    fn build_image(
        &self,
        request: &ImageBuildRequest,
        cancel: &CancelToken,
    ) -> Result<ImageBuildOutput, RuntimeError> {
        if cancel.is_cancelled() {
            return Err(RuntimeError::Cancelled);
        }
        self.builds.fetch_add(1, Ordering::SeqCst);
        let out = (self.on_build)(request)?;
        if out.success {
            self.images.lock().unwrap().insert(request.tag.clone());
        }
        Ok(out)
    }

    fn run_container(
        &self,
        request: &RunRequest,
        cancel: &CancelToken,
    ) -> Result<RunOutput, RuntimeError> {
        self.runs.lock().unwrap().push(request.clone());
        if !cancel.sleep(self.run_delay) {
            return Ok(RunOutput {
                exit: ProcessExit::Cancelled,
                output: String::new(),
            });
        }
        (self.on_run)(request)
    }

    fn remove_container(&self, name: &str) -> Result<(), RuntimeError> {
        self.removed.lock().unwrap().push(name.to_string());
        Ok(())
    }
}
