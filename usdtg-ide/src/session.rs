//! The IDE session and the coordinator that serializes work on it.
//!
//! At most one of compile, run, debug or terminal command is in flight.
//! A request that arrives while another is active is rejected with
//! [`IdeError::Busy`]. The session lock guards state transitions only and
//! is never held across I/O or compilation.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::oneshot;
use usdtg_core::{Cancellation, CompilationPipeline, CompilationRequest, CompilationResult};

use crate::config::{CommandSpec, IdeConfig};
use crate::error::{ErrorKind, IdeError, compile_failure_kind};
use crate::loader::{FileContent, FileEntry, FileVersion, SourceLoader};
use crate::protocol::{
    CompileParams, EventBody, PathParams, Request, RunParams, SaveFileParams, TerminalParams,
};
use crate::sandbox::{OsSandbox, ProcessOutput, ProcessSandbox, SpawnRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    Idle,
    Compiling,
    Running,
    Debugging,
    /// Final; no further transitions.
    Terminated,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionState::Idle => "idle",
            SessionState::Compiling => "compiling",
            SessionState::Running => "running",
            SessionState::Debugging => "debugging",
            SessionState::Terminated => "terminated",
        })
    }
}

/// Exclusive work a session can be busy with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    Compile,
    Run,
    Debug,
    /// Terminal commands occupy the session like a run.
    Terminal,
}

impl Activity {
    fn state(self) -> SessionState {
        match self {
            Activity::Compile => SessionState::Compiling,
            Activity::Run | Activity::Terminal => SessionState::Running,
            Activity::Debug => SessionState::Debugging,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminateOutcome {
    pub state: SessionState,
    pub cancelled_compile: bool,
    pub killed_process: bool,
}

struct Inner {
    state: SessionState,
    active_file: Option<String>,
    cancellation: Option<Cancellation>,
    kill: Option<oneshot::Sender<()>>,
}

pub struct Session {
    project_root: PathBuf,
    inner: Mutex<Inner>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("project_root", &self.project_root)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(project_root: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Session {
            project_root: project_root.into(),
            inner: Mutex::new(Inner {
                state: SessionState::Idle,
                active_file: None,
                cancellation: None,
                kill: None,
            }),
        })
    }

    fn with_inner<R>(&self, apply: impl FnOnce(&mut Inner) -> R) -> R {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        apply(&mut inner)
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    pub fn state(&self) -> SessionState {
        self.with_inner(|inner| inner.state)
    }

    /// File of the most recent compile, run or debug request.
    pub fn active_file(&self) -> Option<String> {
        self.with_inner(|inner| inner.active_file.clone())
    }

    /// Idle -> `activity`'s state. The returned guard moves the session
    /// back to Idle when dropped.
    pub fn try_begin(
        self: &Arc<Self>,
        activity: Activity,
        file: Option<&str>,
    ) -> Result<ActivityGuard, IdeError> {
        self.with_inner(|inner| match inner.state {
            SessionState::Idle => {
                inner.state = activity.state();
                if let Some(file) = file {
                    inner.active_file = Some(file.to_string());
                }
                log::debug!("session: idle -> {}", inner.state);
                Ok(ActivityGuard {
                    session: Arc::clone(self),
                })
            }
            SessionState::Terminated => Err(IdeError::Terminated),
            busy => Err(IdeError::Busy(busy)),
        })
    }

    /// Cancel the in-flight compile and kill the running process. The
    /// worker that owns them moves the session back to Idle.
    pub fn terminate_current(&self) -> TerminateOutcome {
        self.with_inner(|inner| {
            let cancelled_compile = inner.cancellation.as_ref().is_some_and(|cancellation| {
                cancellation.cancel();
                true
            });
            let killed_process = inner.kill.take().is_some_and(|kill| kill.send(()).is_ok());
            TerminateOutcome {
                state: inner.state,
                cancelled_compile,
                killed_process,
            }
        })
    }

    /// Any state -> Terminated, cancelling and killing whatever is active.
    pub fn shutdown(&self) -> TerminateOutcome {
        let mut outcome = self.terminate_current();
        self.with_inner(|inner| {
            if inner.state != SessionState::Terminated {
                log::info!("session: {} -> terminated", inner.state);
            }
            inner.state = SessionState::Terminated;
        });
        outcome.state = SessionState::Terminated;
        outcome
    }
}

/// Proof that the session is busy with one activity.
#[must_use]
pub struct ActivityGuard {
    session: Arc<Session>,
}

impl ActivityGuard {
    fn set_cancellation(&self, cancellation: Cancellation) {
        self.session.with_inner(|inner| {
            if inner.state == SessionState::Terminated {
                cancellation.cancel();
            }
            inner.cancellation = Some(cancellation);
        });
    }

    fn set_kill(&self, kill: oneshot::Sender<()>) {
        self.session.with_inner(|inner| {
            if inner.state == SessionState::Terminated {
                let _ = kill.send(());
            } else {
                inner.kill = Some(kill);
            }
        });
    }
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        self.session.with_inner(|inner| {
            inner.cancellation = None;
            inner.kill = None;
            if inner.state != SessionState::Terminated {
                log::debug!("session: {} -> idle", inner.state);
                inner.state = SessionState::Idle;
            }
        });
    }
}

/// Build outputs written for a persisted compile, relative to the project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifacts {
    pub wasm: String,
    pub abi: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompileOutcome {
    pub file_path: String,
    #[serde(flatten)]
    pub result: CompilationResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<Artifacts>,
}

/// Routes requests to the loader, the pipeline and the sandbox.
pub struct SessionCoordinator<S: ProcessSandbox = OsSandbox> {
    config: IdeConfig,
    session: Arc<Session>,
    loader: SourceLoader,
    pipeline: Arc<CompilationPipeline>,
    sandbox: S,
}

impl SessionCoordinator<OsSandbox> {
    /// Coordinator spawning real processes.
    pub fn with_os_sandbox(
        config: IdeConfig,
        project_root: impl Into<PathBuf>,
    ) -> Result<Self, IdeError> {
        let sandbox = OsSandbox::new(config.output_limit);
        SessionCoordinator::new(config, project_root, sandbox)
    }
}

impl<S: ProcessSandbox> SessionCoordinator<S> {
    pub fn new(
        config: IdeConfig,
        project_root: impl Into<PathBuf>,
        sandbox: S,
    ) -> Result<Self, IdeError> {
        config.validate()?;
        let project_root = project_root.into();
        let pipeline = CompilationPipeline::new(config.pipeline.clone())?;
        log::info!("session opened on {}", project_root.display());
        Ok(SessionCoordinator {
            loader: SourceLoader::new(&project_root, config.max_file_size, &config.build_dir),
            session: Session::new(project_root),
            pipeline: Arc::new(pipeline),
            sandbox,
            config,
        })
    }

    /// Replace the pipeline built from the configuration, e.g. to plug in
    /// another quantum-safe scheme or security rule table.
    pub fn with_pipeline(mut self, pipeline: CompilationPipeline) -> Self {
        self.pipeline = Arc::new(pipeline);
        self
    }

    pub fn config(&self) -> &IdeConfig {
        &self.config
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn loader(&self) -> &SourceLoader {
        &self.loader
    }

    /// Pipeline-wide settings changed here apply to the next compile.
    pub fn pipeline(&self) -> &CompilationPipeline {
        &self.pipeline
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    /// Serve one request. Failures become an `Error` event; nothing here
    /// can fail the caller.
    pub async fn handle(&self, request: Request) -> EventBody {
        let name = request.name();
        let response = match request {
            Request::SaveFile(params) => self.save_file(params).await.map(EventBody::FileSaved),
            Request::LoadFile(params) => self.load_file(params).await.map(EventBody::FileLoaded),
            Request::Compile(params) => self.compile(params).await.map(EventBody::CompileResult),
            Request::Run(params) => self.run(params).await.map(EventBody::RunResult),
            Request::Debug(params) => self.debug(params).await.map(EventBody::DebugResult),
            Request::GetFiles => self.list_files().await.map(EventBody::FileList),
            Request::CreateFile(params) => {
                self.create_file(params).await.map(EventBody::FileCreated)
            }
            Request::DeleteFile(params) => {
                self.delete_file(params).await.map(EventBody::FileDeleted)
            }
            Request::TerminalCommand(params) => {
                self.terminal(params).await.map(EventBody::TerminalOutput)
            }
            Request::Terminate => Ok(EventBody::TerminateResult(self.terminate())),
        };
        response.unwrap_or_else(|err| {
            log::warn!("{name} failed: {err}");
            EventBody::error(&err)
        })
    }

    fn ensure_live(&self) -> Result<(), IdeError> {
        match self.session.state() {
            SessionState::Terminated => Err(IdeError::Terminated),
            _ => Ok(()),
        }
    }

    // -----------------------------------------------------------------
    // Files (serialized per path by the loader, not by the session)
    // -----------------------------------------------------------------

    pub async fn save_file(&self, params: SaveFileParams) -> Result<FileVersion, IdeError> {
        self.ensure_live()?;
        self.loader
            .save(&params.path, &params.content, params.base_version)
            .await
    }

    pub async fn load_file(&self, params: PathParams) -> Result<FileContent, IdeError> {
        self.ensure_live()?;
        self.loader.load(&params.path).await
    }

    pub async fn create_file(&self, params: PathParams) -> Result<FileVersion, IdeError> {
        self.ensure_live()?;
        self.loader.create(&params.path).await
    }

    pub async fn delete_file(&self, params: PathParams) -> Result<FileVersion, IdeError> {
        self.ensure_live()?;
        self.loader.delete(&params.path).await
    }

    pub async fn list_files(&self) -> Result<Vec<FileEntry>, IdeError> {
        self.ensure_live()?;
        self.loader.list().await
    }

    // -----------------------------------------------------------------
    // Compile
    // -----------------------------------------------------------------

    pub async fn compile(&self, params: CompileParams) -> Result<CompileOutcome, IdeError> {
        let guard = self
            .session
            .try_begin(Activity::Compile, Some(params.file_path.as_str()))?;
        let source = self.loader.load(&params.file_path).await?;

        let request = CompilationRequest {
            source: source.content,
            mode: params.mode,
            optimization_level: params.optimization_level,
            quantum_safety: params.quantum_safety,
            gas_optimization: params.gas_optimization,
        };
        let cancellation = Cancellation::new();
        guard.set_cancellation(cancellation.clone());

        let pipeline = Arc::clone(&self.pipeline);
        let worker_cancellation = cancellation.clone();
        let mut worker = tokio::task::spawn_blocking(move || {
            pipeline.compile_with_cancellation(&request, &worker_cancellation)
        });
        let ceiling = self.config.compile_timeout();
        let joined = match tokio::time::timeout(ceiling, &mut worker).await {
            Ok(joined) => joined,
            Err(_) => {
                log::warn!("compiling {} exceeded {ceiling:?}; cancelling", params.file_path);
                cancellation.cancel();
                // The worker stops at its next stage boundary.
                match worker.await {
                    Ok(Ok(result)) => log::debug!(
                        "abandoned compile of {} finished (cancelled={})",
                        params.file_path,
                        result.was_cancelled()
                    ),
                    Ok(Err(err)) => log::warn!("abandoned compile of {} failed: {err}", params.file_path),
                    Err(err) => log::error!("compile worker for {} panicked: {err}", params.file_path),
                }
                return Err(IdeError::CompileTimeout(ceiling));
            }
        };
        let result = joined.map_err(|err| IdeError::Worker(err.to_string()))??;

        let artifacts = if result.success() && params.mode.persists_artifacts() {
            Some(self.persist(&params.file_path, &result).await?)
        } else {
            None
        };
        drop(guard);

        log::info!(
            "compiled {} ({}): success={} gas={}",
            params.file_path,
            params.mode,
            result.success(),
            result.gas_estimate()
        );
        Ok(CompileOutcome {
            file_path: params.file_path,
            error_kind: compile_failure_kind(&result),
            result,
            artifacts,
        })
    }

    /// Write `<build>/<stem>.wasm` and `<build>/<stem>.abi.json`.
    async fn persist(
        &self,
        file_path: &str,
        result: &CompilationResult,
    ) -> Result<Artifacts, IdeError> {
        let stem = Path::new(file_path)
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or("contract");
        let build_dir = self.loader.root().join(&self.config.build_dir);
        tokio::fs::create_dir_all(&build_dir)
            .await
            .map_err(|err| IdeError::io(&build_dir, err))?;

        let wasm_name = format!("{stem}.wasm");
        let abi_name = format!("{stem}.abi.json");
        let wasm_path = build_dir.join(&wasm_name);
        tokio::fs::write(&wasm_path, result.bytecode())
            .await
            .map_err(|err| IdeError::io(&wasm_path, err))?;
        let abi = serde_json::to_vec_pretty(result.abi())
            .map_err(|err| IdeError::Worker(err.to_string()))?;
        let abi_path = build_dir.join(&abi_name);
        tokio::fs::write(&abi_path, abi)
            .await
            .map_err(|err| IdeError::io(&abi_path, err))?;

        let build = self.config.build_dir.to_string_lossy().replace('\\', "/");
        Ok(Artifacts {
            wasm: format!("{build}/{wasm_name}"),
            abi: format!("{build}/{abi_name}"),
        })
    }

    // -----------------------------------------------------------------
    // Processes
    // -----------------------------------------------------------------

    pub async fn run(&self, params: RunParams) -> Result<ProcessOutput, IdeError> {
        self.launch(Activity::Run, &self.config.run_command, params).await
    }

    pub async fn debug(&self, params: RunParams) -> Result<ProcessOutput, IdeError> {
        self.launch(Activity::Debug, &self.config.debug_command, params).await
    }

    async fn launch(
        &self,
        activity: Activity,
        command: &CommandSpec,
        params: RunParams,
    ) -> Result<ProcessOutput, IdeError> {
        let guard = self.session.try_begin(activity, Some(params.file_path.as_str()))?;
        let file = self.loader.resolve(&params.file_path)?;
        if !tokio::fs::try_exists(&file).await.unwrap_or(false) {
            return Err(IdeError::NotFound(params.file_path));
        }
        let mut args = command.args_for(&file);
        args.extend(params.args);
        let request = SpawnRequest {
            program: command.program.clone(),
            args,
            cwd: Some(self.loader.root().to_path_buf()),
            timeout: self.timeout(params.timeout_ms),
        };
        self.spawn(guard, request).await
    }

    pub async fn terminal(&self, params: TerminalParams) -> Result<ProcessOutput, IdeError> {
        let guard = self.session.try_begin(Activity::Terminal, None)?;
        let mut args = self.config.shell.args.clone();
        args.push(params.command);
        let request = SpawnRequest {
            program: self.config.shell.program.clone(),
            args,
            cwd: Some(self.loader.root().to_path_buf()),
            timeout: self.timeout(params.timeout_ms),
        };
        self.spawn(guard, request).await
    }

    fn timeout(&self, requested_ms: Option<u64>) -> Duration {
        requested_ms
            .filter(|ms| *ms > 0)
            .map_or_else(|| self.config.process_timeout(), Duration::from_millis)
    }

    async fn spawn(
        &self,
        guard: ActivityGuard,
        request: SpawnRequest,
    ) -> Result<ProcessOutput, IdeError> {
        let (kill, signal) = oneshot::channel();
        guard.set_kill(kill);
        let output = self.sandbox.spawn(request, signal).await;
        drop(guard);
        output
    }

    // -----------------------------------------------------------------
    // Cancellation and shutdown
    // -----------------------------------------------------------------

    pub fn terminate(&self) -> TerminateOutcome {
        let outcome = self.session.terminate_current();
        log::info!(
            "terminate requested in state {}: cancelled_compile={} killed_process={}",
            outcome.state,
            outcome.cancelled_compile,
            outcome.killed_process
        );
        outcome
    }

    pub fn shutdown(&self) -> TerminateOutcome {
        self.session.shutdown()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::sync::Notify;
    use usdtg_core::CompilationMode;

    /// Sandbox whose processes run until released or killed.
    #[derive(Clone, Default)]
    pub(crate) struct GatedSandbox {
        pub(crate) gate: Arc<Gate>,
    }

    #[derive(Default)]
    pub(crate) struct Gate {
        pub(crate) running: AtomicUsize,
        pub(crate) peak: AtomicUsize,
        pub(crate) started: Notify,
        pub(crate) release: Notify,
    }

    impl ProcessSandbox for GatedSandbox {
        async fn spawn(
            &self,
            request: SpawnRequest,
            kill: oneshot::Receiver<()>,
        ) -> Result<ProcessOutput, IdeError> {
            let gate = &self.gate;
            let now = gate.running.fetch_add(1, Ordering::SeqCst) + 1;
            gate.peak.fetch_max(now, Ordering::SeqCst);
            gate.started.notify_one();
            let result = tokio::select! {
                _ = gate.release.notified() => Ok(ProcessOutput {
                    exit_code: Some(0),
                    stdout: request.args.join(" "),
                    stderr: String::new(),
                    stdout_truncated: false,
                    stderr_truncated: false,
                    stdout_lossy: false,
                    stderr_lossy: false,
                    duration_ms: 0,
                }),
                Ok(()) = kill => Err(IdeError::Killed(request.program)),
            };
            gate.running.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    pub(crate) const CONTRACT: &str = "contract Counter {
        storage count: i32;
        function bump(by: i32) public -> i32 {
            require(by > 0);
            count = count + by;
            return count;
        }
    }";

    pub(crate) fn project() -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("counter.usdtg"), CONTRACT).expect("write");
        dir
    }

    pub(crate) fn coordinator(root: &Path) -> (Arc<SessionCoordinator<GatedSandbox>>, Arc<Gate>) {
        let sandbox = GatedSandbox::default();
        let gate = sandbox.gate.clone();
        let coordinator =
            SessionCoordinator::new(IdeConfig::default(), root, sandbox).expect("coordinator");
        (Arc::new(coordinator), gate)
    }

    fn run_params(file: &str) -> RunParams {
        RunParams {
            file_path: file.to_string(),
            args: vec!["--entry".into(), "bump".into()],
            timeout_ms: None,
        }
    }

    fn compile_params(file: &str, mode: CompilationMode) -> CompileParams {
        CompileParams {
            file_path: file.to_string(),
            mode,
            optimization_level: None,
            quantum_safety: None,
            gas_optimization: None,
        }
    }

    /// Seal that holds the compile worker until released.
    struct StallingSeal {
        entered: Arc<Notify>,
        release: Mutex<std::sync::mpsc::Receiver<()>>,
    }

    impl usdtg_core::QuantumSafeScheme for StallingSeal {
        fn name(&self) -> &str {
            "stalling"
        }

        fn seal(&self, module: &[u8]) -> Vec<u8> {
            self.entered.notify_one();
            if let Ok(release) = self.release.lock() {
                let _ = release.recv_timeout(Duration::from_secs(10));
            }
            module.len().to_le_bytes().to_vec()
        }
    }

    fn stalled_coordinator(
        root: &Path,
        config: IdeConfig,
    ) -> (
        Arc<SessionCoordinator<GatedSandbox>>,
        Arc<Notify>,
        std::sync::mpsc::Sender<()>,
    ) {
        let (release, released) = std::sync::mpsc::channel();
        let entered = Arc::new(Notify::new());
        let seal = StallingSeal {
            entered: entered.clone(),
            release: Mutex::new(released),
        };
        let pipeline = CompilationPipeline::new(config.pipeline.clone())
            .expect("pipeline")
            .with_quantum_scheme(Arc::new(seal));
        let coordinator = SessionCoordinator::new(config, root, GatedSandbox::default())
            .expect("coordinator")
            .with_pipeline(pipeline);
        (Arc::new(coordinator), entered, release)
    }

    fn sealed_compile() -> CompileParams {
        CompileParams {
            quantum_safety: Some(true),
            ..compile_params("counter.usdtg", CompilationMode::Debug)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn terminate_cancels_an_inflight_compile() {
        let dir = project();
        let (coordinator, entered, release) = stalled_coordinator(dir.path(), IdeConfig::default());

        let compiling = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.compile(sealed_compile()).await }
        });
        entered.notified().await;
        assert_eq!(coordinator.state(), SessionState::Compiling);

        let outcome = coordinator.terminate();
        assert_eq!(outcome.state, SessionState::Compiling);
        assert!(outcome.cancelled_compile);
        assert!(!outcome.killed_process);
        release.send(()).expect("release");

        let compiled = compiling.await.expect("join").expect("compile outcome");
        assert!(!compiled.result.success());
        assert!(compiled.result.was_cancelled());
        assert_eq!(compiled.error_kind, Some(ErrorKind::Cancelled));
        assert!(compiled.artifacts.is_none());
        assert!(!dir.path().join("build/counter.wasm").exists());
        assert_eq!(coordinator.state(), SessionState::Idle);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn compile_ceiling_cancels_and_reports_timeout() {
        let dir = project();
        let config = IdeConfig {
            compile_timeout_ms: 50,
            ..IdeConfig::default()
        };
        let (coordinator, entered, release) = stalled_coordinator(dir.path(), config);

        let compiling = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.compile(sealed_compile()).await }
        });
        entered.notified().await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        // Past the ceiling, but the worker has not reached a stage boundary.
        assert_eq!(coordinator.state(), SessionState::Compiling);
        release.send(()).expect("release");

        let err = compiling.await.expect("join").expect_err("ceiling exceeded");
        assert!(matches!(err, IdeError::CompileTimeout(ceiling) if ceiling == Duration::from_millis(50)));
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(!dir.path().join("build/counter.wasm").exists());
        assert_eq!(coordinator.state(), SessionState::Idle);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn requests_while_running_are_busy() {
        let dir = project();
        let (coordinator, gate) = coordinator(dir.path());

        let running = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.run(run_params("counter.usdtg")).await }
        });
        gate.started.notified().await;
        assert_eq!(coordinator.state(), SessionState::Running);
        assert_eq!(coordinator.session().active_file().as_deref(), Some("counter.usdtg"));

        let busy = coordinator
            .compile(compile_params("counter.usdtg", CompilationMode::Debug))
            .await
            .unwrap_err();
        assert!(matches!(busy, IdeError::Busy(SessionState::Running)));
        assert!(matches!(
            coordinator.run(run_params("counter.usdtg")).await,
            Err(IdeError::Busy(_))
        ));
        assert!(matches!(
            coordinator
                .terminal(TerminalParams { command: "ls".into(), timeout_ms: None })
                .await,
            Err(IdeError::Busy(_))
        ));
        // File operations stay available.
        assert_eq!(coordinator.list_files().await.expect("list").len(), 1);

        gate.release.notify_one();
        let output = running.await.expect("join").expect("run");
        assert!(output.stdout.ends_with("counter.usdtg --entry bump"));
        assert_eq!(coordinator.state(), SessionState::Idle);
        assert_eq!(gate.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn run_while_compiling_is_busy() {
        let dir = project();
        let (coordinator, gate) = coordinator(dir.path());

        let compiling = coordinator
            .session()
            .try_begin(Activity::Compile, Some("counter.usdtg"))
            .expect("begin");
        let err = coordinator.run(run_params("counter.usdtg")).await.unwrap_err();
        assert!(matches!(err, IdeError::Busy(SessionState::Compiling)));
        assert_eq!(gate.running.load(Ordering::SeqCst), 0);
        drop(compiling);

        gate.release.notify_one();
        coordinator.run(run_params("counter.usdtg")).await.expect("run");
        assert_eq!(gate.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn compile_persists_artifacts_for_debug_and_release_only() {
        let dir = project();
        let (coordinator, _gate) = coordinator(dir.path());

        let outcome = coordinator
            .compile(compile_params("counter.usdtg", CompilationMode::Release))
            .await
            .expect("compile");
        assert!(outcome.result.success(), "{:?}", outcome.result.errors());
        assert_eq!(outcome.error_kind, None);
        let artifacts = outcome.artifacts.expect("artifacts");
        assert_eq!(artifacts.wasm, "build/counter.wasm");
        let wasm = std::fs::read(dir.path().join(&artifacts.wasm)).expect("wasm");
        assert_eq!(wasm, outcome.result.bytecode());
        let abi: serde_json::Value =
            serde_json::from_slice(&std::fs::read(dir.path().join(&artifacts.abi)).expect("abi"))
                .expect("json");
        assert_eq!(abi[0]["name"], "bump");

        std::fs::remove_dir_all(dir.path().join("build")).expect("clean");
        for mode in [CompilationMode::Test, CompilationMode::Simulation] {
            let outcome = coordinator
                .compile(compile_params("counter.usdtg", mode))
                .await
                .expect("compile");
            assert!(outcome.result.success());
            assert!(outcome.artifacts.is_none());
        }
        assert!(!dir.path().join("build").exists());
        assert_eq!(coordinator.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn failed_compile_reports_kind_without_artifacts() {
        let dir = project();
        std::fs::write(dir.path().join("broken.usdtg"), "contract Broken {").expect("write");
        let (coordinator, _gate) = coordinator(dir.path());

        let outcome = coordinator
            .compile(compile_params("broken.usdtg", CompilationMode::Debug))
            .await
            .expect("compile");
        assert!(!outcome.result.success());
        assert_eq!(outcome.error_kind, Some(ErrorKind::Syntax));
        assert!(outcome.artifacts.is_none());

        let missing = coordinator
            .handle(Request::Compile(compile_params("absent.usdtg", CompilationMode::Debug)))
            .await;
        let EventBody::Error(payload) = missing else {
            panic!("expected an error event, got {missing:?}");
        };
        assert_eq!(payload.kind, ErrorKind::NotFound);
        assert_eq!(coordinator.state(), SessionState::Idle);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn terminate_kills_the_running_process() {
        let dir = project();
        let (coordinator, gate) = coordinator(dir.path());

        let debugging = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.debug(run_params("counter.usdtg")).await }
        });
        gate.started.notified().await;
        assert_eq!(coordinator.state(), SessionState::Debugging);

        let outcome = coordinator.terminate();
        assert_eq!(outcome.state, SessionState::Debugging);
        assert!(outcome.killed_process);
        assert!(!outcome.cancelled_compile);

        let err = debugging.await.expect("join").unwrap_err();
        assert!(matches!(err, IdeError::Killed(_)));
        assert_eq!(coordinator.state(), SessionState::Idle);

        let idle = coordinator.terminate();
        assert!(!idle.killed_process);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_is_final() {
        let dir = project();
        let (coordinator, gate) = coordinator(dir.path());

        let running = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.run(run_params("counter.usdtg")).await }
        });
        gate.started.notified().await;

        let outcome = coordinator.shutdown();
        assert_eq!(outcome.state, SessionState::Terminated);
        assert!(outcome.killed_process);
        assert!(matches!(running.await.expect("join"), Err(IdeError::Killed(_))));

        assert_eq!(coordinator.state(), SessionState::Terminated);
        assert!(matches!(
            coordinator
                .compile(compile_params("counter.usdtg", CompilationMode::Debug))
                .await,
            Err(IdeError::Terminated)
        ));
        assert!(matches!(
            coordinator
                .save_file(SaveFileParams {
                    path: "x.usdtg".into(),
                    content: String::new(),
                    base_version: None,
                })
                .await,
            Err(IdeError::Terminated)
        ));
    }

    #[tokio::test]
    async fn terminal_commands_run_in_the_project() {
        let dir = project();
        let coordinator =
            SessionCoordinator::with_os_sandbox(IdeConfig::default(), dir.path()).expect("coordinator");
        let output = coordinator
            .terminal(TerminalParams {
                command: "ls; echo oops >&2".into(),
                timeout_ms: None,
            })
            .await
            .expect("terminal");
        assert_eq!(output.stdout, "counter.usdtg\n");
        assert_eq!(output.stderr, "oops\n");
        assert_eq!(output.exit_code, Some(0));

        let err = coordinator
            .terminal(TerminalParams {
                command: "sleep 5".into(),
                timeout_ms: Some(100),
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(coordinator.state(), SessionState::Idle);
    }
}
