//! Staged compilation pipeline.
//!
//! `syntax -> semantic -> security -> optimization -> codegen + gas`.
//! Stage failures are collected as diagnostics in the returned
//! [`CompilationResult`]; only an invalid configuration is an `Err`.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize, Serializer};
use wasm_encoder::CustomSection;

use crate::abi::{AbiEntry, build_abi};
use crate::codegen::{CodegenOptions, generate};
use crate::diagnostic::{Diagnostic, Severity, Stage};
use crate::error::CoreError;
use crate::gas::GasEstimator;
use crate::optimize::{OptimizeOptions, optimize};
use crate::parser::parse;
use crate::quantum::{DigestSeal, QUANTUM_SECTION, QuantumSafeScheme, encode_seal};
use crate::security::SecurityAnalyzer;
use crate::semantic;
use crate::span::Span;

pub const MAX_OPTIMIZATION_LEVEL: u8 = 3;
pub const DEFAULT_MAX_SOURCE_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CompilationMode {
    /// Keeps symbol names, never optimizes.
    Debug,
    /// Optimizes at the configured level; critical findings fail the build.
    Release,
    /// Full pipeline, artifacts are never persisted.
    Test,
    /// Only the gas estimate is reported.
    Simulation,
}

impl CompilationMode {
    pub fn optimizes(self) -> bool {
        self != CompilationMode::Debug
    }

    pub fn keeps_symbols(self) -> bool {
        self == CompilationMode::Debug
    }

    pub fn fails_on_critical(self) -> bool {
        self == CompilationMode::Release
    }

    /// Whether a successful compile in this mode is written to disk.
    pub fn persists_artifacts(self) -> bool {
        matches!(self, CompilationMode::Debug | CompilationMode::Release)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CompilationMode::Debug => "debug",
            CompilationMode::Release => "release",
            CompilationMode::Test => "test",
            CompilationMode::Simulation => "simulation",
        }
    }
}

impl fmt::Display for CompilationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CompilationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(CompilationMode::Debug),
            "release" => Ok(CompilationMode::Release),
            "test" => Ok(CompilationMode::Test),
            "simulation" => Ok(CompilationMode::Simulation),
            other => Err(format!(
                "unknown compilation mode `{other}` (expected debug, release, test or simulation)"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineConfig {
    pub optimization_level: u8,
    pub quantum_safety: bool,
    pub gas_optimization: bool,
    /// Sources larger than this are rejected before the syntax stage.
    pub max_source_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            optimization_level: 2,
            quantum_safety: false,
            gas_optimization: false,
            max_source_size: DEFAULT_MAX_SOURCE_SIZE,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.optimization_level > MAX_OPTIMIZATION_LEVEL {
            return Err(CoreError::InvalidOptimizationLevel(self.optimization_level));
        }
        if self.max_source_size == 0 {
            return Err(CoreError::InvalidConfig(
                "max_source_size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// One compilation. Unset options fall back to the pipeline configuration
/// in effect when the compile starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilationRequest {
    pub source: String,
    pub mode: CompilationMode,
    pub optimization_level: Option<u8>,
    pub quantum_safety: Option<bool>,
    pub gas_optimization: Option<bool>,
}

impl CompilationRequest {
    pub fn new(source: impl Into<String>, mode: CompilationMode) -> Self {
        CompilationRequest {
            source: source.into(),
            mode,
            optimization_level: None,
            quantum_safety: None,
            gas_optimization: None,
        }
    }

    pub fn with_optimization_level(mut self, level: u8) -> Self {
        self.optimization_level = Some(level);
        self
    }

    pub fn with_quantum_safety(mut self, enabled: bool) -> Self {
        self.quantum_safety = Some(enabled);
        self
    }

    pub fn with_gas_optimization(mut self, enabled: bool) -> Self {
        self.gas_optimization = Some(enabled);
        self
    }
}

/// Outcome of one compilation. Fields are read-only; a failed result
/// never carries bytecode or an ABI.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompilationResult {
    success: bool,
    #[serde(serialize_with = "hex_bytes")]
    bytecode: Vec<u8>,
    abi: Vec<AbiEntry>,
    warnings: Vec<Diagnostic>,
    errors: Vec<Diagnostic>,
    gas_estimate: u64,
    optimization_level: u8,
    mode: CompilationMode,
    #[serde(rename = "durationMs", serialize_with = "duration_ms")]
    duration: Duration,
}

impl CompilationResult {
    pub(crate) fn failure(
        mode: CompilationMode,
        optimization_level: u8,
        warnings: Vec<Diagnostic>,
        errors: Vec<Diagnostic>,
        duration: Duration,
    ) -> Self {
        CompilationResult {
            success: false,
            bytecode: Vec::new(),
            abi: Vec::new(),
            warnings,
            errors,
            gas_estimate: 0,
            optimization_level,
            mode,
            duration,
        }
    }

    pub fn success(&self) -> bool {
        self.success
    }

    pub fn bytecode(&self) -> &[u8] {
        &self.bytecode
    }

    pub fn abi(&self) -> &[AbiEntry] {
        &self.abi
    }

    pub fn warnings(&self) -> &[Diagnostic] {
        &self.warnings
    }

    pub fn errors(&self) -> &[Diagnostic] {
        &self.errors
    }

    /// Zero unless the compile succeeded.
    pub fn gas_estimate(&self) -> u64 {
        self.gas_estimate
    }

    pub fn optimization_level(&self) -> u8 {
        self.optimization_level
    }

    pub fn mode(&self) -> CompilationMode {
        self.mode
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Stage of the first error, if any.
    pub fn failed_stage(&self) -> Option<Stage> {
        self.errors.first().map(|d| d.stage)
    }

    pub fn was_cancelled(&self) -> bool {
        self.errors.iter().any(|d| d.code == CANCELLED)
    }

    pub fn exceeded_size_limit(&self) -> bool {
        self.errors.iter().any(|d| d.code == OVERSIZE)
    }
}

fn hex_bytes<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    serializer.serialize_str(&out)
}

fn duration_ms<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_millis() as u64)
}

const OVERSIZE: &str = "E0001";
const CANCELLED: &str = "E0002";

/// Cooperative cancellation flag, checked between stages.
#[derive(Debug, Clone, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    pub fn new() -> Self {
        Cancellation::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct CompilationPipeline {
    config: RwLock<PipelineConfig>,
    security: SecurityAnalyzer,
    gas: GasEstimator,
    quantum: Arc<dyn QuantumSafeScheme>,
}

impl fmt::Debug for CompilationPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompilationPipeline")
            .field("config", &self.config())
            .field("quantum", &self.quantum.name())
            .finish_non_exhaustive()
    }
}

impl CompilationPipeline {
    pub fn new(config: PipelineConfig) -> Result<Self, CoreError> {
        config.validate()?;
        Ok(CompilationPipeline {
            config: RwLock::new(config),
            security: SecurityAnalyzer::default(),
            gas: GasEstimator::default(),
            quantum: Arc::new(DigestSeal),
        })
    }

    pub fn with_security_analyzer(mut self, analyzer: SecurityAnalyzer) -> Self {
        self.security = analyzer;
        self
    }

    pub fn with_gas_estimator(mut self, estimator: GasEstimator) -> Self {
        self.gas = estimator;
        self
    }

    pub fn with_quantum_scheme(mut self, scheme: Arc<dyn QuantumSafeScheme>) -> Self {
        self.quantum = scheme;
        self
    }

    /// Snapshot of the current configuration.
    pub fn config(&self) -> PipelineConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_optimization_level(&self, level: u8) -> Result<(), CoreError> {
        if level > MAX_OPTIMIZATION_LEVEL {
            return Err(CoreError::InvalidOptimizationLevel(level));
        }
        self.update(|config| config.optimization_level = level);
        Ok(())
    }

    pub fn set_quantum_safety(&self, enabled: bool) {
        self.update(|config| config.quantum_safety = enabled);
    }

    pub fn set_gas_optimization(&self, enabled: bool) {
        self.update(|config| config.gas_optimization = enabled);
    }

    fn update(&self, apply: impl FnOnce(&mut PipelineConfig)) {
        let mut config = self.config.write().unwrap_or_else(PoisonError::into_inner);
        apply(&mut config);
    }

    pub fn compile_source(
        &self,
        source: &str,
        mode: CompilationMode,
    ) -> Result<CompilationResult, CoreError> {
        self.compile(&CompilationRequest::new(source, mode))
    }

    pub fn compile(&self, request: &CompilationRequest) -> Result<CompilationResult, CoreError> {
        self.compile_with_cancellation(request, &Cancellation::new())
    }

    pub fn compile_with_cancellation(
        &self,
        request: &CompilationRequest,
        cancellation: &Cancellation,
    ) -> Result<CompilationResult, CoreError> {
        // Settings are fixed for the whole run; later setter calls do not apply.
        let mut config = self.config();
        if let Some(level) = request.optimization_level {
            config.optimization_level = level;
        }
        if let Some(enabled) = request.quantum_safety {
            config.quantum_safety = enabled;
        }
        if let Some(enabled) = request.gas_optimization {
            config.gas_optimization = enabled;
        }
        config.validate()?;

        let run = Run {
            mode: request.mode,
            level: if request.mode.optimizes() {
                config.optimization_level
            } else {
                0
            },
            started: Instant::now(),
            warnings: Vec::new(),
            errors: Vec::new(),
        };
        // An early exit carries the failed result.
        let (Ok(result) | Err(result)) = self.run_stages(run, request, &config, cancellation);
        Ok(result)
    }

    fn run_stages(
        &self,
        mut run: Run,
        request: &CompilationRequest,
        config: &PipelineConfig,
        cancellation: &Cancellation,
    ) -> Result<CompilationResult, CompilationResult> {
        if request.source.len() > config.max_source_size {
            log::warn!(
                "rejecting {} byte source (limit {})",
                request.source.len(),
                config.max_source_size
            );
            run.errors.push(Diagnostic::error(
                Stage::Input,
                OVERSIZE,
                format!(
                    "source is {} bytes, exceeding the {} byte limit",
                    request.source.len(),
                    config.max_source_size
                ),
                Span::default(),
            ));
            return Err(run.fail());
        }

        // -----------------------------------------------------------------
        // Syntax
        // -----------------------------------------------------------------
        run.checkpoint(cancellation, Stage::Syntax)?;
        let parsed = parse(&request.source);
        let Some(ast) = parsed.contract else {
            log::debug!("syntax stage failed with {} error(s)", parsed.diagnostics.len());
            run.errors.extend(parsed.diagnostics);
            return Err(run.fail());
        };

        // -----------------------------------------------------------------
        // Semantic
        // -----------------------------------------------------------------
        run.checkpoint(cancellation, Stage::Semantic)?;
        let lowered = semantic::analyze(&ast);
        log::debug!(
            "semantic stage for `{}`: {} diagnostic(s)",
            lowered.contract.name,
            lowered.diagnostics.len()
        );
        run.absorb(lowered.diagnostics);
        let mut contract = lowered.contract;

        // -----------------------------------------------------------------
        // Security (always runs, even after semantic errors)
        // -----------------------------------------------------------------
        run.checkpoint(cancellation, Stage::Security)?;
        let findings = self.security.analyze(&contract);
        log::debug!("security stage: {} finding(s)", findings.len());
        run.absorb(
            findings
                .iter()
                .map(|finding| finding.to_diagnostic(request.mode.fails_on_critical())),
        );
        if !run.errors.is_empty() {
            return Err(run.fail());
        }

        // -----------------------------------------------------------------
        // Optimization
        // -----------------------------------------------------------------
        run.checkpoint(cancellation, Stage::Optimization)?;
        if request.mode.optimizes() {
            let report = optimize(
                &mut contract,
                OptimizeOptions {
                    level: run.level,
                    strength_reduction: config.gas_optimization,
                },
            );
            log::debug!("optimization level {}: {report:?}", run.level);
            if report.total() > 0 {
                run.warnings.push(Diagnostic::info(
                    Stage::Optimization,
                    "O0001",
                    format!(
                        "applied {} rewrite(s): {} folded, {} simplified, {} removed, {} strength-reduced",
                        report.total(),
                        report.folded,
                        report.simplified,
                        report.removed_statements,
                        report.strength_reduced
                    ),
                    contract.span,
                ));
            }
        }

        // -----------------------------------------------------------------
        // Codegen + gas
        // -----------------------------------------------------------------
        run.checkpoint(cancellation, Stage::Codegen)?;
        let mut module = generate(
            &contract,
            CodegenOptions {
                debug_names: request.mode.keeps_symbols(),
            },
        );
        if config.quantum_safety {
            let payload = encode_seal(self.quantum.as_ref(), module.as_slice());
            module.section(&CustomSection {
                name: QUANTUM_SECTION.into(),
                data: payload.into(),
            });
        }
        let bytecode = module.finish();
        // Sealing can be slow; honor a cancellation that arrived meanwhile.
        run.checkpoint(cancellation, Stage::Codegen)?;

        if let Err(err) = wasmparser::validate(&bytecode) {
            log::error!("generated module for `{}` is invalid: {err}", contract.name);
            run.errors.push(Diagnostic::error(
                Stage::Codegen,
                "E0401",
                format!("generated module failed validation: {err}"),
                contract.span,
            ));
            return Err(run.fail());
        }
        let gas_estimate = match self.gas.estimate(&bytecode) {
            Ok(gas) => gas,
            Err(err) => {
                run.errors.push(Diagnostic::error(
                    Stage::Codegen,
                    "E0402",
                    format!("gas estimation failed: {err}"),
                    contract.span,
                ));
                return Err(run.fail());
            }
        };

        let (bytecode, abi) = if request.mode == CompilationMode::Simulation {
            (Vec::new(), Vec::new())
        } else {
            (bytecode, build_abi(&contract))
        };
        log::debug!(
            "compiled `{}` in {} mode: {} bytes, gas {gas_estimate}",
            contract.name,
            request.mode,
            bytecode.len()
        );

        Ok(CompilationResult {
            success: true,
            bytecode,
            abi,
            warnings: run.warnings,
            errors: Vec::new(),
            gas_estimate,
            optimization_level: run.level,
            mode: request.mode,
            duration: run.started.elapsed(),
        })
    }
}

/// Accumulated state of one compile.
struct Run {
    mode: CompilationMode,
    level: u8,
    started: Instant,
    warnings: Vec<Diagnostic>,
    errors: Vec<Diagnostic>,
}

impl Run {
    fn absorb(&mut self, diagnostics: impl IntoIterator<Item = Diagnostic>) {
        for diagnostic in diagnostics {
            if diagnostic.severity == Severity::Error {
                self.errors.push(diagnostic);
            } else {
                self.warnings.push(diagnostic);
            }
        }
    }

    fn checkpoint(
        &mut self,
        cancellation: &Cancellation,
        next: Stage,
    ) -> Result<(), CompilationResult> {
        if !cancellation.is_cancelled() {
            return Ok(());
        }
        log::info!("compilation cancelled at the {next} stage");
        self.errors.push(Diagnostic::error(
            next,
            CANCELLED,
            format!("compilation cancelled at the {next} stage"),
            Span::default(),
        ));
        Err(self.take_failure())
    }

    fn take_failure(&mut self) -> CompilationResult {
        CompilationResult::failure(
            self.mode,
            self.level,
            std::mem::take(&mut self.warnings),
            std::mem::take(&mut self.errors),
            self.started.elapsed(),
        )
    }

    fn fail(mut self) -> CompilationResult {
        self.take_failure()
    }
}
