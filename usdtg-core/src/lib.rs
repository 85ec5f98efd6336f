//! Compiler core for USDTgScript contracts.
//!
//! The pipeline is:
//!
//!   source .usdtg
//!     -> lexer     (tokens)
//!     -> parser    (AST)
//!     -> semantic  (types, scopes, HIR)
//!     -> security  (pattern findings over HIR)
//!     -> optimize  (HIR rewrites, level 0..=3)
//!     -> codegen   (wasm-encoder) + gas estimate (wasmparser)
//!
//! The IDE service and the CLI depend on this crate rather than
//! reimplementing the pipeline.

// ---------------------------------------------------------------------
// Error handling and diagnostics
// ---------------------------------------------------------------------

pub mod span;
pub mod diagnostic;
pub mod error;

// ---------------------------------------------------------------------
// Front-end: lexing and parsing
// ---------------------------------------------------------------------

pub mod lexer;
pub mod parser;
pub mod ast;

// ---------------------------------------------------------------------
// Semantic layers: types, builtins, checking, HIR
// ---------------------------------------------------------------------

pub mod types;
pub mod builtins;
pub mod hir;
pub mod semantic;

// ---------------------------------------------------------------------
// Analysis and optimization over HIR
// ---------------------------------------------------------------------

pub mod security;
pub mod optimize;

// ---------------------------------------------------------------------
// Back-end: code generation, ABI, gas and sealing
// ---------------------------------------------------------------------

pub mod codegen;
pub mod abi;
pub mod gas;
pub mod quantum;

// ---------------------------------------------------------------------
// Orchestration
// ---------------------------------------------------------------------

pub mod pipeline;
pub mod project;

// ---------------------------------------------------------------------
// Public API re-exports
// ---------------------------------------------------------------------

pub use abi::AbiEntry;
pub use diagnostic::{Diagnostic, Severity, Stage};
pub use error::CoreError;
pub use gas::{GasEstimator, GasSchedule};
pub use pipeline::{
    Cancellation, CompilationMode, CompilationPipeline, CompilationRequest, CompilationResult,
    PipelineConfig,
};
pub use project::{ProjectFileResult, compile_project};
pub use quantum::{DigestSeal, QuantumSafeScheme};
pub use security::{Finding, FindingSeverity, SecurityAnalyzer, SecurityRule};
pub use span::Span;
