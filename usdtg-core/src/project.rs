//! Project-wide compilation: every `.usdtg` file under a directory.

use std::path::{Path, PathBuf};
use std::time::Duration;

use walkdir::WalkDir;

use crate::diagnostic::{Diagnostic, Stage};
use crate::error::CoreError;
use crate::pipeline::{CompilationMode, CompilationPipeline, CompilationRequest, CompilationResult};
use crate::span::Span;

pub const SOURCE_EXTENSION: &str = "usdtg";

#[derive(Debug, Clone)]
pub struct ProjectFileResult {
    /// Path relative to the project root.
    pub path: PathBuf,
    pub result: CompilationResult,
}

/// Source files under `root`, relative to it, in lexicographic order.
/// Hidden entries are skipped.
pub fn source_files(root: &Path) -> Result<Vec<PathBuf>, CoreError> {
    let mut files = Vec::new();
    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_hidden(entry.file_name()));
    for entry in walker {
        let entry = entry.map_err(|err| CoreError::ProjectWalk {
            path: err
                .path()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| root.to_path_buf()),
            message: err.to_string(),
        })?;
        if !entry.file_type().is_file()
            || entry.path().extension().and_then(|ext| ext.to_str()) != Some(SOURCE_EXTENSION)
        {
            continue;
        }
        if let Ok(relative) = entry.path().strip_prefix(root) {
            files.push(relative.to_path_buf());
        }
    }
    files.sort();
    Ok(files)
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_str().is_some_and(|name| name.starts_with('.'))
}

/// Compile every source file independently. One file failing, even one
/// that cannot be read, never stops the others. The whole batch uses the
/// pipeline settings in effect when it starts.
pub fn compile_project(
    pipeline: &CompilationPipeline,
    root: &Path,
    mode: CompilationMode,
) -> Result<Vec<ProjectFileResult>, CoreError> {
    let files = source_files(root)?;
    log::info!("compiling {} file(s) under {}", files.len(), root.display());

    let config = pipeline.config();
    let level = if mode.optimizes() {
        config.optimization_level
    } else {
        0
    };
    let mut results = Vec::with_capacity(files.len());
    for path in files {
        let result = match std::fs::read_to_string(root.join(&path)) {
            Ok(source) => pipeline.compile(
                &CompilationRequest::new(source, mode)
                    .with_optimization_level(config.optimization_level)
                    .with_quantum_safety(config.quantum_safety)
                    .with_gas_optimization(config.gas_optimization),
            )?,
            Err(err) => {
                log::warn!("cannot read {}: {err}", path.display());
                CompilationResult::failure(
                    mode,
                    level,
                    Vec::new(),
                    vec![Diagnostic::error(
                        Stage::Input,
                        "E0003",
                        format!("cannot read {}: {err}", path.display()),
                        Span::default(),
                    )],
                    Duration::ZERO,
                )
            }
        };
        results.push(ProjectFileResult { path, result });
    }
    Ok(results)
}
