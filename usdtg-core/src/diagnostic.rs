//! Diagnostics produced by the pipeline stages.
//!
//! Every stage reports problems as [`Diagnostic`] values instead of
//! returning `Err`, so one compilation can carry syntax, semantic and
//! security messages side by side in source order.

use std::fmt;

use serde::Serialize;

use crate::span::Span;

/// Pipeline stage a diagnostic originates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Stage {
    /// Input admission (size bound, I/O) before the syntax stage.
    Input,
    Syntax,
    Semantic,
    Security,
    Optimization,
    Codegen,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Input => "input",
            Stage::Syntax => "syntax",
            Stage::Semantic => "semantic",
            Stage::Security => "security",
            Stage::Optimization => "optimization",
            Stage::Codegen => "codegen",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostic {
    pub stage: Stage,
    pub severity: Severity,
    /// Stable machine-readable code, e.g. `E0101`.
    pub code: &'static str,
    pub message: String,
    pub span: Span,
}

impl Diagnostic {
    pub fn error(stage: Stage, code: &'static str, message: impl Into<String>, span: Span) -> Self {
        Diagnostic {
            stage,
            severity: Severity::Error,
            code,
            message: message.into(),
            span,
        }
    }

    pub fn warning(
        stage: Stage,
        code: &'static str,
        message: impl Into<String>,
        span: Span,
    ) -> Self {
        Diagnostic {
            stage,
            severity: Severity::Warning,
            code,
            message: message.into(),
            span,
        }
    }

    pub fn info(stage: Stage, code: &'static str, message: impl Into<String>, span: Span) -> Self {
        Diagnostic {
            stage,
            severity: Severity::Info,
            code,
            message: message.into(),
            span,
        }
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.severity {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        write!(
            f,
            "{level}[{}] {} ({} stage, bytes {}..{})",
            self.code, self.message, self.stage, self.span.start, self.span.end
        )
    }
}
