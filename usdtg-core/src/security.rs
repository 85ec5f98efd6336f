//! Pattern-based static security analysis.
//!
//! Rules are data: each [`SecurityRule`] pairs a structural [`Pattern`]
//! over the HIR with a severity and message. The analyzer never looks
//! at raw source text, so `selfdestruct` inside a comment or an
//! identifier like `my_selfdestruct_flag` is never flagged.

use serde::Serialize;

use crate::builtins::BuiltinKind;
use crate::diagnostic::{Diagnostic, Severity, Stage};
use crate::hir::{HirContract, HirExpr, HirExprKind, HirFunction, HirStmt, HirStmtKind};
use crate::parser::parse;
use crate::semantic;
use crate::span::Span;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FindingSeverity {
    Info,
    Warning,
    Critical,
}

/// Structural pattern matched against a contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pattern {
    /// Any call of the given builtin.
    BuiltinCall(BuiltinKind),
    /// A storage write that follows an external call in the same function.
    StorageWriteAfterExternalCall,
    /// A `while` loop whose condition is the literal `true`.
    UnboundedLoop,
    /// A public function that writes storage and never calls `require`.
    UncheckedPublicWrite,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityRule {
    pub code: &'static str,
    pub pattern: Pattern,
    pub severity: FindingSeverity,
    pub message: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Finding {
    pub code: &'static str,
    pub severity: FindingSeverity,
    pub message: String,
    pub function: String,
    pub span: Span,
}

impl Finding {
    /// Critical findings become errors only when `fail_on_critical` is set;
    /// otherwise every finding is reported without failing the build.
    pub fn to_diagnostic(&self, fail_on_critical: bool) -> Diagnostic {
        let severity = match self.severity {
            FindingSeverity::Info => Severity::Info,
            FindingSeverity::Warning => Severity::Warning,
            FindingSeverity::Critical if fail_on_critical => Severity::Error,
            FindingSeverity::Critical => Severity::Warning,
        };
        let prefix = if self.severity == FindingSeverity::Critical {
            "critical: "
        } else {
            ""
        };
        Diagnostic {
            stage: Stage::Security,
            severity,
            code: self.code,
            message: format!("{prefix}{} (in `{}`)", self.message, self.function),
            span: self.span,
        }
    }
}

pub fn default_rules() -> Vec<SecurityRule> {
    vec![
        SecurityRule {
            code: "S001",
            pattern: Pattern::BuiltinCall(BuiltinKind::SelfDestruct),
            severity: FindingSeverity::Critical,
            message: "selfdestruct permanently destroys the contract",
        },
        SecurityRule {
            code: "S002",
            pattern: Pattern::BuiltinCall(BuiltinKind::DelegateCall),
            severity: FindingSeverity::Critical,
            message: "delegatecall executes foreign code against this contract's storage",
        },
        SecurityRule {
            code: "S003",
            pattern: Pattern::BuiltinCall(BuiltinKind::TxOrigin),
            severity: FindingSeverity::Critical,
            message: "tx_origin must not be used for authorization",
        },
        SecurityRule {
            code: "S004",
            pattern: Pattern::StorageWriteAfterExternalCall,
            severity: FindingSeverity::Warning,
            message: "storage is written after an external call (reentrancy)",
        },
        SecurityRule {
            code: "S005",
            pattern: Pattern::UnboundedLoop,
            severity: FindingSeverity::Warning,
            message: "unbounded loop may exhaust gas",
        },
        SecurityRule {
            code: "S006",
            pattern: Pattern::BuiltinCall(BuiltinKind::Ecrecover),
            severity: FindingSeverity::Warning,
            message: "ecrecover relies on a signature scheme that is not quantum-safe",
        },
        SecurityRule {
            code: "S007",
            pattern: Pattern::UncheckedPublicWrite,
            severity: FindingSeverity::Warning,
            message: "public function modifies storage without any require check",
        },
        SecurityRule {
            code: "S008",
            pattern: Pattern::BuiltinCall(BuiltinKind::Timestamp),
            severity: FindingSeverity::Info,
            message: "block timestamp can be influenced by validators",
        },
    ]
}

#[derive(Debug, Clone)]
pub struct SecurityAnalyzer {
    rules: Vec<SecurityRule>,
}

impl Default for SecurityAnalyzer {
    fn default() -> Self {
        SecurityAnalyzer::new(default_rules())
    }
}

enum Event {
    Builtin(BuiltinKind),
    StorageWrite { after_external_call: bool },
    UnboundedLoop,
}

struct FunctionScan {
    events: Vec<(Event, Span)>,
    external_call_seen: bool,
    has_require: bool,
    first_write: Option<Span>,
}

impl SecurityAnalyzer {
    pub fn new(rules: Vec<SecurityRule>) -> Self {
        SecurityAnalyzer { rules }
    }

    pub fn rules(&self) -> &[SecurityRule] {
        &self.rules
    }

    /// Parse, lower and analyze `source`. Sources that fail to parse
    /// have no structure to inspect and yield no findings.
    pub fn analyze_source(&self, source: &str) -> Vec<Finding> {
        match parse(source).contract {
            Some(contract) => self.analyze(&semantic::analyze(&contract).contract),
            None => Vec::new(),
        }
    }

    /// Findings ordered by source position, then by rule order.
    pub fn analyze(&self, contract: &HirContract) -> Vec<Finding> {
        let mut findings: Vec<(usize, Finding)> = Vec::new();
        for function in &contract.functions {
            let mut scan = FunctionScan {
                events: Vec::new(),
                external_call_seen: false,
                has_require: false,
                first_write: None,
            };
            scan_block(&function.body, &mut scan);

            for (event, span) in &scan.events {
                for (index, rule) in self.rules.iter().enumerate() {
                    let hit = match (rule.pattern, event) {
                        (Pattern::BuiltinCall(kind), Event::Builtin(called)) => kind == *called,
                        (
                            Pattern::StorageWriteAfterExternalCall,
                            Event::StorageWrite {
                                after_external_call,
                            },
                        ) => *after_external_call,
                        (Pattern::UnboundedLoop, Event::UnboundedLoop) => true,
                        _ => false,
                    };
                    if hit {
                        findings.push((index, finding(rule, function, *span)));
                    }
                }
            }

            if let Some(span) = scan.first_write {
                if function.public && !scan.has_require {
                    for (index, rule) in self.rules.iter().enumerate() {
                        if rule.pattern == Pattern::UncheckedPublicWrite {
                            findings.push((index, finding(rule, function, span)));
                        }
                    }
                }
            }
        }

        findings.sort_by_key(|(index, finding)| (finding.span.start, *index));
        findings.into_iter().map(|(_, finding)| finding).collect()
    }
}

fn finding(rule: &SecurityRule, function: &HirFunction, span: Span) -> Finding {
    Finding {
        code: rule.code,
        severity: rule.severity,
        message: rule.message.to_string(),
        function: function.name.clone(),
        span,
    }
}

fn scan_block(stmts: &[HirStmt], scan: &mut FunctionScan) {
    for stmt in stmts {
        match &stmt.kind {
            HirStmtKind::Let { value, .. }
            | HirStmtKind::AssignLocal { value, .. }
            | HirStmtKind::Expr(value) => scan_expr(value, scan),
            HirStmtKind::AssignStorage { value, .. } => {
                scan_expr(value, scan);
                scan.first_write.get_or_insert(stmt.span);
                scan.events.push((
                    Event::StorageWrite {
                        after_external_call: scan.external_call_seen,
                    },
                    stmt.span,
                ));
            }
            HirStmtKind::Return(value) => {
                if let Some(value) = value {
                    scan_expr(value, scan);
                }
            }
            HirStmtKind::Require(cond) => {
                scan.has_require = true;
                scan_expr(cond, scan);
            }
            HirStmtKind::If {
                cond,
                then_body,
                else_body,
            } => {
                scan_expr(cond, scan);
                scan_block(then_body, scan);
                scan_block(else_body, scan);
            }
            HirStmtKind::While { cond, body } => {
                if matches!(cond.kind, HirExprKind::Bool(true)) {
                    scan.events.push((Event::UnboundedLoop, stmt.span));
                }
                scan_expr(cond, scan);
                scan_block(body, scan);
            }
        }
    }
}

fn scan_expr(expr: &HirExpr, scan: &mut FunctionScan) {
    expr.walk(&mut |node| {
        if let HirExprKind::Builtin { kind, .. } = &node.kind {
            scan.events.push((Event::Builtin(*kind), node.span));
            if kind.is_external_call() {
                scan.external_call_seen = true;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codes(source: &str) -> Vec<&'static str> {
        SecurityAnalyzer::default()
            .analyze_source(source)
            .iter()
            .map(|f| f.code)
            .collect()
    }

    #[test]
    fn flags_critical_builtins() {
        let findings = SecurityAnalyzer::default().analyze_source(
            "contract T { function kill() { require(caller() == 1); selfdestruct(); } }",
        );
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].code, "S001");
        assert_eq!(findings[0].severity, FindingSeverity::Critical);
        assert_eq!(findings[0].function, "kill");
    }

    #[test]
    fn ignores_names_in_comments_and_identifiers() {
        assert!(
            codes(
                "contract T {
                    // selfdestruct(); tx_origin();
                    function f() -> i32 { let selfdestruct_count = 1; return selfdestruct_count; }
                }"
            )
            .is_empty()
        );
    }

    #[test]
    fn detects_write_after_external_call() {
        assert_eq!(
            codes(
                "contract Vault {
                    storage balance: i32;
                    function withdraw(to: i32) public {
                        require(balance > 0);
                        let ok = call(to, balance);
                        balance = 0;
                    }
                }"
            ),
            vec!["S004"]
        );
    }

    #[test]
    fn write_before_call_is_not_reentrancy() {
        assert!(
            codes(
                "contract Vault {
                    storage balance: i32;
                    function withdraw(to: i32) public {
                        require(balance > 0);
                        let amount = balance;
                        balance = 0;
                        let ok = call(to, amount);
                    }
                }"
            )
            .is_empty()
        );
    }

    #[test]
    fn findings_are_ordered_by_position() {
        assert_eq!(
            codes(
                "contract T {
                    storage owner: i32;
                    function f() public {
                        while (true) { emit(timestamp()); }
                        owner = tx_origin();
                    }
                }"
            ),
            vec!["S005", "S008", "S007", "S003"]
        );
    }

    #[test]
    fn custom_rule_table_replaces_defaults() {
        let analyzer = SecurityAnalyzer::new(vec![SecurityRule {
            code: "X001",
            pattern: Pattern::BuiltinCall(BuiltinKind::Emit),
            severity: FindingSeverity::Info,
            message: "event emitted",
        }]);
        let findings =
            analyzer.analyze_source("contract T { function f() { emit(1); selfdestruct(); } }");
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].code, "X001");
    }

    #[test]
    fn critical_finding_severity_depends_on_mode() {
        let finding = Finding {
            code: "S001",
            severity: FindingSeverity::Critical,
            message: "m".into(),
            function: "f".into(),
            span: Span::default(),
        };
        assert!(finding.to_diagnostic(true).is_error());
        assert!(!finding.to_diagnostic(false).is_error());
    }
}
