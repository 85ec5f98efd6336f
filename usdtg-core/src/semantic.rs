//! Scope and type checking; lowers the AST into HIR.
//!
//! Errors are accumulated rather than aborting. Statements whose
//! expressions fail to resolve are dropped from the HIR, so the result
//! is always a structurally valid (possibly partial) contract that the
//! security analyzer can still inspect.

use std::collections::HashMap;

use crate::ast::{self, BinaryOp, ExprKind, StmtKind, UnaryOp};
use crate::builtins::{BuiltinKind, find_builtin};
use crate::diagnostic::{Diagnostic, Stage};
use crate::hir::{
    HirContract, HirExpr, HirExprKind, HirFunction, HirLocal, HirStmt, HirStmtKind, HirStorage,
    block_diverges,
};
use crate::span::Span;
use crate::types::Type;

#[derive(Debug)]
pub struct SemanticResult {
    pub contract: HirContract,
    pub diagnostics: Vec<Diagnostic>,
}

impl SemanticResult {
    pub fn has_errors(&self) -> bool {
        self.diagnostics.iter().any(Diagnostic::is_error)
    }
}

pub fn analyze(contract: &ast::Contract) -> SemanticResult {
    let mut checker = Checker::new();
    let contract = checker.check_contract(contract);
    SemanticResult {
        contract,
        diagnostics: checker.diagnostics,
    }
}

struct Signature {
    index: u32,
    params: Vec<Type>,
    result: Type,
    view: bool,
}

/// Per-function state while checking a body.
struct FunctionScope {
    locals: Vec<HirLocal>,
    /// Innermost scope last.
    scopes: Vec<Vec<(String, u32)>>,
    result: Type,
    view: bool,
}

impl FunctionScope {
    fn lookup(&self, name: &str) -> Option<u32> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.iter().rev().find(|(n, _)| n == name).map(|(_, i)| *i))
    }

    fn declare(&mut self, name: &str, ty: Type) -> u32 {
        let index = self.locals.len() as u32;
        self.locals.push(HirLocal {
            name: name.to_string(),
            ty,
        });
        if let Some(scope) = self.scopes.last_mut() {
            scope.push((name.to_string(), index));
        }
        index
    }
}

struct Checker {
    storage: HashMap<String, (u32, Type)>,
    signatures: HashMap<String, Signature>,
    diagnostics: Vec<Diagnostic>,
}

impl Checker {
    fn new() -> Self {
        Checker {
            storage: HashMap::new(),
            signatures: HashMap::new(),
            diagnostics: Vec::new(),
        }
    }

    fn error(&mut self, code: &'static str, span: Span, msg: impl Into<String>) {
        self.diagnostics
            .push(Diagnostic::error(Stage::Semantic, code, msg, span));
    }

    fn check_contract(&mut self, contract: &ast::Contract) -> HirContract {
        let mut storage = Vec::new();
        for decl in &contract.storage {
            if self.storage.contains_key(&decl.name.name) {
                self.error(
                    "E0201",
                    decl.name.span,
                    format!("storage variable `{}` is declared twice", decl.name.name),
                );
                continue;
            }
            let slot = storage.len() as u32;
            let ty = Type::from(decl.ty);
            self.storage.insert(decl.name.name.clone(), (slot, ty));
            storage.push(HirStorage {
                name: decl.name.name.clone(),
                ty,
                slot,
            });
        }

        // Signatures first so functions may call ones declared later.
        let mut declared = Vec::new();
        for func in &contract.functions {
            let name = &func.name.name;
            if self.signatures.contains_key(name) {
                self.error(
                    "E0202",
                    func.name.span,
                    format!("function `{name}` is declared twice"),
                );
                continue;
            }
            if find_builtin(name).is_some() {
                self.error(
                    "E0202",
                    func.name.span,
                    format!("function `{name}` collides with a builtin"),
                );
                continue;
            }
            let signature = Signature {
                index: declared.len() as u32,
                params: func.params.iter().map(|p| Type::from(p.ty)).collect(),
                result: func.result.map(Type::from).unwrap_or(Type::Unit),
                view: func.view,
            };
            self.signatures.insert(name.clone(), signature);
            declared.push(func);
        }

        let functions = declared
            .into_iter()
            .map(|func| self.check_function(func))
            .collect();

        HirContract {
            name: contract.name.name.clone(),
            storage,
            functions,
            span: contract.span,
        }
    }

    fn check_function(&mut self, func: &ast::FunctionDecl) -> HirFunction {
        let result = func.result.map(Type::from).unwrap_or(Type::Unit);
        let mut scope = FunctionScope {
            locals: Vec::new(),
            scopes: vec![Vec::new()],
            result,
            view: func.view,
        };
        for param in &func.params {
            if scope.lookup(&param.name.name).is_some() {
                self.error(
                    "E0201",
                    param.name.span,
                    format!("parameter `{}` is declared twice", param.name.name),
                );
            }
            self.check_storage_shadowing(&param.name);
            scope.declare(&param.name.name, Type::from(param.ty));
        }
        let param_count = scope.locals.len() as u32;

        let errors_before = self.diagnostics.len();
        let body = self.check_block(&mut scope, &func.body);
        // Statements with errors are dropped from the HIR, so the return
        // check only runs over bodies that checked cleanly.
        let body_checked = self.diagnostics.len() == errors_before;
        if result != Type::Unit && body_checked && !block_diverges(&body) {
            self.error(
                "E0209",
                func.name.span,
                format!(
                    "function `{}` must return a value of type {result} on every path",
                    func.name.name
                ),
            );
        }

        HirFunction {
            name: func.name.name.clone(),
            param_count,
            result,
            locals: scope.locals,
            body,
            public: func.public,
            view: func.view,
            span: func.span,
        }
    }

    fn check_storage_shadowing(&mut self, name: &ast::Ident) {
        if self.storage.contains_key(&name.name) {
            self.error(
                "E0211",
                name.span,
                format!("`{}` shadows a storage variable", name.name),
            );
        }
    }

    fn check_block(&mut self, scope: &mut FunctionScope, block: &ast::Block) -> Vec<HirStmt> {
        scope.scopes.push(Vec::new());
        let stmts = block
            .stmts
            .iter()
            .filter_map(|stmt| self.check_stmt(scope, stmt))
            .collect();
        scope.scopes.pop();
        stmts
    }

    fn check_stmt(&mut self, scope: &mut FunctionScope, stmt: &ast::Stmt) -> Option<HirStmt> {
        let kind = match &stmt.kind {
            StmtKind::Let { name, ty, value } => {
                self.check_storage_shadowing(name);
                let value = self.check_expr(scope, value);
                let declared = ty.map(Type::from);
                let ty = declared
                    .or(value.as_ref().map(|v| v.ty))
                    .unwrap_or(Type::I32);
                let value = value.filter(|v| declared.is_none() || self.expect_type(v, ty));
                if ty == Type::Unit {
                    self.error("E0206", name.span, "cannot bind a value of type ()");
                }
                // Declare even on failure so later uses do not cascade.
                let local = scope.declare(&name.name, ty);
                HirStmtKind::Let {
                    local,
                    value: value?,
                }
            }
            StmtKind::Assign { target, value } => {
                let value = self.check_expr(scope, value);
                if let Some(local) = scope.lookup(&target.name) {
                    let value = value?;
                    self.expect_type(&value, scope.locals[local as usize].ty);
                    HirStmtKind::AssignLocal { local, value }
                } else if let Some(&(slot, ty)) = self.storage.get(&target.name) {
                    if scope.view {
                        self.error(
                            "E0208",
                            stmt.span,
                            format!("view function writes storage variable `{}`", target.name),
                        );
                    }
                    let value = value?;
                    self.expect_type(&value, ty);
                    HirStmtKind::AssignStorage { slot, value }
                } else {
                    self.error(
                        "E0203",
                        target.span,
                        format!("cannot find variable `{}` in this scope", target.name),
                    );
                    return None;
                }
            }
            StmtKind::If {
                cond,
                then_block,
                else_block,
            } => {
                let cond = self.check_condition(scope, cond);
                let then_body = self.check_block(scope, then_block);
                let else_body = else_block
                    .as_ref()
                    .map(|block| self.check_block(scope, block))
                    .unwrap_or_default();
                HirStmtKind::If {
                    cond: cond?,
                    then_body,
                    else_body,
                }
            }
            StmtKind::While { cond, body } => {
                let cond = self.check_condition(scope, cond);
                let body = self.check_block(scope, body);
                HirStmtKind::While { cond: cond?, body }
            }
            StmtKind::Return(value) => {
                let expected = scope.result;
                match value {
                    Some(value) => {
                        let value = self.check_expr(scope, value)?;
                        if expected == Type::Unit {
                            self.error(
                                "E0210",
                                stmt.span,
                                "function without a result type cannot return a value",
                            );
                        } else {
                            self.expect_type(&value, expected);
                        }
                        HirStmtKind::Return(Some(value))
                    }
                    None => {
                        if expected != Type::Unit {
                            self.error(
                                "E0210",
                                stmt.span,
                                format!("missing return value of type {expected}"),
                            );
                        }
                        HirStmtKind::Return(None)
                    }
                }
            }
            StmtKind::Require(cond) => HirStmtKind::Require(self.check_condition(scope, cond)?),
            StmtKind::Expr(expr) => HirStmtKind::Expr(self.check_expr(scope, expr)?),
        };
        Some(HirStmt {
            kind,
            span: stmt.span,
        })
    }

    fn check_condition(&mut self, scope: &mut FunctionScope, expr: &ast::Expr) -> Option<HirExpr> {
        let cond = self.check_expr(scope, expr)?;
        self.expect_type(&cond, Type::Bool).then_some(cond)
    }

    fn expect_type(&mut self, expr: &HirExpr, expected: Type) -> bool {
        if expr.ty == expected {
            return true;
        }
        self.error(
            "E0206",
            expr.span,
            format!("mismatched types: expected {expected}, found {}", expr.ty),
        );
        false
    }

    fn check_expr(&mut self, scope: &mut FunctionScope, expr: &ast::Expr) -> Option<HirExpr> {
        let span = expr.span;
        match &expr.kind {
            ExprKind::Int(value) => self.int_literal(*value, span),
            ExprKind::Bool(value) => Some(HirExpr::bool(*value, span)),
            ExprKind::Ident(name) => {
                if let Some(local) = scope.lookup(name) {
                    Some(HirExpr {
                        kind: HirExprKind::Local(local),
                        ty: scope.locals[local as usize].ty,
                        span,
                    })
                } else if let Some(&(slot, ty)) = self.storage.get(name) {
                    Some(HirExpr {
                        kind: HirExprKind::Storage(slot),
                        ty,
                        span,
                    })
                } else {
                    self.error(
                        "E0203",
                        span,
                        format!("cannot find variable `{name}` in this scope"),
                    );
                    None
                }
            }
            ExprKind::Unary { op, operand } => {
                // `-2147483648` is only representable as a negated literal.
                if let (UnaryOp::Neg, ExprKind::Int(value)) = (op, &operand.kind) {
                    if *value == i64::from(i32::MAX) + 1 {
                        return Some(HirExpr::int(i32::MIN, span));
                    }
                }
                let operand = self.check_expr(scope, operand)?;
                let ty = match op {
                    UnaryOp::Neg => Type::I32,
                    UnaryOp::Not => Type::Bool,
                };
                if !self.expect_type(&operand, ty) {
                    return None;
                }
                Some(HirExpr {
                    kind: HirExprKind::Unary {
                        op: *op,
                        operand: Box::new(operand),
                    },
                    ty,
                    span,
                })
            }
            ExprKind::Binary { op, lhs, rhs } => {
                let lhs = self.check_expr(scope, lhs);
                let rhs = self.check_expr(scope, rhs);
                let (lhs, rhs) = (lhs?, rhs?);
                let ty = self.check_binary(*op, &lhs, &rhs, span)?;
                Some(HirExpr {
                    kind: HirExprKind::Binary {
                        op: *op,
                        lhs: Box::new(lhs),
                        rhs: Box::new(rhs),
                    },
                    ty,
                    span,
                })
            }
            ExprKind::Call { callee, args } => self.check_call(scope, callee, args, span),
        }
    }

    fn int_literal(&mut self, value: i64, span: Span) -> Option<HirExpr> {
        match i32::try_from(value) {
            Ok(value) => Some(HirExpr::int(value, span)),
            Err(_) => {
                self.error(
                    "E0207",
                    span,
                    format!("integer literal {value} does not fit in i32"),
                );
                None
            }
        }
    }

    fn check_binary(
        &mut self,
        op: BinaryOp,
        lhs: &HirExpr,
        rhs: &HirExpr,
        span: Span,
    ) -> Option<Type> {
        let (operand, result) = match op {
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => {
                (Type::I32, Type::I32)
            }
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => (Type::I32, Type::Bool),
            BinaryOp::And | BinaryOp::Or => (Type::Bool, Type::Bool),
            BinaryOp::Eq | BinaryOp::Ne => {
                if lhs.ty != rhs.ty || lhs.ty == Type::Unit {
                    self.error(
                        "E0206",
                        span,
                        format!(
                            "cannot compare {} with {} using `{}`",
                            lhs.ty,
                            rhs.ty,
                            op.symbol()
                        ),
                    );
                    return None;
                }
                return Some(Type::Bool);
            }
        };
        if lhs.ty != operand || rhs.ty != operand {
            self.error(
                "E0206",
                span,
                format!(
                    "operator `{}` expects {operand} operands, found {} and {}",
                    op.symbol(),
                    lhs.ty,
                    rhs.ty
                ),
            );
            return None;
        }
        Some(result)
    }

    fn check_call(
        &mut self,
        scope: &mut FunctionScope,
        callee: &ast::Ident,
        args: &[ast::Expr],
        span: Span,
    ) -> Option<HirExpr> {
        let checked: Vec<Option<HirExpr>> = args
            .iter()
            .map(|arg| self.check_expr(scope, arg))
            .collect();

        let signature = self
            .signatures
            .get(&callee.name)
            .map(|sig| (sig.index, sig.params.clone(), sig.result, sig.view));
        let (params, result, kind) = if let Some((index, params, result, view)) = signature {
            if scope.view && !view {
                self.error(
                    "E0208",
                    span,
                    format!("view function calls non-view function `{}`", callee.name),
                );
            }
            (
                params,
                result,
                HirExprKind::Call {
                    function: index,
                    args: Vec::new(),
                },
            )
        } else if let Some(builtin) = find_builtin(&callee.name) {
            if scope.view && mutates_state(builtin.kind) {
                self.error(
                    "E0208",
                    span,
                    format!("view function calls state-changing builtin `{}`", callee.name),
                );
            }
            (
                builtin.params.to_vec(),
                builtin.result,
                HirExprKind::Builtin {
                    kind: builtin.kind,
                    args: Vec::new(),
                },
            )
        } else {
            self.error(
                "E0204",
                callee.span,
                format!("cannot find function `{}`", callee.name),
            );
            return None;
        };

        if params.len() != args.len() {
            self.error(
                "E0205",
                span,
                format!(
                    "`{}` takes {} argument(s) but {} were supplied",
                    callee.name,
                    params.len(),
                    args.len()
                ),
            );
            return None;
        }

        let mut lowered = Vec::with_capacity(args.len());
        let mut ok = true;
        for (arg, expected) in checked.into_iter().zip(params) {
            match arg {
                Some(arg) => {
                    ok &= self.expect_type(&arg, expected);
                    lowered.push(arg);
                }
                None => ok = false,
            }
        }
        if !ok {
            return None;
        }

        let kind = match kind {
            HirExprKind::Call { function, .. } => HirExprKind::Call {
                function,
                args: lowered,
            },
            HirExprKind::Builtin { kind, .. } => HirExprKind::Builtin {
                kind,
                args: lowered,
            },
            other => other,
        };
        Some(HirExpr {
            kind,
            ty: result,
            span,
        })
    }
}

fn mutates_state(kind: BuiltinKind) -> bool {
    matches!(
        kind,
        BuiltinKind::Emit
            | BuiltinKind::Call
            | BuiltinKind::DelegateCall
            | BuiltinKind::SelfDestruct
            | BuiltinKind::StorageStore
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    fn analyze_source(source: &str) -> SemanticResult {
        let parsed = parse(source);
        assert!(parsed.diagnostics.is_empty(), "{:?}", parsed.diagnostics);
        analyze(&parsed.contract.expect("contract"))
    }

    fn codes(source: &str) -> Vec<&'static str> {
        analyze_source(source)
            .diagnostics
            .iter()
            .map(|d| d.code)
            .collect()
    }

    #[test]
    fn lowers_well_typed_contract() {
        let result = analyze_source(
            "contract Counter {
                storage count: i32;
                function bump(by: i32) public -> i32 {
                    let next = count + by;
                    count = next;
                    emit(next);
                    return next;
                }
            }",
        );
        assert!(!result.has_errors(), "{:?}", result.diagnostics);
        let func = &result.contract.functions[0];
        assert_eq!(func.param_count, 1);
        assert_eq!(func.locals.len(), 2);
        assert_eq!(func.result, Type::I32);
        assert!(matches!(
            func.body[1].kind,
            HirStmtKind::AssignStorage { slot: 0, .. }
        ));
    }

    #[test]
    fn reports_unknown_names_and_types() {
        assert_eq!(
            codes("contract T { function f() public { let x: bool = 1; y = 2; } }"),
            vec!["E0206", "E0203"]
        );
    }

    #[test]
    fn reports_arity_mismatch() {
        assert_eq!(
            codes("contract T { function f() public { emit(1, 2); } }"),
            vec!["E0205"]
        );
    }

    #[test]
    fn reports_missing_return() {
        assert_eq!(
            codes("contract T { function f(x: i32) -> i32 { if (x > 0) { return 1; } } }"),
            vec!["E0209"]
        );
    }

    #[test]
    fn if_else_returning_on_both_paths_is_complete() {
        assert!(
            codes(
                "contract T { function f(x: i32) -> i32 {
                    if (x > 0) { return 1; } else { return 2; }
                } }"
            )
            .is_empty()
        );
    }

    #[test]
    fn view_functions_cannot_write_storage() {
        assert_eq!(
            codes("contract T { storage s: i32; function f() view { s = 1; emit(2); } }"),
            vec!["E0208", "E0208"]
        );
    }

    #[test]
    fn rejects_duplicates_and_storage_shadowing() {
        assert_eq!(
            codes(
                "contract T {
                    storage s: i32;
                    storage s: bool;
                    function f() { let s = 1; }
                    function f() { }
                }"
            ),
            vec!["E0201", "E0202", "E0211"]
        );
    }

    #[test]
    fn functions_may_call_later_declarations() {
        let result = analyze_source(
            "contract T {
                function a() -> i32 { return b(2); }
                function b(x: i32) -> i32 { return x * 2; }
            }",
        );
        assert!(!result.has_errors());
        assert!(matches!(
            &result.contract.functions[0].body[0].kind,
            HirStmtKind::Return(Some(HirExpr { kind: HirExprKind::Call { function: 1, .. }, .. }))
        ));
    }

    #[test]
    fn accepts_most_negative_literal() {
        assert!(codes("contract T { function f() -> i32 { return -2147483648; } }").is_empty());
        assert_eq!(
            codes("contract T { function f() -> i32 { return 2147483648; } }"),
            vec!["E0207"]
        );
    }

    #[test]
    fn inner_scopes_end_with_their_block() {
        assert_eq!(
            codes(
                "contract T { function f() -> i32 {
                    if (true) { let inner = 1; }
                    return inner;
                } }"
            ),
            vec!["E0203"]
        );
    }

    #[test]
    fn broken_returns_are_reported_once() {
        assert_eq!(
            codes(
                "contract T { function f(x: i32) -> i32 {
                    if (missing(x)) { return 1; } else { return 2; }
                } }"
            ),
            vec!["E0204"]
        );
        assert_eq!(
            codes("contract T { function f() -> i32 { let x = 1; } }"),
            vec!["E0209"]
        );
    }
}
