//! HIR optimization passes.
//!
//! - level 1: constant folding (wrapping arithmetic, never folding a trap)
//! - level 2: algebraic identities and constant-condition control flow
//! - level 3: dead statements after a diverging statement
//!
//! Strength reduction (`x * 2^k` to `x << k`) is independent of the
//! level and enabled by the gas-optimization flag.

use crate::ast::{BinaryOp, UnaryOp};
use crate::hir::{HirContract, HirExpr, HirExprKind, HirStmt, HirStmtKind};
use crate::span::Span;
use crate::types::Type;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptimizeOptions {
    pub level: u8,
    pub strength_reduction: bool,
}

/// Counts of applied rewrites, reported as an optimization-stage note.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OptimizationReport {
    pub folded: usize,
    pub simplified: usize,
    pub removed_statements: usize,
    pub strength_reduced: usize,
}

impl OptimizationReport {
    pub fn total(&self) -> usize {
        self.folded + self.simplified + self.removed_statements + self.strength_reduced
    }
}

pub fn optimize(contract: &mut HirContract, options: OptimizeOptions) -> OptimizationReport {
    let mut optimizer = Optimizer {
        options,
        report: OptimizationReport::default(),
    };
    for function in &mut contract.functions {
        let body = std::mem::take(&mut function.body);
        function.body = optimizer.block(body);
    }
    optimizer.report
}

struct Optimizer {
    options: OptimizeOptions,
    report: OptimizationReport,
}

impl Optimizer {
    fn block(&mut self, stmts: Vec<HirStmt>) -> Vec<HirStmt> {
        let mut out = Vec::with_capacity(stmts.len());
        for stmt in stmts {
            self.stmt(stmt, &mut out);
        }
        if self.options.level >= 3 {
            if let Some(position) = out.iter().position(HirStmt::diverges) {
                self.report.removed_statements += out.len() - position - 1;
                out.truncate(position + 1);
            }
        }
        out
    }

    fn stmt(&mut self, stmt: HirStmt, out: &mut Vec<HirStmt>) {
        let span = stmt.span;
        let kind = match stmt.kind {
            HirStmtKind::Let { local, value } => HirStmtKind::Let {
                local,
                value: self.expr(value),
            },
            HirStmtKind::AssignLocal { local, value } => HirStmtKind::AssignLocal {
                local,
                value: self.expr(value),
            },
            HirStmtKind::AssignStorage { slot, value } => HirStmtKind::AssignStorage {
                slot,
                value: self.expr(value),
            },
            HirStmtKind::Expr(value) => HirStmtKind::Expr(self.expr(value)),
            HirStmtKind::Return(value) => HirStmtKind::Return(value.map(|v| self.expr(v))),
            HirStmtKind::Require(cond) => {
                let cond = self.expr(cond);
                if self.options.level >= 2 && matches!(cond.kind, HirExprKind::Bool(true)) {
                    self.report.removed_statements += 1;
                    return;
                }
                HirStmtKind::Require(cond)
            }
            HirStmtKind::If {
                cond,
                then_body,
                else_body,
            } => {
                let cond = self.expr(cond);
                let then_body = self.block(then_body);
                let else_body = self.block(else_body);
                if self.options.level >= 2 {
                    if let HirExprKind::Bool(value) = cond.kind {
                        self.report.simplified += 1;
                        out.extend(if value { then_body } else { else_body });
                        return;
                    }
                }
                HirStmtKind::If {
                    cond,
                    then_body,
                    else_body,
                }
            }
            HirStmtKind::While { cond, body } => {
                let cond = self.expr(cond);
                if self.options.level >= 2 && matches!(cond.kind, HirExprKind::Bool(false)) {
                    self.report.removed_statements += 1;
                    return;
                }
                HirStmtKind::While {
                    cond,
                    body: self.block(body),
                }
            }
        };
        out.push(HirStmt { kind, span });
    }

    fn expr(&mut self, expr: HirExpr) -> HirExpr {
        let HirExpr { kind, ty, span } = expr;
        let kind = match kind {
            HirExprKind::Unary { op, operand } => {
                let operand = self.expr(*operand);
                return self.unary(op, operand, ty, span);
            }
            HirExprKind::Binary { op, lhs, rhs } => {
                let lhs = self.expr(*lhs);
                let rhs = self.expr(*rhs);
                return self.binary(op, lhs, rhs, ty, span);
            }
            HirExprKind::Shl { value, amount } => HirExprKind::Shl {
                value: Box::new(self.expr(*value)),
                amount,
            },
            HirExprKind::Call { function, args } => HirExprKind::Call {
                function,
                args: args.into_iter().map(|a| self.expr(a)).collect(),
            },
            HirExprKind::Builtin { kind, args } => HirExprKind::Builtin {
                kind,
                args: args.into_iter().map(|a| self.expr(a)).collect(),
            },
            leaf => leaf,
        };
        HirExpr { kind, ty, span }
    }

    fn unary(&mut self, op: UnaryOp, operand: HirExpr, ty: Type, span: Span) -> HirExpr {
        if self.options.level >= 1 {
            match (op, &operand.kind) {
                (UnaryOp::Neg, HirExprKind::Int(value)) => {
                    self.report.folded += 1;
                    return HirExpr::int(value.wrapping_neg(), span);
                }
                (UnaryOp::Not, HirExprKind::Bool(value)) => {
                    self.report.folded += 1;
                    return HirExpr::bool(!value, span);
                }
                _ => {}
            }
        }
        if self.options.level >= 2 && op == UnaryOp::Not {
            if let HirExprKind::Unary {
                op: UnaryOp::Not,
                operand: inner,
            } = operand.kind
            {
                self.report.simplified += 1;
                return *inner;
            }
        }
        HirExpr {
            kind: HirExprKind::Unary {
                op,
                operand: Box::new(operand),
            },
            ty,
            span,
        }
    }

    fn binary(
        &mut self,
        op: BinaryOp,
        lhs: HirExpr,
        rhs: HirExpr,
        ty: Type,
        span: Span,
    ) -> HirExpr {
        if self.options.level >= 1 {
            if let Some(folded) = fold_constants(op, &lhs, &rhs, span) {
                self.report.folded += 1;
                return folded;
            }
        }
        if self.options.level >= 2 {
            match simplify(op, lhs, rhs, span) {
                Ok(simplified) => {
                    self.report.simplified += 1;
                    return simplified;
                }
                Err((lhs, rhs)) => return self.reduce_strength(op, lhs, rhs, ty, span),
            }
        }
        self.reduce_strength(op, lhs, rhs, ty, span)
    }

    fn reduce_strength(
        &mut self,
        op: BinaryOp,
        lhs: HirExpr,
        rhs: HirExpr,
        ty: Type,
        span: Span,
    ) -> HirExpr {
        if self.options.strength_reduction && op == BinaryOp::Mul {
            let shift = |e: &HirExpr| match e.kind {
                HirExprKind::Int(v) if v > 1 && (v as u32).is_power_of_two() => {
                    Some((v as u32).trailing_zeros())
                }
                _ => None,
            };
            // Only the constant side may be dropped; the other keeps its order.
            if let Some(amount) = shift(&rhs) {
                self.report.strength_reduced += 1;
                return HirExpr {
                    kind: HirExprKind::Shl {
                        value: Box::new(lhs),
                        amount,
                    },
                    ty,
                    span,
                };
            }
            if let Some(amount) = shift(&lhs) {
                self.report.strength_reduced += 1;
                return HirExpr {
                    kind: HirExprKind::Shl {
                        value: Box::new(rhs),
                        amount,
                    },
                    ty,
                    span,
                };
            }
        }
        HirExpr {
            kind: HirExprKind::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
            ty,
            span,
        }
    }
}

/// Fold an operation on two constants. Operations that trap at runtime
/// are left alone so the trap is preserved.
fn fold_constants(
    op: BinaryOp,
    lhs: &HirExpr,
    rhs: &HirExpr,
    span: Span,
) -> Option<HirExpr> {
    match (&lhs.kind, &rhs.kind) {
        (HirExprKind::Int(a), HirExprKind::Int(b)) => {
            let (a, b) = (*a, *b);
            let traps = b == 0 || (a == i32::MIN && b == -1);
            Some(match op {
                BinaryOp::Add => HirExpr::int(a.wrapping_add(b), span),
                BinaryOp::Sub => HirExpr::int(a.wrapping_sub(b), span),
                BinaryOp::Mul => HirExpr::int(a.wrapping_mul(b), span),
                BinaryOp::Div if !traps => HirExpr::int(a / b, span),
                // `i32::MIN % -1` is 0 in Rust but traps in wasm.
                BinaryOp::Rem if !traps => HirExpr::int(a % b, span),
                BinaryOp::Div | BinaryOp::Rem => return None,
                BinaryOp::Eq => HirExpr::bool(a == b, span),
                BinaryOp::Ne => HirExpr::bool(a != b, span),
                BinaryOp::Lt => HirExpr::bool(a < b, span),
                BinaryOp::Le => HirExpr::bool(a <= b, span),
                BinaryOp::Gt => HirExpr::bool(a > b, span),
                BinaryOp::Ge => HirExpr::bool(a >= b, span),
                BinaryOp::And | BinaryOp::Or => return None,
            })
        }
        (HirExprKind::Bool(a), HirExprKind::Bool(b)) => {
            let (a, b) = (*a, *b);
            Some(match op {
                BinaryOp::Eq => HirExpr::bool(a == b, span),
                BinaryOp::Ne => HirExpr::bool(a != b, span),
                BinaryOp::And => HirExpr::bool(a && b, span),
                BinaryOp::Or => HirExpr::bool(a || b, span),
                _ => return None,
            })
        }
        _ => None,
    }
}

/// Algebraic identities. Returns the operands back when nothing applies.
fn simplify(
    op: BinaryOp,
    lhs: HirExpr,
    rhs: HirExpr,
    span: Span,
) -> Result<HirExpr, (HirExpr, HirExpr)> {
    let int = |e: &HirExpr| match e.kind {
        HirExprKind::Int(v) => Some(v),
        _ => None,
    };
    let boolean = |e: &HirExpr| match e.kind {
        HirExprKind::Bool(v) => Some(v),
        _ => None,
    };
    match op {
        BinaryOp::Add if int(&rhs) == Some(0) => Ok(lhs),
        BinaryOp::Add if int(&lhs) == Some(0) => Ok(rhs),
        BinaryOp::Sub if int(&rhs) == Some(0) => Ok(lhs),
        BinaryOp::Mul | BinaryOp::Div if int(&rhs) == Some(1) => Ok(lhs),
        BinaryOp::Mul if int(&lhs) == Some(1) => Ok(rhs),
        BinaryOp::Mul if int(&rhs) == Some(0) && lhs.is_pure() => Ok(HirExpr::int(0, span)),
        BinaryOp::Mul if int(&lhs) == Some(0) && rhs.is_pure() => Ok(HirExpr::int(0, span)),
        // `rhs` is only evaluated when `lhs` is true (resp. false).
        BinaryOp::And if boolean(&lhs) == Some(true) => Ok(rhs),
        BinaryOp::And if boolean(&lhs) == Some(false) => Ok(HirExpr::bool(false, span)),
        BinaryOp::And if boolean(&rhs) == Some(true) => Ok(lhs),
        BinaryOp::And if boolean(&rhs) == Some(false) && lhs.is_pure() => {
            Ok(HirExpr::bool(false, span))
        }
        BinaryOp::Or if boolean(&lhs) == Some(false) => Ok(rhs),
        BinaryOp::Or if boolean(&lhs) == Some(true) => Ok(HirExpr::bool(true, span)),
        BinaryOp::Or if boolean(&rhs) == Some(false) => Ok(lhs),
        BinaryOp::Or if boolean(&rhs) == Some(true) && lhs.is_pure() => {
            Ok(HirExpr::bool(true, span))
        }
        _ => Err((lhs, rhs)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;
    use crate::semantic;

    fn optimized(
        source: &str,
        level: u8,
        strength_reduction: bool,
    ) -> (HirContract, OptimizationReport) {
        let parsed = parse(source);
        let mut contract = semantic::analyze(&parsed.contract.expect("contract")).contract;
        let report = optimize(
            &mut contract,
            OptimizeOptions {
                level,
                strength_reduction,
            },
        );
        (contract, report)
    }

    fn returned(contract: &HirContract) -> HirExprKind {
        match &contract.functions[0].body.last().expect("statement").kind {
            HirStmtKind::Return(Some(expr)) => expr.kind.clone(),
            other => panic!("unexpected statement {other:?}"),
        }
    }

    #[test]
    fn level_zero_leaves_code_untouched() {
        let (contract, report) =
            optimized("contract T { function f() -> i32 { return 1 + 2; } }", 0, false);
        assert_eq!(report.total(), 0);
        assert!(matches!(returned(&contract), HirExprKind::Binary { .. }));
    }

    #[test]
    fn folds_with_wrapping_semantics() {
        let (contract, _) = optimized(
            "contract T { function f() -> i32 { return 2147483647 + 1; } }",
            1,
            false,
        );
        assert_eq!(returned(&contract), HirExprKind::Int(i32::MIN));
    }

    #[test]
    fn never_folds_trapping_division() {
        for expr in ["1 / 0", "7 % 0", "-2147483648 / -1", "-2147483648 % -1"] {
            let (contract, _) = optimized(
                &format!("contract T {{ function f() -> i32 {{ return {expr}; }} }}"),
                3,
                false,
            );
            assert!(
                matches!(returned(&contract), HirExprKind::Binary { .. }),
                "{expr} was folded"
            );
        }
    }

    #[test]
    fn keeps_impure_operand_of_multiplication_by_zero() {
        let (contract, _) = optimized(
            "contract T { function f() -> i32 { return caller() * 0; } }",
            2,
            false,
        );
        assert!(matches!(returned(&contract), HirExprKind::Binary { .. }));

        let (contract, _) = optimized(
            "contract T { function f(x: i32) -> i32 { return x * 0; } }",
            2,
            false,
        );
        assert_eq!(returned(&contract), HirExprKind::Int(0));
    }

    #[test]
    fn eliminates_constant_conditions_at_level_two() {
        let (contract, report) = optimized(
            "contract T { function f() -> i32 {
                while (false) { emit(1); }
                if (1 < 2) { return 10; } else { return 20; }
            } }",
            2,
            false,
        );
        assert_eq!(contract.functions[0].body.len(), 1);
        assert_eq!(returned(&contract), HirExprKind::Int(10));
        assert!(report.simplified >= 1);
    }

    #[test]
    fn removes_dead_statements_at_level_three() {
        let source = "contract T { function f() -> i32 { return 1; emit(2); emit(3); } }";
        let (contract, _) = optimized(source, 2, false);
        assert_eq!(contract.functions[0].body.len(), 3);
        let (contract, report) = optimized(source, 3, false);
        assert_eq!(contract.functions[0].body.len(), 1);
        assert_eq!(report.removed_statements, 2);
    }

    #[test]
    fn strength_reduces_power_of_two_multiplication() {
        let (contract, report) = optimized(
            "contract T { function f(x: i32) -> i32 { return x * 8; } }",
            1,
            true,
        );
        assert_eq!(report.strength_reduced, 1);
        assert!(matches!(
            returned(&contract),
            HirExprKind::Shl { amount: 3, .. }
        ));
    }
}
