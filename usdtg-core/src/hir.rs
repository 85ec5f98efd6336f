//! High-level intermediate representation (HIR).
//!
//! HIR is the typed, resolved form consumed by the security analyzer,
//! the optimizer and codegen. Locals are indices into
//! `HirFunction::locals` (parameters first), storage variables are
//! slots, and calls point at a function index or a builtin kind.

use crate::ast::{BinaryOp, UnaryOp};
use crate::builtins::BuiltinKind;
use crate::span::Span;
use crate::types::Type;

#[derive(Debug, Clone, PartialEq)]
pub struct HirContract {
    pub name: String,
    pub storage: Vec<HirStorage>,
    pub functions: Vec<HirFunction>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HirStorage {
    pub name: String,
    pub ty: Type,
    pub slot: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HirLocal {
    pub name: String,
    pub ty: Type,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HirFunction {
    pub name: String,
    pub param_count: u32,
    pub result: Type,
    /// Parameters followed by `let` bindings, in declaration order.
    pub locals: Vec<HirLocal>,
    pub body: Vec<HirStmt>,
    pub public: bool,
    pub view: bool,
    pub span: Span,
}

impl HirFunction {
    pub fn params(&self) -> &[HirLocal] {
        &self.locals[..self.param_count as usize]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HirStmt {
    pub kind: HirStmtKind,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum HirStmtKind {
    Let { local: u32, value: HirExpr },
    AssignLocal { local: u32, value: HirExpr },
    AssignStorage { slot: u32, value: HirExpr },
    If {
        cond: HirExpr,
        then_body: Vec<HirStmt>,
        else_body: Vec<HirStmt>,
    },
    While { cond: HirExpr, body: Vec<HirStmt> },
    Return(Option<HirExpr>),
    Require(HirExpr),
    Expr(HirExpr),
}

/// Expression node; always carries its type and span.
#[derive(Debug, Clone, PartialEq)]
pub struct HirExpr {
    pub kind: HirExprKind,
    pub ty: Type,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum HirExprKind {
    Int(i32),
    Bool(bool),
    Local(u32),
    Storage(u32),
    Unary {
        op: UnaryOp,
        operand: Box<HirExpr>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<HirExpr>,
        rhs: Box<HirExpr>,
    },
    /// Left shift by a constant; only produced by strength reduction.
    Shl {
        value: Box<HirExpr>,
        amount: u32,
    },
    Call {
        function: u32,
        args: Vec<HirExpr>,
    },
    Builtin {
        kind: BuiltinKind,
        args: Vec<HirExpr>,
    },
}

impl HirExpr {
    pub fn int(value: i32, span: Span) -> Self {
        HirExpr {
            kind: HirExprKind::Int(value),
            ty: Type::I32,
            span,
        }
    }

    pub fn bool(value: bool, span: Span) -> Self {
        HirExpr {
            kind: HirExprKind::Bool(value),
            ty: Type::Bool,
            span,
        }
    }

    /// Whether evaluating the expression can neither trap nor touch
    /// anything outside its own locals.
    pub fn is_pure(&self) -> bool {
        match &self.kind {
            HirExprKind::Int(_) | HirExprKind::Bool(_) | HirExprKind::Local(_) => true,
            // Storage reads are host calls.
            HirExprKind::Storage(_) => false,
            HirExprKind::Unary { operand, .. } => operand.is_pure(),
            HirExprKind::Binary { op, lhs, rhs } => {
                !matches!(op, BinaryOp::Div | BinaryOp::Rem) && lhs.is_pure() && rhs.is_pure()
            }
            HirExprKind::Shl { value, .. } => value.is_pure(),
            HirExprKind::Call { .. } | HirExprKind::Builtin { .. } => false,
        }
    }

    /// Visit this expression and every subexpression in evaluation order.
    pub fn walk<'a>(&'a self, visit: &mut dyn FnMut(&'a HirExpr)) {
        match &self.kind {
            HirExprKind::Unary { operand, .. } => operand.walk(visit),
            HirExprKind::Binary { lhs, rhs, .. } => {
                lhs.walk(visit);
                rhs.walk(visit);
            }
            HirExprKind::Shl { value, .. } => value.walk(visit),
            HirExprKind::Call { args, .. } | HirExprKind::Builtin { args, .. } => {
                for arg in args {
                    arg.walk(visit);
                }
            }
            HirExprKind::Int(_)
            | HirExprKind::Bool(_)
            | HirExprKind::Local(_)
            | HirExprKind::Storage(_) => {}
        }
        visit(self);
    }
}

impl HirStmt {
    /// Whether control never falls through past this statement.
    pub fn diverges(&self) -> bool {
        match &self.kind {
            HirStmtKind::Return(_) => true,
            HirStmtKind::If {
                then_body,
                else_body,
                ..
            } => block_diverges(then_body) && block_diverges(else_body),
            // No `break`, so a constant-true loop only exits by returning.
            HirStmtKind::While { cond, .. } => matches!(cond.kind, HirExprKind::Bool(true)),
            _ => false,
        }
    }
}

pub fn block_diverges(stmts: &[HirStmt]) -> bool {
    stmts.iter().any(HirStmt::diverges)
}
