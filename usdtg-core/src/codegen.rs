//! WASM backend.
//!
//! Translates a typed [`HirContract`] into a wasm module with
//! `wasm-encoder`. Function index space: the used host imports first
//! (in builtin table order), then every contract function in
//! declaration order. Public functions are exported under their name.

use std::collections::{BTreeSet, HashMap};

use wasm_encoder::{
    BlockType, CodeSection, EntityType, ExportKind, ExportSection, Function, FunctionSection,
    ImportSection, IndirectNameMap, Instruction, Module, NameMap, NameSection, TypeSection,
    ValType,
};

use crate::ast::{BinaryOp, UnaryOp};
use crate::builtins::{BuiltinKind, descriptor};
use crate::hir::{HirContract, HirExpr, HirExprKind, HirFunction, HirStmt, HirStmtKind};
use crate::types::Type;

#[derive(Debug, Clone, Copy, Default)]
pub struct CodegenOptions {
    /// Emit a `name` section with function and local names.
    pub debug_names: bool,
}

/// Build the module. The caller finishes it, possibly after appending
/// further custom sections.
pub fn generate(contract: &HirContract, options: CodegenOptions) -> Module {
    let imports_used = collect_imports(contract);
    let mut module = Module::new();

    let mut types = TypeSection::new();
    let mut type_indices: HashMap<(Vec<ValType>, Vec<ValType>), u32> = HashMap::new();
    let mut intern = |types: &mut TypeSection, params: Vec<ValType>, results: Vec<ValType>| {
        *type_indices
            .entry((params.clone(), results.clone()))
            .or_insert_with(|| {
                let index = types.len();
                types.ty().function(params, results);
                index
            })
    };

    let mut import_types = Vec::with_capacity(imports_used.len());
    for kind in &imports_used {
        let builtin = descriptor(*kind);
        let params = builtin.params.iter().filter_map(|t| t.val_type()).collect();
        let results = builtin.result.val_type().into_iter().collect();
        import_types.push(intern(&mut types, params, results));
    }
    let mut function_types = Vec::with_capacity(contract.functions.len());
    for function in &contract.functions {
        let params = function
            .params()
            .iter()
            .filter_map(|local| local.ty.val_type())
            .collect();
        let results = function.result.val_type().into_iter().collect();
        function_types.push(intern(&mut types, params, results));
    }
    module.section(&types);

    let mut import_indices = HashMap::new();
    if !imports_used.is_empty() {
        let mut imports = ImportSection::new();
        for (index, (kind, type_index)) in imports_used.iter().zip(&import_types).enumerate() {
            let builtin = descriptor(*kind);
            imports.import(
                builtin.module,
                builtin.import_name,
                EntityType::Function(*type_index),
            );
            import_indices.insert(*kind, index as u32);
        }
        module.section(&imports);
    }

    let mut functions = FunctionSection::new();
    for type_index in &function_types {
        functions.function(*type_index);
    }
    module.section(&functions);

    let first_function = imports_used.len() as u32;
    let mut exports = ExportSection::new();
    for (index, function) in contract.functions.iter().enumerate() {
        if function.public {
            exports.export(&function.name, ExportKind::Func, first_function + index as u32);
        }
    }
    module.section(&exports);

    let mut code = CodeSection::new();
    for function in &contract.functions {
        let emitter = Emitter {
            import_indices: &import_indices,
            first_function,
        };
        code.function(&emitter.function(function));
    }
    module.section(&code);

    if options.debug_names {
        module.section(&name_section(contract, &imports_used));
    }

    module
}

fn collect_imports(contract: &HirContract) -> BTreeSet<BuiltinKind> {
    fn stmts(body: &[HirStmt], used: &mut BTreeSet<BuiltinKind>) {
        for stmt in body {
            match &stmt.kind {
                HirStmtKind::Let { value, .. }
                | HirStmtKind::AssignLocal { value, .. }
                | HirStmtKind::Expr(value)
                | HirStmtKind::Require(value)
                | HirStmtKind::Return(Some(value)) => expr(value, used),
                HirStmtKind::AssignStorage { value, .. } => {
                    used.insert(BuiltinKind::StorageStore);
                    expr(value, used);
                }
                HirStmtKind::If {
                    cond,
                    then_body,
                    else_body,
                } => {
                    expr(cond, used);
                    stmts(then_body, used);
                    stmts(else_body, used);
                }
                HirStmtKind::While { cond, body } => {
                    expr(cond, used);
                    stmts(body, used);
                }
                HirStmtKind::Return(None) => {}
            }
        }
    }
    fn expr(value: &HirExpr, used: &mut BTreeSet<BuiltinKind>) {
        value.walk(&mut |node| match &node.kind {
            HirExprKind::Storage(_) => {
                used.insert(BuiltinKind::StorageLoad);
            }
            HirExprKind::Builtin { kind, .. } => {
                used.insert(*kind);
            }
            _ => {}
        });
    }

    let mut used = BTreeSet::new();
    for function in &contract.functions {
        stmts(&function.body, &mut used);
    }
    used
}

fn name_section(contract: &HirContract, imports_used: &BTreeSet<BuiltinKind>) -> NameSection {
    let mut function_names = NameMap::new();
    for (index, kind) in imports_used.iter().enumerate() {
        function_names.append(index as u32, descriptor(*kind).import_name);
    }
    let first_function = imports_used.len() as u32;
    let mut local_names = IndirectNameMap::new();
    for (index, function) in contract.functions.iter().enumerate() {
        let function_index = first_function + index as u32;
        function_names.append(function_index, &function.name);
        let mut locals = NameMap::new();
        for (local_index, local) in function.locals.iter().enumerate() {
            locals.append(local_index as u32, &local.name);
        }
        local_names.append(function_index, &locals);
    }

    let mut names = NameSection::new();
    names.module(&contract.name);
    names.functions(&function_names);
    names.locals(&local_names);
    names
}

struct Emitter<'a> {
    import_indices: &'a HashMap<BuiltinKind, u32>,
    first_function: u32,
}

impl Emitter<'_> {
    fn function(&self, function: &HirFunction) -> Function {
        let extra_locals = function.locals.len() as u32 - function.param_count;
        let locals = if extra_locals == 0 {
            Vec::new()
        } else {
            vec![(extra_locals, ValType::I32)]
        };
        let mut func = Function::new(locals);
        for stmt in &function.body {
            self.stmt(stmt, &mut func);
        }
        if function.result != Type::Unit {
            // Every path returns explicitly; the fallthrough is unreachable.
            func.instruction(&Instruction::Unreachable);
        }
        func.instruction(&Instruction::End);
        func
    }

    fn import(&self, kind: BuiltinKind) -> u32 {
        // `collect_imports` registered every builtin that appears in the body.
        self.import_indices.get(&kind).copied().unwrap_or_default()
    }

    fn stmt(&self, stmt: &HirStmt, func: &mut Function) {
        match &stmt.kind {
            HirStmtKind::Let { local, value } | HirStmtKind::AssignLocal { local, value } => {
                self.expr(value, func);
                func.instruction(&Instruction::LocalSet(*local));
            }
            HirStmtKind::AssignStorage { slot, value } => {
                func.instruction(&Instruction::I32Const(*slot as i32));
                self.expr(value, func);
                func.instruction(&Instruction::Call(self.import(BuiltinKind::StorageStore)));
            }
            HirStmtKind::If {
                cond,
                then_body,
                else_body,
            } => {
                self.expr(cond, func);
                func.instruction(&Instruction::If(BlockType::Empty));
                for stmt in then_body {
                    self.stmt(stmt, func);
                }
                if !else_body.is_empty() {
                    func.instruction(&Instruction::Else);
                    for stmt in else_body {
                        self.stmt(stmt, func);
                    }
                }
                func.instruction(&Instruction::End);
            }
            HirStmtKind::While { cond, body } => {
                func.instruction(&Instruction::Block(BlockType::Empty));
                func.instruction(&Instruction::Loop(BlockType::Empty));
                self.expr(cond, func);
                func.instruction(&Instruction::I32Eqz);
                func.instruction(&Instruction::BrIf(1));
                for stmt in body {
                    self.stmt(stmt, func);
                }
                func.instruction(&Instruction::Br(0));
                func.instruction(&Instruction::End);
                func.instruction(&Instruction::End);
            }
            HirStmtKind::Return(value) => {
                if let Some(value) = value {
                    self.expr(value, func);
                }
                func.instruction(&Instruction::Return);
            }
            HirStmtKind::Require(cond) => {
                self.expr(cond, func);
                func.instruction(&Instruction::I32Eqz);
                func.instruction(&Instruction::If(BlockType::Empty));
                func.instruction(&Instruction::Unreachable);
                func.instruction(&Instruction::End);
            }
            HirStmtKind::Expr(value) => {
                self.expr(value, func);
                if value.ty != Type::Unit {
                    func.instruction(&Instruction::Drop);
                }
            }
        }
    }

    fn expr(&self, expr: &HirExpr, func: &mut Function) {
        match &expr.kind {
            HirExprKind::Int(value) => {
                func.instruction(&Instruction::I32Const(*value));
            }
            HirExprKind::Bool(value) => {
                func.instruction(&Instruction::I32Const(i32::from(*value)));
            }
            HirExprKind::Local(local) => {
                func.instruction(&Instruction::LocalGet(*local));
            }
            HirExprKind::Storage(slot) => {
                func.instruction(&Instruction::I32Const(*slot as i32));
                func.instruction(&Instruction::Call(self.import(BuiltinKind::StorageLoad)));
            }
            HirExprKind::Unary { op, operand } => match op {
                UnaryOp::Neg => {
                    func.instruction(&Instruction::I32Const(0));
                    self.expr(operand, func);
                    func.instruction(&Instruction::I32Sub);
                }
                UnaryOp::Not => {
                    self.expr(operand, func);
                    func.instruction(&Instruction::I32Eqz);
                }
            },
            HirExprKind::Binary { op, lhs, rhs } => self.binary(*op, lhs, rhs, func),
            HirExprKind::Shl { value, amount } => {
                self.expr(value, func);
                func.instruction(&Instruction::I32Const(*amount as i32));
                func.instruction(&Instruction::I32Shl);
            }
            HirExprKind::Call { function, args } => {
                for arg in args {
                    self.expr(arg, func);
                }
                func.instruction(&Instruction::Call(self.first_function + function));
            }
            HirExprKind::Builtin { kind, args } => {
                for arg in args {
                    self.expr(arg, func);
                }
                func.instruction(&Instruction::Call(self.import(*kind)));
            }
        }
    }

    fn binary(&self, op: BinaryOp, lhs: &HirExpr, rhs: &HirExpr, func: &mut Function) {
        // Short-circuit forms evaluate `rhs` conditionally.
        match op {
            BinaryOp::And => {
                self.expr(lhs, func);
                func.instruction(&Instruction::If(BlockType::Result(ValType::I32)));
                self.expr(rhs, func);
                func.instruction(&Instruction::Else);
                func.instruction(&Instruction::I32Const(0));
                func.instruction(&Instruction::End);
                return;
            }
            BinaryOp::Or => {
                self.expr(lhs, func);
                func.instruction(&Instruction::If(BlockType::Result(ValType::I32)));
                func.instruction(&Instruction::I32Const(1));
                func.instruction(&Instruction::Else);
                self.expr(rhs, func);
                func.instruction(&Instruction::End);
                return;
            }
            _ => {}
        }

        self.expr(lhs, func);
        self.expr(rhs, func);
        let instruction = match op {
            BinaryOp::Add => Instruction::I32Add,
            BinaryOp::Sub => Instruction::I32Sub,
            BinaryOp::Mul => Instruction::I32Mul,
            BinaryOp::Div => Instruction::I32DivS,
            BinaryOp::Rem => Instruction::I32RemS,
            BinaryOp::Eq => Instruction::I32Eq,
            BinaryOp::Ne => Instruction::I32Ne,
            BinaryOp::Lt => Instruction::I32LtS,
            BinaryOp::Le => Instruction::I32LeS,
            BinaryOp::Gt => Instruction::I32GtS,
            BinaryOp::Ge => Instruction::I32GeS,
            BinaryOp::And | BinaryOp::Or => return,
        };
        func.instruction(&instruction);
    }
}
