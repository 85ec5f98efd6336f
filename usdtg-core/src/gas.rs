//! Static gas estimation over emitted bytecode.
//!
//! The estimate is a pure function of the instruction stream: every
//! operator in every function body is priced from a fixed tier table,
//! memory accesses are scaled by their width, and calls to host
//! imports are priced from a host cost table scaled by the bytes they
//! touch. Nothing is executed.

use std::collections::HashMap;

use wasmparser::{Operator, Parser, Payload, TypeRef};

use crate::error::CoreError;

/// Per-tier operator weights.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GasSchedule {
    pub zero: u64,
    pub base: u64,
    pub very_low: u64,
    pub low: u64,
    pub mid: u64,
    pub high: u64,
    /// Added per byte moved by a load or store.
    pub memory_per_byte: u64,
    pub memory_grow: u64,
    /// Calls to imports missing from `host`.
    pub unknown_host_call: u64,
    pub host: HashMap<&'static str, HostCost>,
}

/// Price of one host import call: `base + per_byte * bytes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostCost {
    pub base: u64,
    pub per_byte: u64,
    pub bytes: u64,
}

impl HostCost {
    pub fn total(&self) -> u64 {
        self.base.saturating_add(self.per_byte.saturating_mul(self.bytes))
    }
}

impl Default for GasSchedule {
    fn default() -> Self {
        let host = HashMap::from([
            ("caller", HostCost { base: 2, per_byte: 0, bytes: 0 }),
            ("tx_origin", HostCost { base: 2, per_byte: 0, bytes: 0 }),
            ("timestamp", HostCost { base: 2, per_byte: 0, bytes: 0 }),
            // slot + value
            ("sload", HostCost { base: 800, per_byte: 3, bytes: 8 }),
            ("sstore", HostCost { base: 5000, per_byte: 3, bytes: 8 }),
            ("emit", HostCost { base: 375, per_byte: 8, bytes: 4 }),
            ("call", HostCost { base: 700, per_byte: 3, bytes: 8 }),
            ("delegatecall", HostCost { base: 700, per_byte: 3, bytes: 4 }),
            ("ecrecover", HostCost { base: 3000, per_byte: 3, bytes: 4 }),
            ("selfdestruct", HostCost { base: 5000, per_byte: 0, bytes: 0 }),
        ]);
        GasSchedule {
            zero: 0,
            base: 2,
            very_low: 3,
            low: 5,
            mid: 8,
            high: 10,
            memory_per_byte: 1,
            memory_grow: 1000,
            unknown_host_call: 700,
            host,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GasEstimator {
    schedule: GasSchedule,
}

impl GasEstimator {
    pub fn new(schedule: GasSchedule) -> Self {
        GasEstimator { schedule }
    }

    pub fn schedule(&self) -> &GasSchedule {
        &self.schedule
    }

    /// Sum of the cost of every operator in every function body.
    pub fn estimate(&self, bytecode: &[u8]) -> Result<u64, CoreError> {
        // Cost of calling each function index that is an import.
        let mut import_costs: Vec<u64> = Vec::new();
        let mut total: u64 = 0;

        for payload in Parser::new(0).parse_all(bytecode) {
            match payload? {
                Payload::ImportSection(reader) => {
                    for import in reader {
                        let import = import?;
                        if matches!(import.ty, TypeRef::Func(_)) {
                            import_costs.push(self.host_cost(import.module, import.name));
                        }
                    }
                }
                Payload::CodeSectionEntry(body) => {
                    let mut reader = body.get_operators_reader()?;
                    while !reader.eof() {
                        let op = reader.read()?;
                        total = total.saturating_add(self.operator_cost(&op, &import_costs));
                    }
                }
                _ => {}
            }
        }
        Ok(total)
    }

    fn host_cost(&self, module: &str, name: &str) -> u64 {
        match (module, self.schedule.host.get(name)) {
            ("env", Some(cost)) => cost.total(),
            _ => self.schedule.unknown_host_call,
        }
    }

    fn operator_cost(&self, op: &Operator<'_>, import_costs: &[u64]) -> u64 {
        let s = &self.schedule;
        if let Some(width) = memory_access_width(op) {
            return s.very_low.saturating_add(s.memory_per_byte.saturating_mul(width));
        }
        match op {
            Operator::Nop
            | Operator::Block { .. }
            | Operator::Loop { .. }
            | Operator::Else
            | Operator::End
            | Operator::Unreachable => s.zero,

            Operator::Drop
            | Operator::Select
            | Operator::TypedSelect { .. }
            | Operator::Return
            | Operator::MemorySize { .. } => s.base,

            Operator::I32Mul | Operator::I64Mul => s.low,

            Operator::I32DivS
            | Operator::I32DivU
            | Operator::I32RemS
            | Operator::I32RemU
            | Operator::I64DivS
            | Operator::I64DivU
            | Operator::I64RemS
            | Operator::I64RemU
            | Operator::F32Div
            | Operator::F64Div
            | Operator::F32Sqrt
            | Operator::F64Sqrt
            | Operator::Br { .. }
            | Operator::MemoryCopy { .. }
            | Operator::MemoryFill { .. } => s.mid,

            Operator::If { .. }
            | Operator::BrIf { .. }
            | Operator::BrTable { .. }
            | Operator::CallIndirect { .. } => s.high,

            Operator::Call { function_index } => import_costs
                .get(*function_index as usize)
                .copied()
                .unwrap_or(s.high),

            Operator::MemoryGrow { .. } => s.memory_grow,

            // Constants, locals, globals, comparisons and the remaining
            // arithmetic and bitwise operators.
            _ => s.very_low,
        }
    }
}

/// Estimate with the default schedule.
pub fn estimate(bytecode: &[u8]) -> Result<u64, CoreError> {
    GasEstimator::default().estimate(bytecode)
}

fn memory_access_width(op: &Operator<'_>) -> Option<u64> {
    Some(match op {
        Operator::I32Load8S { .. }
        | Operator::I32Load8U { .. }
        | Operator::I64Load8S { .. }
        | Operator::I64Load8U { .. }
        | Operator::I32Store8 { .. }
        | Operator::I64Store8 { .. } => 1,
        Operator::I32Load16S { .. }
        | Operator::I32Load16U { .. }
        | Operator::I64Load16S { .. }
        | Operator::I64Load16U { .. }
        | Operator::I32Store16 { .. }
        | Operator::I64Store16 { .. } => 2,
        Operator::I32Load { .. }
        | Operator::F32Load { .. }
        | Operator::I64Load32S { .. }
        | Operator::I64Load32U { .. }
        | Operator::I32Store { .. }
        | Operator::F32Store { .. }
        | Operator::I64Store32 { .. } => 4,
        Operator::I64Load { .. }
        | Operator::F64Load { .. }
        | Operator::I64Store { .. }
        | Operator::F64Store { .. } => 8,
        Operator::V128Load { .. } | Operator::V128Store { .. } => 16,
        _ => return None,
    })
}
