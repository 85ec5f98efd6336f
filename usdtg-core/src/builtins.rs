//! Host-provided builtins visible to USDTgScript.
//!
//! This table is the single source of truth for host imports: semantic
//! analysis resolves calls against it, codegen turns used entries into
//! wasm imports, the security analyzer matches on `BuiltinKind`, and
//! the gas estimator prices imports by `import_name`.

use crate::types::Type;

/// Kind of builtin, used by later stages to decide how to treat a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BuiltinKind {
    Caller,
    TxOrigin,
    Timestamp,
    Emit,
    Call,
    DelegateCall,
    Ecrecover,
    SelfDestruct,
    /// Storage read; produced by lowering storage variable reads.
    StorageLoad,
    /// Storage write; produced by lowering storage assignments.
    StorageStore,
}

impl BuiltinKind {
    /// Calls that hand control to code outside the contract.
    pub fn is_external_call(self) -> bool {
        matches!(self, BuiltinKind::Call | BuiltinKind::DelegateCall)
    }
}

/// Metadata about a single host import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltinDescriptor {
    /// Name at the language level; empty for storage accessors, which
    /// cannot be called directly.
    pub name: &'static str,
    /// Wasm import module.
    pub module: &'static str,
    /// Wasm import field name.
    pub import_name: &'static str,
    pub params: &'static [Type],
    pub result: Type,
    pub kind: BuiltinKind,
}

/// All host imports, in import order.
pub const BUILTINS: &[BuiltinDescriptor] = &[
    BuiltinDescriptor {
        name: "caller",
        module: "env",
        import_name: "caller",
        params: &[],
        result: Type::I32,
        kind: BuiltinKind::Caller,
    },
    BuiltinDescriptor {
        name: "tx_origin",
        module: "env",
        import_name: "tx_origin",
        params: &[],
        result: Type::I32,
        kind: BuiltinKind::TxOrigin,
    },
    BuiltinDescriptor {
        name: "timestamp",
        module: "env",
        import_name: "timestamp",
        params: &[],
        result: Type::I32,
        kind: BuiltinKind::Timestamp,
    },
    BuiltinDescriptor {
        name: "emit",
        module: "env",
        import_name: "emit",
        params: &[Type::I32],
        result: Type::Unit,
        kind: BuiltinKind::Emit,
    },
    BuiltinDescriptor {
        name: "call",
        module: "env",
        import_name: "call",
        params: &[Type::I32, Type::I32],
        result: Type::I32,
        kind: BuiltinKind::Call,
    },
    BuiltinDescriptor {
        name: "delegatecall",
        module: "env",
        import_name: "delegatecall",
        params: &[Type::I32],
        result: Type::I32,
        kind: BuiltinKind::DelegateCall,
    },
    BuiltinDescriptor {
        name: "ecrecover",
        module: "env",
        import_name: "ecrecover",
        params: &[Type::I32],
        result: Type::I32,
        kind: BuiltinKind::Ecrecover,
    },
    BuiltinDescriptor {
        name: "selfdestruct",
        module: "env",
        import_name: "selfdestruct",
        params: &[],
        result: Type::Unit,
        kind: BuiltinKind::SelfDestruct,
    },
    BuiltinDescriptor {
        name: "",
        module: "env",
        import_name: "sload",
        params: &[Type::I32],
        result: Type::I32,
        kind: BuiltinKind::StorageLoad,
    },
    BuiltinDescriptor {
        name: "",
        module: "env",
        import_name: "sstore",
        params: &[Type::I32, Type::I32],
        result: Type::Unit,
        kind: BuiltinKind::StorageStore,
    },
];

/// Look up a callable builtin by its language-level name.
pub fn find_builtin(name: &str) -> Option<&'static BuiltinDescriptor> {
    if name.is_empty() {
        return None;
    }
    BUILTINS.iter().find(|b| b.name == name)
}

pub fn descriptor(kind: BuiltinKind) -> &'static BuiltinDescriptor {
    // Table order follows the declaration order of `BuiltinKind`.
    &BUILTINS[kind as usize]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_accessors_are_not_callable() {
        assert!(find_builtin("sload").is_none());
        assert!(find_builtin("").is_none());
        assert_eq!(descriptor(BuiltinKind::StorageLoad).import_name, "sload");
    }

    #[test]
    fn every_kind_resolves_to_its_descriptor() {
        for builtin in BUILTINS {
            assert_eq!(descriptor(builtin.kind), builtin);
            assert_eq!(builtin.module, "env");
        }
    }
}
