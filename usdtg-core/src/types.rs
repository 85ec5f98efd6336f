//! Value types of USDTgScript.

use std::fmt;

use wasm_encoder::ValType;

use crate::ast::TypeName;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Type {
    I32,
    Bool,
    /// Result type of functions and builtins that return nothing.
    Unit,
}

impl Type {
    /// Wasm representation; booleans are `i32` 0/1 and `Unit` has none.
    pub fn val_type(self) -> Option<ValType> {
        match self {
            Type::I32 | Type::Bool => Some(ValType::I32),
            Type::Unit => None,
        }
    }

    /// Name as it appears in the ABI.
    pub fn abi_name(self) -> &'static str {
        match self {
            Type::I32 => "int32",
            Type::Bool => "bool",
            Type::Unit => "void",
        }
    }
}

impl From<TypeName> for Type {
    fn from(name: TypeName) -> Self {
        match name {
            TypeName::I32 => Type::I32,
            TypeName::Bool => Type::Bool,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Type::I32 => "i32",
            Type::Bool => "bool",
            Type::Unit => "()",
        };
        f.write_str(name)
    }
}
