//! Contract ABI.

use serde::{Deserialize, Serialize};

use crate::hir::HirContract;
use crate::types::Type;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbiParam {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateMutability {
    View,
    Nonpayable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbiEntry {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub inputs: Vec<AbiParam>,
    pub outputs: Vec<AbiParam>,
    pub state_mutability: StateMutability,
}

/// One entry per public function, in declaration order.
pub fn build_abi(contract: &HirContract) -> Vec<AbiEntry> {
    contract
        .functions
        .iter()
        .filter(|function| function.public)
        .map(|function| AbiEntry {
            kind: "function".to_string(),
            name: function.name.clone(),
            inputs: function
                .params()
                .iter()
                .map(|param| AbiParam {
                    name: param.name.clone(),
                    ty: param.ty.abi_name().to_string(),
                })
                .collect(),
            outputs: match function.result {
                Type::Unit => Vec::new(),
                ty => vec![AbiParam {
                    name: String::new(),
                    ty: ty.abi_name().to_string(),
                }],
            },
            state_mutability: if function.view {
                StateMutability::View
            } else {
                StateMutability::Nonpayable
            },
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;
    use crate::semantic;

    #[test]
    fn serializes_public_functions() {
        let parsed = parse(
            "contract Token {
                storage supply: i32;
                function total() public view -> i32 { return supply; }
                function burn(amount: i32, force: bool) public { supply = supply - amount; }
                function internal_only() { }
            }",
        );
        let contract = semantic::analyze(&parsed.contract.expect("contract")).contract;
        let abi = build_abi(&contract);
        assert_eq!(abi.len(), 2);

        let json = serde_json::to_value(&abi).expect("serialize");
        assert_eq!(json[0]["name"], "total");
        assert_eq!(json[0]["stateMutability"], "view");
        assert_eq!(json[0]["outputs"][0]["type"], "int32");
        assert_eq!(json[1]["stateMutability"], "nonpayable");
        assert_eq!(json[1]["inputs"][1]["name"], "force");
        assert_eq!(json[1]["inputs"][1]["type"], "bool");
        assert_eq!(json[1]["type"], "function");
    }
}
