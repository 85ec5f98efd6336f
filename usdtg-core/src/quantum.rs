//! Quantum-safety capability.
//!
//! The pipeline does not implement post-quantum cryptography. When the
//! quantum-safety flag is set it asks a [`QuantumSafeScheme`] to seal
//! the finished module and embeds the seal in a custom section, so the
//! concrete algorithm can be swapped without touching the pipeline.

use sha2::{Digest, Sha256};

/// Name of the custom section carrying the seal.
pub const QUANTUM_SECTION: &str = "usdtg.quantum";

pub trait QuantumSafeScheme: Send + Sync {
    /// Algorithm identifier recorded next to the seal.
    fn name(&self) -> &str;

    /// Seal over the module bytes preceding the seal section.
    fn seal(&self, module: &[u8]) -> Vec<u8>;
}

/// Placeholder scheme: a SHA-256 digest of the module.
#[derive(Debug, Clone, Copy, Default)]
pub struct DigestSeal;

impl QuantumSafeScheme for DigestSeal {
    fn name(&self) -> &str {
        "sha256-digest"
    }

    fn seal(&self, module: &[u8]) -> Vec<u8> {
        Sha256::digest(module).to_vec()
    }
}

/// Section payload: `name_len (u8) | name | seal`.
pub fn encode_seal(scheme: &dyn QuantumSafeScheme, module: &[u8]) -> Vec<u8> {
    let name = scheme.name().as_bytes();
    let name = &name[..name.len().min(u8::MAX as usize)];
    let seal = scheme.seal(module);
    let mut payload = Vec::with_capacity(1 + name.len() + seal.len());
    payload.push(name.len() as u8);
    payload.extend_from_slice(name);
    payload.extend_from_slice(&seal);
    payload
}

/// Split a section payload back into scheme name and seal.
pub fn decode_seal(payload: &[u8]) -> Option<(&str, &[u8])> {
    let (&len, rest) = payload.split_first()?;
    let len = len as usize;
    if rest.len() < len {
        return None;
    }
    let name = std::str::from_utf8(&rest[..len]).ok()?;
    Some((name, &rest[len..]))
}
