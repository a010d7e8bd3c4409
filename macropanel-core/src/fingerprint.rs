//! Content hashing for panels.
//!
//! Two builds from identical inputs must hash identically. The hash covers the
//! date axis, the column names in panel order, and the exact bit pattern of
//! every cell. All NaNs are hashed as one canonical pattern so that missing
//! cells compare equal whatever produced them.

use crate::panel::Panel;
use serde::{Deserialize, Serialize};

/// Hex-encoded BLAKE3 digest of a panel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PanelHash(pub String);

impl std::fmt::Display for PanelHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

const CANONICAL_NAN: u64 = 0x7ff8_0000_0000_0000;

pub fn panel_hash(panel: &Panel) -> PanelHash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&(panel.len() as u64).to_le_bytes());
    if let Some(start) = panel.start() {
        hasher.update(start.to_string().as_bytes());
    }
    for (name, values) in panel.columns() {
        hasher.update(&(name.len() as u64).to_le_bytes());
        hasher.update(name.as_bytes());
        for v in values {
            let bits = if v.is_nan() { CANONICAL_NAN } else { v.to_bits() };
            hasher.update(&bits.to_le_bytes());
        }
    }
    PanelHash(hasher.finalize().to_hex().to_string())
}
