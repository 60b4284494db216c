//! Linear size-based fee estimation.
//!
//! `fee = base_fee + ceil(per_byte_milli * size / 1000)`, where `size` is an
//! upper bound on the wire encoding of a signed transaction with the given
//! shape. Both terms grow with every argument, so the fee is monotone.

use serde::{Deserialize, Serialize};
use tern_core::constants::MAX_TX_SIZE;

/// Bytes for the version and the four length prefixes (inputs, outputs,
/// metadata, witnesses) at their widest varint encoding.
const BASE_SIZE: u64 = 5 + 4 * 9;

/// Outpoint (32-byte hash + varint index) plus its witness
/// (32-byte public key + length-prefixed 64-byte signature).
const INPUT_SIZE: u64 = (32 + 5) + (32 + 1 + 64);

/// Length-prefixed address with the largest payload, plus a varint amount.
const OUTPUT_SIZE: u64 = 1 + (1 + 1 + 32 + 1 + 64 + 4) + 9;

/// Fee parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeePolicy {
    /// Constant part of every fee, in base units.
    pub base_fee: u64,
    /// Per-byte part in thousandths of a base unit.
    pub per_byte_milli: u64,
}

impl Default for FeePolicy {
    fn default() -> Self {
        Self {
            base_fee: 155_381,
            per_byte_milli: 43_946,
        }
    }
}

impl FeePolicy {
    /// Upper bound on the signed transaction size in bytes.
    pub fn estimate_size(inputs: usize, outputs: usize, metadata_size: usize) -> u64 {
        BASE_SIZE
            .saturating_add(INPUT_SIZE.saturating_mul(inputs as u64))
            .saturating_add(OUTPUT_SIZE.saturating_mul(outputs as u64))
            .saturating_add(metadata_size as u64)
    }

    /// Most inputs a transaction with `outputs` outputs and `metadata_size`
    /// bytes of metadata can carry and stay within [`MAX_TX_SIZE`].
    pub fn max_inputs(outputs: usize, metadata_size: usize) -> usize {
        let room = (MAX_TX_SIZE as u64).saturating_sub(Self::estimate_size(0, outputs, metadata_size));
        usize::try_from(room / INPUT_SIZE).unwrap_or(usize::MAX)
    }

    /// Minimum fee for a transaction of this shape. Saturates at `u64::MAX`,
    /// which no wallet can afford.
    pub fn estimate_fee(&self, inputs: usize, outputs: usize, metadata_size: usize) -> u64 {
        let size = Self::estimate_size(inputs, outputs, metadata_size) as u128;
        let variable = (size * self.per_byte_milli as u128).div_ceil(1000);
        u64::try_from(variable)
            .ok()
            .and_then(|v| v.checked_add(self.base_fee))
            .unwrap_or(u64::MAX)
    }

    /// Extra fee caused by adding one output to the shape.
    pub fn output_cost(&self, inputs: usize, outputs: usize, metadata_size: usize) -> u64 {
        self.estimate_fee(inputs, outputs + 1, metadata_size)
            .saturating_sub(self.estimate_fee(inputs, outputs, metadata_size))
    }
}
