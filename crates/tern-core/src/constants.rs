//! Engine constants. All monetary values are in base units (1 coin = 10^6 units).

/// Base units per whole coin.
pub const COIN: u64 = 1_000_000;

/// Number of decimal places shown for whole-coin amounts.
pub const COIN_DECIMALS: usize = 6;

/// Maximum number of addresses accepted by any backend batch endpoint.
pub const MAX_ADDRESSES_PER_REQUEST: usize = 20;

/// The single account index used by every wallet.
pub const ACCOUNT_INDEX: u32 = 0;

/// BIP-44 purpose level.
pub const PURPOSE: u32 = 44;

/// BIP-44 coin type level.
pub const COIN_TYPE: u32 = 1815;

/// Offset added to an index to mark it as hardened.
pub const HARDENED_OFFSET: u32 = 0x8000_0000;

/// Current transaction format version.
pub const TX_VERSION: u32 = 1;

/// Maximum encoded size of the derivation payload carried in an address.
pub const MAX_ADDRESS_PAYLOAD: usize = 64;

/// Maximum size of a signed transaction accepted for broadcast.
pub const MAX_TX_SIZE: usize = 65_536;

/// Format a base-unit amount as a whole-coin decimal string.
///
/// Display helper only, never used for arithmetic.
pub fn format_amount(units: u64) -> String {
    format!(
        "{}.{:0width$}",
        units / COIN,
        units % COIN,
        width = COIN_DECIMALS
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_whole_and_fraction() {
        assert_eq!(format_amount(0), "0.000000");
        assert_eq!(format_amount(COIN), "1.000000");
        assert_eq!(format_amount(1_500_001), "1.500001");
    }

    #[test]
    fn hardened_offset_is_top_bit() {
        assert_eq!(HARDENED_OFFSET, 1 << 31);
    }
}
