//! Input selection under a grouping policy.
//!
//! Selection and fee estimation iterate to a fixed point: inputs are picked
//! for `amount + fee_guess`, the fee is recomputed for the resulting shape,
//! and selection repeats with the new fee until the chosen inputs cover it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;

use tern_core::address::Address;
use tern_core::constants::MAX_TX_SIZE;
use tern_core::error::TransactionError;
use tern_core::types::{TxOutput, Utxo};

use crate::error::WalletError;
use crate::fee::FeePolicy;

/// Upper bound on select/re-estimate rounds.
pub const MAX_FEE_ITERATIONS: usize = 64;

/// How inputs are grouped when spending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum GroupingPolicy {
    /// Spend every UTXO of the sending addresses.
    #[default]
    OptimizeForSecurity,
    /// Spend as few UTXOs as possible, largest first.
    OptimizeForSize,
}

/// A payment request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payment {
    pub receiver: Address,
    pub amount: u64,
    /// Where surplus goes; a fresh internal-chain address.
    pub change_address: Address,
    /// Size of attached metadata in bytes.
    pub metadata_size: usize,
}

/// Inputs, outputs, change and fee of a transaction to build.
///
/// `sum(inputs) == sum(outputs) + fee + change` always holds for plans
/// returned by [`InputSelector`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpendPlan {
    pub inputs: Vec<Utxo>,
    pub outputs: Vec<TxOutput>,
    pub change: Option<TxOutput>,
    pub fee: u64,
    /// Size of the metadata the plan was priced for.
    pub metadata_size: usize,
}

impl SpendPlan {
    pub fn input_total(&self) -> Option<u64> {
        self.inputs.iter().try_fold(0u64, |acc, u| acc.checked_add(u.amount))
    }

    /// Payment outputs followed by change, as they appear in the transaction.
    pub fn all_outputs(&self) -> Vec<TxOutput> {
        self.outputs.iter().cloned().chain(self.change.clone()).collect()
    }

    /// Verify value conservation.
    pub fn check_conservation(&self) -> Result<(), WalletError> {
        let inputs = self.input_total().ok_or(TransactionError::ValueOverflow)?;
        let spent = self
            .all_outputs()
            .iter()
            .try_fold(self.fee, |acc, o| acc.checked_add(o.amount))
            .ok_or(TransactionError::ValueOverflow)?;
        if inputs != spent {
            return Err(WalletError::InvalidAmount(format!(
                "plan does not conserve value: inputs {inputs}, outputs and fee {spent}"
            )));
        }
        Ok(())
    }
}

/// Chooses inputs and computes change and fee.
#[derive(Debug, Clone, Default)]
pub struct InputSelector {
    fees: FeePolicy,
}

impl InputSelector {
    pub fn new(fees: FeePolicy) -> Self {
        Self { fees }
    }

    pub fn fee_policy(&self) -> &FeePolicy {
        &self.fees
    }

    /// Plan a payment from `utxos`.
    ///
    /// # Errors
    /// - `InvalidAmount` for a zero amount
    /// - `RedeemAddress` if the receiver is a redemption address
    /// - `SameAddress` if the receiver is the only sending address
    /// - `AllFundsAlreadyAtReceiver` if only receiver-held funds would cover it
    /// - `TransactionTooLarge` if covering it takes more inputs than
    ///   [`FeePolicy::max_inputs`] allows
    /// - `NotEnoughMoney` / `InsufficientFundsForFee` otherwise
    pub fn select(
        &self,
        utxos: &[Utxo],
        payment: &Payment,
        policy: GroupingPolicy,
    ) -> Result<SpendPlan, WalletError> {
        if payment.amount == 0 {
            return Err(WalletError::InvalidAmount("amount must be non-zero".into()));
        }
        if payment.receiver.is_redeem() {
            return Err(WalletError::RedeemAddress);
        }
        let senders: BTreeSet<&Address> = utxos.iter().map(|u| &u.owner).collect();
        if !senders.is_empty() && senders.iter().all(|a| **a == payment.receiver) {
            return Err(WalletError::SameAddress);
        }

        let (mut spendable, at_receiver): (Vec<&Utxo>, Vec<&Utxo>) =
            utxos.iter().partition(|u| u.owner != payment.receiver);
        // Largest first; ties broken by outpoint so plans are reproducible.
        spendable.sort_by(|a, b| b.amount.cmp(&a.amount).then(a.outpoint().cmp(&b.outpoint())));

        let available = total(spendable.iter().copied())?;
        let held_by_receiver = total(at_receiver.iter().copied())?;
        let meta = payment.metadata_size;

        // Priced with room for change so the finished plan always fits.
        let max_inputs = FeePolicy::max_inputs(2, meta);

        let mut fee = self.fees.estimate_fee(1, 1, meta);
        for round in 0..MAX_FEE_ITERATIONS {
            let target = payment.amount.saturating_add(fee);
            let selected = match policy {
                GroupingPolicy::OptimizeForSecurity => spendable.clone(),
                GroupingPolicy::OptimizeForSize => {
                    largest_first(&spendable[..spendable.len().min(max_inputs)], target)
                }
            };
            let selected_total = total(selected.iter().copied())?;
            if selected.is_empty() || selected_total < target {
                if spendable.len() > max_inputs && available >= target {
                    return Err(too_large(spendable.len(), 2, meta));
                }
                return Err(self.shortfall(payment.amount, fee, available, held_by_receiver));
            }
            if selected.len() > max_inputs {
                return Err(too_large(selected.len(), 2, meta));
            }

            let n = selected.len();
            let fee_no_change = self.fees.estimate_fee(n, 1, meta);
            if selected_total < payment.amount.saturating_add(fee_no_change) {
                debug!(round, fee, fee_no_change, "fee estimate grew, reselecting");
                fee = fee_no_change;
                continue;
            }

            let plan = self.finish(selected, selected_total, payment, fee_no_change);
            plan.check_conservation()?;
            debug!(
                inputs = plan.inputs.len(),
                fee = plan.fee,
                change = plan.change.as_ref().map(|c| c.amount).unwrap_or(0),
                ?policy,
                "spend plan ready"
            );
            return Ok(plan);
        }

        Err(WalletError::InsufficientFundsForFee {
            available,
            required: payment.amount.saturating_add(fee),
        })
    }

    /// Spend every UTXO not already at `receiver` to a single output, no change.
    pub fn sweep(&self, utxos: &[Utxo], receiver: &Address) -> Result<SpendPlan, WalletError> {
        if receiver.is_redeem() {
            return Err(WalletError::RedeemAddress);
        }
        let inputs: Vec<Utxo> = utxos.iter().filter(|u| u.owner != *receiver).cloned().collect();
        if inputs.is_empty() {
            return Err(if utxos.is_empty() {
                WalletError::NotEnoughMoney {
                    available: 0,
                    required: 1,
                }
            } else {
                WalletError::AllFundsAlreadyAtReceiver
            });
        }

        if inputs.len() > FeePolicy::max_inputs(1, 0) {
            return Err(too_large(inputs.len(), 1, 0));
        }

        let available = total(inputs.iter())?;
        let fee = self.fees.estimate_fee(inputs.len(), 1, 0);
        if available <= fee {
            return Err(WalletError::InsufficientFundsForFee {
                available,
                required: fee.saturating_add(1),
            });
        }
        let plan = SpendPlan {
            inputs,
            outputs: vec![TxOutput {
                address: receiver.clone(),
                amount: available - fee,
            }],
            change: None,
            fee,
            metadata_size: 0,
        };
        plan.check_conservation()?;
        Ok(plan)
    }

    /// Which error explains why `available` cannot pay `amount + fee`.
    fn shortfall(&self, amount: u64, fee: u64, available: u64, held_by_receiver: u64) -> WalletError {
        let required = amount.saturating_add(fee);
        if available.saturating_add(held_by_receiver) >= required {
            WalletError::AllFundsAlreadyAtReceiver
        } else if available < amount {
            WalletError::NotEnoughMoney {
                available,
                required: amount,
            }
        } else {
            WalletError::InsufficientFundsForFee { available, required }
        }
    }

    /// Route the surplus to change, or into the fee if it cannot pay for
    /// its own output.
    fn finish(&self, selected: Vec<&Utxo>, selected_total: u64, payment: &Payment, fee_no_change: u64) -> SpendPlan {
        let n = selected.len();
        let meta = payment.metadata_size;
        let surplus = selected_total - payment.amount - fee_no_change;
        let change_cost = self.fees.output_cost(n, 1, meta);

        let (change, fee) = if surplus > change_cost {
            let amount = surplus - change_cost;
            (
                Some(TxOutput {
                    address: payment.change_address.clone(),
                    amount,
                }),
                fee_no_change + change_cost,
            )
        } else {
            (None, fee_no_change + surplus)
        };

        SpendPlan {
            inputs: selected.into_iter().cloned().collect(),
            outputs: vec![TxOutput {
                address: payment.receiver.clone(),
                amount: payment.amount,
            }],
            change,
            fee,
            metadata_size: meta,
        }
    }
}

fn total<'a>(utxos: impl IntoIterator<Item = &'a Utxo>) -> Result<u64, WalletError> {
    utxos
        .into_iter()
        .try_fold(0u64, |acc, u| acc.checked_add(u.amount))
        .ok_or_else(|| TransactionError::ValueOverflow.into())
}

fn too_large(inputs: usize, outputs: usize, metadata_size: usize) -> WalletError {
    WalletError::TransactionTooLarge {
        size: FeePolicy::estimate_size(inputs, outputs, metadata_size),
        max: MAX_TX_SIZE as u64,
    }
}

/// Shortest largest-first prefix reaching `target`, or everything.
fn largest_first<'a>(sorted: &[&'a Utxo], target: u64) -> Vec<&'a Utxo> {
    let mut picked = Vec::new();
    let mut sum = 0u64;
    for utxo in sorted {
        if sum >= target {
            break;
        }
        picked.push(*utxo);
        sum = sum.saturating_add(utxo.amount);
    }
    picked
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tern_core::address::Network;
    use tern_core::types::Hash256;

    fn addr(b: u8) -> Address {
        Address::from_key_hash(Hash256([b; 32]), Network::Testnet)
    }

    fn utxo(owner: u8, n: u8, amount: u64) -> Utxo {
        Utxo {
            tx_hash: Hash256([n; 32]),
            output_index: n as u32,
            owner: addr(owner),
            amount,
        }
    }

    /// `count` UTXOs of `amount` each, with distinct outpoints.
    fn many(count: u16, amount: u64) -> Vec<Utxo> {
        (0..count)
            .map(|i| {
                let mut hash = [0u8; 32];
                hash[..2].copy_from_slice(&i.to_be_bytes());
                Utxo {
                    tx_hash: Hash256(hash),
                    output_index: 0,
                    owner: addr(1),
                    amount,
                }
            })
            .collect()
    }

    fn payment(amount: u64) -> Payment {
        Payment {
            receiver: addr(0xAA),
            amount,
            change_address: addr(0xCC),
            metadata_size: 0,
        }
    }

    fn selector() -> InputSelector {
        InputSelector::default()
    }

    #[test]
    fn single_utxo_with_change() {
        let utxos = vec![utxo(1, 1, 1_000_000)];
        let plan = selector()
            .select(&utxos, &payment(500_000), GroupingPolicy::OptimizeForSize)
            .unwrap();
        assert_eq!(plan.inputs, utxos);
        let fee = FeePolicy::default().estimate_fee(1, 2, 0);
        assert_eq!(plan.fee, fee);
        let change = plan.change.as_ref().unwrap();
        assert_eq!(change.address, addr(0xCC));
        assert_eq!(change.amount, 500_000 - fee);
        assert_eq!(plan.outputs[0].amount, 500_000);
    }

    #[test]
    fn more_than_available_is_not_enough_money() {
        let utxos = vec![utxo(1, 1, 1_000_000)];
        let err = selector()
            .select(&utxos, &payment(2_000_000), GroupingPolicy::OptimizeForSize)
            .unwrap_err();
        assert!(matches!(err, WalletError::NotEnoughMoney { available: 1_000_000, .. }));
    }

    #[test]
    fn covers_amount_but_not_fee() {
        let utxos = vec![utxo(1, 1, 1_000_000)];
        let err = selector()
            .select(&utxos, &payment(999_000), GroupingPolicy::OptimizeForSecurity)
            .unwrap_err();
        assert!(matches!(err, WalletError::InsufficientFundsForFee { .. }));
    }

    #[test]
    fn sender_equals_receiver() {
        let utxos = vec![utxo(0xAA, 1, 1_000_000)];
        let err = selector()
            .select(&utxos, &payment(1), GroupingPolicy::OptimizeForSize)
            .unwrap_err();
        assert_eq!(err, WalletError::SameAddress);
    }

    #[test]
    fn redeem_receiver_rejected() {
        let mut p = payment(1);
        p.receiver = Address::redeem(Hash256([3; 32]), Network::Testnet);
        let err = selector()
            .select(&[utxo(1, 1, 10_000_000)], &p, GroupingPolicy::OptimizeForSize)
            .unwrap_err();
        assert_eq!(err, WalletError::RedeemAddress);
    }

    #[test]
    fn zero_amount_rejected() {
        let err = selector()
            .select(&[utxo(1, 1, 10)], &payment(0), GroupingPolicy::OptimizeForSize)
            .unwrap_err();
        assert!(matches!(err, WalletError::InvalidAmount(_)));
    }

    #[test]
    fn empty_utxos_not_enough_money() {
        let err = selector()
            .select(&[], &payment(5), GroupingPolicy::OptimizeForSize)
            .unwrap_err();
        assert!(matches!(err, WalletError::NotEnoughMoney { available: 0, .. }));
    }

    #[test]
    fn receiver_funds_never_spent() {
        let utxos = vec![utxo(0xAA, 1, 50_000_000), utxo(1, 2, 3_000_000)];
        let plan = selector()
            .select(&utxos, &payment(1_000_000), GroupingPolicy::OptimizeForSecurity)
            .unwrap();
        assert!(plan.inputs.iter().all(|u| u.owner != addr(0xAA)));
    }

    #[test]
    fn all_funds_at_receiver() {
        let utxos = vec![utxo(0xAA, 1, 50_000_000), utxo(1, 2, 300_000)];
        let err = selector()
            .select(&utxos, &payment(1_000_000), GroupingPolicy::OptimizeForSize)
            .unwrap_err();
        assert_eq!(err, WalletError::AllFundsAlreadyAtReceiver);
    }

    #[test]
    fn security_spends_everything() {
        let utxos = vec![utxo(1, 1, 5_000_000), utxo(1, 2, 700_000), utxo(2, 3, 900_000)];
        let plan = selector()
            .select(&utxos, &payment(1_000_000), GroupingPolicy::OptimizeForSecurity)
            .unwrap();
        assert_eq!(plan.inputs.len(), 3);
        plan.check_conservation().unwrap();
    }

    #[test]
    fn size_picks_fewest_largest_first() {
        let utxos = vec![utxo(1, 1, 700_000), utxo(1, 2, 5_000_000), utxo(2, 3, 900_000)];
        let plan = selector()
            .select(&utxos, &payment(1_000_000), GroupingPolicy::OptimizeForSize)
            .unwrap();
        assert_eq!(plan.inputs.len(), 1);
        assert_eq!(plan.inputs[0].amount, 5_000_000);
    }

    #[test]
    fn size_reselects_when_fee_grows() {
        let fees = FeePolicy::default();
        // Two inputs exactly cover amount + the one-input fee guess, but not
        // the two-input fee; a third input is needed.
        let one_in = fees.estimate_fee(1, 1, 0);
        let amount = 1_000_000;
        let utxos = vec![
            utxo(1, 1, (amount + one_in) / 2 + 1),
            utxo(1, 2, (amount + one_in) / 2 + 1),
            utxo(1, 3, 400_000),
        ];
        let plan = selector()
            .select(&utxos, &payment(amount), GroupingPolicy::OptimizeForSize)
            .unwrap();
        assert_eq!(plan.inputs.len(), 3);
        assert!(plan.fee >= fees.estimate_fee(3, 1, 0));
        plan.check_conservation().unwrap();
    }

    #[test]
    fn dust_surplus_absorbed_into_fee() {
        let fees = FeePolicy::default();
        let fee1 = fees.estimate_fee(1, 1, 0);
        let amount = 1_000_000;
        let utxos = vec![utxo(1, 1, amount + fee1 + 10)];
        let plan = selector()
            .select(&utxos, &payment(amount), GroupingPolicy::OptimizeForSize)
            .unwrap();
        assert!(plan.change.is_none());
        assert_eq!(plan.fee, fee1 + 10);
        plan.check_conservation().unwrap();
    }

    #[test]
    fn exact_amount_has_no_change() {
        let fee1 = FeePolicy::default().estimate_fee(1, 1, 0);
        let utxos = vec![utxo(1, 1, 1_000 + fee1)];
        let plan = selector()
            .select(&utxos, &payment(1_000), GroupingPolicy::OptimizeForSecurity)
            .unwrap();
        assert!(plan.change.is_none());
        assert_eq!(plan.fee, fee1);
    }

    #[test]
    fn metadata_raises_fee() {
        let utxos = vec![utxo(1, 1, 10_000_000)];
        let mut p = payment(1_000_000);
        let plain = selector().select(&utxos, &p, GroupingPolicy::OptimizeForSize).unwrap();
        p.metadata_size = 500;
        let with_meta = selector().select(&utxos, &p, GroupingPolicy::OptimizeForSize).unwrap();
        assert!(with_meta.fee > plain.fee);
        assert_eq!(with_meta.metadata_size, 500);
    }

    #[test]
    fn security_over_size_limit_is_too_large() {
        let err = selector()
            .select(&many(600, 1_000_000), &payment(1_000_000), GroupingPolicy::OptimizeForSecurity)
            .unwrap_err();
        match err {
            WalletError::TransactionTooLarge { size, max } => {
                assert_eq!(size, FeePolicy::estimate_size(600, 2, 0));
                assert!(size > max);
                assert_eq!(max, MAX_TX_SIZE as u64);
            }
            other => panic!("expected TransactionTooLarge, got {other:?}"),
        }
    }

    #[test]
    fn unaffordable_oversized_spend_is_not_enough_money() {
        let err = selector()
            .select(&many(600, 1_000), &payment(10_000_000), GroupingPolicy::OptimizeForSecurity)
            .unwrap_err();
        assert!(matches!(err, WalletError::NotEnoughMoney { available: 600_000, .. }), "{err:?}");
    }

    #[test]
    fn security_at_size_limit_still_plans() {
        let n = FeePolicy::max_inputs(2, 0);
        let utxos = many(n as u16, 1_000_000);
        let plan = selector()
            .select(&utxos, &payment(1_000_000), GroupingPolicy::OptimizeForSecurity)
            .unwrap();
        assert_eq!(plan.inputs.len(), n);
        assert!(FeePolicy::estimate_size(n, plan.all_outputs().len(), 0) <= MAX_TX_SIZE as u64);
    }

    #[test]
    fn size_needing_too_many_inputs_is_too_large() {
        // 600 x 100_000 would cover it, the largest 487 would not.
        let err = selector()
            .select(&many(600, 100_000), &payment(50_000_000), GroupingPolicy::OptimizeForSize)
            .unwrap_err();
        assert!(matches!(err, WalletError::TransactionTooLarge { .. }), "{err:?}");
    }

    #[test]
    fn size_within_limit_ignores_surplus_utxos() {
        let plan = selector()
            .select(&many(600, 100_000), &payment(20_000_000), GroupingPolicy::OptimizeForSize)
            .unwrap();
        assert!(plan.inputs.len() < FeePolicy::max_inputs(2, 0));
        plan.check_conservation().unwrap();
    }

    #[test]
    fn size_limit_shrinks_with_metadata() {
        let mut p = payment(1_000_000);
        p.metadata_size = MAX_TX_SIZE;
        let err = selector()
            .select(&many(3, 10_000_000), &p, GroupingPolicy::OptimizeForSize)
            .unwrap_err();
        assert!(matches!(err, WalletError::TransactionTooLarge { .. }), "{err:?}");
    }

    #[test]
    fn sweep_over_size_limit_is_too_large() {
        let err = selector().sweep(&many(600, 1_000_000), &addr(0xAA)).unwrap_err();
        assert!(matches!(err, WalletError::TransactionTooLarge { .. }), "{err:?}");
    }

    #[test]
    fn sweep_spends_all_without_change() {
        let utxos = vec![utxo(1, 1, 2_000_000), utxo(2, 2, 3_000_000)];
        let plan = selector().sweep(&utxos, &addr(0xAA)).unwrap();
        let fee = FeePolicy::default().estimate_fee(2, 1, 0);
        assert_eq!(plan.inputs.len(), 2);
        assert!(plan.change.is_none());
        assert_eq!(plan.outputs[0].amount, 5_000_000 - fee);
        assert_eq!(plan.fee, fee);
    }

    #[test]
    fn sweep_dust_fails() {
        let err = selector().sweep(&[utxo(1, 1, 100)], &addr(0xAA)).unwrap_err();
        assert!(matches!(err, WalletError::InsufficientFundsForFee { .. }));
        let err = selector().sweep(&[utxo(0xAA, 1, 100)], &addr(0xAA)).unwrap_err();
        assert_eq!(err, WalletError::AllFundsAlreadyAtReceiver);
    }

    #[test]
    fn policy_serde_names() {
        assert_eq!(
            serde_json::to_string(&GroupingPolicy::OptimizeForSize).unwrap(),
            "\"OptimizeForSize\""
        );
        let p: GroupingPolicy = serde_json::from_str("\"OptimizeForSecurity\"").unwrap();
        assert_eq!(p, GroupingPolicy::default());
    }

    // --- proptest ---

    proptest! {
        #[test]
        fn plans_conserve_value(
            amounts in prop::collection::vec(1u64..50_000_000, 1..12),
            amount in 1u64..100_000_000,
            size in any::<bool>(),
        ) {
            let utxos: Vec<Utxo> = amounts
                .iter()
                .enumerate()
                .map(|(i, &a)| utxo(1 + (i % 3) as u8, i as u8, a))
                .collect();
            let policy = if size { GroupingPolicy::OptimizeForSize } else { GroupingPolicy::OptimizeForSecurity };
            let sel = selector();
            match sel.select(&utxos, &payment(amount), policy) {
                Ok(plan) => {
                    let inputs = plan.input_total().unwrap();
                    let change = plan.change.as_ref().map(|c| c.amount).unwrap_or(0);
                    prop_assert_eq!(inputs, amount + plan.fee + change);
                    prop_assert!(plan.fee >= sel.fee_policy().estimate_fee(plan.inputs.len(), 1, 0));
                    prop_assert!(change == 0 || plan.change.is_some());
                    prop_assert!(plan.change.as_ref().is_none_or(|c| c.amount > 0));
                    let size = FeePolicy::estimate_size(plan.inputs.len(), plan.all_outputs().len(), 0);
                    prop_assert!(size <= MAX_TX_SIZE as u64);
                }
                Err(e) => {
                    let ok = matches!(
                        e,
                        WalletError::NotEnoughMoney { .. } | WalletError::InsufficientFundsForFee { .. }
                    );
                    prop_assert!(ok, "unexpected error {:?}", e);
                }
            }
        }
    }
}
