use super::money::{Amount, CustodyPercent};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

/// The division of a funded payment into its custody and immediate parts.
///
/// Computed once when the deposit is matched and persisted on the payment;
/// later stages read the stored amounts instead of recomputing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Split {
    pub custody: Amount,
    pub immediate: Amount,
}

impl Split {
    /// Splits `total` rounding the custody share half-up at the total's scale.
    pub fn compute(total: Amount, percent: CustodyPercent) -> Self {
        let scale = total.scale();
        let raw = total.value() * percent.value() / Decimal::ONE_HUNDRED;
        let mut custody = raw.round_dp_with_strategy(scale, RoundingStrategy::MidpointAwayFromZero);
        custody.rescale(scale);
        let mut immediate = total.value() - custody;
        immediate.rescale(scale);
        Self {
            custody: Amount::new(custody).unwrap_or(Amount::ZERO),
            immediate: Amount::new(immediate).unwrap_or(Amount::ZERO),
        }
    }

    pub fn total(&self) -> Amount {
        self.custody + self.immediate
    }

    pub fn needs_custody(&self) -> bool {
        !self.custody.is_zero()
    }

    pub fn has_immediate(&self) -> bool {
        !self.immediate.is_zero()
    }
}
