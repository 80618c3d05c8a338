use super::money::Amount;
use super::payment::{FlowType, Payment, PaymentId, PaymentStatus};
use super::split::Split;
use crate::error::EngineError;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EscrowId(pub Uuid);

impl EscrowId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EscrowId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EscrowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier the contract assigns in its `EscrowCreated` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OnChainEscrowId(pub u128);

impl fmt::Display for OnChainEscrowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A 32-byte transaction hash in `0x`-prefixed lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TxHash(String);

impl TxHash {
    pub fn parse(value: &str) -> Result<Self, EngineError> {
        let digits = value.strip_prefix("0x").unwrap_or(value);
        if digits.len() != 64 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(EngineError::ValidationError(format!(
                "Invalid transaction hash: {value}"
            )));
        }
        Ok(Self(format!("0x{}", digits.to_lowercase())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for TxHash {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<TxHash> for String {
    fn from(hash: TxHash) -> Self {
        hash.0
    }
}

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscrowStatus {
    /// Row persisted, contract creation not yet confirmed.
    Pending,
    Created,
    Funded,
    Released,
    Completed,
    Disputed,
}

impl EscrowStatus {
    pub fn can_dispute(&self) -> bool {
        matches!(
            self,
            EscrowStatus::Pending
                | EscrowStatus::Created
                | EscrowStatus::Funded
                | EscrowStatus::Released
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Escrow {
    pub id: EscrowId,
    pub payment_id: PaymentId,
    pub custody_amount: Amount,
    pub immediate_amount: Amount,
    /// Absolute end of the custody window. Never recomputed.
    pub custody_end: DateTime<Utc>,
    pub on_chain_id: Option<OnChainEscrowId>,
    pub creation_tx_hash: Option<TxHash>,
    pub funding_tx_hash: Option<TxHash>,
    /// Canonical proof of release.
    pub release_tx_hash: Option<TxHash>,
    pub status: EscrowStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Escrow {
    /// Opens the custody record for `payment`, fixing the window end at `now`.
    pub fn open(payment: &Payment, split: Split, now: DateTime<Utc>) -> Result<Self, EngineError> {
        if !split.needs_custody() {
            return Err(EngineError::ValidationError(format!(
                "Payment {} has no custody portion",
                payment.id
            )));
        }
        if split.total() != payment.amount {
            return Err(EngineError::Structural(format!(
                "Split of payment {} does not sum to its amount",
                payment.id
            )));
        }
        let seconds = i64::try_from(payment.custody_seconds).map_err(|_| {
            EngineError::ValidationError(format!(
                "Custody duration {} is out of range",
                payment.custody_seconds
            ))
        })?;
        let custody_end = Duration::try_seconds(seconds)
            .and_then(|window| now.checked_add_signed(window))
            .ok_or_else(|| EngineError::ValidationError("Custody window overflows".into()))?;
        Ok(Self {
            id: EscrowId::new(),
            payment_id: payment.id,
            custody_amount: split.custody,
            immediate_amount: split.immediate,
            custody_end,
            on_chain_id: None,
            creation_tx_hash: None,
            funding_tx_hash: None,
            release_tx_hash: None,
            status: EscrowStatus::Pending,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn is_released(&self) -> bool {
        self.release_tx_hash.is_some()
    }

    pub fn on_chain_id(&self) -> Result<OnChainEscrowId, EngineError> {
        self.on_chain_id.ok_or_else(|| {
            EngineError::Structural(format!("Escrow {} has no on-chain id", self.id))
        })
    }

    /// Checks that this escrow and `payment` reference each other.
    pub fn check_link(&self, payment: &Payment) -> Result<(), EngineError> {
        if self.payment_id != payment.id || payment.escrow_id != Some(self.id) {
            return Err(EngineError::Structural(format!(
                "Escrow {} and payment {} do not reference each other",
                self.id, payment.id
            )));
        }
        Ok(())
    }
}

/// Why a release was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseTrigger {
    Scheduled,
    Manual,
}

/// Release eligibility of a funded escrow.
///
/// The custody window is an upper bound for every flow. In a dual-approval
/// flow both approvals release early. An expired window releases even without
/// approvals and does not open an extra dispute period.
pub fn release_due(escrow: &Escrow, payment: &Payment, now: DateTime<Utc>) -> bool {
    if escrow.status != EscrowStatus::Funded || payment.status == PaymentStatus::Disputed {
        return false;
    }
    if now >= escrow.custody_end {
        return true;
    }
    payment.flow == FlowType::DualApproval && payment.both_approved()
}
