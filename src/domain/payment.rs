use super::escrow::EscrowId;
use super::money::{Amount, CustodyPercent};
use super::split::Split;
use crate::error::EngineError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PaymentId(pub Uuid);

impl PaymentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PaymentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PaymentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Funded,
    Escrowed,
    Processing,
    Completed,
    Disputed,
    Cancelled,
}

impl PaymentStatus {
    /// Automation never advances a payment out of these states.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PaymentStatus::Completed | PaymentStatus::Disputed | PaymentStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowType {
    /// Custody is released when the window ends.
    Standard,
    /// Both parties may approve to release before the window ends.
    DualApproval,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Party {
    Payer,
    Beneficiary,
}

/// Beneficiary bank account the rail pays out to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutAccount {
    pub clabe: String,
    pub holder_name: String,
}

/// Opaque escrow metadata forwarded to the contract.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowMetadata {
    pub vertical: Option<String>,
    pub conditions: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub id: PaymentId,
    pub amount: Amount,
    pub currency: String,
    pub custody_percent: CustodyPercent,
    /// Length of the custody window, applied once when the escrow row is created.
    pub custody_seconds: u64,
    pub flow: FlowType,
    pub payer_id: String,
    pub beneficiary_id: String,
    /// Virtual account the payer must fund.
    pub deposit_account: Option<String>,
    pub payout_account: PayoutAccount,
    pub metadata: EscrowMetadata,
    /// External id of the consumed deposit. Set exactly once.
    pub dedup_reference: Option<String>,
    pub split: Option<Split>,
    pub escrow_id: Option<EscrowId>,
    pub status: PaymentStatus,
    pub payer_approved: bool,
    pub beneficiary_approved: bool,
    /// Reason automation is suspended after a structural mismatch.
    pub automation_hold: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A change to one field of a stored payment.
///
/// Stores apply a change to the record they currently hold, under their write
/// lock, so concurrent changes to different fields never overwrite each other.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentChange {
    /// Compare-and-set on the status.
    Status {
        expected: PaymentStatus,
        new: PaymentStatus,
    },
    /// Set-once virtual account, only while the payment awaits its deposit.
    DepositAccount(String),
    Approval(Party),
    Hold(String),
    ClearHold,
}

/// Fields a caller supplies when registering a new payment.
#[derive(Debug, Clone)]
pub struct NewPayment {
    pub amount: Amount,
    pub currency: String,
    pub custody_percent: CustodyPercent,
    pub custody_seconds: u64,
    pub flow: FlowType,
    pub payer_id: String,
    pub beneficiary_id: String,
    pub deposit_account: Option<String>,
    pub payout_account: PayoutAccount,
    pub metadata: EscrowMetadata,
}

impl Payment {
    pub fn new(request: NewPayment, now: DateTime<Utc>) -> Result<Self, EngineError> {
        if request.amount.is_zero() {
            return Err(EngineError::ValidationError(
                "Payment amount must be positive".to_string(),
            ));
        }
        if request.payout_account.clabe.trim().is_empty() {
            return Err(EngineError::ValidationError(
                "Payout account is required".to_string(),
            ));
        }
        Ok(Self {
            id: PaymentId::new(),
            amount: request.amount,
            currency: request.currency.to_lowercase(),
            custody_percent: request.custody_percent,
            custody_seconds: request.custody_seconds,
            flow: request.flow,
            payer_id: request.payer_id,
            beneficiary_id: request.beneficiary_id,
            deposit_account: request.deposit_account,
            payout_account: request.payout_account,
            metadata: request.metadata,
            dedup_reference: None,
            split: None,
            escrow_id: None,
            status: PaymentStatus::Pending,
            payer_approved: false,
            beneficiary_approved: false,
            automation_hold: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Whether the deposit matcher may still consume a deposit for this payment.
    pub fn awaiting_deposit(&self) -> bool {
        self.status == PaymentStatus::Pending
            && self.deposit_account.is_some()
            && self.dedup_reference.is_none()
            && self.automation_hold.is_none()
    }

    pub fn is_automatable(&self) -> bool {
        !self.status.is_terminal() && self.automation_hold.is_none()
    }

    pub fn both_approved(&self) -> bool {
        self.payer_approved && self.beneficiary_approved
    }

    /// Applies `change` in place.
    ///
    /// Returns `false` when the change was already in effect.
    pub fn apply(
        &mut self,
        change: &PaymentChange,
        at: DateTime<Utc>,
    ) -> Result<bool, EngineError> {
        let changed = match change {
            PaymentChange::Status { expected, new } => {
                if self.status != *expected {
                    return Err(EngineError::Conflict(format!(
                        "payment {} is {:?}, expected {:?}",
                        self.id, self.status, expected
                    )));
                }
                self.status = *new;
                true
            }
            PaymentChange::DepositAccount(account) => match &self.deposit_account {
                Some(existing) if existing == account => false,
                Some(existing) => {
                    return Err(EngineError::Structural(format!(
                        "payment {} already has deposit account {existing}",
                        self.id
                    )));
                }
                None if self.status != PaymentStatus::Pending => {
                    return Err(EngineError::ValidationError(format!(
                        "payment {} is no longer awaiting a deposit",
                        self.id
                    )));
                }
                None => {
                    self.deposit_account = Some(account.clone());
                    true
                }
            },
            PaymentChange::Approval(party) => {
                if self.status.is_terminal() {
                    return Err(EngineError::Terminal(format!(
                        "payment {} is {:?}",
                        self.id, self.status
                    )));
                }
                let flag = match party {
                    Party::Payer => &mut self.payer_approved,
                    Party::Beneficiary => &mut self.beneficiary_approved,
                };
                !std::mem::replace(flag, true)
            }
            PaymentChange::Hold(reason) => {
                if self.automation_hold.is_some() {
                    false
                } else {
                    self.automation_hold = Some(reason.clone());
                    true
                }
            }
            PaymentChange::ClearHold => self.automation_hold.take().is_some(),
        };
        if changed {
            self.updated_at = at;
        }
        Ok(changed)
    }

    /// The persisted split, which every post-match stage relies on.
    pub fn split(&self) -> Result<Split, EngineError> {
        self.split.ok_or_else(|| {
            EngineError::Structural(format!("Payment {} has no persisted split", self.id))
        })
    }
}
