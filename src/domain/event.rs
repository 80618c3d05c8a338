use super::escrow::TxHash;
use super::payment::{Party, PaymentId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Which part of the payment a payout step moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Portion {
    Immediate,
    Custody,
}

/// Every money-moving call the engine can issue for a payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "step", content = "portion")]
pub enum Step {
    /// Rail withdrawal of the custody amount to the bridge wallet.
    CustodyWithdrawal,
    EscrowCreate,
    EscrowFund,
    EscrowRelease,
    /// Token transfer from the bridge wallet back to the rail.
    BridgeReturn,
    Redemption(Portion),
    Payout(Portion),
}

impl Step {
    pub fn is_on_chain(&self) -> bool {
        matches!(
            self,
            Step::EscrowCreate | Step::EscrowFund | Step::EscrowRelease | Step::BridgeReturn
        )
    }

    /// Deterministic idempotency key sent with rail requests for this step.
    pub fn reference(&self, payment_id: PaymentId) -> String {
        format!("{self}-{}", payment_id.0.simple())
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::CustodyWithdrawal => f.write_str("custody-withdrawal"),
            Step::EscrowCreate => f.write_str("escrow-create"),
            Step::EscrowFund => f.write_str("escrow-fund"),
            Step::EscrowRelease => f.write_str("escrow-release"),
            Step::BridgeReturn => f.write_str("bridge-return"),
            Step::Redemption(Portion::Immediate) => f.write_str("redeem-immediate"),
            Step::Redemption(Portion::Custody) => f.write_str("redeem-custody"),
            Step::Payout(Portion::Immediate) => f.write_str("payout-immediate"),
            Step::Payout(Portion::Custody) => f.write_str("payout-custody"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum EventKind {
    DepositAccountIssued { account: String },
    DepositMatched { deposit_id: String },
    DepositAmbiguous { candidates: Vec<String> },
    /// Claim appended atomically before a money-moving call.
    StepStarted { step: Step, reference: String },
    /// Chain transaction broadcast; its hash is the verification handle.
    StepSubmitted { step: Step, tx_hash: TxHash },
    StepCompleted { step: Step, reference: String },
    StepFailed { step: Step, reason: String },
    /// The call timed out or its response was lost.
    OutcomeUnknown { step: Step },
    ReleaseSkipped { release_tx_hash: TxHash },
    PayoutAccountRegistered { clabe: String },
    Approved { party: Party },
    Disputed { reason: String },
    Cancelled,
    AutomationHeld { reason: String },
    HoldCleared,
    Completed,
}

/// Immutable audit record attached to a payment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentEvent {
    pub id: Uuid,
    pub payment_id: PaymentId,
    pub kind: EventKind,
    pub description: String,
    pub automatic: bool,
    pub created_at: DateTime<Utc>,
}

impl PaymentEvent {
    pub fn automatic(
        payment_id: PaymentId,
        kind: EventKind,
        description: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            payment_id,
            kind,
            description: description.into(),
            automatic: true,
            created_at: now,
        }
    }

    pub fn manual(
        payment_id: PaymentId,
        kind: EventKind,
        description: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            automatic: false,
            ..Self::automatic(payment_id, kind, description, now)
        }
    }

    pub fn step(&self) -> Option<Step> {
        match &self.kind {
            EventKind::StepStarted { step, .. }
            | EventKind::StepSubmitted { step, .. }
            | EventKind::StepCompleted { step, .. }
            | EventKind::StepFailed { step, .. }
            | EventKind::OutcomeUnknown { step } => Some(*step),
            _ => None,
        }
    }

    /// Chain transaction this event ties to its payment.
    pub fn tx_hash(&self) -> Option<TxHash> {
        match &self.kind {
            EventKind::StepSubmitted { tx_hash, .. } => Some(tx_hash.clone()),
            EventKind::StepCompleted { step, reference } if step.is_on_chain() => {
                TxHash::parse(reference).ok()
            }
            _ => None,
        }
    }
}

/// What the event history says about one step.
#[derive(Debug, Clone, PartialEq)]
pub enum StepState {
    NotStarted,
    /// A claim exists without completion or failure.
    Open {
        reference: String,
        started_at: DateTime<Utc>,
        tx_hash: Option<TxHash>,
        outcome_unknown: bool,
    },
    Completed { reference: String },
    /// The last attempt failed definitively and may be retried.
    Failed,
}

impl StepState {
    pub fn is_completed(&self) -> bool {
        matches!(self, StepState::Completed { .. })
    }

    pub fn is_open(&self) -> bool {
        matches!(self, StepState::Open { .. })
    }
}

/// Folds the history of `step` from `events`, oldest first.
///
/// A completion is final: later events for the step never reopen it.
pub fn step_state(events: &[PaymentEvent], step: Step) -> StepState {
    let mut state = StepState::NotStarted;
    for event in events.iter().filter(|e| e.step() == Some(step)) {
        state = match (&event.kind, state) {
            (_, done @ StepState::Completed { .. }) => done,
            (EventKind::StepCompleted { reference, .. }, _) => StepState::Completed {
                reference: reference.clone(),
            },
            (EventKind::StepFailed { .. }, _) => StepState::Failed,
            (EventKind::StepStarted { reference, .. }, _) => StepState::Open {
                reference: reference.clone(),
                started_at: event.created_at,
                tx_hash: None,
                outcome_unknown: false,
            },
            (
                EventKind::StepSubmitted { tx_hash, .. },
                StepState::Open {
                    reference,
                    started_at,
                    outcome_unknown,
                    ..
                },
            ) => StepState::Open {
                reference,
                started_at,
                tx_hash: Some(tx_hash.clone()),
                outcome_unknown,
            },
            (
                EventKind::OutcomeUnknown { .. },
                StepState::Open {
                    reference,
                    started_at,
                    tx_hash,
                    ..
                },
            ) => StepState::Open {
                reference,
                started_at,
                tx_hash,
                outcome_unknown: true,
            },
            (_, other) => other,
        };
    }
    state
}
