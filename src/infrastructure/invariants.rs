//! Record invariants shared by every `LedgerStore` backend.
//!
//! Backends call these while holding their write lock so the check and the
//! write are one step.

use crate::domain::escrow::{Escrow, EscrowStatus};
use crate::domain::event::{PaymentEvent, Step, StepState, step_state};
use crate::domain::payment::{Payment, PaymentStatus};
use crate::error::{EngineError, Result};
use std::fmt::Debug;

fn set_once_or_fill<T: PartialEq + Debug>(
    field: &str,
    stored: &Option<T>,
    new: &Option<T>,
) -> Result<()> {
    match (stored, new) {
        (Some(old), new) if new.as_ref() != Some(old) => Err(EngineError::Structural(format!(
            "{field} is immutable once set (stored {old:?}, attempted {new:?})"
        ))),
        _ => Ok(()),
    }
}

pub fn check_escrow_update(
    stored: &Escrow,
    new: &Escrow,
    expected: EscrowStatus,
    payment: Option<&Payment>,
) -> Result<()> {
    if stored.status != expected {
        return Err(EngineError::Conflict(format!(
            "escrow {} is {:?}, expected {:?}",
            stored.id, stored.status, expected
        )));
    }
    if stored.payment_id != new.payment_id
        || stored.custody_amount != new.custody_amount
        || stored.immediate_amount != new.immediate_amount
        || stored.custody_end != new.custody_end
    {
        return Err(EngineError::Structural(format!(
            "escrow {} link, amounts and custody window are immutable",
            stored.id
        )));
    }
    match payment {
        Some(payment) => new.check_link(payment)?,
        None => {
            return Err(EngineError::Structural(format!(
                "escrow {} references missing payment {}",
                stored.id, stored.payment_id
            )));
        }
    }
    set_once_or_fill("on_chain_id", &stored.on_chain_id, &new.on_chain_id)?;
    set_once_or_fill("creation_tx_hash", &stored.creation_tx_hash, &new.creation_tx_hash)?;
    set_once_or_fill("funding_tx_hash", &stored.funding_tx_hash, &new.funding_tx_hash)?;
    set_once_or_fill("release_tx_hash", &stored.release_tx_hash, &new.release_tx_hash)?;
    Ok(())
}

pub fn check_new_escrow(escrow: &Escrow, payment: &Payment, existing: bool) -> Result<()> {
    if existing {
        return Err(EngineError::Conflict(format!("escrow {} already exists", escrow.id)));
    }
    if let Some(linked) = payment.escrow_id {
        return Err(EngineError::Conflict(format!(
            "payment {} already linked to escrow {linked}",
            payment.id
        )));
    }
    if escrow.payment_id != payment.id {
        return Err(EngineError::Structural(format!(
            "escrow {} does not belong to payment {}",
            escrow.id, payment.id
        )));
    }
    if escrow.custody_amount + escrow.immediate_amount != payment.amount {
        return Err(EngineError::Structural(format!(
            "escrow {} amounts do not sum to payment {}",
            escrow.id, payment.id
        )));
    }
    Ok(())
}

/// A deposit may only be consumed by a pending, unmatched payment.
pub fn can_consume(payment: &Payment) -> bool {
    payment.status == PaymentStatus::Pending && payment.dedup_reference.is_none()
}

pub fn check_claim(events: &[PaymentEvent], step: Step) -> Result<()> {
    match step_state(events, step) {
        StepState::Completed { .. } => Err(EngineError::Conflict(format!(
            "{step} already completed"
        ))),
        StepState::Open { .. } => Err(EngineError::InFlight(step.to_string())),
        StepState::NotStarted | StepState::Failed => Ok(()),
    }
}
