use crate::config::EngineSettings;
use crate::domain::escrow::{Escrow, EscrowId, EscrowStatus};
use crate::domain::event::{EventKind, PaymentEvent};
use crate::domain::payment::{Payment, PaymentChange, PaymentId, PaymentStatus};
use crate::domain::ports::{ClockRef, CustodialRailRef, EscrowContractRef, LedgerStoreRef};
use crate::error::{EngineError, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Collaborators shared by every stage of the engine.
///
/// Holds no state of its own: everything a stage decides is read from the
/// ledger on each call.
#[derive(Clone)]
pub struct Context {
    pub store: LedgerStoreRef,
    pub rail: CustodialRailRef,
    pub contract: EscrowContractRef,
    pub clock: ClockRef,
    pub settings: Arc<EngineSettings>,
}

impl Context {
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub async fn record(
        &self,
        payment_id: PaymentId,
        kind: EventKind,
        description: impl Into<String>,
    ) -> Result<()> {
        self.store
            .append_event(PaymentEvent::automatic(payment_id, kind, description, self.now()))
            .await
    }

    pub async fn record_manual(
        &self,
        payment_id: PaymentId,
        kind: EventKind,
        description: impl Into<String>,
    ) -> Result<()> {
        self.store
            .append_event(PaymentEvent::manual(payment_id, kind, description, self.now()))
            .await
    }

    pub async fn load_payment(&self, id: PaymentId) -> Result<Payment> {
        self.store
            .get_payment(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("payment {id}")))
    }

    pub async fn load_escrow(&self, id: EscrowId) -> Result<Escrow> {
        self.store
            .get_escrow(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("escrow {id}")))
    }

    /// Loads the escrow `payment` points at and checks it points back.
    pub async fn linked_escrow(&self, payment: &Payment) -> Result<Option<Escrow>> {
        let Some(escrow_id) = payment.escrow_id else {
            return Ok(None);
        };
        let escrow = self.store.get_escrow(escrow_id).await?.ok_or_else(|| {
            EngineError::Structural(format!(
                "payment {} links missing escrow {escrow_id}",
                payment.id
            ))
        })?;
        escrow.check_link(payment)?;
        Ok(Some(escrow))
    }

    /// Moves the stored payment from `payment.status` to `status` and
    /// refreshes `payment` with what was stored.
    pub async fn transition_payment(
        &self,
        payment: &mut Payment,
        status: PaymentStatus,
    ) -> Result<()> {
        let change = PaymentChange::Status {
            expected: payment.status,
            new: status,
        };
        *payment = self
            .store
            .change_payment(payment.id, &change, self.now())
            .await?
            .ok_or_else(|| EngineError::internal(format!("payment {} not moved", payment.id)))?;
        Ok(())
    }

    pub async fn save_escrow(&self, escrow: &mut Escrow, expected: EscrowStatus) -> Result<()> {
        escrow.updated_at = self.now();
        self.store.update_escrow(escrow, expected).await
    }

    /// Excludes `payment_id` from automation until an operator clears it.
    pub async fn hold(&self, payment_id: PaymentId, reason: &str) -> Result<()> {
        let change = PaymentChange::Hold(reason.to_string());
        if self.store.change_payment(payment_id, &change, self.now()).await?.is_none() {
            return Ok(());
        }
        tracing::warn!(%payment_id, reason, "holding payment from automation");
        self.record(
            payment_id,
            EventKind::AutomationHeld {
                reason: reason.to_string(),
            },
            format!("Automation held: {reason}"),
        )
        .await
    }
}
