//! Exactly-once execution of money-moving steps.
//!
//! Every external call is preceded by an atomic `step_started` claim. A claim
//! that is still open on a later run is never blindly retried: the previous
//! attempt is verified against the rail or the chain first.

use super::context::Context;
use crate::domain::escrow::{OnChainEscrowId, TxHash};
use crate::domain::event::{step_state, EventKind, Step, StepState};
use crate::domain::payment::PaymentId;
use crate::domain::ports::{
    CreateEscrowCall, OnChainStatus, RailTransfer, TransferStatus, TxReceipt,
};
use crate::error::{EngineError, FailureClass, Result};
use chrono::{DateTime, Duration, Utc};
use std::future::Future;

/// What a chain step acts on.
///
/// Lets the guard find the effect of an attempt that never reported its
/// transaction hash.
#[derive(Debug, Clone, Copy)]
pub enum ChainTarget<'a> {
    /// A new escrow, looked up among the escrows created by its payer.
    Create(&'a CreateEscrowCall),
    /// An existing escrow, verified through its contract status.
    Escrow(OnChainEscrowId),
    /// A token transfer out of the bridge wallet.
    Transfer { to: &'a str, amount: u128 },
}

/// What a previous attempt is proven to have done.
#[derive(Debug, Clone, PartialEq)]
pub enum Evidence {
    Rail(RailTransfer),
    Receipt(TxReceipt),
    /// The contract already reports the step's effect; no hash is known.
    OnChain(OnChainStatus),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Clearance {
    /// Completed earlier under `reference`.
    Done { reference: String },
    /// A previous attempt took effect and only needs to be recorded.
    Reconciled(Evidence),
    /// The step is claimed for this run under `reference`.
    Proceed { reference: String },
}

/// Result of driving a rail step to completion.
#[derive(Debug, Clone, PartialEq)]
pub enum RailOutcome {
    Executed(RailTransfer),
    Reconciled(RailTransfer),
    AlreadyDone,
}

/// Result of driving a chain step to confirmation.
#[derive(Debug, Clone, PartialEq)]
pub enum ChainOutcome {
    Confirmed(TxReceipt),
    /// Verified through contract state; the transaction hash is unknown.
    Verified(OnChainStatus),
}

#[derive(Clone)]
pub struct ReconciliationGuard {
    ctx: Context,
}

impl ReconciliationGuard {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    /// Decides whether `step` may be executed for `payment_id`.
    ///
    /// `target` is required for chain steps: it identifies the attempt's
    /// effect when no transaction hash was recorded.
    pub async fn clear(
        &self,
        payment_id: PaymentId,
        step: Step,
        target: Option<ChainTarget<'_>>,
    ) -> Result<Clearance> {
        let events = self.ctx.store.events(payment_id).await?;
        match step_state(&events, step) {
            StepState::Completed { reference } => Ok(Clearance::Done { reference }),
            StepState::NotStarted | StepState::Failed => self.claim(payment_id, step).await,
            StepState::Open {
                started_at,
                tx_hash,
                outcome_unknown,
                ..
            } => {
                let ttl = Duration::from_std(self.ctx.settings.claim_ttl)
                    .map_err(|e| EngineError::Config(format!("claim TTL: {e}")))?;
                if !outcome_unknown && self.ctx.now() - started_at < ttl {
                    return Err(EngineError::InFlight(format!("{step} for payment {payment_id}")));
                }
                tracing::info!(%payment_id, %step, "verifying unresolved attempt");
                self.verify(payment_id, step, started_at, tx_hash, target).await
            }
        }
    }

    async fn claim(&self, payment_id: PaymentId, step: Step) -> Result<Clearance> {
        let reference = step.reference(payment_id);
        self.ctx
            .store
            .claim_step(payment_id, step, &reference, self.ctx.now())
            .await?;
        Ok(Clearance::Proceed { reference })
    }

    /// Releases a stale claim proven to have had no effect and claims again.
    async fn reclaim(
        &self,
        payment_id: PaymentId,
        step: Step,
        reason: &str,
    ) -> Result<Clearance> {
        self.fail(payment_id, step, reason).await?;
        self.claim(payment_id, step).await
    }

    async fn verify(
        &self,
        payment_id: PaymentId,
        step: Step,
        started_at: DateTime<Utc>,
        tx_hash: Option<TxHash>,
        target: Option<ChainTarget<'_>>,
    ) -> Result<Clearance> {
        if !step.is_on_chain() {
            let reference = step.reference(payment_id);
            return match self.ctx.rail.find_transfer(&reference).await? {
                Some(transfer) if transfer.status != TransferStatus::Failed => {
                    Ok(Clearance::Reconciled(Evidence::Rail(transfer)))
                }
                Some(_) => {
                    self.reclaim(payment_id, step, "rail reports the transfer failed")
                        .await
                }
                None => {
                    self.reclaim(payment_id, step, "no matching transfer on the rail")
                        .await
                }
            };
        }

        if let Some(hash) = tx_hash {
            return self.verify_receipt(payment_id, step, &hash).await;
        }

        let target = target.ok_or_else(|| {
            EngineError::Structural(format!("{step} for payment {payment_id} has no chain target"))
        })?;
        match target {
            ChainTarget::Create(call) => {
                for created in self.ctx.contract.find_created_escrows(&call.payer).await? {
                    if !self.unowned(payment_id, &created.tx_hash).await? {
                        continue;
                    }
                    let escrow = self.ctx.contract.read_escrow(created.id).await?;
                    if escrow.amount == call.amount
                        && escrow.deadline == call.deadline
                        && escrow.payee.eq_ignore_ascii_case(&call.payee)
                        && escrow.token.eq_ignore_ascii_case(&call.token)
                    {
                        tracing::warn!(
                            %payment_id,
                            on_chain_id = %created.id,
                            tx = %created.tx_hash,
                            "adopting escrow created by an unconfirmed attempt"
                        );
                        return self.verify_receipt(payment_id, step, &created.tx_hash).await;
                    }
                }
                let reason = "no matching escrow was created";
                self.reclaim_after_ttl(payment_id, step, started_at, reason).await
            }
            ChainTarget::Transfer { to, amount } => {
                let from = self.ctx.settings.bridge_wallet.as_str();
                for transfer in self.ctx.contract.find_token_transfers(from, to).await? {
                    if transfer.amount != amount
                        || !self.unowned(payment_id, &transfer.tx_hash).await?
                    {
                        continue;
                    }
                    tracing::warn!(
                        %payment_id,
                        tx = %transfer.tx_hash,
                        "adopting transfer sent by an unconfirmed attempt"
                    );
                    return self.verify_receipt(payment_id, step, &transfer.tx_hash).await;
                }
                let reason = "no matching transfer was sent";
                self.reclaim_after_ttl(payment_id, step, started_at, reason).await
            }
            ChainTarget::Escrow(id) => {
                let status = self.ctx.contract.read_escrow(id).await?.status;
                let applied = match step {
                    Step::EscrowFund => {
                        matches!(status, OnChainStatus::Funded | OnChainStatus::Released)
                    }
                    Step::EscrowRelease => status == OnChainStatus::Released,
                    _ => {
                        return Err(EngineError::Structural(format!(
                            "{step} cannot be verified through escrow {id}"
                        )));
                    }
                };
                if applied {
                    Ok(Clearance::Reconciled(Evidence::OnChain(status)))
                } else {
                    let reason = format!("contract reports {status:?}");
                    self.reclaim(payment_id, step, &reason).await
                }
            }
        }
    }

    async fn verify_receipt(
        &self,
        payment_id: PaymentId,
        step: Step,
        hash: &TxHash,
    ) -> Result<Clearance> {
        match self.ctx.contract.receipt(hash).await? {
            Some(receipt) if receipt.success => {
                Ok(Clearance::Reconciled(Evidence::Receipt(receipt)))
            }
            Some(_) => {
                let reason = format!("transaction {hash} reverted");
                self.reclaim(payment_id, step, &reason).await
            }
            None => Err(EngineError::Transient(format!("transaction {hash} is still pending"))),
        }
    }

    /// Whether `hash` is free for `payment_id` to adopt.
    async fn unowned(&self, payment_id: PaymentId, hash: &TxHash) -> Result<bool> {
        Ok(match self.ctx.store.tx_owner(hash).await? {
            Some(owner) => owner == payment_id,
            None => true,
        })
    }

    /// A broadcast without a known hash may still be waiting to be mined, so
    /// the claim is only released once it is older than the claim TTL.
    async fn reclaim_after_ttl(
        &self,
        payment_id: PaymentId,
        step: Step,
        started_at: DateTime<Utc>,
        reason: &str,
    ) -> Result<Clearance> {
        let ttl = Duration::from_std(self.ctx.settings.claim_ttl)
            .map_err(|e| EngineError::Config(format!("claim TTL: {e}")))?;
        if self.ctx.now() - started_at < ttl {
            return Err(EngineError::Transient(format!(
                "{step} for payment {payment_id}: {reason} yet"
            )));
        }
        self.reclaim(payment_id, step, reason).await
    }

    pub async fn complete(&self, payment_id: PaymentId, step: Step, reference: &str) -> Result<()> {
        tracing::info!(%payment_id, %step, reference, "step completed");
        self.ctx
            .record(
                payment_id,
                EventKind::StepCompleted {
                    step,
                    reference: reference.to_string(),
                },
                format!("{step} completed ({reference})"),
            )
            .await
    }

    pub async fn fail(&self, payment_id: PaymentId, step: Step, reason: &str) -> Result<()> {
        tracing::warn!(%payment_id, %step, reason, "step failed");
        self.ctx
            .record(
                payment_id,
                EventKind::StepFailed {
                    step,
                    reason: reason.to_string(),
                },
                format!("{step} failed: {reason}"),
            )
            .await
    }

    /// Records the failure of an attempted call.
    ///
    /// Ambiguous failures keep the claim open so the next run verifies
    /// instead of retrying.
    async fn record_failure(
        &self,
        payment_id: PaymentId,
        step: Step,
        err: &EngineError,
    ) -> Result<()> {
        if err.class() == FailureClass::Ambiguous {
            tracing::warn!(%payment_id, %step, error = %err, "outcome unknown");
            self.ctx
                .record(
                    payment_id,
                    EventKind::OutcomeUnknown { step },
                    format!("{step} outcome unknown: {err}"),
                )
                .await
        } else {
            self.fail(payment_id, step, &err.to_string()).await
        }
    }

    /// Runs a rail step at most once.
    ///
    /// `call` receives the step's idempotency reference.
    pub async fn execute_rail<F, Fut>(
        &self,
        payment_id: PaymentId,
        step: Step,
        call: F,
    ) -> Result<RailOutcome>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<RailTransfer>>,
    {
        match self.clear(payment_id, step, None).await? {
            Clearance::Done { .. } => Ok(RailOutcome::AlreadyDone),
            Clearance::Reconciled(Evidence::Rail(transfer)) => {
                self.complete(payment_id, step, &transfer.reference).await?;
                Ok(RailOutcome::Reconciled(transfer))
            }
            Clearance::Reconciled(other) => Err(EngineError::Structural(format!(
                "{step} reconciled with chain evidence {other:?}"
            ))),
            Clearance::Proceed { reference } => match call(reference.clone()).await {
                Ok(transfer) if transfer.status == TransferStatus::Failed => {
                    let err = EngineError::Structural(format!(
                        "rail reports {step} transfer {} failed",
                        transfer.id
                    ));
                    self.fail(payment_id, step, &err.to_string()).await?;
                    Err(err)
                }
                Ok(transfer) => {
                    self.complete(payment_id, step, &reference).await?;
                    Ok(RailOutcome::Executed(transfer))
                }
                Err(err) => {
                    self.record_failure(payment_id, step, &err).await?;
                    Err(err)
                }
            },
        }
    }

    /// Runs a chain step at most once and waits for its receipt.
    ///
    /// The completion event is left to the caller, which must persist what
    /// the receipt proves before calling [`ReconciliationGuard::complete`]
    /// with the transaction hash as reference. A step already completed
    /// yields its receipt again so an interrupted caller can catch up.
    pub async fn execute_chain<F, Fut>(
        &self,
        payment_id: PaymentId,
        step: Step,
        target: ChainTarget<'_>,
        submit: F,
    ) -> Result<ChainOutcome>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<TxHash>>,
    {
        match self.clear(payment_id, step, Some(target)).await? {
            Clearance::Done { reference } => {
                let hash = TxHash::parse(&reference)?;
                let receipt = self.ctx.contract.receipt(&hash).await?.ok_or_else(|| {
                    EngineError::Structural(format!("completed {step} has no receipt for {hash}"))
                })?;
                Ok(ChainOutcome::Confirmed(receipt))
            }
            Clearance::Reconciled(Evidence::Receipt(receipt)) => {
                Ok(ChainOutcome::Confirmed(receipt))
            }
            Clearance::Reconciled(Evidence::OnChain(status)) => Ok(ChainOutcome::Verified(status)),
            Clearance::Reconciled(other) => Err(EngineError::Structural(format!(
                "{step} reconciled with rail evidence {other:?}"
            ))),
            Clearance::Proceed { .. } => {
                let hash = match submit().await {
                    Ok(hash) => hash,
                    Err(err) => {
                        self.record_failure(payment_id, step, &err).await?;
                        return Err(err);
                    }
                };
                self.ctx
                    .record(
                        payment_id,
                        EventKind::StepSubmitted {
                            step,
                            tx_hash: hash.clone(),
                        },
                        format!("{step} submitted as {hash}"),
                    )
                    .await?;
                match self.ctx.contract.await_receipt(&hash).await {
                    Ok(receipt) if receipt.success => Ok(ChainOutcome::Confirmed(receipt)),
                    Ok(_) => {
                        let err = EngineError::Reverted(format!("{step} transaction {hash}"));
                        self.fail(payment_id, step, &err.to_string()).await?;
                        Err(err)
                    }
                    Err(err) => {
                        // Broadcast already happened: only the receipt can settle it.
                        tracing::warn!(%payment_id, %step, error = %err, "receipt not observed");
                        self.ctx
                            .record(
                                payment_id,
                                EventKind::OutcomeUnknown { step },
                                format!("{step} receipt for {hash} not observed: {err}"),
                            )
                            .await?;
                        Err(EngineError::OutcomeUnknown(format!(
                            "{step} transaction {hash}: {err}"
                        )))
                    }
                }
            }
        }
    }
}
