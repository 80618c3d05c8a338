use super::context::Context;
use super::deposit_matcher::{DepositMatcher, MatchOutcome};
use super::escrow_orchestrator::{CustodyOutcome, EscrowOrchestrator, ReleaseOutcome};
use super::guard::ReconciliationGuard;
use super::payout_orchestrator::{PayoutOrchestrator, PayoutOutcome};
use super::scheduler::Job;
use crate::config::EngineSettings;
use crate::domain::escrow::{Escrow, EscrowId, EscrowStatus, ReleaseTrigger};
use crate::domain::event::{step_state, EventKind, PaymentEvent, Portion, Step, StepState};
use crate::domain::payment::{NewPayment, Party, Payment, PaymentChange, PaymentId, PaymentStatus};
use crate::domain::ports::{ClockRef, CustodialRailRef, EscrowContractRef, LedgerStoreRef};
use crate::error::{EngineError, FailureClass, Result};
use std::sync::Arc;

/// A unit of scheduler work. Every task is scoped to one payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    MatchDeposit,
    AdvanceCustody,
    Release(EscrowId),
    PayImmediate,
    PayCustody(EscrowId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkItem {
    pub payment_id: PaymentId,
    pub task: Task,
}

/// The escrow automation engine.
///
/// `EscrowEngine` owns the ports and composes the stage orchestrators. It
/// keeps no state between calls: each operation re-reads the ledger, so any
/// number of engines may share one store.
pub struct EscrowEngine {
    ctx: Context,
    matcher: DepositMatcher,
    escrows: EscrowOrchestrator,
    payouts: PayoutOrchestrator,
}

impl EscrowEngine {
    /// Creates a new `EscrowEngine` over the given ports.
    pub fn new(
        store: LedgerStoreRef,
        rail: CustodialRailRef,
        contract: EscrowContractRef,
        clock: ClockRef,
        settings: EngineSettings,
    ) -> Self {
        let ctx = Context {
            store,
            rail,
            contract,
            clock,
            settings: Arc::new(settings),
        };
        let guard = ReconciliationGuard::new(ctx.clone());
        Self {
            matcher: DepositMatcher::new(ctx.clone()),
            escrows: EscrowOrchestrator::new(ctx.clone(), guard.clone()),
            payouts: PayoutOrchestrator::new(ctx.clone(), guard),
            ctx,
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.ctx.settings
    }

    pub async fn register_payment(&self, request: NewPayment) -> Result<Payment> {
        let payment = Payment::new(request, self.ctx.now())?;
        self.ctx.store.insert_payment(payment.clone()).await?;
        tracing::info!(
            payment_id = %payment.id,
            amount = %payment.amount,
            custody_percent = %payment.custody_percent.value(),
            "payment registered"
        );
        Ok(payment)
    }

    pub async fn payment(&self, id: PaymentId) -> Result<Payment> {
        self.ctx.load_payment(id).await
    }

    pub async fn escrow(&self, id: EscrowId) -> Result<Escrow> {
        self.ctx.load_escrow(id).await
    }

    pub async fn events(&self, id: PaymentId) -> Result<Vec<PaymentEvent>> {
        self.ctx.store.events(id).await
    }

    /// Returns the payment's deposit account, issuing one on first call.
    pub async fn issue_deposit_account(&self, id: PaymentId) -> Result<String> {
        let payment = self.ctx.load_payment(id).await?;
        if let Some(account) = payment.deposit_account {
            return Ok(account);
        }
        if payment.status != PaymentStatus::Pending {
            return Err(EngineError::ValidationError(format!(
                "payment {id} is no longer awaiting a deposit"
            )));
        }
        let account = self.ctx.rail.issue_virtual_account().await?;
        let change = PaymentChange::DepositAccount(account.clone());
        if self.ctx.store.change_payment(id, &change, self.ctx.now()).await?.is_some() {
            self.ctx
                .record(
                    id,
                    EventKind::DepositAccountIssued {
                        account: account.clone(),
                    },
                    format!("Deposit account {account} issued"),
                )
                .await?;
        }
        Ok(account)
    }

    pub async fn approve(&self, id: PaymentId, party: Party) -> Result<Payment> {
        let change = PaymentChange::Approval(party);
        match self.ctx.store.change_payment(id, &change, self.ctx.now()).await? {
            Some(payment) => {
                let description = format!("{party:?} approved release");
                self.ctx
                    .record_manual(id, EventKind::Approved { party }, description)
                    .await?;
                Ok(payment)
            }
            None => self.ctx.load_payment(id).await,
        }
    }

    /// Freezes the payment and its escrow.
    ///
    /// A released escrow can still be disputed until its tokens start moving
    /// back to the rail.
    pub async fn raise_dispute(&self, id: PaymentId, reason: &str) -> Result<()> {
        let mut payment = self.ctx.load_payment(id).await?;
        if payment.status.is_terminal() {
            return Err(EngineError::Terminal(format!("payment {id} is {:?}", payment.status)));
        }
        let events = self.ctx.store.events(id).await?;
        if step_state(&events, Step::EscrowRelease).is_open() {
            return Err(EngineError::InFlight(format!("release of payment {id}")));
        }
        if matches!(
            step_state(&events, Step::BridgeReturn),
            StepState::Open { .. } | StepState::Completed { .. }
        ) {
            return Err(EngineError::ValidationError(format!(
                "custody of payment {id} is already being paid out"
            )));
        }
        let escrow = self.ctx.linked_escrow(&payment).await?;
        if escrow.is_none() && payment.status == PaymentStatus::Processing {
            return Err(EngineError::ValidationError(format!(
                "payment {id} is already being paid out"
            )));
        }
        if let Some(mut escrow) = escrow {
            if !escrow.status.can_dispute() {
                return Err(EngineError::ValidationError(format!(
                    "escrow {} is {:?} and can no longer be disputed",
                    escrow.id, escrow.status
                )));
            }
            let expected = escrow.status;
            escrow.status = EscrowStatus::Disputed;
            self.ctx.save_escrow(&mut escrow, expected).await?;
        }
        self.ctx
            .transition_payment(&mut payment, PaymentStatus::Disputed)
            .await?;
        tracing::warn!(payment_id = %id, reason, "payment disputed");
        self.ctx
            .record_manual(
                id,
                EventKind::Disputed {
                    reason: reason.to_string(),
                },
                format!("Dispute raised: {reason}"),
            )
            .await
    }

    /// Cancels a payment no deposit has been matched to.
    pub async fn cancel(&self, id: PaymentId, reason: &str) -> Result<()> {
        let mut payment = self.ctx.load_payment(id).await?;
        if payment.status != PaymentStatus::Pending || payment.dedup_reference.is_some() {
            return Err(EngineError::ValidationError(format!(
                "payment {id} is {:?} and cannot be cancelled",
                payment.status
            )));
        }
        self.ctx
            .transition_payment(&mut payment, PaymentStatus::Cancelled)
            .await?;
        self.ctx
            .record_manual(id, EventKind::Cancelled, format!("Cancelled: {reason}"))
            .await
    }

    pub async fn clear_hold(&self, id: PaymentId) -> Result<()> {
        let previous = self.ctx.load_payment(id).await?.automation_hold;
        let change = PaymentChange::ClearHold;
        if self.ctx.store.change_payment(id, &change, self.ctx.now()).await?.is_none() {
            return Ok(());
        }
        let reason = previous.unwrap_or_default();
        tracing::info!(payment_id = %id, previous = %reason, "automation hold cleared");
        self.ctx
            .record_manual(id, EventKind::HoldCleared, format!("Hold cleared (was: {reason})"))
            .await
    }

    /// Releases the payment's escrow. Manual triggers skip the due check.
    pub async fn release_escrow(
        &self,
        id: PaymentId,
        trigger: ReleaseTrigger,
    ) -> Result<ReleaseOutcome> {
        let payment = self.ctx.load_payment(id).await?;
        let escrow_id = payment
            .escrow_id
            .ok_or_else(|| EngineError::ValidationError(format!("payment {id} has no escrow")))?;
        self.escrows.release(escrow_id, trigger).await
    }

    pub async fn match_deposit(&self, id: PaymentId) -> Result<MatchOutcome> {
        self.matcher.match_payment(id).await
    }

    pub async fn advance_custody(&self, id: PaymentId) -> Result<CustodyOutcome> {
        self.escrows.advance(id).await
    }

    pub async fn pay_immediate(&self, id: PaymentId) -> Result<PayoutOutcome> {
        self.payouts.pay_immediate(id).await
    }

    pub async fn pay_custody(&self, escrow_id: EscrowId) -> Result<PayoutOutcome> {
        self.payouts.pay_custody(escrow_id).await
    }

    /// Loads the candidates of one `job` run, oldest first.
    pub async fn work_items(&self, job: Job) -> Result<Vec<WorkItem>> {
        let limit = self.ctx.settings.batch_size;
        let store = &self.ctx.store;
        let mut items = Vec::new();
        match job {
            Job::DepositDetection => {
                for payment in store.payments_by_status(PaymentStatus::Pending, limit).await? {
                    if payment.awaiting_deposit() {
                        items.push(WorkItem {
                            payment_id: payment.id,
                            task: Task::MatchDeposit,
                        });
                    }
                }
            }
            Job::EscrowFunding => {
                for payment in store.payments_by_status(PaymentStatus::Funded, limit).await? {
                    let needs_custody = payment.split.is_some_and(|s| s.needs_custody());
                    if payment.is_automatable() && needs_custody {
                        items.push(WorkItem {
                            payment_id: payment.id,
                            task: Task::AdvanceCustody,
                        });
                    }
                }
            }
            Job::ReleaseSweep => {
                for escrow in store.escrows_by_status(EscrowStatus::Funded, limit).await? {
                    items.push(WorkItem {
                        payment_id: escrow.payment_id,
                        task: Task::Release(escrow.id),
                    });
                }
            }
            Job::PayoutSweep => {
                let owing = [
                    PaymentStatus::Funded,
                    PaymentStatus::Escrowed,
                    PaymentStatus::Processing,
                ];
                for status in owing {
                    for payment in store.payments_by_status(status, limit).await? {
                        if self.owes_immediate(&payment).await? {
                            items.push(WorkItem {
                                payment_id: payment.id,
                                task: Task::PayImmediate,
                            });
                        }
                    }
                }
                for escrow in store.escrows_by_status(EscrowStatus::Released, limit).await? {
                    items.push(WorkItem {
                        payment_id: escrow.payment_id,
                        task: Task::PayCustody(escrow.id),
                    });
                }
            }
        }
        Ok(items)
    }

    async fn owes_immediate(&self, payment: &Payment) -> Result<bool> {
        let Some(split) = payment.split.filter(|s| s.has_immediate()) else {
            return Ok(false);
        };
        if !payment.is_automatable() {
            return Ok(false);
        }
        // A custody-free payment still in processing may only lack its completion.
        if payment.status == PaymentStatus::Processing && !split.needs_custody() {
            return Ok(true);
        }
        let events = self.ctx.store.events(payment.id).await?;
        Ok(!step_state(&events, Step::Payout(Portion::Immediate)).is_completed())
    }

    /// Runs one task. Returns whether the payment moved forward.
    pub async fn execute(&self, item: WorkItem) -> Result<bool> {
        let advanced = match item.task {
            Task::MatchDeposit => matches!(
                self.match_deposit(item.payment_id).await?,
                MatchOutcome::Matched { .. }
            ),
            Task::AdvanceCustody => matches!(
                self.advance_custody(item.payment_id).await?,
                CustodyOutcome::Funded { .. }
            ),
            Task::Release(escrow_id) => matches!(
                self.escrows.release(escrow_id, ReleaseTrigger::Scheduled).await?,
                ReleaseOutcome::Released(_) | ReleaseOutcome::Reconciled(_)
            ),
            Task::PayImmediate => matches!(
                self.pay_immediate(item.payment_id).await?,
                PayoutOutcome::Paid { .. }
            ),
            Task::PayCustody(escrow_id) => matches!(
                self.pay_custody(escrow_id).await?,
                PayoutOutcome::Paid { .. }
            ),
        };
        Ok(advanced)
    }

    /// Applies the failure policy for `err` raised while working on `payment_id`.
    ///
    /// Structural failures hold the payment; every other class leaves it for
    /// the next run.
    pub async fn handle_failure(
        &self,
        payment_id: PaymentId,
        task: Task,
        err: &EngineError,
    ) -> Result<()> {
        match err.class() {
            FailureClass::Structural => {
                tracing::error!(%payment_id, ?task, error = %err, "structural failure");
                self.ctx.hold(payment_id, &err.to_string()).await
            }
            FailureClass::Ambiguous => {
                tracing::warn!(
                    %payment_id,
                    ?task,
                    error = %err,
                    "outcome unknown, verifying next run"
                );
                Ok(())
            }
            FailureClass::Transient => {
                tracing::debug!(
                    %payment_id,
                    ?task,
                    error = %err,
                    "transient failure, retrying next run"
                );
                Ok(())
            }
            FailureClass::Terminal => {
                tracing::info!(%payment_id, ?task, error = %err, "payment left automation");
                Ok(())
            }
            FailureClass::Fatal => {
                tracing::error!(%payment_id, ?task, error = %err, "local failure");
                Ok(())
            }
        }
    }
}
