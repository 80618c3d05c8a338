use super::context::Context;
use super::guard::{ChainOutcome, ChainTarget, RailOutcome, ReconciliationGuard};
use crate::domain::escrow::{release_due, Escrow, EscrowId, EscrowStatus, ReleaseTrigger, TxHash};
use crate::domain::event::{EventKind, Step};
use crate::domain::payment::{Payment, PaymentId, PaymentStatus};
use crate::domain::ports::{CreateEscrowCall, OnChainStatus, TokenWithdrawal};
use crate::domain::split::Split;
use crate::error::{EngineError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CustodyOutcome {
    Funded { escrow_id: EscrowId },
    NotEligible,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released(TxHash),
    /// Found already released on-chain and recorded.
    Reconciled(TxHash),
    /// A release hash was already on record; nothing was submitted.
    AlreadyReleased(TxHash),
    NotDue,
}

/// Moves the custody portion into the escrow contract and back out.
#[derive(Clone)]
pub struct EscrowOrchestrator {
    ctx: Context,
    guard: ReconciliationGuard,
}

impl EscrowOrchestrator {
    pub fn new(ctx: Context, guard: ReconciliationGuard) -> Self {
        Self { ctx, guard }
    }

    /// Drives a funded payment's escrow from record creation to `funded`.
    pub async fn advance(&self, payment_id: PaymentId) -> Result<CustodyOutcome> {
        let payment = self.ctx.load_payment(payment_id).await?;
        if !payment.is_automatable()
            || !matches!(payment.status, PaymentStatus::Funded | PaymentStatus::Escrowed)
        {
            return Ok(CustodyOutcome::NotEligible);
        }
        let split = payment.split()?;
        if !split.needs_custody() {
            return Ok(CustodyOutcome::NotEligible);
        }

        let (mut payment, mut escrow) = self.open_escrow(payment, split).await?;
        if escrow.status == EscrowStatus::Pending {
            self.withdraw_custody(&payment, &escrow).await?;
            self.create_on_chain(&payment, &mut escrow).await?;
        }
        if escrow.status == EscrowStatus::Created {
            self.fund_on_chain(&payment, &mut escrow).await?;
        }
        if escrow.status != EscrowStatus::Funded {
            return Ok(CustodyOutcome::NotEligible);
        }
        if payment.status == PaymentStatus::Funded {
            self.ctx
                .transition_payment(&mut payment, PaymentStatus::Escrowed)
                .await?;
        }
        Ok(CustodyOutcome::Funded {
            escrow_id: escrow.id,
        })
    }

    /// Returns the payment's escrow, creating the record on first use.
    ///
    /// The custody window is fixed here and never recomputed afterwards.
    async fn open_escrow(&self, payment: Payment, split: Split) -> Result<(Payment, Escrow)> {
        if let Some(escrow) = self.ctx.linked_escrow(&payment).await? {
            return Ok((payment, escrow));
        }
        let escrow = Escrow::open(&payment, split, self.ctx.now())?;
        match self.ctx.store.create_escrow(escrow.clone()).await {
            Ok(()) => {
                tracing::info!(
                    payment_id = %payment.id,
                    escrow_id = %escrow.id,
                    custody_end = %escrow.custody_end,
                    "escrow opened"
                );
            }
            // Another worker opened it first; use theirs.
            Err(EngineError::Conflict(_)) => {}
            Err(err) => return Err(err),
        }
        let payment = self.ctx.load_payment(payment.id).await?;
        let escrow = self.ctx.linked_escrow(&payment).await?.ok_or_else(|| {
            EngineError::Structural(format!(
                "payment {} has no escrow after opening one",
                payment.id
            ))
        })?;
        Ok((payment, escrow))
    }

    async fn withdraw_custody(&self, payment: &Payment, escrow: &Escrow) -> Result<()> {
        let request = |reference: String| TokenWithdrawal {
            reference,
            currency: self.ctx.settings.token_currency.clone(),
            amount: escrow.custody_amount,
            address: self.ctx.settings.bridge_wallet.clone(),
            network: self.ctx.settings.network.clone(),
        };
        let outcome = self
            .guard
            .execute_rail(payment.id, Step::CustodyWithdrawal, |reference| async move {
                self.ctx.rail.withdraw_token(&request(reference)).await
            })
            .await?;
        if let RailOutcome::Executed(transfer) = outcome {
            tracing::info!(
                payment_id = %payment.id,
                transfer_id = %transfer.id,
                amount = %escrow.custody_amount,
                "custody withdrawn to bridge wallet"
            );
        }
        Ok(())
    }

    async fn create_on_chain(&self, payment: &Payment, escrow: &mut Escrow) -> Result<()> {
        let decimals = self.ctx.contract.token_decimals().await?;
        let deadline = u64::try_from(escrow.custody_end.timestamp()).map_err(|_| {
            EngineError::Structural(format!(
                "escrow {} custody end precedes the epoch",
                escrow.id
            ))
        })?;
        let call = CreateEscrowCall {
            payer: self.ctx.settings.bridge_wallet.clone(),
            payee: self.ctx.settings.bridge_wallet.clone(),
            token: self.ctx.contract.token_address().to_string(),
            amount: escrow.custody_amount.to_base_units(decimals)?,
            deadline,
            vertical: CreateEscrowCall::metadata(payment.metadata.vertical.as_deref()),
            clabe: CreateEscrowCall::metadata(Some(&payment.payout_account.clabe)),
            conditions: CreateEscrowCall::metadata(payment.metadata.conditions.as_deref()),
        };
        let outcome = self
            .guard
            .execute_chain(payment.id, Step::EscrowCreate, ChainTarget::Create(&call), || {
                self.ctx.contract.submit_create(&call)
            })
            .await?;
        let ChainOutcome::Confirmed(receipt) = outcome else {
            return Err(EngineError::Structural(format!(
                "escrow {} creation verified without a receipt",
                escrow.id
            )));
        };
        let on_chain_id = receipt.escrow_created.ok_or_else(|| {
            EngineError::Structural(format!(
                "receipt {} carries no EscrowCreated event",
                receipt.tx_hash
            ))
        })?;

        escrow.on_chain_id = Some(on_chain_id);
        escrow.creation_tx_hash = Some(receipt.tx_hash.clone());
        escrow.status = EscrowStatus::Created;
        self.ctx.save_escrow(escrow, EscrowStatus::Pending).await?;
        tracing::info!(
            payment_id = %payment.id,
            %on_chain_id,
            tx = %receipt.tx_hash,
            "escrow created on-chain"
        );
        self.guard
            .complete(payment.id, Step::EscrowCreate, receipt.tx_hash.as_str())
            .await
    }

    async fn fund_on_chain(&self, payment: &Payment, escrow: &mut Escrow) -> Result<()> {
        let on_chain_id = escrow.on_chain_id()?;
        let decimals = self.ctx.contract.token_decimals().await?;
        let amount = escrow.custody_amount.to_base_units(decimals)?;
        let bridge = self.ctx.settings.bridge_wallet.as_str();

        let target = ChainTarget::Escrow(on_chain_id);
        let outcome = self
            .guard
            .execute_chain(payment.id, Step::EscrowFund, target, || async move {
                // The rail withdrawal may still be in transit to the bridge wallet.
                let balance = self.ctx.contract.token_balance(bridge).await?;
                if balance < amount {
                    return Err(EngineError::Transient(format!(
                        "bridge wallet holds {balance} of {amount} base units"
                    )));
                }
                self.ctx.contract.submit_fund(on_chain_id, amount).await
            })
            .await?;

        let reference = match outcome {
            ChainOutcome::Confirmed(receipt) => {
                escrow.funding_tx_hash = Some(receipt.tx_hash.clone());
                receipt.tx_hash.to_string()
            }
            ChainOutcome::Verified(status) => format!("on-chain-{status:?}").to_lowercase(),
        };
        escrow.status = EscrowStatus::Funded;
        self.ctx.save_escrow(escrow, EscrowStatus::Created).await?;
        tracing::info!(payment_id = %payment.id, %on_chain_id, reference, "escrow funded");
        self.guard.complete(payment.id, Step::EscrowFund, &reference).await
    }

    /// Releases `escrow_id` if due, or unconditionally for a manual trigger.
    ///
    /// A recorded release hash short-circuits every trigger, so scheduled and
    /// manual requests for the same escrow submit at most one transaction.
    pub async fn release(
        &self,
        escrow_id: EscrowId,
        trigger: ReleaseTrigger,
    ) -> Result<ReleaseOutcome> {
        let mut escrow = self.ctx.load_escrow(escrow_id).await?;
        let mut payment = self.ctx.load_payment(escrow.payment_id).await?;
        escrow.check_link(&payment)?;

        if let Some(hash) = escrow.release_tx_hash.clone() {
            tracing::info!(
                payment_id = %payment.id,
                %escrow_id,
                ?trigger,
                tx = %hash,
                "escrow already released, skipping"
            );
            self.ctx
                .record(
                    payment.id,
                    EventKind::ReleaseSkipped {
                        release_tx_hash: hash.clone(),
                    },
                    format!("{trigger:?} release skipped; released in {hash}"),
                )
                .await?;
            return Ok(ReleaseOutcome::AlreadyReleased(hash));
        }

        if payment.status == PaymentStatus::Disputed || escrow.status == EscrowStatus::Disputed {
            return Err(EngineError::Terminal(format!("payment {} is disputed", payment.id)));
        }
        if payment.automation_hold.is_some() {
            return Ok(ReleaseOutcome::NotDue);
        }
        let due = match trigger {
            ReleaseTrigger::Scheduled => release_due(&escrow, &payment, self.ctx.now()),
            ReleaseTrigger::Manual => escrow.status == EscrowStatus::Funded,
        };
        if !due {
            return Ok(ReleaseOutcome::NotDue);
        }

        let on_chain_id = escrow.on_chain_id()?;
        let on_chain = self.ctx.contract.read_escrow(on_chain_id).await?;
        if on_chain.status == OnChainStatus::Released {
            let hash = self.ctx.contract.find_release_tx(on_chain_id).await?.ok_or_else(|| {
                EngineError::Structural(format!(
                    "escrow {on_chain_id} is released on-chain but no release transaction was found"
                ))
            })?;
            tracing::warn!(
                payment_id = %payment.id,
                %escrow_id,
                tx = %hash,
                "escrow found released on-chain, recording"
            );
            self.record_release(&mut payment, &mut escrow, hash.clone()).await?;
            return Ok(ReleaseOutcome::Reconciled(hash));
        }
        if on_chain.status != OnChainStatus::Funded {
            return Err(EngineError::Structural(format!(
                "escrow {escrow_id} is {:?} on-chain but funded in the ledger",
                on_chain.status
            )));
        }

        let outcome = self
            .guard
            .execute_chain(payment.id, Step::EscrowRelease, ChainTarget::Escrow(on_chain_id), || {
                self.ctx.contract.submit_release(on_chain_id)
            })
            .await?;
        let hash = match outcome {
            ChainOutcome::Confirmed(receipt) => receipt.tx_hash,
            ChainOutcome::Verified(_) => {
                let found = self.ctx.contract.find_release_tx(on_chain_id).await?;
                found.ok_or_else(|| {
                    EngineError::Structural(format!(
                        "release of escrow {on_chain_id} has no transaction"
                    ))
                })?
            }
        };
        tracing::info!(
            payment_id = %payment.id,
            %escrow_id,
            ?trigger,
            tx = %hash,
            "escrow released"
        );
        self.record_release(&mut payment, &mut escrow, hash.clone()).await?;
        Ok(ReleaseOutcome::Released(hash))
    }

    async fn record_release(
        &self,
        payment: &mut Payment,
        escrow: &mut Escrow,
        hash: TxHash,
    ) -> Result<()> {
        escrow.release_tx_hash = Some(hash.clone());
        escrow.status = EscrowStatus::Released;
        self.ctx.save_escrow(escrow, EscrowStatus::Funded).await?;
        self.guard
            .complete(payment.id, Step::EscrowRelease, hash.as_str())
            .await?;
        if !payment.status.is_terminal() && payment.status != PaymentStatus::Processing {
            self.ctx
                .transition_payment(payment, PaymentStatus::Processing)
                .await?;
        }
        Ok(())
    }
}
