use super::context::Context;
use super::guard::{ChainOutcome, ChainTarget, ReconciliationGuard};
use crate::domain::escrow::{Escrow, EscrowId, EscrowStatus};
use crate::domain::event::{step_state, EventKind, Portion, Step};
use crate::domain::money::Amount;
use crate::domain::payment::{Payment, PaymentId, PaymentStatus};
use crate::domain::ports::{PayoutRequest, RedemptionRequest};
use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayoutOutcome {
    Paid { payment_completed: bool },
    NotEligible,
}

/// Converts tokens back to fiat and pays the beneficiary.
#[derive(Clone)]
pub struct PayoutOrchestrator {
    ctx: Context,
    guard: ReconciliationGuard,
}

impl PayoutOrchestrator {
    pub fn new(ctx: Context, guard: ReconciliationGuard) -> Self {
        Self { ctx, guard }
    }

    /// Pays the immediate portion, whose tokens never left the rail.
    pub async fn pay_immediate(&self, payment_id: PaymentId) -> Result<PayoutOutcome> {
        let mut payment = self.ctx.load_payment(payment_id).await?;
        if !payment.is_automatable()
            || !matches!(
                payment.status,
                PaymentStatus::Funded | PaymentStatus::Escrowed | PaymentStatus::Processing
            )
        {
            return Ok(PayoutOutcome::NotEligible);
        }
        let split = payment.split()?;
        if !split.has_immediate() {
            return Ok(PayoutOutcome::NotEligible);
        }
        if !split.needs_custody() && payment.status == PaymentStatus::Funded {
            self.ctx
                .transition_payment(&mut payment, PaymentStatus::Processing)
                .await?;
        }

        self.redeem(&payment, Portion::Immediate, split.immediate).await?;
        self.payout(&payment, Portion::Immediate, split.immediate).await?;
        let payment_completed = self.complete_if_settled(payment_id).await?;
        Ok(PayoutOutcome::Paid { payment_completed })
    }

    /// Returns a released escrow's tokens to the rail and pays them out.
    pub async fn pay_custody(&self, escrow_id: EscrowId) -> Result<PayoutOutcome> {
        let mut escrow = self.ctx.load_escrow(escrow_id).await?;
        let payment = self.ctx.load_payment(escrow.payment_id).await?;
        escrow.check_link(&payment)?;
        if escrow.status != EscrowStatus::Released || !payment.is_automatable() {
            return Ok(PayoutOutcome::NotEligible);
        }
        if escrow.release_tx_hash.is_none() {
            return Err(EngineError::Structural(format!(
                "escrow {escrow_id} is released without a release transaction"
            )));
        }

        self.return_to_rail(&payment, &escrow).await?;
        self.redeem(&payment, Portion::Custody, escrow.custody_amount).await?;
        self.payout(&payment, Portion::Custody, escrow.custody_amount).await?;

        escrow.status = EscrowStatus::Completed;
        self.ctx.save_escrow(&mut escrow, EscrowStatus::Released).await?;
        let payment_completed = self.complete_if_settled(payment.id).await?;
        Ok(PayoutOutcome::Paid { payment_completed })
    }

    /// Sends the custody tokens from the bridge wallet back to the rail.
    ///
    /// The escrow is re-read after the claim so a dispute raised meanwhile
    /// stops the transfer.
    async fn return_to_rail(&self, payment: &Payment, escrow: &Escrow) -> Result<()> {
        let amount = escrow.custody_amount;
        let decimals = self.ctx.contract.token_decimals().await?;
        let units = amount.to_base_units(decimals)?;
        let rail_wallet = self.ctx.settings.rail_wallet.as_str();
        let target = ChainTarget::Transfer {
            to: rail_wallet,
            amount: units,
        };
        let outcome = self
            .guard
            .execute_chain(payment.id, Step::BridgeReturn, target, || async move {
                let current = self.ctx.load_escrow(escrow.id).await?;
                if current.status != EscrowStatus::Released {
                    return Err(EngineError::Terminal(format!(
                        "escrow {} is {:?}, custody stays in the bridge wallet",
                        escrow.id, current.status
                    )));
                }
                self.ctx.contract.submit_transfer(rail_wallet, units).await
            })
            .await?;
        match outcome {
            ChainOutcome::Confirmed(receipt) => {
                tracing::info!(
                    payment_id = %payment.id,
                    tx = %receipt.tx_hash,
                    %amount,
                    "custody returned to rail"
                );
                self.guard
                    .complete(payment.id, Step::BridgeReturn, receipt.tx_hash.as_str())
                    .await
            }
            ChainOutcome::Verified(status) => Err(EngineError::Structural(format!(
                "token return verified only by contract status {status:?}"
            ))),
        }
    }

    async fn redeem(&self, payment: &Payment, portion: Portion, amount: Amount) -> Result<()> {
        let currency = self.ctx.settings.token_currency.clone();
        self.guard
            .execute_rail(payment.id, Step::Redemption(portion), |reference| async move {
                self.ctx
                    .rail
                    .redeem(&RedemptionRequest {
                        reference,
                        currency,
                        amount,
                    })
                    .await
            })
            .await?;
        Ok(())
    }

    /// An unregistered destination is registered and retried on a later run.
    async fn payout(&self, payment: &Payment, portion: Portion, amount: Amount) -> Result<()> {
        let request = |reference: String| PayoutRequest {
            reference,
            currency: self.ctx.settings.fiat_currency.clone(),
            amount,
            clabe: payment.payout_account.clabe.clone(),
            holder_name: payment.payout_account.holder_name.clone(),
            memo: memo(payment.id, portion),
        };
        let result = self
            .guard
            .execute_rail(payment.id, Step::Payout(portion), |reference| async move {
                self.ctx.rail.payout(&request(reference)).await
            })
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(EngineError::UnregisteredAccount(message)) => {
                tracing::info!(
                    payment_id = %payment.id,
                    clabe = %payment.payout_account.clabe,
                    "registering payout account"
                );
                self.ctx
                    .rail
                    .register_bank_account(&payment.payout_account)
                    .await?;
                self.ctx
                    .record(
                        payment.id,
                        EventKind::PayoutAccountRegistered {
                            clabe: payment.payout_account.clabe.clone(),
                        },
                        format!("Payout account registered after rejection: {message}"),
                    )
                    .await?;
                Err(EngineError::Transient(format!(
                    "payout account of payment {} registered, payout retried next run",
                    payment.id
                )))
            }
            Err(err) => Err(err),
        }
    }

    /// Marks the payment completed once every portion it owes is paid out.
    async fn complete_if_settled(&self, payment_id: PaymentId) -> Result<bool> {
        let mut payment = self.ctx.load_payment(payment_id).await?;
        if payment.status.is_terminal() {
            return Ok(payment.status == PaymentStatus::Completed);
        }
        let split = payment.split()?;
        let events = self.ctx.store.events(payment_id).await?;
        let immediate_paid = !split.has_immediate()
            || step_state(&events, Step::Payout(Portion::Immediate)).is_completed();
        let custody_paid = !split.needs_custody()
            || matches!(
                self.ctx.linked_escrow(&payment).await?,
                Some(escrow) if escrow.status == EscrowStatus::Completed
            );
        if !(immediate_paid && custody_paid) {
            return Ok(false);
        }

        self.ctx
            .transition_payment(&mut payment, PaymentStatus::Completed)
            .await?;
        tracing::info!(%payment_id, "payment completed");
        self.ctx
            .record(payment_id, EventKind::Completed, "All portions paid out")
            .await?;
        Ok(true)
    }
}

fn memo(payment_id: PaymentId, portion: Portion) -> String {
    let short = payment_id.0.simple().to_string();
    let label = match portion {
        Portion::Immediate => "immediate",
        Portion::Custody => "custody",
    };
    format!("Escrow {} {label}", &short[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memo_is_short_and_stable() {
        let id = PaymentId::new();
        let memo_a = memo(id, Portion::Custody);
        assert_eq!(memo_a, memo(id, Portion::Custody));
        assert!(memo_a.starts_with("Escrow "));
        assert!(memo_a.ends_with(" custody"));
        assert!(memo_a.len() <= 30);
    }
}
