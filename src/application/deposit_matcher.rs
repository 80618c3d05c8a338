use super::context::Context;
use crate::domain::event::EventKind;
use crate::domain::payment::{Payment, PaymentId};
use crate::domain::ports::{Deposit, DepositStatus};
use crate::domain::split::Split;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    Matched { deposit_id: String },
    NoDeposit,
    /// The payment is no longer waiting for a deposit.
    NotEligible,
}

/// Binds incoming rail deposits to pending payments.
#[derive(Clone)]
pub struct DepositMatcher {
    ctx: Context,
}

impl DepositMatcher {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    pub async fn match_payment(&self, payment_id: PaymentId) -> Result<MatchOutcome> {
        let payment = self.ctx.load_payment(payment_id).await?;
        if !payment.awaiting_deposit() {
            return Ok(MatchOutcome::NotEligible);
        }
        let Some(account) = payment.deposit_account.as_deref() else {
            return Ok(MatchOutcome::NotEligible);
        };

        let deposits = self.ctx.rail.list_deposits(account).await?;
        let mut candidates = Vec::new();
        for deposit in deposits {
            if Self::fits(&payment, account, &deposit)
                && !self.ctx.store.is_deposit_consumed(&deposit.id).await?
            {
                candidates.push(deposit);
            }
        }
        // Earliest first, so a replayed list always picks the same deposit.
        candidates.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        let Some(chosen) = candidates.first() else {
            return Ok(MatchOutcome::NoDeposit);
        };
        if candidates.len() > 1 {
            let ids: Vec<String> = candidates.iter().map(|d| d.id.clone()).collect();
            tracing::warn!(
                %payment_id,
                candidates = ?ids,
                "several deposits match, taking the earliest"
            );
            self.ctx
                .record(
                    payment_id,
                    EventKind::DepositAmbiguous { candidates: ids },
                    format!("{} deposits match; using {}", candidates.len(), chosen.id),
                )
                .await?;
        }

        let split = Split::compute(payment.amount, payment.custody_percent);
        let consumed = self
            .ctx
            .store
            .consume_deposit(payment_id, &chosen.id, split, self.ctx.now())
            .await?;
        if !consumed {
            return Ok(MatchOutcome::NotEligible);
        }

        tracing::info!(
            %payment_id,
            deposit_id = %chosen.id,
            custody = %split.custody,
            immediate = %split.immediate,
            "deposit matched"
        );
        self.ctx
            .record(
                payment_id,
                EventKind::DepositMatched {
                    deposit_id: chosen.id.clone(),
                },
                format!(
                    "Deposit {} of {} {} matched; custody {} immediate {}",
                    chosen.id, chosen.amount, payment.currency, split.custody, split.immediate
                ),
            )
            .await?;
        Ok(MatchOutcome::Matched {
            deposit_id: chosen.id.clone(),
        })
    }

    fn fits(payment: &Payment, account: &str, deposit: &Deposit) -> bool {
        deposit.status == DepositStatus::Complete
            && deposit.account == account
            && deposit.currency.eq_ignore_ascii_case(&payment.currency)
            && deposit.amount == payment.amount
    }
}
