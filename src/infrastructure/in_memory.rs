use super::invariants;
use crate::domain::escrow::{Escrow, EscrowId, EscrowStatus, TxHash};
use crate::domain::event::{EventKind, PaymentEvent, Step};
use crate::domain::payment::{Payment, PaymentChange, PaymentId, PaymentStatus};
use crate::domain::ports::LedgerStore;
use crate::domain::split::Split;
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Default)]
struct Ledger {
    payments: HashMap<PaymentId, Payment>,
    escrows: HashMap<EscrowId, Escrow>,
    events: HashMap<PaymentId, Vec<PaymentEvent>>,
    /// Consumed deposit id -> consuming payment.
    deposits: HashMap<String, PaymentId>,
    /// Recorded chain transaction -> payment that recorded it.
    transactions: HashMap<TxHash, PaymentId>,
}

impl Ledger {
    fn push_event(&mut self, event: PaymentEvent) {
        if let Some(hash) = event.tx_hash() {
            self.transactions.entry(hash).or_insert(event.payment_id);
        }
        self.events.entry(event.payment_id).or_default().push(event);
    }
}

/// A thread-safe in-memory ledger.
///
/// All records live behind one `Arc<RwLock<_>>`; holding the write guard is
/// the transaction boundary, so every check-then-write is atomic.
/// Ideal for testing or for running the engine without persistence.
#[derive(Default, Clone)]
pub struct InMemoryLedgerStore {
    ledger: Arc<RwLock<Ledger>>,
}

impl InMemoryLedgerStore {
    /// Creates a new, empty in-memory ledger.
    pub fn new() -> Self {
        Self::default()
    }
}

fn oldest_first<T, K: Ord>(mut items: Vec<T>, key: impl Fn(&T) -> K, limit: usize) -> Vec<T> {
    items.sort_by_key(|item| key(item));
    items.truncate(limit);
    items
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn insert_payment(&self, payment: Payment) -> Result<()> {
        let mut ledger = self.ledger.write().await;
        if ledger.payments.contains_key(&payment.id) {
            return Err(EngineError::Conflict(format!("payment {} already exists", payment.id)));
        }
        ledger.payments.insert(payment.id, payment);
        Ok(())
    }

    async fn get_payment(&self, id: PaymentId) -> Result<Option<Payment>> {
        let ledger = self.ledger.read().await;
        Ok(ledger.payments.get(&id).cloned())
    }

    async fn payments_by_status(
        &self,
        status: PaymentStatus,
        limit: usize,
    ) -> Result<Vec<Payment>> {
        let ledger = self.ledger.read().await;
        let matching = ledger
            .payments
            .values()
            .filter(|p| p.status == status)
            .cloned()
            .collect();
        Ok(oldest_first(matching, |p| p.created_at, limit))
    }

    async fn change_payment(
        &self,
        id: PaymentId,
        change: &PaymentChange,
        at: DateTime<Utc>,
    ) -> Result<Option<Payment>> {
        let mut ledger = self.ledger.write().await;
        let payment = ledger
            .payments
            .get_mut(&id)
            .ok_or_else(|| EngineError::NotFound(format!("payment {id}")))?;
        let mut changed = payment.clone();
        if !changed.apply(change, at)? {
            return Ok(None);
        }
        *payment = changed.clone();
        Ok(Some(changed))
    }

    async fn consume_deposit(
        &self,
        payment_id: PaymentId,
        deposit_id: &str,
        split: Split,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut ledger = self.ledger.write().await;
        if let Some(owner) = ledger.deposits.get(deposit_id) {
            return Err(EngineError::Conflict(format!(
                "deposit {deposit_id} already consumed by payment {owner}"
            )));
        }
        let payment = ledger
            .payments
            .get_mut(&payment_id)
            .ok_or_else(|| EngineError::NotFound(format!("payment {payment_id}")))?;
        if !invariants::can_consume(payment) {
            return Ok(false);
        }
        if split.total() != payment.amount {
            return Err(EngineError::Structural(format!(
                "split does not sum to payment {payment_id}"
            )));
        }
        payment.dedup_reference = Some(deposit_id.to_string());
        payment.split = Some(split);
        payment.status = PaymentStatus::Funded;
        payment.updated_at = at;
        ledger.deposits.insert(deposit_id.to_string(), payment_id);
        Ok(true)
    }

    async fn is_deposit_consumed(&self, deposit_id: &str) -> Result<bool> {
        let ledger = self.ledger.read().await;
        Ok(ledger.deposits.contains_key(deposit_id))
    }

    async fn create_escrow(&self, escrow: Escrow) -> Result<()> {
        let mut ledger = self.ledger.write().await;
        let exists = ledger.escrows.contains_key(&escrow.id);
        let payment = ledger
            .payments
            .get_mut(&escrow.payment_id)
            .ok_or_else(|| EngineError::NotFound(format!("payment {}", escrow.payment_id)))?;
        invariants::check_new_escrow(&escrow, payment, exists)?;
        payment.escrow_id = Some(escrow.id);
        payment.updated_at = escrow.created_at;
        ledger.escrows.insert(escrow.id, escrow);
        Ok(())
    }

    async fn get_escrow(&self, id: EscrowId) -> Result<Option<Escrow>> {
        let ledger = self.ledger.read().await;
        Ok(ledger.escrows.get(&id).cloned())
    }

    async fn escrows_by_status(&self, status: EscrowStatus, limit: usize) -> Result<Vec<Escrow>> {
        let ledger = self.ledger.read().await;
        let matching = ledger
            .escrows
            .values()
            .filter(|e| e.status == status)
            .cloned()
            .collect();
        Ok(oldest_first(matching, |e| e.custody_end, limit))
    }

    async fn update_escrow(&self, escrow: &Escrow, expected: EscrowStatus) -> Result<()> {
        let mut ledger = self.ledger.write().await;
        let stored = ledger
            .escrows
            .get(&escrow.id)
            .ok_or_else(|| EngineError::NotFound(format!("escrow {}", escrow.id)))?;
        let payment = ledger.payments.get(&stored.payment_id);
        invariants::check_escrow_update(stored, escrow, expected, payment)?;
        ledger.escrows.insert(escrow.id, escrow.clone());
        Ok(())
    }

    async fn append_event(&self, event: PaymentEvent) -> Result<()> {
        let mut ledger = self.ledger.write().await;
        ledger.push_event(event);
        Ok(())
    }

    async fn events(&self, payment_id: PaymentId) -> Result<Vec<PaymentEvent>> {
        let ledger = self.ledger.read().await;
        Ok(ledger.events.get(&payment_id).cloned().unwrap_or_default())
    }

    async fn tx_owner(&self, tx_hash: &TxHash) -> Result<Option<PaymentId>> {
        let ledger = self.ledger.read().await;
        Ok(ledger.transactions.get(tx_hash).copied())
    }

    async fn claim_step(
        &self,
        payment_id: PaymentId,
        step: Step,
        reference: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut ledger = self.ledger.write().await;
        let events = ledger.events.get(&payment_id).map(Vec::as_slice).unwrap_or_default();
        invariants::check_claim(events, step)?;
        ledger.push_event(PaymentEvent::automatic(
            payment_id,
            EventKind::StepStarted {
                step,
                reference: reference.to_string(),
            },
            format!("{step} started"),
            at,
        ));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::money::{Amount, CustodyPercent};
    use crate::domain::payment::{EscrowMetadata, FlowType, NewPayment, PayoutAccount};
    use rust_decimal_macros::dec;

    fn payment(percent: rust_decimal::Decimal) -> Payment {
        Payment::new(
            NewPayment {
                amount: Amount::new(dec!(1000.00)).unwrap(),
                currency: "mxn".into(),
                custody_percent: CustodyPercent::new(percent).unwrap(),
                custody_seconds: 86_400,
                flow: FlowType::Standard,
                payer_id: "payer".into(),
                beneficiary_id: "beneficiary".into(),
                deposit_account: Some("646180000000000001".into()),
                payout_account: PayoutAccount {
                    clabe: "012180000000000002".into(),
                    holder_name: "Beneficiary".into(),
                },
                metadata: EscrowMetadata::default(),
            },
            Utc::now(),
        )
        .unwrap()
    }

    async fn funded(store: &InMemoryLedgerStore, percent: rust_decimal::Decimal) -> Payment {
        let p = payment(percent);
        store.insert_payment(p.clone()).await.unwrap();
        let split = Split::compute(p.amount, p.custody_percent);
        let deposit = format!("dep-{}", p.id);
        assert!(store.consume_deposit(p.id, &deposit, split, Utc::now()).await.unwrap());
        store.get_payment(p.id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_consume_deposit_is_set_once() {
        let store = InMemoryLedgerStore::new();
        let p = payment(dec!(50));
        store.insert_payment(p.clone()).await.unwrap();
        let split = Split::compute(p.amount, p.custody_percent);

        assert!(store.consume_deposit(p.id, "dep-1", split, Utc::now()).await.unwrap());
        assert!(!store.consume_deposit(p.id, "dep-2", split, Utc::now()).await.unwrap());

        let stored = store.get_payment(p.id).await.unwrap().unwrap();
        assert_eq!(stored.dedup_reference.as_deref(), Some("dep-1"));
        assert_eq!(stored.status, PaymentStatus::Funded);
        assert_eq!(stored.split, Some(split));
        assert!(!store.is_deposit_consumed("dep-2").await.unwrap());
    }

    #[tokio::test]
    async fn test_deposit_consumed_by_one_payment_only() {
        let store = InMemoryLedgerStore::new();
        let first = payment(dec!(0));
        let second = payment(dec!(0));
        store.insert_payment(first.clone()).await.unwrap();
        store.insert_payment(second.clone()).await.unwrap();
        let split = Split::compute(first.amount, first.custody_percent);

        store.consume_deposit(first.id, "dep-1", split, Utc::now()).await.unwrap();
        let result = store.consume_deposit(second.id, "dep-1", split, Utc::now()).await;
        assert!(matches!(result, Err(EngineError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_status_change_keeps_concurrent_field_changes() {
        let store = InMemoryLedgerStore::new();
        let stale = funded(&store, dec!(0)).await;
        let hold = PaymentChange::Hold("rail rejected the payout".into());
        store.change_payment(stale.id, &hold, Utc::now()).await.unwrap().unwrap();

        let status = PaymentChange::Status {
            expected: stale.status,
            new: PaymentStatus::Processing,
        };
        let stored = store.change_payment(stale.id, &status, Utc::now()).await.unwrap().unwrap();
        assert_eq!(stored.status, PaymentStatus::Processing);
        assert_eq!(stored.automation_hold.as_deref(), Some("rail rejected the payout"));

        let result = store.change_payment(stale.id, &status, Utc::now()).await;
        assert!(matches!(result, Err(EngineError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_unchanged_payment_is_not_rewritten() {
        let store = InMemoryLedgerStore::new();
        let p = funded(&store, dec!(0)).await;
        let cleared = store.change_payment(p.id, &PaymentChange::ClearHold, Utc::now()).await;
        assert!(cleared.unwrap().is_none());
        let stored = store.get_payment(p.id).await.unwrap().unwrap();
        assert_eq!(stored.updated_at, p.updated_at);
    }

    #[tokio::test]
    async fn test_recorded_transactions_have_one_owner() {
        let store = InMemoryLedgerStore::new();
        let p = funded(&store, dec!(100)).await;
        let hash = TxHash::parse(&format!("0x{}", "cc".repeat(32))).unwrap();
        assert_eq!(store.tx_owner(&hash).await.unwrap(), None);

        let submitted = PaymentEvent::automatic(
            p.id,
            EventKind::StepSubmitted { step: Step::EscrowCreate, tx_hash: hash.clone() },
            "submitted",
            Utc::now(),
        );
        store.append_event(submitted).await.unwrap();
        let other = PaymentEvent::automatic(
            PaymentId::new(),
            EventKind::StepSubmitted { step: Step::EscrowCreate, tx_hash: hash.clone() },
            "submitted",
            Utc::now(),
        );
        store.append_event(other).await.unwrap();
        assert_eq!(store.tx_owner(&hash).await.unwrap(), Some(p.id));
    }

    #[tokio::test]
    async fn test_create_escrow_links_both_sides() {
        let store = InMemoryLedgerStore::new();
        let p = funded(&store, dec!(100)).await;
        let escrow = Escrow::open(&p, p.split.unwrap(), Utc::now()).unwrap();
        store.create_escrow(escrow.clone()).await.unwrap();

        let stored = store.get_payment(p.id).await.unwrap().unwrap();
        assert_eq!(stored.escrow_id, Some(escrow.id));

        let second = Escrow::open(&p, p.split.unwrap(), Utc::now()).unwrap();
        assert!(matches!(
            store.create_escrow(second).await,
            Err(EngineError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_escrow_hashes_are_set_once() {
        let store = InMemoryLedgerStore::new();
        let p = funded(&store, dec!(100)).await;
        let mut escrow = Escrow::open(&p, p.split.unwrap(), Utc::now()).unwrap();
        store.create_escrow(escrow.clone()).await.unwrap();

        let first = TxHash::parse(&format!("0x{}", "aa".repeat(32))).unwrap();
        let second = TxHash::parse(&format!("0x{}", "bb".repeat(32))).unwrap();
        escrow.status = EscrowStatus::Funded;
        escrow.release_tx_hash = Some(first);
        store.update_escrow(&escrow, EscrowStatus::Pending).await.unwrap();

        escrow.release_tx_hash = Some(second);
        let result = store.update_escrow(&escrow, EscrowStatus::Funded).await;
        assert!(matches!(result, Err(EngineError::Structural(_))));
    }

    #[tokio::test]
    async fn test_escrow_custody_end_is_immutable() {
        let store = InMemoryLedgerStore::new();
        let p = funded(&store, dec!(100)).await;
        let mut escrow = Escrow::open(&p, p.split.unwrap(), Utc::now()).unwrap();
        store.create_escrow(escrow.clone()).await.unwrap();

        escrow.custody_end += chrono::Duration::seconds(2);
        let result = store.update_escrow(&escrow, EscrowStatus::Pending).await;
        assert!(matches!(result, Err(EngineError::Structural(_))));
    }

    #[tokio::test]
    async fn test_claim_step_is_exclusive() {
        let store = InMemoryLedgerStore::new();
        let p = funded(&store, dec!(0)).await;
        let step = Step::EscrowRelease;
        store.claim_step(p.id, step, "r", Utc::now()).await.unwrap();
        assert!(matches!(
            store.claim_step(p.id, step, "r", Utc::now()).await,
            Err(EngineError::InFlight(_))
        ));
    }
}
