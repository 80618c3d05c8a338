use super::invariants;
use crate::domain::escrow::{Escrow, EscrowId, EscrowStatus, TxHash};
use crate::domain::event::{EventKind, PaymentEvent, Step};
use crate::domain::payment::{Payment, PaymentChange, PaymentId, PaymentStatus};
use crate::domain::ports::LedgerStore;
use crate::domain::split::Split;
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rocksdb::{ColumnFamilyDescriptor, DB, Direction, IteratorMode, Options, WriteBatch};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Column Family for payment records.
pub const CF_PAYMENTS: &str = "payments";
/// Column Family for escrow records.
pub const CF_ESCROWS: &str = "escrows";
/// Column Family for the append-only event log, keyed by payment then sequence.
pub const CF_EVENTS: &str = "events";
/// Column Family mapping consumed deposit ids to their payment.
pub const CF_DEPOSITS: &str = "deposits";
/// Column Family mapping recorded chain transactions to their payment.
pub const CF_TRANSACTIONS: &str = "transactions";

/// A persistent ledger using RocksDB.
///
/// Each record type lives in its own Column Family. Multi-record writes go
/// through a `WriteBatch`, and an async mutex serializes every
/// read-check-write so concurrent job runs cannot interleave between the
/// check and the write.
///
/// This struct is thread-safe (`Clone` shares the underlying `Arc<DB>`).
#[derive(Clone)]
pub struct RocksDbLedgerStore {
    db: Arc<DB>,
    write_lock: Arc<Mutex<()>>,
}

impl RocksDbLedgerStore {
    /// Opens or creates a RocksDB instance at the specified path.
    ///
    /// Ensures that every required column family exists.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let families = [CF_PAYMENTS, CF_ESCROWS, CF_EVENTS, CF_DEPOSITS, CF_TRANSACTIONS]
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect::<Vec<_>>();

        let db = DB::open_cf_descriptors(&opts, path, families)?;

        Ok(Self {
            db: Arc::new(db),
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| EngineError::internal(format!("{name} column family not found")))
    }

    fn read<T: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>> {
        match self.db.get_cf(self.cf(cf)?, key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn scan<T: DeserializeOwned>(&self, cf: &str, prefix: &[u8]) -> Result<Vec<T>> {
        let mut items = Vec::new();
        let iter = self
            .db
            .iterator_cf(self.cf(cf)?, IteratorMode::From(prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            items.push(serde_json::from_slice(&value)?);
        }
        Ok(items)
    }

    fn put<T: Serialize>(
        &self,
        batch: &mut WriteBatch,
        cf: &str,
        key: &[u8],
        value: &T,
    ) -> Result<()> {
        batch.put_cf(self.cf(cf)?, key, serde_json::to_vec(value)?);
        Ok(())
    }

    fn payment_key(id: PaymentId) -> [u8; 16] {
        *id.0.as_bytes()
    }

    fn escrow_key(id: EscrowId) -> [u8; 16] {
        *id.0.as_bytes()
    }

    /// Payment id, then a per-payment sequence: a prefix scan returns a
    /// payment's events in append order.
    fn event_key(payment_id: PaymentId, sequence: u64) -> [u8; 24] {
        let mut key = [0u8; 24];
        key[..16].copy_from_slice(payment_id.0.as_bytes());
        key[16..].copy_from_slice(&sequence.to_be_bytes());
        key
    }

    /// Next free event sequence for `payment_id`. Callers hold `write_lock`.
    fn next_sequence(&self, payment_id: PaymentId) -> Result<u64> {
        let upper = Self::event_key(payment_id, u64::MAX);
        let mut iter = self
            .db
            .iterator_cf(self.cf(CF_EVENTS)?, IteratorMode::From(&upper[..], Direction::Reverse));
        match iter.next() {
            Some(item) => {
                let (key, _) = item?;
                if !key.starts_with(payment_id.0.as_bytes()) {
                    return Ok(0);
                }
                let mut sequence = [0u8; 8];
                sequence.copy_from_slice(key.get(16..24).ok_or_else(|| {
                    EngineError::internal(format!("malformed event key for payment {payment_id}"))
                })?);
                Ok(u64::from_be_bytes(sequence) + 1)
            }
            None => Ok(0),
        }
    }

    /// Appends `event` and indexes its transaction. Callers hold `write_lock`.
    fn write_event(&self, event: &PaymentEvent) -> Result<()> {
        let sequence = self.next_sequence(event.payment_id)?;
        let mut batch = WriteBatch::default();
        self.put(&mut batch, CF_EVENTS, &Self::event_key(event.payment_id, sequence), event)?;
        if let Some(hash) = event.tx_hash() {
            if self.read::<PaymentId>(CF_TRANSACTIONS, hash.as_str().as_bytes())?.is_none() {
                self.put(&mut batch, CF_TRANSACTIONS, hash.as_str().as_bytes(), &event.payment_id)?;
            }
        }
        self.db.write(batch)?;
        Ok(())
    }

    fn payment(&self, id: PaymentId) -> Result<Option<Payment>> {
        self.read(CF_PAYMENTS, &Self::payment_key(id))
    }

    fn escrow(&self, id: EscrowId) -> Result<Option<Escrow>> {
        self.read(CF_ESCROWS, &Self::escrow_key(id))
    }

    fn event_log(&self, payment_id: PaymentId) -> Result<Vec<PaymentEvent>> {
        self.scan(CF_EVENTS, payment_id.0.as_bytes())
    }
}

#[async_trait]
impl LedgerStore for RocksDbLedgerStore {
    async fn insert_payment(&self, payment: Payment) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        if self.payment(payment.id)?.is_some() {
            return Err(EngineError::Conflict(format!("payment {} already exists", payment.id)));
        }
        let mut batch = WriteBatch::default();
        self.put(&mut batch, CF_PAYMENTS, &Self::payment_key(payment.id), &payment)?;
        self.db.write(batch)?;
        Ok(())
    }

    async fn get_payment(&self, id: PaymentId) -> Result<Option<Payment>> {
        self.payment(id)
    }

    async fn payments_by_status(
        &self,
        status: PaymentStatus,
        limit: usize,
    ) -> Result<Vec<Payment>> {
        let mut matching: Vec<Payment> = self
            .scan::<Payment>(CF_PAYMENTS, &[])?
            .into_iter()
            .filter(|p| p.status == status)
            .collect();
        matching.sort_by_key(|p| p.created_at);
        matching.truncate(limit);
        Ok(matching)
    }

    async fn change_payment(
        &self,
        id: PaymentId,
        change: &PaymentChange,
        at: DateTime<Utc>,
    ) -> Result<Option<Payment>> {
        let _guard = self.write_lock.lock().await;
        let mut payment = self
            .payment(id)?
            .ok_or_else(|| EngineError::NotFound(format!("payment {id}")))?;
        if !payment.apply(change, at)? {
            return Ok(None);
        }
        let mut batch = WriteBatch::default();
        self.put(&mut batch, CF_PAYMENTS, &Self::payment_key(id), &payment)?;
        self.db.write(batch)?;
        Ok(Some(payment))
    }

    async fn consume_deposit(
        &self,
        payment_id: PaymentId,
        deposit_id: &str,
        split: Split,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        if let Some(owner) = self.read::<PaymentId>(CF_DEPOSITS, deposit_id.as_bytes())? {
            return Err(EngineError::Conflict(format!(
                "deposit {deposit_id} already consumed by payment {owner}"
            )));
        }
        let mut payment = self
            .payment(payment_id)?
            .ok_or_else(|| EngineError::NotFound(format!("payment {payment_id}")))?;
        if !invariants::can_consume(&payment) {
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

        let mut batch = WriteBatch::default();
        self.put(&mut batch, CF_PAYMENTS, &Self::payment_key(payment_id), &payment)?;
        self.put(&mut batch, CF_DEPOSITS, deposit_id.as_bytes(), &payment_id)?;
        self.db.write(batch)?;
        Ok(true)
    }

    async fn is_deposit_consumed(&self, deposit_id: &str) -> Result<bool> {
        Ok(self.db.get_pinned_cf(self.cf(CF_DEPOSITS)?, deposit_id.as_bytes())?.is_some())
    }

    async fn create_escrow(&self, escrow: Escrow) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let exists = self.escrow(escrow.id)?.is_some();
        let mut payment = self
            .payment(escrow.payment_id)?
            .ok_or_else(|| EngineError::NotFound(format!("payment {}", escrow.payment_id)))?;
        invariants::check_new_escrow(&escrow, &payment, exists)?;
        payment.escrow_id = Some(escrow.id);
        payment.updated_at = escrow.created_at;

        let mut batch = WriteBatch::default();
        self.put(&mut batch, CF_ESCROWS, &Self::escrow_key(escrow.id), &escrow)?;
        self.put(&mut batch, CF_PAYMENTS, &Self::payment_key(payment.id), &payment)?;
        self.db.write(batch)?;
        Ok(())
    }

    async fn get_escrow(&self, id: EscrowId) -> Result<Option<Escrow>> {
        self.escrow(id)
    }

    async fn escrows_by_status(&self, status: EscrowStatus, limit: usize) -> Result<Vec<Escrow>> {
        let mut matching: Vec<Escrow> = self
            .scan::<Escrow>(CF_ESCROWS, &[])?
            .into_iter()
            .filter(|e| e.status == status)
            .collect();
        matching.sort_by_key(|e| e.custody_end);
        matching.truncate(limit);
        Ok(matching)
    }

    async fn update_escrow(&self, escrow: &Escrow, expected: EscrowStatus) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let stored = self
            .escrow(escrow.id)?
            .ok_or_else(|| EngineError::NotFound(format!("escrow {}", escrow.id)))?;
        let payment = self.payment(stored.payment_id)?;
        invariants::check_escrow_update(&stored, escrow, expected, payment.as_ref())?;
        let mut batch = WriteBatch::default();
        self.put(&mut batch, CF_ESCROWS, &Self::escrow_key(escrow.id), escrow)?;
        self.db.write(batch)?;
        Ok(())
    }

    async fn append_event(&self, event: PaymentEvent) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.write_event(&event)
    }

    async fn events(&self, payment_id: PaymentId) -> Result<Vec<PaymentEvent>> {
        self.event_log(payment_id)
    }

    async fn tx_owner(&self, tx_hash: &TxHash) -> Result<Option<PaymentId>> {
        self.read(CF_TRANSACTIONS, tx_hash.as_str().as_bytes())
    }

    async fn claim_step(
        &self,
        payment_id: PaymentId,
        step: Step,
        reference: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        invariants::check_claim(&self.event_log(payment_id)?, step)?;
        let event = PaymentEvent::automatic(
            payment_id,
            EventKind::StepStarted {
                step,
                reference: reference.to_string(),
            },
            format!("{step} started"),
            at,
        );
        self.write_event(&event)
    }
}
