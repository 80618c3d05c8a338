use super::escrow::{Escrow, EscrowId, EscrowStatus, OnChainEscrowId, TxHash};
use super::event::{PaymentEvent, Step};
use super::money::Amount;
use super::payment::{Payment, PaymentChange, PaymentId, PaymentStatus, PayoutAccount};
use super::split::Split;
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Persistence for payments, escrows and their audit trail.
///
/// Every mutating method is a single read-check-write: the precondition is
/// re-verified inside the write and a lost race surfaces as
/// `EngineError::Conflict`. Implementations enforce the record invariants
/// themselves so no caller can bypass them.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn insert_payment(&self, payment: Payment) -> Result<()>;
    async fn get_payment(&self, id: PaymentId) -> Result<Option<Payment>>;
    async fn payments_by_status(
        &self,
        status: PaymentStatus,
        limit: usize,
    ) -> Result<Vec<Payment>>;

    /// Applies `change` to the stored payment, leaving every other field as stored.
    ///
    /// Returns the updated payment, or `None` when the change was already in effect.
    async fn change_payment(
        &self,
        id: PaymentId,
        change: &PaymentChange,
        at: DateTime<Utc>,
    ) -> Result<Option<Payment>>;

    /// Consumes `deposit_id` for a pending payment in one write: sets the dedup
    /// reference, persists `split` and moves the payment to `funded`.
    ///
    /// Returns `false` when the payment was already matched or left `pending`.
    async fn consume_deposit(
        &self,
        payment_id: PaymentId,
        deposit_id: &str,
        split: Split,
        at: DateTime<Utc>,
    ) -> Result<bool>;
    async fn is_deposit_consumed(&self, deposit_id: &str) -> Result<bool>;

    /// Inserts `escrow` and links its payment in one write.
    async fn create_escrow(&self, escrow: Escrow) -> Result<()>;
    async fn get_escrow(&self, id: EscrowId) -> Result<Option<Escrow>>;
    async fn escrows_by_status(&self, status: EscrowStatus, limit: usize) -> Result<Vec<Escrow>>;

    /// Replaces `escrow` if its stored status still equals `expected`.
    ///
    /// On-chain id and transaction hashes are set-once.
    async fn update_escrow(&self, escrow: &Escrow, expected: EscrowStatus) -> Result<()>;

    /// Appends `event` after every event already stored for its payment.
    async fn append_event(&self, event: PaymentEvent) -> Result<()>;
    async fn events(&self, payment_id: PaymentId) -> Result<Vec<PaymentEvent>>;

    /// The payment whose events recorded `tx_hash`, if any.
    async fn tx_owner(&self, tx_hash: &TxHash) -> Result<Option<PaymentId>>;

    /// Appends a `step_started` claim unless the step is open or completed.
    async fn claim_step(
        &self,
        payment_id: PaymentId,
        step: Step,
        reference: &str,
        at: DateTime<Utc>,
    ) -> Result<()>;
}

pub type LedgerStoreRef = Arc<dyn LedgerStore>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepositStatus {
    Pending,
    Complete,
    Failed,
}

/// An incoming bank transfer reported by the rail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deposit {
    pub id: String,
    pub account: String,
    pub amount: Amount,
    pub currency: String,
    pub status: DepositStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Pending,
    Complete,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferKind {
    TokenWithdrawal,
    Redemption,
    Payout,
}

/// An outgoing movement issued on the rail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RailTransfer {
    pub id: String,
    pub reference: String,
    pub kind: TransferKind,
    pub amount: Amount,
    pub currency: String,
    pub status: TransferStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenWithdrawal {
    pub reference: String,
    pub currency: String,
    pub amount: Amount,
    pub address: String,
    /// Chain the rail sends the tokens over.
    pub network: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RedemptionRequest {
    pub reference: String,
    pub currency: String,
    pub amount: Amount,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PayoutRequest {
    pub reference: String,
    pub currency: String,
    pub amount: Amount,
    pub clabe: String,
    pub holder_name: String,
    pub memo: String,
}

/// The custodial banking rail.
#[async_trait]
pub trait CustodialRail: Send + Sync {
    async fn issue_virtual_account(&self) -> Result<String>;
    async fn list_deposits(&self, account: &str) -> Result<Vec<Deposit>>;
    async fn withdraw_token(&self, request: &TokenWithdrawal) -> Result<RailTransfer>;
    /// Recent outgoing movements, used to verify calls with unknown outcome.
    async fn list_recent_withdrawals(&self) -> Result<Vec<RailTransfer>>;
    async fn redeem(&self, request: &RedemptionRequest) -> Result<RailTransfer>;
    /// Fails with `EngineError::UnregisteredAccount` for unknown accounts.
    async fn payout(&self, request: &PayoutRequest) -> Result<RailTransfer>;
    async fn register_bank_account(&self, account: &PayoutAccount) -> Result<()>;

    async fn find_transfer(&self, reference: &str) -> Result<Option<RailTransfer>> {
        Ok(self
            .list_recent_withdrawals()
            .await?
            .into_iter()
            .find(|transfer| transfer.reference == reference))
    }
}

pub type CustodialRailRef = Arc<dyn CustodialRail>;

/// Arguments of the escrow contract's `create` entrypoint.
///
/// Metadata is plain `String`: unset values are empty, never absent, because
/// the ABI encoder has no representation for null.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateEscrowCall {
    pub payer: String,
    pub payee: String,
    pub token: String,
    pub amount: u128,
    pub deadline: u64,
    pub vertical: String,
    pub clabe: String,
    pub conditions: String,
}

impl CreateEscrowCall {
    pub fn metadata(value: Option<&str>) -> String {
        value.unwrap_or_default().to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnChainStatus {
    Created,
    Funded,
    Released,
    Disputed,
    Refunded,
}

/// The contract's view of an escrow.
#[derive(Debug, Clone, PartialEq)]
pub struct OnChainEscrow {
    pub payer: String,
    pub payee: String,
    pub amount: u128,
    pub deadline: u64,
    pub status: OnChainStatus,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TxReceipt {
    pub tx_hash: TxHash,
    pub success: bool,
    /// Id carried by an `EscrowCreated` log in this receipt, if any.
    pub escrow_created: Option<OnChainEscrowId>,
}

/// An `EscrowCreated` log.
#[derive(Debug, Clone, PartialEq)]
pub struct CreatedEscrow {
    pub id: OnChainEscrowId,
    pub tx_hash: TxHash,
}

/// A token `Transfer` log.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenTransfer {
    pub tx_hash: TxHash,
    pub amount: u128,
}

/// The on-chain escrow contract and its stablecoin token.
///
/// `submit_*` methods return once the transaction is broadcast; confirmation
/// is observed through `receipt`/`await_receipt`.
#[async_trait]
pub trait EscrowContract: Send + Sync {
    fn token_address(&self) -> &str;
    async fn token_decimals(&self) -> Result<u8>;
    async fn token_balance(&self, owner: &str) -> Result<u128>;
    async fn submit_create(&self, call: &CreateEscrowCall) -> Result<TxHash>;
    /// Approves the contract for `amount` and calls `fund`.
    async fn submit_fund(&self, escrow: OnChainEscrowId, amount: u128) -> Result<TxHash>;
    async fn submit_release(&self, escrow: OnChainEscrowId) -> Result<TxHash>;
    async fn submit_transfer(&self, to: &str, amount: u128) -> Result<TxHash>;
    /// `None` while the transaction is pending or unknown to the node.
    async fn receipt(&self, tx_hash: &TxHash) -> Result<Option<TxReceipt>>;
    /// Waits for a receipt; a timeout yields `EngineError::OutcomeUnknown`.
    async fn await_receipt(&self, tx_hash: &TxHash) -> Result<TxReceipt>;
    async fn read_escrow(&self, escrow: OnChainEscrowId) -> Result<OnChainEscrow>;
    /// Hash of the transaction that emitted `EscrowReleased` for `escrow`.
    async fn find_release_tx(&self, escrow: OnChainEscrowId) -> Result<Option<TxHash>>;
    /// Escrows created with `payer` as payer, oldest first.
    async fn find_created_escrows(&self, payer: &str) -> Result<Vec<CreatedEscrow>>;
    /// Token transfers from `from` to `to`, oldest first.
    async fn find_token_transfers(&self, from: &str, to: &str) -> Result<Vec<TokenTransfer>>;
}

pub type EscrowContractRef = Arc<dyn EscrowContract>;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

pub type ClockRef = Arc<dyn Clock>;
