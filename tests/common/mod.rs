#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use escrow_engine::application::engine::EscrowEngine;
use escrow_engine::application::scheduler::Scheduler;
use escrow_engine::config::{EngineSettings, ScheduleSettings};
use escrow_engine::domain::escrow::{OnChainEscrowId, TxHash};
use escrow_engine::domain::money::{Amount, CustodyPercent};
use escrow_engine::domain::payment::{EscrowMetadata, FlowType, NewPayment, Payment, PayoutAccount};
use escrow_engine::domain::ports::{
    Clock, CreateEscrowCall, CreatedEscrow, CustodialRail, Deposit, DepositStatus, EscrowContract,
    OnChainEscrow, OnChainStatus, PayoutRequest, RailTransfer, RedemptionRequest, TokenTransfer,
    TokenWithdrawal, TransferKind, TransferStatus, TxReceipt,
};
use escrow_engine::error::{EngineError, Result};
use escrow_engine::infrastructure::in_memory::InMemoryLedgerStore;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

pub const BRIDGE_WALLET: &str = "0x00000000000000000000000000000000000000b1";
pub const RAIL_WALLET: &str = "0x00000000000000000000000000000000000000a1";
pub const TOKEN: &str = "0x00000000000000000000000000000000000000c1";
pub const DEPOSIT_ACCOUNT: &str = "646180000000000001";
pub const PAYOUT_CLABE: &str = "012180000000000002";

/// How a faked call misbehaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Rejected before taking effect.
    Unavailable,
    /// Takes effect but the caller never sees the response.
    TimeoutAfterApply,
    /// Times out without taking effect.
    Lost,
}

fn take_fault(
    faults: &mut HashMap<&'static str, VecDeque<Fault>>,
    op: &'static str,
) -> Option<Fault> {
    faults.get_mut(op).and_then(VecDeque::pop_front)
}

pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

#[derive(Default)]
struct ChainState {
    decimals: u8,
    balances: HashMap<String, u128>,
    escrows: HashMap<u128, OnChainEscrow>,
    next_id: u128,
    tx_counter: u64,
    receipts: HashMap<TxHash, TxReceipt>,
    release_txs: HashMap<u128, TxHash>,
    created: Vec<CreateEscrowCall>,
    /// `EscrowCreated` logs as (payer, log).
    created_logs: Vec<(String, CreatedEscrow)>,
    /// `Transfer` logs as (from, to, log).
    transfer_logs: Vec<(String, String, TokenTransfer)>,
    calls: HashMap<&'static str, usize>,
    faults: HashMap<&'static str, VecDeque<Fault>>,
    reverts: HashSet<&'static str>,
}

/// In-process escrow contract and token ledger.
pub struct FakeChain {
    state: Mutex<ChainState>,
}

impl FakeChain {
    pub fn new(decimals: u8) -> Self {
        Self {
            state: Mutex::new(ChainState {
                decimals,
                next_id: 1,
                ..ChainState::default()
            }),
        }
    }

    pub fn credit(&self, owner: &str, units: u128) {
        let mut state = self.state.lock().unwrap();
        *state.balances.entry(owner.to_lowercase()).or_default() += units;
    }

    pub fn balance(&self, owner: &str) -> u128 {
        let state = self.state.lock().unwrap();
        state.balances.get(&owner.to_lowercase()).copied().unwrap_or_default()
    }

    /// Removes and returns `owner`'s whole balance.
    pub fn drain(&self, owner: &str) -> u128 {
        let mut state = self.state.lock().unwrap();
        state.balances.remove(&owner.to_lowercase()).unwrap_or_default()
    }

    pub fn calls(&self, op: &str) -> usize {
        let state = self.state.lock().unwrap();
        state.calls.get(op).copied().unwrap_or_default()
    }

    pub fn fail_next(&self, op: &'static str, fault: Fault) {
        let mut state = self.state.lock().unwrap();
        state.faults.entry(op).or_default().push_back(fault);
    }

    /// Every later `op` transaction is mined but reverts.
    pub fn revert(&self, op: &'static str) {
        self.state.lock().unwrap().reverts.insert(op);
    }

    pub fn created_calls(&self) -> Vec<CreateEscrowCall> {
        self.state.lock().unwrap().created.clone()
    }

    pub fn escrow_status(&self, id: OnChainEscrowId) -> Option<OnChainStatus> {
        let state = self.state.lock().unwrap();
        state.escrows.get(&id.0).map(|e| e.status)
    }

    /// Releases directly on the contract, as another operator would.
    pub fn release_out_of_band(&self, id: OnChainEscrowId) -> TxHash {
        let mut state = self.state.lock().unwrap();
        let hash = Self::next_hash(&mut *state);
        if let Some(escrow) = state.escrows.get_mut(&id.0) {
            escrow.status = OnChainStatus::Released;
        }
        state.release_txs.insert(id.0, hash.clone());
        state.receipts.insert(
            hash.clone(),
            TxReceipt {
                tx_hash: hash.clone(),
                success: true,
                escrow_created: None,
            },
        );
        hash
    }

    fn next_hash(state: &mut ChainState) -> TxHash {
        state.tx_counter += 1;
        TxHash::parse(&format!("0x{:064x}", state.tx_counter)).unwrap()
    }

    /// Records the call and applies `effect` unless a fault says otherwise.
    fn submit(
        &self,
        op: &'static str,
        effect: impl FnOnce(&mut ChainState, &TxHash) -> Result<Option<OnChainEscrowId>>,
    ) -> Result<TxHash> {
        let mut state = self.state.lock().unwrap();
        *state.calls.entry(op).or_default() += 1;
        let fault = take_fault(&mut state.faults, op);
        match fault {
            Some(Fault::Unavailable) => {
                return Err(EngineError::Transient(format!("{op}: node unavailable")));
            }
            Some(Fault::Lost) => {
                return Err(EngineError::OutcomeUnknown(format!("{op}: request timed out")));
            }
            _ => {}
        }
        let hash = Self::next_hash(&mut *state);
        let success = !state.reverts.contains(op);
        let escrow_created = if success { effect(&mut *state, &hash)? } else { None };
        state.receipts.insert(
            hash.clone(),
            TxReceipt {
                tx_hash: hash.clone(),
                success,
                escrow_created,
            },
        );
        if fault == Some(Fault::TimeoutAfterApply) {
            return Err(EngineError::OutcomeUnknown(format!("{op}: request timed out")));
        }
        Ok(hash)
    }

    fn debit(state: &mut ChainState, owner: &str, units: u128) -> Result<()> {
        let balance = state.balances.entry(owner.to_lowercase()).or_default();
        if *balance < units {
            return Err(EngineError::Reverted("insufficient token balance".into()));
        }
        *balance -= units;
        Ok(())
    }
}

#[async_trait]
impl EscrowContract for FakeChain {
    fn token_address(&self) -> &str {
        TOKEN
    }

    async fn token_decimals(&self) -> Result<u8> {
        Ok(self.state.lock().unwrap().decimals)
    }

    async fn token_balance(&self, owner: &str) -> Result<u128> {
        Ok(self.balance(owner))
    }

    async fn submit_create(&self, call: &CreateEscrowCall) -> Result<TxHash> {
        let call = call.clone();
        self.submit("create", move |state, hash| {
            let id = state.next_id;
            state.next_id += 1;
            state.escrows.insert(
                id,
                OnChainEscrow {
                    payer: call.payer.clone(),
                    payee: call.payee.clone(),
                    amount: call.amount,
                    deadline: call.deadline,
                    status: OnChainStatus::Created,
                    token: call.token.clone(),
                },
            );
            state.created_logs.push((
                call.payer.to_lowercase(),
                CreatedEscrow {
                    id: OnChainEscrowId(id),
                    tx_hash: hash.clone(),
                },
            ));
            state.created.push(call);
            Ok(Some(OnChainEscrowId(id)))
        })
    }

    async fn submit_fund(&self, escrow: OnChainEscrowId, amount: u128) -> Result<TxHash> {
        self.submit("fund", move |state, _| {
            Self::debit(state, BRIDGE_WALLET, amount)?;
            let record = state
                .escrows
                .get_mut(&escrow.0)
                .ok_or_else(|| EngineError::Reverted("unknown escrow".into()))?;
            record.status = OnChainStatus::Funded;
            Ok(None)
        })
    }

    async fn submit_release(&self, escrow: OnChainEscrowId) -> Result<TxHash> {
        self.submit("release", move |state, hash| {
            let record = state
                .escrows
                .get_mut(&escrow.0)
                .ok_or_else(|| EngineError::Reverted("unknown escrow".into()))?;
            if record.status != OnChainStatus::Funded {
                return Err(EngineError::Reverted("escrow not funded".into()));
            }
            record.status = OnChainStatus::Released;
            let amount = record.amount;
            *state.balances.entry(BRIDGE_WALLET.to_string()).or_default() += amount;
            state.release_txs.insert(escrow.0, hash.clone());
            Ok(None)
        })
    }

    async fn submit_transfer(&self, to: &str, amount: u128) -> Result<TxHash> {
        let to = to.to_lowercase();
        self.submit("transfer", move |state, hash| {
            Self::debit(state, BRIDGE_WALLET, amount)?;
            *state.balances.entry(to.clone()).or_default() += amount;
            state.transfer_logs.push((
                BRIDGE_WALLET.to_lowercase(),
                to,
                TokenTransfer {
                    tx_hash: hash.clone(),
                    amount,
                },
            ));
            Ok(None)
        })
    }

    async fn receipt(&self, tx_hash: &TxHash) -> Result<Option<TxReceipt>> {
        Ok(self.state.lock().unwrap().receipts.get(tx_hash).cloned())
    }

    async fn await_receipt(&self, tx_hash: &TxHash) -> Result<TxReceipt> {
        let mut state = self.state.lock().unwrap();
        if take_fault(&mut state.faults, "await_receipt").is_some() {
            return Err(EngineError::OutcomeUnknown(format!("{tx_hash} not confirmed in time")));
        }
        state
            .receipts
            .get(tx_hash)
            .cloned()
            .ok_or_else(|| EngineError::OutcomeUnknown(format!("{tx_hash} unknown")))
    }

    async fn read_escrow(&self, escrow: OnChainEscrowId) -> Result<OnChainEscrow> {
        let state = self.state.lock().unwrap();
        state
            .escrows
            .get(&escrow.0)
            .cloned()
            .ok_or_else(|| EngineError::Structural(format!("escrow {escrow} not on chain")))
    }

    async fn find_release_tx(&self, escrow: OnChainEscrowId) -> Result<Option<TxHash>> {
        Ok(self.state.lock().unwrap().release_txs.get(&escrow.0).cloned())
    }

    async fn find_created_escrows(&self, payer: &str) -> Result<Vec<CreatedEscrow>> {
        let state = self.state.lock().unwrap();
        let payer = payer.to_lowercase();
        Ok(state
            .created_logs
            .iter()
            .filter(|(logged, _)| *logged == payer)
            .map(|(_, log)| log.clone())
            .collect())
    }

    async fn find_token_transfers(&self, from: &str, to: &str) -> Result<Vec<TokenTransfer>> {
        let state = self.state.lock().unwrap();
        let (from, to) = (from.to_lowercase(), to.to_lowercase());
        Ok(state
            .transfer_logs
            .iter()
            .filter(|(sender, receiver, _)| *sender == from && *receiver == to)
            .map(|(_, _, log)| log.clone())
            .collect())
    }
}

#[derive(Default)]
struct RailState {
    deposits: Vec<Deposit>,
    transfers: Vec<RailTransfer>,
    withdrawals: Vec<TokenWithdrawal>,
    registered: HashSet<String>,
    require_registration: bool,
    next_account: u64,
    calls: HashMap<&'static str, usize>,
    faults: HashMap<&'static str, VecDeque<Fault>>,
}

/// In-process custodial rail.
///
/// Not idempotent on references, so duplicate submissions show up in
/// `calls` and `transfers`.
pub struct FakeRail {
    state: Mutex<RailState>,
    chain: Option<Arc<FakeChain>>,
}

impl FakeRail {
    pub fn new(chain: Option<Arc<FakeChain>>) -> Self {
        Self {
            state: Mutex::new(RailState::default()),
            chain,
        }
    }

    pub fn add_deposit(&self, account: &str, amount: Decimal, created_at: DateTime<Utc>) -> String {
        let mut state = self.state.lock().unwrap();
        let id = format!("dep-{}", state.deposits.len() + 1);
        state.deposits.push(Deposit {
            id: id.clone(),
            account: account.to_string(),
            amount: Amount::new(amount).unwrap(),
            currency: "MXN".to_string(),
            status: DepositStatus::Complete,
            created_at,
        });
        id
    }

    pub fn calls(&self, op: &str) -> usize {
        let state = self.state.lock().unwrap();
        state.calls.get(op).copied().unwrap_or_default()
    }

    pub fn transfers(&self, kind: TransferKind) -> Vec<RailTransfer> {
        let state = self.state.lock().unwrap();
        state.transfers.iter().filter(|t| t.kind == kind).cloned().collect()
    }

    pub fn fail_next(&self, op: &'static str, fault: Fault) {
        let mut state = self.state.lock().unwrap();
        state.faults.entry(op).or_default().push_back(fault);
    }

    /// Token withdrawal requests as received.
    pub fn withdrawal_requests(&self) -> Vec<TokenWithdrawal> {
        self.state.lock().unwrap().withdrawals.clone()
    }

    pub fn require_registration(&self) {
        self.state.lock().unwrap().require_registration = true;
    }

    fn transfer(
        &self,
        op: &'static str,
        kind: TransferKind,
        reference: &str,
        amount: Amount,
        currency: &str,
    ) -> Result<RailTransfer> {
        let mut state = self.state.lock().unwrap();
        *state.calls.entry(op).or_default() += 1;
        let fault = take_fault(&mut state.faults, op);
        match fault {
            Some(Fault::Unavailable) => {
                return Err(EngineError::Transient(format!("{op}: rail unavailable")));
            }
            Some(Fault::Lost) => {
                return Err(EngineError::OutcomeUnknown(format!("{op}: request timed out")));
            }
            _ => {}
        }
        let transfer = RailTransfer {
            id: format!("tr-{}", state.transfers.len() + 1),
            reference: reference.to_string(),
            kind,
            amount,
            currency: currency.to_string(),
            status: TransferStatus::Complete,
        };
        state.transfers.push(transfer.clone());
        if fault == Some(Fault::TimeoutAfterApply) {
            return Err(EngineError::OutcomeUnknown(format!("{op}: request timed out")));
        }
        Ok(transfer)
    }
}

#[async_trait]
impl CustodialRail for FakeRail {
    async fn issue_virtual_account(&self) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        state.next_account += 1;
        Ok(format!("6461800000000{:05}", state.next_account))
    }

    async fn list_deposits(&self, account: &str) -> Result<Vec<Deposit>> {
        let mut state = self.state.lock().unwrap();
        *state.calls.entry("list_deposits").or_default() += 1;
        if take_fault(&mut state.faults, "list_deposits").is_some() {
            return Err(EngineError::Transient("rail unavailable".into()));
        }
        Ok(state.deposits.iter().filter(|d| d.account == account).cloned().collect())
    }

    async fn withdraw_token(&self, request: &TokenWithdrawal) -> Result<RailTransfer> {
        self.state.lock().unwrap().withdrawals.push(request.clone());
        let result = self.transfer(
            "withdraw",
            TransferKind::TokenWithdrawal,
            &request.reference,
            request.amount,
            &request.currency,
        );
        let applied = self
            .transfers(TransferKind::TokenWithdrawal)
            .iter()
            .any(|t| t.reference == request.reference);
        if applied {
            if let Some(chain) = &self.chain {
                let decimals = chain.token_decimals().await?;
                chain.credit(&request.address, request.amount.to_base_units(decimals)?);
            }
        }
        result
    }

    async fn list_recent_withdrawals(&self) -> Result<Vec<RailTransfer>> {
        Ok(self.state.lock().unwrap().transfers.clone())
    }

    async fn redeem(&self, request: &RedemptionRequest) -> Result<RailTransfer> {
        self.transfer(
            "redeem",
            TransferKind::Redemption,
            &request.reference,
            request.amount,
            &request.currency,
        )
    }

    async fn payout(&self, request: &PayoutRequest) -> Result<RailTransfer> {
        {
            let mut state = self.state.lock().unwrap();
            if state.require_registration && !state.registered.contains(&request.clabe) {
                *state.calls.entry("payout").or_default() += 1;
                return Err(EngineError::UnregisteredAccount(request.clabe.clone()));
            }
        }
        self.transfer(
            "payout",
            TransferKind::Payout,
            &request.reference,
            request.amount,
            &request.currency,
        )
    }

    async fn register_bank_account(&self, account: &PayoutAccount) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        *state.calls.entry("register").or_default() += 1;
        state.registered.insert(account.clabe.clone());
        Ok(())
    }
}

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
}

pub fn settings() -> EngineSettings {
    EngineSettings {
        bridge_wallet: BRIDGE_WALLET.to_string(),
        rail_wallet: RAIL_WALLET.to_string(),
        ..EngineSettings::default()
    }
}

pub fn new_payment(
    amount: Decimal,
    custody_percent: Decimal,
    custody_seconds: u64,
    flow: FlowType,
) -> NewPayment {
    NewPayment {
        amount: Amount::new(amount).unwrap(),
        currency: "MXN".to_string(),
        custody_percent: CustodyPercent::new(custody_percent).unwrap(),
        custody_seconds,
        flow,
        payer_id: "payer-1".to_string(),
        beneficiary_id: "beneficiary-1".to_string(),
        deposit_account: Some(DEPOSIT_ACCOUNT.to_string()),
        payout_account: PayoutAccount {
            clabe: PAYOUT_CLABE.to_string(),
            holder_name: "Beneficiary SA de CV".to_string(),
        },
        metadata: EscrowMetadata {
            vertical: Some("real-estate".to_string()),
            conditions: None,
        },
    }
}

/// An engine wired to in-process fakes and a manual clock.
pub struct Harness {
    pub engine: Arc<EscrowEngine>,
    pub store: Arc<InMemoryLedgerStore>,
    pub rail: Arc<FakeRail>,
    pub chain: Arc<FakeChain>,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_decimals(6)
    }

    pub fn with_decimals(decimals: u8) -> Self {
        let store = Arc::new(InMemoryLedgerStore::new());
        let chain = Arc::new(FakeChain::new(decimals));
        let rail = Arc::new(FakeRail::new(Some(chain.clone())));
        let clock = Arc::new(ManualClock::new(start_time()));
        Self {
            engine: Arc::new(Self::engine_over(&store, &rail, &chain, &clock)),
            store,
            rail,
            chain,
            clock,
        }
    }

    /// A second engine sharing every collaborator, as another worker process would.
    pub fn sibling(&self) -> EscrowEngine {
        Self::engine_over(&self.store, &self.rail, &self.chain, &self.clock)
    }

    /// An engine over this harness's collaborators but another contract.
    pub fn engine_with_contract(&self, contract: Arc<dyn EscrowContract>) -> EscrowEngine {
        EscrowEngine::new(
            self.store.clone(),
            self.rail.clone(),
            contract,
            self.clock.clone(),
            settings(),
        )
    }

    fn engine_over(
        store: &Arc<InMemoryLedgerStore>,
        rail: &Arc<FakeRail>,
        chain: &Arc<FakeChain>,
        clock: &Arc<ManualClock>,
    ) -> EscrowEngine {
        EscrowEngine::new(store.clone(), rail.clone(), chain.clone(), clock.clone(), settings())
    }

    pub fn clock_now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(self.engine.clone(), ScheduleSettings::default())
    }

    /// Registers a payment and makes a matching deposit visible on the rail.
    pub async fn deposited_payment(&self, request: NewPayment) -> Payment {
        let payment = self.engine.register_payment(request).await.unwrap();
        self.rail.add_deposit(
            payment.deposit_account.as_deref().unwrap(),
            payment.amount.value(),
            self.clock.now(),
        );
        payment
    }

    /// Registers a payment and matches its deposit.
    pub async fn funded_payment(&self, request: NewPayment) -> Payment {
        let payment = self.deposited_payment(request).await;
        self.engine.match_deposit(payment.id).await.unwrap();
        self.engine.payment(payment.id).await.unwrap()
    }
}
