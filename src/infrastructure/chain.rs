//! JSON-RPC client for the escrow contract and its stablecoin token.
//!
//! Calls are ABI encoded here and broadcast with `eth_sendTransaction` from
//! the bridge wallet, whose key is held by the signing node behind the RPC
//! endpoint.

use crate::domain::escrow::{OnChainEscrowId, TxHash};
use crate::domain::ports::{
    CreateEscrowCall, CreatedEscrow, EscrowContract, OnChainEscrow, OnChainStatus, TokenTransfer,
    TxReceipt,
};
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use sha3::{Digest, Keccak256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

const CREATE_ESCROW: &str =
    "createEscrow(address,address,address,uint256,uint256,string,string,string)";
const FUND_ESCROW: &str = "fundEscrow(uint256)";
const RELEASE_ESCROW: &str = "releaseEscrow(uint256)";
const GET_ESCROW: &str = "getEscrow(uint256)";
const ESCROW_CREATED: &str = "EscrowCreated(uint256,address,address,uint256)";
const ESCROW_RELEASED: &str = "EscrowReleased(uint256,address,uint256)";
const DECIMALS: &str = "decimals()";
const BALANCE_OF: &str = "balanceOf(address)";
const APPROVE: &str = "approve(address,uint256)";
const TRANSFER: &str = "transfer(address,uint256)";
const TRANSFER_EVENT: &str = "Transfer(address,address,uint256)";

/// Minimal Solidity ABI encoding for the types the escrow contract uses.
pub mod abi {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    pub enum Token {
        Address([u8; 20]),
        Uint(u128),
        String(String),
    }

    pub fn keccak(data: &[u8]) -> [u8; 32] {
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&Keccak256::digest(data));
        hash
    }

    pub fn selector(signature: &str) -> [u8; 4] {
        let hash = keccak(signature.as_bytes());
        [hash[0], hash[1], hash[2], hash[3]]
    }

    pub fn parse_address(value: &str) -> Result<[u8; 20]> {
        let digits = value.strip_prefix("0x").unwrap_or(value);
        let bytes = hex::decode(digits)
            .map_err(|e| EngineError::ValidationError(format!("invalid address {value}: {e}")))?;
        bytes
            .try_into()
            .map_err(|_| EngineError::ValidationError(format!("address {value} is not 20 bytes")))
    }

    pub fn uint_word(value: u128) -> [u8; 32] {
        let mut word = [0u8; 32];
        word[16..].copy_from_slice(&value.to_be_bytes());
        word
    }

    pub fn address_word(address: &[u8; 20]) -> [u8; 32] {
        let mut word = [0u8; 32];
        word[12..].copy_from_slice(address);
        word
    }

    /// Encodes `signature`'s selector followed by the head/tail encoded arguments.
    pub fn encode_call(signature: &str, args: &[Token]) -> Vec<u8> {
        let mut head = Vec::with_capacity(args.len() * 32);
        let mut tail = Vec::new();
        let head_size = args.len() * 32;
        for arg in args {
            match arg {
                Token::Address(address) => head.extend_from_slice(&address_word(address)),
                Token::Uint(value) => head.extend_from_slice(&uint_word(*value)),
                Token::String(value) => {
                    head.extend_from_slice(&uint_word((head_size + tail.len()) as u128));
                    let bytes = value.as_bytes();
                    tail.extend_from_slice(&uint_word(bytes.len() as u128));
                    tail.extend_from_slice(bytes);
                    let padding = (32 - bytes.len() % 32) % 32;
                    tail.extend(std::iter::repeat_n(0u8, padding));
                }
            }
        }
        let mut data = selector(signature).to_vec();
        data.extend(head);
        data.extend(tail);
        data
    }

    pub fn word(data: &[u8], index: usize) -> Result<&[u8]> {
        data.get(index * 32..(index + 1) * 32).ok_or_else(|| {
            EngineError::Structural(format!("ABI response too short for word {index}"))
        })
    }

    /// Decodes a uint256 word that must fit in `u128`.
    pub fn decode_uint(word: &[u8]) -> Result<u128> {
        if word.len() != 32 || word[..16].iter().any(|b| *b != 0) {
            return Err(EngineError::Structural(
                "uint256 value exceeds supported range".to_string(),
            ));
        }
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&word[16..]);
        Ok(u128::from_be_bytes(bytes))
    }

    pub fn decode_address(word: &[u8]) -> Result<String> {
        if word.len() != 32 {
            return Err(EngineError::Structural("malformed address word".to_string()));
        }
        Ok(format!("0x{}", hex::encode(&word[12..])))
    }

    pub fn from_hex(value: &str) -> Result<Vec<u8>> {
        hex::decode(value.strip_prefix("0x").unwrap_or(value))
            .map_err(|e| EngineError::Structural(format!("invalid hex from node: {e}")))
    }

    pub fn to_hex(data: &[u8]) -> String {
        format!("0x{}", hex::encode(data))
    }
}

use abi::Token;

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcLog {
    address: String,
    topics: Vec<String>,
    #[serde(default)]
    data: Option<String>,
    transaction_hash: Option<String>,
}

impl RpcLog {
    fn tx_hash(&self) -> Result<TxHash> {
        let hash = self.transaction_hash.as_deref().ok_or_else(|| {
            EngineError::Structural(format!("log of {} without transaction hash", self.address))
        })?;
        TxHash::parse(hash)
    }

    fn uint_topic(&self, index: usize) -> Result<u128> {
        let topic = self.topics.get(index).ok_or_else(|| {
            EngineError::Structural(format!("log of {} lacks topic {index}", self.address))
        })?;
        abi::decode_uint(&abi::from_hex(topic)?)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcReceipt {
    transaction_hash: String,
    status: Option<String>,
    #[serde(default)]
    logs: Vec<RpcLog>,
}

#[derive(Debug, Clone)]
pub struct ChainSettings {
    pub rpc_url: String,
    pub escrow_contract: String,
    pub token: String,
    /// Sender of every transaction; payer and payee of every escrow.
    pub bridge_wallet: String,
    pub call_timeout: Duration,
    pub confirmation_timeout: Duration,
    pub poll_interval: Duration,
}

pub struct JsonRpcEscrowContract {
    client: Client,
    settings: ChainSettings,
    request_id: AtomicU64,
}

impl JsonRpcEscrowContract {
    pub fn new(settings: ChainSettings) -> Result<Self> {
        for address in [&settings.escrow_contract, &settings.token, &settings.bridge_wallet] {
            abi::parse_address(address)?;
        }
        let client = Client::builder().timeout(settings.call_timeout).build()?;
        Ok(Self {
            client,
            settings,
            request_id: AtomicU64::new(1),
        })
    }

    async fn rpc<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<Option<T>> {
        let id = self.request_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
        let response = self
            .client
            .post(&self.settings.rpc_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Self::transport_error(e, method))?;
        let response: RpcResponse<T> = response
            .json()
            .await
            .map_err(|e| Self::transport_error(e, method))?;
        if let Some(error) = response.error {
            if error.message.to_lowercase().contains("revert") {
                return Err(EngineError::Reverted(error.message));
            }
            return Err(EngineError::Rpc {
                code: error.code,
                message: error.message,
            });
        }
        Ok(response.result)
    }

    fn transport_error(err: reqwest::Error, method: &str) -> EngineError {
        if method == "eth_sendTransaction" && !err.is_connect() {
            EngineError::OutcomeUnknown(format!("{method}: {err}"))
        } else {
            EngineError::Transient(format!("{method}: {err}"))
        }
    }

    async fn call(&self, to: &str, data: Vec<u8>) -> Result<Vec<u8>> {
        let result: Option<String> = self
            .rpc("eth_call", json!([{ "to": to, "data": abi::to_hex(&data) }, "latest"]))
            .await?;
        abi::from_hex(&result.unwrap_or_default())
    }

    async fn send_transaction(&self, to: &str, data: Vec<u8>) -> Result<TxHash> {
        let tx = json!({
            "from": self.settings.bridge_wallet,
            "to": to,
            "data": abi::to_hex(&data),
        });
        let hash: Option<String> = self.rpc("eth_sendTransaction", json!([tx])).await?;
        let hash = hash.ok_or_else(|| {
            EngineError::OutcomeUnknown("eth_sendTransaction returned no hash".to_string())
        })?;
        TxHash::parse(&hash)
    }

    fn escrow_topic(escrow: OnChainEscrowId) -> String {
        abi::to_hex(&abi::uint_word(escrow.0))
    }

    fn address_topic(address: &str) -> Result<String> {
        Ok(abi::to_hex(&abi::address_word(&abi::parse_address(address)?)))
    }

    /// Every log `address` emitted that matches `topics`, oldest first.
    async fn logs(&self, address: &str, topics: serde_json::Value) -> Result<Vec<RpcLog>> {
        let filter = json!({
            "address": address,
            "fromBlock": "earliest",
            "toBlock": "latest",
            "topics": topics,
        });
        let logs: Option<Vec<RpcLog>> = self.rpc("eth_getLogs", json!([filter])).await?;
        Ok(logs.unwrap_or_default())
    }

    fn decode_receipt(&self, receipt: RpcReceipt) -> Result<TxReceipt> {
        let created_topic = abi::to_hex(&abi::keccak(ESCROW_CREATED.as_bytes()));
        let contract = self.settings.escrow_contract.to_lowercase();
        let mut escrow_created = None;
        for log in &receipt.logs {
            if log.address.to_lowercase() != contract
                || log.topics.first().map(|t| t.to_lowercase()) != Some(created_topic.clone())
            {
                continue;
            }
            let topic = log.topics.get(1).ok_or_else(|| {
                EngineError::Structural("EscrowCreated log without escrow id topic".to_string())
            })?;
            let id = abi::decode_uint(&abi::from_hex(topic)?)?;
            escrow_created = Some(OnChainEscrowId(id));
        }
        Ok(TxReceipt {
            tx_hash: TxHash::parse(&receipt.transaction_hash)?,
            success: receipt.status.as_deref() == Some("0x1"),
            escrow_created,
        })
    }
}

fn on_chain_status(code: u128) -> Result<OnChainStatus> {
    match code {
        0 => Ok(OnChainStatus::Created),
        1 => Ok(OnChainStatus::Funded),
        2 => Ok(OnChainStatus::Released),
        3 => Ok(OnChainStatus::Disputed),
        4 => Ok(OnChainStatus::Refunded),
        other => Err(EngineError::Structural(format!("unknown on-chain escrow status {other}"))),
    }
}

#[async_trait]
impl EscrowContract for JsonRpcEscrowContract {
    fn token_address(&self) -> &str {
        &self.settings.token
    }

    async fn token_decimals(&self) -> Result<u8> {
        let data = self
            .call(&self.settings.token, abi::encode_call(DECIMALS, &[]))
            .await?;
        let decimals = abi::decode_uint(abi::word(&data, 0)?)?;
        u8::try_from(decimals)
            .map_err(|_| EngineError::Structural(format!("token reports {decimals} decimals")))
    }

    async fn token_balance(&self, owner: &str) -> Result<u128> {
        let data = abi::encode_call(BALANCE_OF, &[Token::Address(abi::parse_address(owner)?)]);
        let result = self.call(&self.settings.token, data).await?;
        abi::decode_uint(abi::word(&result, 0)?)
    }

    async fn submit_create(&self, call: &CreateEscrowCall) -> Result<TxHash> {
        let data = abi::encode_call(
            CREATE_ESCROW,
            &[
                Token::Address(abi::parse_address(&call.payer)?),
                Token::Address(abi::parse_address(&call.payee)?),
                Token::Address(abi::parse_address(&call.token)?),
                Token::Uint(call.amount),
                Token::Uint(u128::from(call.deadline)),
                Token::String(call.vertical.clone()),
                Token::String(call.clabe.clone()),
                Token::String(call.conditions.clone()),
            ],
        );
        self.send_transaction(&self.settings.escrow_contract, data).await
    }

    async fn submit_fund(&self, escrow: OnChainEscrowId, amount: u128) -> Result<TxHash> {
        let approve = abi::encode_call(
            APPROVE,
            &[
                Token::Address(abi::parse_address(&self.settings.escrow_contract)?),
                Token::Uint(amount),
            ],
        );
        let approval = self.send_transaction(&self.settings.token, approve).await?;
        let receipt = self.await_receipt(&approval).await?;
        if !receipt.success {
            return Err(EngineError::Reverted(format!("approve {approval} reverted")));
        }
        let data = abi::encode_call(FUND_ESCROW, &[Token::Uint(escrow.0)]);
        self.send_transaction(&self.settings.escrow_contract, data).await
    }

    async fn submit_release(&self, escrow: OnChainEscrowId) -> Result<TxHash> {
        let data = abi::encode_call(RELEASE_ESCROW, &[Token::Uint(escrow.0)]);
        self.send_transaction(&self.settings.escrow_contract, data).await
    }

    async fn submit_transfer(&self, to: &str, amount: u128) -> Result<TxHash> {
        let data = abi::encode_call(
            TRANSFER,
            &[Token::Address(abi::parse_address(to)?), Token::Uint(amount)],
        );
        self.send_transaction(&self.settings.token, data).await
    }

    async fn receipt(&self, tx_hash: &TxHash) -> Result<Option<TxReceipt>> {
        let receipt: Option<RpcReceipt> = self
            .rpc("eth_getTransactionReceipt", json!([tx_hash.as_str()]))
            .await?;
        receipt.map(|r| self.decode_receipt(r)).transpose()
    }

    async fn await_receipt(&self, tx_hash: &TxHash) -> Result<TxReceipt> {
        let deadline = Instant::now() + self.settings.confirmation_timeout;
        loop {
            match self.receipt(tx_hash).await {
                Ok(Some(receipt)) => return Ok(receipt),
                Ok(None) => {}
                Err(EngineError::Transient(reason)) => {
                    tracing::debug!(%tx_hash, %reason, "receipt poll failed");
                }
                Err(other) => return Err(other),
            }
            if Instant::now() >= deadline {
                return Err(EngineError::OutcomeUnknown(format!(
                    "no receipt for {tx_hash} within {:?}",
                    self.settings.confirmation_timeout
                )));
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }

    async fn read_escrow(&self, escrow: OnChainEscrowId) -> Result<OnChainEscrow> {
        let data = abi::encode_call(GET_ESCROW, &[Token::Uint(escrow.0)]);
        let result = self.call(&self.settings.escrow_contract, data).await?;
        Ok(OnChainEscrow {
            payer: abi::decode_address(abi::word(&result, 0)?)?,
            payee: abi::decode_address(abi::word(&result, 1)?)?,
            amount: abi::decode_uint(abi::word(&result, 2)?)?,
            deadline: u64::try_from(abi::decode_uint(abi::word(&result, 3)?)?)
                .map_err(|_| EngineError::Structural("escrow deadline out of range".to_string()))?,
            status: on_chain_status(abi::decode_uint(abi::word(&result, 4)?)?)?,
            token: abi::decode_address(abi::word(&result, 5)?)?,
        })
    }

    async fn find_release_tx(&self, escrow: OnChainEscrowId) -> Result<Option<TxHash>> {
        let topics = json!([
            abi::to_hex(&abi::keccak(ESCROW_RELEASED.as_bytes())),
            Self::escrow_topic(escrow),
        ]);
        let logs = self.logs(&self.settings.escrow_contract, topics).await?;
        logs.into_iter()
            .find_map(|log| log.transaction_hash)
            .map(|hash| TxHash::parse(&hash))
            .transpose()
    }

    /// Escrow id and payer are the first two indexed `EscrowCreated` fields.
    async fn find_created_escrows(&self, payer: &str) -> Result<Vec<CreatedEscrow>> {
        let topics = json!([
            abi::to_hex(&abi::keccak(ESCROW_CREATED.as_bytes())),
            null,
            Self::address_topic(payer)?,
        ]);
        self.logs(&self.settings.escrow_contract, topics)
            .await?
            .iter()
            .map(|log| -> Result<CreatedEscrow> {
                Ok(CreatedEscrow {
                    id: OnChainEscrowId(log.uint_topic(1)?),
                    tx_hash: log.tx_hash()?,
                })
            })
            .collect()
    }

    async fn find_token_transfers(&self, from: &str, to: &str) -> Result<Vec<TokenTransfer>> {
        let topics = json!([
            abi::to_hex(&abi::keccak(TRANSFER_EVENT.as_bytes())),
            Self::address_topic(from)?,
            Self::address_topic(to)?,
        ]);
        self.logs(&self.settings.token, topics)
            .await?
            .iter()
            .map(|log| -> Result<TokenTransfer> {
                let data = abi::from_hex(log.data.as_deref().unwrap_or_default())?;
                Ok(TokenTransfer {
                    tx_hash: log.tx_hash()?,
                    amount: abi::decode_uint(abi::word(&data, 0)?)?,
                })
            })
            .collect()
    }
}
