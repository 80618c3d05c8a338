//! HTTP client for the custodial banking rail.

use crate::domain::payment::PayoutAccount;
use crate::domain::ports::{
    CustodialRail, Deposit, DepositStatus, PayoutRequest, RailTransfer, RedemptionRequest,
    TokenWithdrawal,
};
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::Duration;

const AUTH_SCHEME: &str = "Bitso";
const WITHDRAWAL_LOOKBACK: usize = 100;

#[derive(Debug, Clone)]
pub struct RailCredentials {
    pub api_key: String,
    pub api_secret: String,
}

/// Signs `nonce + method + path + body` with HMAC-SHA256, hex encoded.
pub fn sign_request(
    secret: &str,
    nonce: &str,
    method: &str,
    path: &str,
    body: &str,
) -> Result<String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|e| EngineError::Config(format!("invalid rail secret: {e}")))?;
    mac.update(nonce.as_bytes());
    mac.update(method.as_bytes());
    mac.update(path.as_bytes());
    mac.update(body.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    success: bool,
    payload: Option<T>,
    error: Option<RailErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RailErrorBody {
    code: String,
    message: String,
}

#[derive(Debug, Deserialize)]
struct IssuedAccount {
    clabe: String,
}

#[derive(Debug, Serialize)]
struct RegisterBankAccount<'a> {
    clabe: &'a str,
    recipient_legal_name: &'a str,
}

/// Client for the custodial rail REST API.
pub struct HttpRailClient {
    client: Client,
    base_url: String,
    credentials: RailCredentials,
}

impl HttpRailClient {
    /// Builds a client whose every request is bounded by `timeout`.
    pub fn new(base_url: &str, credentials: RailCredentials, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
        })
    }

    fn nonce() -> String {
        chrono::Utc::now().timestamp_millis().to_string()
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.send(Method::GET, path, None::<&()>, false).await
    }

    async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
        moves_money: bool,
    ) -> Result<T> {
        self.send(Method::POST, path, Some(body), moves_money).await
    }

    async fn send<B: Serialize, T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
        moves_money: bool,
    ) -> Result<T> {
        let body = match body {
            Some(body) => serde_json::to_string(body)?,
            None => String::new(),
        };
        let nonce = Self::nonce();
        let signature = sign_request(
            &self.credentials.api_secret,
            &nonce,
            method.as_str(),
            path,
            &body,
        )?;
        let authorization = format!(
            "{AUTH_SCHEME} {}:{nonce}:{signature}",
            self.credentials.api_key
        );

        let url = format!("{}{}", self.base_url, path);
        let mut request = self
            .client
            .request(method, &url)
            .header(reqwest::header::AUTHORIZATION, authorization);
        if !body.is_empty() {
            request = request
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Self::transport_error(e, moves_money, path))?;
        self.handle_response(response, moves_money, path).await
    }

    /// A request that never left the client is safe to retry; anything
    /// else on a money-moving call may have been applied.
    fn transport_error(err: reqwest::Error, moves_money: bool, path: &str) -> EngineError {
        if err.is_connect() || !moves_money {
            EngineError::Transient(format!("{path}: {err}"))
        } else {
            EngineError::OutcomeUnknown(format!("{path}: {err}"))
        }
    }

    async fn handle_response<T: DeserializeOwned>(
        &self,
        response: reqwest::Response,
        moves_money: bool,
        path: &str,
    ) -> Result<T> {
        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(EngineError::RateLimited);
        }
        let text = response
            .text()
            .await
            .map_err(|e| Self::transport_error(e, moves_money, path))?;

        let envelope: Envelope<T> = match serde_json::from_str(&text) {
            Ok(envelope) => envelope,
            Err(_) if status.is_server_error() && moves_money => {
                return Err(EngineError::OutcomeUnknown(format!("{path}: HTTP {status}")));
            }
            Err(_) if !status.is_success() => {
                return Err(EngineError::Rail {
                    status: status.as_u16(),
                    message: text,
                });
            }
            Err(e) if moves_money => {
                return Err(EngineError::OutcomeUnknown(format!(
                    "{path}: unreadable response: {e}"
                )));
            }
            Err(e) => return Err(e.into()),
        };

        if let Some(error) = envelope.error.filter(|_| !envelope.success || !status.is_success()) {
            if error.code == "unregistered_account" {
                return Err(EngineError::UnregisteredAccount(error.message));
            }
            return Err(EngineError::Rail {
                status: status.as_u16(),
                message: format!("{}: {}", error.code, error.message),
            });
        }
        envelope.payload.ok_or_else(|| EngineError::Rail {
            status: status.as_u16(),
            message: format!("{path}: response without payload"),
        })
    }
}

#[async_trait]
impl CustodialRail for HttpRailClient {
    async fn issue_virtual_account(&self) -> Result<String> {
        let issued: IssuedAccount = self.post("/v1/accounts", &serde_json::json!({}), false).await?;
        Ok(issued.clabe)
    }

    async fn list_deposits(&self, account: &str) -> Result<Vec<Deposit>> {
        let deposits: Vec<Deposit> = self
            .get(&format!("/v1/deposits?account={account}&status=complete"))
            .await?;
        Ok(deposits
            .into_iter()
            .filter(|d| d.account == account && d.status == DepositStatus::Complete)
            .collect())
    }

    async fn withdraw_token(&self, request: &TokenWithdrawal) -> Result<RailTransfer> {
        self.post("/v1/withdrawals", request, true).await
    }

    async fn list_recent_withdrawals(&self) -> Result<Vec<RailTransfer>> {
        self.get(&format!("/v1/withdrawals?limit={WITHDRAWAL_LOOKBACK}"))
            .await
    }

    async fn redeem(&self, request: &RedemptionRequest) -> Result<RailTransfer> {
        self.post("/v1/redemptions", request, true).await
    }

    async fn payout(&self, request: &PayoutRequest) -> Result<RailTransfer> {
        self.post("/v1/payouts", request, true).await
    }

    async fn register_bank_account(&self, account: &PayoutAccount) -> Result<()> {
        let body = RegisterBankAccount {
            clabe: &account.clabe,
            recipient_legal_name: &account.holder_name,
        };
        let _: serde_json::Value = self.post("/v1/bank_accounts", &body, false).await?;
        Ok(())
    }
}
