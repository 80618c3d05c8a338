use crate::error::{EngineError, Result};
use std::time::Duration;

/// Runtime settings the engine and scheduler read on every run.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Custodial wallet acting as escrow payer and payee.
    pub bridge_wallet: String,
    /// Rail deposit address that receives tokens returned from the bridge.
    pub rail_wallet: String,
    /// Stablecoin ticker on the rail.
    pub token_currency: String,
    /// Fiat currency payments are denominated in.
    pub fiat_currency: String,
    /// Network name the rail uses for token withdrawals.
    pub network: String,
    /// Candidates loaded per job invocation.
    pub batch_size: usize,
    /// Payments processed concurrently within one job invocation.
    pub parallelism: usize,
    /// Age after which a claim with no outcome is verified externally.
    pub claim_ttl: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            bridge_wallet: String::new(),
            rail_wallet: String::new(),
            token_currency: "mxnb".to_string(),
            fiat_currency: "mxn".to_string(),
            network: "arbitrum".to_string(),
            batch_size: 50,
            parallelism: 4,
            claim_ttl: Duration::from_secs(600),
        }
    }
}

impl EngineSettings {
    pub fn validate(&self) -> Result<()> {
        if self.bridge_wallet.trim().is_empty() {
            return Err(EngineError::Config("bridge wallet address is required".into()));
        }
        if self.rail_wallet.trim().is_empty() {
            return Err(EngineError::Config("rail wallet address is required".into()));
        }
        if self.batch_size == 0 || self.parallelism == 0 {
            return Err(EngineError::Config(
                "batch size and parallelism must be positive".into(),
            ));
        }
        if self.claim_ttl.is_zero() {
            return Err(EngineError::Config("claim TTL must be positive".into()));
        }
        Ok(())
    }
}

/// How often each scheduler job runs.
#[derive(Debug, Clone)]
pub struct ScheduleSettings {
    pub deposit_interval: Duration,
    pub funding_interval: Duration,
    pub release_interval: Duration,
    pub payout_interval: Duration,
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            deposit_interval: Duration::from_secs(30),
            funding_interval: Duration::from_secs(60),
            release_interval: Duration::from_secs(60),
            payout_interval: Duration::from_secs(60),
        }
    }
}

impl ScheduleSettings {
    pub fn validate(&self) -> Result<()> {
        let intervals = [
            self.deposit_interval,
            self.funding_interval,
            self.release_interval,
            self.payout_interval,
        ];
        if intervals.iter().any(Duration::is_zero) {
            return Err(EngineError::Config("job intervals must be positive".into()));
        }
        Ok(())
    }
}
