//! Actions backing the default screens.

use std::sync::Arc;

use alloy_primitives::Address;
use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use secrecy::ExposeSecret;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::action::{Action, Cancellable, PipeSkipped, ReportsProgress, Skippable};
use super::types::{Session, TokenChoice};
use crate::race::{race_endpoints, Probe};

// ─────────────────────────────────────────────────────────
// Network / endpoint
// ─────────────────────────────────────────────────────────

/// Picks the preselected network, or the first configured one.
pub struct SelectNetwork;

impl Skippable for SelectNetwork {
    fn skip(&self, session: &Session) -> bool {
        session.network.is_some()
    }
}

#[async_trait]
impl Action for SelectNetwork {
    fn name(&self) -> &str {
        "select-network"
    }

    async fn run(&self, session: &mut Session) -> anyhow::Result<()> {
        let network = match &session.config.preselected_network {
            Some(name) => session
                .config
                .network(name)
                .ok_or_else(|| anyhow!("Unknown network: {}", name))?,
            None => session
                .config
                .networks
                .first()
                .ok_or_else(|| anyhow!("No networks configured"))?,
        }
        .clone();
        info!(network = %network.name, chain_id = network.chain_id, "network selected");
        session.network = Some(network);
        Ok(())
    }

    fn as_skippable(&self) -> Option<&dyn Skippable> {
        Some(self)
    }
}

/// Races the selected network's endpoints and keeps the fastest.
pub struct SelectEndpoint {
    probe: Arc<dyn Probe>,
    token: Mutex<CancellationToken>,
}

impl SelectEndpoint {
    pub fn new(probe: Arc<dyn Probe>) -> Self {
        Self {
            probe,
            token: Mutex::new(CancellationToken::new()),
        }
    }
}

impl Skippable for SelectEndpoint {
    fn skip(&self, session: &Session) -> bool {
        session.endpoint.is_some()
    }
}

impl ReportsProgress for SelectEndpoint {
    fn message(&self) -> String {
        "Selecting the fastest endpoint…".to_string()
    }
}

impl Cancellable for SelectEndpoint {
    /// A fresh token per run; the previous one may already be cancelled.
    fn cancel_handle(&self) -> Option<CancellationToken> {
        let token = CancellationToken::new();
        *self.token.lock() = token.clone();
        Some(token)
    }
}

#[async_trait]
impl Action for SelectEndpoint {
    fn name(&self) -> &str {
        "select-endpoint"
    }

    async fn run(&self, session: &mut Session) -> anyhow::Result<()> {
        let network = session
            .network
            .as_ref()
            .ok_or_else(|| anyhow!("No network selected"))?;
        let token = self.token.lock().clone();
        let winner = race_endpoints(self.probe.clone(), &network.endpoints, &token)
            .await
            .with_context(|| format!("Endpoint race on {}", network.name))?;
        session.endpoint = Some(winner);
        Ok(())
    }

    fn as_skippable(&self) -> Option<&dyn Skippable> {
        Some(self)
    }

    fn as_progress(&self) -> Option<&dyn ReportsProgress> {
        Some(self)
    }

    fn as_cancellable(&self) -> Option<&dyn Cancellable> {
        Some(self)
    }
}

/// Forgets the chosen endpoint so the next race runs again.
pub struct ResetEndpoint;

#[async_trait]
impl Action for ResetEndpoint {
    fn name(&self) -> &str {
        "reset-endpoint"
    }

    async fn run(&self, session: &mut Session) -> anyhow::Result<()> {
        session.endpoint = None;
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────
// Tokens / wallet
// ─────────────────────────────────────────────────────────

pub struct SelectTokens;

impl Skippable for SelectTokens {
    fn skip(&self, session: &Session) -> bool {
        !session.tokens.is_empty()
    }
}

#[async_trait]
impl Action for SelectTokens {
    fn name(&self) -> &str {
        "select-tokens"
    }

    async fn run(&self, session: &mut Session) -> anyhow::Result<()> {
        if session.config.tokens.is_empty() {
            return Err(PipeSkipped::new("no tokens configured").into());
        }
        let mut tokens = Vec::with_capacity(session.config.tokens.len());
        for t in &session.config.tokens {
            let address: Address = t
                .address
                .parse()
                .with_context(|| format!("Invalid address for {}: {}", t.symbol, t.address))?;
            tokens.push(TokenChoice {
                symbol: t.symbol.clone(),
                address,
                decimals: t.decimals,
            });
        }
        info!(count = tokens.len(), "tokens selected");
        session.tokens = tokens;
        Ok(())
    }

    fn as_skippable(&self) -> Option<&dyn Skippable> {
        Some(self)
    }
}

/// Loads the configured secret into the session after checking its shape.
pub struct DeriveWalletSecret;

impl Skippable for DeriveWalletSecret {
    fn skip(&self, session: &Session) -> bool {
        session.wallet_secret.is_some()
    }
}

#[async_trait]
impl Action for DeriveWalletSecret {
    fn name(&self) -> &str {
        "derive-wallet-secret"
    }

    async fn run(&self, session: &mut Session) -> anyhow::Result<()> {
        let Some(secret) = session.config.wallet.private_key.clone() else {
            return Err(PipeSkipped::new("no private key configured").into());
        };
        let raw = secret.expose_secret();
        let bytes = hex::decode(raw.trim().trim_start_matches("0x"))
            .context("Private key is not valid hex")?;
        if bytes.len() != 32 {
            bail!("Private key must be 32 bytes, got {}", bytes.len());
        }
        session.wallet_secret = Some(secret);
        info!("wallet secret loaded");
        Ok(())
    }

    fn as_skippable(&self) -> Option<&dyn Skippable> {
        Some(self)
    }
}

pub struct ForgetWalletSecret;

#[async_trait]
impl Action for ForgetWalletSecret {
    fn name(&self) -> &str {
        "forget-wallet-secret"
    }

    async fn run(&self, session: &mut Session) -> anyhow::Result<()> {
        session.wallet_secret = None;
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────
// Trade
// ─────────────────────────────────────────────────────────

pub struct ValidateTrade;

#[async_trait]
impl Action for ValidateTrade {
    fn name(&self) -> &str {
        "validate-trade"
    }

    async fn run(&self, session: &mut Session) -> anyhow::Result<()> {
        session.trade.validated = false;
        let amount = session.trade.amount.ok_or_else(|| anyhow!("Trade amount not set"))?;
        if amount <= Decimal::ZERO {
            bail!("Trade amount must be positive, got {}", amount);
        }
        let max = session.config.trade.max_slippage_bps;
        if session.trade.slippage_bps > max {
            bail!(
                "Slippage {} bps exceeds the {} bps limit",
                session.trade.slippage_bps,
                max
            );
        }
        session.trade.validated = true;
        Ok(())
    }
}

/// Gate before execution: everything upstream must be in place.
pub struct CheckReady;

#[async_trait]
impl Action for CheckReady {
    fn name(&self) -> &str {
        "check-ready"
    }

    async fn run(&self, session: &mut Session) -> anyhow::Result<()> {
        if session.endpoint.is_none() {
            bail!("No endpoint selected");
        }
        if session.wallet_secret.is_none() {
            bail!("No wallet secret loaded");
        }
        if !session.trade.validated {
            bail!("Trade parameters not validated");
        }
        Ok(())
    }
}
