use alloy_primitives::Address;
use rust_decimal::Decimal;
use secrecy::SecretString;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::conduit::Conduit;
use crate::race::LatencySample;
use crate::{NetworkConfig, WizardConfig};

/// Which staged sequence of a module is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    BeforeEnter,
    Main,
    AfterLeaveForward,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::BeforeEnter => "before-enter",
            Stage::Main => "main",
            Stage::AfterLeaveForward => "after-leave-forward",
        }
    }
}

/// Named sub-sequences that can be forked onto the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Branch {
    TradeSetup,
    OrderEntry,
    MarketExecution,
    Settings,
    SettingsEndpoint,
    SettingsWallet,
    SettingsWalletNewSecret,
    SettingsWalletDerivation,
    Quit,
}

impl Branch {
    pub const ALL: [Branch; 9] = [
        Branch::TradeSetup,
        Branch::OrderEntry,
        Branch::MarketExecution,
        Branch::Settings,
        Branch::SettingsEndpoint,
        Branch::SettingsWallet,
        Branch::SettingsWalletNewSecret,
        Branch::SettingsWalletDerivation,
        Branch::Quit,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Branch::TradeSetup => "trade-setup",
            Branch::OrderEntry => "order-entry",
            Branch::MarketExecution => "market-execution",
            Branch::Settings => "settings",
            Branch::SettingsEndpoint => "settings-endpoint",
            Branch::SettingsWallet => "settings-wallet",
            Branch::SettingsWalletNewSecret => "settings-wallet-new-secret",
            Branch::SettingsWalletDerivation => "settings-wallet-derivation",
            Branch::Quit => "quit",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|b| b.as_str().eq_ignore_ascii_case(s.trim()))
    }
}

/// A configured token resolved to an on-chain address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenChoice {
    pub symbol: String,
    pub address: Address,
    pub decimals: u8,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TradeParams {
    pub amount: Option<Decimal>,
    pub slippage_bps: u32,
    pub validated: bool,
}

/// State of one wizard run. Owned by the orchestrator and lent to every
/// action and module hook; never cloned.
#[derive(Debug)]
pub struct Session {
    pub run_id: Uuid,
    pub config: WizardConfig,
    pub network: Option<NetworkConfig>,
    pub endpoint: Option<LatencySample>,
    pub tokens: Vec<TokenChoice>,
    pub wallet_secret: Option<SecretString>,
    pub trade: TradeParams,
    progress: Conduit<String>,
    cancels: Conduit<CancellationToken>,
}

impl Session {
    pub fn new(
        config: WizardConfig,
        progress: Conduit<String>,
        cancels: Conduit<CancellationToken>,
    ) -> Self {
        let trade = TradeParams {
            amount: config.trade.amount,
            slippage_bps: config.trade.slippage_bps,
            validated: false,
        };
        Self {
            run_id: Uuid::new_v4(),
            config,
            network: None,
            endpoint: None,
            tokens: Vec::new(),
            wallet_secret: None,
            trade,
            progress,
            cancels,
        }
    }

    pub fn progress(&self) -> &Conduit<String> {
        &self.progress
    }

    pub fn cancels(&self) -> &Conduit<CancellationToken> {
        &self.cancels
    }
}
