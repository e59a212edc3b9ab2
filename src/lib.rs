pub mod race;
pub mod wizard;

use rust_decimal::Decimal;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use anyhow::Context;

// --- Configuration Structs ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WizardConfig {
    pub networks: Vec<NetworkConfig>,
    pub tokens: Vec<TokenConfig>,
    /// Network picked without asking, if any.
    #[serde(default)]
    pub preselected_network: Option<String>,
    /// Upper bound for a single endpoint probe.
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    #[serde(default)]
    pub wallet: WalletConfig,
    #[serde(default)]
    pub trade: TradeDefaults,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkConfig {
    pub name: String,
    pub chain_id: u64,
    pub endpoints: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenConfig {
    pub symbol: String,
    pub address: String,
    pub decimals: u8,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WalletConfig {
    /// Hex encoded 32 byte secret. Only ever read from the environment.
    #[serde(skip)]
    pub private_key: Option<SecretString>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TradeDefaults {
    pub amount: Option<Decimal>,
    pub slippage_bps: u32,
    pub max_slippage_bps: u32,
}

impl Default for TradeDefaults {
    fn default() -> Self {
        Self {
            amount: None,
            slippage_bps: 50,
            max_slippage_bps: 500,
        }
    }
}

fn default_probe_timeout_ms() -> u64 {
    3_000
}

impl Default for WizardConfig {
    fn default() -> Self {
        Self {
            networks: vec![
                NetworkConfig {
                    name: "polygon".into(),
                    chain_id: 137,
                    endpoints: vec![
                        "https://polygon-rpc.com".into(),
                        "https://polygon-bor-rpc.publicnode.com".into(),
                        "wss://polygon-bor-rpc.publicnode.com".into(),
                    ],
                },
                NetworkConfig {
                    name: "ethereum".into(),
                    chain_id: 1,
                    endpoints: vec![
                        "https://ethereum-rpc.publicnode.com".into(),
                        "wss://ethereum-rpc.publicnode.com".into(),
                    ],
                },
            ],
            tokens: Vec::new(),
            preselected_network: None,
            probe_timeout_ms: default_probe_timeout_ms(),
            wallet: WalletConfig::default(),
            trade: TradeDefaults::default(),
        }
    }
}

impl WizardConfig {
    /// Defaults, then the JSON file named by `WIZARD_CONFIG`, then single
    /// env overrides. Unparseable overrides are ignored.
    pub fn from_env() -> anyhow::Result<Self> {
        let mut c = match std::env::var("WIZARD_CONFIG") {
            Ok(path) => Self::from_json_file(&path)?,
            Err(_) => Self::default(),
        };
        if let Ok(v) = std::env::var("WIZARD_NETWORK") { c.preselected_network = Some(v); }
        if let Ok(v) = std::env::var("WIZARD_ENDPOINTS") { c.override_endpoints(&v); }
        if let Ok(v) = std::env::var("WIZARD_PROBE_TIMEOUT_MS") { if let Ok(ms) = v.parse() { c.probe_timeout_ms = ms; } }
        if let Ok(v) = std::env::var("WIZARD_PRIVATE_KEY") { c.wallet.private_key = Some(SecretString::from(v)); }
        if let Ok(v) = std::env::var("WIZARD_TRADE_AMOUNT") { if let Ok(d) = v.parse() { c.trade.amount = Some(d); } }
        if let Ok(v) = std::env::var("WIZARD_SLIPPAGE_BPS") { if let Ok(bps) = v.parse() { c.trade.slippage_bps = bps; } }
        Ok(c)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read wizard config {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse wizard config {}", path.display()))
    }

    pub fn network(&self, name: &str) -> Option<&NetworkConfig> {
        self.networks.iter().find(|n| n.name.eq_ignore_ascii_case(name))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// Replaces the endpoints of the preselected network (or the first one)
    /// with a comma separated list.
    fn override_endpoints(&mut self, list: &str) {
        let endpoints: Vec<String> = list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        if endpoints.is_empty() {
            return;
        }
        let target = match &self.preselected_network {
            Some(name) => self.networks.iter_mut().find(|n| n.name.eq_ignore_ascii_case(name)),
            None => self.networks.first_mut(),
        };
        if let Some(network) = target {
            network.endpoints = endpoints;
        }
    }
}
