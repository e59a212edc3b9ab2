//! Latency race — probe several endpoints at once, keep the fastest.
//!
//! Workers report into a queue sized to the number of endpoints, so a
//! worker never blocks on a race that has already returned. Failed probes
//! report `None` and only count down.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, Instrument, Span};
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatencySample {
    pub endpoint: String,
    pub latency: Duration,
}

impl LatencySample {
    pub fn latency_millis(&self) -> u128 {
        self.latency.as_millis()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RaceError {
    #[error("no endpoint reachable")]
    Exhausted,
    #[error("endpoint race cancelled")]
    Cancelled,
}

#[async_trait]
pub trait Probe: Send + Sync + 'static {
    /// Connection latency of `endpoint`. Any error disqualifies it.
    async fn measure(&self, endpoint: &str) -> Result<Duration>;
}

pub async fn race_endpoints(
    probe: Arc<dyn Probe>,
    endpoints: &[String],
    cancel: &CancellationToken,
) -> std::result::Result<LatencySample, RaceError> {
    let (tx, mut rx) = mpsc::channel::<Option<LatencySample>>(endpoints.len().max(1));

    for endpoint in endpoints {
        let probe = probe.clone();
        let tx = tx.clone();
        let endpoint = endpoint.clone();
        tokio::spawn(async move {
            let sample = match probe.measure(&endpoint).await {
                Ok(latency) => Some(LatencySample { endpoint, latency }),
                Err(e) => {
                    debug!(%endpoint, "probe failed: {:#}", e);
                    None
                }
            };
            // Receiver is gone once the race returned early.
            let _ = tx.send(sample).await;
        }
        .instrument(Span::current()));
    }
    drop(tx);

    let mut remaining = endpoints.len();
    let mut best: Option<LatencySample> = None;

    while remaining > 0 {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!(remaining, "endpoint race cancelled");
                return Err(RaceError::Cancelled);
            }
            msg = rx.recv() => match msg {
                Some(sample) => {
                    remaining -= 1;
                    if let Some(sample) = sample {
                        debug!(endpoint = %sample.endpoint, ms = sample.latency_millis(), "probe sample");
                        if best.as_ref().map_or(true, |b| sample.latency < b.latency) {
                            best = Some(sample);
                        }
                    }
                }
                // Every worker is gone (a probe panicked).
                None => break,
            }
        }
    }

    match best {
        Some(winner) => {
            info!(endpoint = %winner.endpoint, ms = winner.latency_millis(), "endpoint race won");
            Ok(winner)
        }
        None => Err(RaceError::Exhausted),
    }
}

// ─────────────────────────────────────────────────────────
// Network probe
// ─────────────────────────────────────────────────────────

/// `http(s)`: timed HEAD (connect + TLS + first response line).
/// `ws(s)`: timed client handshake (connect + TLS + upgrade).
#[derive(Debug, Clone)]
pub struct NetProbe {
    client: reqwest::Client,
    timeout: Duration,
}

impl NetProbe {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build probe HTTP client")?;
        Ok(Self { client, timeout })
    }

    async fn measure_http(&self, url: Url) -> Result<Duration> {
        let started = Instant::now();
        let resp = self.client.head(url).send().await?;
        let elapsed = started.elapsed();
        // Any status proves the endpoint answered; RPC nodes often refuse HEAD.
        debug!(status = %resp.status(), "http probe answered");
        Ok(elapsed)
    }

    async fn measure_ws(&self, url: Url) -> Result<Duration> {
        let started = Instant::now();
        let (mut ws, _) = tokio::time::timeout(self.timeout, connect_async(url.as_str()))
            .await
            .context("WS handshake timeout")?
            .context("WS connect error")?;
        let elapsed = started.elapsed();
        let _ = ws.close(None).await;
        Ok(elapsed)
    }
}

#[async_trait]
impl Probe for NetProbe {
    async fn measure(&self, endpoint: &str) -> Result<Duration> {
        let url = Url::parse(endpoint).with_context(|| format!("Invalid endpoint: {}", endpoint))?;
        match url.scheme() {
            "http" | "https" => self.measure_http(url).await,
            "ws" | "wss" => self.measure_ws(url).await,
            other => bail!("Unsupported endpoint scheme: {}", other),
        }
    }
}
