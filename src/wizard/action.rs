//! Actions — named, fallible units of work run against the session.
//!
//! Optional behaviour is opted into through capability probes
//! (`as_skippable`, `as_progress`, `as_cancellable`). An action that does
//! not override a probe simply lacks that behaviour.
//!
//! Decorators wrap an action into another action:
//!   AbsorbSkipped( Logged( SkipGuard( action ) ) )

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Span};

use super::types::Session;

pub type ActionList = Vec<Arc<dyn Action>>;

#[async_trait]
pub trait Action: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, session: &mut Session) -> anyhow::Result<()>;

    fn as_skippable(&self) -> Option<&dyn Skippable> {
        None
    }

    fn as_progress(&self) -> Option<&dyn ReportsProgress> {
        None
    }

    fn as_cancellable(&self) -> Option<&dyn Cancellable> {
        None
    }
}

/// Bypass predicate, evaluated against the session right before running.
/// Also used by modules.
pub trait Skippable {
    fn skip(&self, session: &Session) -> bool;
}

/// Status line shown before the action runs. Empty means nothing to show.
pub trait ReportsProgress {
    fn message(&self) -> String;
}

/// Hands out a token the UI may cancel while the action runs.
pub trait Cancellable {
    fn cancel_handle(&self) -> Option<CancellationToken>;
}

/// The one recoverable error class: the stage logs it and moves on.
#[derive(Debug, Clone, thiserror::Error)]
#[error("pipe skipped: {reason}")]
pub struct PipeSkipped {
    pub reason: String,
}

impl PipeSkipped {
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }

    pub fn is(err: &anyhow::Error) -> bool {
        err.downcast_ref::<PipeSkipped>().is_some()
    }
}

// ─────────────────────────────────────────────────────────
// Decorators
// ─────────────────────────────────────────────────────────

/// Applies the inner action's `Skippable` probe.
pub struct SkipGuard {
    inner: Arc<dyn Action>,
    span: Span,
}

impl SkipGuard {
    pub fn wrap(inner: Arc<dyn Action>, span: Span) -> Arc<dyn Action> {
        Arc::new(Self { inner, span })
    }
}

#[async_trait]
impl Action for SkipGuard {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn run(&self, session: &mut Session) -> anyhow::Result<()> {
        let skip = self
            .inner
            .as_skippable()
            .map(|s| s.skip(session))
            .unwrap_or(false);
        if skip {
            info!(parent: &self.span, action = self.inner.name(), "skipped: {}", self.inner.name());
            return Ok(());
        }
        self.inner.run(session).await
    }
}

/// Emits the start event, then delegates.
pub struct Logged {
    inner: Arc<dyn Action>,
    span: Span,
}

impl Logged {
    pub fn wrap(inner: Arc<dyn Action>, span: Span) -> Arc<dyn Action> {
        Arc::new(Self { inner, span })
    }
}

#[async_trait]
impl Action for Logged {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn run(&self, session: &mut Session) -> anyhow::Result<()> {
        info!(parent: &self.span, action = self.inner.name(), "starting: {}", self.inner.name());
        self.inner.run(session).await
    }
}

/// Swallows [`PipeSkipped`], propagates everything else untouched.
pub struct AbsorbSkipped {
    inner: Arc<dyn Action>,
    span: Span,
}

impl AbsorbSkipped {
    pub fn wrap(inner: Arc<dyn Action>, span: Span) -> Arc<dyn Action> {
        Arc::new(Self { inner, span })
    }
}

#[async_trait]
impl Action for AbsorbSkipped {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn run(&self, session: &mut Session) -> anyhow::Result<()> {
        match self.inner.run(session).await {
            Err(e) if PipeSkipped::is(&e) => {
                warn!(parent: &self.span, action = self.inner.name(), "{}", e);
                Ok(())
            }
            other => other,
        }
    }
}

/// Full decorator chain used by the stage executor.
pub fn decorate(action: Arc<dyn Action>, span: &Span) -> Arc<dyn Action> {
    let guarded = SkipGuard::wrap(action, span.clone());
    let logged = Logged::wrap(guarded, span.clone());
    AbsorbSkipped::wrap(logged, span.clone())
}
