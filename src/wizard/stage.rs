//! Pipeline Stage Executor.
//!
//! Runs one staged sequence strictly in order. Per action:
//!   1. progress message  → blocking handoff to the event loop
//!   2. cancel handle     → blocking handoff to the event loop
//!   3. decorated run     → stop on the first unrecovered error

use std::sync::Arc;

use tracing::{debug, Span};

use super::action::{decorate, Action};
use super::types::Session;

#[derive(Debug, thiserror::Error)]
pub enum StageError {
    /// Nothing to run. Callers treat this as success.
    #[error("no pipeline")]
    NoPipeline,
    #[error("action `{action}` failed: {source:#}")]
    Failed {
        action: String,
        source: anyhow::Error,
    },
    /// Failure of an action whose own cancel handle had fired.
    #[error("action `{action}` cancelled: {source:#}")]
    Cancelled {
        action: String,
        source: anyhow::Error,
    },
    /// The stage task died without reporting (panic or runtime shutdown).
    #[error("stage aborted: {0}")]
    Aborted(String),
}

impl StageError {
    pub fn is_no_pipeline(&self) -> bool {
        matches!(self, StageError::NoPipeline)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, StageError::Cancelled { .. })
    }
}

/// Folds `NoPipeline` into success.
pub fn proceed(result: Result<(), StageError>) -> Result<(), StageError> {
    match result {
        Err(e) if e.is_no_pipeline() => Ok(()),
        other => other,
    }
}

#[derive(Debug, Clone)]
pub struct StageRunner {
    span: Span,
}

impl StageRunner {
    pub fn new(span: Span) -> Self {
        Self { span }
    }

    pub async fn run_stage(
        &self,
        session: &mut Session,
        actions: &[Arc<dyn Action>],
    ) -> Result<(), StageError> {
        if actions.is_empty() {
            return Err(StageError::NoPipeline);
        }

        for action in actions {
            let message = action.as_progress().map(|p| p.message()).unwrap_or_default();
            if !message.is_empty() && session.progress().hand_off(message).await.is_err() {
                debug!(parent: &self.span, action = action.name(), "progress consumer gone");
            }

            let handle = action.as_cancellable().and_then(|c| c.cancel_handle());
            if let Some(token) = &handle {
                if session.cancels().hand_off(token.clone()).await.is_err() {
                    debug!(parent: &self.span, action = action.name(), "cancel consumer gone");
                }
            }

            decorate(action.clone(), &self.span)
                .run(session)
                .await
                .map_err(|source| {
                    let action = action.name().to_string();
                    match &handle {
                        Some(token) if token.is_cancelled() => StageError::Cancelled { action, source },
                        _ => StageError::Failed { action, source },
                    }
                })?;
        }

        Ok(())
    }
}
