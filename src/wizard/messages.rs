//! Channel message types for the wizard event loop.

use super::stage::StageError;
use super::types::{Branch, Stage};

// ─────────────────────────────────────────────────────────
// Inbound events (outer application → Orchestrator)
// ─────────────────────────────────────────────────────────

/// Events driving the navigation state machine. Anything the orchestrator
/// does not consume itself is forwarded to the current module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Leave the current module forward.
    Next,
    /// Retreat to the previous module.
    Back,
    /// Append a branch to the stack and move into it.
    Fork(Branch),
    /// Drop the most recent fork and return to where it started.
    ForkBack,
    /// Layout change. Forwarded, never touches the stack.
    Resize { cols: u16, rows: u16 },
    /// Cancel whatever the running stage published as cancellable.
    CancelWork,
    /// End the run.
    Quit,
    /// Free-form input for the current module.
    Input(String),
}

impl Event {
    /// Navigation events queue behind a running stage.
    pub fn is_navigation(&self) -> bool {
        matches!(
            self,
            Event::Next | Event::Back | Event::Fork(_) | Event::ForkBack
        )
    }
}

// ─────────────────────────────────────────────────────────
// Outbound notices (Orchestrator → outer application)
// ─────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum Notice {
    /// A module became current.
    Entered {
        module: String,
        cursor: usize,
        depth: usize,
    },
    /// Status line from a running action.
    Progress(String),
    /// The running action can now be cancelled with `Event::CancelWork`.
    Cancellable,
    /// Main stage of the current module finished.
    PipelineDone { module: String },
    /// Navigation halted. The loop keeps running so the user may retry or
    /// go back.
    Failed {
        module: String,
        stage: Stage,
        error: StageError,
    },
    Quit,
}

// ─────────────────────────────────────────────────────────
// Internal completions (background tasks → Orchestrator)
// ─────────────────────────────────────────────────────────

/// What to do once a stage completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Continuation {
    /// Before-enter finished: check skip, run enter hook and main stage.
    Enter,
    /// Main stage finished.
    Done,
    /// After-leave-forward finished: move the cursor to `target`.
    Advance { target: usize },
    /// After-leave-forward finished: append the staged branch and enter it.
    Fork { branch: Branch },
}

#[derive(Debug)]
pub(crate) enum Internal {
    StageFinished {
        stage: Stage,
        then: Continuation,
        outcome: Result<(), StageError>,
    },
    /// Event produced by a module task.
    Task(Event),
}
