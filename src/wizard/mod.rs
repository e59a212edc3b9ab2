// ─── Capabilities and pipelines ───
pub mod action;
pub mod stage;

// ─── Screens and stack composition ───
pub mod actions;
pub mod branches;
pub mod module;

// ─── Event loop ───
pub mod conduit;
pub mod messages;
pub mod orchestrator;

// ─── Shared state ───
pub mod types;

pub use branches::{BranchFactory, DefaultBranches};
pub use messages::{Event, Notice};
pub use orchestrator::{Orchestrator, WizardError};
pub use types::{Branch, Session, Stage};
