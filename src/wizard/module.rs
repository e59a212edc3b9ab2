//! Modules — wizard screens.
//!
//! A module has lifecycle hooks and may opt into two capabilities:
//! `Skippable` (bypass enter hook and main stage) and `StagedPipeline`
//! (contribute before-enter / main / after-leave-forward actions).

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::debug;

use super::action::{ActionList, Skippable};
use super::messages::Event;
use super::types::{Session, Stage};

/// Background work started by a hook. Its event, if any, is fed back into
/// the event loop.
pub type Task = BoxFuture<'static, Option<Event>>;

pub trait Module: Send {
    fn name(&self) -> &str;

    fn enter(&mut self, _session: &Session) -> Option<Task> {
        None
    }

    fn update(&mut self, _event: &Event) -> Option<Task> {
        None
    }

    /// Best-effort release of whatever the module holds.
    fn cancel(&mut self) {}

    /// Preferred (cols, rows) for the layout collaborator.
    fn size_hint(&self) -> Option<(u16, u16)> {
        None
    }

    fn as_skippable(&self) -> Option<&dyn Skippable> {
        None
    }

    fn as_pipeline(&self) -> Option<&dyn StagedPipeline> {
        None
    }
}

pub trait StagedPipeline {
    fn before_enter_actions(&self) -> Option<ActionList> {
        None
    }

    fn main_actions(&self) -> Option<ActionList> {
        None
    }

    fn after_leave_forward_actions(&self) -> Option<ActionList> {
        None
    }
}

/// Actions a module contributes to `stage`; empty when it has no pipeline.
pub fn stage_actions(module: &dyn Module, stage: Stage) -> ActionList {
    let Some(pipeline) = module.as_pipeline() else {
        return ActionList::new();
    };
    let actions = match stage {
        Stage::BeforeEnter => pipeline.before_enter_actions(),
        Stage::Main => pipeline.main_actions(),
        Stage::AfterLeaveForward => pipeline.after_leave_forward_actions(),
    };
    actions.unwrap_or_default()
}

pub fn module_skipped(module: &dyn Module, session: &Session) -> bool {
    module
        .as_skippable()
        .map(|s| s.skip(session))
        .unwrap_or(false)
}

// ─────────────────────────────────────────────────────────
// Screen — generic module assembled by a builder
// ─────────────────────────────────────────────────────────

type SkipFn = Box<dyn Fn(&Session) -> bool + Send + Sync>;

/// Module whose capabilities are exactly those wired by [`ScreenBuilder`].
pub struct Screen {
    name: String,
    before_enter: Option<ActionList>,
    main: Option<ActionList>,
    after_leave_forward: Option<ActionList>,
    skip_when: Option<SkipFn>,
    emit_on_enter: Option<Event>,
    size: Option<(u16, u16)>,
    inputs: Vec<String>,
}

impl Screen {
    pub fn builder(name: impl Into<String>) -> ScreenBuilder {
        ScreenBuilder {
            screen: Screen {
                name: name.into(),
                before_enter: None,
                main: None,
                after_leave_forward: None,
                skip_when: None,
                emit_on_enter: None,
                size: None,
                inputs: Vec::new(),
            },
        }
    }

    /// Inputs received since the screen was last entered.
    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    fn has_pipeline(&self) -> bool {
        self.before_enter.is_some() || self.main.is_some() || self.after_leave_forward.is_some()
    }
}

impl Module for Screen {
    fn name(&self) -> &str {
        &self.name
    }

    fn enter(&mut self, _session: &Session) -> Option<Task> {
        self.inputs.clear();
        let event = self.emit_on_enter.clone()?;
        Some(async move { Some(event) }.boxed())
    }

    fn update(&mut self, event: &Event) -> Option<Task> {
        match event {
            Event::Resize { cols, rows } => self.size = Some((*cols, *rows)),
            Event::Input(text) => self.inputs.push(text.clone()),
            _ => {}
        }
        None
    }

    fn cancel(&mut self) {
        debug!(screen = %self.name, "cancel");
        self.inputs.clear();
    }

    fn size_hint(&self) -> Option<(u16, u16)> {
        self.size
    }

    fn as_skippable(&self) -> Option<&dyn Skippable> {
        self.skip_when.as_ref().map(|_| self as &dyn Skippable)
    }

    fn as_pipeline(&self) -> Option<&dyn StagedPipeline> {
        self.has_pipeline().then_some(self as &dyn StagedPipeline)
    }
}

impl Skippable for Screen {
    fn skip(&self, session: &Session) -> bool {
        self.skip_when.as_ref().map(|f| f(session)).unwrap_or(false)
    }
}

impl StagedPipeline for Screen {
    fn before_enter_actions(&self) -> Option<ActionList> {
        self.before_enter.clone()
    }

    fn main_actions(&self) -> Option<ActionList> {
        self.main.clone()
    }

    fn after_leave_forward_actions(&self) -> Option<ActionList> {
        self.after_leave_forward.clone()
    }
}

pub struct ScreenBuilder {
    screen: Screen,
}

impl ScreenBuilder {
    pub fn before_enter(mut self, actions: ActionList) -> Self {
        self.screen.before_enter = Some(actions);
        self
    }

    pub fn main(mut self, actions: ActionList) -> Self {
        self.screen.main = Some(actions);
        self
    }

    pub fn after_leave_forward(mut self, actions: ActionList) -> Self {
        self.screen.after_leave_forward = Some(actions);
        self
    }

    pub fn skip_when(mut self, f: impl Fn(&Session) -> bool + Send + Sync + 'static) -> Self {
        self.screen.skip_when = Some(Box::new(f));
        self
    }

    pub fn emit_on_enter(mut self, event: Event) -> Self {
        self.screen.emit_on_enter = Some(event);
        self
    }

    pub fn build(self) -> Screen {
        self.screen
    }

    pub fn boxed(self) -> Box<dyn Module> {
        Box::new(self.screen)
    }
}
