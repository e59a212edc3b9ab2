//! Orchestrator — navigation state machine over the module stack.
//!
//! Owns the stack, the cursor and the session. Stages run on background
//! tasks that hold the session lock for their whole duration; the loop only
//! touches the session between stages and never waits for it. Navigation
//! arriving while a stage runs waits in `pending` and is replayed once the
//! stage reports back.
//!
//!   Next      → after-leave-forward(current) → cursor+1 → enter
//!   Back      → cancel(current) → cursor-1 → enter
//!   Fork(b)   → after-leave-forward(current) → append branch → first appended → enter
//!   ForkBack  → cancel(current) → truncate branch → cursor at fork start → enter
//!   enter     → before-enter → [skip? → Next] → enter hook → main → PipelineDone

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use super::action::ActionList;
use super::branches::BranchFactory;
use super::conduit::{Conduit, Handoff};
use super::messages::{Continuation, Event, Internal, Notice};
use super::module::{module_skipped, stage_actions, Module, Task};
use super::stage::{proceed, StageError, StageRunner};
use super::types::{Branch, Session, Stage};
use crate::WizardConfig;

#[derive(Debug, thiserror::Error)]
pub enum WizardError {
    #[error("wizard needs at least one module")]
    EmptyStack,
}

/// Recorded when a branch is appended so it can be dropped again.
#[derive(Debug, Clone, Copy)]
struct ForkMark {
    appended: usize,
    return_cursor: usize,
}

#[derive(Debug, Default)]
struct Stats {
    events: u64,
    stages: u64,
    failures: u64,
    forks: u64,
    queued: u64,
}

// ─────────────────────────────────────────────────────────
// Actor
// ─────────────────────────────────────────────────────────

pub struct Orchestrator {
    stack: Vec<Box<dyn Module>>,
    cursor: usize,
    forks: Vec<ForkMark>,
    /// Branch built by a Fork, appended once the current module has left.
    staged_fork: Option<Vec<Box<dyn Module>>>,
    session: Arc<Mutex<Session>>,
    runner: StageRunner,
    branches: Arc<dyn BranchFactory>,
    span: Span,

    /// Stage currently holding the session lock.
    in_flight: Option<Stage>,
    pending: VecDeque<Event>,
    /// Most recent handle published by the running stage.
    work_token: Option<CancellationToken>,
    /// Back/ForkBack fired the running stage's handle.
    nav_cancelled: bool,
    stats: Stats,

    events_rx: mpsc::Receiver<Event>,
    notice_tx: mpsc::UnboundedSender<Notice>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    progress_rx: mpsc::Receiver<Handoff<String>>,
    cancel_rx: mpsc::Receiver<Handoff<CancellationToken>>,
}

impl Orchestrator {
    pub fn new(
        config: WizardConfig,
        stack: Vec<Box<dyn Module>>,
        branches: Arc<dyn BranchFactory>,
        events_rx: mpsc::Receiver<Event>,
        notice_tx: mpsc::UnboundedSender<Notice>,
    ) -> Result<Self, WizardError> {
        if stack.is_empty() {
            return Err(WizardError::EmptyStack);
        }
        let (progress, progress_rx) = Conduit::pair();
        let (cancels, cancel_rx) = Conduit::pair();
        let session = Session::new(config, progress, cancels);
        let span = info_span!("wizard", run_id = %session.run_id);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();

        Ok(Self {
            stack,
            cursor: 0,
            forks: Vec::new(),
            staged_fork: None,
            session: Arc::new(Mutex::new(session)),
            runner: StageRunner::new(span.clone()),
            branches,
            span,
            in_flight: None,
            pending: VecDeque::new(),
            work_token: None,
            nav_cancelled: false,
            stats: Stats::default(),
            events_rx,
            notice_tx,
            internal_tx,
            internal_rx,
            progress_rx,
            cancel_rx,
        })
    }

    pub async fn run(self) {
        let span = self.span.clone();
        self.run_loop().instrument(span).await
    }

    async fn run_loop(mut self) {
        info!(depth = self.stack.len(), "🧭 Wizard started");
        self.enter_current();

        loop {
            tokio::select! {
                biased;
                Some(h) = self.progress_rx.recv() => {
                    // Publish before releasing the stage.
                    let _ = self.notice_tx.send(Notice::Progress(h.peek().clone()));
                    h.accept();
                }
                Some(h) = self.cancel_rx.recv() => {
                    self.work_token = Some(h.accept());
                    let _ = self.notice_tx.send(Notice::Cancellable);
                }
                Some(msg) = self.internal_rx.recv() => {
                    if !self.on_internal(msg) {
                        break;
                    }
                }
                ev = self.events_rx.recv() => match ev {
                    Some(ev) => {
                        if !self.on_event(ev) {
                            break;
                        }
                    }
                    None => {
                        info!("🧭 Event source closed");
                        self.cancel_work();
                        break;
                    }
                },
            }
        }

        info!(
            "🧭 Shutdown | events={} stages={} failures={} forks={} queued={} cursor={} depth={}",
            self.stats.events, self.stats.stages, self.stats.failures,
            self.stats.forks, self.stats.queued, self.cursor, self.stack.len(),
        );
    }

    // ═════════════════════════════════════════════════
    // Dispatch
    // ═════════════════════════════════════════════════

    /// Returns `false` once the run is over.
    fn on_event(&mut self, ev: Event) -> bool {
        self.stats.events += 1;

        if ev.is_navigation() && self.in_flight.is_some() {
            if matches!(ev, Event::Back | Event::ForkBack) {
                self.nav_cancelled |= self.cancel_work();
            }
            debug!(?ev, stage = ?self.in_flight, "queued behind running stage");
            self.stats.queued += 1;
            self.pending.push_back(ev);
            return true;
        }

        match ev {
            Event::Next => self.forward(self.cursor + 1),
            Event::Back => self.backward(),
            Event::Fork(branch) => self.fork(branch),
            Event::ForkBack => self.fork_back(),
            Event::CancelWork => {
                if !self.cancel_work() {
                    debug!("nothing to cancel");
                }
            }
            Event::Quit => {
                self.quit();
                return false;
            }
            other => {
                let task = self.stack[self.cursor].update(&other);
                self.spawn_task(task);
            }
        }
        true
    }

    fn on_internal(&mut self, msg: Internal) -> bool {
        match msg {
            Internal::Task(ev) => self.on_event(ev),
            Internal::StageFinished { stage, then, outcome } => {
                self.in_flight = None;
                self.work_token = None;
                let nav_cancelled = std::mem::take(&mut self.nav_cancelled);

                match proceed(outcome) {
                    Ok(()) => self.continue_after(then),
                    // Only the action whose own handle fired counts as cancelled.
                    Err(error) if nav_cancelled && error.is_cancelled() => {
                        self.staged_fork = None;
                        info!(stage = stage.as_str(), "stage cancelled by navigation: {}", error);
                    }
                    Err(error) => self.fail(stage, error),
                }

                self.drain_pending();
                true
            }
        }
    }

    fn drain_pending(&mut self) {
        while self.in_flight.is_none() {
            let Some(ev) = self.pending.pop_front() else {
                break;
            };
            self.on_event(ev);
        }
    }

    fn fail(&mut self, stage: Stage, error: StageError) {
        self.staged_fork = None;
        let module = self.current().name().to_string();
        error!(%module, stage = stage.as_str(), "❌ {}", error);
        self.stats.failures += 1;
        let _ = self.notice_tx.send(Notice::Failed { module, stage, error });
    }

    // ═════════════════════════════════════════════════
    // Transitions
    // ═════════════════════════════════════════════════

    fn forward(&mut self, target: usize) {
        if target >= self.stack.len() {
            debug!(cursor = self.cursor, "no further module");
            return;
        }
        self.leave_forward(Continuation::Advance { target });
    }

    fn leave_forward(&mut self, then: Continuation) {
        let actions = stage_actions(self.current(), Stage::AfterLeaveForward);
        self.spawn_stage(Stage::AfterLeaveForward, then, actions);
    }

    fn backward(&mut self) {
        if self.cursor == 0 {
            debug!("already at the first module");
            return;
        }
        self.current_mut().cancel();
        self.cursor -= 1;
        self.enter_current();
    }

    /// The branch is only appended after the current module left cleanly.
    fn fork(&mut self, branch: Branch) {
        let modules = self.branches.build(branch);
        if modules.is_empty() {
            warn!(branch = branch.as_str(), "branch has no modules");
            return;
        }
        self.staged_fork = Some(modules);
        self.leave_forward(Continuation::Fork { branch });
    }

    fn append_fork(&mut self, branch: Branch) {
        let Some(modules) = self.staged_fork.take() else {
            warn!(branch = branch.as_str(), "no staged branch");
            return;
        };
        let old_len = self.stack.len();
        self.forks.push(ForkMark {
            appended: modules.len(),
            return_cursor: self.cursor,
        });
        self.stack.extend(modules);
        self.stats.forks += 1;
        info!(branch = branch.as_str(), appended = self.stack.len() - old_len, "🧭 Fork");
        self.cursor = old_len;
        self.enter_current();
    }

    fn fork_back(&mut self) {
        let Some(mark) = self.forks.pop() else {
            debug!("no fork to return from");
            return;
        };
        let keep = self.stack.len().saturating_sub(mark.appended).max(1);
        info!(dropped = self.stack.len() - keep, "🧭 Fork back");

        if self.cursor < keep {
            // Already retreated out of the branch.
            self.stack.truncate(keep);
            return;
        }
        self.current_mut().cancel();
        self.stack.truncate(keep);
        self.cursor = mark.return_cursor.min(keep - 1);
        self.enter_current();
    }

    fn quit(&mut self) {
        info!("🧭 Quit");
        self.cancel_work();
        self.current_mut().cancel();
        let _ = self.notice_tx.send(Notice::Quit);
    }

    /// Cancels the handle of the running action, if it published one.
    fn cancel_work(&mut self) -> bool {
        match self.work_token.take() {
            Some(token) => {
                info!("cancelling in-flight work");
                token.cancel();
                true
            }
            None => false,
        }
    }

    // ═════════════════════════════════════════════════
    // Enter sequence
    // ═════════════════════════════════════════════════

    fn enter_current(&mut self) {
        let module = self.current().name().to_string();
        info!(%module, cursor = self.cursor, depth = self.stack.len(), "🧭 Enter");
        let _ = self.notice_tx.send(Notice::Entered {
            module,
            cursor: self.cursor,
            depth: self.stack.len(),
        });
        let actions = stage_actions(self.current(), Stage::BeforeEnter);
        self.spawn_stage(Stage::BeforeEnter, Continuation::Enter, actions);
    }

    fn continue_after(&mut self, then: Continuation) {
        match then {
            Continuation::Enter => {
                let guard = match self.session_guard() {
                    Ok(guard) => guard,
                    Err(e) => return self.fail(Stage::BeforeEnter, e),
                };
                let idx = self.cursor;
                if module_skipped(self.stack[idx].as_ref(), &guard) {
                    drop(guard);
                    let module = self.stack[idx].name().to_string();
                    info!(%module, "module skipped");
                    if idx + 1 < self.stack.len() {
                        self.forward(idx + 1);
                    } else {
                        // Nowhere to move on to.
                        let _ = self.notice_tx.send(Notice::PipelineDone { module });
                    }
                    return;
                }
                let task = self.stack[idx].enter(&guard);
                drop(guard);
                self.spawn_task(task);

                let actions = stage_actions(self.current(), Stage::Main);
                self.spawn_stage(Stage::Main, Continuation::Done, actions);
            }
            Continuation::Done => {
                let module = self.current().name().to_string();
                debug!(%module, "pipeline done");
                let _ = self.notice_tx.send(Notice::PipelineDone { module });
            }
            Continuation::Advance { target } => {
                if target >= self.stack.len() {
                    return;
                }
                self.cursor = target;
                self.enter_current();
            }
            Continuation::Fork { branch } => self.append_fork(branch),
        }
    }

    // ═════════════════════════════════════════════════
    // Background work
    // ═════════════════════════════════════════════════

    /// Stage tasks release the lock before their completion is delivered,
    /// so between stages it is always free. Contention is reported, never
    /// waited on.
    fn session_guard(&self) -> Result<OwnedMutexGuard<Session>, StageError> {
        self.session
            .clone()
            .try_lock_owned()
            .map_err(|_| StageError::Aborted("session busy".into()))
    }

    /// Takes the session lock, then runs `actions` on a background task.
    /// The completion message is sent even if the task panics.
    fn spawn_stage(&mut self, stage: Stage, then: Continuation, actions: ActionList) {
        self.in_flight = Some(stage);
        self.stats.stages += 1;

        let done = self.internal_tx.clone();
        let mut guard = match self.session_guard() {
            Ok(guard) => guard,
            Err(e) => {
                let _ = done.send(Internal::StageFinished { stage, then, outcome: Err(e) });
                return;
            }
        };
        let runner = self.runner.clone();
        let work = tokio::spawn(
            async move { runner.run_stage(&mut guard, &actions).await }
                .instrument(self.span.clone()),
        );

        tokio::spawn(async move {
            let outcome = match work.await {
                Ok(res) => res,
                Err(e) => Err(StageError::Aborted(e.to_string())),
            };
            let _ = done.send(Internal::StageFinished { stage, then, outcome });
        });
    }

    fn spawn_task(&self, task: Option<Task>) {
        let Some(task) = task else {
            return;
        };
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            if let Some(ev) = task.await {
                let _ = tx.send(Internal::Task(ev));
            }
        });
    }

    fn current(&self) -> &dyn Module {
        self.stack[self.cursor].as_ref()
    }

    fn current_mut(&mut self) -> &mut dyn Module {
        self.stack[self.cursor].as_mut()
    }
}

// ─────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wizard::action::{Action, Cancellable, ReportsProgress};
    use crate::wizard::module::Screen;
    use crate::wizard::stage::tests::{Log, Outcome, Scripted};
    use async_trait::async_trait;
    use parking_lot::Mutex as SyncMutex;
    use std::time::Duration;
    use tokio::task::JoinHandle;

    struct TestBranches(Log);

    impl BranchFactory for TestBranches {
        fn build(&self, branch: Branch) -> Vec<Box<dyn Module>> {
            match branch {
                Branch::TradeSetup => vec![
                    Screen::builder("t1")
                        .before_enter(vec![Scripted::new("t1-be", &self.0).arc()])
                        .boxed(),
                    Screen::builder("t2").boxed(),
                ],
                Branch::Quit => vec![Screen::builder("quit").emit_on_enter(Event::Quit).boxed()],
                _ => Vec::new(),
            }
        }
    }

    /// Waits on its own token; publishes it through `Cancellable`.
    struct WaitForCancel {
        log: Log,
        token: SyncMutex<CancellationToken>,
    }

    impl ReportsProgress for WaitForCancel {
        fn message(&self) -> String {
            "waiting".into()
        }
    }

    impl Cancellable for WaitForCancel {
        fn cancel_handle(&self) -> Option<CancellationToken> {
            let t = CancellationToken::new();
            *self.token.lock() = t.clone();
            Some(t)
        }
    }

    #[async_trait]
    impl Action for WaitForCancel {
        fn name(&self) -> &str {
            "wait"
        }
        async fn run(&self, _: &mut Session) -> anyhow::Result<()> {
            let token = self.token.lock().clone();
            token.cancelled().await;
            self.log.lock().push("cancelled:wait".into());
            anyhow::bail!("interrupted")
        }
        fn as_progress(&self) -> Option<&dyn ReportsProgress> {
            Some(self)
        }
        fn as_cancellable(&self) -> Option<&dyn Cancellable> {
            Some(self)
        }
    }

    fn wait_for_cancel(log: &Log) -> Arc<dyn Action> {
        Arc::new(WaitForCancel {
            log: log.clone(),
            token: SyncMutex::new(CancellationToken::new()),
        })
    }

    fn log() -> Log {
        Arc::new(SyncMutex::new(Vec::new()))
    }

    fn start(
        stack: Vec<Box<dyn Module>>,
        log: &Log,
    ) -> (mpsc::Sender<Event>, mpsc::UnboundedReceiver<Notice>, JoinHandle<()>) {
        let (ev_tx, ev_rx) = mpsc::channel(16);
        let (n_tx, n_rx) = mpsc::unbounded_channel();
        let o = Orchestrator::new(
            WizardConfig::default(),
            stack,
            Arc::new(TestBranches(log.clone())),
            ev_rx,
            n_tx,
        )
        .unwrap();
        (ev_tx, n_rx, tokio::spawn(o.run()))
    }

    /// Collects notices up to and including the first one matching `hit`.
    async fn until(
        rx: &mut mpsc::UnboundedReceiver<Notice>,
        hit: impl Fn(&Notice) -> bool,
    ) -> Vec<Notice> {
        let mut seen = Vec::new();
        loop {
            let n = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("notice timeout")
                .expect("notice channel closed");
            let done = hit(&n);
            seen.push(n);
            if done {
                return seen;
            }
        }
    }

    fn entered(name: &'static str) -> impl Fn(&Notice) -> bool {
        move |n| matches!(n, Notice::Entered { module, .. } if module == name)
    }

    fn done(name: &'static str) -> impl Fn(&Notice) -> bool {
        move |n| matches!(n, Notice::PipelineDone { module } if module == name)
    }

    fn position(notices: &[Notice]) -> Option<(usize, usize)> {
        notices.iter().rev().find_map(|n| match n {
            Notice::Entered { cursor, depth, .. } => Some((*cursor, *depth)),
            _ => None,
        })
    }

    /// Nothing arrives within a short window.
    async fn quiet(rx: &mut mpsc::UnboundedReceiver<Notice>) -> bool {
        tokio::time::timeout(Duration::from_millis(80), rx.recv()).await.is_err()
    }

    fn three(log: &Log) -> Vec<Box<dyn Module>> {
        vec![
            Screen::builder("a")
                .before_enter(vec![Scripted::new("a-be", log).arc()])
                .main(vec![Scripted::new("a-main", log).arc()])
                .after_leave_forward(vec![Scripted::new("a-leave", log).arc()])
                .boxed(),
            Screen::builder("b")
                .before_enter(vec![Scripted::new("b-be", log).arc()])
                .main(vec![Scripted::new("b-main", log).arc()])
                .boxed(),
            Screen::builder("c").boxed(),
        ]
    }

    #[test]
    fn test_empty_stack_rejected() {
        let (_tx, rx) = mpsc::channel(1);
        let (ntx, _nrx) = mpsc::unbounded_channel();
        let res = Orchestrator::new(
            WizardConfig::default(),
            Vec::new(),
            Arc::new(TestBranches(log())),
            rx,
            ntx,
        );
        assert!(matches!(res, Err(WizardError::EmptyStack)));
    }

    #[tokio::test]
    async fn test_initial_enter_runs_before_enter_then_main() {
        let l = log();
        let (_tx, mut rx, _h) = start(three(&l), &l);
        let seen = until(&mut rx, done("a")).await;
        assert_eq!(position(&seen), Some((0, 3)));
        assert_eq!(*l.lock(), vec!["run:a-be", "run:a-main"]);
    }

    #[tokio::test]
    async fn test_next_advances_and_runs_before_enter() {
        let l = log();
        let (tx, mut rx, _h) = start(three(&l), &l);
        until(&mut rx, done("a")).await;

        tx.send(Event::Next).await.unwrap();
        let seen = until(&mut rx, done("b")).await;
        assert_eq!(position(&seen), Some((1, 3)));
        assert_eq!(
            *l.lock(),
            vec!["run:a-be", "run:a-main", "run:a-leave", "run:b-be", "run:b-main"]
        );
    }

    #[tokio::test]
    async fn test_back_at_bottom_and_next_at_top_are_noops() {
        let l = log();
        let (tx, mut rx, _h) = start(vec![Screen::builder("only").boxed()], &l);
        until(&mut rx, done("only")).await;

        tx.send(Event::Back).await.unwrap();
        tx.send(Event::Back).await.unwrap();
        tx.send(Event::Next).await.unwrap();
        tx.send(Event::Next).await.unwrap();
        assert!(quiet(&mut rx).await);
    }

    #[tokio::test]
    async fn test_back_cancels_module_and_reenters_previous() {
        let l = log();
        let (tx, mut rx, _h) = start(three(&l), &l);
        until(&mut rx, done("a")).await;
        tx.send(Event::Next).await.unwrap();
        until(&mut rx, done("b")).await;

        tx.send(Event::Back).await.unwrap();
        let seen = until(&mut rx, done("a")).await;
        assert_eq!(position(&seen), Some((0, 3)));
        // before-enter replays on re-entry
        assert_eq!(l.lock().iter().filter(|s| *s == "run:a-be").count(), 2);
    }

    #[tokio::test]
    async fn test_fork_then_fork_back_restores_stack() {
        let l = log();
        let (tx, mut rx, _h) = start(three(&l), &l);
        until(&mut rx, done("a")).await;

        tx.send(Event::Fork(Branch::TradeSetup)).await.unwrap();
        let seen = until(&mut rx, done("t1")).await;
        assert_eq!(position(&seen), Some((3, 5)));
        assert!(l.lock().contains(&"run:t1-be".to_string()));

        tx.send(Event::ForkBack).await.unwrap();
        let seen = until(&mut rx, done("a")).await;
        assert_eq!(position(&seen), Some((0, 3)));
    }

    #[tokio::test]
    async fn test_fork_back_after_deeper_navigation() {
        let l = log();
        let (tx, mut rx, _h) = start(three(&l), &l);
        until(&mut rx, done("a")).await;

        tx.send(Event::Fork(Branch::TradeSetup)).await.unwrap();
        until(&mut rx, done("t1")).await;
        tx.send(Event::Next).await.unwrap();
        let seen = until(&mut rx, done("t2")).await;
        assert_eq!(position(&seen), Some((4, 5)));

        tx.send(Event::ForkBack).await.unwrap();
        let seen = until(&mut rx, done("a")).await;
        assert_eq!(position(&seen), Some((0, 3)));

        // no fork left
        tx.send(Event::ForkBack).await.unwrap();
        assert!(quiet(&mut rx).await);
    }

    #[tokio::test]
    async fn test_empty_branch_is_noop() {
        let l = log();
        let (tx, mut rx, _h) = start(three(&l), &l);
        until(&mut rx, done("a")).await;
        tx.send(Event::Fork(Branch::Settings)).await.unwrap();
        assert!(quiet(&mut rx).await);
        assert!(!l.lock().contains(&"run:a-leave".to_string()));
    }

    #[tokio::test]
    async fn test_skipped_module_moves_forward() {
        let l = log();
        let stack = vec![
            Screen::builder("a").boxed(),
            Screen::builder("b")
                .before_enter(vec![Scripted::new("b-be", &l).arc()])
                .main(vec![Scripted::new("b-main", &l).arc()])
                .skip_when(|_| true)
                .boxed(),
            Screen::builder("c").boxed(),
        ];
        let (tx, mut rx, _h) = start(stack, &l);
        until(&mut rx, done("a")).await;

        tx.send(Event::Next).await.unwrap();
        let seen = until(&mut rx, done("c")).await;
        assert!(seen.iter().any(|n| entered("b")(n)));
        assert!(!seen.iter().any(|n| done("b")(n)));
        // before-enter still runs, main does not
        assert_eq!(*l.lock(), vec!["run:b-be"]);
    }

    #[tokio::test]
    async fn test_stage_failure_halts_and_recovers() {
        let l = log();
        let stack = vec![
            Screen::builder("a")
                .after_leave_forward(vec![Scripted::new("a-leave", &l).outcome(Outcome::Fail).arc()])
                .boxed(),
            Screen::builder("b").boxed(),
        ];
        let (tx, mut rx, _h) = start(stack, &l);
        until(&mut rx, done("a")).await;

        for _ in 0..2 {
            tx.send(Event::Next).await.unwrap();
            let seen = until(&mut rx, |n| matches!(n, Notice::Failed { .. })).await;
            match seen.last() {
                Some(Notice::Failed { module, stage, error }) => {
                    assert_eq!(module, "a");
                    assert_eq!(*stage, Stage::AfterLeaveForward);
                    assert!(matches!(error, StageError::Failed { action, .. } if action == "a-leave"));
                }
                other => panic!("unexpected {:?}", other),
            }
            assert!(!seen.iter().any(|n| entered("b")(n)));
        }
        assert_eq!(l.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_panicking_stage_releases_lock() {
        let l = log();
        let stack = vec![
            Screen::builder("a")
                .main(vec![Scripted::new("boom", &l).outcome(Outcome::Panic).arc()])
                .boxed(),
            Screen::builder("b").boxed(),
        ];
        let (tx, mut rx, _h) = start(stack, &l);
        let seen = until(&mut rx, |n| matches!(n, Notice::Failed { .. })).await;
        assert!(matches!(
            seen.last(),
            Some(Notice::Failed { error: StageError::Aborted(_), .. })
        ));

        tx.send(Event::Next).await.unwrap();
        let seen = until(&mut rx, done("b")).await;
        assert_eq!(position(&seen), Some((1, 2)));
    }

    #[tokio::test]
    async fn test_navigation_queues_behind_running_stage() {
        let l = log();
        let stack = vec![
            Screen::builder("a")
                .main(vec![Scripted::new("slow", &l).delay(100).arc()])
                .boxed(),
            Screen::builder("b").boxed(),
        ];
        let (tx, mut rx, _h) = start(stack, &l);
        until(&mut rx, entered("a")).await;
        tx.send(Event::Next).await.unwrap();

        let seen = until(&mut rx, entered("b")).await;
        let done_at = seen.iter().position(|n| done("a")(n));
        let entered_at = seen.iter().position(|n| entered("b")(n));
        assert!(done_at.is_some() && done_at < entered_at);
    }

    #[tokio::test]
    async fn test_progress_published_before_done() {
        let l = log();
        let stack = vec![Screen::builder("a")
            .main(vec![Scripted::new("x", &l).with_message("crunching").arc()])
            .boxed()];
        let (_tx, mut rx, _h) = start(stack, &l);
        let seen = until(&mut rx, done("a")).await;
        let progress: Vec<_> = seen
            .iter()
            .filter_map(|n| match n {
                Notice::Progress(m) => Some(m.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(progress, vec!["crunching"]);
    }

    #[tokio::test]
    async fn test_cancel_work_interrupts_action() {
        let l = log();
        let stack = vec![Screen::builder("a").main(vec![wait_for_cancel(&l)]).boxed()];
        let (tx, mut rx, _h) = start(stack, &l);
        until(&mut rx, |n| matches!(n, Notice::Cancellable)).await;

        tx.send(Event::CancelWork).await.unwrap();
        let seen = until(&mut rx, |n| matches!(n, Notice::Failed { .. })).await;
        assert!(matches!(
            seen.last(),
            Some(Notice::Failed { stage: Stage::Main, error: StageError::Cancelled { .. }, .. })
        ));
        assert_eq!(*l.lock(), vec!["cancelled:wait"]);
    }

    #[tokio::test]
    async fn test_back_during_stage_cancels_quietly() {
        let l = log();
        let stack = vec![
            Screen::builder("a").boxed(),
            Screen::builder("b").main(vec![wait_for_cancel(&l)]).boxed(),
        ];
        let (tx, mut rx, _h) = start(stack, &l);
        until(&mut rx, done("a")).await;
        tx.send(Event::Next).await.unwrap();
        until(&mut rx, |n| matches!(n, Notice::Cancellable)).await;

        tx.send(Event::Back).await.unwrap();
        let seen = until(&mut rx, done("a")).await;
        assert!(!seen.iter().any(|n| matches!(n, Notice::Failed { .. })));
        assert_eq!(position(&seen), Some((0, 2)));
    }

    #[tokio::test]
    async fn test_stale_handle_does_not_hide_later_failure() {
        let l = log();
        let mut quick = Scripted::new("quick", &l);
        quick.token = Some(CancellationToken::new());
        let stack = vec![
            Screen::builder("a").boxed(),
            Screen::builder("b")
                .main(vec![
                    quick.arc(),
                    Scripted::new("real-fail", &l).outcome(Outcome::Fail).delay(200).arc(),
                ])
                .boxed(),
        ];
        let (tx, mut rx, _h) = start(stack, &l);
        until(&mut rx, done("a")).await;
        tx.send(Event::Next).await.unwrap();
        until(&mut rx, |n| matches!(n, Notice::Cancellable)).await;

        // `quick` is already done; `real-fail` fails on its own
        tx.send(Event::Back).await.unwrap();
        let seen = until(&mut rx, |n| matches!(n, Notice::Failed { .. })).await;
        assert!(matches!(
            seen.last(),
            Some(Notice::Failed { error: StageError::Failed { action, .. }, .. }) if action == "real-fail"
        ));

        // the queued Back still runs
        let seen = until(&mut rx, done("a")).await;
        assert_eq!(position(&seen), Some((0, 2)));
    }

    /// Fails its first `n` runs.
    struct FailTimes(std::sync::atomic::AtomicUsize);

    #[async_trait]
    impl Action for FailTimes {
        fn name(&self) -> &str {
            "flaky-leave"
        }
        async fn run(&self, _: &mut Session) -> anyhow::Result<()> {
            use std::sync::atomic::Ordering;
            if self.0.load(Ordering::SeqCst) > 0 {
                self.0.fetch_sub(1, Ordering::SeqCst);
                anyhow::bail!("not yet");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failed_fork_leaves_stack_untouched() {
        let l = log();
        let flaky: Arc<dyn Action> = Arc::new(FailTimes(2.into()));
        let stack = vec![Screen::builder("a").after_leave_forward(vec![flaky]).boxed()];
        let (tx, mut rx, _h) = start(stack, &l);
        until(&mut rx, done("a")).await;

        for _ in 0..2 {
            tx.send(Event::Fork(Branch::TradeSetup)).await.unwrap();
            let seen = until(&mut rx, |n| matches!(n, Notice::Failed { .. })).await;
            assert!(!seen.iter().any(|n| matches!(n, Notice::Entered { .. })));
        }

        tx.send(Event::Fork(Branch::TradeSetup)).await.unwrap();
        let seen = until(&mut rx, done("t1")).await;
        assert_eq!(position(&seen), Some((1, 3)));

        tx.send(Event::Back).await.unwrap();
        let seen = until(&mut rx, entered("a")).await;
        assert_eq!(position(&seen), Some((0, 3)));

        // one mark, one branch
        tx.send(Event::Next).await.unwrap();
        until(&mut rx, done("t1")).await;
        tx.send(Event::ForkBack).await.unwrap();
        let seen = until(&mut rx, entered("a")).await;
        assert_eq!(position(&seen), Some((0, 1)));
    }

    #[tokio::test]
    async fn test_skipped_last_module_reports_done() {
        let l = log();
        let stack = vec![
            Screen::builder("a").boxed(),
            Screen::builder("b").skip_when(|_| true).boxed(),
        ];
        let (tx, mut rx, _h) = start(stack, &l);
        until(&mut rx, done("a")).await;

        tx.send(Event::Next).await.unwrap();
        let seen = until(&mut rx, done("b")).await;
        assert_eq!(position(&seen), Some((1, 2)));
    }

    #[tokio::test]
    async fn test_busy_session_reported_not_awaited() {
        let (_tx, rx) = mpsc::channel(1);
        let (ntx, _nrx) = mpsc::unbounded_channel();
        let mut o = Orchestrator::new(
            WizardConfig::default(),
            vec![Screen::builder("a").boxed()],
            Arc::new(TestBranches(log())),
            rx,
            ntx,
        )
        .unwrap();
        let _held = o.session.clone().try_lock_owned().unwrap();

        o.spawn_stage(Stage::Main, Continuation::Done, ActionList::new());
        match o.internal_rx.try_recv() {
            Ok(Internal::StageFinished { outcome: Err(StageError::Aborted(_)), .. }) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unrecognized_events_reach_module_only() {
        struct Recorder(Log);
        impl Module for Recorder {
            fn name(&self) -> &str {
                "rec"
            }
            fn update(&mut self, event: &Event) -> Option<Task> {
                self.0.lock().push(format!("{:?}", event));
                None
            }
        }

        let l = log();
        let (tx, mut rx, _h) = start(vec![Box::new(Recorder(l.clone()))], &l);
        until(&mut rx, done("rec")).await;

        tx.send(Event::Resize { cols: 120, rows: 40 }).await.unwrap();
        tx.send(Event::Input("y".into())).await.unwrap();
        assert!(quiet(&mut rx).await);
        assert_eq!(
            *l.lock(),
            vec!["Resize { cols: 120, rows: 40 }", "Input(\"y\")"]
        );
    }

    #[tokio::test]
    async fn test_quit_branch_ends_run() {
        let l = log();
        let (tx, mut rx, h) = start(three(&l), &l);
        until(&mut rx, done("a")).await;

        tx.send(Event::Fork(Branch::Quit)).await.unwrap();
        until(&mut rx, |n| matches!(n, Notice::Quit)).await;
        assert!(tokio::time::timeout(Duration::from_secs(1), h).await.is_ok());
    }

    #[tokio::test]
    async fn test_closing_event_source_stops_loop() {
        let l = log();
        let (tx, mut rx, h) = start(three(&l), &l);
        until(&mut rx, done("a")).await;
        drop(tx);
        assert!(tokio::time::timeout(Duration::from_secs(1), h).await.is_ok());
    }
}
