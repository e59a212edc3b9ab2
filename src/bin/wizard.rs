//! Headless wizard driver.
//!
//!   stdin lines ──parse──→ Orchestrator ──notices──→ stdout
//!
//! Commands: next, back, fork <branch>, forkback, cancel, resize <cols> <rows>,
//! quit. Any other line is passed to the current screen as input.

use std::env;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use trade_wizard::race::NetProbe;
use trade_wizard::wizard::{Branch, DefaultBranches, Event, Notice, Orchestrator};
use trade_wizard::WizardConfig;

fn parse_command(line: &str) -> Option<Event> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let mut parts = line.split_whitespace();
    let ev = match parts.next()? {
        "next" => Event::Next,
        "back" => Event::Back,
        "forkback" => Event::ForkBack,
        "cancel" => Event::CancelWork,
        "quit" => Event::Quit,
        "fork" => match parts.next().and_then(Branch::parse) {
            Some(b) => Event::Fork(b),
            None => {
                warn!("unknown branch in `{}`", line);
                return None;
            }
        },
        "resize" => {
            let cols = parts.next()?.parse().ok()?;
            let rows = parts.next()?.parse().ok()?;
            Event::Resize { cols, rows }
        }
        _ => Event::Input(line.to_string()),
    };
    Some(ev)
}

fn render(notice: &Notice) -> String {
    match notice {
        Notice::Entered { module, cursor, depth } => {
            format!("▶ {} [{}/{}]", module, cursor + 1, depth)
        }
        Notice::Progress(msg) => format!("… {}", msg),
        Notice::Cancellable => "  (type `cancel` to interrupt)".to_string(),
        Notice::PipelineDone { module } => format!("✓ {} ready", module),
        Notice::Failed { module, stage, error } => {
            format!("✗ {} ({}): {}", module, stage.as_str(), error)
        }
        Notice::Quit => "bye".to_string(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // Keeps the file writer flushing until main returns.
    let _log_guard = match env::var("WIZARD_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "wizard.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        Err(_) => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            None
        }
    };

    let config = WizardConfig::from_env()?;
    info!(
        networks = config.networks.len(),
        tokens = config.tokens.len(),
        probe_timeout_ms = config.probe_timeout_ms,
        "⚙️ Config loaded"
    );

    let probe = Arc::new(NetProbe::new(config.probe_timeout())?);
    let branches = Arc::new(DefaultBranches::new(probe));
    let stack = branches.bootstrap();

    let (event_tx, event_rx) = mpsc::channel(64);
    let (notice_tx, mut notice_rx) = mpsc::unbounded_channel();
    let wizard = Orchestrator::new(config, stack, branches, event_rx, notice_tx)?;
    let handle = tokio::spawn(wizard.run());

    let printer = tokio::spawn(async move {
        while let Some(n) = notice_rx.recv().await {
            println!("{}", render(&n));
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            // A screen may end the run on its own.
            _ = event_tx.closed() => break,
            line = lines.next_line() => match line? {
                Some(line) => line,
                None => break,
            },
        };
        let Some(ev) = parse_command(&line) else {
            continue;
        };
        if event_tx.send(ev).await.is_err() {
            break;
        }
    }
    drop(event_tx);

    handle.await?;
    printer.await?;
    Ok(())
}
