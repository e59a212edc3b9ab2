//! Stack composition: the bootstrap sequence and every forkable branch.

use std::sync::Arc;

use super::action::ActionList;
use super::actions::*;
use super::messages::Event;
use super::module::{Module, Screen};
use super::types::Branch;
use crate::race::Probe;

macro_rules! actions {
    ($($a:expr),* $(,)?) => {
        vec![$(::std::sync::Arc::new($a) as ::std::sync::Arc<dyn $crate::wizard::action::Action>),*]
    };
}

pub trait BranchFactory: Send + Sync {
    /// Modules appended to the stack when `branch` is forked.
    fn build(&self, branch: Branch) -> Vec<Box<dyn Module>>;
}

pub struct DefaultBranches {
    probe: Arc<dyn Probe>,
}

impl DefaultBranches {
    pub fn new(probe: Arc<dyn Probe>) -> Self {
        Self { probe }
    }

    /// network → endpoint → wallet
    pub fn bootstrap(&self) -> Vec<Box<dyn Module>> {
        vec![
            Screen::builder("network")
                .main(actions![SelectNetwork])
                .boxed(),
            self.endpoint_screen("endpoint", ActionList::new()),
            Screen::builder("wallet")
                .main(actions![DeriveWalletSecret])
                .boxed(),
        ]
    }

    fn endpoint_screen(&self, name: &str, before_enter: ActionList) -> Box<dyn Module> {
        let builder = Screen::builder(name).main(actions![SelectEndpoint::new(self.probe.clone())]);
        if before_enter.is_empty() {
            builder.skip_when(|s| s.endpoint.is_some()).boxed()
        } else {
            builder.before_enter(before_enter).boxed()
        }
    }
}

impl BranchFactory for DefaultBranches {
    fn build(&self, branch: Branch) -> Vec<Box<dyn Module>> {
        match branch {
            Branch::TradeSetup => vec![
                Screen::builder("tokens").main(actions![SelectTokens]).boxed(),
                Screen::builder("amount")
                    .after_leave_forward(actions![ValidateTrade])
                    .boxed(),
            ],
            Branch::OrderEntry => vec![Screen::builder("order")
                .after_leave_forward(actions![ValidateTrade])
                .boxed()],
            Branch::MarketExecution => vec![Screen::builder("execute")
                .before_enter(actions![CheckReady])
                .boxed()],
            Branch::Settings => vec![Screen::builder("settings").boxed()],
            Branch::SettingsEndpoint => {
                vec![self.endpoint_screen("settings-endpoint", actions![ResetEndpoint])]
            }
            Branch::SettingsWallet => vec![Screen::builder("settings-wallet").boxed()],
            Branch::SettingsWalletNewSecret => vec![Screen::builder("new-secret")
                .before_enter(actions![ForgetWalletSecret])
                .main(actions![DeriveWalletSecret])
                .boxed()],
            Branch::SettingsWalletDerivation => vec![Screen::builder("derivation")
                .main(actions![DeriveWalletSecret])
                .boxed()],
            Branch::Quit => vec![Screen::builder("quit").emit_on_enter(Event::Quit).boxed()],
        }
    }
}
