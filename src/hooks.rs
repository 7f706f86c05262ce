use crate::config::{is_runnable, HookCommand};
use crate::error::Error;
use crate::process;
use tracing::{error, info};

pub const INTERFACE_PLACEHOLDER: &str = "%i";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookStage {
    PostUp,
    PostDown,
}

impl HookStage {
    pub fn as_str(self) -> &'static str {
        match self {
            HookStage::PostUp => "postUp",
            HookStage::PostDown => "postDown",
        }
    }
}

pub fn substitute(command: &[String], interface: &str) -> Vec<String> {
    command
        .iter()
        .map(|token| token.replace(INTERFACE_PLACEHOLDER, interface))
        .collect()
}

/// Runs every hook of a stage in order. Failures are logged and collected; the
/// remaining hooks still run.
pub async fn run_hooks(stage: HookStage, commands: &[HookCommand], interface: &str) -> Vec<Error> {
    let mut failures = Vec::new();
    let indexed = commands.iter().enumerate();
    for (index, command) in indexed.filter(|(_, command)| is_runnable(command)) {
        let argv = substitute(command, interface);
        info!(stage = stage.as_str(), index, command = %argv.join(" "), "running hook");
        if let Err(err) = process::run(&argv).await {
            let failure = Error::Hook {
                stage: stage.as_str(),
                index,
                command: argv.join(" "),
                reason: err.to_string(),
            };
            error!("{}", failure);
            failures.push(failure);
        }
    }
    failures
}
