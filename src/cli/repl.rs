use anyhow::{Result, anyhow};
use std::io::{self, Write};
use tokio::io::{AsyncBufReadExt, BufReader};

use super::commands::{Command, HELP_TEXT, is_command_line, parse_command};
use super::render::{format_event, format_result};
use crate::agent::{AgentConfig, CancelToken, Conversation, ConversationResult};
use crate::llm::LlmProvider;
use crate::prompts::{PromptRegistry, PromptVariant};
use crate::sandbox::SandboxFactory;
use crate::trace::SessionTrace;

pub struct AppState<P> {
    pub provider: P,
    pub sandboxes: SandboxFactory,
    pub agent_config: AgentConfig,
    pub registry: PromptRegistry,
    pub active: PromptVariant,
    pub trace: SessionTrace,
    /// Questions asked so far; numbers the trace labels.
    pub asked: usize,
}

const PROMPT: &str = "ask> ";

/// Answers one question in a fresh sandbox, printing progress as the loop runs.
pub async fn ask_once<P: LlmProvider>(
    state: &mut AppState<P>,
    question: &str,
) -> Result<ConversationResult> {
    state.asked += 1;
    let label = format!("{}#{}", state.active.name, state.asked);

    let sandboxes = state.sandboxes.clone();
    let sandbox = tokio::task::spawn_blocking(move || sandboxes.create())
        .await
        .map_err(|err| anyhow!("sandbox setup task failed: {err}"))??;

    let trace = &state.trace;
    trace.log_question(&label, question);

    let cancel = CancelToken::new();
    let watcher = super::cancel_on_ctrl_c(cancel.clone());
    let result = Conversation::new(&state.provider, sandbox, state.agent_config)
        .with_cancel(cancel)
        .start(question, &state.active.system_prompt, &mut |event| {
            trace.log_conversation_event(&label, &event);
            if let Some(text) = format_event(&event) {
                println!("{text}");
            }
        })
        .await;
    watcher.abort();

    println!("{}", format_result(&result));
    Ok(result)
}

pub async fn run_repl<P: LlmProvider>(state: &mut AppState<P>) -> Result<()> {
    let dataset = state.sandboxes.dataset();
    println!(
        "Dataset {} ({} rows). Prompt variant: {}. Type /help for commands.",
        dataset.name(),
        dataset.row_count(),
        state.active.name
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("{PROMPT}");
        io::stdout().flush()?;

        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            println!();
            break;
        };

        let line = line.trim();
        if is_exit(line) {
            break;
        }
        if line.is_empty() {
            continue;
        }

        if is_command_line(line) {
            handle_command(state, line);
            continue;
        }

        if let Err(err) = ask_once(state, line).await {
            println!("error: {err}");
        }
    }

    Ok(())
}

fn is_exit(line: &str) -> bool {
    ["exit", "quit", "q"]
        .iter()
        .any(|word| line.eq_ignore_ascii_case(word))
}

fn handle_command<P>(state: &mut AppState<P>, line: &str) {
    let command = match parse_command(line) {
        Ok(command) => command,
        Err(err) => {
            println!("{}", err.message());
            return;
        }
    };

    match command {
        Command::Help => println!("{HELP_TEXT}"),
        Command::Prompts => println!("{}", format_prompt_list(&state.registry, &state.active.name)),
        Command::Prompt(None) => println!("Active prompt variant: {}", state.active.name),
        Command::Prompt(Some(name)) => match state.registry.resolve(std::slice::from_ref(&name)) {
            Ok(mut picked) => {
                if let Some(variant) = picked.pop() {
                    println!("Switched to prompt variant {}", variant.name);
                    state.active = variant;
                }
            }
            Err(err) => println!("{err}"),
        },
        Command::ShowPrompt => println!("{}", state.active.system_prompt),
        Command::Trace => println!("{}", state.trace.file_path().display()),
    }
}

/// One name per line, the active variant marked with `*`.
pub(crate) fn format_prompt_list(registry: &PromptRegistry, active: &str) -> String {
    registry
        .names()
        .map(|name| {
            let marker = if name == active { '*' } else { ' ' };
            format!("{marker} {name}")
        })
        .collect::<Vec<_>>()
        .join("\n")
}
