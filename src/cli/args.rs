use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser, Clone, PartialEq, Eq)]
#[command(name = "codeact_analyst")]
#[command(
    about = "Answer questions about a marketing dataset with code the model writes and the sandbox runs",
    long_about = "Answer questions about a marketing dataset with code the model writes and the sandbox runs\n\nConfig file loading:\n  - --config <path> (explicit file, overrides default path discovery)\n  - Default search path when --config is not provided:\n    1. $XDG_CONFIG_HOME/codeact-analyst/config.toml\n    2. ~/.config/codeact-analyst/config.toml\n\nWithout a subcommand, starts an interactive `ask` session."
)]
pub struct CliArgs {
    /// Load config from this file path instead of the default discovery path.
    #[arg(long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone, PartialEq, Eq)]
pub enum Command {
    /// Ask one question, or start an interactive session when --question is omitted.
    Ask(AskArgs),
    /// Run questions against several prompt variants and write a JSON Lines report.
    Compare(CompareArgs),
    /// List the available prompt variants.
    Prompts,
    #[command(name = "sandbox-worker", hide = true)]
    SandboxWorker,
}

#[derive(Debug, Args, Clone, Default, PartialEq, Eq)]
pub struct AskArgs {
    /// Prompt variant to use (defaults to the configured default variant).
    #[arg(long, value_name = "NAME")]
    pub prompt: Option<String>,

    /// CSV dataset to analyse (overrides `data_file`).
    #[arg(long, value_name = "PATH")]
    pub data: Option<PathBuf>,

    /// Ask this question and exit.
    #[arg(long, value_name = "TEXT")]
    pub question: Option<String>,

    /// Override `agent.max_turns` for this run.
    #[arg(long, value_name = "N", value_parser = clap::value_parser!(u16).range(1..))]
    pub max_turns: Option<u16>,
}

#[derive(Debug, Args, Clone, Default, PartialEq, Eq)]
pub struct CompareArgs {
    /// Prompt variants to compare (defaults to all of them).
    #[arg(long, value_name = "NAME", num_args = 1..)]
    pub prompts: Vec<String>,

    /// Questions to ask (defaults to the built-in evaluation set).
    #[arg(long, value_name = "TEXT", num_args = 1..)]
    pub questions: Vec<String>,

    /// CSV dataset to analyse (overrides `data_file`).
    #[arg(long, value_name = "PATH")]
    pub data: Option<PathBuf>,

    /// Where to write the JSON Lines report.
    #[arg(long, value_name = "PATH")]
    pub output: Option<PathBuf>,

    /// Conversations to run at once (overrides `compare.max_parallel`).
    #[arg(long, value_name = "N", value_parser = clap::value_parser!(u16).range(1..))]
    pub parallel: Option<u16>,
}
