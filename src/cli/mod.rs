mod args;
mod commands;
mod render;
mod repl;

use anyhow::Result;
use std::path::PathBuf;
use tokio::task::JoinHandle;

pub use args::{AskArgs, CliArgs, Command, CompareArgs};
pub use repl::{AppState, ask_once, run_repl};

use crate::agent::{AgentConfig, CancelToken};
use crate::compare::{ComparisonHarness, write_jsonl};
use crate::llm::LlmProvider;
use crate::prompts::PromptVariant;
use crate::sandbox::SandboxFactory;
use crate::trace::SessionTrace;
use render::{format_divergence, format_pair_finished};

pub(crate) use repl::format_prompt_list;

/// Cancels `cancel` on the first Ctrl-C until the returned task is aborted.
pub(crate) fn cancel_on_ctrl_c(cancel: CancelToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    })
}

/// Everything a `compare` run needs once config and arguments are resolved.
pub struct CompareJob {
    pub questions: Vec<String>,
    pub variants: Vec<PromptVariant>,
    pub agent_config: AgentConfig,
    pub max_parallel: usize,
    pub output: PathBuf,
}

pub async fn run_compare<P>(
    provider: P,
    sandboxes: SandboxFactory,
    trace: SessionTrace,
    job: CompareJob,
) -> Result<()>
where
    P: LlmProvider + Send + Sync + 'static,
{
    println!(
        "Comparing {} prompt variant(s) on {} question(s), {} at a time",
        job.variants.len(),
        job.questions.len(),
        job.max_parallel
    );

    let cancel = CancelToken::new();
    let watcher = cancel_on_ctrl_c(cancel.clone());
    let harness = ComparisonHarness::new(provider, sandboxes, job.agent_config)
        .with_max_parallel(job.max_parallel)
        .with_cancel(cancel)
        .with_trace(trace.clone());
    let runs = harness
        .run(&job.questions, &job.variants, &mut |pair| {
            println!("{}", format_pair_finished(pair));
        })
        .await;
    watcher.abort();
    let runs = runs?;

    println!();
    for (index, run) in runs.iter().enumerate() {
        println!("{}", format_divergence(index, run));
    }

    write_jsonl(&job.output, &runs)?;
    println!("Results written to {}", job.output.display());
    println!("Trace: {}", trace.file_path().display());
    Ok(())
}
