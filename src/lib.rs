pub mod agent;
pub mod cli;
pub mod compare;
pub mod config;
pub mod dataset;
pub mod http;
pub mod llm;
pub mod prompts;
pub mod sandbox;
pub mod trace;

use agent::{AgentConfig, TerminationReason};
use anyhow::{Result, anyhow, bail};
use cli::{AppState, AskArgs, CliArgs, Command, CompareArgs, CompareJob};
use config::AppConfig;
use dataset::Dataset;
use http::client::HttpClient;
use llm::gemini::GeminiProvider;
use prompts::PromptRegistry;
use sandbox::SandboxFactory;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use time::OffsetDateTime;
use trace::SessionTrace;

pub async fn run(args: CliArgs) -> Result<()> {
    let command = args
        .command
        .unwrap_or_else(|| Command::Ask(AskArgs::default()));
    if command == Command::SandboxWorker {
        return sandbox::worker::serve();
    }

    let config = AppConfig::load_with_path(args.config.as_deref())?;
    let registry = PromptRegistry::load(
        config.prompts_dir.as_deref(),
        config.default_prompt.as_deref(),
    )?;

    match command {
        Command::Prompts => {
            println!(
                "{}",
                cli::format_prompt_list(&registry, &registry.default_variant().name)
            );
            Ok(())
        }
        Command::Ask(ask) => run_ask(&config, registry, ask).await,
        Command::Compare(compare) => run_compare(&config, &registry, compare).await,
        Command::SandboxWorker => Ok(()),
    }
}

async fn run_ask(config: &AppConfig, registry: PromptRegistry, args: AskArgs) -> Result<()> {
    let active = match args.prompt.as_deref() {
        Some(name) => registry
            .resolve(&[name.to_string()])?
            .pop()
            .ok_or_else(|| anyhow!("unknown prompt variant '{name}'"))?,
        None => registry.default_variant().clone(),
    };
    let sandboxes = sandbox_factory(config, args.data.as_deref())?;
    let trace = SessionTrace::create(&generate_session_id())?;
    let provider = gemini_provider(config, &trace)?;

    let mut state = AppState {
        provider,
        sandboxes,
        agent_config: agent_config(config, args.max_turns),
        registry,
        active,
        trace,
        asked: 0,
    };

    let Some(question) = args.question else {
        return cli::run_repl(&mut state).await;
    };

    let result = cli::ask_once(&mut state, &question).await?;
    if result.termination == TerminationReason::ProviderError {
        bail!(
            "Failed to answer question: {}",
            result
                .provider_error
                .as_deref()
                .unwrap_or("model provider error")
        );
    }
    Ok(())
}

async fn run_compare(config: &AppConfig, registry: &PromptRegistry, args: CompareArgs) -> Result<()> {
    let variants = registry.resolve(&args.prompts)?;
    let questions = if args.questions.is_empty() {
        compare::DEFAULT_QUESTIONS
            .iter()
            .map(|question| (*question).to_string())
            .collect()
    } else {
        args.questions
    };
    let sandboxes = sandbox_factory(config, args.data.as_deref())?;
    let trace = SessionTrace::create(&generate_session_id())?;
    let provider = gemini_provider(config, &trace)?;

    let job = CompareJob {
        questions,
        variants,
        agent_config: config.agent,
        max_parallel: args
            .parallel
            .map_or(config.compare.max_parallel, usize::from),
        output: args.output.unwrap_or_else(|| {
            compare::default_output_path(&config.compare.output_dir, OffsetDateTime::now_utc())
        }),
    };

    cli::run_compare(provider, sandboxes, trace, job).await
}

fn sandbox_factory(config: &AppConfig, data_override: Option<&Path>) -> Result<SandboxFactory> {
    let data_file = data_override.unwrap_or(&config.data_file);
    let dataset = Dataset::load(data_file)?;
    let worker_program = worker_program()?;

    Ok(SandboxFactory::new(
        config.sandbox.isolation,
        dataset,
        config.sandbox.limits,
        worker_program,
    ))
}

fn worker_program() -> Result<PathBuf> {
    std::env::current_exe()
        .map_err(|err| anyhow!("Failed to locate sandbox worker executable: {err}"))
}

fn gemini_provider(config: &AppConfig, trace: &SessionTrace) -> Result<GeminiProvider> {
    let http = HttpClient::new(reqwest::Client::new()).with_trace(trace.clone());
    GeminiProvider::new(
        http,
        config.gemini_api_key.clone(),
        config.gemini_model.clone(),
        config.gemini_base_url.clone(),
    )
    .map_err(|err| {
        anyhow!(
            "Failed to configure model client: {err}. Configure it in your shell or .env file (example: GEMINI_API_KEY=your_key)."
        )
    })
}

fn agent_config(config: &AppConfig, max_turns: Option<u16>) -> AgentConfig {
    AgentConfig {
        max_turns: max_turns.map_or(config.agent.max_turns, usize::from),
        ..config.agent
    }
}

fn generate_session_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis());
    format!("{millis:x}-{:x}", std::process::id())
}

#[cfg(test)]
mod tests {
    use super::{agent_config, generate_session_id, sandbox_factory};
    use crate::agent::AgentConfig;
    use crate::config::{AppConfig, CompareConfig, SandboxConfig};
    use crate::sandbox::Isolation;
    use std::fs;
    use std::path::PathBuf;

    fn config(data_file: PathBuf) -> AppConfig {
        AppConfig {
            config_path: PathBuf::from("config.toml"),
            config_is_explicit: true,
            gemini_api_key: None,
            gemini_model: "model".to_string(),
            gemini_base_url: "https://example.com".to_string(),
            data_file,
            default_prompt: None,
            prompts_dir: None,
            agent: AgentConfig::default(),
            sandbox: SandboxConfig {
                isolation: Isolation::InProcess,
                ..SandboxConfig::default()
            },
            compare: CompareConfig::default(),
        }
    }

    #[test]
    fn generated_session_id_has_expected_shape() {
        let session_id = generate_session_id();
        let mut parts = session_id.split('-');
        let ts = parts.next().expect("timestamp segment");
        let pid = parts.next().expect("pid segment");
        assert!(
            parts.next().is_none(),
            "session id should contain one delimiter"
        );
        assert!(!ts.is_empty(), "timestamp segment should not be empty");
        assert!(!pid.is_empty(), "pid segment should not be empty");
        assert!(
            ts.chars().all(|ch| ch.is_ascii_hexdigit()),
            "timestamp segment should be hex"
        );
        assert!(
            pid.chars().all(|ch| ch.is_ascii_hexdigit()),
            "pid segment should be hex"
        );
    }

    #[test]
    fn max_turns_flag_overrides_only_the_budget() {
        let cfg = config(PathBuf::from("data.csv"));

        let overridden = agent_config(&cfg, Some(3));
        assert_eq!(overridden.max_turns, 3);
        assert_eq!(overridden.provider_retries, cfg.agent.provider_retries);
        assert_eq!(agent_config(&cfg, None), cfg.agent);
    }

    #[test]
    fn data_flag_overrides_the_configured_file() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let csv = tmp.path().join("other.csv");
        fs::write(
            &csv,
            "campaign_name,channel,audience_segment,date,impressions,clicks,conversions,spend\n\
Spring Launch,Facebook,18-24,2024-03-01,1000,50,5,120.5\n",
        )
        .expect("write csv");
        let cfg = config(tmp.path().join("missing.csv"));

        let factory = sandbox_factory(&cfg, Some(&csv)).expect("override is used");
        assert_eq!(factory.dataset().name(), "other.csv");

        let err = sandbox_factory(&cfg, None).expect_err("configured file is missing");
        assert!(err.to_string().contains("Failed to load dataset"));
    }
}
