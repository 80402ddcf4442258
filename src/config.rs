use anyhow::{Result, anyhow, bail};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::agent::AgentConfig;
use crate::sandbox::{Isolation, SandboxLimits};

pub const DEFAULT_GEMINI_MODEL: &str = "gemini-3-flash-preview";
pub const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_DATA_FILE: &str = "data/campaigns.csv";
pub const DEFAULT_COMPARE_OUTPUT_DIR: &str = "comparisons";

const CONFIG_DIR_NAME: &str = "codeact-analyst";
const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub config_path: PathBuf,
    pub config_is_explicit: bool,
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
    pub gemini_base_url: String,
    pub data_file: PathBuf,
    pub default_prompt: Option<String>,
    pub prompts_dir: Option<PathBuf>,
    pub agent: AgentConfig,
    pub sandbox: SandboxConfig,
    pub compare: CompareConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SandboxConfig {
    pub isolation: Isolation,
    pub limits: SandboxLimits,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompareConfig {
    pub max_parallel: usize,
    pub output_dir: PathBuf,
}

impl Default for CompareConfig {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            output_dir: PathBuf::from(DEFAULT_COMPARE_OUTPUT_DIR),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawFileConfig {
    gemini_api_key: Option<String>,
    gemini_model: Option<String>,
    gemini_base_url: Option<String>,
    data_file: Option<PathBuf>,
    default_prompt: Option<String>,
    prompts_dir: Option<PathBuf>,
    agent: Option<RawAgentConfig>,
    sandbox: Option<RawSandboxConfig>,
    compare: Option<RawCompareConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawAgentConfig {
    max_turns: Option<usize>,
    provider_retries: Option<usize>,
    retry_backoff_ms: Option<u64>,
    model_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSandboxConfig {
    isolation: Option<Isolation>,
    execution_timeout_ms: Option<u64>,
    table_max_rows: Option<usize>,
    table_max_columns: Option<usize>,
    max_output_chars: Option<usize>,
    max_repr_chars: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCompareConfig {
    max_parallel: Option<usize>,
    output_dir: Option<PathBuf>,
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        Self::load_with_path(None)
    }

    pub fn load_with_path(explicit_path: Option<&Path>) -> Result<Self> {
        let (config_path, config_is_explicit) = match explicit_path {
            Some(path) => {
                if !path.is_file() {
                    bail!(
                        "Failed to load config {}: file does not exist",
                        path.display()
                    );
                }
                (path.to_path_buf(), true)
            }
            None => (discover_config_path()?, false),
        };
        let file_config = load_file_config(&config_path)?;

        dotenvy::dotenv().ok();

        let file_api_key = file_config
            .as_ref()
            .and_then(|cfg| cfg.gemini_api_key.as_ref())
            .and_then(|value| non_empty(value).map(ToOwned::to_owned));
        let file_model = file_config
            .as_ref()
            .and_then(|cfg| cfg.gemini_model.as_ref())
            .and_then(|value| non_empty(value).map(ToOwned::to_owned));
        let file_base_url = file_config
            .as_ref()
            .and_then(|cfg| cfg.gemini_base_url.as_ref())
            .and_then(|value| non_empty(value).map(ToOwned::to_owned));

        let agent = validate_agent(
            file_config.as_ref().and_then(|cfg| cfg.agent.as_ref()),
            &config_path,
        )?;
        let sandbox = validate_sandbox(
            file_config.as_ref().and_then(|cfg| cfg.sandbox.as_ref()),
            &config_path,
        )?;
        let compare = validate_compare(
            file_config.as_ref().and_then(|cfg| cfg.compare.as_ref()),
            &config_path,
        )?;

        Ok(Self {
            config_is_explicit,
            gemini_api_key: env_non_empty("GEMINI_API_KEY").or(file_api_key),
            gemini_model: env_non_empty("GEMINI_MODEL")
                .or(file_model)
                .unwrap_or_else(|| DEFAULT_GEMINI_MODEL.to_string()),
            gemini_base_url: env_non_empty("GEMINI_BASE_URL")
                .or(file_base_url)
                .unwrap_or_else(|| DEFAULT_GEMINI_BASE_URL.to_string()),
            data_file: file_config
                .as_ref()
                .and_then(|cfg| cfg.data_file.clone())
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_FILE)),
            default_prompt: file_config
                .as_ref()
                .and_then(|cfg| cfg.default_prompt.as_deref())
                .and_then(|value| non_empty(value).map(ToOwned::to_owned)),
            prompts_dir: file_config.as_ref().and_then(|cfg| cfg.prompts_dir.clone()),
            agent,
            sandbox,
            compare,
            config_path,
        })
    }
}

fn discover_config_path() -> Result<PathBuf> {
    if let Ok(xdg) = env::var("XDG_CONFIG_HOME") {
        let trimmed = xdg.trim();
        if trimmed.is_empty() {
            bail!("Failed to resolve config path: XDG_CONFIG_HOME is set but empty");
        }

        return Ok(PathBuf::from(trimmed)
            .join(CONFIG_DIR_NAME)
            .join(CONFIG_FILE_NAME));
    }

    let home = dirs::home_dir().ok_or_else(|| {
        anyhow!("Failed to resolve config path: HOME directory is unavailable")
    })?;

    Ok(home
        .join(".config")
        .join(CONFIG_DIR_NAME)
        .join(CONFIG_FILE_NAME))
}

fn load_file_config(config_path: &Path) -> Result<Option<RawFileConfig>> {
    if !config_path.is_file() {
        return Ok(None);
    }

    let config_text = fs::read_to_string(config_path).map_err(|err| {
        anyhow!(
            "Failed to load config {}: unable to read file: {err}",
            config_path.display()
        )
    })?;

    toml::from_str(&config_text)
        .map(Some)
        .map_err(|err| anyhow!("Failed to load config {}: {err}", config_path.display()))
}

fn validate_agent(raw: Option<&RawAgentConfig>, config_path: &Path) -> Result<AgentConfig> {
    let mut config = AgentConfig::default();
    let Some(raw) = raw else {
        return Ok(config);
    };

    if let Some(value) = raw.max_turns {
        config.max_turns = at_least_one(value, config_path, "agent.max_turns")?;
    }
    if let Some(value) = raw.provider_retries {
        config.provider_retries = value;
    }
    if let Some(value) = raw.retry_backoff_ms {
        config.retry_backoff_ms = value;
    }
    if let Some(value) = raw.model_timeout_ms {
        config.model_timeout_ms = at_least_one(value, config_path, "agent.model_timeout_ms")?;
    }

    Ok(config)
}

fn validate_sandbox(raw: Option<&RawSandboxConfig>, config_path: &Path) -> Result<SandboxConfig> {
    let mut config = SandboxConfig::default();
    let Some(raw) = raw else {
        return Ok(config);
    };

    if let Some(isolation) = raw.isolation {
        config.isolation = isolation;
    }
    let limits = &mut config.limits;
    if let Some(value) = raw.execution_timeout_ms {
        limits.execution_timeout_ms =
            at_least_one(value, config_path, "sandbox.execution_timeout_ms")?;
    }
    if let Some(value) = raw.table_max_rows {
        limits.table_max_rows = at_least_one(value, config_path, "sandbox.table_max_rows")?;
    }
    if let Some(value) = raw.table_max_columns {
        limits.table_max_columns = at_least_one(value, config_path, "sandbox.table_max_columns")?;
    }
    if let Some(value) = raw.max_output_chars {
        limits.max_output_chars = at_least_one(value, config_path, "sandbox.max_output_chars")?;
    }
    if let Some(value) = raw.max_repr_chars {
        limits.max_repr_chars = at_least_one(value, config_path, "sandbox.max_repr_chars")?;
    }

    Ok(config)
}

fn validate_compare(raw: Option<&RawCompareConfig>, config_path: &Path) -> Result<CompareConfig> {
    let mut config = CompareConfig::default();
    let Some(raw) = raw else {
        return Ok(config);
    };

    if let Some(value) = raw.max_parallel {
        config.max_parallel = at_least_one(value, config_path, "compare.max_parallel")?;
    }
    if let Some(dir) = &raw.output_dir {
        config.output_dir = dir.clone();
    }

    Ok(config)
}

fn at_least_one<T: PartialOrd + From<u8>>(value: T, config_path: &Path, key_path: &str) -> Result<T> {
    if value < T::from(1) {
        return Err(config_error(config_path, key_path, "must be >= 1"));
    }
    Ok(value)
}

fn env_non_empty(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn config_error(config_path: &Path, key_path: &str, reason: &str) -> anyhow::Error {
    anyhow!(
        "Failed to load config {}: {key_path}: {reason}",
        config_path.display()
    )
}
