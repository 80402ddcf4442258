use std::error::Error;
use std::fmt::{Display, Formatter};

use crate::agent::Message;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelInput {
    pub system_instruction: String,
    /// Conversation history in order, system messages excluded.
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelOutput {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LlmError {
    MissingApiKey,
    HttpStatus { status: u16, body: String },
    Transport(String),
    Parse(String),
    EmptyResponse,
    Timeout { after_ms: u64 },
}

impl LlmError {
    /// Whether repeating the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) | Self::EmptyResponse | Self::Timeout { .. } => true,
            Self::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            Self::MissingApiKey | Self::Parse(_) => false,
        }
    }
}

impl Display for LlmError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingApiKey => write!(f, "missing GEMINI_API_KEY"),
            Self::HttpStatus { status, body } => {
                write!(f, "provider request failed with status {status}: {body}")
            }
            Self::Transport(msg) => write!(f, "provider transport error: {msg}"),
            Self::Parse(msg) => write!(f, "provider parse error: {msg}"),
            Self::EmptyResponse => write!(f, "provider returned empty response text"),
            Self::Timeout { after_ms } => {
                write!(f, "provider did not answer within {after_ms} ms")
            }
        }
    }
}

impl Error for LlmError {}

pub type LlmResult<T> = std::result::Result<T, LlmError>;

/// Stateless request/response boundary to a language model. No retries happen here.
pub trait LlmProvider {
    fn generate(
        &self,
        input: ModelInput,
    ) -> impl std::future::Future<Output = LlmResult<ModelOutput>> + Send;
}
