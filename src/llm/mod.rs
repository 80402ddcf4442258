pub mod gemini;
pub mod provider;

pub use provider::{LlmError, LlmProvider, LlmResult, ModelInput, ModelOutput};
