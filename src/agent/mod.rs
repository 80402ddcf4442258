mod controller;
mod extract;
mod observation;
mod prompt;
mod transcript;

pub use controller::{
    AgentConfig, CancelToken, Conversation, ConversationEvent, ConversationResult, Grounding,
    TerminationReason,
};
pub use extract::{CodeFragment, Extraction, extract};
pub use observation::{OBSERVATION_HEADER, render_observation};
pub use prompt::{EXECUTION_PROTOCOL, compose_system_prompt};
pub use transcript::{Message, Role, Transcript};
