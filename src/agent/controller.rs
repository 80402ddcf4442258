use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{sleep, timeout};

use super::extract::{CodeFragment, extract};
use super::observation::render_observation;
use super::prompt::compose_system_prompt;
use super::transcript::{Message, Role, Transcript};
use crate::llm::{LlmError, LlmProvider, ModelInput};
use crate::sandbox::{ExecutionRecord, ExecutionResult, ExecutionSandbox};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentConfig {
    /// Maximum number of model calls per conversation.
    pub max_turns: usize,
    pub provider_retries: usize,
    pub retry_backoff_ms: u64,
    pub model_timeout_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_turns: 8,
            provider_retries: 2,
            retry_backoff_ms: 500,
            model_timeout_ms: 60_000,
        }
    }
}

/// Cooperative cancellation flag, honoured between turns and between a model call and execution.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    FinalAnswer,
    BudgetExhausted,
    ProviderError,
    Cancelled,
    /// No sandbox could be created, so the conversation never started.
    SandboxUnavailable,
}

impl TerminationReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FinalAnswer => "final_answer",
            Self::BudgetExhausted => "budget_exhausted",
            Self::ProviderError => "provider_error",
            Self::Cancelled => "cancelled",
            Self::SandboxUnavailable => "sandbox_unavailable",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationEvent {
    TurnStarted {
        turn: usize,
    },
    ModelResponse {
        turn: usize,
        text: String,
        fragments: usize,
    },
    ProviderRetry {
        turn: usize,
        attempt: usize,
        error: String,
    },
    FragmentExecuted {
        turn: usize,
        fragment: CodeFragment,
        result: ExecutionResult,
    },
    Terminated {
        reason: TerminationReason,
        turn_count: usize,
    },
}

/// How well the final answer is backed by executed code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grounding {
    Verified,
    NoExecution,
    LastExecutionFailed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationResult {
    pub termination: TerminationReason,
    pub final_answer: Option<String>,
    /// Prose of the last model response when the conversation ended without a final answer.
    pub partial_answer: Option<String>,
    pub provider_error: Option<String>,
    /// Number of model calls made.
    pub turn_count: usize,
    pub transcript: Vec<Message>,
    pub executions: Vec<ExecutionRecord>,
}

impl ConversationResult {
    pub fn grounding(&self) -> Grounding {
        match self.executions.last() {
            None => Grounding::NoExecution,
            Some(record) if record.result.succeeded => Grounding::Verified,
            Some(_) => Grounding::LastExecutionFailed,
        }
    }

    /// Number of turns whose response contained code that was executed.
    pub fn execution_turns(&self) -> usize {
        let mut turns = self
            .executions
            .iter()
            .map(|record| record.turn)
            .collect::<Vec<_>>();
        turns.dedup();
        turns.len()
    }
}

enum TurnState {
    AwaitingModel,
    Extracting { response: String },
    Executing { fragments: Vec<CodeFragment> },
    Terminated(TerminationReason),
}

/// One question answered against one sandbox. Consumed by [`Conversation::start`], which
/// drops the sandbox and its session state when the conversation ends.
pub struct Conversation<'p, P, S> {
    provider: &'p P,
    sandbox: Option<S>,
    config: AgentConfig,
    cancel: CancelToken,
}

impl<'p, P, S> Conversation<'p, P, S>
where
    P: LlmProvider,
    S: ExecutionSandbox + Send + 'static,
{
    pub fn new(provider: &'p P, sandbox: S, config: AgentConfig) -> Self {
        Self {
            provider,
            sandbox: Some(sandbox),
            config,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub async fn start<F: FnMut(ConversationEvent)>(
        mut self,
        question: &str,
        system_prompt: &str,
        on_event: &mut F,
    ) -> ConversationResult {
        let bindings = self
            .sandbox
            .as_ref()
            .map(|sandbox| sandbox.bindings().to_vec())
            .unwrap_or_default();
        let system_prompt = compose_system_prompt(system_prompt, &bindings);

        let mut transcript = Transcript::new();
        transcript.append(Role::System, system_prompt.as_str());
        transcript.append(Role::User, question);

        let mut executions: Vec<ExecutionRecord> = Vec::new();
        let mut final_answer = None;
        let mut provider_error = None;
        let mut turn = 0usize;
        let mut state = TurnState::AwaitingModel;

        let termination = loop {
            state = match state {
                TurnState::AwaitingModel => {
                    if self.cancel.is_cancelled() {
                        TurnState::Terminated(TerminationReason::Cancelled)
                    } else if turn >= self.config.max_turns {
                        TurnState::Terminated(TerminationReason::BudgetExhausted)
                    } else {
                        turn += 1;
                        on_event(ConversationEvent::TurnStarted { turn });
                        let input = model_input(&transcript, &system_prompt);
                        match call_model(
                            self.provider,
                            self.config,
                            &self.cancel,
                            input,
                            turn,
                            on_event,
                        )
                        .await
                        {
                            Ok(text) => {
                                transcript.append(Role::Assistant, text.as_str());
                                TurnState::Extracting { response: text }
                            }
                            Err(err) => {
                                provider_error = Some(err.to_string());
                                TurnState::Terminated(TerminationReason::ProviderError)
                            }
                        }
                    }
                }
                TurnState::Extracting { response } => {
                    let extraction = extract(&response);
                    on_event(ConversationEvent::ModelResponse {
                        turn,
                        text: response.clone(),
                        fragments: extraction.fragments.len(),
                    });

                    if !extraction.has_code() {
                        final_answer = Some(response.trim().to_string());
                        TurnState::Terminated(TerminationReason::FinalAnswer)
                    } else if self.cancel.is_cancelled() {
                        TurnState::Terminated(TerminationReason::Cancelled)
                    } else {
                        TurnState::Executing {
                            fragments: extraction.fragments,
                        }
                    }
                }
                TurnState::Executing { fragments } => {
                    for fragment in fragments {
                        let result = self.execute(&fragment).await;
                        on_event(ConversationEvent::FragmentExecuted {
                            turn,
                            fragment: fragment.clone(),
                            result: result.clone(),
                        });
                        executions.push(ExecutionRecord {
                            turn,
                            fragment,
                            result,
                        });
                    }

                    let results = executions
                        .iter()
                        .filter(|record| record.turn == turn)
                        .map(|record| &record.result)
                        .collect::<Vec<_>>();
                    transcript.append(Role::Observation, render_observation(&results));
                    TurnState::AwaitingModel
                }
                TurnState::Terminated(reason) => break reason,
            };
        };

        on_event(ConversationEvent::Terminated {
            reason: termination,
            turn_count: turn,
        });

        let partial_answer = if termination == TerminationReason::FinalAnswer {
            None
        } else {
            transcript
                .last_with_role(Role::Assistant)
                .map(|message| extract(&message.content).prose)
                .filter(|prose| !prose.is_empty())
        };

        ConversationResult {
            termination,
            final_answer,
            partial_answer,
            provider_error,
            turn_count: turn,
            transcript: transcript.into_messages(),
            executions,
        }
    }

    async fn execute(&mut self, fragment: &CodeFragment) -> ExecutionResult {
        let Some(mut sandbox) = self.sandbox.take() else {
            return ExecutionResult::failure(
                "SandboxLost",
                "session state is gone after an aborted execution",
            );
        };

        let job = fragment.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            let result = sandbox.execute(&job);
            (sandbox, result)
        })
        .await;

        match outcome {
            Ok((sandbox, result)) => {
                self.sandbox = Some(sandbox);
                result
            }
            Err(err) => {
                ExecutionResult::failure("SandboxLost", format!("execution aborted: {err}"))
            }
        }
    }
}

fn model_input(transcript: &Transcript, system_prompt: &str) -> ModelInput {
    ModelInput {
        system_instruction: system_prompt.to_string(),
        messages: transcript
            .messages()
            .iter()
            .filter(|message| message.role != Role::System)
            .cloned()
            .collect(),
    }
}

/// One model call with bounded retries on transient failures. Retries do not consume turns.
async fn call_model<P: LlmProvider, F: FnMut(ConversationEvent)>(
    provider: &P,
    config: AgentConfig,
    cancel: &CancelToken,
    input: ModelInput,
    turn: usize,
    on_event: &mut F,
) -> Result<String, LlmError> {
    let limit = Duration::from_millis(config.model_timeout_ms);
    let mut attempt = 0usize;

    loop {
        let outcome = match timeout(limit, provider.generate(input.clone())).await {
            Ok(Ok(output)) if output.text.trim().is_empty() => Err(LlmError::EmptyResponse),
            Ok(Ok(output)) => Ok(output.text),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(LlmError::Timeout {
                after_ms: config.model_timeout_ms,
            }),
        };

        match outcome {
            Err(err)
                if err.is_transient()
                    && attempt < config.provider_retries
                    && !cancel.is_cancelled() =>
            {
                attempt += 1;
                on_event(ConversationEvent::ProviderRetry {
                    turn,
                    attempt,
                    error: err.to_string(),
                });
                let backoff = config.retry_backoff_ms.saturating_mul(attempt as u64);
                sleep(Duration::from_millis(backoff)).await;
            }
            other => return other,
        }
    }
}
