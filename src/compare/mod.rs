mod report;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

pub use report::{default_output_path, read_jsonl, write_jsonl};

use crate::agent::{AgentConfig, CancelToken, Conversation, TerminationReason};
use crate::llm::LlmProvider;
use crate::prompts::PromptVariant;
use crate::sandbox::{ExecutionRecord, Sandbox, SandboxFactory};
use crate::trace::SessionTrace;

pub const DEFAULT_QUESTIONS: [&str; 4] = [
    "Which campaign has the best CPA?",
    "How does performance vary by channel?",
    "What trends do you see over time?",
    "Where should we reallocate budget to improve overall ROAS?",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantOutcome {
    pub final_answer: Option<String>,
    pub termination: TerminationReason,
    pub turn_count: usize,
    pub execution_results: Vec<ExecutionRecord>,
    /// Why the pair could not run, when it never reached the model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl VariantOutcome {
    fn sandbox_unavailable(message: String) -> Self {
        Self {
            final_answer: None,
            termination: TerminationReason::SandboxUnavailable,
            turn_count: 0,
            execution_results: Vec::new(),
            error: Some(message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComparisonRun {
    pub question: String,
    pub per_variant: BTreeMap<String, VariantOutcome>,
}

/// How much the variants disagreed on one question.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Divergence {
    pub distinct_answers: usize,
    pub min_turns: usize,
    pub max_turns: usize,
    pub mixed_termination: bool,
}

impl ComparisonRun {
    pub fn divergence(&self) -> Divergence {
        let outcomes = self.per_variant.values();
        let answers = outcomes
            .clone()
            .filter_map(|outcome| outcome.final_answer.as_deref())
            .map(normalize_answer)
            .collect::<BTreeSet<_>>();
        let terminations = outcomes
            .clone()
            .map(|outcome| outcome.termination.as_str())
            .collect::<BTreeSet<_>>();

        Divergence {
            distinct_answers: answers.len(),
            min_turns: outcomes.clone().map(|o| o.turn_count).min().unwrap_or(0),
            max_turns: outcomes.map(|o| o.turn_count).max().unwrap_or(0),
            mixed_termination: terminations.len() > 1,
        }
    }
}

fn normalize_answer(answer: &str) -> String {
    answer.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Reported as each (question, variant) conversation finishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairFinished {
    pub question_index: usize,
    pub variant: String,
    pub outcome: VariantOutcome,
}

/// Runs every question against every variant, each pair in its own conversation and sandbox.
pub struct ComparisonHarness<P> {
    provider: Arc<P>,
    sandboxes: SandboxFactory,
    config: AgentConfig,
    max_parallel: usize,
    cancel: CancelToken,
    trace: Option<SessionTrace>,
}

impl<P> ComparisonHarness<P>
where
    P: LlmProvider + Send + Sync + 'static,
{
    pub fn new(provider: P, sandboxes: SandboxFactory, config: AgentConfig) -> Self {
        Self {
            provider: Arc::new(provider),
            sandboxes,
            config,
            max_parallel: 1,
            cancel: CancelToken::new(),
            trace: None,
        }
    }

    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_trace(mut self, trace: SessionTrace) -> Self {
        self.trace = Some(trace);
        self
    }

    pub async fn run<F: FnMut(&PairFinished)>(
        &self,
        questions: &[String],
        variants: &[PromptVariant],
        on_finished: &mut F,
    ) -> Result<Vec<ComparisonRun>> {
        let mut runs = questions
            .iter()
            .map(|question| ComparisonRun {
                question: question.clone(),
                per_variant: BTreeMap::new(),
            })
            .collect::<Vec<_>>();

        let permits = Arc::new(Semaphore::new(self.max_parallel));
        let mut tasks = JoinSet::new();
        for (question_index, question) in questions.iter().enumerate() {
            for variant in variants {
                tasks.spawn(self.clone().run_pair(
                    Arc::clone(&permits),
                    question_index,
                    question.clone(),
                    variant.clone(),
                ));
            }
        }

        while let Some(joined) = tasks.join_next().await {
            let finished = joined.map_err(|err| anyhow!("comparison task failed: {err}"))?;
            on_finished(&finished);
            if let Some(run) = runs.get_mut(finished.question_index) {
                run.per_variant.insert(finished.variant, finished.outcome);
            }
        }

        Ok(runs)
    }

    async fn run_pair(
        self,
        permits: Arc<Semaphore>,
        question_index: usize,
        question: String,
        variant: PromptVariant,
    ) -> PairFinished {
        let label = format!("{}#{}", variant.name, question_index + 1);
        let trace = self.trace.as_ref();
        let outcome = match permits.acquire_owned().await {
            Ok(_permit) => match self.create_sandbox().await {
                Ok(sandbox) => {
                    if let Some(trace) = trace {
                        trace.log_question(&label, &question);
                    }
                    let result = Conversation::new(self.provider.as_ref(), sandbox, self.config)
                        .with_cancel(self.cancel.clone())
                        .start(&question, &variant.system_prompt, &mut |event| {
                            if let Some(trace) = trace {
                                trace.log_conversation_event(&label, &event);
                            }
                        })
                        .await;
                    VariantOutcome {
                        final_answer: result.final_answer,
                        termination: result.termination,
                        turn_count: result.turn_count,
                        execution_results: result.executions,
                        error: None,
                    }
                }
                Err(err) => {
                    let message = format!(
                        "Failed to create sandbox for {} on question {}: {err}",
                        variant.name,
                        question_index + 1
                    );
                    if let Some(trace) = trace {
                        trace.log_setup_error(&label, &message);
                    }
                    VariantOutcome::sandbox_unavailable(message)
                }
            },
            Err(err) => {
                VariantOutcome::sandbox_unavailable(format!("comparison scheduler closed: {err}"))
            }
        };

        PairFinished {
            question_index,
            variant: variant.name,
            outcome,
        }
    }

    async fn create_sandbox(&self) -> Result<Sandbox> {
        let sandboxes = self.sandboxes.clone();
        tokio::task::spawn_blocking(move || sandboxes.create())
            .await
            .map_err(|err| anyhow!("sandbox setup task failed: {err}"))?
    }
}

impl<P> Clone for ComparisonHarness<P> {
    fn clone(&self) -> Self {
        Self {
            provider: Arc::clone(&self.provider),
            sandboxes: self.sandboxes.clone(),
            config: self.config,
            max_parallel: self.max_parallel,
            cancel: self.cancel.clone(),
            trace: self.trace.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ComparisonHarness, ComparisonRun, Divergence, VariantOutcome};
    use crate::agent::{AgentConfig, Message, Role, TerminationReason};
    use crate::dataset::Dataset;
    use crate::llm::{LlmProvider, LlmResult, ModelInput, ModelOutput};
    use crate::prompts::PromptVariant;
    use crate::sandbox::{Isolation, SandboxFactory, SandboxLimits};
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    const CSV: &str = "campaign_name,channel,audience_segment,date,impressions,clicks,conversions,spend\n\
Spring Launch,Facebook,18-24,2024-03-01,1000,50,5,120.5\n";

    /// Answers according to which variant's system prompt it sees and how far the
    /// conversation has progressed.
    struct ScriptedProvider;

    impl LlmProvider for ScriptedProvider {
        async fn generate(&self, input: ModelInput) -> LlmResult<ModelOutput> {
            let observations = input
                .messages
                .iter()
                .filter(|message| message.role == Role::Observation)
                .collect::<Vec<&Message>>();
            let variant_a = input.system_instruction.starts_with("Variant A");

            let text = match (variant_a, observations.len()) {
                (true, 0) => "```python\nleak = 'from A'\nprint(leak)\n```".to_string(),
                (true, _) => "A is done.".to_string(),
                (false, 0) => "```python\ntry:\n    print(leak)\nexcept NameError:\n    print('no leak')\n```".to_string(),
                (false, _) => {
                    let last = observations.last().map(|m| m.content.clone()).unwrap_or_default();
                    if last.contains("no leak") {
                        "B saw a clean session.".to_string()
                    } else {
                        "B saw leaked state.".to_string()
                    }
                }
            };
            Ok(ModelOutput { text })
        }
    }

    struct UnreachableProvider;

    impl LlmProvider for UnreachableProvider {
        async fn generate(&self, _input: ModelInput) -> LlmResult<ModelOutput> {
            panic!("no conversation should start without a sandbox")
        }
    }

    fn factory() -> SandboxFactory {
        let dataset = Dataset::from_csv_text("campaigns.csv", CSV).expect("dataset");
        SandboxFactory::new(
            Isolation::InProcess,
            dataset,
            SandboxLimits::default(),
            PathBuf::from("unused"),
        )
    }

    fn outcome(answer: &str, termination: TerminationReason, turns: usize) -> VariantOutcome {
        VariantOutcome {
            final_answer: Some(answer.to_string()),
            termination,
            turn_count: turns,
            execution_results: Vec::new(),
            error: None,
        }
    }

    #[tokio::test]
    async fn variants_never_share_session_state() {
        let harness = ComparisonHarness::new(ScriptedProvider, factory(), AgentConfig::default());
        let variants = vec![
            PromptVariant::new("a", "Variant A"),
            PromptVariant::new("b", "Variant B"),
        ];
        let mut finished = Vec::new();

        let runs = harness
            .run(&["Same question".to_string()], &variants, &mut |pair| {
                finished.push(pair.variant.clone());
            })
            .await
            .expect("comparison runs");

        assert_eq!(runs.len(), 1);
        assert_eq!(finished.len(), 2);
        let run = &runs[0];
        assert_eq!(run.question, "Same question");
        assert_eq!(
            run.per_variant["a"].final_answer.as_deref(),
            Some("A is done.")
        );
        assert_eq!(
            run.per_variant["b"].final_answer.as_deref(),
            Some("B saw a clean session.")
        );
        assert_eq!(run.per_variant["b"].turn_count, 2);
        assert_eq!(run.per_variant["b"].execution_results.len(), 1);
    }

    #[tokio::test]
    async fn every_question_gets_its_own_run_in_order() {
        let harness = ComparisonHarness::new(ScriptedProvider, factory(), AgentConfig::default())
            .with_max_parallel(2);
        let questions = vec!["first".to_string(), "second".to_string()];

        let runs = harness
            .run(&questions, &[PromptVariant::new("a", "Variant A")], &mut |_| {})
            .await
            .expect("comparison runs");

        let asked = runs.iter().map(|run| run.question.as_str()).collect::<Vec<_>>();
        assert_eq!(asked, vec!["first", "second"]);
        assert!(runs.iter().all(|run| run.per_variant.len() == 1));
    }

    #[tokio::test]
    async fn sandbox_setup_failures_are_recorded_per_pair() {
        let dataset = Dataset::from_csv_text("campaigns.csv", CSV).expect("dataset");
        let sandboxes = SandboxFactory::new(
            Isolation::Process,
            dataset,
            SandboxLimits::default(),
            PathBuf::from("/nonexistent/codeact-worker"),
        );
        let harness = ComparisonHarness::new(UnreachableProvider, sandboxes, AgentConfig::default())
            .with_max_parallel(2);
        let mut finished = 0;

        let runs = harness
            .run(
                &["first".to_string(), "second".to_string()],
                &[PromptVariant::new("a", "Variant A")],
                &mut |_| finished += 1,
            )
            .await
            .expect("setup failures do not abort the run");

        assert_eq!(finished, 2);
        assert_eq!(runs.len(), 2);
        for run in &runs {
            let outcome = &run.per_variant["a"];
            assert_eq!(outcome.termination, TerminationReason::SandboxUnavailable);
            assert_eq!(outcome.turn_count, 0);
            assert!(
                outcome
                    .error
                    .as_deref()
                    .is_some_and(|error| error.contains("Failed to create sandbox for a")),
                "{outcome:?}"
            );
        }
    }

    #[test]
    fn divergence_counts_distinct_answers_and_turn_spread() {
        let run = ComparisonRun {
            question: "q".to_string(),
            per_variant: BTreeMap::from([
                ("a".to_string(), outcome("CPA is $10", TerminationReason::FinalAnswer, 2)),
                ("b".to_string(), outcome("CPA  is $10", TerminationReason::FinalAnswer, 4)),
                (
                    "c".to_string(),
                    outcome("CPA is $12", TerminationReason::BudgetExhausted, 8),
                ),
            ]),
        };

        assert_eq!(
            run.divergence(),
            Divergence {
                distinct_answers: 2,
                min_turns: 2,
                max_turns: 8,
                mixed_termination: true,
            }
        );
    }
}
