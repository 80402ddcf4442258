use std::fmt::Write as _;

use crate::agent::{ConversationEvent, ConversationResult, Grounding, TerminationReason};
use crate::compare::{ComparisonRun, PairFinished};
use crate::sandbox::{Artifact, ExecutionResult, truncate_output};

const PREVIEW_CHARS: usize = 400;

/// Progress text for one conversation event, or `None` when the event prints nothing.
pub(crate) fn format_event(event: &ConversationEvent) -> Option<String> {
    match event {
        ConversationEvent::TurnStarted { turn } => Some(format!("--- turn {turn} ---")),
        // A reply without code is the final answer and is printed by `format_result`.
        ConversationEvent::ModelResponse { fragments: 0, .. } => None,
        ConversationEvent::ModelResponse {
            text, fragments, ..
        } => Some(format!(
            "model ({fragments} code block(s)):\n{}",
            truncate_output(text.trim(), PREVIEW_CHARS)
        )),
        ConversationEvent::ProviderRetry { attempt, error, .. } => {
            Some(format!("retrying model call (attempt {attempt}): {error}"))
        }
        ConversationEvent::FragmentExecuted {
            fragment, result, ..
        } => Some(format!(
            "code [{}]:\n{}\nresult:\n{}",
            fragment.position + 1,
            indent(fragment.source.trim_end()),
            indent(&truncate_output(&result_preview(result), PREVIEW_CHARS))
        )),
        ConversationEvent::Terminated { .. } => None,
    }
}

fn result_preview(result: &ExecutionResult) -> String {
    let mut out = String::new();
    if !result.stdout.trim().is_empty() {
        let _ = writeln!(out, "{}", result.stdout.trim_end());
    }
    if !result.stderr.trim().is_empty() {
        let _ = writeln!(out, "stderr: {}", result.stderr.trim_end());
    }
    for artifact in &result.artifacts {
        let _ = writeln!(out, "{}", artifact_line(artifact));
    }
    if let Some(error) = &result.error {
        let _ = writeln!(out, "error: {}: {}", error.kind, error.message);
    }
    if out.is_empty() {
        out.push_str("(no output)");
    }
    out.trim_end().to_string()
}

fn artifact_line(artifact: &Artifact) -> String {
    match artifact {
        Artifact::TextualTable {
            rows,
            columns,
            preview,
            ..
        } => format!("[table {rows}x{columns}]\n{preview}"),
        Artifact::Image { format, .. } => format!("[{format} image]"),
        Artifact::RawValue { type_name, repr } => format!("[{type_name}] {repr}"),
    }
}

fn indent(text: &str) -> String {
    text.lines()
        .map(|line| format!("  {line}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Final answer (or what is left of one) followed by the exit reason.
pub(crate) fn format_result(result: &ConversationResult) -> String {
    let mut out = String::new();
    match (&result.final_answer, &result.partial_answer) {
        (Some(answer), _) => {
            let _ = writeln!(out, "{}", answer.trim());
        }
        (None, Some(partial)) => {
            let _ = writeln!(out, "No final answer. Last model response:\n{}", partial.trim());
        }
        (None, None) => {
            let _ = writeln!(out, "No final answer.");
        }
    }
    if let Some(error) = &result.provider_error {
        let _ = writeln!(out, "model error: {error}");
    }

    let _ = write!(
        out,
        "[{} after {} turn(s), {} execution(s)]",
        result.termination.as_str(),
        result.turn_count,
        result.executions.len()
    );

    if result.termination == TerminationReason::FinalAnswer {
        match result.grounding() {
            Grounding::Verified => {}
            Grounding::NoExecution => {
                out.push_str("\nnote: answered without running any code");
            }
            Grounding::LastExecutionFailed => {
                out.push_str(
                    "\nwarning: the last code execution failed, this answer may not be backed by the data",
                );
            }
        }
    }
    out
}

pub(crate) fn format_pair_finished(pair: &PairFinished) -> String {
    let mut line = format!(
        "[q{}] {}: {} after {} turn(s)",
        pair.question_index + 1,
        pair.variant,
        pair.outcome.termination.as_str(),
        pair.outcome.turn_count
    );
    if let Some(error) = &pair.outcome.error {
        let _ = write!(line, " ({error})");
    }
    line
}

/// Per-question summary of how the variants compared.
pub(crate) fn format_divergence(index: usize, run: &ComparisonRun) -> String {
    let divergence = run.divergence();
    let mut out = format!("Q{}: {}\n", index + 1, run.question);
    let _ = writeln!(
        out,
        "  {} distinct answer(s) across {} variant(s), turns {}..{}{}",
        divergence.distinct_answers,
        run.per_variant.len(),
        divergence.min_turns,
        divergence.max_turns,
        if divergence.mixed_termination {
            ", mixed exit reasons"
        } else {
            ""
        }
    );
    for (variant, outcome) in &run.per_variant {
        let answer = outcome
            .final_answer
            .as_deref()
            .map(|answer| truncate_output(&answer.split_whitespace().collect::<Vec<_>>().join(" "), 120))
            .unwrap_or_else(|| format!("({})", outcome.termination.as_str()));
        let _ = writeln!(out, "  {variant}: {answer}");
    }
    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::{format_divergence, format_event, format_result};
    use crate::agent::{
        CodeFragment, ConversationEvent, ConversationResult, TerminationReason,
    };
    use crate::compare::{ComparisonRun, VariantOutcome};
    use crate::sandbox::{ExecutionRecord, ExecutionResult};
    use std::collections::BTreeMap;

    fn fragment(source: &str) -> CodeFragment {
        CodeFragment {
            source: source.to_string(),
            position: 0,
            byte_offset: 0,
        }
    }

    fn ok_result(stdout: &str) -> ExecutionResult {
        ExecutionResult {
            stdout: stdout.to_string(),
            stderr: String::new(),
            error: None,
            artifacts: Vec::new(),
            succeeded: true,
        }
    }

    fn result(
        termination: TerminationReason,
        final_answer: Option<&str>,
        executions: Vec<ExecutionRecord>,
    ) -> ConversationResult {
        ConversationResult {
            termination,
            final_answer: final_answer.map(ToOwned::to_owned),
            partial_answer: None,
            provider_error: None,
            turn_count: 2,
            transcript: Vec::new(),
            executions,
        }
    }

    #[test]
    fn final_replies_are_not_echoed_as_progress() {
        let event = ConversationEvent::ModelResponse {
            turn: 2,
            text: "CTR is 5%.".to_string(),
            fragments: 0,
        };
        assert_eq!(format_event(&event), None);
    }

    #[test]
    fn executed_fragments_show_code_and_a_capped_preview() {
        let event = ConversationEvent::FragmentExecuted {
            turn: 1,
            fragment: fragment("print('x' * 1000)"),
            result: ok_result(&"x".repeat(1000)),
        };
        let text = format_event(&event).expect("printed");

        assert!(text.starts_with("code [1]:\n  print('x' * 1000)\nresult:\n"));
        assert!(text.contains("[truncated 600 chars]"));
    }

    #[test]
    fn failed_fragments_show_the_error() {
        let event = ConversationEvent::FragmentExecuted {
            turn: 1,
            fragment: fragment("1/0"),
            result: ExecutionResult::failure("ZeroDivisionError", "division by zero"),
        };
        assert!(
            format_event(&event)
                .expect("printed")
                .ends_with("error: ZeroDivisionError: division by zero")
        );
    }

    #[test]
    fn answers_after_a_failed_execution_carry_a_warning() {
        let failed = ExecutionRecord {
            turn: 1,
            fragment: fragment("1/0"),
            result: ExecutionResult::failure("ZeroDivisionError", "division by zero"),
        };
        let text = format_result(&result(
            TerminationReason::FinalAnswer,
            Some("CTR is 5%."),
            vec![failed],
        ));

        assert!(text.starts_with("CTR is 5%.\n[final_answer after 2 turn(s), 1 execution(s)]"));
        assert!(text.contains("warning: the last code execution failed"));
    }

    #[test]
    fn budget_exhaustion_shows_the_partial_answer() {
        let mut exhausted = result(TerminationReason::BudgetExhausted, None, Vec::new());
        exhausted.partial_answer = Some("Still computing.".to_string());

        assert_eq!(
            format_result(&exhausted),
            "No final answer. Last model response:\nStill computing.\n[budget_exhausted after 2 turn(s), 0 execution(s)]"
        );
    }

    #[test]
    fn divergence_summary_lists_each_variant() {
        let outcome = |answer: Option<&str>, termination, turns| VariantOutcome {
            final_answer: answer.map(ToOwned::to_owned),
            termination,
            turn_count: turns,
            execution_results: Vec::new(),
            error: None,
        };
        let run = ComparisonRun {
            question: "Which campaign has the best CPA?".to_string(),
            per_variant: BTreeMap::from([
                (
                    "v1_basic".to_string(),
                    outcome(Some("Spring Launch\n($24.10)"), TerminationReason::FinalAnswer, 2),
                ),
                (
                    "v2_structured".to_string(),
                    outcome(None, TerminationReason::ProviderError, 1),
                ),
            ]),
        };

        assert_eq!(
            format_divergence(0, &run),
            "Q1: Which campaign has the best CPA?\n  1 distinct answer(s) across 2 variant(s), turns 1..2, mixed exit reasons\n  v1_basic: Spring Launch ($24.10)\n  v2_structured: (provider_error)"
        );
    }
}
