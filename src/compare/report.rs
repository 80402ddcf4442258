use anyhow::{Result, anyhow};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use time::OffsetDateTime;

use super::ComparisonRun;

/// `<output_dir>/comparison_<YYYYmmdd_HHMMSS>.jsonl`, timestamped in UTC.
pub fn default_output_path(output_dir: &Path, now: OffsetDateTime) -> PathBuf {
    output_dir.join(format!(
        "comparison_{:04}{:02}{:02}_{:02}{:02}{:02}.jsonl",
        now.year(),
        u8::from(now.month()),
        now.day(),
        now.hour(),
        now.minute(),
        now.second()
    ))
}

/// Writes one run per line.
pub fn write_jsonl(path: &Path, runs: &[ComparisonRun]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|err| {
            anyhow!(
                "Failed to create comparison output directory {}: {err}",
                parent.display()
            )
        })?;
    }

    let file = File::create(path).map_err(|err| {
        anyhow!(
            "Failed to write comparison results {}: {err}",
            path.display()
        )
    })?;
    let mut writer = BufWriter::new(file);
    for run in runs {
        serde_json::to_writer(&mut writer, run)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}

pub fn read_jsonl(path: &Path) -> Result<Vec<ComparisonRun>> {
    let file = File::open(path).map_err(|err| {
        anyhow!(
            "Failed to read comparison results {}: {err}",
            path.display()
        )
    })?;

    let mut runs = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let run = serde_json::from_str(&line).map_err(|err| {
            anyhow!(
                "Failed to read comparison results {}: line {}: {err}",
                path.display(),
                index + 1
            )
        })?;
        runs.push(run);
    }

    Ok(runs)
}

#[cfg(test)]
mod tests {
    use super::{default_output_path, read_jsonl, write_jsonl};
    use crate::agent::{CodeFragment, TerminationReason};
    use crate::compare::{ComparisonRun, VariantOutcome};
    use crate::sandbox::{Artifact, ExecutionRecord, ExecutionResult};
    use std::collections::BTreeMap;
    use std::fs;
    use std::path::Path;
    use time::OffsetDateTime;

    fn sample_run() -> ComparisonRun {
        let table = ExecutionResult {
            stdout: "CTR: 5.00%\n".to_string(),
            stderr: String::new(),
            error: None,
            artifacts: vec![Artifact::TextualTable {
                rows: 1,
                columns: 2,
                column_names: vec!["channel".to_string(), "ctr".to_string()],
                preview: "channel   ctr\nFacebook  0.05".to_string(),
                truncated: false,
            }],
            succeeded: true,
        };
        ComparisonRun {
            question: "What is the CTR for the Facebook channel?".to_string(),
            per_variant: BTreeMap::from([
                (
                    "v1_basic".to_string(),
                    VariantOutcome {
                        final_answer: Some("5%".to_string()),
                        termination: TerminationReason::FinalAnswer,
                        turn_count: 2,
                        execution_results: vec![ExecutionRecord {
                            turn: 1,
                            fragment: CodeFragment {
                                source: "print('CTR: 5.00%')".to_string(),
                                position: 0,
                                byte_offset: 10,
                            },
                            result: table,
                        }],
                        error: None,
                    },
                ),
                (
                    "v2_structured".to_string(),
                    VariantOutcome {
                        final_answer: None,
                        termination: TerminationReason::BudgetExhausted,
                        turn_count: 8,
                        execution_results: vec![ExecutionRecord {
                            turn: 1,
                            fragment: CodeFragment {
                                source: "1/0".to_string(),
                                position: 0,
                                byte_offset: 0,
                            },
                            result: ExecutionResult::failure("ZeroDivisionError", "division by zero"),
                        }],
                        error: None,
                    },
                ),
                (
                    "v3_analytical".to_string(),
                    VariantOutcome {
                        final_answer: None,
                        termination: TerminationReason::SandboxUnavailable,
                        turn_count: 0,
                        execution_results: Vec::new(),
                        error: Some("Failed to create sandbox for v3_analytical on question 1: worker exited".to_string()),
                    },
                ),
            ]),
        }
    }

    #[test]
    fn runs_survive_a_round_trip_through_jsonl() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("nested/out.jsonl");
        let runs = vec![sample_run(), sample_run()];

        write_jsonl(&path, &runs).expect("write");
        let text = fs::read_to_string(&path).expect("read text");
        assert_eq!(text.lines().count(), 2);
        assert!(text.contains(r#""termination":"budget_exhausted""#));
        assert!(text.contains(r#""kind":"textual_table""#));
        assert!(text.contains(r#""termination":"sandbox_unavailable""#));
        assert!(text.contains(r#""error":"Failed to create sandbox for v3_analytical"#));

        assert_eq!(read_jsonl(&path).expect("read back"), runs);
    }

    #[test]
    fn read_reports_the_offending_line() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("broken.jsonl");
        fs::write(&path, "\n{\"question\": 1}\n").expect("write");

        let err = read_jsonl(&path).expect_err("invalid line");
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn default_output_path_is_timestamped() {
        let now = OffsetDateTime::from_unix_timestamp(1_709_622_489).expect("timestamp");
        let path = default_output_path(Path::new("comparisons"), now);
        assert_eq!(
            path,
            Path::new("comparisons/comparison_20240305_070809.jsonl")
        );
    }
}
