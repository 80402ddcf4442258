use std::fmt::Write;

use crate::sandbox::{Artifact, ExecutionResult};

pub const OBSERVATION_HEADER: &str = "Execution results:";

/// Renders the results of one turn's fragments into the observation fed back to the model.
pub fn render_observation(results: &[&ExecutionResult]) -> String {
    let mut out = String::from(OBSERVATION_HEADER);
    let total = results.len();

    for (index, result) in results.iter().enumerate() {
        let status = if result.succeeded { "ok" } else { "error" };
        let _ = write!(out, "\n[fragment {} of {total}] {status}", index + 1);
        render_result(&mut out, result);
    }

    out
}

fn render_result(out: &mut String, result: &ExecutionResult) {
    let mut produced_anything = false;

    if !result.stdout.is_empty() {
        produced_anything = true;
        let _ = write!(out, "\nstdout:\n{}", result.stdout.trim_end());
    }
    if !result.stderr.is_empty() {
        produced_anything = true;
        let _ = write!(out, "\nstderr:\n{}", result.stderr.trim_end());
    }
    for artifact in &result.artifacts {
        produced_anything = true;
        render_artifact(out, artifact);
    }
    if let Some(error) = &result.error {
        produced_anything = true;
        let _ = write!(out, "\nerror: {}: {}", error.kind, error.message);
    }

    if !produced_anything {
        out.push_str("\n(no output)");
    }
}

fn render_artifact(out: &mut String, artifact: &Artifact) {
    match artifact {
        Artifact::TextualTable {
            rows,
            columns,
            preview,
            truncated,
            ..
        } => {
            let note = if *truncated { ", preview truncated" } else { "" };
            let _ = write!(out, "\ntable ({rows} rows x {columns} columns{note}):\n{preview}");
        }
        Artifact::Image {
            format,
            data_base64,
            width,
            height,
        } => {
            let size = match (width, height) {
                (Some(w), Some(h)) => format!(" {w}x{h}"),
                _ => String::new(),
            };
            let _ = write!(
                out,
                "\nimage ({format}{size}, {} bytes base64) rendered for the user",
                data_base64.len()
            );
        }
        Artifact::RawValue { type_name, repr } => {
            let _ = write!(out, "\nvalue ({type_name}): {repr}");
        }
    }
}
