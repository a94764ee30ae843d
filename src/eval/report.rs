use std::{
    fs,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::{
    agent_loop::{FailureKind, Termination, ToolCallRecord},
    eval::{scenario::Level, score::Evaluation},
    TokenUsage,
};

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("failed to write report: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to serialize report: {0}")]
    Json(#[from] serde_json::Error),
}

/// Outcome of one (scenario, provider) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub scenario_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<Level>,
    pub provider: String,
    pub model: String,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    #[serde(flatten)]
    pub outcome: RunOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed(CompletedRun),
    Failed { kind: FailureKind, message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletedRun {
    pub tool_calls: Vec<ToolCallRecord>,
    pub final_text: Option<String>,
    pub termination: Termination,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub narration: Vec<String>,
    pub usage: TokenUsage,
    pub turns: usize,
    /// Absent when the model has no price; see `pricing_error`.
    pub cost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pricing_error: Option<String>,
    pub evaluation: Evaluation,
}

impl RunResult {
    pub fn completed(&self) -> Option<&CompletedRun> {
        match &self.outcome {
            RunOutcome::Completed(run) => Some(run),
            RunOutcome::Failed { .. } => None,
        }
    }

    pub fn failure(&self) -> Option<FailureKind> {
        match &self.outcome {
            RunOutcome::Completed(_) => None,
            RunOutcome::Failed { kind, .. } => Some(*kind),
        }
    }
}

/// One element of a per-provider results array: invoked tools in order, then the final answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TraceEntry {
    ToolUse(ToolUse),
    Final(Option<String>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "tool_use")]
pub struct ToolUse {
    pub name: String,
    pub input: Value,
}

/// Failed runs have no observed calls and trace as `[null]`.
pub fn trace_entries(result: &RunResult) -> Vec<TraceEntry> {
    let Some(run) = result.completed() else {
        return vec![TraceEntry::Final(None)];
    };
    run.tool_calls
        .iter()
        .map(|call| {
            TraceEntry::ToolUse(ToolUse {
                name: call.name.clone(),
                input: call.arguments.clone(),
            })
        })
        .chain(std::iter::once(TraceEntry::Final(run.final_text.clone())))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSummary {
    pub provider: String,
    pub model: String,
    pub completed: usize,
    pub failed: usize,
    /// Mean over completed runs.
    pub mean_accuracy: Option<f64>,
    pub ended_correctly_rate: Option<f64>,
    /// Sum over completed, priced runs.
    pub total_cost: f64,
    pub unpriced: usize,
}

/// Aggregates per (provider, model) in first-seen order. Failed runs only count towards `failed`.
pub fn summarize(results: &[RunResult]) -> Vec<ProviderSummary> {
    let mut summaries: Vec<ProviderSummary> = Vec::new();
    let mut accuracy_sums: Vec<f64> = Vec::new();
    let mut ended_counts: Vec<usize> = Vec::new();

    for result in results {
        let index = match summaries
            .iter()
            .position(|s| s.provider == result.provider && s.model == result.model)
        {
            Some(index) => index,
            None => {
                summaries.push(ProviderSummary {
                    provider: result.provider.clone(),
                    model: result.model.clone(),
                    completed: 0,
                    failed: 0,
                    mean_accuracy: None,
                    ended_correctly_rate: None,
                    total_cost: 0.0,
                    unpriced: 0,
                });
                accuracy_sums.push(0.0);
                ended_counts.push(0);
                summaries.len() - 1
            }
        };

        let summary = &mut summaries[index];
        match result.completed() {
            Some(run) => {
                summary.completed += 1;
                accuracy_sums[index] += run.evaluation.tool_accuracy;
                if run.evaluation.ended_correctly {
                    ended_counts[index] += 1;
                }
                match run.cost {
                    Some(cost) => summary.total_cost += cost,
                    None => summary.unpriced += 1,
                }
            }
            None => summary.failed += 1,
        }
    }

    for (index, summary) in summaries.iter_mut().enumerate() {
        if summary.completed > 0 {
            let n = summary.completed as f64;
            summary.mean_accuracy = Some(accuracy_sums[index] / n);
            summary.ended_correctly_rate = Some(ended_counts[index] as f64 / n);
        }
    }

    summaries
}

/// Writes `<provider>_results.json` per provider plus `summary.jsonl`; returns the written paths.
pub fn write_outputs(out_dir: &Path, results: &[RunResult]) -> Result<Vec<PathBuf>, ReportError> {
    fs::create_dir_all(out_dir)?;
    let mut written = Vec::new();

    let mut providers: Vec<&str> = Vec::new();
    for result in results {
        if !providers.contains(&result.provider.as_str()) {
            providers.push(&result.provider);
        }
    }

    for provider in providers {
        let traces: Vec<Vec<TraceEntry>> = results
            .iter()
            .filter(|r| r.provider == provider)
            .map(trace_entries)
            .collect();
        let path = out_dir.join(format!("{}_results.json", file_stem(provider)));
        fs::write(&path, serde_json::to_string_pretty(&traces)?)?;
        written.push(path);
    }

    let summary_path = out_dir.join("summary.jsonl");
    write_jsonl(&summary_path, results)?;
    written.push(summary_path);

    Ok(written)
}

pub fn write_jsonl(path: &Path, results: &[RunResult]) -> Result<(), ReportError> {
    let mut writer = BufWriter::new(fs::File::create(path)?);
    for result in results {
        serde_json::to_writer(&mut writer, result)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}

fn file_stem(provider: &str) -> String {
    provider
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

pub fn format_run_line(result: &RunResult) -> String {
    let head = format!(
        "[{}] {} ({})",
        result.scenario_id, result.provider, result.model
    );
    match &result.outcome {
        RunOutcome::Completed(run) => {
            let tools: Vec<&str> = run.tool_calls.iter().map(|c| c.name.as_str()).collect();
            let cost = match (run.cost, run.pricing_error.as_deref()) {
                (Some(cost), _) => format!("${cost:.6}"),
                (None, Some(err)) => format!("unpriced ({err})"),
                (None, None) => "unpriced".to_string(),
            };
            format!(
                "{head}: {} tool calls [{}], accuracy {:.2} (listed {:.2}), ended correctly: {}, cost {cost}",
                tools.len(),
                tools.join(", "),
                run.evaluation.tool_accuracy,
                run.evaluation.listed_accuracy,
                run.evaluation.ended_correctly,
            )
        }
        RunOutcome::Failed { kind, message } => format!("{head}: FAILED {kind}: {message}"),
    }
}

pub fn format_summary_line(summary: &ProviderSummary) -> String {
    let accuracy = summary
        .mean_accuracy
        .map(|a| format!("{a:.3}"))
        .unwrap_or_else(|| "n/a".to_string());
    let ended = summary
        .ended_correctly_rate
        .map(|r| format!("{:.0}%", r * 100.0))
        .unwrap_or_else(|| "n/a".to_string());
    let mut line = format!(
        "Provider: {}, Model: {}, Completed: {}, Failed: {}, Mean accuracy: {accuracy}, Ended correctly: {ended}, Total cost: ${:.6}",
        summary.provider, summary.model, summary.completed, summary.failed, summary.total_cost
    );
    if summary.unpriced > 0 {
        line.push_str(&format!(" ({} unpriced)", summary.unpriced));
    }
    line
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn completed(provider: &str, accuracy: f64, ended: bool, cost: Option<f64>) -> RunResult {
        RunResult {
            scenario_id: "shop".into(),
            level: Some(Level::Easy),
            provider: provider.into(),
            model: format!("{provider}-model"),
            started_at: Utc::now(),
            elapsed_ms: 12,
            outcome: RunOutcome::Completed(CompletedRun {
                tool_calls: vec![ToolCallRecord {
                    id: "call_0_0".into(),
                    name: "navigate_to_url".into(),
                    arguments: json!({"url": "https://example.com/shop"}),
                    schema_valid: true,
                    schema_errors: Vec::new(),
                    is_error: false,
                }],
                final_text: Some("done".into()),
                termination: Termination::FinalAnswer,
                narration: Vec::new(),
                usage: TokenUsage::new(100, 10),
                turns: 2,
                cost,
                pricing_error: cost.is_none().then(|| "no pricing configured".to_string()),
                evaluation: Evaluation {
                    tool_accuracy: accuracy,
                    listed_accuracy: accuracy,
                    ended_correctly: ended,
                },
            }),
        }
    }

    fn failed(provider: &str) -> RunResult {
        RunResult {
            outcome: RunOutcome::Failed {
                kind: FailureKind::UnknownTool,
                message: "model requested unknown tool `find_selector`".into(),
            },
            ..completed(provider, 0.0, false, None)
        }
    }

    #[test]
    fn trace_matches_persisted_shape() {
        let traces = trace_entries(&completed("groq", 1.0, true, Some(0.1)));
        assert_eq!(
            serde_json::to_value(&traces).unwrap(),
            json!([
                {"type": "tool_use", "name": "navigate_to_url", "input": {"url": "https://example.com/shop"}},
                "done"
            ])
        );
        assert_eq!(
            serde_json::to_value(trace_entries(&failed("groq"))).unwrap(),
            json!([null])
        );
    }

    #[test]
    fn summary_excludes_failed_runs_from_means() {
        let results = vec![
            completed("openai", 1.0, true, Some(0.25)),
            completed("openai", 0.5, false, None),
            failed("openai"),
            completed("anthropic", 0.25, true, Some(0.5)),
        ];
        let summaries = summarize(&results);
        assert_eq!(summaries.len(), 2);

        let openai = &summaries[0];
        assert_eq!(openai.provider, "openai");
        assert_eq!(openai.completed, 2);
        assert_eq!(openai.failed, 1);
        assert_eq!(openai.mean_accuracy, Some(0.75));
        assert_eq!(openai.ended_correctly_rate, Some(0.5));
        assert_eq!(openai.total_cost, 0.25);
        assert_eq!(openai.unpriced, 1);

        let only_failed = summarize(&[failed("gemini")]);
        assert_eq!(only_failed[0].mean_accuracy, None);
    }

    #[test]
    fn run_lines_show_cost_or_failure() {
        let line = format_run_line(&completed("openai", 1.0, true, Some(0.0123456789)));
        assert!(line.contains("$0.012346"), "{line}");
        assert!(line.contains("[navigate_to_url]"), "{line}");
        assert!(line.contains("accuracy 1.00 (listed 1.00)"), "{line}");

        let line = format_run_line(&failed("openai"));
        assert!(line.contains("FAILED unknown_tool"), "{line}");
    }

    #[test]
    fn outputs_are_written_per_provider() {
        let dir = tempfile::tempdir().unwrap();
        let results = vec![
            completed("openai", 1.0, true, Some(0.25)),
            failed("openai"),
            completed("anthropic", 0.25, true, Some(0.5)),
        ];
        let written = write_outputs(dir.path(), &results).unwrap();
        assert_eq!(written.len(), 3);

        let openai: Vec<Vec<TraceEntry>> = serde_json::from_str(
            &fs::read_to_string(dir.path().join("openai_results.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(openai.len(), 2);
        assert_eq!(openai[1], vec![TraceEntry::Final(None)]);

        let summary = fs::read_to_string(dir.path().join("summary.jsonl")).unwrap();
        let lines: Vec<RunResult> = summary
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[1].failure(), Some(FailureKind::UnknownTool));
        assert!(lines[2].completed().is_some());
    }
}
