//! Normalization of nested analyzer responses.
//!
//! Analyzer containers answer with a deeply nested document
//! (`results.analysis.results.<language>.<tool>`). This module flattens
//! that into one envelope per tool with a fixed status vocabulary, fills
//! placeholder entries for tools that were requested but absent, computes
//! durations from response metadata, truncates oversized issue lists, and
//! optionally strips raw payloads. Everything here is pure; the HTTP side
//! lives in [`crate::analyzers::client`].

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::DEFAULT_RAW_OUTPUT_MAX_ISSUES;

use super::client::RawAnalyzerResponse;

/// Per-tool status vocabulary of the normalized envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    /// Tool ran and reported success.
    Success,
    /// Tool reported non-success but produced issue data.
    Partial,
    /// Tool ran and failed.
    Failed,
    /// Tool exceeded its per-call deadline.
    Timeout,
    /// Tool was requested but absent from the response.
    Missing,
}

impl ToolStatus {
    /// Whether the tool produced a usable report.
    pub fn is_success(&self) -> bool {
        matches!(self, ToolStatus::Success)
    }
}

/// Aggregate status of one analyzer run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every requested tool succeeded.
    Completed,
    /// A mix of success and non-success.
    Partial,
    /// No requested tool succeeded.
    Failed,
}

/// Flattened result for a single tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutcome {
    /// Normalized status.
    pub status: ToolStatus,
    /// Whether the analyzer actually ran the tool.
    pub executed: bool,
    /// Issue count, preserved even when raw payloads are dropped.
    pub total_issues: usize,
    /// Wall-clock attributed to this tool.
    pub duration_seconds: f64,
    /// Issue list, possibly truncated; dropped unless raw outputs are kept.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issues: Option<Vec<Value>>,
    /// Tool-specific metrics object, passed through verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Value>,
    /// Command line the analyzer invoked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_line: Option<String>,
    /// Process exit code, when the analyzer reported one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    /// Captured stdout; dropped unless raw outputs are kept.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    /// Captured stderr; dropped unless raw outputs are kept.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
}

impl ToolOutcome {
    /// Placeholder for a tool requested but absent from the response.
    fn missing() -> Self {
        Self {
            status: ToolStatus::Missing,
            executed: false,
            total_issues: 0,
            duration_seconds: 0.0,
            issues: None,
            metrics: None,
            command_line: None,
            exit_code: None,
            stdout: None,
            stderr: None,
        }
    }
}

/// The envelope handed to task execution and result persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedResult {
    /// Aggregate run status.
    pub status: RunStatus,
    /// Canonical names the caller asked for, in request order.
    pub tools_requested: Vec<String>,
    /// One flattened outcome per requested tool.
    pub tool_results: BTreeMap<String, ToolOutcome>,
    /// Total wall-clock of the analyzer run in seconds.
    pub analysis_duration: f64,
    /// The untouched nested response, kept only when raw outputs are on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_outputs: Option<Value>,
}

impl NormalizedResult {
    /// Whether at least one tool succeeded.
    pub fn any_success(&self) -> bool {
        self.tool_results.values().any(|t| t.status.is_success())
    }
}

/// Knobs for the normalization pass, resolved once per process from the
/// environment and passed down explicitly.
#[derive(Debug, Clone)]
pub struct NormalizeOptions {
    /// Keep issue lists, stdout/stderr and the nested raw document.
    pub full_raw_outputs: bool,
    /// Truncation threshold for per-tool issue arrays.
    pub max_issues: usize,
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self {
            full_raw_outputs: false,
            max_issues: DEFAULT_RAW_OUTPUT_MAX_ISSUES,
        }
    }
}

impl NormalizeOptions {
    /// Builds options from the orchestrator configuration.
    pub fn new(full_raw_outputs: bool, max_issues: usize) -> Self {
        Self {
            full_raw_outputs,
            max_issues,
        }
    }
}

/// Flattens a raw analyzer response into the normalized envelope.
///
/// `elapsed` is the caller-measured wall clock of the request; it is only
/// used when the response metadata does not carry a timestamp pair to
/// compute the delta from.
pub fn normalize(
    requested: &[String],
    raw: &RawAnalyzerResponse,
    elapsed: Duration,
    options: &NormalizeOptions,
) -> NormalizedResult {
    let reports = flatten_reports(&raw.results);
    let total_duration = metadata_duration(&raw.metadata).unwrap_or_else(|| elapsed.as_secs_f64());
    let per_tool_duration = if requested.is_empty() {
        0.0
    } else {
        total_duration / requested.len() as f64
    };

    let mut tool_results = BTreeMap::new();
    for name in requested {
        let outcome = match reports.get(name.as_str()) {
            Some(report) => normalize_report(report, per_tool_duration, options),
            None => ToolOutcome::missing(),
        };
        tool_results.insert(name.clone(), outcome);
    }

    let status = aggregate_status(&tool_results);
    let raw_outputs = if options.full_raw_outputs {
        Some(raw.results.clone())
    } else {
        None
    };

    NormalizedResult {
        status,
        tools_requested: requested.to_vec(),
        tool_results,
        analysis_duration: total_duration,
        raw_outputs,
    }
}

/// Collapses `results.analysis.results.<language>.<tool>` into a flat
/// tool -> report map. Languages are merged; a tool appearing under two
/// languages keeps the last report seen.
fn flatten_reports(results: &Value) -> BTreeMap<String, Value> {
    let mut flat = BTreeMap::new();
    let by_language = results
        .get("analysis")
        .and_then(|v| v.get("results"))
        .and_then(Value::as_object);

    if let Some(languages) = by_language {
        for tools in languages.values() {
            if let Some(tools) = tools.as_object() {
                for (tool, report) in tools {
                    flat.insert(tool.clone(), report.clone());
                }
            }
        }
    }
    flat
}

/// Computes the full-run duration from response metadata, when the
/// analyzer reported both endpoints of the run.
fn metadata_duration(metadata: &Value) -> Option<f64> {
    let finished: DateTime<Utc> = parse_timestamp(metadata.get("timestamp")?)?;
    let started: DateTime<Utc> = parse_timestamp(metadata.get("started_at")?)?;
    let delta = (finished - started).num_milliseconds();
    if delta < 0 {
        return None;
    }
    Some(delta as f64 / 1000.0)
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    let raw = value.as_str()?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Normalizes a single tool report object.
fn normalize_report(report: &Value, duration_seconds: f64, options: &NormalizeOptions) -> ToolOutcome {
    let reported_status = report.get("status").and_then(Value::as_str).unwrap_or("failed");
    let issues = report.get("issues").and_then(Value::as_array).cloned();
    let total_issues = report
        .get("total_issues")
        .and_then(Value::as_u64)
        .map(|n| n as usize)
        .or_else(|| issues.as_ref().map(Vec::len))
        .unwrap_or(0);

    let status = match reported_status {
        "success" | "completed" | "ok" => ToolStatus::Success,
        "timeout" => ToolStatus::Timeout,
        _ if issues.as_ref().is_some_and(|list| !list.is_empty()) => ToolStatus::Partial,
        _ => ToolStatus::Failed,
    };

    let issues = if options.full_raw_outputs {
        issues.map(|list| truncate_issues(list, options.max_issues))
    } else {
        None
    };

    let text_field = |key: &str| {
        if options.full_raw_outputs {
            report.get(key).and_then(Value::as_str).map(str::to_string)
        } else {
            None
        }
    };

    ToolOutcome {
        status,
        executed: true,
        total_issues,
        duration_seconds,
        issues,
        metrics: report.get("metrics").cloned(),
        command_line: report
            .get("command_line")
            .and_then(Value::as_str)
            .map(str::to_string),
        exit_code: report.get("exit_code").and_then(Value::as_i64),
        stdout: text_field("stdout"),
        stderr: text_field("stderr"),
    }
}

/// Truncates an issue list at `max`, appending a sentinel entry that
/// records how many entries were dropped.
fn truncate_issues(issues: Vec<Value>, max: usize) -> Vec<Value> {
    if issues.len() <= max {
        return issues;
    }
    let omitted = issues.len() - max;
    let mut truncated: Vec<Value> = issues.into_iter().take(max).collect();
    truncated.push(serde_json::json!({
        "truncated": true,
        "omitted_count": omitted,
    }));
    truncated
}

/// Aggregates per-tool statuses into the run status.
fn aggregate_status(tool_results: &BTreeMap<String, ToolOutcome>) -> RunStatus {
    if tool_results.is_empty() {
        return RunStatus::Completed;
    }
    let successes = tool_results
        .values()
        .filter(|t| t.status.is_success())
        .count();
    if successes == tool_results.len() {
        RunStatus::Completed
    } else if successes == 0 {
        RunStatus::Failed
    } else {
        RunStatus::Partial
    }
}
