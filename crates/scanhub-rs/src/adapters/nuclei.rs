use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::{ScannerAdapter, ToolSettings};
use crate::{
    executor::{ExecOutput, Invocation, ProcessExecutor},
    models::{NewFinding, Tool},
    normalize::{excerpt, severity_from_native},
};

#[derive(Debug, Deserialize)]
struct NucleiRecord {
    #[serde(default)]
    info: NucleiInfo,
    #[serde(rename = "matched-at", default)]
    matched_at: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct NucleiInfo {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    severity: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    reference: Option<Value>,
}

/// Nuclei template scan; one finding per JSONL result record.
pub struct NucleiAdapter {
    settings: ToolSettings,
    rate_limit: u32,
    executor: Arc<dyn ProcessExecutor>,
}

impl NucleiAdapter {
    pub fn new(settings: ToolSettings, rate_limit: u32, executor: Arc<dyn ProcessExecutor>) -> Self {
        Self {
            settings,
            rate_limit,
            executor,
        }
    }
}

#[async_trait::async_trait]
impl ScannerAdapter for NucleiAdapter {
    fn tool(&self) -> Tool {
        Tool::Nuclei
    }

    fn executor(&self) -> &dyn ProcessExecutor {
        self.executor.as_ref()
    }

    fn build_invocation(&self, target_url: &str) -> Result<Invocation, NewFinding> {
        Ok(self.settings.invocation(
            Tool::Nuclei,
            "nuclei",
            vec![
                "-u".to_string(),
                target_url.to_string(),
                "-jsonl".to_string(),
                "-silent".to_string(),
                "-rate-limit".to_string(),
                self.rate_limit.to_string(),
            ],
        ))
    }

    fn parse_output(
        &self,
        target_url: &str,
        output: &ExecOutput,
    ) -> Result<Vec<NewFinding>, String> {
        let text = output.text();
        let findings = parse_records(&text);

        if !findings.is_empty() {
            return Ok(findings);
        }
        match output.exit_code {
            Some(0) => Ok(vec![NewFinding::info("Nuclei Scan Completed")
                .description(format!("Nuclei scan completed for {target_url}"))
                .evidence("No vulnerabilities found or scan completed without findings.")
                .recommendation("Continue regular security scanning.")]),
            code => Err(format!(
                "nuclei exited with status {}: {}",
                code.map_or_else(|| "signal".to_string(), |c| c.to_string()),
                excerpt(text.trim(), 500)
            )),
        }
    }

    fn error_recommendation(&self) -> &'static str {
        "Check Nuclei configuration and target accessibility."
    }
}

/// Maps every well-formed JSONL record to a finding; other lines are skipped.
fn parse_records(text: &str) -> Vec<NewFinding> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| match serde_json::from_str::<NucleiRecord>(line) {
            Ok(record) => Some(record_to_finding(record)),
            Err(e) => {
                debug!(error = %e, line = %excerpt(line, 120), "skipping non-record line");
                None
            }
        })
        .collect()
}

fn record_to_finding(record: NucleiRecord) -> NewFinding {
    let info = record.info;
    let severity = severity_from_native(info.severity.as_deref().unwrap_or("info"));
    // Evidence is the JSON encoding of `matched-at`, quotes included.
    let evidence = record
        .matched_at
        .unwrap_or_else(|| Value::String(String::new()))
        .to_string();

    NewFinding::new(severity, info.name.unwrap_or_else(|| "Nuclei Finding".to_string()))
        .description(info.description.unwrap_or_default())
        .evidence(evidence)
        .recommendation(format!(
            "Review and remediate: {}",
            reference_text(info.reference.as_ref())
        ))
}

fn reference_text(reference: Option<&Value>) -> String {
    match reference {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        Some(Value::Array(items)) if !items.is_empty() => items
            .iter()
            .map(|v| v.as_str().map_or_else(|| v.to_string(), str::to_string))
            .collect::<Vec<_>>()
            .join(", "),
        _ => "No reference available".to_string(),
    }
}
