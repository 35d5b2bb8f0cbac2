use std::sync::Arc;

use serde_json::{Map, Value};
use url::{Host, Url};

use super::{ScannerAdapter, ToolSettings};
use crate::{
    executor::{ExecOutput, Invocation, ProcessExecutor},
    models::{NewFinding, Tool},
    normalize::excerpt,
};

/// SSLyze TLS scan; one certificate and one TLS configuration finding per server.
pub struct SslyzeAdapter {
    settings: ToolSettings,
    executor: Arc<dyn ProcessExecutor>,
}

impl SslyzeAdapter {
    pub fn new(settings: ToolSettings, executor: Arc<dyn ProcessExecutor>) -> Self {
        Self { settings, executor }
    }
}

/// Bare hostname of `target_url`, if it has one.
pub fn extract_hostname(target_url: &str) -> Option<String> {
    let url = Url::parse(target_url.trim()).ok()?;
    match url.host()? {
        Host::Domain(domain) if domain.is_empty() => None,
        Host::Domain(domain) => Some(domain.to_string()),
        Host::Ipv4(ip) => Some(ip.to_string()),
        Host::Ipv6(ip) => Some(ip.to_string()),
    }
}

#[async_trait::async_trait]
impl ScannerAdapter for SslyzeAdapter {
    fn tool(&self) -> Tool {
        Tool::Sslyze
    }

    fn executor(&self) -> &dyn ProcessExecutor {
        self.executor.as_ref()
    }

    fn build_invocation(&self, target_url: &str) -> Result<Invocation, NewFinding> {
        let Some(hostname) = extract_hostname(target_url) else {
            return Err(NewFinding::info("SSLyze Scan Error")
                .description(format!("Could not extract hostname from URL: {target_url}"))
                .evidence(target_url)
                .recommendation("Provide a valid hostname or IP address."));
        };
        Ok(self.settings.invocation(
            Tool::Sslyze,
            "sslyze",
            vec!["--json_out".to_string(), "-".to_string(), hostname],
        ))
    }

    fn parse_output(
        &self,
        target_url: &str,
        output: &ExecOutput,
    ) -> Result<Vec<NewFinding>, String> {
        let text = output.text();
        let Some(document) = parse_document(&text) else {
            return Ok(vec![NewFinding::info("SSLyze Scan Completed")
                .description(format!(
                    "SSLyze scan completed. Raw output: {}",
                    excerpt(&text, 500)
                ))
                .evidence(excerpt(&text, 1000))
                .recommendation("Review SSLyze output for detailed TLS/SSL analysis.")]);
        };

        let findings = server_findings(&document);
        if findings.is_empty() {
            return Ok(vec![NewFinding::info("SSLyze Scan Completed")
                .description(format!("SSLyze scan completed for {target_url}"))
                .evidence("No server scan results in output.")
                .recommendation("Review SSLyze configuration.")]);
        }
        Ok(findings)
    }

    fn error_recommendation(&self) -> &'static str {
        "Check SSLyze configuration and target accessibility."
    }
}

/// The JSON document, tolerating log lines around it.
fn parse_document(text: &str) -> Option<Value> {
    if let Ok(doc) = serde_json::from_str::<Value>(text.trim()) {
        return doc.is_object().then_some(doc);
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<Value>(&text[start..=end])
        .ok()
        .filter(Value::is_object)
}

fn server_findings(document: &Value) -> Vec<NewFinding> {
    let Some(servers) = document.get("server_scan_results").and_then(Value::as_array) else {
        return Vec::new();
    };

    let mut findings = Vec::new();
    for server in servers {
        let hostname = server
            .pointer("/server_location/hostname")
            .or_else(|| server.pointer("/server_info/hostname"))
            .and_then(Value::as_str)
            .unwrap_or_default();

        if let Some(cert) = certificate_info(server) {
            findings.push(
                NewFinding::info(format!("SSL Certificate Information for {hostname}"))
                    .description(format!("Certificate details: {}", pretty(cert)))
                    .evidence(cert.to_string())
                    .recommendation("Review certificate validity and configuration."),
            );
        }

        if let Some(tls) = tls_configuration(server) {
            findings.push(
                NewFinding::info(format!("TLS Configuration for {hostname}"))
                    .description(format!("TLS configuration details: {}", pretty(&tls)))
                    .evidence(tls.to_string())
                    .recommendation("Review TLS configuration for security best practices."),
            );
        }
    }
    findings
}

fn certificate_info(server: &Value) -> Option<&Value> {
    server
        .pointer("/scan_result/certificate_info")
        .or_else(|| server.get("certificate_info"))
        .filter(|v| !is_empty(v))
}

fn tls_configuration(server: &Value) -> Option<Value> {
    if let Some(results) = server.get("scan_result").and_then(Value::as_object) {
        let rest: Map<String, Value> = results
            .iter()
            .filter(|(key, _)| key.as_str() != "certificate_info")
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        if !rest.is_empty() {
            return Some(Value::Object(rest));
        }
    }
    server
        .get("scan_commands_results")
        .filter(|v| !is_empty(v))
        .cloned()
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}
