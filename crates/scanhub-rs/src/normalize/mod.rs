//! Mapping of tool-native results onto the common [`NewFinding`] shape.

use std::fmt::Display;

use crate::models::{NewFinding, Severity, Tool};

/// Maps a tool-native severity label onto [`Severity`].
///
/// Labels outside the table become `Info`; an unknown label is never promoted.
pub fn severity_from_native(label: &str) -> Severity {
    match label.trim().to_ascii_lowercase().as_str() {
        "info" | "informational" | "unknown" => Severity::Info,
        "low" => Severity::Low,
        "medium" => Severity::Medium,
        "high" => Severity::High,
        "critical" => Severity::Critical,
        _ => Severity::Info,
    }
}

/// First `max_chars` characters of `raw`, cut on a char boundary.
pub fn excerpt(raw: &str, max_chars: usize) -> String {
    match raw.char_indices().nth(max_chars) {
        Some((idx, _)) => raw[..idx].to_string(),
        None => raw.to_string(),
    }
}

impl NewFinding {
    pub fn info(title: impl Into<String>) -> Self {
        Self::new(Severity::Info, title)
    }

    pub fn new(severity: Severity, title: impl Into<String>) -> Self {
        Self {
            severity,
            title: title.into(),
            description: None,
            evidence: None,
            recommendation: None,
        }
    }

    pub fn description(mut self, text: impl Into<String>) -> Self {
        self.description = Some(text.into());
        self
    }

    pub fn evidence(mut self, text: impl Into<String>) -> Self {
        self.evidence = Some(text.into());
        self
    }

    pub fn recommendation(mut self, text: impl Into<String>) -> Self {
        self.recommendation = Some(text.into());
        self
    }
}

/// The single INFO finding a tool degrades to when it could not produce results.
pub fn tool_error(tool: Tool, cause: &dyn Display, recommendation: &str) -> NewFinding {
    let cause = cause.to_string();
    NewFinding::info(format!("{tool} Scan Error"))
        .description(format!("Error executing {tool} scan: {cause}"))
        .evidence(cause)
        .recommendation(recommendation)
}
