use std::sync::Arc;

use super::{ScannerAdapter, ToolSettings};
use crate::{
    executor::{ExecOutput, Invocation, ProcessExecutor},
    models::{NewFinding, Tool},
    normalize::excerpt,
};

/// zap-baseline exits 0 (pass), 1 (failures) or 2 (warnings); anything above is an error.
const MAX_NORMAL_EXIT: i64 = 2;

/// OWASP ZAP baseline scan. Produces one coarse summary finding per run.
pub struct ZapAdapter {
    settings: ToolSettings,
    executor: Arc<dyn ProcessExecutor>,
}

impl ZapAdapter {
    pub fn new(settings: ToolSettings, executor: Arc<dyn ProcessExecutor>) -> Self {
        Self { settings, executor }
    }
}

#[async_trait::async_trait]
impl ScannerAdapter for ZapAdapter {
    fn tool(&self) -> Tool {
        Tool::Zap
    }

    fn executor(&self) -> &dyn ProcessExecutor {
        self.executor.as_ref()
    }

    fn build_invocation(&self, target_url: &str) -> Result<Invocation, NewFinding> {
        Ok(self.settings.invocation(
            Tool::Zap,
            "zap-baseline.py",
            vec!["-t".to_string(), target_url.to_string(), "-I".to_string()],
        ))
    }

    fn parse_output(
        &self,
        target_url: &str,
        output: &ExecOutput,
    ) -> Result<Vec<NewFinding>, String> {
        let text = output.text();
        match output.exit_code {
            Some(code) if code <= MAX_NORMAL_EXIT => {}
            Some(code) => {
                return Err(format!(
                    "zap-baseline exited with status {code}: {}",
                    excerpt(text.trim(), 500)
                ))
            }
            None => return Err("zap-baseline was terminated by a signal".to_string()),
        }

        Ok(vec![NewFinding::info("ZAP Baseline Scan Completed")
            .description(format!(
                "OWASP ZAP baseline scan completed for {target_url}"
            ))
            .evidence(format!(
                "Scan executed successfully. Container output: {}",
                excerpt(&text, 500)
            ))
            .recommendation("Review the full ZAP report for detailed findings.")])
    }

    fn error_recommendation(&self) -> &'static str {
        "Check ZAP configuration and target accessibility."
    }
}
