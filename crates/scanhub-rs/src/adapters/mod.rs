mod nuclei;
mod sslyze;
mod zap;

use std::{collections::HashMap, sync::Arc, time::Duration};

use tracing::{debug, warn};

pub use nuclei::NucleiAdapter;
pub use sslyze::SslyzeAdapter;
pub use zap::ZapAdapter;

use crate::{
    config::AppConfig,
    executor::{ExecOutput, Invocation, ProcessExecutor, ResourceLimits},
    models::{NewFinding, Tool},
    normalize::tool_error,
};

/// Image, deadline and resource ceiling of one tool.
#[derive(Debug, Clone)]
pub struct ToolSettings {
    pub image: String,
    pub timeout: Duration,
    pub limits: ResourceLimits,
}

impl ToolSettings {
    fn invocation(&self, tool: Tool, program: &str, args: Vec<String>) -> Invocation {
        Invocation {
            tool,
            image: self.image.clone(),
            program: program.to_string(),
            args,
            timeout: self.timeout,
            limits: self.limits.clone(),
        }
    }
}

#[async_trait::async_trait]
pub trait ScannerAdapter: Send + Sync {
    fn tool(&self) -> Tool;

    fn executor(&self) -> &dyn ProcessExecutor;

    /// Builds the tool invocation, or the finding explaining why the target cannot be scanned.
    fn build_invocation(&self, target_url: &str) -> Result<Invocation, NewFinding>;

    /// Normalizes captured output. `Err` carries the reason the output is unusable.
    fn parse_output(&self, target_url: &str, output: &ExecOutput)
        -> Result<Vec<NewFinding>, String>;

    fn error_recommendation(&self) -> &'static str;

    /// Runs the tool against `target_url`.
    ///
    /// Never fails: any error degrades to a single INFO finding describing it.
    async fn scan(&self, target_url: &str) -> Vec<NewFinding> {
        let tool = self.tool();
        let invocation = match self.build_invocation(target_url) {
            Ok(invocation) => invocation,
            Err(finding) => {
                warn!(%tool, target = target_url, "target not scannable");
                return vec![finding];
            }
        };

        match self.executor().run(invocation).await {
            Ok(output) => match self.parse_output(target_url, &output) {
                Ok(findings) => {
                    debug!(%tool, findings = findings.len(), "output normalized");
                    findings
                }
                Err(reason) => {
                    warn!(%tool, %reason, "unusable scanner output");
                    vec![tool_error(tool, &reason, self.error_recommendation())]
                }
            },
            Err(e) => {
                warn!(%tool, error = %e, "scanner execution failed");
                vec![tool_error(tool, &e, self.error_recommendation())]
            }
        }
    }
}

/// Adapters keyed by tool name.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn ScannerAdapter>>,
}

impl AdapterRegistry {
    pub fn from_config(cfg: &AppConfig, executor: Arc<dyn ProcessExecutor>) -> Self {
        let mut registry = Self::default();
        registry.register(Arc::new(ZapAdapter::new(
            ToolSettings {
                image: cfg.zap_image.clone(),
                timeout: Duration::from_secs(cfg.zap_timeout_secs),
                limits: ResourceLimits {
                    memory: "2g".to_string(),
                    cpus: Some(0.5),
                },
            },
            executor.clone(),
        )));
        registry.register(Arc::new(NucleiAdapter::new(
            ToolSettings {
                image: cfg.nuclei_image.clone(),
                timeout: Duration::from_secs(cfg.nuclei_timeout_secs),
                limits: ResourceLimits {
                    memory: "1g".to_string(),
                    cpus: Some(1.0),
                },
            },
            cfg.nuclei_rate_limit,
            executor.clone(),
        )));
        registry.register(Arc::new(SslyzeAdapter::new(
            ToolSettings {
                image: cfg.sslyze_image.clone(),
                timeout: Duration::from_secs(cfg.sslyze_timeout_secs),
                limits: ResourceLimits {
                    memory: "512m".to_string(),
                    cpus: Some(0.5),
                },
            },
            executor,
        )));
        registry
    }

    pub fn register(&mut self, adapter: Arc<dyn ScannerAdapter>) {
        self.adapters.insert(adapter.tool().name().to_string(), adapter);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ScannerAdapter>> {
        self.adapters.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::testing::ScriptedExecutor;

    #[test]
    fn registry_resolves_every_tool_by_name() {
        let registry =
            AdapterRegistry::from_config(&AppConfig::default(), Arc::new(ScriptedExecutor::new()));
        for tool in Tool::ALL {
            let adapter = registry.get(tool.name()).expect("adapter registered");
            assert_eq!(adapter.tool(), tool);
        }
        assert!(registry.get("Nikto").is_none());
        assert!(registry.get("nuclei").is_none());
    }

    #[test]
    fn per_tool_timeouts_come_from_config() {
        let cfg = AppConfig {
            zap_timeout_secs: 11,
            nuclei_timeout_secs: 22,
            sslyze_timeout_secs: 33,
            ..AppConfig::default()
        };
        let registry = AdapterRegistry::from_config(&cfg, Arc::new(ScriptedExecutor::new()));
        let timeout = |name: &str| {
            registry
                .get(name)
                .and_then(|a| a.build_invocation("https://example.com/").ok())
                .map(|i| i.timeout.as_secs())
        };
        assert_eq!(timeout("ZAP"), Some(11));
        assert_eq!(timeout("Nuclei"), Some(22));
        assert_eq!(timeout("SSLyze"), Some(33));
    }
}
