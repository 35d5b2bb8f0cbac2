use std::{env, fs, str::FromStr, time::Duration};

use anyhow::Context;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    Docker,
    Host,
}

impl FromStr for ExecutorKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "docker" => Ok(Self::Docker),
            "host" => Ok(Self::Host),
            other => anyhow::bail!("unknown executor kind: {other}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    /// Domain suffixes targets must fall under; empty allows any public domain.
    pub allowed_scan_domains: Vec<String>,
    pub executor: ExecutorKind,
    /// Endpoint of the container host the scanners are launched on.
    pub docker_host: String,
    pub docker_bin: String,
    pub stop_grace_secs: u64,
    pub zap_timeout_secs: u64,
    pub nuclei_timeout_secs: u64,
    pub sslyze_timeout_secs: u64,
    pub nuclei_rate_limit: u32,
    pub zap_image: String,
    pub nuclei_image: String,
    pub sslyze_image: String,
    pub max_concurrent_jobs: usize,
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        let path = env::var("SCANHUB_CONFIG").unwrap_or_else(|_| "config.json".to_string());
        let file_cfg: Option<AppConfig> = fs::read_to_string(&path)
            .ok()
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .with_context(|| format!("failed to parse {path}"))?;

        let mut cfg = file_cfg.unwrap_or_default();
        cfg.apply_env(|key| env::var(key).ok())?;
        Ok(cfg)
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        if let Some(v) = var("SH_HOST") {
            self.host = v;
        }
        if let Some(v) = var("SH_PORT") {
            self.port = v.parse().unwrap_or(self.port);
        }
        if let Some(v) = var("SH_DATABASE_URL") {
            self.database_url = v;
        }
        if let Some(v) = var("SH_ALLOWED_SCAN_DOMAINS") {
            self.allowed_scan_domains = v
                .split(',')
                .map(|s| s.trim().to_ascii_lowercase())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(v) = var("SH_EXECUTOR") {
            self.executor = v.parse()?;
        }
        if let Some(v) = var("SH_DOCKER_HOST") {
            self.docker_host = v;
        }
        if let Some(v) = var("SH_ZAP_TIMEOUT") {
            self.zap_timeout_secs = v.parse().unwrap_or(self.zap_timeout_secs);
        }
        if let Some(v) = var("SH_NUCLEI_TIMEOUT") {
            self.nuclei_timeout_secs = v.parse().unwrap_or(self.nuclei_timeout_secs);
        }
        if let Some(v) = var("SH_SSLYZE_TIMEOUT") {
            self.sslyze_timeout_secs = v.parse().unwrap_or(self.sslyze_timeout_secs);
        }
        if let Some(v) = var("SH_NUCLEI_RATE_LIMIT") {
            self.nuclei_rate_limit = v.parse().unwrap_or(self.nuclei_rate_limit);
        }
        if let Some(v) = var("SH_MAX_CONCURRENT_JOBS") {
            self.max_concurrent_jobs = v.parse().unwrap_or(self.max_concurrent_jobs);
        }
        Ok(())
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            database_url: "sqlite://scanhub.db?mode=rwc".to_string(),
            allowed_scan_domains: Vec::new(),
            executor: ExecutorKind::Docker,
            docker_host: "unix:///var/run/docker.sock".to_string(),
            docker_bin: "docker".to_string(),
            stop_grace_secs: 10,
            zap_timeout_secs: 300,
            nuclei_timeout_secs: 300,
            sslyze_timeout_secs: 120,
            nuclei_rate_limit: 150,
            zap_image: "ghcr.io/zaproxy/zaproxy:stable".to_string(),
            nuclei_image: "projectdiscovery/nuclei:latest".to_string(),
            sslyze_image: "nablac0d3/sslyze:latest".to_string(),
            max_concurrent_jobs: 4,
        }
    }
}
