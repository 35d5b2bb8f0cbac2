//! Process Executor: runs one scanner invocation as an isolated, resource-bounded
//! process with a hard deadline, and always reclaims the process afterwards.

mod docker;
mod host;

use std::{sync::Arc, time::Duration};

use thiserror::Error;

pub use docker::DockerExecutor;
pub use host::HostExecutor;

use crate::{
    config::{AppConfig, ExecutorKind},
    models::Tool,
};

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceLimits {
    /// Memory ceiling in container notation, e.g. `512m` or `2g`.
    pub memory: String,
    /// CPU share; `None` leaves the container unbounded.
    pub cpus: Option<f64>,
}

/// Everything needed to launch one tool against one target.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub tool: Tool,
    pub image: String,
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
    pub limits: ResourceLimits,
}

#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub exit_code: Option<i64>,
    /// Standard output followed by standard error.
    pub output: Vec<u8>,
}

impl ExecOutput {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("execution timeout: {tool} did not finish within {timeout:?}")]
    Timeout { tool: Tool, timeout: Duration },

    #[error("{tool} execution error: {message}")]
    Execution {
        tool: Tool,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },
}

impl ExecError {
    pub(crate) fn execution(tool: Tool, message: impl Into<String>) -> Self {
        Self::Execution {
            tool,
            message: message.into(),
            source: None,
        }
    }

    pub(crate) fn io(tool: Tool, message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Execution {
            tool,
            message: format!("{}: {source}", message.into()),
            source: Some(source),
        }
    }
}

#[async_trait::async_trait]
pub trait ProcessExecutor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Runs the invocation to completion or until its deadline.
    ///
    /// Returns only after the underlying process has been stopped and reclaimed.
    async fn run(&self, invocation: Invocation) -> Result<ExecOutput, ExecError>;
}

pub fn from_config(cfg: &AppConfig) -> Arc<dyn ProcessExecutor> {
    match cfg.executor {
        ExecutorKind::Docker => Arc::new(DockerExecutor::new(
            cfg.docker_bin.clone(),
            cfg.docker_host.clone(),
            cfg.stop_grace(),
        )),
        ExecutorKind::Host => Arc::new(HostExecutor::new(cfg.stop_grace())),
    }
}

#[cfg(test)]
pub mod testing {
    use std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
    };

    use super::*;

    #[derive(Debug, Clone)]
    pub enum Scripted {
        Output(i64, String),
        Timeout,
        Fail(String),
    }

    /// Executor that answers from a per-tool script and records what it was asked to run.
    #[derive(Default)]
    pub struct ScriptedExecutor {
        script: HashMap<Tool, Scripted>,
        calls: AtomicUsize,
        seen: Mutex<Vec<Invocation>>,
    }

    impl ScriptedExecutor {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with(mut self, tool: Tool, reply: Scripted) -> Self {
            self.script.insert(tool, reply);
            self
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub fn invocations(&self) -> Vec<Invocation> {
            self.seen.lock().map(|v| v.clone()).unwrap_or_default()
        }
    }

    #[async_trait::async_trait]
    impl ProcessExecutor for ScriptedExecutor {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn run(&self, invocation: Invocation) -> Result<ExecOutput, ExecError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let tool = invocation.tool;
            let timeout = invocation.timeout;
            if let Ok(mut seen) = self.seen.lock() {
                seen.push(invocation);
            }
            match self.script.get(&tool).cloned() {
                Some(Scripted::Output(code, text)) => Ok(ExecOutput {
                    exit_code: Some(code),
                    output: text.into_bytes(),
                }),
                Some(Scripted::Timeout) => Err(ExecError::Timeout { tool, timeout }),
                Some(Scripted::Fail(msg)) => Err(ExecError::execution(tool, msg)),
                None => Ok(ExecOutput::default()),
            }
        }
    }
}
