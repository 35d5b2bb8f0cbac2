use std::{process::Output, time::Duration};

use tokio::{process::Command, time::timeout};
use tracing::{debug, error, info, warn};

use super::{ExecError, ExecOutput, Invocation, ProcessExecutor};
use crate::models::Tool;

/// Launches each invocation as a detached container through the `docker` CLI.
pub struct DockerExecutor {
    bin: String,
    host: String,
    grace: Duration,
}

impl DockerExecutor {
    pub fn new(bin: String, host: String, grace: Duration) -> Self {
        Self { bin, host, grace }
    }

    fn command(&self) -> Command {
        docker_command(&self.bin, &self.host)
    }

    async fn docker(&self, tool: Tool, args: &[&str]) -> Result<Output, ExecError> {
        self.command()
            .args(args)
            .output()
            .await
            .map_err(|e| ExecError::io(tool, format!("docker {} failed", args[0]), e))
    }

    async fn start(&self, invocation: &Invocation) -> Result<String, ExecError> {
        let args = run_args(invocation);
        debug!(tool = %invocation.tool, ?args, "starting container");
        let out = self
            .command()
            .args(&args)
            .output()
            .await
            .map_err(|e| ExecError::io(invocation.tool, "docker run failed", e))?;

        if !out.status.success() {
            return Err(ExecError::execution(
                invocation.tool,
                format!(
                    "docker run exited with {}: {}",
                    out.status,
                    String::from_utf8_lossy(&out.stderr).trim()
                ),
            ));
        }

        let id = String::from_utf8_lossy(&out.stdout).trim().to_string();
        if id.is_empty() {
            return Err(ExecError::execution(
                invocation.tool,
                "docker run returned no container id",
            ));
        }
        Ok(id)
    }

    async fn finish(&self, tool: Tool, id: &str, waited: Output) -> Result<ExecOutput, ExecError> {
        if !waited.status.success() {
            return Err(ExecError::execution(
                tool,
                format!(
                    "docker wait failed: {}",
                    String::from_utf8_lossy(&waited.stderr).trim()
                ),
            ));
        }
        let exit_code = String::from_utf8_lossy(&waited.stdout).trim().parse().ok();

        let logs = self.docker(tool, &["logs", id]).await?;
        if !logs.status.success() {
            return Err(ExecError::execution(
                tool,
                format!(
                    "docker logs failed: {}",
                    String::from_utf8_lossy(&logs.stderr).trim()
                ),
            ));
        }

        let mut output = logs.stdout;
        output.extend(logs.stderr);
        Ok(ExecOutput { exit_code, output })
    }

    async fn stop(&self, tool: Tool, id: &str) {
        let grace = self.grace.as_secs().to_string();
        let bound = self.grace + Duration::from_secs(5);
        match timeout(bound, self.docker(tool, &["stop", "-t", &grace, id])).await {
            Ok(Ok(out)) if out.status.success() => {}
            Ok(Ok(out)) => warn!(%tool, container = id, status = %out.status, "docker stop failed"),
            Ok(Err(e)) => warn!(%tool, container = id, error = %e, "docker stop failed"),
            Err(_) => warn!(%tool, container = id, "docker stop exceeded grace period"),
        }
    }

    async fn remove(&self, tool: Tool, mut guard: ContainerGuard) {
        match self.docker(tool, &["rm", "-f", &guard.id]).await {
            Ok(out) if out.status.success() => guard.disarm(),
            Ok(out) => error!(
                %tool,
                container = %guard.id,
                stderr = %String::from_utf8_lossy(&out.stderr).trim(),
                "container removal failed"
            ),
            Err(e) => error!(%tool, container = %guard.id, error = %e, "container removal failed"),
        }
    }
}

#[async_trait::async_trait]
impl ProcessExecutor for DockerExecutor {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn run(&self, invocation: Invocation) -> Result<ExecOutput, ExecError> {
        let tool = invocation.tool;
        let id = self.start(&invocation).await?;
        let guard = ContainerGuard::new(&self.bin, &self.host, id.clone());
        info!(%tool, container = %id, timeout_secs = invocation.timeout.as_secs(), "container started");

        let result = match timeout(invocation.timeout, self.docker(tool, &["wait", &id])).await {
            Ok(Ok(waited)) => self.finish(tool, &id, waited).await,
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!(%tool, container = %id, "deadline reached, stopping container");
                self.stop(tool, &id).await;
                Err(ExecError::Timeout {
                    tool,
                    timeout: invocation.timeout,
                })
            }
        };

        self.remove(tool, guard).await;
        result
    }
}

fn docker_command(bin: &str, host: &str) -> Command {
    let mut cmd = Command::new(bin);
    cmd.arg("--host").arg(host).kill_on_drop(true);
    cmd
}

/// Arguments of the detached `docker run` for an invocation.
pub(crate) fn run_args(invocation: &Invocation) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "-d".to_string(),
        "--network".to_string(),
        "host".to_string(),
        "--memory".to_string(),
        invocation.limits.memory.clone(),
    ];
    if let Some(cpus) = invocation.limits.cpus {
        args.push("--cpus".to_string());
        args.push(cpus.to_string());
    }
    args.extend([
        "--label".to_string(),
        format!("scanhub.tool={}", invocation.tool),
        "--entrypoint".to_string(),
        invocation.program.clone(),
        invocation.image.clone(),
    ]);
    args.extend(invocation.args.iter().cloned());
    args
}

/// Owns a started container until it has been removed.
///
/// If the owning future is dropped before the explicit removal ran, the
/// container is force-removed from a background task.
struct ContainerGuard {
    bin: String,
    host: String,
    id: String,
    armed: bool,
}

impl ContainerGuard {
    fn new(bin: &str, host: &str, id: String) -> Self {
        Self {
            bin: bin.to_string(),
            host: host.to_string(),
            id,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        warn!(container = %self.id, "container not reclaimed, forcing removal");
        let mut cmd = docker_command(&self.bin, &self.host);
        cmd.args(["rm", "-f", self.id.as_str()]);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let _ = cmd.output().await;
                });
            }
            Err(_) => {
                let _ = std::process::Command::new(&self.bin)
                    .args(["--host", self.host.as_str(), "rm", "-f", self.id.as_str()])
                    .status();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ResourceLimits;

    fn invocation(cpus: Option<f64>) -> Invocation {
        Invocation {
            tool: Tool::Sslyze,
            image: "nablac0d3/sslyze:latest".to_string(),
            program: "sslyze".to_string(),
            args: vec!["--json_out".into(), "-".into(), "example.com".into()],
            timeout: Duration::from_secs(120),
            limits: ResourceLimits {
                memory: "512m".to_string(),
                cpus,
            },
        }
    }

    #[test]
    fn run_args_are_detached_and_bounded() {
        let args = run_args(&invocation(Some(0.5)));
        assert_eq!(&args[..2], ["run", "-d"]);
        let joined = args.join(" ");
        assert!(joined.contains("--memory 512m"));
        assert!(joined.contains("--cpus 0.5"));
        assert!(joined.contains("--network host"));
        assert!(!args.iter().any(|a| a == "--rm"), "logs are read after exit");
        assert!(joined.ends_with("--entrypoint sslyze nablac0d3/sslyze:latest --json_out - example.com"));
    }

    #[test]
    fn run_args_skip_cpus_when_unbounded() {
        let args = run_args(&invocation(None));
        assert!(!args.iter().any(|a| a == "--cpus"));
    }

    /// Fake `docker` binary that appends each call (minus `--host`) to `calls.log`.
    #[cfg(unix)]
    fn stub_docker(dir: &std::path::Path, wait_body: &str) -> (String, std::path::PathBuf) {
        use std::os::unix::fs::PermissionsExt;

        let log = dir.join("calls.log");
        let bin = dir.join("docker");
        let script = format!(
            "#!/bin/sh\nshift 2\necho \"$*\" >> '{log}'\ncase \"$1\" in\n  run) echo c0ffee ;;\n  wait) {wait_body} ;;\n  logs) echo scan-out; echo scan-err >&2 ;;\nesac\n",
            log = log.display(),
        );
        std::fs::write(&bin, script).expect("write stub");
        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).expect("chmod stub");
        (bin.display().to_string(), log)
    }

    fn calls(log: &std::path::Path) -> Vec<String> {
        std::fs::read_to_string(log)
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    fn timed(timeout: Duration) -> Invocation {
        Invocation {
            timeout,
            ..invocation(Some(0.5))
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn completed_container_is_logged_then_removed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (bin, log) = stub_docker(dir.path(), "echo 2");
        let exec = DockerExecutor::new(bin, "unix:///stub.sock".to_string(), Duration::from_secs(1));

        let out = exec.run(timed(Duration::from_secs(10))).await.expect("run should succeed");

        assert_eq!(out.exit_code, Some(2));
        assert_eq!(out.text(), "scan-out\nscan-err\n");
        let calls = calls(&log);
        assert_eq!(calls.len(), 4, "{calls:?}");
        assert!(calls[0].starts_with("run -d --network host --memory 512m --cpus 0.5"));
        assert_eq!(&calls[1..], ["wait c0ffee", "logs c0ffee", "rm -f c0ffee"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_stops_then_removes_container() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (bin, log) = stub_docker(dir.path(), "exec sleep 30");
        let grace = Duration::from_secs(1);
        let exec = DockerExecutor::new(bin, "unix:///stub.sock".to_string(), grace);
        let deadline = Duration::from_millis(300);
        let started = std::time::Instant::now();

        let err = exec.run(timed(deadline)).await.expect_err("wait must time out");

        assert!(matches!(err, ExecError::Timeout { tool: Tool::Sslyze, .. }));
        assert!(started.elapsed() < deadline + grace + Duration::from_secs(2));
        let calls = calls(&log);
        assert_eq!(
            &calls[1..],
            ["wait c0ffee", "stop -t 1 c0ffee", "rm -f c0ffee"],
            "{calls:?}"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn dropped_run_still_removes_container() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (bin, log) = stub_docker(dir.path(), "exec sleep 30");
        let exec = DockerExecutor::new(bin, "unix:///stub.sock".to_string(), Duration::from_secs(1));

        let cancelled =
            tokio::time::timeout(Duration::from_millis(300), exec.run(timed(Duration::from_secs(60)))).await;
        assert!(cancelled.is_err(), "run should still be waiting");

        let removed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if calls(&log).iter().any(|c| c == "rm -f c0ffee") {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert!(removed.is_ok(), "container left behind: {:?}", calls(&log));
        assert!(!calls(&log).iter().any(|c| c.starts_with("logs")));
    }

    #[tokio::test]
    async fn unreachable_docker_binary_is_execution_error() {
        let exec = DockerExecutor::new(
            "scanhub-no-such-docker".to_string(),
            "unix:///nonexistent.sock".to_string(),
            Duration::from_secs(1),
        );
        let err = exec
            .run(invocation(None))
            .await
            .expect_err("start should fail");
        assert!(matches!(err, ExecError::Execution { tool: Tool::Sslyze, .. }));
    }
}
