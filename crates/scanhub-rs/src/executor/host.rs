use std::{process::Stdio, time::Duration};

use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::Command,
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, warn};

use super::{ExecError, ExecOutput, Invocation, ProcessExecutor};

/// Runs the scanner binary directly on this host.
///
/// `image` and `limits` are not applied; isolation is whatever the host provides.
pub struct HostExecutor {
    grace: Duration,
}

impl HostExecutor {
    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }
}

#[async_trait::async_trait]
impl ProcessExecutor for HostExecutor {
    fn name(&self) -> &'static str {
        "host"
    }

    async fn run(&self, invocation: Invocation) -> Result<ExecOutput, ExecError> {
        let tool = invocation.tool;
        debug!(%tool, program = %invocation.program, args = ?invocation.args, "spawning host process");

        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command
            .spawn()
            .map_err(|e| ExecError::io(tool, format!("failed to spawn {}", invocation.program), e))?;
        let group = ProcessGroup::new(child.id());

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        match timeout(invocation.timeout, child.wait()).await {
            Ok(Ok(status)) => {
                // Leftover background processes would hold the pipes open.
                group.kill();
                let mut output = collect(stdout, self.grace).await;
                output.extend(collect(stderr, self.grace).await);
                Ok(ExecOutput {
                    exit_code: status.code().map(i64::from),
                    output,
                })
            }
            Ok(Err(e)) => {
                stdout.abort();
                stderr.abort();
                Err(ExecError::io(tool, "failed waiting for process", e))
            }
            Err(_) => {
                warn!(%tool, pid = ?child.id(), "deadline reached, killing process group");
                group.kill();
                if let Err(e) = child.start_kill() {
                    debug!(%tool, error = %e, "direct kill after group kill");
                }
                if timeout(self.grace, child.wait()).await.is_err() {
                    warn!(%tool, "process not reaped within grace period");
                }
                stdout.abort();
                stderr.abort();
                Err(ExecError::Timeout {
                    tool,
                    timeout: invocation.timeout,
                })
            }
        }
    }
}

/// The child's process group; every member is killed on drop.
///
/// The child leads its own group, so anything it forks is reached as well.
struct ProcessGroup {
    pgid: Option<u32>,
}

impl ProcessGroup {
    fn new(pgid: Option<u32>) -> Self {
        Self { pgid }
    }

    fn kill(&self) {
        let Some(pgid) = self.pgid else {
            return;
        };
        if let Err(e) = kill_group(pgid) {
            warn!(pgid, error = %e, "failed to kill process group");
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(unix)]
fn kill_group(pgid: u32) -> std::io::Result<()> {
    use nix::{
        errno::Errno,
        sys::signal::{killpg, Signal},
        unistd::Pid,
    };

    let raw = i32::try_from(pgid)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pgid out of range"))?;
    match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(not(unix))]
fn kill_group(_pgid: u32) -> std::io::Result<()> {
    Ok(())
}

fn drain<R>(reader: Option<R>) -> JoinHandle<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut reader) = reader {
            let _ = reader.read_to_end(&mut buf).await;
        }
        buf
    })
}

async fn collect(handle: JoinHandle<Vec<u8>>, grace: Duration) -> Vec<u8> {
    match timeout(grace, handle).await {
        Ok(Ok(buf)) => buf,
        _ => Vec::new(),
    }
}
