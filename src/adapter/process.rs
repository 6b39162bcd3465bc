//! Child-process plumbing shared by both transports.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use super::{AdapterDescriptor, AdapterHealth};

const STDERR_TAIL_BYTES: usize = 4096;

/// Spawn the descriptor's child with a scrubbed environment: the child
/// inherits exactly the variables the descriptor names.
pub(super) fn spawn_child(
    descriptor: &AdapterDescriptor,
    working_dir: &Path,
    extra_args: &[String],
    capture_stdout: bool,
) -> std::io::Result<Child> {
    let mut command = Command::new(&descriptor.command);
    command
        .args(&descriptor.args)
        .args(extra_args)
        .current_dir(working_dir)
        .env_clear()
        .envs(&descriptor.env)
        .stdin(Stdio::null())
        .stdout(if capture_stdout {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = command.spawn()?;
    debug!(
        agent_id = %descriptor.agent_id,
        command = %descriptor.command,
        pid = child.id(),
        "Spawned agent child"
    );
    Ok(child)
}

/// Terminate a child: SIGTERM first, SIGKILL after the grace period, and
/// always reap before returning.
pub(super) async fn terminate_child(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // Safety: plain signal send to a pid we own.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        if tokio::time::timeout(grace, child.wait()).await.is_ok() {
            return;
        }
        warn!(pid, "Child ignored SIGTERM, escalating to SIGKILL");
    }

    let _ = child.start_kill();
    let _ = child.wait().await;
}

/// Keep the child's stderr drained so a chatty child cannot block on a
/// full pipe; only the tail is retained for failure classification.
pub(super) fn drain_stderr(child: &mut Child) -> tokio::task::JoinHandle<String> {
    let stderr = child.stderr.take();
    tokio::spawn(async move {
        let Some(mut stderr) = stderr else {
            return String::new();
        };
        let mut tail: Vec<u8> = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            match stderr.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    tail.extend_from_slice(&buf[..n]);
                    if tail.len() > STDERR_TAIL_BYTES {
                        let cut = tail.len() - STDERR_TAIL_BYTES;
                        tail.drain(..cut);
                    }
                }
            }
        }
        String::from_utf8_lossy(&tail).into_owned()
    })
}

/// Non-destructive readiness probe: run the CLI with `--version` under a
/// short deadline.
pub(super) async fn probe_version(
    command: &str,
    env: &BTreeMap<String, String>,
    deadline: Duration,
) -> AdapterHealth {
    let mut probe = Command::new(command);
    probe
        .arg("--version")
        .env_clear()
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    match tokio::time::timeout(deadline, probe.output()).await {
        Ok(Ok(output)) if output.status.success() => {
            let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
            AdapterHealth::healthy(version)
        }
        Ok(Ok(output)) => AdapterHealth::unhealthy(format!(
            "probe exit {}: {}",
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stderr).trim()
        )),
        Ok(Err(err)) => AdapterHealth::unhealthy(format!("probe spawn failed: {}", err)),
        Err(_) => AdapterHealth::unhealthy(format!("probe timed out after {:?}", deadline)),
    }
}
