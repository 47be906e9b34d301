// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::env::Environment;
use crate::session::SessionSpec;
use crate::Error;

pub struct StdIoConf {
    pub stdin: Stdio,
    pub stderr: Stdio,
    pub stdout: Stdio,
}

impl StdIoConf {
    /// Workers get no input, output is captured for the logger
    pub fn captured() -> Self {
        Self {
            stdin: Stdio::null(),
            stderr: Stdio::piped(),
            stdout: Stdio::piped(),
        }
    }
}

/// Spawns the worker described by `spec` in its own process group
pub fn spawn_worker(
    spec: &SessionSpec,
    env: &Environment,
    work_dir: &Path,
    stdio: StdIoConf,
) -> Result<Child, Error> {
    let mut command = std::process::Command::new(spec.program());
    command
        .args(spec.args())
        .current_dir(work_dir)
        .process_group(0)
        .stdin(stdio.stdin)
        .stdout(stdio.stdout)
        .stderr(stdio.stderr);

    let mut command = Command::from(command);
    command.kill_on_drop(true);
    env.apply(&mut command);

    let child = command
        .spawn()
        .map_err(|e| Error::from(format!("failed to spawn {}: {}", spec.name(), e)))?;

    debug!(session = %spec.name(), pid = ?child.id(), "spawned worker");
    Ok(child)
}

/// Asks the worker's process group to exit, killing it once `timeout` has passed
pub async fn terminate(child: &mut Child, timeout: Duration) -> Result<ExitStatus, Error> {
    let pid = match child.id() {
        Some(pid) => pid,
        // already reaped
        None => return Ok(child.wait().await?),
    };
    let group = Pid::from_raw(pid as i32);

    if let Err(e) = killpg(group, Signal::SIGTERM) {
        debug!(pid, "SIGTERM failed: {}", e);
    }

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => Ok(status?),
        Err(_) => {
            warn!(pid, "worker ignored SIGTERM, killing");
            killpg(group, Signal::SIGKILL).ok();
            child.kill().await.ok();
            Ok(child.wait().await?)
        }
    }
}

/// Exit code and terminating signal, at most one of which is set
pub fn exit_parts(status: &ExitStatus) -> (Option<i32>, Option<i32>) {
    (status.code(), status.signal())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn sh(script: &str) -> SessionSpec {
        SessionSpec::from_command("sh", &["sh".to_string(), "-c".to_string(), script.to_string()])
            .unwrap()
    }

    #[tokio::test]
    async fn test_spawn_applies_env_and_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = Environment::parse("export GREETING=hello\n", &HashMap::new()).unwrap();
        let spec = sh("test \"$GREETING\" = hello && test \"$(pwd -P)\" = \"$EXPECTED\"");
        env.set(
            "EXPECTED",
            dir.path().canonicalize().unwrap().to_string_lossy().into_owned(),
        );

        let mut child = spawn_worker(&spec, &env, dir.path(), StdIoConf::captured()).unwrap();
        let status = child.wait().await.unwrap();
        assert!(status.success());
    }

    #[tokio::test]
    async fn test_spawn_missing_program() {
        let spec = SessionSpec::from_command("w", &["/nonexistent/worker".to_string()]).unwrap();
        let dir = tempfile::tempdir().unwrap();

        assert!(
            spawn_worker(&spec, &Environment::default(), dir.path(), StdIoConf::captured())
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_terminate() {
        let dir = tempfile::tempdir().unwrap();
        let mut child = spawn_worker(
            &sh("sleep 30"),
            &Environment::default(),
            dir.path(),
            StdIoConf::captured(),
        )
        .unwrap();

        let status = terminate(&mut child, Duration::from_secs(5)).await.unwrap();
        assert_eq!(exit_parts(&status), (None, Some(Signal::SIGTERM as i32)));
    }

    #[tokio::test]
    async fn test_terminate_escalates() {
        let dir = tempfile::tempdir().unwrap();
        let mut child = spawn_worker(
            &sh("trap '' TERM; while true; do sleep 1; done"),
            &Environment::default(),
            dir.path(),
            StdIoConf::captured(),
        )
        .unwrap();
        // give the shell time to install the trap
        tokio::time::sleep(Duration::from_millis(500)).await;

        let status = terminate(&mut child, Duration::from_millis(200)).await.unwrap();
        assert_eq!(status.signal(), Some(Signal::SIGKILL as i32));
    }
}
