// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! tmux backed sessions

use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::TmuxConfig;
use crate::env::Environment;
use crate::error::ErrorKind;
use crate::procs::SessionManager;
use crate::session::{SessionName, SessionSpec};
use crate::Error;

/// Runs each session as a detached tmux session
#[derive(Clone, Debug)]
pub struct Tmux {
    program: PathBuf,
    socket_name: Option<String>,
}

impl Tmux {
    pub fn new(config: &TmuxConfig) -> Self {
        Self {
            program: config.program.clone(),
            socket_name: config.socket_name.clone(),
        }
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        if let Some(socket_name) = &self.socket_name {
            command.arg("-L").arg(socket_name);
        }
        command.stdin(Stdio::null());
        command
    }

    async fn run(&self, args: &[&str]) -> Result<Output, Error> {
        debug!(tmux = %self.program.display(), ?args, "running tmux");
        let output = self.command().args(args).output().await?;
        Ok(output)
    }

    /// Arguments to `tmux new-session` for `spec`
    pub fn new_session_args(
        spec: &SessionSpec,
        env: &Environment,
        work_dir: &Path,
    ) -> Vec<String> {
        vec![
            "new-session".to_string(),
            "-d".to_string(),
            "-s".to_string(),
            spec.name().to_string(),
            "-c".to_string(),
            work_dir.to_string_lossy().into_owned(),
            shell_command(spec, env),
        ]
    }
}

/// The shell command tmux runs for `spec`
///
/// tmux hands the command to its default shell, and a running server ignores the environment
///   of the client, so the variables are set with `env(1)` in front of the program.
pub fn shell_command(spec: &SessionSpec, env: &Environment) -> String {
    let mut words: Vec<String> = vec!["exec".to_string()];
    if !env.is_empty() {
        words.push("env".to_string());
        words.extend(env.to_env_args());
    }
    words.extend(spec.command_line().into_iter().map(str::to_string));

    words
        .into_iter()
        .map(|w| shell_escape::unix::escape(Cow::Owned(w)).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

/// An exact match target, otherwise tmux matches on prefixes
fn target(name: &SessionName) -> String {
    format!("={}", name)
}

fn no_server(output: &Output) -> bool {
    let stderr = String::from_utf8_lossy(&output.stderr);
    stderr.contains("no server running") || stderr.contains("error connecting to")
}

fn failure(action: &str, output: &Output) -> Error {
    let stderr = String::from_utf8_lossy(&output.stderr);
    ErrorKind::SessionManager(format!(
        "tmux {} failed ({}): {}",
        action,
        output.status,
        stderr.trim()
    ))
    .into()
}

#[async_trait]
impl SessionManager for Tmux {
    async fn has_session(&self, name: &SessionName) -> Result<bool, Error> {
        let output = self.run(&["has-session", "-t", &target(name)]).await?;
        Ok(output.status.success())
    }

    async fn new_session(
        &self,
        spec: &SessionSpec,
        env: &Environment,
        work_dir: &Path,
    ) -> Result<(), Error> {
        let args = Self::new_session_args(spec, env, work_dir);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();

        let output = self.run(&args).await?;
        if !output.status.success() {
            return Err(failure("new-session", &output));
        }

        info!(session = %spec.name(), "started tmux session");
        Ok(())
    }

    async fn list_sessions(&self) -> Result<Vec<String>, Error> {
        let output = self.run(&["list-sessions", "-F", "#{session_name}"]).await?;
        if !output.status.success() {
            if no_server(&output) {
                return Ok(Vec::new());
            }
            return Err(failure("list-sessions", &output));
        }

        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn kill_session(&self, name: &SessionName) -> Result<(), Error> {
        let output = self.run(&["kill-session", "-t", &target(name)]).await?;
        if !output.status.success() {
            return Err(failure("kill-session", &output));
        }

        info!(session = %name, "killed tmux session");
        Ok(())
    }
}
