// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use tracing::{error, info, warn};

use crate::env::Environment;
use crate::procs::SessionManager;
use crate::session::{self, SessionName, SessionSpec};
use crate::Error;

/// What to do when a session with the same name already exists
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CollisionPolicy {
    /// Leave the existing session alone and report it as already running
    Skip,
    /// Kill the existing session and start a new one
    Replace,
}

impl Default for CollisionPolicy {
    fn default() -> Self {
        Self::Skip
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionOutcome {
    Started,
    AlreadyRunning,
    Failed(String),
}

impl fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Started => write!(f, "started"),
            Self::AlreadyRunning => write!(f, "already running"),
            Self::Failed(e) => write!(f, "failed: {}", e),
        }
    }
}

/// Outcome of each requested session, in request order
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LaunchReport {
    pub outcomes: Vec<(SessionName, SessionOutcome)>,
}

impl LaunchReport {
    /// True when no spawn request failed
    pub fn is_success(&self) -> bool {
        self.outcomes
            .iter()
            .all(|(_, outcome)| !matches!(outcome, SessionOutcome::Failed(_)))
    }

    pub fn outcome(&self, name: &str) -> Option<&SessionOutcome> {
        self.outcomes
            .iter()
            .find(|(n, _)| n.as_str() == name)
            .map(|(_, outcome)| outcome)
    }
}

impl fmt::Display for LaunchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, outcome) in &self.outcomes {
            writeln!(f, "{}: {}", name, outcome)?;
        }
        Ok(())
    }
}

/// Launch programs
///
/// Rules:
/// - load the environment setup file first, nothing is started if that fails
/// - request every session, in order, even after one has failed
/// - never wait on the programs running inside the sessions
pub struct Launcher<M> {
    manager: M,
    sessions: Vec<SessionSpec>,
    env_file: PathBuf,
    work_dir: PathBuf,
    collision: CollisionPolicy,
}

impl<M: SessionManager> Launcher<M> {
    pub fn new(
        manager: M,
        sessions: Vec<SessionSpec>,
        env_file: PathBuf,
        work_dir: PathBuf,
    ) -> Result<Self, Error> {
        session::check_unique(&sessions)?;

        Ok(Self {
            manager,
            sessions,
            env_file,
            work_dir,
            collision: CollisionPolicy::default(),
        })
    }

    pub fn with_collision_policy(mut self, collision: CollisionPolicy) -> Self {
        self.collision = collision;
        self
    }

    pub fn manager(&self) -> &M {
        &self.manager
    }

    pub fn env_file(&self) -> &Path {
        &self.env_file
    }

    /// Loads the environment, then requests every session
    ///
    /// `base` is the environment the setup file's references are resolved against, normally
    ///   a snapshot of the launcher's own environment.
    pub async fn launch(&self, base: &HashMap<String, String>) -> Result<LaunchReport, Error> {
        let env = Environment::load(&self.env_file, base)?;
        info!(
            env_file = %self.env_file.display(),
            work_dir = %self.work_dir.display(),
            sessions = self.sessions.len(),
            "launching sessions"
        );

        let mut report = LaunchReport::default();
        for spec in &self.sessions {
            let outcome = self.start_session(spec, &env).await;
            match &outcome {
                SessionOutcome::Started => info!(session = %spec.name(), "session started"),
                SessionOutcome::AlreadyRunning => {
                    warn!(session = %spec.name(), "session already exists, skipped")
                }
                SessionOutcome::Failed(e) => {
                    error!(session = %spec.name(), "session failed to start: {}", e)
                }
            }
            report.outcomes.push((spec.name().clone(), outcome));
        }

        Ok(report)
    }

    async fn start_session(&self, spec: &SessionSpec, env: &Environment) -> SessionOutcome {
        let exists = match self.manager.has_session(spec.name()).await {
            Ok(exists) => exists,
            Err(e) => return SessionOutcome::Failed(e.to_string()),
        };

        if exists {
            match self.collision {
                CollisionPolicy::Skip => return SessionOutcome::AlreadyRunning,
                CollisionPolicy::Replace => {
                    info!(session = %spec.name(), "replacing existing session");
                    if let Err(e) = self.manager.kill_session(spec.name()).await {
                        return SessionOutcome::Failed(e.to_string());
                    }
                }
            }
        }

        match self.manager.new_session(spec, env, &self.work_dir).await {
            Ok(()) => SessionOutcome::Started,
            Err(e) => SessionOutcome::Failed(e.to_string()),
        }
    }
}
