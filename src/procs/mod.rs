// Copyright 2019 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

pub mod ipc;
mod launcher;
mod leader;
mod logger;
mod supervisor;

pub use launcher::{CollisionPolicy, LaunchReport, Launcher, SessionOutcome};
pub use leader::Leader;
pub use logger::{Logger, Stream};
pub use supervisor::{RestartLimits, Supervisor, WorkerState, WorkerStatus};

use std::path::Path;

use async_trait::async_trait;

use crate::env::Environment;
use crate::session::{SessionName, SessionSpec};
use crate::Error;

/// Something that can keep named, detached sessions running, e.g. tmux
///
/// Creating a session must not wait on the program inside it, only on the manager
///   acknowledging that the session exists.
#[async_trait]
pub trait SessionManager: Send + Sync {
    async fn has_session(&self, name: &SessionName) -> Result<bool, Error>;

    /// Start `spec` in a new detached session, with `env` applied and `work_dir` as the cwd
    async fn new_session(
        &self,
        spec: &SessionSpec,
        env: &Environment,
        work_dir: &Path,
    ) -> Result<(), Error>;

    async fn list_sessions(&self) -> Result<Vec<String>, Error>;

    async fn kill_session(&self, name: &SessionName) -> Result<(), Error>;
}
