// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::Error;

pub const REFEEDER: &str = "Refeeder";
pub const DATABASE_SNAPSHOTER: &str = "DatabaseSnapshoter";
pub const STRUCTURES_SNAPSHOTER: &str = "StructuresSnapshoter";

/// Interpreter used for the default worker entry points
pub const DEFAULT_INTERPRETER: &str = "python3";

/// A name usable as a tmux session name, and as a log file stem
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionName(String);

impl SessionName {
    pub fn new(name: impl Into<String>) -> Result<Self, Error> {
        let name = name.into();

        // tmux treats ':' and '.' as target separators
        let valid = !name.is_empty()
            && !name
                .chars()
                .any(|c| c == ':' || c == '.' || c == '/' || c.is_whitespace() || c.is_control());

        if valid {
            Ok(Self(name))
        } else {
            Err(ErrorKind::InvalidSessionName(name).into())
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SessionName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// When a supervised worker is started again after it exits
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    Never,
    OnFailure,
    Always,
}

impl RestartPolicy {
    pub fn should_restart(self, success: bool) -> bool {
        match self {
            Self::Never => false,
            Self::OnFailure => !success,
            Self::Always => true,
        }
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::OnFailure
    }
}

/// A named worker and the command line that runs it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionSpec {
    name: SessionName,
    program: String,
    args: Vec<String>,
    restart: RestartPolicy,
}

impl SessionSpec {
    pub fn new(name: SessionName, program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name,
            program: program.into(),
            args,
            restart: RestartPolicy::default(),
        }
    }

    /// Builds a spec from a full command line, `command[0]` being the program
    pub fn from_command(name: &str, command: &[String]) -> Result<Self, Error> {
        let name = SessionName::new(name)?;
        let (program, args) = command
            .split_first()
            .ok_or_else(|| Error::from(format!("session {} has an empty command", name)))?;

        if program.is_empty() {
            return Err(format!("session {} has an empty program", name).into());
        }

        Ok(Self::new(name, program.clone(), args.to_vec()))
    }

    pub fn with_restart(mut self, restart: RestartPolicy) -> Self {
        self.restart = restart;
        self
    }

    pub fn name(&self) -> &SessionName {
        &self.name
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn restart(&self) -> RestartPolicy {
        self.restart
    }

    /// Program followed by its arguments
    pub fn command_line(&self) -> Vec<&str> {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect()
    }
}

/// The Refeeder and the two Snapshoters, in launch order
pub fn default_sessions() -> Vec<SessionSpec> {
    [
        (REFEEDER, "src/Refeeder/Refeeder.py"),
        (DATABASE_SNAPSHOTER, "src/Snapshoters/DatabaseSnapshoter.py"),
        (STRUCTURES_SNAPSHOTER, "src/Snapshoters/StructuresSnapshoter.py"),
    ]
    .iter()
    .map(|(name, entry_point)| SessionSpec {
        name: SessionName((*name).to_string()),
        program: DEFAULT_INTERPRETER.to_string(),
        args: vec![(*entry_point).to_string()],
        restart: RestartPolicy::default(),
    })
    .collect()
}

/// Session names must be unique within one launch
pub fn check_unique(sessions: &[SessionSpec]) -> Result<(), Error> {
    let mut seen = HashSet::with_capacity(sessions.len());
    for spec in sessions {
        if !seen.insert(spec.name()) {
            return Err(ErrorKind::DuplicateSession(spec.name().to_string()).into());
        }
    }

    Ok(())
}
