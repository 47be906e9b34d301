// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Launch manifest
//!
//! Everything here is optional, an absent manifest launches the three default workers. Relative
//!   paths are resolved against the directory containing the manifest.
//!
//! ```toml
//! env_file = "../../set_pythonpath.sh"
//!
//! [supervisor]
//! max_restarts = 10
//! log_dir = "/var/log/snapshoters"
//!
//! [[session]]
//! name = "Refeeder"
//! command = ["python3", "src/Refeeder/Refeeder.py"]
//! restart = "always"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::session::{self, RestartPolicy, SessionSpec};
use crate::Error;

/// Setup file location relative to the executable's directory
pub const DEFAULT_ENV_FILE: &str = "../../set_pythonpath.sh";

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub env_file: Option<PathBuf>,
    pub working_dir: Option<PathBuf>,
    pub tmux: TmuxConfig,
    pub supervisor: SupervisorConfig,
    #[serde(rename = "session")]
    pub sessions: Vec<SessionConfig>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct TmuxConfig {
    pub program: PathBuf,
    /// Passed as `tmux -L`, selects a separate tmux server
    pub socket_name: Option<String>,
}

impl Default for TmuxConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("tmux"),
            socket_name: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SupervisorConfig {
    pub socket: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub max_restarts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub reset_after_secs: u64,
    pub stop_timeout_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            socket: None,
            log_dir: None,
            max_restarts: 5,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            reset_after_secs: 60,
            stop_timeout_ms: 5_000,
        }
    }
}

impl SupervisorConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn reset_after(&self) -> Duration {
        Duration::from_secs(self.reset_after_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    pub name: String,
    pub command: Vec<String>,
    #[serde(default)]
    pub restart: RestartPolicy,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let source = std::fs::read_to_string(path)?;
        let mut config = Self::parse(&source)?;

        if let Some(dir) = path.parent() {
            config.make_relative_to(dir);
        }
        Ok(config)
    }

    pub fn parse(source: &str) -> Result<Self, Error> {
        Ok(toml::from_str(source)?)
    }

    fn make_relative_to(&mut self, dir: &Path) {
        let paths = [
            &mut self.env_file,
            &mut self.working_dir,
            &mut self.supervisor.socket,
            &mut self.supervisor.log_dir,
        ];

        for path in paths.into_iter().flatten() {
            if path.is_relative() {
                *path = dir.join(&*path);
            }
        }
    }

    /// The configured sessions, or the three default workers when none are listed
    pub fn sessions(&self) -> Result<Vec<SessionSpec>, Error> {
        let sessions = if self.sessions.is_empty() {
            session::default_sessions()
        } else {
            self.sessions
                .iter()
                .map(|s| {
                    SessionSpec::from_command(&s.name, &s.command)
                        .map(|spec| spec.with_restart(s.restart))
                })
                .collect::<Result<Vec<_>, Error>>()?
        };

        session::check_unique(&sessions)?;
        Ok(sessions)
    }

    /// The environment setup file, defaulting to `../../set_pythonpath.sh` from `own_dir`
    pub fn env_file(&self, own_dir: &Path) -> PathBuf {
        self.env_file
            .clone()
            .unwrap_or_else(|| own_dir.join(DEFAULT_ENV_FILE))
    }

    /// Working directory for the workers, defaulting to the directory holding the setup file
    pub fn working_dir(&self, env_file: &Path) -> PathBuf {
        if let Some(dir) = &self.working_dir {
            return dir.clone();
        }

        match env_file.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.sessions().unwrap(), session::default_sessions());
        assert_eq!(config.supervisor.max_restarts, 5);
        assert_eq!(config.tmux.program, PathBuf::from("tmux"));

        let env_file = config.env_file(Path::new("/opt/sc/scripts/services"));
        assert_eq!(
            env_file,
            PathBuf::from("/opt/sc/scripts/services/../../set_pythonpath.sh")
        );
        assert_eq!(
            config.working_dir(&env_file),
            PathBuf::from("/opt/sc/scripts/services/../..")
        );
    }

    #[test]
    fn test_sessions_from_manifest() {
        let config = Config::parse(
            r#"
            [tmux]
            socket_name = "snapshoters"

            [supervisor]
            max_restarts = 0
            backoff_base_ms = 10

            [[session]]
            name = "Refeeder"
            command = ["python3", "-u", "src/Refeeder/Refeeder.py"]
            restart = "always"

            [[session]]
            name = "Other"
            command = ["sleep", "60"]
            "#,
        )
        .unwrap();

        assert_eq!(config.tmux.socket_name.as_deref(), Some("snapshoters"));
        assert_eq!(config.supervisor.max_restarts, 0);
        assert_eq!(config.supervisor.backoff_base(), Duration::from_millis(10));
        assert_eq!(config.supervisor.backoff_max(), Duration::from_secs(30));

        let sessions = config.sessions().unwrap();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].restart(), RestartPolicy::Always);
        assert_eq!(sessions[0].args(), &["-u", "src/Refeeder/Refeeder.py"]);
        assert_eq!(sessions[1].restart(), RestartPolicy::OnFailure);
    }

    #[test]
    fn test_rejects_unknown_fields() {
        let err = Config::parse("[supervisor]\nretries = 3\n").unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::TomlError(_)));
    }

    #[test]
    fn test_rejects_duplicate_sessions() {
        let config = Config::parse(
            r#"
            [[session]]
            name = "A"
            command = ["true"]

            [[session]]
            name = "A"
            command = ["false"]
            "#,
        )
        .unwrap();

        assert!(matches!(
            config.sessions().unwrap_err().kind(),
            ErrorKind::DuplicateSession(_)
        ));
    }

    #[test]
    fn test_load_resolves_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshoterc.toml");
        std::fs::write(
            &path,
            "env_file = \"env.sh\"\nworking_dir = \"/srv/sc\"\n[supervisor]\nlog_dir = \"logs\"\n",
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.env_file, Some(dir.path().join("env.sh")));
        assert_eq!(config.working_dir, Some(PathBuf::from("/srv/sc")));
        assert_eq!(config.supervisor.log_dir, Some(dir.path().join("logs")));
        assert_eq!(config.env_file(Path::new("/ignored")), dir.path().join("env.sh"));
    }
}
