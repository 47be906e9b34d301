// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::session::SessionName;
use crate::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        })
    }
}

/// Receives the output of one worker.
///
/// Rules:
///  - every line becomes a tracing event tagged with the session name
///  - when a log directory is configured, lines are also appended to `<log_dir>/<name>.log`
///  - restarts of the worker share the same log file
#[derive(Clone, Debug)]
pub struct Logger {
    name: SessionName,
    file: Option<Arc<Mutex<File>>>,
}

impl Logger {
    pub async fn open(name: SessionName, log_dir: Option<&Path>) -> Result<Self, Error> {
        let file = match log_dir {
            Some(dir) => {
                tokio::fs::create_dir_all(dir).await?;
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(Self::log_path(dir, &name))
                    .await?;
                Some(Arc::new(Mutex::new(file)))
            }
            None => None,
        };

        Ok(Self { name, file })
    }

    pub fn log_path(dir: &Path, name: &SessionName) -> PathBuf {
        dir.join(format!("{}.log", name))
    }

    /// Forwards every line read from `reader` until it reaches EOF
    pub fn capture<R>(&self, stream: Stream, reader: R) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let logger = self.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => logger.log_line(stream, &line).await,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(session = %logger.name, %stream, "failed to read output: {}", e);
                        break;
                    }
                }
            }
        })
    }

    async fn log_line(&self, stream: Stream, line: &str) {
        info!(target: "snapshoterc::worker", session = %self.name, %stream, "{}", line);

        if let Some(file) = &self.file {
            let record = format!("[{}] {}\n", stream, line);
            let mut file = file.lock().await;
            let written = match file.write_all(record.as_bytes()).await {
                Ok(()) => file.flush().await,
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                warn!(session = %self.name, "failed to write log file: {}", e);
            }
        }
    }
}
