// Copyright 2019 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::path::{Path, PathBuf};

use nix::unistd::getuid;
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, warn};

use crate::Error;

pub const SOCKET_NAME: &str = "snapshoterc.sock";

/// `$XDG_RUNTIME_DIR/snapshoterc.sock`, or a per-user socket in `/tmp`
pub fn default_socket_path() -> PathBuf {
    match std::env::var_os("XDG_RUNTIME_DIR") {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir).join(SOCKET_NAME),
        _ => PathBuf::from(format!("/tmp/snapshoterc-{}.sock", getuid())),
    }
}

/// The supervisor's end of the control socket, the socket file is removed on drop
#[derive(Debug)]
pub struct ControlListener {
    listener: UnixListener,
    path: PathBuf,
}

impl ControlListener {
    /// Binds `path`, replacing a stale socket left by a supervisor that is no longer running
    pub async fn bind(path: &Path) -> Result<Self, Error> {
        if path.symlink_metadata().is_ok() {
            if UnixStream::connect(path).await.is_ok() {
                return Err(format!(
                    "a supervisor is already listening on {}",
                    path.display()
                )
                .into());
            }

            warn!(socket = %path.display(), "removing stale control socket");
            std::fs::remove_file(path)?;
        }

        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }

        let listener = UnixListener::bind(path)?;
        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    pub async fn accept(&self) -> Result<UnixStream, Error> {
        let (stream, _) = self.listener.accept().await?;
        Ok(stream)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ControlListener {
    fn drop(&mut self) {
        debug!(socket = %self.path.display(), "removing control socket");
        std::fs::remove_file(&self.path)
            .map_err(|e| warn!("error removing {}: {}", self.path.display(), e))
            .ok();
    }
}

pub async fn connect(path: &Path) -> Result<UnixStream, Error> {
    UnixStream::connect(path).await.map_err(|e| {
        Error::from(format!(
            "failed to connect to supervisor at {}: {}",
            path.display(),
            e
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_replaces_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run").join(SOCKET_NAME);

        let listener = ControlListener::bind(&path).await.unwrap();
        assert!(ControlListener::bind(&path).await.is_err());

        // a socket file nobody listens on
        let stale = std::os::unix::net::UnixListener::bind(dir.path().join("stale.sock")).unwrap();
        drop(stale);
        let stale_path = dir.path().join("stale.sock");
        assert!(stale_path.exists());
        let replaced = ControlListener::bind(&stale_path).await.unwrap();

        drop(listener);
        assert!(!path.exists());
        drop(replaced);
        assert!(!stale_path.exists());
    }

    #[tokio::test]
    async fn test_connect_without_supervisor() {
        let dir = tempfile::tempdir().unwrap();
        assert!(connect(&dir.path().join(SOCKET_NAME)).await.is_err());
    }
}
