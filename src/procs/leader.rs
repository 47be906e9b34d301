// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::path::{Path, PathBuf};

use crate::control;
use crate::msg::{recv_msg, send_msg, Request, Response};
use crate::procs::WorkerStatus;
use crate::Error;

/// Issue commands to a running Supervisor
///
/// Rules:
///   - should be unprivileged
///   - one connection per request
#[derive(Clone, Debug)]
pub struct Leader {
    socket: PathBuf,
}

impl Leader {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
        }
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    pub async fn request(&self, request: &Request) -> Result<Response, Error> {
        let mut stream = control::connect(&self.socket).await?;
        send_msg(&mut stream, request).await?;
        recv_msg(&mut stream).await
    }

    pub async fn status(&self) -> Result<Vec<WorkerStatus>, Error> {
        match self.request(&Request::Status).await? {
            Response::Status(status) => Ok(status),
            Response::Error(e) => Err(e.into()),
            other => Err(format!("unexpected response: {:?}", other).into()),
        }
    }

    pub async fn start(&self, name: &str) -> Result<(), Error> {
        self.expect_ok(&Request::Start(name.to_string())).await
    }

    pub async fn stop(&self, name: &str) -> Result<(), Error> {
        self.expect_ok(&Request::Stop(name.to_string())).await
    }

    pub async fn restart(&self, name: &str) -> Result<(), Error> {
        self.expect_ok(&Request::Restart(name.to_string())).await
    }

    pub async fn shutdown(&self) -> Result<(), Error> {
        self.expect_ok(&Request::Shutdown).await
    }

    async fn expect_ok(&self, request: &Request) -> Result<(), Error> {
        match self.request(request).await? {
            Response::Ok => Ok(()),
            Response::Error(e) => Err(e.into()),
            other => Err(format!("unexpected response: {:?}", other).into()),
        }
    }
}
