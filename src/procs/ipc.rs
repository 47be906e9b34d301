// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Inter-process communication for the supervisor.
//!
//! Receives requests from a `Leader` over the control socket and applies them to the workers.
//!
//! Rules:
//!  - one request and one response per connection
//!  - connections are served concurrently, an idle client never blocks another
//!  - a bad connection is logged and dropped, it never stops the supervisor

use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::net::UnixStream;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::control::ControlListener;
use crate::msg::{recv_msg, send_msg, Request, Response};
use crate::procs::Supervisor;
use crate::Error;

/// Time a client has to send its request after connecting
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Accepts connections until accepting fails
pub async fn serve(
    listener: &ControlListener,
    supervisor: &Supervisor,
    shutdown: &Notify,
) -> Result<(), Error> {
    let mut connections = FuturesUnordered::new();

    loop {
        tokio::select! {
            stream = listener.accept() => {
                connections.push(handle_connection(stream?, supervisor, shutdown));
            }
            Some(()) = connections.next(), if !connections.is_empty() => {}
        }
    }
}

async fn handle_connection(mut stream: UnixStream, supervisor: &Supervisor, shutdown: &Notify) {
    let request: Request = match tokio::time::timeout(REQUEST_TIMEOUT, recv_msg(&mut stream)).await
    {
        Ok(Ok(request)) => request,
        Ok(Err(e)) => {
            warn!("bad control request: {}", e);
            return;
        }
        Err(_) => {
            warn!("control client sent no request within {:?}", REQUEST_TIMEOUT);
            return;
        }
    };

    debug!(?request, "control request");
    let response = handle_request(supervisor, shutdown, request).await;

    if let Err(e) = send_msg(&mut stream, &response).await {
        warn!("failed to send control response: {}", e);
    }
}

pub async fn handle_request(
    supervisor: &Supervisor,
    shutdown: &Notify,
    request: Request,
) -> Response {
    let result = match request {
        Request::Status => return Response::Status(supervisor.status()),
        Request::Start(name) => supervisor.start_session(&name).await,
        Request::Stop(name) => supervisor.stop_session(&name).await,
        Request::Restart(name) => supervisor.restart_session(&name).await,
        Request::Shutdown => {
            shutdown.notify_one();
            Ok(())
        }
    };

    match result {
        Ok(()) => Response::Ok,
        Err(e) => Response::Error(e.to_string()),
    }
}
