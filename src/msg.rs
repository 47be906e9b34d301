// Copyright 2019 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Messages exchanged over the control socket
//!
//! Each frame is a big-endian `u32` length followed by that many bytes of bincode.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::procs::WorkerStatus;
use crate::Error;

/// Frames larger than this are rejected without being read
pub const MAX_MESSAGE_LEN: u32 = 1 << 20;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    Status,
    Start(String),
    Stop(String),
    Restart(String),
    Shutdown,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Status(Vec<WorkerStatus>),
    Ok,
    Error(String),
}

pub async fn send_msg<W, T>(writer: &mut W, msg: &T) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = bincode::serialize(msg)?;
    let len = u32::try_from(bytes.len())
        .ok()
        .filter(|len| *len <= MAX_MESSAGE_LEN)
        .ok_or_else(|| Error::from(format!("message of {} bytes is too large", bytes.len())))?;

    writer.write_u32(len).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn recv_msg<R, T>(reader: &mut R) -> Result<T, Error>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = reader.read_u32().await?;
    if len > MAX_MESSAGE_LEN {
        return Err(format!("message of {} bytes is too large", len).into());
    }

    let mut buf = vec![0_u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(bincode::deserialize(&buf)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::procs::WorkerState;

    #[tokio::test]
    async fn test_status_response_over_stream() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let response = Response::Status(vec![
            WorkerStatus {
                name: "Refeeder".to_string(),
                state: WorkerState::Running { pid: 4242 },
                restarts: 0,
            },
            WorkerStatus {
                name: "DatabaseSnapshoter".to_string(),
                state: WorkerState::Backoff {
                    attempt: 2,
                    delay_ms: 1000,
                },
                restarts: 1,
            },
        ]);

        send_msg(&mut server, &response).await.unwrap();
        send_msg(&mut server, &Response::Ok).await.unwrap();

        assert_eq!(recv_msg::<_, Response>(&mut client).await.unwrap(), response);
        assert_eq!(recv_msg::<_, Response>(&mut client).await.unwrap(), Response::Ok);
    }

    #[tokio::test]
    async fn test_rejects_oversized_frame() {
        let (mut client, mut server) = tokio::io::duplex(64);
        server.write_u32(MAX_MESSAGE_LEN + 1).await.unwrap();

        assert!(recv_msg::<_, Request>(&mut client).await.is_err());
    }

    #[tokio::test]
    async fn test_truncated_frame() {
        let (mut client, mut server) = tokio::io::duplex(64);
        server.write_u32(16).await.unwrap();
        server.write_all(b"short").await.unwrap();
        drop(server);

        assert!(recv_msg::<_, Request>(&mut client).await.is_err());
    }
}
