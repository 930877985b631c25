//! The `/app/compute/1.0.0` delegation wire format.
//!
//! Frames are `msg_type(u8) · length(u32 BE) · body`. Task and result
//! bodies are JSON; capacity requests carry an empty body and capacity
//! responses a JSON [`Capacity`]. Bodies are copied out of the transport
//! buffer before the stream closes.

use std::io;

use async_trait::async_trait;
use futures::prelude::*;
use libp2p::request_response;
use libp2p::StreamProtocol;
use weft_types::{Capacity, Task, TaskResult};

const TYPE_TASK_REQUEST: u8 = 1;
const TYPE_TASK_RESPONSE: u8 = 2;
const TYPE_CAPACITY: u8 = 3;

/// Upper bound on one compute frame body (task inputs ride inside).
const MAX_BODY_BYTES: usize = 32 << 20;

#[derive(Clone, Debug)]
pub enum ComputeRequest {
    Task(Task),
    Capacity,
}

#[derive(Clone, Debug)]
pub enum ComputeResponse {
    Task(TaskResult),
    Capacity(Capacity),
}

fn frame(msg_type: u8, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(5 + body.len());
    out.push(msg_type);
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(body);
    out
}

async fn read_frame<T>(io: &mut T) -> io::Result<(u8, Vec<u8>)>
where
    T: AsyncRead + Unpin + Send,
{
    let mut head = [0u8; 5];
    io.read_exact(&mut head).await?;
    let msg_type = head[0];
    let len = u32::from_be_bytes([head[1], head[2], head[3], head[4]]) as usize;
    if len > MAX_BODY_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("compute frame body of {len} bytes exceeds cap"),
        ));
    }
    // Copy the body out before the stream is dropped; the transport may
    // recycle its buffers.
    let mut body = vec![0u8; len];
    io.read_exact(&mut body).await?;
    Ok((msg_type, body))
}

fn bad_type(msg_type: u8) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("unexpected compute message type {msg_type}"),
    )
}

/// libp2p request-response codec for compute delegation.
#[derive(Clone, Default)]
pub struct ComputeCodec;

#[async_trait]
impl request_response::Codec for ComputeCodec {
    type Protocol = StreamProtocol;
    type Request = ComputeRequest;
    type Response = ComputeResponse;

    async fn read_request<T>(&mut self, _: &Self::Protocol, io: &mut T) -> io::Result<Self::Request>
    where
        T: AsyncRead + Unpin + Send,
    {
        let (msg_type, body) = read_frame(io).await?;
        match msg_type {
            TYPE_TASK_REQUEST => Ok(ComputeRequest::Task(serde_json::from_slice(&body)?)),
            TYPE_CAPACITY => Ok(ComputeRequest::Capacity),
            other => Err(bad_type(other)),
        }
    }

    async fn read_response<T>(&mut self, _: &Self::Protocol, io: &mut T) -> io::Result<Self::Response>
    where
        T: AsyncRead + Unpin + Send,
    {
        let (msg_type, body) = read_frame(io).await?;
        match msg_type {
            TYPE_TASK_RESPONSE => Ok(ComputeResponse::Task(serde_json::from_slice(&body)?)),
            TYPE_CAPACITY => Ok(ComputeResponse::Capacity(serde_json::from_slice(&body)?)),
            other => Err(bad_type(other)),
        }
    }

    async fn write_request<T>(
        &mut self,
        _: &Self::Protocol,
        io: &mut T,
        req: Self::Request,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        let bytes = match req {
            ComputeRequest::Task(task) => frame(TYPE_TASK_REQUEST, &serde_json::to_vec(&task)?),
            ComputeRequest::Capacity => frame(TYPE_CAPACITY, &[]),
        };
        io.write_all(&bytes).await?;
        io.close().await
    }

    async fn write_response<T>(
        &mut self,
        _: &Self::Protocol,
        io: &mut T,
        resp: Self::Response,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        let bytes = match resp {
            ComputeResponse::Task(result) => frame(TYPE_TASK_RESPONSE, &serde_json::to_vec(&result)?),
            ComputeResponse::Capacity(cap) => frame(TYPE_CAPACITY, &serde_json::to_vec(&cap)?),
        };
        io.write_all(&bytes).await?;
        io.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::io::Cursor;
    use libp2p::StreamProtocol;
    use weft_types::TaskStatus;

    fn task() -> Task {
        Task {
            task_id: "job-1:0".into(),
            parent_job_id: "job-1".into(),
            chunk_index: 0,
            input: vec![1, 2, 3],
            function_name: "process".into(),
            timeout_ms: 5_000,
        }
    }

    #[tokio::test]
    async fn task_request_round_trips() {
        let proto = StreamProtocol::new(crate::COMPUTE_PROTOCOL);
        let mut codec = ComputeCodec;

        let mut buf = Vec::new();
        {
            let mut cursor = Cursor::new(&mut buf);
            codec
                .write_request(&proto, &mut cursor, ComputeRequest::Task(task()))
                .await
                .unwrap();
        }
        assert_eq!(buf[0], TYPE_TASK_REQUEST);

        let mut cursor = Cursor::new(buf.as_slice());
        match codec.read_request(&proto, &mut cursor).await.unwrap() {
            ComputeRequest::Task(decoded) => {
                assert_eq!(decoded.task_id, "job-1:0");
                assert_eq!(decoded.input, vec![1, 2, 3]);
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[tokio::test]
    async fn task_response_round_trips() {
        let proto = StreamProtocol::new(crate::COMPUTE_PROTOCOL);
        let mut codec = ComputeCodec;
        let result = TaskResult::completed("job-1:0".into(), b"out".to_vec(), 3, "w1".into());

        let mut buf = Vec::new();
        {
            let mut cursor = Cursor::new(&mut buf);
            codec
                .write_response(&proto, &mut cursor, ComputeResponse::Task(result))
                .await
                .unwrap();
        }
        // msg_type then big-endian length
        assert_eq!(buf[0], TYPE_TASK_RESPONSE);
        let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
        assert_eq!(len, buf.len() - 5);

        let mut cursor = Cursor::new(buf.as_slice());
        match codec.read_response(&proto, &mut cursor).await.unwrap() {
            ComputeResponse::Task(decoded) => {
                assert_eq!(decoded.status, TaskStatus::Completed);
                assert!(decoded.hash_matches());
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn capacity_round_trips() {
        let proto = StreamProtocol::new(crate::COMPUTE_PROTOCOL);
        let mut codec = ComputeCodec;

        let mut buf = Vec::new();
        {
            let mut cursor = Cursor::new(&mut buf);
            codec
                .write_request(&proto, &mut cursor, ComputeRequest::Capacity)
                .await
                .unwrap();
        }
        let mut cursor = Cursor::new(buf.as_slice());
        assert!(matches!(
            codec.read_request(&proto, &mut cursor).await.unwrap(),
            ComputeRequest::Capacity
        ));
    }

    #[tokio::test]
    async fn unknown_type_is_a_protocol_error() {
        let proto = StreamProtocol::new(crate::COMPUTE_PROTOCOL);
        let mut codec = ComputeCodec;
        let bytes = frame(9, b"{}");
        let mut cursor = Cursor::new(bytes.as_slice());
        let err = codec.read_request(&proto, &mut cursor).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
