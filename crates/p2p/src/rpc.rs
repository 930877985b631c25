//! The `/app/rpc/1.0.0` shard and share wire format.
//!
//! One byte of tag, then a tag-specific big-endian body. The responder
//! writes its reply and closes the stream; an empty reply means "not present
//! locally" and is non-authoritative; callers try another peer.

use std::io;

use async_trait::async_trait;
use futures::prelude::*;
use libp2p::request_response;
use libp2p::StreamProtocol;

use crate::{MAX_SHARD_BYTES, MAX_SHARE_BYTES};

const TAG_GET_SHARD: u8 = 1;
const TAG_GET_SHARE: u8 = 2;
const TAG_STORE_SHARD: u8 = 3;
const TAG_STORE_SHARE: u8 = 4;

/// Longest accepted file-hash / file-id field.
const MAX_ID_BYTES: usize = 256;
/// Request frames are bounded by the largest store-shard body.
const MAX_REQUEST_BYTES: usize = MAX_SHARD_BYTES + 1024;

/// A tagged rpc request. Tag numbers are fixed on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RpcRequest {
    /// Tag 1: fetch one shard of a file.
    GetShard { file_hash: Vec<u8>, shard_index: u32 },
    /// Tag 2: fetch the threshold share stored for a file id.
    GetShare { file_id: Vec<u8> },
    /// Tag 3: store one shard; replied with "OK".
    StoreShard {
        file_hash: Vec<u8>,
        shard_index: u32,
        shard: Vec<u8>,
    },
    /// Tag 4: store a threshold share forwarded from `from_peer`.
    StoreShare {
        file_id: Vec<u8>,
        from_peer: u32,
        share: Vec<u8>,
    },
}

/// Raw response bytes. Empty means "not present locally".
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RpcResponse(pub Vec<u8>);

impl RpcResponse {
    pub fn empty() -> Self {
        RpcResponse(Vec::new())
    }

    pub fn ok() -> Self {
        RpcResponse(b"OK".to_vec())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_ok(&self) -> bool {
        self.0 == b"OK"
    }
}

impl RpcRequest {
    pub fn tag(&self) -> u8 {
        match self {
            RpcRequest::GetShard { .. } => TAG_GET_SHARD,
            RpcRequest::GetShare { .. } => TAG_GET_SHARE,
            RpcRequest::StoreShard { .. } => TAG_STORE_SHARD,
            RpcRequest::StoreShare { .. } => TAG_STORE_SHARE,
        }
    }

    /// Serializes tag and body. Total: every constructible request encodes.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut out = vec![self.tag()];
        match self {
            RpcRequest::GetShard { file_hash, shard_index } => {
                put_prefixed(&mut out, file_hash)?;
                out.extend_from_slice(&shard_index.to_be_bytes());
            }
            RpcRequest::GetShare { file_id } => {
                put_prefixed(&mut out, file_id)?;
            }
            RpcRequest::StoreShard {
                file_hash,
                shard_index,
                shard,
            } => {
                if shard.len() > MAX_SHARD_BYTES {
                    return Err(WireError::Oversized {
                        len: shard.len(),
                        cap: MAX_SHARD_BYTES,
                    });
                }
                put_prefixed(&mut out, file_hash)?;
                out.extend_from_slice(&shard_index.to_be_bytes());
                out.extend_from_slice(shard);
            }
            RpcRequest::StoreShare {
                file_id,
                from_peer,
                share,
            } => {
                if share.len() > MAX_SHARE_BYTES {
                    return Err(WireError::Oversized {
                        len: share.len(),
                        cap: MAX_SHARE_BYTES,
                    });
                }
                put_prefixed(&mut out, file_id)?;
                out.extend_from_slice(&from_peer.to_be_bytes());
                out.extend_from_slice(&(share.len() as u32).to_be_bytes());
                out.extend_from_slice(share);
            }
        }
        Ok(out)
    }

    /// Inverse of [`RpcRequest::encode`]; rejects unknown tags, truncated
    /// bodies, oversized fields and trailing garbage.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let (&tag, mut body) = bytes.split_first().ok_or(WireError::Truncated)?;
        let req = match tag {
            TAG_GET_SHARD => {
                let file_hash = take_prefixed(&mut body)?;
                let shard_index = take_u32(&mut body)?;
                RpcRequest::GetShard { file_hash, shard_index }
            }
            TAG_GET_SHARE => {
                let file_id = take_prefixed(&mut body)?;
                RpcRequest::GetShare { file_id }
            }
            TAG_STORE_SHARD => {
                let file_hash = take_prefixed(&mut body)?;
                let shard_index = take_u32(&mut body)?;
                if body.len() > MAX_SHARD_BYTES {
                    return Err(WireError::Oversized {
                        len: body.len(),
                        cap: MAX_SHARD_BYTES,
                    });
                }
                let shard = body.to_vec();
                body = &[];
                RpcRequest::StoreShard {
                    file_hash,
                    shard_index,
                    shard,
                }
            }
            TAG_STORE_SHARE => {
                let file_id = take_prefixed(&mut body)?;
                let from_peer = take_u32(&mut body)?;
                let len = take_u32(&mut body)? as usize;
                if len > MAX_SHARE_BYTES {
                    return Err(WireError::Oversized {
                        len,
                        cap: MAX_SHARE_BYTES,
                    });
                }
                if body.len() < len {
                    return Err(WireError::Truncated);
                }
                let share = body[..len].to_vec();
                body = &body[len..];
                RpcRequest::StoreShare {
                    file_id,
                    from_peer,
                    share,
                }
            }
            other => return Err(WireError::UnknownTag(other)),
        };
        if !body.is_empty() {
            return Err(WireError::TrailingBytes(body.len()));
        }
        Ok(req)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WireError {
    #[error("truncated frame")]
    Truncated,
    #[error("unknown tag {0}")]
    UnknownTag(u8),
    #[error("field of {len} bytes exceeds cap {cap}")]
    Oversized { len: usize, cap: usize },
    #[error("{0} trailing bytes after frame")]
    TrailingBytes(usize),
}

impl From<WireError> for io::Error {
    fn from(err: WireError) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, err)
    }
}

fn put_prefixed(out: &mut Vec<u8>, field: &[u8]) -> Result<(), WireError> {
    if field.len() > MAX_ID_BYTES {
        return Err(WireError::Oversized {
            len: field.len(),
            cap: MAX_ID_BYTES,
        });
    }
    out.extend_from_slice(&(field.len() as u16).to_be_bytes());
    out.extend_from_slice(field);
    Ok(())
}

fn take_prefixed(body: &mut &[u8]) -> Result<Vec<u8>, WireError> {
    if body.len() < 2 {
        return Err(WireError::Truncated);
    }
    let len = u16::from_be_bytes([body[0], body[1]]) as usize;
    if len > MAX_ID_BYTES {
        return Err(WireError::Oversized {
            len,
            cap: MAX_ID_BYTES,
        });
    }
    if body.len() < 2 + len {
        return Err(WireError::Truncated);
    }
    let field = body[2..2 + len].to_vec();
    *body = &body[2 + len..];
    Ok(field)
}

fn take_u32(body: &mut &[u8]) -> Result<u32, WireError> {
    if body.len() < 4 {
        return Err(WireError::Truncated);
    }
    let value = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
    *body = &body[4..];
    Ok(value)
}

/// libp2p request-response codec for the rpc protocol.
#[derive(Clone, Default)]
pub struct RpcCodec;

#[async_trait]
impl request_response::Codec for RpcCodec {
    type Protocol = StreamProtocol;
    type Request = RpcRequest;
    type Response = RpcResponse;

    async fn read_request<T>(&mut self, _: &Self::Protocol, io: &mut T) -> io::Result<Self::Request>
    where
        T: AsyncRead + Unpin + Send,
    {
        let mut buf = Vec::new();
        io.take(MAX_REQUEST_BYTES as u64 + 1)
            .read_to_end(&mut buf)
            .await?;
        if buf.len() > MAX_REQUEST_BYTES {
            return Err(WireError::Oversized {
                len: buf.len(),
                cap: MAX_REQUEST_BYTES,
            }
            .into());
        }
        Ok(RpcRequest::decode(&buf)?)
    }

    async fn read_response<T>(&mut self, _: &Self::Protocol, io: &mut T) -> io::Result<Self::Response>
    where
        T: AsyncRead + Unpin + Send,
    {
        let mut buf = Vec::new();
        io.take(MAX_SHARD_BYTES as u64 + 1).read_to_end(&mut buf).await?;
        if buf.len() > MAX_SHARD_BYTES {
            return Err(WireError::Oversized {
                len: buf.len(),
                cap: MAX_SHARD_BYTES,
            }
            .into());
        }
        Ok(RpcResponse(buf))
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
        let bytes = req.encode()?;
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
        io.write_all(&resp.0).await?;
        io.close().await
    }
}
