//! Wire framing: a handshake record (`ConnectionHead`) followed by a stream
//! of tagged `Frame`s, each a 1-byte tag plus varint-length-prefixed fields.
//!
//! Replaces the fixed `#[repr(C)]` UDP datagram layout this crate's ancestor
//! used — TCP gives us a byte stream, not a datagram boundary, so framing is
//! explicit instead of "whatever fit in one `recv`".

use bytes::{BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::varint::{read_uvarint, write_uvarint, VarintError};

pub const NUM_BYTES_SESSION_ID: usize = 16;

/// Opaque session identifier. Equality and hashing are structural over the
/// 16 bytes, never by identity — a server's session table is keyed on this.
#[derive(Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct SessionId(pub [u8; NUM_BYTES_SESSION_ID]);

impl SessionId {
    pub fn new_random() -> Self {
        Self(*uuid::Uuid::new_v4().as_bytes())
    }
}

impl std::fmt::Debug for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SessionId({})", self)
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// First record written on every physical stream, before any `Frame`s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionHead {
    pub session_id: SessionId,
    pub is_renew: bool,
    pub connection_id: u32,
}

#[derive(IntoPrimitive, TryFromPrimitive, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum FrameTag {
    HeartBeat = 0,
    Data = 1,
    Acknowledge = 2,
    Finish = 3,
    RetransmissionData = 4,
    RetransmissionFinish = 5,
    ShutDown = 6,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    HeartBeat,
    Data(Vec<Vec<u8>>),
    Acknowledge,
    Finish,
    RetransmissionData(u32, u32, Vec<Vec<u8>>),
    RetransmissionFinish(u32, u32),
    ShutDown,
}

impl Frame {
    /// matches spec.md's "AcknowledgeRequired" marker on a subset of frame kinds
    pub fn requires_ack(&self) -> bool {
        matches!(
            self,
            Frame::Data(_) | Frame::Finish | Frame::RetransmissionData(..) | Frame::RetransmissionFinish(..)
        )
    }

    fn tag(&self) -> FrameTag {
        match self {
            Frame::HeartBeat => FrameTag::HeartBeat,
            Frame::Data(_) => FrameTag::Data,
            Frame::Acknowledge => FrameTag::Acknowledge,
            Frame::Finish => FrameTag::Finish,
            Frame::RetransmissionData(..) => FrameTag::RetransmissionData,
            Frame::RetransmissionFinish(..) => FrameTag::RetransmissionFinish,
            Frame::ShutDown => FrameTag::ShutDown,
        }
    }

    fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u8(self.tag().into());
        match self {
            Frame::HeartBeat | Frame::Acknowledge | Frame::Finish | Frame::ShutDown => {}
            Frame::Data(buffers) => encode_buffers(&mut buf, buffers),
            Frame::RetransmissionData(conn_id, pack_id, buffers) => {
                write_uvarint(&mut buf, *conn_id as u64);
                write_uvarint(&mut buf, *pack_id as u64);
                encode_buffers(&mut buf, buffers);
            }
            Frame::RetransmissionFinish(conn_id, pack_id) => {
                write_uvarint(&mut buf, *conn_id as u64);
                write_uvarint(&mut buf, *pack_id as u64);
            }
        }
        buf
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unrecognized frame tag byte {0}")]
    UnknownTag(u8),
    #[error("varint in frame header exceeded the maximum encoded length")]
    VarintTooBig,
    #[error("data payload of {0} bytes exceeds MaxDataSize of {1} bytes")]
    DataTooBig(usize, usize),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<VarintError> for CodecError {
    fn from(err: VarintError) -> Self {
        match err {
            VarintError::TooBig => CodecError::VarintTooBig,
            VarintError::Io(e) => CodecError::Io(e),
        }
    }
}

fn encode_buffers(buf: &mut BytesMut, buffers: &[Vec<u8>]) {
    write_uvarint(buf, buffers.len() as u64);
    for b in buffers {
        write_uvarint(buf, b.len() as u64);
        buf.put_slice(b);
    }
}

async fn read_buffers<R: AsyncRead + Unpin>(
    r: &mut R,
    max_data_size: usize,
) -> Result<Vec<Vec<u8>>, CodecError> {
    let count = read_uvarint(r).await? as usize;
    let mut buffers = Vec::with_capacity(count.min(4096));
    let mut total = 0usize;
    for _ in 0..count {
        let len = read_uvarint(r).await? as usize;
        total = total.saturating_add(len);
        if total > max_data_size {
            return Err(CodecError::DataTooBig(total, max_data_size));
        }
        let mut buf = vec![0u8; len];
        r.read_exact(&mut buf).await?;
        buffers.push(buf);
    }
    Ok(buffers)
}

pub async fn write_connection_head<W: AsyncWrite + Unpin>(
    w: &mut W,
    head: &ConnectionHead,
) -> Result<(), CodecError> {
    let mut buf = BytesMut::with_capacity(NUM_BYTES_SESSION_ID + 1 + 5);
    buf.put_slice(&head.session_id.0);
    buf.put_u8(head.is_renew as u8);
    write_uvarint(&mut buf, head.connection_id as u64);
    w.write_all(&buf).await?;
    Ok(())
}

pub async fn read_connection_head<R: AsyncRead + Unpin>(
    r: &mut R,
) -> Result<ConnectionHead, CodecError> {
    let mut session_id = [0u8; NUM_BYTES_SESSION_ID];
    r.read_exact(&mut session_id).await?;
    let is_renew = r.read_u8().await? != 0;
    let connection_id = read_uvarint(r).await? as u32;
    Ok(ConnectionHead {
        session_id: SessionId(session_id),
        is_renew,
        connection_id,
    })
}

pub async fn read_frame<R: AsyncRead + Unpin>(
    r: &mut R,
    max_data_size: usize,
) -> Result<Frame, CodecError> {
    let tag_byte = r.read_u8().await?;
    let tag = FrameTag::try_from(tag_byte).map_err(|_| CodecError::UnknownTag(tag_byte))?;
    Ok(match tag {
        FrameTag::HeartBeat => Frame::HeartBeat,
        FrameTag::Data => Frame::Data(read_buffers(r, max_data_size).await?),
        FrameTag::Acknowledge => Frame::Acknowledge,
        FrameTag::Finish => Frame::Finish,
        FrameTag::RetransmissionData => {
            let conn_id = read_uvarint(r).await? as u32;
            let pack_id = read_uvarint(r).await? as u32;
            Frame::RetransmissionData(conn_id, pack_id, read_buffers(r, max_data_size).await?)
        }
        FrameTag::RetransmissionFinish => {
            let conn_id = read_uvarint(r).await? as u32;
            let pack_id = read_uvarint(r).await? as u32;
            Frame::RetransmissionFinish(conn_id, pack_id)
        }
        FrameTag::ShutDown => Frame::ShutDown,
    })
}

pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &Frame) -> Result<(), CodecError> {
    w.write_all(&frame.encode()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: usize = 1 << 20;

    async fn roundtrip(frame: Frame) {
        let mut buf = Vec::new();
        write_frame(&mut buf, &frame).await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let decoded = read_frame(&mut cursor, MAX).await.unwrap();
        assert_eq!(decoded, frame);
    }

    #[tokio::test]
    async fn roundtrips_every_frame_kind() {
        roundtrip(Frame::HeartBeat).await;
        roundtrip(Frame::Acknowledge).await;
        roundtrip(Frame::Finish).await;
        roundtrip(Frame::ShutDown).await;
        roundtrip(Frame::Data(vec![b"hello".to_vec(), b"world".to_vec()])).await;
        roundtrip(Frame::RetransmissionData(3, 41, vec![b"again".to_vec()])).await;
        roundtrip(Frame::RetransmissionFinish(3, 41)).await;
    }

    #[tokio::test]
    async fn connection_head_roundtrips() {
        let head = ConnectionHead {
            session_id: SessionId::new_random(),
            is_renew: true,
            connection_id: 12345,
        };
        let mut buf = Vec::new();
        write_connection_head(&mut buf, &head).await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let decoded = read_connection_head(&mut cursor).await.unwrap();
        assert_eq!(decoded, head);
    }

    #[tokio::test]
    async fn rejects_data_over_the_configured_limit() {
        let frame = Frame::Data(vec![vec![0u8; 32]]);
        let mut buf = Vec::new();
        write_frame(&mut buf, &frame).await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let err = read_frame(&mut cursor, 8).await.unwrap_err();
        assert!(matches!(err, CodecError::DataTooBig(32, 8)));
    }

    #[tokio::test]
    async fn rejects_many_small_buffers_whose_total_exceeds_the_limit() {
        // no single buffer is over the limit on its own, but spec.md §6
        // bounds a Data payload's *total* byte length, not any one buffer.
        let frame = Frame::Data(vec![vec![0u8; 5], vec![0u8; 5]]);
        let mut buf = Vec::new();
        write_frame(&mut buf, &frame).await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let err = read_frame(&mut cursor, 8).await.unwrap_err();
        assert!(matches!(err, CodecError::DataTooBig(10, 8)));
    }

    #[tokio::test]
    async fn rejects_unknown_tag() {
        let mut cursor = std::io::Cursor::new(vec![200u8]);
        let err = read_frame(&mut cursor, MAX).await.unwrap_err();
        assert!(matches!(err, CodecError::UnknownTag(200)));
    }
}
