//! Minimal LEB128-style unsigned varint codec.
//!
//! Out of scope per the protocol design (the byte-level frame codec is an
//! external collaborator), so this is a small, self-contained helper rather
//! than a pulled-in dependency: the wire format only asks for "varint", not
//! a specific library's flavor of one.

use bytes::BufMut;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// a u64 never needs more than 10 continuation-bit groups
const MAX_SHIFT: u32 = 70;

#[derive(Debug, Error)]
pub enum VarintError {
    #[error("varint exceeded the maximum encoded length")]
    TooBig,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub fn write_uvarint(buf: &mut impl BufMut, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            buf.put_u8(byte | 0x80);
        } else {
            buf.put_u8(byte);
            break;
        }
    }
}

pub async fn read_uvarint<R: AsyncRead + Unpin>(r: &mut R) -> Result<u64, VarintError> {
    let mut result: u64 = 0;
    let mut shift = 0u32;
    loop {
        let byte = r.read_u8().await?;
        result |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift >= MAX_SHIFT {
            return Err(VarintError::TooBig);
        }
    }
    Ok(result)
}
