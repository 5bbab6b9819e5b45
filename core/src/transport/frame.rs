use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::protocol::DELIMITER;

/// Reliability layer frames
/// `msg|<id>|<payload>`, `ack|<id>`, `res|<id>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Application payload with its sequence id
    Msg { id: i64, payload: Bytes },
    /// Receiver has this id, stop retransmitting it
    Ack(i64),
    /// Receiver is missing this id, resend it now
    Res(i64),
}

impl Frame {
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Frame::Msg { id, payload } => {
                put_header(buf, b"msg", *id);
                buf.put_u8(DELIMITER);
                buf.put(payload.clone());
            }
            Frame::Ack(id) => put_header(buf, b"ack", *id),
            Frame::Res(id) => put_header(buf, b"res", *id),
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Payload bytes after the `msg|<id>|` prefix are returned untouched.
    pub fn decode(buf: Bytes) -> Result<Self, FrameError> {
        let tag_end = find_delimiter(&buf, 0).ok_or(FrameError::Incomplete)?;
        let tag = &buf[..tag_end];

        match tag {
            b"msg" => {
                let id_end = find_delimiter(&buf, tag_end + 1).ok_or(FrameError::Incomplete)?;
                let id = parse_id(&buf[tag_end + 1..id_end])?;
                let payload = buf.slice(id_end + 1..);
                Ok(Frame::Msg { id, payload })
            }
            b"ack" => Ok(Frame::Ack(parse_id(&buf[tag_end + 1..])?)),
            b"res" => Ok(Frame::Res(parse_id(&buf[tag_end + 1..])?)),
            _ => Err(FrameError::UnknownTag(
                String::from_utf8_lossy(tag).into_owned(),
            )),
        }
    }
}

fn put_header(buf: &mut BytesMut, tag: &[u8], id: i64) {
    buf.put_slice(tag);
    buf.put_u8(DELIMITER);
    buf.put_slice(id.to_string().as_bytes());
}

fn find_delimiter(buf: &[u8], from: usize) -> Option<usize> {
    buf.get(from..)?
        .iter()
        .position(|&b| b == DELIMITER)
        .map(|i| i + from)
}

fn parse_id(raw: &[u8]) -> Result<i64, FrameError> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| FrameError::InvalidId(String::from_utf8_lossy(raw).into_owned()))
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FrameError {
    #[error("Frame data incomplete")]
    Incomplete,
    #[error("Unknown frame tag: {0:?}")]
    UnknownTag(String),
    #[error("Invalid sequence id: {0:?}")]
    InvalidId(String),
}
