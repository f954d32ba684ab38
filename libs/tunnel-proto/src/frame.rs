use bytes::{Buf as _, BufMut as _, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};
use uuid::Uuid;

use crate::ConnId;

/// Frames are length-prefixed; a single frame never exceeds this.
const MAX_FRAME_LEN: usize = 1024 * 1024;

const KIND_SESSION_INFO: u8 = 0;
const KIND_OPEN: u8 = 1;
const KIND_PAYLOAD: u8 = 2;
const KIND_CLOSE: u8 = 3;
const KIND_KEEPALIVE: u8 = 4;

/// Identifies the session; always the first frame on a new tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: Uuid,
}

/// Why a connection was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Orderly close; the flow finished.
    Normal,
    /// The flow was reset or torn down abnormally.
    Aborted,
    /// The tunnel carrying the flow went away.
    TunnelBroken,
}

impl CloseReason {
    fn wire(self) -> u8 {
        match self {
            CloseReason::Normal => 0,
            CloseReason::Aborted => 1,
            CloseReason::TunnelBroken => 2,
        }
    }

    fn from_wire(byte: u8) -> Result<Self, FrameError> {
        match byte {
            0 => Ok(CloseReason::Normal),
            1 => Ok(CloseReason::Aborted),
            2 => Ok(CloseReason::TunnelBroken),
            other => Err(FrameError::UnknownCloseReason(other)),
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::Normal => write!(f, "normal"),
            CloseReason::Aborted => write!(f, "aborted"),
            CloseReason::TunnelBroken => write!(f, "tunnel broken"),
        }
    }
}

/// A single message on the tunnel stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Control: identifies the session; sent first.
    SessionInfo(SessionInfo),
    /// A new TCP flow reached `Established`; the remote should dial out.
    Open(ConnId),
    /// Payload bytes for an existing flow.
    Payload { id: ConnId, payload: Bytes },
    /// The flow is gone.
    Close { id: ConnId, reason: CloseReason },
    /// Keeps NATs and idle-detection on intermediaries happy.
    Keepalive,
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("Frame of {0} bytes exceeds maximum")]
    TooLarge(usize),
    #[error("Frame is empty")]
    Empty,
    #[error("Unknown frame kind: {0}")]
    UnknownKind(u8),
    #[error("Unknown close reason: {0}")]
    UnknownCloseReason(u8),
    #[error("Truncated frame")]
    Truncated,
    #[error(transparent)]
    ConnId(#[from] crate::ConnIdError),
    #[error("Bad session info: {0}")]
    BadSessionInfo(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Length-prefixed binary codec for [`Frame`]s.
///
/// Wire format: `[len: u32be][kind: u8][body]` where the body depends on the
/// kind. Frames carrying a [`ConnId`] encode it as `[id_len: u8][id bytes]`.
#[derive(Debug, Default)]
pub struct FrameCodec {
    _priv: (),
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut body = BytesMut::new();

        match frame {
            Frame::SessionInfo(info) => {
                body.put_u8(KIND_SESSION_INFO);
                body.extend_from_slice(&serde_json::to_vec(&info)?);
            }
            Frame::Open(id) => {
                body.put_u8(KIND_OPEN);
                put_conn_id(&mut body, &id);
            }
            Frame::Payload { id, payload } => {
                body.put_u8(KIND_PAYLOAD);
                put_conn_id(&mut body, &id);
                body.extend_from_slice(&payload);
            }
            Frame::Close { id, reason } => {
                body.put_u8(KIND_CLOSE);
                put_conn_id(&mut body, &id);
                body.put_u8(reason.wire());
            }
            Frame::Keepalive => {
                body.put_u8(KIND_KEEPALIVE);
            }
        }

        if body.len() > MAX_FRAME_LEN {
            return Err(FrameError::TooLarge(body.len()));
        }

        dst.reserve(4 + body.len());
        dst.put_u32(body.len() as u32);
        dst.extend_from_slice(&body);

        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }

        let len = u32::from_be_bytes(src[..4].try_into().expect("length checked")) as usize;

        if len > MAX_FRAME_LEN {
            return Err(FrameError::TooLarge(len));
        }

        if src.len() < 4 + len {
            src.reserve(4 + len - src.len());
            return Ok(None);
        }

        src.advance(4);
        let mut body = src.split_to(len);

        let (kind, rest) = body.split_first().ok_or(FrameError::Empty)?;

        let frame = match *kind {
            KIND_SESSION_INFO => Frame::SessionInfo(serde_json::from_slice(rest)?),
            KIND_OPEN => {
                let (id, _) = take_conn_id(rest)?;

                Frame::Open(id)
            }
            KIND_PAYLOAD => {
                let (id, consumed) = take_conn_id(rest)?;
                body.advance(1 + consumed);

                Frame::Payload {
                    id,
                    payload: body.freeze(),
                }
            }
            KIND_CLOSE => {
                let (id, consumed) = take_conn_id(rest)?;
                let reason = *rest.get(consumed).ok_or(FrameError::Truncated)?;

                Frame::Close {
                    id,
                    reason: CloseReason::from_wire(reason)?,
                }
            }
            KIND_KEEPALIVE => Frame::Keepalive,
            other => return Err(FrameError::UnknownKind(other)),
        };

        Ok(Some(frame))
    }
}

fn put_conn_id(dst: &mut BytesMut, id: &ConnId) {
    let encoded = id.encode();

    dst.put_u8(encoded.len() as u8);
    dst.extend_from_slice(&encoded);
}

/// Parses a `[id_len: u8][id bytes]` prefix, returning the id and the number of bytes consumed.
fn take_conn_id(src: &[u8]) -> Result<(ConnId, usize), FrameError> {
    let (len, rest) = src.split_first().ok_or(FrameError::Truncated)?;
    let len = *len as usize;

    if rest.len() < len {
        return Err(FrameError::Truncated);
    }

    let id = ConnId::decode(&rest[..len])?;

    Ok((id, 1 + len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Protocol;

    fn conn_id() -> ConnId {
        ConnId::new(
            Protocol::Tcp,
            "10.0.0.1:40000".parse().unwrap(),
            "10.0.0.2:80".parse().unwrap(),
        )
        .unwrap()
    }

    fn round_trip(frame: Frame) -> Frame {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();

        codec.encode(frame, &mut buf).unwrap();
        codec.decode(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn round_trips_payload() {
        let frame = Frame::Payload {
            id: conn_id(),
            payload: Bytes::from_static(b"hello"),
        };

        assert_eq!(round_trip(frame.clone()), frame);
    }

    #[test]
    fn round_trips_close() {
        let frame = Frame::Close {
            id: conn_id(),
            reason: CloseReason::Aborted,
        };

        assert_eq!(round_trip(frame.clone()), frame);
    }

    #[test]
    fn round_trips_session_info() {
        let frame = Frame::SessionInfo(SessionInfo {
            session_id: Uuid::new_v4(),
        });

        assert_eq!(round_trip(frame.clone()), frame);
    }

    #[test]
    fn decodes_frames_from_partial_reads() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();

        codec.encode(Frame::Open(conn_id()), &mut buf).unwrap();
        codec.encode(Frame::Keepalive, &mut buf).unwrap();

        let mut partial = BytesMut::new();
        partial.extend_from_slice(&buf[..3]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&buf[3..]);
        assert_eq!(
            codec.decode(&mut partial).unwrap().unwrap(),
            Frame::Open(conn_id())
        );
        assert_eq!(codec.decode(&mut partial).unwrap().unwrap(), Frame::Keepalive);
    }
}
