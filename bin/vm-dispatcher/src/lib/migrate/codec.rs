// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Support for encoding packages of the dispatcher-to-dispatcher protocol.
//!
//! Each package travels in one Binary websocket frame laid out as
//!
//! ```text
//! payload | id: u64le | reply_to: u64le | type: u16le
//! ```
//!
//! with the fixed-size trailer at the end so it can be split off before the
//! payload is looked at. Structured commands are RON text. File and tunnel
//! chunks are raw bytes behind a one-byte header (the last-chunk flag and the
//! channel id respectively). A `reply_to` of zero means the package does not
//! answer anything; package ids start at one.

use bytes::{Buf, BufMut, Bytes};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;
use tokio_tungstenite::tungstenite;

use super::commands::{
    CheckPreconditions, CheckPreconditionsReply, CopyChunk, CopyDir,
    CopyFailure, CopyFile, CopyFirstRequest, Response, StartCommand,
    StartReply, TunnelChunk, VmIdentity,
};
use super::protocol::ProtocolVersion;

/// Base of the id range reserved for dispatcher-to-dispatcher commands.
pub(crate) const DISP_TO_DISP_RANGE_START: u16 = 20000;

const TRAILER_LEN: usize = 8 + 8 + 2;

/// Migration protocol errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// We received an unexpected message type
    #[error("couldn't decode message type ({0})")]
    InvalidMessageType(u16),

    /// The message received on the wire wasn't the expected length
    #[error("unexpected message length {1} for type {0}")]
    UnexpectedMessageLen(u16, usize),

    /// Encountered an I/O error on the transport
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to serialize a message
    #[error("serialization error: {0}")]
    Ron(#[from] ron::Error),

    /// Failed to deserialize a message
    #[error("deserialization error: {0}")]
    RonSpanned(#[from] ron::error::SpannedError),

    /// Received non-UTF8 string
    #[error("non-UTF8 string: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    /// The frame was shorter than the package trailer
    #[error("frame of {0} bytes cannot hold a package trailer")]
    Truncated(usize),

    /// All our codec's packages should be tungstenite::Message::Binary
    #[error("unexpected websocket message: {0:?}")]
    UnexpectedWebsocketMessage(tungstenite::Message),
}

/// The decoded body of a package.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Message {
    Response(Response),
    CheckPreconditions(CheckPreconditions),
    CheckPreconditionsReply(CheckPreconditionsReply),
    Start(StartCommand),
    StartReply(StartReply),
    Finish(VmIdentity),
    Cancel(VmIdentity),
    CopyFirstRequest(CopyFirstRequest),
    CopyFirstReply,
    CopyDir(CopyDir),
    CopyFile(CopyFile),
    CopyChunk(CopyChunk),
    CopyFinish,
    CopyReply,
    CopyError(CopyFailure),
    CopyCancel,
    TunnelChunk(TunnelChunk),
}

impl Message {
    /// Drops fields the negotiated protocol does not carry.
    pub(crate) fn restrict(&mut self, session: ProtocolVersion) {
        match self {
            Message::CheckPreconditions(c) => c.restrict(session),
            Message::CheckPreconditionsReply(r) => r.restrict(session),
            Message::Start(s) => s.restrict(session),
            _ => {}
        }
    }

    /// A short name for logs.
    pub(crate) fn kind(&self) -> MessageType {
        MessageType::from(self)
    }
}

/// Wire ids for each message kind, offsets from DISP_TO_DISP_RANGE_START.
/// They must stay in bijection with `Message`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub(crate) enum MessageType {
    Response = 20003,
    CopyFirstRequest = 20401,
    CopyFirstReply = 20402,
    CopyCancel = 20403,
    CopyDir = 20405,
    CopyFile = 20406,
    CopyChunk = 20407,
    CopyFinish = 20408,
    CopyReply = 20409,
    CopyError = 20410,
    CheckPreconditions = 20501,
    Start = 20502,
    Cancel = 20503,
    StartReply = 20504,
    CheckPreconditionsReply = 20505,
    Finish = 20507,
    TunnelChunk = 20510,
}

impl From<&Message> for MessageType {
    fn from(m: &Message) -> MessageType {
        match m {
            Message::Response(_) => MessageType::Response,
            Message::CheckPreconditions(_) => MessageType::CheckPreconditions,
            Message::CheckPreconditionsReply(_) => {
                MessageType::CheckPreconditionsReply
            }
            Message::Start(_) => MessageType::Start,
            Message::StartReply(_) => MessageType::StartReply,
            Message::Finish(_) => MessageType::Finish,
            Message::Cancel(_) => MessageType::Cancel,
            Message::CopyFirstRequest(_) => MessageType::CopyFirstRequest,
            Message::CopyFirstReply => MessageType::CopyFirstReply,
            Message::CopyDir(_) => MessageType::CopyDir,
            Message::CopyFile(_) => MessageType::CopyFile,
            Message::CopyChunk(_) => MessageType::CopyChunk,
            Message::CopyFinish => MessageType::CopyFinish,
            Message::CopyReply => MessageType::CopyReply,
            Message::CopyError(_) => MessageType::CopyError,
            Message::CopyCancel => MessageType::CopyCancel,
            Message::TunnelChunk(_) => MessageType::TunnelChunk,
        }
    }
}

/// A message plus its addressing.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Package {
    pub id: u64,
    pub reply_to: Option<u64>,
    pub message: Message,
}

fn put_ron<T: serde::Serialize>(
    dst: &mut Vec<u8>,
    value: &T,
) -> Result<(), ProtocolError> {
    let serialized = ron::ser::to_string(value)?;
    dst.put_slice(serialized.as_bytes());
    Ok(())
}

fn get_ron<T: serde::de::DeserializeOwned>(
    src: &Bytes,
) -> Result<T, ProtocolError> {
    Ok(ron::de::from_str(std::str::from_utf8(src)?)?)
}

fn expect_empty(tag: MessageType, src: &Bytes) -> Result<(), ProtocolError> {
    if !src.is_empty() {
        return Err(ProtocolError::UnexpectedMessageLen(tag.into(), src.len()));
    }
    Ok(())
}

// Splits the one-byte header off a chunk payload.
fn get_chunk_header(
    tag: MessageType,
    src: &mut Bytes,
) -> Result<u8, ProtocolError> {
    if src.is_empty() {
        return Err(ProtocolError::UnexpectedMessageLen(tag.into(), 0));
    }
    Ok(src.get_u8())
}

impl std::convert::TryInto<tungstenite::Message> for Package {
    type Error = ProtocolError;
    fn try_into(self) -> Result<tungstenite::Message, ProtocolError> {
        let mut dst = Vec::new();
        let tag: u16 = MessageType::from(&self.message).into();
        match self.message {
            Message::CopyFirstReply
            | Message::CopyFinish
            | Message::CopyReply
            | Message::CopyCancel => {}
            Message::Response(r) => put_ron(&mut dst, &r)?,
            Message::CheckPreconditions(c) => put_ron(&mut dst, &c)?,
            Message::CheckPreconditionsReply(r) => put_ron(&mut dst, &r)?,
            Message::Start(s) => put_ron(&mut dst, &s)?,
            Message::StartReply(r) => put_ron(&mut dst, &r)?,
            Message::Finish(id) | Message::Cancel(id) => {
                put_ron(&mut dst, &id)?
            }
            Message::CopyFirstRequest(r) => put_ron(&mut dst, &r)?,
            Message::CopyDir(d) => put_ron(&mut dst, &d)?,
            Message::CopyFile(f) => put_ron(&mut dst, &f)?,
            Message::CopyError(e) => put_ron(&mut dst, &e)?,
            Message::CopyChunk(chunk) => {
                dst.reserve(1 + chunk.data.len() + TRAILER_LEN);
                dst.put_u8(u8::from(chunk.last));
                dst.put_slice(&chunk.data);
            }
            Message::TunnelChunk(chunk) => {
                dst.reserve(1 + chunk.data.len() + TRAILER_LEN);
                dst.put_u8(chunk.channel);
                dst.put_slice(&chunk.data);
            }
        }
        dst.put_u64_le(self.id);
        dst.put_u64_le(self.reply_to.unwrap_or(0));
        dst.put_u16_le(tag);
        Ok(tungstenite::Message::Binary(dst))
    }
}

impl std::convert::TryInto<Package> for tungstenite::Message {
    type Error = ProtocolError;
    fn try_into(self) -> Result<Package, ProtocolError> {
        let mut v = match self {
            tungstenite::Message::Binary(v) => v,
            x => return Err(ProtocolError::UnexpectedWebsocketMessage(x)),
        };
        if v.len() < TRAILER_LEN {
            return Err(ProtocolError::Truncated(v.len()));
        }
        let mut trailer = Bytes::from(v.split_off(v.len() - TRAILER_LEN));
        let id = trailer.get_u64_le();
        let reply_to = match trailer.get_u64_le() {
            0 => None,
            n => Some(n),
        };
        let tag_raw = trailer.get_u16_le();
        let tag = MessageType::try_from(tag_raw)
            .map_err(|_| ProtocolError::InvalidMessageType(tag_raw))?;

        let mut src = Bytes::from(v);
        let message = match tag {
            MessageType::Response => Message::Response(get_ron(&src)?),
            MessageType::CheckPreconditions => {
                Message::CheckPreconditions(get_ron(&src)?)
            }
            MessageType::CheckPreconditionsReply => {
                Message::CheckPreconditionsReply(get_ron(&src)?)
            }
            MessageType::Start => Message::Start(get_ron(&src)?),
            MessageType::StartReply => Message::StartReply(get_ron(&src)?),
            MessageType::Finish => Message::Finish(get_ron(&src)?),
            MessageType::Cancel => Message::Cancel(get_ron(&src)?),
            MessageType::CopyFirstRequest => {
                Message::CopyFirstRequest(get_ron(&src)?)
            }
            MessageType::CopyDir => Message::CopyDir(get_ron(&src)?),
            MessageType::CopyFile => Message::CopyFile(get_ron(&src)?),
            MessageType::CopyError => Message::CopyError(get_ron(&src)?),
            MessageType::CopyFirstReply => {
                expect_empty(tag, &src)?;
                Message::CopyFirstReply
            }
            MessageType::CopyFinish => {
                expect_empty(tag, &src)?;
                Message::CopyFinish
            }
            MessageType::CopyReply => {
                expect_empty(tag, &src)?;
                Message::CopyReply
            }
            MessageType::CopyCancel => {
                expect_empty(tag, &src)?;
                Message::CopyCancel
            }
            MessageType::CopyChunk => {
                let flags = get_chunk_header(tag, &mut src)?;
                let last = flags & 1 != 0;
                Message::CopyChunk(CopyChunk { last, data: src })
            }
            MessageType::TunnelChunk => {
                let channel = get_chunk_header(tag, &mut src)?;
                Message::TunnelChunk(TunnelChunk { channel, data: src })
            }
        };
        Ok(Package { id, reply_to, message })
    }
}

#[cfg(test)]
mod encoder_tests {
    use super::*;
    use std::convert::TryInto;

    fn encode(p: Package) -> Vec<u8> {
        if let tungstenite::Message::Binary(bytes) = p.try_into().unwrap() {
            bytes
        } else {
            panic!();
        }
    }

    fn package(message: Message) -> Package {
        Package { id: 7, reply_to: None, message }
    }

    #[test]
    fn trailer_layout() {
        let bytes = encode(Package {
            id: 0x0102,
            reply_to: Some(5),
            message: Message::CopyReply,
        });
        assert_eq!(bytes.len(), TRAILER_LEN);
        assert_eq!(&bytes[..8], &[2, 1, 0, 0, 0, 0, 0, 0]);
        assert_eq!(&bytes[8..16], &[5, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(&bytes[16..], &20409u16.to_le_bytes());
    }

    #[test]
    fn wire_ids_are_offsets_from_range_start() {
        let offsets = [
            (MessageType::Response, 3),
            (MessageType::CopyFirstRequest, 401),
            (MessageType::CopyCancel, 403),
            (MessageType::CopyReply, 409),
            (MessageType::CopyError, 410),
            (MessageType::CheckPreconditions, 501),
            (MessageType::Start, 502),
            (MessageType::Cancel, 503),
            (MessageType::StartReply, 504),
            (MessageType::CheckPreconditionsReply, 505),
            (MessageType::Finish, 507),
            (MessageType::TunnelChunk, 510),
        ];
        for (ty, offset) in offsets {
            assert_eq!(u16::from(ty), DISP_TO_DISP_RANGE_START + offset);
        }
    }

    #[test]
    fn encode_file_chunk() {
        let mut bytes = encode(package(Message::CopyChunk(CopyChunk {
            last: true,
            data: Bytes::from_static(b"abc"),
        })));
        bytes.truncate(bytes.len() - TRAILER_LEN);
        assert_eq!(&bytes[..], &[1, b'a', b'b', b'c']);
    }

    #[test]
    fn encode_tunnel_chunk() {
        let mut bytes = encode(package(Message::TunnelChunk(TunnelChunk {
            channel: 3,
            data: Bytes::new(),
        })));
        bytes.truncate(bytes.len() - TRAILER_LEN);
        assert_eq!(&bytes[..], &[3]);
    }

    #[test]
    fn encode_response() {
        let mut bytes = encode(package(Message::Response(Response::Ok)));
        bytes.truncate(bytes.len() - TRAILER_LEN);
        assert_eq!(&bytes[..], b"Ok");
    }
}

#[cfg(test)]
mod decoder_tests {
    use super::*;
    use dispatcher_api_types::ErrorCode;
    use std::convert::TryInto;
    use uuid::Uuid;

    fn frame(payload: &[u8], id: u64, reply_to: u64, tag: u16) -> Vec<u8> {
        let mut v = payload.to_vec();
        v.extend(id.to_le_bytes());
        v.extend(reply_to.to_le_bytes());
        v.extend(tag.to_le_bytes());
        v
    }

    fn decode(bytes: Vec<u8>) -> Result<Package, ProtocolError> {
        tungstenite::Message::Binary(bytes).try_into()
    }

    #[test]
    fn decode_bad_tag_fails() {
        let res = decode(frame(&[], 1, 0, 222));
        assert!(matches!(res, Err(ProtocolError::InvalidMessageType(222))));
    }

    #[test]
    fn decode_nonbinary_fails() {
        let res: Result<Package, _> =
            tungstenite::Message::Text(String::new()).try_into();
        assert!(res.is_err());
    }

    #[test]
    fn decode_truncated_fails() {
        assert!(matches!(
            decode(vec![0; TRAILER_LEN - 1]),
            Err(ProtocolError::Truncated(17))
        ));
    }

    #[test]
    fn decode_empty_chunk_fails() {
        let res = decode(frame(&[], 1, 0, MessageType::CopyChunk.into()));
        assert!(matches!(res, Err(ProtocolError::UnexpectedMessageLen(_, 0))));
    }

    #[test]
    fn decode_reply_addressing() {
        let p = decode(frame(&[], 9, 4, MessageType::CopyReply.into()))
            .unwrap();
        assert_eq!(p.id, 9);
        assert_eq!(p.reply_to, Some(4));
        assert_eq!(p.message, Message::CopyReply);

        let p = decode(frame(&[], 9, 0, MessageType::CopyFinish.into()))
            .unwrap();
        assert_eq!(p.reply_to, None);
    }

    #[test]
    fn decode_unit_with_payload_fails() {
        let res = decode(frame(b"x", 1, 0, MessageType::CopyCancel.into()));
        assert!(res.is_err());
    }

    #[test]
    fn decode_tunnel_chunk() {
        let p = decode(frame(
            &[2, 0xde, 0xad],
            3,
            0,
            MessageType::TunnelChunk.into(),
        ))
        .unwrap();
        assert_eq!(
            p.message,
            Message::TunnelChunk(TunnelChunk {
                channel: 2,
                data: Bytes::from_static(&[0xde, 0xad]),
            })
        );
    }

    #[test]
    fn decode_error_response() {
        let text = br#"Error(code: Timeout, message: "late", errors: [])"#;
        let p = decode(frame(text, 1, 1, MessageType::Response.into()))
            .unwrap();
        assert_eq!(
            p.message,
            Message::Response(Response::Error {
                code: ErrorCode::Timeout,
                message: "late".to_string(),
                errors: vec![],
            })
        );
    }

    #[test]
    fn structured_messages_round_trip() {
        let identity =
            VmIdentity { vm_uuid: Uuid::new_v4(), dir_uuid: Uuid::new_v4() };
        let messages = vec![
            Message::Finish(identity.clone()),
            Message::Cancel(identity),
            Message::StartReply(StartReply {
                memory_path: Some("/mem".into()),
            }),
            Message::CopyDir(CopyDir { path: "a/b".into(), mode: 0o755 }),
            Message::CopyFile(CopyFile {
                path: "a/b/c".into(),
                size: 12,
                mode: 0o644,
            }),
        ];
        for (i, message) in messages.into_iter().enumerate() {
            let p = Package { id: i as u64 + 1, reply_to: None, message };
            let wire: tungstenite::Message = p.clone().try_into().unwrap();
            let back: Package = wire.try_into().unwrap();
            assert_eq!(back, p);
        }
    }
}
