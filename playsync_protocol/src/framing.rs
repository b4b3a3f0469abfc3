// Length-delimited message framing over TCP.
//
// Wire format: a 4-byte big-endian length prefix followed by the payload.
// `write_frame` / `read_frame` move raw bytes; `write_json` / `read_json`
// wrap them with serde_json so both ends of the relay share one codepath
// for typed messages.
//
// `MAX_MESSAGE_SIZE` (16 MB) bounds the allocation a length prefix can
// request. Start-point snapshots are the largest expected payloads.

use std::io::{self, Read, Write};

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Maximum allowed message size (16 MB).
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FramingError {
    #[error("frame of {0} bytes exceeds the message size limit")]
    TooLarge(usize),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),
}

impl FramingError {
    /// True when the peer closed the stream (cleanly or mid-frame).
    pub fn is_eof(&self) -> bool {
        matches!(self, FramingError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof)
    }
}

/// Write one frame: length prefix, payload, flush.
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> Result<(), FramingError> {
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= MAX_MESSAGE_SIZE)
        .ok_or(FramingError::TooLarge(payload.len()))?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame. An oversized prefix is rejected before allocating.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Vec<u8>, FramingError> {
    let mut prefix = [0u8; 4];
    reader.read_exact(&mut prefix)?;
    let len = u32::from_be_bytes(prefix);
    if len > MAX_MESSAGE_SIZE {
        return Err(FramingError::TooLarge(len as usize));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload)?;
    Ok(payload)
}

/// Serialize `msg` as JSON and write it as one frame.
pub fn write_json<W: Write, T: Serialize>(writer: &mut W, msg: &T) -> Result<(), FramingError> {
    let json = serde_json::to_vec(msg)?;
    write_frame(writer, &json)
}

/// Read one frame and parse it as JSON.
pub fn read_json<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<T, FramingError> {
    let payload = read_frame(reader)?;
    Ok(serde_json::from_slice(&payload)?)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::message::{ClientMessage, ResponseBody, ServerMessage};
    use crate::types::{GetTickListOptions, PlayId, TickFrame, TickPack};

    #[test]
    fn frames_are_read_back_in_order() {
        let mut wire = Vec::new();
        for payload in [&b"open"[..], &b""[..], &b"close"[..]] {
            write_frame(&mut wire, payload).unwrap();
        }
        let mut cursor = Cursor::new(wire);
        assert_eq!(read_frame(&mut cursor).unwrap(), b"open");
        assert_eq!(read_frame(&mut cursor).unwrap(), b"");
        assert_eq!(read_frame(&mut cursor).unwrap(), b"close");
        assert!(read_frame(&mut cursor).unwrap_err().is_eof());
    }

    #[test]
    fn oversized_prefix_is_rejected() {
        let mut cursor = Cursor::new((MAX_MESSAGE_SIZE + 1).to_be_bytes().to_vec());
        assert!(matches!(
            read_frame(&mut cursor),
            Err(FramingError::TooLarge(_))
        ));
    }

    #[test]
    fn oversized_write_is_rejected() {
        let big = vec![0u8; MAX_MESSAGE_SIZE as usize + 1];
        let mut wire = Vec::new();
        assert!(matches!(
            write_frame(&mut wire, &big),
            Err(FramingError::TooLarge(_))
        ));
        assert!(wire.is_empty());
    }

    #[test]
    fn truncated_payload_is_eof() {
        let mut wire = 10u32.to_be_bytes().to_vec();
        wire.extend_from_slice(b"short");
        assert!(read_frame(&mut Cursor::new(wire)).unwrap_err().is_eof());
    }

    #[test]
    fn client_request_travels_as_json() {
        let msg = ClientMessage::GetTickList {
            request_id: 9,
            play_id: PlayId::new("77").unwrap(),
            options: GetTickListOptions {
                begin: 0,
                end: 10,
                exclude_ignorable: true,
            },
        };
        let mut wire = Vec::new();
        write_json(&mut wire, &msg).unwrap();
        let back: ClientMessage = read_json(&mut Cursor::new(wire)).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn response_result_is_externally_tagged() {
        let msg = ServerMessage::Response {
            request_id: 1,
            result: Ok(ResponseBody::TickList(Some(vec![
                TickPack::Range(TickFrame { from: 0, to: 3 }),
                TickPack::Frame(4),
            ]))),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "Response": {
                    "request_id": 1,
                    "result": {"Ok": {"TickList": [{"from": 0, "to": 3}, 4]}}
                }
            })
        );
    }

    #[test]
    fn garbage_payload_is_json_error() {
        let mut wire = Vec::new();
        write_frame(&mut wire, b"{not json").unwrap();
        let err = read_json::<_, ClientMessage>(&mut Cursor::new(wire)).unwrap_err();
        assert!(matches!(err, FramingError::Json(_)));
    }
}
