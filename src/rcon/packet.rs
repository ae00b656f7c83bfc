//! RCON wire format.
//!
//! ```text
//! i32 LE length | i32 LE request id | i32 LE type | body bytes | 0x00 | 0x00
//! ```
//! `length` counts everything after itself, so an empty body gives 10.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::RconError;

/// Id, type and the two trailing nulls.
const FRAME_OVERHEAD: usize = 10;

/// Largest command body servers accept from clients.
pub const MAX_OUTGOING_BODY: usize = 1446;

/// Servers split longer responses into several packets.
pub const MAX_INCOMING_BODY: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub id: i32,
    pub kind: i32,
    pub body: String,
}

impl Packet {
    pub const AUTH: i32 = 3;
    pub const AUTH_RESPONSE: i32 = 2;
    pub const EXEC_COMMAND: i32 = 2;
    pub const RESPONSE_VALUE: i32 = 0;

    /// Request id a server answers with when the password is wrong.
    pub const AUTH_FAILED_ID: i32 = -1;

    pub fn new<S: Into<String>>(id: i32, kind: i32, body: S) -> Self {
        Self {
            id,
            kind,
            body: body.into(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let body = self.body.as_bytes();
        let length = (body.len() + FRAME_OVERHEAD) as i32;

        let mut buf = Vec::with_capacity(4 + body.len() + FRAME_OVERHEAD);
        buf.extend_from_slice(&length.to_le_bytes());
        buf.extend_from_slice(&self.id.to_le_bytes());
        buf.extend_from_slice(&self.kind.to_le_bytes());
        buf.extend_from_slice(body);
        buf.extend_from_slice(&[0, 0]);
        buf
    }

    /// Parses the bytes that follow the length prefix.
    pub fn decode_frame(frame: &[u8]) -> Result<Self, RconError> {
        if frame.len() < FRAME_OVERHEAD {
            return Err(RconError::MalformedPacket(format!(
                "frame of {} bytes is shorter than the header",
                frame.len()
            )));
        }

        let id = i32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]);
        let kind = i32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]);
        let payload = &frame[8..];
        let end = payload
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| RconError::MalformedPacket("body is not null-terminated".into()))?;

        Ok(Self {
            id,
            kind,
            body: String::from_utf8_lossy(&payload[..end]).into_owned(),
        })
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<(), RconError> {
        if self.body.len() > MAX_OUTGOING_BODY {
            return Err(RconError::PayloadTooLarge(self.body.len()));
        }
        writer
            .write_all(&self.encode())
            .await
            .map_err(RconError::ConnectionLost)?;
        writer.flush().await.map_err(RconError::ConnectionLost)
    }

    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self, RconError> {
        let length = reader.read_i32_le().await.map_err(RconError::ConnectionLost)?;
        let length = usize::try_from(length)
            .ok()
            .filter(|len| (FRAME_OVERHEAD..=MAX_INCOMING_BODY + FRAME_OVERHEAD).contains(len))
            .ok_or_else(|| RconError::MalformedPacket(format!("invalid length {length}")))?;

        let mut frame = vec![0u8; length];
        reader
            .read_exact(&mut frame)
            .await
            .map_err(RconError::ConnectionLost)?;

        Self::decode_frame(&frame)
    }
}
