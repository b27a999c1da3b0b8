//! Wire framing for session messages.
//!
//! Every frame is a 4-byte big-endian length header followed by a JSON
//! [`WireEnvelope`]. The envelope carries the protocol version so that a
//! mismatched peer is rejected instead of being misread.

use peerlink_types::{SessionMessage, WireError, WireResult};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Current protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Size of the length header.
pub const HEADER_LEN: usize = 4;

/// A framed session message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireEnvelope<'a> {
    /// Framing version of the sender.
    pub protocol_version: u32,
    /// The carried message.
    pub message: Cow<'a, SessionMessage>,
}

/// Encode a message to bytes (4-byte big-endian length + JSON).
pub fn encode_frame(message: &SessionMessage, max_size: usize) -> WireResult<Vec<u8>> {
    let envelope = WireEnvelope {
        protocol_version: PROTOCOL_VERSION,
        message: Cow::Borrowed(message),
    };
    let json = serde_json::to_vec(&envelope)?;
    if json.len() > max_size {
        return Err(WireError::MessageTooLarge {
            size: json.len(),
            max: max_size,
        });
    }
    let len = json.len() as u32;
    let mut bytes = Vec::with_capacity(HEADER_LEN + json.len());
    bytes.extend_from_slice(&len.to_be_bytes());
    bytes.extend_from_slice(&json);
    Ok(bytes)
}

/// Decode the length prefix from a 4-byte header.
pub fn decode_length(header: &[u8; HEADER_LEN]) -> u32 {
    u32::from_be_bytes(*header)
}

/// Parse a JSON body into a message, checking the protocol version.
pub fn decode_frame(body: &[u8]) -> WireResult<SessionMessage> {
    let envelope: WireEnvelope<'static> = serde_json::from_slice(body)?;
    if envelope.protocol_version != PROTOCOL_VERSION {
        return Err(WireError::VersionMismatch {
            local: PROTOCOL_VERSION,
            remote: envelope.protocol_version,
        });
    }
    Ok(envelope.message.into_owned())
}

/// Write a framed message to a stream.
pub async fn write_frame<W>(
    writer: &mut W,
    message: &SessionMessage,
    max_size: usize,
) -> WireResult<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = encode_frame(message, max_size)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a framed message from a stream.
///
/// A clean EOF before the header is reported as [`WireError::ConnectionClosed`];
/// EOF inside a frame is an I/O error.
pub async fn read_frame<R>(reader: &mut R, max_size: usize) -> WireResult<SessionMessage>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(WireError::ConnectionClosed);
        }
        Err(e) => return Err(WireError::Io(e)),
    }

    let len = decode_length(&header) as usize;
    if len > max_size {
        return Err(WireError::MessageTooLarge {
            size: len,
            max: max_size,
        });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;

    decode_frame(&body)
}
