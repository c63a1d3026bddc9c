//! Framed wire protocol between server and client
//!
//! A long-lived TCP stream carries tagged frames. Each frame on the wire is:
//! one tag byte, a 4-byte big-endian payload length, a 32-byte keyed MAC over
//! (tag ‖ length ‖ payload), then the payload. The MAC key is derived from
//! the pre-shared authentication key, so a peer without the key cannot forge
//! or replay-modify frames; a MAC mismatch or malformed frame closes the
//! connection.
//!
//! Logical channels are multiplexed by tag: `BundleOut` (server→client),
//! `BundleIn` and `Heartbeat` (client→server), `Disconnect` (server→client)
//! and `Ack` (either direction). `Hello`/`Welcome` perform the handshake.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::HyperShellError;

/// Upper bound on a single frame payload. Bundles are bounded by bundlesize,
/// so anything larger than this is a corrupt or hostile stream.
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// Key derivation context for the frame MAC.
const MAC_CONTEXT: &str = "hypershell 2024 frame authentication";

/// Frame tags multiplexing the logical channels over one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameTag {
    /// Client handshake: client id, host and the authentication token
    Hello = 0x01,
    /// Server handshake reply: server id and host
    Welcome = 0x02,
    /// Bundle of scheduled tasks, server to client
    BundleOut = 0x03,
    /// Bundle of completed tasks, client to server
    BundleIn = 0x04,
    /// Liveness signal, client to server
    Heartbeat = 0x05,
    /// Drain request, server to client
    Disconnect = 0x06,
    /// Delivery acknowledgment
    Ack = 0x07,
}

impl FrameTag {
    /// Decode a wire byte into a tag.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(FrameTag::Hello),
            0x02 => Some(FrameTag::Welcome),
            0x03 => Some(FrameTag::BundleOut),
            0x04 => Some(FrameTag::BundleIn),
            0x05 => Some(FrameTag::Heartbeat),
            0x06 => Some(FrameTag::Disconnect),
            0x07 => Some(FrameTag::Ack),
            _ => None,
        }
    }
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub tag: FrameTag,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Deserialize the JSON payload into a message type.
    pub fn decode<T: DeserializeOwned>(&self) -> crate::Result<T> {
        serde_json::from_slice(&self.payload).map_err(|e| {
            HyperShellError::Transport(format!("malformed {:?} payload: {}", self.tag, e)).into()
        })
    }
}

/// MAC key derived from the pre-shared authentication key.
#[derive(Clone)]
pub struct FrameKey([u8; 32]);

impl FrameKey {
    /// Derive the frame MAC key from the configured auth secret.
    pub fn derive(auth: &str) -> Self {
        Self(blake3::derive_key(MAC_CONTEXT, auth.as_bytes()))
    }

    fn mac(&self, tag: u8, payload: &[u8]) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new_keyed(&self.0);
        hasher.update(&[tag]);
        hasher.update(&(payload.len() as u32).to_be_bytes());
        hasher.update(payload);
        *hasher.finalize().as_bytes()
    }
}

/// Write one frame: tag, length, MAC, payload.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    key: &FrameKey,
    tag: FrameTag,
    payload: &[u8],
) -> crate::Result<()> {
    if payload.len() as u64 > MAX_FRAME_LEN as u64 {
        return Err(HyperShellError::Transport(format!(
            "outgoing frame of {} bytes exceeds limit",
            payload.len()
        ))
        .into());
    }
    let mac = key.mac(tag as u8, payload);
    let mut buf = Vec::with_capacity(1 + 4 + 32 + payload.len());
    buf.push(tag as u8);
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&mac);
    buf.extend_from_slice(payload);
    writer
        .write_all(&buf)
        .await
        .map_err(|e| HyperShellError::Transport(format!("write failed: {}", e)))?;
    writer
        .flush()
        .await
        .map_err(|e| HyperShellError::Transport(format!("flush failed: {}", e)))?;
    Ok(())
}

/// Serialize a message as JSON and write it as one frame.
pub async fn write_message<W: AsyncWrite + Unpin, T: Serialize>(
    writer: &mut W,
    key: &FrameKey,
    tag: FrameTag,
    message: &T,
) -> crate::Result<()> {
    let payload = serde_json::to_vec(message)
        .map_err(|e| HyperShellError::Transport(format!("cannot encode {:?}: {}", tag, e)))?;
    write_frame(writer, key, tag, &payload).await
}

/// Read one frame, verifying the MAC.
///
/// Returns `Ok(None)` on a clean end-of-stream at a frame boundary. Any
/// malformed header, oversized length or MAC mismatch is a transport error;
/// the caller must drop the connection.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    key: &FrameKey,
) -> crate::Result<Option<Frame>> {
    let tag_byte = match reader.read_u8().await {
        Ok(byte) => byte,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(HyperShellError::Transport(format!("read failed: {}", e)).into()),
    };
    let tag = FrameTag::from_byte(tag_byte)
        .ok_or_else(|| HyperShellError::Transport(format!("unknown frame tag {:#04x}", tag_byte)))?;

    let length = reader
        .read_u32()
        .await
        .map_err(|e| HyperShellError::Transport(format!("truncated frame header: {}", e)))?;
    if length > MAX_FRAME_LEN {
        return Err(HyperShellError::Transport(format!(
            "frame length {} exceeds limit",
            length
        ))
        .into());
    }

    let mut mac = [0u8; 32];
    reader
        .read_exact(&mut mac)
        .await
        .map_err(|e| HyperShellError::Transport(format!("truncated frame MAC: {}", e)))?;

    let mut payload = vec![0u8; length as usize];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| HyperShellError::Transport(format!("truncated frame payload: {}", e)))?;

    // blake3::Hash comparison is constant-time.
    let expected = blake3::Hash::from(key.mac(tag as u8, &payload));
    if expected != blake3::Hash::from(mac) {
        return Err(HyperShellError::Auth("frame MAC mismatch".to_string()).into());
    }

    Ok(Some(Frame { tag, payload }))
}

/// Client handshake message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Hello {
    pub client_id: Uuid,
    pub client_host: String,
    /// Pre-shared authentication token, compared in constant time by the
    /// server before any registration is created.
    pub token: String,
}

/// Server handshake reply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Welcome {
    pub server_id: Uuid,
    pub server_host: String,
}

/// Liveness signal from a registered client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Heartbeat {
    pub client_id: Uuid,
}

/// Constant-time comparison of the handshake token against the configured
/// secret.
pub fn token_matches(provided: &str, expected: &str) -> bool {
    use subtle::ConstantTimeEq;
    let provided = provided.as_bytes();
    let expected = expected.as_bytes();
    provided.len() == expected.len() && bool::from(provided.ct_eq(expected))
}
