//! Frame I/O and payload obfuscation for multiplexed sessions.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use zerocopy::{AsBytes, FromBytes};

use muster_core::wire::{FrameHeader, KIND_CLOSE, KIND_DATA, KIND_GOAWAY, KIND_OPEN, KIND_PING};

/// One frame, header fields plus owned payload. Payload is mutable so the
/// pumps can apply the obfuscation keystream in place.
#[derive(Debug)]
pub struct Frame {
    pub stream_id: u32,
    pub kind: u8,
    pub payload: BytesMut,
}

impl Frame {
    pub fn open(stream_id: u32) -> Self {
        Self {
            stream_id,
            kind: KIND_OPEN,
            payload: BytesMut::new(),
        }
    }

    pub fn data(stream_id: u32, payload: BytesMut) -> Self {
        Self {
            stream_id,
            kind: KIND_DATA,
            payload,
        }
    }

    pub fn close(stream_id: u32) -> Self {
        Self {
            stream_id,
            kind: KIND_CLOSE,
            payload: BytesMut::new(),
        }
    }

    pub fn goaway() -> Self {
        Self {
            stream_id: 0,
            kind: KIND_GOAWAY,
            payload: BytesMut::new(),
        }
    }

    pub fn ping() -> Self {
        Self {
            stream_id: 0,
            kind: KIND_PING,
            payload: BytesMut::new(),
        }
    }
}

/// Read one frame. A frame announcing more than `max_payload` bytes is a
/// protocol error surfaced as `InvalidData` — the session must die.
pub async fn read_frame<R: AsyncRead + Unpin>(
    r: &mut R,
    max_payload: u32,
) -> std::io::Result<Frame> {
    let mut head = [0u8; std::mem::size_of::<FrameHeader>()];
    r.read_exact(&mut head).await?;

    let header = FrameHeader::read_from(&head[..]).ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidData, "unparseable frame header")
    })?;
    let (stream_id, length, kind) = (header.stream_id, header.length, header.kind);

    if length > max_payload {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame payload {length} exceeds limit {max_payload}"),
        ));
    }

    let mut payload = BytesMut::zeroed(length as usize);
    if length > 0 {
        r.read_exact(&mut payload).await?;
    }

    Ok(Frame {
        stream_id,
        kind,
        payload,
    })
}

/// Write one frame and flush it.
pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &Frame) -> std::io::Result<()> {
    let header = FrameHeader {
        stream_id: frame.stream_id,
        length: frame.payload.len() as u32,
        kind: frame.kind,
        flags: 0,
        reserved: [0; 2],
    };
    w.write_all(header.as_bytes()).await?;
    if !frame.payload.is_empty() {
        w.write_all(&frame.payload).await?;
    }
    w.flush().await
}

// ── Obfuscation ───────────────────────────────────────────────────────────────

/// Derive the frame obfuscation key from an issued session secret.
pub fn obfuscation_key(secret: &[u8]) -> [u8; 32] {
    *blake3::hash(secret).as_bytes()
}

/// XOR `buf` with a BLAKE3-XOF keystream bound to this stream and this
/// direction's data-frame sequence number. Symmetric: applying it twice
/// restores the input. This is traffic obfuscation, not encryption.
pub fn keystream_xor(key: &[u8; 32], stream_id: u32, seq: u64, buf: &mut [u8]) {
    if buf.is_empty() {
        return;
    }
    let mut hasher = blake3::Hasher::new_keyed(key);
    hasher.update(&stream_id.to_le_bytes());
    hasher.update(&seq.to_le_bytes());

    let mut keystream = vec![0u8; buf.len()];
    hasher.finalize_xof().fill(&mut keystream);
    for (b, k) in buf.iter_mut().zip(keystream) {
        *b ^= k;
    }
}
