//! muster wire format — on-wire types shared by broker and agents.
//!
//! Two layers live here:
//!   1. The multiplexing frame header that every logical-stream message
//!      rides on after the handshake.
//!   2. The HTTP-shaped join exchange constants and the problem payload
//!      returned on rejection.
//!
//! All fixed-layout types are #[repr(C, packed)] for deterministic layout
//! and use zerocopy derives for safe, allocation-free serialization.
//! Changing any field or size here is a breaking protocol change.

use serde::{Deserialize, Serialize};
use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

// ── Mux frames ────────────────────────────────────────────────────────────────

/// Header preceding every frame on a multiplexed session.
///
/// Wire size: 12 bytes, little-endian integers.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct FrameHeader {
    /// Logical stream this frame belongs to. Streams opened by the
    /// connection initiator use odd ids, the acceptor even ids.
    pub stream_id: u32,

    /// Payload length in bytes, not including this header.
    pub length: u32,

    /// Frame kind — one of the `KIND_*` constants.
    pub kind: u8,

    /// Reserved, must be zero.
    pub flags: u8,

    /// Reserved, must be zero.
    pub reserved: [u8; 2],
}

// Compile-time size guard. If this fails, the wire format has silently changed.
assert_eq_size!(FrameHeader, [u8; 12]);

/// Open a new logical stream. No payload.
pub const KIND_OPEN: u8 = 1;
/// One message on an open logical stream.
pub const KIND_DATA: u8 = 2;
/// Half of a stream is done; the stream is discarded on receipt.
pub const KIND_CLOSE: u8 = 3;
/// Session-level shutdown. The receiver stops reading and tears down.
pub const KIND_GOAWAY: u8 = 4;
/// Protocol-level keepalive. Ignored beyond resetting the read timeout.
pub const KIND_PING: u8 = 5;

/// Largest payload a single frame may carry. A frame announcing more than
/// this is a protocol error and kills the whole session.
pub const MAX_FRAME_PAYLOAD: u32 = 256 * 1024;

// ── Join exchange ─────────────────────────────────────────────────────────────

/// Fixed path of the CONNECT-style join request.
pub const JOIN_PATH: &str = "/muster/join";

/// Upper bound on the sealed identity payload a joining peer may send.
pub const MAX_IDENTITY_PAYLOAD: usize = 100 * 1024;

/// Status codes used by the join exchange. `ACCEPTED` is deliberately not
/// plain 200 so that a middlebox answering 200 is never mistaken for a
/// successful join.
pub mod status {
    pub const OK: u16 = 200;
    pub const ACCEPTED: u16 = 202;
    pub const BAD_IDENTITY: u16 = 400;
    pub const FORBIDDEN: u16 = 403;
    pub const NOT_FOUND: u16 = 404;
    pub const NOT_ACTIVE: u16 = 406;
    pub const ALREADY_ONLINE: u16 = 409;
    pub const RATE_LIMITED: u16 = 429;
    pub const INTERNAL: u16 = 500;
}

/// Machine-readable rejection payload (RFC 7807 shape).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Problem {
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    pub instance: String,
}

impl Problem {
    pub fn new(status: u16, title: &str, detail: String, instance: String) -> Self {
        Self {
            kind: format!("https://muster.dev/problems/{status}"),
            title: title.to_string(),
            status,
            detail,
            instance,
        }
    }
}

// ── RPC envelopes ─────────────────────────────────────────────────────────────

/// One request on a logical stream. The target peer is addressed out of
/// band (the stringified identifier resolved locally), never on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub path: String,
    #[serde(default)]
    pub body: serde_json::Value,
}

/// One response on a logical stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub status: u16,
    #[serde(default)]
    pub body: serde_json::Value,
}

impl RpcResponse {
    pub fn ok(body: serde_json::Value) -> Self {
        Self {
            status: status::OK,
            body,
        }
    }

    pub fn error(status: u16, detail: &str) -> Self {
        Self {
            status,
            body: serde_json::json!({ "detail": detail }),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status < 400
    }
}

// ── Dispatch paths ────────────────────────────────────────────────────────────

/// Fixed RPC paths consumed by collaborators. Payload schemas are owned by
/// the collaborator behind each path, not by this crate.
pub mod paths {
    /// Agent → broker application-level heartbeat.
    pub const HEARTBEAT: &str = "/agent/heartbeat";
    /// Broker → agent: pull current task execution status.
    pub const TASK_STATUS_PULL: &str = "/task/status";
    /// Broker → agent: push a task diff for reconciliation.
    pub const TASK_DIFF_PUSH: &str = "/task/diff";
    /// Broker → agent: push startup configuration.
    pub const STARTUP_CONFIG_PUSH: &str = "/config/startup";
    /// Broker → agent: upgrade notice.
    pub const UPGRADE_NOTICE: &str = "/notice/upgrade";
    /// Broker → agent: ad-hoc command notice.
    pub const COMMAND_NOTICE: &str = "/notice/command";
    /// Broker → agent: third-party file diff notice.
    pub const THIRD_FILE_DIFF_NOTICE: &str = "/notice/third-file-diff";
}
