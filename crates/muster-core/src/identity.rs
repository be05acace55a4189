//! Identity and credential payloads exchanged during the join handshake.
//!
//! Both travel only inside the sealed envelope (see `sealed`). The identity
//! is used to authenticate a joining peer; nothing in it is trusted for
//! authorization beyond origin-address sanity checks.

use std::net::IpAddr;

use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// What a connecting peer claims about itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    /// Routable address the peer claims to connect from.
    pub addr: IpAddr,
    /// Stable hardware identifier (machine id). Preferred correlation key.
    pub hardware_id: String,
    pub os: String,
    pub arch: String,
    /// Agent software/protocol version string.
    pub version: String,
    /// How often the peer intends to heartbeat, in seconds. A hint only;
    /// the broker derives its session read timeout from it.
    pub heartbeat_secs: u64,
    /// Unix timestamp (seconds) at which the peer asserted this identity.
    pub asserted_at: u64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("loopback address not routable: {0}")]
    Loopback(IpAddr),
    #[error("unspecified address not routable: {0}")]
    Unspecified(IpAddr),
}

impl Identity {
    /// Origin-address sanity check. Loopback and unspecified addresses are
    /// never accepted — a real fleet peer always has a routable address.
    pub fn validate(&self) -> Result<(), IdentityError> {
        if self.addr.is_loopback() {
            return Err(IdentityError::Loopback(self.addr));
        }
        if self.addr.is_unspecified() {
            return Err(IdentityError::Unspecified(self.addr));
        }
        Ok(())
    }

    /// Correlation key for the durable peer record: the hardware id when
    /// present, the claimed address otherwise.
    pub fn correlation_key(&self) -> String {
        if self.hardware_id.is_empty() {
            self.addr.to_string()
        } else {
            self.hardware_id.clone()
        }
    }
}

/// Issued by the broker on a successful handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    /// The durable numeric identifier assigned to this peer. All dispatch
    /// addressing uses this id.
    pub id: u64,
    /// Optional session secret used to obfuscate subsequent frames on the
    /// multiplexed session. Absent when obfuscation is disabled.
    pub session_secret: Option<Vec<u8>>,
}

/// Session secrets are sized randomly within this range so that sealed
/// credential payloads do not have a single fingerprintable length.
pub const SECRET_LEN_MIN: usize = 32;
pub const SECRET_LEN_MAX: usize = 64;

impl Credential {
    /// Synthesize a credential for `id`, generating a fresh session secret
    /// when `with_secret` is set.
    pub fn issue(id: u64, with_secret: bool) -> Self {
        let session_secret = with_secret.then(|| {
            let mut rng = rand::thread_rng();
            let len = rng.gen_range(SECRET_LEN_MIN..=SECRET_LEN_MAX);
            let mut secret = vec![0u8; len];
            rng.fill_bytes(&mut secret);
            secret
        });
        Self { id, session_secret }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(addr: &str) -> Identity {
        Identity {
            addr: addr.parse().unwrap(),
            hardware_id: "hw-1".into(),
            os: "linux".into(),
            arch: "x86_64".into(),
            version: "1.0.0".into(),
            heartbeat_secs: 15,
            asserted_at: 1_700_000_000,
        }
    }

    #[test]
    fn validate_rejects_loopback() {
        assert!(matches!(
            identity("127.0.0.1").validate(),
            Err(IdentityError::Loopback(_))
        ));
        assert!(matches!(
            identity("::1").validate(),
            Err(IdentityError::Loopback(_))
        ));
    }

    #[test]
    fn validate_rejects_unspecified() {
        assert!(matches!(
            identity("0.0.0.0").validate(),
            Err(IdentityError::Unspecified(_))
        ));
    }

    #[test]
    fn validate_accepts_routable() {
        assert!(identity("10.1.2.3").validate().is_ok());
    }

    #[test]
    fn correlation_key_prefers_hardware_id() {
        let mut id = identity("10.1.2.3");
        assert_eq!(id.correlation_key(), "hw-1");
        id.hardware_id.clear();
        assert_eq!(id.correlation_key(), "10.1.2.3");
    }

    #[test]
    fn issued_secret_length_in_range() {
        for _ in 0..50 {
            let cred = Credential::issue(1, true);
            let len = cred.session_secret.unwrap().len();
            assert!((SECRET_LEN_MIN..=SECRET_LEN_MAX).contains(&len));
        }
    }

    #[test]
    fn issue_without_secret() {
        assert!(Credential::issue(1, false).session_secret.is_none());
    }
}
