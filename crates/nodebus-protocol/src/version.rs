//! Link protocol versioning.
//!
//! Manager and child are usually the same executable, but a manager can be
//! configured to start a different program. The child announces its version
//! in `Hello`; the manager refuses it unless the major versions match.
//!
//! - 1.0: first link protocol
//! - 2.0: `Reply` names the request it answers, `Welcome` carries the
//!   child's outbound queue capacity

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Current link protocol version.
pub const PROTOCOL_VERSION: Version = Version::new(2, 0);

/// Link protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    /// Bumped when an existing frame changes shape.
    pub major: u8,
    /// Bumped when frames or optional fields are added.
    pub minor: u8,
}

/// A peer announced a link protocol this side cannot speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("peer speaks link protocol {peer}, expected {local}")]
pub struct VersionMismatch {
    /// Version of this side.
    pub local: Version,
    /// Version the peer announced.
    pub peer: Version,
}

impl Version {
    /// Create a new version.
    #[must_use]
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// Check the version a peer announced against this one.
    ///
    /// # Errors
    ///
    /// Returns the mismatch if the major versions differ.
    pub fn check_peer(self, peer: Version) -> Result<(), VersionMismatch> {
        if self.major == peer.major {
            Ok(())
        } else {
            Err(VersionMismatch { local: self, peer })
        }
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minor_versions_share_a_link() {
        let newer_child = Version::new(PROTOCOL_VERSION.major, PROTOCOL_VERSION.minor + 3);
        assert_eq!(PROTOCOL_VERSION.check_peer(newer_child), Ok(()));
        assert_eq!(newer_child.check_peer(PROTOCOL_VERSION), Ok(()));
    }

    #[test]
    fn test_first_protocol_is_refused() {
        let old_child = Version::new(1, 0);
        let mismatch = PROTOCOL_VERSION.check_peer(old_child).unwrap_err();

        assert_eq!(mismatch.peer, old_child);
        assert_eq!(
            mismatch.to_string(),
            "peer speaks link protocol 1.0, expected 2.0"
        );
    }
}
