//! Site identity: a stable 16-byte identifier for one replica.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{SyncError, Result};

/// A replica's stable identity. Version-4 UUID-shaped (version nibble = 4,
/// variant bits = `10`), generated once per replica and immutable for its
/// lifetime.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SiteId(Uuid);

impl SiteId {
    pub const BYTE_LEN: usize = 16;

    /// Generates a fresh, random site identity.
    pub fn generate() -> Self {
        SiteId(Uuid::new_v4())
    }

    /// Wraps a caller-provided UUID as a site identity, e.g. one restored from
    /// a previous run or supplied by the host at open time.
    pub fn from_uuid(uuid: Uuid) -> Self {
        SiteId(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    pub fn to_bytes(&self) -> [u8; Self::BYTE_LEN] {
        *self.0.as_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; 16] = bytes
            .try_into()
            .map_err(|_| SyncError::corrupt(bytes, "site id must be exactly 16 bytes"))?;
        Ok(SiteId(Uuid::from_bytes(arr)))
    }

    pub fn to_hex(&self) -> String {
        self.0.simple().to_string()
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(SiteId)
            .map_err(|e| SyncError::corrupt(s.as_bytes(), e.to_string()))
    }

    /// Base64url (no padding) text form, 22 characters, for diagnostics.
    pub fn to_base64url(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.to_bytes())
    }

    pub fn from_base64url(s: &str) -> Result<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(s)
            .map_err(|e| SyncError::corrupt(s.as_bytes(), e.to_string()))?;
        Self::from_bytes(&bytes)
    }
}

impl std::fmt::Debug for SiteId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SiteId({})", self.0)
    }
}

impl std::fmt::Display for SiteId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Persisted record of a replica's own identity: the id plus when it was
/// minted, written once at engine open and never again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteIdentityRecord {
    pub site_id: SiteId,
    pub created_at_millis: u64,
}
