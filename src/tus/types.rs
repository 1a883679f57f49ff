//! Upload types for the tus protocol

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::metadata::UploadMetadata;

// ============================================================================
// Constants
// ============================================================================

/// Protocol version spoken by this server
pub const TUS_VERSION: &str = "1.0.0";

/// Extensions advertised in `Tus-Extension`
pub const TUS_EXTENSIONS: &str = "creation,creation-defer-length,termination,checksum,expiration";

/// Default resource lifetime: 24 hours
pub const DEFAULT_EXPIRY_HOURS: i64 = 24;

/// Longest caller-supplied resource id accepted
pub const MAX_RESOURCE_ID_LEN: usize = 128;

// ============================================================================
// Resource Identity
// ============================================================================

/// Opaque upload resource identifier.
///
/// Generated ids are simple-form UUIDs. Caller-supplied ids are restricted to
/// URL-safe characters so they can be embedded in a resource URL and used as
/// a file stem by the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceId(String);

impl ResourceId {
    /// Generate a fresh random id
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Validate a caller-supplied id
    pub fn parse(s: &str) -> Result<Self, TusError> {
        let valid = !s.is_empty()
            && s.len() <= MAX_RESOURCE_ID_LEN
            && s
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');

        if !valid {
            return Err(TusError::InvalidId(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ResourceId {
    type Err = TusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ResourceId {
    type Error = TusError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ResourceId> for String {
    fn from(id: ResourceId) -> Self {
        id.0
    }
}

// ============================================================================
// Upload Length
// ============================================================================

/// Declared final size of an upload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadLength {
    /// Final size known
    Known(u64),
    /// Size will be declared by a later PATCH
    Deferred,
}

impl UploadLength {
    /// The declared size, if known
    pub fn known(&self) -> Option<u64> {
        match self {
            Self::Known(n) => Some(*n),
            Self::Deferred => None,
        }
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self, Self::Deferred)
    }
}

// ============================================================================
// Upload Resource
// ============================================================================

/// Registry record for a single upload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResource {
    /// Resource identifier
    pub id: ResourceId,

    /// Declared final length
    pub length: UploadLength,

    /// Bytes durably received so far
    pub offset: u64,

    /// Client metadata supplied at creation
    #[serde(default)]
    pub metadata: UploadMetadata,

    /// Creation time
    pub created_at: DateTime<Utc>,

    /// After this instant the resource is invalid
    pub expires_at: DateTime<Utc>,
}

impl UploadResource {
    /// Create a fresh resource at offset zero
    pub fn new(
        id: ResourceId,
        length: UploadLength,
        metadata: UploadMetadata,
        expiry: chrono::Duration,
    ) -> Self {
        let now = Utc::now();

        Self {
            id,
            length,
            offset: 0,
            metadata,
            created_at: now,
            expires_at: now + expiry,
        }
    }

    /// Check if resource has expired
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// True iff the length is known and every byte has been received
    pub fn is_complete(&self) -> bool {
        self.length.known() == Some(self.offset)
    }

    /// Lifecycle state derived from offset, length and expiry
    pub fn state(&self) -> ResourceState {
        if self.is_expired() {
            ResourceState::Expired
        } else if self.is_complete() {
            ResourceState::Completed
        } else if self.offset == 0 {
            ResourceState::Created
        } else {
            ResourceState::Uploading
        }
    }

    /// Read-only snapshot handed to the HTTP layer
    pub fn status(&self) -> ResourceStatus {
        ResourceStatus {
            id: self.id.clone(),
            offset: self.offset,
            length: self.length,
            completed: self.is_complete(),
            state: self.state(),
            created_at: self.created_at,
            expires_at: self.expires_at,
            metadata: self.metadata.clone(),
        }
    }
}

/// Lifecycle state of a live resource.
///
/// `Deleted` has no variant: a deleted resource no longer has a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceState {
    /// Offset is zero
    Created,
    /// Some bytes received, more expected
    Uploading,
    /// Offset equals the declared length
    Completed,
    /// Past `expires_at`, awaiting the sweep
    Expired,
}

// ============================================================================
// Operation Results
// ============================================================================

/// Result of a HEAD
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatus {
    pub id: ResourceId,
    pub offset: u64,
    pub length: UploadLength,
    pub completed: bool,
    pub state: ResourceState,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub metadata: UploadMetadata,
}

/// Result of an accepted PATCH
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchOutcome {
    /// Offset after the chunk was applied
    pub offset: u64,

    /// Whether the upload is now complete
    pub completed: bool,

    pub expires_at: DateTime<Utc>,
}

// ============================================================================
// Error Types
// ============================================================================

/// Upload error types
#[derive(Debug, thiserror::Error)]
pub enum TusError {
    #[error("Upload already exists: {0}")]
    AlreadyExists(String),

    #[error("Upload not found: {0}")]
    NotFound(String),

    #[error("Upload gone: {0}")]
    Gone(String),

    #[error("Offset mismatch: upload is at {current}, request claimed {claimed}")]
    OffsetMismatch { current: u64, claimed: u64 },

    #[error("Upload length exceeded: {attempted} bytes (limit: {limit})")]
    LengthExceeded { attempted: u64, limit: u64 },

    #[error("Invalid upload length: {0}")]
    InvalidLength(String),

    #[error("Checksum mismatch for {algorithm}")]
    ChecksumMismatch { algorithm: String },

    #[error("Unsupported checksum algorithm: {0}")]
    UnsupportedChecksum(String),

    #[error("Invalid resource id: {0}")]
    InvalidId(String),

    #[error("Upload incomplete: {0}")]
    Incomplete(String),

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(String),

    #[error("Unsupported media type: {0}")]
    UnsupportedMediaType(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Storage I/O failure: {0}")]
    IoFailure(#[from] std::io::Error),

    #[error("Record serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TusError {
    /// Get HTTP status code for this error
    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Self::AlreadyExists(_) => StatusCode::CONFLICT,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Gone(_) => StatusCode::GONE,
            Self::OffsetMismatch { .. } => StatusCode::CONFLICT,
            Self::LengthExceeded { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::InvalidLength(_) => StatusCode::BAD_REQUEST,
            // 460 is tus-specific, not a registered code
            Self::ChecksumMismatch { .. } => {
                StatusCode::from_u16(460).unwrap_or(StatusCode::BAD_REQUEST)
            }
            Self::UnsupportedChecksum(_) => StatusCode::BAD_REQUEST,
            Self::InvalidId(_) => StatusCode::BAD_REQUEST,
            Self::Incomplete(_) => StatusCode::CONFLICT,
            Self::UnsupportedVersion(_) => StatusCode::PRECONDITION_FAILED,
            Self::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::IoFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether a store operation failing with this error is worth retrying
    pub fn is_transient(&self) -> bool {
        use std::io::ErrorKind;
        match self {
            Self::IoFailure(e) => matches!(
                e.kind(),
                ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_id_validation() {
        assert!(ResourceId::parse("report_2024-final").is_ok());
        assert!(ResourceId::parse("").is_err());
        assert!(ResourceId::parse("../etc/passwd").is_err());
        assert!(ResourceId::parse("has space").is_err());
        assert!(ResourceId::parse(&"a".repeat(MAX_RESOURCE_ID_LEN + 1)).is_err());

        let generated = ResourceId::generate();
        assert_eq!(generated.as_str().len(), 32);
        assert!(ResourceId::parse(generated.as_str()).is_ok());
    }

    #[test]
    fn test_resource_state_transitions() {
        let mut resource = UploadResource::new(
            ResourceId::generate(),
            UploadLength::Known(10),
            UploadMetadata::default(),
            chrono::Duration::hours(1),
        );
        assert_eq!(resource.state(), ResourceState::Created);

        resource.offset = 4;
        assert_eq!(resource.state(), ResourceState::Uploading);
        assert!(!resource.is_complete());

        resource.offset = 10;
        assert_eq!(resource.state(), ResourceState::Completed);
        assert!(resource.status().completed);

        resource.expires_at = Utc::now() - chrono::Duration::seconds(1);
        assert_eq!(resource.state(), ResourceState::Expired);
    }

    #[test]
    fn test_deferred_length_never_complete() {
        let resource = UploadResource::new(
            ResourceId::generate(),
            UploadLength::Deferred,
            UploadMetadata::default(),
            chrono::Duration::hours(1),
        );
        assert!(!resource.is_complete());
        assert_eq!(resource.length.known(), None);
    }

    #[test]
    fn test_record_json_shape() {
        let resource = UploadResource::new(
            ResourceId::parse("abc").unwrap(),
            UploadLength::Known(5),
            UploadMetadata::parse("filename d29ybGQ=").unwrap(),
            chrono::Duration::hours(1),
        );

        let json = serde_json::to_value(&resource).unwrap();
        assert_eq!(json["id"], "abc");
        assert_eq!(json["length"]["known"], 5);
        assert_eq!(json["metadata"], "filename d29ybGQ=");

        let back: UploadResource = serde_json::from_value(json).unwrap();
        assert_eq!(back, resource);
    }

    #[test]
    fn test_status_codes() {
        use axum::http::StatusCode;

        assert_eq!(
            TusError::OffsetMismatch { current: 1, claimed: 0 }.status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(TusError::Gone("x".into()).status_code(), StatusCode::GONE);
        assert_eq!(
            TusError::ChecksumMismatch { algorithm: "sha256".into() }
                .status_code()
                .as_u16(),
            460
        );
    }
}
