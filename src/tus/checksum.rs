//! `Upload-Checksum` verification
//!
//! Header form: `<algorithm> <base64 digest>`. The chunk is verified before
//! any byte reaches the store.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use sha2::{Digest, Sha256, Sha512};

use super::types::TusError;

/// Algorithms advertised in `Tus-Checksum-Algorithm`
pub const SUPPORTED_ALGORITHMS: &str = "sha256,sha512";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumAlgorithm {
    Sha256,
    Sha512,
}

impl ChecksumAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        }
    }

    fn digest(&self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::Sha256 => Sha256::digest(data).to_vec(),
            Self::Sha512 => Sha512::digest(data).to_vec(),
        }
    }
}

/// A parsed `Upload-Checksum` header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadChecksum {
    pub algorithm: ChecksumAlgorithm,
    pub digest: Vec<u8>,
}

impl UploadChecksum {
    pub fn parse(header: &str) -> Result<Self, TusError> {
        let (name, encoded) = header
            .trim()
            .split_once(' ')
            .ok_or_else(|| TusError::BadRequest(format!("malformed Upload-Checksum: {header}")))?;

        let algorithm = match name.to_ascii_lowercase().as_str() {
            "sha256" => ChecksumAlgorithm::Sha256,
            "sha512" => ChecksumAlgorithm::Sha512,
            other => return Err(TusError::UnsupportedChecksum(other.to_string())),
        };

        let digest = STANDARD
            .decode(encoded.trim())
            .map_err(|e| TusError::BadRequest(format!("checksum digest is not base64: {e}")))?;

        Ok(Self { algorithm, digest })
    }

    /// Compute the header value for a chunk
    pub fn compute(algorithm: ChecksumAlgorithm, data: &[u8]) -> Self {
        Self {
            algorithm,
            digest: algorithm.digest(data),
        }
    }

    pub fn verify(&self, data: &[u8]) -> Result<(), TusError> {
        if self.algorithm.digest(data) != self.digest {
            return Err(TusError::ChecksumMismatch {
                algorithm: self.algorithm.name().to_string(),
            });
        }
        Ok(())
    }

    pub fn to_header(&self) -> String {
        format!("{} {}", self.algorithm.name(), STANDARD.encode(&self.digest))
    }
}
