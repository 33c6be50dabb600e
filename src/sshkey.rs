//! OpenSSH public key fingerprints
//!
//! The identity service stores key fingerprints as the legacy MD5 form:
//! sixteen lowercase hex bytes joined by colons, computed over the decoded
//! key blob. Anything else never matches a stored row.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use md5::{Digest, Md5};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SshKeyError {
    #[error("empty public key")]
    Empty,
    #[error("public key is not valid base64")]
    InvalidEncoding,
    #[error("public key blob is truncated")]
    Truncated,
    #[error("declared key type {declared} does not match blob type {actual}")]
    TypeMismatch { declared: String, actual: String },
}

/// Parsed public key: algorithm name and raw wire-format blob
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey {
    pub algorithm: String,
    pub blob: Vec<u8>,
}

impl PublicKey {
    /// Parse an authorized_keys style line (`type base64 [comment]`) or a
    /// bare base64 blob
    pub fn parse(input: &str) -> Result<Self, SshKeyError> {
        let mut fields = input.split_whitespace();
        let first = fields.next().ok_or(SshKeyError::Empty)?;

        let (declared, encoded) = match fields.next() {
            Some(second) if !looks_like_blob(first) => (Some(first), second),
            _ => (None, first),
        };

        let blob = STANDARD
            .decode(encoded)
            .map_err(|_| SshKeyError::InvalidEncoding)?;
        let algorithm = read_string(&blob).ok_or(SshKeyError::Truncated)?;

        if let Some(declared) = declared {
            if declared != algorithm {
                return Err(SshKeyError::TypeMismatch {
                    declared: declared.to_string(),
                    actual: algorithm,
                });
            }
        }

        Ok(Self { algorithm, blob })
    }

    /// `aa:bb:...` over MD5 of the blob
    pub fn fingerprint(&self) -> String {
        let digest = Md5::digest(&self.blob);
        digest
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<Vec<_>>()
            .join(":")
    }
}

/// Fingerprint a key given in authorized_keys or bare base64 form
pub fn fingerprint(public_key: &str) -> Result<String, SshKeyError> {
    PublicKey::parse(public_key).map(|key| key.fingerprint())
}

// Every OpenSSH blob starts with a u32 length prefix, which base64-encodes to "AAAA"
fn looks_like_blob(field: &str) -> bool {
    field.starts_with("AAAA")
}

fn read_string(blob: &[u8]) -> Option<String> {
    let len_bytes: [u8; 4] = blob.get(..4)?.try_into().ok()?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    let raw = blob.get(4..4 + len)?;
    String::from_utf8(raw.to_vec()).ok()
}
