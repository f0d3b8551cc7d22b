//! JOSE layer errors

use thiserror::Error;

/// Failures in signing, verification, encryption or key handling.
#[derive(Debug, Error)]
pub enum JoseError {
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("key material rejected: {0}")]
    InvalidKey(String),

    #[error("no key in the ring can {0}")]
    NoUsableKey(&'static str),

    #[error("token is malformed: {0}")]
    Malformed(String),

    #[error("signature verification failed")]
    SignatureInvalid,

    #[error("claim validation failed: {0}")]
    ClaimInvalid(String),

    #[error("token exceeds the size bound: {size} > {limit} bytes")]
    Oversized { size: usize, limit: usize },

    #[error("encryption failure: {0}")]
    Encryption(String),

    #[error("decryption failure")]
    Decryption,
}

impl From<jsonwebtoken::errors::Error> for JoseError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;
        match err.kind() {
            ErrorKind::InvalidSignature => Self::SignatureInvalid,
            ErrorKind::ExpiredSignature => Self::ClaimInvalid("token is expired".into()),
            ErrorKind::ImmatureSignature => Self::ClaimInvalid("token is not yet valid".into()),
            ErrorKind::InvalidIssuer => Self::ClaimInvalid("issuer mismatch".into()),
            ErrorKind::InvalidAudience => Self::ClaimInvalid("audience mismatch".into()),
            ErrorKind::InvalidAlgorithm => {
                Self::UnsupportedAlgorithm("algorithm does not match the key".into())
            }
            _ => Self::Malformed(err.to_string()),
        }
    }
}
