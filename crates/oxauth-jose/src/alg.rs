//! Algorithm taxonomy
//!
//! Signing algorithms map onto `jsonwebtoken::Algorithm`; `none` exists as
//! a first-class variant so whitelists can name it, but it converts to a
//! usable algorithm nowhere. Key-management and content-encryption
//! algorithms cover the JWE surface the server offers.

use jsonwebtoken::Algorithm;
use serde::{Deserialize, Serialize};

use crate::error::JoseError;

/// JWS algorithms plus the `none` sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SigningAlgorithm {
    #[serde(rename = "RS256")]
    Rs256,
    #[serde(rename = "RS384")]
    Rs384,
    #[serde(rename = "RS512")]
    Rs512,
    #[serde(rename = "PS256")]
    Ps256,
    #[serde(rename = "PS384")]
    Ps384,
    #[serde(rename = "PS512")]
    Ps512,
    #[serde(rename = "ES256")]
    Es256,
    #[serde(rename = "ES384")]
    Es384,
    #[serde(rename = "ES512")]
    Es512,
    #[serde(rename = "HS256")]
    Hs256,
    #[serde(rename = "HS384")]
    Hs384,
    #[serde(rename = "HS512")]
    Hs512,
    /// Unsigned. Accepted only where a whitelist names it explicitly and
    /// never in verification that protects trust.
    #[serde(rename = "none")]
    None,
}

impl SigningAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rs256 => "RS256",
            Self::Rs384 => "RS384",
            Self::Rs512 => "RS512",
            Self::Ps256 => "PS256",
            Self::Ps384 => "PS384",
            Self::Ps512 => "PS512",
            Self::Es256 => "ES256",
            Self::Es384 => "ES384",
            Self::Es512 => "ES512",
            Self::Hs256 => "HS256",
            Self::Hs384 => "HS384",
            Self::Hs512 => "HS512",
            Self::None => "none",
        }
    }

    /// Parse a JOSE `alg` header value.
    ///
    /// # Errors
    ///
    /// `UnsupportedAlgorithm` for anything outside the server's JWS set.
    pub fn parse(raw: &str) -> Result<Self, JoseError> {
        match raw {
            "RS256" => Ok(Self::Rs256),
            "RS384" => Ok(Self::Rs384),
            "RS512" => Ok(Self::Rs512),
            "PS256" => Ok(Self::Ps256),
            "PS384" => Ok(Self::Ps384),
            "PS512" => Ok(Self::Ps512),
            "ES256" => Ok(Self::Es256),
            "ES384" => Ok(Self::Es384),
            "ES512" => Ok(Self::Es512),
            "HS256" => Ok(Self::Hs256),
            "HS384" => Ok(Self::Hs384),
            "HS512" => Ok(Self::Hs512),
            "none" => Ok(Self::None),
            other => Err(JoseError::UnsupportedAlgorithm(other.to_owned())),
        }
    }

    /// The `jsonwebtoken` algorithm; `none` converts nowhere.
    ///
    /// # Errors
    ///
    /// `UnsupportedAlgorithm` for [`Self::None`].
    pub fn to_jwt(self) -> Result<Algorithm, JoseError> {
        match self {
            Self::Rs256 => Ok(Algorithm::RS256),
            Self::Rs384 => Ok(Algorithm::RS384),
            Self::Rs512 => Ok(Algorithm::RS512),
            Self::Ps256 => Ok(Algorithm::PS256),
            Self::Ps384 => Ok(Algorithm::PS384),
            Self::Ps512 => Ok(Algorithm::PS512),
            Self::Es256 => Ok(Algorithm::ES256),
            Self::Es384 => Ok(Algorithm::ES384),
            Self::Es512 => Ok(Algorithm::ES512),
            Self::Hs256 => Ok(Algorithm::HS256),
            Self::Hs384 => Ok(Algorithm::HS384),
            Self::Hs512 => Ok(Algorithm::HS512),
            Self::None => Err(JoseError::UnsupportedAlgorithm("none".into())),
        }
    }

    pub fn is_symmetric(self) -> bool {
        matches!(self, Self::Hs256 | Self::Hs384 | Self::Hs512)
    }

    pub fn is_rsa(self) -> bool {
        matches!(
            self,
            Self::Rs256 | Self::Rs384 | Self::Rs512 | Self::Ps256 | Self::Ps384 | Self::Ps512
        )
    }

    pub fn is_ec(self) -> bool {
        matches!(self, Self::Es256 | Self::Es384 | Self::Es512)
    }
}

impl std::fmt::Display for SigningAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// JWE key-management algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyManagementAlgorithm {
    #[serde(rename = "RSA-OAEP")]
    RsaOaep,
    #[serde(rename = "RSA-OAEP-256")]
    RsaOaep256,
}

impl KeyManagementAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RsaOaep => "RSA-OAEP",
            Self::RsaOaep256 => "RSA-OAEP-256",
        }
    }

    /// Parse a JWE `alg` header value.
    ///
    /// # Errors
    ///
    /// `UnsupportedAlgorithm` outside the RSA-OAEP family.
    pub fn parse(raw: &str) -> Result<Self, JoseError> {
        match raw {
            "RSA-OAEP" => Ok(Self::RsaOaep),
            "RSA-OAEP-256" => Ok(Self::RsaOaep256),
            other => Err(JoseError::UnsupportedAlgorithm(other.to_owned())),
        }
    }
}

/// JWE content-encryption algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContentEncryption {
    #[serde(rename = "A128GCM")]
    A128Gcm,
    #[serde(rename = "A256GCM")]
    A256Gcm,
    #[serde(rename = "A128CBC-HS256")]
    A128CbcHs256,
    #[serde(rename = "A256CBC-HS512")]
    A256CbcHs512,
}

impl ContentEncryption {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::A128Gcm => "A128GCM",
            Self::A256Gcm => "A256GCM",
            Self::A128CbcHs256 => "A128CBC-HS256",
            Self::A256CbcHs512 => "A256CBC-HS512",
        }
    }

    /// Parse a JWE `enc` header value.
    ///
    /// # Errors
    ///
    /// `UnsupportedAlgorithm` outside the four offered encodings.
    pub fn parse(raw: &str) -> Result<Self, JoseError> {
        match raw {
            "A128GCM" => Ok(Self::A128Gcm),
            "A256GCM" => Ok(Self::A256Gcm),
            "A128CBC-HS256" => Ok(Self::A128CbcHs256),
            "A256CBC-HS512" => Ok(Self::A256CbcHs512),
            other => Err(JoseError::UnsupportedAlgorithm(other.to_owned())),
        }
    }

    /// Content-encryption key length in bytes (CBC modes carry the MAC
    /// half in front of the encryption half).
    pub fn key_len(self) -> usize {
        match self {
            Self::A128Gcm => 16,
            Self::A256Gcm => 32,
            Self::A128CbcHs256 => 32,
            Self::A256CbcHs512 => 64,
        }
    }

    pub fn iv_len(self) -> usize {
        match self {
            Self::A128Gcm | Self::A256Gcm => 12,
            Self::A128CbcHs256 | Self::A256CbcHs512 => 16,
        }
    }

    pub fn tag_len(self) -> usize {
        match self {
            Self::A128Gcm | Self::A256Gcm => 16,
            Self::A128CbcHs256 => 16,
            Self::A256CbcHs512 => 32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_never_converts() {
        assert!(SigningAlgorithm::None.to_jwt().is_err());
        assert_eq!(SigningAlgorithm::parse("none").unwrap(), SigningAlgorithm::None);
    }

    #[test]
    fn signing_algorithms_round_trip() {
        for raw in [
            "RS256", "RS384", "RS512", "PS256", "PS384", "PS512", "ES256", "ES384", "ES512",
            "HS256", "HS384", "HS512",
        ] {
            let alg = SigningAlgorithm::parse(raw).unwrap();
            assert_eq!(alg.as_str(), raw);
            alg.to_jwt().unwrap();
        }
        assert!(SigningAlgorithm::parse("HS1").is_err());
    }

    #[test]
    fn content_encryption_parameters() {
        assert_eq!(ContentEncryption::A128Gcm.key_len(), 16);
        assert_eq!(ContentEncryption::A256CbcHs512.key_len(), 64);
        assert_eq!(ContentEncryption::A128CbcHs256.iv_len(), 16);
        assert_eq!(ContentEncryption::A256Gcm.iv_len(), 12);
    }
}
