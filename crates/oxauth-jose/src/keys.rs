//! Service key ring
//!
//! The ring is an ordered list: the first signing key is "current" and
//! signs everything new; every key still verifies, which is what makes
//! rotation a pure configuration change. Public material is published
//! through [`KeyRing::jwks`]; symmetric secrets never appear there.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jsonwebtoken::{DecodingKey, EncodingKey};
use rsa::RsaPrivateKey;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::traits::PublicKeyParts;
use serde_json::{Value, json};

use crate::alg::{KeyManagementAlgorithm, SigningAlgorithm};
use crate::error::JoseError;

/// What a key is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyUse {
    Signing,
    Encryption,
}

/// Key material behind one ring entry.
pub enum KeyMaterial {
    Rsa {
        encoding: EncodingKey,
        decoding: DecodingKey,
        /// Retained for JWE key unwrap on encryption keys.
        private: Box<RsaPrivateKey>,
    },
    Ec {
        encoding: EncodingKey,
        decoding: DecodingKey,
    },
    Hmac {
        secret: Vec<u8>,
    },
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rsa { .. } => f.write_str("KeyMaterial::Rsa"),
            Self::Ec { .. } => f.write_str("KeyMaterial::Ec"),
            Self::Hmac { .. } => f.write_str("KeyMaterial::Hmac([REDACTED])"),
        }
    }
}

/// One key in the ring.
#[derive(Debug)]
pub struct ServiceKey {
    pub kid: String,
    pub key_use: KeyUse,
    /// Signing keys carry their JWS algorithm; encryption keys the JWE
    /// key-management algorithm.
    pub signing_algorithm: Option<SigningAlgorithm>,
    pub key_management_algorithm: Option<KeyManagementAlgorithm>,
    pub material: KeyMaterial,
    /// Public JWK as published; `None` for symmetric keys.
    pub public_jwk: Option<Value>,
}

fn pem_body(pem: &str) -> Result<Vec<u8>, JoseError> {
    let body: String = pem
        .lines()
        .filter(|line| !line.starts_with("-----"))
        .collect();
    base64::engine::general_purpose::STANDARD
        .decode(body.trim())
        .map_err(|e| JoseError::InvalidKey(format!("PEM body is not base64: {e}")))
}

fn rsa_private_from_pem(pem: &str) -> Result<RsaPrivateKey, JoseError> {
    RsaPrivateKey::from_pkcs8_pem(pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
        .map_err(|e| JoseError::InvalidKey(format!("RSA private key rejected: {e}")))
}

fn rsa_public_jwk(
    key: &RsaPrivateKey,
    kid: &str,
    alg: &str,
    key_use: KeyUse,
) -> (Value, String, String) {
    let public = key.to_public_key();
    let n = URL_SAFE_NO_PAD.encode(public.n().to_bytes_be());
    let e = URL_SAFE_NO_PAD.encode(public.e().to_bytes_be());
    let use_str = match key_use {
        KeyUse::Signing => "sig",
        KeyUse::Encryption => "enc",
    };
    let jwk = json!({
        "kty": "RSA",
        "use": use_str,
        "kid": kid,
        "alg": alg,
        "n": n,
        "e": e,
    });
    (jwk, n, e)
}

/// Pull the uncompressed point out of an EC SubjectPublicKeyInfo.
///
/// The SPKI for an EC key ends with the BIT STRING holding
/// `04 || X || Y`; the coordinate width is fixed by the curve.
fn ec_point_from_spki(der: &[u8], coord_len: usize) -> Result<(Vec<u8>, Vec<u8>), JoseError> {
    let point_len = 1 + 2 * coord_len;
    if der.len() < point_len {
        return Err(JoseError::InvalidKey("EC SPKI too short".into()));
    }
    let point = &der[der.len() - point_len..];
    if point[0] != 0x04 {
        return Err(JoseError::InvalidKey(
            "EC public key is not an uncompressed point".into(),
        ));
    }
    Ok((
        point[1..=coord_len].to_vec(),
        point[1 + coord_len..].to_vec(),
    ))
}

impl ServiceKey {
    /// An RSA signing key from a PKCS#8 or PKCS#1 PEM.
    ///
    /// # Errors
    ///
    /// `InvalidKey` when the PEM does not parse or the algorithm is not
    /// an RSA one.
    pub fn rsa_signing(
        kid: impl Into<String>,
        algorithm: SigningAlgorithm,
        private_pem: &str,
    ) -> Result<Self, JoseError> {
        if !algorithm.is_rsa() {
            return Err(JoseError::InvalidKey(format!(
                "{algorithm} is not an RSA algorithm"
            )));
        }
        let kid = kid.into();
        let private = rsa_private_from_pem(private_pem)?;
        let (jwk, n, e) = rsa_public_jwk(&private, &kid, algorithm.as_str(), KeyUse::Signing);
        let encoding = EncodingKey::from_rsa_pem(private_pem.as_bytes())?;
        let decoding = DecodingKey::from_rsa_components(&n, &e)?;
        Ok(Self {
            kid,
            key_use: KeyUse::Signing,
            signing_algorithm: Some(algorithm),
            key_management_algorithm: None,
            material: KeyMaterial::Rsa {
                encoding,
                decoding,
                private: Box::new(private),
            },
            public_jwk: Some(jwk),
        })
    }

    /// An RSA encryption key (JWE key unwrap + published for senders).
    ///
    /// # Errors
    ///
    /// `InvalidKey` when the PEM does not parse.
    pub fn rsa_encryption(
        kid: impl Into<String>,
        algorithm: KeyManagementAlgorithm,
        private_pem: &str,
    ) -> Result<Self, JoseError> {
        let kid = kid.into();
        let private = rsa_private_from_pem(private_pem)?;
        let (jwk, n, e) = rsa_public_jwk(&private, &kid, algorithm.as_str(), KeyUse::Encryption);
        let encoding = EncodingKey::from_rsa_pem(private_pem.as_bytes())?;
        let decoding = DecodingKey::from_rsa_components(&n, &e)?;
        Ok(Self {
            kid,
            key_use: KeyUse::Encryption,
            signing_algorithm: None,
            key_management_algorithm: Some(algorithm),
            material: KeyMaterial::Rsa {
                encoding,
                decoding,
                private: Box::new(private),
            },
            public_jwk: Some(jwk),
        })
    }

    /// An ECDSA signing key from SEC1/PKCS#8 private and SPKI public PEMs.
    ///
    /// # Errors
    ///
    /// `InvalidKey` when either PEM is rejected or the algorithm is not
    /// an EC one.
    pub fn ec_signing(
        kid: impl Into<String>,
        algorithm: SigningAlgorithm,
        private_pem: &str,
        public_pem: &str,
    ) -> Result<Self, JoseError> {
        let (curve, coord_len) = match algorithm {
            SigningAlgorithm::Es256 => ("P-256", 32),
            SigningAlgorithm::Es384 => ("P-384", 48),
            SigningAlgorithm::Es512 => ("P-521", 66),
            other => {
                return Err(JoseError::InvalidKey(format!(
                    "{other} is not an EC algorithm"
                )));
            }
        };
        let kid = kid.into();
        let spki = pem_body(public_pem)?;
        let (x, y) = ec_point_from_spki(&spki, coord_len)?;
        let jwk = json!({
            "kty": "EC",
            "use": "sig",
            "kid": kid,
            "alg": algorithm.as_str(),
            "crv": curve,
            "x": URL_SAFE_NO_PAD.encode(x),
            "y": URL_SAFE_NO_PAD.encode(y),
        });
        Ok(Self {
            kid,
            key_use: KeyUse::Signing,
            signing_algorithm: Some(algorithm),
            key_management_algorithm: None,
            material: KeyMaterial::Ec {
                encoding: EncodingKey::from_ec_pem(private_pem.as_bytes())?,
                decoding: DecodingKey::from_ec_pem(public_pem.as_bytes())?,
            },
            public_jwk: Some(jwk),
        })
    }

    /// A symmetric key. Not published in the JWKS.
    ///
    /// # Errors
    ///
    /// `InvalidKey` when the algorithm is not an HMAC one.
    pub fn hmac(
        kid: impl Into<String>,
        algorithm: SigningAlgorithm,
        secret: &[u8],
    ) -> Result<Self, JoseError> {
        if !algorithm.is_symmetric() {
            return Err(JoseError::InvalidKey(format!(
                "{algorithm} is not an HMAC algorithm"
            )));
        }
        Ok(Self {
            kid: kid.into(),
            key_use: KeyUse::Signing,
            signing_algorithm: Some(algorithm),
            key_management_algorithm: None,
            material: KeyMaterial::Hmac {
                secret: secret.to_vec(),
            },
            public_jwk: None,
        })
    }

    pub(crate) fn encoding_key(&self) -> EncodingKey {
        match &self.material {
            KeyMaterial::Rsa { encoding, .. } | KeyMaterial::Ec { encoding, .. } => {
                encoding.clone()
            }
            KeyMaterial::Hmac { secret } => EncodingKey::from_secret(secret),
        }
    }

    pub(crate) fn decoding_key(&self) -> DecodingKey {
        match &self.material {
            KeyMaterial::Rsa { decoding, .. } | KeyMaterial::Ec { decoding, .. } => {
                decoding.clone()
            }
            KeyMaterial::Hmac { secret } => DecodingKey::from_secret(secret),
        }
    }

    pub(crate) fn rsa_private(&self) -> Option<&RsaPrivateKey> {
        match &self.material {
            KeyMaterial::Rsa { private, .. } => Some(private),
            _ => None,
        }
    }
}

/// The ordered service key set.
#[derive(Debug)]
pub struct KeyRing {
    keys: Vec<ServiceKey>,
}

impl KeyRing {
    /// # Errors
    ///
    /// `NoUsableKey` when no signing key is present.
    pub fn new(keys: Vec<ServiceKey>) -> Result<Self, JoseError> {
        if !keys.iter().any(|k| k.key_use == KeyUse::Signing) {
            return Err(JoseError::NoUsableKey("sign"));
        }
        Ok(Self { keys })
    }

    /// The current signing key: the first in the ring, or the first
    /// matching `algorithm` when one is requested.
    ///
    /// # Errors
    ///
    /// `NoUsableKey` when no key matches.
    pub fn signing_key(
        &self,
        algorithm: Option<SigningAlgorithm>,
    ) -> Result<&ServiceKey, JoseError> {
        self.keys
            .iter()
            .filter(|k| k.key_use == KeyUse::Signing)
            .find(|k| algorithm.is_none() || k.signing_algorithm == algorithm)
            .ok_or(JoseError::NoUsableKey("sign with the requested algorithm"))
    }

    /// Verification candidates: the `kid` match when the header names one
    /// we hold, otherwise every signing key.
    pub fn verification_keys(&self, kid: Option<&str>) -> Vec<&ServiceKey> {
        if let Some(kid) = kid {
            let matched: Vec<&ServiceKey> = self
                .keys
                .iter()
                .filter(|k| k.key_use == KeyUse::Signing && k.kid == kid)
                .collect();
            if !matched.is_empty() {
                return matched;
            }
        }
        self.keys
            .iter()
            .filter(|k| k.key_use == KeyUse::Signing)
            .collect()
    }

    /// Keys able to unwrap inbound JWE.
    pub fn decryption_keys(&self) -> Vec<&ServiceKey> {
        self.keys
            .iter()
            .filter(|k| k.key_use == KeyUse::Encryption && k.rsa_private().is_some())
            .collect()
    }

    /// The published JWKS: every asymmetric key, private fields stripped.
    pub fn jwks(&self) -> Value {
        let keys: Vec<&Value> = self.keys.iter().filter_map(|k| k.public_jwk.as_ref()).collect();
        json!({ "keys": keys })
    }
}

#[cfg(test)]
pub(crate) mod test_keys {
    //! Fixed test keys shared by the crate's suites.

    pub const RSA_PRIVATE_PEM: &str = include_str!("../testdata/rsa2048.pem");
    pub const EC_P256_PRIVATE_PEM: &str = include_str!("../testdata/ec_p256.pem");
    pub const EC_P256_PUBLIC_PEM: &str = include_str!("../testdata/ec_p256.pub.pem");
}
