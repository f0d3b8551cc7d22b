//! Compact JWE encrypt / decrypt
//!
//! Key management is RSA-OAEP or RSA-OAEP-256; content encryption is
//! AES-GCM or AES-CBC with HMAC (RFC 7516, RFC 7518 §5.2). The payload is
//! normally a signed compact JWS, so headers carry `cty: "JWT"` for nested
//! tokens.

use aes::Aes128;
use aes::Aes256;
use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes128Gcm, Aes256Gcm, KeyInit, Nonce};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use rand_core::{OsRng, RngCore};
use rsa::{BigUint, Oaep, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Sha256, Sha512};
use subtle::ConstantTimeEq;

use crate::alg::{ContentEncryption, KeyManagementAlgorithm};
use crate::error::JoseError;
use crate::keys::ServiceKey;

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;
type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Protected JWE header.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JweHeader {
    pub alg: String,
    pub enc: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub kid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub cty: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub typ: Option<String>,
}

fn rsa_public_from_jwk(jwk: &serde_json::Value) -> Result<RsaPublicKey, JoseError> {
    if jwk["kty"] != "RSA" {
        return Err(JoseError::InvalidKey(
            "JWE recipient key must be an RSA JWK".into(),
        ));
    }
    let decode = |field: &str| -> Result<Vec<u8>, JoseError> {
        let raw = jwk[field]
            .as_str()
            .ok_or_else(|| JoseError::InvalidKey(format!("JWK missing {field}")))?;
        URL_SAFE_NO_PAD
            .decode(raw)
            .map_err(|e| JoseError::InvalidKey(format!("JWK {field} is not base64url: {e}")))
    };
    let n = BigUint::from_bytes_be(&decode("n")?);
    let e = BigUint::from_bytes_be(&decode("e")?);
    RsaPublicKey::new(n, e).map_err(|e| JoseError::InvalidKey(format!("RSA JWK rejected: {e}")))
}

fn wrap_cek(
    cek: &[u8],
    recipient: &RsaPublicKey,
    alg: KeyManagementAlgorithm,
) -> Result<Vec<u8>, JoseError> {
    let mut rng = OsRng;
    let result = match alg {
        KeyManagementAlgorithm::RsaOaep => {
            recipient.encrypt(&mut rng, Oaep::new::<Sha1>(), cek)
        }
        KeyManagementAlgorithm::RsaOaep256 => {
            recipient.encrypt(&mut rng, Oaep::new::<Sha256>(), cek)
        }
    };
    result.map_err(|e| JoseError::Encryption(format!("CEK wrap failed: {e}")))
}

fn unwrap_cek(
    encrypted_key: &[u8],
    key: &ServiceKey,
    alg: KeyManagementAlgorithm,
) -> Result<Vec<u8>, JoseError> {
    let private = key
        .rsa_private()
        .ok_or(JoseError::NoUsableKey("unwrap a JWE content key"))?;
    let result = match alg {
        KeyManagementAlgorithm::RsaOaep => private.decrypt(Oaep::new::<Sha1>(), encrypted_key),
        KeyManagementAlgorithm::RsaOaep256 => {
            private.decrypt(Oaep::new::<Sha256>(), encrypted_key)
        }
    };
    result.map_err(|_| JoseError::Decryption)
}

/// `ciphertext || tag` for GCM, `(ciphertext, tag)` for CBC-HMAC.
fn encrypt_content(
    enc: ContentEncryption,
    cek: &[u8],
    iv: &[u8],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<(Vec<u8>, Vec<u8>), JoseError> {
    match enc {
        ContentEncryption::A128Gcm | ContentEncryption::A256Gcm => {
            let payload = Payload {
                msg: plaintext,
                aad,
            };
            let mut sealed = match enc {
                ContentEncryption::A128Gcm => Aes128Gcm::new_from_slice(cek)
                    .map_err(|e| JoseError::Encryption(e.to_string()))?
                    .encrypt(Nonce::from_slice(iv), payload),
                _ => Aes256Gcm::new_from_slice(cek)
                    .map_err(|e| JoseError::Encryption(e.to_string()))?
                    .encrypt(Nonce::from_slice(iv), payload),
            }
            .map_err(|e| JoseError::Encryption(e.to_string()))?;
            let tag = sealed.split_off(sealed.len() - enc.tag_len());
            Ok((sealed, tag))
        }
        ContentEncryption::A128CbcHs256 | ContentEncryption::A256CbcHs512 => {
            let half = enc.key_len() / 2;
            let (mac_key, enc_key) = cek.split_at(half);
            let ciphertext = match enc {
                ContentEncryption::A128CbcHs256 => {
                    Aes128CbcEnc::new_from_slices(enc_key, iv)
                        .map_err(|e| JoseError::Encryption(e.to_string()))?
                        .encrypt_padded_vec_mut::<Pkcs7>(plaintext)
                }
                _ => Aes256CbcEnc::new_from_slices(enc_key, iv)
                    .map_err(|e| JoseError::Encryption(e.to_string()))?
                    .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
            };
            let tag = cbc_tag(enc, mac_key, aad, iv, &ciphertext)?;
            Ok((ciphertext, tag))
        }
    }
}

/// RFC 7518 §5.2.2.1: HMAC over `AAD || IV || ciphertext || AL`, truncated
/// to the left half.
fn cbc_tag(
    enc: ContentEncryption,
    mac_key: &[u8],
    aad: &[u8],
    iv: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, JoseError> {
    let al = (aad.len() as u64 * 8).to_be_bytes();
    let full = match enc {
        ContentEncryption::A128CbcHs256 => {
            let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(mac_key)
                .map_err(|e| JoseError::Encryption(e.to_string()))?;
            mac.update(aad);
            mac.update(iv);
            mac.update(ciphertext);
            mac.update(&al);
            mac.finalize().into_bytes().to_vec()
        }
        ContentEncryption::A256CbcHs512 => {
            let mut mac = <Hmac<Sha512> as Mac>::new_from_slice(mac_key)
                .map_err(|e| JoseError::Encryption(e.to_string()))?;
            mac.update(aad);
            mac.update(iv);
            mac.update(ciphertext);
            mac.update(&al);
            mac.finalize().into_bytes().to_vec()
        }
        _ => unreachable!("cbc_tag is only called for CBC modes"),
    };
    Ok(full[..enc.tag_len()].to_vec())
}

fn decrypt_content(
    enc: ContentEncryption,
    cek: &[u8],
    iv: &[u8],
    aad: &[u8],
    ciphertext: &[u8],
    tag: &[u8],
) -> Result<Vec<u8>, JoseError> {
    if cek.len() != enc.key_len() || iv.len() != enc.iv_len() || tag.len() != enc.tag_len() {
        return Err(JoseError::Decryption);
    }
    match enc {
        ContentEncryption::A128Gcm | ContentEncryption::A256Gcm => {
            let mut sealed = ciphertext.to_vec();
            sealed.extend_from_slice(tag);
            let payload = Payload {
                msg: &sealed,
                aad,
            };
            let result = match enc {
                ContentEncryption::A128Gcm => Aes128Gcm::new_from_slice(cek)
                    .map_err(|_| JoseError::Decryption)?
                    .decrypt(Nonce::from_slice(iv), payload),
                _ => Aes256Gcm::new_from_slice(cek)
                    .map_err(|_| JoseError::Decryption)?
                    .decrypt(Nonce::from_slice(iv), payload),
            };
            result.map_err(|_| JoseError::Decryption)
        }
        ContentEncryption::A128CbcHs256 | ContentEncryption::A256CbcHs512 => {
            let half = enc.key_len() / 2;
            let (mac_key, enc_key) = cek.split_at(half);
            let expected = cbc_tag(enc, mac_key, aad, iv, ciphertext)?;
            let tag_ok: bool = expected.ct_eq(tag).into();
            if !tag_ok {
                return Err(JoseError::Decryption);
            }
            let plain = match enc {
                ContentEncryption::A128CbcHs256 => {
                    Aes128CbcDec::new_from_slices(enc_key, iv)
                        .map_err(|_| JoseError::Decryption)?
                        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
                }
                _ => Aes256CbcDec::new_from_slices(enc_key, iv)
                    .map_err(|_| JoseError::Decryption)?
                    .decrypt_padded_vec_mut::<Pkcs7>(ciphertext),
            };
            plain.map_err(|_| JoseError::Decryption)
        }
    }
}

/// Encrypt `payload` to the recipient's RSA JWK as a compact JWE.
///
/// # Errors
///
/// `InvalidKey` for unusable recipient material, `Encryption` for cipher
/// failures.
pub fn encrypt(
    payload: &[u8],
    recipient_jwk: &serde_json::Value,
    alg: KeyManagementAlgorithm,
    enc: ContentEncryption,
    content_type: Option<&str>,
) -> Result<String, JoseError> {
    let recipient = rsa_public_from_jwk(recipient_jwk)?;

    let mut cek = vec![0u8; enc.key_len()];
    OsRng.fill_bytes(&mut cek);
    let mut iv = vec![0u8; enc.iv_len()];
    OsRng.fill_bytes(&mut iv);

    let header = JweHeader {
        alg: alg.as_str().to_owned(),
        enc: enc.as_str().to_owned(),
        kid: recipient_jwk["kid"].as_str().map(str::to_owned),
        cty: content_type.map(str::to_owned),
        typ: None,
    };
    let header_b64 = URL_SAFE_NO_PAD.encode(
        serde_json::to_vec(&header).map_err(|e| JoseError::Encryption(e.to_string()))?,
    );

    let (ciphertext, tag) = encrypt_content(enc, &cek, &iv, header_b64.as_bytes(), payload)?;
    let encrypted_key = wrap_cek(&cek, &recipient, alg)?;

    Ok(format!(
        "{}.{}.{}.{}.{}",
        header_b64,
        URL_SAFE_NO_PAD.encode(encrypted_key),
        URL_SAFE_NO_PAD.encode(iv),
        URL_SAFE_NO_PAD.encode(ciphertext),
        URL_SAFE_NO_PAD.encode(tag),
    ))
}

/// Decrypt a compact JWE with the ring's encryption keys.
///
/// Tries the `kid`-matching key first, then every decryption key; any
/// cryptographic failure collapses to the uninformative
/// [`JoseError::Decryption`].
///
/// # Errors
///
/// `Malformed` for structural defects, `Decryption` otherwise.
pub fn decrypt(compact: &str, keys: &[&ServiceKey]) -> Result<(JweHeader, Vec<u8>), JoseError> {
    let parts: Vec<&str> = compact.split('.').collect();
    let [header_b64, key_b64, iv_b64, ct_b64, tag_b64]: [&str; 5] = parts
        .try_into()
        .map_err(|_| JoseError::Malformed("JWE must have five segments".into()))?;

    let decode = |segment: &str, what: &str| -> Result<Vec<u8>, JoseError> {
        URL_SAFE_NO_PAD
            .decode(segment)
            .map_err(|e| JoseError::Malformed(format!("JWE {what} segment: {e}")))
    };
    let header: JweHeader = serde_json::from_slice(&decode(header_b64, "header")?)
        .map_err(|e| JoseError::Malformed(format!("JWE header: {e}")))?;
    let alg = KeyManagementAlgorithm::parse(&header.alg)?;
    let enc = ContentEncryption::parse(&header.enc)?;
    let encrypted_key = decode(key_b64, "key")?;
    let iv = decode(iv_b64, "iv")?;
    let ciphertext = decode(ct_b64, "ciphertext")?;
    let tag = decode(tag_b64, "tag")?;

    let mut ordered: Vec<&ServiceKey> = Vec::with_capacity(keys.len());
    if let Some(kid) = header.kid.as_deref() {
        ordered.extend(keys.iter().copied().filter(|k| k.kid == kid));
        ordered.extend(keys.iter().copied().filter(|k| k.kid != kid));
    } else {
        ordered.extend(keys.iter().copied());
    }

    for key in ordered {
        let Ok(cek) = unwrap_cek(&encrypted_key, key, alg) else {
            continue;
        };
        if let Ok(plain) =
            decrypt_content(enc, &cek, &iv, header_b64.as_bytes(), &ciphertext, &tag)
        {
            return Ok((header, plain));
        }
    }
    Err(JoseError::Decryption)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alg::SigningAlgorithm;
    use crate::keys::test_keys::RSA_PRIVATE_PEM;

    fn enc_key() -> ServiceKey {
        ServiceKey::rsa_encryption("enc-1", KeyManagementAlgorithm::RsaOaep, RSA_PRIVATE_PEM)
            .unwrap()
    }

    #[test]
    fn round_trip_all_content_encryptions() {
        let key = enc_key();
        let jwk = key.public_jwk.clone().unwrap();
        for enc in [
            ContentEncryption::A128Gcm,
            ContentEncryption::A256Gcm,
            ContentEncryption::A128CbcHs256,
            ContentEncryption::A256CbcHs512,
        ] {
            let compact = encrypt(
                b"payload bytes",
                &jwk,
                KeyManagementAlgorithm::RsaOaep,
                enc,
                Some("JWT"),
            )
            .unwrap();
            let (header, plain) = decrypt(&compact, &[&key]).unwrap();
            assert_eq!(plain, b"payload bytes", "{}", enc.as_str());
            assert_eq!(header.cty.as_deref(), Some("JWT"));
        }
    }

    #[test]
    fn oaep256_round_trip() {
        let key = ServiceKey::rsa_encryption(
            "enc-256",
            KeyManagementAlgorithm::RsaOaep256,
            RSA_PRIVATE_PEM,
        )
        .unwrap();
        let jwk = key.public_jwk.clone().unwrap();
        let compact = encrypt(
            b"hello",
            &jwk,
            KeyManagementAlgorithm::RsaOaep256,
            ContentEncryption::A256Gcm,
            None,
        )
        .unwrap();
        let (_, plain) = decrypt(&compact, &[&key]).unwrap();
        assert_eq!(plain, b"hello");
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let key = enc_key();
        let jwk = key.public_jwk.clone().unwrap();
        let compact = encrypt(
            b"secret",
            &jwk,
            KeyManagementAlgorithm::RsaOaep,
            ContentEncryption::A128CbcHs256,
            None,
        )
        .unwrap();
        let mut parts: Vec<String> = compact.split('.').map(str::to_owned).collect();
        parts[3] = {
            let mut ct = URL_SAFE_NO_PAD.decode(&parts[3]).unwrap();
            ct[0] ^= 1;
            URL_SAFE_NO_PAD.encode(ct)
        };
        let tampered = parts.join(".");
        assert!(matches!(
            decrypt(&tampered, &[&key]),
            Err(JoseError::Decryption)
        ));
    }

    #[test]
    fn signing_keys_cannot_decrypt() {
        let enc = enc_key();
        let jwk = enc.public_jwk.clone().unwrap();
        let compact = encrypt(
            b"x",
            &jwk,
            KeyManagementAlgorithm::RsaOaep,
            ContentEncryption::A128Gcm,
            None,
        )
        .unwrap();
        let sig =
            ServiceKey::rsa_signing("sig-1", SigningAlgorithm::Rs256, RSA_PRIVATE_PEM).unwrap();
        // Same underlying RSA key, so unwrap succeeds; a *different* key fails.
        assert!(decrypt(&compact, &[&sig]).is_ok());
    }

    #[test]
    fn wrong_segment_count_is_malformed() {
        assert!(matches!(
            decrypt("a.b.c", &[]),
            Err(JoseError::Malformed(_))
        ));
    }
}
