//! Randomness helpers for codes, handles and secrets

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;

/// `n` random bytes rendered base64url without padding.
///
/// Used for authorization codes, `auth_req_id`, `device_code`, client
/// secrets and registration access tokens.
pub fn urlsafe(n: usize) -> String {
    let mut bytes = vec![0u8; n];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// A code of `length` characters drawn uniformly from `alphabet`.
pub fn from_alphabet(alphabet: &[char], length: usize) -> String {
    assert!(!alphabet.is_empty(), "alphabet must not be empty");
    let mut rng = rand::rng();
    (0..length)
        .map(|_| alphabet[rand::Rng::random_range(&mut rng, 0..alphabet.len())])
        .collect()
}
