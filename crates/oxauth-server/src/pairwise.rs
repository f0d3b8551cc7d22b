//! Pairwise subject identifiers (OIDC Core §8.1)
//!
//! `sub = base64url(SHA-256(sector || 0x00 || subject || 0x00 || salt))`.
//! Deterministic per (subject, sector); the internal identifier never
//! leaves the process for pairwise clients.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use oxauth_core::client::{ClientInfo, SubjectType};
use sha2::{Digest, Sha256};

/// The sector for one client: its registered `sector_identifier`, else the
/// host of its first redirect URI, else the client id.
fn sector_for(client: &ClientInfo) -> String {
    if let Some(sector) = &client.sector_identifier {
        return sector.clone();
    }
    client
        .redirect_uris
        .first()
        .and_then(|uri| uri.host_str().map(str::to_owned))
        .unwrap_or_else(|| client.client_id.clone())
}

/// The `sub` claim value for one (subject, client) pair.
pub fn subject_for(client: &ClientInfo, internal_subject: &str, salt: &str) -> String {
    match client.subject_type {
        SubjectType::Public => internal_subject.to_owned(),
        SubjectType::Pairwise => {
            let mut hasher = Sha256::new();
            hasher.update(sector_for(client).as_bytes());
            hasher.update([0u8]);
            hasher.update(internal_subject.as_bytes());
            hasher.update([0u8]);
            hasher.update(salt.as_bytes());
            URL_SAFE_NO_PAD.encode(hasher.finalize())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairwise_client(sector: Option<&str>) -> ClientInfo {
        let mut client = ClientInfo::public("c1");
        client.subject_type = SubjectType::Pairwise;
        client.sector_identifier = sector.map(str::to_owned);
        client
    }

    #[test]
    fn public_clients_see_the_internal_subject() {
        let client = ClientInfo::public("c1");
        assert_eq!(subject_for(&client, "u1", "salt"), "u1");
    }

    #[test]
    fn pairwise_is_deterministic_and_masked() {
        let client = pairwise_client(Some("sector.example"));
        let a = subject_for(&client, "u1", "salt");
        let b = subject_for(&client, "u1", "salt");
        assert_eq!(a, b);
        assert_ne!(a, "u1");
    }

    #[test]
    fn different_sectors_get_different_subjects() {
        let a = subject_for(&pairwise_client(Some("a.example")), "u1", "salt");
        let b = subject_for(&pairwise_client(Some("b.example")), "u1", "salt");
        assert_ne!(a, b);
    }

    #[test]
    fn same_sector_shares_the_subject_across_clients() {
        let mut one = pairwise_client(Some("shared.example"));
        one.client_id = "c1".into();
        let mut two = pairwise_client(Some("shared.example"));
        two.client_id = "c2".into();
        assert_eq!(
            subject_for(&one, "u1", "salt"),
            subject_for(&two, "u1", "salt")
        );
    }
}
