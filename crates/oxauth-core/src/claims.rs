//! The OIDC `claims` request parameter
//!
//! Two buckets (`id_token`, `userinfo`), each mapping a claim name to an
//! optional refinement. JSON is only the wire encoding; pipelines work with
//! these records.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Refinement attached to one requested claim.
///
/// `{"essential": true}`, `{"value": ...}` and `{"values": [...]}` per
/// OIDC Core §5.5.1. A `null` member in the request maps to `None` on the
/// [`RequestedClaims`] side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ClaimRule {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub essential: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub value: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub values: Option<Vec<serde_json::Value>>,
}

impl ClaimRule {
    pub fn is_essential(&self) -> bool {
        self.essential.unwrap_or(false)
    }
}

/// Parsed `claims` authorization parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RequestedClaims {
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub id_token: BTreeMap<String, Option<ClaimRule>>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub userinfo: BTreeMap<String, Option<ClaimRule>>,
}

impl RequestedClaims {
    /// Parse the raw `claims` parameter value.
    ///
    /// # Errors
    ///
    /// Returns the underlying decode error when the value is not the
    /// two-bucket object OIDC Core §5.5 requires.
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn is_empty(&self) -> bool {
        self.id_token.is_empty() && self.userinfo.is_empty()
    }

    /// Claim names requested for the userinfo response.
    pub fn userinfo_claim_names(&self) -> impl Iterator<Item = &str> {
        self.userinfo.keys().map(String::as_str)
    }

    /// Claim names requested for the identity token.
    pub fn id_token_claim_names(&self) -> impl Iterator<Item = &str> {
        self.id_token.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_core_example() {
        let raw = r#"{
            "userinfo": {
                "given_name": {"essential": true},
                "nickname": null,
                "picture": null
            },
            "id_token": {
                "auth_time": {"essential": true},
                "acr": {"values": ["urn:mace:incommon:iap:silver"]}
            }
        }"#;
        let claims = RequestedClaims::parse(raw).unwrap();
        assert!(claims.userinfo["given_name"].as_ref().unwrap().is_essential());
        assert!(claims.userinfo["nickname"].is_none());
        let acr = claims.id_token["acr"].as_ref().unwrap();
        assert_eq!(acr.values.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn round_trips_without_losing_buckets() {
        let raw = r#"{"id_token":{"email":null}}"#;
        let claims = RequestedClaims::parse(raw).unwrap();
        let back = serde_json::to_string(&claims).unwrap();
        assert_eq!(back, raw);
    }

    #[test]
    fn rejects_non_object_values() {
        assert!(RequestedClaims::parse("[1,2]").is_err());
    }
}
