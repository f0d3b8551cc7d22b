//! Check-session support (OIDC Session Management)
//!
//! The adapter serves the iframe document; the core computes the
//! `session_state` values the iframe compares and describes the cookie the
//! monitor reads.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use oxauth_core::config::SessionCookieOptions;
use oxauth_core::random;
use sha2::{Digest, Sha256};

/// `session_state` per OIDC Session Management §4.2:
/// `hash(client_id + " " + origin + " " + opaque session id + salt) + "." + salt`.
pub fn session_state(client_id: &str, origin: &str, session_id: &str) -> String {
    let salt = random::urlsafe(16);
    let mut hasher = Sha256::new();
    hasher.update(client_id.as_bytes());
    hasher.update(b" ");
    hasher.update(origin.as_bytes());
    hasher.update(b" ");
    hasher.update(session_id.as_bytes());
    hasher.update(salt.as_bytes());
    format!("{}.{}", URL_SAFE_NO_PAD.encode(hasher.finalize()), salt)
}

/// Re-derive a `session_state` with a known salt (iframe verification side).
pub fn session_state_with_salt(
    client_id: &str,
    origin: &str,
    session_id: &str,
    salt: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(client_id.as_bytes());
    hasher.update(b" ");
    hasher.update(origin.as_bytes());
    hasher.update(b" ");
    hasher.update(session_id.as_bytes());
    hasher.update(salt.as_bytes());
    format!("{}.{}", URL_SAFE_NO_PAD.encode(hasher.finalize()), salt)
}

/// The canned monitor document. The adapter substitutes the cookie name
/// and serves it at the check-session path.
pub const CHECK_SESSION_IFRAME: &str = include_str!("../static/check_session.html");

/// `Set-Cookie` attributes for the session cookie, rendered for the
/// adapter.
pub fn cookie_attributes(options: &SessionCookieOptions) -> String {
    let mut attrs = format!(
        "Path={}; SameSite={}; Secure; HttpOnly",
        options.path, options.same_site
    );
    if let Some(domain) = &options.domain {
        attrs.push_str("; Domain=");
        attrs.push_str(domain);
    }
    attrs
}
