//! # oxauth-jose
//!
//! The cryptographic half of oxauth: the service key ring (JWS signing,
//! verification, JWE, rotation, JWKS publication) and the token service
//! that mints and decodes the server's seven JWT flavours while keeping
//! the `jti` registry honest.
//!
//! - `alg` - signing / key-management / content-encryption taxonomies
//! - `keys` - [`keys::ServiceKey`] and [`keys::KeyRing`]
//! - `jwe` - compact JWE encrypt / decrypt
//! - `token` - [`token::TokenService`], external verification helpers
//! - `error` - [`error::JoseError`]

pub mod alg;
pub mod error;
pub mod jwe;
pub mod keys;
pub mod token;

pub use alg::{ContentEncryption, KeyManagementAlgorithm, SigningAlgorithm};
pub use error::JoseError;
pub use keys::{KeyRing, KeyUse, ServiceKey};
pub use token::{
    DecodedJwt, Expectations, JwtClaims, MintedToken, TokenKind, TokenService, peek_claims,
    verify_with_jwks, verify_with_secret,
};
