//! Host-injected collaborators
//!
//! The core never authenticates end-users, renders UI or owns a database.
//! Everything it needs from the surrounding application arrives through
//! these traits; the host wires implementations in at construction time.

use async_trait::async_trait;
use url::Url;

use crate::claims::RequestedClaims;
use crate::client::ClientInfo;
use crate::error::StorageError;
use crate::records::{AuthSession, PendingAuthorization};

/// Read access to the client catalogue.
#[async_trait]
pub trait ClientInfoProvider: Send + Sync {
    async fn lookup(&self, client_id: &str) -> Result<Option<ClientInfo>, StorageError>;
}

/// Mutations driven by dynamic client registration.
#[async_trait]
pub trait ClientInfoManager: ClientInfoProvider {
    async fn add(&self, client: ClientInfo) -> Result<(), StorageError>;
    async fn update(&self, client: ClientInfo) -> Result<(), StorageError>;
    async fn remove(&self, client_id: &str) -> Result<(), StorageError>;
}

/// The end-user session subsystem.
#[async_trait]
pub trait AuthSessionService: Send + Sync {
    /// The current session bound to the inbound request, if any.
    async fn authenticate(&self) -> Result<Option<AuthSession>, StorageError>;

    /// Persist a changed session (e.g. a new affected client id).
    async fn update(&self, session: AuthSession) -> Result<(), StorageError>;

    /// Terminate the session.
    async fn sign_out(&self, session_id: &str) -> Result<Option<AuthSession>, StorageError>;
}

/// What the user-interaction subsystem decided about one request.
#[derive(Debug, Clone)]
pub enum InteractionOutcome {
    LoginRequired(Url),
    ConsentRequired(Url),
    AccountSelectionRequired(Url),
    InteractionRequired(Url),
    Approved(Approval),
}

/// A committed authorization decision.
#[derive(Debug, Clone)]
pub struct Approval {
    pub session: AuthSession,
    pub granted_scopes: Vec<String>,
    pub granted_claims: Option<RequestedClaims>,
}

/// Drives login / consent / account selection for one authorization request.
#[async_trait]
pub trait UserInteraction: Send + Sync {
    async fn drive(
        &self,
        request: &PendingAuthorization,
    ) -> Result<InteractionOutcome, StorageError>;
}

/// Supplies end-user claims for identity tokens and the userinfo endpoint.
#[async_trait]
pub trait UserInfoProvider: Send + Sync {
    async fn get_claims(
        &self,
        session: &AuthSession,
        claim_names: &[String],
    ) -> Result<serde_json::Map<String, serde_json::Value>, StorageError>;
}

/// Issuer identifier for the current request (enables multi-tenant hosting).
#[async_trait]
pub trait IssuerProvider: Send + Sync {
    async fn issuer(&self) -> Result<String, StorageError>;
}

/// A fixed, single-tenant issuer.
#[derive(Debug, Clone)]
pub struct StaticIssuer(pub String);

#[async_trait]
impl IssuerProvider for StaticIssuer {
    async fn issuer(&self) -> Result<String, StorageError> {
        Ok(self.0.clone())
    }
}
