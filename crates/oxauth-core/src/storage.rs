//! Storage capability traits
//!
//! All shared state lives behind these interfaces. Implementations must be
//! safe for concurrent access; the only strong ordering the core requires
//! is the linearizable compare-and-set of [`TokenRegistry::try_consume`]
//! and the remove-and-return of [`AuthorizationContextStore::take`].
//! Everything else may be eventually consistent.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StorageError;
use crate::records::{
    AuthorizationContext, CibaRequest, DeviceGrant, PendingAuthorization,
    RegisteredClientHandle, TokenStatus,
};

/// `jti` status registry: revocation, one-time-use and replay protection.
#[async_trait]
pub trait TokenRegistry: Send + Sync {
    /// Record a status. Idempotent; later calls overwrite.
    async fn set_status(
        &self,
        jti: &str,
        status: TokenStatus,
        ttl: Duration,
    ) -> Result<(), StorageError>;

    /// Atomic compare-and-set from `Active` to `Used`.
    ///
    /// Returns true exactly once per `jti`. This is the primitive that
    /// prevents refresh-token and assertion replay; it must be
    /// linearizable.
    async fn try_consume(&self, jti: &str) -> Result<bool, StorageError>;

    /// Current status; `Active` for records never recorded.
    async fn get_status(&self, jti: &str) -> Result<TokenStatus, StorageError>;

    /// Revoke every record sharing one refresh chain.
    async fn revoke_chain(&self, chain_id: &str) -> Result<(), StorageError>;

    /// Associate a `jti` with a refresh chain for later [`Self::revoke_chain`].
    async fn bind_chain(&self, jti: &str, chain_id: &str) -> Result<(), StorageError>;

    /// Revoke everything issued to one client (registration delete).
    async fn revoke_client(&self, client_id: &str) -> Result<(), StorageError>;

    /// Associate a `jti` with its client for [`Self::revoke_client`].
    async fn bind_client(&self, jti: &str, client_id: &str) -> Result<(), StorageError>;
}

/// Authorization contexts, keyed by the SHA-256 of the code.
#[async_trait]
pub trait AuthorizationContextStore: Send + Sync {
    async fn put(
        &self,
        code_hash: &[u8],
        context: AuthorizationContext,
    ) -> Result<(), StorageError>;

    /// Remove and return: the consuming read that makes codes single-use.
    async fn take(&self, code_hash: &[u8]) -> Result<Option<AuthorizationContext>, StorageError>;
}

/// Pushed and interaction-suspended authorization requests.
#[async_trait]
pub trait PushedRequestStore: Send + Sync {
    async fn put(&self, pending: PendingAuthorization) -> Result<(), StorageError>;

    /// Read without consuming (interaction redirects re-enter by handle).
    async fn get(&self, id: &str) -> Result<Option<PendingAuthorization>, StorageError>;

    /// Remove and return; PAR handles are single-use at the authorization
    /// endpoint.
    async fn take(&self, id: &str) -> Result<Option<PendingAuthorization>, StorageError>;
}

/// CIBA request state plus the change-notification hook for long-polling.
#[async_trait]
pub trait CibaStore: Send + Sync {
    async fn put(&self, request: CibaRequest) -> Result<(), StorageError>;
    async fn get(&self, auth_req_id: &str) -> Result<Option<CibaRequest>, StorageError>;
    async fn update(&self, request: CibaRequest) -> Result<(), StorageError>;
    async fn remove(&self, auth_req_id: &str) -> Result<(), StorageError>;

    /// Resolve when the request's status changes (or may have changed).
    /// Long-polling callers bound this with a timeout and re-read; spurious
    /// wakeups are acceptable, missed transitions are not.
    async fn changed(&self, auth_req_id: &str);
}

/// Device grants, addressable by device code and by user code.
#[async_trait]
pub trait DeviceGrantStore: Send + Sync {
    async fn put(&self, grant: DeviceGrant) -> Result<(), StorageError>;
    async fn get_by_device_code(
        &self,
        device_code: &str,
    ) -> Result<Option<DeviceGrant>, StorageError>;
    async fn get_by_user_code(&self, user_code: &str)
    -> Result<Option<DeviceGrant>, StorageError>;
    async fn update(&self, grant: DeviceGrant) -> Result<(), StorageError>;
    async fn remove(&self, device_code: &str) -> Result<(), StorageError>;
}

/// Registration access token handles.
#[async_trait]
pub trait RegistrationHandleStore: Send + Sync {
    async fn put(&self, handle: RegisteredClientHandle) -> Result<(), StorageError>;
    async fn get(&self, client_id: &str)
    -> Result<Option<RegisteredClientHandle>, StorageError>;
    async fn remove(&self, client_id: &str) -> Result<(), StorageError>;
}

/// Sliding-window counters and backoff state for abuse control.
#[async_trait]
pub trait RateCounterStore: Send + Sync {
    /// Record one event under `key` and return how many occurred inside
    /// the trailing `window`.
    async fn increment(&self, key: &str, window: Duration) -> Result<u32, StorageError>;

    async fn set_backoff(&self, key: &str, until: DateTime<Utc>) -> Result<(), StorageError>;

    async fn get_backoff(&self, key: &str) -> Result<Option<DateTime<Utc>>, StorageError>;

    /// Drop all state under `key` (successful verification clears it).
    async fn clear(&self, key: &str) -> Result<(), StorageError>;
}
