//! In-memory reference implementations of the storage traits
//!
//! Backed by `dashmap` so every operation is safe under the parallel
//! endpoint model. `try_consume` mutates under the shard lock, which gives
//! the linearizable compare-and-set the registry contract demands. These
//! are the defaults for embedding and the fixtures for the test suites;
//! production hosts swap in their own backends.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{Notify, RwLock};

use crate::client::ClientInfo;
use crate::collaborators::{AuthSessionService, ClientInfoManager, ClientInfoProvider};
use crate::error::StorageError;
use crate::records::{
    AuthorizationContext, AuthSession, CibaRequest, DeviceGrant, PendingAuthorization,
    RegisteredClientHandle, TokenStatus,
};
use crate::storage::{
    AuthorizationContextStore, CibaStore, DeviceGrantStore, PushedRequestStore,
    RateCounterStore, RegistrationHandleStore, TokenRegistry,
};

#[derive(Debug, Clone)]
struct RegistryEntry {
    status: TokenStatus,
    expires_at: Instant,
}

/// Process-local [`TokenRegistry`].
#[derive(Debug, Default)]
pub struct InMemoryTokenRegistry {
    entries: DashMap<String, RegistryEntry>,
    chains: DashMap<String, Vec<String>>,
    clients: DashMap<String, Vec<String>>,
}

impl InMemoryTokenRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn live_status(&self, jti: &str) -> TokenStatus {
        match self.entries.get(jti) {
            Some(entry) if entry.expires_at > Instant::now() => entry.status,
            // Expired records fall back to the benign default.
            _ => TokenStatus::Active,
        }
    }
}

#[async_trait]
impl TokenRegistry for InMemoryTokenRegistry {
    async fn set_status(
        &self,
        jti: &str,
        status: TokenStatus,
        ttl: Duration,
    ) -> Result<(), StorageError> {
        self.entries.insert(
            jti.to_owned(),
            RegistryEntry {
                status,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn try_consume(&self, jti: &str) -> Result<bool, StorageError> {
        // The entry API holds the shard lock across the read-modify-write.
        let mut entry = self
            .entries
            .entry(jti.to_owned())
            .or_insert_with(|| RegistryEntry {
                status: TokenStatus::Active,
                expires_at: Instant::now() + Duration::from_secs(3600),
            });
        if entry.status == TokenStatus::Active {
            entry.status = TokenStatus::Used;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn get_status(&self, jti: &str) -> Result<TokenStatus, StorageError> {
        Ok(self.live_status(jti))
    }

    async fn revoke_chain(&self, chain_id: &str) -> Result<(), StorageError> {
        if let Some(jtis) = self.chains.get(chain_id) {
            for jti in jtis.iter() {
                if let Some(mut entry) = self.entries.get_mut(jti) {
                    entry.status = TokenStatus::Revoked;
                }
            }
        }
        Ok(())
    }

    async fn bind_chain(&self, jti: &str, chain_id: &str) -> Result<(), StorageError> {
        self.chains
            .entry(chain_id.to_owned())
            .or_default()
            .push(jti.to_owned());
        Ok(())
    }

    async fn revoke_client(&self, client_id: &str) -> Result<(), StorageError> {
        if let Some(jtis) = self.clients.get(client_id) {
            for jti in jtis.iter() {
                if let Some(mut entry) = self.entries.get_mut(jti) {
                    entry.status = TokenStatus::Revoked;
                }
            }
        }
        Ok(())
    }

    async fn bind_client(&self, jti: &str, client_id: &str) -> Result<(), StorageError> {
        self.clients
            .entry(client_id.to_owned())
            .or_default()
            .push(jti.to_owned());
        Ok(())
    }
}

/// Process-local [`AuthorizationContextStore`].
#[derive(Debug, Default)]
pub struct InMemoryAuthorizationContextStore {
    contexts: DashMap<Vec<u8>, AuthorizationContext>,
}

impl InMemoryAuthorizationContextStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuthorizationContextStore for InMemoryAuthorizationContextStore {
    async fn put(
        &self,
        code_hash: &[u8],
        context: AuthorizationContext,
    ) -> Result<(), StorageError> {
        self.contexts.insert(code_hash.to_vec(), context);
        Ok(())
    }

    async fn take(
        &self,
        code_hash: &[u8],
    ) -> Result<Option<AuthorizationContext>, StorageError> {
        let taken = self.contexts.remove(code_hash).map(|(_, ctx)| ctx);
        Ok(taken.filter(|ctx| ctx.expires_at > Utc::now()))
    }
}

/// Process-local [`PushedRequestStore`].
#[derive(Debug, Default)]
pub struct InMemoryPushedRequestStore {
    requests: DashMap<String, PendingAuthorization>,
}

impl InMemoryPushedRequestStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PushedRequestStore for InMemoryPushedRequestStore {
    async fn put(&self, pending: PendingAuthorization) -> Result<(), StorageError> {
        self.requests.insert(pending.id.clone(), pending);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<PendingAuthorization>, StorageError> {
        Ok(self
            .requests
            .get(id)
            .map(|p| p.clone())
            .filter(|p| !p.is_expired(Utc::now())))
    }

    async fn take(&self, id: &str) -> Result<Option<PendingAuthorization>, StorageError> {
        let taken = self.requests.remove(id).map(|(_, p)| p);
        Ok(taken.filter(|p| !p.is_expired(Utc::now())))
    }
}

/// Process-local [`CibaStore`] with per-request wakeups for long-polling.
#[derive(Debug, Default)]
pub struct InMemoryCibaStore {
    requests: DashMap<String, CibaRequest>,
    wakeups: DashMap<String, Arc<Notify>>,
}

impl InMemoryCibaStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn wakeup(&self, auth_req_id: &str) -> Arc<Notify> {
        self.wakeups
            .entry(auth_req_id.to_owned())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }
}

#[async_trait]
impl CibaStore for InMemoryCibaStore {
    async fn put(&self, request: CibaRequest) -> Result<(), StorageError> {
        self.requests.insert(request.auth_req_id.clone(), request);
        Ok(())
    }

    async fn get(&self, auth_req_id: &str) -> Result<Option<CibaRequest>, StorageError> {
        Ok(self.requests.get(auth_req_id).map(|r| r.clone()))
    }

    async fn update(&self, request: CibaRequest) -> Result<(), StorageError> {
        let wakeup = self.wakeup(&request.auth_req_id);
        self.requests.insert(request.auth_req_id.clone(), request);
        // notify_waiters wakes registered sleepers; the extra notify_one
        // leaves a permit for a waiter racing its registration.
        wakeup.notify_waiters();
        wakeup.notify_one();
        Ok(())
    }

    async fn remove(&self, auth_req_id: &str) -> Result<(), StorageError> {
        self.requests.remove(auth_req_id);
        self.wakeups.remove(auth_req_id);
        Ok(())
    }

    async fn changed(&self, auth_req_id: &str) {
        let wakeup = self.wakeup(auth_req_id);
        wakeup.notified().await;
    }
}

/// Process-local [`DeviceGrantStore`].
#[derive(Debug, Default)]
pub struct InMemoryDeviceGrantStore {
    by_device_code: DashMap<String, DeviceGrant>,
    by_user_code: DashMap<String, String>,
}

impl InMemoryDeviceGrantStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeviceGrantStore for InMemoryDeviceGrantStore {
    async fn put(&self, grant: DeviceGrant) -> Result<(), StorageError> {
        self.by_user_code
            .insert(grant.user_code.clone(), grant.device_code.clone());
        self.by_device_code.insert(grant.device_code.clone(), grant);
        Ok(())
    }

    async fn get_by_device_code(
        &self,
        device_code: &str,
    ) -> Result<Option<DeviceGrant>, StorageError> {
        Ok(self.by_device_code.get(device_code).map(|g| g.clone()))
    }

    async fn get_by_user_code(
        &self,
        user_code: &str,
    ) -> Result<Option<DeviceGrant>, StorageError> {
        let Some(device_code) = self.by_user_code.get(user_code).map(|c| c.clone()) else {
            return Ok(None);
        };
        Ok(self.by_device_code.get(&device_code).map(|g| g.clone()))
    }

    async fn update(&self, grant: DeviceGrant) -> Result<(), StorageError> {
        self.by_device_code.insert(grant.device_code.clone(), grant);
        Ok(())
    }

    async fn remove(&self, device_code: &str) -> Result<(), StorageError> {
        if let Some((_, grant)) = self.by_device_code.remove(device_code) {
            self.by_user_code.remove(&grant.user_code);
        }
        Ok(())
    }
}

/// Process-local [`RegistrationHandleStore`].
#[derive(Debug, Default)]
pub struct InMemoryRegistrationHandleStore {
    handles: DashMap<String, RegisteredClientHandle>,
}

impl InMemoryRegistrationHandleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RegistrationHandleStore for InMemoryRegistrationHandleStore {
    async fn put(&self, handle: RegisteredClientHandle) -> Result<(), StorageError> {
        self.handles.insert(handle.client_id.clone(), handle);
        Ok(())
    }

    async fn get(
        &self,
        client_id: &str,
    ) -> Result<Option<RegisteredClientHandle>, StorageError> {
        Ok(self.handles.get(client_id).map(|h| h.clone()))
    }

    async fn remove(&self, client_id: &str) -> Result<(), StorageError> {
        self.handles.remove(client_id);
        Ok(())
    }
}

/// Process-local [`RateCounterStore`] with sliding windows.
#[derive(Debug, Default)]
pub struct InMemoryRateCounterStore {
    events: DashMap<String, Vec<Instant>>,
    backoffs: DashMap<String, DateTime<Utc>>,
}

impl InMemoryRateCounterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateCounterStore for InMemoryRateCounterStore {
    async fn increment(&self, key: &str, window: Duration) -> Result<u32, StorageError> {
        let now = Instant::now();
        let mut events = self.events.entry(key.to_owned()).or_default();
        events.retain(|at| now.duration_since(*at) < window);
        events.push(now);
        Ok(events.len() as u32)
    }

    async fn set_backoff(&self, key: &str, until: DateTime<Utc>) -> Result<(), StorageError> {
        self.backoffs.insert(key.to_owned(), until);
        Ok(())
    }

    async fn get_backoff(&self, key: &str) -> Result<Option<DateTime<Utc>>, StorageError> {
        Ok(self
            .backoffs
            .get(key)
            .map(|until| *until)
            .filter(|until| *until > Utc::now()))
    }

    async fn clear(&self, key: &str) -> Result<(), StorageError> {
        self.events.remove(key);
        self.backoffs.remove(key);
        Ok(())
    }
}

/// Process-local client catalogue.
#[derive(Debug, Default)]
pub struct InMemoryClientCatalogue {
    clients: DashMap<String, ClientInfo>,
}

impl InMemoryClientCatalogue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clients(clients: impl IntoIterator<Item = ClientInfo>) -> Self {
        let catalogue = Self::new();
        for client in clients {
            catalogue.clients.insert(client.client_id.clone(), client);
        }
        catalogue
    }
}

#[async_trait]
impl ClientInfoProvider for InMemoryClientCatalogue {
    async fn lookup(&self, client_id: &str) -> Result<Option<ClientInfo>, StorageError> {
        Ok(self.clients.get(client_id).map(|c| c.clone()))
    }
}

#[async_trait]
impl ClientInfoManager for InMemoryClientCatalogue {
    async fn add(&self, client: ClientInfo) -> Result<(), StorageError> {
        self.clients.insert(client.client_id.clone(), client);
        Ok(())
    }

    async fn update(&self, client: ClientInfo) -> Result<(), StorageError> {
        self.clients.insert(client.client_id.clone(), client);
        Ok(())
    }

    async fn remove(&self, client_id: &str) -> Result<(), StorageError> {
        self.clients.remove(client_id);
        Ok(())
    }
}

/// Session service holding one ambient session, for embedding demos and
/// the test suites.
#[derive(Debug, Default)]
pub struct InMemorySessionService {
    current: RwLock<Option<AuthSession>>,
}

impl InMemorySessionService {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sign_in(&self, session: AuthSession) {
        *self.current.write().await = Some(session);
    }
}

#[async_trait]
impl AuthSessionService for InMemorySessionService {
    async fn authenticate(&self) -> Result<Option<AuthSession>, StorageError> {
        Ok(self.current.read().await.clone())
    }

    async fn update(&self, session: AuthSession) -> Result<(), StorageError> {
        let mut current = self.current.write().await;
        if current
            .as_ref()
            .is_some_and(|c| c.session_id == session.session_id)
        {
            *current = Some(session);
        }
        Ok(())
    }

    async fn sign_out(&self, session_id: &str) -> Result<Option<AuthSession>, StorageError> {
        let mut current = self.current.write().await;
        if current.as_ref().is_some_and(|c| c.session_id == session_id) {
            Ok(current.take())
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn try_consume_is_single_shot() {
        let registry = InMemoryTokenRegistry::new();
        registry
            .set_status("jti-1", TokenStatus::Active, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(registry.try_consume("jti-1").await.unwrap());
        assert!(!registry.try_consume("jti-1").await.unwrap());
        assert_eq!(
            registry.get_status("jti-1").await.unwrap(),
            TokenStatus::Used
        );
    }

    #[tokio::test]
    async fn try_consume_on_unknown_jti_succeeds_once() {
        let registry = InMemoryTokenRegistry::new();
        assert!(registry.try_consume("fresh").await.unwrap());
        assert!(!registry.try_consume("fresh").await.unwrap());
    }

    #[tokio::test]
    async fn chain_revocation_marks_all_links() {
        let registry = InMemoryTokenRegistry::new();
        for jti in ["r1", "r2"] {
            registry
                .set_status(jti, TokenStatus::Active, Duration::from_secs(60))
                .await
                .unwrap();
            registry.bind_chain(jti, "chain-a").await.unwrap();
        }
        registry.revoke_chain("chain-a").await.unwrap();
        assert_eq!(
            registry.get_status("r1").await.unwrap(),
            TokenStatus::Revoked
        );
        assert_eq!(
            registry.get_status("r2").await.unwrap(),
            TokenStatus::Revoked
        );
    }

    #[tokio::test]
    async fn expired_registry_records_read_as_active() {
        let registry = InMemoryTokenRegistry::new();
        registry
            .set_status("ephemeral", TokenStatus::Revoked, Duration::from_secs(0))
            .await
            .unwrap();
        assert_eq!(
            registry.get_status("ephemeral").await.unwrap(),
            TokenStatus::Active
        );
    }

    #[tokio::test]
    async fn device_store_user_code_index_follows_removal() {
        let store = InMemoryDeviceGrantStore::new();
        let grant = DeviceGrant {
            device_code: "dc".into(),
            user_code: "1234".into(),
            client_id: "c1".into(),
            scopes: vec![],
            verification_uri: url::Url::parse("https://device.example").unwrap(),
            status: crate::records::DeviceGrantStatus::Pending,
            subject: None,
            session_id: None,
            expires_at: Utc::now() + chrono::TimeDelta::minutes(5),
            next_poll_at: Utc::now(),
            interval: Duration::from_secs(5),
        };
        store.put(grant).await.unwrap();
        assert!(store.get_by_user_code("1234").await.unwrap().is_some());
        store.remove("dc").await.unwrap();
        assert!(store.get_by_user_code("1234").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn ciba_wakeup_races_are_covered_by_the_permit() {
        let store = InMemoryCibaStore::new();
        let request = CibaRequest {
            auth_req_id: "req-1".into(),
            client_id: "c1".into(),
            scopes: vec!["openid".into()],
            resources: vec![],
            subject_hint: None,
            binding_message: None,
            user_code: None,
            status: crate::records::CibaStatus::Pending,
            subject: None,
            session_id: None,
            delivery_mode: crate::client::BackchannelTokenDeliveryMode::Poll,
            client_notification_token: None,
            expires_at: Utc::now() + chrono::TimeDelta::minutes(5),
            next_poll_at: Utc::now(),
            interval: Duration::from_secs(5),
        };
        store.put(request.clone()).await.unwrap();
        // Update before the waiter registers: the stored permit must still
        // wake it.
        let mut approved = request.clone();
        approved.status = crate::records::CibaStatus::Authorized;
        store.update(approved).await.unwrap();
        tokio::time::timeout(Duration::from_millis(100), store.changed("req-1"))
            .await
            .expect("waiter should be woken by the stored permit");
    }

    #[tokio::test]
    async fn rate_counter_window_slides() {
        let store = InMemoryRateCounterStore::new();
        assert_eq!(
            store
                .increment("ip:1.2.3.4", Duration::from_secs(60))
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            store
                .increment("ip:1.2.3.4", Duration::from_secs(60))
                .await
                .unwrap(),
            2
        );
        store.clear("ip:1.2.3.4").await.unwrap();
        assert_eq!(
            store
                .increment("ip:1.2.3.4", Duration::from_secs(60))
                .await
                .unwrap(),
            1
        );
    }
}
