//! Client catalogue and client key resolution
//!
//! [`ClientCatalogue`] fronts the injected provider with a process cache
//! that registration mutations invalidate. [`ClientKeyResolver`] turns a
//! client's registered key material into a usable `JwkSet`: an embedded
//! `jwks` is authoritative; only when absent is the `jwks_uri` fetched
//! (SSRF-safe, TTL-cached, single-flight per URI). The two sources are
//! never merged.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use jsonwebtoken::jwk::JwkSet;
use oxauth_core::client::ClientInfo;
use oxauth_core::collaborators::ClientInfoProvider;
use oxauth_core::error::{ProtocolError, StorageError};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use url::Url;

use crate::ssrf::{FetchError, SafeHttpFetcher};

/// Catalogue wrapper with an invalidating read cache.
pub struct ClientCatalogue {
    provider: Arc<dyn ClientInfoProvider>,
    cache: DashMap<String, ClientInfo>,
    cache_enabled: bool,
}

impl ClientCatalogue {
    pub fn new(provider: Arc<dyn ClientInfoProvider>) -> Self {
        Self {
            provider,
            cache: DashMap::new(),
            cache_enabled: true,
        }
    }

    pub fn without_cache(mut self) -> Self {
        self.cache_enabled = false;
        self
    }

    /// # Errors
    ///
    /// Propagates provider failures.
    pub async fn lookup(&self, client_id: &str) -> Result<Option<ClientInfo>, StorageError> {
        if self.cache_enabled
            && let Some(hit) = self.cache.get(client_id)
        {
            return Ok(Some(hit.clone()));
        }
        let client = self.provider.lookup(client_id).await?;
        if self.cache_enabled
            && let Some(client) = &client
        {
            self.cache.insert(client_id.to_owned(), client.clone());
        }
        Ok(client)
    }

    /// Lookup that turns absence into the protocol error the
    /// authorization pipeline surfaces.
    ///
    /// # Errors
    ///
    /// `invalid_request` for unknown ids, `server_error` for backend
    /// failures.
    pub async fn require(&self, client_id: &str) -> Result<ClientInfo, ProtocolError> {
        self.lookup(client_id)
            .await?
            .ok_or_else(|| ProtocolError::invalid_request(format!("unknown client {client_id}")))
    }

    /// Drop the cached record; every registration mutation calls this.
    pub fn invalidate(&self, client_id: &str) {
        self.cache.remove(client_id);
    }
}

/// Key resolution failures; callers map them to the protocol error that
/// fits their context (`invalid_client` for authentication, ...).
#[derive(Debug, Error)]
pub enum KeyResolveError {
    #[error("client has no registered key material")]
    NoKeys,

    #[error("registered JWKS document is malformed: {0}")]
    Malformed(String),

    #[error(transparent)]
    Fetch(#[from] FetchError),
}

#[derive(Clone)]
struct CachedJwks {
    jwks: JwkSet,
    fetched_at: Instant,
}

/// Resolves and caches client / trusted-issuer key sets.
pub struct ClientKeyResolver {
    fetcher: Arc<SafeHttpFetcher>,
    cache: DashMap<String, CachedJwks>,
    flights: DashMap<String, Arc<Mutex<()>>>,
    ttl: Duration,
}

impl ClientKeyResolver {
    pub fn new(fetcher: Arc<SafeHttpFetcher>, ttl: Duration) -> Self {
        Self {
            fetcher,
            cache: DashMap::new(),
            flights: DashMap::new(),
            ttl,
        }
    }

    /// The client's key set, embedded material first.
    ///
    /// # Errors
    ///
    /// [`KeyResolveError`] when neither source yields usable keys.
    pub async fn resolve(&self, client: &ClientInfo) -> Result<JwkSet, KeyResolveError> {
        if let Some(embedded) = &client.keys.jwks {
            return serde_json::from_value(embedded.clone())
                .map_err(|e| KeyResolveError::Malformed(e.to_string()));
        }
        match &client.keys.jwks_uri {
            Some(uri) => self.fetch_cached(uri).await,
            None => Err(KeyResolveError::NoKeys),
        }
    }

    /// A trusted issuer's key set by URI, same cache and policy.
    ///
    /// # Errors
    ///
    /// [`KeyResolveError`] for fetch or decode failures.
    pub async fn fetch_cached(&self, uri: &Url) -> Result<JwkSet, KeyResolveError> {
        let key = uri.as_str().to_owned();
        if let Some(hit) = self.cache.get(&key)
            && hit.fetched_at.elapsed() < self.ttl
        {
            debug!(uri = %uri, "JWKS cache hit");
            return Ok(hit.jwks.clone());
        }

        // Single flight per URI: losers of the race find a fresh entry.
        let flight = self
            .flights
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = flight.lock().await;
        if let Some(hit) = self.cache.get(&key)
            && hit.fetched_at.elapsed() < self.ttl
        {
            return Ok(hit.jwks.clone());
        }

        let document = self.fetcher.get_json(uri).await.map_err(|e| {
            warn!(uri = %uri, error = %e, "JWKS fetch failed");
            e
        })?;
        let jwks: JwkSet = serde_json::from_value(document)
            .map_err(|e| KeyResolveError::Malformed(e.to_string()))?;
        self.cache.insert(
            key,
            CachedJwks {
                jwks: jwks.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(jwks)
    }

    /// Forget a cached URI (used when verification fails after rotation).
    pub fn evict(&self, uri: &Url) {
        self.cache.remove(uri.as_str());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oxauth_core::memory::InMemoryClientCatalogue;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::ssrf::SsrfPolicy;

    fn sample_jwks() -> serde_json::Value {
        // A structurally valid RSA JWK (values are not a real key pair).
        json!({
            "keys": [{
                "kty": "RSA",
                "kid": "k1",
                "use": "sig",
                "alg": "RS256",
                "n": "sXchTnjCmH4wZFcZDq4W1H4f4fai9X7PbTFjMaoGLeSwAn0Wog_t3yuSNYhhPJMafSHsuZWVyOxRiqyyBMTy1g",
                "e": "AQAB"
            }]
        })
    }

    fn resolver() -> ClientKeyResolver {
        ClientKeyResolver::new(
            Arc::new(SafeHttpFetcher::new(SsrfPolicy::permissive())),
            Duration::from_secs(3600),
        )
    }

    #[tokio::test]
    async fn embedded_jwks_wins_over_uri() {
        let mut client = ClientInfo::public("c1");
        client.keys.jwks = Some(sample_jwks());
        // A jwks_uri that would fail if consulted.
        client.keys.jwks_uri = Some(Url::parse("https://unreachable.invalid/jwks").unwrap());
        let jwks = resolver().resolve(&client).await.unwrap();
        assert_eq!(jwks.keys.len(), 1);
    }

    #[tokio::test]
    async fn uri_fetch_is_cached() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(sample_jwks()))
            .expect(1)
            .mount(&server)
            .await;

        let mut client = ClientInfo::public("c1");
        client.keys.jwks_uri = Some(Url::parse(&format!("{}/jwks", server.uri())).unwrap());

        let resolver = resolver();
        resolver.resolve(&client).await.unwrap();
        resolver.resolve(&client).await.unwrap();
        // expect(1) verifies the second resolve came from cache.
    }

    #[tokio::test]
    async fn no_key_material_is_an_error() {
        let client = ClientInfo::public("c1");
        assert!(matches!(
            resolver().resolve(&client).await,
            Err(KeyResolveError::NoKeys)
        ));
    }

    #[tokio::test]
    async fn catalogue_cache_invalidates() {
        let backing = Arc::new(InMemoryClientCatalogue::new());
        use oxauth_core::collaborators::ClientInfoManager;
        backing.add(ClientInfo::public("c1")).await.unwrap();

        let catalogue = ClientCatalogue::new(backing.clone());
        assert!(catalogue.lookup("c1").await.unwrap().is_some());

        backing.remove("c1").await.unwrap();
        // Stale until invalidated.
        assert!(catalogue.lookup("c1").await.unwrap().is_some());
        catalogue.invalidate("c1");
        assert!(catalogue.lookup("c1").await.unwrap().is_none());
    }
}
