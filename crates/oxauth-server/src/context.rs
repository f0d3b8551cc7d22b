//! Server context
//!
//! The wiring point between host-injected collaborators, storage backends
//! and the endpoint handlers. Construction takes what the host must
//! supply; every storage backend defaults to the in-memory reference
//! implementation and can be swapped with a `with_*` call.

use std::sync::Arc;

use oxauth_core::collaborators::{
    AuthSessionService, ClientInfoManager, ClientInfoProvider, IssuerProvider, UserInfoProvider,
    UserInteraction,
};
use oxauth_core::config::OidcOptions;
use oxauth_core::error::ProtocolError;
use oxauth_core::memory::{
    InMemoryAuthorizationContextStore, InMemoryCibaStore, InMemoryDeviceGrantStore,
    InMemoryPushedRequestStore, InMemoryRateCounterStore, InMemoryRegistrationHandleStore,
    InMemoryTokenRegistry,
};
use oxauth_core::storage::{
    AuthorizationContextStore, CibaStore, DeviceGrantStore, PushedRequestStore, RateCounterStore,
    RegistrationHandleStore, TokenRegistry,
};
use oxauth_jose::keys::KeyRing;
use oxauth_jose::token::TokenService;

use crate::catalogue::{ClientCatalogue, ClientKeyResolver};
use crate::client_auth::{AuthenticatorOptions, ClientAuthenticator};
use crate::ssrf::{SafeHttpFetcher, SsrfPolicy};

/// Everything the endpoint handlers share.
pub struct ServerContext {
    pub options: OidcOptions,
    pub issuer: Arc<dyn IssuerProvider>,
    pub tokens: Arc<TokenService>,
    pub registry: Arc<dyn TokenRegistry>,
    pub catalogue: Arc<ClientCatalogue>,
    pub client_keys: Arc<ClientKeyResolver>,
    pub authenticator: Arc<ClientAuthenticator>,
    pub fetcher: Arc<SafeHttpFetcher>,
    pub contexts: Arc<dyn AuthorizationContextStore>,
    pub pushed: Arc<dyn PushedRequestStore>,
    pub ciba: Arc<dyn CibaStore>,
    pub devices: Arc<dyn DeviceGrantStore>,
    pub handles: Arc<dyn RegistrationHandleStore>,
    pub rates: Arc<dyn RateCounterStore>,
    pub sessions: Arc<dyn AuthSessionService>,
    pub interaction: Arc<dyn UserInteraction>,
    pub users: Arc<dyn UserInfoProvider>,
    /// Present when dynamic registration is enabled.
    pub manager: Option<Arc<dyn ClientInfoManager>>,
}

impl ServerContext {
    /// Wire a context from the host's collaborators, with in-memory
    /// defaults for every storage concern.
    ///
    /// # Errors
    ///
    /// Propagates [`OidcOptions::validate`] failures.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        options: OidcOptions,
        issuer: Arc<dyn IssuerProvider>,
        keyring: Arc<KeyRing>,
        clients: Arc<dyn ClientInfoProvider>,
        sessions: Arc<dyn AuthSessionService>,
        interaction: Arc<dyn UserInteraction>,
        users: Arc<dyn UserInfoProvider>,
    ) -> Result<Self, ProtocolError> {
        options.validate()?;

        let registry: Arc<dyn TokenRegistry> = Arc::new(InMemoryTokenRegistry::new());
        let fetcher = Arc::new(SafeHttpFetcher::new(SsrfPolicy::default()));
        let catalogue = Arc::new(ClientCatalogue::new(clients));
        let client_keys = Arc::new(ClientKeyResolver::new(
            fetcher.clone(),
            options.assertions.jwks_cache_duration,
        ));
        let tokens = Arc::new(
            TokenService::new(keyring, registry.clone())
                .with_max_jwt_size(options.assertions.max_jwt_size),
        );
        let authenticator = Arc::new(ClientAuthenticator::new(
            catalogue.clone(),
            client_keys.clone(),
            registry.clone(),
            AuthenticatorOptions {
                clock_skew: options.assertions.clock_skew,
                max_jwt_size: options.assertions.max_jwt_size,
            },
        ));

        Ok(Self {
            options,
            issuer,
            tokens,
            registry,
            catalogue,
            client_keys,
            authenticator,
            fetcher,
            contexts: Arc::new(InMemoryAuthorizationContextStore::new()),
            pushed: Arc::new(InMemoryPushedRequestStore::new()),
            ciba: Arc::new(InMemoryCibaStore::new()),
            devices: Arc::new(InMemoryDeviceGrantStore::new()),
            handles: Arc::new(InMemoryRegistrationHandleStore::new()),
            rates: Arc::new(InMemoryRateCounterStore::new()),
            sessions,
            interaction,
            users,
            manager: None,
        })
    }

    pub fn with_fetcher(mut self, fetcher: Arc<SafeHttpFetcher>) -> Self {
        self.client_keys = Arc::new(ClientKeyResolver::new(
            fetcher.clone(),
            self.options.assertions.jwks_cache_duration,
        ));
        self.fetcher = fetcher;
        self
    }

    pub fn with_registry(mut self, registry: Arc<dyn TokenRegistry>) -> Self {
        self.tokens = Arc::new(
            TokenService::new(self.tokens.keyring().clone(), registry.clone())
                .with_max_jwt_size(self.options.assertions.max_jwt_size),
        );
        self.authenticator = Arc::new(ClientAuthenticator::new(
            self.catalogue.clone(),
            self.client_keys.clone(),
            registry.clone(),
            AuthenticatorOptions {
                clock_skew: self.options.assertions.clock_skew,
                max_jwt_size: self.options.assertions.max_jwt_size,
            },
        ));
        self.registry = registry;
        self
    }

    pub fn with_context_store(mut self, store: Arc<dyn AuthorizationContextStore>) -> Self {
        self.contexts = store;
        self
    }

    pub fn with_pushed_request_store(mut self, store: Arc<dyn PushedRequestStore>) -> Self {
        self.pushed = store;
        self
    }

    pub fn with_ciba_store(mut self, store: Arc<dyn CibaStore>) -> Self {
        self.ciba = store;
        self
    }

    pub fn with_device_store(mut self, store: Arc<dyn DeviceGrantStore>) -> Self {
        self.devices = store;
        self
    }

    pub fn with_handle_store(mut self, store: Arc<dyn RegistrationHandleStore>) -> Self {
        self.handles = store;
        self
    }

    pub fn with_rate_store(mut self, store: Arc<dyn RateCounterStore>) -> Self {
        self.rates = store;
        self
    }

    /// Enable dynamic registration against a mutable catalogue.
    pub fn with_client_manager(mut self, manager: Arc<dyn ClientInfoManager>) -> Self {
        self.manager = Some(manager);
        self
    }

    /// Current issuer identifier.
    ///
    /// # Errors
    ///
    /// `server_error` when the provider fails.
    pub async fn issuer_id(&self) -> Result<String, ProtocolError> {
        Ok(self.issuer.issuer().await?)
    }

    /// Absolute URL of one endpoint under the issuer.
    pub fn endpoint_url(&self, issuer: &str, path: &str) -> String {
        format!("{}{}", issuer.trim_end_matches('/'), path)
    }

    /// The audiences a client assertion may name.
    pub fn client_assertion_audiences(&self, issuer: &str) -> Vec<String> {
        vec![
            self.endpoint_url(issuer, &self.options.paths.token),
            issuer.to_owned(),
        ]
    }
}
