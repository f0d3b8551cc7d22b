//! SSRF-safe outbound HTTP
//!
//! Every URL the server dereferences on behalf of a client - `jwks_uri`,
//! remote `request_uri`, CIBA notification endpoints, back-channel logout
//! URIs - goes through this fetcher. The hostname is resolved up front and
//! every address must pass the policy before a connection is attempted;
//! responses are size-capped and deadline-bound.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

/// Cloud metadata endpoint shared by the major providers.
const METADATA_ENDPOINT: IpAddr = IpAddr::V4(Ipv4Addr::new(169, 254, 169, 254));

/// Outbound fetch failures.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("URL scheme {0} is not allowed")]
    SchemeNotAllowed(String),

    #[error("URL has no host")]
    MissingHost,

    #[error("hostname resolution failed for {0}")]
    ResolutionFailed(String),

    #[error("address {0} blocked: {1}")]
    AddressBlocked(IpAddr, &'static str),

    #[error("response exceeds {limit} bytes")]
    ResponseTooLarge { limit: usize },

    #[error("upstream request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("upstream returned status {0}")]
    Status(u16),
}

/// Which destinations outbound requests may reach.
#[derive(Debug, Clone)]
pub struct SsrfPolicy {
    /// RFC 1918 and IPv6 unique-local ranges.
    pub allow_private_networks: bool,
    /// 127.0.0.0/8 and ::1.
    pub allow_loopback: bool,
    /// 169.254.0.0/16 and fe80::/10.
    pub allow_link_local: bool,
    pub require_https: bool,
    pub max_response_bytes: usize,
    pub request_timeout: Duration,
    /// Connection pool recycling, so long-lived processes re-resolve DNS.
    pub pool_idle_timeout: Duration,
}

impl Default for SsrfPolicy {
    fn default() -> Self {
        Self {
            allow_private_networks: false,
            allow_loopback: false,
            allow_link_local: false,
            require_https: true,
            max_response_bytes: 64 * 1024,
            request_timeout: Duration::from_secs(10),
            pool_idle_timeout: Duration::from_secs(300),
        }
    }
}

impl SsrfPolicy {
    /// Everything open, for test servers on localhost.
    pub fn permissive() -> Self {
        Self {
            allow_private_networks: true,
            allow_loopback: true,
            allow_link_local: false,
            require_https: false,
            ..Self::default()
        }
    }

    fn check_addr(&self, addr: IpAddr) -> Result<(), FetchError> {
        if addr == METADATA_ENDPOINT {
            return Err(FetchError::AddressBlocked(addr, "cloud metadata endpoint"));
        }
        if addr.is_loopback() && !self.allow_loopback {
            return Err(FetchError::AddressBlocked(addr, "loopback"));
        }
        match addr {
            IpAddr::V4(v4) => {
                if v4.is_link_local() && !self.allow_link_local {
                    return Err(FetchError::AddressBlocked(addr, "link-local"));
                }
                if v4.is_private() && !self.allow_private_networks {
                    return Err(FetchError::AddressBlocked(addr, "private range"));
                }
                if v4.is_unspecified() || v4.is_broadcast() {
                    return Err(FetchError::AddressBlocked(addr, "non-routable"));
                }
            }
            IpAddr::V6(v6) => {
                // fe80::/10
                if (v6.segments()[0] & 0xffc0) == 0xfe80 && !self.allow_link_local {
                    return Err(FetchError::AddressBlocked(addr, "link-local"));
                }
                // fc00::/7 unique local
                if (v6.segments()[0] & 0xfe00) == 0xfc00 && !self.allow_private_networks {
                    return Err(FetchError::AddressBlocked(addr, "unique-local range"));
                }
                if v6.is_unspecified() {
                    return Err(FetchError::AddressBlocked(addr, "non-routable"));
                }
            }
        }
        Ok(())
    }
}

/// Policy-enforcing HTTP client for all server-initiated requests.
#[derive(Debug)]
pub struct SafeHttpFetcher {
    policy: SsrfPolicy,
    client: reqwest::Client,
}

impl SafeHttpFetcher {
    /// # Panics
    ///
    /// Panics only if the TLS backend cannot initialize, which is a
    /// deployment defect surfaced at construction.
    pub fn new(policy: SsrfPolicy) -> Self {
        let client = reqwest::Client::builder()
            .timeout(policy.request_timeout)
            .pool_idle_timeout(policy.pool_idle_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .expect("HTTP client construction cannot fail with static options");
        Self { policy, client }
    }

    /// Validate scheme and every resolved address against the policy.
    ///
    /// # Errors
    ///
    /// [`FetchError`] naming the first violation.
    pub async fn validate_url(&self, url: &Url) -> Result<(), FetchError> {
        match url.scheme() {
            "https" => {}
            "http" if !self.policy.require_https => {}
            other => return Err(FetchError::SchemeNotAllowed(other.to_owned())),
        }
        let host = url.host_str().ok_or(FetchError::MissingHost)?;

        // Literal addresses skip DNS but not the policy.
        if let Ok(addr) = host.trim_matches(['[', ']']).parse::<IpAddr>() {
            return self.policy.check_addr(addr);
        }

        let port = url.port_or_known_default().unwrap_or(443);
        let addrs: Vec<IpAddr> = tokio::net::lookup_host((host, port))
            .await
            .map_err(|_| FetchError::ResolutionFailed(host.to_owned()))?
            .map(|sock| sock.ip())
            .collect();
        if addrs.is_empty() {
            return Err(FetchError::ResolutionFailed(host.to_owned()));
        }
        for addr in addrs {
            self.policy.check_addr(addr)?;
        }
        Ok(())
    }

    /// GET a JSON document.
    ///
    /// # Errors
    ///
    /// [`FetchError`] for policy violations, transport failures, non-2xx
    /// statuses or oversized bodies.
    pub async fn get_json(&self, url: &Url) -> Result<serde_json::Value, FetchError> {
        let body = self.get_bytes(url).await?;
        serde_json::from_slice(&body).map_err(|e| {
            warn!(url = %url, error = %e, "upstream body is not JSON");
            FetchError::Status(502)
        })
    }

    /// GET raw bytes with the size cap enforced.
    ///
    /// # Errors
    ///
    /// [`FetchError`] as for [`Self::get_json`].
    pub async fn get_bytes(&self, url: &Url) -> Result<Vec<u8>, FetchError> {
        self.validate_url(url).await?;
        debug!(url = %url, "outbound GET");
        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }
        if let Some(len) = response.content_length()
            && len as usize > self.policy.max_response_bytes
        {
            return Err(FetchError::ResponseTooLarge {
                limit: self.policy.max_response_bytes,
            });
        }
        let body = response.bytes().await?;
        if body.len() > self.policy.max_response_bytes {
            return Err(FetchError::ResponseTooLarge {
                limit: self.policy.max_response_bytes,
            });
        }
        Ok(body.to_vec())
    }

    /// POST a form body (logout tokens, CIBA notifications).
    ///
    /// # Errors
    ///
    /// [`FetchError`] for policy violations, transport failures or non-2xx
    /// statuses.
    pub async fn post_form(
        &self,
        url: &Url,
        form: &[(&str, &str)],
        bearer: Option<&str>,
    ) -> Result<(), FetchError> {
        self.validate_url(url).await?;
        debug!(url = %url, "outbound POST");
        let mut request = self.client.post(url.clone()).form(form);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }
        Ok(())
    }

    /// POST a JSON body.
    ///
    /// # Errors
    ///
    /// [`FetchError`] as for [`Self::post_form`].
    pub async fn post_json(
        &self,
        url: &Url,
        body: &serde_json::Value,
        bearer: Option<&str>,
    ) -> Result<(), FetchError> {
        self.validate_url(url).await?;
        let mut request = self.client.post(url.clone()).json(body);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }
        Ok(())
    }
}

impl Default for SafeHttpFetcher {
    fn default() -> Self {
        Self::new(SsrfPolicy::default())
    }
}
