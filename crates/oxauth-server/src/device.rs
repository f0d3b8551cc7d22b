//! Device authorization grant engine (RFC 8628)
//!
//! Issues the `device_code` / `user_code` pair and handles the
//! verification side: the user enters the code on a second device, and the
//! engine defends the code space with per-IP sliding-window limits and
//! per-code exponential backoff.

use chrono::{DateTime, TimeDelta, Utc};
use oxauth_core::error::ProtocolError;
use oxauth_core::random;
use oxauth_core::records::{DeviceGrant, DeviceGrantStatus};
use tracing::{info, warn};

use crate::client_auth::ClientAuthEvidence;
use crate::issuance::Ctx;
use crate::messages::{DeviceAuthorizationRequest, DeviceAuthorizationResponse};

/// The user's decision at the verification UI.
#[derive(Debug, Clone)]
pub enum DeviceDecision {
    Approve {
        subject: String,
        session_id: Option<String>,
    },
    Deny,
}

pub struct DeviceAuthorizationHandler {
    ctx: Ctx,
}

impl DeviceAuthorizationHandler {
    pub fn new(ctx: Ctx) -> Self {
        Self { ctx }
    }

    /// Open one device grant.
    ///
    /// # Errors
    ///
    /// `invalid_client` or `invalid_scope`.
    pub async fn handle(
        &self,
        request: &DeviceAuthorizationRequest,
        evidence: &ClientAuthEvidence,
    ) -> Result<DeviceAuthorizationResponse, ProtocolError> {
        let issuer = self.ctx.issuer_id().await?;
        let audiences = self.ctx.client_assertion_audiences(&issuer);
        let client = self
            .ctx
            .authenticator
            .authenticate(evidence, &audiences)
            .await?;

        let scopes: Vec<String> = request
            .scope
            .as_deref()
            .unwrap_or_default()
            .split_ascii_whitespace()
            .map(str::to_owned)
            .collect();
        for scope in &scopes {
            if !client.allows_scope(scope) {
                return Err(ProtocolError::invalid_scope(format!(
                    "scope {scope} is not allowed for this client"
                )));
            }
        }

        let options = &self.ctx.options.device;
        let now = Utc::now();
        let device_code = random::urlsafe(options.device_code_entropy_bytes);
        let user_code = random::from_alphabet(&options.user_code_alphabet, options.user_code_length);

        let mut verification_uri_complete = options.verification_uri.clone();
        verification_uri_complete
            .query_pairs_mut()
            .append_pair("user_code", &user_code);

        let grant = DeviceGrant {
            device_code: device_code.clone(),
            user_code: user_code.clone(),
            client_id: client.client_id.clone(),
            scopes,
            verification_uri: options.verification_uri.clone(),
            status: DeviceGrantStatus::Pending,
            subject: None,
            session_id: None,
            expires_at: now
                + TimeDelta::from_std(options.code_lifetime)
                    .map_err(|_| ProtocolError::server_error("code lifetime out of range"))?,
            next_poll_at: now,
            interval: options.polling_interval,
        };
        self.ctx.devices.put(grant).await?;
        info!(client_id = %client.client_id, "device grant opened");

        Ok(DeviceAuthorizationResponse {
            device_code,
            user_code,
            verification_uri: options.verification_uri.as_str().to_owned(),
            verification_uri_complete: verification_uri_complete.into(),
            expires_in: options.code_lifetime.as_secs(),
            interval: options.polling_interval.as_secs(),
        })
    }

    /// Apply the user's decision at the verification endpoint.
    ///
    /// `source_ip` keys the sliding-window abuse counters; the caller
    /// passes the ingress peer address.
    ///
    /// # Errors
    ///
    /// `slow_down` while a backoff is active, `access_denied` past the
    /// per-IP budget, `invalid_grant` for unknown codes, `expired_token`
    /// for dead grants.
    pub async fn submit_user_code(
        &self,
        user_code: &str,
        source_ip: &str,
        decision: DeviceDecision,
    ) -> Result<(), ProtocolError> {
        let options = &self.ctx.options.device;
        let ip_key = format!("device:ip:{source_ip}");
        let code_key = format!("device:code:{user_code}");

        for key in [&ip_key, &code_key] {
            if let Some(until) = self.ctx.rates.get_backoff(key).await? {
                warn!(key = %key, until = %until, "device verification under backoff");
                return Err(ProtocolError::slow_down());
            }
        }

        let grant = self.ctx.devices.get_by_user_code(user_code).await?;
        let now = Utc::now();
        let usable = grant
            .as_ref()
            .is_some_and(|g| g.status == DeviceGrantStatus::Pending && !g.is_expired(now));
        if !usable {
            self.record_failure(&ip_key, &code_key, now).await?;
            return match grant {
                Some(g) if g.is_expired(now) => {
                    Err(ProtocolError::expired_token("user_code is expired"))
                }
                Some(_) => Err(ProtocolError::invalid_grant(
                    "user_code has already been decided",
                )),
                None => Err(ProtocolError::invalid_grant("user_code is unknown")),
            };
        }
        let mut grant = grant.expect("usable implies present");

        match decision {
            DeviceDecision::Approve {
                subject,
                session_id,
            } => {
                grant.status = DeviceGrantStatus::Approved;
                grant.subject = Some(subject);
                grant.session_id = session_id;
            }
            DeviceDecision::Deny => grant.status = DeviceGrantStatus::Denied,
        }
        info!(device_code = %grant.device_code, status = ?grant.status, "device grant decided");
        self.ctx.devices.update(grant).await?;
        self.ctx.rates.clear(&ip_key).await?;
        self.ctx.rates.clear(&code_key).await?;
        Ok(())
    }

    /// Count one failure on both axes and arm exponential backoff past
    /// the budgets.
    async fn record_failure(
        &self,
        ip_key: &str,
        code_key: &str,
        now: DateTime<Utc>,
    ) -> Result<(), ProtocolError> {
        let options = &self.ctx.options.device;
        let ip_count = self
            .ctx
            .rates
            .increment(ip_key, options.rate_limit_window)
            .await?;
        let code_count = self
            .ctx
            .rates
            .increment(code_key, options.rate_limit_window)
            .await?;

        if ip_count > options.max_ip_failures_per_window {
            let over = ip_count - options.max_ip_failures_per_window;
            self.arm_backoff(ip_key, over, now).await?;
        }
        if code_count >= options.max_failures_before_backoff {
            let over = code_count - options.max_failures_before_backoff + 1;
            self.arm_backoff(code_key, over, now).await?;
        }
        Ok(())
    }

    /// Backoff doubles per excess failure, capped at `max_backoff`.
    async fn arm_backoff(
        &self,
        key: &str,
        excess: u32,
        now: DateTime<Utc>,
    ) -> Result<(), ProtocolError> {
        let options = &self.ctx.options.device;
        let base = options.rate_limit_window;
        let factor = 2u32.saturating_pow(excess.min(16).saturating_sub(1));
        let backoff = base.saturating_mul(factor).min(options.max_backoff);
        let until = now
            + TimeDelta::from_std(backoff)
                .unwrap_or_else(|_| TimeDelta::seconds(3600));
        warn!(key = %key, until = %until, "device verification backoff armed");
        self.ctx.rates.set_backoff(key, until).await?;
        Ok(())
    }
}
