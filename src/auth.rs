//! OAuth2 token lifecycle for Gmail mailboxes
//!
//! [`TokenRefreshCoordinator`] turns a stored credential or the tokens of an
//! inbound session into a Gmail client whose access token is known to work:
//! it refreshes when needed, persists the refreshed record before handing the
//! client out, and verifies the client with one profile fetch.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use crate::client::{ClientFactory, GmailClient};
use crate::credentials::CredentialStore;
use crate::error::{Result, TriageError};
use crate::models::CredentialRecord;

/// Scopes requested at sign-in: identity plus read/write (non-deleting) Gmail access
pub const OAUTH_SCOPES: &[&str] = &[
    "openid",
    "email",
    "profile",
    "https://www.googleapis.com/auth/gmail.modify",
];

pub const GOOGLE_AUTH_URI: &str = "https://accounts.google.com/o/oauth2/v2/auth";
pub const GOOGLE_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

/// Lifetime assumed when the token endpoint omits `expires_in`
pub const DEFAULT_TOKEN_LIFETIME_SECS: u64 = 3600;

/// Marker stored in [`TokenState::error`] after a failed refresh
pub const REFRESH_ERROR: &str = "RefreshAccessTokenError";

/// Shorten a secret for log output
pub fn token_prefix(token: &str) -> String {
    let prefix: String = token.chars().take(4).collect();
    format!("{}…", prefix)
}

/// Token state carried through a refresh, as held by a session or the store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    pub refresh_token: String,
    /// Access-token expiry in epoch seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    /// Sticky flag set when the last refresh or verification failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TokenState {
    pub fn from_record(record: &CredentialRecord) -> Self {
        Self {
            access_token: Some(record.access_token.clone()).filter(|t| !t.is_empty()),
            refresh_token: record.refresh_token.clone(),
            expires_at: record.expires_at,
            error: None,
        }
    }

    /// Stored form of this state; `None` until an access token exists
    pub fn to_record(&self, email: &str) -> Option<CredentialRecord> {
        Some(CredentialRecord {
            email: email.to_string(),
            access_token: self.access_token.clone()?,
            refresh_token: self.refresh_token.clone(),
            expires_at: self.expires_at,
        })
    }

    /// An errored state is refreshed regardless of expiry, as is one with an
    /// unknown expiry or no access token at all.
    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        if self.error.is_some() {
            return true;
        }
        if self.access_token.as_deref().map_or(true, str::is_empty) {
            return true;
        }
        match self.expires_at {
            Some(expires_at) => now.timestamp_millis() >= expires_at.saturating_mul(1000),
            None => true,
        }
    }

    /// Apply a token grant obtained at `now`.
    ///
    /// The refresh token is kept unless the provider issued a new one, and the
    /// error flag is cleared.
    pub fn apply_grant(&self, grant: TokenGrant, now: DateTime<Utc>) -> Self {
        let lifetime_ms = grant
            .expires_in
            .unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS)
            .saturating_mul(1000);
        let lifetime_ms = i64::try_from(lifetime_ms).unwrap_or(i64::MAX);
        let expires_at = now.timestamp_millis().saturating_add(lifetime_ms).div_euclid(1000);

        Self {
            access_token: Some(grant.access_token),
            refresh_token: grant
                .refresh_token
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| self.refresh_token.clone()),
            expires_at: Some(expires_at),
            error: None,
        }
    }

    pub fn is_errored(&self) -> bool {
        self.error.is_some()
    }
}

/// Response of the OAuth token endpoint
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

/// OAuth provider operations used by the coordinator
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Trade a refresh token for a fresh access token
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant>;

    /// Trade an authorization code from the consent redirect for tokens
    async fn exchange_code(&self, code: &str) -> Result<TokenGrant>;
}

/// Google OAuth2 web-server flow over plain HTTP form posts
pub struct GoogleOAuthClient {
    http: reqwest::Client,
    client_id: String,
    client_secret: String,
    redirect_uri: String,
    auth_uri: String,
    token_uri: String,
}

impl GoogleOAuthClient {
    pub fn new(
        client_id: &str,
        client_secret: &str,
        redirect_uri: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TriageError::ConfigError(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            redirect_uri: redirect_uri.to_string(),
            auth_uri: GOOGLE_AUTH_URI.to_string(),
            token_uri: GOOGLE_TOKEN_URI.to_string(),
        })
    }

    /// Point at non-default endpoints (tests, or a proxy)
    pub fn with_endpoints(mut self, auth_uri: &str, token_uri: &str) -> Self {
        self.auth_uri = auth_uri.to_string();
        self.token_uri = token_uri.to_string();
        self
    }

    /// Consent URL the user is redirected to at sign-in
    pub fn authorization_url(&self, state: &str) -> Result<String> {
        let mut url = Url::parse(&self.auth_uri)
            .map_err(|e| TriageError::ConfigError(format!("Invalid auth URI: {}", e)))?;
        url.query_pairs_mut()
            .append_pair("client_id", &self.client_id)
            .append_pair("redirect_uri", &self.redirect_uri)
            .append_pair("response_type", "code")
            .append_pair("scope", &OAUTH_SCOPES.join(" "))
            .append_pair("access_type", "offline")
            .append_pair("prompt", "consent")
            .append_pair("state", state);
        Ok(url.into())
    }

    async fn token_request(&self, form: &[(&str, &str)]) -> Result<TokenGrant> {
        let response = self
            .http
            .post(&self.token_uri)
            .form(form)
            .send()
            .await
            .map_err(|e| TriageError::NetworkError(format!("Token endpoint unreachable: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            // invalid_grant and friends come back as 400/401
            return Err(match status.as_u16() {
                400 | 401 => TriageError::Unauthenticated(format!("Token request rejected: {}", body.trim())),
                code => TriageError::from_status(code, &body, None),
            });
        }

        response
            .json::<TokenGrant>()
            .await
            .map_err(|e| TriageError::InvalidMessageFormat(format!("Unexpected token response: {}", e)))
    }
}

#[async_trait]
impl TokenProvider for GoogleOAuthClient {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant> {
        debug!("Refreshing access token with {}", token_prefix(refresh_token));
        self.token_request(&[
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ])
        .await
    }

    async fn exchange_code(&self, code: &str) -> Result<TokenGrant> {
        self.token_request(&[
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("code", code),
            ("redirect_uri", self.redirect_uri.as_str()),
            ("grant_type", "authorization_code"),
        ])
        .await
    }
}

/// Produces verified Gmail clients from stored or session tokens
#[derive(Clone)]
pub struct TokenRefreshCoordinator {
    provider: Arc<dyn TokenProvider>,
    credentials: CredentialStore,
    factory: Arc<dyn ClientFactory>,
}

impl TokenRefreshCoordinator {
    pub fn new(
        provider: Arc<dyn TokenProvider>,
        credentials: CredentialStore,
        factory: Arc<dyn ClientFactory>,
    ) -> Self {
        Self {
            provider,
            credentials,
            factory,
        }
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    /// Turn `state` into a verified client for `email`.
    ///
    /// The updated state is always returned alongside the outcome so the
    /// caller can store it back. At most one refresh is attempted; a failed
    /// refresh or verification sets the sticky error flag and yields
    /// `Unauthenticated` (or `Forbidden` when the provider denied access).
    pub async fn ensure_valid_client(
        &self,
        email: &str,
        state: TokenState,
    ) -> (TokenState, Result<Arc<dyn GmailClient>>) {
        self.ensure_valid_client_at(email, state, Utc::now()).await
    }

    pub async fn ensure_valid_client_at(
        &self,
        email: &str,
        state: TokenState,
        now: DateTime<Utc>,
    ) -> (TokenState, Result<Arc<dyn GmailClient>>) {
        let mut state = state;

        if state.refresh_token.is_empty() && state.needs_refresh(now) {
            state.error = Some(REFRESH_ERROR.to_string());
            return (
                state,
                Err(TriageError::Unauthenticated(format!(
                    "No refresh token for {}",
                    email
                ))),
            );
        }

        if state.needs_refresh(now) {
            debug!(
                "Refreshing token for {} (expires_at={:?}, errored={})",
                email,
                state.expires_at,
                state.is_errored()
            );
            match self.provider.refresh(&state.refresh_token).await {
                Ok(grant) => {
                    state = state.apply_grant(grant, now);
                    // Durable before anyone may use the new token
                    if let Some(record) = state.to_record(email) {
                        if let Err(e) = self.credentials.save(email, &record).await {
                            warn!("Refreshed token for {} could not be saved: {}", email, e);
                            return (state, Err(e));
                        }
                    }
                    info!("Refreshed access token for {}", email);
                }
                Err(e) => {
                    warn!("Token refresh failed for {}: {}", email, e);
                    state.error = Some(REFRESH_ERROR.to_string());
                    return (
                        state,
                        Err(TriageError::Unauthenticated(format!(
                            "Token refresh failed for {}: {}",
                            email, e
                        ))),
                    );
                }
            }
        }

        let Some(access_token) = state.access_token.clone() else {
            state.error = Some(REFRESH_ERROR.to_string());
            return (
                state,
                Err(TriageError::Unauthenticated(format!(
                    "No access token for {}",
                    email
                ))),
            );
        };

        let client = self.factory.connect(email, &access_token);
        match client.get_profile().await {
            Ok(address) => {
                if !address.eq_ignore_ascii_case(email) {
                    warn!("Token for {} belongs to {}", email, address);
                }
                debug!("Verified client for {} ({})", email, token_prefix(&access_token));
                (state, Ok(client))
            }
            // Local budget exhausted; says nothing about the credential
            Err(e @ TriageError::RateLimited { .. }) => (state, Err(e)),
            Err(e) => {
                warn!("Token verification failed for {}: {}", email, e);
                state.error = Some(REFRESH_ERROR.to_string());
                let error = match e {
                    TriageError::Forbidden(msg) => TriageError::Forbidden(msg),
                    other => TriageError::Unauthenticated(format!(
                        "Token verification failed for {}: {}",
                        email, other
                    )),
                };
                (state, Err(error))
            }
        }
    }

    /// Verified client for a mailbox with stored credentials
    pub async fn authenticate_mailbox(&self, email: &str) -> Result<Arc<dyn GmailClient>> {
        let record = self.credentials.get(email).await?.ok_or_else(|| {
            TriageError::Unauthenticated(format!("No stored credentials for {}", email))
        })?;
        let (_, client) = self
            .ensure_valid_client(email, TokenState::from_record(&record))
            .await;
        client
    }

    /// Complete the sign-in redirect: exchange the code, identify the mailbox,
    /// and save its first credential record. Returns the mailbox address.
    pub async fn complete_sign_in(&self, code: &str) -> Result<String> {
        let now = Utc::now();
        let grant = self.provider.exchange_code(code).await?;
        let refresh_token = grant.refresh_token.clone().unwrap_or_default();
        if refresh_token.is_empty() {
            // Without offline access the mailbox cannot be processed later
            return Err(TriageError::Unauthenticated(
                "Provider did not issue a refresh token".to_string(),
            ));
        }

        let state = TokenState {
            refresh_token,
            ..Default::default()
        }
        .apply_grant(grant, now);
        let access_token = state.access_token.clone().unwrap_or_default();

        // The address is unknown until the profile answers, so there is no
        // mailbox budget to charge yet
        let email = self
            .factory
            .connect_unmetered(&access_token)
            .get_profile()
            .await?;

        if let Some(record) = state.to_record(&email) {
            self.credentials.save(&email, &record).await?;
        }
        info!("Stored credentials for {}", email);
        Ok(email)
    }
}
