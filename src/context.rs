//! Service wiring from configuration
//!
//! Every handle (store, OAuth client, Gmail factory, classifier) is built
//! once here and passed down explicitly.

use async_openai::config::OpenAIConfig;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::auth::{GoogleOAuthClient, TokenRefreshCoordinator};
use crate::classifier::{LlmClassifier, OpenAiCompletion, Pricing};
use crate::client::RestClientFactory;
use crate::config::Config;
use crate::credentials::CredentialStore;
use crate::crypto::TokenCipher;
use crate::error::Result;
use crate::pipeline::{Pipeline, PipelineSettings};
use crate::rate_limiter::RateLimiter;
use crate::store::{KvStore, MemoryStore, RedisStore};

pub struct AppContext {
    pub config: Config,
    pub store: Arc<dyn KvStore>,
    pub credentials: CredentialStore,
    pub oauth: Arc<GoogleOAuthClient>,
    pub auth: TokenRefreshCoordinator,
    pub pipeline: Arc<Pipeline>,
}

impl AppContext {
    /// Open the configured store; without `REDIS_URL` state lives in memory
    pub fn open_store(config: &Config) -> Result<Arc<dyn KvStore>> {
        match config.store.redis_url.as_deref() {
            Some(url) => {
                info!("Using Redis store");
                Ok(Arc::new(RedisStore::open(url)?))
            }
            None => {
                warn!("REDIS_URL not set, using in-memory store; state is lost on exit");
                Ok(Arc::new(MemoryStore::new()))
            }
        }
    }

    /// Credential store only, for commands that never call a provider
    pub fn credential_store(config: &Config, store: Arc<dyn KvStore>) -> Result<CredentialStore> {
        Config::require(&config.store.encryption_key, "ENCRYPTION_KEY")?;
        let cipher = TokenCipher::from_secret(&config.store.encryption_key)?;
        Ok(CredentialStore::with_ttl(store, cipher, config.store.credential_ttl()))
    }

    pub fn from_config(config: Config) -> Result<Self> {
        let store = Self::open_store(&config)?;
        Self::with_store(config, store)
    }

    pub fn with_store(config: Config, store: Arc<dyn KvStore>) -> Result<Self> {
        Config::require(&config.oauth.client_id, "GOOGLE_CLIENT_ID")?;
        Config::require(&config.oauth.client_secret, "GOOGLE_CLIENT_SECRET")?;
        Config::require(&config.classifier.api_key, "OPENAI_API_KEY")?;

        let credentials = Self::credential_store(&config, store.clone())?;
        let timeout = Duration::from_secs(config.gmail.request_timeout_secs);

        let limiter = RateLimiter::with_config(
            store.clone(),
            Duration::from_secs(config.gmail.rate_limit_window_secs),
            config.gmail.rate_limit_max_calls,
        );
        let factory = RestClientFactory::new(&config.gmail.api_base, timeout, limiter)?
            .with_body_max_chars(config.gmail.body_max_chars);

        let oauth = Arc::new(
            GoogleOAuthClient::new(
                &config.oauth.client_id,
                &config.oauth.client_secret,
                &config.oauth.redirect_uri,
                timeout,
            )?
            .with_endpoints(&config.oauth.auth_uri, &config.oauth.token_uri),
        );

        let auth = TokenRefreshCoordinator::new(oauth.clone(), credentials.clone(), Arc::new(factory));

        let mut openai = OpenAIConfig::new().with_api_key(&config.classifier.api_key);
        if let Some(base) = &config.classifier.api_base {
            openai = openai.with_api_base(base);
        }
        let classifier = LlmClassifier::new(Arc::new(OpenAiCompletion::with_config(
            openai,
            &config.classifier.model,
        )))
        .with_max_input_chars(config.classifier.max_input_chars)
        .with_pricing(Pricing {
            input_per_million: config.classifier.input_price_per_million,
            output_per_million: config.classifier.output_price_per_million,
        });

        let pipeline = Arc::new(Pipeline::new(
            store.clone(),
            auth.clone(),
            Arc::new(classifier),
            PipelineSettings::from_config(&config),
        ));

        Ok(Self {
            config,
            store,
            credentials,
            oauth,
            auth,
            pipeline,
        })
    }
}
