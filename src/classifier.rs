//! Language-model email classification
//!
//! The classifier sends a "From/To/Subject/Body" block to a chat completion
//! endpoint with a strict JSON schema and parses the reply into a
//! [`Classification`]. Replies that do not match the schema count as "no
//! classification" rather than as errors. Results are cached per message id
//! without expiry.

use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::{
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs, ResponseFormat, ResponseFormatJsonSchema,
};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::error::{Result, TriageError};
use crate::models::{Classification, EmailMessage, TriageAction};
use crate::store::KvStore;

pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_MAX_INPUT_CHARS: usize = 5000;
pub const SCHEMA_NAME: &str = "email_category";

const SYSTEM_PROMPT: &str = "You are an assistant that triages a person's inbox.";

const USER_PROMPT: &str = "\
Categorize the email below and answer in JSON.

Flags (an email may match several):
- is_cold_inbound: sent by someone the owner does not know, for example job seekers or vendors selling services
- is_recruiting: about recruiting, from a recruiter or a candidate
- is_internal: from someone the owner knows who is not a recruiter
- is_updates: an automated update or notification from a vendor or service
- is_promotional: a vendor promoting a product or service

action must be one of \"to read\", \"to reply\" or \"to archive\".
explanation is one short sentence.

<owner_email>
{owner}
</owner_email>

<email>
{email}
</email>";

/// JSON schema sent with every request; kept in sync with [`Classification`]
pub static CLASSIFICATION_SCHEMA: Lazy<Value> = Lazy::new(|| {
    let actions: Vec<&str> = TriageAction::ALL.iter().map(|a| a.as_str()).collect();
    json!({
        "type": "object",
        "properties": {
            "explanation": { "type": "string" },
            "is_cold_inbound": { "type": "boolean" },
            "is_recruiting": { "type": "boolean" },
            "is_internal": { "type": "boolean" },
            "is_updates": { "type": "boolean" },
            "is_promotional": { "type": "boolean" },
            "action": { "type": "string", "enum": actions }
        },
        "required": [
            "explanation", "is_cold_inbound", "is_recruiting", "is_internal",
            "is_updates", "is_promotional", "action"
        ],
        "additionalProperties": false
    })
});

/// Per-token prices in USD
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl Default for Pricing {
    fn default() -> Self {
        Self {
            input_per_million: 0.15,
            output_per_million: 0.60,
        }
    }
}

impl Pricing {
    pub fn cost(&self, input_tokens: u32, output_tokens: u32) -> f64 {
        (f64::from(input_tokens) * self.input_per_million
            + f64::from(output_tokens) * self.output_per_million)
            / 1_000_000.0
    }
}

/// Running total of classifier spend, shared by clones
#[derive(Debug, Clone, Default)]
pub struct CostTracker {
    total: Arc<Mutex<f64>>,
}

impl CostTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, amount: f64) {
        if let Ok(mut total) = self.total.lock() {
            *total += amount;
        }
    }

    pub fn total(&self) -> f64 {
        self.total.lock().map(|t| *t).unwrap_or(0.0)
    }
}

/// Raw completion returned by the model provider
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    pub content: Option<String>,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// Chat completion with a structured-output schema
#[async_trait]
pub trait ChatCompletion: Send + Sync {
    async fn complete(&self, system: &str, user: &str, schema: &Value) -> Result<Completion>;
}

/// OpenAI chat completions through `async-openai`
pub struct OpenAiCompletion {
    client: async_openai::Client<OpenAIConfig>,
    model: String,
}

impl OpenAiCompletion {
    pub fn new(api_key: &str, model: &str) -> Self {
        Self::with_config(OpenAIConfig::new().with_api_key(api_key), model)
    }

    pub fn with_config(config: OpenAIConfig, model: &str) -> Self {
        Self {
            client: async_openai::Client::with_config(config),
            model: model.to_string(),
        }
    }
}

fn map_openai_error(error: OpenAIError) -> TriageError {
    match error {
        OpenAIError::ApiError(api) => {
            let kind = api.r#type.clone().unwrap_or_default();
            if kind.contains("rate_limit") || api.message.to_lowercase().contains("rate limit") {
                TriageError::RateLimited { retry_after: 20 }
            } else {
                TriageError::Transient {
                    status: 502,
                    message: format!("Classifier API error: {}", api.message),
                }
            }
        }
        OpenAIError::Reqwest(e) => TriageError::NetworkError(format!("Classifier unreachable: {}", e)),
        OpenAIError::InvalidArgument(msg) => TriageError::ConfigError(msg),
        other => TriageError::Transient {
            status: 502,
            message: format!("Classifier error: {}", other),
        },
    }
}

#[async_trait]
impl ChatCompletion for OpenAiCompletion {
    async fn complete(&self, system: &str, user: &str, schema: &Value) -> Result<Completion> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages([
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(system)
                    .build()
                    .map_err(map_openai_error)?
                    .into(),
                ChatCompletionRequestUserMessageArgs::default()
                    .content(user)
                    .build()
                    .map_err(map_openai_error)?
                    .into(),
            ])
            .response_format(ResponseFormat::JsonSchema {
                json_schema: ResponseFormatJsonSchema {
                    description: Some("Email triage categories".to_string()),
                    name: SCHEMA_NAME.to_string(),
                    schema: Some(schema.clone()),
                    strict: Some(true),
                },
            })
            .build()
            .map_err(map_openai_error)?;

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(map_openai_error)?;

        let (prompt_tokens, completion_tokens) = response
            .usage
            .as_ref()
            .map(|u| (u.prompt_tokens, u.completion_tokens))
            .unwrap_or((0, 0));

        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content);

        Ok(Completion {
            content,
            prompt_tokens,
            completion_tokens,
        })
    }
}

/// Classifies one formatted email on behalf of a mailbox owner
#[async_trait]
pub trait Classifier: Send + Sync {
    /// `Ok(None)` when the model produced nothing that fits the schema
    async fn classify(
        &self,
        formatted_email: &str,
        owner: &str,
        cost: &CostTracker,
    ) -> Result<Option<Classification>>;
}

pub struct LlmClassifier {
    completion: Arc<dyn ChatCompletion>,
    max_input_chars: usize,
    pricing: Pricing,
}

impl LlmClassifier {
    pub fn new(completion: Arc<dyn ChatCompletion>) -> Self {
        Self {
            completion,
            max_input_chars: DEFAULT_MAX_INPUT_CHARS,
            pricing: Pricing::default(),
        }
    }

    pub fn with_max_input_chars(mut self, max_input_chars: usize) -> Self {
        self.max_input_chars = max_input_chars;
        self
    }

    pub fn with_pricing(mut self, pricing: Pricing) -> Self {
        self.pricing = pricing;
        self
    }

    fn prompt(&self, formatted_email: &str, owner: &str) -> String {
        let truncated: String = formatted_email.chars().take(self.max_input_chars).collect();
        USER_PROMPT
            .replace("{owner}", owner)
            .replace("{email}", &truncated)
    }
}

#[async_trait]
impl Classifier for LlmClassifier {
    async fn classify(
        &self,
        formatted_email: &str,
        owner: &str,
        cost: &CostTracker,
    ) -> Result<Option<Classification>> {
        let prompt = self.prompt(formatted_email, owner);
        let completion = self
            .completion
            .complete(SYSTEM_PROMPT, &prompt, &CLASSIFICATION_SCHEMA)
            .await?;

        let spent = self
            .pricing
            .cost(completion.prompt_tokens, completion.completion_tokens);
        cost.add(spent);
        debug!(
            "Classifier used {} input / {} output tokens (${:.6})",
            completion.prompt_tokens, completion.completion_tokens, spent
        );

        let Some(content) = completion.content else {
            warn!("Classifier returned no content");
            return Ok(None);
        };

        match serde_json::from_str::<Classification>(&content) {
            Ok(classification) => Ok(Some(classification)),
            Err(e) => {
                warn!("Classifier reply does not match schema: {}", e);
                Ok(None)
            }
        }
    }
}

/// Permanent per-message classification cache
#[derive(Clone)]
pub struct ClassificationCache {
    store: Arc<dyn KvStore>,
}

impl ClassificationCache {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    pub fn key(message_id: &str) -> String {
        format!("email-categorization:{}", message_id)
    }

    /// A cached value that no longer validates is reported as a miss
    pub async fn get(&self, message_id: &str) -> Result<Option<Classification>> {
        let Some(raw) = self.store.get(&Self::key(message_id)).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(classification) => Ok(Some(classification)),
            Err(e) => {
                debug!("Stale classification for {} ignored: {}", message_id, e);
                Ok(None)
            }
        }
    }

    pub async fn put(&self, message_id: &str, classification: &Classification) -> Result<()> {
        self.store
            .set(&Self::key(message_id), &serde_json::to_string(classification)?)
            .await
    }
}

/// Classify a message, consulting and filling the cache
pub async fn classify_email(
    cache: &ClassificationCache,
    classifier: &dyn Classifier,
    email: &EmailMessage,
    owner: &str,
    cost: &CostTracker,
) -> Result<Option<Classification>> {
    if let Some(cached) = cache.get(&email.id).await? {
        debug!("Classification cache hit for {}", email.id);
        return Ok(Some(cached));
    }

    let result = classifier
        .classify(&email.format_for_classification(), owner, cost)
        .await?;

    if let Some(classification) = &result {
        cache.put(&email.id, classification).await?;
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedCompletion {
        reply: Option<String>,
        calls: AtomicUsize,
        last_prompt: Mutex<String>,
    }

    impl ScriptedCompletion {
        fn replying(reply: Option<&str>) -> Arc<Self> {
            Arc::new(Self {
                reply: reply.map(str::to_string),
                calls: AtomicUsize::new(0),
                last_prompt: Mutex::new(String::new()),
            })
        }
    }

    #[async_trait]
    impl ChatCompletion for ScriptedCompletion {
        async fn complete(&self, _system: &str, user: &str, schema: &Value) -> Result<Completion> {
            assert_eq!(schema["additionalProperties"], false);
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_prompt.lock().unwrap() = user.to_string();
            Ok(Completion {
                content: self.reply.clone(),
                prompt_tokens: 1_000,
                completion_tokens: 100,
            })
        }
    }

    const ARCHIVE_REPLY: &str = r#"{"explanation":"Automated receipt","is_cold_inbound":false,
        "is_recruiting":false,"is_internal":false,"is_updates":true,"is_promotional":false,
        "action":"to archive"}"#;

    fn email(id: &str) -> EmailMessage {
        EmailMessage {
            id: id.to_string(),
            thread_id: "t1".to_string(),
            from: "billing@vendor.example".to_string(),
            to: "me@example.com".to_string(),
            subject: "Your receipt".to_string(),
            date: String::new(),
            snippet: String::new(),
            body_text: "Thanks for your purchase".to_string(),
            labels: vec![],
        }
    }

    #[tokio::test]
    async fn test_classify_parses_reply_and_tracks_cost() {
        let completion = ScriptedCompletion::replying(Some(ARCHIVE_REPLY));
        let classifier = LlmClassifier::new(completion.clone());
        let cost = CostTracker::new();

        let result = classifier
            .classify("From: a\nTo: b\nSubject: c\nBody: d", "me@example.com", &cost)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(result.action, TriageAction::ToArchive);
        assert!(result.is_updates);
        // 1000 * 0.15/M + 100 * 0.60/M
        assert!((cost.total() - 0.000_21).abs() < 1e-12);
        assert!(completion.last_prompt.lock().unwrap().contains("me@example.com"));
    }

    #[tokio::test]
    async fn test_input_is_truncated() {
        let completion = ScriptedCompletion::replying(Some(ARCHIVE_REPLY));
        let classifier = LlmClassifier::new(completion.clone()).with_max_input_chars(10);
        let long = format!("0123456789{}", "§".repeat(500));

        classifier
            .classify(&long, "me@example.com", &CostTracker::new())
            .await
            .unwrap();

        let prompt = completion.last_prompt.lock().unwrap().clone();
        assert!(prompt.contains("0123456789\n</email>"));
        assert!(!prompt.contains('§'));
    }

    #[tokio::test]
    async fn test_schema_mismatch_is_none() {
        let reply = r#"{"explanation":"x","is_cold_inbound":false}"#;
        let classifier = LlmClassifier::new(ScriptedCompletion::replying(Some(reply)));
        let cost = CostTracker::new();
        let result = classifier.classify("body", "me@example.com", &cost).await.unwrap();
        assert!(result.is_none());
        // Usage is still billed
        assert!(cost.total() > 0.0);

        let classifier = LlmClassifier::new(ScriptedCompletion::replying(None));
        assert!(classifier
            .classify("body", "me@example.com", &cost)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_cache_hit_skips_classifier() {
        let completion = ScriptedCompletion::replying(Some(ARCHIVE_REPLY));
        let classifier = LlmClassifier::new(completion.clone());
        let cache = ClassificationCache::new(Arc::new(MemoryStore::new()));
        let cost = CostTracker::new();

        let first = classify_email(&cache, &classifier, &email("m1"), "me@example.com", &cost)
            .await
            .unwrap();
        let second = classify_email(&cache, &classifier, &email("m1"), "me@example.com", &cost)
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(completion.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stale_cache_entry_is_recomputed() {
        let store = MemoryStore::new();
        let cache = ClassificationCache::new(Arc::new(store.clone()));
        // Written before the action field existed
        store
            .set(
                &ClassificationCache::key("m1"),
                r#"{"explanation":"x","is_cold_inbound":false,"is_recruiting":false,
                    "is_internal":true,"is_updates":false,"is_promotional":false}"#,
            )
            .await
            .unwrap();

        let completion = ScriptedCompletion::replying(Some(ARCHIVE_REPLY));
        let classifier = LlmClassifier::new(completion.clone());
        let result = classify_email(&cache, &classifier, &email("m1"), "me@example.com", &CostTracker::new())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(result.action, TriageAction::ToArchive);
        assert_eq!(completion.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.get("m1").await.unwrap(), Some(result));
        assert_eq!(store.ttl(&ClassificationCache::key("m1")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_none_is_not_cached() {
        let cache = ClassificationCache::new(Arc::new(MemoryStore::new()));
        let classifier = LlmClassifier::new(ScriptedCompletion::replying(Some("not json")));
        let result = classify_email(&cache, &classifier, &email("m2"), "me@example.com", &CostTracker::new())
            .await
            .unwrap();
        assert!(result.is_none());
        assert!(cache.get("m2").await.unwrap().is_none());
    }

    #[test]
    fn test_schema_lists_every_action() {
        let actions = CLASSIFICATION_SCHEMA["properties"]["action"]["enum"]
            .as_array()
            .unwrap();
        assert_eq!(actions.len(), 3);
        assert!(actions.contains(&json!("to reply")));
    }
}
