//! Gmail API client adapter
//!
//! A thin typed façade over the REST surface the triage pipeline uses:
//! profile, threads, messages, and labels. Every call made on behalf of a
//! mailbox goes through [`RateLimitedGmailClient`], which charges the
//! per-mailbox budget before the request leaves the process.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::RETRY_AFTER;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{parse_retry_after, Result, TriageError};
use crate::models::{EmailLabel, EmailMessage};
use crate::rate_limiter::RateLimiter;

pub const DEFAULT_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1/users/me";

/// Bodies longer than this are replaced with the snippet
pub const DEFAULT_BODY_MAX_CHARS: usize = 10_000;

static URL_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"https?://[^\s]+").expect("URL pattern is valid"));

/// Label info returned from Gmail API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelInfo {
    pub id: String,
    pub name: String,
}

/// One page of a thread or message listing
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub ids: Vec<String>,
    pub next_page_token: Option<String>,
}

/// Trait defining Gmail client operations for easier testing
#[async_trait]
pub trait GmailClient: Send + Sync {
    /// Email address of the authenticated mailbox
    async fn get_profile(&self) -> Result<String>;

    /// List thread IDs matching a query, one page at a time
    async fn list_threads(
        &self,
        query: &str,
        max_results: u32,
        page_token: Option<String>,
    ) -> Result<Page>;

    /// Get every message of a thread, oldest first.
    ///
    /// Unreadable older messages are dropped, but an unreadable newest
    /// message fails the whole thread.
    async fn get_thread(&self, id: &str) -> Result<Vec<EmailMessage>>;

    /// List message IDs matching a query, one page at a time
    async fn list_messages(
        &self,
        query: &str,
        max_results: u32,
        page_token: Option<String>,
    ) -> Result<Page>;

    /// Get a single message with its full payload
    async fn get_message(&self, id: &str) -> Result<EmailMessage>;

    /// List all labels in the account
    async fn list_labels(&self) -> Result<Vec<LabelInfo>>;

    /// Create a new label, returning its ID
    async fn create_label(&self, name: &str) -> Result<String>;

    /// Add and remove labels on one message
    async fn modify_message(
        &self,
        message_id: &str,
        add_label_ids: &[String],
        remove_label_ids: &[String],
    ) -> Result<()>;
}

/// Builds an authenticated client for a mailbox from a valid access token
pub trait ClientFactory: Send + Sync {
    fn connect(&self, mailbox: &str, access_token: &str) -> Arc<dyn GmailClient>;

    /// Client for a token whose mailbox is not known yet. Not charged to any budget.
    fn connect_unmetered(&self, access_token: &str) -> Arc<dyn GmailClient>;
}

// Wire shapes of the Gmail REST API

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiProfile {
    email_address: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiRef {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiThreadList {
    threads: Option<Vec<ApiRef>>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiMessageList {
    messages: Option<Vec<ApiRef>>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiThread {
    messages: Option<Vec<ApiMessage>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ApiMessage {
    id: Option<String>,
    thread_id: Option<String>,
    label_ids: Option<Vec<String>>,
    snippet: Option<String>,
    payload: Option<ApiPart>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiPart {
    mime_type: Option<String>,
    headers: Option<Vec<ApiHeader>>,
    body: Option<ApiBody>,
    parts: Option<Vec<ApiPart>>,
}

#[derive(Debug, Deserialize)]
struct ApiHeader {
    name: String,
    value: String,
}

#[derive(Debug, Default, Deserialize)]
struct ApiBody {
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiLabelList {
    labels: Option<Vec<LabelInfo>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateLabelRequest<'a> {
    name: &'a str,
    label_list_visibility: &'a str,
    message_list_visibility: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ModifyMessageRequest<'a> {
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    add_label_ids: &'a [String],
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    remove_label_ids: &'a [String],
}

/// Gmail REST client authenticated with a bearer access token
pub struct RestGmailClient {
    http: reqwest::Client,
    base_url: String,
    access_token: String,
    body_max_chars: usize,
}

impl RestGmailClient {
    pub fn new(http: reqwest::Client, base_url: &str, access_token: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            access_token: access_token.to_string(),
            body_max_chars: DEFAULT_BODY_MAX_CHARS,
        }
    }

    pub fn with_body_max_chars(mut self, body_max_chars: usize) -> Self {
        self.body_max_chars = body_max_chars;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    /// Send a request and decode the JSON response, classifying failures
    async fn send<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> Result<T> {
        let response = request
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(|e| TriageError::NetworkError(format!("Connection error: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            let body = response.text().await.unwrap_or_default();
            let error = TriageError::from_status(status.as_u16(), &body, retry_after);
            warn!("Gmail API call failed: {}", error);
            return Err(error);
        }

        response
            .json::<T>()
            .await
            .map_err(|e| TriageError::InvalidMessageFormat(format!("Unexpected response: {}", e)))
    }

    fn list_request(
        &self,
        path: &str,
        query: &str,
        max_results: u32,
        page_token: Option<String>,
    ) -> reqwest::RequestBuilder {
        let mut params = vec![
            ("q", query.to_string()),
            ("maxResults", max_results.to_string()),
        ];
        if let Some(token) = page_token {
            params.push(("pageToken", token));
        }
        self.http.get(self.url(path)).query(&params)
    }
}

#[async_trait]
impl GmailClient for RestGmailClient {
    async fn get_profile(&self) -> Result<String> {
        let profile: ApiProfile = self.send(self.http.get(self.url("profile"))).await?;
        Ok(profile.email_address)
    }

    async fn list_threads(
        &self,
        query: &str,
        max_results: u32,
        page_token: Option<String>,
    ) -> Result<Page> {
        let request = self.list_request("threads", query, max_results, page_token);
        let list: ApiThreadList = self.send(request).await?;
        let ids: Vec<String> = list.threads.unwrap_or_default().into_iter().map(|t| t.id).collect();
        debug!("Listed {} threads for query '{}'", ids.len(), query);
        Ok(Page {
            ids,
            next_page_token: list.next_page_token,
        })
    }

    async fn get_thread(&self, id: &str) -> Result<Vec<EmailMessage>> {
        let request = self
            .http
            .get(self.url(&format!("threads/{}", id)))
            .query(&[("format", "full")]);
        let thread: ApiThread = self.send(request).await?;

        let raw = thread.messages.unwrap_or_default();
        let newest = raw.len().saturating_sub(1);
        let mut messages = Vec::with_capacity(raw.len());
        for (index, msg) in raw.into_iter().enumerate() {
            match parse_message(msg, self.body_max_chars) {
                Ok(parsed) => messages.push(parsed),
                // An older message must not stand in for the newest
                Err(e) if index == newest => {
                    return Err(TriageError::InvalidMessageFormat(format!(
                        "Newest message in thread {} is unreadable: {}",
                        id, e
                    )));
                }
                Err(e) => warn!("Skipping unreadable message in thread {}: {}", id, e),
            }
        }
        Ok(messages)
    }

    async fn list_messages(
        &self,
        query: &str,
        max_results: u32,
        page_token: Option<String>,
    ) -> Result<Page> {
        let request = self.list_request("messages", query, max_results, page_token);
        let list: ApiMessageList = self.send(request).await?;
        Ok(Page {
            ids: list.messages.unwrap_or_default().into_iter().map(|m| m.id).collect(),
            next_page_token: list.next_page_token,
        })
    }

    async fn get_message(&self, id: &str) -> Result<EmailMessage> {
        let request = self
            .http
            .get(self.url(&format!("messages/{}", id)))
            .query(&[("format", "full")]);
        let message: ApiMessage = self.send(request).await?;
        parse_message(message, self.body_max_chars)
    }

    async fn list_labels(&self) -> Result<Vec<LabelInfo>> {
        let list: ApiLabelList = self.send(self.http.get(self.url("labels"))).await?;
        Ok(list.labels.unwrap_or_default())
    }

    async fn create_label(&self, name: &str) -> Result<String> {
        let body = CreateLabelRequest {
            name,
            label_list_visibility: "labelShow",
            message_list_visibility: "show",
        };
        let label: LabelInfo = self
            .send(self.http.post(self.url("labels")).json(&body))
            .await?;
        debug!("Created label '{}' with ID {}", label.name, label.id);
        Ok(label.id)
    }

    async fn modify_message(
        &self,
        message_id: &str,
        add_label_ids: &[String],
        remove_label_ids: &[String],
    ) -> Result<()> {
        let body = ModifyMessageRequest {
            add_label_ids,
            remove_label_ids,
        };
        let request = self
            .http
            .post(self.url(&format!("messages/{}/modify", message_id)))
            .json(&body);
        let _: serde_json::Value = self.send(request).await?;
        Ok(())
    }
}

/// Client wrapper that charges the mailbox's call budget before every call
pub struct RateLimitedGmailClient<C> {
    inner: C,
    mailbox: String,
    limiter: RateLimiter,
}

impl<C: GmailClient> RateLimitedGmailClient<C> {
    pub fn new(inner: C, mailbox: &str, limiter: RateLimiter) -> Self {
        Self {
            inner,
            mailbox: mailbox.to_string(),
            limiter,
        }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    async fn permit(&self) -> Result<()> {
        self.limiter.acquire(&self.mailbox).await
    }
}

#[async_trait]
impl<C: GmailClient> GmailClient for RateLimitedGmailClient<C> {
    async fn get_profile(&self) -> Result<String> {
        self.permit().await?;
        self.inner.get_profile().await
    }

    async fn list_threads(
        &self,
        query: &str,
        max_results: u32,
        page_token: Option<String>,
    ) -> Result<Page> {
        self.permit().await?;
        self.inner.list_threads(query, max_results, page_token).await
    }

    async fn get_thread(&self, id: &str) -> Result<Vec<EmailMessage>> {
        self.permit().await?;
        self.inner.get_thread(id).await
    }

    async fn list_messages(
        &self,
        query: &str,
        max_results: u32,
        page_token: Option<String>,
    ) -> Result<Page> {
        self.permit().await?;
        self.inner.list_messages(query, max_results, page_token).await
    }

    async fn get_message(&self, id: &str) -> Result<EmailMessage> {
        self.permit().await?;
        self.inner.get_message(id).await
    }

    async fn list_labels(&self) -> Result<Vec<LabelInfo>> {
        self.permit().await?;
        self.inner.list_labels().await
    }

    async fn create_label(&self, name: &str) -> Result<String> {
        self.permit().await?;
        self.inner.create_label(name).await
    }

    async fn modify_message(
        &self,
        message_id: &str,
        add_label_ids: &[String],
        remove_label_ids: &[String],
    ) -> Result<()> {
        self.permit().await?;
        self.inner
            .modify_message(message_id, add_label_ids, remove_label_ids)
            .await
    }
}

// Implement GmailClient for Arc<T> to allow shared ownership
#[async_trait]
impl<T: GmailClient + ?Sized> GmailClient for Arc<T> {
    async fn get_profile(&self) -> Result<String> {
        self.as_ref().get_profile().await
    }

    async fn list_threads(
        &self,
        query: &str,
        max_results: u32,
        page_token: Option<String>,
    ) -> Result<Page> {
        self.as_ref().list_threads(query, max_results, page_token).await
    }

    async fn get_thread(&self, id: &str) -> Result<Vec<EmailMessage>> {
        self.as_ref().get_thread(id).await
    }

    async fn list_messages(
        &self,
        query: &str,
        max_results: u32,
        page_token: Option<String>,
    ) -> Result<Page> {
        self.as_ref().list_messages(query, max_results, page_token).await
    }

    async fn get_message(&self, id: &str) -> Result<EmailMessage> {
        self.as_ref().get_message(id).await
    }

    async fn list_labels(&self) -> Result<Vec<LabelInfo>> {
        self.as_ref().list_labels().await
    }

    async fn create_label(&self, name: &str) -> Result<String> {
        self.as_ref().create_label(name).await
    }

    async fn modify_message(
        &self,
        message_id: &str,
        add_label_ids: &[String],
        remove_label_ids: &[String],
    ) -> Result<()> {
        self.as_ref()
            .modify_message(message_id, add_label_ids, remove_label_ids)
            .await
    }
}

/// Production factory: REST client behind the per-mailbox rate limiter
#[derive(Clone)]
pub struct RestClientFactory {
    http: reqwest::Client,
    base_url: String,
    body_max_chars: usize,
    limiter: RateLimiter,
}

impl RestClientFactory {
    pub fn new(base_url: &str, timeout: Duration, limiter: RateLimiter) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TriageError::ConfigError(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            base_url: base_url.to_string(),
            body_max_chars: DEFAULT_BODY_MAX_CHARS,
            limiter,
        })
    }

    pub fn with_body_max_chars(mut self, body_max_chars: usize) -> Self {
        self.body_max_chars = body_max_chars;
        self
    }
}

impl ClientFactory for RestClientFactory {
    fn connect(&self, mailbox: &str, access_token: &str) -> Arc<dyn GmailClient> {
        let rest = RestGmailClient::new(self.http.clone(), &self.base_url, access_token)
            .with_body_max_chars(self.body_max_chars);
        Arc::new(RateLimitedGmailClient::new(rest, mailbox, self.limiter.clone()))
    }

    fn connect_unmetered(&self, access_token: &str) -> Arc<dyn GmailClient> {
        Arc::new(
            RestGmailClient::new(self.http.clone(), &self.base_url, access_token)
                .with_body_max_chars(self.body_max_chars),
        )
    }
}

/// Convert base64url to standard base64: `-`→`+`, `_`→`/`, padded to a multiple of 4
pub fn normalize_base64url(data: &str) -> String {
    let mut normalized: String = data
        .trim()
        .chars()
        .map(|c| match c {
            '-' => '+',
            '_' => '/',
            other => other,
        })
        .collect();
    let remainder = normalized.len() % 4;
    if remainder != 0 {
        normalized.extend(std::iter::repeat('=').take(4 - remainder));
    }
    normalized
}

pub fn decode_base64url(data: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(normalize_base64url(data))
        .map_err(|e| TriageError::InvalidMessageFormat(format!("Invalid body encoding: {}", e)))
}

/// Replace literal URLs so tracking links never reach the classifier
pub fn strip_urls(text: &str) -> String {
    URL_PATTERN.replace_all(text, "URL OMITTED").into_owned()
}

/// Decode a base64url body part into URL-stripped UTF-8 text
pub fn decode_body_text(data: &str) -> Result<String> {
    let bytes = decode_base64url(data)?;
    Ok(strip_urls(&String::from_utf8_lossy(&bytes)))
}

/// Depth-first search for the first text/plain part carrying data
fn find_plain_text(part: &ApiPart) -> Option<&str> {
    if part.mime_type.as_deref() == Some("text/plain") {
        if let Some(data) = part.body.as_ref().and_then(|b| b.data.as_deref()) {
            return Some(data);
        }
    }
    part.parts
        .as_deref()
        .unwrap_or_default()
        .iter()
        .find_map(find_plain_text)
}

fn header_value(headers: &[ApiHeader], name: &str) -> Option<String> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.clone())
}

/// Parse a Gmail API message into the normalized representation.
///
/// Label names are left equal to their IDs; the label manager resolves them.
pub(crate) fn parse_message(msg: ApiMessage, body_max_chars: usize) -> Result<EmailMessage> {
    let id = msg
        .id
        .ok_or_else(|| TriageError::InvalidMessageFormat("Missing message ID".to_string()))?;

    let payload = msg
        .payload
        .ok_or_else(|| TriageError::InvalidMessageFormat(format!("Message {} has no payload", id)))?;

    let headers = payload.headers.as_deref().unwrap_or_default();
    if headers.is_empty() {
        return Err(TriageError::InvalidMessageFormat(format!(
            "Message {} has no headers",
            id
        )));
    }

    let snippet = msg.snippet.unwrap_or_default();

    let body_text = match find_plain_text(&payload) {
        Some(data) => match decode_body_text(data) {
            Ok(text) => text,
            Err(e) => {
                warn!("Could not decode body of {}: {}", id, e);
                String::new()
            }
        },
        None => String::new(),
    };

    let body_text = if body_text.chars().count() > body_max_chars {
        format!("{}...", snippet)
    } else {
        body_text
    };

    let labels = msg
        .label_ids
        .unwrap_or_default()
        .into_iter()
        .map(|label_id| EmailLabel {
            name: label_id.clone(),
            id: label_id,
        })
        .collect();

    Ok(EmailMessage {
        thread_id: msg.thread_id.unwrap_or_default(),
        from: header_value(headers, "From").unwrap_or_default(),
        to: header_value(headers, "To").unwrap_or_default(),
        subject: header_value(headers, "Subject").unwrap_or_else(|| "No Subject".to_string()),
        date: header_value(headers, "Date").unwrap_or_default(),
        snippet,
        body_text,
        labels,
        id,
    })
}
