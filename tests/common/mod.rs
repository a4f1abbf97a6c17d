// Common test utilities and fakes
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use inbox_triage::auth::{TokenGrant, TokenProvider, TokenRefreshCoordinator};
use inbox_triage::classifier::{Classifier, CostTracker};
use inbox_triage::client::{ClientFactory, GmailClient, LabelInfo, Page};
use inbox_triage::credentials::CredentialStore;
use inbox_triage::crypto::TokenCipher;
use inbox_triage::error::{Result, TriageError};
use inbox_triage::models::{Classification, CredentialRecord, EmailLabel, EmailMessage, TriageAction};
use inbox_triage::pipeline::{Pipeline, PipelineSettings};
use inbox_triage::store::{KvStore, MemoryStore};
use mockall::mock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const OWNER: &str = "owner@example.com";

/// Create a test message with the given raw label IDs
pub fn message(id: &str, thread_id: &str, label_ids: &[&str]) -> EmailMessage {
    EmailMessage {
        id: id.to_string(),
        thread_id: thread_id.to_string(),
        from: "Vendor <news@vendor.example>".to_string(),
        to: OWNER.to_string(),
        subject: format!("Subject of {}", id),
        date: "Mon, 1 Jan 2024 10:00:00 +0000".to_string(),
        snippet: "snippet".to_string(),
        body_text: "Weekly product digest".to_string(),
        labels: label_ids
            .iter()
            .map(|l| EmailLabel {
                id: l.to_string(),
                name: l.to_string(),
            })
            .collect(),
    }
}

pub fn classification(action: TriageAction) -> Classification {
    Classification {
        explanation: format!("Looks like {}", action.as_str()),
        is_cold_inbound: false,
        is_recruiting: false,
        is_internal: false,
        is_updates: action == TriageAction::ToArchive,
        is_promotional: action == TriageAction::ToArchive,
        action,
    }
}

pub fn archive_classification() -> Classification {
    classification(TriageAction::ToArchive)
}

/// Credential record whose access token expires `expires_in_secs` from now
pub fn record(email: &str, access_token: &str, expires_in_secs: i64) -> CredentialRecord {
    CredentialRecord {
        email: email.to_string(),
        access_token: access_token.to_string(),
        refresh_token: "1//refresh".to_string(),
        expires_at: Some(Utc::now().timestamp() + expires_in_secs),
    }
}

pub fn credential_store(store: Arc<dyn KvStore>) -> CredentialStore {
    CredentialStore::new(store, TokenCipher::from_secret("test-secret").unwrap())
}

#[derive(Default)]
struct MailboxState {
    threads: Vec<(String, Vec<String>)>,
    messages: HashMap<String, EmailMessage>,
    labels: Vec<LabelInfo>,
    modifications: Vec<(String, Vec<String>, Vec<String>)>,
    profile_status: Option<u16>,
    modify_status: Option<u16>,
}

/// Stateful in-memory mailbox.
///
/// Threads are listed in insertion order; page tokens are offsets. Label
/// changes are applied to the stored messages so later fetches see them.
pub struct FakeGmail {
    email: String,
    state: Mutex<MailboxState>,
    thread_delay: Option<Duration>,
    pub profile_calls: AtomicUsize,
    pub list_calls: AtomicUsize,
    pub thread_calls: AtomicUsize,
    pub create_label_calls: AtomicUsize,
    pub modify_calls: AtomicUsize,
}

impl FakeGmail {
    pub fn new(email: &str) -> Self {
        Self {
            email: email.to_string(),
            state: Mutex::new(MailboxState::default()),
            thread_delay: None,
            profile_calls: AtomicUsize::new(0),
            list_calls: AtomicUsize::new(0),
            thread_calls: AtomicUsize::new(0),
            create_label_calls: AtomicUsize::new(0),
            modify_calls: AtomicUsize::new(0),
        }
    }

    /// Add a thread; messages are given oldest first
    pub fn with_thread(self, thread_id: &str, messages: Vec<EmailMessage>) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            let ids = messages.iter().map(|m| m.id.clone()).collect();
            for m in messages {
                state.messages.insert(m.id.clone(), m);
            }
            state.threads.push((thread_id.to_string(), ids));
        }
        self
    }

    /// Add `count` single-message threads named t1.. with messages m1..
    pub fn with_threads(mut self, count: usize) -> Self {
        for i in 1..=count {
            let thread = format!("t{}", i);
            let id = format!("m{}", i);
            self = self.with_thread(&thread, vec![message(&id, &thread, &["INBOX"])]);
        }
        self
    }

    pub fn with_label(self, id: &str, name: &str) -> Self {
        self.state.lock().unwrap().labels.push(LabelInfo {
            id: id.to_string(),
            name: name.to_string(),
        });
        self
    }

    /// Make profile fetches fail with the given HTTP status
    pub fn with_profile_status(self, status: u16) -> Self {
        self.state.lock().unwrap().profile_status = Some(status);
        self
    }

    /// Make label changes fail with the given HTTP status
    pub fn with_modify_status(self, status: u16) -> Self {
        self.state.lock().unwrap().modify_status = Some(status);
        self
    }

    pub fn with_thread_delay(mut self, delay: Duration) -> Self {
        self.thread_delay = Some(delay);
        self
    }

    pub fn label_id(&self, name: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .labels
            .iter()
            .find(|l| l.name == name)
            .map(|l| l.id.clone())
    }

    pub fn labels(&self) -> Vec<LabelInfo> {
        self.state.lock().unwrap().labels.clone()
    }

    pub fn modifications(&self) -> Vec<(String, Vec<String>, Vec<String>)> {
        self.state.lock().unwrap().modifications.clone()
    }

    pub fn message_label_ids(&self, id: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .messages
            .get(id)
            .map(|m| m.labels.iter().map(|l| l.id.clone()).collect())
            .unwrap_or_default()
    }

    pub fn modify_count(&self) -> usize {
        self.modify_calls.load(Ordering::SeqCst)
    }

    pub fn profile_count(&self) -> usize {
        self.profile_calls.load(Ordering::SeqCst)
    }

    fn error(status: u16) -> TriageError {
        TriageError::from_status(status, "injected failure", Some(30))
    }
}

#[async_trait]
impl GmailClient for FakeGmail {
    async fn get_profile(&self) -> Result<String> {
        self.profile_calls.fetch_add(1, Ordering::SeqCst);
        match self.state.lock().unwrap().profile_status {
            Some(status) => Err(Self::error(status)),
            None => Ok(self.email.clone()),
        }
    }

    async fn list_threads(
        &self,
        _query: &str,
        max_results: u32,
        page_token: Option<String>,
    ) -> Result<Page> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().unwrap();
        let start: usize = page_token.and_then(|t| t.parse().ok()).unwrap_or(0);
        let end = (start + max_results as usize).min(state.threads.len());
        Ok(Page {
            ids: state.threads[start..end].iter().map(|(id, _)| id.clone()).collect(),
            next_page_token: (end < state.threads.len()).then(|| end.to_string()),
        })
    }

    async fn get_thread(&self, id: &str) -> Result<Vec<EmailMessage>> {
        self.thread_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.thread_delay {
            tokio::time::sleep(delay).await;
        }
        let state = self.state.lock().unwrap();
        let (_, ids) = state
            .threads
            .iter()
            .find(|(thread_id, _)| thread_id == id)
            .ok_or_else(|| TriageError::NotFound(format!("thread {}", id)))?;
        Ok(ids
            .iter()
            .filter_map(|m| state.messages.get(m).cloned())
            .collect())
    }

    async fn list_messages(
        &self,
        _query: &str,
        _max_results: u32,
        _page_token: Option<String>,
    ) -> Result<Page> {
        let state = self.state.lock().unwrap();
        Ok(Page {
            ids: state.messages.keys().cloned().collect(),
            next_page_token: None,
        })
    }

    async fn get_message(&self, id: &str) -> Result<EmailMessage> {
        self.state
            .lock()
            .unwrap()
            .messages
            .get(id)
            .cloned()
            .ok_or_else(|| TriageError::NotFound(format!("message {}", id)))
    }

    async fn list_labels(&self) -> Result<Vec<LabelInfo>> {
        Ok(self.labels())
    }

    async fn create_label(&self, name: &str) -> Result<String> {
        let count = self.create_label_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("Label_{}", count);
        self.state.lock().unwrap().labels.push(LabelInfo {
            id: id.clone(),
            name: name.to_string(),
        });
        Ok(id)
    }

    async fn modify_message(
        &self,
        message_id: &str,
        add_label_ids: &[String],
        remove_label_ids: &[String],
    ) -> Result<()> {
        self.modify_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        if let Some(status) = state.modify_status {
            return Err(Self::error(status));
        }
        state.modifications.push((
            message_id.to_string(),
            add_label_ids.to_vec(),
            remove_label_ids.to_vec(),
        ));
        if let Some(message) = state.messages.get_mut(message_id) {
            message.labels.retain(|l| !remove_label_ids.contains(&l.id));
            for id in add_label_ids {
                message.labels.push(EmailLabel {
                    id: id.clone(),
                    name: id.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Hands out registered clients per mailbox and records every connect
#[derive(Default)]
pub struct FakeFactory {
    clients: Mutex<HashMap<String, Arc<dyn GmailClient>>>,
    sign_in: Mutex<Option<Arc<dyn GmailClient>>>,
    connections: Mutex<Vec<(String, String)>>,
}

impl FakeFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, mailbox: &str, client: Arc<dyn GmailClient>) {
        self.clients
            .lock()
            .unwrap()
            .insert(mailbox.to_string(), client);
    }

    /// Client answering the profile call of a sign-in
    pub fn register_sign_in(&self, client: Arc<dyn GmailClient>) {
        *self.sign_in.lock().unwrap() = Some(client);
    }

    /// (mailbox, access token) pairs in connect order; unmetered connects have
    /// an empty mailbox
    pub fn connections(&self) -> Vec<(String, String)> {
        self.connections.lock().unwrap().clone()
    }
}

impl ClientFactory for FakeFactory {
    fn connect(&self, mailbox: &str, access_token: &str) -> Arc<dyn GmailClient> {
        self.connections
            .lock()
            .unwrap()
            .push((mailbox.to_string(), access_token.to_string()));
        self.clients
            .lock()
            .unwrap()
            .get(mailbox)
            .cloned()
            .unwrap_or_else(|| Arc::new(FakeGmail::new(mailbox)))
    }

    fn connect_unmetered(&self, access_token: &str) -> Arc<dyn GmailClient> {
        self.connections
            .lock()
            .unwrap()
            .push((String::new(), access_token.to_string()));
        self.sign_in
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| Arc::new(FakeGmail::new("unknown@example.com")))
    }
}

/// Token endpoint that always issues `fresh-token`, or always refuses
pub struct FakeTokenProvider {
    fail: bool,
    pub refresh_calls: AtomicUsize,
}

impl FakeTokenProvider {
    pub fn new() -> Self {
        Self {
            fail: false,
            refresh_calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            refresh_calls: AtomicUsize::new(0),
        }
    }

    pub fn refresh_count(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    fn grant(&self) -> Result<TokenGrant> {
        if self.fail {
            return Err(TriageError::Unauthenticated("invalid_grant".to_string()));
        }
        Ok(TokenGrant {
            access_token: "fresh-token".to_string(),
            refresh_token: None,
            expires_in: Some(3600),
        })
    }
}

#[async_trait]
impl TokenProvider for FakeTokenProvider {
    async fn refresh(&self, _refresh_token: &str) -> Result<TokenGrant> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        self.grant()
    }

    async fn exchange_code(&self, _code: &str) -> Result<TokenGrant> {
        let mut grant = self.grant()?;
        grant.refresh_token = Some("1//issued".to_string());
        Ok(grant)
    }
}

/// Classifier returning a fixed answer
pub struct ScriptedClassifier {
    result: Option<Classification>,
    cost_per_call: f64,
    pub calls: AtomicUsize,
}

impl ScriptedClassifier {
    pub fn new(result: Option<Classification>) -> Self {
        Self {
            result,
            cost_per_call: 0.001,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Classifier for ScriptedClassifier {
    async fn classify(
        &self,
        _formatted_email: &str,
        _owner: &str,
        cost: &CostTracker,
    ) -> Result<Option<Classification>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        cost.add(self.cost_per_call);
        Ok(self.result.clone())
    }
}

mock! {
    pub GmailClient {}

    #[async_trait]
    impl GmailClient for GmailClient {
        async fn get_profile(&self) -> Result<String>;
        async fn list_threads(
            &self,
            query: &str,
            max_results: u32,
            page_token: Option<String>,
        ) -> Result<Page>;
        async fn get_thread(&self, id: &str) -> Result<Vec<EmailMessage>>;
        async fn list_messages(
            &self,
            query: &str,
            max_results: u32,
            page_token: Option<String>,
        ) -> Result<Page>;
        async fn get_message(&self, id: &str) -> Result<EmailMessage>;
        async fn list_labels(&self) -> Result<Vec<LabelInfo>>;
        async fn create_label(&self, name: &str) -> Result<String>;
        async fn modify_message(
            &self,
            message_id: &str,
            add_label_ids: &[String],
            remove_label_ids: &[String],
        ) -> Result<()>;
    }
}

mock! {
    pub TokenProvider {}

    #[async_trait]
    impl TokenProvider for TokenProvider {
        async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant>;
        async fn exchange_code(&self, code: &str) -> Result<TokenGrant>;
    }
}

/// Pipeline wired to in-memory fakes
pub struct Harness {
    pub store: Arc<dyn KvStore>,
    pub credentials: CredentialStore,
    pub provider: Arc<FakeTokenProvider>,
    pub factory: Arc<FakeFactory>,
    pub classifier: Arc<ScriptedClassifier>,
    pub auth: TokenRefreshCoordinator,
    pub pipeline: Arc<Pipeline>,
}

impl Harness {
    pub fn new(result: Option<Classification>) -> Self {
        Self::with_settings(result, PipelineSettings::default())
    }

    pub fn with_settings(result: Option<Classification>, settings: PipelineSettings) -> Self {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let credentials = credential_store(store.clone());
        let provider = Arc::new(FakeTokenProvider::new());
        let factory = Arc::new(FakeFactory::new());
        let classifier = Arc::new(ScriptedClassifier::new(result));

        let auth = TokenRefreshCoordinator::new(provider.clone(), credentials.clone(), factory.clone());
        let pipeline = Arc::new(Pipeline::new(
            store.clone(),
            auth.clone(),
            classifier.clone(),
            settings,
        ));

        Self {
            store,
            credentials,
            provider,
            factory,
            classifier,
            auth,
            pipeline,
        }
    }

    /// Store a valid credential for `email` and route its client to `gmail`
    pub async fn add_mailbox(&self, email: &str, gmail: Arc<FakeGmail>) {
        self.credentials
            .save(email, &record(email, "valid-token", 3600))
            .await
            .unwrap();
        self.factory.register(email, gmail);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fake_gmail_pages_by_offset() {
        let gmail = FakeGmail::new(OWNER).with_threads(3);
        let first = gmail.list_threads("in:inbox", 2, None).await.unwrap();
        assert_eq!(first.ids, vec!["t1", "t2"]);
        let second = gmail
            .list_threads("in:inbox", 2, first.next_page_token)
            .await
            .unwrap();
        assert_eq!(second.ids, vec!["t3"]);
        assert!(second.next_page_token.is_none());
    }

    #[tokio::test]
    async fn test_fake_gmail_applies_modifications() {
        let gmail = FakeGmail::new(OWNER).with_threads(1);
        gmail
            .modify_message("m1", &["L1".to_string()], &["INBOX".to_string()])
            .await
            .unwrap();
        assert_eq!(gmail.message_label_ids("m1"), vec!["L1"]);
    }
}
