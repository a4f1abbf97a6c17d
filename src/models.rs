use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stored OAuth tokens for one mailbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialRecord {
    pub email: String,
    pub access_token: String,
    pub refresh_token: String,
    /// Access-token expiry in epoch seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
}

impl CredentialRecord {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> Option<bool> {
        self.expires_at.map(|exp| now.timestamp() >= exp)
    }
}

/// A label attached to a message, with its display name resolved
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailLabel {
    pub id: String,
    pub name: String,
}

/// Normalized email shape handed to the classifier
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailMessage {
    pub id: String,
    pub thread_id: String,
    pub from: String,
    pub to: String,
    pub subject: String,
    pub date: String,
    pub snippet: String,
    pub body_text: String,
    pub labels: Vec<EmailLabel>,
}

impl EmailMessage {
    pub fn has_label(&self, label_id: &str) -> bool {
        self.labels.iter().any(|l| l.id == label_id)
    }

    /// The "From/To/Subject/Body" block sent to the classifier
    pub fn format_for_classification(&self) -> String {
        format!(
            "From: {}\nTo: {}\nSubject: {}\nBody: {}",
            self.from, self.to, self.subject, self.body_text
        )
    }
}

/// Triage action chosen by the classifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TriageAction {
    #[serde(rename = "to read")]
    ToRead,
    #[serde(rename = "to reply")]
    ToReply,
    #[serde(rename = "to archive")]
    ToArchive,
}

impl TriageAction {
    pub const ALL: [TriageAction; 3] = [
        TriageAction::ToRead,
        TriageAction::ToReply,
        TriageAction::ToArchive,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TriageAction::ToRead => "to read",
            TriageAction::ToReply => "to reply",
            TriageAction::ToArchive => "to archive",
        }
    }
}

/// Structured classifier output.
///
/// Unknown or missing fields make a payload invalid, which is what lets cached
/// results from an older schema be detected and recomputed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Classification {
    pub explanation: String,
    pub is_cold_inbound: bool,
    pub is_recruiting: bool,
    pub is_internal: bool,
    pub is_updates: bool,
    pub is_promotional: bool,
    pub action: TriageAction,
}

/// Outcome for one message within a mailbox run
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemError {
    pub message_id: String,
    pub kind: String,
    pub error: String,
}

/// Result of processing one mailbox
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MailboxReport {
    pub email: String,
    pub success: bool,
    pub processed_count: usize,
    pub skipped_count: usize,
    pub failed_count: usize,
    pub modify_calls: usize,
    pub pages: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub item_errors: Vec<ItemError>,
}

impl MailboxReport {
    pub fn new(email: &str) -> Self {
        Self {
            email: email.to_string(),
            success: true,
            ..Default::default()
        }
    }

    pub fn failed(email: &str, error: &crate::error::TriageError) -> Self {
        Self {
            email: email.to_string(),
            success: false,
            error: Some(error.to_string()),
            ..Default::default()
        }
    }
}

/// Result of a cross-mailbox run
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub timed_out: bool,
    pub classifier_cost_usd: f64,
    pub results: Vec<MailboxReport>,
}

impl BatchReport {
    pub fn processed_count(&self) -> usize {
        self.results.iter().map(|r| r.processed_count).sum()
    }

    pub fn skipped_count(&self) -> usize {
        self.results.iter().map(|r| r.skipped_count).sum()
    }
}
