//! Batch triage pipeline
//!
//! Per mailbox: list a page of threads, take the newest message of each,
//! skip messages already marked processed, classify the rest, reconcile the
//! management labels, mark processed, then follow the page token.
//!
//! Per message the order is fixed: classify, then reconcile labels, then mark
//! processed. A message whose label change failed is never marked, so the
//! next run picks it up again. Across messages there is no ordering.

use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::TokenRefreshCoordinator;
use crate::classifier::{classify_email, ClassificationCache, Classifier, CostTracker};
use crate::client::GmailClient;
use crate::config::{Config, ManagementLabels};
use crate::error::{Result, TriageError};
use crate::label_manager::{LabelManager, LabelMap, DEFAULT_LABEL_CACHE_TTL};
use crate::models::{BatchReport, EmailLabel, EmailMessage, ItemError, MailboxReport};
use crate::state::{ProcessedSet, DEFAULT_PROCESSED_TTL};
use crate::store::KvStore;

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub query: String,
    pub page_size: u32,
    pub max_concurrent: usize,
    pub labels: ManagementLabels,
    pub batch_budget: Duration,
    pub processed_ttl: Duration,
    pub label_cache_ttl: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            query: "in:inbox".to_string(),
            page_size: 20,
            max_concurrent: 10,
            labels: ManagementLabels::default(),
            batch_budget: Duration::from_secs(300),
            processed_ttl: DEFAULT_PROCESSED_TTL,
            label_cache_ttl: DEFAULT_LABEL_CACHE_TTL,
        }
    }
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            query: config.gmail.query.clone(),
            page_size: config.gmail.page_size,
            max_concurrent: config.gmail.max_concurrent_requests,
            labels: config.pipeline.labels.clone(),
            batch_budget: config.pipeline.batch_budget(),
            processed_ttl: config.store.processed_ttl(),
            label_cache_ttl: config.store.label_cache_ttl(),
        }
    }
}

/// Label mutation for one message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelChange {
    pub add: Vec<String>,
    pub remove: Vec<String>,
}

impl LabelChange {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty()
    }
}

/// Diff a message's labels against its target management label.
///
/// `current` must carry resolved names. Only labels named like another
/// management label are removed; user labels are never touched. Matching by
/// name also catches duplicate copies of a management label.
pub fn plan_label_change(
    current: &[EmailLabel],
    target_id: &str,
    target_name: &str,
    management: &ManagementLabels,
) -> LabelChange {
    let has_target = current
        .iter()
        .any(|l| l.id == target_id || l.name.eq_ignore_ascii_case(target_name));

    let others: HashSet<String> = management
        .all()
        .into_iter()
        .filter(|name| !name.eq_ignore_ascii_case(target_name))
        .map(|name| name.to_lowercase())
        .collect();

    LabelChange {
        add: if has_target {
            Vec::new()
        } else {
            vec![target_id.to_string()]
        },
        remove: current
            .iter()
            .filter(|l| l.id != target_id && others.contains(&l.name.to_lowercase()))
            .map(|l| l.id.clone())
            .collect(),
    }
}

enum ItemOutcome {
    Processed { modified: bool },
    AlreadyProcessed,
    Unclassified(ItemError),
    Failed(ItemError, bool),
    Empty,
}

fn item_failure(id: &str, error: TriageError) -> ItemOutcome {
    let rate_limited = matches!(error, TriageError::RateLimited { .. });
    ItemOutcome::Failed(
        ItemError {
            message_id: id.to_string(),
            kind: error.kind().to_string(),
            error: error.to_string(),
        },
        rate_limited,
    )
}

struct ResolvedLabels {
    ids: HashMap<String, String>,
    map: LabelMap,
}

/// State of one mailbox run
struct MailboxRun<'a> {
    pipeline: &'a Pipeline,
    email: &'a str,
    client: Arc<dyn GmailClient>,
    labels: LabelManager,
    resolved: OnceCell<ResolvedLabels>,
    cost: &'a CostTracker,
}

impl<'a> MailboxRun<'a> {
    /// Labels are only ensured once a message actually needs them
    async fn resolved_labels(&self) -> Result<&ResolvedLabels> {
        self.resolved
            .get_or_try_init(|| async {
                let names = self.pipeline.settings.labels.all();
                let ids = self.labels.ensure_labels_exist(&names).await?;
                let map = self.labels.label_map().await?;
                Ok::<_, TriageError>(ResolvedLabels { ids, map })
            })
            .await
    }

    async fn handle_thread(&self, thread_id: &str) -> ItemOutcome {
        let messages = match self.client.get_thread(thread_id).await {
            Ok(messages) => messages,
            Err(e) => {
                warn!("Failed to fetch thread {} for {}: {}", thread_id, self.email, e);
                return item_failure(thread_id, e);
            }
        };

        // The newest message represents the thread
        match messages.into_iter().last() {
            Some(message) => self.handle_message(message).await,
            None => ItemOutcome::Empty,
        }
    }

    async fn handle_message(&self, message: EmailMessage) -> ItemOutcome {
        let pipeline = self.pipeline;
        let id = message.id.as_str();

        match pipeline.processed.is_processed(self.email, id).await {
            Ok(true) => {
                debug!("Skipping already processed {}", id);
                return ItemOutcome::AlreadyProcessed;
            }
            Ok(false) => {}
            Err(e) => return item_failure(id, e),
        }

        let classification = match classify_email(
            &pipeline.cache,
            pipeline.classifier.as_ref(),
            &message,
            self.email,
            self.cost,
        )
        .await
        {
            Ok(Some(classification)) => classification,
            Ok(None) => {
                // Left unmarked so a later run retries it
                let error = TriageError::ClassificationUnavailable(id.to_string());
                return ItemOutcome::Unclassified(ItemError {
                    message_id: id.to_string(),
                    kind: error.kind().to_string(),
                    error: error.to_string(),
                });
            }
            Err(e) => {
                warn!("Classification failed for {}: {}", id, e);
                return item_failure(id, e);
            }
        };

        let resolved = match self.resolved_labels().await {
            Ok(resolved) => resolved,
            Err(e) => return item_failure(id, e),
        };

        let target_name = pipeline.settings.labels.for_action(classification.action);
        let Some(target_id) = resolved.ids.get(target_name) else {
            return item_failure(
                id,
                TriageError::NotFound(format!("label '{}' was not created", target_name)),
            );
        };

        let current = resolved.map.resolve(&message.labels);
        let change = plan_label_change(&current, target_id, target_name, &pipeline.settings.labels);

        let modified = !change.is_empty();
        if modified {
            if let Err(e) = self
                .client
                .modify_message(id, &change.add, &change.remove)
                .await
            {
                warn!("Failed to label {} for {}: {}", id, self.email, e);
                return item_failure(id, e);
            }
            debug!(
                "Labeled {} as '{}' (+{} -{})",
                id,
                target_name,
                change.add.len(),
                change.remove.len()
            );
        }

        if let Err(e) = pipeline.processed.mark_processed(self.email, id).await {
            return item_failure(id, e);
        }
        ItemOutcome::Processed { modified }
    }
}

pub struct Pipeline {
    auth: TokenRefreshCoordinator,
    classifier: Arc<dyn Classifier>,
    store: Arc<dyn KvStore>,
    processed: ProcessedSet,
    cache: ClassificationCache,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn KvStore>,
        auth: TokenRefreshCoordinator,
        classifier: Arc<dyn Classifier>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            processed: ProcessedSet::with_ttl(store.clone(), settings.processed_ttl),
            cache: ClassificationCache::new(store.clone()),
            auth,
            classifier,
            store,
            settings,
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Authenticate a stored mailbox and process it.
    ///
    /// Never fails: authentication problems come back as a failed report.
    pub async fn process_mailbox(&self, email: &str, cost: &CostTracker) -> MailboxReport {
        match self.auth.authenticate_mailbox(email).await {
            Ok(client) => self.process_client(email, client, cost).await,
            Err(e) => {
                warn!("Skipping mailbox {}: {}", email, e);
                MailboxReport::failed(email, &e)
            }
        }
    }

    /// Process a mailbox through an already-authenticated client
    pub async fn process_client(
        &self,
        email: &str,
        client: Arc<dyn GmailClient>,
        cost: &CostTracker,
    ) -> MailboxReport {
        let run = MailboxRun {
            pipeline: self,
            email,
            labels: LabelManager::with_ttl(
                client.clone(),
                self.store.clone(),
                email,
                self.settings.label_cache_ttl,
            ),
            client,
            resolved: OnceCell::new(),
            cost,
        };

        let mut report = MailboxReport::new(email);
        let mut page_token: Option<String> = None;

        loop {
            let page = match run
                .client
                .list_threads(&self.settings.query, self.settings.page_size, page_token.take())
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    warn!("Listing threads failed for {}: {}", email, e);
                    report.success = false;
                    report.error = Some(e.to_string());
                    break;
                }
            };
            report.pages += 1;
            debug!("Page {} for {}: {} threads", report.pages, email, page.ids.len());

            let run = &run;
            let outcomes: Vec<ItemOutcome> = stream::iter(page.ids)
                .map(|thread_id| async move { run.handle_thread(&thread_id).await })
                .buffer_unordered(self.settings.max_concurrent.max(1))
                .collect()
                .await;

            let mut rate_limited = false;
            for outcome in outcomes {
                match outcome {
                    ItemOutcome::Processed { modified } => {
                        report.processed_count += 1;
                        if modified {
                            report.modify_calls += 1;
                        }
                    }
                    ItemOutcome::AlreadyProcessed => report.skipped_count += 1,
                    ItemOutcome::Unclassified(item) => {
                        report.skipped_count += 1;
                        report.item_errors.push(item);
                    }
                    ItemOutcome::Failed(item, limited) => {
                        rate_limited |= limited;
                        report.failed_count += 1;
                        report.item_errors.push(item);
                    }
                    ItemOutcome::Empty => {}
                }
            }

            if rate_limited {
                // Back off: the remaining pages wait for the next run
                warn!("Rate limited while processing {}, stopping early", email);
                report.success = false;
                report.error = Some("rate limited, remaining pages deferred".to_string());
                break;
            }

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        info!(
            "Mailbox {}: {} processed, {} skipped, {} failed over {} pages",
            email, report.processed_count, report.skipped_count, report.failed_count, report.pages
        );
        report
    }

    /// Process every mailbox with stored credentials within the batch budget.
    ///
    /// One mailbox failing never affects the others. When the budget runs
    /// out, finished mailboxes keep their reports and the rest are reported
    /// as not completed.
    pub async fn process_all(&self) -> Result<BatchReport> {
        let run_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let cost = CostTracker::new();

        let mailboxes: Vec<String> = self
            .auth
            .credentials()
            .list_all()
            .await?
            .into_iter()
            .map(|(email, _)| email)
            .collect();
        info!("Batch {} starting for {} mailboxes", run_id, mailboxes.len());

        let results: Arc<Mutex<Vec<MailboxReport>>> = Arc::new(Mutex::new(Vec::new()));
        let work = stream::iter(mailboxes.clone()).for_each_concurrent(None, |email| {
            let results = results.clone();
            let cost = &cost;
            async move {
                let report = self.process_mailbox(&email, cost).await;
                results.lock().await.push(report);
            }
        });

        let timed_out = tokio::time::timeout(self.settings.batch_budget, work)
            .await
            .is_err();

        let mut results = std::mem::take(&mut *results.lock().await);
        if timed_out {
            warn!(
                "Batch {} exceeded its {:?} budget after {} of {} mailboxes",
                run_id,
                self.settings.batch_budget,
                results.len(),
                mailboxes.len()
            );
            let finished: HashSet<String> = results.iter().map(|r| r.email.clone()).collect();
            for email in mailboxes.iter().filter(|e| !finished.contains(*e)) {
                results.push(MailboxReport {
                    email: email.clone(),
                    success: false,
                    error: Some("batch budget exhausted".to_string()),
                    ..Default::default()
                });
            }
        }
        results.sort_by(|a, b| a.email.cmp(&b.email));

        let report = BatchReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            success: !timed_out,
            timed_out,
            classifier_cost_usd: cost.total(),
            results,
        };
        info!(
            "Batch {} done: {} processed, {} skipped, ${:.4} classifier cost",
            report.run_id,
            report.processed_count(),
            report.skipped_count(),
            report.classifier_cost_usd
        );
        Ok(report)
    }
}
