//! Inbox Triage
//!
//! Signs mailboxes in with OAuth, classifies their inbox threads with a
//! language model, and applies "To Read" / "To Reply" / "To Archive" labels.
//!
//! # Overview
//!
//! - **Credentials**: per-mailbox OAuth tokens, encrypted at rest in a key-value store
//! - **Token refresh**: refresh-on-demand with persistence before use and a sticky error flag
//! - **Gmail client**: REST adapter with a per-mailbox fixed-window call budget
//! - **Classification**: structured-output LLM calls with a permanent per-message cache
//! - **Pipeline**: paginated, idempotent fetch → classify → label → mark-processed
//!
//! # Example Usage
//!
//! ```no_run
//! use inbox_triage::{config::Config, context::AppContext};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml".as_ref()).await?;
//!     let context = AppContext::from_config(config)?;
//!
//!     let report = context.pipeline.process_all().await?;
//!     println!("{} processed, {} skipped", report.processed_count(), report.skipped_count());
//!     Ok(())
//! }
//! ```
//!
//! # Module Organization
//!
//! - [`auth`] - OAuth client and token refresh coordination
//! - [`classifier`] - LLM classifier, classification cache, cost tracking
//! - [`cli`] - Command-line interface
//! - [`client`] - Gmail REST adapter and rate-limited wrapper
//! - [`config`] - Configuration file and environment overrides
//! - [`context`] - Service wiring
//! - [`credentials`] - Encrypted credential store
//! - [`crypto`] - Authenticated encryption of stored records
//! - [`error`] - Error types and result aliases
//! - [`label_manager`] - Label map cache and label creation
//! - [`models`] - Core data structures
//! - [`pipeline`] - Batch triage pipeline
//! - [`rate_limiter`] - Per-mailbox call budget
//! - [`server`] - Scheduled trigger and sign-in routes
//! - [`state`] - Processed-message markers
//! - [`store`] - Key-value store backends

pub mod auth;
pub mod classifier;
pub mod cli;
pub mod client;
pub mod config;
pub mod context;
pub mod credentials;
pub mod crypto;
pub mod error;
pub mod label_manager;
pub mod models;
pub mod pipeline;
pub mod rate_limiter;
pub mod server;
pub mod state;
pub mod store;

// Re-export commonly used types for convenience
pub use error::{Result, TriageError};

// Core data models
pub use models::{
    BatchReport, Classification, CredentialRecord, EmailLabel, EmailMessage, MailboxReport,
    TriageAction,
};

// Adapter traits
pub use auth::{TokenProvider, TokenRefreshCoordinator, TokenState};
pub use classifier::{ChatCompletion, Classifier, CostTracker};
pub use client::{ClientFactory, GmailClient};
pub use store::{KvStore, MemoryStore, RedisStore};

// Config types
pub use config::Config;

// Pipeline
pub use pipeline::{Pipeline, PipelineSettings};
