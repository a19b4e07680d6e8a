//! Dynamic configuration: stop list and tunables, polled from the store.
//!
//! Three fixed documents live in the config collection. They are parsed into
//! typed snapshots and swapped behind a lock; readers clone an `Arc` and
//! never block on a refresh. A failed load keeps the last good snapshot.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::services::Service;
use crate::store::{DocumentStore, collections};

pub const STOP_LIST_DOC: &str = "stop-list";
pub const QUEUE_SETTINGS_DOC: &str = "queue-settings";
pub const AI_SETTINGS_DOC: &str = "ai-settings";

/// Why the stop list excluded a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Company,
    Keyword,
    Host,
}

impl StopReason {
    pub fn reason(self) -> &'static str {
        match self {
            StopReason::Company => "stop_listed:company",
            StopReason::Keyword => "stop_listed:keyword",
            StopReason::Host => "stop_listed:host",
        }
    }
}

/// The `stop-list` document as stored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopListDoc {
    #[serde(default)]
    pub excluded_companies: Vec<String>,
    #[serde(default)]
    pub excluded_keywords: Vec<String>,
    #[serde(default)]
    pub excluded_hosts: Vec<String>,
    #[serde(flatten)]
    pub unknown: BTreeMap<String, Value>,
}

/// Compiled stop list with lowercase terms.
#[derive(Debug, Clone, Default)]
pub struct StopList {
    companies: Vec<String>,
    keywords: Vec<String>,
    hosts: Vec<String>,
}

impl From<StopListDoc> for StopList {
    fn from(doc: StopListDoc) -> Self {
        let lower = |v: Vec<String>| -> Vec<String> {
            v.into_iter()
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect()
        };
        Self {
            companies: lower(doc.excluded_companies),
            keywords: lower(doc.excluded_keywords),
            hosts: lower(doc.excluded_hosts),
        }
    }
}

impl StopList {
    /// Case-insensitive substring match on company and title+description,
    /// right-anchored suffix match on the host.
    pub fn is_excluded(
        &self,
        company_name: &str,
        title: &str,
        description: &str,
        host: &str,
    ) -> Option<StopReason> {
        let company = company_name.to_lowercase();
        if !company.is_empty()
            && self.companies.iter().any(|term| company.contains(term))
        {
            return Some(StopReason::Company);
        }

        let text = format!("{} {}", title.to_lowercase(), description.to_lowercase());
        if self.keywords.iter().any(|term| text.contains(term)) {
            return Some(StopReason::Keyword);
        }

        let host = host.to_lowercase();
        if !host.is_empty()
            && self
                .hosts
                .iter()
                .any(|suffix| host == *suffix || host.ends_with(&format!(".{suffix}")))
        {
            return Some(StopReason::Host);
        }

        None
    }
}

/// The `queue-settings` document: queue and worker tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: u64,
    #[serde(default = "default_processing_timeout")]
    pub processing_timeout_seconds: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,
    #[serde(default = "default_high_watermark")]
    pub queue_high_watermark: u64,
    #[serde(default = "default_retention_days")]
    pub retention_days: u64,
    #[serde(default = "default_analysis_timeout")]
    pub company_analysis_timeout_seconds: u64,
    #[serde(flatten)]
    pub unknown: BTreeMap<String, Value>,
}

fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay() -> u64 {
    60
}
fn default_processing_timeout() -> u64 {
    5 * 60
}
fn default_batch_size() -> usize {
    10
}
fn default_concurrency() -> usize {
    4
}
fn default_poll_interval() -> u64 {
    60
}
fn default_high_watermark() -> u64 {
    500
}
fn default_retention_days() -> u64 {
    14
}
fn default_analysis_timeout() -> u64 {
    300
}

impl Default for QueueSettings {
    fn default() -> Self {
        serde_json::from_value(Value::Object(Default::default()))
            .unwrap_or_else(|_| unreachable!("all fields have defaults"))
    }
}

impl QueueSettings {
    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.processing_timeout_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_seconds)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_days * 24 * 60 * 60)
    }

    pub fn company_analysis_timeout(&self) -> Duration {
        Duration::from_secs(self.company_analysis_timeout_seconds)
    }
}

/// The `ai-settings` document: scoring tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiSettings {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_min_match_score")]
    pub min_match_score: f64,
    #[serde(default = "default_daily_cost_budget")]
    pub daily_cost_budget: f64,
    /// Fallback per-call cost when the scorer does not report one.
    #[serde(default = "default_estimated_call_cost")]
    pub estimated_call_cost: f64,
    #[serde(flatten)]
    pub unknown: BTreeMap<String, Value>,
}

fn default_provider() -> String {
    "http".to_string()
}
fn default_model() -> String {
    "default".to_string()
}
fn default_min_match_score() -> f64 {
    70.0
}
fn default_daily_cost_budget() -> f64 {
    5.0
}
fn default_estimated_call_cost() -> f64 {
    0.01
}

impl Default for AiSettings {
    fn default() -> Self {
        serde_json::from_value(Value::Object(Default::default()))
            .unwrap_or_else(|_| unreachable!("all fields have defaults"))
    }
}

/// One immutable view of all dynamic configuration.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub stop_list: StopList,
    pub queue: QueueSettings,
    pub ai: AiSettings,
    pub loaded_at: DateTime<Utc>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            stop_list: StopList::default(),
            queue: QueueSettings::default(),
            ai: AiSettings::default(),
            loaded_at: Utc::now(),
        }
    }
}

/// Process-wide holder for the current snapshot.
pub struct SettingsCache {
    store: Arc<dyn DocumentStore>,
    current: RwLock<Arc<Snapshot>>,
}

impl SettingsCache {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            current: RwLock::new(Arc::new(Snapshot::default())),
        }
    }

    /// The current snapshot. Cheap: clones an `Arc` under a read lock.
    pub fn current(&self) -> Arc<Snapshot> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Fetch all three documents and swap in a fresh snapshot.
    ///
    /// Any failure leaves the previous snapshot in place; the pipeline is
    /// never blocked on configuration.
    pub async fn load(&self) -> Result<(), crate::store::StoreError> {
        let stop_list: StopListDoc =
            self.fetch_doc(STOP_LIST_DOC).await?.unwrap_or_default();
        let queue: QueueSettings = self
            .fetch_doc(QUEUE_SETTINGS_DOC)
            .await?
            .unwrap_or_default();
        let ai: AiSettings = self.fetch_doc(AI_SETTINGS_DOC).await?.unwrap_or_default();

        log_unknown(STOP_LIST_DOC, &stop_list.unknown);
        log_unknown(QUEUE_SETTINGS_DOC, &queue.unknown);
        log_unknown(AI_SETTINGS_DOC, &ai.unknown);

        let snapshot = Snapshot {
            stop_list: stop_list.into(),
            queue,
            ai,
            loaded_at: Utc::now(),
        };

        *self.current.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(snapshot);
        debug!("settings snapshot refreshed");
        Ok(())
    }

    async fn fetch_doc<T: serde::de::DeserializeOwned>(
        &self,
        doc_id: &str,
    ) -> Result<Option<T>, crate::store::StoreError> {
        match self.store.get(collections::CONFIG, doc_id).await? {
            None => {
                info!(doc = doc_id, "config document missing, using defaults");
                Ok(None)
            }
            Some(value) => match serde_json::from_value(value) {
                Ok(parsed) => Ok(Some(parsed)),
                Err(e) => {
                    warn!(doc = doc_id, error = %e, "config document malformed, using defaults");
                    Ok(None)
                }
            },
        }
    }
}

fn log_unknown(doc: &str, unknown: &BTreeMap<String, Value>) {
    if !unknown.is_empty() {
        let keys: Vec<&str> = unknown.keys().map(String::as_str).collect();
        warn!(doc, ?keys, "ignoring unrecognized config fields");
    }
}

/// Background service that re-polls the config collection.
pub struct SettingsRefresher {
    settings: Arc<SettingsCache>,
    interval: Duration,
    shutdown_tx: Option<broadcast::Sender<()>>,
}

impl SettingsRefresher {
    pub fn new(settings: Arc<SettingsCache>, interval: Duration) -> Self {
        Self {
            settings,
            interval,
            shutdown_tx: None,
        }
    }
}

#[async_trait::async_trait]
impl Service for SettingsRefresher {
    fn name(&self) -> &'static str {
        "settings"
    }

    async fn run(&mut self) -> Result<(), anyhow::Error> {
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx);

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; the initial load already ran at
        // startup, so skip it.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.settings.load().await {
                        warn!(error = %e, "settings refresh failed, keeping last snapshot");
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("settings refresher exiting");
                    return Ok(());
                }
            }
        }
    }

    async fn shutdown(&mut self) -> Result<(), anyhow::Error> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use serde_json::json;

    fn stop_list(companies: &[&str], keywords: &[&str], hosts: &[&str]) -> StopList {
        StopList::from(StopListDoc {
            excluded_companies: companies.iter().map(|s| s.to_string()).collect(),
            excluded_keywords: keywords.iter().map(|s| s.to_string()).collect(),
            excluded_hosts: hosts.iter().map(|s| s.to_string()).collect(),
            unknown: Default::default(),
        })
    }

    #[test]
    fn company_substring_match_is_case_insensitive() {
        let list = stop_list(&["NoGoodCo"], &[], &[]);
        assert_eq!(
            list.is_excluded("nogoodco holdings", "Engineer", "", "jobs.example.com"),
            Some(StopReason::Company)
        );
        assert_eq!(list.is_excluded("FineCo", "Engineer", "", ""), None);
    }

    #[test]
    fn keyword_matches_title_and_description() {
        let list = stop_list(&[], &["crypto"], &[]);
        assert_eq!(
            list.is_excluded("Acme", "Senior CRYPTO Engineer", "", ""),
            Some(StopReason::Keyword)
        );
        assert_eq!(
            list.is_excluded("Acme", "Engineer", "we do Crypto things", ""),
            Some(StopReason::Keyword)
        );
    }

    #[test]
    fn host_match_is_right_anchored() {
        let list = stop_list(&[], &[], &["spam.example"]);
        assert_eq!(
            list.is_excluded("", "", "", "spam.example"),
            Some(StopReason::Host)
        );
        assert_eq!(
            list.is_excluded("", "", "", "jobs.spam.example"),
            Some(StopReason::Host)
        );
        // Not a suffix at a label boundary.
        assert_eq!(list.is_excluded("", "", "", "notspam.example.com"), None);
        assert_eq!(list.is_excluded("", "", "", "spam.example.com"), None);
    }

    #[test]
    fn empty_stop_list_excludes_nothing() {
        let list = StopList::default();
        assert_eq!(list.is_excluded("Acme", "Engineer", "desc", "a.com"), None);
    }

    #[tokio::test]
    async fn load_parses_documents_and_keeps_defaults_for_missing() {
        let store = Arc::new(MemoryStore::new());
        store
            .put(
                collections::CONFIG,
                QUEUE_SETTINGS_DOC,
                json!({"maxRetries": 5, "batchSize": 2, "someFutureKnob": true}),
            )
            .await
            .unwrap();

        let cache = SettingsCache::new(store);
        cache.load().await.unwrap();

        let snapshot = cache.current();
        assert_eq!(snapshot.queue.max_retries, 5);
        assert_eq!(snapshot.queue.batch_size, 2);
        // Untouched fields fall back to defaults.
        assert_eq!(snapshot.queue.poll_interval_seconds, 60);
        assert_eq!(snapshot.ai.min_match_score, 70.0);
    }

    #[tokio::test]
    async fn malformed_document_falls_back_to_defaults() {
        let store = Arc::new(MemoryStore::new());
        store
            .put(collections::CONFIG, AI_SETTINGS_DOC, json!("not an object"))
            .await
            .unwrap();

        let cache = SettingsCache::new(store);
        cache.load().await.unwrap();
        assert_eq!(cache.current().ai.provider, "http");
    }
}
