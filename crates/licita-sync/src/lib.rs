//! Daily extract-load pipeline: credential, schema, fetch, upsert, summary.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use licita_adapters::{ListingSource, MercadoPublicoAdapter, DEFAULT_API_BASE_URL};
use licita_core::{ApiTicket, FetchDate, ListingKind, DEFAULT_DB_FILE};
use licita_storage::{HttpClientConfig, HttpFetcher, ProcurementStore, UpsertOutcome};
use serde::Serialize;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "licita-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_path: PathBuf,
    pub api_base_url: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from(DEFAULT_DB_FILE),
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            user_agent: format!("licita/{}", env!("CARGO_PKG_VERSION")),
            http_timeout_secs: 30,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_path: std::env::var("LICITA_DB_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.database_path),
            api_base_url: std::env::var("LICITA_API_BASE_URL").unwrap_or(defaults.api_base_url),
            user_agent: std::env::var("LICITA_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: std::env::var("LICITA_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|secs| *secs > 0)
                .unwrap_or(defaults.http_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ListingSummary {
    pub fetched: usize,
    pub upsert: UpsertOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub fetch_date: FetchDate,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub database_path: String,
    pub tenders: ListingSummary,
    pub purchase_orders: ListingSummary,
}

impl SyncRunSummary {
    pub fn new_records(&self) -> usize {
        self.tenders.upsert.inserted + self.purchase_orders.upsert.inserted
    }
}

pub struct SyncPipeline {
    store: ProcurementStore,
    source: Box<dyn ListingSource>,
}

impl SyncPipeline {
    pub fn new(config: &SyncConfig) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
        })?;
        let adapter = MercadoPublicoAdapter::new(&config.api_base_url, http)?;
        Ok(Self::with_source(
            ProcurementStore::new(config.database_path.clone()),
            Box::new(adapter),
        ))
    }

    pub fn with_source(store: ProcurementStore, source: Box<dyn ListingSource>) -> Self {
        Self { store, source }
    }

    pub fn store(&self) -> &ProcurementStore {
        &self.store
    }

    pub async fn run_once(&self, date: FetchDate, ticket: &ApiTicket) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id, %date, source = self.source.source_id());
        async move {
            let started_at = Utc::now();
            self.store.ensure_schema().await?;

            info!("fetching listings");
            let tenders = self.sync_listing(ListingKind::Tenders, date, ticket).await;
            let purchase_orders = self
                .sync_listing(ListingKind::PurchaseOrders, date, ticket)
                .await;

            Ok(SyncRunSummary {
                run_id,
                fetch_date: date,
                started_at,
                finished_at: Utc::now(),
                database_path: self.store.path().display().to_string(),
                tenders,
                purchase_orders,
            })
        }
        .instrument(span)
        .await
    }

    /// Fetch and save one listing. A batch the store rejects as a whole is logged and
    /// counted as failed so the other listing still runs.
    async fn sync_listing(
        &self,
        kind: ListingKind,
        date: FetchDate,
        ticket: &ApiTicket,
    ) -> ListingSummary {
        let entries = self.source.fetch_listing(kind, date, ticket).await;
        if entries.is_empty() {
            info!(%kind, "no records found for the date or the API was unreachable");
            return ListingSummary::default();
        }

        let saved = match kind {
            ListingKind::Tenders => self.store.insert_tenders(&entries).await,
            ListingKind::PurchaseOrders => self.store.insert_purchase_orders(&entries).await,
        };
        let upsert = match saved {
            Ok(upsert) => {
                info!(%kind, new_records = upsert.inserted, "listing saved");
                upsert
            }
            Err(err) => {
                error!(%kind, error = %format!("{err:#}"), "saving listing failed");
                UpsertOutcome {
                    failed: entries.len(),
                    ..UpsertOutcome::default()
                }
            }
        };

        ListingSummary {
            fetched: entries.len(),
            upsert,
        }
    }
}

/// Full daily run. The ticket is resolved through `lookup` before anything touches the
/// network or the store.
pub async fn run_sync_once<F>(
    config: &SyncConfig,
    date: FetchDate,
    lookup: F,
) -> Result<SyncRunSummary>
where
    F: FnOnce(&str) -> Option<String>,
{
    let ticket = ApiTicket::from_lookup(lookup)?;
    let pipeline = SyncPipeline::new(config)?;
    pipeline.run_once(date, &ticket).await
}
