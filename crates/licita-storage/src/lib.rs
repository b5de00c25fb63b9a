//! SQLite procurement store + HTTP fetch utilities for licita.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use licita_core::{ListingKind, PurchaseOrderRecord, RecordError, TenderRecord};
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value as JsonValue;
use sqlx::query::Query;
use sqlx::sqlite::{
    Sqlite, SqliteArguments, SqliteConnectOptions, SqliteConnection, SqliteJournalMode,
};
use sqlx::{ConnectOptions, Connection, Row};
use thiserror::Error;
use tokio::fs;
use tracing::{info, info_span, warn, Instrument};

pub use reqwest::Url;

pub const CRATE_NAME: &str = "licita-storage";

pub const TENDERS_TABLE: &str = "licitaciones";
pub const PURCHASE_ORDERS_TABLE: &str = "ordenes_compra";

const CREATE_TENDERS_SQL: &str = r#"
    CREATE TABLE IF NOT EXISTS licitaciones (
        codigo_externo TEXT PRIMARY KEY NOT NULL,
        nombre TEXT,
        estado INTEGER,
        fecha_cierre TEXT
    )
"#;

const CREATE_PURCHASE_ORDERS_SQL: &str = r#"
    CREATE TABLE IF NOT EXISTS ordenes_compra (
        codigo_externo TEXT PRIMARY KEY NOT NULL,
        nombre TEXT,
        estado INTEGER
    )
"#;

/// Per-batch result of an insert-or-ignore pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertOutcome {
    pub inserted: usize,
    pub ignored: usize,
    pub failed: usize,
}

impl UpsertOutcome {
    pub fn total(&self) -> usize {
        self.inserted + self.ignored + self.failed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenMode {
    Create,
    ReadWrite,
    ReadOnly,
}

/// Local SQLite file holding tenders and purchase orders.
///
/// Every operation opens its own connection and closes it before returning; nothing is
/// held between calls.
#[derive(Debug, Clone)]
pub struct ProcurementStore {
    path: PathBuf,
}

impl ProcurementStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn connect(&self, mode: OpenMode) -> anyhow::Result<SqliteConnection> {
        if mode == OpenMode::Create {
            if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("creating store directory {}", parent.display()))?;
            }
        }

        let mut options = SqliteConnectOptions::new()
            .filename(&self.path)
            .create_if_missing(mode == OpenMode::Create);
        options = match mode {
            OpenMode::ReadOnly => options.read_only(true),
            OpenMode::Create | OpenMode::ReadWrite => {
                options.journal_mode(SqliteJournalMode::Delete)
            }
        };

        options
            .connect()
            .await
            .with_context(|| format!("opening store {}", self.path.display()))
    }

    /// Create the store file and both tables when missing. Existing data is never touched.
    pub async fn ensure_schema(&self) -> anyhow::Result<()> {
        let mut conn = self.connect(OpenMode::Create).await?;
        for sql in [CREATE_TENDERS_SQL, CREATE_PURCHASE_ORDERS_SQL] {
            sqlx::query(sql)
                .execute(&mut conn)
                .await
                .context("creating procurement tables")?;
        }
        conn.close().await.context("closing store")?;
        info!(path = %self.path.display(), "store schema ensured");
        Ok(())
    }

    pub async fn insert_tenders(&self, entries: &[JsonValue]) -> anyhow::Result<UpsertOutcome> {
        self.insert_batch::<TenderRecord>(entries).await
    }

    pub async fn insert_purchase_orders(
        &self,
        entries: &[JsonValue],
    ) -> anyhow::Result<UpsertOutcome> {
        self.insert_batch::<PurchaseOrderRecord>(entries).await
    }

    /// Insert-or-ignore every entry inside one transaction. Entries that cannot be
    /// normalized or written are logged and counted as failed; the rest still land.
    async fn insert_batch<R: StoredRecord>(
        &self,
        entries: &[JsonValue],
    ) -> anyhow::Result<UpsertOutcome> {
        let kind = R::KIND;
        let span = info_span!("upsert", %kind, entries = entries.len());
        async move {
            let mut conn = self.connect(OpenMode::ReadWrite).await?;
            let mut tx = conn.begin().await.context("beginning upsert transaction")?;
            let mut outcome = UpsertOutcome::default();

            for (index, entry) in entries.iter().enumerate() {
                let record = match R::from_listing(entry) {
                    Ok(record) => record,
                    Err(err) => {
                        warn!(index, error = %err, "skipping malformed listing entry");
                        outcome.failed += 1;
                        continue;
                    }
                };

                match record
                    .bind_insert(sqlx::query(R::INSERT_SQL))
                    .execute(&mut *tx)
                    .await
                {
                    Ok(result) if result.rows_affected() > 0 => outcome.inserted += 1,
                    Ok(_) => outcome.ignored += 1,
                    Err(err) => {
                        warn!(index, code = record.code(), error = %err, "failed to insert record");
                        outcome.failed += 1;
                    }
                }
            }

            tx.commit().await.context("committing upsert transaction")?;
            conn.close().await.context("closing store")?;
            info!(
                inserted = outcome.inserted,
                ignored = outcome.ignored,
                failed = outcome.failed,
                "upsert finished"
            );
            Ok(outcome)
        }
        .instrument(span)
        .await
    }

    /// Up to `limit` tenders, latest closing date first; rows without a date sort last.
    pub async fn recent_tenders(&self, limit: usize) -> anyhow::Result<Vec<TenderRecord>> {
        let mut conn = self.connect(OpenMode::ReadOnly).await?;
        let rows = sqlx::query(
            r#"
            SELECT codigo_externo, nombre, estado, fecha_cierre
              FROM licitaciones
             ORDER BY fecha_cierre DESC
             LIMIT ?
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&mut conn)
        .await
        .context("querying recent tenders")?;
        conn.close().await.context("closing store")?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(TenderRecord {
                codigo_externo: row.try_get("codigo_externo")?,
                nombre: row.try_get("nombre")?,
                estado: row.try_get("estado")?,
                fecha_cierre: row.try_get("fecha_cierre")?,
            });
        }
        Ok(out)
    }

    pub async fn tender_by_code(&self, code: &str) -> anyhow::Result<Option<TenderRecord>> {
        let mut conn = self.connect(OpenMode::ReadOnly).await?;
        let row = sqlx::query(
            r#"
            SELECT codigo_externo, nombre, estado, fecha_cierre
              FROM licitaciones
             WHERE codigo_externo = ?
            "#,
        )
        .bind(code)
        .fetch_optional(&mut conn)
        .await
        .context("querying tender by code")?;
        conn.close().await.context("closing store")?;

        row.map(|row| -> anyhow::Result<TenderRecord> {
            Ok(TenderRecord {
                codigo_externo: row.try_get("codigo_externo")?,
                nombre: row.try_get("nombre")?,
                estado: row.try_get("estado")?,
                fecha_cierre: row.try_get("fecha_cierre")?,
            })
        })
        .transpose()
    }

    pub async fn purchase_order_by_code(
        &self,
        code: &str,
    ) -> anyhow::Result<Option<PurchaseOrderRecord>> {
        let mut conn = self.connect(OpenMode::ReadOnly).await?;
        let row = sqlx::query(
            r#"
            SELECT codigo_externo, nombre, estado
              FROM ordenes_compra
             WHERE codigo_externo = ?
            "#,
        )
        .bind(code)
        .fetch_optional(&mut conn)
        .await
        .context("querying purchase order by code")?;
        conn.close().await.context("closing store")?;

        row.map(|row| -> anyhow::Result<PurchaseOrderRecord> {
            Ok(PurchaseOrderRecord {
                codigo_externo: row.try_get("codigo_externo")?,
                nombre: row.try_get("nombre")?,
                estado: row.try_get("estado")?,
            })
        })
        .transpose()
    }

    pub async fn count(&self, kind: ListingKind) -> anyhow::Result<u64> {
        let table = match kind {
            ListingKind::Tenders => TENDERS_TABLE,
            ListingKind::PurchaseOrders => PURCHASE_ORDERS_TABLE,
        };
        let mut conn = self.connect(OpenMode::ReadOnly).await?;
        let count: i64 = sqlx::query(&format!("SELECT COUNT(*) AS n FROM {table}"))
            .fetch_one(&mut conn)
            .await
            .with_context(|| format!("counting rows in {table}"))?
            .try_get("n")?;
        conn.close().await.context("closing store")?;
        Ok(count.max(0) as u64)
    }
}

type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

/// A record kind the store knows how to normalize and insert.
trait StoredRecord: Sized {
    const KIND: ListingKind;
    const INSERT_SQL: &'static str;

    fn from_listing(entry: &JsonValue) -> Result<Self, RecordError>;
    fn bind_insert<'q>(&'q self, query: SqliteQuery<'q>) -> SqliteQuery<'q>;
    fn code(&self) -> &str;
}

impl StoredRecord for TenderRecord {
    const KIND: ListingKind = ListingKind::Tenders;
    const INSERT_SQL: &'static str = r#"
        INSERT OR IGNORE INTO licitaciones (codigo_externo, nombre, estado, fecha_cierre)
        VALUES (?, ?, ?, ?)
    "#;

    fn from_listing(entry: &JsonValue) -> Result<Self, RecordError> {
        TenderRecord::from_listing(entry)
    }

    fn bind_insert<'q>(&'q self, query: SqliteQuery<'q>) -> SqliteQuery<'q> {
        query
            .bind(self.codigo_externo.as_str())
            .bind(self.nombre.as_deref())
            .bind(self.estado)
            .bind(self.fecha_cierre.as_deref())
    }

    fn code(&self) -> &str {
        &self.codigo_externo
    }
}

impl StoredRecord for PurchaseOrderRecord {
    const KIND: ListingKind = ListingKind::PurchaseOrders;
    const INSERT_SQL: &'static str = r#"
        INSERT OR IGNORE INTO ordenes_compra (codigo_externo, nombre, estado)
        VALUES (?, ?, ?)
    "#;

    fn from_listing(entry: &JsonValue) -> Result<Self, RecordError> {
        PurchaseOrderRecord::from_listing(entry)
    }

    fn bind_insert<'q>(&'q self, query: SqliteQuery<'q>) -> SqliteQuery<'q> {
        query
            .bind(self.codigo_externo.as_str())
            .bind(self.nombre.as_deref())
            .bind(self.estado)
    }

    fn code(&self) -> &str {
        &self.codigo_externo
    }
}

/// Query parameters whose values never reach logs or error messages.
const SECRET_QUERY_PARAMS: [&str; 1] = ["ticket"];

/// Render `url` with secret query values masked.
pub fn redact_url(url: &Url) -> String {
    if !url
        .query_pairs()
        .any(|(k, _)| SECRET_QUERY_PARAMS.contains(&k.as_ref()))
    {
        return url.to_string();
    }
    let pairs = url
        .query_pairs()
        .map(|(k, v)| {
            let v = if SECRET_QUERY_PARAMS.contains(&k.as_ref()) {
                "***".to_string()
            } else {
                v.into_owned()
            };
            (k.into_owned(), v)
        })
        .collect::<Vec<_>>();
    let mut redacted = url.clone();
    redacted.query_pairs_mut().clear().extend_pairs(pairs);
    redacted.to_string()
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[source] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Single-shot GET client: one request per call, bounded by the configured timeout.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn fetch_bytes(&self, url: Url) -> Result<FetchedResponse, FetchError> {
        let redacted = redact_url(&url);
        let span = info_span!("http_fetch", url = %redacted);

        async move {
            // reqwest errors carry the full URL; strip it so the ticket stays out of logs.
            let resp = self
                .client
                .get(url)
                .send()
                .await
                .map_err(|err| FetchError::Request(err.without_url()))?;

            let status = resp.status();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: redacted,
                });
            }

            let body = resp
                .bytes()
                .await
                .map_err(|err| FetchError::Request(err.without_url()))?
                .to_vec();
            Ok(FetchedResponse { status, body })
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    async fn fresh_store(dir: &tempfile::TempDir) -> ProcurementStore {
        let store = ProcurementStore::new(dir.path().join("licitaciones.db"));
        store.ensure_schema().await.expect("schema");
        store
    }

    #[tokio::test]
    async fn ensure_schema_is_idempotent_and_keeps_rows() {
        let dir = tempdir().expect("tempdir");
        let store = fresh_store(&dir).await;
        store
            .insert_tenders(&[json!({"CodigoExterno": "1-1-L24"})])
            .await
            .expect("insert");

        store.ensure_schema().await.expect("second ensure");
        assert_eq!(store.count(ListingKind::Tenders).await.unwrap(), 1);
        assert_eq!(store.count(ListingKind::PurchaseOrders).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn ensure_schema_creates_missing_parent_directories() {
        let dir = tempdir().expect("tempdir");
        let store = ProcurementStore::new(dir.path().join("data/nested/store.db"));
        store.ensure_schema().await.expect("schema");
        assert!(store.path().exists());
    }

    #[tokio::test]
    async fn rerunning_the_same_batch_inserts_nothing() {
        let dir = tempdir().expect("tempdir");
        let store = fresh_store(&dir).await;
        let batch = vec![
            json!({"CodigoExterno": "1234-5-L24", "Nombre": "Compra de sillas", "Estado": 5, "FechaCierre": "2024-06-01"}),
            json!({"CodigoExterno": "9876-1-LE24", "Nombre": "Servicio de aseo", "Estado": 6}),
        ];

        let first = store.insert_tenders(&batch).await.expect("first");
        let second = store.insert_tenders(&batch).await.expect("second");

        assert_eq!(first.inserted, 2);
        assert_eq!(second.inserted, 0);
        assert_eq!(second.ignored, 2);
        assert_eq!(store.count(ListingKind::Tenders).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn duplicate_sighting_leaves_existing_row_unchanged() {
        let dir = tempdir().expect("tempdir");
        let store = fresh_store(&dir).await;
        store
            .insert_tenders(&[json!({
                "CodigoExterno": "1234-5-L24",
                "Nombre": "Compra de sillas",
                "Estado": 5,
                "FechaCierre": "2024-06-01"
            })])
            .await
            .expect("first");

        let outcome = store
            .insert_tenders(&[json!({
                "CodigoExterno": "1234-5-L24",
                "Nombre": "Compra de sillas (rectificada)",
                "Estado": 8,
                "FechaCierre": "2024-07-01"
            })])
            .await
            .expect("second");
        assert_eq!(outcome.inserted, 0);

        let row = store.tender_by_code("1234-5-L24").await.unwrap().expect("row");
        assert_eq!(
            row,
            TenderRecord {
                codigo_externo: "1234-5-L24".into(),
                nombre: Some("Compra de sillas".into()),
                estado: Some(5),
                fecha_cierre: Some("2024-06-01".into()),
            }
        );
    }

    #[tokio::test]
    async fn missing_status_is_stored_as_null() {
        let dir = tempdir().expect("tempdir");
        let store = fresh_store(&dir).await;
        let outcome = store
            .insert_tenders(&[json!({"CodigoExterno": "sin-estado", "Nombre": "x"})])
            .await
            .expect("insert");
        assert_eq!(outcome.inserted, 1);
        let row = store.tender_by_code("sin-estado").await.unwrap().expect("row");
        assert_eq!(row.estado, None);
    }

    #[tokio::test]
    async fn purchase_orders_accept_codigo_estado() {
        let dir = tempdir().expect("tempdir");
        let store = fresh_store(&dir).await;
        let outcome = store
            .insert_purchase_orders(&[
                json!({"Codigo": "2097-241-SE24", "Nombre": "Resmas de papel", "CodigoEstado": 6}),
                json!({"CodigoExterno": "2097-242-SE24", "Estado": "4"}),
            ])
            .await
            .expect("insert");
        assert_eq!(outcome.inserted, 2);

        let first = store.purchase_order_by_code("2097-241-SE24").await.unwrap().expect("row");
        let second = store.purchase_order_by_code("2097-242-SE24").await.unwrap().expect("row");
        assert_eq!(first.estado, Some(6));
        assert_eq!(first.nombre.as_deref(), Some("Resmas de papel"));
        assert_eq!(second.estado, Some(4));
    }

    #[tokio::test]
    async fn malformed_entry_does_not_block_the_batch() {
        let dir = tempdir().expect("tempdir");
        let store = fresh_store(&dir).await;
        let outcome = store
            .insert_tenders(&[
                json!({"CodigoExterno": "ok-1"}),
                json!({"Nombre": "sin codigo"}),
                json!({"CodigoExterno": "bad-status", "Estado": "publicada"}),
                json!("not an object"),
                json!({"CodigoExterno": "ok-2", "Estado": 5}),
            ])
            .await
            .expect("insert");

        assert_eq!(
            outcome,
            UpsertOutcome {
                inserted: 2,
                ignored: 0,
                failed: 3
            }
        );
        assert_eq!(outcome.total(), 5);
        assert!(store.tender_by_code("ok-2").await.unwrap().is_some());
        assert!(store.tender_by_code("bad-status").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rejected_statement_does_not_block_the_batch() {
        let dir = tempdir().expect("tempdir");
        let store = fresh_store(&dir).await;
        let mut conn = SqliteConnectOptions::new()
            .filename(store.path())
            .connect()
            .await
            .expect("connect");
        sqlx::query(
            r#"
            CREATE TRIGGER reject_boom BEFORE INSERT ON licitaciones
            WHEN NEW.codigo_externo = 'boom'
            BEGIN
                SELECT RAISE(ABORT, 'rejected by trigger');
            END
            "#,
        )
        .execute(&mut conn)
        .await
        .expect("trigger");
        conn.close().await.expect("close");

        let outcome = store
            .insert_tenders(&[
                json!({"CodigoExterno": "a", "Estado": 5}),
                json!({"CodigoExterno": "boom", "Estado": 5}),
                json!({"CodigoExterno": "c", "Estado": 6}),
            ])
            .await
            .expect("insert");

        assert_eq!(
            outcome,
            UpsertOutcome {
                inserted: 2,
                ignored: 0,
                failed: 1
            }
        );
        assert!(store.tender_by_code("a").await.unwrap().is_some());
        assert!(store.tender_by_code("c").await.unwrap().is_some());
        assert!(store.tender_by_code("boom").await.unwrap().is_none());
        assert_eq!(store.count(ListingKind::Tenders).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn recent_tenders_orders_by_closing_date_desc_and_limits() {
        let dir = tempdir().expect("tempdir");
        let store = fresh_store(&dir).await;
        store
            .insert_tenders(&[
                json!({"CodigoExterno": "mid", "FechaCierre": "2024-05-15"}),
                json!({"CodigoExterno": "undated"}),
                json!({"CodigoExterno": "late", "FechaCierre": "2024-06-30"}),
                json!({"CodigoExterno": "early", "FechaCierre": "2024-01-02"}),
            ])
            .await
            .expect("insert");

        let codes = |rows: Vec<TenderRecord>| {
            rows.into_iter()
                .map(|r| r.codigo_externo)
                .collect::<Vec<_>>()
        };
        assert_eq!(
            codes(store.recent_tenders(10).await.unwrap()),
            vec!["late", "mid", "early", "undated"]
        );
        assert_eq!(codes(store.recent_tenders(2).await.unwrap()), vec!["late", "mid"]);
    }

    #[tokio::test]
    async fn reading_a_missing_store_fails_without_creating_it() {
        let dir = tempdir().expect("tempdir");
        let store = ProcurementStore::new(dir.path().join("absent.db"));
        assert!(store.recent_tenders(5).await.is_err());
        assert!(!store.path().exists());
    }

    #[test]
    fn redact_url_masks_ticket_only() {
        let url = Url::parse(
            "https://api.mercadopublico.cl/servicios/v1/publico/licitaciones.json?fecha=01062024&ticket=SECRET",
        )
        .unwrap();
        let redacted = redact_url(&url);
        assert!(!redacted.contains("SECRET"));
        assert!(redacted.contains("fecha=01062024"));

        let plain = Url::parse("http://localhost/x.json?fecha=01062024").unwrap();
        assert_eq!(redact_url(&plain), plain.to_string());
    }

    #[tokio::test]
    async fn connection_refused_maps_to_request_error() {
        let fetcher = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(2),
            user_agent: None,
        })
        .unwrap();
        let err = fetcher
            .fetch_bytes(Url::parse("http://127.0.0.1:9/licitaciones.json?ticket=SECRET").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Request(_)));
        assert!(!err.to_string().contains("SECRET"));
    }
}
