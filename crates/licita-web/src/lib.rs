//! Static tender report (askama) + a read-only axum preview of the same page.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use askama::Template;
use axum::{
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use licita_core::{TenderRecord, DEFAULT_DB_FILE};
use licita_storage::ProcurementStore;
use serde::Serialize;
use tokio::fs;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "licita-web";

pub const DEFAULT_REPORT_FILE: &str = "index.html";
pub const DEFAULT_REPORT_LIMIT: usize = 500;

#[derive(Debug, Clone)]
pub struct ReportConfig {
    pub database_path: PathBuf,
    pub output_path: PathBuf,
    pub limit: usize,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from(DEFAULT_DB_FILE),
            output_path: PathBuf::from(DEFAULT_REPORT_FILE),
            limit: DEFAULT_REPORT_LIMIT,
        }
    }
}

impl ReportConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_path: std::env::var("LICITA_DB_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.database_path),
            output_path: std::env::var("LICITA_REPORT_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_path),
            limit: std::env::var("LICITA_REPORT_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|limit| *limit > 0)
                .unwrap_or(defaults.limit),
        }
    }
}

/// Display-ready tender row; NULL columns become empty cells.
#[derive(Debug, Clone)]
struct ReportRow {
    codigo_externo: String,
    nombre: String,
    estado: String,
    fecha_cierre: String,
}

impl From<&TenderRecord> for ReportRow {
    fn from(record: &TenderRecord) -> Self {
        Self {
            codigo_externo: record.codigo_externo.clone(),
            nombre: record.nombre.clone().unwrap_or_default(),
            estado: record.estado.map(|e| e.to_string()).unwrap_or_default(),
            fecha_cierre: record.fecha_cierre.clone().unwrap_or_default(),
        }
    }
}

#[derive(Template)]
#[template(path = "report.html")]
struct ReportTemplate {
    title: String,
    rows: Vec<ReportRow>,
}

pub fn report_title(limit: usize) -> String {
    format!("Últimas {limit} Licitaciones Publicadas")
}

/// Render the report page for `tenders`, titled after the row limit the query used.
pub fn render_report(tenders: &[TenderRecord], limit: usize) -> anyhow::Result<String> {
    let template = ReportTemplate {
        title: report_title(limit),
        rows: tenders.iter().map(ReportRow::from).collect(),
    };
    template.render().context("rendering report template")
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportSummary {
    pub output_path: String,
    pub rows: usize,
    pub bytes: usize,
}

/// Query the latest tenders and (over)write the static report page.
pub async fn generate_report(config: &ReportConfig) -> anyhow::Result<ReportSummary> {
    let store = ProcurementStore::new(config.database_path.clone());
    let tenders = store.recent_tenders(config.limit).await?;
    let html = render_report(&tenders, config.limit)?;
    write_replacing(&config.output_path, html.as_bytes()).await?;
    info!(
        path = %config.output_path.display(),
        rows = tenders.len(),
        "report written"
    );
    Ok(ReportSummary {
        output_path: config.output_path.display().to_string(),
        rows: tenders.len(),
        bytes: html.len(),
    })
}

/// Write through a sibling temp file and rename so readers never see a half-written page.
async fn write_replacing(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating report directory {}", parent.display()))?;

    let file_name = path
        .file_name()
        .with_context(|| format!("report path {} has no file name", path.display()))?;
    let temp_path = parent.join(format!(".{}.tmp", file_name.to_string_lossy()));

    fs::write(&temp_path, bytes)
        .await
        .with_context(|| format!("writing temp report {}", temp_path.display()))?;
    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "renaming temp report {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct AppState {
    pub store: ProcurementStore,
    pub limit: usize,
}

impl AppState {
    pub fn new(store: ProcurementStore, limit: usize) -> Self {
        Self { store, limit }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/tenders.json", get(tenders_json_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding preview server on port {port}"))?;
    info!(port, "serving report preview");
    axum::serve(listener, app(state))
        .await
        .context("running preview server")?;
    Ok(())
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.recent_tenders(state.limit).await {
        Ok(tenders) => match render_report(&tenders, state.limit) {
            Ok(html) => Html(html).into_response(),
            Err(err) => server_error(err),
        },
        Err(err) => server_error(err),
    }
}

async fn tenders_json_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.recent_tenders(state.limit).await {
        Ok(tenders) => Json(tenders).into_response(),
        Err(err) => server_error(err),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = %format!("{err:#}"), "preview request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {err}")),
    )
        .into_response()
}
