//! Listing source contract + the Mercado Público API adapter.

use anyhow::{Context, Result};
use async_trait::async_trait;
use licita_core::{ApiTicket, FetchDate, ListingKind};
use licita_storage::{HttpFetcher, Url};
use serde_json::Value as JsonValue;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "licita-adapters";

pub const DEFAULT_API_BASE_URL: &str = "https://api.mercadopublico.cl/servicios/v1/publico";

/// Envelope field carrying the result array.
pub const LISTING_FIELD: &str = "Listado";

/// A daily listing source. Implementations never fail: faults are logged and surface as
/// an empty listing so the remaining work in a run still happens.
#[async_trait]
pub trait ListingSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn fetch_listing(
        &self,
        kind: ListingKind,
        date: FetchDate,
        ticket: &ApiTicket,
    ) -> Vec<JsonValue>;
}

/// Pull the `Listado` array out of a response body. A missing, null or non-array field
/// is an empty listing; only an undecodable body is an error.
pub fn parse_listing(body: &[u8]) -> Result<Vec<JsonValue>, serde_json::Error> {
    let envelope: JsonValue = serde_json::from_slice(body)?;
    Ok(match envelope.get(LISTING_FIELD) {
        Some(JsonValue::Array(items)) => items.clone(),
        _ => Vec::new(),
    })
}

pub struct MercadoPublicoAdapter {
    base_url: Url,
    http: HttpFetcher,
}

impl MercadoPublicoAdapter {
    pub fn new(base_url: &str, http: HttpFetcher) -> Result<Self> {
        let normalized = format!("{}/", base_url.trim_end_matches('/'));
        let base_url =
            Url::parse(&normalized).with_context(|| format!("parsing API base url {base_url}"))?;
        Ok(Self { base_url, http })
    }

    pub fn listing_url(&self, kind: ListingKind, date: FetchDate, ticket: &ApiTicket) -> Result<Url> {
        let mut url = self
            .base_url
            .join(kind.endpoint())
            .with_context(|| format!("building {kind} endpoint url"))?;
        url.query_pairs_mut()
            .append_pair("fecha", &date.to_string())
            .append_pair("ticket", ticket.expose());
        Ok(url)
    }

    pub async fn fetch_tenders(&self, date: FetchDate, ticket: &ApiTicket) -> Vec<JsonValue> {
        self.fetch_listing(ListingKind::Tenders, date, ticket).await
    }

    pub async fn fetch_purchase_orders(&self, date: FetchDate, ticket: &ApiTicket) -> Vec<JsonValue> {
        self.fetch_listing(ListingKind::PurchaseOrders, date, ticket).await
    }
}

#[async_trait]
impl ListingSource for MercadoPublicoAdapter {
    fn source_id(&self) -> &'static str {
        "mercadopublico"
    }

    async fn fetch_listing(
        &self,
        kind: ListingKind,
        date: FetchDate,
        ticket: &ApiTicket,
    ) -> Vec<JsonValue> {
        let url = match self.listing_url(kind, date, ticket) {
            Ok(url) => url,
            Err(err) => {
                warn!(%kind, error = %format!("{err:#}"), "could not build listing url");
                return Vec::new();
            }
        };

        let response = match self.http.fetch_bytes(url).await {
            Ok(response) => response,
            Err(err) => {
                warn!(%kind, %date, error = %err, "error contacting the Mercado Publico API");
                return Vec::new();
            }
        };

        match parse_listing(&response.body) {
            Ok(items) => {
                info!(%kind, %date, records = items.len(), "listing fetched");
                items
            }
            Err(err) => {
                warn!(%kind, %date, error = %err, "response body is not valid listing JSON");
                Vec::new()
            }
        }
    }
}
