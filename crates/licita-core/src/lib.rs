//! Core domain model for licita: procurement records, fetch dates and the API credential.

use std::fmt;
use std::str::FromStr;

use chrono::{Days, Local, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "licita-core";

/// Environment variable holding the Mercado Público API ticket.
pub const TICKET_ENV_VAR: &str = "API_TICKET";

/// Store file used when nothing else is configured.
pub const DEFAULT_DB_FILE: &str = "licitaciones.db";

/// Date layout the API expects in the `fecha` query parameter.
pub const FETCH_DATE_FORMAT: &str = "%d%m%Y";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(
        "environment variable {var} is not set; add the Mercado Publico API ticket as a secret (e.g. `export {var}=<ticket>`)"
    )]
    MissingTicket { var: &'static str },
    #[error("invalid fetch date {input:?}: expected DDMMYYYY")]
    InvalidDate { input: String },
}

/// Mercado Público API credential. `Debug` is redacted so the ticket never reaches logs.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiTicket(String);

impl ApiTicket {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Resolve the ticket through `lookup`; absent and blank values are both rejected.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: FnOnce(&str) -> Option<String>,
    {
        match lookup(TICKET_ENV_VAR) {
            Some(value) if !value.trim().is_empty() => Ok(Self(value.trim().to_string())),
            _ => Err(ConfigError::MissingTicket {
                var: TICKET_ENV_VAR,
            }),
        }
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiTicket(***)")
    }
}

/// Calendar day a listing is requested for, rendered as `DDMMYYYY`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FetchDate(NaiveDate);

impl FetchDate {
    pub fn new(date: NaiveDate) -> Self {
        Self(date)
    }

    /// The previous local calendar day; the daily run always looks one day back.
    pub fn yesterday() -> Self {
        let today = Local::now().date_naive();
        Self(today.checked_sub_days(Days::new(1)).unwrap_or(today))
    }

    pub fn date(&self) -> NaiveDate {
        self.0
    }
}

impl fmt::Display for FetchDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(FETCH_DATE_FORMAT))
    }
}

impl FromStr for FetchDate {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.len() != 8 || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ConfigError::InvalidDate {
                input: s.to_string(),
            });
        }
        NaiveDate::parse_from_str(trimmed, FETCH_DATE_FORMAT)
            .map(Self)
            .map_err(|_| ConfigError::InvalidDate {
                input: s.to_string(),
            })
    }
}

/// The two listings the API publishes per day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingKind {
    Tenders,
    PurchaseOrders,
}

impl ListingKind {
    pub fn endpoint(self) -> &'static str {
        match self {
            ListingKind::Tenders => "licitaciones.json",
            ListingKind::PurchaseOrders => "ordenesdecompra.json",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ListingKind::Tenders => "tenders",
            ListingKind::PurchaseOrders => "purchase_orders",
        }
    }
}

impl fmt::Display for ListingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Why a loosely typed listing entry could not become a record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("listing entry is not a JSON object")]
    NotAnObject,
    #[error("listing entry has no external code")]
    MissingCode,
    #[error("field {field} holds a non-integer status: {value}")]
    InvalidStatus { field: &'static str, value: String },
}

/// A published tender ("licitación").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenderRecord {
    pub codigo_externo: String,
    pub nombre: Option<String>,
    pub estado: Option<i64>,
    pub fecha_cierre: Option<String>,
}

impl TenderRecord {
    pub fn from_listing(entry: &JsonValue) -> Result<Self, RecordError> {
        let object = entry.as_object().ok_or(RecordError::NotAnObject)?;
        let codigo_externo = text_field(object.get("CodigoExterno")).ok_or(RecordError::MissingCode)?;
        Ok(Self {
            codigo_externo,
            nombre: text_field(object.get("Nombre")),
            estado: status_field(object)?,
            fecha_cierre: text_field(object.get("FechaCierre")),
        })
    }
}

/// A purchase order ("orden de compra").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseOrderRecord {
    pub codigo_externo: String,
    pub nombre: Option<String>,
    pub estado: Option<i64>,
}

impl PurchaseOrderRecord {
    /// Order listings key entries by `Codigo`; `CodigoExterno` wins when both are present.
    pub fn from_listing(entry: &JsonValue) -> Result<Self, RecordError> {
        let object = entry.as_object().ok_or(RecordError::NotAnObject)?;
        let codigo_externo = text_field(object.get("CodigoExterno"))
            .or_else(|| text_field(object.get("Codigo")))
            .ok_or(RecordError::MissingCode)?;
        Ok(Self {
            codigo_externo,
            nombre: text_field(object.get("Nombre")),
            estado: status_field(object)?,
        })
    }
}

const STATUS_FIELDS: [&str; 2] = ["Estado", "CodigoEstado"];

fn status_field(object: &serde_json::Map<String, JsonValue>) -> Result<Option<i64>, RecordError> {
    for field in STATUS_FIELDS {
        match object.get(field) {
            None | Some(JsonValue::Null) => continue,
            Some(JsonValue::String(s)) if s.trim().is_empty() => continue,
            Some(value) => {
                return parse_status(value).map(Some).ok_or_else(|| RecordError::InvalidStatus {
                    field,
                    value: value.to_string(),
                })
            }
        }
    }
    Ok(None)
}

fn parse_status(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64)),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn text_field(value: Option<&JsonValue>) -> Option<String> {
    match value? {
        JsonValue::Null => None,
        JsonValue::String(s) if s.trim().is_empty() => None,
        JsonValue::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ticket_lookup_rejects_missing_and_blank_values() {
        let missing = ApiTicket::from_lookup(|_| None).unwrap_err();
        assert!(missing.to_string().contains("API_TICKET"));
        assert!(matches!(
            ApiTicket::from_lookup(|_| Some("   ".into())),
            Err(ConfigError::MissingTicket { .. })
        ));
        let ticket = ApiTicket::from_lookup(|name| {
            assert_eq!(name, TICKET_ENV_VAR);
            Some("ABCD-1234".into())
        })
        .unwrap();
        assert_eq!(ticket.expose(), "ABCD-1234");
        assert_eq!(format!("{ticket:?}"), "ApiTicket(***)");
    }

    #[test]
    fn fetch_date_uses_day_month_year_layout() {
        let date: FetchDate = "01062024".parse().unwrap();
        assert_eq!(date.date(), NaiveDate::from_ymd_opt(2024, 6, 1).unwrap());
        assert_eq!(date.to_string(), "01062024");
        assert!("2024-06-01".parse::<FetchDate>().is_err());
        assert!("32012024".parse::<FetchDate>().is_err());
    }

    #[test]
    fn yesterday_is_one_day_before_today() {
        let today = Local::now().date_naive();
        assert_eq!(FetchDate::yesterday().date().succ_opt(), Some(today));
    }

    #[test]
    fn tender_from_listing_reads_all_fields() {
        let tender = TenderRecord::from_listing(&json!({
            "CodigoExterno": "1234-5-L24",
            "Nombre": "Compra de sillas",
            "Estado": 5,
            "FechaCierre": "2024-06-01"
        }))
        .unwrap();
        assert_eq!(
            tender,
            TenderRecord {
                codigo_externo: "1234-5-L24".into(),
                nombre: Some("Compra de sillas".into()),
                estado: Some(5),
                fecha_cierre: Some("2024-06-01".into()),
            }
        );
    }

    #[test]
    fn status_accepts_either_field_name() {
        let by_estado = TenderRecord::from_listing(&json!({"CodigoExterno": "a", "Estado": 8})).unwrap();
        let by_codigo = TenderRecord::from_listing(&json!({"CodigoExterno": "b", "CodigoEstado": "6"})).unwrap();
        let order = PurchaseOrderRecord::from_listing(&json!({"Codigo": "c", "CodigoEstado": 4})).unwrap();
        assert_eq!(by_estado.estado, Some(8));
        assert_eq!(by_codigo.estado, Some(6));
        assert_eq!(order.estado, Some(4));
        assert_eq!(order.codigo_externo, "c");
    }

    #[test]
    fn blank_status_falls_through_to_codigo_estado() {
        let tender = TenderRecord::from_listing(&json!({
            "CodigoExterno": "x",
            "Estado": "",
            "CodigoEstado": 5
        }))
        .unwrap();
        assert_eq!(tender.estado, Some(5));

        let blank_only = TenderRecord::from_listing(&json!({"CodigoExterno": "y", "Estado": "  "})).unwrap();
        assert_eq!(blank_only.estado, None);
    }

    #[test]
    fn missing_status_is_none() {
        let tender = TenderRecord::from_listing(&json!({"CodigoExterno": "x", "Estado": null})).unwrap();
        assert_eq!(tender.estado, None);
        assert_eq!(tender.nombre, None);
        assert_eq!(tender.fecha_cierre, None);
    }

    #[test]
    fn malformed_entries_are_rejected() {
        assert_eq!(TenderRecord::from_listing(&json!([1, 2])), Err(RecordError::NotAnObject));
        assert_eq!(
            TenderRecord::from_listing(&json!({"Nombre": "sin codigo"})),
            Err(RecordError::MissingCode)
        );
        assert!(matches!(
            PurchaseOrderRecord::from_listing(&json!({"Codigo": "c", "Estado": "abierta"})),
            Err(RecordError::InvalidStatus { field: "Estado", .. })
        ));
    }
}
