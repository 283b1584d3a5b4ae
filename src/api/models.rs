use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use url::form_urlencoded;

use crate::error::{AppError, AppResult};

// ========== REQUEST MODELS ==========

/// `POST /payments` body. Both fields are checked by the orchestrator so a
/// partial payload can be reported instead of failing deserialization.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequest {
    pub correlation_id: Option<String>,
    /// String or number
    pub amount: Option<Decimal>,
}

/// Which summary a GET asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummaryRoute {
    /// `/payments-summary`: local merged with the peer
    Merged,
    /// `/payments-summary-lock`: local only, for the peer
    Lock,
}

impl SummaryRoute {
    /// Window length used when `from` is absent
    pub fn default_lookback(&self) -> Duration {
        match self {
            SummaryRoute::Merged => Duration::seconds(120),
            SummaryRoute::Lock => Duration::seconds(30),
        }
    }
}

/// Inclusive `[from, to]` range of a summary request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SummaryWindow {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl SummaryWindow {
    /// Read `from`/`to` (RFC 3339, percent-encoded) from a query string.
    /// Missing bounds default to the route's lookback ending at `now`.
    pub fn from_query(query: Option<&str>, route: SummaryRoute, now: DateTime<Utc>) -> AppResult<Self> {
        let mut from = None;
        let mut to = None;

        if let Some(query) = query {
            for (key, value) in form_urlencoded::parse(query.as_bytes()) {
                match key.as_ref() {
                    "from" => from = Some(parse_timestamp("from", &value)?),
                    "to" => to = Some(parse_timestamp("to", &value)?),
                    _ => {}
                }
            }
        }

        Ok(Self {
            from: from.unwrap_or(now - route.default_lookback()),
            to: to.unwrap_or(now),
        })
    }
}

fn parse_timestamp(name: &str, value: &str) -> AppResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| AppError::BadRequest(format!("invalid `{}` timestamp {:?}: {}", name, value, e)))
}
