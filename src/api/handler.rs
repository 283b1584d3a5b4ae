use std::sync::Arc;

use chrono::Utc;
use http::Method;
use tracing::{debug, warn};

use super::models::{SummaryRoute, SummaryWindow};
use crate::error::{AppError, AppResult};
use crate::payments::PaymentService;
use crate::wire::{BufferPool, RequestHead};

pub const PAYMENTS_PATH: &str = "/payments";
pub const SUMMARY_PATH: &str = "/payments-summary";
pub const SUMMARY_LOCK_PATH: &str = "/payments-summary-lock";

/// Largest `POST /payments` body accepted
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub payments: Arc<PaymentService>,
    /// 8 KiB request-head buffers, one per open connection
    pub header_buffers: Arc<BufferPool>,
    /// Body scratch for `POST /payments`
    pub body_buffers: Arc<BufferPool>,
}

/// What a request head maps to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route<'a> {
    Ingest,
    Summary {
        route: SummaryRoute,
        query: Option<&'a str>,
    },
    NotFound,
}

/// `POST /payments` must match exactly; summaries match by path prefix
pub fn route<'a>(head: &RequestHead<'a>) -> Route<'a> {
    if head.method == Method::POST && head.target == PAYMENTS_PATH {
        return Route::Ingest;
    }
    if head.method == Method::GET {
        let path = head.path();
        if path.starts_with(SUMMARY_LOCK_PATH) {
            return Route::Summary {
                route: SummaryRoute::Lock,
                query: head.query(),
            };
        }
        if path.starts_with(SUMMARY_PATH) {
            return Route::Summary {
                route: SummaryRoute::Merged,
                query: head.query(),
            };
        }
    }
    Route::NotFound
}

/// POST /payments - hand the body to the orchestrator; the client is answered
/// `200` without waiting for dispatch
pub fn ingest_payment(state: &AppState, body: &[u8]) {
    match std::str::from_utf8(body) {
        Ok(payload) => state.payments.ingest(payload.to_owned()),
        Err(e) => warn!("Dropping non UTF-8 payment body: {}", e),
    }
}

/// GET /payments-summary and /payments-summary-lock - JSON summary body
pub async fn payments_summary(
    state: &AppState,
    route: SummaryRoute,
    query: Option<&str>,
) -> AppResult<Vec<u8>> {
    let window = SummaryWindow::from_query(query, route, Utc::now())?;
    debug!("📊 {:?} summary for {} .. {}", route, window.from, window.to);

    let summary = match route {
        SummaryRoute::Merged => state.payments.merged_summary(window.from, window.to).await?,
        SummaryRoute::Lock => state.payments.summary_lock(window.from, window.to),
    };

    serde_json::to_vec(&summary).map_err(|e| AppError::Internal(e.to_string()))
}
