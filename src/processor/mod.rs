pub mod client;
pub mod health;
pub mod pool;

pub use client::ProcessorClient;
pub use health::{HealthMonitor, HealthPoller};
pub use pool::ConnectionPool;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::error::ProcessorError;
use crate::ledger::models::PaymentSource;

/// A downstream payment processor
///
/// Implementations never retry on their own; a failed call is reported once
/// and the caller decides whether the payload goes back to the retry queue.
#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    /// Submit one payment. `Ok` only when the processor answered 200.
    async fn process(
        &self,
        correlation_id: &str,
        amount: Decimal,
        requested_at: DateTime<Utc>,
    ) -> Result<(), ProcessorError>;

    /// Ledger side this processor records into
    fn source(&self) -> PaymentSource;
}
