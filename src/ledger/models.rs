use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::ops::Add;

/// Processor that settled a payment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentSource {
    Main,
    Fallback,
}

/// A payment accepted by a processor. Never mutated once stored.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentRecord {
    pub source: PaymentSource,
    /// Dispatch time, milliseconds since the Unix epoch
    pub timestamp_millis: i64,
    pub amount: Decimal,
    pub correlation_id: String,
}

/// Aggregate for one processor over a time range
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessorSummary {
    pub total_requests: u64,
    #[serde(with = "rust_decimal::serde::arbitrary_precision")]
    pub total_amount: Decimal,
}

impl Add for ProcessorSummary {
    type Output = ProcessorSummary;

    /// Saturates instead of panicking; a peer's totals are not trusted to be small
    fn add(self, other: ProcessorSummary) -> ProcessorSummary {
        ProcessorSummary {
            total_requests: self.total_requests.saturating_add(other.total_requests),
            total_amount: self.total_amount.saturating_add(other.total_amount),
        }
    }
}

/// Summary payload served on both summary routes. `default` is the main
/// processor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentsSummary {
    pub default: ProcessorSummary,
    pub fallback: ProcessorSummary,
}

impl PaymentsSummary {
    /// Per-processor sum of two instances' local summaries
    pub fn merge(self, other: PaymentsSummary) -> PaymentsSummary {
        PaymentsSummary {
            default: self.default + other.default,
            fallback: self.fallback + other.fallback,
        }
    }
}
