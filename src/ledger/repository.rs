use crossbeam_skiplist::SkipMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tracing::{debug, info};

use crate::ledger::models::{PaymentRecord, PaymentSource, ProcessorSummary};

/// Amounts recorded within one millisecond
type Bucket = Mutex<Vec<Decimal>>;

/// In-memory, time-indexed ledger of accepted payments.
///
/// One ordered concurrent map per processor, keyed by dispatch millisecond.
/// Inserts only lock the bucket they land in, so range scans keep running
/// while dispatch tasks record payments.
pub struct LedgerRepository {
    main: SkipMap<i64, Bucket>,
    fallback: SkipMap<i64, Bucket>,
}

impl LedgerRepository {
    pub fn new() -> Self {
        Self {
            main: SkipMap::new(),
            fallback: SkipMap::new(),
        }
    }

    fn storage(&self, source: PaymentSource) -> &SkipMap<i64, Bucket> {
        match source {
            PaymentSource::Main => &self.main,
            PaymentSource::Fallback => &self.fallback,
        }
    }

    /// Append a payment into its millisecond bucket
    pub fn save(&self, record: &PaymentRecord) {
        let entry = self
            .storage(record.source)
            .get_or_insert_with(record.timestamp_millis, || Mutex::new(Vec::with_capacity(1)));
        entry.value().lock().push(record.amount);

        debug!(
            "💾 Recorded {} on {:?} at {}: {}",
            record.correlation_id, record.source, record.timestamp_millis, record.amount
        );
    }

    /// Count and total of every payment with `from <= timestamp <= to`
    pub fn summary(&self, source: PaymentSource, from_millis: i64, to_millis: i64) -> ProcessorSummary {
        let mut summary = ProcessorSummary::default();
        if from_millis > to_millis {
            return summary;
        }

        for entry in self.storage(source).range(from_millis..=to_millis) {
            let bucket = entry.value().lock();
            summary.total_requests = summary.total_requests.saturating_add(bucket.len() as u64);
            summary.total_amount = bucket
                .iter()
                .fold(summary.total_amount, |total, amount| total.saturating_add(*amount));
        }

        summary
    }

    /// Drop every recorded payment. Not atomic with concurrent readers.
    pub fn purge(&self) {
        self.main.clear();
        self.fallback.clear();
        info!("🗑️  Ledger purged");
    }
}

impl Default for LedgerRepository {
    fn default() -> Self {
        Self::new()
    }
}
