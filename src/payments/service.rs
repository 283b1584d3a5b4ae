use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::Semaphore;
use tracing::{debug, instrument, warn};

use crate::api::models::PaymentRequest;
use crate::error::{PaymentError, PeerError};
use crate::ledger::models::{PaymentRecord, PaymentSource, PaymentsSummary, ProcessorSummary};
use crate::ledger::repository::LedgerRepository;
use crate::peer::PeerClient;
use crate::processor::{HealthMonitor, PaymentProcessor};
use crate::retry::RetryQueue;

/// Dispatch tasks allowed at once unless configured otherwise
pub const DEFAULT_MAX_IN_FLIGHT: usize = 1024;

/// Payment orchestrator
///
/// Turns accepted payloads into recorded payments: picks a processor by
/// health, dispatches, records the success in the ledger and hands retryable
/// failures to the retry queue. Also serves the summaries.
pub struct PaymentService {
    main: Arc<dyn PaymentProcessor>,
    fallback: Arc<dyn PaymentProcessor>,
    main_health: HealthMonitor,
    fallback_health: HealthMonitor,
    failover: bool,
    ledger: Arc<LedgerRepository>,
    retry_queue: Arc<RetryQueue>,
    dispatch_slots: Arc<Semaphore>,
    max_in_flight: usize,
    peer: Option<PeerClient>,
}

impl PaymentService {
    pub fn new(
        main: Arc<dyn PaymentProcessor>,
        fallback: Arc<dyn PaymentProcessor>,
        main_health: HealthMonitor,
        fallback_health: HealthMonitor,
        ledger: Arc<LedgerRepository>,
        retry_queue: Arc<RetryQueue>,
    ) -> Self {
        Self {
            main,
            fallback,
            main_health,
            fallback_health,
            failover: false,
            ledger,
            retry_queue,
            dispatch_slots: Arc::new(Semaphore::new(DEFAULT_MAX_IN_FLIGHT)),
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            peer: None,
        }
    }

    /// Cap on concurrently running dispatch tasks; the overflow goes to the
    /// retry queue
    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        let max_in_flight = max_in_flight.max(1);
        self.dispatch_slots = Arc::new(Semaphore::new(max_in_flight));
        self.max_in_flight = max_in_flight;
        self
    }

    /// Dispatch to the fallback processor while main is down and fallback is up
    pub fn with_failover(mut self, enabled: bool) -> Self {
        self.failover = enabled;
        self
    }

    /// Sibling instance merged into the public summary
    pub fn with_peer(mut self, peer: Option<PeerClient>) -> Self {
        self.peer = peer;
        self
    }

    #[cfg(test)]
    pub fn main_health(&self) -> &HealthMonitor {
        &self.main_health
    }

    #[cfg(test)]
    pub fn in_flight(&self) -> usize {
        self.max_in_flight - self.dispatch_slots.available_permits()
    }

    #[cfg(test)]
    pub fn ledger(&self) -> &Arc<LedgerRepository> {
        &self.ledger
    }

    /// Accept a raw payload and process it in the background.
    ///
    /// Returns immediately; the caller has already answered its client. At
    /// most `max_in_flight` payloads are dispatched at once. Past that they
    /// wait in the bounded retry queue, which drops when full.
    pub fn ingest(self: &Arc<Self>, payload: String) {
        let permit = match Arc::clone(&self.dispatch_slots).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                debug!("Dispatch saturated, handing payload to the retry queue");
                self.retry_queue.enqueue(payload);
                return;
            }
        };

        let service = Arc::clone(self);
        tokio::spawn(async move {
            let _permit = permit;
            match service.process_payment(&payload).await {
                Ok(()) => {}
                Err(e) if e.is_retryable() => {
                    debug!("Queueing for retry: {}", e);
                    service.retry_queue.enqueue(payload);
                }
                Err(e) => warn!("Dropping payment: {}", e),
            }
        });
    }

    /// Parse, dispatch and record one payload
    #[instrument(skip_all)]
    pub async fn process_payment(&self, payload: &str) -> Result<(), PaymentError> {
        let (correlation_id, amount) = parse_payload(payload)?;
        let processor = self.select_processor().await;

        let timestamp_millis = Utc::now().timestamp_millis();
        let requested_at = DateTime::from_timestamp_millis(timestamp_millis).unwrap_or_else(Utc::now);

        processor
            .process(&correlation_id, amount, requested_at)
            .await
            .map_err(|error| PaymentError::Dispatch {
                processor: processor.source(),
                error,
            })?;

        self.ledger.save(&PaymentRecord {
            source: processor.source(),
            timestamp_millis,
            amount,
            correlation_id,
        });
        Ok(())
    }

    /// Main when up, else fallback if failover allows it, else wait on main
    async fn select_processor(&self) -> &Arc<dyn PaymentProcessor> {
        loop {
            if self.main_health.is_up() {
                return &self.main;
            }
            if self.failover && self.fallback_health.is_up() {
                return &self.fallback;
            }
            self.main_health.wait_until_up().await;
        }
    }

    /// Summary of this instance's ledger only
    pub fn local_summary(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> PaymentsSummary {
        let of = |source: PaymentSource| -> ProcessorSummary {
            self.ledger
                .summary(source, from.timestamp_millis(), to.timestamp_millis())
        };
        PaymentsSummary {
            default: of(PaymentSource::Main),
            fallback: of(PaymentSource::Fallback),
        }
    }

    /// Local summary served to a peer. Pauses local dispatch until the
    /// recovery timer (or the next healthy poll) brings main back up.
    pub fn summary_lock(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> PaymentsSummary {
        self.main_health.mark_down();
        self.local_summary(from, to)
    }

    /// Local summary merged with the peer's, when a peer is configured
    pub async fn merged_summary(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<PaymentsSummary, PeerError> {
        self.main_health.mark_up();

        let merged = match &self.peer {
            None => Ok(self.local_summary(from, to)),
            Some(peer) => {
                let (local, remote) =
                    tokio::join!(async { self.local_summary(from, to) }, peer.get_summary(from, to));
                remote.map(|remote| local.merge(remote))
            }
        };

        self.main_health.mark_up();
        merged
    }

    /// Administrative reset of the ledger
    pub fn purge(&self) {
        self.ledger.purge();
    }
}

/// Largest amount accepted for a single payment (one trillion). Keeps ledger
/// totals far away from `Decimal::MAX`.
pub const MAX_PAYMENT_AMOUNT: Decimal = Decimal::from_parts(3_567_587_328, 232, 0, false, 0);

/// Pull `correlationId` and `amount` out of a raw payload
pub fn parse_payload(payload: &str) -> Result<(String, Decimal), PaymentError> {
    let request: PaymentRequest = serde_json::from_str(payload)
        .map_err(|e| PaymentError::InvalidPayload(e.to_string()))?;

    let correlation_id = request
        .correlation_id
        .ok_or_else(|| PaymentError::InvalidPayload("missing correlationId".into()))?;
    let amount = request
        .amount
        .ok_or_else(|| PaymentError::InvalidPayload("missing amount".into()))?;

    // The downstream body is written without escaping
    if correlation_id
        .chars()
        .any(|c| c == '"' || c == '\\' || c.is_control())
    {
        return Err(PaymentError::InvalidPayload(format!(
            "correlationId {:?} needs escaping",
            correlation_id
        )));
    }

    if amount.is_sign_negative() || amount > MAX_PAYMENT_AMOUNT {
        return Err(PaymentError::InvalidPayload(format!(
            "amount {} outside 0..={}",
            amount, MAX_PAYMENT_AMOUNT
        )));
    }

    Ok((correlation_id, amount))
}
