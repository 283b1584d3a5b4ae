// Processor Health Monitor
//
// Two states, Up and Down:
// - A poller hits GET /payments/service-health on a fixed interval
// - Going Down arms a one-shot recovery timer that forces Up afterwards,
//   so a false negative never blocks dispatch for longer than the delay
// - At most one recovery timer is armed per monitor
// - Going Up disarms the timer and wakes every waiter

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::ledger::models::PaymentSource;

pub const HEALTH_PATH: &str = "/payments/service-health";

struct RecoveryTimer {
    deadline: Instant,
    handle: JoinHandle<()>,
}

struct HealthState {
    is_up: bool,
    recovery: Option<RecoveryTimer>,
}

struct Inner {
    source: PaymentSource,
    recovery_delay: Duration,
    state: Mutex<HealthState>,
    up_tx: watch::Sender<bool>,
}

/// Up/Down tracker for one processor. Clones share the same state.
#[derive(Clone)]
pub struct HealthMonitor {
    inner: Arc<Inner>,
}

impl HealthMonitor {
    /// New monitor, initially Up
    pub fn new(source: PaymentSource, recovery_delay: Duration) -> Self {
        let (up_tx, _) = watch::channel(true);
        Self {
            inner: Arc::new(Inner {
                source,
                recovery_delay,
                state: Mutex::new(HealthState {
                    is_up: true,
                    recovery: None,
                }),
                up_tx,
            }),
        }
    }

    pub fn source(&self) -> PaymentSource {
        self.inner.source
    }

    pub fn is_up(&self) -> bool {
        self.inner.state.lock().is_up
    }

    /// Suspend until the monitor is Up
    pub async fn wait_until_up(&self) {
        let mut rx = self.inner.up_tx.subscribe();
        // The sender lives in `inner`, which we hold, so this cannot fail
        let _ = rx.wait_for(|up| *up).await;
    }

    /// Go Down, arming the recovery timer unless one is already armed
    pub fn mark_down(&self) {
        let mut state = self.inner.state.lock();
        if state.is_up {
            state.is_up = false;
            self.inner.up_tx.send_replace(false);
            info!("🔴 {:?} processor marked down", self.inner.source);
        }

        if state.recovery.is_none() {
            let deadline = Instant::now() + self.inner.recovery_delay;
            let monitor = self.clone();
            let handle = tokio::spawn(async move {
                tokio::time::sleep_until(deadline).await;
                monitor.recover(deadline);
            });
            state.recovery = Some(RecoveryTimer { deadline, handle });
        }
    }

    /// Go Up, disarming any pending recovery timer
    pub fn mark_up(&self) {
        let mut state = self.inner.state.lock();
        if let Some(timer) = state.recovery.take() {
            timer.handle.abort();
        }
        self.set_up(&mut state);
    }

    /// Deadline of the armed recovery timer, if any
    #[cfg(test)]
    pub fn recovery_deadline(&self) -> Option<Instant> {
        self.inner.state.lock().recovery.as_ref().map(|t| t.deadline)
    }

    /// Timer expiry. A timer disarmed after it woke finds a different (or no)
    /// deadline armed and leaves the state alone.
    fn recover(&self, deadline: Instant) {
        let mut state = self.inner.state.lock();
        if state.recovery.as_ref().map(|t| t.deadline) != Some(deadline) {
            return;
        }
        state.recovery = None;
        if !state.is_up {
            debug!("⏱️  Recovery timer fired for {:?}", self.inner.source);
        }
        self.set_up(&mut state);
    }

    fn set_up(&self, state: &mut HealthState) {
        if !state.is_up {
            state.is_up = true;
            self.inner.up_tx.send_replace(true);
            info!("🟢 {:?} processor marked up", self.inner.source);
        }
    }
}

#[derive(Debug, Deserialize)]
struct ServiceHealth {
    failing: bool,
}

/// Background poller feeding a `HealthMonitor`
pub struct HealthPoller {
    monitor: HealthMonitor,
    http: reqwest::Client,
    url: String,
    period: Duration,
}

impl HealthPoller {
    pub fn new(monitor: HealthMonitor, base_url: &str, period: Duration) -> Self {
        Self {
            monitor,
            http: reqwest::Client::builder()
                .timeout(period)
                .build()
                .unwrap_or_default(),
            url: format!("{}{}", base_url.trim_end_matches('/'), HEALTH_PATH),
            period,
        }
    }

    /// Start polling (runs in background)
    pub fn start(self) -> JoinHandle<()> {
        info!(
            "🩺 Polling {} every {}ms for {:?}",
            self.url,
            self.period.as_millis(),
            self.monitor.source()
        );

        tokio::spawn(async move {
            let mut ticker = interval(self.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.poll_once().await;
            }
        })
    }

    /// One health probe, applied to the monitor
    pub async fn poll_once(&self) {
        if self.probe().await {
            self.monitor.mark_up();
        } else {
            self.monitor.mark_down();
        }
    }

    async fn probe(&self) -> bool {
        let response = match self.http.get(&self.url).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!("Health check for {:?} failed: {}", self.monitor.source(), e);
                return false;
            }
        };

        if response.status() != reqwest::StatusCode::OK {
            warn!(
                "Health check for {:?} answered {}",
                self.monitor.source(),
                response.status()
            );
            return false;
        }

        match response.json::<ServiceHealth>().await {
            Ok(health) => !health.failing,
            Err(e) => {
                warn!("Unreadable health body for {:?}: {}", self.monitor.source(), e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const DELAY: Duration = Duration::from_millis(5040);

    #[tokio::test(start_paused = true)]
    async fn test_starts_up() {
        let monitor = HealthMonitor::new(PaymentSource::Main, DELAY);
        assert!(monitor.is_up());
        assert!(monitor.recovery_deadline().is_none());
        monitor.wait_until_up().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_timer_forces_up() {
        let monitor = HealthMonitor::new(PaymentSource::Main, DELAY);
        monitor.mark_down();
        assert!(!monitor.is_up());

        tokio::time::sleep(Duration::from_millis(5000)).await;
        assert!(!monitor.is_up());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(monitor.is_up());
        assert!(monitor.recovery_deadline().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_down_keeps_first_deadline() {
        let monitor = HealthMonitor::new(PaymentSource::Main, DELAY);
        monitor.mark_down();
        let first = monitor.recovery_deadline().unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;
        monitor.mark_down();
        assert_eq!(monitor.recovery_deadline(), Some(first));

        // Still recovers at the first deadline
        tokio::time::sleep_until(first + Duration::from_millis(1)).await;
        tokio::task::yield_now().await;
        assert!(monitor.is_up());
    }

    #[tokio::test(start_paused = true)]
    async fn test_mark_up_disarms_timer_and_wakes_waiters() {
        let monitor = HealthMonitor::new(PaymentSource::Fallback, DELAY);
        monitor.mark_down();

        let waiter = {
            let monitor = monitor.clone();
            tokio::spawn(async move { monitor.wait_until_up().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        monitor.mark_up();
        waiter.await.unwrap();
        assert!(monitor.recovery_deadline().is_none());

        // A later down arms a fresh timer
        tokio::time::sleep(Duration::from_secs(1)).await;
        monitor.mark_down();
        let deadline = monitor.recovery_deadline().unwrap();
        assert!(deadline >= Instant::now() + DELAY - Duration::from_millis(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_released_by_recovery() {
        let monitor = HealthMonitor::new(PaymentSource::Main, DELAY);
        monitor.mark_down();

        let started = Instant::now();
        monitor.wait_until_up().await;
        assert!(started.elapsed() >= DELAY);
    }

    /// One-shot health endpoint answering every request with `response`
    async fn health_endpoint(response: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let _ = stream.write_all(response.as_bytes()).await;
            }
        });
        base
    }

    #[tokio::test]
    async fn test_poll_applies_failing_flag() {
        let monitor = HealthMonitor::new(PaymentSource::Main, DELAY);

        let failing = health_endpoint(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 16\r\nConnection: close\r\n\r\n{\"failing\":true}",
        )
        .await;
        HealthPoller::new(monitor.clone(), &failing, Duration::from_secs(5))
            .poll_once()
            .await;
        assert!(!monitor.is_up());

        let healthy = health_endpoint(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 17\r\nConnection: close\r\n\r\n{\"failing\":false}",
        )
        .await;
        HealthPoller::new(monitor.clone(), &healthy, Duration::from_secs(5))
            .poll_once()
            .await;
        assert!(monitor.is_up());
        assert!(monitor.recovery_deadline().is_none());
    }

    #[tokio::test]
    async fn test_poll_treats_errors_as_down() {
        let monitor = HealthMonitor::new(PaymentSource::Main, DELAY);
        let throttled = health_endpoint(
            "HTTP/1.1 429 Too Many Requests\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;
        HealthPoller::new(monitor.clone(), &throttled, Duration::from_secs(5))
            .poll_once()
            .await;
        assert!(!monitor.is_up());
        monitor.mark_up();

        let garbage = health_endpoint(
            "HTTP/1.1 200 OK\r\nContent-Length: 3\r\nConnection: close\r\n\r\nnah",
        )
        .await;
        HealthPoller::new(monitor.clone(), &garbage, Duration::from_secs(5))
            .poll_once()
            .await;
        assert!(!monitor.is_up());
    }
}
