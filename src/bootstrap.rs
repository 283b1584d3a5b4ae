use std::sync::Arc;
use std::time::Duration;

use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tracing::info;

use crate::api::handler::{AppState, MAX_BODY_BYTES};
use crate::config::Config;
use crate::error::AppResult;
use crate::ledger::{LedgerRepository, PaymentSource};
use crate::payments::PaymentService;
use crate::peer::PeerClient;
use crate::processor::{ConnectionPool, HealthMonitor, HealthPoller, ProcessorClient};
use crate::retry::{RetryQueue, RetryWorker};
use crate::transport::Endpoint;
use crate::wire::BufferPool;

/// Request-head buffer per connection
pub const HEADER_BUFFER_SIZE: usize = 8 * 1024;
/// Body read chunk
pub const BODY_CHUNK_SIZE: usize = 64 * 1024;
/// How long `borrow` waits for an idle processor connection before dialing
pub const POOL_BORROW_TIMEOUT: Duration = Duration::from_millis(5);

const IDLE_BUFFERS: usize = 1024;

/// Everything `main` needs to serve and the background tasks it must keep alive
pub struct App {
    pub state: AppState,
    pub background: Vec<JoinHandle<()>>,
}

pub async fn initialize_app_state(config: &Config) -> AppResult<App> {
    info!("Initializing application components ...");

    // Core components
    let ledger = Arc::new(LedgerRepository::new());
    let retry_queue = Arc::new(RetryQueue::new(config.rinha_dlq_buffer_size));
    info!(
        "✅ Ledger and retry queue initialized (capacity {})",
        config.rinha_dlq_buffer_size
    );

    // Processor health
    let main_health = HealthMonitor::new(PaymentSource::Main, config.health_recovery_delay());
    let fallback_health =
        HealthMonitor::new(PaymentSource::Fallback, config.health_recovery_delay());

    // Processor clients
    info!("⚙️  Initializing processor clients...");
    let main = processor_client(
        PaymentSource::Main,
        config.main_processor_address(),
        config.processor_pool_size,
    )
    .await;
    let fallback = processor_client(
        PaymentSource::Fallback,
        config.fallback_processor_address(),
        config.processor_pool_size,
    )
    .await;

    let peer = config.peer_endpoint().map(PeerClient::new);
    match &peer {
        Some(peer) => info!("✅ Peer reconciliation via {}", peer.endpoint()),
        None => info!("⚠️  PEER_SOCKET not set - summaries are local only"),
    }

    let payments = Arc::new(
        PaymentService::new(
            main,
            fallback,
            main_health.clone(),
            fallback_health.clone(),
            ledger,
            retry_queue.clone(),
        )
        .with_failover(config.fallback_enabled)
        .with_max_in_flight(config.max_in_flight)
        .with_peer(peer),
    );
    info!(
        "✅ Payment service initialized (failover {}, {} in flight max)",
        if config.fallback_enabled { "enabled" } else { "disabled" },
        config.max_in_flight
    );

    // Background tasks
    let mut background = Vec::new();
    background.push(
        HealthPoller::new(
            main_health,
            &format!("http://{}", config.main_processor_address()),
            config.health_check_interval(),
        )
        .start(),
    );
    if config.fallback_enabled {
        background.push(
            HealthPoller::new(
                fallback_health,
                &format!("http://{}", config.fallback_processor_address()),
                config.health_check_interval(),
            )
            .start(),
        );
    }
    background.extend(
        RetryWorker::new(retry_queue, payments.clone(), config.rinha_dlq_worker_num).start(),
    );
    background.push(purge_on_signal(payments.clone())?);

    let state = AppState {
        payments,
        header_buffers: BufferPool::new(HEADER_BUFFER_SIZE, IDLE_BUFFERS),
        body_buffers: BufferPool::new(BODY_CHUNK_SIZE.min(MAX_BODY_BYTES), IDLE_BUFFERS),
    };

    info!("✅ Application state initialized");
    Ok(App { state, background })
}

/// Reset the ledger whenever the process receives `SIGUSR1`
pub fn purge_on_signal(payments: Arc<PaymentService>) -> AppResult<JoinHandle<()>> {
    let mut signals = signal(SignalKind::user_defined1())?;
    info!("✅ Ledger purge armed on SIGUSR1");

    Ok(tokio::spawn(async move {
        while signals.recv().await.is_some() {
            info!("🧽 SIGUSR1 received, purging ledger");
            payments.purge();
        }
    }))
}

async fn processor_client(source: PaymentSource, address: String, pool_size: usize) -> Arc<ProcessorClient> {
    let pool = ConnectionPool::new(Endpoint::Tcp(address.clone()), pool_size, POOL_BORROW_TIMEOUT);
    pool.warm_up().await;
    info!("✅ {:?} processor client ready ({})", source, address);
    Arc::new(ProcessorClient::new(source, pool, &address))
}
