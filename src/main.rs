use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use rentable::config::Config;
use rentable::engine::{Engine, SystemClock};
use rentable::notify::NotifyHub;
use rentable::observability;
use rentable::store::DurableStore;
use rentable::{compactor, wire};

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!("SIGTERM handler unavailable: {e}");
                ctrl_c.await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::from_env()?;
    observability::init(config.metrics_port)?;

    std::fs::create_dir_all(&config.data_dir)?;
    let notify = Arc::new(NotifyHub::new());
    let store = Arc::new(DurableStore::open(config.wal_path(), notify)?);
    let engine = Arc::new(Engine::over_store(store.clone(), Arc::new(SystemClock)));

    let compactor_store = store.clone();
    let threshold = config.compact_threshold;
    tokio::spawn(async move {
        compactor::run_compactor(compactor_store, threshold).await;
    });

    let max_connections = config.max_connections;
    let semaphore = Arc::new(Semaphore::new(max_connections));

    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("rentable listening on {addr}");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  max_connections: {max_connections}");
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let app = App {
        engine,
        store,
        password: config.password.clone(),
        semaphore: semaphore.clone(),
    };
    serve(listener, app).await;

    info!("draining connections...");
    drain(&semaphore, max_connections, Duration::from_secs(10)).await;
    info!("rentable stopped");
    Ok(())
}

struct App {
    engine: Arc<Engine>,
    store: Arc<DurableStore>,
    password: String,
    semaphore: Arc<Semaphore>,
}

/// Accept until a shutdown signal arrives. Each connection holds a permit
/// for its whole life; over the limit, new sockets are closed at once.
async fn serve(listener: TcpListener, app: App) {
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        let (socket, peer) = tokio::select! {
            result = listener.accept() => match result {
                Ok(conn) => conn,
                Err(e) => {
                    error!("accept error: {e}");
                    continue;
                }
            },
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                return;
            }
        };

        let Ok(permit) = app.semaphore.clone().try_acquire_owned() else {
            warn!("connection limit reached, rejecting {peer}");
            metrics::counter!(observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
            continue;
        };

        debug!("connection from {peer}");
        metrics::counter!(observability::CONNECTIONS_TOTAL).increment(1);
        metrics::gauge!(observability::CONNECTIONS_ACTIVE).increment(1.0);
        let engine = app.engine.clone();
        let store = app.store.clone();
        let password = app.password.clone();

        tokio::spawn(async move {
            let _permit = permit;
            if let Err(e) = wire::process_connection(socket, engine, store, password).await {
                error!("connection error from {peer}: {e}");
            }
            metrics::gauge!(observability::CONNECTIONS_ACTIVE).decrement(1.0);
        });
    }
}

/// Wait for every permit to come back, or give up at `deadline`.
async fn drain(semaphore: &Semaphore, max_connections: usize, deadline: Duration) {
    let wait_all = async {
        loop {
            if semaphore.available_permits() == max_connections {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    };
    match tokio::time::timeout(deadline, wait_all).await {
        Ok(()) => info!("all connections drained"),
        Err(_) => {
            let remaining = max_connections - semaphore.available_permits();
            warn!("drain timeout, {remaining} connections still open");
        }
    }
}
