use clap::Parser;
use dotenv::dotenv;
use std::{
    sync::Arc,
    time::Duration,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use relayrank::{
    api::{self, AppState},
    cli::Cli,
    config::{Config, LiveConfig},
    discovery::{create_http_client, DiscoveryService, FeedQuery, FofaClient},
    error::AppError,
    persistence::{
        open_store, restore_registry, Checkpointer, MemoryStore, Persistence, LAST_FETCH_KEY,
        LAST_PUSH_KEY, LAST_RESET_KEY,
    },
    probe::HttpProber,
    push::{PushTarget, TailscalePusher},
    scheduler::RecheckScheduler,
    supervisor::{run_periodic, FirstRun, Supervisor},
};

/// How long each background task gets to stop after the signal
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), AppError> {
    // Initialize environment
    dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Parse command-line arguments
    let cli = Cli::parse();

    // Configuration faults are fatal before any loop starts
    let config = Config::from_cli(&cli).map_err(|e| {
        tracing::error!("{}", e);
        e
    })?;

    let store: Arc<dyn Persistence> = match open_store(&config.storage).await {
        Ok(store) => store,
        Err(e) => {
            tracing::warn!("Failed to open persistence store: {}", e);
            tracing::info!("Running in memory-only mode");
            Arc::new(MemoryStore::default())
        }
    };

    let registry = Arc::new(restore_registry(store.as_ref()).await);
    let live_config = Arc::new(LiveConfig::new(config.runtime.clone())?);
    let checkpointer = Arc::new(Checkpointer::new(store.clone(), registry.clone()));
    let http_client = create_http_client(config.request_timeout)?;

    let discovery = Arc::new(DiscoveryService::new(
        Arc::new(FofaClient::new(http_client.clone(), config.feed.clone())),
        registry.clone(),
        checkpointer.clone(),
        FeedQuery::from(&config.feed),
    ));

    let scheduler = Arc::new(RecheckScheduler::new(
        registry.clone(),
        Arc::new(HttpProber::new(config.probe.clone())?),
        live_config.clone(),
        checkpointer.clone(),
    ));

    let push = config.push.as_ref().map(|settings| {
        Arc::new(PushTarget {
            pusher: Arc::new(TailscalePusher::new(
                http_client.clone(),
                settings.base_url.clone(),
            )),
            credentials: settings.credentials.clone(),
        })
    });

    let cancel = CancellationToken::new();
    let mut supervisor = Supervisor::new(cancel.clone());

    {
        let scheduler = scheduler.clone();
        supervisor.spawn("recheck", move |cancel| {
            let scheduler = scheduler.clone();
            async move { scheduler.run(cancel).await }
        });
    }

    {
        let discovery = discovery.clone();
        let store = store.clone();
        let live_config = live_config.clone();
        supervisor.spawn("discovery-refresh", move |cancel| {
            let discovery = discovery.clone();
            let store = store.clone();
            let live_config = live_config.clone();
            async move {
                run_periodic(
                    "discovery refresh",
                    store,
                    LAST_FETCH_KEY,
                    FirstRun::Immediate,
                    move || live_config.schedule().fetch_interval,
                    cancel,
                    move || {
                        let discovery = discovery.clone();
                        async move { discovery.refresh().await.map(|_| ()) }
                    },
                )
                .await
            }
        });
    }

    {
        let discovery = discovery.clone();
        let store = store.clone();
        let live_config = live_config.clone();
        supervisor.spawn("registry-reset", move |cancel| {
            let discovery = discovery.clone();
            let store = store.clone();
            let live_config = live_config.clone();
            async move {
                run_periodic(
                    "registry reset",
                    store,
                    LAST_RESET_KEY,
                    FirstRun::Deferred,
                    move || live_config.schedule().reset_interval,
                    cancel,
                    move || {
                        let discovery = discovery.clone();
                        async move { discovery.try_reset_and_rediscover().await.map(|_| ()) }
                    },
                )
                .await
            }
        });
    }

    if let Some(target) = push.clone() {
        let registry = registry.clone();
        let store = store.clone();
        let live_config = live_config.clone();
        supervisor.spawn("config-push", move |cancel| {
            let target = target.clone();
            let registry = registry.clone();
            let store = store.clone();
            let live_config = live_config.clone();
            async move {
                let interval_config = live_config.clone();
                run_periodic(
                    "configuration push",
                    store,
                    LAST_PUSH_KEY,
                    FirstRun::Deferred,
                    move || interval_config.schedule().push_interval,
                    cancel,
                    move || {
                        let target = target.clone();
                        let registry = registry.clone();
                        let live_config = live_config.clone();
                        async move {
                            target
                                .push_now(&registry, &live_config)
                                .await
                                .map(|_| ())
                        }
                    },
                )
                .await
            }
        });
    } else {
        tracing::info!("No tailnet credentials provided, configuration push disabled");
    }

    let state = AppState {
        registry: registry.clone(),
        config: live_config.clone(),
        discovery: discovery.clone(),
        store: store.clone(),
        push,
    };
    let app = api::router(state, config.enable_admin);

    let listener = tokio::net::TcpListener::bind(&config.bind_address)
        .await
        .map_err(|e| {
            AppError::ServerError(format!("Failed to bind {}: {}", config.bind_address, e))
        })?;
    tracing::info!("Server started at http://{}", config.bind_address);

    // Spawn a background task to handle shutdown signal
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(err) = signal::ctrl_c().await {
                tracing::error!("Error handling shutdown signal: {}", err);
                return;
            }
            tracing::info!("Received shutdown signal, beginning graceful shutdown...");
            cancel.cancel();
        });
    }

    let server_result = axum::serve(listener, app)
        .with_graceful_shutdown({
            let cancel = cancel.clone();
            async move { cancel.cancelled().await }
        })
        .await
        .map_err(|e| AppError::ServerError(e.to_string()));

    tracing::info!("Waiting for background tasks to complete...");
    supervisor.shutdown(SHUTDOWN_TIMEOUT).await;

    // Last checkpoint so probe results since the previous save survive the restart
    checkpointer.checkpoint().await;

    tracing::info!("Shutdown complete");
    server_result
}
