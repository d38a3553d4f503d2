use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};

use costgate::gateway::{run_retention_cleanup, UsageSink};
use costgate::server::{self, AppState};
use costgate::storage::Store;
use costgate::{Config, Gateway, GatewayError};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> costgate::Result<()> {
    let mut config_path = "config.yaml".to_string();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                config_path = args
                    .next()
                    .ok_or_else(|| GatewayError::Config("missing value for --config".into()))?;
            }
            "--help" | "-h" => {
                println!("usage: costgate [--config config.yaml]");
                return Ok(());
            }
            other => {
                return Err(GatewayError::Config(format!("unknown arg: {other}")));
            }
        }
    }

    let config = Config::load(&config_path)?;
    init_tracing(config.debug);

    let store: Option<Arc<dyn Store>> = if config.save_usage {
        Some(costgate::storage::open(&config.storage_type, &config.storage_uri).await?)
    } else {
        None
    };

    let sink = UsageSink::new(store.clone());
    let gateway = Arc::new(Gateway::new(&config, sink)?);
    let state = AppState::new(gateway, store.clone(), &config.api_keys);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let cleanup = match store {
        Some(store) if config.cleanup_enabled => Some(tokio::spawn(run_retention_cleanup(
            store,
            config.retention_days,
            Duration::from_secs(u64::from(config.cleanup_interval_hours) * 3600),
            shutdown_rx.clone(),
        ))),
        _ => None,
    };

    let app = server::router(state);
    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    info!("listening on {}", config.listen);

    let mut serve_rx = shutdown_rx.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = serve_rx.wait_for(|stopped| *stopped).await;
            })
            .await
    });

    shutdown_signal().await;
    info!("shutting down");
    let _ = shutdown_tx.send(true);

    match tokio::time::timeout(SHUTDOWN_GRACE, server).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(err))) => error!("server exited with error: {err}"),
        Ok(Err(err)) => error!("server task failed: {err}"),
        Err(_) => warn!("graceful shutdown timed out, aborting open connections"),
    }

    if let Some(cleanup) = cleanup {
        let _ = tokio::time::timeout(Duration::from_secs(1), cleanup).await;
    }

    Ok(())
}

fn init_tracing(debug: bool) {
    let default_filter = if debug { "costgate=debug,info" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => error!("install SIGTERM handler: {err}"),
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
