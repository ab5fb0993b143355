//! taskrun controller
//!
//! Watches `Task` objects and runs one short-lived child pod per task,
//! then removes finished pods once they age past the retention window.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use taskrun_api::core_v1::{self, Pod};
use taskrun_api::v1::{self, Task};
use taskrun_api::Scheme;
use taskrun_client::{ClientConfig, HttpClient, Informer};
use taskrun_controller::{
    cleanup::CleanupWorkerConfig, clock::SystemClock, config::Config, Controller, ControllerConfig,
    ControllerDeps,
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_args();

    // Prefer RUST_LOG, fall back to the configured level
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting taskrun controller");
    info!(master = %config.master, "Configuration loaded");

    let mut scheme = Scheme::new();
    v1::add_to_scheme(&mut scheme);
    core_v1::add_to_scheme(&mut scheme);

    let client = Arc::new(HttpClient::new(
        ClientConfig {
            base_url: config.master.clone(),
            token: config.load_token()?,
            timeout: config.request_timeout(),
        },
        Arc::new(scheme),
    )?);

    let task_informer = Arc::new(Informer::<Task>::new(client.clone(), config.resync()));
    let pod_informer = Arc::new(Informer::<Pod>::new(client.clone(), Duration::ZERO));

    let controller = Controller::new(
        ControllerDeps {
            task_informer: Arc::clone(&task_informer),
            pod_informer: Arc::clone(&pod_informer),
            task_api: client.clone(),
            pod_api: client,
            clock: Arc::new(SystemClock),
        },
        ControllerConfig {
            reconcile_period: config.reconcile_period(),
            cleanup: CleanupWorkerConfig {
                interval: config.gc_period(),
                child_retention: config.child_retention(),
            },
            child_image: config.child_image.clone(),
        },
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let task_informer_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move { task_informer.run(shutdown_rx).await }
    });
    let pod_informer_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move { pod_informer.run(shutdown_rx).await }
    });

    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Received shutdown signal");
        let _ = shutdown_tx.send(true);

        wait_for_signal().await;
        warn!("Received second shutdown signal, exiting");
        std::process::exit(1);
    });

    let result = controller.run(shutdown_rx).await;

    let shutdown_timeout = Duration::from_secs(10);
    if let Err(e) = tokio::time::timeout(shutdown_timeout, task_informer_handle).await {
        warn!(error = %e, "Task informer did not shut down in time");
    }
    if let Err(e) = tokio::time::timeout(shutdown_timeout, pod_informer_handle).await {
        warn!(error = %e, "Pod informer did not shut down in time");
    }

    if let Err(e) = result {
        error!(error = %e, "Error running controller");
        return Err(e.into());
    }

    info!("Controller exited");
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM.
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
