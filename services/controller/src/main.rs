//! vlb-controller
//!
//! Assigns virtual IPs to load-balancer services and keeps an external
//! nginx/keepalived appliance configured to serve them.
//!
//! ## Architecture
//!
//! - **Event Feed**: Tails service changes from the orchestrator
//! - **Worker**: Schedules one reconciliation pass per changed service
//! - **Reconciler**: Allocates addresses and VRIDs, publishes appliance config
//! - **Appliance**: SSH transport (or an in-memory mock for dry runs)

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use vlb_controller::appliance::{Appliance, MockAppliance, SshAppliance};
use vlb_controller::config::Config;
use vlb_controller::feed::{run_event_feed, FeedConfig};
use vlb_controller::ipam::AllocationStore;
use vlb_controller::orchestrator::OrchestratorClient;
use vlb_controller::pool::{load_pool, FilePoolSource};
use vlb_controller::publisher::{Publisher, PublisherSettings};
use vlb_controller::reconciler::{ReconcilerSettings, ServiceReconciler};
use vlb_controller::store::{FileRecordStore, RecordStore};
use vlb_controller::vrid::VridAllocator;
use vlb_controller::worker::{ServiceWorker, WorkerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        tenant = %config.tenant,
        orchestrator_url = %config.orchestrator_url,
        state_dir = %config.state_dir.display(),
        dry_run = config.dry_run,
        "Starting vlb-controller"
    );

    // Durable state and the VIP pool
    let records: Arc<dyn RecordStore> = Arc::new(FileRecordStore::open(&config.state_dir).await?);
    let pool_source = Arc::new(FilePoolSource::new(&config.pool_file));
    let pool = load_pool(pool_source.as_ref())
        .await
        .context("Failed to load VIP pool")?;
    let allocations = Arc::new(
        AllocationStore::load(Arc::clone(&records), pool)
            .await
            .context("Failed to load allocations")?,
    );

    // Appliance transport
    let appliance: Arc<dyn Appliance> = match config.ssh_target() {
        Some(target) if !config.dry_run => {
            info!(host = %target.host, user = %target.user, "Using SSH appliance");
            Arc::new(SshAppliance::new(target))
        }
        _ => {
            warn!("Dry run: appliance changes are only logged");
            Arc::new(MockAppliance::new())
        }
    };

    let publisher_settings = PublisherSettings::new(
        config.tenant.clone(),
        config.network_interface.clone(),
        config.keepalived_auth_pass.clone(),
    );

    // Redundancy identifiers must be settled before any service is touched
    let vrids = Arc::new(
        VridAllocator::load(
            Arc::clone(&records),
            Arc::clone(&appliance),
            config.tenant.clone(),
            publisher_settings.vrid_ledger_path(),
        )
        .await
        .context("Failed to load VRID ledger")?,
    );
    let pair = vrids.bootstrap().await.context("Failed to bootstrap VRIDs")?;
    info!(tenant = %config.tenant, vrids = %pair, "VRIDs ready");

    let publisher = Arc::new(Publisher::new(Arc::clone(&appliance), publisher_settings));
    let orchestrator = Arc::new(OrchestratorClient::new(
        &config.orchestrator_url,
        config.orchestrator_timeout,
    )?);

    let reconciler = Arc::new(ServiceReconciler::new(
        Arc::clone(&allocations),
        Arc::clone(&vrids),
        publisher,
        orchestrator.clone(),
        orchestrator.clone(),
        ReconcilerSettings {
            settle_delay: config.settle_delay,
            backend_retry_delay: config.backend_retry_delay,
        },
    ));

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Start the worker
    let (worker, events_tx) = ServiceWorker::new(
        reconciler,
        WorkerConfig {
            max_concurrent_passes: config.max_concurrent_passes,
            ..WorkerConfig::default()
        },
    );
    let mut worker_handle = tokio::spawn(worker.run(shutdown_rx.clone()));

    // Start the event feed
    let mut feed_handle = tokio::spawn(run_event_feed(
        FeedConfig {
            poll_interval: config.feed_poll_interval,
            fetch_limit: config.feed_limit,
            cursor_file: config.cursor_file.clone(),
        },
        orchestrator,
        events_tx,
        shutdown_rx.clone(),
    ));

    // Reload the pool on SIGHUP
    let reload_handle = tokio::spawn({
        let allocations = Arc::clone(&allocations);
        let pool_source = Arc::clone(&pool_source);
        let mut shutdown_rx = shutdown_rx.clone();
        async move {
            let mut hangup = signal(SignalKind::hangup())?;
            loop {
                tokio::select! {
                    _ = hangup.recv() => {
                        match load_pool(pool_source.as_ref()).await {
                            Ok(pool) => allocations.reload_pool(pool).await,
                            Err(e) => error!(error = %e, "Pool reload failed; keeping current pool"),
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            anyhow::Ok(())
        }
    });

    // Wait for shutdown signal
    let mut feed_done = false;
    let mut worker_done = false;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut feed_handle => {
            feed_done = true;
            match result {
                Ok(Ok(())) => info!("Event feed exited normally"),
                Ok(Err(e)) => error!(error = %e, "Event feed error"),
                Err(e) => error!(error = %e, "Event feed task panicked"),
            }
        }
        _ = &mut worker_handle => {
            worker_done = true;
            info!("Worker exited");
        }
    }

    // Signal shutdown to all tasks
    let _ = shutdown_tx.send(true);

    info!("Waiting for tasks to shut down...");
    let grace = Duration::from_secs(15);
    if !worker_done && tokio::time::timeout(grace, worker_handle).await.is_err() {
        warn!("Worker did not stop in time");
    }
    if !feed_done && tokio::time::timeout(Duration::from_secs(2), feed_handle).await.is_err() {
        warn!("Event feed did not stop in time");
    }
    reload_handle.abort();

    info!("vlb-controller shutdown complete");
    Ok(())
}
