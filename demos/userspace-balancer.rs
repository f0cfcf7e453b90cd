//! Userspace balancer demo.
//!
//! Mirrors the cluster's Services, Nodes and `EndpointSlice`s into a store,
//! feeds a load-balancing table from it and periodically picks a backend for
//! every known service, the way a connection dispatcher would.
//!
//! # Environment Variables
//!
//! - `SERVICE_PROXY_NAME`: service proxy name to handle (default: unset, handles normal services)
//! - `PICK_INTERVAL_MS`: Milliseconds between rounds of picks (default: 5000)

use std::env;
use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use kube_proxy_sync::{Job, Store, SyncConfig, Table, run_consumer};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{Level, error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into()),
        )
        .init();

    let proxy_name = env::var("SERVICE_PROXY_NAME").unwrap_or_default();
    let pick_interval_ms: u64 = env::var("PICK_INTERVAL_MS")
        .ok()
        .and_then(|i| i.parse().ok())
        .unwrap_or(5000);

    info!("Starting userspace balancer");
    info!("Pick interval: {pick_interval_ms}ms");

    let client = Client::try_default().await?;
    let store = Arc::new(Store::new());
    let table = Arc::new(Table::new());
    let cancel = CancellationToken::new();

    let consumer = tokio::spawn(run_consumer(Arc::clone(&table), store.subscribe()));

    let config = SyncConfig::new().service_proxy_name(proxy_name);
    let job = tokio::spawn(Job::new(Arc::clone(&store), config).run(client, cancel.clone()));

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutting down");
            }

            cancel.cancel();
        });
    }

    let mut rng = rand::rng();

    while !cancel.is_cancelled() {
        for service in table.services() {
            match table.random_endpoint(&service, &mut rng) {
                Some(addr) => info!("{service} -> {addr}"),
                None => info!("{service} -> no endpoint available"),
            }
        }

        tokio::select! {
            () = cancel.cancelled() => {}
            () = sleep(Duration::from_millis(pick_interval_ms)) => {}
        }
    }

    if let Err(e) = job.await? {
        error!("Sync job failed: {e}");
    }

    consumer.await?;
    info!("Stopped with {} services", table.len());

    Ok(())
}
