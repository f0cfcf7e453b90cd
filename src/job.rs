//! The synchronization job: three watch adapters feeding one store.

use std::fmt::Display;
use std::sync::Arc;

use futures::Stream;
use k8s_openapi::api::core::v1::{Node, Service};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::runtime::WatchStreamExt;
use kube::runtime::watcher::{self, Config as WatcherConfig, Event};
use kube::{Api, Client};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::SyncConfig;
use crate::error::{Error, Result};
use crate::selector::build_selector;
use crate::store::Store;
use crate::watch::{
    EventHandler, NodeNormalizer, PerObject, ServiceNormalizer, SliceNormalizer, drive,
};

/// Watches Services, Nodes and `EndpointSlice`s and mirrors them into a
/// [`Store`].
///
/// The job owns the store's shutdown: it closes the store once cancelled.
#[derive(Debug)]
pub struct Job {
    store: Arc<Store>,
    config: SyncConfig,
}

impl Job {
    /// Creates a job writing to `store`.
    #[must_use]
    pub fn new(store: Arc<Store>, config: SyncConfig) -> Self {
        Self { store, config }
    }

    /// Runs the job against the cluster behind `client` until `cancel` fires.
    ///
    /// The Service watch is restricted server-side to the services this
    /// instance owns; Nodes and `EndpointSlice`s are watched unrestricted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSelector`] or [`Error::InvalidGlob`] before any
    /// watch starts if the configuration is unusable, and [`Error::Join`] if
    /// an adapter task panics.
    pub async fn run(self, client: Client, cancel: CancellationToken) -> Result<()> {
        let selector = build_selector(&self.config.service_proxy_name)?.to_string();
        info!("service label selector: {selector}");

        let services = watcher::watcher(
            Api::<Service>::all(client.clone()),
            WatcherConfig::default().labels(&selector),
        )
        .default_backoff();

        let nodes = watcher::watcher(Api::<Node>::all(client.clone()), WatcherConfig::default())
            .default_backoff();

        let slices = watcher::watcher(Api::<EndpointSlice>::all(client), WatcherConfig::default())
            .default_backoff();

        self.run_with_streams(services, nodes, slices, cancel).await
    }

    /// Runs the job over caller-supplied watch streams until `cancel` fires,
    /// then closes the store and waits for the adapters to stop.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidGlob`] before any adapter starts if a metadata
    /// glob is invalid, and [`Error::Join`] if an adapter task panics.
    pub async fn run_with_streams<SS, NS, ES, E>(
        self,
        services: SS,
        nodes: NS,
        slices: ES,
        cancel: CancellationToken,
    ) -> Result<()>
    where
        SS: Stream<Item = std::result::Result<Event<Service>, E>> + Send + 'static,
        NS: Stream<Item = std::result::Result<Event<Node>, E>> + Send + 'static,
        ES: Stream<Item = std::result::Result<Event<EndpointSlice>, E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let service_normalizer = ServiceNormalizer::new(self.config.service_filter()?);
        let node_normalizer = NodeNormalizer::new(self.config.node_filter()?);

        info!("starting sync job");

        let tasks = [
            tokio::spawn(drive(
                EventHandler::new(Arc::clone(&self.store), PerObject(service_normalizer)),
                services,
                cancel.clone(),
            )),
            tokio::spawn(drive(
                EventHandler::new(Arc::clone(&self.store), PerObject(node_normalizer)),
                nodes,
                cancel.clone(),
            )),
            tokio::spawn(drive(
                EventHandler::new(Arc::clone(&self.store), SliceNormalizer::new()),
                slices,
                cancel.clone(),
            )),
        ];

        cancel.cancelled().await;
        self.store.close();

        for task in tasks {
            match task.await? {
                // An adapter racing the close may still hit the closed store.
                Ok(()) | Err(Error::StoreClosed) => {}
                Err(e) => return Err(e),
            }
        }

        debug!("all watch adapters stopped");
        info!("sync job stopped");
        Ok(())
    }
}
