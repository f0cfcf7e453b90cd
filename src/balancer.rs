//! Per-service endpoint lists for connection dispatch.
//!
//! Each [`Service`] publishes its endpoints as an immutable list behind an
//! [`ArcSwap`]. Dispatch takes one snapshot with a single atomic load and
//! never blocks; membership changes build a new list and swap it in, so a
//! reader holding an older snapshot keeps seeing a complete, valid list.
//!
//! The [`Table`] is fed from store [`Change`]s by [`run_consumer`]. Per-service
//! lists publish through [`ArcSwap::rcu`], so concurrent writers to one
//! [`Service`] never lose updates. [`Table`] writers additionally serialize on
//! a writer lock, since dropping an emptied service from the index must not
//! race an insert into it. Readers never take that lock.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, info, trace};

use crate::store::{Change, EndpointInfo, Kind, ResourceKey, Subscription};

/// Name of a load-balanced service.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceName {
    /// Namespace of the service.
    pub namespace: String,
    /// Name of the service.
    pub name: String,
}

impl ServiceName {
    /// Creates a service name.
    #[must_use]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// The service owning an endpoint key.
    #[must_use]
    pub fn of(key: &ResourceKey) -> Self {
        Self::new(key.namespace.clone(), key.name.clone())
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// One dispatch target of a service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    /// Key of the backing endpoint record.
    pub key: ResourceKey,
    /// Address to dial.
    pub address: IpAddr,
}

/// The operational view of a service.
#[derive(Debug)]
pub struct Service {
    name: ServiceName,
    endpoints: ArcSwap<Vec<Endpoint>>,
}

impl Service {
    /// Creates a service without endpoints.
    #[must_use]
    pub fn new(name: ServiceName) -> Self {
        Self {
            name,
            endpoints: ArcSwap::from_pointee(Vec::new()),
        }
    }

    /// Name of the service.
    #[must_use]
    pub fn name(&self) -> &ServiceName {
        &self.name
    }

    /// Publishes a list with `candidate` added under `key`.
    ///
    /// A candidate without an address is ignored. An existing endpoint with
    /// the same key is replaced in place rather than duplicated.
    pub fn add_endpoint(&self, key: &ResourceKey, candidate: &EndpointInfo) {
        let Some(address) = candidate.first_address() else {
            trace!(service = %self.name, %key, "ignoring endpoint without address");
            return;
        };

        self.endpoints.rcu(|current| {
            let mut next = Vec::with_capacity(current.len() + 1);
            let mut replaced = false;

            for ep in current.iter() {
                if ep.key == *key {
                    replaced = true;
                    next.push(Endpoint {
                        key: key.clone(),
                        address,
                    });
                } else {
                    next.push(ep.clone());
                }
            }

            if !replaced {
                next.push(Endpoint {
                    key: key.clone(),
                    address,
                });
            }

            next
        });

        debug!(service = %self.name, %key, %address, "added endpoint");
    }

    /// Publishes a list without the endpoint stored under `key`.
    pub fn delete_endpoint(&self, key: &ResourceKey) {
        if !self.endpoints.load().iter().any(|ep| ep.key == *key) {
            return;
        }

        self.endpoints.rcu(|current| {
            current
                .iter()
                .filter(|ep| ep.key != *key)
                .cloned()
                .collect::<Vec<_>>()
        });

        debug!(service = %self.name, %key, "deleted endpoint");
    }

    /// Picks an endpoint address uniformly at random.
    ///
    /// Returns `None` if the service has no endpoints.
    pub fn random_endpoint<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<IpAddr> {
        let endpoints = self.endpoints.load();

        if endpoints.is_empty() {
            return None;
        }

        Some(endpoints[rng.random_range(0..endpoints.len())].address)
    }

    /// The current endpoint list.
    #[must_use]
    pub fn endpoints(&self) -> Arc<Vec<Endpoint>> {
        self.endpoints.load_full()
    }

    /// Number of endpoints.
    #[must_use]
    pub fn len(&self) -> usize {
        self.endpoints.load().len()
    }

    /// Whether the service has no endpoints.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.endpoints.load().is_empty()
    }
}

/// Services by name, as consumed by connection dispatch.
#[derive(Debug, Default)]
pub struct Table {
    services: ArcSwap<HashMap<ServiceName, Arc<Service>>>,
    writer: Mutex<()>,
}

impl Table {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up a service.
    #[must_use]
    pub fn service(&self, name: &ServiceName) -> Option<Arc<Service>> {
        self.services.load().get(name).cloned()
    }

    /// Picks an endpoint of `name` uniformly at random.
    ///
    /// Returns `None` for unknown services and services without endpoints.
    pub fn random_endpoint<R: Rng + ?Sized>(
        &self,
        name: &ServiceName,
        rng: &mut R,
    ) -> Option<IpAddr> {
        self.services.load().get(name)?.random_endpoint(rng)
    }

    /// Names of all services with at least one endpoint, sorted.
    #[must_use]
    pub fn services(&self) -> Vec<ServiceName> {
        let mut names: Vec<_> = self.services.load().keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of services with at least one endpoint.
    #[must_use]
    pub fn len(&self) -> usize {
        self.services.load().len()
    }

    /// Whether the table has no services.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.services.load().is_empty()
    }

    /// Adds an endpoint to the service owning `key`.
    pub fn add_endpoint(&self, key: &ResourceKey, candidate: &EndpointInfo) {
        if candidate.first_address().is_none() {
            trace!(%key, "ignoring endpoint without address");
            return;
        }

        let _writer = self.writer.lock();
        self.service_entry(&ServiceName::of(key)).add_endpoint(key, candidate);
    }

    /// Removes an endpoint, dropping its service once it has none left.
    pub fn delete_endpoint(&self, key: &ResourceKey) {
        let name = ServiceName::of(key);
        let _writer = self.writer.lock();

        let Some(service) = self.service(&name) else {
            return;
        };

        service.delete_endpoint(key);

        if service.is_empty() {
            self.services.rcu(|current| {
                let mut next = HashMap::clone(current);
                next.remove(&name);
                next
            });

            debug!(service = %name, "removed service without endpoints");
        }
    }

    /// Applies a store change; non-endpoint changes are ignored.
    pub fn apply(&self, change: &Change) {
        if change.key().kind != Kind::Endpoint {
            return;
        }

        match change {
            Change::Set { key, entry } => {
                if let Some(info) = entry.as_endpoint() {
                    self.add_endpoint(key, info);
                }
            }

            Change::Delete { key } => self.delete_endpoint(key),
        }
    }

    fn service_entry(&self, name: &ServiceName) -> Arc<Service> {
        if let Some(service) = self.service(name) {
            return service;
        }

        let created = Arc::new(Service::new(name.clone()));

        self.services.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.entry(name.clone())
                .or_insert_with(|| Arc::clone(&created));
            next
        });

        debug!(service = %name, "added service");
        self.service(name).unwrap_or(created)
    }
}

/// Keeps `table` in sync with a store subscription until the store closes.
pub async fn run_consumer(table: Arc<Table>, mut subscription: Subscription) {
    info!("starting load-balancing table consumer");

    while let Some(change) = subscription.recv().await {
        table.apply(&change);
    }

    info!(services = table.len(), "store closed, stopping load-balancing table consumer");
}
