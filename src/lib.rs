#![deny(missing_docs)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Kubernetes state synchronization and endpoint selection for service proxies.
//!
//! A service proxy needs two things from the cluster: a consistent view of
//! the Services it is responsible for, the Nodes and the backends behind each
//! service, and a way to pick one live backend for every new connection
//! without slowing the connection down. This crate provides both:
//!
//! - **[`Job`]** watches Services (restricted server-side to the ones this
//!   instance owns), Nodes and `EndpointSlice`s, and mirrors them as
//!   normalized entries in a [`Store`].
//! - **[`Store`]** is a concurrent keyed map with per-key ordered change
//!   [`Subscription`]s.
//! - **[`Table`]** is fed from a subscription and answers
//!   [`Table::random_endpoint`] with a single atomic load, never taking a lock.
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use kube::Client;
//! use kube_proxy_sync::{Job, ServiceName, Store, SyncConfig, Table, run_consumer};
//! use tokio_util::sync::CancellationToken;
//!
//! let client = Client::try_default().await?;
//! let store = Arc::new(Store::new());
//! let table = Arc::new(Table::new());
//! let cancel = CancellationToken::new();
//!
//! tokio::spawn(run_consumer(Arc::clone(&table), store.subscribe()));
//! tokio::spawn(Job::new(Arc::clone(&store), SyncConfig::default()).run(client, cancel.clone()));
//!
//! // On every accepted connection:
//! let target = table.random_endpoint(&ServiceName::new("default", "web"), &mut rand::rng());
//! ```

mod balancer;
mod config;
mod error;
mod job;
mod selector;
mod store;
mod watch;

pub use balancer::{Endpoint, Service, ServiceName, Table, run_consumer};
pub use config::{DEFAULT_NODE_LABELS, MetadataFilter, SyncConfig};
pub use error::{Error, Result};
pub use job::Job;
pub use selector::{LABEL_HEADLESS_SERVICE, LABEL_SERVICE_PROXY_NAME, build_selector};
pub use store::{
    Change, EndpointInfo, EndpointPort, Kind, NodeInfo, Port, ResourceKey, ServiceInfo,
    ServicePort, Store, StoreEntry, Subscription,
};
pub use watch::{
    EventHandler, Mutation, NodeNormalizer, Normalizer, ObjectNormalizer, PerObject,
    SERVICE_NAME_LABEL, ServiceNormalizer, SliceNormalizer, drive,
};
