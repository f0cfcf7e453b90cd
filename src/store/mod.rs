//! In-memory keyed store of normalized cluster resources.
//!
//! The store is written concurrently by the watch adapters and read by
//! proxier backends through [`Subscription`]s. Writes to one key are
//! serialized (the key's shard stays locked while subscribers are notified),
//! so every subscriber observes the changes of a key in commit order. No
//! ordering is promised across keys.
//!
//! Closing the store is final: later writes fail with
//! [`Error::StoreClosed`] and every subscription ends.

mod entry;
mod key;

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::Stream;
use parking_lot::RwLock;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, trace};

pub use entry::{
    EndpointInfo, EndpointPort, NodeInfo, Port, ServiceInfo, ServicePort, StoreEntry,
};
pub use key::{Kind, ResourceKey};

use crate::error::{Error, Result};

/// A committed store mutation, as seen by subscribers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Change {
    /// `key` now maps to `entry` (added or replaced).
    Set {
        /// Affected key.
        key: ResourceKey,
        /// New value.
        entry: Arc<StoreEntry>,
    },
    /// `key` was removed.
    Delete {
        /// Affected key.
        key: ResourceKey,
    },
}

impl Change {
    /// The key this change applies to.
    #[must_use]
    pub fn key(&self) -> &ResourceKey {
        match self {
            Self::Set { key, .. } | Self::Delete { key } => key,
        }
    }
}

type Subscribers = Vec<UnboundedSender<Change>>;

/// Concurrent keyed store with change notification.
#[derive(Debug)]
pub struct Store {
    entries: DashMap<ResourceKey, Arc<StoreEntry>>,
    /// `None` once the store is closed.
    subscribers: RwLock<Option<Subscribers>>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    /// Creates an open, empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            subscribers: RwLock::new(Some(Vec::new())),
        }
    }

    /// Inserts or replaces the entry for `key` and notifies subscribers.
    ///
    /// Setting an unchanged value still produces a notification.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreClosed`] after [`Store::close`].
    pub fn set(&self, key: ResourceKey, entry: StoreEntry) -> Result<()> {
        let subscribers = self.subscribers.read();
        let Some(subscribers) = subscribers.as_ref() else {
            return Err(Error::StoreClosed);
        };

        let entry = Arc::new(entry);

        match self.entries.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                occupied.insert(Arc::clone(&entry));
                debug!(%key, "updated entry");
                notify(subscribers, &Change::Set { key, entry });
            }

            Entry::Vacant(vacant) => {
                let _guard = vacant.insert(Arc::clone(&entry));
                debug!(%key, "added entry");
                notify(subscribers, &Change::Set { key, entry });
            }
        }

        Ok(())
    }

    /// Removes the entry for `key`, notifying subscribers only if one existed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreClosed`] after [`Store::close`].
    pub fn delete(&self, key: &ResourceKey) -> Result<()> {
        let subscribers = self.subscribers.read();
        let Some(subscribers) = subscribers.as_ref() else {
            return Err(Error::StoreClosed);
        };

        if let Entry::Occupied(occupied) = self.entries.entry(key.clone()) {
            notify(subscribers, &Change::Delete { key: key.clone() });
            occupied.remove();
            debug!(%key, "deleted entry");
        } else {
            trace!(%key, "delete of absent entry");
        }

        Ok(())
    }

    /// Returns the committed entry for `key`.
    #[must_use]
    pub fn get(&self, key: &ResourceKey) -> Option<Arc<StoreEntry>> {
        self.entries.get(key).map(|r| Arc::clone(r.value()))
    }

    /// Returns the keys of every entry of `kind`, sorted.
    #[must_use]
    pub fn keys_of(&self, kind: Kind) -> Vec<ResourceKey> {
        let mut keys: Vec<_> = self
            .entries
            .iter()
            .filter(|r| r.key().kind == kind)
            .map(|r| r.key().clone())
            .collect();

        keys.sort();
        keys
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether [`Store::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.subscribers.read().is_none()
    }

    /// Subscribes to changes.
    ///
    /// The subscription first receives a [`Change::Set`] for every current
    /// entry, then every later change. On a closed store it ends immediately.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscribers = self.subscribers.write();

        // Writers hold the read lock, so the replay below is a consistent view.
        if let Some(subscribers) = subscribers.as_mut() {
            for item in self.entries.iter() {
                let _ = tx.send(Change::Set {
                    key: item.key().clone(),
                    entry: Arc::clone(item.value()),
                });
            }

            subscribers.retain(|s| !s.is_closed());
            subscribers.push(tx);
            debug!(subscribers = subscribers.len(), "added store subscriber");
        }

        Subscription { receiver: rx }
    }

    /// Closes the store. Idempotent.
    ///
    /// Pending and future writes fail and all subscriptions end once they
    /// have drained the changes committed before the close.
    pub fn close(&self) {
        if self.subscribers.write().take().is_some() {
            info!(entries = self.entries.len(), "store closed");
        }
    }
}

fn notify(subscribers: &Subscribers, change: &Change) {
    for subscriber in subscribers {
        // A dropped subscription is pruned on the next subscribe.
        let _ = subscriber.send(change.clone());
    }
}

/// Receiving half of a [`Store::subscribe`] call.
#[derive(Debug)]
pub struct Subscription {
    receiver: UnboundedReceiver<Change>,
}

impl Subscription {
    /// Waits for the next change.
    ///
    /// Returns `None` once the store is closed and all earlier changes have
    /// been received.
    pub async fn recv(&mut self) -> Option<Change> {
        self.receiver.recv().await
    }

    /// Returns the next change if one is already queued.
    pub fn try_recv(&mut self) -> Option<Change> {
        self.receiver.try_recv().ok()
    }

    /// Adapts the subscription into a stream of changes.
    #[must_use]
    pub fn into_stream(self) -> impl Stream<Item = Change> {
        futures::stream::unfold(self, |mut subscription| async move {
            subscription
                .recv()
                .await
                .map(|change| (change, subscription))
        })
    }
}
