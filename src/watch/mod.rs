//! Watch adapters translating Kubernetes watch events into store mutations.
//!
//! One generic [`EventHandler`] serves every resource kind. What differs per
//! kind is captured by a [`Normalizer`]: how an applied object turns into
//! mutations and how a removal, known only by its [`ObjectRef`], does.
//! Services and nodes map one object to one entry and implement the narrower
//! [`ObjectNormalizer`]; `EndpointSlice`s fan out into per-backend records and
//! implement [`Normalizer`] directly.
//!
//! The watcher's relist (`Init` .. `InitDone`) does not report objects that
//! vanished while the watch was down. The handler diffs the relist against
//! what it knew before and removes the missing objects by reference.

mod node;
mod service;
mod slice;

use std::collections::HashSet;
use std::fmt::{Debug, Display};
use std::pin::pin;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use kube::Resource;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Event;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

pub use node::NodeNormalizer;
pub use service::ServiceNormalizer;
pub use slice::{SERVICE_NAME_LABEL, SliceNormalizer};

use crate::error::Result;
use crate::store::{ResourceKey, Store, StoreEntry};

/// A store write derived from one watch event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Mutation {
    /// Upsert an entry.
    Set(ResourceKey, StoreEntry),
    /// Remove an entry.
    Delete(ResourceKey),
}

/// Per-kind translation of watch events into store mutations.
pub trait Normalizer: Send + 'static {
    /// The watched Kubernetes resource.
    type Object: Resource<DynamicType = ()> + Clone + Debug + Send + Sync + 'static;

    /// Short name used in logs.
    const KIND: &'static str;

    /// Mutations for an added or updated object.
    fn applied(&mut self, obj: &Self::Object) -> Vec<Mutation>;

    /// Mutations for a removed object known only by reference.
    fn removed(&mut self, obj_ref: &ObjectRef<Self::Object>) -> Vec<Mutation>;
}

/// Normalization for kinds that map one object to exactly one store entry.
pub trait ObjectNormalizer: Send + 'static {
    /// The watched Kubernetes resource.
    type Object: Resource<DynamicType = ()> + Clone + Debug + Send + Sync + 'static;

    /// Short name used in logs.
    const KIND: &'static str;

    /// The store key of an object.
    fn key(&self, obj_ref: &ObjectRef<Self::Object>) -> ResourceKey;

    /// The store entry of an object, or `None` if it should not be stored.
    fn normalize(&self, obj: &Self::Object) -> Option<StoreEntry>;
}

/// Lifts an [`ObjectNormalizer`] into a [`Normalizer`].
#[derive(Clone, Debug)]
pub struct PerObject<N>(pub N);

impl<N: ObjectNormalizer> Normalizer for PerObject<N> {
    type Object = N::Object;

    const KIND: &'static str = N::KIND;

    fn applied(&mut self, obj: &Self::Object) -> Vec<Mutation> {
        let key = self.0.key(&ObjectRef::from_obj(obj));

        match self.0.normalize(obj) {
            Some(entry) => vec![Mutation::Set(key, entry)],
            None => vec![Mutation::Delete(key)],
        }
    }

    fn removed(&mut self, obj_ref: &ObjectRef<Self::Object>) -> Vec<Mutation> {
        vec![Mutation::Delete(self.0.key(obj_ref))]
    }
}

/// Applies the watch events of one resource kind to the store.
pub struct EventHandler<N: Normalizer> {
    store: Arc<Store>,
    normalizer: N,
    known: HashSet<ObjectRef<N::Object>>,
    relist: Option<HashSet<ObjectRef<N::Object>>>,
}

impl<N: Normalizer> EventHandler<N> {
    /// Creates a handler writing to `store`.
    #[must_use]
    pub fn new(store: Arc<Store>, normalizer: N) -> Self {
        Self {
            store,
            normalizer,
            known: HashSet::new(),
            relist: None,
        }
    }

    /// Number of objects currently known to the handler.
    #[must_use]
    pub fn known(&self) -> usize {
        self.known.len()
    }

    /// Applies one watch event.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreClosed`](crate::Error::StoreClosed) once the
    /// store has been closed.
    pub fn handle(&mut self, event: Event<N::Object>) -> Result<()> {
        match event {
            Event::Apply(obj) => {
                self.known.insert(ObjectRef::from_obj(&obj));
                let mutations = self.normalizer.applied(&obj);
                self.commit(mutations)
            }

            Event::Delete(obj) => {
                let obj_ref = ObjectRef::from_obj(&obj);
                self.known.remove(&obj_ref);
                let mutations = self.normalizer.removed(&obj_ref);
                self.commit(mutations)
            }

            Event::Init => {
                debug!(kind = N::KIND, "relist started");
                self.relist = Some(HashSet::new());
                Ok(())
            }

            Event::InitApply(obj) => {
                let obj_ref = ObjectRef::from_obj(&obj);
                self.relist
                    .get_or_insert_with(HashSet::new)
                    .insert(obj_ref.clone());
                self.known.insert(obj_ref);

                let mutations = self.normalizer.applied(&obj);
                self.commit(mutations)
            }

            Event::InitDone => {
                let relisted = self.relist.take().unwrap_or_default();
                let stale: Vec<_> = self.known.difference(&relisted).cloned().collect();

                debug!(
                    kind = N::KIND,
                    objects = relisted.len(),
                    stale = stale.len(),
                    "relist done"
                );

                self.known = relisted;

                for obj_ref in stale {
                    trace!(kind = N::KIND, %obj_ref, "removing object missing from relist");
                    let mutations = self.normalizer.removed(&obj_ref);
                    self.commit(mutations)?;
                }

                Ok(())
            }
        }
    }

    fn commit(&self, mutations: Vec<Mutation>) -> Result<()> {
        for mutation in mutations {
            match mutation {
                Mutation::Set(key, entry) => self.store.set(key, entry)?,
                Mutation::Delete(key) => self.store.delete(&key)?,
            }
        }

        Ok(())
    }
}

/// Feeds a watch stream into `handler` until `cancel` fires or the stream ends.
///
/// Stream errors are logged and skipped; the stream is expected to reconnect
/// on its own.
///
/// # Errors
///
/// Returns [`Error::StoreClosed`](crate::Error::StoreClosed) if the store is
/// closed while events are still arriving.
pub async fn drive<N, S, E>(
    mut handler: EventHandler<N>,
    stream: S,
    cancel: CancellationToken,
) -> Result<()>
where
    N: Normalizer,
    S: Stream<Item = std::result::Result<Event<N::Object>, E>>,
    E: Display,
{
    let mut stream = pin!(stream);
    debug!(kind = N::KIND, "starting watch");

    loop {
        let next = tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(kind = N::KIND, known = handler.known(), "watch cancelled");
                return Ok(());
            }

            next = stream.next() => next,
        };

        match next {
            Some(Ok(event)) => handler.handle(event)?,
            Some(Err(e)) => warn!(kind = N::KIND, "watch error: {e}"),
            None => {
                debug!(kind = N::KIND, "watch stream ended");
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::Node;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use super::*;
    use crate::config::MetadataFilter;
    use crate::error::Error;
    use crate::store::{Change, Kind};

    fn node(name: &str) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn handler(store: &Arc<Store>) -> EventHandler<PerObject<NodeNormalizer>> {
        EventHandler::new(
            Arc::clone(store),
            PerObject(NodeNormalizer::new(MetadataFilter::none())),
        )
    }

    #[test]
    fn apply_and_delete_round_trip_through_store() {
        let store = Arc::new(Store::new());
        let mut handler = handler(&store);

        handler.handle(Event::Apply(node("node-a"))).unwrap();
        assert!(store.get(&ResourceKey::node("node-a")).is_some());
        assert_eq!(handler.known(), 1);

        handler.handle(Event::Delete(node("node-a"))).unwrap();
        assert!(store.get(&ResourceKey::node("node-a")).is_none());
        assert_eq!(handler.known(), 0);
    }

    #[test]
    fn repeated_apply_leaves_store_unchanged() {
        let store = Arc::new(Store::new());
        let mut handler = handler(&store);

        handler.handle(Event::Apply(node("node-a"))).unwrap();
        let before = store.get(&ResourceKey::node("node-a"));
        handler.handle(Event::Apply(node("node-a"))).unwrap();

        assert_eq!(store.get(&ResourceKey::node("node-a")), before);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn relist_removes_objects_that_disappeared() {
        let store = Arc::new(Store::new());
        let mut handler = handler(&store);

        handler.handle(Event::Apply(node("node-a"))).unwrap();
        handler.handle(Event::Apply(node("node-b"))).unwrap();

        handler.handle(Event::Init).unwrap();
        handler.handle(Event::InitApply(node("node-b"))).unwrap();
        handler.handle(Event::InitApply(node("node-c"))).unwrap();
        handler.handle(Event::InitDone).unwrap();

        assert_eq!(
            store.keys_of(Kind::Node),
            vec![ResourceKey::node("node-b"), ResourceKey::node("node-c")]
        );
        assert_eq!(handler.known(), 2);
    }

    #[test]
    fn empty_relist_clears_everything() {
        let store = Arc::new(Store::new());
        let mut handler = handler(&store);
        let mut subscription = store.subscribe();

        handler.handle(Event::Apply(node("node-a"))).unwrap();
        handler.handle(Event::Init).unwrap();
        handler.handle(Event::InitDone).unwrap();

        assert!(store.is_empty());
        assert!(matches!(subscription.try_recv(), Some(Change::Set { .. })));
        assert!(matches!(subscription.try_recv(), Some(Change::Delete { .. })));
    }

    #[test]
    fn closed_store_stops_handler() {
        let store = Arc::new(Store::new());
        let mut handler = handler(&store);
        store.close();

        assert!(matches!(
            handler.handle(Event::Apply(node("node-a"))),
            Err(Error::StoreClosed)
        ));
    }

    #[tokio::test]
    async fn drive_skips_stream_errors() {
        let store = Arc::new(Store::new());
        let events: Vec<std::result::Result<Event<Node>, String>> = vec![
            Ok(Event::Apply(node("node-a"))),
            Err("connection reset".to_string()),
            Ok(Event::Apply(node("node-b"))),
        ];

        drive(
            handler(&store),
            futures::stream::iter(events),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn drive_returns_on_cancel() {
        let store = Arc::new(Store::new());
        let cancel = CancellationToken::new();
        let stream = futures::stream::pending::<std::result::Result<Event<Node>, String>>();

        let task = tokio::spawn(drive(handler(&store), stream, cancel.clone()));
        cancel.cancel();

        task.await.unwrap().unwrap();
    }
}
