use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use kube::runtime::reflector::ObjectRef;

use super::ObjectNormalizer;
use crate::config::MetadataFilter;
use crate::store::{NodeInfo, ResourceKey, StoreEntry};

/// Normalizes `Node` objects down to their retained labels and annotations.
#[derive(Clone, Debug)]
pub struct NodeNormalizer {
    filter: MetadataFilter,
}

impl NodeNormalizer {
    /// Creates a normalizer retaining the metadata admitted by `filter`.
    #[must_use]
    pub fn new(filter: MetadataFilter) -> Self {
        Self { filter }
    }
}

impl ObjectNormalizer for NodeNormalizer {
    type Object = Node;

    const KIND: &'static str = "node";

    fn key(&self, obj_ref: &ObjectRef<Node>) -> ResourceKey {
        ResourceKey::node(obj_ref.name.clone())
    }

    fn normalize(&self, node: &Node) -> Option<StoreEntry> {
        Some(StoreEntry::Node(NodeInfo {
            name: node.name_any(),
            labels: self.filter.labels(node.metadata.labels.as_ref()),
            annotations: self.filter.annotations(node.metadata.annotations.as_ref()),
        }))
    }
}
