use std::fmt;

/// Kind of a stored resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Kind {
    /// A normalized `Service`.
    Service,
    /// A normalized `Node`.
    Node,
    /// One backend of a service, collapsed from its `EndpointSlice`s.
    Endpoint,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Service => "service",
            Self::Node => "node",
            Self::Endpoint => "endpoint",
        })
    }
}

/// Identifies one entry in the [`Store`](super::Store).
///
/// Endpoint keys carry the owning service in `name` and the backend identity
/// in `target`; the other kinds leave `target` unset. Nodes are cluster-scoped
/// and use an empty namespace.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    /// Resource kind.
    pub kind: Kind,
    /// Namespace, empty for cluster-scoped kinds.
    pub namespace: String,
    /// Object name (the service name for endpoints).
    pub name: String,
    /// Backend identity for endpoint keys.
    pub target: Option<String>,
}

impl ResourceKey {
    /// Key of a service.
    #[must_use]
    pub fn service(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: Kind::Service,
            namespace: namespace.into(),
            name: name.into(),
            target: None,
        }
    }

    /// Key of a node.
    #[must_use]
    pub fn node(name: impl Into<String>) -> Self {
        Self {
            kind: Kind::Node,
            namespace: String::new(),
            name: name.into(),
            target: None,
        }
    }

    /// Key of one backend `target` of service `namespace/service`.
    #[must_use]
    pub fn endpoint(
        namespace: impl Into<String>,
        service: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            kind: Kind::Endpoint,
            namespace: namespace.into(),
            name: service.into(),
            target: Some(target.into()),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)?;

        if let Some(target) = &self.target {
            write!(f, "/{target}")?;
        }

        Ok(())
    }
}
