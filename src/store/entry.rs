use std::collections::BTreeMap;
use std::net::IpAddr;

/// Normalized value held by the [`Store`](super::Store).
///
/// Entries are never mutated after publication; an update replaces the whole
/// entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreEntry {
    /// A service owned by this proxy instance.
    Service(ServiceInfo),
    /// A cluster node.
    Node(NodeInfo),
    /// One backend of a service.
    Endpoint(EndpointInfo),
}

impl StoreEntry {
    /// Returns the endpoint record, if this is one.
    #[must_use]
    pub fn as_endpoint(&self) -> Option<&EndpointInfo> {
        match self {
            Self::Endpoint(info) => Some(info),
            _ => None,
        }
    }
}

/// Target port of a service port mapping.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Port {
    /// A numeric port number.
    Number(u16),
    /// A named container port.
    Name(String),
}

impl From<u16> for Port {
    fn from(port: u16) -> Self {
        Self::Number(port)
    }
}

impl From<&str> for Port {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

impl From<String> for Port {
    fn from(name: String) -> Self {
        Self::Name(name)
    }
}

/// One port exposed by a service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServicePort {
    /// Port name, unique within the service.
    pub name: Option<String>,
    /// `TCP`, `UDP` or `SCTP`.
    pub protocol: String,
    /// Port exposed on the cluster IPs.
    pub port: u16,
    /// Port on the backends.
    pub target_port: Option<Port>,
    /// Port exposed on every node, for `NodePort` and `LoadBalancer` services.
    pub node_port: Option<u16>,
}

/// Projection of a `Service`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServiceInfo {
    /// Namespace of the service.
    pub namespace: String,
    /// Name of the service.
    pub name: String,
    /// `ClusterIP`, `NodePort`, `LoadBalancer` or `ExternalName`.
    pub service_type: String,
    /// Parsed cluster IPs.
    pub cluster_ips: Vec<IpAddr>,
    /// Parsed external IPs.
    pub external_ips: Vec<IpAddr>,
    /// Exposed ports.
    pub ports: Vec<ServicePort>,
    /// Whether `ClientIP` session affinity is requested.
    pub client_ip_affinity: bool,
    /// Labels retained by the configured globs.
    pub labels: BTreeMap<String, String>,
    /// Annotations retained by the configured globs.
    pub annotations: BTreeMap<String, String>,
}

/// Projection of a `Node`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeInfo {
    /// Name of the node.
    pub name: String,
    /// Labels retained by the configured globs.
    pub labels: BTreeMap<String, String>,
    /// Annotations retained by the configured globs.
    pub annotations: BTreeMap<String, String>,
}

/// Port published by an endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndpointPort {
    /// Name matching the service port.
    pub name: Option<String>,
    /// Port number.
    pub port: u16,
    /// `TCP`, `UDP` or `SCTP`.
    pub protocol: String,
}

/// One backend of a service.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EndpointInfo {
    /// Namespace of the owning service.
    pub namespace: String,
    /// Name of the owning service.
    pub service_name: String,
    /// Backend identity, stable across slices.
    pub target: String,
    /// Routable addresses; never empty in a stored record.
    pub addresses: Vec<IpAddr>,
    /// Ports published by the slices that contributed this record.
    pub ports: Vec<EndpointPort>,
    /// Hostname reported for the endpoint.
    pub hostname: Option<String>,
    /// Node hosting the endpoint.
    pub node_name: Option<String>,
    /// Zone of the hosting node.
    pub zone: Option<String>,
    /// Whether the endpoint is serving.
    pub serving: bool,
    /// Whether the endpoint is terminating.
    pub terminating: bool,
}

impl EndpointInfo {
    /// The address used to reach this endpoint.
    #[must_use]
    pub fn first_address(&self) -> Option<IpAddr> {
        self.addresses.first().copied()
    }
}
