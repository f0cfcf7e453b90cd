use std::net::IpAddr;

use k8s_openapi::api::core::v1::{Service, ServicePort as KubeServicePort};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use kube::runtime::reflector::ObjectRef;

use super::ObjectNormalizer;
use crate::config::MetadataFilter;
use crate::store::{Port, ResourceKey, ServiceInfo, ServicePort, StoreEntry};

/// Normalizes `Service` objects.
///
/// Only services admitted by the watch's label selector are ever seen, so no
/// ownership filtering happens here.
#[derive(Clone, Debug)]
pub struct ServiceNormalizer {
    filter: MetadataFilter,
}

impl ServiceNormalizer {
    /// Creates a normalizer retaining the metadata admitted by `filter`.
    #[must_use]
    pub fn new(filter: MetadataFilter) -> Self {
        Self { filter }
    }
}

impl ObjectNormalizer for ServiceNormalizer {
    type Object = Service;

    const KIND: &'static str = "service";

    fn key(&self, obj_ref: &ObjectRef<Service>) -> ResourceKey {
        ResourceKey::service(
            obj_ref.namespace.clone().unwrap_or_default(),
            obj_ref.name.clone(),
        )
    }

    fn normalize(&self, svc: &Service) -> Option<StoreEntry> {
        let spec = svc.spec.clone().unwrap_or_default();

        // Single-stack clusters may only fill in `clusterIP`.
        let cluster_ips = spec
            .cluster_ips
            .unwrap_or_else(|| spec.cluster_ip.into_iter().collect());

        Some(StoreEntry::Service(ServiceInfo {
            namespace: svc.namespace().unwrap_or_default(),
            name: svc.name_any(),
            service_type: spec.type_.unwrap_or_else(|| "ClusterIP".to_string()),
            cluster_ips: parse_ips(&cluster_ips),
            external_ips: parse_ips(&spec.external_ips.unwrap_or_default()),
            ports: spec.ports.unwrap_or_default().iter().filter_map(port).collect(),
            client_ip_affinity: spec.session_affinity.as_deref() == Some("ClientIP"),
            labels: self.filter.labels(svc.metadata.labels.as_ref()),
            annotations: self.filter.annotations(svc.metadata.annotations.as_ref()),
        }))
    }
}

/// Parses IP strings, skipping `None` and other non-addresses.
fn parse_ips(ips: &[String]) -> Vec<IpAddr> {
    ips.iter().filter_map(|ip| ip.parse().ok()).collect()
}

fn port(p: &KubeServicePort) -> Option<ServicePort> {
    let target_port = match &p.target_port {
        Some(IntOrString::Int(n)) => u16::try_from(*n).ok().map(Port::from),
        Some(IntOrString::String(name)) => Some(Port::from(name.as_str())),
        None => None,
    };

    Some(ServicePort {
        name: p.name.clone(),
        protocol: p.protocol.clone().unwrap_or_else(|| "TCP".to_string()),
        port: u16::try_from(p.port).ok()?,
        target_port,
        node_port: p.node_port.and_then(|n| u16::try_from(n).ok()),
    })
}
