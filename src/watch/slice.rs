//! `EndpointSlice` normalization.
//!
//! A service's backends may be spread over several slices, and during
//! rebalancing one backend can briefly appear in more than one of them. Each
//! backend is stored once, keyed by service and target, and is removed only
//! when no slice of the service lists it any more. A dual-stack backend shows
//! up once per address family; its record carries the addresses of both.

use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;

use k8s_openapi::api::discovery::v1::{Endpoint, EndpointSlice};
use kube::ResourceExt;
use kube::runtime::reflector::ObjectRef;
use tracing::trace;

use super::{Mutation, Normalizer};
use crate::store::{EndpointInfo, EndpointPort, ResourceKey, StoreEntry};

/// Label linking an `EndpointSlice` to its service.
pub const SERVICE_NAME_LABEL: &str = "kubernetes.io/service-name";

type Records = HashMap<ResourceKey, EndpointInfo>;

/// Collapses `EndpointSlice`s into per-backend endpoint records.
#[derive(Debug, Default)]
pub struct SliceNormalizer {
    /// Records contributed by each slice.
    slices: HashMap<ObjectRef<EndpointSlice>, Records>,
    /// Slices contributing each record.
    contributors: HashMap<ResourceKey, Vec<ObjectRef<EndpointSlice>>>,
}

impl SliceNormalizer {
    /// Creates an empty normalizer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the contribution of `slice_ref` and returns the resulting
    /// mutations, one per affected key.
    fn replace(&mut self, slice_ref: &ObjectRef<EndpointSlice>, records: Records) -> Vec<Mutation> {
        let previous = self.slices.remove(slice_ref).unwrap_or_default();
        let mut affected: BTreeSet<ResourceKey> = previous.keys().cloned().collect();

        for key in previous.keys() {
            if let Some(slices) = self.contributors.get_mut(key) {
                slices.retain(|r| r != slice_ref);

                if slices.is_empty() {
                    self.contributors.remove(key);
                }
            }
        }

        for key in records.keys() {
            affected.insert(key.clone());
            self.contributors
                .entry(key.clone())
                .or_default()
                .push(slice_ref.clone());
        }

        if !records.is_empty() {
            self.slices.insert(slice_ref.clone(), records);
        }

        affected.into_iter().map(|key| self.resolve(key)).collect()
    }

    /// The current value of `key` across all contributing slices.
    ///
    /// Dual-stack backends are listed in one slice per address family, so the
    /// record merges the addresses and ports of every contributor. The other
    /// fields come from the contributing slice that sorts first by name,
    /// which keeps the result independent of event order.
    fn resolve(&self, key: ResourceKey) -> Mutation {
        let mut records: Vec<_> = self
            .contributors
            .get(&key)
            .into_iter()
            .flatten()
            .filter_map(|r| {
                let info = self.slices.get(r)?.get(&key)?;
                Some((r.name.as_str(), info))
            })
            .collect();

        records.sort_by_key(|(name, _)| *name);

        let Some(((_, first), rest)) = records.split_first() else {
            return Mutation::Delete(key);
        };

        let mut merged = EndpointInfo::clone(first);

        for (_, info) in rest {
            merged.addresses.extend(&info.addresses);

            for port in &info.ports {
                if !merged.ports.contains(port) {
                    merged.ports.push(port.clone());
                }
            }
        }

        // IPv4 sorts before IPv6.
        merged.addresses.sort_unstable();
        merged.addresses.dedup();

        Mutation::Set(key, StoreEntry::Endpoint(merged))
    }
}

impl Normalizer for SliceNormalizer {
    type Object = EndpointSlice;

    const KIND: &'static str = "endpointslice";

    fn applied(&mut self, slice: &EndpointSlice) -> Vec<Mutation> {
        let slice_ref = ObjectRef::from_obj(slice);

        // A slice that lost its service label no longer contributes anything.
        let records = match slice.labels().get(SERVICE_NAME_LABEL) {
            Some(service) => extract_endpoints(slice, service),
            None => Records::new(),
        };

        self.replace(&slice_ref, records)
    }

    fn removed(&mut self, slice_ref: &ObjectRef<EndpointSlice>) -> Vec<Mutation> {
        self.replace(slice_ref, Records::new())
    }
}

/// Extracts ready endpoint records from an `EndpointSlice`.
fn extract_endpoints(slice: &EndpointSlice, service: &str) -> Records {
    let namespace = slice.namespace().unwrap_or_default();
    let ports: Vec<EndpointPort> = slice
        .ports
        .iter()
        .flatten()
        .filter_map(|p| {
            Some(EndpointPort {
                name: p.name.clone(),
                port: p.port.and_then(|n| u16::try_from(n).ok())?,
                protocol: p.protocol.clone().unwrap_or_else(|| "TCP".to_string()),
            })
        })
        .collect();

    let mut records = Records::new();

    for ep in &slice.endpoints {
        let conditions = ep.conditions.as_ref();

        // An endpoint is ready if conditions.ready is true or unset (defaults to true)
        let ready = conditions.and_then(|c| c.ready).unwrap_or(true);

        if !ready {
            continue;
        }

        let addresses: Vec<IpAddr> = ep.addresses.iter().filter_map(|a| a.parse().ok()).collect();

        let Some(target) = target(ep, &addresses) else {
            trace!(slice = %slice.name_any(), "dropping endpoint without addresses");
            continue;
        };

        let key = ResourceKey::endpoint(&namespace, service, &target);

        records.entry(key).or_insert_with(|| EndpointInfo {
            namespace: namespace.clone(),
            service_name: service.to_string(),
            target,
            addresses,
            ports: ports.clone(),
            hostname: ep.hostname.clone(),
            node_name: ep.node_name.clone(),
            zone: ep.zone.clone(),
            serving: conditions.and_then(|c| c.serving).unwrap_or(ready),
            terminating: conditions.and_then(|c| c.terminating).unwrap_or(false),
        });
    }

    records
}

/// Backend identity of an endpoint: its target reference, hostname or first
/// address. `None` if the endpoint has no usable address.
fn target(ep: &Endpoint, addresses: &[IpAddr]) -> Option<String> {
    let first = addresses.first()?;

    if let Some(name) = ep.target_ref.as_ref().and_then(|r| r.name.as_ref()) {
        let kind = ep
            .target_ref
            .as_ref()
            .and_then(|r| r.kind.as_deref())
            .unwrap_or("Pod");

        return Some(format!("{kind}/{name}"));
    }

    Some(ep.hostname.clone().unwrap_or_else(|| first.to_string()))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::api::core::v1::ObjectReference;
    use k8s_openapi::api::discovery::v1::{EndpointConditions, EndpointPort as KubeEndpointPort};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use super::*;

    // Helper to create an endpoint with addresses and optional ready condition
    fn make_endpoint(addresses: Vec<&str>, ready: Option<bool>) -> Endpoint {
        Endpoint {
            addresses: addresses.into_iter().map(String::from).collect(),
            conditions: Some(EndpointConditions {
                ready,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    // Helper to create an endpoint backed by a pod
    fn make_pod_endpoint(pod: &str, address: &str) -> Endpoint {
        Endpoint {
            target_ref: Some(ObjectReference {
                kind: Some("Pod".to_string()),
                name: Some(pod.to_string()),
                ..Default::default()
            }),
            ..make_endpoint(vec![address], Some(true))
        }
    }

    // Helper to create an endpoint port
    fn make_port(name: Option<&str>, port: i32) -> KubeEndpointPort {
        KubeEndpointPort {
            name: name.map(String::from),
            port: Some(port),
            ..Default::default()
        }
    }

    fn make_slice(name: &str, service: Option<&str>, endpoints: Vec<Endpoint>) -> EndpointSlice {
        EndpointSlice {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                labels: service.map(|s| {
                    BTreeMap::from([(SERVICE_NAME_LABEL.to_string(), s.to_string())])
                }),
                ..Default::default()
            },
            address_type: "IPv4".to_string(),
            endpoints,
            ports: Some(vec![make_port(Some("http"), 8080)]),
            ..Default::default()
        }
    }

    fn key(target: &str) -> ResourceKey {
        ResourceKey::endpoint("default", "web", target)
    }

    fn set_keys(mutations: &[Mutation]) -> Vec<ResourceKey> {
        mutations
            .iter()
            .filter_map(|m| match m {
                Mutation::Set(key, _) => Some(key.clone()),
                Mutation::Delete(_) => None,
            })
            .collect()
    }

    #[test]
    fn extract_endpoints_empty_slice() {
        let slice = make_slice("web-a", Some("web"), Vec::new());
        assert!(extract_endpoints(&slice, "web").is_empty());
    }

    #[test]
    fn extract_endpoints_keys_by_target_ref() {
        let slice = make_slice("web-a", Some("web"), vec![make_pod_endpoint("web-1", "10.0.0.1")]);

        let records = extract_endpoints(&slice, "web");
        let info = &records[&key("Pod/web-1")];

        assert_eq!(info.target, "Pod/web-1");
        assert_eq!(info.addresses, vec!["10.0.0.1".parse::<IpAddr>().unwrap()]);
        assert_eq!(info.ports[0].port, 8080);
        assert_eq!(info.ports[0].protocol, "TCP");
        assert!(info.serving);
        assert!(!info.terminating);
    }

    #[test]
    fn extract_endpoints_falls_back_to_hostname_then_address() {
        let named = Endpoint {
            hostname: Some("db-0".to_string()),
            ..make_endpoint(vec!["10.0.0.1"], None)
        };
        let anonymous = make_endpoint(vec!["10.0.0.2"], None);
        let slice = make_slice("web-a", Some("web"), vec![named, anonymous]);

        let records = extract_endpoints(&slice, "web");

        assert!(records.contains_key(&key("db-0")));
        assert!(records.contains_key(&key("10.0.0.2")));
    }

    #[test]
    fn extract_endpoints_skips_not_ready() {
        let slice = make_slice(
            "web-a",
            Some("web"),
            vec![
                make_endpoint(vec!["10.0.0.1"], Some(true)),
                make_endpoint(vec!["10.0.0.2"], Some(false)),
            ],
        );

        let records = extract_endpoints(&slice, "web");

        assert_eq!(records.len(), 1);
        assert!(records.contains_key(&key("10.0.0.1")));
    }

    #[test]
    fn extract_endpoints_no_conditions_defaults_to_ready() {
        let slice = make_slice(
            "web-a",
            Some("web"),
            vec![Endpoint {
                addresses: vec!["10.0.0.1".to_string()],
                conditions: None,
                ..Default::default()
            }],
        );

        assert_eq!(extract_endpoints(&slice, "web").len(), 1);
    }

    #[test]
    fn extract_endpoints_drops_endpoints_without_valid_address() {
        let slice = make_slice(
            "web-a",
            Some("web"),
            vec![
                make_endpoint(vec![], Some(true)),
                make_endpoint(vec!["not-an-ip"], Some(true)),
                make_endpoint(vec!["not-an-ip", "10.0.0.3"], Some(true)),
            ],
        );

        let records = extract_endpoints(&slice, "web");

        assert_eq!(records.len(), 1);
        assert_eq!(
            records[&key("10.0.0.3")].addresses,
            vec!["10.0.0.3".parse::<IpAddr>().unwrap()]
        );
    }

    #[test]
    fn extract_endpoints_ipv6() {
        let slice = make_slice("web-a", Some("web"), vec![make_endpoint(vec!["2001:db8::1"], None)]);

        let records = extract_endpoints(&slice, "web");

        assert!(records.contains_key(&key("2001:db8::1")));
    }

    #[test]
    fn extract_endpoints_deduplicates_targets() {
        let slice = make_slice(
            "web-a",
            Some("web"),
            vec![
                make_pod_endpoint("web-1", "10.0.0.1"),
                make_pod_endpoint("web-1", "10.0.0.1"),
            ],
        );

        assert_eq!(extract_endpoints(&slice, "web").len(), 1);
    }

    #[test]
    fn applied_sets_each_endpoint() {
        let mut normalizer = SliceNormalizer::new();
        let slice = make_slice(
            "web-a",
            Some("web"),
            vec![
                make_pod_endpoint("web-1", "10.0.0.1"),
                make_pod_endpoint("web-2", "10.0.0.2"),
            ],
        );

        let mutations = normalizer.applied(&slice);

        assert_eq!(set_keys(&mutations), vec![key("Pod/web-1"), key("Pod/web-2")]);
    }

    #[test]
    fn update_deletes_endpoints_no_longer_listed() {
        let mut normalizer = SliceNormalizer::new();
        normalizer.applied(&make_slice(
            "web-a",
            Some("web"),
            vec![
                make_pod_endpoint("web-1", "10.0.0.1"),
                make_pod_endpoint("web-2", "10.0.0.2"),
            ],
        ));

        let mutations = normalizer.applied(&make_slice(
            "web-a",
            Some("web"),
            vec![make_pod_endpoint("web-2", "10.0.0.2")],
        ));

        assert_eq!(
            mutations[0],
            Mutation::Delete(key("Pod/web-1")),
            "removed backend is deleted"
        );
        assert_eq!(set_keys(&mutations), vec![key("Pod/web-2")]);
    }

    #[test]
    fn shared_target_survives_until_last_slice_drops_it() {
        let mut normalizer = SliceNormalizer::new();
        let a = make_slice("web-a", Some("web"), vec![make_pod_endpoint("web-1", "10.0.0.1")]);
        let b = make_slice("web-b", Some("web"), vec![make_pod_endpoint("web-1", "10.0.0.1")]);

        normalizer.applied(&a);
        normalizer.applied(&b);

        let mutations = normalizer.removed(&ObjectRef::from_obj(&a));
        assert_eq!(set_keys(&mutations), vec![key("Pod/web-1")]);

        let mutations = normalizer.removed(&ObjectRef::from_obj(&b));
        assert_eq!(mutations, vec![Mutation::Delete(key("Pod/web-1"))]);
    }

    #[test]
    fn dual_stack_slices_merge_regardless_of_order() {
        let v4 = make_slice("web-v4", Some("web"), vec![make_pod_endpoint("web-1", "10.0.0.1")]);
        let v6 = EndpointSlice {
            address_type: "IPv6".to_string(),
            ..make_slice("web-v6", Some("web"), vec![make_pod_endpoint("web-1", "fd00::1")])
        };

        let mut forward = SliceNormalizer::new();
        forward.applied(&v4);
        let forward = forward.applied(&v6);

        let mut backward = SliceNormalizer::new();
        backward.applied(&v6);
        let backward = backward.applied(&v4);

        assert_eq!(forward, backward);

        let Mutation::Set(_, StoreEntry::Endpoint(info)) = &forward[0] else {
            panic!("unexpected mutation: {forward:?}");
        };

        assert_eq!(
            info.addresses,
            vec![
                "10.0.0.1".parse::<IpAddr>().unwrap(),
                "fd00::1".parse::<IpAddr>().unwrap(),
            ]
        );
        assert_eq!(info.ports.len(), 1);
    }

    #[test]
    fn dual_stack_record_shrinks_when_one_family_goes() {
        let mut normalizer = SliceNormalizer::new();
        let v4 = make_slice("web-v4", Some("web"), vec![make_pod_endpoint("web-1", "10.0.0.1")]);
        let v6 = make_slice("web-v6", Some("web"), vec![make_pod_endpoint("web-1", "fd00::1")]);

        normalizer.applied(&v4);
        normalizer.applied(&v6);

        let mutations = normalizer.removed(&ObjectRef::from_obj(&v4));
        let Mutation::Set(_, StoreEntry::Endpoint(info)) = &mutations[0] else {
            panic!("unexpected mutation: {mutations:?}");
        };

        assert_eq!(info.addresses, vec!["fd00::1".parse::<IpAddr>().unwrap()]);
    }

    #[test]
    fn losing_service_label_withdraws_records() {
        let mut normalizer = SliceNormalizer::new();
        normalizer.applied(&make_slice(
            "web-a",
            Some("web"),
            vec![make_pod_endpoint("web-1", "10.0.0.1")],
        ));

        let mutations = normalizer.applied(&make_slice(
            "web-a",
            None,
            vec![make_pod_endpoint("web-1", "10.0.0.1")],
        ));

        assert_eq!(mutations, vec![Mutation::Delete(key("Pod/web-1"))]);
    }

    #[test]
    fn removing_unknown_slice_is_a_no_op() {
        let mut normalizer = SliceNormalizer::new();
        let slice = make_slice("web-a", Some("web"), Vec::new());

        assert!(normalizer.removed(&ObjectRef::from_obj(&slice)).is_empty());
    }
}
