//! Service and Node views consumed by the policies
//!
//! A [`ServiceRecord`] holds only the fields rules are built from, already
//! parsed into addresses. It is what the reconciler caches, so deletes can
//! still be rendered after the Service is gone from the API.

use crate::core::error::{Error, Result};
use crate::core::iptables::Family;
use crate::validators::parse_address;
use ipnetwork::IpNetwork;
use k8s_openapi::api::core::v1::{Node, Service};
use kube::ResourceExt;
use serde::Serialize;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use tracing::warn;

/// `spec.type` value selecting the NAT policy
pub const LOAD_BALANCER_TYPE: &str = "LoadBalancer";

/// `namespace/name` of a Service; also the owner tag of its rules
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(into = "String")]
pub struct ServiceKey {
    pub namespace: String,
    pub name: String,
}

impl ServiceKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of a Service object.
    pub fn of(service: &Service) -> Self {
        Self::new(service.namespace().unwrap_or_default(), service.name_any())
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl From<ServiceKey> for String {
    fn from(key: ServiceKey) -> Self {
        key.to_string()
    }
}

impl FromStr for ServiceKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(Self::new(ns, name))
            }
            _ => Err(Error::Config(format!(
                "{s:?} is not a namespace/name Service key"
            ))),
        }
    }
}

/// The parts of a Service that rules are derived from
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceRecord {
    pub key: ServiceKey,
    pub load_balancer: bool,
    pub cluster_ip_v4: Option<IpAddr>,
    pub cluster_ip_v6: Option<IpAddr>,
    /// Ingress IPs followed by `spec.externalIPs`, deduplicated
    pub external_ips: Vec<IpAddr>,
}

impl ServiceRecord {
    /// Builds a record from a Service object.
    ///
    /// Address entries that do not parse are skipped with a warning; the
    /// rest of the Service is still used.
    pub fn from_service(service: &Service) -> Self {
        let key = ServiceKey::of(service);
        let spec = service.spec.as_ref();

        let load_balancer = spec
            .and_then(|s| s.type_.as_deref())
            .is_some_and(|t| t == LOAD_BALANCER_TYPE);

        let mut external_ips = Vec::new();
        let ingress = service
            .status
            .as_ref()
            .and_then(|s| s.load_balancer.as_ref())
            .and_then(|lb| lb.ingress.as_ref())
            .into_iter()
            .flatten()
            .filter_map(|i| i.ip.as_deref());
        let spec_external = spec
            .and_then(|s| s.external_ips.as_ref())
            .into_iter()
            .flatten()
            .map(String::as_str);

        for raw in ingress.chain(spec_external) {
            match parse_address("externalIPs", raw) {
                Ok(ip) if !external_ips.contains(&ip) => external_ips.push(ip),
                Ok(_) => {}
                Err(e) => warn!(service = %key, "Skipping external address: {e}"),
            }
        }

        Self {
            cluster_ip_v4: cluster_ip_by_family(service, Family::V4),
            cluster_ip_v6: cluster_ip_by_family(service, Family::V6),
            key,
            load_balancer,
            external_ips,
        }
    }

    pub fn cluster_ip(&self, family: Family) -> Option<IpAddr> {
        match family {
            Family::V4 => self.cluster_ip_v4,
            Family::V6 => self.cluster_ip_v6,
        }
    }

    /// `(externalIP, clusterIP)` pairs of one family.
    pub fn nat_pairs(&self, family: Family) -> Vec<(IpAddr, IpAddr)> {
        let Some(cluster_ip) = self.cluster_ip(family) else {
            return Vec::new();
        };
        self.external_ips
            .iter()
            .filter(|ip| family.contains(ip))
            .map(|ip| (*ip, cluster_ip))
            .collect()
    }

    /// `true` when the NAT policy applies: load-balancer type with a clusterIP.
    pub fn wants_nat(&self) -> bool {
        self.load_balancer && (self.cluster_ip_v4.is_some() || self.cluster_ip_v6.is_some())
    }
}

/// Cluster IP of `service` for `family`.
///
/// With `spec.ipFamilies` empty, the single `spec.clusterIP` is used when it
/// parses as that family. Otherwise `clusterIPs[i]` is paired with
/// `ipFamilies[i]`. Headless (`None`) and unparseable values yield `None`.
pub fn cluster_ip_by_family(service: &Service, family: Family) -> Option<IpAddr> {
    let spec = service.spec.as_ref()?;
    let families = spec.ip_families.as_deref().unwrap_or_default();

    let candidate = if families.is_empty() {
        spec.cluster_ip.as_deref()?
    } else {
        let wanted = match family {
            Family::V4 => "IPv4",
            Family::V6 => "IPv6",
        };
        let index = families.iter().position(|f| f == wanted)?;
        spec.cluster_ips.as_ref()?.get(index)?.as_str()
    };

    if candidate.is_empty() || candidate == "None" {
        return None;
    }

    match parse_address("clusterIP", candidate) {
        Ok(ip) if family.contains(&ip) => Some(ip),
        Ok(_) => None,
        Err(e) => {
            warn!(service = %ServiceKey::of(service), "Ignoring cluster IP: {e}");
            None
        }
    }
}

/// Per-family pod CIDRs of a node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PodCidrs {
    pub v4: Option<IpNetwork>,
    pub v6: Option<IpNetwork>,
}

impl PodCidrs {
    /// Splits `spec.podCIDRs` (or `spec.podCIDR`) by family. The first valid
    /// entry of each family wins; anything unparseable is ignored.
    pub fn from_node(node: &Node) -> Self {
        let Some(spec) = node.spec.as_ref() else {
            return Self::default();
        };

        let entries: Vec<&str> = match spec.pod_cidrs.as_deref() {
            Some(list) if !list.is_empty() => list.iter().map(String::as_str).collect(),
            _ => spec.pod_cidr.as_deref().into_iter().collect(),
        };

        let mut cidrs = Self::default();
        for entry in entries {
            match entry.trim().parse::<IpNetwork>() {
                Ok(net @ IpNetwork::V4(_)) if cidrs.v4.is_none() => cidrs.v4 = Some(net),
                Ok(net @ IpNetwork::V6(_)) if cidrs.v6.is_none() => cidrs.v6 = Some(net),
                Ok(_) => {}
                Err(_) => warn!(node = %node.name_any(), cidr = entry, "Ignoring pod CIDR"),
            }
        }
        cidrs
    }

    pub fn get(&self, family: Family) -> Option<IpNetwork> {
        match family {
            Family::V4 => self.v4,
            Family::V6 => self.v6,
        }
    }
}
