//! The identity-addressed object arena.
//!
//! Every network entity is an [`Object`] slot in an [`ObjectStore`]; handles
//! are plain indices and never dangle because objects are only ever added.
//! Containment (firewall → interface → address, rule set → rule) uses the
//! parent/children links; group membership and rule elements use id lists
//! inside the [`ObjectKind`] payload.

use crate::rules::{NatRuleData, PolicyRuleData, RoutingRuleData, RuleSetData};
use crate::service::{PortRange, TcpFlags};
use crate::Family;
use chrono::{NaiveDate, NaiveTime, Weekday};
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Handle into an [`ObjectStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(u32);

impl ObjectId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceType {
    #[default]
    Ethernet,
    Vlan,
    Bridge,
    Bonding,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct InterfaceData {
    pub loopback: bool,
    pub dynamic: bool,
    pub unnumbered: bool,
    pub dedicated_failover: bool,
    pub management: bool,
    pub bridge_port: bool,
    pub parent_iface: Option<ObjectId>,
    pub device_type: DeviceType,
}

/// A time interval: optional date bounds, optional time-of-day bounds and a
/// days-of-week restriction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IntervalData {
    pub from_date: Option<NaiveDate>,
    pub to_date: Option<NaiveDate>,
    pub from_time: Option<NaiveTime>,
    pub to_time: Option<NaiveTime>,
    pub days: Vec<Weekday>,
}

/// Closed set of object variants.
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectKind {
    Ipv4Address(Ipv4Addr),
    Ipv6Address(Ipv6Addr),
    Network(Ipv4Net),
    NetworkV6(Ipv6Net),
    AddressRange {
        start: IpAddr,
        end: IpAddr,
    },
    /// File-backed address set; `run_time` tables load on the target at
    /// script execution time (emitted as an ipset match), compile-time
    /// tables are resolved by the preprocessor into `resolved`.
    AddressTable {
        path: String,
        run_time: bool,
        resolved: Vec<IpNet>,
    },
    DnsName {
        hostname: String,
        run_time: bool,
        resolved: Vec<IpAddr>,
    },
    PhysAddress {
        mac: String,
    },
    Host,
    Firewall {
        platform: String,
        host_os: String,
    },
    Cluster {
        members: Vec<ObjectId>,
    },
    Interface(InterfaceData),
    /// Child of a cluster interface: maps each member firewall to its real
    /// interface backing the failover address.
    FailoverGroup {
        pairs: Vec<(ObjectId, ObjectId)>,
    },
    StateSyncGroup {
        pairs: Vec<(ObjectId, ObjectId)>,
    },
    TcpService {
        src: PortRange,
        dst: PortRange,
        flags_mask: TcpFlags,
        flags_set: TcpFlags,
        established: bool,
    },
    UdpService {
        src: PortRange,
        dst: PortRange,
    },
    IcmpService {
        icmp_type: i16,
        icmp_code: i16,
    },
    Icmp6Service {
        icmp_type: i16,
        icmp_code: i16,
    },
    IpService {
        protocol: u8,
    },
    CustomService {
        codes: BTreeMap<String, String>,
        protocol: Option<String>,
    },
    TagService {
        code: String,
    },
    UserService {
        user: String,
    },
    ObjectGroup {
        members: Vec<ObjectId>,
    },
    ServiceGroup {
        members: Vec<ObjectId>,
    },
    IntervalGroup {
        members: Vec<ObjectId>,
    },
    DynamicGroup {
        kind_filter: String,
        keyword: String,
    },
    Interval(IntervalData),
    Library {
        read_only: bool,
    },
    PolicyRuleSet(RuleSetData),
    NatRuleSet(RuleSetData),
    RoutingRuleSet(RuleSetData),
    PolicyRule(PolicyRuleData),
    NatRule(NatRuleData),
    RoutingRule(RoutingRuleData),
}

impl ObjectKind {
    pub fn is_group(&self) -> bool {
        matches!(
            self,
            ObjectKind::ObjectGroup { .. }
                | ObjectKind::ServiceGroup { .. }
                | ObjectKind::IntervalGroup { .. }
                | ObjectKind::DynamicGroup { .. }
        )
    }

    pub fn is_interface(&self) -> bool {
        matches!(self, ObjectKind::Interface(_))
    }

    pub fn is_service(&self) -> bool {
        matches!(
            self,
            ObjectKind::TcpService { .. }
                | ObjectKind::UdpService { .. }
                | ObjectKind::IcmpService { .. }
                | ObjectKind::Icmp6Service { .. }
                | ObjectKind::IpService { .. }
                | ObjectKind::CustomService { .. }
                | ObjectKind::TagService { .. }
                | ObjectKind::UserService { .. }
        )
    }

    /// Short tag used in diagnostics and the debug printer.
    pub fn tag(&self) -> &'static str {
        match self {
            ObjectKind::Ipv4Address(_) => "IPv4",
            ObjectKind::Ipv6Address(_) => "IPv6",
            ObjectKind::Network(_) => "Network",
            ObjectKind::NetworkV6(_) => "NetworkIPv6",
            ObjectKind::AddressRange { .. } => "AddressRange",
            ObjectKind::AddressTable { .. } => "AddressTable",
            ObjectKind::DnsName { .. } => "DNSName",
            ObjectKind::PhysAddress { .. } => "PhysAddress",
            ObjectKind::Host => "Host",
            ObjectKind::Firewall { .. } => "Firewall",
            ObjectKind::Cluster { .. } => "Cluster",
            ObjectKind::Interface(_) => "Interface",
            ObjectKind::FailoverGroup { .. } => "FailoverGroup",
            ObjectKind::StateSyncGroup { .. } => "StateSyncGroup",
            ObjectKind::TcpService { .. } => "TCPService",
            ObjectKind::UdpService { .. } => "UDPService",
            ObjectKind::IcmpService { .. } => "ICMPService",
            ObjectKind::Icmp6Service { .. } => "ICMP6Service",
            ObjectKind::IpService { .. } => "IPService",
            ObjectKind::CustomService { .. } => "CustomService",
            ObjectKind::TagService { .. } => "TagService",
            ObjectKind::UserService { .. } => "UserService",
            ObjectKind::ObjectGroup { .. } => "ObjectGroup",
            ObjectKind::ServiceGroup { .. } => "ServiceGroup",
            ObjectKind::IntervalGroup { .. } => "IntervalGroup",
            ObjectKind::DynamicGroup { .. } => "DynamicGroup",
            ObjectKind::Interval(_) => "Interval",
            ObjectKind::Library { .. } => "Library",
            ObjectKind::PolicyRuleSet(_) => "Policy",
            ObjectKind::NatRuleSet(_) => "NAT",
            ObjectKind::RoutingRuleSet(_) => "Routing",
            ObjectKind::PolicyRule(_) => "PolicyRule",
            ObjectKind::NatRule(_) => "NATRule",
            ObjectKind::RoutingRule(_) => "RoutingRule",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Object {
    pub id: ObjectId,
    pub name: String,
    pub parent: Option<ObjectId>,
    pub children: Vec<ObjectId>,
    pub attributes: BTreeMap<String, String>,
    pub options: BTreeMap<String, String>,
    pub kind: ObjectKind,
    /// Error recorded by the preprocessor (failed DNS or address-table
    /// resolution); propagated to rules referencing this object.
    pub resolve_error: Option<String>,
}

/// Arena of all loaded objects.
#[derive(Debug, Clone, Default)]
pub struct ObjectStore {
    objects: Vec<Object>,
}

impl ObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, parent: Option<ObjectId>, name: impl Into<String>, kind: ObjectKind) -> ObjectId {
        let id = ObjectId(self.objects.len() as u32);
        self.objects.push(Object {
            id,
            name: name.into(),
            parent,
            children: Vec::new(),
            attributes: BTreeMap::new(),
            options: BTreeMap::new(),
            kind,
            resolve_error: None,
        });
        if let Some(p) = parent {
            self.objects[p.index()].children.push(id);
        }
        id
    }

    pub fn get(&self, id: ObjectId) -> &Object {
        &self.objects[id.index()]
    }

    pub fn get_mut(&mut self, id: ObjectId) -> &mut Object {
        &mut self.objects[id.index()]
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Object> {
        self.objects.iter()
    }

    pub fn children(&self, id: ObjectId) -> impl Iterator<Item = &Object> {
        self.get(id).children.iter().map(|c| self.get(*c))
    }

    /// First object with the given name, scanning in insertion order.
    pub fn find_by_name(&self, name: &str) -> Option<ObjectId> {
        self.objects.iter().find(|o| o.name == name).map(|o| o.id)
    }

    // ------------------------------------------------------------------
    // Firewall / interface facade
    // ------------------------------------------------------------------

    pub fn interfaces_of(&self, host: ObjectId) -> Vec<ObjectId> {
        self.get(host)
            .children
            .iter()
            .copied()
            .filter(|c| self.get(*c).kind.is_interface())
            .collect()
    }

    pub fn iface_data(&self, iface: ObjectId) -> &InterfaceData {
        match &self.get(iface).kind {
            ObjectKind::Interface(d) => d,
            other => panic!("object {} is not an interface: {}", iface.index(), other.tag()),
        }
    }

    /// Host/firewall that owns an interface.
    pub fn owner_of_interface(&self, iface: ObjectId) -> Option<ObjectId> {
        self.get(iface).parent
    }

    /// Addresses configured directly on an interface, in child order.
    pub fn interface_addresses(&self, iface: ObjectId) -> Vec<IpAddr> {
        self.children(iface)
            .filter_map(|o| match &o.kind {
                ObjectKind::Ipv4Address(a) => Some(IpAddr::V4(*a)),
                ObjectKind::Ipv6Address(a) => Some(IpAddr::V6(*a)),
                ObjectKind::Network(n) => Some(IpAddr::V4(n.addr())),
                ObjectKind::NetworkV6(n) => Some(IpAddr::V6(n.addr())),
                _ => None,
            })
            .collect()
    }

    /// Networks configured on an interface (address + mask children).
    pub fn interface_networks(&self, iface: ObjectId) -> Vec<IpNet> {
        self.children(iface)
            .filter_map(|o| match &o.kind {
                ObjectKind::Network(n) => Some(IpNet::V4(*n)),
                ObjectKind::NetworkV6(n) => Some(IpNet::V6(*n)),
                _ => None,
            })
            .collect()
    }

    /// All addresses of a host-like object (host, firewall or cluster), in
    /// interface order.
    pub fn host_addresses(&self, host: ObjectId, family: Option<Family>) -> Vec<IpAddr> {
        let mut out = Vec::new();
        for iface in self.interfaces_of(host) {
            for addr in self.interface_addresses(iface) {
                if family.map_or(true, |f| crate::address::family_of(&addr) == f) {
                    out.push(addr);
                }
            }
        }
        out
    }

    /// Rule sets of a firewall by kind.
    pub fn rule_sets_of(&self, fw: ObjectId, want_nat: bool, want_routing: bool) -> Vec<ObjectId> {
        self.get(fw)
            .children
            .iter()
            .copied()
            .filter(|c| match &self.get(*c).kind {
                ObjectKind::PolicyRuleSet(_) => !want_nat && !want_routing,
                ObjectKind::NatRuleSet(_) => want_nat,
                ObjectKind::RoutingRuleSet(_) => want_routing,
                _ => false,
            })
            .collect()
    }

    pub fn policies_of(&self, fw: ObjectId) -> Vec<ObjectId> {
        self.rule_sets_of(fw, false, false)
    }

    pub fn nats_of(&self, fw: ObjectId) -> Vec<ObjectId> {
        self.rule_sets_of(fw, true, false)
    }

    pub fn routings_of(&self, fw: ObjectId) -> Vec<ObjectId> {
        self.rule_sets_of(fw, false, true)
    }

    /// Cluster that a firewall belongs to, if any.
    pub fn cluster_of(&self, fw: ObjectId) -> Option<ObjectId> {
        self.objects
            .iter()
            .find(|o| matches!(&o.kind, ObjectKind::Cluster { members } if members.contains(&fw)))
            .map(|o| o.id)
    }

    /// For a cluster interface, the member firewall's real interface backing
    /// it (resolved via the failover group child).
    pub fn failover_member_iface(&self, cluster_iface: ObjectId, fw: ObjectId) -> Option<ObjectId> {
        self.children(cluster_iface).find_map(|o| match &o.kind {
            ObjectKind::FailoverGroup { pairs } | ObjectKind::StateSyncGroup { pairs } => pairs
                .iter()
                .find(|(member_fw, _)| *member_fw == fw)
                .map(|(_, iface)| *iface),
            _ => None,
        })
    }

    /// True when the interface belongs to a cluster object.
    pub fn is_cluster_interface(&self, iface: ObjectId) -> bool {
        self.get(iface)
            .parent
            .map(|p| matches!(self.get(p).kind, ObjectKind::Cluster { .. }))
            .unwrap_or(false)
    }

    // ------------------------------------------------------------------
    // Group facade
    // ------------------------------------------------------------------

    pub fn group_members(&self, group: ObjectId) -> &[ObjectId] {
        match &self.get(group).kind {
            ObjectKind::ObjectGroup { members }
            | ObjectKind::ServiceGroup { members }
            | ObjectKind::IntervalGroup { members } => members,
            _ => &[],
        }
    }

    // ------------------------------------------------------------------
    // Address matching
    // ------------------------------------------------------------------

    /// Concrete addresses an address-like object stands for, filtered by
    /// family. Hosts and firewalls expand to their interface addresses.
    pub fn addresses_of(&self, id: ObjectId, family: Option<Family>) -> Vec<IpAddr> {
        let keep = |a: &IpAddr| family.map_or(true, |f| crate::address::family_of(a) == f);
        match &self.get(id).kind {
            ObjectKind::Ipv4Address(a) => {
                let a = IpAddr::V4(*a);
                if keep(&a) { vec![a] } else { vec![] }
            }
            ObjectKind::Ipv6Address(a) => {
                let a = IpAddr::V6(*a);
                if keep(&a) { vec![a] } else { vec![] }
            }
            ObjectKind::Network(n) => {
                let a = IpAddr::V4(n.addr());
                if keep(&a) { vec![a] } else { vec![] }
            }
            ObjectKind::NetworkV6(n) => {
                let a = IpAddr::V6(n.addr());
                if keep(&a) { vec![a] } else { vec![] }
            }
            ObjectKind::DnsName { resolved, .. } => {
                resolved.iter().copied().filter(keep).collect()
            }
            ObjectKind::Host | ObjectKind::Firewall { .. } | ObjectKind::Cluster { .. } => {
                self.host_addresses(id, family)
            }
            ObjectKind::Interface(_) => self
                .interface_addresses(id)
                .into_iter()
                .filter(|a| keep(a))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// True when a single-address object is one of the firewall's own
    /// addresses (also true for the firewall object itself and its
    /// interfaces).
    pub fn matches_firewall(&self, id: ObjectId, fw: ObjectId) -> bool {
        if id == fw {
            return true;
        }
        let obj = self.get(id);
        if obj.kind.is_interface() && self.owner_of_interface(id) == Some(fw) {
            return true;
        }
        let fw_addrs = self.host_addresses(fw, None);
        match &obj.kind {
            ObjectKind::Ipv4Address(a) => fw_addrs.contains(&IpAddr::V4(*a)),
            ObjectKind::Ipv6Address(a) => fw_addrs.contains(&IpAddr::V6(*a)),
            _ => false,
        }
    }

    /// True when a multi-address object (network, range, multi-address host)
    /// overlaps the firewall's addresses without being one of them. Such
    /// objects need rule splitting rather than an inline match.
    pub fn complex_match(&self, id: ObjectId, fw: ObjectId) -> bool {
        let fw_addrs = self.host_addresses(fw, None);
        match &self.get(id).kind {
            ObjectKind::Network(n) => fw_addrs
                .iter()
                .any(|a| crate::address::net_contains(&IpNet::V4(*n), a)),
            ObjectKind::NetworkV6(n) => fw_addrs
                .iter()
                .any(|a| crate::address::net_contains(&IpNet::V6(*n), a)),
            ObjectKind::AddressRange { start, end } => fw_addrs
                .iter()
                .any(|a| crate::address::range_contains(start, end, a)),
            ObjectKind::Host => {
                let addrs = self.host_addresses(id, None);
                addrs.len() > 1 && addrs.iter().any(|a| fw_addrs.contains(a))
            }
            _ => false,
        }
    }

    /// True when the object carries more than one concrete address.
    pub fn is_multi_address(&self, id: ObjectId) -> bool {
        match &self.get(id).kind {
            ObjectKind::DnsName { resolved, .. } => resolved.len() > 1,
            ObjectKind::Host | ObjectKind::Firewall { .. } | ObjectKind::Cluster { .. } => {
                self.host_addresses(id, None).len() > 1
            }
            ObjectKind::AddressTable { .. } => true,
            _ => false,
        }
    }
}
