//! YAML source-graph loader.
//!
//! The document schema is a thin, explicit mirror of the object variants.
//! Objects are declared under `addresses:`, `services:`, `groups:`,
//! `intervals:`, `hosts:`, `firewalls:` and `clusters:`; rules reference
//! objects by name, with the empty list (or the word `any`) meaning the
//! distinguished "any" marker. Loading is two-pass: named objects first,
//! then groups and rules, so order inside the document does not matter.

use crate::object::{
    DeviceType, InterfaceData, IntervalData, ObjectId, ObjectKind, ObjectStore,
};
use crate::rules::{
    Action, Direction, NatRuleData, PolicyRuleData, RoutingRuleData, RuleElement, RuleOptions,
    RuleSetData, RuleSetFamily,
};
use crate::service::{parse_port_range, PortRange, TcpFlags};
use crate::ModelError;
use chrono::Weekday;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::Path;

// ----------------------------------------------------------------------
// Document schema
// ----------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GraphDoc {
    #[serde(default)]
    pub addresses: Vec<AddressDoc>,
    #[serde(default)]
    pub services: Vec<ServiceDoc>,
    #[serde(default)]
    pub groups: Vec<GroupDoc>,
    #[serde(default)]
    pub intervals: Vec<IntervalDoc>,
    #[serde(default)]
    pub hosts: Vec<HostDoc>,
    #[serde(default)]
    pub firewalls: Vec<FirewallDoc>,
    #[serde(default)]
    pub clusters: Vec<ClusterDoc>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AddressDoc {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub run_time: bool,
    #[serde(default)]
    pub hostname: Option<String>,
    /// Pre-resolved addresses for DNS names and compile-time tables.
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default)]
    pub mac: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceDoc {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub src: Option<String>,
    #[serde(default)]
    pub dst: Option<String>,
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default)]
    pub flags_mask: Vec<String>,
    #[serde(default)]
    pub established: bool,
    #[serde(default)]
    pub icmp_type: Option<i16>,
    #[serde(default)]
    pub icmp_code: Option<i16>,
    #[serde(default)]
    pub protocol: Option<u8>,
    #[serde(default)]
    pub codes: BTreeMap<String, String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupDoc {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub members: Vec<String>,
    #[serde(default)]
    pub keyword: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IntervalDoc {
    pub name: String,
    #[serde(default)]
    pub from_date: Option<String>,
    #[serde(default)]
    pub to_date: Option<String>,
    #[serde(default)]
    pub from_time: Option<String>,
    #[serde(default)]
    pub to_time: Option<String>,
    #[serde(default)]
    pub days: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostDoc {
    pub name: String,
    #[serde(default)]
    pub interfaces: Vec<InterfaceDoc>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InterfaceDoc {
    pub name: String,
    #[serde(default)]
    pub loopback: bool,
    #[serde(default)]
    pub dynamic: bool,
    #[serde(default)]
    pub unnumbered: bool,
    #[serde(default)]
    pub dedicated_failover: bool,
    #[serde(default)]
    pub management: bool,
    #[serde(default)]
    pub bridge_port: bool,
    #[serde(default)]
    pub device_type: Option<String>,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub addresses: Vec<InterfaceAddressDoc>,
    /// Cluster interfaces: member firewall → real interface mapping.
    #[serde(default)]
    pub failover: Vec<FailoverPairDoc>,
    #[serde(default)]
    pub state_sync: Vec<FailoverPairDoc>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InterfaceAddressDoc {
    pub name: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub network: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FailoverPairDoc {
    pub firewall: String,
    pub interface: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FirewallDoc {
    pub name: String,
    #[serde(default = "default_platform")]
    pub platform: String,
    #[serde(default = "default_host_os")]
    pub host_os: String,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    #[serde(default)]
    pub interfaces: Vec<InterfaceDoc>,
    #[serde(default)]
    pub policy: Vec<RuleSetDoc>,
    #[serde(default)]
    pub nat: Vec<RuleSetDoc>,
    #[serde(default)]
    pub routing: Vec<RuleSetDoc>,
}

fn default_platform() -> String {
    "iptables".into()
}

fn default_host_os() -> String {
    "linux".into()
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterDoc {
    pub name: String,
    #[serde(default)]
    pub members: Vec<String>,
    #[serde(default)]
    pub interfaces: Vec<InterfaceDoc>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleSetDoc {
    pub name: String,
    #[serde(default = "default_true")]
    pub top: bool,
    #[serde(default)]
    pub family: Option<String>,
    #[serde(default)]
    pub rules: Vec<RuleDoc>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleDoc {
    // policy elements
    #[serde(default)]
    pub src: Vec<String>,
    #[serde(default)]
    pub src_neg: bool,
    #[serde(default)]
    pub dst: Vec<String>,
    #[serde(default)]
    pub dst_neg: bool,
    #[serde(default)]
    pub srv: Vec<String>,
    #[serde(default)]
    pub srv_neg: bool,
    #[serde(default)]
    pub itf: Vec<String>,
    #[serde(default)]
    pub itf_neg: bool,
    #[serde(default)]
    pub time: Vec<String>,
    #[serde(default)]
    pub time_neg: bool,
    #[serde(default)]
    pub direction: Option<String>,
    // NAT elements
    #[serde(default)]
    pub osrc: Vec<String>,
    #[serde(default)]
    pub odst: Vec<String>,
    #[serde(default)]
    pub osrv: Vec<String>,
    #[serde(default)]
    pub tsrc: Vec<String>,
    #[serde(default)]
    pub tdst: Vec<String>,
    #[serde(default)]
    pub tsrv: Vec<String>,
    #[serde(default)]
    pub itf_in: Vec<String>,
    #[serde(default)]
    pub itf_in_neg: bool,
    #[serde(default)]
    pub itf_out: Vec<String>,
    #[serde(default)]
    pub itf_out_neg: bool,
    // routing elements
    #[serde(default)]
    pub gateway: Vec<String>,
    #[serde(default)]
    pub metric: Option<u32>,
    // common
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub options: BTreeMap<String, serde_yaml::Value>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub comment: String,
}

// ----------------------------------------------------------------------
// Loader
// ----------------------------------------------------------------------

pub fn load_file(path: &Path) -> Result<ObjectStore, ModelError> {
    let text = std::fs::read_to_string(path)?;
    load_str(&text)
}

pub fn load_str(text: &str) -> Result<ObjectStore, ModelError> {
    let doc: GraphDoc = serde_yaml::from_str(text)?;
    build(&doc)
}

struct Loader {
    store: ObjectStore,
    names: BTreeMap<String, ObjectId>,
}

impl Loader {
    fn register(&mut self, name: &str, id: ObjectId) -> Result<(), ModelError> {
        if self.names.insert(name.to_string(), id).is_some() {
            return Err(ModelError::DuplicateName(name.to_string()));
        }
        Ok(())
    }

    fn lookup(&self, name: &str) -> Result<ObjectId, ModelError> {
        self.names
            .get(name)
            .copied()
            .ok_or_else(|| ModelError::UnknownObject(name.to_string()))
    }

    fn element(&self, names: &[String], negated: bool) -> Result<RuleElement, ModelError> {
        let mut items = Vec::new();
        for name in names {
            if name == "any" {
                continue;
            }
            items.push(self.lookup(name)?);
        }
        Ok(RuleElement { items, negated })
    }
}

pub fn build(doc: &GraphDoc) -> Result<ObjectStore, ModelError> {
    let mut l = Loader {
        store: ObjectStore::new(),
        names: BTreeMap::new(),
    };

    let lib = l.store.add(None, "User", ObjectKind::Library { read_only: false });

    for a in &doc.addresses {
        let kind = address_kind(a)?;
        let id = l.store.add(Some(lib), &a.name, kind);
        l.register(&a.name, id)?;
    }
    for s in &doc.services {
        let kind = service_kind(s)?;
        let id = l.store.add(Some(lib), &s.name, kind);
        l.register(&s.name, id)?;
    }
    for i in &doc.intervals {
        let id = l.store.add(Some(lib), &i.name, ObjectKind::Interval(interval_data(i)?));
        l.register(&i.name, id)?;
    }
    for h in &doc.hosts {
        let id = l.store.add(Some(lib), &h.name, ObjectKind::Host);
        l.register(&h.name, id)?;
        for itf in &h.interfaces {
            load_interface(&mut l, id, &h.name, itf)?;
        }
    }
    for f in &doc.firewalls {
        let id = l.store.add(
            Some(lib),
            &f.name,
            ObjectKind::Firewall {
                platform: f.platform.clone(),
                host_os: f.host_os.clone(),
            },
        );
        l.register(&f.name, id)?;
        l.store.get_mut(id).options = f.options.clone();
        for itf in &f.interfaces {
            load_interface(&mut l, id, &f.name, itf)?;
        }
    }
    for c in &doc.clusters {
        let members = c
            .members
            .iter()
            .map(|m| l.lookup(m))
            .collect::<Result<Vec<_>, _>>()?;
        let id = l.store.add(Some(lib), &c.name, ObjectKind::Cluster { members });
        l.register(&c.name, id)?;
        for itf in &c.interfaces {
            load_interface(&mut l, id, &c.name, itf)?;
        }
    }

    // Second pass: groups (members may be any named object).
    for g in &doc.groups {
        let members = g
            .members
            .iter()
            .map(|m| l.lookup(m))
            .collect::<Result<Vec<_>, _>>()?;
        let kind = match g.kind.as_str() {
            "object" => ObjectKind::ObjectGroup { members },
            "service" => ObjectKind::ServiceGroup { members },
            "interval" => ObjectKind::IntervalGroup { members },
            "dynamic" => ObjectKind::DynamicGroup {
                kind_filter: g.keyword.clone().unwrap_or_default(),
                keyword: g.keyword.clone().unwrap_or_default(),
            },
            other => {
                return Err(ModelError::Parse(format!(
                    "group '{}': unknown group type '{}'",
                    g.name, other
                )))
            }
        };
        let id = l.store.add(Some(lib), &g.name, kind);
        l.register(&g.name, id)?;
    }

    // Third pass: rule sets and rules.
    for f in &doc.firewalls {
        let fw = l.lookup(&f.name)?;
        for rs in &f.policy {
            let set = l.store.add(
                Some(fw),
                &rs.name,
                ObjectKind::PolicyRuleSet(rule_set_data(rs)?),
            );
            for (pos, r) in rs.rules.iter().enumerate() {
                let data = policy_rule(&l, fw, pos, r)?;
                l.store.add(Some(set), rule_label(pos, r), ObjectKind::PolicyRule(data));
            }
        }
        for rs in &f.nat {
            let set = l.store.add(
                Some(fw),
                &rs.name,
                ObjectKind::NatRuleSet(rule_set_data(rs)?),
            );
            for (pos, r) in rs.rules.iter().enumerate() {
                let data = nat_rule(&l, pos, r)?;
                l.store.add(Some(set), rule_label(pos, r), ObjectKind::NatRule(data));
            }
        }
        for rs in &f.routing {
            let set = l.store.add(
                Some(fw),
                &rs.name,
                ObjectKind::RoutingRuleSet(rule_set_data(rs)?),
            );
            for (pos, r) in rs.rules.iter().enumerate() {
                let data = routing_rule(&l, pos, r)?;
                l.store.add(Some(set), rule_label(pos, r), ObjectKind::RoutingRule(data));
            }
        }
    }

    Ok(l.store)
}

fn rule_label(pos: usize, r: &RuleDoc) -> String {
    r.label.clone().unwrap_or_else(|| format!("rule {}", pos))
}

fn load_interface(
    l: &mut Loader,
    owner: ObjectId,
    owner_name: &str,
    doc: &InterfaceDoc,
) -> Result<(), ModelError> {
    let parent_iface = match &doc.parent {
        Some(p) => Some(l.lookup(&format!("{}:{}", owner_name, p)).or_else(|_| l.lookup(p))?),
        None => None,
    };
    let data = InterfaceData {
        loopback: doc.loopback,
        dynamic: doc.dynamic,
        unnumbered: doc.unnumbered,
        dedicated_failover: doc.dedicated_failover,
        management: doc.management,
        bridge_port: doc.bridge_port,
        parent_iface,
        device_type: match doc.device_type.as_deref() {
            None | Some("ethernet") => DeviceType::Ethernet,
            Some("vlan") => DeviceType::Vlan,
            Some("bridge") => DeviceType::Bridge,
            Some("bonding") => DeviceType::Bonding,
            Some(other) => {
                return Err(ModelError::Parse(format!(
                    "interface '{}': unknown device type '{}'",
                    doc.name, other
                )))
            }
        },
    };
    let id = l.store.add(Some(owner), &doc.name, ObjectKind::Interface(data));
    // Scoped name always registers; the bare name is a convenience that
    // first-wins across firewalls.
    l.register(&format!("{}:{}", owner_name, doc.name), id)?;
    let _ = l.names.entry(doc.name.clone()).or_insert(id);

    for addr in &doc.addresses {
        let kind = if let Some(net) = &addr.network {
            parse_net_kind(net).ok_or_else(|| bad_addr(&addr.name, net))?
        } else if let Some(a) = &addr.address {
            parse_addr_kind(a).ok_or_else(|| bad_addr(&addr.name, a))?
        } else {
            return Err(ModelError::Parse(format!(
                "interface address '{}' needs `address` or `network`",
                addr.name
            )));
        };
        let aid = l.store.add(Some(id), &addr.name, kind);
        let _ = l.names.entry(addr.name.clone()).or_insert(aid);
    }

    for (pairs, sync) in [(&doc.failover, false), (&doc.state_sync, true)] {
        if pairs.is_empty() {
            continue;
        }
        let resolved = pairs
            .iter()
            .map(|p| {
                let fw = l.lookup(&p.firewall)?;
                let itf = l
                    .lookup(&format!("{}:{}", p.firewall, p.interface))
                    .or_else(|_| l.lookup(&p.interface))?;
                Ok((fw, itf))
            })
            .collect::<Result<Vec<_>, ModelError>>()?;
        let kind = if sync {
            ObjectKind::StateSyncGroup { pairs: resolved }
        } else {
            ObjectKind::FailoverGroup { pairs: resolved }
        };
        let name = if sync { "state-sync" } else { "failover" };
        l.store.add(Some(id), name, kind);
    }
    Ok(())
}

fn bad_addr(name: &str, value: &str) -> ModelError {
    ModelError::Parse(format!("address '{}': cannot parse '{}'", name, value))
}

fn parse_addr_kind(s: &str) -> Option<ObjectKind> {
    match s.parse::<IpAddr>().ok()? {
        IpAddr::V4(a) => Some(ObjectKind::Ipv4Address(a)),
        IpAddr::V6(a) => Some(ObjectKind::Ipv6Address(a)),
    }
}

fn parse_net_kind(s: &str) -> Option<ObjectKind> {
    if let Ok(n) = s.parse::<ipnet::Ipv4Net>() {
        return Some(ObjectKind::Network(n));
    }
    if let Ok(n) = s.parse::<ipnet::Ipv6Net>() {
        return Some(ObjectKind::NetworkV6(n));
    }
    None
}

fn address_kind(a: &AddressDoc) -> Result<ObjectKind, ModelError> {
    let parse_ip = |s: &String| {
        s.parse::<IpAddr>()
            .map_err(|_| bad_addr(&a.name, s))
    };
    match a.kind.as_str() {
        "ipv4" | "ipv6" | "address" => {
            let addr = a.address.as_ref().ok_or_else(|| missing(&a.name, "address"))?;
            parse_addr_kind(addr).ok_or_else(|| bad_addr(&a.name, addr))
        }
        "network" => {
            let net = a.network.as_ref().ok_or_else(|| missing(&a.name, "network"))?;
            parse_net_kind(net).ok_or_else(|| bad_addr(&a.name, net))
        }
        "range" => {
            let start = parse_ip(a.start.as_ref().ok_or_else(|| missing(&a.name, "start"))?)?;
            let end = parse_ip(a.end.as_ref().ok_or_else(|| missing(&a.name, "end"))?)?;
            Ok(ObjectKind::AddressRange { start, end })
        }
        "address-table" => Ok(ObjectKind::AddressTable {
            path: a.path.clone().unwrap_or_default(),
            run_time: a.run_time,
            resolved: a
                .addresses
                .iter()
                .filter_map(|s| s.parse().ok())
                .collect(),
        }),
        "dns" => Ok(ObjectKind::DnsName {
            hostname: a.hostname.clone().unwrap_or_else(|| a.name.clone()),
            run_time: a.run_time,
            resolved: a
                .addresses
                .iter()
                .map(|s| s.parse().map_err(|_| bad_addr(&a.name, s)))
                .collect::<Result<_, _>>()?,
        }),
        "mac" => Ok(ObjectKind::PhysAddress {
            mac: a.mac.clone().ok_or_else(|| missing(&a.name, "mac"))?,
        }),
        other => Err(ModelError::Parse(format!(
            "address '{}': unknown type '{}'",
            a.name, other
        ))),
    }
}

fn missing(name: &str, field: &str) -> ModelError {
    ModelError::Parse(format!("object '{}': missing field `{}`", name, field))
}

fn service_kind(s: &ServiceDoc) -> Result<ObjectKind, ModelError> {
    let ports = |v: &Option<String>| -> Result<PortRange, ModelError> {
        match v {
            None => Ok(PortRange::any()),
            Some(text) => parse_port_range(text)
                .ok_or_else(|| ModelError::Parse(format!("service '{}': bad port '{}'", s.name, text))),
        }
    };
    match s.kind.as_str() {
        "tcp" => Ok(ObjectKind::TcpService {
            src: ports(&s.src)?,
            dst: ports(&s.dst)?,
            flags_mask: TcpFlags::from_names(&s.flags_mask),
            flags_set: TcpFlags::from_names(&s.flags),
            established: s.established,
        }),
        "udp" => Ok(ObjectKind::UdpService {
            src: ports(&s.src)?,
            dst: ports(&s.dst)?,
        }),
        "icmp" => Ok(ObjectKind::IcmpService {
            icmp_type: s.icmp_type.unwrap_or(-1),
            icmp_code: s.icmp_code.unwrap_or(-1),
        }),
        "icmp6" => Ok(ObjectKind::Icmp6Service {
            icmp_type: s.icmp_type.unwrap_or(-1),
            icmp_code: s.icmp_code.unwrap_or(-1),
        }),
        "ip" => Ok(ObjectKind::IpService {
            protocol: s
                .protocol
                .ok_or_else(|| missing(&s.name, "protocol"))?,
        }),
        "custom" => Ok(ObjectKind::CustomService {
            codes: s.codes.clone(),
            protocol: None,
        }),
        "tag" => Ok(ObjectKind::TagService {
            code: s.code.clone().ok_or_else(|| missing(&s.name, "code"))?,
        }),
        "user" => Ok(ObjectKind::UserService {
            user: s.user.clone().ok_or_else(|| missing(&s.name, "user"))?,
        }),
        other => Err(ModelError::Parse(format!(
            "service '{}': unknown type '{}'",
            s.name, other
        ))),
    }
}

fn interval_data(i: &IntervalDoc) -> Result<IntervalData, ModelError> {
    let date = |v: &Option<String>| -> Result<_, ModelError> {
        v.as_ref()
            .map(|s| {
                s.parse::<chrono::NaiveDate>()
                    .map_err(|e| ModelError::Parse(format!("interval '{}': {}", i.name, e)))
            })
            .transpose()
    };
    let time = |v: &Option<String>| -> Result<_, ModelError> {
        v.as_ref()
            .map(|s| {
                chrono::NaiveTime::parse_from_str(s, "%H:%M")
                    .map_err(|e| ModelError::Parse(format!("interval '{}': {}", i.name, e)))
            })
            .transpose()
    };
    let days = i
        .days
        .iter()
        .map(|d| {
            d.parse::<Weekday>()
                .map_err(|_| ModelError::Parse(format!("interval '{}': bad day '{}'", i.name, d)))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(IntervalData {
        from_date: date(&i.from_date)?,
        to_date: date(&i.to_date)?,
        from_time: time(&i.from_time)?,
        to_time: time(&i.to_time)?,
        days,
    })
}

fn rule_set_data(rs: &RuleSetDoc) -> Result<RuleSetData, ModelError> {
    let family = match rs.family.as_deref() {
        None | Some("both") => RuleSetFamily::Both,
        Some("ipv4") => RuleSetFamily::V4,
        Some("ipv6") => RuleSetFamily::V6,
        Some(other) => {
            return Err(ModelError::Parse(format!(
                "rule set '{}': unknown family '{}'",
                rs.name, other
            )))
        }
    };
    Ok(RuleSetData {
        family,
        top: rs.top,
    })
}

fn parse_action(name: &str, s: Option<&str>, default: Action) -> Result<Action, ModelError> {
    let Some(s) = s else { return Ok(default) };
    Ok(match s {
        "accept" => Action::Accept,
        "deny" | "drop" => Action::Deny,
        "reject" => Action::Reject,
        "return" => Action::Return,
        "continue" => Action::Continue,
        "accounting" => Action::Accounting,
        "pipe" | "queue" => Action::Pipe,
        "custom" => Action::Custom,
        "branch" => Action::Branch,
        "tag" => Action::Tag,
        "classify" => Action::Classify,
        "route" => Action::Route,
        "modify" => Action::Modify,
        "scrub" => Action::Scrub,
        "skip" => Action::Skip,
        "translate" => Action::Accept, // NAT rules: plain translation
        other => {
            return Err(ModelError::Parse(format!(
                "rule '{}': unknown action '{}'",
                name, other
            )))
        }
    })
}

fn parse_direction(s: Option<&str>) -> Direction {
    match s {
        Some("inbound") | Some("in") => Direction::Inbound,
        Some("outbound") | Some("out") => Direction::Outbound,
        Some("both") => Direction::Both,
        _ => Direction::Undefined,
    }
}

fn rule_options(
    l: &Loader,
    raw: &BTreeMap<String, serde_yaml::Value>,
) -> Result<RuleOptions, ModelError> {
    let mut o = RuleOptions::default();
    let as_str = |v: &serde_yaml::Value| -> String {
        match v {
            serde_yaml::Value::String(s) => s.clone(),
            serde_yaml::Value::Number(n) => n.to_string(),
            serde_yaml::Value::Bool(b) => b.to_string(),
            other => format!("{:?}", other),
        }
    };
    let truthy = |v: &serde_yaml::Value| matches!(v, serde_yaml::Value::Bool(true))
        || matches!(v, serde_yaml::Value::String(s) if s == "true" || s == "1");

    for (key, value) in raw {
        match key.as_str() {
            "log" => o.log = truthy(value),
            "stateless" => o.stateless = truthy(value),
            "tagging" => o.tagging = truthy(value),
            "classification" => o.classification = truthy(value),
            "routing" => o.routing = truthy(value),
            "mark_connections" => o.mark_connections = truthy(value),
            "log_prefix" => o.log_prefix = Some(as_str(value)),
            "log_level" => o.log_level = Some(as_str(value)),
            "limit" => o.limit_value = Some(as_str(value)),
            "limit_burst" => o.limit_burst = as_str(value).parse().ok(),
            "connlimit_above" => o.connlimit_above = as_str(value).parse().ok(),
            "connlimit_masklen" => o.connlimit_masklen = as_str(value).parse().ok(),
            "hashlimit" => o.hashlimit_value = Some(as_str(value)),
            "hashlimit_name" => o.hashlimit_name = Some(as_str(value)),
            "hashlimit_mode" => o.hashlimit_mode = Some(as_str(value)),
            "reject_with" => o.reject_with = Some(as_str(value)),
            "branch" => o.branch_target = Some(l.lookup(&as_str(value))?),
            "custom" => o.custom_code = Some(as_str(value)),
            "accounting_chain" => o.accounting_chain = Some(as_str(value)),
            "tag" => o.tag_value = Some(as_str(value)),
            "classify" => o.classify_value = Some(as_str(value)),
            "route_gateway" => o.route_gateway = Some(as_str(value)),
            "route_interface" => o.route_interface = Some(as_str(value)),
            _ => {
                o.extras.insert(key.clone(), as_str(value));
            }
        }
    }
    Ok(o)
}

fn policy_rule(
    l: &Loader,
    _fw: ObjectId,
    pos: usize,
    r: &RuleDoc,
) -> Result<PolicyRuleData, ModelError> {
    Ok(PolicyRuleData {
        src: l.element(&r.src, r.src_neg)?,
        dst: l.element(&r.dst, r.dst_neg)?,
        srv: l.element(&r.srv, r.srv_neg)?,
        itf: l.element(&r.itf, r.itf_neg)?,
        time: l.element(&r.time, r.time_neg)?,
        direction: parse_direction(r.direction.as_deref()),
        action: parse_action(&rule_label(pos, r), r.action.as_deref(), Action::Deny)?,
        options: rule_options(l, &r.options)?,
        position: pos,
        label: rule_label(pos, r),
        disabled: r.disabled,
        comment: r.comment.clone(),
    })
}

fn nat_rule(l: &Loader, pos: usize, r: &RuleDoc) -> Result<NatRuleData, ModelError> {
    Ok(NatRuleData {
        osrc: l.element(&r.osrc, false)?,
        odst: l.element(&r.odst, false)?,
        osrv: l.element(&r.osrv, false)?,
        tsrc: l.element(&r.tsrc, false)?,
        tdst: l.element(&r.tdst, false)?,
        tsrv: l.element(&r.tsrv, false)?,
        itf_in: l.element(&r.itf_in, r.itf_in_neg)?,
        itf_out: l.element(&r.itf_out, r.itf_out_neg)?,
        action: parse_action(&rule_label(pos, r), r.action.as_deref(), Action::Accept)?,
        options: rule_options(l, &r.options)?,
        position: pos,
        label: rule_label(pos, r),
        disabled: r.disabled,
        comment: r.comment.clone(),
    })
}

fn routing_rule(l: &Loader, pos: usize, r: &RuleDoc) -> Result<RoutingRuleData, ModelError> {
    Ok(RoutingRuleData {
        dst: l.element(&r.dst, false)?,
        gateway: l.element(&r.gateway, false)?,
        itf: l.element(&r.itf, false)?,
        metric: r.metric.unwrap_or(0),
        options: rule_options(l, &r.options)?,
        position: pos,
        label: rule_label(pos, r),
        disabled: r.disabled,
        comment: r.comment.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"
addresses:
  - { name: lan, type: network, network: 10.0.0.0/24 }
  - { name: dmz-range, type: range, start: 10.1.0.10, end: 10.1.0.20 }
services:
  - { name: ssh, type: tcp, dst: "22" }
  - { name: web, type: tcp, dst: "80" }
groups:
  - { name: admin-srv, type: service, members: [ssh, web] }
firewalls:
  - name: fw
    platform: iptables
    options: { firewall_is_part_of_any_and_networks: "true" }
    interfaces:
      - name: eth0
        addresses: [ { name: eth0-ip, network: 10.0.0.1/24 } ]
    policy:
      - name: Policy
        rules:
          - { src: [lan], dst: [fw], srv: [admin-srv], action: accept, direction: both }
"#;

    #[test]
    fn loads_document() {
        let store = load_str(DOC).unwrap();
        let fw = store.find_by_name("fw").unwrap();
        assert_eq!(store.interfaces_of(fw).len(), 1);
        let policies = store.policies_of(fw);
        assert_eq!(policies.len(), 1);
        let rules: Vec<_> = store.children(policies[0]).collect();
        assert_eq!(rules.len(), 1);
        match &rules[0].kind {
            ObjectKind::PolicyRule(r) => {
                assert_eq!(r.action, Action::Accept);
                assert_eq!(r.src.len(), 1);
                assert!(!r.src.negated);
            }
            other => panic!("expected policy rule, got {}", other.tag()),
        }
    }

    #[test]
    fn unknown_reference_is_an_error() {
        let doc = r#"
firewalls:
  - name: fw
    policy:
      - name: Policy
        rules:
          - { src: [nonexistent], action: accept }
"#;
        let err = load_str(doc).unwrap_err();
        assert!(matches!(err, ModelError::UnknownObject(name) if name == "nonexistent"));
    }

    #[test]
    fn duplicate_names_rejected() {
        let doc = r#"
addresses:
  - { name: a, type: ipv4, address: 1.2.3.4 }
  - { name: a, type: ipv4, address: 1.2.3.5 }
"#;
        assert!(matches!(load_str(doc).unwrap_err(), ModelError::DuplicateName(_)));
    }

    #[test]
    fn unknown_option_lands_in_extras() {
        let doc = r#"
firewalls:
  - name: fw
    policy:
      - name: Policy
        rules:
          - { action: accept, options: { log: true, frobnicate: "1" } }
"#;
        let store = load_str(doc).unwrap();
        let fw = store.find_by_name("fw").unwrap();
        let set = store.policies_of(fw)[0];
        let rule = store.children(set).next().unwrap();
        match &rule.kind {
            ObjectKind::PolicyRule(r) => {
                assert!(r.options.log);
                assert_eq!(r.options.extras.get("frobnicate").map(String::as_str), Some("1"));
            }
            _ => unreachable!(),
        }
    }
}
