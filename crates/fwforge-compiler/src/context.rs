//! The shared compiler context handed to every stage.

use crate::chains::ChainRegistry;
use crate::diag::Diagnostics;
use fwforge_model::{Family, ObjectId, ObjectStore};
use std::collections::BTreeMap;

/// iptables table the current pipeline compiles for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Filter,
    Mangle,
    Nat,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Filter => "filter",
            Table::Mangle => "mangle",
            Table::Nat => "nat",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleSetKind {
    Policy,
    Nat,
    Routing,
}

/// Per-rule debug tracing: dump the named rule position after every stage.
#[derive(Debug, Clone, Copy)]
pub struct DebugFilter {
    pub kind: RuleSetKind,
    pub position: usize,
}

/// Typed view over the firewall's option map. Unknown keys are reported by
/// the caller that builds this view.
#[derive(Debug, Clone, Default)]
pub struct FirewallOptions {
    pub log_all: bool,
    pub ip_forward: bool,
    pub firewall_is_part_of_any_and_networks: bool,
    pub ignore_empty_groups: bool,
    pub check_shading: bool,
    pub bridging: bool,
    pub local_nat: bool,
    pub accept_new_tcp_with_no_syn: bool,
    pub action_on_reject: String,
    pub log_level: String,
    pub log_prefix: String,
    pub mgmt_addr: Option<String>,
}

impl FirewallOptions {
    pub const KNOWN_KEYS: [&'static str; 12] = [
        "log_all",
        "ip_forward",
        "firewall_is_part_of_any_and_networks",
        "ignore_empty_groups",
        "check_shading",
        "bridging",
        "local_nat",
        "accept_new_tcp_with_no_syn",
        "action_on_reject",
        "log_level",
        "log_prefix",
        "mgmt_addr",
    ];

    /// Build the view from the firewall object's raw option map, returning
    /// the keys that were not recognized alongside.
    pub fn from_map(map: &BTreeMap<String, String>) -> (Self, Vec<String>) {
        let truthy = |k: &str| {
            map.get(k)
                .map(|v| v == "true" || v == "1" || v == "yes")
                .unwrap_or(false)
        };
        let opts = Self {
            log_all: truthy("log_all"),
            ip_forward: map
                .get("ip_forward")
                .map(|v| v == "true" || v == "1" || v == "yes")
                .unwrap_or(true),
            firewall_is_part_of_any_and_networks: truthy("firewall_is_part_of_any_and_networks"),
            ignore_empty_groups: truthy("ignore_empty_groups"),
            check_shading: truthy("check_shading"),
            bridging: truthy("bridging"),
            local_nat: truthy("local_nat"),
            accept_new_tcp_with_no_syn: truthy("accept_new_tcp_with_no_syn"),
            action_on_reject: map
                .get("action_on_reject")
                .cloned()
                .unwrap_or_else(|| "icmp-port-unreachable".into()),
            log_level: map.get("log_level").cloned().unwrap_or_else(|| "info".into()),
            log_prefix: map.get("log_prefix").cloned().unwrap_or_default(),
            mgmt_addr: map.get("mgmt_addr").cloned(),
        };
        let unknown = map
            .keys()
            .filter(|k| !Self::KNOWN_KEYS.contains(&k.as_str()))
            .cloned()
            .collect();
        (opts, unknown)
    }
}

/// Everything a stage may consult or record while processing rules. One
/// context lives for one (rule set, table) pipeline run; the driver carries
/// chain state and diagnostics across rule sets where required.
///
/// The context owns a scratch copy of the object graph: splitting and
/// expansion stages may add synthesized objects (networks covering an
/// address range, single addresses of a host) without touching the source
/// graph the driver loaded.
pub struct CompilerContext {
    pub store: ObjectStore,
    pub fw: ObjectId,
    pub cluster: Option<ObjectId>,
    pub family: Family,
    pub table: Table,
    pub rule_set: ObjectId,
    pub rule_set_name: String,
    pub rule_set_kind: RuleSetKind,
    pub top_rule_set: bool,
    pub options: FirewallOptions,
    pub diag: Diagnostics,
    pub chains: ChainRegistry,
    pub debug: Option<DebugFilter>,
    /// A CONNMARK save landed in OUTPUT; the driver adds the matching
    /// restore-mark rule to the predefined block.
    pub schedule_restore_mark: bool,
    iface_by_name: BTreeMap<String, ObjectId>,
}

impl CompilerContext {
    pub fn new(
        store: ObjectStore,
        fw: ObjectId,
        family: Family,
        table: Table,
        rule_set: ObjectId,
        kind: RuleSetKind,
    ) -> Self {
        let (options, unknown) = FirewallOptions::from_map(&store.get(fw).options);
        let mut diag = Diagnostics::new();
        for key in unknown {
            diag.warn(
                "firewall options",
                format!("unrecognized firewall option '{}'", key),
            );
        }
        let mut iface_by_name = BTreeMap::new();
        for iface in store.interfaces_of(fw) {
            iface_by_name.insert(store.get(iface).name.clone(), iface);
        }
        let name = store.get(rule_set).name.clone();
        let top = rule_set_top(&store, rule_set);
        let cluster = store.cluster_of(fw);
        Self {
            store,
            fw,
            cluster,
            family,
            table,
            rule_set,
            rule_set_name: name.clone(),
            rule_set_kind: kind,
            top_rule_set: top,
            options,
            diag,
            chains: ChainRegistry::new(&name),
            debug: None,
            schedule_restore_mark: false,
            iface_by_name,
        }
    }

    pub fn iface_by_name(&self, name: &str) -> Option<ObjectId> {
        self.iface_by_name.get(name).copied()
    }

    /// All interfaces of the target firewall, in declaration order.
    pub fn fw_interfaces(&self) -> Vec<ObjectId> {
        self.store.interfaces_of(self.fw)
    }

    pub fn debug_matches(&self, kind: RuleSetKind, position: usize) -> bool {
        self.debug
            .map(|f| f.kind == kind && f.position == position)
            .unwrap_or(false)
    }
}

fn rule_set_top(store: &ObjectStore, rule_set: ObjectId) -> bool {
    use fwforge_model::ObjectKind;
    match &store.get(rule_set).kind {
        ObjectKind::PolicyRuleSet(d) | ObjectKind::NatRuleSet(d) | ObjectKind::RoutingRuleSet(d) => {
            d.top
        }
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_default_ip_forward_on() {
        let map = BTreeMap::new();
        let (opts, unknown) = FirewallOptions::from_map(&map);
        assert!(opts.ip_forward);
        assert!(!opts.log_all);
        assert!(unknown.is_empty());
        assert_eq!(opts.action_on_reject, "icmp-port-unreachable");
    }

    #[test]
    fn unknown_option_keys_are_reported() {
        let mut map = BTreeMap::new();
        map.insert("log_all".to_string(), "true".to_string());
        map.insert("frobnicate".to_string(), "1".to_string());
        let (opts, unknown) = FirewallOptions::from_map(&map);
        assert!(opts.log_all);
        assert_eq!(unknown, vec!["frobnicate".to_string()]);
    }
}
