//! Address expansion and the final cartesian atomization.

use crate::context::CompilerContext;
use crate::ipt::{scratch_addr, scratch_net_v4, ADDR_SLOTS};
use crate::pipeline::Stage;
use crate::rule::{CompilerRule, ElementSlot, PolicyRule};
use crate::stages::MapStage;
use fwforge_model::address::{range_to_cidrs_v4, sort_key};
use fwforge_model::{Family, ObjectId, ObjectKind};
use std::net::IpAddr;

/// Concrete sort key of an object for deterministic element ordering;
/// objects without a compile-time address (runtime DNS names, address
/// tables) sort last, by name.
fn addr_sort_key(ctx: &CompilerContext, id: ObjectId) -> (u8, u128, String) {
    let addrs = ctx.store.addresses_of(id, None);
    match addrs.first() {
        Some(a) => (0, sort_key(a), String::new()),
        None => (1, 0, ctx.store.get(id).name.clone()),
    }
}

fn expand_host_like(
    ctx: &mut CompilerContext,
    host: ObjectId,
    rule_on_loopback: bool,
    out: &mut Vec<ObjectId>,
) {
    let name = ctx.store.get(host).name.clone();
    let family = ctx.family;
    let mut addrs: Vec<IpAddr> = Vec::new();
    for iface in ctx.store.interfaces_of(host) {
        let data = ctx.store.iface_data(iface).clone();
        if data.loopback && !rule_on_loopback {
            continue;
        }
        if data.bridge_port {
            continue;
        }
        // A cluster interface stands for the member firewall's real one.
        let source_iface = if ctx.store.is_cluster_interface(iface) {
            ctx.store.failover_member_iface(iface, ctx.fw).unwrap_or(iface)
        } else {
            iface
        };
        for addr in ctx.store.interface_addresses(source_iface) {
            if fwforge_model::address::family_of(&addr) == family {
                addrs.push(addr);
            }
        }
    }
    addrs.sort_by_key(sort_key);
    addrs.dedup();
    for addr in addrs {
        out.push(scratch_addr(ctx, &name, addr));
    }
}

/// Expand one element's objects into atomic address objects. Shared by the
/// policy and NAT pipelines; the result is sorted by address value.
pub(crate) fn expand_items(
    ctx: &mut CompilerContext,
    label: &str,
    items: &[ObjectId],
    rule_on_loopback: bool,
) -> Vec<ObjectId> {
    let mut expanded: Vec<ObjectId> = Vec::new();
    for &id in items {
        match ctx.store.get(id).kind.clone() {
            ObjectKind::AddressRange { start, end } => match (start, end) {
                (IpAddr::V4(s), IpAddr::V4(e)) => {
                    if ctx.family != Family::V4 {
                        continue;
                    }
                    let name = ctx.store.get(id).name.clone();
                    for net in range_to_cidrs_v4(s, e) {
                        if net.prefix_len() == 32 {
                            expanded.push(scratch_addr(ctx, &name, IpAddr::V4(net.addr())));
                        } else {
                            expanded.push(scratch_net_v4(ctx, &name, net));
                        }
                    }
                }
                // IPv6 ranges stay ranges; the emitter uses iprange.
                _ => expanded.push(id),
            },
            ObjectKind::Host | ObjectKind::Firewall { .. } | ObjectKind::Cluster { .. } => {
                expand_host_like(ctx, id, rule_on_loopback, &mut expanded);
            }
            ObjectKind::Interface(data) => {
                if data.dynamic {
                    ctx.diag.warn(
                        label,
                        format!(
                            "dynamic interface '{}' has no address at compile time",
                            ctx.store.get(id).name
                        ),
                    );
                    continue;
                }
                let name = ctx.store.get(id).name.clone();
                let family = ctx.family;
                let addrs: Vec<IpAddr> = ctx
                    .store
                    .interface_addresses(id)
                    .into_iter()
                    .filter(|a| fwforge_model::address::family_of(a) == family)
                    .collect();
                for addr in addrs {
                    expanded.push(scratch_addr(ctx, &name, addr));
                }
            }
            ObjectKind::DnsName {
                run_time: false,
                resolved,
                ..
            } => {
                let name = ctx.store.get(id).name.clone();
                let family = ctx.family;
                let mut addrs: Vec<IpAddr> = resolved
                    .into_iter()
                    .filter(|a| fwforge_model::address::family_of(a) == family)
                    .collect();
                addrs.sort_by_key(sort_key);
                for addr in addrs {
                    expanded.push(scratch_addr(ctx, &name, addr));
                }
            }
            ObjectKind::AddressTable {
                run_time: false,
                resolved,
                ..
            } => {
                let name = ctx.store.get(id).name.clone();
                for net in resolved {
                    match net {
                        ipnet::IpNet::V4(n) if ctx.family == Family::V4 => {
                            expanded.push(scratch_net_v4(ctx, &name, n));
                        }
                        ipnet::IpNet::V6(n) if ctx.family == Family::V6 => {
                            expanded.push(ctx.store.add(
                                None,
                                format!("{}:{}", name, n),
                                ObjectKind::NetworkV6(n),
                            ));
                        }
                        _ => {}
                    }
                }
            }
            _ => expanded.push(id),
        }
    }
    expanded.sort_by(|a, b| addr_sort_key(ctx, *a).cmp(&addr_sort_key(ctx, *b)));
    expanded
}

/// Expand compound address objects into atomic ones: ranges become CIDR
/// sets (IPv4) or stay ranges (IPv6, matched with iprange); hosts,
/// firewalls and clusters become their interface addresses; resolved DNS
/// names and compile-time address tables become their addresses.
pub fn expand_addresses() -> impl Stage<PolicyRule> {
    MapStage::new("expand addresses", |ctx: &mut CompilerContext, mut rule: PolicyRule, out| {
        let rule_on_loopback = rule.aux.on_loopback
            || rule
                .data
                .itf
                .items
                .iter()
                .any(|id| ctx.store.iface_data(*id).loopback);

        for &slot in &ADDR_SLOTS {
            if rule.element(slot).is_any() {
                continue;
            }
            let items = rule.element(slot).items.clone();
            let label = rule.data.label.clone();
            let expanded = expand_items(ctx, &label, &items, rule_on_loopback);
            if expanded.is_empty() {
                ctx.diag.warn(
                    &rule.data.label,
                    format!("rule dropped: {} has no address in this family", slot.label()),
                );
                return Ok(());
            }
            rule.element_mut(slot).items = expanded;
        }
        out.push_back(rule);
        Ok(())
    })
}

/// Cartesian product over Source × Destination, then over time intervals.
/// After this stage each rule carries at most one object per positional
/// element.
pub fn atomize() -> impl Stage<PolicyRule> {
    MapStage::new("atomize", |_ctx: &mut CompilerContext, rule: PolicyRule, out| {
        let srcs: Vec<Option<ObjectId>> = if rule.data.src.is_any() {
            vec![None]
        } else {
            rule.data.src.items.iter().copied().map(Some).collect()
        };
        let dsts: Vec<Option<ObjectId>> = if rule.data.dst.is_any() {
            vec![None]
        } else {
            rule.data.dst.items.iter().copied().map(Some).collect()
        };
        let times: Vec<Option<ObjectId>> = if rule.data.time.is_any() {
            vec![None]
        } else {
            rule.data.time.items.iter().copied().map(Some).collect()
        };
        for &src in &srcs {
            for &dst in &dsts {
                for &time in &times {
                    let mut atom = rule.clone();
                    atom.data.src.items = src.into_iter().collect();
                    atom.data.dst.items = dst.into_iter().collect();
                    atom.data.time.items = time.into_iter().collect();
                    out.push_back(atom);
                }
            }
        }
        Ok(())
    })
}
