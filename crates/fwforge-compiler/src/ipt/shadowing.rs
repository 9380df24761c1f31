//! Shadow detection.
//!
//! Runs before the main compile, over a more aggressively atomized form of
//! the rule set: every rule is expanded over Source × Destination ×
//! Service. A rule is shadowed when an earlier rule with a terminating
//! action matches a strict superset of its packets; that is a hard error
//! pointing at both rules.

use crate::context::CompilerContext;
use crate::diag::CompileError;
use crate::pipeline::PipelineBuilder;
use crate::rule::{CompilerRule, PolicyRule};
use crate::stages::{ExpandGroups, InjectRules, MapStage};
use fwforge_model::rules::Action;
use fwforge_model::{ObjectId, ObjectKind};
use ipnet::IpNet;

fn as_net(ctx: &CompilerContext, id: ObjectId) -> Option<IpNet> {
    match &ctx.store.get(id).kind {
        ObjectKind::Ipv4Address(a) => Some(fwforge_model::address::host_net((*a).into())),
        ObjectKind::Ipv6Address(a) => Some(fwforge_model::address::host_net((*a).into())),
        ObjectKind::Network(n) => Some(IpNet::V4(*n)),
        ObjectKind::NetworkV6(n) => Some(IpNet::V6(*n)),
        _ => None,
    }
}

/// Does object `a` match at least every address `b` matches?
fn addr_covers(ctx: &CompilerContext, a: ObjectId, b: ObjectId) -> bool {
    if a == b {
        return true;
    }
    match (as_net(ctx, a), as_net(ctx, b)) {
        (Some(na), Some(nb)) => na.contains(&nb),
        _ => false,
    }
}

/// Does element `a` (≤1 object after atomization) cover element `b`?
///
/// An empty element is "any". "Any" covers the firewall's own addresses
/// only when `firewall_is_part_of_any_and_networks` is set; otherwise a
/// rule that names the firewall is not hidden behind a FORWARD-only "any"
/// rule.
fn element_covers(
    ctx: &CompilerContext,
    a: &[ObjectId],
    b: &[ObjectId],
) -> bool {
    match (a.first(), b.first()) {
        (None, None) => true,
        (None, Some(&bid)) => {
            if ctx.store.matches_firewall(bid, ctx.fw) {
                ctx.options.firewall_is_part_of_any_and_networks
            } else {
                true
            }
        }
        (Some(_), None) => false,
        (Some(&aid), Some(&bid)) => addr_covers(ctx, aid, bid),
    }
}

fn service_covers(ctx: &CompilerContext, a: &[ObjectId], b: &[ObjectId]) -> bool {
    use fwforge_model::ObjectKind as K;
    match (a.first(), b.first()) {
        (None, _) => true,
        (Some(_), None) => false,
        (Some(&aid), Some(&bid)) => {
            if aid == bid {
                return true;
            }
            match (&ctx.store.get(aid).kind, &ctx.store.get(bid).kind) {
                (
                    K::TcpService { src: asrc, dst: adst, .. },
                    K::TcpService { src: bsrc, dst: bdst, .. },
                )
                | (
                    K::UdpService { src: asrc, dst: adst },
                    K::UdpService { src: bsrc, dst: bdst },
                ) => {
                    let covers = |a: &fwforge_model::PortRange, b: &fwforge_model::PortRange| {
                        a.is_any() || (a.start <= b.start && b.end <= a.end && !b.is_any())
                    };
                    covers(asrc, bsrc) && covers(adst, bdst)
                }
                (K::IpService { protocol: pa }, K::IpService { protocol: pb }) => pa == pb,
                (
                    K::IcmpService { icmp_type: ta, icmp_code: ca },
                    K::IcmpService { icmp_type: tb, icmp_code: cb },
                ) => *ta == -1 || (ta == tb && (*ca == -1 || ca == cb)),
                _ => false,
            }
        }
    }
}

fn shadows(ctx: &CompilerContext, earlier: &PolicyRule, later: &PolicyRule) -> bool {
    if !earlier.data.action.is_terminating() {
        return false;
    }
    // Time-restricted rules never count, either way.
    if !earlier.data.time.is_any() || !later.data.time.is_any() {
        return false;
    }
    if earlier.data.src.negated
        || earlier.data.dst.negated
        || earlier.data.srv.negated
        || later.data.src.negated
        || later.data.dst.negated
        || later.data.srv.negated
    {
        return false;
    }
    element_covers(ctx, &earlier.data.src.items, &later.data.src.items)
        && element_covers(ctx, &earlier.data.dst.items, &later.data.dst.items)
        && service_covers(ctx, &earlier.data.srv.items, &later.data.srv.items)
}

/// Fully atomize over Source × Destination × Service.
fn atomize_for_shadowing() -> impl crate::pipeline::Stage<PolicyRule> {
    MapStage::new("shadowing atomize", |_ctx: &mut CompilerContext, rule: PolicyRule, out| {
        let expand = |items: &[ObjectId]| -> Vec<Option<ObjectId>> {
            if items.is_empty() {
                vec![None]
            } else {
                items.iter().copied().map(Some).collect()
            }
        };
        for src in expand(&rule.data.src.items) {
            for dst in expand(&rule.data.dst.items) {
                for srv in expand(&rule.data.srv.items) {
                    let mut atom = rule.clone();
                    atom.data.src.items = src.into_iter().collect();
                    atom.data.dst.items = dst.into_iter().collect();
                    atom.data.srv.items = srv.into_iter().collect();
                    out.push_back(atom);
                }
            }
        }
        Ok(())
    })
}

/// Abort when any rule is fully shadowed by an earlier one.
pub fn check(ctx: &mut CompilerContext, rules: Vec<PolicyRule>) -> Result<(), CompileError> {
    let mut pipeline = PipelineBuilder::new(None)
        .add(InjectRules::new(rules))
        .add(ExpandGroups::new(PolicyRule::slots()))
        .add(atomize_for_shadowing())
        .build();
    let atoms = pipeline.run(ctx)?;

    for later_idx in 1..atoms.len() {
        let later = &atoms[later_idx];
        for earlier in &atoms[..later_idx] {
            if earlier.data.position == later.data.position {
                continue;
            }
            if shadows(ctx, earlier, later) {
                return Err(CompileError::abort(format!(
                    "rule '{}' is shadowed by rule '{}' above it",
                    later.data.label, earlier.data.label
                )));
            }
        }
    }
    Ok(())
}
