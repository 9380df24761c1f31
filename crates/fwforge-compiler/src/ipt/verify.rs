//! Validation stages: family purity and the pre-emission checks.

use crate::context::CompilerContext;
use crate::ipt::services::{proto_of, ProtoGroup};
use crate::pipeline::Stage;
use crate::rule::PolicyRule;
use crate::stages::MapStage;
use fwforge_model::{Family, ObjectId, ObjectKind};

fn service_family(group: &ProtoGroup) -> Option<Family> {
    match group {
        ProtoGroup::Icmp => Some(Family::V4),
        ProtoGroup::Icmp6 => Some(Family::V6),
        _ => None,
    }
}

/// Drop wrong-family services; drop the rule when nothing is left.
pub fn drop_wrong_family_services() -> impl Stage<PolicyRule> {
    MapStage::new("service family", |ctx: &mut CompilerContext, mut rule: PolicyRule, out| {
        if rule.data.srv.is_any() {
            out.push_back(rule);
            return Ok(());
        }
        let family = ctx.family;
        let keep: Vec<ObjectId> = rule
            .data
            .srv
            .items
            .iter()
            .copied()
            .filter(|id| {
                service_family(&proto_of(ctx, *id)).map_or(true, |f| f == family)
            })
            .collect();
        if keep.is_empty() {
            return Ok(());
        }
        rule.data.srv.items = keep;
        out.push_back(rule);
        Ok(())
    })
}

/// Drop rules bound to interfaces with no address in the current family.
/// Dynamic, unnumbered, bridge-port and dedicated-failover interfaces are
/// exempt: their addresses are unknown or irrelevant at compile time.
pub fn drop_wrong_family_interfaces() -> impl Stage<PolicyRule> {
    MapStage::new("interface family", |ctx: &mut CompilerContext, mut rule: PolicyRule, out| {
        if rule.data.itf.is_any() {
            out.push_back(rule);
            return Ok(());
        }
        let family = ctx.family;
        let keep: Vec<ObjectId> = rule
            .data
            .itf
            .items
            .iter()
            .copied()
            .filter(|id| {
                let d = ctx.store.iface_data(*id);
                if d.dynamic || d.unnumbered || d.bridge_port || d.dedicated_failover {
                    return true;
                }
                ctx.store
                    .interface_addresses(*id)
                    .iter()
                    .any(|a| fwforge_model::address::family_of(a) == family)
            })
            .collect();
        if keep.is_empty() {
            ctx.diag.warn(
                &rule.data.label,
                format!(
                    "rule dropped: interface has no {} address",
                    ctx.family.as_str()
                ),
            );
            return Ok(());
        }
        rule.data.itf.items = keep;
        out.push_back(rule);
        Ok(())
    })
}

/// The pre-emission validation battery. Errors attach to the rule and do
/// not stop the pipeline.
pub fn final_checks() -> impl Stage<PolicyRule> {
    MapStage::new("verify", |ctx: &mut CompilerContext, rule: PolicyRule, out| {
        for (slot_name, element) in [("Source", &rule.data.src), ("Destination", &rule.data.dst)] {
            for &id in &element.items {
                let obj = ctx.store.get(id);
                match &obj.kind {
                    ObjectKind::Ipv4Address(a) if a.is_unspecified() => {
                        ctx.diag.error(
                            &rule.data.label,
                            format!("{}: address 0.0.0.0 in '{}' does not match anything", slot_name, obj.name),
                        );
                    }
                    ObjectKind::Network(n) if n.prefix_len() == 0 => {
                        ctx.diag.error(
                            &rule.data.label,
                            format!(
                                "{}: network '{}' with /0 mask; use \"any\" instead",
                                slot_name, obj.name
                            ),
                        );
                    }
                    ObjectKind::Interface(d) if d.unnumbered => {
                        ctx.diag.error(
                            &rule.data.label,
                            format!("{}: unnumbered interface '{}' has no address", slot_name, obj.name),
                        );
                    }
                    ObjectKind::PhysAddress { .. }
                        if rule.aux.chain.as_deref() == Some("OUTPUT") =>
                    {
                        ctx.diag.error(
                            &rule.data.label,
                            "MAC address match cannot be used in the OUTPUT chain",
                        );
                    }
                    _ => {}
                }
                if let Some(err) = &obj.resolve_error {
                    ctx.diag.error(
                        &rule.data.label,
                        format!("object '{}' failed to resolve: {}", obj.name, err),
                    );
                }
            }
        }
        for &id in &rule.data.srv.items {
            if matches!(ctx.store.get(id).kind, ObjectKind::UserService { .. })
                && rule.aux.chain.as_deref() != Some("OUTPUT")
            {
                ctx.diag.error(
                    &rule.data.label,
                    "owner match (user service) only works in the OUTPUT chain",
                );
            }
        }
        out.push_back(rule);
        Ok(())
    })
}
