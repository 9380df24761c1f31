//! The routing pipeline: a short stage list ending in `ip route` commands.

use crate::context::CompilerContext;
use crate::pipeline::{Pipeline, PipelineBuilder, Stage};
use crate::rule::{CompilerRule, RoutingRule};
use crate::stages::{CountRules, EliminateDuplicates, ExpandGroups, InjectRules, MapStage};
use fwforge_model::{ObjectId, ObjectKind};

pub fn collect_routing_rules(ctx: &CompilerContext) -> Vec<RoutingRule> {
    ctx.store
        .children(ctx.rule_set)
        .filter_map(|o| match &o.kind {
            ObjectKind::RoutingRule(data) if !data.disabled => {
                Some(RoutingRule::from_data(data.clone()))
            }
            _ => None,
        })
        .collect()
}

/// A route needs exactly one gateway or one interface. Multiple gateways
/// would be ECMP, which this backend does not emit.
fn validate() -> impl Stage<RoutingRule> {
    MapStage::new("validate route", |ctx: &mut CompilerContext, mut rule: RoutingRule, out| {
        if rule.data.gateway.len() > 1 {
            ctx.diag.warn(
                &rule.data.label,
                "multiple gateways (ECMP) are not supported; using the first one",
            );
            rule.data.gateway.items.truncate(1);
        }
        if rule.data.gateway.is_any() && rule.data.itf.is_any() {
            ctx.diag.error(
                &rule.data.label,
                "routing rule needs a gateway or an interface; rule dropped",
            );
            return Ok(());
        }
        if rule.data.dst.is_any() {
            rule.aux.default_route = true;
        }
        out.push_back(rule);
        Ok(())
    })
}

/// One route per destination object.
fn atomize() -> impl Stage<RoutingRule> {
    MapStage::new("route atomize", |_ctx: &mut CompilerContext, rule: RoutingRule, out| {
        if rule.data.dst.len() <= 1 {
            out.push_back(rule);
            return Ok(());
        }
        for &dst in &rule.data.dst.items {
            let mut atom = rule.clone();
            atom.data.dst.items = vec![dst];
            out.push_back(atom);
        }
        Ok(())
    })
}

pub fn build_routing_pipeline(
    ctx: &CompilerContext,
    rules: Vec<RoutingRule>,
) -> Pipeline<RoutingRule> {
    let debug = ctx.debug.map(|f| (f.kind, f.position));
    PipelineBuilder::new(debug)
        .add(InjectRules::new(rules))
        .add(CountRules::new())
        .add(ExpandGroups::new(RoutingRule::slots()))
        .add(EliminateDuplicates::new(RoutingRule::slots()))
        .add(validate())
        .add(atomize())
        .build()
}

fn dst_text(ctx: &CompilerContext, rule: &RoutingRule) -> String {
    if rule.aux.default_route {
        return "default".into();
    }
    match rule.data.dst.items.first().map(|id| &ctx.store.get(*id).kind) {
        Some(ObjectKind::Network(n)) => n.to_string(),
        Some(ObjectKind::NetworkV6(n)) => n.to_string(),
        Some(ObjectKind::Ipv4Address(a)) => format!("{}/32", a),
        Some(ObjectKind::Ipv6Address(a)) => format!("{}/128", a),
        _ => "default".into(),
    }
}

fn gateway_text(ctx: &CompilerContext, id: ObjectId) -> Option<String> {
    ctx.store
        .addresses_of(id, Some(ctx.family))
        .first()
        .map(|a| a.to_string())
}

/// Render `ip route add` lines.
pub fn emit_routes(ctx: &CompilerContext, rules: &[RoutingRule]) -> String {
    let mut lines = Vec::new();
    for rule in rules {
        let mut cmd = format!("ip route add {}", dst_text(ctx, rule));
        if let Some(gw) = rule
            .data
            .gateway
            .items
            .first()
            .and_then(|id| gateway_text(ctx, *id))
        {
            cmd.push_str(&format!(" via {}", gw));
        }
        if let Some(&itf) = rule.data.itf.items.first() {
            cmd.push_str(&format!(" dev {}", ctx.store.get(itf).name));
        }
        if rule.data.metric > 0 {
            cmd.push_str(&format!(" metric {}", rule.data.metric));
        }
        lines.push(cmd);
    }
    let mut text = lines.join("\n");
    if !text.is_empty() {
        text.push('\n');
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{RuleSetKind, Table};
    use fwforge_model::rules::{RoutingRuleData, RuleElement, RuleOptions};
    use fwforge_model::ObjectStore;

    fn fixture() -> (ObjectStore, ObjectId) {
        let mut store = ObjectStore::new();
        let fw = store.add(
            None,
            "fw",
            ObjectKind::Firewall {
                platform: "iptables".into(),
                host_os: "linux".into(),
            },
        );
        store.add(Some(fw), "eth0", ObjectKind::Interface(Default::default()));
        store.add(Some(fw), "Routing", ObjectKind::RoutingRuleSet(Default::default()));
        (store, fw)
    }

    fn ctx_for(store: ObjectStore, fw: ObjectId) -> CompilerContext {
        let set = store.routings_of(fw)[0];
        CompilerContext::new(
            store,
            fw,
            fwforge_model::Family::V4,
            Table::Filter,
            set,
            RuleSetKind::Routing,
        )
    }

    fn route(
        dst: Vec<ObjectId>,
        gw: Vec<ObjectId>,
        itf: Vec<ObjectId>,
        metric: u32,
    ) -> RoutingRule {
        RoutingRule::from_data(RoutingRuleData {
            dst: RuleElement::of(dst),
            gateway: RuleElement::of(gw),
            itf: RuleElement::of(itf),
            metric,
            options: RuleOptions::default(),
            position: 0,
            label: "route 0".into(),
            disabled: false,
            comment: String::new(),
        })
    }

    #[test]
    fn emits_route_with_gateway_and_metric() {
        let (mut store, fw) = fixture();
        let net = store.add(None, "lan", ObjectKind::Network("192.0.2.0/24".parse().unwrap()));
        let gw = store.add(None, "gw", ObjectKind::Ipv4Address("10.0.0.254".parse().unwrap()));
        let mut ctx = ctx_for(store, fw);
        let rules = build_routing_pipeline(&ctx, vec![route(vec![net], vec![gw], vec![], 5)])
            .run(&mut ctx)
            .unwrap();
        let text = emit_routes(&ctx, &rules);
        assert_eq!(text, "ip route add 192.0.2.0/24 via 10.0.0.254 metric 5\n");
    }

    #[test]
    fn empty_destination_is_default_route() {
        let (mut store, fw) = fixture();
        let gw = store.add(None, "gw", ObjectKind::Ipv4Address("10.0.0.254".parse().unwrap()));
        let mut ctx = ctx_for(store, fw);
        let rules = build_routing_pipeline(&ctx, vec![route(vec![], vec![gw], vec![], 0)])
            .run(&mut ctx)
            .unwrap();
        assert!(rules[0].aux.default_route);
        let text = emit_routes(&ctx, &rules);
        assert_eq!(text, "ip route add default via 10.0.0.254\n");
    }

    #[test]
    fn route_without_gateway_or_iface_is_dropped() {
        let (mut store, fw) = fixture();
        let net = store.add(None, "lan", ObjectKind::Network("192.0.2.0/24".parse().unwrap()));
        let mut ctx = ctx_for(store, fw);
        let rules = build_routing_pipeline(&ctx, vec![route(vec![net], vec![], vec![], 0)])
            .run(&mut ctx)
            .unwrap();
        assert!(rules.is_empty());
        assert!(ctx.diag.has_errors());
    }
}
