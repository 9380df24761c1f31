//! Early policy stages: table routing, action snapshots, interface and
//! direction normalization, negation expansion, logging and the
//! tag/classify/route split.

use crate::context::{CompilerContext, Table};
use crate::diag::CompileError;
use crate::pipeline::Stage;
use crate::rule::{CompilerRule, ElementSlot, PolicyRule};
use crate::stages::MapStage;
use fwforge_model::rules::{Action, Direction, RuleElement};
use fwforge_model::ObjectKind;

/// Global `log_all` override: force logging on every rule.
pub fn log_all() -> impl Stage<PolicyRule> {
    MapStage::new("log all", |ctx: &mut CompilerContext, mut rule: PolicyRule, out| {
        if ctx.options.log_all {
            rule.data.options.log = true;
        }
        out.push_back(rule);
        Ok(())
    })
}

/// True when a branch target rule set contains mangle-only work.
fn branch_has_mangle(ctx: &CompilerContext, rule: &PolicyRule) -> bool {
    let Some(target) = rule.data.options.branch_target else {
        return false;
    };
    ctx.store.children(target).any(|o| match &o.kind {
        ObjectKind::PolicyRule(r) => {
            r.options.tagging || r.options.classification || r.options.routing
        }
        _ => false,
    })
}

fn is_mangle_rule(ctx: &CompilerContext, rule: &PolicyRule) -> bool {
    let o = &rule.data.options;
    o.tagging
        || o.classification
        || o.routing
        || matches!(
            rule.data.action,
            Action::Tag | Action::Classify | Action::Route
        )
        || (rule.data.action == Action::Branch && branch_has_mangle(ctx, rule))
}

/// Route rules between the filter and mangle passes.
///
/// The mangle pass keeps only rules that do mangle work; the filter pass
/// drops rules whose action produces nothing outside mangle. A Reject in
/// mangle is illegal and aborts.
pub fn table_routing() -> impl Stage<PolicyRule> {
    MapStage::new("table routing", |ctx: &mut CompilerContext, rule: PolicyRule, out| {
        match ctx.table {
            Table::Mangle => {
                if rule.data.action == Action::Reject {
                    return Err(CompileError::abort(format!(
                        "rule '{}': action Reject cannot be used in the mangle table",
                        rule.data.label
                    )));
                }
                if is_mangle_rule(ctx, &rule) {
                    out.push_back(rule);
                }
            }
            _ => {
                // Pure mangle rules have no business in the filter table.
                let mangle_only = matches!(
                    rule.data.action,
                    Action::Tag | Action::Classify | Action::Route
                ) || (rule.data.action == Action::Continue
                    && is_mangle_rule(ctx, &rule)
                    && !rule.data.options.log);
                if !mangle_only {
                    out.push_back(rule);
                }
            }
        }
        Ok(())
    })
}

/// Snapshot the action and mangle options before later stages rewrite them.
pub fn store_action() -> impl Stage<PolicyRule> {
    MapStage::new("store action", |_ctx: &mut CompilerContext, mut rule: PolicyRule, out| {
        rule.aux.stored_action = Some(rule.data.action);
        rule.aux.originated_with_tagging = rule.data.options.tagging;
        rule.aux.originated_with_classification = rule.data.options.classification;
        rule.aux.originated_with_routing = rule.data.options.routing;
        out.push_back(rule);
        Ok(())
    })
}

/// Swap cluster interfaces for the member firewall's real interface.
pub fn replace_cluster_interfaces() -> impl Stage<PolicyRule> {
    MapStage::new(
        "cluster interfaces",
        |ctx: &mut CompilerContext, mut rule: PolicyRule, out| {
            let fw = ctx.fw;
            let mut replaced = Vec::new();
            for &id in &rule.data.itf.items {
                if !ctx.store.get(id).kind.is_interface() {
                    ctx.diag.warn(
                        &rule.data.label,
                        format!(
                            "'{}' is not an interface and cannot appear in the Interface element",
                            ctx.store.get(id).name
                        ),
                    );
                    continue;
                }
                if ctx.store.is_cluster_interface(id) {
                    match ctx.store.failover_member_iface(id, fw) {
                        Some(real) => replaced.push(real),
                        None => ctx.diag.warn(
                            &rule.data.label,
                            format!(
                                "cluster interface '{}' has no member interface for this firewall",
                                ctx.store.get(id).name
                            ),
                        ),
                    }
                } else {
                    replaced.push(id);
                }
            }
            rule.data.itf.items = replaced;
            out.push_back(rule);
            Ok(())
        },
    )
}

/// Interface negation: single object becomes an inline `!` prefix;
/// multiple objects are replaced with the complement over the firewall's
/// interfaces.
pub fn interface_negation() -> impl Stage<PolicyRule> {
    MapStage::new(
        "interface negation",
        |ctx: &mut CompilerContext, mut rule: PolicyRule, out| {
            if rule.data.itf.negated {
                if rule.data.itf.single().is_some() {
                    rule.aux.single_object_negation_itf = true;
                    rule.data.itf.negated = false;
                } else {
                    let excluded = rule.data.itf.items.clone();
                    let mut complement = Vec::new();
                    for iface in ctx.fw_interfaces() {
                        if excluded.contains(&iface) {
                            continue;
                        }
                        let d = ctx.store.iface_data(iface);
                        if d.loopback {
                            continue;
                        }
                        if d.bridge_port && !ctx.options.bridging {
                            continue;
                        }
                        if ctx.store.is_cluster_interface(iface) {
                            continue;
                        }
                        complement.push(iface);
                    }
                    rule.data.itf = RuleElement::of(complement);
                }
            }
            out.push_back(rule);
            Ok(())
        },
    )
}

/// Direction normalization. Splits "both" with a concrete interface into an
/// inbound and an outbound copy; resolves the wildcard/no-interface cases.
pub fn direction() -> impl Stage<PolicyRule> {
    MapStage::new("direction", |_ctx: &mut CompilerContext, mut rule: PolicyRule, out| {
        if rule.data.direction == Direction::Undefined {
            rule.data.direction = Direction::Both;
        }
        if rule.data.itf.is_any() {
            match rule.data.direction {
                Direction::Both => rule.aux.iface_none = true,
                _ => rule.aux.iface_wildcard = true,
            }
            out.push_back(rule);
        } else if rule.data.direction == Direction::Both {
            let mut inbound = rule.clone();
            inbound.data.direction = Direction::Inbound;
            let mut outbound = rule;
            outbound.data.direction = Direction::Outbound;
            out.push_back(inbound);
            out.push_back(outbound);
        } else {
            out.push_back(rule);
        }
        Ok(())
    })
}

/// A copy of `rule` living inside `chain`: match elements cleared, chain
/// assigned, limits intact. Used by the temp-chain expansions.
fn body_in_chain(rule: &PolicyRule, chain: &str) -> PolicyRule {
    let mut body = rule.clone();
    body.data.src.clear();
    body.data.dst.clear();
    body.data.srv.clear();
    body.data.itf.clear();
    body.data.time.clear();
    body.aux.single_object_negation_src = false;
    body.aux.single_object_negation_dst = false;
    body.aux.single_object_negation_srv = false;
    body.aux.single_object_negation_itf = false;
    body.aux.iface_wildcard = false;
    body.aux.iface_none = true;
    body.aux.chain = Some(chain.to_string());
    body.aux.in_temp_chain = true;
    body
}

fn jump_to_chain(rule: &PolicyRule, chain: &str) -> PolicyRule {
    let mut jump = rule.clone();
    jump.data.options.strip_log_and_limits();
    jump.data.options.stateless = true;
    jump.aux.target = Some(chain.to_string());
    jump
}

fn reject_needs_service(ctx: &CompilerContext, rule: &PolicyRule) -> bool {
    rule.data.action == Action::Reject
        && rule
            .data
            .options
            .reject_with
            .as_deref()
            .unwrap_or(&ctx.options.action_on_reject)
            == "tcp-reset"
}

/// Negation expansion for one element.
///
/// A single negated object that can be matched inline becomes a `!` prefix
/// flag; everything else turns into a three-rule temp chain (jump, RETURN
/// per negated object, action).
pub fn negation(slot: ElementSlot) -> impl Stage<PolicyRule> {
    let name = match slot {
        ElementSlot::Src => "negation in src",
        ElementSlot::Dst => "negation in dst",
        ElementSlot::Srv => "negation in srv",
        ElementSlot::Time => "negation in time",
        _ => "negation",
    };
    MapStage::new(name, move |ctx: &mut CompilerContext, mut rule: PolicyRule, out| {
        if !rule.element(slot).negated {
            out.push_back(rule);
            return Ok(());
        }

        // Inline `!` only works for one object, never for time, and never
        // for groups or addresses that expand to several or overlap the
        // firewall.
        let inline_ok = slot != ElementSlot::Time
            && rule.element(slot).single().map_or(false, |id| {
                if ctx.store.get(id).kind.is_group() {
                    return false;
                }
                match slot {
                    ElementSlot::Srv => true,
                    _ => {
                        !ctx.store.is_multi_address(id) && !ctx.store.complex_match(id, ctx.fw)
                    }
                }
            });
        if inline_ok {
            match slot {
                ElementSlot::Src => rule.aux.single_object_negation_src = true,
                ElementSlot::Dst => rule.aux.single_object_negation_dst = true,
                ElementSlot::Srv => rule.aux.single_object_negation_srv = true,
                _ => {}
            }
            rule.element_mut(slot).negated = false;
            out.push_back(rule);
            return Ok(());
        }

        let chain = ctx.chains.fresh_chain("neg", rule.data.position);
        let negated_items = rule.element(slot).items.clone();

        let mut jump = jump_to_chain(&rule, &chain);
        jump.element_mut(slot).clear();

        let mut ret = body_in_chain(&rule, &chain);
        *ret.element_mut(slot) = RuleElement::of(negated_items);
        ret.data.action = Action::Return;
        ret.data.options.strip_log_and_limits();
        ret.aux.target = Some("RETURN".into());

        let mut action = body_in_chain(&rule, &chain);
        if reject_needs_service(ctx, &rule) {
            action.data.srv = rule.data.srv.clone();
            action.data.srv.negated = false;
        }
        action.aux.upstream_rule_neg = true;
        if slot != ElementSlot::Srv {
            action.aux.srv_matched_upstream = true;
        }

        out.push_back(jump);
        out.push_back(ret);
        out.push_back(action);
        Ok(())
    })
}

/// Logging. A pure Continue rule becomes the LOG rule itself; any other
/// logged rule grows a temp chain with a LOG rule and the action rule.
pub fn logging() -> impl Stage<PolicyRule> {
    MapStage::new("logging", |ctx: &mut CompilerContext, mut rule: PolicyRule, out| {
        if !rule.data.options.log {
            out.push_back(rule);
            return Ok(());
        }
        let o = &rule.data.options;
        if rule.data.action == Action::Continue
            && !o.tagging
            && !o.classification
            && !o.routing
        {
            rule.aux.target = Some("LOG".into());
            out.push_back(rule);
            return Ok(());
        }

        let chain = ctx.chains.fresh_chain("log", rule.data.position);
        let jump = jump_to_chain(&rule, &chain);

        let mut log = body_in_chain(&rule, &chain);
        log.aux.target = Some("LOG".into());

        let mut action = body_in_chain(&rule, &chain);
        action.data.options.log = false;
        action.aux.srv_matched_upstream = true;
        if reject_needs_service(ctx, &rule) {
            action.data.srv = rule.data.srv.clone();
        }

        out.push_back(jump);
        out.push_back(log);
        out.push_back(action);
        Ok(())
    })
}

/// MARK, CLASSIFY and ROUTE are single targets; a rule asking for more than
/// one gets a jump into a temp chain with one Continue rule per option. A
/// tagging rule that also marks connections grows a CONNMARK save rule.
pub fn split_tag_classify_route() -> impl Stage<PolicyRule> {
    MapStage::new(
        "split mangle options",
        |ctx: &mut CompilerContext, mut rule: PolicyRule, out| {
            if ctx.table != Table::Mangle {
                out.push_back(rule);
                return Ok(());
            }
            let o = &rule.data.options;
            let set = [o.tagging, o.classification, o.routing]
                .iter()
                .filter(|b| **b)
                .count();
            let has_match = !rule.data.src.is_any()
                || !rule.data.dst.is_any()
                || !rule.data.srv.is_any()
                || !rule.data.itf.is_any();

            if set > 1 && has_match {
                let chain = ctx.chains.fresh_chain("opt", rule.data.position);
                out.push_back(jump_to_chain(&rule, &chain));
                for selector in ["tag", "classify", "route"] {
                    let applies = match selector {
                        "tag" => o.tagging,
                        "classify" => o.classification,
                        _ => o.routing,
                    };
                    if !applies {
                        continue;
                    }
                    let mut part = body_in_chain(&rule, &chain);
                    part.data.action = Action::Continue;
                    part.data.options.tagging = selector == "tag";
                    part.data.options.classification = selector == "classify";
                    part.data.options.routing = selector == "route";
                    if selector != "tag" {
                        part.data.options.mark_connections = false;
                    }
                    out.push_back(part);
                }
                return Ok(());
            }

            if o.tagging && o.mark_connections {
                rule.data.options.mark_connections = false;
                let mut save = rule.clone();
                save.data.action = Action::Continue;
                save.aux.connmark_save = true;
                save.data.options.strip_log_and_limits();
                out.push_back(rule);
                out.push_back(save);
                return Ok(());
            }

            out.push_back(rule);
            Ok(())
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RuleSetKind;
    use crate::pipeline::PipelineBuilder;
    use crate::stages::InjectRules;
    use fwforge_model::rules::{PolicyRuleData, RuleOptions};
    use fwforge_model::{ObjectId, ObjectStore};

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
        let eth0 = store.add(
            Some(fw),
            "eth0",
            ObjectKind::Interface(Default::default()),
        );
        store.add(
            Some(eth0),
            "eth0-ip",
            ObjectKind::Network("10.0.0.1/24".parse().unwrap()),
        );
        store.add(Some(fw), "Policy", ObjectKind::PolicyRuleSet(Default::default()));
        (store, fw)
    }

    fn ctx_for(store: ObjectStore, fw: ObjectId, table: Table) -> CompilerContext {
        let set = store.policies_of(fw)[0];
        CompilerContext::new(store, fw, fwforge_model::Family::V4, table, set, RuleSetKind::Policy)
    }

    fn base_rule() -> PolicyRule {
        PolicyRule::from_data(PolicyRuleData {
            src: RuleElement::any(),
            dst: RuleElement::any(),
            srv: RuleElement::any(),
            itf: RuleElement::any(),
            time: RuleElement::any(),
            direction: Direction::Both,
            action: Action::Accept,
            options: RuleOptions::default(),
            position: 0,
            label: "rule 0".into(),
            disabled: false,
            comment: String::new(),
        })
    }

    fn run_stage(
        ctx: &mut CompilerContext,
        stage: impl Stage<PolicyRule> + 'static,
        rules: Vec<PolicyRule>,
    ) -> Vec<PolicyRule> {
        PipelineBuilder::new(None)
            .add(InjectRules::new(rules))
            .add(stage)
            .build()
            .run(ctx)
            .unwrap()
    }

    #[test]
    fn direction_splits_both_with_interface() {
        let (mut store, fw) = fixture();
        let eth0 = store.interfaces_of(fw)[0];
        let mut rule = base_rule();
        rule.data.itf = RuleElement::of(vec![eth0]);
        let mut ctx = ctx_for(store, fw, Table::Filter);
        let got = run_stage(&mut ctx, direction(), vec![rule]);
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].data.direction, Direction::Inbound);
        assert_eq!(got[1].data.direction, Direction::Outbound);
    }

    #[test]
    fn direction_wildcard_for_any_iface_inbound() {
        let (store, fw) = fixture();
        let mut rule = base_rule();
        rule.data.direction = Direction::Inbound;
        let mut ctx = ctx_for(store, fw, Table::Filter);
        let got = run_stage(&mut ctx, direction(), vec![rule]);
        assert_eq!(got.len(), 1);
        assert!(got[0].aux.iface_wildcard);
        assert!(!got[0].aux.iface_none);
    }

    #[test]
    fn single_object_negation_sets_flag() {
        let (mut store, fw) = fixture();
        let host = store.add(None, "h", ObjectKind::Ipv4Address("192.0.2.9".parse().unwrap()));
        let mut rule = base_rule();
        rule.data.src = RuleElement {
            items: vec![host],
            negated: true,
        };
        let mut ctx = ctx_for(store, fw, Table::Filter);
        let got = run_stage(&mut ctx, negation(ElementSlot::Src), vec![rule]);
        assert_eq!(got.len(), 1);
        assert!(got[0].aux.single_object_negation_src);
        assert!(!got[0].data.src.negated);
    }

    #[test]
    fn multi_object_negation_builds_temp_chain() {
        let (mut store, fw) = fixture();
        let a = store.add(None, "a", ObjectKind::Network("10.0.0.0/8".parse().unwrap()));
        let b = store.add(None, "b", ObjectKind::Network("172.16.0.0/12".parse().unwrap()));
        let mut rule = base_rule();
        rule.data.src = RuleElement {
            items: vec![a, b],
            negated: true,
        };
        let mut ctx = ctx_for(store, fw, Table::Filter);
        let got = run_stage(&mut ctx, negation(ElementSlot::Src), vec![rule]);
        assert_eq!(got.len(), 3);
        let chain = got[0].aux.target.clone().unwrap();
        assert_eq!(got[1].aux.chain.as_deref(), Some(chain.as_str()));
        assert_eq!(got[1].aux.target.as_deref(), Some("RETURN"));
        assert_eq!(got[1].data.src.items, vec![a, b]);
        assert!(!got[1].data.src.negated);
        assert_eq!(got[2].aux.chain.as_deref(), Some(chain.as_str()));
        assert_eq!(got[2].data.action, Action::Accept);
        assert!(got[2].data.src.is_any());
        assert!(got[2].aux.upstream_rule_neg);
    }

    #[test]
    fn negated_network_containing_fw_uses_temp_chain() {
        let (mut store, fw) = fixture();
        // 10.0.0.0/24 contains the firewall's own address.
        let lan = store.add(None, "lan", ObjectKind::Network("10.0.0.0/24".parse().unwrap()));
        let mut rule = base_rule();
        rule.data.src = RuleElement {
            items: vec![lan],
            negated: true,
        };
        let mut ctx = ctx_for(store, fw, Table::Filter);
        let got = run_stage(&mut ctx, negation(ElementSlot::Src), vec![rule]);
        assert_eq!(got.len(), 3, "complex match must not use inline negation");
    }

    #[test]
    fn logging_wraps_action_in_temp_chain() {
        let (store, fw) = fixture();
        let mut rule = base_rule();
        rule.data.options.log = true;
        let mut ctx = ctx_for(store, fw, Table::Filter);
        let got = run_stage(&mut ctx, logging(), vec![rule]);
        assert_eq!(got.len(), 3);
        assert!(got[0].aux.target.is_some());
        assert_eq!(got[1].aux.target.as_deref(), Some("LOG"));
        assert!(got[1].data.src.is_any());
        assert_eq!(got[2].data.action, Action::Accept);
        assert!(!got[2].data.options.log);
    }

    #[test]
    fn continue_log_rule_becomes_log_target() {
        let (store, fw) = fixture();
        let mut rule = base_rule();
        rule.data.action = Action::Continue;
        rule.data.options.log = true;
        let mut ctx = ctx_for(store, fw, Table::Filter);
        let got = run_stage(&mut ctx, logging(), vec![rule]);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].aux.target.as_deref(), Some("LOG"));
    }

    #[test]
    fn reject_in_mangle_aborts() {
        let (store, fw) = fixture();
        let mut rule = base_rule();
        rule.data.action = Action::Reject;
        rule.data.options.tagging = true;
        let mut ctx = ctx_for(store, fw, Table::Mangle);
        let err = PipelineBuilder::new(None)
            .add(InjectRules::new(vec![rule]))
            .add(table_routing())
            .build()
            .run(&mut ctx)
            .unwrap_err();
        assert!(matches!(err, CompileError::Abort(_)));
    }

    #[test]
    fn filter_pass_drops_pure_mangle_rules() {
        let (store, fw) = fixture();
        let mut tag_rule = base_rule();
        tag_rule.data.action = Action::Tag;
        let keep_rule = base_rule();
        let mut ctx = ctx_for(store, fw, Table::Filter);
        let got = run_stage(&mut ctx, table_routing(), vec![tag_rule, keep_rule]);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].data.action, Action::Accept);
    }
}
