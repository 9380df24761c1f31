//! Chain assignment: the any-includes-firewall split, firewall-overlap
//! splitting, per-interface atomization, the final chain cascade, target
//! selection, firewall-reference stripping and chain usage counting.

use crate::context::{CompilerContext, Table};
use crate::diag::CompileError;
use crate::ipt::{element_matches_fw, scratch_addr, scratch_net_v4};
use crate::pipeline::{Stage, StepResult, Upstream};
use crate::rule::{CompilerRule, ElementSlot, PolicyRule};
use crate::stages::MapStage;
use fwforge_model::rules::{Action, Direction, RuleElement};
use fwforge_model::{ObjectId, ObjectKind};
use std::collections::VecDeque;

/// When `firewall_is_part_of_any_and_networks` is on, "any" includes the
/// firewall itself, which FORWARD alone cannot express. Add an OUTPUT copy
/// for Source=any and an INPUT copy for Destination=any.
pub fn split_if_any_includes_fw() -> impl Stage<PolicyRule> {
    MapStage::new(
        "any includes firewall",
        |ctx: &mut CompilerContext, rule: PolicyRule, out| {
            if !ctx.options.firewall_is_part_of_any_and_networks
                || rule.aux.chain.is_some()
                || rule.aux.in_temp_chain
            {
                out.push_back(rule);
                return Ok(());
            }
            let mangle_classify = ctx.table == Table::Mangle && rule.data.options.classification;
            let src_any = rule.data.src.is_any() || rule.aux.single_object_negation_src;
            let dst_any = rule.data.dst.is_any() || rule.aux.single_object_negation_dst;

            let mut copies = Vec::new();
            if dst_any && rule.data.direction != Direction::Outbound {
                let mut c = rule.clone();
                c.aux.chain = Some(if mangle_classify { "PREROUTING" } else { "INPUT" }.into());
                if c.data.dst.is_any() {
                    c.data.dst = RuleElement::of(vec![ctx.fw]);
                }
                c.data.direction = Direction::Inbound;
                copies.push(c);
            }
            if src_any && rule.data.direction != Direction::Inbound {
                // A bridging firewall would need physdev-out semantics that
                // OUTPUT cannot express.
                if !ctx.options.bridging {
                    let mut c = rule.clone();
                    c.aux.chain =
                        Some(if mangle_classify { "POSTROUTING" } else { "OUTPUT" }.into());
                    if c.data.src.is_any() {
                        c.data.src = RuleElement::of(vec![ctx.fw]);
                    }
                    c.data.direction = Direction::Outbound;
                    c.aux.iface_wildcard = false;
                    copies.push(c);
                }
            }
            out.push_back(rule);
            for c in copies {
                out.push_back(c);
            }
            Ok(())
        },
    )
}

/// Mangle-table chain selection and the CONNMARK restore bookkeeping.
pub fn mangle_chains() -> impl Stage<PolicyRule> {
    MapStage::new("mangle chains", |ctx: &mut CompilerContext, mut rule: PolicyRule, out| {
        if ctx.table != Table::Mangle {
            out.push_back(rule);
            return Ok(());
        }
        if rule.aux.chain.is_none() && !rule.aux.in_temp_chain {
            let o = &rule.data.options;
            let chain = match rule.data.direction {
                Direction::Inbound => "PREROUTING",
                Direction::Outbound => "POSTROUTING",
                _ => {
                    if o.tagging && o.routing {
                        "POSTROUTING"
                    } else if o.tagging {
                        "PREROUTING"
                    } else {
                        "POSTROUTING"
                    }
                }
            };
            rule.aux.chain = Some(chain.into());
        }
        if rule.aux.connmark_save && rule.aux.chain.as_deref() == Some("OUTPUT") {
            ctx.schedule_restore_mark = true;
        }
        out.push_back(rule);
        Ok(())
    })
}

fn kind_of(ctx: &CompilerContext, id: ObjectId) -> ObjectKind {
    ctx.store.get(id).kind.clone()
}

/// Split rules whose Source/Destination overlaps the firewall itself:
/// the firewall part flows to INPUT/OUTPUT via the chain cascade, and a
/// network containing the firewall is re-cut into "network minus firewall"
/// plus the firewall address.
pub fn split_if_matches_fw(slot: ElementSlot) -> impl Stage<PolicyRule> {
    let name = match slot {
        ElementSlot::Src => "split on fw in src",
        _ => "split on fw in dst",
    };
    MapStage::new(name, move |ctx: &mut CompilerContext, mut rule: PolicyRule, out| {
        if rule.element(slot).is_any()
            || rule.aux.in_temp_chain
            || rule.aux.chain.is_some()
            || rule.element(slot).negated
        {
            out.push_back(rule);
            return Ok(());
        }
        let items = rule.element(slot).items.clone();
        let mut fw_part: Vec<ObjectId> = Vec::new();
        let mut rest: Vec<ObjectId> = Vec::new();
        for id in items {
            if ctx.store.matches_firewall(id, ctx.fw) {
                fw_part.push(id);
                continue;
            }
            if ctx.store.complex_match(id, ctx.fw) {
                match kind_of(ctx, id) {
                    ObjectKind::Network(net) => {
                        let fw_addrs = ctx.store.host_addresses(ctx.fw, Some(ctx.family));
                        let mut remainder = vec![net];
                        for addr in &fw_addrs {
                            if let std::net::IpAddr::V4(a) = addr {
                                remainder = remainder
                                    .into_iter()
                                    .flat_map(|n| {
                                        fwforge_model::address::net_minus_addr_v4(&n, a)
                                    })
                                    .collect();
                                fw_part.push(scratch_addr(ctx, "fw", *addr));
                            }
                        }
                        for n in remainder {
                            rest.push(scratch_net_v4(ctx, "split", n));
                        }
                    }
                    _ => rest.push(id),
                }
                continue;
            }
            rest.push(id);
        }
        if fw_part.is_empty() {
            out.push_back(rule);
            return Ok(());
        }
        if !rest.is_empty() {
            let mut remainder_rule = rule.clone();
            remainder_rule.element_mut(slot).items = rest;
            out.push_back(remainder_rule);
        }
        rule.element_mut(slot).items = fw_part;
        out.push_back(rule);
        Ok(())
    })
}

/// Special case of the firewall-overlap split: both Source and Destination
/// name the firewall itself. Traffic from the firewall to the firewall
/// never traverses FORWARD, and the chain cascade would settle on OUTPUT
/// alone, so the rule becomes an OUTPUT copy plus an INPUT copy (honoring
/// a one-sided direction, like the loopback case).
pub fn split_if_fw_in_both() -> impl Stage<PolicyRule> {
    MapStage::new("split on fw in both", |ctx: &mut CompilerContext, mut rule: PolicyRule, out| {
        let src_is_fw = element_matches_fw(ctx, &rule.data.src)
            && !rule.data.src.negated
            && !rule.aux.single_object_negation_src;
        let dst_is_fw = element_matches_fw(ctx, &rule.data.dst)
            && !rule.data.dst.negated
            && !rule.aux.single_object_negation_dst;
        if rule.aux.chain.is_some() || rule.aux.in_temp_chain || !src_is_fw || !dst_is_fw {
            out.push_back(rule);
            return Ok(());
        }
        match rule.data.direction {
            Direction::Inbound => {
                rule.aux.chain = Some("INPUT".into());
                out.push_back(rule);
            }
            Direction::Outbound => {
                rule.aux.chain = Some("OUTPUT".into());
                out.push_back(rule);
            }
            _ => {
                let mut inbound = rule.clone();
                inbound.data.direction = Direction::Inbound;
                inbound.aux.chain = Some("INPUT".into());
                out.push_back(inbound);
                rule.data.direction = Direction::Outbound;
                rule.aux.chain = Some("OUTPUT".into());
                out.push_back(rule);
            }
        }
        Ok(())
    })
}

/// Per-interface atomization with chain optimization: N interfaces become N
/// jump rules sharing one body chain instead of N copies of the body.
pub fn rules_per_interface() -> impl Stage<PolicyRule> {
    MapStage::new(
        "rules per interface",
        |ctx: &mut CompilerContext, rule: PolicyRule, out| {
            if rule.data.itf.len() <= 1 {
                out.push_back(rule);
                return Ok(());
            }
            let chain = ctx.chains.fresh_chain("itf", rule.data.position);
            for &iface in &rule.data.itf.items {
                let mut jump = rule.clone();
                jump.data.src.clear();
                jump.data.dst.clear();
                jump.data.srv.clear();
                jump.data.time.clear();
                jump.data.itf = RuleElement::of(vec![iface]);
                jump.data.options.strip_log_and_limits();
                jump.data.options.stateless = true;
                jump.aux.target = Some(chain.clone());
                out.push_back(jump);
            }
            let mut body = rule;
            body.data.itf.clear();
            body.aux.iface_none = true;
            body.aux.chain = Some(chain);
            body.aux.in_temp_chain = true;
            out.push_back(body);
            Ok(())
        },
    )
}

fn is_loopback_rule(ctx: &CompilerContext, rule: &PolicyRule) -> bool {
    rule.data
        .itf
        .single()
        .map(|id| ctx.store.iface_data(id).loopback)
        .unwrap_or(false)
}

/// The final chain cascade.
pub fn assign_chains() -> impl Stage<PolicyRule> {
    MapStage::new("assign chains", |ctx: &mut CompilerContext, mut rule: PolicyRule, out| {
        if rule.aux.chain.is_none() {
            if element_matches_fw(ctx, &rule.data.src) {
                rule.aux.chain = Some("OUTPUT".into());
                if rule.data.direction == Direction::Both {
                    rule.data.direction = Direction::Outbound;
                }
            } else if element_matches_fw(ctx, &rule.data.dst) {
                rule.aux.chain = Some("INPUT".into());
                if rule.data.direction == Direction::Both {
                    rule.data.direction = Direction::Inbound;
                }
            } else if is_loopback_rule(ctx, &rule)
                && rule.data.src.is_any()
                && rule.data.dst.is_any()
            {
                rule.aux.on_loopback = true;
                match rule.data.direction {
                    Direction::Inbound => rule.aux.chain = Some("INPUT".into()),
                    Direction::Outbound => rule.aux.chain = Some("OUTPUT".into()),
                    _ => {
                        let mut inbound = rule.clone();
                        inbound.data.direction = Direction::Inbound;
                        inbound.aux.chain = Some("INPUT".into());
                        out.push_back(inbound);
                        rule.data.direction = Direction::Outbound;
                        rule.aux.chain = Some("OUTPUT".into());
                    }
                }
            } else if rule.data.options.classification && ctx.table == Table::Mangle {
                rule.aux.chain = Some("POSTROUTING".into());
            }
        }
        if rule.aux.chain.is_none() && !rule.aux.in_temp_chain {
            let chain = match ctx.table {
                Table::Filter => "FORWARD",
                _ => match rule.data.direction {
                    Direction::Outbound => "POSTROUTING",
                    _ => "PREROUTING",
                },
            };
            rule.aux.chain = Some(chain.into());
        }
        if rule.aux.chain.as_deref() == Some("FORWARD") && !ctx.options.ip_forward {
            ctx.diag.warn(
                &rule.data.label,
                "rule dropped: needs FORWARD but ip_forward is turned off",
            );
            return Ok(());
        }
        out.push_back(rule);
        Ok(())
    })
}

/// Map actions to iptables targets. Stages that pre-assigned a target
/// (jumps, RETURN, LOG) are left alone.
pub fn assign_targets() -> impl Stage<PolicyRule> {
    MapStage::new("assign targets", |ctx: &mut CompilerContext, mut rule: PolicyRule, out| {
        if rule.aux.target.is_some() {
            out.push_back(rule);
            return Ok(());
        }
        let o = &rule.data.options;
        let target: String = match rule.data.action {
            Action::Accept => "ACCEPT".into(),
            Action::Deny => "DROP".into(),
            Action::Reject => "REJECT".into(),
            Action::Return => "RETURN".into(),
            Action::Pipe => "QUEUE".into(),
            Action::Tag => tag_target(&rule),
            Action::Classify => "CLASSIFY".into(),
            Action::Route => "ROUTE".into(),
            Action::Custom => "CUSTOM".into(),
            Action::Continue => {
                if rule.aux.connmark_save {
                    "CONNMARK".into()
                } else if o.tagging {
                    tag_target(&rule)
                } else if o.classification {
                    "CLASSIFY".into()
                } else if o.routing {
                    "ROUTE".into()
                } else {
                    "CONTINUE".into()
                }
            }
            Action::Branch => match rule.data.options.branch_target {
                Some(id) => crate::chains::fit_chain_name(&ctx.store.get(id).name),
                None => {
                    ctx.diag.error(
                        &rule.data.label,
                        "branching rule has no target rule set; rule dropped",
                    );
                    return Ok(());
                }
            },
            Action::Accounting => match &o.accounting_chain {
                Some(name) if !name.is_empty() => crate::chains::fit_chain_name(name),
                _ => {
                    ctx.diag.error(
                        &rule.data.label,
                        "accounting rule has no chain name; rule dropped",
                    );
                    return Ok(());
                }
            },
            Action::Modify | Action::Scrub | Action::Skip => {
                ctx.diag.error(
                    &rule.data.label,
                    format!(
                        "action {} is not supported on iptables; rule dropped",
                        rule.data.action.as_str()
                    ),
                );
                return Ok(());
            }
        };
        rule.aux.target = Some(target);
        out.push_back(rule);
        Ok(())
    })
}

fn tag_target(rule: &PolicyRule) -> String {
    if rule.aux.connmark_save || rule.data.options.mark_connections {
        "CONNMARK".into()
    } else {
        "MARK".into()
    }
}

/// Once the chain is known the firewall's own address adds nothing:
/// INPUT implies the destination, OUTPUT implies the source.
pub fn strip_fw_references() -> impl Stage<PolicyRule> {
    MapStage::new("remove fw", |ctx: &mut CompilerContext, mut rule: PolicyRule, out| {
        if rule.aux.nat_virtual || rule.aux.upstream_rule_neg {
            out.push_back(rule);
            return Ok(());
        }
        let fw = ctx.fw;
        match rule.aux.chain.as_deref() {
            Some("INPUT") if !rule.data.dst.negated && !rule.aux.single_object_negation_dst => {
                let store = &ctx.store;
                rule.data.dst.items.retain(|id| !store.matches_firewall(*id, fw));
            }
            Some("OUTPUT") if !rule.data.src.negated && !rule.aux.single_object_negation_src => {
                let store = &ctx.store;
                rule.data.src.items.retain(|id| !store.matches_firewall(*id, fw));
            }
            _ => {}
        }
        out.push_back(rule);
        Ok(())
    })
}

/// Terminal bookkeeping: count `-j` references so the emitter can skip
/// chains nothing uses.
pub struct CountChainUsage {
    slurped: bool,
}

impl CountChainUsage {
    pub fn new() -> Self {
        Self { slurped: false }
    }
}

impl Default for CountChainUsage {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage<PolicyRule> for CountChainUsage {
    fn name(&self) -> &str {
        "count chain usage"
    }

    fn step(
        &mut self,
        ctx: &mut CompilerContext,
        up: &mut Upstream<'_, PolicyRule>,
        out: &mut VecDeque<PolicyRule>,
    ) -> Result<StepResult, CompileError> {
        if self.slurped {
            return Ok(StepResult::Done);
        }
        self.slurped = true;
        let rules = up.pull_all(ctx)?;
        for rule in &rules {
            if let Some(target) = &rule.aux.target {
                ctx.chains.count_target(target);
            }
        }
        out.extend(rules);
        Ok(StepResult::Produced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RuleSetKind;
    use crate::pipeline::PipelineBuilder;
    use crate::stages::InjectRules;
    use fwforge_model::rules::{PolicyRuleData, RuleOptions};
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
        let eth0 = store.add(Some(fw), "eth0", ObjectKind::Interface(Default::default()));
        store.add(
            Some(eth0),
            "eth0-ip",
            ObjectKind::Network("10.0.0.1/24".parse().unwrap()),
        );
        store.add(Some(fw), "Policy", ObjectKind::PolicyRuleSet(Default::default()));
        (store, fw)
    }

    fn ctx_for(store: ObjectStore, fw: ObjectId) -> CompilerContext {
        let set = store.policies_of(fw)[0];
        CompilerContext::new(
            store,
            fw,
            fwforge_model::Family::V4,
            Table::Filter,
            set,
            RuleSetKind::Policy,
        )
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
    fn any_split_produces_input_and_output_copies() {
        let (store, fw) = fixture();
        let mut ctx = ctx_for(store, fw);
        ctx.options.firewall_is_part_of_any_and_networks = true;
        let got = run_stage(&mut ctx, split_if_any_includes_fw(), vec![base_rule()]);
        assert_eq!(got.len(), 3);
        assert_eq!(got[0].aux.chain, None);
        assert_eq!(got[1].aux.chain.as_deref(), Some("INPUT"));
        assert_eq!(got[1].data.dst.items, vec![ctx.fw]);
        assert_eq!(got[2].aux.chain.as_deref(), Some("OUTPUT"));
        assert_eq!(got[2].data.src.items, vec![ctx.fw]);
    }

    #[test]
    fn any_split_disabled_without_option() {
        let (store, fw) = fixture();
        let mut ctx = ctx_for(store, fw);
        let got = run_stage(&mut ctx, split_if_any_includes_fw(), vec![base_rule()]);
        assert_eq!(got.len(), 1);
    }

    #[test]
    fn chain_cascade_picks_input_for_fw_destination() {
        let (store, fw) = fixture();
        let mut ctx = ctx_for(store, fw);
        let mut rule = base_rule();
        rule.data.dst = RuleElement::of(vec![fw]);
        let got = run_stage(&mut ctx, assign_chains(), vec![rule]);
        assert_eq!(got[0].aux.chain.as_deref(), Some("INPUT"));
        assert_eq!(got[0].data.direction, Direction::Inbound);
    }

    #[test]
    fn chain_cascade_defaults_to_forward() {
        let (store, fw) = fixture();
        let mut ctx = ctx_for(store, fw);
        let got = run_stage(&mut ctx, assign_chains(), vec![base_rule()]);
        assert_eq!(got[0].aux.chain.as_deref(), Some("FORWARD"));
    }

    #[test]
    fn forward_dropped_when_ip_forward_off() {
        let (store, fw) = fixture();
        let mut ctx = ctx_for(store, fw);
        ctx.options.ip_forward = false;
        let got = run_stage(&mut ctx, assign_chains(), vec![base_rule()]);
        assert!(got.is_empty());
        assert!(ctx.diag.has_warnings());
    }

    #[test]
    fn fw_reference_stripped_in_input() {
        let (store, fw) = fixture();
        let mut ctx = ctx_for(store, fw);
        let mut rule = base_rule();
        rule.data.dst = RuleElement::of(vec![fw]);
        rule.aux.chain = Some("INPUT".into());
        let got = run_stage(&mut ctx, strip_fw_references(), vec![rule]);
        assert!(got[0].data.dst.is_any());
    }

    #[test]
    fn per_interface_split_shares_one_body_chain() {
        let (mut store, fw) = fixture();
        let eth1 = store.add(Some(fw), "eth1", ObjectKind::Interface(Default::default()));
        let eth0 = store.interfaces_of(fw)[0];
        let mut rule = base_rule();
        rule.data.itf = RuleElement::of(vec![eth0, eth1]);
        rule.data.direction = Direction::Inbound;
        let mut ctx = ctx_for(store, fw);
        let got = run_stage(&mut ctx, rules_per_interface(), vec![rule]);
        assert_eq!(got.len(), 3);
        let body_chain = got[0].aux.target.clone().unwrap();
        assert_eq!(got[1].aux.target.as_deref(), Some(body_chain.as_str()));
        assert_eq!(got[2].aux.chain.as_deref(), Some(body_chain.as_str()));
        assert!(got[2].data.itf.is_any());
    }

    #[test]
    fn targets_follow_action_table() {
        let (store, fw) = fixture();
        let mut ctx = ctx_for(store, fw);
        let mut deny = base_rule();
        deny.data.action = Action::Deny;
        let mut pipe = base_rule();
        pipe.data.action = Action::Pipe;
        let got = run_stage(&mut ctx, assign_targets(), vec![base_rule(), deny, pipe]);
        let targets: Vec<&str> = got.iter().map(|r| r.target()).collect();
        assert_eq!(targets, vec!["ACCEPT", "DROP", "QUEUE"]);
    }

    #[test]
    fn fw_in_both_src_and_dst_splits_into_input_and_output() {
        let (store, fw) = fixture();
        let mut rule = base_rule();
        rule.data.src = RuleElement::of(vec![fw]);
        rule.data.dst = RuleElement::of(vec![fw]);
        let mut ctx = ctx_for(store, fw);
        let got = run_stage(&mut ctx, split_if_fw_in_both(), vec![rule]);
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].aux.chain.as_deref(), Some("INPUT"));
        assert_eq!(got[0].data.direction, Direction::Inbound);
        assert_eq!(got[1].aux.chain.as_deref(), Some("OUTPUT"));
        assert_eq!(got[1].data.direction, Direction::Outbound);
    }

    #[test]
    fn fw_in_both_honors_one_sided_direction() {
        let (store, fw) = fixture();
        let mut rule = base_rule();
        rule.data.src = RuleElement::of(vec![fw]);
        rule.data.dst = RuleElement::of(vec![fw]);
        rule.data.direction = Direction::Inbound;
        let mut ctx = ctx_for(store, fw);
        let got = run_stage(&mut ctx, split_if_fw_in_both(), vec![rule]);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].aux.chain.as_deref(), Some("INPUT"));
    }

    #[test]
    fn fw_in_one_side_only_is_left_to_the_cascade() {
        let (store, fw) = fixture();
        let mut rule = base_rule();
        rule.data.src = RuleElement::of(vec![fw]);
        let mut ctx = ctx_for(store, fw);
        let got = run_stage(&mut ctx, split_if_fw_in_both(), vec![rule]);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].aux.chain, None);
    }

    #[test]
    fn negated_fw_match_does_not_trigger_both_split() {
        let (store, fw) = fixture();
        let mut rule = base_rule();
        rule.data.src = RuleElement::of(vec![fw]);
        rule.data.dst = RuleElement::of(vec![fw]);
        rule.aux.single_object_negation_src = true;
        let mut ctx = ctx_for(store, fw);
        let got = run_stage(&mut ctx, split_if_fw_in_both(), vec![rule]);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].aux.chain, None);
    }

    #[test]
    fn network_containing_fw_is_split() {
        let (mut store, fw) = fixture();
        let lan = store.add(None, "lan", ObjectKind::Network("10.0.0.0/24".parse().unwrap()));
        let mut rule = base_rule();
        rule.data.src = RuleElement::of(vec![lan]);
        let mut ctx = ctx_for(store, fw);
        let got = run_stage(&mut ctx, split_if_matches_fw(ElementSlot::Src), vec![rule]);
        assert_eq!(got.len(), 2);
        // Remainder covers the /24 minus the firewall address.
        let remainder = &got[0];
        assert!(remainder.data.src.len() > 1);
        // Firewall part carries exactly the firewall address.
        let fw_rule = &got[1];
        assert_eq!(fw_rule.data.src.len(), 1);
        assert!(ctx
            .store
            .matches_firewall(fw_rule.data.src.items[0], ctx.fw));
    }
}
