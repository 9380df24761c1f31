//! The NAT pipeline stages.

use crate::context::CompilerContext;
use crate::diag::CompileError;
use crate::ipt::addresses::expand_items;
use crate::ipt::services::{multiport_eligible, proto_of, ProtoGroup, MULTIPORT_MAX};
use crate::pipeline::{Stage, StepResult, Upstream};
use crate::rule::{NatKind, NatRule};
use crate::stages::MapStage;
use fwforge_model::rules::Action;
use fwforge_model::{ObjectId, ObjectKind};
use std::collections::VecDeque;

/// Single-object negation on the NAT interface elements.
pub fn interface_negation() -> impl Stage<NatRule> {
    MapStage::new("nat interface negation", |ctx: &mut CompilerContext, mut rule: NatRule, out| {
        for (element, flag) in [
            (&mut rule.data.itf_in, &mut rule.aux.single_object_negation_itf_in),
            (&mut rule.data.itf_out, &mut rule.aux.single_object_negation_itf_out),
        ] {
            if element.negated {
                if element.single().is_some() {
                    *flag = true;
                    element.negated = false;
                } else {
                    ctx.diag.error(
                        &rule.data.label,
                        "negation of several interfaces is not supported in NAT rules",
                    );
                    element.negated = false;
                }
            }
        }
        out.push_back(rule);
        Ok(())
    })
}

fn is_dynamic_iface_address(ctx: &CompilerContext, id: ObjectId) -> bool {
    let obj = ctx.store.get(id);
    if let ObjectKind::Interface(d) = &obj.kind {
        return d.dynamic;
    }
    obj.parent
        .map(|p| matches!(&ctx.store.get(p).kind, ObjectKind::Interface(d) if d.dynamic))
        .unwrap_or(false)
}

/// Classify the rule into its NAT variant from the translated side.
pub fn classify() -> impl Stage<NatRule> {
    MapStage::new("classify nat", |ctx: &mut CompilerContext, mut rule: NatRule, out| {
        let has_tsrc = !rule.data.tsrc.is_any();
        let has_tdst = !rule.data.tdst.is_any();
        let has_tsrv = !rule.data.tsrv.is_any();

        let kind = if rule.data.action == Action::Branch {
            NatKind::NatBranch
        } else if !has_tsrc && !has_tdst && !has_tsrv {
            NatKind::NoNat
        } else if has_tsrc && (has_tdst || has_tsrv) {
            NatKind::SdNat
        } else if has_tsrc {
            let single = rule.data.tsrc.single();
            if single.map_or(false, |id| is_dynamic_iface_address(ctx, id)) {
                NatKind::Masquerade
            } else if single.map_or(false, |id| {
                matches!(
                    ctx.store.get(id).kind,
                    ObjectKind::Network(_) | ObjectKind::NetworkV6(_)
                )
            }) {
                NatKind::SNetNat
            } else {
                NatKind::Snat
            }
        } else if has_tdst {
            if rule.data.tdst.single().map_or(false, |id| {
                matches!(
                    ctx.store.get(id).kind,
                    ObjectKind::Network(_) | ObjectKind::NetworkV6(_)
                )
            }) {
                NatKind::DNetNat
            } else {
                NatKind::Dnat
            }
        } else {
            // Port-only translation; redirect detection may refine this.
            NatKind::Dnat
        };
        rule.aux.kind = Some(kind);
        out.push_back(rule);
        Ok(())
    })
}

/// Negation has no meaning on the translated side.
pub fn verify_no_translated_negation() -> impl Stage<NatRule> {
    MapStage::new("verify nat", |ctx: &mut CompilerContext, rule: NatRule, out| {
        if rule.data.tsrc.negated || rule.data.tdst.negated || rule.data.tsrv.negated {
            ctx.diag.error(
                &rule.data.label,
                "negation in translated source, destination or service is not supported; rule dropped",
            );
            return Ok(());
        }
        out.push_back(rule);
        Ok(())
    })
}

/// A DNAT-like rule with only a translated service redirects to the
/// original destination; copying it over lets redirect detection fire.
pub fn port_translation() -> impl Stage<NatRule> {
    MapStage::new("port translation", |_ctx: &mut CompilerContext, mut rule: NatRule, out| {
        if rule.aux.kind == Some(NatKind::Dnat)
            && rule.data.tdst.is_any()
            && !rule.data.tsrv.is_any()
        {
            rule.data.tdst = rule.data.odst.clone();
        }
        out.push_back(rule);
        Ok(())
    })
}

/// Translation onto the firewall itself is a REDIRECT.
pub fn detect_redirect() -> impl Stage<NatRule> {
    MapStage::new("detect redirect", |ctx: &mut CompilerContext, mut rule: NatRule, out| {
        if matches!(rule.aux.kind, Some(NatKind::Dnat) | Some(NatKind::DNetNat))
            && !rule.data.tdst.is_any()
            && rule
                .data
                .tdst
                .items
                .iter()
                .all(|id| ctx.store.matches_firewall(*id, ctx.fw))
        {
            rule.aux.kind = Some(NatKind::Redirect);
        }
        out.push_back(rule);
        Ok(())
    })
}

/// A NONAT rule excludes traffic from translation: one ACCEPT in
/// POSTROUTING and one in PREROUTING (OUTPUT when the firewall itself is
/// the original source).
pub fn split_nonat() -> impl Stage<NatRule> {
    MapStage::new("split nonat", |ctx: &mut CompilerContext, rule: NatRule, out| {
        if rule.aux.kind != Some(NatKind::NoNat) {
            out.push_back(rule);
            return Ok(());
        }
        let mut post = rule.clone();
        post.aux.chain = Some("POSTROUTING".into());
        post.aux.target = Some("ACCEPT".into());

        let mut pre = rule;
        let fw_is_src = !pre.data.osrc.is_any()
            && pre
                .data
                .osrc
                .items
                .iter()
                .all(|id| ctx.store.matches_firewall(*id, ctx.fw));
        pre.aux.chain = Some(if fw_is_src { "OUTPUT" } else { "PREROUTING" }.into());
        pre.aux.target = Some("ACCEPT".into());

        out.push_back(post);
        out.push_back(pre);
        Ok(())
    })
}

/// Chain per variant; SDNAT splits into its SNAT and DNAT halves here.
pub fn assign_chains() -> impl Stage<NatRule> {
    MapStage::new("nat chains", |_ctx: &mut CompilerContext, mut rule: NatRule, out| {
        if rule.aux.chain.is_some() {
            out.push_back(rule);
            return Ok(());
        }
        match rule.aux.kind {
            Some(NatKind::Snat) | Some(NatKind::SNetNat) | Some(NatKind::Masquerade) => {
                rule.aux.chain = Some("POSTROUTING".into());
                out.push_back(rule);
            }
            Some(NatKind::Dnat) | Some(NatKind::DNetNat) | Some(NatKind::Redirect) => {
                rule.aux.chain = Some("PREROUTING".into());
                out.push_back(rule);
            }
            Some(NatKind::SdNat) => {
                let mut dnat = rule.clone();
                dnat.aux.kind = Some(NatKind::Dnat);
                dnat.data.tsrc.clear();
                dnat.aux.chain = Some("PREROUTING".into());

                let mut snat = rule;
                snat.aux.kind = Some(NatKind::Snat);
                snat.data.tdst.clear();
                snat.data.tsrv.clear();
                snat.aux.chain = Some("POSTROUTING".into());

                out.push_back(dnat);
                out.push_back(snat);
            }
            Some(NatKind::NatBranch) => {
                rule.aux.chain = Some("PREROUTING".into());
                out.push_back(rule);
            }
            _ => out.push_back(rule),
        }
        Ok(())
    })
}

/// Target per variant.
pub fn assign_targets() -> impl Stage<NatRule> {
    MapStage::new("nat targets", |ctx: &mut CompilerContext, mut rule: NatRule, out| {
        if rule.aux.target.is_some() {
            out.push_back(rule);
            return Ok(());
        }
        let target = match rule.aux.kind {
            Some(NatKind::Snat) => "SNAT".to_string(),
            Some(NatKind::SNetNat) | Some(NatKind::DNetNat) => "NETMAP".to_string(),
            Some(NatKind::Dnat) => "DNAT".to_string(),
            Some(NatKind::Redirect) => "REDIRECT".to_string(),
            Some(NatKind::Masquerade) => "MASQUERADE".to_string(),
            Some(NatKind::NatBranch) => match rule.data.options.branch_target {
                Some(id) => crate::chains::fit_chain_name(&ctx.store.get(id).name),
                None => {
                    ctx.diag.error(
                        &rule.data.label,
                        "NAT branch has no target rule set; rule dropped",
                    );
                    return Ok(());
                }
            },
            _ => "ACCEPT".to_string(),
        };
        rule.aux.target = Some(target);
        out.push_back(rule);
        Ok(())
    })
}

/// Variant-scoped address expansion. The original side always expands;
/// the translated side only where the target needs a concrete address.
pub fn expand_addresses() -> impl Stage<NatRule> {
    MapStage::new("nat expand addresses", |ctx: &mut CompilerContext, mut rule: NatRule, out| {
        let label = rule.data.label.clone();
        let expand_orig_only = matches!(
            rule.aux.kind,
            Some(NatKind::NoNat) | Some(NatKind::Return) | Some(NatKind::Masquerade)
        );

        for element in [&mut rule.data.osrc, &mut rule.data.odst] {
            if !element.is_any() {
                element.items = expand_items(ctx, &label, &element.items.clone(), false);
            }
        }
        if !expand_orig_only {
            let expand_tdst = rule.aux.kind != Some(NatKind::Redirect);
            if !rule.data.tsrc.is_any() {
                rule.data.tsrc.items =
                    expand_items(ctx, &label, &rule.data.tsrc.items.clone(), false);
            }
            if expand_tdst && !rule.data.tdst.is_any() {
                rule.data.tdst.items =
                    expand_items(ctx, &label, &rule.data.tdst.items.clone(), false);
            }
        }
        out.push_back(rule);
        Ok(())
    })
}

/// One protocol per NAT rule.
pub fn group_by_protocol() -> impl Stage<NatRule> {
    MapStage::new("nat group services", |ctx: &mut CompilerContext, rule: NatRule, out| {
        if rule.data.osrv.len() <= 1 {
            out.push_back(rule);
            return Ok(());
        }
        let mut order: Vec<ProtoGroup> = Vec::new();
        let mut buckets: Vec<Vec<ObjectId>> = Vec::new();
        for &id in &rule.data.osrv.items {
            let group = proto_of(ctx, id);
            match order.iter().position(|g| *g == group) {
                Some(i) => buckets[i].push(id),
                None => {
                    order.push(group);
                    buckets.push(vec![id]);
                }
            }
        }
        for bucket in buckets {
            let mut copy = rule.clone();
            copy.data.osrv.items = bucket;
            out.push_back(copy);
        }
        Ok(())
    })
}

pub fn prepare_multiport() -> impl Stage<NatRule> {
    MapStage::new("nat multiport", |ctx: &mut CompilerContext, rule: NatRule, out| {
        if rule.data.osrv.len() <= 1 {
            out.push_back(rule);
            return Ok(());
        }
        if multiport_eligible(ctx, &rule.data.osrv.items) {
            for chunk in rule.data.osrv.items.chunks(MULTIPORT_MAX) {
                let mut bundle = rule.clone();
                bundle.data.osrv.items = chunk.to_vec();
                bundle.aux.multiport = chunk.len() > 1;
                out.push_back(bundle);
            }
        } else {
            for &id in &rule.data.osrv.items {
                let mut single = rule.clone();
                single.data.osrv.items = vec![id];
                out.push_back(single);
            }
        }
        Ok(())
    })
}

/// Cartesian product over the original source and destination.
pub fn atomize() -> impl Stage<NatRule> {
    MapStage::new("nat atomize", |_ctx: &mut CompilerContext, rule: NatRule, out| {
        let srcs: Vec<Option<ObjectId>> = if rule.data.osrc.is_any() {
            vec![None]
        } else {
            rule.data.osrc.items.iter().copied().map(Some).collect()
        };
        let dsts: Vec<Option<ObjectId>> = if rule.data.odst.is_any() {
            vec![None]
        } else {
            rule.data.odst.items.iter().copied().map(Some).collect()
        };
        for &src in &srcs {
            for &dst in &dsts {
                let mut atom = rule.clone();
                atom.data.osrc.items = src.into_iter().collect();
                atom.data.odst.items = dst.into_iter().collect();
                out.push_back(atom);
            }
        }
        Ok(())
    })
}

/// Derive `-o` for source translation from the translated address's owning
/// interface (and `-i` for destination translation, where determinable).
pub fn assign_interfaces() -> impl Stage<NatRule> {
    MapStage::new("nat interfaces", |ctx: &mut CompilerContext, mut rule: NatRule, out| {
        let owning_iface = |ctx: &CompilerContext, id: ObjectId| -> Option<ObjectId> {
            let obj = ctx.store.get(id);
            if obj.kind.is_interface() {
                return Some(id);
            }
            obj.parent
                .filter(|p| ctx.store.get(*p).kind.is_interface())
        };
        match rule.aux.kind {
            Some(NatKind::Snat) | Some(NatKind::SNetNat) | Some(NatKind::Masquerade) => {
                if rule.data.itf_out.is_any() {
                    if let Some(iface) = rule
                        .data
                        .tsrc
                        .items
                        .first()
                        .and_then(|id| owning_iface(ctx, *id))
                    {
                        rule.data.itf_out.items = vec![iface];
                    }
                }
            }
            Some(NatKind::Dnat) | Some(NatKind::Redirect) => {
                if rule.data.itf_in.is_any() {
                    if let Some(iface) = rule
                        .data
                        .odst
                        .items
                        .first()
                        .and_then(|id| owning_iface(ctx, *id))
                    {
                        rule.data.itf_in.items = vec![iface];
                    }
                }
            }
            _ => {}
        }
        out.push_back(rule);
        Ok(())
    })
}

/// Count `-j` references for dead-chain elimination, NAT flavor.
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

impl Stage<NatRule> for CountChainUsage {
    fn name(&self) -> &str {
        "nat count chain usage"
    }

    fn step(
        &mut self,
        ctx: &mut CompilerContext,
        up: &mut Upstream<'_, NatRule>,
        out: &mut VecDeque<NatRule>,
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
    use crate::context::{RuleSetKind, Table};
    use crate::pipeline::PipelineBuilder;
    use crate::stages::InjectRules;
    use fwforge_model::object::InterfaceData;
    use fwforge_model::rules::{NatRuleData, RuleElement, RuleOptions};
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
        let eth0 = store.add(
            Some(fw),
            "eth0",
            ObjectKind::Interface(InterfaceData {
                dynamic: true,
                ..Default::default()
            }),
        );
        store.add(
            Some(eth0),
            "eth0-ip",
            ObjectKind::Network("192.0.2.1/24".parse().unwrap()),
        );
        store.add(Some(fw), "NAT", ObjectKind::NatRuleSet(Default::default()));
        (store, fw)
    }

    fn ctx_for(store: ObjectStore, fw: ObjectId) -> CompilerContext {
        let set = store.nats_of(fw)[0];
        CompilerContext::new(
            store,
            fw,
            fwforge_model::Family::V4,
            Table::Nat,
            set,
            RuleSetKind::Nat,
        )
    }

    fn base_rule() -> NatRule {
        NatRule::from_data(NatRuleData {
            osrc: RuleElement::any(),
            odst: RuleElement::any(),
            osrv: RuleElement::any(),
            tsrc: RuleElement::any(),
            tdst: RuleElement::any(),
            tsrv: RuleElement::any(),
            itf_in: RuleElement::any(),
            itf_out: RuleElement::any(),
            action: Action::Accept,
            options: RuleOptions::default(),
            position: 0,
            label: "nat rule 0".into(),
            disabled: false,
            comment: String::new(),
        })
    }

    fn run_stage(
        ctx: &mut CompilerContext,
        stage: impl Stage<NatRule> + 'static,
        rules: Vec<NatRule>,
    ) -> Vec<NatRule> {
        PipelineBuilder::new(None)
            .add(InjectRules::new(rules))
            .add(stage)
            .build()
            .run(ctx)
            .unwrap()
    }

    #[test]
    fn translated_source_on_dynamic_iface_is_masquerade() {
        let (store, fw) = fixture();
        let eth0 = store.interfaces_of(fw)[0];
        let addr = store.children(eth0).next().unwrap().id;
        let mut rule = base_rule();
        rule.data.tsrc = RuleElement::of(vec![addr]);
        let mut ctx = ctx_for(store, fw);
        let got = run_stage(&mut ctx, classify(), vec![rule]);
        assert_eq!(got[0].aux.kind, Some(NatKind::Masquerade));
    }

    #[test]
    fn translated_network_is_snetnat() {
        let (mut store, fw) = fixture();
        let net = store.add(None, "pool", ObjectKind::Network("198.51.100.0/24".parse().unwrap()));
        let mut rule = base_rule();
        rule.data.tsrc = RuleElement::of(vec![net]);
        let mut ctx = ctx_for(store, fw);
        let got = run_stage(&mut ctx, classify(), vec![rule]);
        assert_eq!(got[0].aux.kind, Some(NatKind::SNetNat));
    }

    #[test]
    fn empty_translation_is_nonat_and_splits() {
        let (store, fw) = fixture();
        let mut ctx = ctx_for(store, fw);
        let classified = run_stage(&mut ctx, classify(), vec![base_rule()]);
        assert_eq!(classified[0].aux.kind, Some(NatKind::NoNat));
        let got = run_stage(&mut ctx, split_nonat(), classified);
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].aux.chain.as_deref(), Some("POSTROUTING"));
        assert_eq!(got[1].aux.chain.as_deref(), Some("PREROUTING"));
        assert!(got.iter().all(|r| r.aux.target.as_deref() == Some("ACCEPT")));
    }

    #[test]
    fn sdnat_splits_into_both_chains() {
        let (mut store, fw) = fixture();
        let a = store.add(None, "a", ObjectKind::Ipv4Address("198.51.100.1".parse().unwrap()));
        let b = store.add(None, "b", ObjectKind::Ipv4Address("198.51.100.2".parse().unwrap()));
        let mut rule = base_rule();
        rule.data.tsrc = RuleElement::of(vec![a]);
        rule.data.tdst = RuleElement::of(vec![b]);
        let mut ctx = ctx_for(store, fw);
        let classified = run_stage(&mut ctx, classify(), vec![rule]);
        assert_eq!(classified[0].aux.kind, Some(NatKind::SdNat));
        let got = run_stage(&mut ctx, assign_chains(), classified);
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].aux.kind, Some(NatKind::Dnat));
        assert_eq!(got[0].aux.chain.as_deref(), Some("PREROUTING"));
        assert_eq!(got[1].aux.kind, Some(NatKind::Snat));
        assert_eq!(got[1].aux.chain.as_deref(), Some("POSTROUTING"));
    }

    #[test]
    fn redirect_detected_when_tdst_is_firewall() {
        let (store, fw) = fixture();
        let mut rule = base_rule();
        rule.data.tdst = RuleElement::of(vec![fw]);
        let mut ctx = ctx_for(store, fw);
        let classified = run_stage(&mut ctx, classify(), vec![rule]);
        let got = run_stage(&mut ctx, detect_redirect(), classified);
        assert_eq!(got[0].aux.kind, Some(NatKind::Redirect));
    }

    #[test]
    fn translated_negation_is_rejected() {
        let (mut store, fw) = fixture();
        let a = store.add(None, "a", ObjectKind::Ipv4Address("198.51.100.1".parse().unwrap()));
        let mut rule = base_rule();
        rule.data.tsrc = RuleElement {
            items: vec![a],
            negated: true,
        };
        let mut ctx = ctx_for(store, fw);
        let got = run_stage(&mut ctx, verify_no_translated_negation(), vec![rule]);
        assert!(got.is_empty());
        assert!(ctx.diag.has_errors());
    }

    #[test]
    fn masquerade_gets_outbound_interface_from_tsrc() {
        let (store, fw) = fixture();
        let eth0 = store.interfaces_of(fw)[0];
        let addr = store.children(eth0).next().unwrap().id;
        let mut rule = base_rule();
        rule.data.tsrc = RuleElement::of(vec![addr]);
        rule.aux.kind = Some(NatKind::Masquerade);
        let mut ctx = ctx_for(store, fw);
        let got = run_stage(&mut ctx, assign_interfaces(), vec![rule]);
        assert_eq!(got[0].data.itf_out.items, vec![eth0]);
    }
}
