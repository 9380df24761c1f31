//! Service normalization: reject handling, protocol grouping, special-case
//! separation and multiport preparation.

use crate::context::CompilerContext;
use crate::pipeline::Stage;
use crate::rule::PolicyRule;
use crate::stages::MapStage;
use fwforge_model::rules::Action;
use fwforge_model::{ObjectId, ObjectKind};

/// Protocol bucket a service belongs to; one emitted rule carries services
/// of exactly one bucket.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum ProtoGroup {
    Tcp,
    Udp,
    Icmp,
    Icmp6,
    Ip(u8),
    Custom,
    Tag,
    User,
    Other,
}

pub(crate) fn proto_of(ctx: &CompilerContext, id: ObjectId) -> ProtoGroup {
    match &ctx.store.get(id).kind {
        ObjectKind::TcpService { .. } => ProtoGroup::Tcp,
        ObjectKind::UdpService { .. } => ProtoGroup::Udp,
        ObjectKind::IcmpService { .. } => ProtoGroup::Icmp,
        ObjectKind::Icmp6Service { .. } => ProtoGroup::Icmp6,
        ObjectKind::IpService { protocol } => ProtoGroup::Ip(*protocol),
        ObjectKind::CustomService { .. } => ProtoGroup::Custom,
        ObjectKind::TagService { .. } => ProtoGroup::Tag,
        ObjectKind::UserService { .. } => ProtoGroup::User,
        _ => ProtoGroup::Other,
    }
}

fn tcp_has_flags(ctx: &CompilerContext, id: ObjectId) -> bool {
    matches!(
        &ctx.store.get(id).kind,
        ObjectKind::TcpService { flags_mask, .. } if !flags_mask.is_empty()
    )
}

fn has_src_ports(ctx: &CompilerContext, id: ObjectId) -> bool {
    match &ctx.store.get(id).kind {
        ObjectKind::TcpService { src, .. } | ObjectKind::UdpService { src, .. } => !src.is_any(),
        _ => false,
    }
}

/// Fill `action_on_reject` and split Reject-with-tcp-reset rules whose
/// service list mixes TCP with other protocols.
pub fn reject_split() -> impl Stage<PolicyRule> {
    MapStage::new("reject split", |ctx: &mut CompilerContext, mut rule: PolicyRule, out| {
        if rule.data.action != Action::Reject {
            out.push_back(rule);
            return Ok(());
        }
        let mut aor = rule
            .data
            .options
            .reject_with
            .clone()
            .unwrap_or_else(|| ctx.options.action_on_reject.clone());
        if aor == "tcp-reset" {
            if rule.data.srv.is_any() {
                ctx.diag.warn(
                    &rule.data.label,
                    "reject with tcp-reset needs a TCP service; using icmp-port-unreachable",
                );
                aor = "icmp-port-unreachable".into();
            } else {
                let (tcp, rest): (Vec<ObjectId>, Vec<ObjectId>) = rule
                    .data
                    .srv
                    .items
                    .iter()
                    .copied()
                    .partition(|id| proto_of(ctx, *id) == ProtoGroup::Tcp);
                if !rest.is_empty() {
                    let fallback = if ctx.options.action_on_reject == "tcp-reset" {
                        "icmp-port-unreachable".to_string()
                    } else {
                        ctx.options.action_on_reject.clone()
                    };
                    if !tcp.is_empty() {
                        let mut tcp_rule = rule.clone();
                        tcp_rule.data.srv.items = tcp;
                        tcp_rule.aux.action_on_reject = Some("tcp-reset".into());
                        out.push_back(tcp_rule);
                    }
                    rule.data.srv.items = rest;
                    rule.aux.action_on_reject = Some(fallback);
                    out.push_back(rule);
                    return Ok(());
                }
            }
        }
        rule.aux.action_on_reject = Some(aor);
        out.push_back(rule);
        Ok(())
    })
}

/// One protocol per rule: group the service element by protocol bucket,
/// preserving first-appearance order.
pub fn group_by_protocol() -> impl Stage<PolicyRule> {
    MapStage::new("group services", |ctx: &mut CompilerContext, rule: PolicyRule, out| {
        if rule.data.srv.len() <= 1 {
            out.push_back(rule);
            return Ok(());
        }
        let mut order: Vec<ProtoGroup> = Vec::new();
        let mut buckets: Vec<Vec<ObjectId>> = Vec::new();
        for &id in &rule.data.srv.items {
            let group = proto_of(ctx, id);
            match order.iter().position(|g| *g == group) {
                Some(i) => buckets[i].push(id),
                None => {
                    order.push(group);
                    buckets.push(vec![id]);
                }
            }
        }
        if buckets.len() == 1 {
            out.push_back(rule);
            return Ok(());
        }
        for bucket in buckets {
            let mut copy = rule.clone();
            copy.data.srv.items = bucket;
            out.push_back(copy);
        }
        Ok(())
    })
}

/// Pull services that need their own command out of shared rules: TCP with
/// flag matches, services with source ports, user and custom services.
/// Validates custom services and the unsupported "established" flag, and
/// forces ICMPv6 rules stateless.
pub fn separate_special_services() -> impl Stage<PolicyRule> {
    MapStage::new(
        "separate services",
        |ctx: &mut CompilerContext, mut rule: PolicyRule, out| {
            // ICMPv6 state tracking is unreliable; warn and fix.
            let has_icmp6 = rule
                .data
                .srv
                .items
                .iter()
                .any(|id| proto_of(ctx, *id) == ProtoGroup::Icmp6);
            if has_icmp6 && !rule.data.options.stateless {
                ctx.diag.warn(
                    &rule.data.label,
                    "ICMPv6 rules must be stateless; stateless flag set",
                );
                rule.data.options.stateless = true;
            }

            let items = rule.data.srv.items.clone();
            let mut plain: Vec<ObjectId> = Vec::new();
            let mut specials: Vec<ObjectId> = Vec::new();
            for id in items {
                match &ctx.store.get(id).kind {
                    ObjectKind::TcpService { established, .. } if *established => {
                        ctx.diag.error(
                            &rule.data.label,
                            format!(
                                "service '{}': the \"established\" flag is not supported on iptables",
                                ctx.store.get(id).name
                            ),
                        );
                        plain.push(id);
                    }
                    ObjectKind::CustomService { codes, .. } => {
                        if !codes.contains_key("iptables") {
                            ctx.diag.error(
                                &rule.data.label,
                                format!(
                                    "custom service '{}' has no code for iptables",
                                    ctx.store.get(id).name
                                ),
                            );
                        } else {
                            specials.push(id);
                        }
                    }
                    ObjectKind::UserService { .. } => specials.push(id),
                    _ if tcp_has_flags(ctx, id) || has_src_ports(ctx, id) => specials.push(id),
                    _ => plain.push(id),
                }
            }
            if specials.is_empty() {
                rule.data.srv.items = plain;
                out.push_back(rule);
                return Ok(());
            }
            if !plain.is_empty() {
                let mut main = rule.clone();
                main.data.srv.items = plain;
                out.push_back(main);
            }
            for id in specials {
                let mut special = rule.clone();
                special.data.srv.items = vec![id];
                out.push_back(special);
            }
            Ok(())
        },
    )
}

pub(crate) const MULTIPORT_MAX: usize = 15;

pub(crate) fn multiport_eligible(ctx: &CompilerContext, items: &[ObjectId]) -> bool {
    let first = proto_of(ctx, items[0]);
    if first != ProtoGroup::Tcp && first != ProtoGroup::Udp {
        return false;
    }
    items.iter().all(|id| {
        proto_of(ctx, *id) == first && !tcp_has_flags(ctx, *id) && !has_src_ports(ctx, *id)
    })
}

/// Bundle 2..=15 plain TCP/UDP services into one multiport rule; larger
/// sets split into groups of 15; anything else goes one service per rule.
pub fn prepare_multiport() -> impl Stage<PolicyRule> {
    MapStage::new("prepare multiport", |ctx: &mut CompilerContext, rule: PolicyRule, out| {
        if rule.data.srv.len() <= 1 {
            out.push_back(rule);
            return Ok(());
        }
        if multiport_eligible(ctx, &rule.data.srv.items) {
            for chunk in rule.data.srv.items.chunks(MULTIPORT_MAX) {
                let mut bundle = rule.clone();
                bundle.data.srv.items = chunk.to_vec();
                bundle.aux.multiport = chunk.len() > 1;
                out.push_back(bundle);
            }
        } else {
            for &id in &rule.data.srv.items {
                let mut single = rule.clone();
                single.data.srv.items = vec![id];
                out.push_back(single);
            }
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{RuleSetKind, Table};
    use crate::pipeline::PipelineBuilder;
    use crate::stages::InjectRules;
    use fwforge_model::rules::{Direction, PolicyRuleData, RuleElement, RuleOptions};
    use fwforge_model::service::PortRange;
    use fwforge_model::{ObjectStore, TcpFlags};

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
        store.add(Some(fw), "Policy", ObjectKind::PolicyRuleSet(Default::default()));
        (store, fw)
    }

    fn tcp(store: &mut ObjectStore, name: &str, port: u16) -> ObjectId {
        store.add(
            None,
            name,
            ObjectKind::TcpService {
                src: PortRange::any(),
                dst: PortRange::single(port),
                flags_mask: TcpFlags::default(),
                flags_set: TcpFlags::default(),
                established: false,
            },
        )
    }

    fn udp(store: &mut ObjectStore, name: &str, port: u16) -> ObjectId {
        store.add(
            None,
            name,
            ObjectKind::UdpService {
                src: PortRange::any(),
                dst: PortRange::single(port),
            },
        )
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

    fn rule_with_srv(items: Vec<ObjectId>) -> PolicyRule {
        PolicyRule::from_data(PolicyRuleData {
            src: RuleElement::any(),
            dst: RuleElement::any(),
            srv: RuleElement::of(items),
            itf: RuleElement::any(),
            time: RuleElement::any(),
            direction: Direction::Both,
            action: fwforge_model::Action::Accept,
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
    fn mixed_protocols_split_into_groups() {
        let (mut store, fw) = fixture();
        let ssh = tcp(&mut store, "ssh", 22);
        let web = tcp(&mut store, "web", 80);
        let dns = udp(&mut store, "dns", 53);
        let mut ctx = ctx_for(store, fw);
        let got = run_stage(&mut ctx, group_by_protocol(), vec![rule_with_srv(vec![ssh, dns, web])]);
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].data.srv.items, vec![ssh, web]);
        assert_eq!(got[1].data.srv.items, vec![dns]);
    }

    #[test]
    fn multiport_flag_set_for_small_tcp_sets() {
        let (mut store, fw) = fixture();
        let ids: Vec<ObjectId> = [22u16, 80, 443]
            .iter()
            .map(|p| tcp(&mut store, &format!("p{}", p), *p))
            .collect();
        let mut ctx = ctx_for(store, fw);
        let got = run_stage(&mut ctx, prepare_multiport(), vec![rule_with_srv(ids)]);
        assert_eq!(got.len(), 1);
        assert!(got[0].aux.multiport);
        assert_eq!(got[0].data.srv.len(), 3);
    }

    #[test]
    fn large_service_sets_chunk_at_fifteen() {
        let (mut store, fw) = fixture();
        let ids: Vec<ObjectId> = (1u16..=20)
            .map(|p| tcp(&mut store, &format!("p{}", p), p))
            .collect();
        let mut ctx = ctx_for(store, fw);
        let got = run_stage(&mut ctx, prepare_multiport(), vec![rule_with_srv(ids)]);
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].data.srv.len(), 15);
        assert_eq!(got[1].data.srv.len(), 5);
    }

    #[test]
    fn icmp_services_go_one_per_rule() {
        let (mut store, fw) = fixture();
        let a = store.add(None, "echo", ObjectKind::IcmpService { icmp_type: 8, icmp_code: -1 });
        let b = store.add(None, "unreach", ObjectKind::IcmpService { icmp_type: 3, icmp_code: -1 });
        let mut ctx = ctx_for(store, fw);
        let got = run_stage(&mut ctx, prepare_multiport(), vec![rule_with_srv(vec![a, b])]);
        assert_eq!(got.len(), 2);
        assert!(!got[0].aux.multiport);
    }

    #[test]
    fn tcp_with_flags_separated() {
        let (mut store, fw) = fixture();
        let plain = tcp(&mut store, "plain", 80);
        let syn = store.add(
            None,
            "syn-only",
            ObjectKind::TcpService {
                src: PortRange::any(),
                dst: PortRange::single(443),
                flags_mask: TcpFlags(TcpFlags::SYN | TcpFlags::ACK),
                flags_set: TcpFlags(TcpFlags::SYN),
                established: false,
            },
        );
        let mut ctx = ctx_for(store, fw);
        let got = run_stage(
            &mut ctx,
            separate_special_services(),
            vec![rule_with_srv(vec![plain, syn])],
        );
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].data.srv.items, vec![plain]);
        assert_eq!(got[1].data.srv.items, vec![syn]);
    }

    #[test]
    fn reject_with_tcp_reset_splits_on_protocol() {
        let (mut store, fw) = fixture();
        let ssh = tcp(&mut store, "ssh", 22);
        let dns = udp(&mut store, "dns", 53);
        let mut rule = rule_with_srv(vec![ssh, dns]);
        rule.data.action = fwforge_model::Action::Reject;
        rule.data.options.reject_with = Some("tcp-reset".into());
        let mut ctx = ctx_for(store, fw);
        let got = run_stage(&mut ctx, reject_split(), vec![rule]);
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].aux.action_on_reject.as_deref(), Some("tcp-reset"));
        assert_eq!(got[0].data.srv.items, vec![ssh]);
        assert_eq!(
            got[1].aux.action_on_reject.as_deref(),
            Some("icmp-port-unreachable")
        );
        assert_eq!(got[1].data.srv.items, vec![dns]);
    }
}
