//! The iptables backend: policy and NAT stage sets plus the emitters.

pub mod addresses;
pub mod emit;
pub mod nat;
pub mod optimize;
pub mod policy;
pub mod select;
pub mod services;
pub mod shadowing;
pub mod verify;

use crate::context::CompilerContext;
use crate::pipeline::{Pipeline, PipelineBuilder};
use crate::rule::{CompilerRule, ElementSlot, NatRule, PolicyRule};
use crate::stages::{
    CountRules, EliminateDuplicates, ExpandGroups, FilterAddressFamily, InjectRules,
};
use fwforge_model::rules::RuleElement;
use fwforge_model::{ObjectId, ObjectKind};

pub(crate) static ADDR_SLOTS: [ElementSlot; 2] = [ElementSlot::Src, ElementSlot::Dst];
pub(crate) static ITF_SLOT: [ElementSlot; 1] = [ElementSlot::Itf];
pub(crate) static NAT_ORIG_ADDR_SLOTS: [ElementSlot; 2] =
    [ElementSlot::OrigSrc, ElementSlot::OrigDst];

/// True when the element names only the firewall or its own addresses.
pub(crate) fn element_matches_fw(ctx: &CompilerContext, el: &RuleElement) -> bool {
    !el.is_any() && el.items.iter().all(|id| ctx.store.matches_firewall(*id, ctx.fw))
}

/// Deep-copy the enabled rules of the current policy rule set out of the
/// scratch store.
pub fn collect_policy_rules(ctx: &CompilerContext) -> Vec<PolicyRule> {
    ctx.store
        .children(ctx.rule_set)
        .filter_map(|o| match &o.kind {
            ObjectKind::PolicyRule(data) if !data.disabled => {
                Some(PolicyRule::from_data(data.clone()))
            }
            _ => None,
        })
        .collect()
}

pub fn collect_nat_rules(ctx: &CompilerContext) -> Vec<NatRule> {
    ctx.store
        .children(ctx.rule_set)
        .filter_map(|o| match &o.kind {
            ObjectKind::NatRule(data) if !data.disabled => Some(NatRule::from_data(data.clone())),
            _ => None,
        })
        .collect()
}

/// The full iptables policy pipeline. Stage order is load-bearing; see the
/// stage modules for the individual transformations.
pub fn build_policy_pipeline(
    ctx: &CompilerContext,
    rules: Vec<PolicyRule>,
) -> Pipeline<PolicyRule> {
    let debug = ctx.debug.map(|f| (f.kind, f.position));
    PipelineBuilder::new(debug)
        .add(InjectRules::new(rules))
        .add(CountRules::new())
        .add(policy::log_all())
        .add(policy::table_routing())
        .add(policy::store_action())
        .add(ExpandGroups::new(&ITF_SLOT))
        .add(policy::replace_cluster_interfaces())
        .add(policy::interface_negation())
        .add(policy::direction())
        .add(policy::negation(ElementSlot::Src))
        .add(policy::negation(ElementSlot::Dst))
        .add(policy::negation(ElementSlot::Srv))
        .add(policy::negation(ElementSlot::Time))
        .add(policy::logging())
        .add(policy::split_tag_classify_route())
        .add(ExpandGroups::new(PolicyRule::slots()))
        .add(EliminateDuplicates::new(PolicyRule::slots()))
        .add(select::split_if_any_includes_fw())
        .add(select::mangle_chains())
        .add(addresses::expand_addresses())
        .add(select::split_if_matches_fw(ElementSlot::Src))
        .add(select::split_if_matches_fw(ElementSlot::Dst))
        .add(select::split_if_fw_in_both())
        .add(select::rules_per_interface())
        .add(FilterAddressFamily::new(&ADDR_SLOTS))
        .add(verify::drop_wrong_family_services())
        .add(verify::drop_wrong_family_interfaces())
        .add(select::assign_chains())
        .add(select::assign_targets())
        .add(select::strip_fw_references())
        .add(services::reject_split())
        .add(services::group_by_protocol())
        .add(services::separate_special_services())
        .add(optimize::Optimize1::new(1))
        .add(optimize::Optimize1::new(2))
        .add(optimize::Optimize1::new(3))
        .add(optimize::optimize2())
        .add(optimize::Optimize3::new())
        .add(optimize::optimize_iface_plus())
        .add(addresses::atomize())
        .add(services::prepare_multiport())
        .add(verify::final_checks())
        .add(select::CountChainUsage::new())
        .build()
}

/// The iptables NAT pipeline.
pub fn build_nat_pipeline(ctx: &CompilerContext, rules: Vec<NatRule>) -> Pipeline<NatRule> {
    let debug = ctx.debug.map(|f| (f.kind, f.position));
    PipelineBuilder::new(debug)
        .add(InjectRules::new(rules))
        .add(CountRules::new())
        .add(nat::interface_negation())
        .add(ExpandGroups::new(NatRule::slots()))
        .add(FilterAddressFamily::new(&NAT_ORIG_ADDR_SLOTS))
        .add(EliminateDuplicates::new(NatRule::slots()))
        .add(nat::classify())
        .add(nat::verify_no_translated_negation())
        .add(nat::port_translation())
        .add(nat::detect_redirect())
        .add(nat::split_nonat())
        .add(nat::assign_chains())
        .add(nat::assign_targets())
        .add(nat::expand_addresses())
        .add(nat::group_by_protocol())
        .add(nat::prepare_multiport())
        .add(nat::atomize())
        .add(nat::assign_interfaces())
        .add(nat::CountChainUsage::new())
        .build()
}

/// Synthesize a scratch address object for an expansion result.
pub(crate) fn scratch_net_v4(
    ctx: &mut CompilerContext,
    name_hint: &str,
    net: ipnet::Ipv4Net,
) -> ObjectId {
    ctx.store
        .add(None, format!("{}:{}", name_hint, net), ObjectKind::Network(net))
}

pub(crate) fn scratch_addr(
    ctx: &mut CompilerContext,
    name_hint: &str,
    addr: std::net::IpAddr,
) -> ObjectId {
    let kind = match addr {
        std::net::IpAddr::V4(a) => ObjectKind::Ipv4Address(a),
        std::net::IpAddr::V6(a) => ObjectKind::Ipv6Address(a),
    };
    ctx.store.add(None, format!("{}:{}", name_hint, addr), kind)
}
