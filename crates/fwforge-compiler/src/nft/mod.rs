//! The nftables backend.
//!
//! A much shorter pipeline than iptables: nft has native sets (no multiport
//! bundling), native `!=` (no negation temp chains), inline `log` with a
//! verdict, and a single `inet` family for dual-stack rule sets.

pub mod emit;
pub mod stages;

use crate::context::CompilerContext;
use crate::pipeline::{Pipeline, PipelineBuilder};
use crate::rule::{CompilerRule, PolicyRule};
use crate::stages::{CountRules, EliminateDuplicates, ExpandGroups, InjectRules};

/// The nftables policy pipeline.
pub fn build_policy_pipeline(
    ctx: &CompilerContext,
    rules: Vec<PolicyRule>,
) -> Pipeline<PolicyRule> {
    let debug = ctx.debug.map(|f| (f.kind, f.position));
    PipelineBuilder::new(debug)
        .add(InjectRules::new(rules))
        .add(CountRules::new())
        .add(crate::ipt::policy::log_all())
        .add(ExpandGroups::new(crate::rule::PolicyRule::slots()))
        .add(EliminateDuplicates::new(crate::rule::PolicyRule::slots()))
        .add(stages::negation())
        .add(crate::ipt::policy::direction())
        .add(stages::logging())
        .add(crate::ipt::addresses::expand_addresses())
        .add(stages::unsupported_options())
        .add(stages::assign_chains())
        .add(stages::assign_verdicts())
        .add(stages::CountChainUsage::new())
        .build()
}
