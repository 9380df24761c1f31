//! Optimization passes over the nearly-final rule stream.

use crate::context::CompilerContext;
use crate::diag::CompileError;
use crate::ipt::emit::match_signature;
use crate::pipeline::{Stage, StepResult, Upstream};
use crate::rule::{CompilerRule, ElementSlot, PolicyRule};
use crate::stages::MapStage;
use fwforge_model::rules::Direction;
use std::collections::{BTreeSet, VecDeque};

const OPT1_MAX_POPULATION: usize = 15;

static OPT1_SLOTS: [ElementSlot; 3] = [ElementSlot::Src, ElementSlot::Dst, ElementSlot::Srv];

/// Factor the smallest multi-object element out into a jump + shared body
/// chain. Cascading this pass lets a different element factor out each
/// time.
pub struct Optimize1 {
    name: String,
}

impl Optimize1 {
    pub fn new(pass: u8) -> Self {
        Self {
            name: format!("optimize 1 pass {}", pass),
        }
    }
}

impl Stage<PolicyRule> for Optimize1 {
    fn name(&self) -> &str {
        &self.name
    }

    fn step(
        &mut self,
        ctx: &mut CompilerContext,
        up: &mut Upstream<'_, PolicyRule>,
        out: &mut VecDeque<PolicyRule>,
    ) -> Result<StepResult, CompileError> {
        let Some(rule) = up.pull_one(ctx)? else {
            return Ok(StepResult::Done);
        };

        let negated = |slot: ElementSlot, r: &PolicyRule| match slot {
            ElementSlot::Src => r.aux.single_object_negation_src,
            ElementSlot::Dst => r.aux.single_object_negation_dst,
            ElementSlot::Srv => r.aux.single_object_negation_srv,
            _ => false,
        };

        let populated: Vec<(ElementSlot, usize)> = OPT1_SLOTS
            .iter()
            .filter(|slot| !negated(**slot, &rule))
            .map(|slot| (*slot, rule.element(*slot).len()))
            .filter(|(_, n)| *n >= 1)
            .collect();

        // Factoring pays off only when a multi-object element shares the
        // rule with at least one other populated element.
        let candidate = populated
            .iter()
            .filter(|(_, n)| (2..=OPT1_MAX_POPULATION).contains(n))
            .min_by_key(|(_, n)| *n)
            .copied();
        let (slot, _) = match (candidate, populated.len() >= 2) {
            (Some(c), true) => c,
            _ => {
                out.push_back(rule);
                return Ok(StepResult::Produced);
            }
        };

        let chain = ctx.chains.fresh_chain("o", rule.data.position);

        let mut jump = rule.clone();
        for s in PolicyRule::slots() {
            if *s != slot && *s != ElementSlot::Itf {
                jump.element_mut(*s).clear();
            }
        }
        jump.data.options.strip_log_and_limits();
        jump.data.options.stateless = true;
        jump.aux.target = Some(chain.clone());
        jump.aux.multiport = false;

        let mut body = rule;
        body.element_mut(slot).clear();
        body.data.itf.clear();
        body.aux.iface_none = true;
        body.aux.iface_wildcard = false;
        body.aux.chain = Some(chain);
        body.aux.in_temp_chain = true;
        if slot == ElementSlot::Srv {
            body.aux.srv_matched_upstream = true;
        }

        out.push_back(jump);
        out.push_back(body);
        Ok(StepResult::Produced)
    }
}

/// In a leaf rule whose jump already matched the service, the re-match is
/// redundant unless the target needs protocol information.
pub fn optimize2() -> impl Stage<PolicyRule> {
    MapStage::new("optimize 2", |_ctx: &mut CompilerContext, mut rule: PolicyRule, out| {
        if rule.aux.in_temp_chain
            && rule.aux.srv_matched_upstream
            && !rule.data.srv.is_any()
            && rule.target() != "REJECT"
        {
            rule.data.srv.clear();
        }
        out.push_back(rule);
        Ok(())
    })
}

/// Deduplicate rules that would emit the same command.
pub struct Optimize3 {
    slurped: bool,
}

impl Optimize3 {
    pub fn new() -> Self {
        Self { slurped: false }
    }
}

impl Default for Optimize3 {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage<PolicyRule> for Optimize3 {
    fn name(&self) -> &str {
        "optimize 3"
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
        let mut seen = BTreeSet::new();
        for rule in rules {
            if seen.insert(match_signature(ctx, &rule)) {
                out.push_back(rule);
            }
        }
        Ok(StepResult::Produced)
    }
}

/// `-i +` in INPUT and `-o +` in OUTPUT match every interface anyway.
pub fn optimize_iface_plus() -> impl Stage<PolicyRule> {
    MapStage::new("optimize iface +", |_ctx: &mut CompilerContext, mut rule: PolicyRule, out| {
        if rule.aux.iface_wildcard {
            let redundant = matches!(
                (rule.aux.chain.as_deref(), rule.data.direction),
                (Some("INPUT"), Direction::Inbound) | (Some("OUTPUT"), Direction::Outbound)
            );
            if redundant {
                rule.aux.iface_wildcard = false;
                rule.aux.iface_none = true;
            }
        }
        out.push_back(rule);
        Ok(())
    })
}
