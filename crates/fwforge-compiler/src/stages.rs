//! Stages shared by the policy, NAT and routing pipelines.

use crate::context::CompilerContext;
use crate::diag::CompileError;
use crate::pipeline::{Stage, StepResult, Upstream};
use crate::rule::{CompilerRule, ElementSlot};
use fwforge_model::{ObjectId, ObjectKind};
use std::collections::{BTreeSet, VecDeque};
use std::marker::PhantomData;

/// Adapter for stateless per-rule stages: pull one, transform, push any
/// number of results. Dropping a rule is pushing nothing.
pub struct MapStage<R, F> {
    name: &'static str,
    f: F,
    _marker: PhantomData<fn(R)>,
}

impl<R, F> MapStage<R, F>
where
    F: FnMut(&mut CompilerContext, R, &mut VecDeque<R>) -> Result<(), CompileError>,
{
    pub fn new(name: &'static str, f: F) -> Self {
        Self {
            name,
            f,
            _marker: PhantomData,
        }
    }
}

impl<R, F> Stage<R> for MapStage<R, F>
where
    F: FnMut(&mut CompilerContext, R, &mut VecDeque<R>) -> Result<(), CompileError>,
{
    fn name(&self) -> &str {
        self.name
    }

    fn step(
        &mut self,
        ctx: &mut CompilerContext,
        up: &mut Upstream<'_, R>,
        out: &mut VecDeque<R>,
    ) -> Result<StepResult, CompileError> {
        match up.pull_one(ctx)? {
            None => Ok(StepResult::Done),
            Some(rule) => {
                (self.f)(ctx, rule, out)?;
                Ok(StepResult::Produced)
            }
        }
    }
}

/// Source stage: injects the deep-copied rules one per step.
pub struct InjectRules<R> {
    rules: VecDeque<R>,
}

impl<R> InjectRules<R> {
    pub fn new(rules: Vec<R>) -> Self {
        Self {
            rules: rules.into(),
        }
    }
}

impl<R: CompilerRule> Stage<R> for InjectRules<R> {
    fn name(&self) -> &str {
        "begin"
    }

    fn step(
        &mut self,
        _ctx: &mut CompilerContext,
        _up: &mut Upstream<'_, R>,
        out: &mut VecDeque<R>,
    ) -> Result<StepResult, CompileError> {
        match self.rules.pop_front() {
            None => Ok(StepResult::Done),
            Some(rule) => {
                out.push_back(rule);
                Ok(StepResult::Produced)
            }
        }
    }
}

/// Pass-through progress counter; never gets a debug interceptor.
pub struct CountRules {
    seen: usize,
}

impl CountRules {
    pub fn new() -> Self {
        Self { seen: 0 }
    }
}

impl Default for CountRules {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: CompilerRule> Stage<R> for CountRules {
    fn name(&self) -> &str {
        "count rules"
    }

    fn step(
        &mut self,
        ctx: &mut CompilerContext,
        up: &mut Upstream<'_, R>,
        out: &mut VecDeque<R>,
    ) -> Result<StepResult, CompileError> {
        match up.pull_one(ctx)? {
            None => {
                tracing::debug!(
                    rule_set = %ctx.rule_set_name,
                    rules = self.seen,
                    "rule count"
                );
                Ok(StepResult::Done)
            }
            Some(rule) => {
                self.seen += 1;
                out.push_back(rule);
                Ok(StepResult::Produced)
            }
        }
    }

    fn is_progress(&self) -> bool {
        true
    }
}

// ----------------------------------------------------------------------
// Group expansion
// ----------------------------------------------------------------------

/// Recursively expands groups in the given element slots.
///
/// Members are visited alphabetically by name for deterministic output.
/// Group cycles abort the compile; empty groups follow the
/// `ignore_empty_groups` option (remove with a warning, dropping the rule
/// when the element ends up empty, or abort).
pub struct ExpandGroups<R> {
    slots: &'static [ElementSlot],
    _marker: PhantomData<fn(R)>,
}

impl<R> ExpandGroups<R> {
    pub fn new(slots: &'static [ElementSlot]) -> Self {
        Self {
            slots,
            _marker: PhantomData,
        }
    }
}

fn expand_object(
    ctx: &CompilerContext,
    id: ObjectId,
    trail: &mut Vec<ObjectId>,
    out: &mut Vec<ObjectId>,
) -> Result<(), CompileError> {
    let obj = ctx.store.get(id);
    if !obj.kind.is_group() {
        out.push(id);
        return Ok(());
    }
    if trail.contains(&id) {
        return Err(CompileError::abort(format!(
            "group '{}' is a member of itself (recursive groups are not allowed)",
            obj.name
        )));
    }
    trail.push(id);
    let mut members: Vec<ObjectId> = match &obj.kind {
        ObjectKind::DynamicGroup { kind_filter, keyword } => ctx
            .store
            .iter()
            .filter(|o| {
                !o.kind.is_group()
                    && (kind_filter.is_empty() || o.kind.tag() == kind_filter)
                    && (keyword.is_empty() || o.name.contains(keyword.as_str()))
            })
            .map(|o| o.id)
            .collect(),
        _ => ctx.store.group_members(id).to_vec(),
    };
    members.sort_by(|a, b| ctx.store.get(*a).name.cmp(&ctx.store.get(*b).name));
    for member in members {
        expand_object(ctx, member, trail, out)?;
    }
    trail.pop();
    Ok(())
}

impl<R: CompilerRule> Stage<R> for ExpandGroups<R> {
    fn name(&self) -> &str {
        "expand groups"
    }

    fn step(
        &mut self,
        ctx: &mut CompilerContext,
        up: &mut Upstream<'_, R>,
        out: &mut VecDeque<R>,
    ) -> Result<StepResult, CompileError> {
        let Some(mut rule) = up.pull_one(ctx)? else {
            return Ok(StepResult::Done);
        };
        for &slot in self.slots {
            let element = rule.element(slot);
            if element.is_any() {
                continue;
            }
            let had_items = !element.is_empty();
            let mut expanded = Vec::new();
            for &id in &element.items {
                let obj = ctx.store.get(id);
                if obj.kind.is_group() {
                    let before = expanded.len();
                    let mut trail = Vec::new();
                    expand_object(ctx, id, &mut trail, &mut expanded)?;
                    if expanded.len() == before {
                        if ctx.options.ignore_empty_groups {
                            ctx.diag.warn(
                                rule.label(),
                                format!("ignoring empty group '{}' in {}", obj.name, slot.label()),
                            );
                        } else {
                            return Err(CompileError::abort(format!(
                                "group '{}' in {} of rule '{}' is empty",
                                obj.name,
                                slot.label(),
                                rule.label()
                            )));
                        }
                    }
                } else {
                    expanded.push(id);
                }
            }
            if had_items && expanded.is_empty() {
                ctx.diag.warn(
                    rule.label(),
                    format!(
                        "rule dropped: {} became empty after removing empty groups",
                        slot.label()
                    ),
                );
                return Ok(StepResult::Produced);
            }
            rule.element_mut(slot).items = expanded;
        }
        out.push_back(rule);
        Ok(StepResult::Produced)
    }
}

/// Removes duplicate objects (by identity) within each element.
pub struct EliminateDuplicates<R> {
    slots: &'static [ElementSlot],
    _marker: PhantomData<fn(R)>,
}

impl<R> EliminateDuplicates<R> {
    pub fn new(slots: &'static [ElementSlot]) -> Self {
        Self {
            slots,
            _marker: PhantomData,
        }
    }
}

impl<R: CompilerRule> Stage<R> for EliminateDuplicates<R> {
    fn name(&self) -> &str {
        "eliminate duplicates"
    }

    fn step(
        &mut self,
        ctx: &mut CompilerContext,
        up: &mut Upstream<'_, R>,
        out: &mut VecDeque<R>,
    ) -> Result<StepResult, CompileError> {
        let Some(mut rule) = up.pull_one(ctx)? else {
            return Ok(StepResult::Done);
        };
        for &slot in self.slots {
            let element = rule.element_mut(slot);
            let mut seen = BTreeSet::new();
            element.items.retain(|id| seen.insert(*id));
        }
        out.push_back(rule);
        Ok(StepResult::Produced)
    }
}

/// Drops wrong-family address objects from the given slots, and the whole
/// rule when a slot that had objects loses all of them.
pub struct FilterAddressFamily<R> {
    slots: &'static [ElementSlot],
    _marker: PhantomData<fn(R)>,
}

impl<R> FilterAddressFamily<R> {
    pub fn new(slots: &'static [ElementSlot]) -> Self {
        Self {
            slots,
            _marker: PhantomData,
        }
    }
}

/// True when the object can match the given family. Interfaces, firewalls
/// and hosts are kept (their addresses are filtered at expansion time).
pub fn object_matches_family(
    ctx: &CompilerContext,
    id: ObjectId,
    family: fwforge_model::Family,
) -> bool {
    use fwforge_model::Family;
    match &ctx.store.get(id).kind {
        ObjectKind::Ipv4Address(_) | ObjectKind::Network(_) => family == Family::V4,
        ObjectKind::Ipv6Address(_) | ObjectKind::NetworkV6(_) => family == Family::V6,
        ObjectKind::AddressRange { start, .. } => {
            fwforge_model::address::family_of(start) == family
        }
        ObjectKind::DnsName { resolved, .. } => resolved
            .iter()
            .any(|a| fwforge_model::address::family_of(a) == family),
        ObjectKind::AddressTable { .. } => true,
        _ => true,
    }
}

impl<R: CompilerRule> Stage<R> for FilterAddressFamily<R> {
    fn name(&self) -> &str {
        "address family"
    }

    fn step(
        &mut self,
        ctx: &mut CompilerContext,
        up: &mut Upstream<'_, R>,
        out: &mut VecDeque<R>,
    ) -> Result<StepResult, CompileError> {
        let Some(mut rule) = up.pull_one(ctx)? else {
            return Ok(StepResult::Done);
        };
        let family = ctx.family;
        for &slot in self.slots {
            let keep: Vec<ObjectId> = rule
                .element(slot)
                .items
                .iter()
                .copied()
                .filter(|id| object_matches_family(ctx, *id, family))
                .collect();
            let element = rule.element(slot);
            if !element.is_empty() && keep.is_empty() {
                // Nothing in this element applies to the current family.
                return Ok(StepResult::Produced);
            }
            rule.element_mut(slot).items = keep;
        }
        out.push_back(rule);
        Ok(StepResult::Produced)
    }
}
