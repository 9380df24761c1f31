//! Pull-based pipeline execution.
//!
//! Stages form a linear chain. The driver pulls from the last stage; each
//! stage pulls zero or one rule from its predecessor per `step()`, pushes
//! zero or more rules to its own buffer, and reports whether it can still
//! produce. A stage that drops a rule reports `Produced` so the pull loop
//! keeps feeding it. Slurping stages read the whole upstream on their first
//! step and then drain their buffer.

use crate::context::{CompilerContext, RuleSetKind};
use crate::diag::CompileError;
use crate::rule::CompilerRule;
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    Produced,
    Done,
}

/// One transformation stage.
pub trait Stage<R> {
    fn name(&self) -> &str;

    /// Pull zero or one rule from `up`, transform, push results to `out`.
    fn step(
        &mut self,
        ctx: &mut CompilerContext,
        up: &mut Upstream<'_, R>,
        out: &mut VecDeque<R>,
    ) -> Result<StepResult, CompileError>;

    /// Pass-through progress stages do not get a debug interceptor.
    fn is_progress(&self) -> bool {
        false
    }
}

struct StageSlot<R> {
    stage: Box<dyn Stage<R>>,
    buffer: VecDeque<R>,
    done: bool,
}

/// View of the predecessor chain handed to a running stage.
pub struct Upstream<'a, R> {
    slots: &'a mut [StageSlot<R>],
}

impl<R> Upstream<'_, R> {
    /// Next rule from the predecessor, or `None` when upstream is finished.
    /// The source stage sees an empty upstream and always gets `None`.
    pub fn pull_one(&mut self, ctx: &mut CompilerContext) -> Result<Option<R>, CompileError> {
        pull_from(self.slots, ctx)
    }

    /// Drain the entire upstream (slurp).
    pub fn pull_all(&mut self, ctx: &mut CompilerContext) -> Result<Vec<R>, CompileError> {
        let mut all = Vec::new();
        while let Some(rule) = self.pull_one(ctx)? {
            all.push(rule);
        }
        Ok(all)
    }
}

fn pull_from<R>(
    slots: &mut [StageSlot<R>],
    ctx: &mut CompilerContext,
) -> Result<Option<R>, CompileError> {
    let Some((last, rest)) = slots.split_last_mut() else {
        return Ok(None);
    };
    loop {
        if let Some(rule) = last.buffer.pop_front() {
            return Ok(Some(rule));
        }
        if last.done {
            return Ok(None);
        }
        let mut up = Upstream { slots: &mut *rest };
        match last.stage.step(ctx, &mut up, &mut last.buffer)? {
            StepResult::Produced => {}
            StepResult::Done => last.done = true,
        }
    }
}

/// An ordered stage chain over one rule type.
pub struct Pipeline<R> {
    slots: Vec<StageSlot<R>>,
}

impl<R: CompilerRule> Pipeline<R> {
    /// Run to completion and collect the surviving rules in order.
    pub fn run(&mut self, ctx: &mut CompilerContext) -> Result<Vec<R>, CompileError> {
        let mut out = Vec::new();
        while let Some(rule) = pull_from(&mut self.slots, ctx)? {
            out.push(rule);
        }
        Ok(out)
    }
}

/// Builds a pipeline, inserting debug interceptors after each non-progress
/// stage when per-rule tracing is active.
pub struct PipelineBuilder<R> {
    slots: Vec<StageSlot<R>>,
    debug: Option<(RuleSetKind, usize)>,
}

impl<R: CompilerRule + 'static> PipelineBuilder<R> {
    pub fn new(debug: Option<(RuleSetKind, usize)>) -> Self {
        Self {
            slots: Vec::new(),
            debug,
        }
    }

    pub fn add(mut self, stage: impl Stage<R> + 'static) -> Self {
        let intercept = self.debug.filter(|_| !stage.is_progress());
        let prev_name = stage.name().to_string();
        self.slots.push(StageSlot {
            stage: Box::new(stage),
            buffer: VecDeque::new(),
            done: false,
        });
        if let Some((kind, position)) = intercept {
            self.slots.push(StageSlot {
                stage: Box::new(DebugInterceptor {
                    prev_name,
                    kind,
                    position,
                    slurped: false,
                }),
                buffer: VecDeque::new(),
                done: false,
            });
        }
        self
    }

    pub fn build(self) -> Pipeline<R> {
        Pipeline { slots: self.slots }
    }
}

/// Prints a canonical dump of the traced rule after the preceding stage.
struct DebugInterceptor {
    prev_name: String,
    kind: RuleSetKind,
    position: usize,
    slurped: bool,
}

impl<R: CompilerRule> Stage<R> for DebugInterceptor {
    fn name(&self) -> &str {
        "debug"
    }

    fn step(
        &mut self,
        ctx: &mut CompilerContext,
        up: &mut Upstream<'_, R>,
        out: &mut VecDeque<R>,
    ) -> Result<StepResult, CompileError> {
        if self.slurped {
            return Ok(StepResult::Done);
        }
        self.slurped = true;
        let rules = up.pull_all(ctx)?;
        let mut printed_header = false;
        for rule in &rules {
            if ctx.debug_matches(self.kind, rule.position()) {
                if !printed_header {
                    eprintln!("--- {} ---", self.prev_name);
                    printed_header = true;
                }
                eprintln!("{}", rule.dump(ctx));
            }
        }
        out.extend(rules);
        Ok(StepResult::Produced)
    }

    fn is_progress(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Table;
    use crate::rule::PolicyRule;
    use fwforge_model::rules::{Action, Direction, PolicyRuleData, RuleElement, RuleOptions};
    use fwforge_model::{ObjectKind, ObjectStore};

    fn rule(position: usize) -> PolicyRule {
        PolicyRule::from_data(PolicyRuleData {
            src: RuleElement::any(),
            dst: RuleElement::any(),
            srv: RuleElement::any(),
            itf: RuleElement::any(),
            time: RuleElement::any(),
            direction: Direction::Both,
            action: Action::Accept,
            options: RuleOptions::default(),
            position,
            label: format!("rule {}", position),
            disabled: false,
            comment: String::new(),
        })
    }

    struct Inject(Vec<PolicyRule>);

    impl Stage<PolicyRule> for Inject {
        fn name(&self) -> &str {
            "inject"
        }

        fn step(
            &mut self,
            _ctx: &mut CompilerContext,
            _up: &mut Upstream<'_, PolicyRule>,
            out: &mut VecDeque<PolicyRule>,
        ) -> Result<StepResult, CompileError> {
            if self.0.is_empty() {
                return Ok(StepResult::Done);
            }
            out.push_back(self.0.remove(0));
            Ok(StepResult::Produced)
        }
    }

    /// Doubles every rule; drops rules at odd positions.
    struct SplitEven;

    impl Stage<PolicyRule> for SplitEven {
        fn name(&self) -> &str {
            "split-even"
        }

        fn step(
            &mut self,
            ctx: &mut CompilerContext,
            up: &mut Upstream<'_, PolicyRule>,
            out: &mut VecDeque<PolicyRule>,
        ) -> Result<StepResult, CompileError> {
            match up.pull_one(ctx)? {
                None => Ok(StepResult::Done),
                Some(rule) => {
                    if rule.position() % 2 == 0 {
                        out.push_back(rule.clone());
                        out.push_back(rule);
                    }
                    Ok(StepResult::Produced)
                }
            }
        }
    }

    struct SlurpReverse {
        slurped: bool,
    }

    impl Stage<PolicyRule> for SlurpReverse {
        fn name(&self) -> &str {
            "slurp-reverse"
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
            let mut rules = up.pull_all(ctx)?;
            rules.reverse();
            out.extend(rules);
            Ok(StepResult::Produced)
        }
    }

    fn test_ctx(store: ObjectStore) -> CompilerContext {
        let fw = store.find_by_name("fw").unwrap();
        let set = store.policies_of(fw)[0];
        CompilerContext::new(store, fw, fwforge_model::Family::V4, Table::Filter, set, RuleSetKind::Policy)
    }

    fn test_store() -> ObjectStore {
        let mut store = ObjectStore::new();
        let fw = store.add(
            None,
            "fw",
            ObjectKind::Firewall {
                platform: "iptables".into(),
                host_os: "linux".into(),
            },
        );
        store.add(
            Some(fw),
            "Policy",
            ObjectKind::PolicyRuleSet(Default::default()),
        );
        store
    }

    #[test]
    fn split_and_filter_preserve_order() {
        let store = test_store();
        let mut ctx = test_ctx(store);
        let mut pipeline = PipelineBuilder::new(None)
            .add(Inject(vec![rule(0), rule(1), rule(2)]))
            .add(SplitEven)
            .build();
        let got = pipeline.run(&mut ctx).unwrap();
        let positions: Vec<usize> = got.iter().map(|r| r.position()).collect();
        assert_eq!(positions, vec![0, 0, 2, 2]);
    }

    #[test]
    fn slurp_sees_everything_then_drains() {
        let store = test_store();
        let mut ctx = test_ctx(store);
        let mut pipeline = PipelineBuilder::new(None)
            .add(Inject(vec![rule(0), rule(1), rule(2)]))
            .add(SlurpReverse { slurped: false })
            .build();
        let got = pipeline.run(&mut ctx).unwrap();
        let positions: Vec<usize> = got.iter().map(|r| r.position()).collect();
        assert_eq!(positions, vec![2, 1, 0]);
    }

    #[test]
    fn empty_pipeline_is_done() {
        let store = test_store();
        let mut ctx = test_ctx(store);
        let mut pipeline = PipelineBuilder::<PolicyRule>::new(None)
            .add(Inject(vec![]))
            .build();
        assert!(pipeline.run(&mut ctx).unwrap().is_empty());
    }
}
