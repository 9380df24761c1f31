//! nftables-specific stages.

use crate::context::CompilerContext;
use crate::diag::CompileError;
use crate::ipt::element_matches_fw;
use crate::pipeline::{Stage, StepResult, Upstream};
use crate::rule::PolicyRule;
use crate::stages::MapStage;
use fwforge_model::rules::{Action, Direction};
use std::collections::VecDeque;

/// nft expresses negation natively (`!=`, including over sets), so element
/// negation folds straight into the per-rule flags; no chain splitting.
pub fn negation() -> impl Stage<PolicyRule> {
    MapStage::new("nft negation", |_ctx: &mut CompilerContext, mut rule: PolicyRule, out| {
        if rule.data.src.negated {
            rule.aux.single_object_negation_src = true;
            rule.data.src.negated = false;
        }
        if rule.data.dst.negated {
            rule.aux.single_object_negation_dst = true;
            rule.data.dst.negated = false;
        }
        if rule.data.srv.negated {
            rule.aux.single_object_negation_srv = true;
            rule.data.srv.negated = false;
        }
        if rule.data.itf.negated {
            rule.aux.single_object_negation_itf = true;
            rule.data.itf.negated = false;
        }
        out.push_back(rule);
        Ok(())
    })
}

/// Logging is inline in nft: a logged Continue becomes a bare log rule,
/// everything else keeps its verdict and gains a `log prefix` clause.
pub fn logging() -> impl Stage<PolicyRule> {
    MapStage::new("nft logging", |_ctx: &mut CompilerContext, mut rule: PolicyRule, out| {
        if rule.data.options.log && rule.data.action == Action::Continue {
            rule.aux.target = Some("LOG".into());
        }
        out.push_back(rule);
        Ok(())
    })
}

/// Tagging, classification and routing are not implemented for this
/// backend; record a structured error on the rule and keep compiling.
pub fn unsupported_options() -> impl Stage<PolicyRule> {
    MapStage::new("nft unsupported", |ctx: &mut CompilerContext, rule: PolicyRule, out| {
        let o = &rule.data.options;
        if o.tagging || o.classification || o.routing {
            ctx.diag.error(
                &rule.data.label,
                "tagging/classification/routing are not supported by the nftables backend",
            );
        }
        out.push_back(rule);
        Ok(())
    })
}

/// input / output / forward selection.
pub fn assign_chains() -> impl Stage<PolicyRule> {
    MapStage::new("nft chains", |ctx: &mut CompilerContext, mut rule: PolicyRule, out| {
        if rule.aux.chain.is_none() {
            let chain = if element_matches_fw(ctx, &rule.data.dst) {
                rule.data.direction = Direction::Inbound;
                "input"
            } else if element_matches_fw(ctx, &rule.data.src) {
                rule.data.direction = Direction::Outbound;
                "output"
            } else {
                "forward"
            };
            rule.aux.chain = Some(chain.into());
        }
        out.push_back(rule);
        Ok(())
    })
}

/// Verdict per action; branches jump to the target rule set's chain.
pub fn assign_verdicts() -> impl Stage<PolicyRule> {
    MapStage::new("nft verdicts", |ctx: &mut CompilerContext, mut rule: PolicyRule, out| {
        if rule.aux.target.is_some() {
            out.push_back(rule);
            return Ok(());
        }
        let verdict: String = match rule.data.action {
            Action::Accept => "accept".into(),
            Action::Deny => "drop".into(),
            Action::Reject => "reject".into(),
            Action::Return => "return".into(),
            Action::Continue => "continue".into(),
            Action::Pipe => "queue".into(),
            Action::Branch => match rule.data.options.branch_target {
                Some(id) => format!("jump {}", ctx.store.get(id).name),
                None => {
                    ctx.diag.error(
                        &rule.data.label,
                        "branching rule has no target rule set; rule dropped",
                    );
                    return Ok(());
                }
            },
            other => {
                ctx.diag.error(
                    &rule.data.label,
                    format!(
                        "action {} is not supported by the nftables backend; rule dropped",
                        other.as_str()
                    ),
                );
                return Ok(());
            }
        };
        rule.aux.target = Some(verdict);
        out.push_back(rule);
        Ok(())
    })
}

/// Count jump targets so unused branch chains are not rendered.
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
        "nft count chain usage"
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
                if let Some(chain) = target.strip_prefix("jump ") {
                    ctx.chains.count_target(chain);
                }
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
    use fwforge_model::rules::{PolicyRuleData, RuleElement, RuleOptions};
    use fwforge_model::{ObjectId, ObjectKind, ObjectStore};

    fn fixture() -> (ObjectStore, ObjectId) {
        let mut store = ObjectStore::new();
        let fw = store.add(
            None,
            "fw",
            ObjectKind::Firewall {
                platform: "nftables".into(),
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
    fn multi_object_negation_stays_inline() {
        let (mut store, fw) = fixture();
        let a = store.add(None, "a", ObjectKind::Network("10.0.0.0/8".parse().unwrap()));
        let b = store.add(None, "b", ObjectKind::Network("172.16.0.0/12".parse().unwrap()));
        let mut rule = base_rule();
        rule.data.src = RuleElement {
            items: vec![a, b],
            negated: true,
        };
        let mut ctx = ctx_for(store, fw);
        let got = run_stage(&mut ctx, negation(), vec![rule]);
        // No temp chain: one rule with the negation flag set.
        assert_eq!(got.len(), 1);
        assert!(got[0].aux.single_object_negation_src);
        assert_eq!(got[0].data.src.len(), 2);
    }

    #[test]
    fn chains_follow_firewall_match() {
        let (store, fw) = fixture();
        let mut rule = base_rule();
        rule.data.dst = RuleElement::of(vec![fw]);
        let mut ctx = ctx_for(store, fw);
        let got = run_stage(&mut ctx, assign_chains(), vec![rule]);
        assert_eq!(got[0].aux.chain.as_deref(), Some("input"));
    }

    #[test]
    fn verdicts_map_actions() {
        let (store, fw) = fixture();
        let mut deny = base_rule();
        deny.data.action = Action::Deny;
        let mut ctx = ctx_for(store, fw);
        let got = run_stage(&mut ctx, assign_verdicts(), vec![base_rule(), deny]);
        assert_eq!(got[0].aux.target.as_deref(), Some("accept"));
        assert_eq!(got[1].aux.target.as_deref(), Some("drop"));
    }

    #[test]
    fn unsupported_mangle_options_record_errors() {
        let (store, fw) = fixture();
        let mut rule = base_rule();
        rule.data.options.tagging = true;
        let mut ctx = ctx_for(store, fw);
        let got = run_stage(&mut ctx, unsupported_options(), vec![rule]);
        assert_eq!(got.len(), 1, "rule keeps flowing");
        assert!(ctx.diag.has_errors());
    }
}
