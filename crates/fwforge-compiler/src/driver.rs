//! Per-firewall compile orchestration.
//!
//! For each address family the driver runs the shadow check, the policy
//! pipeline (filter table, plus a mangle pass when any rule does mangle
//! work), the NAT pipeline and the routing pipeline, then assembles the
//! output: header, flush block, predefined rules, rule-set bodies and
//! epilogue. The source graph is never mutated; every pipeline gets its
//! own scratch clone.

use crate::context::{CompilerContext, DebugFilter, RuleSetKind, Table};
use crate::diag::{CompileError, Diagnostics};
use crate::ipt::emit::ScriptFormat;
use crate::rule::PolicyRule;
use fwforge_model::rules::{
    Action, Direction, PolicyRuleData, RuleElement, RuleOptions, RuleSetFamily,
};
use fwforge_model::service::PortRange;
use fwforge_model::{Family, ObjectId, ObjectKind, ObjectStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    IptablesScript,
    IptablesRestore,
    IptablesRestoreEcho,
    Nftables,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileStatus {
    Ok,
    Warnings,
    Errors,
}

#[derive(Debug)]
pub struct DriverOutput {
    pub text: String,
    pub warnings: u32,
    pub errors: u32,
    pub status: CompileStatus,
}

pub struct Driver<'a> {
    store: &'a ObjectStore,
    fw: ObjectId,
    format: OutputFormat,
    debug: Option<DebugFilter>,
}

fn rule_set_family(store: &ObjectStore, set: ObjectId) -> RuleSetFamily {
    match &store.get(set).kind {
        ObjectKind::PolicyRuleSet(d) | ObjectKind::NatRuleSet(d) | ObjectKind::RoutingRuleSet(d) => {
            d.family
        }
        _ => RuleSetFamily::Both,
    }
}

impl<'a> Driver<'a> {
    pub fn new(store: &'a ObjectStore, fw: ObjectId, format: OutputFormat) -> Self {
        Self {
            store,
            fw,
            format,
            debug: None,
        }
    }

    pub fn with_debug(mut self, debug: Option<DebugFilter>) -> Self {
        self.debug = debug;
        self
    }

    fn ctx(&self, family: Family, table: Table, set: ObjectId, kind: RuleSetKind) -> CompilerContext {
        let mut ctx = CompilerContext::new(self.store.clone(), self.fw, family, table, set, kind);
        ctx.debug = self.debug;
        ctx
    }

    pub fn run(&self) -> Result<DriverOutput, CompileError> {
        match self.format {
            OutputFormat::Nftables => self.run_nft(),
            _ => self.run_iptables(),
        }
    }

    // ------------------------------------------------------------------
    // iptables
    // ------------------------------------------------------------------

    fn script_format(&self) -> ScriptFormat {
        match self.format {
            OutputFormat::IptablesRestore => ScriptFormat::Restore,
            OutputFormat::IptablesRestoreEcho => ScriptFormat::RestoreEcho,
            _ => ScriptFormat::Script,
        }
    }

    fn run_iptables(&self) -> Result<DriverOutput, CompileError> {
        let mut diag = Diagnostics::new();
        let mut sections: Vec<String> = Vec::new();
        let format = self.script_format();

        if format == ScriptFormat::Script {
            sections.push(header());
            sections.push(flush_block());
        } else {
            sections.push(restore_header());
        }

        let families = self.active_families();
        for family in families {
            let mut family_sections: Vec<String> = Vec::new();
            let mut mangle_sections: Vec<String> = Vec::new();
            let mut restore_mark = false;

            for (index, set) in self.store.policies_of(self.fw).into_iter().enumerate() {
                if !rule_set_family(self.store, set).includes(family) {
                    continue;
                }

                // Shadow detection runs first, under its own pipeline.
                let mut shadow_ctx = self.ctx(family, Table::Filter, set, RuleSetKind::Policy);
                if shadow_ctx.options.check_shading {
                    let rules = crate::ipt::collect_policy_rules(&shadow_ctx);
                    crate::ipt::shadowing::check(&mut shadow_ctx, rules)?;
                }

                let mut ctx = self.ctx(family, Table::Filter, set, RuleSetKind::Policy);
                let mut rules = Vec::new();
                if index == 0 {
                    rules.extend(predefined_rules(&mut ctx));
                }
                rules.extend(crate::ipt::collect_policy_rules(&ctx));
                let needs_mangle = rules_need_mangle(&ctx, &rules);

                let compiled =
                    crate::ipt::build_policy_pipeline(&ctx, rules.clone()).run(&mut ctx)?;
                family_sections.push(crate::ipt::emit::emit_policy(&ctx, &compiled, format));
                diag.absorb(std::mem::take(&mut ctx.diag));

                if needs_mangle {
                    let mut mctx = self.ctx(family, Table::Mangle, set, RuleSetKind::Policy);
                    let compiled =
                        crate::ipt::build_policy_pipeline(&mctx, rules).run(&mut mctx)?;
                    restore_mark |= mctx.schedule_restore_mark
                        || compiled
                            .iter()
                            .any(|r| r.aux.connmark_save && r.chain() == "OUTPUT");
                    mangle_sections.push(crate::ipt::emit::emit_policy(&mctx, &compiled, format));
                    diag.absorb(std::mem::take(&mut mctx.diag));
                }
            }

            let mut nat_sections: Vec<String> = Vec::new();
            for set in self.store.nats_of(self.fw) {
                if !rule_set_family(self.store, set).includes(family) {
                    continue;
                }
                let mut ctx = self.ctx(family, Table::Nat, set, RuleSetKind::Nat);
                let rules = crate::ipt::collect_nat_rules(&ctx);
                let compiled = crate::ipt::build_nat_pipeline(&ctx, rules).run(&mut ctx)?;
                nat_sections.push(crate::ipt::emit::emit_nat(&ctx, &compiled, format));
                diag.absorb(std::mem::take(&mut ctx.diag));
            }

            let family_text = assemble_family(
                format,
                family,
                family_sections,
                mangle_sections,
                nat_sections,
                restore_mark,
            );
            sections.push(family_text);
        }

        // Routing rules are interface commands, not iptables; only in the
        // shell script flavor.
        if format == ScriptFormat::Script {
            for set in self.store.routings_of(self.fw) {
                let mut ctx = self.ctx(Family::V4, Table::Filter, set, RuleSetKind::Routing);
                let rules = crate::routing::collect_routing_rules(&ctx);
                let compiled = crate::routing::build_routing_pipeline(&ctx, rules).run(&mut ctx)?;
                let text = crate::routing::emit_routes(&ctx, &compiled);
                if !text.is_empty() {
                    sections.push(format!("# \n# Routing\n# \n{}", text));
                }
                diag.absorb(std::mem::take(&mut ctx.diag));
            }
            sections.push("echo \"Activation completed\"\n".to_string());
        }

        Ok(finish(sections, diag))
    }

    fn active_families(&self) -> Vec<Family> {
        let mut v4 = false;
        let mut v6 = false;
        for set in self
            .store
            .policies_of(self.fw)
            .into_iter()
            .chain(self.store.nats_of(self.fw))
        {
            match rule_set_family(self.store, set) {
                RuleSetFamily::V4 => v4 = true,
                RuleSetFamily::V6 => v6 = true,
                RuleSetFamily::Both => v4 = true,
            }
        }
        let mut out = Vec::new();
        if v4 || !v6 {
            out.push(Family::V4);
        }
        if v6 {
            out.push(Family::V6);
        }
        out
    }

    // ------------------------------------------------------------------
    // nftables
    // ------------------------------------------------------------------

    fn run_nft(&self) -> Result<DriverOutput, CompileError> {
        let mut diag = Diagnostics::new();
        let mut all_rules: Vec<PolicyRule> = Vec::new();
        let mut ctxs: Vec<CompilerContext> = Vec::new();

        for set in self.store.policies_of(self.fw) {
            let mut ctx = self.ctx(Family::V4, Table::Filter, set, RuleSetKind::Policy);
            if ctx.options.check_shading {
                let rules = crate::ipt::collect_policy_rules(&ctx);
                crate::ipt::shadowing::check(&mut ctx, rules)?;
            }
            let rules = crate::ipt::collect_policy_rules(&ctx);
            let compiled = crate::nft::build_policy_pipeline(&ctx, rules).run(&mut ctx)?;
            all_rules.extend(compiled);
            ctxs.push(ctx);
        }

        let mut text = String::new();
        text.push_str(&format!(
            "# Generated by fwforge {} on {}\n",
            env!("CARGO_PKG_VERSION"),
            timestamp()
        ));
        // Emit with the last context (chain usage and per-rule notes) before
        // folding diagnostics into the compile-wide sink.
        if let Some(ctx) = ctxs.last() {
            text.push_str(&crate::nft::emit::emit_ruleset(ctx, &all_rules));
        } else {
            text.push_str("flush ruleset\n\ntable inet filter {\n}\n");
        }
        for mut ctx in ctxs {
            diag.absorb(std::mem::take(&mut ctx.diag));
        }

        for set in self.store.nats_of(self.fw) {
            let mut ctx = self.ctx(Family::V4, Table::Nat, set, RuleSetKind::Nat);
            let rules = crate::ipt::collect_nat_rules(&ctx);
            let compiled = crate::ipt::build_nat_pipeline(&ctx, rules).run(&mut ctx)?;
            text.push_str(&crate::nft::emit::emit_nat_ruleset(&ctx, &compiled));
            diag.absorb(std::mem::take(&mut ctx.diag));
        }

        Ok(finish(vec![text], diag))
    }
}

fn finish(sections: Vec<String>, diag: Diagnostics) -> DriverOutput {
    let status = if diag.has_errors() {
        CompileStatus::Errors
    } else if diag.has_warnings() {
        CompileStatus::Warnings
    } else {
        CompileStatus::Ok
    };
    DriverOutput {
        text: sections.concat(),
        warnings: diag.warning_count(),
        errors: diag.error_count(),
        status,
    }
}

fn timestamp() -> String {
    chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

fn header() -> String {
    format!(
        "#!/bin/sh\n# \n# Generated by fwforge {} on {}\n# \nIPTABLES=\"/sbin/iptables\"\nIP6TABLES=\"/sbin/ip6tables\"\n\n",
        env!("CARGO_PKG_VERSION"),
        timestamp()
    )
}

fn restore_header() -> String {
    format!(
        "# Generated by fwforge {} on {}\n",
        env!("CARGO_PKG_VERSION"),
        timestamp()
    )
}

fn flush_block() -> String {
    let mut out = String::from("# Flush and delete all chains\n");
    for table in ["filter", "nat", "mangle"] {
        out.push_str(&format!("$IPTABLES -w -t {} -F\n", table));
        out.push_str(&format!("$IPTABLES -w -t {} -X\n", table));
    }
    out.push('\n');
    out
}

fn assemble_family(
    format: ScriptFormat,
    family: Family,
    policy: Vec<String>,
    mangle: Vec<String>,
    nat: Vec<String>,
    restore_mark: bool,
) -> String {
    let mut out = String::new();
    let policy_text = policy.concat();
    let nat_text = nat.concat();
    let mut mangle_text = mangle.concat();
    if restore_mark {
        mangle_text = format!(
            "$IPTABLES -w -t mangle -A OUTPUT -j CONNMARK --restore-mark\n{}",
            mangle_text
        );
    }

    match format {
        ScriptFormat::Script => {
            out.push_str(&format!("# \n# {} policy\n# \n", family));
            out.push_str(&policy_text);
            if !mangle_text.is_empty() {
                out.push_str("# \n# mangle table\n# \n");
                out.push_str(&mangle_text);
            }
            if !nat_text.is_empty() {
                out.push_str("# \n# NAT\n# \n");
                out.push_str(&nat_text);
            }
        }
        ScriptFormat::Restore | ScriptFormat::RestoreEcho => {
            out.push_str("*filter\n:INPUT DROP [0:0]\n:FORWARD DROP [0:0]\n:OUTPUT DROP [0:0]\n");
            out.push_str(&policy_text);
            out.push_str("COMMIT\n");
            if !mangle_text.is_empty() {
                out.push_str("*mangle\n:PREROUTING ACCEPT [0:0]\n:POSTROUTING ACCEPT [0:0]\n:OUTPUT ACCEPT [0:0]\n");
                out.push_str(&mangle_text);
                out.push_str("COMMIT\n");
            }
            if !nat_text.is_empty() {
                out.push_str("*nat\n:PREROUTING ACCEPT [0:0]\n:POSTROUTING ACCEPT [0:0]\n:OUTPUT ACCEPT [0:0]\n");
                out.push_str(&nat_text);
                out.push_str("COMMIT\n");
            }
        }
    }

    // The v6 pass drives ip6tables.
    if family == Family::V6 && format == ScriptFormat::Script {
        out = out.replace("$IPTABLES ", "$IP6TABLES ");
    }
    out
}

fn rules_need_mangle(ctx: &CompilerContext, rules: &[PolicyRule]) -> bool {
    rules.iter().any(|r| {
        r.data.options.tagging
            || r.data.options.classification
            || r.data.options.routing
            || matches!(
                r.data.action,
                Action::Tag | Action::Classify | Action::Route
            )
            || (r.data.action == Action::Branch
                && r.data
                    .options
                    .branch_target
                    .map(|t| {
                        ctx.store.children(t).any(|o| match &o.kind {
                            ObjectKind::PolicyRule(d) => {
                                d.options.tagging || d.options.classification || d.options.routing
                            }
                            _ => false,
                        })
                    })
                    .unwrap_or(false))
    })
}

/// Predefined rules injected ahead of the user's policy: anti-spoofing,
/// SSH from the management workstation, cluster failover and state-sync
/// permits. Each is a normal rule and flows through the same pipeline.
fn predefined_rules(ctx: &mut CompilerContext) -> Vec<PolicyRule> {
    let mut out = Vec::new();

    if ctx
        .store
        .get(ctx.fw)
        .options
        .get("anti_spoofing")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false)
    {
        for iface in ctx.fw_interfaces() {
            let d = ctx.store.iface_data(iface).clone();
            if d.loopback || d.unnumbered || ctx.store.interface_addresses(iface).is_empty() {
                continue;
            }
            let mut rule = blank_rule("predefined anti-spoofing");
            rule.data.src = RuleElement::of(vec![ctx.fw]);
            rule.data.itf = RuleElement::of(vec![iface]);
            rule.data.direction = Direction::Inbound;
            rule.data.action = Action::Deny;
            rule.aux.chain = Some("INPUT".into());
            out.push(rule);
        }
    }

    if let Some(addr_text) = ctx.options.mgmt_addr.clone() {
        if let Ok(addr) = addr_text.parse::<std::net::IpAddr>() {
            let mgmt = crate::ipt::scratch_addr(ctx, "mgmt", addr);
            let ssh = ctx.store.add(
                None,
                "mgmt:ssh",
                ObjectKind::TcpService {
                    src: PortRange::any(),
                    dst: PortRange::single(22),
                    flags_mask: Default::default(),
                    flags_set: Default::default(),
                    established: false,
                },
            );
            let mut rule = blank_rule("predefined ssh access");
            rule.data.src = RuleElement::of(vec![mgmt]);
            rule.data.dst = RuleElement::of(vec![ctx.fw]);
            rule.data.srv = RuleElement::of(vec![ssh]);
            rule.data.action = Action::Accept;
            out.push(rule);
        } else {
            ctx.diag.warn(
                "firewall options",
                format!("cannot parse mgmt_addr '{}'", addr_text),
            );
        }
    }

    if let Some(cluster) = ctx.cluster {
        let vrrp = ctx.store.add(None, "cluster:vrrp", ObjectKind::IpService { protocol: 112 });
        let mut rule = blank_rule("predefined cluster failover");
        rule.data.srv = RuleElement::of(vec![vrrp]);
        rule.data.action = Action::Accept;
        rule.data.options.stateless = true;
        out.push(rule);

        let has_state_sync = ctx
            .store
            .interfaces_of(cluster)
            .into_iter()
            .any(|i| {
                ctx.store
                    .children(i)
                    .any(|o| matches!(o.kind, ObjectKind::StateSyncGroup { .. }))
            });
        if has_state_sync {
            let sync = ctx.store.add(
                None,
                "cluster:state-sync",
                ObjectKind::UdpService {
                    src: PortRange::any(),
                    dst: PortRange::single(3780),
                },
            );
            let mut rule = blank_rule("predefined cluster state sync");
            rule.data.srv = RuleElement::of(vec![sync]);
            rule.data.action = Action::Accept;
            rule.data.options.stateless = true;
            out.push(rule);
        }
    }

    out
}

fn blank_rule(label: &str) -> PolicyRule {
    PolicyRule::from_data(PolicyRuleData {
        src: RuleElement::any(),
        dst: RuleElement::any(),
        srv: RuleElement::any(),
        itf: RuleElement::any(),
        time: RuleElement::any(),
        direction: Direction::Both,
        action: Action::Deny,
        options: RuleOptions::default(),
        position: 0,
        label: label.to_string(),
        disabled: false,
        comment: String::new(),
    })
}
