//! iptables command rendering.
//!
//! By the time rules arrive here they are atomic: one object per positional
//! element (or a multiport bundle), one assigned chain, one target. The
//! emitter is a pure renderer plus chain bookkeeping — `-N` declarations are
//! emitted once, before first use, and only for chains something jumps to.

use crate::chains::is_builtin_chain;
use crate::context::CompilerContext;
use crate::ipt::services::{proto_of, ProtoGroup};
use crate::rule::{NatRule, PolicyRule};
use fwforge_model::rules::Direction;
use fwforge_model::{ObjectId, ObjectKind};
use std::collections::BTreeSet;

/// Output flavor for the iptables backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptFormat {
    /// Shell script fragment: `$IPTABLES -w -t filter -A INPUT ...`
    Script,
    /// iptables-restore batch: `-A INPUT ...` (the driver adds table
    /// headers and COMMIT).
    Restore,
    /// Restore lines wrapped in `echo` for runtime variable substitution.
    RestoreEcho,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Src,
    Dst,
}

fn addr_match(ctx: &CompilerContext, id: ObjectId, role: Role, negated: bool) -> String {
    let flag = match role {
        Role::Src => "-s",
        Role::Dst => "-d",
    };
    let bang = if negated { "! " } else { "" };
    let obj = ctx.store.get(id);
    match &obj.kind {
        ObjectKind::Ipv4Address(a) => format!("{} {}{}", flag, bang, a),
        ObjectKind::Ipv6Address(a) => format!("{} {}{}", flag, bang, a),
        ObjectKind::Network(n) => format!("{} {}{}", flag, bang, n),
        ObjectKind::NetworkV6(n) => format!("{} {}{}", flag, bang, n),
        ObjectKind::AddressRange { start, end } => {
            let range_flag = match role {
                Role::Src => "--src-range",
                Role::Dst => "--dst-range",
            };
            format!("-m iprange {}{} {}-{}", bang, range_flag, start, end)
        }
        ObjectKind::AddressTable { .. } => {
            let side = match role {
                Role::Src => "src",
                Role::Dst => "dst",
            };
            format!("-m set {}--match-set {} {}", bang, obj.name, side)
        }
        ObjectKind::DnsName { hostname, .. } => format!("{} {}{}", flag, bang, hostname),
        ObjectKind::PhysAddress { mac } => format!("-m mac --mac-source {}{}", bang, mac),
        _ => String::new(),
    }
}

struct ServiceParts {
    proto: String,
    sport: String,
    dport: String,
}

fn service_parts(ctx: &CompilerContext, rule_srv: &[ObjectId], multiport: bool, negated: bool) -> ServiceParts {
    let mut parts = ServiceParts {
        proto: String::new(),
        sport: String::new(),
        dport: String::new(),
    };
    let Some(&first) = rule_srv.first() else {
        return parts;
    };
    let bang = if negated { "! " } else { "" };
    match proto_of(ctx, first) {
        ProtoGroup::Tcp | ProtoGroup::Udp => {
            let proto = if proto_of(ctx, first) == ProtoGroup::Tcp {
                "tcp"
            } else {
                "udp"
            };
            parts.proto = format!("-p {} -m {}", proto, proto);
            if multiport {
                let ports: Vec<String> = rule_srv
                    .iter()
                    .filter_map(|id| match &ctx.store.get(*id).kind {
                        ObjectKind::TcpService { dst, .. } | ObjectKind::UdpService { dst, .. } => {
                            (!dst.is_any()).then(|| dst.to_ipt())
                        }
                        _ => None,
                    })
                    .collect();
                parts.dport = format!("-m multiport {}--dports {}", bang, ports.join(","));
            } else if let ObjectKind::TcpService {
                src,
                dst,
                flags_mask,
                flags_set,
                ..
            } = normalize_ports(&ctx.store.get(first).kind)
            {
                if !src.is_any() {
                    parts.sport = format!("--sport {}{}", bang, src.to_ipt());
                }
                if !dst.is_any() {
                    parts.dport = format!("--dport {}{}", bang, dst.to_ipt());
                }
                if !flags_mask.is_empty() {
                    parts.dport = format!(
                        "--tcp-flags {} {} {}",
                        flags_mask.to_ipt(),
                        flags_set.to_ipt(),
                        parts.dport
                    )
                    .trim_end()
                    .to_string();
                }
            }
        }
        ProtoGroup::Icmp => {
            parts.proto = "-p icmp -m icmp".into();
            if let ObjectKind::IcmpService { icmp_type, icmp_code } = &ctx.store.get(first).kind {
                if *icmp_type >= 0 {
                    let code = if *icmp_code >= 0 {
                        format!("/{}", icmp_code)
                    } else {
                        String::new()
                    };
                    parts.dport = format!("--icmp-type {}{}{}", bang, icmp_type, code);
                }
            }
        }
        ProtoGroup::Icmp6 => {
            parts.proto = "-p ipv6-icmp -m icmp6".into();
            if let ObjectKind::Icmp6Service { icmp_type, icmp_code } = &ctx.store.get(first).kind {
                if *icmp_type >= 0 {
                    let code = if *icmp_code >= 0 {
                        format!("/{}", icmp_code)
                    } else {
                        String::new()
                    };
                    parts.dport = format!("--icmpv6-type {}{}{}", bang, icmp_type, code);
                }
            }
        }
        ProtoGroup::Ip(p) => {
            parts.proto = format!("-p {}{}", bang, p);
        }
        ProtoGroup::Custom => {
            if let ObjectKind::CustomService { codes, .. } = &ctx.store.get(first).kind {
                parts.proto = codes.get("iptables").cloned().unwrap_or_default();
            }
        }
        ProtoGroup::Tag => {
            if let ObjectKind::TagService { code } = &ctx.store.get(first).kind {
                parts.proto = format!("-m mark {}--mark {}", bang, code);
            }
        }
        ProtoGroup::User => {
            if let ObjectKind::UserService { user } = &ctx.store.get(first).kind {
                parts.proto = format!("-m owner {}--uid-owner {}", bang, user);
            }
        }
        ProtoGroup::Other => {}
    }
    parts
}

/// TCP/UDP services share the port layout; view UDP as a flag-less TCP.
fn normalize_ports(kind: &ObjectKind) -> ObjectKind {
    match kind {
        ObjectKind::UdpService { src, dst } => ObjectKind::TcpService {
            src: *src,
            dst: *dst,
            flags_mask: Default::default(),
            flags_set: Default::default(),
            established: false,
        },
        other => other.clone(),
    }
}

fn iface_match(ctx: &CompilerContext, rule: &PolicyRule) -> String {
    if rule.aux.iface_none {
        return String::new();
    }
    let flag = match rule.data.direction {
        Direction::Outbound => "-o",
        _ => "-i",
    };
    if rule.aux.iface_wildcard {
        return format!("{} +", flag);
    }
    let Some(id) = rule.data.itf.items.first() else {
        return String::new();
    };
    let obj = ctx.store.get(*id);
    let data = ctx.store.iface_data(*id);
    let bang = if rule.aux.single_object_negation_itf {
        "! "
    } else {
        ""
    };
    if data.bridge_port {
        let pd = match rule.data.direction {
            Direction::Outbound => "--physdev-out",
            _ => "--physdev-in",
        };
        return format!("-m physdev {}{} {}", bang, pd, obj.name);
    }
    format!("{} {}{}", flag, bang, obj.name)
}

fn time_match(ctx: &CompilerContext, rule: &PolicyRule) -> String {
    let Some(&id) = rule.data.time.items.first() else {
        return String::new();
    };
    let ObjectKind::Interval(iv) = &ctx.store.get(id).kind else {
        return String::new();
    };
    let mut parts = vec!["-m time".to_string()];
    if let Some(t) = iv.from_time {
        parts.push(format!("--timestart {}", t.format("%H:%M")));
    }
    if let Some(t) = iv.to_time {
        parts.push(format!("--timestop {}", t.format("%H:%M")));
    }
    if let Some(d) = iv.from_date {
        parts.push(format!("--datestart {}", d.format("%Y-%m-%d")));
    }
    if let Some(d) = iv.to_date {
        parts.push(format!("--datestop {}", d.format("%Y-%m-%d")));
    }
    if !iv.days.is_empty() {
        let days: Vec<&str> = iv
            .days
            .iter()
            .map(|d| match d {
                chrono::Weekday::Mon => "Mon",
                chrono::Weekday::Tue => "Tue",
                chrono::Weekday::Wed => "Wed",
                chrono::Weekday::Thu => "Thu",
                chrono::Weekday::Fri => "Fri",
                chrono::Weekday::Sat => "Sat",
                chrono::Weekday::Sun => "Sun",
            })
            .collect();
        parts.push(format!("--days {}", days.join(",")));
    }
    parts.join(" ")
}

fn limit_match(rule: &PolicyRule) -> String {
    let o = &rule.data.options;
    let mut parts = Vec::new();
    if let Some(limit) = &o.limit_value {
        let mut m = format!("-m limit --limit {}", limit);
        if let Some(burst) = o.limit_burst {
            m.push_str(&format!(" --limit-burst {}", burst));
        }
        parts.push(m);
    }
    if let Some(above) = o.connlimit_above {
        let mut m = format!("-m connlimit --connlimit-above {}", above);
        if let Some(mask) = o.connlimit_masklen {
            m.push_str(&format!(" --connlimit-mask {}", mask));
        }
        parts.push(m);
    }
    if let Some(value) = &o.hashlimit_value {
        let mut m = format!("-m hashlimit --hashlimit {}", value);
        if let Some(name) = &o.hashlimit_name {
            m.push_str(&format!(" --hashlimit-name {}", name));
        }
        if let Some(mode) = &o.hashlimit_mode {
            m.push_str(&format!(" --hashlimit-mode {}", mode));
        }
        parts.push(m);
    }
    parts.join(" ")
}

fn target_part(ctx: &CompilerContext, rule: &PolicyRule) -> String {
    let o = &rule.data.options;
    match rule.target() {
        "" | "CONTINUE" => String::new(),
        "CUSTOM" => o.custom_code.clone().unwrap_or_default(),
        "LOG" => {
            let action = rule
                .aux
                .stored_action
                .unwrap_or(rule.data.action)
                .as_str()
                .to_uppercase();
            let prefix = o
                .log_prefix
                .clone()
                .filter(|p| !p.is_empty())
                .unwrap_or_else(|| format!("RULE {} -- {} ", rule.data.position, action));
            let level = o
                .log_level
                .clone()
                .filter(|l| !l.is_empty())
                .unwrap_or_else(|| ctx.options.log_level.clone());
            format!("-j LOG --log-level {} --log-prefix \"{}\"", level, prefix)
        }
        "REJECT" => {
            let with = rule
                .aux
                .action_on_reject
                .clone()
                .or_else(|| o.reject_with.clone())
                .unwrap_or_else(|| ctx.options.action_on_reject.clone());
            format!("-j REJECT --reject-with {}", with)
        }
        "MARK" => format!(
            "-j MARK --set-mark {}",
            o.tag_value.clone().unwrap_or_else(|| "0".into())
        ),
        "CONNMARK" => {
            if rule.aux.connmark_save {
                "-j CONNMARK --save-mark".into()
            } else {
                format!(
                    "-j CONNMARK --set-mark {}",
                    o.tag_value.clone().unwrap_or_else(|| "0".into())
                )
            }
        }
        "CLASSIFY" => format!(
            "-j CLASSIFY --set-class {}",
            o.classify_value.clone().unwrap_or_else(|| "1:1".into())
        ),
        "ROUTE" => {
            let mut t = "-j ROUTE".to_string();
            if let Some(gw) = &o.route_gateway {
                t.push_str(&format!(" --gw {}", gw));
            }
            if let Some(oif) = &o.route_interface {
                t.push_str(&format!(" --oif {}", oif));
            }
            t
        }
        other => format!("-j {}", other),
    }
}

/// The match-and-target part of one policy rule, without the `-A <chain>`
/// prefix. Also serves as the dedup key for the optimizer.
pub(crate) fn policy_rule_body(ctx: &CompilerContext, rule: &PolicyRule) -> String {
    let mut parts: Vec<String> = Vec::new();
    push_nonempty(&mut parts, iface_match(ctx, rule));

    let srv_parts = service_parts(
        ctx,
        &rule.data.srv.items,
        rule.aux.multiport,
        rule.aux.single_object_negation_srv,
    );
    push_nonempty(&mut parts, srv_parts.proto);

    if let Some(&src) = rule.data.src.items.first() {
        push_nonempty(
            &mut parts,
            addr_match(ctx, src, Role::Src, rule.aux.single_object_negation_src),
        );
    }
    push_nonempty(&mut parts, srv_parts.sport);
    if let Some(&dst) = rule.data.dst.items.first() {
        push_nonempty(
            &mut parts,
            addr_match(ctx, dst, Role::Dst, rule.aux.single_object_negation_dst),
        );
    }
    push_nonempty(&mut parts, srv_parts.dport);

    if !rule.data.options.stateless && rule.target() == "ACCEPT" {
        parts.push("-m conntrack --ctstate NEW".into());
    }
    push_nonempty(&mut parts, time_match(ctx, rule));
    push_nonempty(&mut parts, limit_match(rule));
    push_nonempty(&mut parts, target_part(ctx, rule));
    parts.join(" ")
}

fn push_nonempty(parts: &mut Vec<String>, part: String) {
    if !part.is_empty() {
        parts.push(part);
    }
}

/// Dedup key used by optimize pass 3: identical emission, identical rule.
pub(crate) fn match_signature(ctx: &CompilerContext, rule: &PolicyRule) -> String {
    format!("{}|{}", rule.chain(), policy_rule_body(ctx, rule))
}

fn family_table(ctx: &CompilerContext) -> &'static str {
    match ctx.table {
        crate::context::Table::Filter => "filter",
        crate::context::Table::Mangle => "mangle",
        crate::context::Table::Nat => "nat",
    }
}

struct Accumulator<'a> {
    ctx: &'a CompilerContext,
    format: ScriptFormat,
    lines: Vec<String>,
    declared: BTreeSet<String>,
    last_label: Option<String>,
}

impl<'a> Accumulator<'a> {
    fn new(ctx: &'a CompilerContext, format: ScriptFormat) -> Self {
        Self {
            ctx,
            format,
            lines: Vec::new(),
            declared: BTreeSet::new(),
            last_label: None,
        }
    }

    fn rule_header(&mut self, position: usize, label: &str) {
        if self.last_label.as_deref() == Some(label) {
            return;
        }
        self.last_label = Some(label.to_string());
        self.lines.push("# ".into());
        self.lines.push(format!("# Rule {} ({})", position, label));
        self.lines.push("# ".into());
        if self.format == ScriptFormat::Script {
            self.lines.push(format!("echo \"Rule {} ({})\"", position, label));
        }
        for note in self.ctx.diag.notes_for(label) {
            let tag = match note.severity {
                crate::diag::Severity::Warning => "warning",
                crate::diag::Severity::Error => "error",
            };
            self.lines.push(format!("# {}: {}", tag, note.message));
        }
    }

    fn declare_chain(&mut self, chain: &str) {
        if is_builtin_chain(chain) || self.declared.contains(chain) {
            return;
        }
        if self.ctx.chains.usage_of(chain) == 0 {
            return;
        }
        self.declared.insert(chain.to_string());
        match self.format {
            ScriptFormat::Script => self.lines.push(format!("$IPTABLES -N {}", chain)),
            ScriptFormat::Restore => self.lines.push(format!(":{} - [0:0]", chain)),
            ScriptFormat::RestoreEcho => {
                self.lines.push(format!("echo \":{} - [0:0]\"", chain))
            }
        }
    }

    fn rule_line(&mut self, chain: &str, body: &str) {
        let line = match self.format {
            ScriptFormat::Script => format!(
                "$IPTABLES -w -t {} -A {} {}",
                family_table(self.ctx),
                chain,
                body
            ),
            ScriptFormat::Restore => format!("-A {} {}", chain, body),
            ScriptFormat::RestoreEcho => format!("echo \"-A {} {}\"", chain, body),
        };
        self.lines.push(line.trim_end().to_string());
    }
}

/// Render a compiled policy rule stream.
pub fn emit_policy(ctx: &CompilerContext, rules: &[PolicyRule], format: ScriptFormat) -> String {
    let mut acc = Accumulator::new(ctx, format);
    // The restore parser wants every chain declared before the first rule
    // of its table block.
    if format != ScriptFormat::Script {
        for rule in rules {
            acc.declare_chain(rule.chain());
            if let Some(target) = &rule.aux.target {
                acc.declare_chain(target);
            }
        }
    }
    for rule in rules {
        let chain = rule.chain().to_string();
        if chain.is_empty() {
            continue;
        }
        // Dead user chain: nothing jumps to it, so neither the chain nor
        // its rules are emitted.
        if !is_builtin_chain(&chain) && ctx.chains.usage_of(&chain) == 0 {
            continue;
        }
        acc.rule_header(rule.data.position, &rule.data.label);
        acc.declare_chain(&chain);
        if let Some(target) = &rule.aux.target {
            acc.declare_chain(target);
        }
        let body = policy_rule_body(ctx, rule);
        acc.rule_line(&chain, &body);
    }
    let mut text = acc.lines.join("\n");
    if !text.is_empty() {
        text.push('\n');
    }
    text
}

// ----------------------------------------------------------------------
// NAT rendering
// ----------------------------------------------------------------------

fn nat_iface(ctx: &CompilerContext, rule: &NatRule) -> String {
    let mut parts = Vec::new();
    if let Some(&id) = rule.data.itf_in.items.first() {
        let bang = if rule.aux.single_object_negation_itf_in {
            "! "
        } else {
            ""
        };
        parts.push(format!("-i {}{}", bang, ctx.store.get(id).name));
    }
    if let Some(&id) = rule.data.itf_out.items.first() {
        let bang = if rule.aux.single_object_negation_itf_out {
            "! "
        } else {
            ""
        };
        parts.push(format!("-o {}{}", bang, ctx.store.get(id).name));
    }
    parts.join(" ")
}

fn first_addr_text(ctx: &CompilerContext, element_items: &[ObjectId]) -> Option<String> {
    let &id = element_items.first()?;
    let addrs = ctx.store.addresses_of(id, Some(ctx.family));
    if let Some(a) = addrs.first() {
        return Some(a.to_string());
    }
    match &ctx.store.get(id).kind {
        ObjectKind::Network(n) => Some(n.to_string()),
        ObjectKind::NetworkV6(n) => Some(n.to_string()),
        _ => None,
    }
}

fn nat_port_suffix(ctx: &CompilerContext, rule: &NatRule, sep: char) -> String {
    let Some(&id) = rule.data.tsrv.items.first() else {
        return String::new();
    };
    match &ctx.store.get(id).kind {
        ObjectKind::TcpService { dst, .. } | ObjectKind::UdpService { dst, .. }
            if !dst.is_any() =>
        {
            if dst.is_single() {
                format!("{}{}", sep, dst.start)
            } else {
                format!("{}{}-{}", sep, dst.start, dst.end)
            }
        }
        _ => String::new(),
    }
}

fn nat_target(ctx: &CompilerContext, rule: &NatRule) -> String {
    use crate::rule::NatKind;
    match rule.aux.kind {
        Some(NatKind::Masquerade) => {
            let ports = nat_port_suffix(ctx, rule, ':');
            if ports.is_empty() {
                "-j MASQUERADE".into()
            } else {
                format!("-j MASQUERADE --to-ports {}", &ports[1..])
            }
        }
        Some(NatKind::Snat) => {
            let addr = first_addr_text(ctx, &rule.data.tsrc.items).unwrap_or_default();
            format!("-j SNAT --to-source {}{}", addr, nat_port_suffix(ctx, rule, ':'))
        }
        Some(NatKind::SNetNat) => {
            let net = first_addr_text(ctx, &rule.data.tsrc.items).unwrap_or_default();
            format!("-j NETMAP --to {}", net)
        }
        Some(NatKind::Dnat) => {
            let addr = first_addr_text(ctx, &rule.data.tdst.items).unwrap_or_default();
            format!(
                "-j DNAT --to-destination {}{}",
                addr,
                nat_port_suffix(ctx, rule, ':')
            )
        }
        Some(NatKind::DNetNat) => {
            let net = first_addr_text(ctx, &rule.data.tdst.items).unwrap_or_default();
            format!("-j NETMAP --to {}", net)
        }
        Some(NatKind::Redirect) => {
            let ports = nat_port_suffix(ctx, rule, ':');
            if ports.is_empty() {
                "-j REDIRECT".into()
            } else {
                format!("-j REDIRECT --to-ports {}", &ports[1..])
            }
        }
        _ => match rule.target() {
            "" => String::new(),
            t => format!("-j {}", t),
        },
    }
}

pub(crate) fn nat_rule_body(ctx: &CompilerContext, rule: &NatRule) -> String {
    let mut parts = Vec::new();
    push_nonempty(&mut parts, nat_iface(ctx, rule));
    let srv_parts = service_parts(ctx, &rule.data.osrv.items, rule.aux.multiport, false);
    push_nonempty(&mut parts, srv_parts.proto);
    if let Some(&src) = rule.data.osrc.items.first() {
        push_nonempty(&mut parts, addr_match(ctx, src, Role::Src, false));
    }
    push_nonempty(&mut parts, srv_parts.sport);
    if let Some(&dst) = rule.data.odst.items.first() {
        push_nonempty(&mut parts, addr_match(ctx, dst, Role::Dst, false));
    }
    push_nonempty(&mut parts, srv_parts.dport);
    push_nonempty(&mut parts, nat_target(ctx, rule));
    parts.join(" ")
}

pub(crate) fn nat_signature(ctx: &CompilerContext, rule: &NatRule) -> String {
    format!("{}|{}", rule.chain(), nat_rule_body(ctx, rule))
}

/// Render a compiled NAT rule stream.
pub fn emit_nat(ctx: &CompilerContext, rules: &[NatRule], format: ScriptFormat) -> String {
    let mut acc = Accumulator::new(ctx, format);
    if format != ScriptFormat::Script {
        for rule in rules {
            acc.declare_chain(rule.chain());
            if let Some(target) = &rule.aux.target {
                acc.declare_chain(target);
            }
        }
    }
    for rule in rules {
        let chain = rule.chain().to_string();
        if chain.is_empty() {
            continue;
        }
        if !is_builtin_chain(&chain) && ctx.chains.usage_of(&chain) == 0 {
            continue;
        }
        acc.rule_header(rule.data.position, &rule.data.label);
        acc.declare_chain(&chain);
        if let Some(target) = &rule.aux.target {
            acc.declare_chain(target);
        }
        let body = nat_rule_body(ctx, rule);
        acc.rule_line(&chain, &body);
    }
    let mut text = acc.lines.join("\n");
    if !text.is_empty() {
        text.push('\n');
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{RuleSetKind, Table};
    use crate::rule::PolicyRule;
    use fwforge_model::rules::{Action, PolicyRuleData, RuleElement, RuleOptions};
    use fwforge_model::service::PortRange;
    use fwforge_model::{Family, ObjectStore, TcpFlags};

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

    fn ctx_for(store: ObjectStore, fw: ObjectId) -> CompilerContext {
        let set = store.policies_of(fw)[0];
        CompilerContext::new(
            store,
            fw,
            Family::V4,
            Table::Filter,
            set,
            RuleSetKind::Policy,
        )
    }

    fn base_rule() -> PolicyRule {
        let mut r = PolicyRule::from_data(PolicyRuleData {
            src: RuleElement::any(),
            dst: RuleElement::any(),
            srv: RuleElement::any(),
            itf: RuleElement::any(),
            time: RuleElement::any(),
            direction: Direction::Inbound,
            action: Action::Accept,
            options: RuleOptions::default(),
            position: 0,
            label: "rule 0".into(),
            disabled: false,
            comment: String::new(),
        });
        r.aux.iface_none = true;
        r.aux.chain = Some("INPUT".into());
        r.aux.target = Some("ACCEPT".into());
        r
    }

    #[test]
    fn trivial_accept_renders_conntrack() {
        let (mut store, fw) = fixture();
        let ssh = store.add(
            None,
            "ssh",
            ObjectKind::TcpService {
                src: PortRange::any(),
                dst: PortRange::single(22),
                flags_mask: TcpFlags::default(),
                flags_set: TcpFlags::default(),
                established: false,
            },
        );
        let mut rule = base_rule();
        rule.data.srv = RuleElement::of(vec![ssh]);
        let ctx = ctx_for(store, fw);
        let body = policy_rule_body(&ctx, &rule);
        assert_eq!(
            body,
            "-p tcp -m tcp --dport 22 -m conntrack --ctstate NEW -j ACCEPT"
        );
    }

    #[test]
    fn script_line_carries_table_and_chain() {
        let (store, fw) = fixture();
        let ctx = ctx_for(store, fw);
        let rule = base_rule();
        let text = emit_policy(&ctx, &[rule], ScriptFormat::Script);
        assert!(text.contains("$IPTABLES -w -t filter -A INPUT"));
        assert!(text.contains("echo \"Rule 0 (rule 0)\""));
    }

    #[test]
    fn restore_format_has_bare_lines() {
        let (store, fw) = fixture();
        let ctx = ctx_for(store, fw);
        let rule = base_rule();
        let text = emit_policy(&ctx, &[rule], ScriptFormat::Restore);
        assert!(text.contains("\n-A INPUT "));
        assert!(!text.contains("$IPTABLES"));
    }

    #[test]
    fn negated_source_gets_bang() {
        let (mut store, fw) = fixture();
        let net = store.add(None, "lan", ObjectKind::Network("10.0.0.0/8".parse().unwrap()));
        let mut rule = base_rule();
        rule.data.src = RuleElement::of(vec![net]);
        rule.aux.single_object_negation_src = true;
        let ctx = ctx_for(store, fw);
        let body = policy_rule_body(&ctx, &rule);
        assert!(body.contains("-s ! 10.0.0.0/8"));
    }

    #[test]
    fn dead_chain_is_skipped() {
        let (store, fw) = fixture();
        let ctx = ctx_for(store, fw);
        let mut rule = base_rule();
        rule.aux.chain = Some("unused_chain".into());
        let text = emit_policy(&ctx, &[rule], ScriptFormat::Script);
        assert!(text.is_empty());
    }

    #[test]
    fn multiport_renders_port_list() {
        let (mut store, fw) = fixture();
        let mk = |store: &mut ObjectStore, name: &str, p: u16| {
            store.add(
                None,
                name,
                ObjectKind::TcpService {
                    src: PortRange::any(),
                    dst: PortRange::single(p),
                    flags_mask: TcpFlags::default(),
                    flags_set: TcpFlags::default(),
                    established: false,
                },
            )
        };
        let a = mk(&mut store, "ssh", 22);
        let b = mk(&mut store, "http", 80);
        let c = mk(&mut store, "https", 443);
        let mut rule = base_rule();
        rule.data.srv = RuleElement::of(vec![a, b, c]);
        rule.aux.multiport = true;
        let ctx = ctx_for(store, fw);
        let body = policy_rule_body(&ctx, &rule);
        assert!(body.contains("-m multiport --dports 22,80,443"));
    }

    #[test]
    fn log_target_renders_prefix_and_level() {
        let (store, fw) = fixture();
        let ctx = ctx_for(store, fw);
        let mut rule = base_rule();
        rule.aux.target = Some("LOG".into());
        rule.aux.stored_action = Some(Action::Deny);
        let body = policy_rule_body(&ctx, &rule);
        assert!(body.contains("-j LOG --log-level info --log-prefix \"RULE 0 -- DENY \""));
    }
}
