//! nft batch rendering.
//!
//! Rules accumulate per chain; built-in chains get their hook/priority
//! binding and policy, user chains (branch targets) render bare. Sets are
//! native, so multi-object elements render as `{ a, b }` and negation as
//! `!=`.

use crate::context::CompilerContext;
use crate::ipt::services::{proto_of, ProtoGroup};
use crate::rule::PolicyRule;
use fwforge_model::rules::Direction;
use fwforge_model::{Family, ObjectId, ObjectKind};

fn addr_text(ctx: &CompilerContext, id: ObjectId) -> Option<(Family, String)> {
    match &ctx.store.get(id).kind {
        ObjectKind::Ipv4Address(a) => Some((Family::V4, a.to_string())),
        ObjectKind::Ipv6Address(a) => Some((Family::V6, a.to_string())),
        ObjectKind::Network(n) => Some((Family::V4, n.to_string())),
        ObjectKind::NetworkV6(n) => Some((Family::V6, n.to_string())),
        ObjectKind::AddressRange { start, end } => Some((
            fwforge_model::address::family_of(start),
            format!("{}-{}", start, end),
        )),
        ObjectKind::DnsName { hostname, .. } => Some((Family::V4, hostname.clone())),
        _ => None,
    }
}

fn addr_clause(
    ctx: &CompilerContext,
    items: &[ObjectId],
    side: &str,
    negated: bool,
) -> Option<String> {
    let texts: Vec<(Family, String)> =
        items.iter().filter_map(|id| addr_text(ctx, *id)).collect();
    if texts.is_empty() {
        return None;
    }
    // Dual-stack inet table: group per family, one clause per family used.
    let mut clauses = Vec::new();
    for (proto, family) in [("ip", Family::V4), ("ip6", Family::V6)] {
        let vals: Vec<&str> = texts
            .iter()
            .filter(|(f, _)| *f == family)
            .map(|(_, t)| t.as_str())
            .collect();
        if vals.is_empty() {
            continue;
        }
        let op = if negated { " != " } else { " " };
        let rhs = if vals.len() == 1 {
            vals[0].to_string()
        } else {
            format!("{{ {} }}", vals.join(", "))
        };
        clauses.push(format!("{} {}{}{}", proto, side, op, rhs));
    }
    Some(clauses.join(" "))
}

fn service_clause(ctx: &CompilerContext, rule: &PolicyRule) -> Option<String> {
    let items = &rule.data.srv.items;
    let &first = items.first()?;
    let negated = rule.aux.single_object_negation_srv;
    let op = if negated { " != " } else { " " };
    match proto_of(ctx, first) {
        ProtoGroup::Tcp | ProtoGroup::Udp => {
            let proto = if proto_of(ctx, first) == ProtoGroup::Tcp {
                "tcp"
            } else {
                "udp"
            };
            let mut ports = Vec::new();
            let mut sports = Vec::new();
            for &id in items {
                if let ObjectKind::TcpService { src, dst, .. }
                | ObjectKind::UdpService { src, dst } =
                    &normalize(&ctx.store.get(id).kind)
                {
                    if !dst.is_any() {
                        ports.push(dst.to_nft());
                    }
                    if !src.is_any() {
                        sports.push(src.to_nft());
                    }
                }
            }
            let mut clause = String::new();
            if !sports.is_empty() {
                clause.push_str(&format!("{} sport{}{}", proto, op, set_or_single(&sports)));
            }
            if !ports.is_empty() {
                if !clause.is_empty() {
                    clause.push(' ');
                }
                clause.push_str(&format!("{} dport{}{}", proto, op, set_or_single(&ports)));
            }
            if clause.is_empty() {
                clause = format!("meta l4proto {}", proto);
            }
            Some(clause)
        }
        ProtoGroup::Icmp => {
            if let ObjectKind::IcmpService { icmp_type, .. } = &ctx.store.get(first).kind {
                if *icmp_type >= 0 {
                    return Some(format!("icmp type{}{}", op, icmp_type));
                }
            }
            Some("meta l4proto icmp".into())
        }
        ProtoGroup::Icmp6 => {
            if let ObjectKind::Icmp6Service { icmp_type, .. } = &ctx.store.get(first).kind {
                if *icmp_type >= 0 {
                    return Some(format!("icmpv6 type{}{}", op, icmp_type));
                }
            }
            Some("meta l4proto ipv6-icmp".into())
        }
        ProtoGroup::Ip(p) => Some(format!("meta l4proto{}{}", op, p)),
        _ => None,
    }
}

fn normalize(kind: &ObjectKind) -> ObjectKind {
    match kind {
        ObjectKind::UdpService { src, dst } => ObjectKind::UdpService {
            src: *src,
            dst: *dst,
        },
        other => other.clone(),
    }
}

fn set_or_single(vals: &[String]) -> String {
    if vals.len() == 1 {
        vals[0].clone()
    } else {
        format!("{{ {} }}", vals.join(", "))
    }
}

fn iface_clause(ctx: &CompilerContext, rule: &PolicyRule) -> Option<String> {
    if rule.aux.iface_none || rule.aux.iface_wildcard {
        return None;
    }
    let &id = rule.data.itf.items.first()?;
    let name = &ctx.store.get(id).name;
    let key = match rule.data.direction {
        Direction::Outbound => "oifname",
        _ => "iifname",
    };
    let op = if rule.aux.single_object_negation_itf {
        " != "
    } else {
        " "
    };
    Some(format!("{}{}\"{}\"", key, op, name))
}

/// One nft rule line (without indentation).
pub(crate) fn rule_text(ctx: &CompilerContext, rule: &PolicyRule) -> String {
    let mut parts: Vec<String> = Vec::new();
    if let Some(c) = iface_clause(ctx, rule) {
        parts.push(c);
    }
    if let Some(c) = addr_clause(
        ctx,
        &rule.data.src.items,
        "saddr",
        rule.aux.single_object_negation_src,
    ) {
        parts.push(c);
    }
    if let Some(c) = addr_clause(
        ctx,
        &rule.data.dst.items,
        "daddr",
        rule.aux.single_object_negation_dst,
    ) {
        parts.push(c);
    }
    if let Some(c) = service_clause(ctx, rule) {
        parts.push(c);
    }
    let target = rule.target();
    if !rule.data.options.stateless && target == "accept" {
        parts.push("ct state new".into());
    }
    if rule.data.options.log || target == "LOG" {
        let prefix = rule
            .data
            .options
            .log_prefix
            .clone()
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| format!("RULE {} ", rule.data.position));
        parts.push(format!("log prefix \"{}\"", prefix));
    }
    match target {
        "" | "LOG" | "continue" => {}
        verdict => parts.push(verdict.to_string()),
    }
    parts.join(" ")
}

const BUILTIN: [(&str, &str); 3] = [
    ("input", "type filter hook input priority filter; policy drop;"),
    ("forward", "type filter hook forward priority filter; policy drop;"),
    ("output", "type filter hook output priority filter; policy accept;"),
];

/// Render the full `table inet filter { ... }` block.
pub fn emit_ruleset(ctx: &CompilerContext, rules: &[PolicyRule]) -> String {
    // Chain order: the built-ins first, then user chains by first use.
    let mut chain_rules: Vec<(String, Vec<String>)> = BUILTIN
        .iter()
        .map(|(name, _)| (name.to_string(), Vec::new()))
        .collect();
    for rule in rules {
        let chain = rule.chain().to_string();
        if chain.is_empty() {
            continue;
        }
        let is_builtin = BUILTIN.iter().any(|(n, _)| *n == chain);
        if !is_builtin && ctx.chains.usage_of(&chain) == 0 {
            continue;
        }
        let text = rule_text(ctx, rule);
        match chain_rules.iter_mut().find(|(n, _)| *n == chain) {
            Some((_, lines)) => lines.push(text),
            None => chain_rules.push((chain, vec![text])),
        }
        for note in ctx.diag.notes_for(&rule.data.label) {
            let tag = match note.severity {
                crate::diag::Severity::Warning => "warning",
                crate::diag::Severity::Error => "error",
            };
            if let Some((_, lines)) = chain_rules.iter_mut().find(|(n, _)| *n == rule.chain()) {
                let idx = lines.len() - 1;
                lines.insert(idx, format!("# {}: {}", tag, note.message));
            }
        }
    }

    let mut out = String::from("flush ruleset\n\ntable inet filter {\n");
    for (name, lines) in &chain_rules {
        out.push_str(&format!("    chain {} {{\n", name));
        if let Some((_, binding)) = BUILTIN.iter().find(|(n, _)| n == name) {
            out.push_str(&format!("        {}\n", binding));
        }
        for line in lines {
            out.push_str(&format!("        {}\n", line));
        }
        out.push_str("    }\n");
    }
    out.push_str("}\n");
    out
}

// ----------------------------------------------------------------------
// NAT table
// ----------------------------------------------------------------------

fn nat_rule_text(ctx: &CompilerContext, rule: &crate::rule::NatRule) -> String {
    use crate::rule::NatKind;
    let mut parts: Vec<String> = Vec::new();
    if let Some(&id) = rule.data.itf_in.items.first() {
        parts.push(format!("iifname \"{}\"", ctx.store.get(id).name));
    }
    if let Some(&id) = rule.data.itf_out.items.first() {
        parts.push(format!("oifname \"{}\"", ctx.store.get(id).name));
    }
    if let Some(c) = addr_clause(ctx, &rule.data.osrc.items, "saddr", false) {
        parts.push(c);
    }
    if let Some(c) = addr_clause(ctx, &rule.data.odst.items, "daddr", false) {
        parts.push(c);
    }
    if let Some(&id) = rule.data.osrv.items.first() {
        match &ctx.store.get(id).kind {
            ObjectKind::TcpService { dst, .. } if !dst.is_any() => {
                parts.push(format!("tcp dport {}", dst.to_nft()));
            }
            ObjectKind::UdpService { dst, .. } if !dst.is_any() => {
                parts.push(format!("udp dport {}", dst.to_nft()));
            }
            _ => {}
        }
    }
    let first_addr = |items: &[ObjectId]| {
        items
            .first()
            .and_then(|id| {
                let addrs = ctx.store.addresses_of(*id, None);
                addrs.first().map(|a| a.to_string()).or_else(|| {
                    match &ctx.store.get(*id).kind {
                        ObjectKind::Network(n) => Some(n.to_string()),
                        ObjectKind::NetworkV6(n) => Some(n.to_string()),
                        _ => None,
                    }
                })
            })
            .unwrap_or_default()
    };
    match rule.aux.kind {
        Some(NatKind::Masquerade) => parts.push("masquerade".into()),
        Some(NatKind::Snat) | Some(NatKind::SNetNat) => {
            parts.push(format!("snat to {}", first_addr(&rule.data.tsrc.items)));
        }
        Some(NatKind::Dnat) | Some(NatKind::DNetNat) => {
            parts.push(format!("dnat to {}", first_addr(&rule.data.tdst.items)));
        }
        Some(NatKind::Redirect) => parts.push("redirect".into()),
        _ => parts.push("accept".into()),
    }
    parts.join(" ")
}

/// Render `table ip nat { ... }` from the classified NAT rule stream.
pub fn emit_nat_ruleset(ctx: &CompilerContext, rules: &[crate::rule::NatRule]) -> String {
    if rules.is_empty() {
        return String::new();
    }
    let mut pre: Vec<String> = Vec::new();
    let mut post: Vec<String> = Vec::new();
    for rule in rules {
        let text = nat_rule_text(ctx, rule);
        match rule.chain() {
            "PREROUTING" | "OUTPUT" => pre.push(text),
            _ => post.push(text),
        }
    }
    let mut out = String::from("table ip nat {\n");
    out.push_str("    chain prerouting {\n        type nat hook prerouting priority dstnat;\n");
    for line in &pre {
        out.push_str(&format!("        {}\n", line));
    }
    out.push_str("    }\n");
    out.push_str("    chain postrouting {\n        type nat hook postrouting priority srcnat;\n");
    for line in &post {
        out.push_str(&format!("        {}\n", line));
    }
    out.push_str("    }\n}\n");
    out
}
