//! In-flight rule representations.
//!
//! A pipeline works on deep copies of the source rows: the row data from the
//! model plus a typed auxiliary record the stages fill in as they make
//! decisions (chain, target, negation strategy, multiport, snapshots of the
//! original action). Three sibling rule types share the [`CompilerRule`]
//! trait so that element-generic stages (group expansion, dedup, family
//! filtering) are written once.

use crate::context::CompilerContext;
use fwforge_model::rules::{NatRuleData, PolicyRuleData, RoutingRuleData, RuleElement};
use fwforge_model::Action;

/// Positional slot identifiers across all rule kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementSlot {
    Src,
    Dst,
    Srv,
    Itf,
    Time,
    OrigSrc,
    OrigDst,
    OrigSrv,
    TransSrc,
    TransDst,
    TransSrv,
    ItfIn,
    ItfOut,
    RouteDst,
    Gateway,
    RouteItf,
}

impl ElementSlot {
    pub fn label(&self) -> &'static str {
        match self {
            ElementSlot::Src => "Source",
            ElementSlot::Dst => "Destination",
            ElementSlot::Srv => "Service",
            ElementSlot::Itf => "Interface",
            ElementSlot::Time => "Time",
            ElementSlot::OrigSrc => "Original Source",
            ElementSlot::OrigDst => "Original Destination",
            ElementSlot::OrigSrv => "Original Service",
            ElementSlot::TransSrc => "Translated Source",
            ElementSlot::TransDst => "Translated Destination",
            ElementSlot::TransSrv => "Translated Service",
            ElementSlot::ItfIn => "Inbound Interface",
            ElementSlot::ItfOut => "Outbound Interface",
            ElementSlot::RouteDst => "Destination",
            ElementSlot::Gateway => "Gateway",
            ElementSlot::RouteItf => "Interface",
        }
    }
}

/// Access shared by the element-generic stages.
pub trait CompilerRule: Clone + std::fmt::Debug {
    /// Slots this rule kind carries, in canonical order.
    fn slots() -> &'static [ElementSlot];
    fn element(&self, slot: ElementSlot) -> &RuleElement;
    fn element_mut(&mut self, slot: ElementSlot) -> &mut RuleElement;
    fn label(&self) -> &str;
    fn position(&self) -> usize;
    /// Canonical one-line view for the debug harness.
    fn dump(&self, ctx: &CompilerContext) -> String;
}

fn dump_element(ctx: &CompilerContext, el: &RuleElement) -> String {
    if el.is_any() {
        return "any".to_string();
    }
    let names: Vec<String> = el
        .items
        .iter()
        .map(|id| ctx.store.get(*id).name.clone())
        .collect();
    let body = names.join(",");
    if el.negated {
        format!("!{}", body)
    } else {
        body
    }
}

// ----------------------------------------------------------------------
// Policy rules
// ----------------------------------------------------------------------

/// Stage-filled metadata on a policy rule.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PolicyAux {
    pub chain: Option<String>,
    pub target: Option<String>,
    /// Action as it stood before the logging/negation stages rewrote it.
    pub stored_action: Option<Action>,
    pub originated_with_tagging: bool,
    pub originated_with_classification: bool,
    pub originated_with_routing: bool,
    pub single_object_negation_src: bool,
    pub single_object_negation_dst: bool,
    pub single_object_negation_srv: bool,
    pub single_object_negation_itf: bool,
    pub multiport: bool,
    pub action_on_reject: Option<String>,
    /// Set on rules produced by negation expansion; blocks firewall-object
    /// stripping which would change the match.
    pub upstream_rule_neg: bool,
    /// Direction resolved to "no interface match at all" (`.iface = nil`).
    pub iface_none: bool,
    /// Wildcard interface sentinel: emit `-i +` / `-o +`.
    pub iface_wildcard: bool,
    /// Rule lives in a user chain already filtered by its jump rule.
    pub in_temp_chain: bool,
    /// Rule is pinned to the loopback interface.
    pub on_loopback: bool,
    /// NAT-virtual addresses present; keep firewall references intact.
    pub nat_virtual: bool,
    /// Emit CONNMARK --save-mark instead of MARK.
    pub connmark_save: bool,
    /// The jump into this rule's chain already matched the service.
    pub srv_matched_upstream: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PolicyRule {
    pub data: PolicyRuleData,
    pub aux: PolicyAux,
}

impl PolicyRule {
    pub fn from_data(data: PolicyRuleData) -> Self {
        Self {
            data,
            aux: PolicyAux::default(),
        }
    }

    pub fn chain(&self) -> &str {
        self.aux.chain.as_deref().unwrap_or("")
    }

    pub fn target(&self) -> &str {
        self.aux.target.as_deref().unwrap_or("")
    }
}

static POLICY_SLOTS: [ElementSlot; 5] = [
    ElementSlot::Src,
    ElementSlot::Dst,
    ElementSlot::Srv,
    ElementSlot::Itf,
    ElementSlot::Time,
];

impl CompilerRule for PolicyRule {
    fn slots() -> &'static [ElementSlot] {
        &POLICY_SLOTS
    }

    fn element(&self, slot: ElementSlot) -> &RuleElement {
        match slot {
            ElementSlot::Src => &self.data.src,
            ElementSlot::Dst => &self.data.dst,
            ElementSlot::Srv => &self.data.srv,
            ElementSlot::Itf => &self.data.itf,
            ElementSlot::Time => &self.data.time,
            other => panic!("policy rule has no {:?} element", other),
        }
    }

    fn element_mut(&mut self, slot: ElementSlot) -> &mut RuleElement {
        match slot {
            ElementSlot::Src => &mut self.data.src,
            ElementSlot::Dst => &mut self.data.dst,
            ElementSlot::Srv => &mut self.data.srv,
            ElementSlot::Itf => &mut self.data.itf,
            ElementSlot::Time => &mut self.data.time,
            other => panic!("policy rule has no {:?} element", other),
        }
    }

    fn label(&self) -> &str {
        &self.data.label
    }

    fn position(&self) -> usize {
        self.data.position
    }

    fn dump(&self, ctx: &CompilerContext) -> String {
        let mut flags = String::new();
        if self.aux.single_object_negation_src {
            flags.push_str(" !src");
        }
        if self.aux.single_object_negation_dst {
            flags.push_str(" !dst");
        }
        if self.aux.single_object_negation_srv {
            flags.push_str(" !srv");
        }
        if self.aux.single_object_negation_itf {
            flags.push_str(" !itf");
        }
        if self.aux.multiport {
            flags.push_str(" multiport");
        }
        if self.aux.in_temp_chain {
            flags.push_str(" leaf");
        }
        format!(
            "{} src={} dst={} srv={} itf={} dir={} action={} chain={} target={}{}",
            self.data.label,
            dump_element(ctx, &self.data.src),
            dump_element(ctx, &self.data.dst),
            dump_element(ctx, &self.data.srv),
            dump_element(ctx, &self.data.itf),
            self.data.direction.code(),
            self.data.action.as_str(),
            self.chain(),
            self.target(),
            flags
        )
    }
}

// ----------------------------------------------------------------------
// NAT rules
// ----------------------------------------------------------------------

/// NAT variant, assigned by the classification stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatKind {
    Snat,
    SNetNat,
    Dnat,
    DNetNat,
    Redirect,
    NoNat,
    SdNat,
    NatBranch,
    Masquerade,
    Return,
}

impl NatKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NatKind::Snat => "SNAT",
            NatKind::SNetNat => "SNetnat",
            NatKind::Dnat => "DNAT",
            NatKind::DNetNat => "DNetnat",
            NatKind::Redirect => "Redirect",
            NatKind::NoNat => "NONAT",
            NatKind::SdNat => "SDNAT",
            NatKind::NatBranch => "NATBranch",
            NatKind::Masquerade => "Masq",
            NatKind::Return => "Return",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NatAux {
    pub chain: Option<String>,
    pub target: Option<String>,
    pub kind: Option<NatKind>,
    pub single_object_negation_itf_in: bool,
    pub single_object_negation_itf_out: bool,
    pub multiport: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NatRule {
    pub data: NatRuleData,
    pub aux: NatAux,
}

impl NatRule {
    pub fn from_data(data: NatRuleData) -> Self {
        Self {
            data,
            aux: NatAux::default(),
        }
    }

    pub fn chain(&self) -> &str {
        self.aux.chain.as_deref().unwrap_or("")
    }

    pub fn target(&self) -> &str {
        self.aux.target.as_deref().unwrap_or("")
    }
}

static NAT_SLOTS: [ElementSlot; 8] = [
    ElementSlot::OrigSrc,
    ElementSlot::OrigDst,
    ElementSlot::OrigSrv,
    ElementSlot::TransSrc,
    ElementSlot::TransDst,
    ElementSlot::TransSrv,
    ElementSlot::ItfIn,
    ElementSlot::ItfOut,
];

impl CompilerRule for NatRule {
    fn slots() -> &'static [ElementSlot] {
        &NAT_SLOTS
    }

    fn element(&self, slot: ElementSlot) -> &RuleElement {
        match slot {
            ElementSlot::OrigSrc => &self.data.osrc,
            ElementSlot::OrigDst => &self.data.odst,
            ElementSlot::OrigSrv => &self.data.osrv,
            ElementSlot::TransSrc => &self.data.tsrc,
            ElementSlot::TransDst => &self.data.tdst,
            ElementSlot::TransSrv => &self.data.tsrv,
            ElementSlot::ItfIn => &self.data.itf_in,
            ElementSlot::ItfOut => &self.data.itf_out,
            other => panic!("NAT rule has no {:?} element", other),
        }
    }

    fn element_mut(&mut self, slot: ElementSlot) -> &mut RuleElement {
        match slot {
            ElementSlot::OrigSrc => &mut self.data.osrc,
            ElementSlot::OrigDst => &mut self.data.odst,
            ElementSlot::OrigSrv => &mut self.data.osrv,
            ElementSlot::TransSrc => &mut self.data.tsrc,
            ElementSlot::TransDst => &mut self.data.tdst,
            ElementSlot::TransSrv => &mut self.data.tsrv,
            ElementSlot::ItfIn => &mut self.data.itf_in,
            ElementSlot::ItfOut => &mut self.data.itf_out,
            other => panic!("NAT rule has no {:?} element", other),
        }
    }

    fn label(&self) -> &str {
        &self.data.label
    }

    fn position(&self) -> usize {
        self.data.position
    }

    fn dump(&self, ctx: &CompilerContext) -> String {
        format!(
            "{} osrc={} odst={} osrv={} tsrc={} tdst={} tsrv={} kind={} chain={} target={}",
            self.data.label,
            dump_element(ctx, &self.data.osrc),
            dump_element(ctx, &self.data.odst),
            dump_element(ctx, &self.data.osrv),
            dump_element(ctx, &self.data.tsrc),
            dump_element(ctx, &self.data.tdst),
            dump_element(ctx, &self.data.tsrv),
            self.aux.kind.map(|k| k.as_str()).unwrap_or("-"),
            self.chain(),
            self.target(),
        )
    }
}

// ----------------------------------------------------------------------
// Routing rules
// ----------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoutingAux {
    /// Set when the destination is empty and the rule becomes the default
    /// route.
    pub default_route: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoutingRule {
    pub data: RoutingRuleData,
    pub aux: RoutingAux,
}

impl RoutingRule {
    pub fn from_data(data: RoutingRuleData) -> Self {
        Self {
            data,
            aux: RoutingAux::default(),
        }
    }
}

static ROUTING_SLOTS: [ElementSlot; 3] = [
    ElementSlot::RouteDst,
    ElementSlot::Gateway,
    ElementSlot::RouteItf,
];

impl CompilerRule for RoutingRule {
    fn slots() -> &'static [ElementSlot] {
        &ROUTING_SLOTS
    }

    fn element(&self, slot: ElementSlot) -> &RuleElement {
        match slot {
            ElementSlot::RouteDst => &self.data.dst,
            ElementSlot::Gateway => &self.data.gateway,
            ElementSlot::RouteItf => &self.data.itf,
            other => panic!("routing rule has no {:?} element", other),
        }
    }

    fn element_mut(&mut self, slot: ElementSlot) -> &mut RuleElement {
        match slot {
            ElementSlot::RouteDst => &mut self.data.dst,
            ElementSlot::Gateway => &mut self.data.gateway,
            ElementSlot::RouteItf => &mut self.data.itf,
            other => panic!("routing rule has no {:?} element", other),
        }
    }

    fn label(&self) -> &str {
        &self.data.label
    }

    fn position(&self) -> usize {
        self.data.position
    }

    fn dump(&self, ctx: &CompilerContext) -> String {
        format!(
            "{} dst={} gw={} itf={} metric={}",
            self.data.label,
            dump_element(ctx, &self.data.dst),
            dump_element(ctx, &self.data.gateway),
            dump_element(ctx, &self.data.itf),
            self.data.metric,
        )
    }
}
